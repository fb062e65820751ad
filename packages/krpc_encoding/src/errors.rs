/// Failure modes for the wire codec (spec §4.1). Decoding never panics;
/// every failure is reported through this type.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("malformed bencode")]
    InvalidBencode(#[source] serde_bencode::Error),

    #[error("malformed KRPC message: {0}")]
    InvalidKRPC(String),

    #[error("unknown query method {0:?}")]
    UnknownMethod(String),

    #[error("{0} trailing byte(s) after top-level value")]
    TrailingBytes(usize),

    #[error("failed to encode message")]
    EncodeError(#[source] serde_bencode::Error),
}

pub type Result<T> = std::result::Result<T, CodecError>;
