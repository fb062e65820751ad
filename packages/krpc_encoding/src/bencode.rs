//! A small standalone generic bencode `Value`, independent of the typed
//! KRPC message structs. `Message::decode`/`encode` are layered on top of
//! `serde_bencode` for the typed path, but use this module to detect
//! trailing bytes after the top-level value (bencode is self-delimiting,
//! so the length consumed by decoding the first value tells us exactly
//! how many bytes are left over).

use std::collections::BTreeMap;

use crate::errors::CodecError;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Value {
    Bytes(Vec<u8>),
    Int(i64),
    List(Vec<Value>),
    Dict(BTreeMap<Vec<u8>, Value>),
}

/// Decodes the single top-level value in `input`, rejecting any trailing
/// bytes left over afterwards.
pub fn decode(input: &[u8]) -> Result<Value, CodecError> {
    let (value, consumed) = decode_prefix(input)?;
    if consumed != input.len() {
        return Err(CodecError::TrailingBytes(input.len() - consumed));
    }
    Ok(value)
}

/// Decodes the value prefixing `input`, returning it along with the
/// number of bytes consumed. Unlike [`decode`], trailing bytes are
/// tolerated; this is what the codec uses internally to measure how much
/// of a datagram the top-level value actually occupied.
pub fn decode_prefix(input: &[u8]) -> Result<(Value, usize), CodecError> {
    match input.first() {
        None => Err(CodecError::InvalidBencode(bad_eof())),
        Some(b'i') => decode_int(input),
        Some(b'l') => decode_list(input),
        Some(b'd') => decode_dict(input),
        Some(b'0'..=b'9') => decode_bytes(input),
        Some(_) => Err(CodecError::InvalidBencode(bad_eof())),
    }
}

fn bad_eof() -> serde_bencode::Error {
    serde_bencode::Error::Eof
}

fn decode_int(input: &[u8]) -> Result<(Value, usize), CodecError> {
    let end = find(input, b'e', 1)?;
    let digits =
        std::str::from_utf8(&input[1..end]).map_err(|_| CodecError::InvalidBencode(bad_eof()))?;
    let value = digits
        .parse::<i64>()
        .map_err(|_| CodecError::InvalidBencode(bad_eof()))?;
    Ok((Value::Int(value), end + 1))
}

fn decode_bytes(input: &[u8]) -> Result<(Value, usize), CodecError> {
    let colon = find(input, b':', 0)?;
    let len_str =
        std::str::from_utf8(&input[..colon]).map_err(|_| CodecError::InvalidBencode(bad_eof()))?;
    let len = len_str
        .parse::<usize>()
        .map_err(|_| CodecError::InvalidBencode(bad_eof()))?;
    let start = colon + 1;
    let end = start
        .checked_add(len)
        .filter(|&end| end <= input.len())
        .ok_or_else(|| CodecError::InvalidBencode(bad_eof()))?;
    Ok((Value::Bytes(input[start..end].to_vec()), end))
}

fn decode_list(input: &[u8]) -> Result<(Value, usize), CodecError> {
    let mut pos = 1;
    let mut items = Vec::new();
    loop {
        if input.get(pos) == Some(&b'e') {
            return Ok((Value::List(items), pos + 1));
        }
        let (value, consumed) = decode_prefix(&input[pos..])?;
        items.push(value);
        pos += consumed;
        if pos >= input.len() {
            return Err(CodecError::InvalidBencode(bad_eof()));
        }
    }
}

fn decode_dict(input: &[u8]) -> Result<(Value, usize), CodecError> {
    let mut pos = 1;
    let mut entries = BTreeMap::new();
    loop {
        if input.get(pos) == Some(&b'e') {
            return Ok((Value::Dict(entries), pos + 1));
        }
        let (key, key_len) = decode_bytes(&input[pos..])?;
        let key_bytes = match key {
            Value::Bytes(b) => b,
            _ => unreachable!("decode_bytes always returns Value::Bytes"),
        };
        pos += key_len;
        let (value, value_len) = decode_prefix(&input[pos..])?;
        entries.insert(key_bytes, value);
        pos += value_len;
        if pos >= input.len() {
            return Err(CodecError::InvalidBencode(bad_eof()));
        }
    }
}

fn find(input: &[u8], needle: u8, start: usize) -> Result<usize, CodecError> {
    input[start.min(input.len())..]
        .iter()
        .position(|&b| b == needle)
        .map(|idx| idx + start)
        .ok_or_else(|| CodecError::InvalidBencode(bad_eof()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_list_of_strings_and_ints() {
        let value = decode(b"l4:spam4:eggsi3ee").unwrap();
        assert_eq!(
            value,
            Value::List(vec![
                Value::Bytes(b"spam".to_vec()),
                Value::Bytes(b"eggs".to_vec()),
                Value::Int(3),
            ])
        );
    }

    #[test]
    fn unterminated_dict_is_invalid() {
        assert!(matches!(decode(b"d"), Err(CodecError::InvalidBencode(_))));
    }

    #[test]
    fn trailing_bytes_are_reported() {
        let err = decode(b"i1eextra").unwrap_err();
        assert!(matches!(err, CodecError::TrailingBytes(5)));
    }
}
