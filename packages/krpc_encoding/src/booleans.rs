//! Bencode has no boolean type; KRPC represents booleans as the integers
//! `0`/`1` (e.g. `implied_port`, `ro`). This module is used via
//! `#[serde(with = "booleans")]`.

use serde::{
    de,
    Deserialize,
    Deserializer,
    Serializer,
};

pub fn is_false(b: &bool) -> bool {
    !*b
}

pub fn serialize<S>(value: &bool, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    serializer.serialize_i64(if *value { 1 } else { 0 })
}

pub fn deserialize<'de, D>(deserializer: D) -> Result<bool, D::Error>
where
    D: Deserializer<'de>,
{
    let value = i64::deserialize(deserializer)?;
    match value {
        0 => Ok(false),
        1 => Ok(true),
        other => Err(de::Error::custom(format!(
            "expected 0 or 1 for a bencode boolean, got {other}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::{
        Deserialize,
        Serialize,
    };

    #[derive(Serialize, Deserialize, PartialEq, Debug)]
    struct Wrapper {
        #[serde(with = "crate::booleans")]
        flag: bool,
    }

    #[test]
    fn encodes_as_integer() {
        let bytes = serde_bencode::to_bytes(&Wrapper { flag: true }).unwrap();
        assert_eq!(bytes, b"d4:flagi1ee");
        let decoded: Wrapper = serde_bencode::from_bytes(&bytes).unwrap();
        assert_eq!(decoded, Wrapper { flag: true });
    }
}
