//! Serde helpers that carry payload bytes as base64 strings in JSON.

use bytes::Bytes;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serializer};

/// `#[serde(with = "crate::encoding::base64_bytes")]` for a [`Bytes`] field.
pub mod base64_bytes {
    use super::*;

    pub fn serialize<S: Serializer>(data: &Bytes, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(data))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Bytes, D::Error> {
        let text = String::deserialize(deserializer)?;
        STANDARD.decode(text).map(Bytes::from).map_err(D::Error::custom)
    }
}

/// Same as [`base64_bytes`] for a list of buffers.
pub mod base64_bytes_vec {
    use super::*;
    use serde::ser::SerializeSeq;

    pub fn serialize<S: Serializer>(items: &[Bytes], serializer: S) -> Result<S::Ok, S::Error> {
        let mut seq = serializer.serialize_seq(Some(items.len()))?;
        for item in items {
            seq.serialize_element(&STANDARD.encode(item))?;
        }
        seq.end()
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<Bytes>, D::Error> {
        Vec::<String>::deserialize(deserializer)?
            .into_iter()
            .map(|text| STANDARD.decode(text).map(Bytes::from).map_err(D::Error::custom))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use serde::{Deserialize, Serialize};

    use super::*;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Chunk {
        #[serde(with = "base64_bytes")]
        data: Bytes,
        #[serde(with = "base64_bytes_vec")]
        parts: Vec<Bytes>,
    }

    #[test]
    fn payloads_are_base64_strings() {
        let chunk = Chunk {
            data: Bytes::from_static(&[0, 1, 2, 253, 254, 255]),
            parts: vec![Bytes::from_static(b"ab"), Bytes::new()],
        };
        let json = serde_json::to_string(&chunk).unwrap();
        assert_eq!(json, r#"{"data":"AAEC/f7/","parts":["YWI=",""]}"#);
        assert_eq!(serde_json::from_str::<Chunk>(&json).unwrap(), chunk);
    }

    #[test]
    fn invalid_base64_is_rejected() {
        let err = serde_json::from_str::<Chunk>(r#"{"data":"***","parts":[]}"#).unwrap_err();
        assert!(err.is_data());
    }
}
