//! Helpers for decoding loosely typed server payloads.
//!
//! The realtime server is not consistent about ids: deployment ids and
//! terminal ids arrive as JSON numbers from some handlers and as strings from
//! others. Everything is normalized here, at the boundary.

use serde::{Deserialize, Deserializer};

#[derive(Deserialize)]
#[serde(untagged)]
enum IdRepr {
    Number(i64),
    Text(String),
}

impl IdRepr {
    fn into_string(self) -> String {
        match self {
            Self::Number(n) => n.to_string(),
            Self::Text(s) => s,
        }
    }
}

/// Deserialize an id that may be a number or a string into a `String`.
pub fn id_string<'de, D: Deserializer<'de>>(deserializer: D) -> Result<String, D::Error> {
    IdRepr::deserialize(deserializer).map(IdRepr::into_string)
}

/// Optional variant of [`id_string`]; `null` and a missing field are `None`.
pub fn opt_id_string<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<String>, D::Error> {
    Ok(Option::<IdRepr>::deserialize(deserializer)?.map(IdRepr::into_string))
}

/// Read an unsigned integer id from a JSON value holding a number or a
/// numeric string.
pub fn numeric_id(value: &serde_json::Value) -> Option<u32> {
    match value {
        serde_json::Value::Number(n) => n.as_u64().and_then(|n| u32::try_from(n).ok()),
        serde_json::Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}
