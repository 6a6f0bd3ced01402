//! Wire frame shared by both transports.
//!
//! WebSocket text frames carry one JSON frame; the long-polling transport
//! exchanges JSON arrays of frames.

use serde::{Deserialize, Serialize};

/// One realtime event on the wire: `{"event": name, "data": payload}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Frame {
    /// Event name, e.g. `terminal:output`.
    pub event: String,
    /// Event payload; `null` when the server sent none.
    #[serde(default)]
    pub data: serde_json::Value,
}

impl Frame {
    /// Create a frame.
    pub fn new(event: impl Into<String>, data: serde_json::Value) -> Self {
        Self {
            event: event.into(),
            data,
        }
    }

    /// Serialize to a JSON text frame.
    pub fn encode(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    /// Parse a JSON text frame.
    pub fn decode(text: &str) -> serde_json::Result<Self> {
        serde_json::from_str(text)
    }

    /// Parse a polling response body (array of frames).
    pub fn decode_batch(text: &str) -> serde_json::Result<Vec<Self>> {
        if text.trim().is_empty() {
            return Ok(Vec::new());
        }
        serde_json::from_str(text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_missing_data_decodes_as_null() {
        let frame = Frame::decode(r#"{"event":"terminal:exit"}"#).unwrap();
        assert_eq!(frame.event, "terminal:exit");
        assert!(frame.data.is_null());
    }

    #[test]
    fn test_encode_shape() {
        let frame = Frame::new("terminal:data", json!({ "termId": 1, "data": "ls\r" }));
        let value: serde_json::Value = serde_json::from_str(&frame.encode().unwrap()).unwrap();
        assert_eq!(value["event"], "terminal:data");
        assert_eq!(value["data"]["termId"], 1);
    }

    #[test]
    fn test_decode_batch() {
        let frames = Frame::decode_batch(
            r#"[{"event":"a","data":1},{"event":"b","data":"legacy text"}]"#,
        )
        .unwrap();
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[1].data, json!("legacy text"));
        assert!(Frame::decode_batch("  ").unwrap().is_empty());
        assert!(Frame::decode_batch("{").is_err());
    }
}
