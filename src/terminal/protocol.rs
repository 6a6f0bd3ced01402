//! Terminal event names and payloads.
//!
//! Inbound payloads come in two generations: tagged objects carrying a
//! `termId`, and the legacy single-session shapes (a bare output string, an
//! exit with no payload). Both are decoded here into [`Inbound`], so the
//! multiplexer only ever sees one shape.

use serde::Serialize;
use serde_json::Value;

use crate::wire::numeric_id;

/// Caller-assigned session identifier, unique within one multiplexer.
pub type SessionId = u32;

/// `terminal:start` (client → server).
pub const START: &str = "terminal:start";
/// `terminal:ready` (server → client).
pub const READY: &str = "terminal:ready";
/// `terminal:data` (client → server).
pub const DATA: &str = "terminal:data";
/// `terminal:output` (server → client).
pub const OUTPUT: &str = "terminal:output";
/// `terminal:resize` (client → server).
pub const RESIZE: &str = "terminal:resize";
/// `terminal:exit` (server → client).
pub const EXIT: &str = "terminal:exit";
/// `terminal:close` (client → server).
pub const CLOSE: &str = "terminal:close";

/// Every server → client terminal event.
pub const INBOUND_EVENTS: [&str; 3] = [READY, OUTPUT, EXIT];

/// Decoded server → client terminal event.
///
/// `term_id` is `None` for legacy untagged payloads.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    /// The remote shell is up.
    Ready {
        /// Session tag.
        term_id: Option<SessionId>,
    },
    /// Output bytes for a session.
    Output {
        /// Session tag.
        term_id: Option<SessionId>,
        /// Raw output.
        data: String,
    },
    /// The remote process exited.
    Exit {
        /// Session tag.
        term_id: Option<SessionId>,
    },
}

impl Inbound {
    /// Decode an inbound event; `None` for unknown events or malformed
    /// payloads.
    pub fn decode(event: &str, payload: &Value) -> Option<Self> {
        match event {
            READY => Some(Self::Ready {
                term_id: tag(payload)?,
            }),
            OUTPUT => match payload {
                Value::String(data) => Some(Self::Output {
                    term_id: None,
                    data: data.clone(),
                }),
                Value::Object(map) => {
                    let data = map.get("data")?.as_str()?.to_string();
                    Some(Self::Output {
                        term_id: tag(payload)?,
                        data,
                    })
                }
                _ => None,
            },
            EXIT => Some(Self::Exit {
                term_id: tag(payload)?,
            }),
            _ => None,
        }
    }

    /// Session tag, if any.
    pub fn term_id(&self) -> Option<SessionId> {
        match self {
            Self::Ready { term_id } | Self::Output { term_id, .. } | Self::Exit { term_id } => {
                *term_id
            }
        }
    }
}

/// `Some(None)` when the payload carries no `termId` (legacy), `None` when it
/// carries one that is not a session id.
fn tag(payload: &Value) -> Option<Option<SessionId>> {
    match payload.get("termId") {
        None => Some(None),
        Some(raw) => numeric_id(raw).map(Some),
    }
}

/// `terminal:start` payload.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StartPayload<'a> {
    /// Target server.
    pub server_id: &'a str,
    /// Session tag.
    pub term_id: SessionId,
    /// Rows.
    pub rows: u16,
    /// Columns.
    pub cols: u16,
}

/// `terminal:data` payload.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DataPayload<'a> {
    /// Session tag.
    pub term_id: SessionId,
    /// Keystrokes.
    pub data: &'a str,
}

/// `terminal:resize` payload.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResizePayload {
    /// Session tag.
    pub term_id: SessionId,
    /// Rows.
    pub rows: u16,
    /// Columns.
    pub cols: u16,
}

/// `terminal:close` payload.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClosePayload {
    /// Session tag.
    pub term_id: SessionId,
}

/// Serialize an outbound payload. These structs cannot fail to serialize.
pub(crate) fn to_value<T: Serialize>(payload: &T) -> Value {
    serde_json::to_value(payload).unwrap_or(Value::Null)
}

/// Shell command that changes into `dir`, single-quoted for POSIX shells.
pub fn cd_command(dir: &str) -> String {
    format!("cd '{}'\r", dir.replace('\'', r"'\''"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_decode_tagged_output() {
        let event = Inbound::decode(OUTPUT, &json!({ "termId": 2, "data": "ok" })).unwrap();
        assert_eq!(
            event,
            Inbound::Output {
                term_id: Some(2),
                data: "ok".into()
            }
        );
    }

    #[test]
    fn test_decode_legacy_shapes() {
        assert_eq!(
            Inbound::decode(OUTPUT, &json!("plain")).unwrap(),
            Inbound::Output {
                term_id: None,
                data: "plain".into()
            }
        );
        assert_eq!(
            Inbound::decode(EXIT, &Value::Null).unwrap(),
            Inbound::Exit { term_id: None }
        );
        assert_eq!(
            Inbound::decode(READY, &json!({ "termId": "4" })).unwrap().term_id(),
            Some(4)
        );
    }

    #[test]
    fn test_decode_rejects_unparseable_tags() {
        let foreign = json!({ "termId": "other-view-7", "data": "x" });
        assert!(Inbound::decode(OUTPUT, &foreign).is_none());
        assert!(Inbound::decode(EXIT, &json!({ "termId": null })).is_none());
        assert!(Inbound::decode(READY, &json!({ "termId": 5_000_000_000_u64 })).is_none());
        assert_eq!(
            Inbound::decode(EXIT, &json!({})).unwrap(),
            Inbound::Exit { term_id: None }
        );
    }

    #[test]
    fn test_decode_rejects_malformed() {
        assert!(Inbound::decode(OUTPUT, &json!({ "termId": 1 })).is_none());
        assert!(Inbound::decode(OUTPUT, &json!(5)).is_none());
        assert!(Inbound::decode("terminal:unknown", &json!({})).is_none());
    }

    #[test]
    fn test_outbound_payloads_are_camel_case() {
        let start = to_value(&StartPayload {
            server_id: "srv-1",
            term_id: 3,
            rows: 24,
            cols: 80,
        });
        assert_eq!(start, json!({ "serverId": "srv-1", "termId": 3, "rows": 24, "cols": 80 }));
        assert_eq!(to_value(&ClosePayload { term_id: 3 }), json!({ "termId": 3 }));
    }

    #[test]
    fn test_cd_command_quotes() {
        assert_eq!(cd_command("/srv/app"), "cd '/srv/app'\r");
        assert_eq!(cd_command("/it's"), "cd '/it'\\''s'\r");
    }
}
