//! # Wire Protocol Module
//!
//! JSON frames exchanged between browser clients and the server. Every frame
//! has the shape `{ "type": <0..4>, "id": <session id>, "args"?: {..} }`
//! where `type` selects the payload:
//!
//! | type | name   | args                               |
//! |------|--------|------------------------------------|
//! | 0    | HELLO  | `{token, cols, rows, seq}`         |
//! | 1    | PING   | none                               |
//! | 2    | DATA   | `{data}` in, `{data, seq}` out     |
//! | 3    | RESIZE | `{cols, rows}`                     |
//! | 4    | ERROR  | `{reason}`                         |
//!
//! A HELLO with `seq: -1` asks for everything the server still has buffered.
//! Args are decoded into a typed [`Payload`] so dispatch over the five frame
//! types is exhaustive at compile time.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

const KIND_HELLO: u8 = 0;
const KIND_PING: u8 = 1;
const KIND_DATA: u8 = 2;
const KIND_RESIZE: u8 = 3;
const KIND_ERROR: u8 = 4;

/// Errors produced while decoding or encoding a wire frame
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Frame or args were not valid JSON for the expected shape
    #[error("malformed frame: {0}")]
    Malformed(#[from] serde_json::Error),
    /// The numeric frame type is outside the known range
    #[error("unknown frame type {0}")]
    UnknownType(u8),
    /// A frame type that requires args arrived without them
    #[error("frame type {0} requires args")]
    MissingArgs(u8),
}

/// Raw JSON shape of every frame on the wire
#[derive(Serialize, Deserialize)]
struct RawFrame {
    #[serde(rename = "type")]
    kind: u8,
    id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    args: Option<Value>,
}

#[derive(Serialize, Deserialize)]
struct HelloArgs {
    token: String,
    cols: u16,
    rows: u16,
    seq: i64,
}

#[derive(Serialize, Deserialize)]
struct DataArgs {
    data: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    seq: Option<i64>,
}

#[derive(Serialize, Deserialize)]
struct ResizeArgs {
    cols: u16,
    rows: u16,
}

#[derive(Serialize, Deserialize)]
struct ErrorArgs {
    reason: String,
}

/// Reason carried by an ERROR frame
///
/// The set is extensible: reasons this build does not know about decode into
/// [`ErrorReason::Other`] instead of failing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ErrorReason {
    /// HELLO token did not match the server identity token
    Forbidden,
    /// Another client attached to the session; existing viewers are notified
    Hijacked,
    /// The shell subprocess could not be started
    SpawnFailed,
    /// Reason string from a newer peer
    Other(String),
}

impl ErrorReason {
    pub fn as_str(&self) -> &str {
        match self {
            ErrorReason::Forbidden => "Forbidden",
            ErrorReason::Hijacked => "Hijacked",
            ErrorReason::SpawnFailed => "SpawnFailed",
            ErrorReason::Other(reason) => reason,
        }
    }

    fn from_wire(reason: String) -> Self {
        match reason.as_str() {
            "Forbidden" => ErrorReason::Forbidden,
            "Hijacked" => ErrorReason::Hijacked,
            "SpawnFailed" => ErrorReason::SpawnFailed,
            _ => ErrorReason::Other(reason),
        }
    }
}

/// Typed payload of a frame, one variant per frame type
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    Hello {
        token: String,
        cols: u16,
        rows: u16,
        seq: i64,
    },
    Ping,
    Data {
        data: String,
        /// Sequence number of the last chunk included; absent on
        /// client-originated input
        seq: Option<i64>,
    },
    Resize {
        cols: u16,
        rows: u16,
    },
    Error {
        reason: ErrorReason,
    },
}

impl Payload {
    fn kind(&self) -> u8 {
        match self {
            Payload::Hello { .. } => KIND_HELLO,
            Payload::Ping => KIND_PING,
            Payload::Data { .. } => KIND_DATA,
            Payload::Resize { .. } => KIND_RESIZE,
            Payload::Error { .. } => KIND_ERROR,
        }
    }
}

/// One decoded wire frame: the session it addresses plus its payload
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub session: String,
    pub payload: Payload,
}

impl Frame {
    pub fn new(session: impl Into<String>, payload: Payload) -> Self {
        Self {
            session: session.into(),
            payload,
        }
    }

    /// Decode a frame from its JSON text representation
    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        let raw: RawFrame = serde_json::from_str(text)?;

        let payload = match raw.kind {
            KIND_HELLO => {
                let args: HelloArgs = required_args(raw.kind, raw.args)?;
                Payload::Hello {
                    token: args.token,
                    cols: args.cols,
                    rows: args.rows,
                    seq: args.seq,
                }
            }
            KIND_PING => Payload::Ping,
            KIND_DATA => {
                let args: DataArgs = required_args(raw.kind, raw.args)?;
                Payload::Data {
                    data: args.data,
                    seq: args.seq,
                }
            }
            KIND_RESIZE => {
                let args: ResizeArgs = required_args(raw.kind, raw.args)?;
                Payload::Resize {
                    cols: args.cols,
                    rows: args.rows,
                }
            }
            KIND_ERROR => {
                let args: ErrorArgs = required_args(raw.kind, raw.args)?;
                Payload::Error {
                    reason: ErrorReason::from_wire(args.reason),
                }
            }
            other => return Err(ProtocolError::UnknownType(other)),
        };

        Ok(Frame {
            session: raw.id,
            payload,
        })
    }

    /// Encode the frame as JSON text ready to send
    pub fn encode(&self) -> Result<String, ProtocolError> {
        let args = match &self.payload {
            Payload::Hello {
                token,
                cols,
                rows,
                seq,
            } => Some(serde_json::to_value(HelloArgs {
                token: token.clone(),
                cols: *cols,
                rows: *rows,
                seq: *seq,
            })?),
            Payload::Ping => None,
            Payload::Data { data, seq } => Some(serde_json::to_value(DataArgs {
                data: data.clone(),
                seq: *seq,
            })?),
            Payload::Resize { cols, rows } => {
                Some(serde_json::to_value(ResizeArgs {
                    cols: *cols,
                    rows: *rows,
                })?)
            }
            Payload::Error { reason } => Some(serde_json::to_value(ErrorArgs {
                reason: reason.as_str().to_string(),
            })?),
        };

        let raw = RawFrame {
            kind: self.payload.kind(),
            id: self.session.clone(),
            args,
        };

        Ok(serde_json::to_string(&raw)?)
    }
}

fn required_args<T: DeserializeOwned>(
    kind: u8,
    args: Option<Value>,
) -> Result<T, ProtocolError> {
    let value = args.ok_or(ProtocolError::MissingArgs(kind))?;
    Ok(serde_json::from_value(value)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_hello() {
        let text = r#"{"type":0,"id":"1","args":{"token":"abc","cols":80,"rows":24,"seq":-1}}"#;
        let frame = Frame::decode(text).unwrap();
        assert_eq!(frame.session, "1");
        assert_eq!(
            frame.payload,
            Payload::Hello {
                token: "abc".to_string(),
                cols: 80,
                rows: 24,
                seq: -1,
            }
        );
    }

    #[test]
    fn decode_ping_without_args() {
        let frame = Frame::decode(r#"{"type":1,"id":"2"}"#).unwrap();
        assert_eq!(frame.payload, Payload::Ping);
    }

    #[test]
    fn decode_client_data_has_no_seq() {
        let frame = Frame::decode(r#"{"type":2,"id":"1","args":{"data":"ls\n"}}"#).unwrap();
        assert_eq!(
            frame.payload,
            Payload::Data {
                data: "ls\n".to_string(),
                seq: None,
            }
        );
    }

    #[test]
    fn encode_server_data_carries_seq() {
        let frame = Frame::new(
            "1",
            Payload::Data {
                data: "hello".to_string(),
                seq: Some(7),
            },
        );
        let text = frame.encode().unwrap();
        let value: Value = serde_json::from_str(&text).unwrap();
        assert_eq!(value["type"], 2);
        assert_eq!(value["id"], "1");
        assert_eq!(value["args"]["data"], "hello");
        assert_eq!(value["args"]["seq"], 7);
    }

    #[test]
    fn encode_ping_omits_args() {
        let text = Frame::new("3", Payload::Ping).encode().unwrap();
        let value: Value = serde_json::from_str(&text).unwrap();
        assert!(value.get("args").is_none());
    }

    #[test]
    fn error_reason_round_trip() {
        let frame = Frame::new(
            "1",
            Payload::Error {
                reason: ErrorReason::Hijacked,
            },
        );
        let decoded = Frame::decode(&frame.encode().unwrap()).unwrap();
        assert_eq!(decoded, frame);
    }

    #[test]
    fn unknown_error_reason_is_preserved() {
        let text = r#"{"type":4,"id":"1","args":{"reason":"RateLimited"}}"#;
        let frame = Frame::decode(text).unwrap();
        assert_eq!(
            frame.payload,
            Payload::Error {
                reason: ErrorReason::Other("RateLimited".to_string()),
            }
        );
    }

    #[test]
    fn unknown_frame_type_is_rejected() {
        let err = Frame::decode(r#"{"type":9,"id":"1"}"#).unwrap_err();
        assert!(matches!(err, ProtocolError::UnknownType(9)));
    }

    #[test]
    fn missing_args_are_rejected() {
        let err = Frame::decode(r#"{"type":3,"id":"1"}"#).unwrap_err();
        assert!(matches!(err, ProtocolError::MissingArgs(3)));
    }

    #[test]
    fn garbage_is_rejected() {
        assert!(matches!(
            Frame::decode("not json").unwrap_err(),
            ProtocolError::Malformed(_)
        ));
    }
}
