use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::segment::Segment;

/// Literal first frame a client sends to negotiate the segment size.
pub const HANDSHAKE_REQUEST: &str = "REQUEST_MAX_SIZE";

/// One transport-visible unit of bytes, parsed once and dispatched.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    MaxSizeRequest,
    MaxSizeReply { max_size: usize },
    Error { message: String },
    Data(Segment),
    Ack(i64),
}

#[derive(Debug, Serialize, Deserialize)]
struct ControlEnvelope {
    #[serde(rename = "STATUS")]
    status: String,
    #[serde(rename = "MAX_SIZE", skip_serializing_if = "Option::is_none")]
    max_size: Option<u64>,
    #[serde(rename = "ACK", skip_serializing_if = "Option::is_none")]
    ack: Option<String>,
    #[serde(rename = "MESSAGE", skip_serializing_if = "Option::is_none")]
    message: Option<String>,
}

impl ControlEnvelope {
    fn ok() -> Self {
        Self {
            status: "OK".to_owned(),
            max_size: None,
            ack: None,
            message: None,
        }
    }
}

/// ACKs travel as `"M<n>"` where `n` is a signed base-10 integer; the
/// receiver acknowledges `M-1` before any contiguous prefix exists.
fn parse_ack(text: &str) -> Option<i64> {
    text.strip_prefix('M')?.parse().ok()
}

impl Frame {
    /// Parses one wire frame. Returns `None` for anything malformed;
    /// the transport drops such frames and relies on retransmission.
    pub fn decode(bytes: &[u8]) -> Option<Frame> {
        let text = std::str::from_utf8(bytes).ok()?.trim();
        if text == HANDSHAKE_REQUEST {
            return Some(Frame::MaxSizeRequest);
        }

        let value: serde_json::Value = serde_json::from_str(text).ok()?;
        if value.get("metadata").is_some() && value.get("data").is_some() {
            return Segment::decode(bytes).map(Frame::Data);
        }

        let control: ControlEnvelope = serde_json::from_value(value).ok()?;
        match control.status.as_str() {
            "OK" => {
                if let Some(ack) = control.ack {
                    parse_ack(&ack).map(Frame::Ack)
                } else if let Some(max_size) = control.max_size {
                    Some(Frame::MaxSizeReply {
                        max_size: max_size as usize,
                    })
                } else {
                    None
                }
            }
            "ERROR" => Some(Frame::Error {
                message: control.message.unwrap_or_default(),
            }),
            _ => None,
        }
    }

    /// Encodes the frame as one newline-terminated line.
    ///
    /// Data frames are encoded without a size bound; senders go through
    /// `Segmenter::serialize_segment`, which enforces it.
    pub fn encode(&self) -> Result<Bytes> {
        let mut line = match self {
            Frame::MaxSizeRequest => HANDSHAKE_REQUEST.to_owned(),
            Frame::MaxSizeReply { max_size } => {
                let mut control = ControlEnvelope::ok();
                control.max_size = Some(*max_size as u64);
                serde_json::to_string(&control)?
            }
            Frame::Error { message } => serde_json::to_string(&ControlEnvelope {
                status: "ERROR".to_owned(),
                max_size: None,
                ack: None,
                message: Some(message.clone()),
            })?,
            Frame::Data(segment) => serde_json::to_string(&segment.to_envelope()?)?,
            Frame::Ack(n) => {
                let mut control = ControlEnvelope::ok();
                control.ack = Some(format!("M{n}"));
                serde_json::to_string(&control)?
            }
        };
        line.push('\n');
        Ok(Bytes::from(line.into_bytes()))
    }

    /// True for handshake traffic the fault simulator forwards verbatim.
    pub fn is_handshake(bytes: &[u8]) -> bool {
        match std::str::from_utf8(bytes) {
            Ok(text) => text.trim() == HANDSHAKE_REQUEST || text.contains("\"MAX_SIZE\":"),
            Err(_) => false,
        }
    }

    /// True iff the bytes parse as a JSON object with an `ACK` field and
    /// `STATUS == "OK"`. Everything else counts as data for the
    /// simulator's loss model.
    pub fn is_ack(bytes: &[u8]) -> bool {
        let Ok(text) = std::str::from_utf8(bytes) else {
            return false;
        };
        match serde_json::from_str::<serde_json::Value>(text.trim()) {
            Ok(value) => {
                value.get("ACK").is_some()
                    && value.get("STATUS").and_then(|s| s.as_str()) == Some("OK")
            }
            Err(_) => false,
        }
    }
}
