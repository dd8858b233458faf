//! Wire frames of the bridge protocol.
//!
//! One JSON object per line. Status and alert kinds travel as ordinals; the
//! receiving side decodes defensively and degrades instead of failing on
//! out-of-range values.

use serde::{Deserialize, Serialize};

use crate::lifecycle::ServiceEvent;

/// Client → server.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Request {
    /// Handshake; `register: true` adds this connection to the listener set.
    Hello { register: bool },
    Status,
    Capabilities,
    RecentLogs,
    Start,
    Stop,
    Reload,
    DeviceIdle { idle: bool },
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct RequestFrame {
    pub id: u64,
    #[serde(flatten)]
    pub request: Request,
}

/// Server → client, in answer to one request.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Reply {
    Ok,
    Status { status: u8 },
    Capabilities { command_endpoint: bool },
    Logs { messages: Vec<String> },
    Error { message: String },
}

/// Server → client, unsolicited.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum Push {
    StatusChanged { status: u8 },
    Alert { kind: u8, message: Option<String> },
    WriteLog { message: String },
    ResetLogs { messages: Vec<String> },
}

/// Everything the server writes is one of these.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "frame", rename_all = "snake_case")]
pub enum Frame {
    Reply { id: u64, reply: Reply },
    Push { push: Push },
}

impl From<ServiceEvent> for Push {
    fn from(event: ServiceEvent) -> Self {
        match event {
            ServiceEvent::StatusChanged(status) => Self::StatusChanged {
                status: status.ordinal(),
            },
            ServiceEvent::Alert(alert) => Self::Alert {
                kind: alert.kind.ordinal(),
                message: alert.message,
            },
            ServiceEvent::WriteLog(message) => Self::WriteLog { message },
            ServiceEvent::ResetLogs(messages) => Self::ResetLogs { messages },
        }
    }
}

/// Serialize one frame to its wire line (trailing newline included).
pub fn encode_line<T: Serialize>(value: &T) -> Result<String, serde_json::Error> {
    let mut line = serde_json::to_string(value)?;
    line.push('\n');
    Ok(line)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_frame_round_trips() {
        let frame = RequestFrame {
            id: 7,
            request: Request::DeviceIdle { idle: true },
        };
        let line = encode_line(&frame).unwrap();
        assert!(line.ends_with('\n'));
        let parsed: RequestFrame = serde_json::from_str(line.trim()).unwrap();
        assert_eq!(parsed, frame);
    }

    #[test]
    fn frames_use_snake_case_tags() {
        let line = encode_line(&Frame::Push {
            push: Push::StatusChanged { status: 2 },
        })
        .unwrap();
        assert!(line.contains(r#""frame":"push""#));
        assert!(line.contains(r#""event":"status_changed""#));

        let line = encode_line(&RequestFrame {
            id: 1,
            request: Request::RecentLogs,
        })
        .unwrap();
        assert!(line.contains(r#""type":"recent_logs""#));
    }

    #[test]
    fn alert_push_carries_optional_message() {
        let push = Push::Alert {
            kind: 1,
            message: None,
        };
        let line = encode_line(&push).unwrap();
        let parsed: Push = serde_json::from_str(line.trim()).unwrap();
        assert_eq!(parsed, push);
    }
}
