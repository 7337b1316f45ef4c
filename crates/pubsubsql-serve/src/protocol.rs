//! WebSocket protocol message types
//!
//! Every frame is a JSON text message tagged by `type`. Replies echo the
//! client's `request` number; `pubsub` frames are unsolicited.

use pubsubsql::{Notification, PubSubError, Response};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("Invalid JSON: {0}")]
    InvalidJson(#[from] serde_json::Error),
    #[error("Unexpected binary frame ({0} bytes)")]
    Binary(usize),
    #[error("Reply to request {got:?} while waiting for request {expected}")]
    OutOfOrder { expected: u64, got: Option<u64> },
}

/// Messages from client to server
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Run one command
    Execute { request: u64, command: String },
}

impl ClientMessage {
    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn encode(&self) -> Result<String, ProtocolError> {
        Ok(serde_json::to_string(self)?)
    }
}

/// Messages from server to client
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// `key` / `tag` succeeded
    Done { request: u64, action: String },
    /// Row id assigned by an insert
    Inserted { request: u64, id: u64 },
    /// Rows touched by `update` / `delete`
    Affected {
        request: u64,
        action: String,
        count: usize,
    },
    /// `select` result
    Rows {
        request: u64,
        columns: Vec<String>,
        rows: Vec<Vec<String>>,
    },
    Subscribed { request: u64, pubsubid: u64 },
    Unsubscribed { request: u64, count: usize },
    /// Command failure, or an unreadable frame when `request` is absent
    Error {
        request: Option<u64>,
        message: String,
    },
    /// Notification batch for one subscription
    #[serde(rename = "pubsub")]
    PubSub {
        pubsubid: u64,
        action: String,
        columns: Vec<String>,
        rows: Vec<Vec<String>>,
    },
}

impl ServerMessage {
    /// Reply for a command's result
    pub fn reply(request: u64, result: Result<Response, PubSubError>) -> Self {
        let response = match result {
            Ok(response) => response,
            Err(e) => {
                return ServerMessage::Error {
                    request: Some(request),
                    message: e.to_string(),
                };
            }
        };
        let action = response.action().to_string();
        match response {
            Response::Indexed { .. } => ServerMessage::Done { request, action },
            Response::Inserted { id } => ServerMessage::Inserted { request, id },
            Response::Updated { count } | Response::Deleted { count } => {
                ServerMessage::Affected {
                    request,
                    action,
                    count,
                }
            }
            Response::Selected(rows) => {
                let (columns, rows) = rows.into_parts();
                ServerMessage::Rows {
                    request,
                    columns,
                    rows,
                }
            }
            Response::Subscribed { pubsubid } => ServerMessage::Subscribed { request, pubsubid },
            Response::Unsubscribed { count } => ServerMessage::Unsubscribed { request, count },
        }
    }

    pub fn request(&self) -> Option<u64> {
        match self {
            ServerMessage::Done { request, .. }
            | ServerMessage::Inserted { request, .. }
            | ServerMessage::Affected { request, .. }
            | ServerMessage::Rows { request, .. }
            | ServerMessage::Subscribed { request, .. }
            | ServerMessage::Unsubscribed { request, .. } => Some(*request),
            ServerMessage::Error { request, .. } => *request,
            ServerMessage::PubSub { .. } => None,
        }
    }

    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn encode(&self) -> Result<String, ProtocolError> {
        Ok(serde_json::to_string(self)?)
    }
}

impl From<Notification> for ServerMessage {
    fn from(notification: Notification) -> Self {
        let (columns, rows) = notification.rows.into_parts();
        ServerMessage::PubSub {
            pubsubid: notification.pubsubid,
            action: notification.action.to_string(),
            columns,
            rows,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pubsubsql::RowSet;

    #[test]
    fn client_message_wire_format() {
        let msg = ClientMessage::decode(
            r#"{"type":"execute","request":7,"command":"select * from Stocks"}"#,
        )
        .unwrap();
        assert_eq!(
            msg,
            ClientMessage::Execute {
                request: 7,
                command: "select * from Stocks".into()
            }
        );
        assert!(matches!(
            ClientMessage::decode(r#"{"type":"query"}"#),
            Err(ProtocolError::InvalidJson(_))
        ));
    }

    #[test]
    fn reply_maps_responses() {
        let rows = RowSet::new(vec!["id".into()], vec![vec!["1".into()]]);
        assert_eq!(
            ServerMessage::reply(3, Ok(Response::Selected(rows))),
            ServerMessage::Rows {
                request: 3,
                columns: vec!["id".into()],
                rows: vec![vec!["1".into()]],
            }
        );
        assert_eq!(
            ServerMessage::reply(4, Ok(Response::Deleted { count: 2 })),
            ServerMessage::Affected {
                request: 4,
                action: "delete".into(),
                count: 2,
            }
        );
        let err = ServerMessage::reply(5, Err(PubSubError::NotFound("no subscriptions".into())));
        assert_eq!(err.request(), Some(5));
        assert!(matches!(err, ServerMessage::Error { .. }));
    }

    #[test]
    fn pubsub_frame_tag() {
        let msg = ServerMessage::PubSub {
            pubsubid: 1,
            action: "add".into(),
            columns: vec!["Ticker".into()],
            rows: vec![vec!["IBM".into()]],
        };
        let json = msg.encode().unwrap();
        assert!(json.starts_with(r#"{"type":"pubsub""#));
        assert_eq!(ServerMessage::decode(&json).unwrap(), msg);
    }
}
