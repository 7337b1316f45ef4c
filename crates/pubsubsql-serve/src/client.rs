//! Async client for a PubSubSQL server
//!
//! The client keeps the result of the last command (or the last notification
//! batch) and exposes it through a row cursor.
//!
//! ```ignore
//! let mut client = Client::connect("127.0.0.1:7777").await?;
//! client.execute("select id, Ticker from Stocks").await?;
//! while client.next_row() {
//!     println!("{:?} {:?}", client.value("id"), client.value("Ticker"));
//! }
//!
//! client.execute("subscribe * from Stocks").await?;
//! while client.wait_for_pubsub(Duration::from_millis(100)).await? {
//!     println!("{} on pubsubid {:?}", client.action(), client.pubsub_id());
//! }
//! ```

use std::time::Duration;

use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use log::{debug, warn};
use pubsubsql::RowSet;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};

use crate::protocol::{ClientMessage, ProtocolError, ServerMessage};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Error, Debug)]
pub enum ClientError {
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),
    #[error("Server error: {0}")]
    Server(String),
    #[error("Connection closed")]
    Closed,
}

/// Connection to a server, holding the current result
pub struct Client {
    sink: SplitSink<WsStream, Message>,
    replies: mpsc::UnboundedReceiver<ServerMessage>,
    pubsub: mpsc::UnboundedReceiver<ServerMessage>,
    reader: JoinHandle<()>,
    next_request: u64,

    action: String,
    pubsub_id: Option<u64>,
    row_id: Option<u64>,
    rows: RowSet,
    cursor: Option<usize>,
}

impl Client {
    /// Connect to `host:port`
    pub async fn connect(addr: &str) -> Result<Self, ClientError> {
        let url = format!("ws://{}", addr);
        let (ws, _) = connect_async(&url).await?;
        let (sink, stream) = ws.split();

        let (reply_tx, replies) = mpsc::unbounded_channel();
        let (pubsub_tx, pubsub) = mpsc::unbounded_channel();
        let reader = tokio::spawn(read_frames(stream, reply_tx, pubsub_tx));

        Ok(Self {
            sink,
            replies,
            pubsub,
            reader,
            next_request: 1,
            action: String::new(),
            pubsub_id: None,
            row_id: None,
            rows: RowSet::default(),
            cursor: None,
        })
    }

    /// Run a command and make its result current
    pub async fn execute(&mut self, command: &str) -> Result<(), ClientError> {
        let request = self.next_request;
        self.next_request += 1;
        self.reset("");

        let msg = ClientMessage::Execute {
            request,
            command: command.to_string(),
        };
        self.sink.send(Message::Text(msg.encode()?.into())).await?;

        let reply = self.replies.recv().await.ok_or(ClientError::Closed)?;
        if reply.request() != Some(request) {
            return Err(ProtocolError::OutOfOrder {
                expected: request,
                got: reply.request(),
            }
            .into());
        }

        match reply {
            ServerMessage::Done { action, .. } => self.action = action,
            ServerMessage::Inserted { id, .. } => {
                self.action = "insert".into();
                self.row_id = Some(id);
            }
            ServerMessage::Affected { action, .. } => self.action = action,
            ServerMessage::Rows { columns, rows, .. } => {
                self.action = "select".into();
                self.rows = RowSet::new(columns, rows);
            }
            ServerMessage::Subscribed { pubsubid, .. } => {
                self.action = "subscribe".into();
                self.pubsub_id = Some(pubsubid);
            }
            ServerMessage::Unsubscribed { .. } => self.action = "unsubscribe".into(),
            ServerMessage::Error { message, .. } => return Err(ClientError::Server(message)),
            ServerMessage::PubSub { .. } => {
                return Err(ProtocolError::OutOfOrder {
                    expected: request,
                    got: None,
                }
                .into());
            }
        }
        Ok(())
    }

    /// Wait up to `timeout` for the next notification batch and make it
    /// current. `Ok(false)` means nothing arrived in time.
    pub async fn wait_for_pubsub(&mut self, timeout: Duration) -> Result<bool, ClientError> {
        let frame = match tokio::time::timeout(timeout, self.pubsub.recv()).await {
            Err(_) => return Ok(false),
            Ok(None) => return Err(ClientError::Closed),
            Ok(Some(frame)) => frame,
        };

        if let ServerMessage::PubSub {
            pubsubid,
            action,
            columns,
            rows,
        } = frame
        {
            self.reset(&action);
            self.pubsub_id = Some(pubsubid);
            self.rows = RowSet::new(columns, rows);
        }
        Ok(true)
    }

    /// Advance to the next row of the current result
    pub fn next_row(&mut self) -> bool {
        let next = self.cursor.map_or(0, |i| i + 1);
        if next < self.rows.len() {
            self.cursor = Some(next);
            true
        } else {
            self.cursor = Some(self.rows.len());
            false
        }
    }

    /// Value of `column` in the current row
    pub fn value(&self, column: &str) -> Option<&str> {
        self.rows.value(self.cursor?, column)
    }

    pub fn value_by_ordinal(&self, ordinal: usize) -> Option<&str> {
        self.rows.value_by_ordinal(self.cursor?, ordinal)
    }

    pub fn columns(&self) -> &[String] {
        self.rows.columns()
    }

    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    pub fn rows(&self) -> &RowSet {
        &self.rows
    }

    /// Action of the last command or notification (`insert`, `add`, ...)
    pub fn action(&self) -> &str {
        &self.action
    }

    /// pubsubid of the last `subscribe` or notification
    pub fn pubsub_id(&self) -> Option<u64> {
        self.pubsub_id
    }

    /// Row id assigned by the last `insert`
    pub fn id(&self) -> Option<u64> {
        self.row_id
    }

    /// Close the connection; pending notifications are discarded
    pub async fn disconnect(mut self) -> Result<(), ClientError> {
        let result = self.sink.close().await;
        self.reader.abort();
        result.map_err(ClientError::from)
    }

    fn reset(&mut self, action: &str) {
        self.action = action.to_string();
        self.pubsub_id = None;
        self.row_id = None;
        self.rows = RowSet::default();
        self.cursor = None;
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

/// Route replies and notifications to their own queues
async fn read_frames(
    mut stream: SplitStream<WsStream>,
    replies: mpsc::UnboundedSender<ServerMessage>,
    pubsub: mpsc::UnboundedSender<ServerMessage>,
) {
    while let Some(msg) = stream.next().await {
        let text = match msg {
            Ok(Message::Text(text)) => text,
            Ok(Message::Binary(data)) => {
                warn!("ignoring frame: {}", ProtocolError::Binary(data.len()));
                continue;
            }
            Ok(Message::Close(_)) => break,
            Ok(_) => continue,
            Err(e) => {
                debug!("client read error: {}", e);
                break;
            }
        };

        let frame = match ServerMessage::decode(text.as_str()) {
            Ok(frame) => frame,
            Err(e) => {
                warn!("ignoring unreadable frame: {}", e);
                continue;
            }
        };

        let queue = match frame {
            ServerMessage::PubSub { .. } => &pubsub,
            // answers no request, so it must not take a reply's place
            ServerMessage::Error {
                request: None,
                ref message,
            } => {
                warn!("server error: {}", message);
                continue;
            }
            _ => &replies,
        };
        if queue.send(frame).is_err() {
            break;
        }
    }
}
