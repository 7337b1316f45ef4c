//! WebSocket server for PubSubSQL sessions

use std::net::SocketAddr;
use std::sync::Arc;

use futures::{SinkExt, StreamExt};
use log::{debug, info, warn};
use pubsubsql::{Engine, Session};
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::accept_async;
use tokio_tungstenite::tungstenite::Message;

use crate::protocol::{ClientMessage, ServerMessage};

#[derive(Error, Debug)]
pub enum ServerError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
}

/// WebSocket server: one engine session per connection
pub struct PubSubServer {
    engine: Arc<Engine>,
}

impl PubSubServer {
    pub fn new(engine: Arc<Engine>) -> Self {
        Self { engine }
    }

    pub fn engine(&self) -> &Arc<Engine> {
        &self.engine
    }

    /// Bind `addr` and accept connections until an accept error
    pub async fn listen(&self, addr: SocketAddr) -> Result<(), ServerError> {
        let listener = TcpListener::bind(addr).await?;
        self.serve(listener).await
    }

    /// Accept connections on an already bound listener
    pub async fn serve(&self, listener: TcpListener) -> Result<(), ServerError> {
        info!("listening on {}", listener.local_addr()?);

        loop {
            let (stream, peer) = listener.accept().await?;
            let engine = self.engine.clone();

            tokio::spawn(async move {
                if let Err(e) = handle_connection(stream, peer, engine).await {
                    warn!("connection {} error: {}", peer, e);
                }
            });
        }
    }
}

async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    engine: Arc<Engine>,
) -> Result<(), ServerError> {
    let ws = accept_async(stream).await?;
    let (mut ws_tx, mut ws_rx) = ws.split();

    // Replies go through a channel; notifications stay in the session's
    // bounded mailbox until the socket can take them
    let (tx, mut rx) = mpsc::unbounded_channel::<Message>();

    let session = engine.connect();
    info!("connection {} is subscriber {}", peer, session.id());

    let mailbox = session.mailbox();
    let forward_task = tokio::spawn(async move {
        let mut mailbox_open = true;
        loop {
            let msg = tokio::select! {
                biased;
                reply = rx.recv() => match reply {
                    Some(msg) => msg,
                    None => break,
                },
                notification = mailbox.recv(), if mailbox_open => match notification {
                    Some(notification) => match frame(&ServerMessage::from(notification)) {
                        Some(msg) => msg,
                        None => continue,
                    },
                    None => {
                        mailbox_open = false;
                        continue;
                    }
                },
            };
            if ws_tx.send(msg).await.is_err() {
                break;
            }
        }
    });

    while let Some(msg) = ws_rx.next().await {
        let text = match msg {
            Ok(Message::Text(text)) => text,
            Ok(Message::Binary(data)) => {
                send_error(&tx, None, format!("Unexpected binary frame ({} bytes)", data.len()));
                continue;
            }
            Ok(Message::Close(_)) => break,
            Ok(_) => continue,
            Err(e) => {
                debug!("connection {} read error: {}", peer, e);
                break;
            }
        };

        match ClientMessage::decode(text.as_str()) {
            Ok(client_msg) => handle_message(&session, &tx, client_msg),
            Err(e) => send_error(&tx, None, format!("Invalid message: {}", e)),
        }
    }

    info!("connection {} closed", peer);
    drop(session);
    forward_task.abort();
    Ok(())
}

fn handle_message(session: &Session, tx: &mpsc::UnboundedSender<Message>, msg: ClientMessage) {
    match msg {
        ClientMessage::Execute { request, command } => {
            let result = session.execute(&command);
            if let Err(e) = &result {
                debug!("subscriber {} request {} failed: {}", session.id(), request, e);
            }
            send_message(tx, &ServerMessage::reply(request, result));
        }
    }
}

fn frame(msg: &ServerMessage) -> Option<Message> {
    match msg.encode() {
        Ok(json) => Some(Message::Text(json.into())),
        Err(e) => {
            warn!("dropping unencodable frame: {}", e);
            None
        }
    }
}

fn send_message(tx: &mpsc::UnboundedSender<Message>, msg: &ServerMessage) {
    if let Some(msg) = frame(msg) {
        // the writer is gone only once the connection is closing
        let _ = tx.send(msg);
    }
}

fn send_error(tx: &mpsc::UnboundedSender<Message>, request: Option<u64>, message: String) {
    send_message(tx, &ServerMessage::Error { request, message });
}
