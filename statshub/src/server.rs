//! WebSocket listener.
//!
//! Accepts upgrades on the configured path, pins one writer task per
//! connection, and feeds inbound text frames to the hub. The writer
//! drains an unbounded queue of either text frames or a terminal close
//! code; the hub never touches the socket directly.

use futures::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::accept_hdr_async;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode as WsCloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::hub::Hub;
use crate::protocol::{CloseCode, Outbound};

/// Accept loop bound to the hub's configured address.
pub struct HubServer {
    hub: Arc<Hub>,
    listener: TcpListener,
}

impl HubServer {
    /// Bind the listener. Separate from `run` so callers can learn the
    /// bound address first (port 0 binds in particular).
    pub async fn bind(hub: Arc<Hub>) -> Result<Self> {
        let listener = TcpListener::bind(&hub.config().bind_addr).await?;
        Ok(Self { hub, listener })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept connections until the listener fails.
    pub async fn run(self) -> Result<()> {
        info!(addr = %self.local_addr()?, path = %self.hub.config().path, "listening");
        loop {
            let (stream, peer) = self.listener.accept().await?;
            let hub = Arc::clone(&self.hub);
            tokio::spawn(async move {
                handle_socket(hub, stream, peer).await;
            });
        }
    }
}

async fn handle_socket(hub: Arc<Hub>, stream: TcpStream, peer: SocketAddr) {
    let path = hub.config().path.clone();
    let check_path = |req: &Request, response: Response| {
        if req.uri().path() == path {
            Ok(response)
        } else {
            let mut rejection = ErrorResponse::new(None);
            *rejection.status_mut() = StatusCode::NOT_FOUND;
            Err(rejection)
        }
    };

    let socket = match accept_hdr_async(stream, check_path).await {
        Ok(socket) => socket,
        Err(e) => {
            debug!(%peer, error = %e, "websocket upgrade failed");
            return;
        }
    };
    debug!(%peer, "connection upgraded");

    let (mut sink, mut source) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<Outbound>();

    let writer = tokio::spawn(async move {
        while let Some(outbound) = rx.recv().await {
            match outbound {
                Outbound::Frame(frame) => {
                    if sink.send(Message::Text(frame)).await.is_err() {
                        break;
                    }
                }
                Outbound::Close(code) => {
                    let frame = CloseFrame {
                        code: WsCloseCode::from(code.as_u16()),
                        reason: code.as_str().into(),
                    };
                    let _ = sink.send(Message::Close(Some(frame))).await;
                    break;
                }
            }
        }
    });

    // Every connection is greeted with Identify before any client frame
    // is read.
    let _ = tx.send(Outbound::Frame(hub.identify_frame()));

    let mut member: Option<u16> = None;
    while let Some(message) = source.next().await {
        let message = match message {
            Ok(message) => message,
            Err(e) => {
                debug!(%peer, error = %e, "read error");
                break;
            }
        };
        let text = match message {
            Message::Text(text) => text,
            Message::Close(_) => break,
            // Pings are answered by the protocol layer; anything else
            // carries no meaning here.
            _ => continue,
        };

        match member {
            None => match hub.handle_identity(&tx, &text) {
                Ok(index) => {
                    debug!(%peer, index, "handshake complete");
                    member = Some(index);
                }
                Err(code) => {
                    warn!(%peer, code = code.as_str(), "handshake rejected");
                    let _ = tx.send(Outbound::Close(code));
                    break;
                }
            },
            Some(index) => hub.handle_frame(index, &text).await,
        }
    }

    // Transport gone without an eviction: the hub still thinks this
    // member is present. No-op if it was already evicted.
    if let Some(index) = member {
        hub.evict(index, CloseCode::Abnormal);
    }
    drop(tx);
    let _ = writer.await;
    debug!(%peer, "connection closed");
}
