//! WebSocket connector: one session per connection, speaking the
//! line-oriented client protocol.
//!
//! Each session owns a bounded outbound channel feeding the socket, a map of
//! running receivers keyed by path, and dispatches `>`/`+`/`-` commands to
//! the router and receiver machinery.

use crate::receiver::{Receiver, ReceiverControl};
use crate::router::Router;
use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use herald_core::protocol::{ERROR_BAD_REQUEST, ERROR_SEND, SUCCESS_CONNECTED, SUCCESS_SEND};
use herald_core::{Cmd, CmdType, Message, Notification, Path, Result};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};
use tokio_tungstenite::tungstenite::handshake::server::{Request, Response};
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Capacity of a session's outbound channel.
const SEND_CHANNEL_SIZE: usize = 10;

/// The WebSocket front door of the broker.
pub struct WsServer {
    listen: SocketAddr,
    router: Arc<Router>,
    shutdown: broadcast::Sender<()>,
}

impl WsServer {
    /// Create a server for the given listen address.
    pub fn new(listen: SocketAddr, router: Arc<Router>) -> Self {
        let (shutdown, _) = broadcast::channel(1);
        Self { listen, router, shutdown }
    }

    /// Bind and start accepting connections; returns the bound address.
    pub async fn start(&self) -> Result<SocketAddr> {
        let listener = TcpListener::bind(self.listen).await.map_err(|e| {
            herald_core::Error::Configuration {
                reason: format!("cannot bind {}: {e}", self.listen),
            }
        })?;
        let local_addr = listener.local_addr().map_err(|e| herald_core::Error::Configuration {
            reason: format!("listener has no local address: {e}"),
        })?;
        info!(addr = %local_addr, "websocket server listening");

        let router = Arc::clone(&self.router);
        let mut shutdown = self.shutdown.subscribe();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    accepted = listener.accept() => match accepted {
                        Ok((stream, peer)) => {
                            debug!(%peer, "websocket connection accepted");
                            tokio::spawn(handle_connection(stream, Arc::clone(&router)));
                        }
                        Err(err) => warn!(error = %err, "accept failed"),
                    },
                    _ = shutdown.recv() => break,
                }
            }
        });
        Ok(local_addr)
    }

    /// Stop accepting new connections.
    pub fn stop(&self) {
        let _ = self.shutdown.send(());
    }
}

async fn handle_connection(stream: TcpStream, router: Arc<Router>) {
    let mut uri_path = String::new();
    let callback = |request: &Request, response: Response| {
        uri_path = request.uri().path().to_string();
        Ok(response)
    };
    let ws = match tokio_tungstenite::accept_hdr_async(stream, callback).await {
        Ok(ws) => ws,
        Err(err) => {
            warn!(error = %err, "websocket handshake failed");
            return;
        }
    };
    let (mut ws_sink, mut ws_stream) = ws.split();
    let (send_tx, mut send_rx) = mpsc::channel::<Bytes>(SEND_CHANNEL_SIZE);

    let mut session = WsSession {
        application_id: Uuid::new_v4().to_string(),
        user_id: extract_user_id(&uri_path),
        router,
        send_tx,
        receivers: HashMap::new(),
    };
    debug!(
        application_id = %session.application_id,
        user_id = %session.user_id,
        "websocket session started"
    );
    session.send_connected().await;

    let writer = tokio::spawn(async move {
        while let Some(bytes) = send_rx.recv().await {
            if ws_sink.send(WsMessage::Binary(bytes.to_vec())).await.is_err() {
                break;
            }
        }
        let _ = ws_sink.close().await;
    });

    while let Some(frame) = ws_stream.next().await {
        let data = match frame {
            Ok(WsMessage::Binary(data)) => Bytes::from(data),
            Ok(WsMessage::Text(text)) => Bytes::from(text.into_bytes()),
            Ok(WsMessage::Close(_)) | Err(_) => break,
            Ok(_) => continue,
        };
        session.handle_frame(&data).await;
    }

    debug!(application_id = %session.application_id, "websocket session closing");
    session.close();
    drop(session);
    let _ = writer.await;
}

struct WsSession {
    application_id: String,
    user_id: String,
    router: Arc<Router>,
    send_tx: mpsc::Sender<Bytes>,
    receivers: HashMap<Path, ReceiverControl>,
}

impl WsSession {
    async fn handle_frame(&mut self, data: &[u8]) {
        match Cmd::parse(data) {
            Ok(cmd) => match cmd.name {
                CmdType::Send => self.handle_send(cmd).await,
                CmdType::Receive => self.handle_receive(cmd).await,
                CmdType::Cancel => self.handle_cancel(cmd).await,
            },
            Err(err) => {
                self.notify(Notification::error(ERROR_BAD_REQUEST, err.to_string())).await;
            }
        }
    }

    async fn handle_send(&mut self, cmd: Cmd) {
        if cmd.arg.is_empty() {
            self.notify(Notification::error(
                ERROR_BAD_REQUEST,
                "send command requires a path argument, but none given",
            ))
            .await;
            return;
        }
        let mut parts = cmd.arg.splitn(2, ' ');
        let path = Path::from(parts.next().unwrap_or_default());
        let message_id = parts.next().unwrap_or_default().to_string();

        let message = Message {
            path,
            application_id: self.application_id.clone(),
            user_id: self.user_id.clone(),
            message_id: message_id.clone(),
            header_json: cmd.header_json,
            body: cmd.body,
            ..Default::default()
        };
        match self.router.handle_message(message).await {
            Ok(()) => self.notify(Notification::ok(SUCCESS_SEND, message_id)).await,
            Err(err) => {
                self.notify(Notification::error(ERROR_SEND, format!("{message_id} {err}")))
                    .await;
            }
        }
    }

    async fn handle_receive(&mut self, cmd: Cmd) {
        match Receiver::from_cmd(
            self.application_id.clone(),
            self.user_id.clone(),
            &cmd.arg,
            Arc::clone(&self.router),
            self.send_tx.clone(),
        ) {
            Ok((receiver, control)) => {
                // A new receive on the same path supersedes the old one.
                if let Some(previous) = self.receivers.insert(control.path().clone(), control) {
                    previous.stop();
                }
                receiver.start();
            }
            Err(err) => {
                debug!(error = %err, "bad receive command");
                self.notify(Notification::error(ERROR_BAD_REQUEST, err.to_string())).await;
            }
        }
    }

    async fn handle_cancel(&mut self, cmd: Cmd) {
        if cmd.arg.is_empty() {
            self.notify(Notification::error(
                ERROR_BAD_REQUEST,
                "- command requires a path argument, but none given",
            ))
            .await;
            return;
        }
        if let Some(control) = self.receivers.remove(&Path::from(cmd.arg.as_str())) {
            control.stop();
        }
    }

    async fn send_connected(&mut self) {
        let json = format!(
            r#"{{"ApplicationId":"{}","UserId":"{}","Time":"{}"}}"#,
            self.application_id,
            self.user_id,
            chrono::Utc::now().to_rfc3339(),
        );
        self.notify(
            Notification::ok(SUCCESS_CONNECTED, "You are connected to the server.").with_json(json),
        )
        .await;
    }

    async fn notify(&mut self, notification: Notification) {
        let _ = self.send_tx.send(notification.to_bytes()).await;
    }

    fn close(&mut self) {
        for (_, control) in self.receivers.drain() {
            control.stop();
        }
    }
}

/// The user id from a connection URI like `/stream/user/alice`, empty when
/// the URI does not carry one.
fn extract_user_id(uri_path: &str) -> String {
    match uri_path.split_once("/user/") {
        Some((_, user)) => user.trim_end_matches('/').to_string(),
        None => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn user_id_extraction() {
        assert_eq!(extract_user_id("/stream/user/alice"), "alice");
        assert_eq!(extract_user_id("/user/bob/"), "bob");
        assert_eq!(extract_user_id("/stream"), "");
        assert_eq!(extract_user_id(""), "");
    }
}
