//! Realtime connection lifecycle
//!
//! `Connecting → Registered → Closing → Closed`. A connection is registered
//! with the hub only after its identity token resolves to a stored identity;
//! otherwise it is closed with a policy-violation frame and never registered.
//!
//! Once registered, a dedicated writer task drains the connection's queue and
//! sends liveness pings. The reader only watches for inbound frames: any frame
//! refreshes the idle deadline, and silence past the deadline closes the
//! connection.

use std::borrow::Cow;
use std::sync::Arc;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{accept_hdr_async, WebSocketStream};

use crate::cli::HeartbeatConfig;
use crate::realtime::hub::{ConnectionId, Hub};
use crate::realtime::protocol::Notification;
use crate::schema::IdentityKey;
use crate::store::WorkflowStore;

/// Path of the realtime endpoint
pub const REALTIME_PATH: &str = "/ws";

/// Header carrying the identity token when no query parameter is given
pub const IDENTITY_HEADER: &str = "x-user-id";

/// Query parameters accepted as the identity token, in priority order
const IDENTITY_PARAMS: &[&str] = &["userId", "identity"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConnectionState {
    Connecting,
    Registered,
    Closing,
    Closed,
}

/// Identity token from the handshake request: query parameter first, then header
pub fn identity_token(request: &Request) -> Option<String> {
    let from_query = request.uri().query().and_then(|query| {
        let pairs: Vec<(String, String)> = url::form_urlencoded::parse(query.as_bytes())
            .into_owned()
            .collect();
        IDENTITY_PARAMS.iter().find_map(|name| {
            pairs
                .iter()
                .find(|(key, value)| key == name && !value.trim().is_empty())
                .map(|(_, value)| value.trim().to_string())
        })
    });

    from_query.or_else(|| {
        request
            .headers()
            .get(IDENTITY_HEADER)
            .and_then(|value| value.to_str().ok())
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .map(str::to_string)
    })
}

fn reject(status: StatusCode, message: &str) -> ErrorResponse {
    let mut response = ErrorResponse::new(Some(message.to_string()));
    *response.status_mut() = status;
    response
}

/// Drive one realtime connection from handshake to close
pub async fn handle_connection<S>(
    stream: S,
    hub: Arc<Hub>,
    store: WorkflowStore,
    heartbeat: HeartbeatConfig,
) where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let mut token = None;
    let handshake = accept_hdr_async(stream, |request: &Request, response: Response| {
        if request.uri().path() != REALTIME_PATH {
            return Err(reject(StatusCode::NOT_FOUND, "not found"));
        }
        match identity_token(request) {
            Some(found) => {
                token = Some(found);
                Ok(response)
            }
            None => Err(reject(StatusCode::BAD_REQUEST, "userId is required")),
        }
    })
    .await;

    let mut ws = match handshake {
        Ok(ws) => ws,
        Err(e) => {
            tracing::debug!("Realtime handshake refused: {}", e);
            return;
        }
    };
    let Some(token) = token else {
        return;
    };

    let mut conn = Connection {
        state: ConnectionState::Connecting,
        token,
    };

    let identity = match store.find_identity(IdentityKey::Id, &conn.token).await {
        Ok(Some(identity)) => identity,
        Ok(None) => {
            tracing::warn!("Refusing realtime connection for unknown identity {}", conn.token);
            conn.refuse(&mut ws, "unknown identity").await;
            return;
        }
        Err(e) => {
            tracing::warn!("Identity lookup failed for {}: {}", conn.token, e);
            conn.refuse(&mut ws, "identity lookup failed").await;
            return;
        }
    };

    let registration = hub.register(&identity.id, identity.role);
    conn.transition(ConnectionState::Registered);

    let (sink, stream) = ws.split();
    let writer = tokio::spawn(write_loop(sink, registration.rx, heartbeat));
    conn.read_loop(stream, writer, &hub, registration.id, heartbeat)
        .await;
}

struct Connection {
    state: ConnectionState,
    token: String,
}

impl Connection {
    fn transition(&mut self, next: ConnectionState) {
        tracing::debug!("Connection {}: {:?} -> {:?}", self.token, self.state, next);
        self.state = next;
    }

    /// Close an unregistered connection with a policy-violation frame
    async fn refuse<S>(&mut self, ws: &mut WebSocketStream<S>, reason: &'static str)
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let frame = CloseFrame {
            code: CloseCode::Policy,
            reason: Cow::Borrowed(reason),
        };
        if let Err(e) = ws.close(Some(frame)).await {
            tracing::debug!("Close after refusal failed: {}", e);
        }
        self.transition(ConnectionState::Closed);
    }

    async fn read_loop<S>(
        &mut self,
        mut stream: SplitStream<WebSocketStream<S>>,
        mut writer: JoinHandle<()>,
        hub: &Hub,
        id: ConnectionId,
        heartbeat: HeartbeatConfig,
    ) where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let mut writer_done = false;

        loop {
            tokio::select! {
                frame = tokio::time::timeout(heartbeat.idle_timeout, stream.next()) => {
                    match frame {
                        Err(_) => {
                            tracing::info!("Connection {} idle for {:?}, closing", self.token, heartbeat.idle_timeout);
                            break;
                        }
                        Ok(None) | Ok(Some(Ok(Message::Close(_)))) => break,
                        Ok(Some(Err(e))) => {
                            tracing::debug!("Connection {} read error: {}", self.token, e);
                            break;
                        }
                        // Inbound frames carry no business meaning; they only prove liveness.
                        Ok(Some(Ok(_))) => {}
                    }
                }
                _ = &mut writer => {
                    writer_done = true;
                    break;
                }
            }
        }

        self.transition(ConnectionState::Closing);
        hub.unregister(id);
        if !writer_done {
            // Unregistering dropped the queue's sender; the writer sends a close frame and exits.
            if tokio::time::timeout(heartbeat.idle_timeout, &mut writer).await.is_err() {
                writer.abort();
            }
        }
        self.transition(ConnectionState::Closed);
    }
}

/// Drain the outbound queue and send pings until the queue closes or the socket fails
async fn write_loop<S>(
    mut sink: SplitSink<WebSocketStream<S>, Message>,
    mut rx: mpsc::Receiver<Arc<Notification>>,
    heartbeat: HeartbeatConfig,
) where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let start = tokio::time::Instant::now() + heartbeat.ping_interval;
    let mut ticker = tokio::time::interval_at(start, heartbeat.ping_interval);

    loop {
        tokio::select! {
            message = rx.recv() => {
                let Some(message) = message else {
                    let frame = CloseFrame {
                        code: CloseCode::Normal,
                        reason: Cow::Borrowed(""),
                    };
                    let _ = sink.send(Message::Close(Some(frame))).await;
                    break;
                };
                let text = match message.to_json() {
                    Ok(text) => text,
                    Err(e) => {
                        tracing::warn!("Skipping unserializable notification {}: {}", message.kind, e);
                        continue;
                    }
                };
                if sink.send(Message::Text(text)).await.is_err() {
                    break;
                }
            }
            _ = ticker.tick() => {
                if sink.send(Message::Ping(Vec::new())).await.is_err() {
                    break;
                }
            }
        }
    }
    let _ = sink.close().await;
}
