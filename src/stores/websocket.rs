//! Session store backed by a WebSocket document gateway, using `tokio-tungstenite`.
//!
//! The gateway speaks JSON text frames ([`ClientMessage`] / [`ServerMessage`]).
//! After connecting, the store sends `Subscribe` and then one `Merge` per write.
//! The gateway answers with confirmed `Snapshot` frames that carry the highest
//! acknowledged write id of this connection; [`PendingWrites`] turns the gap into
//! unconfirmed local snapshots. Both `ws://` and `wss://` URLs are supported.
//!
//! # Feature gate
//!
//! Only available with the `store-websocket` feature (enabled by default).
//!
//! # Example
//!
//! ```rust,no_run
//! # async fn example() -> Result<(), botb_session_sync::SyncError> {
//! use botb_session_sync::{SessionClient, SessionConfig, WebSocketStore};
//!
//! let store = WebSocketStore::connect("ws://localhost:8787/session", "user-123").await?;
//! let (client, _events) = SessionClient::connect(store, SessionConfig::new());
//! client.start_timer(30.0)?;
//! # Ok(())
//! # }
//! ```

use std::collections::VecDeque;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio_tungstenite::tungstenite::protocol::Message;
use tracing::{debug, info, warn};

use crate::error::SyncError;
use crate::protocol::{ClientMessage, ServerMessage, SessionPatch};
use crate::store::{PendingWrites, SessionStore, Snapshot};

/// Type alias for the underlying WebSocket stream.
pub type WsStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

/// A [`SessionStore`] talking to a document gateway over WebSocket.
///
/// # Cancel Safety
///
/// [`next_snapshot`](SessionStore::next_snapshot) only changes state after a
/// complete frame has been read, so it is safe to use inside `tokio::select!`.
#[derive(Debug)]
pub struct WebSocketStore {
    stream: WsStream,
    uid: String,
    ledger: PendingWrites,
    outbox: VecDeque<Snapshot>,
    closed: bool,
}

impl WebSocketStore {
    /// Connect to the gateway and subscribe to `uid`'s document.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::Io`] if the URL is invalid or the connection cannot be
    /// established, and [`SyncError::StoreWrite`] if the subscribe frame cannot
    /// be sent.
    pub async fn connect(url: &str, uid: impl Into<String>) -> Result<Self, SyncError> {
        Self::connect_with_token(url, uid, None).await
    }

    /// Like [`connect`](Self::connect), presenting an identity token.
    ///
    /// # Errors
    ///
    /// See [`connect`](Self::connect).
    pub async fn connect_with_token(
        url: &str,
        uid: impl Into<String>,
        id_token: Option<String>,
    ) -> Result<Self, SyncError> {
        debug!(url = %url, "connecting to session gateway");

        let (stream, _response) = tokio_tungstenite::connect_async(url).await.map_err(|e| {
            let kind = match &e {
                tokio_tungstenite::tungstenite::Error::Io(io) => io.kind(),
                _ => std::io::ErrorKind::Other,
            };
            SyncError::Io(std::io::Error::new(kind, e))
        })?;

        info!(url = %url, "session gateway connection established");
        Self::from_stream(stream, uid, id_token).await
    }

    /// Connect with a deadline.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::Timeout`] if the deadline elapses, or any error that
    /// [`connect`](Self::connect) may return.
    pub async fn connect_with_timeout(
        url: &str,
        uid: impl Into<String>,
        timeout: std::time::Duration,
    ) -> Result<Self, SyncError> {
        tokio::time::timeout(timeout, Self::connect(url, uid))
            .await
            .map_err(|_| SyncError::Timeout)?
    }

    /// Subscribe over an already-established WebSocket stream.
    ///
    /// Useful for custom TLS, proxies or headers that [`connect`](Self::connect)
    /// does not expose.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::StoreWrite`] if the subscribe frame cannot be sent.
    pub async fn from_stream(
        stream: WsStream,
        uid: impl Into<String>,
        id_token: Option<String>,
    ) -> Result<Self, SyncError> {
        let mut store = Self {
            stream,
            uid: uid.into(),
            ledger: PendingWrites::new(),
            outbox: VecDeque::new(),
            closed: false,
        };
        let subscribe = ClientMessage::Subscribe {
            uid: store.uid.clone(),
            id_token,
        };
        store.send(&subscribe).await?;
        Ok(store)
    }

    /// The user this subscription belongs to.
    pub fn uid(&self) -> &str {
        &self.uid
    }

    /// Send a heartbeat frame.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::StoreClosed`] after [`close`](SessionStore::close).
    pub async fn ping(&mut self) -> Result<(), SyncError> {
        self.send(&ClientMessage::Ping).await
    }

    async fn send(&mut self, message: &ClientMessage) -> Result<(), SyncError> {
        if self.closed {
            return Err(SyncError::StoreClosed);
        }
        let json = serde_json::to_string(message)?;
        self.stream
            .send(Message::Text(json.into()))
            .await
            .map_err(|e| SyncError::StoreWrite(e.to_string()))
    }
}

#[async_trait]
impl SessionStore for WebSocketStore {
    async fn merge(&mut self, patch: SessionPatch) -> Result<(), SyncError> {
        if self.closed {
            return Err(SyncError::StoreClosed);
        }
        let write_id = self.ledger.record(patch.clone());
        if let Err(e) = self.send(&ClientMessage::Merge { write_id, patch }).await {
            let _ = self.ledger.reject(write_id);
            return Err(e);
        }
        if let Some(overlay) = self.ledger.overlay() {
            self.outbox.push_back(overlay);
        }
        Ok(())
    }

    async fn next_snapshot(&mut self) -> Option<Result<Snapshot, SyncError>> {
        if self.closed {
            return None;
        }
        if let Some(snapshot) = self.outbox.pop_front() {
            return Some(Ok(snapshot));
        }
        loop {
            let msg = match self.stream.next().await {
                Some(Ok(msg)) => msg,
                Some(Err(e)) => {
                    return Some(Err(SyncError::StoreReceive(e.to_string())));
                }
                None => return None,
            };

            let text = match msg {
                Message::Text(text) => text,
                Message::Close(frame) => {
                    debug!(?frame, "received WebSocket close frame");
                    return None;
                }
                Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => continue,
                Message::Binary(_) => {
                    warn!("received unexpected binary WebSocket frame, skipping");
                    continue;
                }
            };

            let server_msg = match serde_json::from_str::<ServerMessage>(&text) {
                Ok(server_msg) => server_msg,
                Err(e) => {
                    warn!("failed to deserialize gateway message: {e}");
                    continue;
                }
            };

            match server_msg {
                ServerMessage::Subscribed { uid } => {
                    info!(uid = %uid, "session subscription live");
                }
                ServerMessage::Snapshot {
                    document,
                    acknowledged,
                } => {
                    return Some(Ok(self.ledger.confirm(document, acknowledged)));
                }
                ServerMessage::WriteRejected {
                    write_id,
                    message,
                    error_code,
                } => {
                    warn!(write_id, ?error_code, "gateway rejected write: {message}");
                    if let Some(snapshot) = self.ledger.reject(write_id) {
                        return Some(Ok(snapshot));
                    }
                }
                ServerMessage::Error {
                    message,
                    error_code,
                } => {
                    return Some(Err(SyncError::Backend {
                        message,
                        error_code,
                    }));
                }
                ServerMessage::Pong => debug!("gateway pong"),
            }
        }
    }

    async fn close(&mut self) -> Result<(), SyncError> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.ledger.clear();
        self.outbox.clear();
        self.stream
            .close(None)
            .await
            .map_err(|e| SyncError::StoreWrite(e.to_string()))
    }
}

#[cfg(test)]
#[allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::todo,
    clippy::unimplemented,
    clippy::indexing_slicing
)]
mod tests {
    use super::*;
    use crate::error_codes::ErrorCode;
    use crate::protocol::{ServerTimestamp, SessionDocument};
    use tokio::net::TcpListener;

    type ServerStream = tokio_tungstenite::WebSocketStream<tokio::net::TcpStream>;

    /// Start a local gateway that runs `handler` on the accepted connection.
    async fn start_mock_gateway<F, Fut>(handler: F) -> String
    where
        F: FnOnce(ServerStream) -> Fut + Send + 'static,
        Fut: std::future::Future<Output = ()> + Send,
    {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            let (tcp, _) = listener.accept().await.unwrap();
            let ws = tokio_tungstenite::accept_async(tcp).await.unwrap();
            handler(ws).await;
        });

        format!("ws://{addr}")
    }

    async fn read_client(ws: &mut ServerStream) -> ClientMessage {
        loop {
            match ws.next().await.unwrap().unwrap() {
                Message::Text(text) => return serde_json::from_str(&text).unwrap(),
                _ => continue,
            }
        }
    }

    async fn send_server(ws: &mut ServerStream, msg: &ServerMessage) {
        let json = serde_json::to_string(msg).unwrap();
        ws.send(Message::Text(json.into())).await.unwrap();
    }

    #[test]
    fn websocket_store_is_send_and_debug() {
        fn assert_traits<T: Send + std::fmt::Debug>() {}
        assert_traits::<WebSocketStore>();
    }

    #[tokio::test]
    async fn connect_fails_with_invalid_url() {
        let err = WebSocketStore::connect("not-a-valid-url", "u1")
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::Io(_)));
    }

    #[tokio::test]
    async fn connect_with_timeout_times_out() {
        let err = WebSocketStore::connect_with_timeout(
            "ws://192.0.2.1:1",
            "u1",
            std::time::Duration::from_millis(50),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, SyncError::Timeout));
    }

    #[tokio::test]
    async fn subscribes_and_receives_confirmed_snapshot() {
        let url = start_mock_gateway(|mut ws| async move {
            match read_client(&mut ws).await {
                ClientMessage::Subscribe { uid, id_token } => {
                    assert_eq!(uid, "u1");
                    assert_eq!(id_token.as_deref(), Some("token"));
                }
                other => panic!("expected Subscribe, got {other:?}"),
            }
            send_server(&mut ws, &ServerMessage::Subscribed { uid: "u1".into() }).await;
            let document = SessionDocument {
                team_a: Some("Owls".into()),
                ..Default::default()
            };
            send_server(
                &mut ws,
                &ServerMessage::Snapshot {
                    document: Some(document),
                    acknowledged: None,
                },
            )
            .await;
            ws.close(None).await.unwrap();
        })
        .await;

        let mut store = WebSocketStore::connect_with_token(&url, "u1", Some("token".into()))
            .await
            .unwrap();
        let snapshot = store.next_snapshot().await.unwrap().unwrap();
        assert!(!snapshot.has_pending_writes);
        assert_eq!(snapshot.document.unwrap().team_a.as_deref(), Some("Owls"));
        assert!(store.next_snapshot().await.is_none());
    }

    #[tokio::test]
    async fn merge_is_pending_until_acknowledged() {
        let url = start_mock_gateway(|mut ws| async move {
            let _subscribe = read_client(&mut ws).await;
            send_server(
                &mut ws,
                &ServerMessage::Snapshot {
                    document: None,
                    acknowledged: None,
                },
            )
            .await;
            let ClientMessage::Merge { write_id, patch } = read_client(&mut ws).await else {
                panic!("expected Merge");
            };
            let mut document = SessionDocument::default();
            document.apply_patch(&patch, Some(42_000));
            send_server(
                &mut ws,
                &ServerMessage::Snapshot {
                    document: Some(document),
                    acknowledged: Some(write_id),
                },
            )
            .await;
            while let Some(Ok(_)) = ws.next().await {}
        })
        .await;

        let mut store = WebSocketStore::connect(&url, "u1").await.unwrap();
        let _baseline = store.next_snapshot().await.unwrap().unwrap();

        store
            .merge(SessionPatch {
                is_active: Some(true),
                started_at: Some(ServerTimestamp::new()),
                ..Default::default()
            })
            .await
            .unwrap();

        let pending = store.next_snapshot().await.unwrap().unwrap();
        assert!(pending.has_pending_writes);
        assert_eq!(pending.document.unwrap().started_at, None);

        let confirmed = store.next_snapshot().await.unwrap().unwrap();
        assert!(!confirmed.has_pending_writes);
        assert_eq!(confirmed.document.unwrap().started_at, Some(42_000));
        store.close().await.unwrap();
    }

    #[tokio::test]
    async fn rejected_write_rolls_back_overlay() {
        let url = start_mock_gateway(|mut ws| async move {
            let _subscribe = read_client(&mut ws).await;
            send_server(
                &mut ws,
                &ServerMessage::Snapshot {
                    document: Some(SessionDocument::default()),
                    acknowledged: None,
                },
            )
            .await;
            let ClientMessage::Merge { write_id, .. } = read_client(&mut ws).await else {
                panic!("expected Merge");
            };
            send_server(
                &mut ws,
                &ServerMessage::WriteRejected {
                    write_id,
                    message: "too large".into(),
                    error_code: Some(ErrorCode::DocumentTooLarge),
                },
            )
            .await;
            while let Some(Ok(_)) = ws.next().await {}
        })
        .await;

        let mut store = WebSocketStore::connect(&url, "u1").await.unwrap();
        let _baseline = store.next_snapshot().await.unwrap().unwrap();
        store
            .merge(SessionPatch {
                team_a: Some("x".repeat(64)),
                ..Default::default()
            })
            .await
            .unwrap();

        assert!(store.next_snapshot().await.unwrap().unwrap().has_pending_writes);
        let rolled_back = store.next_snapshot().await.unwrap().unwrap();
        assert!(!rolled_back.has_pending_writes);
        assert_eq!(rolled_back.document.unwrap().team_a, None);
        store.close().await.unwrap();
    }

    #[tokio::test]
    async fn gateway_error_is_reported() {
        let url = start_mock_gateway(|mut ws| async move {
            let _subscribe = read_client(&mut ws).await;
            send_server(
                &mut ws,
                &ServerMessage::Error {
                    message: "denied".into(),
                    error_code: Some(ErrorCode::PermissionDenied),
                },
            )
            .await;
            while let Some(Ok(_)) = ws.next().await {}
        })
        .await;

        let mut store = WebSocketStore::connect(&url, "u1").await.unwrap();
        let err = store.next_snapshot().await.unwrap().unwrap_err();
        assert!(matches!(
            err,
            SyncError::Backend {
                error_code: Some(ErrorCode::PermissionDenied),
                ..
            }
        ));
    }

    #[tokio::test]
    async fn malformed_frames_are_skipped() {
        let url = start_mock_gateway(|mut ws| async move {
            let _subscribe = read_client(&mut ws).await;
            ws.send(Message::Text("not json".into())).await.unwrap();
            ws.send(Message::Binary(vec![0xDE, 0xAD].into()))
                .await
                .unwrap();
            send_server(
                &mut ws,
                &ServerMessage::Snapshot {
                    document: None,
                    acknowledged: None,
                },
            )
            .await;
            ws.close(None).await.unwrap();
        })
        .await;

        let mut store = WebSocketStore::connect(&url, "u1").await.unwrap();
        let snapshot = store.next_snapshot().await.unwrap().unwrap();
        assert_eq!(snapshot, Snapshot::confirmed(None));
    }

    #[tokio::test]
    async fn close_is_idempotent_and_blocks_writes() {
        let url =
            start_mock_gateway(|mut ws| async move { while let Some(Ok(_)) = ws.next().await {} })
                .await;

        let mut store = WebSocketStore::connect(&url, "u1").await.unwrap();
        store.close().await.unwrap();
        store.close().await.unwrap();

        let err = store.merge(SessionPatch::default()).await.unwrap_err();
        assert!(matches!(err, SyncError::StoreClosed));
        assert!(store.next_snapshot().await.is_none());
    }
}
