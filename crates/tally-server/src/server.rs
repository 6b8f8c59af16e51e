//! WebSocket accept loop and per-connection frame dispatch.

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::handshake::server::{
    Request as UpgradeRequest, Response as UpgradeResponse,
};
use tokio_tungstenite::{accept_hdr_async, tungstenite::Message};
use tracing::{debug, error, info, warn};

use tally_bus::BusError;
use tally_proto::{Envelope, Frame, ENTITY_SERVER};

use crate::auth::SessionAuth;
use crate::error::ServerError;
use crate::registry::{Connection, ConnectionRegistry};
use crate::sync::SyncEngine;

/// Routes application-specific frames (anything that is not heartbeat or
/// sync protocol) into the command/query buses.
///
/// A `Validation` failure is turned into an `error_validation` reply to
/// the originating socket; any other failure is logged and dropped.
#[async_trait]
pub trait InboundRouter: Send + Sync {
    async fn route(&self, conn: &Arc<Connection>, envelope: Envelope) -> Result<(), BusError>;
}

/// Router that accepts nothing; unroutable frames are logged and dropped.
pub struct NullRouter;

#[async_trait]
impl InboundRouter for NullRouter {
    async fn route(&self, conn: &Arc<Connection>, envelope: Envelope) -> Result<(), BusError> {
        debug!(
            user = %conn.user_id,
            entity = %envelope.entity,
            kind = %envelope.kind,
            "dropping unroutable frame"
        );
        Ok(())
    }
}

/// The Tally sync WebSocket server.
pub struct WsServer {
    listener: TcpListener,
    registry: Arc<ConnectionRegistry>,
    sync: Arc<SyncEngine>,
    auth: Arc<dyn SessionAuth>,
    router: Arc<dyn InboundRouter>,
}

impl WsServer {
    /// Binds the listener. Use port 0 to let the OS pick one.
    pub async fn bind(
        addr: SocketAddr,
        registry: Arc<ConnectionRegistry>,
        sync: Arc<SyncEngine>,
        auth: Arc<dyn SessionAuth>,
        router: Arc<dyn InboundRouter>,
    ) -> Result<Self, ServerError> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self {
            listener,
            registry,
            sync,
            auth,
            router,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, ServerError> {
        Ok(self.listener.local_addr()?)
    }

    /// Accepts connections forever, one spawned task per socket.
    pub async fn run(&self) -> Result<(), ServerError> {
        info!("tally sync server listening on {}", self.local_addr()?);

        loop {
            match self.listener.accept().await {
                Ok((stream, addr)) => {
                    debug!("new connection from {}", addr);
                    let registry = self.registry.clone();
                    let sync = self.sync.clone();
                    let auth = self.auth.clone();
                    let router = self.router.clone();
                    tokio::spawn(async move {
                        if let Err(e) =
                            handle_connection(stream, addr, registry, sync, auth, router).await
                        {
                            warn!("connection error from {}: {}", addr, e);
                        }
                    });
                }
                Err(e) => {
                    error!("accept error: {}", e);
                }
            }
        }
    }
}

/// Handles one socket from upgrade to close.
async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    registry: Arc<ConnectionRegistry>,
    sync: Arc<SyncEngine>,
    auth: Arc<dyn SessionAuth>,
    router: Arc<dyn InboundRouter>,
) -> Result<(), ServerError> {
    let mut token: Option<String> = None;
    let ws_stream = accept_hdr_async(stream, |req: &UpgradeRequest, resp: UpgradeResponse| {
        token = token_from_query(req.uri().query());
        Ok(resp)
    })
    .await?;

    // Session validation happens before the socket enters the registry.
    let user_id = match auth.resolve(token.as_deref()).await {
        Ok(user_id) => user_id,
        Err(e) => {
            warn!("rejecting connection from {}: {}", addr, e);
            return Ok(());
        }
    };

    let (mut write, mut read) = ws_stream.split();
    let (outbox, mut outbox_rx) = mpsc::unbounded_channel::<Envelope>();

    // Writer task: drains the outbox into the socket. Everything that
    // wants to reach this client goes through the outbox sender.
    let writer = tokio::spawn(async move {
        while let Some(envelope) = outbox_rx.recv().await {
            let text = match serde_json::to_string(&envelope) {
                Ok(text) => text,
                Err(e) => {
                    warn!("failed to encode frame: {}", e);
                    continue;
                }
            };
            if write.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
    });

    let conn = registry.opened(user_id, outbox).await;
    info!(user = %conn.user_id, "websocket connection established with {}", addr);

    while let Some(msg) = read.next().await {
        let msg = match msg {
            Ok(m) => m,
            Err(e) => {
                warn!("message error from {}: {}", addr, e);
                break;
            }
        };

        match msg {
            Message::Text(text) => {
                handle_text(&text, &conn, &sync, &router).await;
            }
            Message::Close(_) => {
                debug!("client {} disconnected", addr);
                break;
            }
            _ => {}
        }
    }

    registry.closed(conn.id).await;
    writer.abort();
    info!("connection closed: {}", addr);
    Ok(())
}

/// Decodes and dispatches one inbound text frame.
///
/// Malformed frames are logged and dropped; they never tear down the
/// connection.
async fn handle_text(
    text: &str,
    conn: &Arc<Connection>,
    sync: &SyncEngine,
    router: &Arc<dyn InboundRouter>,
) {
    let envelope = match Envelope::decode(text) {
        Ok(envelope) => envelope,
        Err(e) => {
            warn!(user = %conn.user_id, "dropping malformed frame: {}", e);
            return;
        }
    };

    let frame = match Frame::parse(&envelope) {
        Ok(frame) => frame,
        Err(e) => {
            warn!(user = %conn.user_id, "dropping undecodable frame: {}", e);
            return;
        }
    };

    match frame {
        Frame::Ping => conn.send(Envelope::pong(ENTITY_SERVER)),
        Frame::Pong { .. } => {}
        Frame::SyncStart { since } => {
            if let Err(e) = sync.sync_data(conn, since).await {
                // No sync_finished goes out; the client retries from its
                // persisted cursor on the next cycle.
                warn!(user = %conn.user_id, "sync stream aborted: {}", e);
            }
        }
        _ => match router.route(conn, envelope.clone()).await {
            Ok(()) => {}
            Err(BusError::Validation { message, details }) => {
                let mut reply = Envelope::error_validation(message, details);
                reply.ack_id = envelope.ack_id;
                conn.send(reply);
            }
            Err(e) => {
                warn!(user = %conn.user_id, entity = %envelope.entity, "command failed: {}", e);
            }
        },
    }
}

fn token_from_query(query: Option<&str>) -> Option<String> {
    query?
        .split('&')
        .find_map(|pair| pair.strip_prefix("token="))
        .filter(|token| !token.is_empty())
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::StaticTokenAuth;
    use crate::registry::RegistryConfig;
    use crate::store::MemoryCollection;
    use chrono::Utc;
    use serde_json::json;
    use std::time::Duration;
    use tally_proto::MessageType;
    use tokio_tungstenite::connect_async;

    #[test]
    fn test_token_from_query() {
        assert_eq!(token_from_query(Some("token=abc")), Some("abc".into()));
        assert_eq!(
            token_from_query(Some("v=2&token=abc&x=1")),
            Some("abc".into())
        );
        assert_eq!(token_from_query(Some("v=2")), None);
        assert_eq!(token_from_query(Some("token=")), None);
        assert_eq!(token_from_query(None), None);
    }

    async fn spawn_server() -> SocketAddr {
        let accounts = Arc::new(MemoryCollection::new("account"));
        for i in 0..3 {
            accounts.insert(json!({"id": i})).await;
        }
        let transactions = Arc::new(MemoryCollection::new("transaction"));
        for i in 0..5 {
            transactions.insert(json!({"id": i})).await;
        }

        let registry = Arc::new(ConnectionRegistry::new(RegistryConfig {
            heartbeat_interval: Duration::from_secs(3600),
        }));
        let sync = Arc::new(SyncEngine::new(vec![accounts, transactions]));
        let auth = Arc::new(StaticTokenAuth::new([(
            "t1".to_string(),
            "user-1".to_string(),
        )]));
        let server = WsServer::bind(
            "127.0.0.1:0".parse().unwrap(),
            registry,
            sync,
            auth,
            Arc::new(NullRouter),
        )
        .await
        .unwrap();
        let addr = server.local_addr().unwrap();
        tokio::spawn(async move {
            let _ = server.run().await;
        });
        addr
    }

    #[tokio::test]
    async fn test_full_sync_over_websocket() {
        let addr = spawn_server().await;
        let before = Utc::now();

        let (mut ws, _) = connect_async(format!("ws://{addr}/?token=t1"))
            .await
            .unwrap();
        let request = serde_json::to_string(&Envelope::sync_start(None)).unwrap();
        ws.send(Message::Text(request)).await.unwrap();

        let mut lists = Vec::new();
        let cursor = loop {
            let msg = tokio::time::timeout(Duration::from_secs(5), ws.next())
                .await
                .expect("server went quiet mid-sync")
                .unwrap()
                .unwrap();
            let Message::Text(text) = msg else { continue };
            let envelope: Envelope = serde_json::from_str(&text).unwrap();
            match Frame::parse(&envelope).unwrap() {
                Frame::List { entity, records } => lists.push((entity, records.len())),
                Frame::SyncFinished { cursor } => break cursor,
                _ => {}
            }
        };

        assert_eq!(
            lists,
            vec![("account".to_string(), 3), ("transaction".to_string(), 5)]
        );
        assert!(cursor.timestamp_millis() >= before.timestamp_millis());
    }

    #[tokio::test]
    async fn test_envelope_ping_gets_pong() {
        let addr = spawn_server().await;
        let (mut ws, _) = connect_async(format!("ws://{addr}/?token=t1"))
            .await
            .unwrap();

        let ping = serde_json::to_string(&Envelope::ping("client")).unwrap();
        ws.send(Message::Text(ping)).await.unwrap();

        loop {
            let msg = tokio::time::timeout(Duration::from_secs(5), ws.next())
                .await
                .expect("no pong")
                .unwrap()
                .unwrap();
            if let Message::Text(text) = msg {
                let envelope: Envelope = serde_json::from_str(&text).unwrap();
                assert_eq!(envelope.kind, MessageType::Pong);
                assert_eq!(envelope.entity, ENTITY_SERVER);
                break;
            }
        }
    }

    #[tokio::test]
    async fn test_unknown_token_is_rejected() {
        let addr = spawn_server().await;
        let (mut ws, _) = connect_async(format!("ws://{addr}/?token=bogus"))
            .await
            .unwrap();

        // The server drops the socket right after the handshake.
        let next = tokio::time::timeout(Duration::from_secs(5), ws.next())
            .await
            .expect("expected the server to close the socket");
        match next {
            None | Some(Ok(Message::Close(_))) | Some(Err(_)) => {}
            Some(Ok(other)) => panic!("unexpected frame: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_malformed_frame_does_not_kill_connection() {
        let addr = spawn_server().await;
        let (mut ws, _) = connect_async(format!("ws://{addr}/?token=t1"))
            .await
            .unwrap();

        ws.send(Message::Text("{not json".into())).await.unwrap();

        // Connection still answers pings afterwards.
        let ping = serde_json::to_string(&Envelope::ping("client")).unwrap();
        ws.send(Message::Text(ping)).await.unwrap();
        loop {
            let msg = tokio::time::timeout(Duration::from_secs(5), ws.next())
                .await
                .expect("connection died on malformed frame")
                .unwrap()
                .unwrap();
            if let Message::Text(text) = msg {
                let envelope: Envelope = serde_json::from_str(&text).unwrap();
                if envelope.kind == MessageType::Pong {
                    break;
                }
            }
        }
    }
}
