//! Live connection tracking and frame delivery.

use chrono::{DateTime, Utc};
use futures_util::future::BoxFuture;
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, trace};
use uuid::Uuid;

use tally_proto::{ChangeKind, Envelope, MessageType, ENTITY_SERVER};

/// Authenticated user identity, resolved before `opened` is called.
pub type UserId = String;

/// Registry tunables. Tests shrink the heartbeat to milliseconds.
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// Interval between server-side `ping` frames per connection.
    pub heartbeat_interval: Duration,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(30),
        }
    }
}

/// A live socket paired with its authenticated user.
///
/// Owned by the [`ConnectionRegistry`] from transport upgrade to close.
/// The heartbeat task handle is owned here so cancellation is reachable
/// from both the normal-close and error paths.
pub struct Connection {
    pub id: Uuid,
    pub user_id: UserId,
    pub created_at: DateTime<Utc>,
    outbox: mpsc::UnboundedSender<Envelope>,
    heartbeat: StdMutex<Option<JoinHandle<()>>>,
}

impl Connection {
    /// Queues a frame for this socket. A closed socket drops the frame
    /// silently; delivery failures are never surfaced to the caller.
    pub fn send(&self, envelope: Envelope) {
        if self.outbox.send(envelope).is_err() {
            trace!(connection = %self.id, "dropped frame for closed socket");
        }
    }

    /// Idempotent heartbeat cancellation.
    fn stop_heartbeat(&self) {
        if let Some(handle) = self.heartbeat.lock().unwrap().take() {
            handle.abort();
        }
    }
}

type OpenHook = Box<dyn Fn(Arc<Connection>) -> BoxFuture<'static, ()> + Send + Sync>;

#[derive(Default)]
struct Indices {
    connections: HashMap<Uuid, Arc<Connection>>,
    by_user: HashMap<UserId, Vec<Uuid>>,
}

/// Tracks every live connection, indexed globally and per user.
///
/// The two indices are mutated only by [`opened`](Self::opened) and
/// [`closed`](Self::closed), each a single critical section; everything
/// else takes read-only snapshots.
#[derive(Default)]
pub struct ConnectionRegistry {
    config: RegistryConfig,
    inner: RwLock<Indices>,
    open_hooks: StdMutex<Vec<OpenHook>>,
}

/// Delivery target for [`ConnectionRegistry::send`].
#[derive(Debug, Clone)]
pub enum Recipient {
    /// One specific socket; a no-op if it is no longer open.
    Connection(Uuid),
    /// Every open socket of one user.
    User(UserId),
    /// Every live socket.
    Everyone,
}

impl ConnectionRegistry {
    pub fn new(config: RegistryConfig) -> Self {
        Self {
            config,
            inner: RwLock::new(Indices::default()),
            open_hooks: StdMutex::new(Vec::new()),
        }
    }

    /// Registers a callback invoked after each connection is opened, so
    /// other subsystems (an initial sync, for instance) can react.
    /// Populated once at startup.
    pub fn on_open<F, Fut>(&self, hook: F)
    where
        F: Fn(Arc<Connection>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.open_hooks
            .lock()
            .unwrap()
            .push(Box::new(move |conn| Box::pin(hook(conn))));
    }

    /// Admits an authenticated socket: wraps it into a [`Connection`],
    /// records it in both indices, starts the recurring heartbeat, tells
    /// any sibling sockets of the same user that a device connected, and
    /// runs the registered open hooks.
    pub async fn opened(
        &self,
        user_id: UserId,
        outbox: mpsc::UnboundedSender<Envelope>,
    ) -> Arc<Connection> {
        let heartbeat = tokio::spawn(run_heartbeat(
            outbox.clone(),
            self.config.heartbeat_interval,
        ));
        let conn = Arc::new(Connection {
            id: Uuid::new_v4(),
            user_id: user_id.clone(),
            created_at: Utc::now(),
            outbox,
            heartbeat: StdMutex::new(Some(heartbeat)),
        });

        let siblings = {
            let mut inner = self.inner.write().await;
            let siblings: Vec<_> = inner
                .by_user
                .get(&user_id)
                .into_iter()
                .flatten()
                .filter_map(|id| inner.connections.get(id).cloned())
                .collect();
            inner.connections.insert(conn.id, conn.clone());
            inner.by_user.entry(user_id).or_default().push(conn.id);
            siblings
        };

        for sibling in siblings {
            sibling.send(sibling_notice("connected", &conn.user_id));
        }

        debug!(connection = %conn.id, user = %conn.user_id, "connection opened");

        let hooks: Vec<BoxFuture<'static, ()>> = {
            let hooks = self.open_hooks.lock().unwrap();
            hooks.iter().map(|hook| hook(conn.clone())).collect()
        };
        for hook in hooks {
            hook.await;
        }

        conn
    }

    /// Removes a connection: cancels its heartbeat, drops it from both
    /// indices, and tells the user's remaining sockets that a device
    /// disconnected. Safe to call for an id that is already gone.
    pub async fn closed(&self, id: Uuid) {
        let (conn, siblings) = {
            let mut inner = self.inner.write().await;
            let Some(conn) = inner.connections.remove(&id) else {
                return;
            };
            if let Some(ids) = inner.by_user.get_mut(&conn.user_id) {
                ids.retain(|other| *other != id);
                if ids.is_empty() {
                    inner.by_user.remove(&conn.user_id);
                }
            }
            let siblings: Vec<_> = inner
                .by_user
                .get(&conn.user_id)
                .into_iter()
                .flatten()
                .filter_map(|id| inner.connections.get(id).cloned())
                .collect();
            (conn, siblings)
        };

        conn.stop_heartbeat();
        for sibling in siblings {
            sibling.send(sibling_notice("disconnected", &conn.user_id));
        }
        debug!(connection = %id, user = %conn.user_id, "connection closed");
    }

    /// Delivers a frame to one socket, one user's sockets, or everyone.
    /// Closed sockets are skipped silently.
    pub async fn send(&self, to: Recipient, envelope: Envelope) {
        let targets: Vec<Arc<Connection>> = {
            let inner = self.inner.read().await;
            match &to {
                Recipient::Connection(id) => {
                    inner.connections.get(id).cloned().into_iter().collect()
                }
                Recipient::User(user_id) => inner
                    .by_user
                    .get(user_id)
                    .into_iter()
                    .flatten()
                    .filter_map(|id| inner.connections.get(id).cloned())
                    .collect(),
                Recipient::Everyone => inner.connections.values().cloned().collect(),
            }
        };

        for conn in targets {
            conn.send(envelope.clone());
        }
    }

    /// Pushes a `created`/`updated`/`deleted` frame for a changed entity.
    ///
    /// Broadcasts to every live socket, matching the upstream behavior.
    /// Callers that can resolve the owning users should prefer
    /// [`notify_users`](Self::notify_users) to scope delivery.
    pub async fn on_model_change(
        &self,
        entity: &str,
        records: Vec<Value>,
        kind: ChangeKind,
        ack_id: Option<String>,
    ) {
        let envelope = change_envelope(entity, records, kind, ack_id);
        self.send(Recipient::Everyone, envelope).await;
    }

    /// Targeted variant of [`on_model_change`](Self::on_model_change):
    /// delivers the change only to the given users' sockets.
    pub async fn notify_users(
        &self,
        users: &[UserId],
        entity: &str,
        records: Vec<Value>,
        kind: ChangeKind,
        ack_id: Option<String>,
    ) {
        let envelope = change_envelope(entity, records, kind, ack_id);
        for user in users {
            self.send(Recipient::User(user.clone()), envelope.clone())
                .await;
        }
    }

    /// Number of live connections.
    pub async fn connection_count(&self) -> usize {
        self.inner.read().await.connections.len()
    }

    /// Number of live connections for one user.
    pub async fn user_connection_count(&self, user_id: &str) -> usize {
        self.inner
            .read()
            .await
            .by_user
            .get(user_id)
            .map_or(0, Vec::len)
    }
}

fn change_envelope(
    entity: &str,
    records: Vec<Value>,
    kind: ChangeKind,
    ack_id: Option<String>,
) -> Envelope {
    let envelope = Envelope::change(entity, kind, records);
    match ack_id {
        Some(id) => envelope.with_ack_id(id),
        None => envelope,
    }
}

fn sibling_notice(kind: &str, user_id: &str) -> Envelope {
    let mut env = Envelope::new(ENTITY_SERVER, MessageType::Other(kind.to_string()));
    env.payload = vec![serde_json::json!(user_id)];
    env
}

async fn run_heartbeat(outbox: mpsc::UnboundedSender<Envelope>, period: Duration) {
    let mut ticker = tokio::time::interval(period);
    ticker.tick().await; // the first tick completes immediately
    loop {
        ticker.tick().await;
        if outbox.send(Envelope::ping(ENTITY_SERVER)).is_err() {
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Arc;
    use tally_proto::Frame;

    fn test_registry(heartbeat_ms: u64) -> ConnectionRegistry {
        ConnectionRegistry::new(RegistryConfig {
            heartbeat_interval: Duration::from_millis(heartbeat_ms),
        })
    }

    #[tokio::test]
    async fn test_opened_indexes_and_closed_removes() {
        let registry = test_registry(60_000);
        let (tx, _rx) = mpsc::unbounded_channel();
        let conn = registry.opened("user-1".into(), tx).await;

        assert_eq!(registry.connection_count().await, 1);
        assert_eq!(registry.user_connection_count("user-1").await, 1);

        registry.closed(conn.id).await;
        assert_eq!(registry.connection_count().await, 0);
        assert_eq!(registry.user_connection_count("user-1").await, 0);

        // closing twice is harmless
        registry.closed(conn.id).await;
    }

    #[tokio::test]
    async fn test_sibling_notified_on_connect_and_disconnect() {
        let registry = test_registry(60_000);
        let (tx1, mut rx1) = mpsc::unbounded_channel();
        let _first = registry.opened("user-1".into(), tx1).await;

        let (tx2, _rx2) = mpsc::unbounded_channel();
        let second = registry.opened("user-1".into(), tx2).await;

        let notice = rx1.recv().await.unwrap();
        assert_eq!(notice.entity, ENTITY_SERVER);
        assert_eq!(notice.kind, MessageType::Other("connected".into()));

        registry.closed(second.id).await;
        let notice = rx1.recv().await.unwrap();
        assert_eq!(notice.kind, MessageType::Other("disconnected".into()));
    }

    #[tokio::test]
    async fn test_send_modes() {
        let registry = test_registry(60_000);
        let (tx1, mut rx1) = mpsc::unbounded_channel();
        let conn1 = registry.opened("user-1".into(), tx1).await;
        let (tx2, mut rx2) = mpsc::unbounded_channel();
        let _conn2 = registry.opened("user-2".into(), tx2).await;

        registry
            .send(
                Recipient::Connection(conn1.id),
                Envelope::list("account", vec![]),
            )
            .await;
        assert_eq!(rx1.recv().await.unwrap().entity, "account");

        registry
            .send(
                Recipient::User("user-2".into()),
                Envelope::list("category", vec![]),
            )
            .await;
        assert_eq!(rx2.recv().await.unwrap().entity, "category");
        assert!(rx1.try_recv().is_err());

        registry
            .send(Recipient::Everyone, Envelope::ping(ENTITY_SERVER))
            .await;
        assert_eq!(rx1.recv().await.unwrap().kind, MessageType::Ping);
        assert_eq!(rx2.recv().await.unwrap().kind, MessageType::Ping);
    }

    #[tokio::test]
    async fn test_send_to_closed_socket_is_silent() {
        let registry = test_registry(60_000);
        let (tx, rx) = mpsc::unbounded_channel();
        let conn = registry.opened("user-1".into(), tx).await;
        drop(rx);

        // must not panic or error
        registry
            .send(Recipient::Connection(conn.id), Envelope::ping(ENTITY_SERVER))
            .await;
    }

    #[tokio::test]
    async fn test_on_model_change_reaches_every_socket_with_ack_id() {
        let registry = test_registry(60_000);
        let (tx1, mut rx1) = mpsc::unbounded_channel();
        let _c1 = registry.opened("user-1".into(), tx1).await;
        let (tx2, mut rx2) = mpsc::unbounded_channel();
        let _c2 = registry.opened("user-2".into(), tx2).await;

        registry
            .on_model_change(
                "account",
                vec![json!({"id": 1})],
                ChangeKind::Updated,
                Some("abc123".into()),
            )
            .await;

        for rx in [&mut rx1, &mut rx2] {
            let env = rx.recv().await.unwrap();
            assert_eq!(env.ack_id.as_deref(), Some("abc123"));
            match Frame::parse(&env).unwrap() {
                Frame::Change { entity, kind, .. } => {
                    assert_eq!(entity, "account");
                    assert_eq!(kind, ChangeKind::Updated);
                }
                other => panic!("unexpected frame: {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn test_notify_users_scopes_delivery() {
        let registry = test_registry(60_000);
        let (tx1, mut rx1) = mpsc::unbounded_channel();
        let _c1 = registry.opened("user-1".into(), tx1).await;
        let (tx2, mut rx2) = mpsc::unbounded_channel();
        let _c2 = registry.opened("user-2".into(), tx2).await;

        registry
            .notify_users(
                &["user-1".into()],
                "transaction",
                vec![json!({"id": 9})],
                ChangeKind::Created,
                None,
            )
            .await;

        assert_eq!(rx1.recv().await.unwrap().entity, "transaction");
        assert!(rx2.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_heartbeat_pings_until_closed() {
        let registry = test_registry(10);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let conn = registry.opened("user-1".into(), tx).await;

        let ping = tokio::time::timeout(Duration::from_millis(500), rx.recv())
            .await
            .expect("expected a heartbeat ping")
            .unwrap();
        assert_eq!(ping.kind, MessageType::Ping);
        assert_eq!(ping.entity, ENTITY_SERVER);

        registry.closed(conn.id).await;
    }

    #[tokio::test]
    async fn test_open_hooks_run_for_each_connection() {
        let registry = test_registry(60_000);
        let seen: Arc<std::sync::Mutex<Vec<UserId>>> = Arc::default();
        let seen_hook = seen.clone();
        registry.on_open(move |conn| {
            let seen = seen_hook.clone();
            async move {
                seen.lock().unwrap().push(conn.user_id.clone());
            }
        });

        let (tx, _rx) = mpsc::unbounded_channel();
        registry.opened("user-1".into(), tx).await;

        assert_eq!(*seen.lock().unwrap(), vec!["user-1".to_string()]);
    }
}
