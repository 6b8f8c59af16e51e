//! Client connection lifecycle, heartbeat, acknowledgment correlation and
//! inbound dispatch.

use chrono::{DateTime, Utc};
use futures_util::{SinkExt, StreamExt};
use rand::Rng;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc, Notify};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, trace, warn};
use uuid::Uuid;

use tally_proto::{Envelope, Frame, ENTITY_CLIENT, ENTITY_SERVER};

use crate::config::ClientConfig;
use crate::cursor::{CursorStore, MemoryCursorStore};
use crate::error::ClientError;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type AckCallback = Arc<dyn Fn(&Envelope) + Send + Sync>;

/// Connection lifecycle state. The reconnect loop is a parallel flag, not
/// a state: the manager can be `Disconnected` with a retry already armed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// A registered reply callback waiting for a frame that echoes its ack id.
struct PendingAck {
    single_use: bool,
    callback: AckCallback,
}

/// Owns the socket lifecycle for one client session.
///
/// All callbacks, the heartbeat and the reconnect timer run on the tokio
/// runtime the manager was created on; the manager itself never blocks
/// its caller.
pub struct ConnectionManager {
    inner: Arc<Inner>,
}

struct Inner {
    config: ClientConfig,
    state: Mutex<ConnectionState>,
    connected_at: Mutex<Option<DateTime<Utc>>>,
    outbound: Mutex<Option<mpsc::UnboundedSender<Envelope>>>,
    pending: Mutex<HashMap<String, PendingAck>>,
    events: broadcast::Sender<Envelope>,
    cursor: Box<dyn CursorStore>,
    pong_signal: Notify,
    /// Per-connection close latch, replaced on every successful connect so
    /// a stale force-close cannot leak into the next connection.
    close_signal: Mutex<Arc<Notify>>,
    sync_in_flight: AtomicBool,
    reconnect_armed: AtomicBool,
    shutdown: AtomicBool,
}

impl ConnectionManager {
    pub fn new(config: ClientConfig) -> Self {
        Self::with_cursor_store(config, Box::new(MemoryCursorStore::default()))
    }

    /// Builds a manager with durable cursor storage.
    pub fn with_cursor_store(config: ClientConfig, cursor: Box<dyn CursorStore>) -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            inner: Arc::new(Inner {
                config,
                state: Mutex::new(ConnectionState::Disconnected),
                connected_at: Mutex::new(None),
                outbound: Mutex::new(None),
                pending: Mutex::new(HashMap::new()),
                events,
                cursor,
                pong_signal: Notify::new(),
                close_signal: Mutex::new(Arc::new(Notify::new())),
                sync_in_flight: AtomicBool::new(false),
                reconnect_armed: AtomicBool::new(false),
                shutdown: AtomicBool::new(false),
            }),
        }
    }

    /// Opens the transport. A no-op while already connecting or connected,
    /// so calling it twice in quick succession yields one socket.
    pub fn connect(&self) {
        self.inner.shutdown.store(false, Ordering::SeqCst);
        {
            let mut state = self.inner.state.lock().unwrap();
            if *state != ConnectionState::Disconnected {
                return;
            }
            *state = ConnectionState::Connecting;
        }
        Inner::spawn_connection(self.inner.clone());
    }

    /// Cleanly closes the transport and disarms the reconnect loop.
    pub fn disconnect(&self) {
        self.inner.shutdown.store(true, Ordering::SeqCst);
        self.inner.close_signal.lock().unwrap().notify_one();
    }

    pub fn state(&self) -> ConnectionState {
        *self.inner.state.lock().unwrap()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    pub fn connected_at(&self) -> Option<DateTime<Utc>> {
        *self.inner.connected_at.lock().unwrap()
    }

    /// The last fully synchronized moment, advanced only on `sync finished`.
    pub fn sync_cursor(&self) -> Option<DateTime<Utc>> {
        self.inner.cursor.load()
    }

    pub fn is_sync_in_flight(&self) -> bool {
        self.inner.sync_in_flight.load(Ordering::SeqCst)
    }

    /// Subscribes to every inbound frame, heartbeat included. Entity
    /// mirrors filter for the entities they care about.
    pub fn subscribe(&self) -> broadcast::Receiver<Envelope> {
        self.inner.events.subscribe()
    }

    /// Queues a frame for the server. Returns `false` (dropping the frame)
    /// while disconnected; commands issued offline would race the re-sync
    /// if replayed later.
    pub fn send(&self, envelope: Envelope) -> bool {
        self.inner.send(envelope)
    }

    /// Sends a frame that expects a correlated reply. A fresh ack id is
    /// attached and returned; the callback runs once, when the first frame
    /// echoing that id arrives, and the entry expires silently after
    /// `ack_timeout` otherwise. Returns `None` if the frame was dropped.
    pub fn request<F>(&self, envelope: Envelope, callback: F) -> Option<String>
    where
        F: Fn(&Envelope) + Send + Sync + 'static,
    {
        self.register_and_send(envelope, true, Arc::new(callback))
    }

    /// Like [`request`](Self::request), but the callback stays registered
    /// and fires for every frame echoing the id - for observing a
    /// server-driven stream.
    pub fn observe<F>(&self, envelope: Envelope, callback: F) -> Option<String>
    where
        F: Fn(&Envelope) + Send + Sync + 'static,
    {
        self.register_and_send(envelope, false, Arc::new(callback))
    }

    fn register_and_send(
        &self,
        mut envelope: Envelope,
        single_use: bool,
        callback: AckCallback,
    ) -> Option<String> {
        let ack_id = Uuid::new_v4().to_string();
        envelope.ack_id = Some(ack_id.clone());
        self.inner.pending.lock().unwrap().insert(
            ack_id.clone(),
            PendingAck {
                single_use,
                callback,
            },
        );

        if single_use {
            let inner = self.inner.clone();
            let expired = ack_id.clone();
            tokio::spawn(async move {
                tokio::time::sleep(inner.config.ack_timeout).await;
                if inner.pending.lock().unwrap().remove(&expired).is_some() {
                    trace!(ack_id = %expired, "pending acknowledgment expired");
                }
            });
        }

        if !self.inner.send(envelope) {
            self.inner.pending.lock().unwrap().remove(&ack_id);
            return None;
        }
        Some(ack_id)
    }
}

impl Inner {
    fn spawn_connection(inner: Arc<Inner>) {
        tokio::spawn(async move {
            match Inner::establish(&inner).await {
                Ok(ws) => Inner::serve(inner, ws).await,
                Err(e) => {
                    warn!("connection attempt failed: {}", e);
                    *inner.state.lock().unwrap() = ConnectionState::Disconnected;
                    if !inner.shutdown.load(Ordering::SeqCst) {
                        inner.schedule_reconnect();
                    }
                }
            }
        });
    }

    /// One connection attempt, bounded by the attempt timeout.
    async fn establish(inner: &Arc<Inner>) -> Result<WsStream, ClientError> {
        let attempt = connect_async(inner.config.url.as_str());
        match tokio::time::timeout(inner.config.connect_timeout, attempt).await {
            Ok(Ok((ws, _response))) => Ok(ws),
            Ok(Err(e)) => Err(ClientError::Transport(e)),
            Err(_) => Err(ClientError::ConnectTimeout),
        }
    }

    /// Runs one established connection to completion. The single teardown
    /// site at the end is reached from every exit: server close, transport
    /// error, pong timeout and user disconnect all funnel through here.
    async fn serve(inner: Arc<Inner>, ws: WsStream) {
        let close = Arc::new(Notify::new());
        *inner.close_signal.lock().unwrap() = close.clone();
        if inner.shutdown.load(Ordering::SeqCst) {
            *inner.state.lock().unwrap() = ConnectionState::Disconnected;
            return;
        }

        let (mut write, mut read) = ws.split();
        let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<Envelope>();
        *inner.outbound.lock().unwrap() = Some(outbound_tx);
        *inner.state.lock().unwrap() = ConnectionState::Connected;
        *inner.connected_at.lock().unwrap() = Some(Utc::now());
        debug!("connected to {}", inner.config.url);

        let writer = tokio::spawn(async move {
            while let Some(envelope) = outbound_rx.recv().await {
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

        let heartbeat = tokio::spawn(Inner::run_heartbeat(inner.clone(), close.clone()));

        inner.request_sync();

        loop {
            tokio::select! {
                _ = close.notified() => break,
                frame = read.next() => match frame {
                    Some(Ok(Message::Text(text))) => inner.handle_inbound(&text),
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        warn!("transport error: {}", e);
                        break;
                    }
                },
            }
        }

        writer.abort();
        heartbeat.abort();
        *inner.outbound.lock().unwrap() = None;
        // A sync cut short never advances the cursor; the next connect
        // re-requests from the same persisted value.
        inner.sync_in_flight.store(false, Ordering::SeqCst);
        *inner.state.lock().unwrap() = ConnectionState::Disconnected;
        debug!("disconnected from {}", inner.config.url);

        if !inner.shutdown.load(Ordering::SeqCst) {
            inner.schedule_reconnect();
        }
    }

    /// Sends a `ping` on every heartbeat tick and waits for the matching
    /// `pong`. The pong deadline is the sole liveness detector; the
    /// transport's close event alone is not trusted because some failures
    /// leave the socket half-open.
    async fn run_heartbeat(inner: Arc<Inner>, close: Arc<Notify>) {
        let mut ticker = tokio::time::interval(inner.config.heartbeat_interval);
        ticker.tick().await; // the first tick completes immediately
        loop {
            ticker.tick().await;
            if !inner.send(Envelope::ping(ENTITY_CLIENT)) {
                break;
            }
            let deadline =
                tokio::time::timeout(inner.config.pong_timeout, inner.pong_signal.notified());
            if deadline.await.is_err() {
                warn!("pong deadline missed, forcing reconnect");
                close.notify_one();
                break;
            }
        }
    }

    fn send(&self, envelope: Envelope) -> bool {
        let outbound = self.outbound.lock().unwrap();
        match outbound.as_ref() {
            Some(tx) => tx.send(envelope).is_ok(),
            None => {
                debug!("dropping outbound frame while disconnected");
                false
            }
        }
    }

    /// Kicks off a sync cycle from the last persisted cursor.
    fn request_sync(&self) {
        let since = self.cursor.load();
        self.sync_in_flight.store(true, Ordering::SeqCst);
        self.send(Envelope::sync_start(since));
    }

    /// Arms the reconnect loop. Idempotent: while a loop is armed, further
    /// calls are no-ops. The loop retries on a jittered interval until a
    /// connection is established or the manager shuts down.
    fn schedule_reconnect(self: &Arc<Self>) {
        if self.reconnect_armed.swap(true, Ordering::SeqCst) {
            return;
        }
        let inner = self.clone();
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(reconnect_delay(&inner.config)).await;
                if inner.shutdown.load(Ordering::SeqCst) {
                    inner.reconnect_armed.store(false, Ordering::SeqCst);
                    break;
                }
                {
                    let mut state = inner.state.lock().unwrap();
                    match *state {
                        // Someone else connected in the meantime.
                        ConnectionState::Connected | ConnectionState::Connecting => {
                            inner.reconnect_armed.store(false, Ordering::SeqCst);
                            break;
                        }
                        ConnectionState::Disconnected => {
                            *state = ConnectionState::Connecting;
                        }
                    }
                }
                match Inner::establish(&inner).await {
                    Ok(ws) => {
                        inner.reconnect_armed.store(false, Ordering::SeqCst);
                        let serve_inner = inner.clone();
                        tokio::spawn(async move {
                            Inner::serve(serve_inner, ws).await;
                        });
                        break;
                    }
                    Err(e) => {
                        debug!("reconnect attempt failed: {}", e);
                        *inner.state.lock().unwrap() = ConnectionState::Disconnected;
                    }
                }
            }
        });
    }

    /// Decodes and dispatches one inbound frame. Malformed frames are
    /// logged and dropped; nothing inbound can crash the manager.
    fn handle_inbound(&self, text: &str) {
        let envelope = match Envelope::decode(text) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!("dropping malformed frame: {}", e);
                return;
            }
        };

        // Acknowledgment correlation runs first, before any typed
        // dispatch; unmatched ids are not an error.
        if let Some(ack_id) = envelope.ack_id.as_deref() {
            let callback = {
                let mut pending = self.pending.lock().unwrap();
                match pending.get(ack_id).map(|entry| entry.single_use) {
                    Some(true) => pending.remove(ack_id).map(|entry| entry.callback),
                    Some(false) => pending.get(ack_id).map(|entry| entry.callback.clone()),
                    None => None,
                }
            };
            if let Some(callback) = callback {
                callback(&envelope);
            }
        }

        match Frame::parse(&envelope) {
            Ok(Frame::Ping) => {
                self.send(Envelope::pong(ENTITY_CLIENT));
            }
            Ok(Frame::Pong { from }) if from == ENTITY_SERVER => {
                self.pong_signal.notify_one();
            }
            Ok(Frame::SyncFinished { cursor }) => {
                self.cursor.save(cursor);
                self.sync_in_flight.store(false, Ordering::SeqCst);
                debug!(cursor = %cursor, "sync cycle complete");
            }
            Ok(Frame::ErrorValidation { message, .. }) => {
                debug!("server rejected a request: {}", message);
            }
            Ok(_) => {}
            Err(e) => {
                warn!("dropping undecodable frame: {}", e);
                return;
            }
        }

        // Every frame is rebroadcast so entity mirrors can update
        // themselves independently of the transport bookkeeping.
        let _ = self.events.send(envelope);
    }
}

fn reconnect_delay(config: &ClientConfig) -> Duration {
    let min = config.reconnect_min.as_millis() as u64;
    let max = config.reconnect_max.as_millis() as u64;
    if max <= min {
        return config.reconnect_min;
    }
    Duration::from_millis(rand::thread_rng().gen_range(min..=max))
}
