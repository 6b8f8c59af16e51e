//! CLI command implementations and the demo bus wiring.
//!
//! `serve` stands up the full pipeline over an in-memory store: inbound
//! entity frames become commands, committed changes become events, and the
//! registered push handler fans them back out to every connected socket.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use tally_bus::{
    BusError, Command, CommandBus, CommandHandler, EventBus, Query, QueryBus, QueryHandler,
};
use tally_client::{ClientConfig, ConnectionManager};
use tally_proto::{ChangeKind, Envelope, Frame};
use tally_server::{
    AnonymousAuth, Connection, ConnectionRegistry, InboundRouter, MemoryCollection, ModelChanged,
    PushOnModelChange, RegistryConfig, SyncCollection, SyncEngine, WsServer,
};

/// The demo syncable entities.
const ENTITIES: [&str; 3] = ["account", "category", "transaction"];

// ─────────────────────────────────────────────────────────────────────────────
// Demo commands and queries
// ─────────────────────────────────────────────────────────────────────────────

/// Applies an entity mutation pushed up by a client.
struct RecordChange {
    entity: String,
    kind: ChangeKind,
    records: Vec<Value>,
    ack_id: Option<String>,
}

impl Command for RecordChange {
    type Output = ();
    const NAME: &'static str = "ModelRecordChange";
}

struct RecordChangeHandler {
    collections: HashMap<String, Arc<MemoryCollection>>,
    events: Arc<EventBus>,
}

#[async_trait]
impl CommandHandler<RecordChange> for RecordChangeHandler {
    async fn handle(&self, command: RecordChange) -> Result<(), BusError> {
        let Some(collection) = self.collections.get(&command.entity) else {
            return Err(BusError::validation(
                format!("unknown entity \"{}\"", command.entity),
                None,
            ));
        };

        // The demo store only materializes creations; updates and
        // deletions still fan out to the other connected clients.
        if command.kind == ChangeKind::Created {
            for record in &command.records {
                collection.insert(record.clone()).await;
            }
        }

        self.events
            .emit(&ModelChanged {
                entity: command.entity,
                kind: command.kind,
                records: command.records,
                ack_id: command.ack_id,
            })
            .await;
        Ok(())
    }
}

/// Read-only listing of one entity collection.
struct ListRecords {
    entity: String,
}

impl Query for ListRecords {
    type Output = Vec<Value>;
    const NAME: &'static str = "ModelList";
}

struct ListRecordsHandler {
    collections: HashMap<String, Arc<MemoryCollection>>,
}

#[async_trait]
impl QueryHandler<ListRecords> for ListRecordsHandler {
    async fn handle(&self, query: ListRecords) -> Result<Vec<Value>, BusError> {
        let Some(collection) = self.collections.get(&query.entity) else {
            return Err(BusError::validation(
                format!("unknown entity \"{}\"", query.entity),
                None,
            ));
        };
        collection.find_many().await.map_err(BusError::from)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Inbound routing
// ─────────────────────────────────────────────────────────────────────────────

/// Maps entity frames onto the buses: mutations become commands, list
/// requests become queries answered on the same socket.
struct BusRouter {
    commands: Arc<CommandBus>,
    queries: Arc<QueryBus>,
}

#[async_trait]
impl InboundRouter for BusRouter {
    async fn route(&self, conn: &Arc<Connection>, envelope: Envelope) -> Result<(), BusError> {
        match Frame::parse(&envelope) {
            Ok(Frame::Change {
                entity,
                kind,
                records,
            }) => {
                self.commands
                    .execute(RecordChange {
                        entity,
                        kind,
                        records,
                        ack_id: envelope.ack_id,
                    })
                    .await
            }
            Ok(Frame::List { entity, .. }) => {
                let records = self.queries.execute(ListRecords { entity }).await?;
                let mut reply = Envelope::list(envelope.entity, records);
                reply.ack_id = envelope.ack_id;
                conn.send(reply);
                Ok(())
            }
            _ => {
                debug!(
                    user = %conn.user_id,
                    entity = %envelope.entity,
                    kind = %envelope.kind,
                    "dropping unroutable frame"
                );
                Ok(())
            }
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Commands
// ─────────────────────────────────────────────────────────────────────────────

/// Starts the sync server over a seeded in-memory store.
pub async fn serve(port: u16, headless: bool) -> anyhow::Result<()> {
    let host = if headless { "0.0.0.0" } else { "127.0.0.1" };
    let addr: SocketAddr = format!("{host}:{port}").parse()?;

    let mut collections = HashMap::new();
    for entity in ENTITIES {
        collections.insert(entity.to_string(), Arc::new(MemoryCollection::new(entity)));
    }

    let registry = Arc::new(ConnectionRegistry::new(RegistryConfig::default()));

    // Buses are populated here, once, and read-only afterwards.
    let mut events = EventBus::new();
    events.on::<ModelChanged, _>(PushOnModelChange::new(registry.clone()));
    let events = Arc::new(events);

    let mut commands = CommandBus::new();
    commands.register::<RecordChange, _>(RecordChangeHandler {
        collections: collections.clone(),
        events: events.clone(),
    });
    let commands = Arc::new(commands);

    let mut queries = QueryBus::new();
    queries.register::<ListRecords, _>(ListRecordsHandler {
        collections: collections.clone(),
    });
    let queries = Arc::new(queries);

    let sync_collections: Vec<Arc<dyn SyncCollection>> = ENTITIES
        .iter()
        .map(|entity| collections[*entity].clone() as Arc<dyn SyncCollection>)
        .collect();
    let sync = Arc::new(SyncEngine::new(sync_collections));

    let server = WsServer::bind(
        addr,
        registry,
        sync,
        Arc::new(AnonymousAuth),
        Arc::new(BusRouter { commands, queries }),
    )
    .await?;

    info!("entities: {}", ENTITIES.join(", "));
    server.run().await?;
    Ok(())
}

/// Connects to a running server and prints every frame it pushes.
pub async fn watch(url: &str, token: &str) -> anyhow::Result<()> {
    let manager = ConnectionManager::new(ClientConfig::new(format!("{url}/?token={token}")));
    let mut frames = manager.subscribe();
    manager.connect();

    loop {
        match frames.recv().await {
            Ok(envelope) => {
                println!(
                    "{:<12} {:<16} {}",
                    envelope.entity,
                    envelope.kind.to_string(),
                    serde_json::to_string(&envelope.payload)?
                );
            }
            Err(broadcast::error::RecvError::Lagged(n)) => {
                warn!("lagged behind by {} frames", n);
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
    Ok(())
}
