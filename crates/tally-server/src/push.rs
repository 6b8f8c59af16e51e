//! Event-bus bridge from committed mutations to socket push.
//!
//! Command handlers emit [`ModelChanged`] after a mutation commits; the
//! registered [`PushOnModelChange`] handler turns it into a
//! `created`/`updated`/`deleted` frame for connected sockets. Because it
//! runs on the event bus, a delivery failure can never roll back or fail
//! the command that triggered it.

use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;

use tally_bus::{Event, EventHandler};
use tally_proto::ChangeKind;

use crate::registry::ConnectionRegistry;

/// A committed entity mutation, ready for push fan-out.
#[derive(Debug, Clone)]
pub struct ModelChanged {
    pub entity: String,
    pub kind: ChangeKind,
    pub records: Vec<Value>,
    /// Correlation id of the originating request, echoed on the push
    /// frames so the requesting client can match its own mutation.
    pub ack_id: Option<String>,
}

impl Event for ModelChanged {
    const NAME: &'static str = "model.changed";
}

/// Pushes model changes to connected sockets via the registry.
pub struct PushOnModelChange {
    registry: Arc<ConnectionRegistry>,
}

impl PushOnModelChange {
    pub fn new(registry: Arc<ConnectionRegistry>) -> Self {
        Self { registry }
    }
}

#[async_trait]
impl EventHandler<ModelChanged> for PushOnModelChange {
    async fn handle(&self, event: &ModelChanged) -> anyhow::Result<()> {
        self.registry
            .on_model_change(
                &event.entity,
                event.records.clone(),
                event.kind,
                event.ack_id.clone(),
            )
            .await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::RegistryConfig;
    use serde_json::json;
    use std::time::Duration;
    use tally_bus::EventBus;
    use tally_proto::Frame;
    use tokio::sync::mpsc;

    #[tokio::test]
    async fn test_emitted_event_reaches_open_sockets() {
        let registry = Arc::new(ConnectionRegistry::new(RegistryConfig {
            heartbeat_interval: Duration::from_secs(3600),
        }));
        let (tx, mut rx) = mpsc::unbounded_channel();
        let _conn = registry.opened("user-1".into(), tx).await;

        let mut events = EventBus::new();
        events.on::<ModelChanged, _>(PushOnModelChange::new(registry.clone()));

        events
            .emit(&ModelChanged {
                entity: "account".into(),
                kind: ChangeKind::Created,
                records: vec![json!({"id": 1})],
                ack_id: Some("req-1".into()),
            })
            .await;

        let env = rx.recv().await.unwrap();
        assert_eq!(env.ack_id.as_deref(), Some("req-1"));
        assert!(matches!(
            Frame::parse(&env).unwrap(),
            Frame::Change { kind: ChangeKind::Created, .. }
        ));
    }
}
