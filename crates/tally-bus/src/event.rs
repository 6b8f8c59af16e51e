//! Multi-handler event fan-out.

use async_trait::async_trait;
use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::warn;

/// A named notification of something that already happened.
pub trait Event: Send + Sync + 'static {
    /// Dispatch name; multiple handlers per name are legal.
    const NAME: &'static str;
}

/// Asynchronous handler for one event type.
///
/// Handlers are best-effort side-effect steps. A returned error is logged
/// and swallowed by the bus; it never aborts sibling handlers or the
/// action that emitted the event.
#[async_trait]
pub trait EventHandler<E: Event>: Send + Sync {
    async fn handle(&self, event: &E) -> anyhow::Result<()>;
}

/// Fans events out to their registered handlers in registration order.
///
/// Handlers run sequentially, one `await` at a time, so ordering-sensitive
/// side effects (create default data before notifying sockets) stay
/// deterministic.
#[derive(Default)]
pub struct EventBus {
    handlers: HashMap<&'static str, Vec<Box<dyn Any + Send + Sync>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a handler to the ordered list for `E`.
    pub fn on<E, H>(&mut self, handler: H)
    where
        E: Event,
        H: EventHandler<E> + 'static,
    {
        self.handlers
            .entry(E::NAME)
            .or_default()
            .push(Box::new(Arc::new(handler) as Arc<dyn EventHandler<E>>));
    }

    /// Invokes every handler registered for `E`, in registration order.
    ///
    /// Fire-and-forget from the caller's perspective: handler failures are
    /// logged individually and the next handler still runs.
    pub async fn emit<E: Event>(&self, event: &E) {
        let Some(entries) = self.handlers.get(E::NAME) else {
            return;
        };
        for entry in entries {
            let Some(handler) = entry.downcast_ref::<Arc<dyn EventHandler<E>>>() else {
                continue;
            };
            if let Err(err) = handler.handle(event).await {
                warn!(event = E::NAME, error = %err, "event handler failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;
    use std::sync::Mutex;

    #[derive(Debug)]
    struct TransactionCreated {
        id: u64,
    }

    impl Event for TransactionCreated {
        const NAME: &'static str = "transaction.created";
    }

    struct Recorder {
        label: &'static str,
        log: Arc<Mutex<Vec<&'static str>>>,
        fail: bool,
    }

    #[async_trait]
    impl EventHandler<TransactionCreated> for Recorder {
        async fn handle(&self, event: &TransactionCreated) -> anyhow::Result<()> {
            assert_eq!(event.id, 42);
            self.log.lock().unwrap().push(self.label);
            if self.fail {
                return Err(anyhow!("{} blew up", self.label));
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_failing_handler_does_not_abort_siblings() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut bus = EventBus::new();
        bus.on::<TransactionCreated, _>(Recorder {
            label: "h1",
            log: log.clone(),
            fail: false,
        });
        bus.on::<TransactionCreated, _>(Recorder {
            label: "h2",
            log: log.clone(),
            fail: true,
        });
        bus.on::<TransactionCreated, _>(Recorder {
            label: "h3",
            log: log.clone(),
            fail: false,
        });

        bus.emit(&TransactionCreated { id: 42 }).await;

        assert_eq!(*log.lock().unwrap(), vec!["h1", "h2", "h3"]);
    }

    #[tokio::test]
    async fn test_emit_with_no_handlers_is_a_noop() {
        let bus = EventBus::new();
        bus.emit(&TransactionCreated { id: 42 }).await;
    }
}
