//! Single-handler command dispatch.

use async_trait::async_trait;
use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;

use crate::error::BusError;

/// A named, immutable payload with a declared result type, addressed to
/// exactly one handler.
pub trait Command: Send + 'static {
    type Output: Send + 'static;

    /// Unique dispatch name. Registering two handlers under the same name
    /// is a startup-time programming error.
    const NAME: &'static str;
}

/// Asynchronous handler for one command type.
#[async_trait]
pub trait CommandHandler<C: Command>: Send + Sync {
    async fn handle(&self, command: C) -> Result<C::Output, BusError>;
}

/// Routes a command to its registered handler.
///
/// The handler map is populated once at startup via [`CommandBus::register`]
/// and read-only afterwards; concurrent `execute` calls share it without
/// locking.
#[derive(Default)]
pub struct CommandBus {
    handlers: HashMap<&'static str, Box<dyn Any + Send + Sync>>,
}

impl CommandBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers the handler for `C`.
    ///
    /// # Panics
    ///
    /// Panics if a handler is already registered under `C::NAME`. Duplicate
    /// registration is a wiring bug and must fail at startup, not at
    /// dispatch time.
    pub fn register<C, H>(&mut self, handler: H)
    where
        C: Command,
        H: CommandHandler<C> + 'static,
    {
        let erased = Box::new(Arc::new(handler) as Arc<dyn CommandHandler<C>>);
        if self.handlers.insert(C::NAME, erased).is_some() {
            panic!("duplicate command handler registered for \"{}\"", C::NAME);
        }
    }

    /// Executes `command`, suspending the caller until the handler resolves.
    ///
    /// Fails with [`BusError::NoHandlerRegistered`] when no handler exists;
    /// otherwise the handler's result or failure is returned unchanged.
    pub async fn execute<C: Command>(&self, command: C) -> Result<C::Output, BusError> {
        let handler = self
            .handlers
            .get(C::NAME)
            .and_then(|entry| entry.downcast_ref::<Arc<dyn CommandHandler<C>>>())
            .ok_or(BusError::NoHandlerRegistered(C::NAME))?;
        handler.handle(command).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CreateAccount {
        name: String,
    }

    impl Command for CreateAccount {
        type Output = String;
        const NAME: &'static str = "AccountCreate";
    }

    struct CreateAccountHandler {
        calls: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl CommandHandler<CreateAccount> for CreateAccountHandler {
        async fn handle(&self, command: CreateAccount) -> Result<String, BusError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if command.name.is_empty() {
                return Err(BusError::validation("account name must not be empty", None));
            }
            Ok(format!("account:{}", command.name))
        }
    }

    #[tokio::test]
    async fn test_execute_routes_to_handler() {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut bus = CommandBus::new();
        bus.register::<CreateAccount, _>(CreateAccountHandler {
            calls: calls.clone(),
        });

        let result = bus
            .execute(CreateAccount {
                name: "checking".into(),
            })
            .await
            .unwrap();
        assert_eq!(result, "account:checking");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_handler_failure_propagates_unchanged() {
        let mut bus = CommandBus::new();
        bus.register::<CreateAccount, _>(CreateAccountHandler {
            calls: Arc::new(AtomicUsize::new(0)),
        });

        let err = bus
            .execute(CreateAccount { name: String::new() })
            .await
            .unwrap_err();
        assert!(matches!(err, BusError::Validation { .. }));
    }

    #[tokio::test]
    async fn test_missing_handler_fails_without_side_effects() {
        let bus = CommandBus::new();
        let err = bus
            .execute(CreateAccount {
                name: "checking".into(),
            })
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            BusError::NoHandlerRegistered("AccountCreate")
        ));
    }

    #[test]
    #[should_panic(expected = "duplicate command handler")]
    fn test_duplicate_registration_panics_at_startup() {
        let mut bus = CommandBus::new();
        bus.register::<CreateAccount, _>(CreateAccountHandler {
            calls: Arc::new(AtomicUsize::new(0)),
        });
        bus.register::<CreateAccount, _>(CreateAccountHandler {
            calls: Arc::new(AtomicUsize::new(0)),
        });
    }
}
