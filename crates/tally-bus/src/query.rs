//! Single-handler read-only dispatch.
//!
//! Same registration and routing contract as the command bus; the
//! difference is the side-effect policy, which is a convention on the
//! handlers, not something the bus can enforce.

use async_trait::async_trait;
use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;

use crate::error::BusError;

/// A named, immutable read request with a declared result type.
pub trait Query: Send + 'static {
    type Output: Send + 'static;

    /// Unique dispatch name.
    const NAME: &'static str;
}

/// Asynchronous handler for one query type.
///
/// Handlers must not produce observable side effects: no event emission,
/// no writes.
#[async_trait]
pub trait QueryHandler<Q: Query>: Send + Sync {
    async fn handle(&self, query: Q) -> Result<Q::Output, BusError>;
}

/// Routes a query to its registered handler.
#[derive(Default)]
pub struct QueryBus {
    handlers: HashMap<&'static str, Box<dyn Any + Send + Sync>>,
}

impl QueryBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers the handler for `Q`.
    ///
    /// # Panics
    ///
    /// Panics if a handler is already registered under `Q::NAME`.
    pub fn register<Q, H>(&mut self, handler: H)
    where
        Q: Query,
        H: QueryHandler<Q> + 'static,
    {
        let erased = Box::new(Arc::new(handler) as Arc<dyn QueryHandler<Q>>);
        if self.handlers.insert(Q::NAME, erased).is_some() {
            panic!("duplicate query handler registered for \"{}\"", Q::NAME);
        }
    }

    /// Executes `query` and returns the handler's result or failure.
    pub async fn execute<Q: Query>(&self, query: Q) -> Result<Q::Output, BusError> {
        let handler = self
            .handlers
            .get(Q::NAME)
            .and_then(|entry| entry.downcast_ref::<Arc<dyn QueryHandler<Q>>>())
            .ok_or(BusError::NoHandlerRegistered(Q::NAME))?;
        handler.handle(query).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct AccountBalance {
        account_id: u64,
    }

    impl Query for AccountBalance {
        type Output = i64;
        const NAME: &'static str = "AccountBalance";
    }

    struct BalanceHandler;

    #[async_trait]
    impl QueryHandler<AccountBalance> for BalanceHandler {
        async fn handle(&self, query: AccountBalance) -> Result<i64, BusError> {
            Ok(query.account_id as i64 * 100)
        }
    }

    #[tokio::test]
    async fn test_query_round_trip() {
        let mut bus = QueryBus::new();
        bus.register::<AccountBalance, _>(BalanceHandler);

        let balance = bus.execute(AccountBalance { account_id: 3 }).await.unwrap();
        assert_eq!(balance, 300);
    }

    #[tokio::test]
    async fn test_missing_query_handler() {
        let bus = QueryBus::new();
        let err = bus
            .execute(AccountBalance { account_id: 3 })
            .await
            .unwrap_err();
        assert!(matches!(err, BusError::NoHandlerRegistered(_)));
    }
}
