//! Seams between the engine and feature code.

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use strata_events::Message;

/// Applies a command to in-memory state.
///
/// Called both on the live path (after the command is durably appended) and
/// during boot replay. It must be deterministic over the log: no clocks, no
/// I/O, no randomness that is not carried in the command itself.
#[async_trait]
pub trait CommandHandler<C: Message>: Send + Sync {
    async fn handle(&self, command: &C) -> Result<()>;
}

/// Feature-level stateful validation, run before a command is appended.
///
/// Never called during replay: history was validated when it was written.
#[async_trait]
pub trait Validator<C: Message>: Send + Sync {
    async fn validate(&self, command: &C) -> Result<()>;
}

/// A read intent. Never logged.
pub trait Query: Send + Sync + 'static {
    const TYPE: &'static str;
    type Output: Send + 'static;
}

#[async_trait]
pub trait QueryHandler<Q: Query>: Send + Sync {
    async fn handle(&self, query: Q) -> Result<Q::Output>;
}

// ---------------------------------------------------------------------------
// Arc<H> blankets: a feature usually shares one state object between its
// handler, validator and queries.
// ---------------------------------------------------------------------------

#[async_trait]
impl<C: Message, H: CommandHandler<C> + ?Sized> CommandHandler<C> for Arc<H> {
    async fn handle(&self, command: &C) -> Result<()> {
        (**self).handle(command).await
    }
}

#[async_trait]
impl<C: Message, V: Validator<C> + ?Sized> Validator<C> for Arc<V> {
    async fn validate(&self, command: &C) -> Result<()> {
        (**self).validate(command).await
    }
}

#[async_trait]
impl<Q: Query, H: QueryHandler<Q> + ?Sized> QueryHandler<Q> for Arc<H> {
    async fn handle(&self, query: Q) -> Result<Q::Output> {
        (**self).handle(query).await
    }
}
