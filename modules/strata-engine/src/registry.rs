//! Command and query registries.
//!
//! Each registry is a guarded map from a message identifier to a type-erased
//! slot. Typed handlers are wrapped once at registration; lookups clone the slot
//! out of the map so no lock is held across a handler call.

use std::any::Any;
use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::{Arc, PoisonError, RwLock};

use async_trait::async_trait;
use strata_events::{AnyMessage, Message};

use crate::error::{DispatchError, QueryError, RegistryError};
use crate::traits::{CommandHandler, Query, QueryHandler, Validator};

// ---------------------------------------------------------------------------
// Commands
// ---------------------------------------------------------------------------

#[async_trait]
trait CommandSlot: Send + Sync {
    fn has_validator(&self) -> bool;

    async fn validate(&self, message: &dyn AnyMessage) -> Result<(), DispatchError>;

    async fn apply(&self, message: &dyn AnyMessage) -> Result<(), DispatchError>;
}

struct TypedCommand<C: Message> {
    handler: Arc<dyn CommandHandler<C>>,
    validator: Option<Arc<dyn Validator<C>>>,
    _marker: PhantomData<fn() -> C>,
}

impl<C: Message> TypedCommand<C> {
    fn downcast<'m>(&self, message: &'m dyn AnyMessage) -> Result<&'m C, DispatchError> {
        message.downcast_ref::<C>().ok_or_else(|| DispatchError::Decode {
            command: C::TYPE.to_string(),
            expected: std::any::type_name::<C>(),
        })
    }
}

#[async_trait]
impl<C: Message> CommandSlot for TypedCommand<C> {
    fn has_validator(&self) -> bool {
        self.validator.is_some()
    }

    async fn validate(&self, message: &dyn AnyMessage) -> Result<(), DispatchError> {
        let command = self.downcast(message)?;
        let Some(validator) = &self.validator else {
            return Ok(());
        };
        validator
            .validate(command)
            .await
            .map_err(|source| DispatchError::Rejected {
                command: C::TYPE.to_string(),
                source,
            })
    }

    async fn apply(&self, message: &dyn AnyMessage) -> Result<(), DispatchError> {
        let command = self.downcast(message)?;
        self.handler
            .handle(command)
            .await
            .map_err(|source| DispatchError::Handler {
                command: C::TYPE.to_string(),
                source,
            })
    }
}

/// Maps a command identifier to exactly one handler and an optional validator.
#[derive(Default)]
pub struct CommandRegistry {
    slots: RwLock<HashMap<&'static str, Arc<dyn CommandSlot>>>,
}

impl CommandRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind `C::TYPE` to `handler`. A second binding for the same identifier
    /// fails; neither handler is preferred.
    pub fn register<C, H>(&self, handler: H) -> Result<(), RegistryError>
    where
        C: Message,
        H: CommandHandler<C> + 'static,
    {
        self.insert::<C>(Arc::new(handler), None)
    }

    /// Like [`CommandRegistry::register`], with the owning feature's validator.
    pub fn register_validated<C, H, V>(&self, handler: H, validator: V) -> Result<(), RegistryError>
    where
        C: Message,
        H: CommandHandler<C> + 'static,
        V: Validator<C> + 'static,
    {
        self.insert::<C>(Arc::new(handler), Some(Arc::new(validator)))
    }

    fn insert<C: Message>(
        &self,
        handler: Arc<dyn CommandHandler<C>>,
        validator: Option<Arc<dyn Validator<C>>>,
    ) -> Result<(), RegistryError> {
        let mut slots = self.slots.write().unwrap_or_else(PoisonError::into_inner);
        if slots.contains_key(C::TYPE) {
            return Err(RegistryError::DuplicateCommand(C::TYPE.to_string()));
        }
        slots.insert(
            C::TYPE,
            Arc::new(TypedCommand {
                handler,
                validator,
                _marker: PhantomData,
            }),
        );
        Ok(())
    }

    fn slot(&self, command: &str) -> Result<Arc<dyn CommandSlot>, DispatchError> {
        self.slots
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(command)
            .cloned()
            .ok_or_else(|| DispatchError::NotRegistered(command.to_string()))
    }

    pub fn contains(&self, command: &str) -> bool {
        self.slots
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(command)
    }

    pub fn has_validator(&self, command: &str) -> bool {
        self.slot(command).map(|s| s.has_validator()).unwrap_or(false)
    }

    /// Run the registered validator, if any. `Ok` when there is none.
    pub async fn validate(&self, message: &dyn AnyMessage) -> Result<(), DispatchError> {
        self.slot(message.type_tag())?.validate(message).await
    }

    /// Route to the registered handler.
    pub async fn dispatch(&self, message: &dyn AnyMessage) -> Result<(), DispatchError> {
        self.slot(message.type_tag())?.apply(message).await
    }

    pub fn registered_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self
            .slots
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .map(|t| t.to_string())
            .collect();
        types.sort();
        types
    }
}

// ---------------------------------------------------------------------------
// Queries
// ---------------------------------------------------------------------------

type AnyOutput = Box<dyn Any + Send>;

#[async_trait]
trait QuerySlot: Send + Sync {
    async fn handle(&self, query: Box<dyn Any + Send>) -> Result<AnyOutput, QueryError>;
}

struct TypedQuery<Q: Query> {
    handler: Arc<dyn QueryHandler<Q>>,
}

#[async_trait]
impl<Q: Query> QuerySlot for TypedQuery<Q> {
    async fn handle(&self, query: Box<dyn Any + Send>) -> Result<AnyOutput, QueryError> {
        let query = query.downcast::<Q>().map_err(|_| QueryError::Decode {
            query: Q::TYPE.to_string(),
        })?;
        let output = self
            .handler
            .handle(*query)
            .await
            .map_err(|source| QueryError::Handler {
                query: Q::TYPE.to_string(),
                source,
            })?;
        Ok(Box::new(output))
    }
}

/// Maps a query identifier to exactly one handler. Queries never touch the log.
#[derive(Default)]
pub struct QueryRegistry {
    slots: RwLock<HashMap<&'static str, Arc<dyn QuerySlot>>>,
}

impl QueryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<Q, H>(&self, handler: H) -> Result<(), RegistryError>
    where
        Q: Query,
        H: QueryHandler<Q> + 'static,
    {
        let mut slots = self.slots.write().unwrap_or_else(PoisonError::into_inner);
        if slots.contains_key(Q::TYPE) {
            return Err(RegistryError::DuplicateQuery(Q::TYPE.to_string()));
        }
        slots.insert(
            Q::TYPE,
            Arc::new(TypedQuery::<Q> {
                handler: Arc::new(handler),
            }),
        );
        Ok(())
    }

    pub async fn dispatch<Q: Query>(&self, query: Q) -> Result<Q::Output, QueryError> {
        let slot = self
            .slots
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(Q::TYPE)
            .cloned()
            .ok_or_else(|| QueryError::NotRegistered(Q::TYPE.to_string()))?;

        let output = slot.handle(Box::new(query)).await?;
        output
            .downcast::<Q::Output>()
            .map(|o| *o)
            .map_err(|_| QueryError::Decode {
                query: Q::TYPE.to_string(),
            })
    }

    pub fn registered_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self
            .slots
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .map(|t| t.to_string())
            .collect();
        types.sort();
        types
    }
}
