//! TypeRegistry: closed map from type tag to a decoder for that shape.
//!
//! Registration is explicit and happens at startup. Nothing is inferred from
//! payloads: a tag that was never registered cannot be decoded.

use std::any::TypeId;
use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

use thiserror::Error;
use tracing::{debug, warn};

use crate::types::{AnyMessage, Message};

type Decoder = fn(&str) -> serde_json::Result<Box<dyn AnyMessage>>;

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("type tag '{0}' is not registered")]
    Unregistered(String),

    #[error("payload for '{type_tag}' does not decode: {source}")]
    Payload {
        type_tag: String,
        #[source]
        source: serde_json::Error,
    },
}

struct Registration {
    type_id: TypeId,
    type_name: &'static str,
    decode: Decoder,
}

fn decode_as<T: Message>(payload: &str) -> serde_json::Result<Box<dyn AnyMessage>> {
    let value: T = serde_json::from_str(payload)?;
    Ok(Box::new(value))
}

#[derive(Default)]
pub struct TypeRegistry {
    types: RwLock<HashMap<&'static str, Registration>>,
}

impl TypeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind `T::TYPE` to `T`. First registration wins.
    ///
    /// Returns `false` when the tag was already bound. Binding the same tag to a
    /// different Rust type is logged as a warning since records would silently
    /// decode into the first shape.
    pub fn register<T: Message>(&self) -> bool {
        let mut types = self.types.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(existing) = types.get(T::TYPE) {
            if existing.type_id == TypeId::of::<T>() {
                debug!(type_tag = T::TYPE, "Type already registered, ignoring");
            } else {
                warn!(
                    type_tag = T::TYPE,
                    kept = existing.type_name,
                    ignored = std::any::type_name::<T>(),
                    "Type tag already bound to a different shape, keeping the first"
                );
            }
            return false;
        }

        types.insert(
            T::TYPE,
            Registration {
                type_id: TypeId::of::<T>(),
                type_name: std::any::type_name::<T>(),
                decode: decode_as::<T>,
            },
        );
        true
    }

    pub fn is_registered(&self, type_tag: &str) -> bool {
        self.types
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(type_tag)
    }

    /// Materialize a fresh instance from a raw payload.
    pub fn decode(&self, type_tag: &str, payload: &str) -> Result<Box<dyn AnyMessage>, DecodeError> {
        let decode = {
            let types = self.types.read().unwrap_or_else(PoisonError::into_inner);
            types
                .get(type_tag)
                .map(|r| r.decode)
                .ok_or_else(|| DecodeError::Unregistered(type_tag.to_string()))?
        };

        decode(payload).map_err(|source| DecodeError::Payload {
            type_tag: type_tag.to_string(),
            source,
        })
    }

    pub fn registered_types(&self) -> Vec<String> {
        let mut tags: Vec<String> = self
            .types
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .map(|t| t.to_string())
            .collect();
        tags.sort();
        tags
    }
}
