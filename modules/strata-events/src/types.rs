//! Core types for the log. Domain-agnostic.

use std::any::Any;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// A record as stored in SQLite. Returned by all raw read methods.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredRecord {
    pub seq: u64,
    pub ts: DateTime<Utc>,
    pub type_tag: String,
    /// Raw JSON text, exactly as appended.
    pub payload: String,
}

/// A value that can be written to the log and read back.
///
/// `TYPE` is the stable identifier stored in the `type_tag` column. Commands use
/// the same string to find their handler, so renaming it orphans history.
///
/// ```ignore
/// #[derive(Debug, Serialize, Deserialize)]
/// struct CreateNote { title: String }
///
/// impl Message for CreateNote {
///     const TYPE: &'static str = "notes.create";
/// }
/// ```
pub trait Message: Serialize + DeserializeOwned + fmt::Debug + Send + Sync + 'static {
    const TYPE: &'static str;
}

/// Object-safe view of a [`Message`].
///
/// Implemented for every `Message`, so `&CreateNote` coerces to
/// `&dyn AnyMessage` at call sites.
pub trait AnyMessage: Any + fmt::Debug + Send + Sync {
    fn type_tag(&self) -> &'static str;

    fn to_payload(&self) -> serde_json::Result<String>;

    fn as_any(&self) -> &dyn Any;
}

impl<T: Message> AnyMessage for T {
    fn type_tag(&self) -> &'static str {
        T::TYPE
    }

    fn to_payload(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

impl<'a> dyn AnyMessage + 'a {
    /// Borrow the concrete message if it is a `T`.
    pub fn downcast_ref<T: Message>(&self) -> Option<&T> {
        self.as_any().downcast_ref::<T>()
    }
}

/// A stored record plus the value materialized from its payload.
#[derive(Debug)]
pub struct DecodedMessage {
    pub record: StoredRecord,
    pub value: Box<dyn AnyMessage>,
}

impl DecodedMessage {
    pub fn seq(&self) -> u64 {
        self.record.seq
    }

    pub fn type_tag(&self) -> &str {
        &self.record.type_tag
    }

    pub fn downcast_ref<T: Message>(&self) -> Option<&T> {
        self.value.downcast_ref::<T>()
    }
}
