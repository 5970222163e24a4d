//! Generic, domain-agnostic append-only log and key-value store.
//!
//! Records are opaque JSON payloads tagged with a type string. The store knows
//! nothing about commands, handlers or workers; consumers register the shapes
//! they want decoded through the [`TypeRegistry`].

pub mod db;
pub mod kv;
pub mod registry;
pub mod store;
pub mod types;

pub use db::{connect, connect_in_memory, migrate};
pub use kv::KvStore;
pub use registry::{DecodeError, TypeRegistry};
pub use store::EventLog;
pub use types::{AnyMessage, DecodedMessage, Message, StoredRecord};
