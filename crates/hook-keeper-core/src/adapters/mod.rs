//! # Store Adapters
//!
//! Implementations of the keyed subscription and correlation stores.

pub mod filesystem_store;
pub mod memory_store;

pub use filesystem_store::{FilesystemCorrelationStore, FilesystemSubscriptionStore};
pub use memory_store::{InMemoryCorrelationStore, InMemorySubscriptionStore};
