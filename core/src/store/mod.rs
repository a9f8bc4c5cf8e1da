// Store module: durable key/value state

pub mod backend;

pub use backend::{MemoryStorage, SledStorage, StorageBackend, StorageError};
