//! Storage Facade traits.
//!
//! Persistent storage is an injected capability: the embedding application
//! owns the actual key-value store and blob store, and the engine only ever
//! talks to these two narrow trait boundaries. The in-memory fakes below
//! exist purely for tests; they use a plain `Mutex<HashMap<...>>`
//! interior-mutability shape since both are read/write-from-anywhere test
//! doubles with no single-writer requirement of their own.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;

use crate::error::EngineError;

/// Small-value key-value store for metadata records.
#[async_trait]
pub trait KvStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, EngineError>;
    async fn set(&self, key: &str, value: String) -> Result<(), EngineError>;
    async fn delete(&self, key: &str) -> Result<(), EngineError>;
}

/// Named-collection blob store for avatars and large message bodies:
/// `avatars` keyed by peer_id/`my-avatar`, `messages` keyed by
/// `msg-content-<message_id>`.
#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn get(&self, collection: &str, id: &str) -> Result<Option<Vec<u8>>, EngineError>;
    async fn set(&self, collection: &str, id: &str, bytes: Vec<u8>) -> Result<(), EngineError>;
    async fn delete(&self, collection: &str, id: &str) -> Result<(), EngineError>;
    async fn get_all(&self, collection: &str) -> Result<Vec<(String, Vec<u8>)>, EngineError>;
    async fn clear(&self, collection: &str) -> Result<(), EngineError>;
}

/// Encode bytes as a `KvStore`-compatible string. Persisted device records
/// are postcard bytes; base64 turns them into the `String` the trait
/// expects without inventing a second serialization format.
pub fn encode_record(bytes: &[u8]) -> String {
    use base64::Engine;
    base64::engine::general_purpose::STANDARD.encode(bytes)
}

pub fn decode_record(value: &str) -> Result<Vec<u8>, EngineError> {
    use base64::Engine;
    base64::engine::general_purpose::STANDARD
        .decode(value)
        .map_err(EngineError::storage)
}

/// Log-and-swallow a storage failure: the engine never crashes on a store
/// failure. Internal call sites use this instead of propagating `Result`
/// upward.
pub fn swallow(context: &str, result: Result<(), EngineError>) {
    if let Err(err) = result {
        tracing::warn!(context, error = %err, "storage operation failed, continuing");
    }
}

#[derive(Default)]
pub struct InMemoryKvStore {
    values: Mutex<HashMap<String, String>>,
}

impl InMemoryKvStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KvStore for InMemoryKvStore {
    async fn get(&self, key: &str) -> Result<Option<String>, EngineError> {
        Ok(self.values.lock().unwrap().get(key).cloned())
    }

    async fn set(&self, key: &str, value: String) -> Result<(), EngineError> {
        self.values.lock().unwrap().insert(key.to_string(), value);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), EngineError> {
        self.values.lock().unwrap().remove(key);
        Ok(())
    }
}

#[derive(Default)]
pub struct InMemoryBlobStore {
    collections: Mutex<HashMap<String, HashMap<String, Vec<u8>>>>,
}

impl InMemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl BlobStore for InMemoryBlobStore {
    async fn get(&self, collection: &str, id: &str) -> Result<Option<Vec<u8>>, EngineError> {
        Ok(self
            .collections
            .lock()
            .unwrap()
            .get(collection)
            .and_then(|c| c.get(id))
            .cloned())
    }

    async fn set(&self, collection: &str, id: &str, bytes: Vec<u8>) -> Result<(), EngineError> {
        self.collections
            .lock()
            .unwrap()
            .entry(collection.to_string())
            .or_default()
            .insert(id.to_string(), bytes);
        Ok(())
    }

    async fn delete(&self, collection: &str, id: &str) -> Result<(), EngineError> {
        if let Some(c) = self.collections.lock().unwrap().get_mut(collection) {
            c.remove(id);
        }
        Ok(())
    }

    async fn get_all(&self, collection: &str) -> Result<Vec<(String, Vec<u8>)>, EngineError> {
        Ok(self
            .collections
            .lock()
            .unwrap()
            .get(collection)
            .map(|c| c.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
            .unwrap_or_default())
    }

    async fn clear(&self, collection: &str) -> Result<(), EngineError> {
        self.collections.lock().unwrap().remove(collection);
        Ok(())
    }
}
