//! In-memory credential channel
//!
//! Objects are stored as whole `Arc<[u8]>` values in a concurrent map, so a
//! reader holds either the previous blob or the new one, never a mix. The
//! availability switch lets tests simulate the store going away.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use tracing::trace;

use crate::{validate_key, ChannelError, CredentialChannel};

/// Concurrent in-memory object store
#[derive(Debug)]
pub struct InMemoryChannel {
    name: String,
    objects: DashMap<String, Arc<[u8]>>,
    available: AtomicBool,
    writes: AtomicU64,
}

impl InMemoryChannel {
    /// Create an empty store; `name` appears in locators
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            objects: DashMap::new(),
            available: AtomicBool::new(true),
            writes: AtomicU64::new(0),
        }
    }

    /// Make every subsequent operation fail with `Unavailable` (or stop doing so)
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Number of successful `put` calls so far
    pub fn write_count(&self) -> u64 {
        self.writes.load(Ordering::SeqCst)
    }

    /// Number of stored objects
    pub fn len(&self) -> usize {
        self.objects.len()
    }

    /// Whether the store holds no objects
    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    fn check_available(&self, key: &str) -> Result<(), ChannelError> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(ChannelError::unavailable(key, "store is offline"))
        }
    }
}

#[async_trait]
impl CredentialChannel for InMemoryChannel {
    async fn put(&self, key: &str, blob: &[u8]) -> Result<(), ChannelError> {
        validate_key(key)?;
        self.check_available(key)?;
        self.objects.insert(key.to_string(), Arc::from(blob));
        self.writes.fetch_add(1, Ordering::SeqCst);
        trace!(channel = %self.name, key, bytes = blob.len(), "stored object");
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Vec<u8>, ChannelError> {
        validate_key(key)?;
        self.check_available(key)?;
        let blob = self
            .objects
            .get(key)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| ChannelError::not_found(key))?;
        Ok(blob.to_vec())
    }

    fn locate(&self, key: &str) -> String {
        format!("memory://{}/{}", self.name, key)
    }
}
