//! Durable state store seam.
//!
//! The store is the only thing shared between engine instances, the
//! dashboard, and the hardware bridge. It offers get / set / subscribe and
//! nothing else: no transactions, no compare-and-swap.

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{broadcast, RwLock};
use tracing::warn;

/// Capacity of the change fan-out channel. Slow subscribers skip ahead.
pub(crate) const CHANGE_BUFFER: usize = 64;

pub mod keys {
    pub const IRRIGATION_CONFIG: &str = "irrigationConfig";
    pub const LAST_AUTO_TRIGGER_MARK: &str = "lastAutoTriggerMark";
    pub const VALVE_COMMAND: &str = "valveCommand";
    pub const VALVE_CONFIRMATION: &str = "valveConfirmation";
    pub const TANK_LEVEL: &str = "tankLevel";
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("malformed value at '{key}': {source}")]
    Malformed {
        key: String,
        #[source]
        source: serde_json::Error,
    },
}

/// A value written under `key`.
#[derive(Debug, Clone)]
pub struct Change {
    pub key: String,
    pub value: Value,
}

/// Stream of values written under a single key.
pub struct Subscription {
    key: String,
    rx: broadcast::Receiver<Change>,
}

impl Subscription {
    pub fn new(key: &str, rx: broadcast::Receiver<Change>) -> Self {
        Self {
            key: key.to_string(),
            rx,
        }
    }

    /// Next value written under this key. `None` once the store is gone.
    pub async fn next(&mut self) -> Option<Value> {
        loop {
            match self.rx.recv().await {
                Ok(change) if change.key == self.key => return Some(change.value),
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(key = %self.key, skipped, "store subscription lagged");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

#[async_trait]
pub trait Store: Clone + Send + Sync + 'static {
    /// Current value under `key`, or `None` if nothing was ever written.
    async fn get(&self, key: &str) -> Result<Option<Value>, StoreError>;

    /// Overwrite the value under `key`.
    async fn set(&self, key: &str, value: Value) -> Result<(), StoreError>;

    /// Changes to `key` from now on, including this client's own writes.
    fn subscribe(&self, key: &str) -> Subscription;
}

/// Typed `get`.
pub async fn read<S: Store, T: DeserializeOwned>(
    store: &S,
    key: &str,
) -> Result<Option<T>, StoreError> {
    match store.get(key).await? {
        Some(v) => serde_json::from_value(v)
            .map(Some)
            .map_err(|source| StoreError::Malformed {
                key: key.to_string(),
                source,
            }),
        None => Ok(None),
    }
}

/// Typed `set`.
pub async fn write<S: Store, T: Serialize + Sync>(
    store: &S,
    key: &str,
    value: &T,
) -> Result<(), StoreError> {
    let v = serde_json::to_value(value).map_err(|source| StoreError::Malformed {
        key: key.to_string(),
        source,
    })?;
    store.set(key, v).await
}

// ---------------------------------------------------------------------------
// In-memory store (development + tests)
// ---------------------------------------------------------------------------

/// Process-local store. Clones share the same data, so two engine instances
/// built on clones of one `MemoryStore` behave like two browser tabs on the
/// same backend.
#[derive(Clone)]
pub struct MemoryStore {
    inner: Arc<MemoryInner>,
}

struct MemoryInner {
    values: RwLock<HashMap<String, Value>>,
    #[cfg(test)]
    history: RwLock<Vec<Change>>,
    changes: broadcast::Sender<Change>,
    // Configurable failure modes
    unavailable: AtomicBool,
    failing_key: RwLock<Option<String>>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        let (changes, _) = broadcast::channel(CHANGE_BUFFER);
        Self {
            inner: Arc::new(MemoryInner {
                values: RwLock::new(HashMap::new()),
                #[cfg(test)]
                history: RwLock::new(Vec::new()),
                changes,
                unavailable: AtomicBool::new(false),
                failing_key: RwLock::new(None),
            }),
        }
    }

    /// Make every read and write fail until switched back.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.inner.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Make writes to one key fail while everything else keeps working.
    pub async fn fail_writes_to(&self, key: Option<&str>) {
        *self.inner.failing_key.write().await = key.map(str::to_string);
    }

    /// Every successful write to `key`, oldest first.
    #[cfg(test)]
    pub async fn writes(&self, key: &str) -> Vec<Value> {
        self.inner
            .history
            .read()
            .await
            .iter()
            .filter(|c| c.key == key)
            .map(|c| c.value.clone())
            .collect()
    }

    fn check_available(&self) -> Result<(), StoreError> {
        if self.inner.unavailable.load(Ordering::SeqCst) {
            Err(StoreError::Unavailable("memory store switched off".into()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<Value>, StoreError> {
        self.check_available()?;
        Ok(self.inner.values.read().await.get(key).cloned())
    }

    async fn set(&self, key: &str, value: Value) -> Result<(), StoreError> {
        self.check_available()?;
        if self.inner.failing_key.read().await.as_deref() == Some(key) {
            return Err(StoreError::Unavailable(format!("writes to '{key}' are failing")));
        }

        self.inner
            .values
            .write()
            .await
            .insert(key.to_string(), value.clone());

        let change = Change {
            key: key.to_string(),
            value,
        };
        #[cfg(test)]
        self.inner.history.write().await.push(change.clone());
        // No receivers is fine.
        let _ = self.inner.changes.send(change);
        Ok(())
    }

    fn subscribe(&self, key: &str) -> Subscription {
        Subscription::new(key, self.inner.changes.subscribe())
    }
}

// ===========================================================================
// Tests
// ===========================================================================
