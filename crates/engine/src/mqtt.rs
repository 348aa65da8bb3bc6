//! Durable store backed by retained MQTT topics.
//!
//! Every store key maps to `<prefix>/<key>`; values are retained JSON
//! payloads, so a freshly connected client (engine, dashboard, bridge) gets
//! the last value of every key from the broker. Reads are served from a
//! local cache fed by the subscription.

use async_trait::async_trait;
use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Packet, QoS};
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, RwLock};
use tokio::time::{sleep, Instant};
use tracing::{debug, info, warn};

use crate::store::{Change, Store, StoreError, Subscription, CHANGE_BUFFER};

/// How long after SUBACK we wait for retained values before serving reads.
/// Until then the cache may be missing keys the broker actually holds, and
/// an absent `lastAutoTriggerMark` would look like "never fired".
const RETAINED_SETTLE: Duration = Duration::from_secs(2);

const RECONNECT_DELAY: Duration = Duration::from_secs(2);

// ---------------------------------------------------------------------------
// Topic / payload helpers
// ---------------------------------------------------------------------------

/// "<prefix>/<key>".
pub(crate) fn topic_for(prefix: &str, key: &str) -> String {
    format!("{prefix}/{key}")
}

/// Extract the store key from "<prefix>/<key>".
pub(crate) fn key_from_topic<'a>(prefix: &str, topic: &'a str) -> Option<&'a str> {
    let parts: Vec<&str> = topic.split('/').collect();
    if parts.len() == 2 && parts[0] == prefix && !parts[1].is_empty() {
        Some(parts[1])
    } else {
        None
    }
}

/// Decode a retained payload. An empty payload clears the retained value.
pub(crate) fn decode_payload(payload: &[u8]) -> Result<Option<Value>, serde_json::Error> {
    if payload.iter().all(u8::is_ascii_whitespace) {
        return Ok(None);
    }
    serde_json::from_slice(payload).map(Some)
}

// ---------------------------------------------------------------------------
// Store
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct MqttStore {
    client: AsyncClient,
    prefix: Arc<str>,
    cache: Arc<RwLock<HashMap<String, Value>>>,
    changes: broadcast::Sender<Change>,
    connected: Arc<AtomicBool>,
    synced_at: Arc<RwLock<Option<Instant>>>,
    /// Payloads of own writes per key whose broker echo has not come back yet.
    in_flight: Arc<RwLock<HashMap<String, VecDeque<Vec<u8>>>>>,
}

impl MqttStore {
    /// Build the store and the event loop that must be driven with
    /// [`MqttStore::run`].
    pub fn new(options: MqttOptions, prefix: &str) -> (Self, EventLoop) {
        let (client, eventloop) = AsyncClient::new(options, 20);
        let (changes, _) = broadcast::channel(CHANGE_BUFFER);
        let store = Self {
            client,
            prefix: Arc::from(prefix),
            cache: Arc::new(RwLock::new(HashMap::new())),
            changes,
            connected: Arc::new(AtomicBool::new(false)),
            synced_at: Arc::new(RwLock::new(None)),
            in_flight: Arc::new(RwLock::new(HashMap::new())),
        };
        (store, eventloop)
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Drive the MQTT connection forever, reconnecting on error.
    pub async fn run(self, mut eventloop: EventLoop) {
        let filter = topic_for(&self.prefix, "+");
        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Packet::ConnAck(_))) => {
                    info!(%filter, "store connected to mqtt");
                    self.connected.store(true, Ordering::SeqCst);
                    *self.synced_at.write().await = None;
                    self.in_flight.write().await.clear();
                    // try_ so we never wait on the request queue this loop drains.
                    if let Err(e) = self.client.try_subscribe(filter.as_str(), QoS::AtLeastOnce) {
                        warn!("store subscribe failed: {e}");
                    }
                }
                Ok(Event::Incoming(Packet::SubAck(_))) => {
                    *self.synced_at.write().await = Some(Instant::now());
                }
                Ok(Event::Incoming(Packet::Publish(p))) => {
                    self.ingest(&p.topic, &p.payload).await;
                }
                Ok(Event::Incoming(Packet::Disconnect)) => {
                    warn!("store disconnected from mqtt");
                    self.connected.store(false, Ordering::SeqCst);
                }
                Ok(_) => {}
                Err(e) => {
                    warn!("store mqtt error: {e}. reconnecting...");
                    self.connected.store(false, Ordering::SeqCst);
                    *self.synced_at.write().await = None;
                    self.in_flight.write().await.clear();
                    sleep(RECONNECT_DELAY).await;
                }
            }
        }
    }

    async fn ingest(&self, topic: &str, payload: &[u8]) {
        let Some(key) = key_from_topic(&self.prefix, topic) else {
            debug!(%topic, "ignoring foreign topic");
            return;
        };

        if !self.accept(key, payload).await {
            return;
        }

        match decode_payload(payload) {
            Ok(Some(value)) => {
                self.cache
                    .write()
                    .await
                    .insert(key.to_string(), value.clone());
                let _ = self.changes.send(Change {
                    key: key.to_string(),
                    value,
                });
            }
            Ok(None) => {
                self.cache.write().await.remove(key);
            }
            Err(e) => warn!(%topic, "bad store payload: {e}"),
        }
    }

    /// The broker delivers in publish order. While own writes to `key` are
    /// in flight, anything arriving first is older than them and is dropped;
    /// the echo of an own write is already in the cache. Echoes are matched
    /// on the exact bytes published, since JSON floats need not survive a
    /// parse unchanged.
    async fn accept(&self, key: &str, payload: &[u8]) -> bool {
        let mut in_flight = self.in_flight.write().await;
        let Some(queue) = in_flight.get_mut(key) else {
            return true;
        };
        // An echo also settles every earlier write whose own echo was lost.
        if let Some(pos) = queue.iter().position(|sent| sent.as_slice() == payload) {
            queue.drain(..=pos);
        }
        if queue.is_empty() {
            in_flight.remove(key);
        }
        false
    }

    async fn ready(&self) -> Result<(), StoreError> {
        if !self.is_connected() {
            return Err(StoreError::Unavailable("mqtt not connected".into()));
        }
        match *self.synced_at.read().await {
            Some(t) if t.elapsed() >= RETAINED_SETTLE => Ok(()),
            _ => Err(StoreError::Unavailable(
                "waiting for retained values".into(),
            )),
        }
    }
}

#[async_trait]
impl Store for MqttStore {
    async fn get(&self, key: &str) -> Result<Option<Value>, StoreError> {
        self.ready().await?;
        Ok(self.cache.read().await.get(key).cloned())
    }

    async fn set(&self, key: &str, value: Value) -> Result<(), StoreError> {
        self.ready().await?;
        let payload = serde_json::to_vec(&value).map_err(|source| StoreError::Malformed {
            key: key.to_string(),
            source,
        })?;

        self.in_flight
            .write()
            .await
            .entry(key.to_string())
            .or_default()
            .push_back(payload.clone());

        if let Err(e) = self
            .client
            .publish(topic_for(&self.prefix, key), QoS::AtLeastOnce, true, payload)
            .await
        {
            let mut in_flight = self.in_flight.write().await;
            if let Some(queue) = in_flight.get_mut(key) {
                queue.pop_back();
                if queue.is_empty() {
                    in_flight.remove(key);
                }
            }
            return Err(StoreError::Unavailable(format!("publish failed: {e}")));
        }

        // Read-your-writes.
        self.cache
            .write()
            .await
            .insert(key.to_string(), value.clone());
        let _ = self.changes.send(Change {
            key: key.to_string(),
            value,
        });
        Ok(())
    }

    fn subscribe(&self, key: &str) -> Subscription {
        Subscription::new(key, self.changes.subscribe())
    }
}

// ===========================================================================
// Tests
// ===========================================================================
