//! Cross-process invalidation of local tiers over Redis pub/sub
//!
//! Each process keeps its own upper tiers above a shared authoritative tier.
//! After a write or removal reaches the authoritative tier, the engine
//! publishes the affected keys; every other process listening on the channel
//! drops those keys from its upper tiers.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use redis::{AsyncCommands, RedisError, aio::ConnectionManager};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::tier::{CacheKey, Cacheable, KeyFormatter};
use crate::{CacheError, MultiLevelCache};

const INITIAL_BACKOFF: Duration = Duration::from_millis(100);
const MAX_BACKOFF: Duration = Duration::from_secs(2);

/// Payload published on the invalidation channel
#[derive(Debug, Serialize, Deserialize)]
struct InvalidationMessage {
    /// Instance id of the publisher
    source: String,
    /// Formatted keys
    keys: Vec<String>,
}

/// Publisher and subscriber side of remote invalidation for one channel.
pub struct RemoteInvalidation<K> {
    client: redis::Client,
    publisher: ConnectionManager,
    channel: String,
    instance_id: String,
    key_formatter: Arc<dyn KeyFormatter<K>>,
}

impl<K: CacheKey> RemoteInvalidation<K> {
    /// `key_formatter` must be able to parse keys back, or received messages
    /// are ignored.
    pub async fn connect(
        client: redis::Client,
        channel: impl Into<String>,
        key_formatter: impl KeyFormatter<K>,
    ) -> Result<Self, CacheError> {
        let publisher = ConnectionManager::new(client.clone()).await?;
        Ok(Self {
            client,
            publisher,
            channel: channel.into(),
            instance_id: Uuid::new_v4().to_string(),
            key_formatter: Arc::new(key_formatter),
        })
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// Id stamped on published messages, used to skip our own.
    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    /// Best effort: failures are logged and never reach the cache caller.
    pub(crate) async fn publish(&self, keys: &[&K]) {
        if keys.is_empty() {
            return;
        }
        let message = InvalidationMessage {
            source: self.instance_id.clone(),
            keys: keys
                .iter()
                .map(|key| self.key_formatter.format_key(key))
                .collect(),
        };
        let payload = match serde_json::to_string(&message) {
            Ok(payload) => payload,
            Err(e) => {
                warn!("Failed to encode invalidation message: {}", e);
                return;
            }
        };

        let mut conn = self.publisher.clone();
        if let Err(e) = conn.publish::<_, _, ()>(&self.channel, &payload).await {
            warn!(
                "Redis PUBLISH error on channel {}: {}. Continuing.",
                self.channel, e
            );
        } else {
            debug!(
                "Cache invalidation published on channel '{}': {}",
                self.channel, payload
            );
        }
    }

    /// Subscribe once and apply messages until the connection drops.
    /// `Err` only when the subscription could not be set up.
    async fn listen_once<V: Cacheable>(&self, cache: &MultiLevelCache<K, V>) -> Result<(), RedisError> {
        let mut pubsub = self.client.get_async_pubsub().await?;
        pubsub.subscribe(&self.channel).await?;
        info!("Subscribed to invalidation channel {}", self.channel);

        let mut messages = pubsub.on_message();
        while let Some(msg) = messages.next().await {
            let payload = match msg.get_payload::<String>() {
                Ok(payload) => payload,
                Err(e) => {
                    warn!("Failed to decode pub/sub payload: {}", e);
                    continue;
                }
            };
            let keys = decode_keys(&payload, &self.instance_id, self.key_formatter.as_ref());
            for key in &keys {
                cache.invalidate_local(key).await;
            }
            if !keys.is_empty() {
                debug!("Invalidated {} local keys from {}", keys.len(), self.channel);
            }
        }
        Ok(())
    }
}

/// Keys named by a message from another instance. Own messages, malformed
/// payloads and keys that do not parse yield nothing.
fn decode_keys<K: 'static>(payload: &str, own_id: &str, key_formatter: &dyn KeyFormatter<K>) -> Vec<K> {
    let message: InvalidationMessage = match serde_json::from_str(payload) {
        Ok(message) => message,
        Err(e) => {
            warn!("Ignoring malformed invalidation message: {}", e);
            return Vec::new();
        }
    };
    if message.source == own_id {
        return Vec::new();
    }
    message
        .keys
        .iter()
        .filter_map(|formatted| key_formatter.parse_key(formatted))
        .collect()
}

/// Running invalidation listener. Dropping the handle stops it.
pub struct InvalidationHandle {
    shutdown: watch::Sender<()>,
    task: JoinHandle<()>,
}

impl InvalidationHandle {
    /// Stop the listener and wait for its task to finish.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(());
        let _ = self.task.await;
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

impl<K: CacheKey, V: Cacheable> MultiLevelCache<K, V> {
    /// Spawn the subscriber that applies other processes' invalidations to
    /// this engine's upper tiers. It reconnects with exponential backoff
    /// until the returned handle is shut down or dropped.
    pub fn listen_for_invalidations(&self) -> Result<InvalidationHandle, CacheError> {
        let invalidation = self
            .inner
            .invalidation
            .clone()
            .ok_or(CacheError::Unsupported("no remote invalidation configured"))?;
        let cache = self.clone();
        let (shutdown, mut stopped) = watch::channel(());

        let task = tokio::spawn(async move {
            let mut backoff = INITIAL_BACKOFF;
            loop {
                tokio::select! {
                    _ = stopped.changed() => break,
                    result = invalidation.listen_once(&cache) => match result {
                        Ok(()) => {
                            warn!("Invalidation subscription on {} ended, reconnecting", invalidation.channel);
                            backoff = INITIAL_BACKOFF;
                        }
                        Err(e) => {
                            error!(
                                "Invalidation subscribe on {} failed: {}. Retrying in {:?}",
                                invalidation.channel, e, backoff
                            );
                        }
                    },
                }

                tokio::select! {
                    _ = stopped.changed() => break,
                    _ = tokio::time::sleep(backoff) => {}
                }
                backoff = backoff.saturating_mul(2).min(MAX_BACKOFF);
            }
            debug!("Invalidation listener on {} stopped", invalidation.channel);
        });

        Ok(InvalidationHandle { shutdown, task })
    }
}
