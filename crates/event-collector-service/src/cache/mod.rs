//! Dedup and metadata caches.
//!
//! Both are best-effort: a cache failure never stops the pipeline. Dedup
//! errors degrade to "not a duplicate" (the store's primary key absorbs the
//! rare duplicate that slips through) and every degradation is counted.

use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use event_collector_core::{CollectorError, CollectorResult, Event};

use crate::monitoring::metrics::{CACHE_ERRORS_TOTAL, CACHE_HITS_TOTAL, CACHE_MISSES_TOTAL};

/// Bound on any single cache round trip; the hot path never waits longer.
const CACHE_OP_TIMEOUT: Duration = Duration::from_millis(500);

fn dedup_key(event_id: &str) -> String {
    format!("dedup:{}", event_id)
}

fn meta_key(service: &str, version: &str, environment: &str) -> String {
    format!("meta:{}:{}:{}", service, version, environment)
}

/// Best-effort duplicate detection against an external key/value cache.
///
/// Runs disabled (every probe is a miss) when no cache URL is configured.
#[derive(Clone)]
pub struct DedupCache {
    manager: Option<ConnectionManager>,
    ttl: Duration,
}

impl DedupCache {
    /// Connect to the cache, or build a disabled client when `url` is None.
    /// An unreachable configured cache is a startup failure; runtime errors
    /// degrade instead.
    pub async fn connect(url: Option<&str>, ttl: Duration) -> CollectorResult<Self> {
        let manager = match url {
            Some(url) => {
                let client =
                    redis::Client::open(url).map_err(|e| CollectorError::CacheError {
                        message: format!("invalid cache URL: {}", e),
                    })?;
                let manager = client.get_connection_manager().await.map_err(|e| {
                    CollectorError::CacheError {
                        message: format!("cache connection failed: {}", e),
                    }
                })?;
                Some(manager)
            }
            None => None,
        };
        Ok(Self { manager, ttl })
    }

    pub fn enabled(&self) -> bool {
        self.manager.is_some()
    }

    /// Share the underlying connection with the metadata cache.
    pub fn connection(&self) -> Option<ConnectionManager> {
        self.manager.clone()
    }

    /// Has this event id been marked processed within the dedup TTL?
    ///
    /// Cache failures return `false`: availability over strict idempotence.
    pub async fn is_duplicate(&self, event_id: &str) -> bool {
        let Some(manager) = &self.manager else {
            return false;
        };
        let mut conn = manager.clone();
        let probe = tokio::time::timeout(
            CACHE_OP_TIMEOUT,
            conn.exists::<_, bool>(dedup_key(event_id)),
        )
        .await;

        match probe {
            Ok(Ok(exists)) => exists,
            Ok(Err(e)) => {
                CACHE_ERRORS_TOTAL.inc();
                tracing::warn!(error = %e, event_id, "dedup probe failed, treating as new");
                false
            }
            Err(_) => {
                CACHE_ERRORS_TOTAL.inc();
                tracing::warn!(event_id, "dedup probe timed out, treating as new");
                false
            }
        }
    }

    /// Atomically mark an event id processed (`SET .. NX EX ttl`).
    ///
    /// Returns whether the mark was newly set; errors degrade to `false`.
    pub async fn mark_processed(&self, event_id: &str) -> bool {
        let Some(manager) = &self.manager else {
            return false;
        };
        let mut conn = manager.clone();
        let mut set = redis::cmd("SET");
        set.arg(dedup_key(event_id))
            .arg(1)
            .arg("NX")
            .arg("EX")
            .arg(self.ttl.as_secs());

        match tokio::time::timeout(
            CACHE_OP_TIMEOUT,
            set.query_async::<_, Option<String>>(&mut conn),
        )
        .await
        {
            Ok(Ok(reply)) => reply.is_some(),
            Ok(Err(e)) => {
                CACHE_ERRORS_TOTAL.inc();
                tracing::warn!(error = %e, event_id, "dedup mark failed");
                false
            }
            Err(_) => {
                CACHE_ERRORS_TOTAL.inc();
                tracing::warn!(event_id, "dedup mark timed out");
                false
            }
        }
    }

    /// Connectivity probe for the health surface.
    pub async fn ping(&self) -> CollectorResult<()> {
        let Some(manager) = &self.manager else {
            return Ok(());
        };
        let mut conn = manager.clone();
        let ping = redis::cmd("PING");
        tokio::time::timeout(CACHE_OP_TIMEOUT, ping.query_async::<_, String>(&mut conn))
            .await
            .map_err(|_| CollectorError::CacheError {
                message: "cache ping timed out".to_string(),
            })?
            .map_err(|e| CollectorError::CacheError {
                message: e.to_string(),
            })?;
        Ok(())
    }
}

/// Counter snapshot used by the adaptive batch sizer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CacheCounters {
    pub hits: u64,
    pub misses: u64,
}

struct MetadataEntry {
    attributes: Arc<Value>,
    inserted_at: Instant,
}

/// Read-mostly cache of serialized source attributes keyed by
/// `(service, version, environment)`.
///
/// Entries are immutable after insertion and expire after the metadata TTL.
/// Hit/miss telemetry feeds the batcher's adaptive sizing. When a cache
/// connection is available, misses read through `meta:{service}:{version}:{env}`
/// so restarts start warm.
pub struct MetadataCache {
    entries: RwLock<HashMap<(String, String, String), MetadataEntry>>,
    manager: Option<ConnectionManager>,
    ttl: Duration,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl MetadataCache {
    pub fn new(manager: Option<ConnectionManager>, ttl: Duration) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            manager,
            ttl,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Serialized source identity for the event, cached per
    /// (service, version, environment).
    pub async fn source_attributes(&self, event: &Event) -> Arc<Value> {
        let key = event.source_key();

        if let Some(attributes) = self.local_get(&key) {
            self.hits.fetch_add(1, Ordering::Relaxed);
            CACHE_HITS_TOTAL.inc();
            return attributes;
        }

        self.misses.fetch_add(1, Ordering::Relaxed);
        CACHE_MISSES_TOTAL.inc();

        let attributes = match self.remote_get(&key).await {
            Some(remote) => Arc::new(remote),
            None => {
                let built = build_source_attributes(event);
                self.remote_put(&key, &built).await;
                Arc::new(built)
            }
        };

        let mut entries = self.entries.write().expect("metadata cache lock");
        entries.insert(
            key,
            MetadataEntry {
                attributes: attributes.clone(),
                inserted_at: Instant::now(),
            },
        );
        attributes
    }

    pub fn counters(&self) -> CacheCounters {
        CacheCounters {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
        }
    }

    fn local_get(&self, key: &(String, String, String)) -> Option<Arc<Value>> {
        let entries = self.entries.read().expect("metadata cache lock");
        let entry = entries.get(key)?;
        if entry.inserted_at.elapsed() > self.ttl {
            return None;
        }
        Some(entry.attributes.clone())
    }

    async fn remote_get(&self, key: &(String, String, String)) -> Option<Value> {
        let manager = self.manager.as_ref()?;
        let mut conn = manager.clone();
        let get = conn.get::<_, Option<String>>(meta_key(&key.0, &key.1, &key.2));
        match tokio::time::timeout(CACHE_OP_TIMEOUT, get).await {
            Ok(Ok(Some(raw))) => serde_json::from_str(&raw).ok(),
            Ok(Ok(None)) => None,
            Ok(Err(e)) => {
                CACHE_ERRORS_TOTAL.inc();
                tracing::debug!(error = %e, "metadata read-through failed");
                None
            }
            Err(_) => {
                CACHE_ERRORS_TOTAL.inc();
                None
            }
        }
    }

    async fn remote_put(&self, key: &(String, String, String), value: &Value) {
        let Some(manager) = &self.manager else {
            return;
        };
        let mut conn = manager.clone();
        let raw = value.to_string();
        let set = conn.set_ex::<_, _, ()>(meta_key(&key.0, &key.1, &key.2), raw, self.ttl.as_secs());
        if let Ok(Err(e)) = tokio::time::timeout(CACHE_OP_TIMEOUT, set).await {
            CACHE_ERRORS_TOTAL.inc();
            tracing::debug!(error = %e, "metadata write-through failed");
        }
    }
}

fn build_source_attributes(event: &Event) -> Value {
    let source = &event.header.source;
    let mut attributes = serde_json::json!({
        "service": source.service,
        "version": source.version,
    });
    let object = attributes.as_object_mut().expect("literal object");
    if let Some(instance) = &source.instance {
        object.insert("instance".to_string(), Value::String(instance.clone()));
    }
    if let Some(region) = &source.region {
        object.insert("region".to_string(), Value::String(region.clone()));
    }
    if let Some(environment) = &event.header.metadata.environment {
        object.insert(
            "environment".to_string(),
            Value::String(environment.clone()),
        );
    }
    attributes
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use event_collector_core::{
        EventHeader, EventMetadata, EventPayload, EventSource, LogData,
    };
    use uuid::Uuid;

    fn event(service: &str, environment: Option<&str>) -> Event {
        let data = LogData {
            level: Some("INFO".to_string()),
            message: Some("hello".to_string()),
            timestamp: Some(Utc::now()),
            ..Default::default()
        };
        Event {
            header: EventHeader {
                event_id: Uuid::new_v4().to_string(),
                event_type: "log.user.created".to_string(),
                schema_version: "1.0.0".to_string(),
                timestamp: Utc::now(),
                correlation_id: Uuid::new_v4().to_string(),
                causation_id: None,
                source: EventSource {
                    service: service.to_string(),
                    version: "1.0.0".to_string(),
                    instance: Some("pod-7".to_string()),
                    region: None,
                },
                tracing: None,
                metadata: EventMetadata {
                    environment: environment.map(str::to_string),
                    ..Default::default()
                },
            },
            raw_data: serde_json::to_value(&data).unwrap(),
            payload: EventPayload::Log(data),
        }
    }

    #[tokio::test]
    async fn repeated_lookups_hit_after_first_miss() {
        let cache = MetadataCache::new(None, Duration::from_secs(3600));
        let event = event("user-service", Some("staging"));

        let first = cache.source_attributes(&event).await;
        assert_eq!(first["service"], "user-service");
        assert_eq!(first["environment"], "staging");
        assert_eq!(cache.counters(), CacheCounters { hits: 0, misses: 1 });

        let second = cache.source_attributes(&event).await;
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(cache.counters(), CacheCounters { hits: 1, misses: 1 });
    }

    #[tokio::test]
    async fn different_sources_get_distinct_entries() {
        let cache = MetadataCache::new(None, Duration::from_secs(3600));
        cache.source_attributes(&event("user-service", None)).await;
        cache.source_attributes(&event("order-service", None)).await;
        assert_eq!(cache.counters().misses, 2);
    }

    #[tokio::test]
    async fn expired_entries_rebuild() {
        let cache = MetadataCache::new(None, Duration::from_millis(10));
        let event = event("user-service", None);
        cache.source_attributes(&event).await;
        tokio::time::sleep(Duration::from_millis(25)).await;
        cache.source_attributes(&event).await;
        assert_eq!(cache.counters().misses, 2);
    }

    #[tokio::test]
    async fn disabled_dedup_cache_never_reports_duplicates() {
        let cache = DedupCache::connect(None, Duration::from_secs(60)).await.unwrap();
        assert!(!cache.enabled());
        assert!(!cache.is_duplicate("some-id").await);
        assert!(!cache.mark_processed("some-id").await);
        cache.ping().await.unwrap();
    }

    #[test]
    fn keys_follow_the_wire_contract() {
        assert_eq!(dedup_key("abc"), "dedup:abc");
        assert_eq!(
            meta_key("user-service", "1.0.0", "production"),
            "meta:user-service:1.0.0:production"
        );
    }
}
