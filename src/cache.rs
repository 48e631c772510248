// =============================================================================
// OCCUPANCY CACHE
// =============================================================================
// Optional Redis read-through cache for occupancy summaries.
//
// Entries are dropped whenever the change feed reports a bed or department
// change, with a short TTL as a backstop. Every Redis failure is treated as a
// cache miss; the store stays the source of truth.
// =============================================================================

use std::time::Instant;

use redis::aio::ConnectionManager;
use serde::{de::DeserializeOwned, Serialize};
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::feed::ChangeFeed;
use crate::metrics;

/// Cached list of every department's occupancy
pub const OCCUPANCY_ALL_KEY: &str = "ward:occupancy:all";

/// Seconds before a cached entry expires on its own
pub const OCCUPANCY_TTL_SECS: u64 = 30;

pub fn department_key(department_id: Uuid) -> String {
    format!("ward:occupancy:{}", department_id)
}

#[derive(Clone)]
pub struct OccupancyCache {
    redis: Option<ConnectionManager>,
}

impl OccupancyCache {
    /// Cache that always misses
    pub fn disabled() -> Self {
        Self { redis: None }
    }

    pub async fn connect(redis_url: &str) -> anyhow::Result<Self> {
        let client = redis::Client::open(redis_url)?;
        let conn = ConnectionManager::new(client).await?;
        Ok(Self { redis: Some(conn) })
    }

    pub fn is_enabled(&self) -> bool {
        self.redis.is_some()
    }

    /// `None` when the cache is disabled
    pub async fn ping(&self) -> Option<bool> {
        let mut conn = self.redis.clone()?;
        Some(
            redis::cmd("PING")
                .query_async::<_, String>(&mut conn)
                .await
                .is_ok(),
        )
    }

    pub async fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let mut conn = self.redis.clone()?;
        let start = Instant::now();
        let cached = redis::cmd("GET")
            .arg(key)
            .query_async::<_, Option<String>>(&mut conn)
            .await;
        metrics::record_redis_operation("get", start.elapsed().as_secs_f64());

        match cached {
            Ok(Some(json)) => serde_json::from_str(&json).ok(),
            Ok(None) => None,
            Err(e) => {
                tracing::debug!(key, error = %e, "Cache read failed");
                None
            }
        }
    }

    pub async fn put<T: Serialize>(&self, key: &str, value: &T) {
        let Some(mut conn) = self.redis.clone() else {
            return;
        };
        let Ok(json) = serde_json::to_string(value) else {
            return;
        };
        let start = Instant::now();
        let result = redis::cmd("SETEX")
            .arg(key)
            .arg(OCCUPANCY_TTL_SECS)
            .arg(json)
            .query_async::<_, ()>(&mut conn)
            .await;
        metrics::record_redis_operation("set", start.elapsed().as_secs_f64());
        if let Err(e) = result {
            tracing::debug!(key, error = %e, "Cache write failed");
        }
    }

    /// Drop the all-departments summary and, when given, one department's entry
    pub async fn invalidate(&self, department_id: Option<Uuid>) {
        let Some(mut conn) = self.redis.clone() else {
            return;
        };
        let mut cmd = redis::cmd("DEL");
        cmd.arg(OCCUPANCY_ALL_KEY);
        if let Some(id) = department_id {
            cmd.arg(department_key(id));
        }
        let start = Instant::now();
        let result = cmd.query_async::<_, ()>(&mut conn).await;
        metrics::record_redis_operation("delete", start.elapsed().as_secs_f64());
        if let Err(e) = result {
            tracing::warn!(error = %e, "Cache invalidation failed");
        }
    }

    /// Invalidate entries as change events arrive. Ends when the feed closes.
    pub fn spawn_invalidator(&self, feed: &ChangeFeed) -> JoinHandle<()> {
        let cache = self.clone();
        let mut events = feed.subscribe();
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(event) => {
                        if let Some(department_id) = event.department_id() {
                            cache.invalidate(Some(department_id)).await;
                        }
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        // Per-department entries age out via TTL
                        tracing::warn!(skipped, "Cache invalidator lagged");
                        cache.invalidate(None).await;
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::feed::ChangeEvent;

    #[tokio::test]
    async fn disabled_cache_always_misses() {
        let cache = OccupancyCache::disabled();
        cache.put(OCCUPANCY_ALL_KEY, &vec![1, 2, 3]).await;
        assert_eq!(cache.get::<Vec<i32>>(OCCUPANCY_ALL_KEY).await, None);
        assert_eq!(cache.ping().await, None);
        assert!(!cache.is_enabled());
    }

    #[tokio::test]
    async fn invalidator_exits_when_feed_is_dropped() {
        let feed = ChangeFeed::new(4);
        let handle = OccupancyCache::disabled().spawn_invalidator(&feed);
        feed.publish(ChangeEvent::DepartmentChanged {
            department_id: Uuid::new_v4(),
        });
        drop(feed);
        handle.await.unwrap();
    }
}
