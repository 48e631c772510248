//! Activity log.
//!
//! Append-only audit trail of state-changing operations. Writing an entry is
//! best-effort and never fails the operation it describes.

use std::sync::Arc;

use crate::error::AppResult;
use crate::models::{Activity, ActivityKind};
use crate::store::CapacityStore;

/// Largest page `recent` will return
pub const MAX_RECENT: i64 = 200;

#[derive(Clone)]
pub struct ActivityLog {
    store: Arc<dyn CapacityStore>,
}

impl ActivityLog {
    pub fn new(store: Arc<dyn CapacityStore>) -> Self {
        Self { store }
    }

    /// Append an entry and report whether the write succeeded
    pub async fn record(
        &self,
        kind: ActivityKind,
        message: impl Into<String>,
        actor: &str,
    ) -> AppResult<()> {
        let activity = Activity::new(kind, message, actor);
        tracing::debug!(kind = %activity.kind, message = %activity.message, actor, "Activity");
        self.store.append_activity(activity).await
    }

    /// Append an entry, logging a warning on failure
    pub async fn record_best_effort(&self, kind: ActivityKind, message: impl Into<String>, actor: &str) {
        if let Err(e) = self.record(kind, message, actor).await {
            tracing::warn!(kind = %kind, error = %e, "Failed to write activity log entry");
        }
    }

    /// Newest first, `limit` clamped to 1..=MAX_RECENT
    pub async fn recent(&self, limit: i64) -> AppResult<Vec<Activity>> {
        self.store.recent_activities(limit.clamp(1, MAX_RECENT)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    #[tokio::test]
    async fn recent_returns_newest_first_and_clamps_limit() {
        let log = ActivityLog::new(Arc::new(MemoryStore::new()));
        log.record(ActivityKind::BedsAdded, "first", "ops").await.unwrap();
        log.record(ActivityKind::BedReleased, "second", "ops").await.unwrap();

        let recent = log.recent(0).await.unwrap();
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].message, "second");

        let all = log.recent(10_000).await.unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[1].actor, "ops");
    }
}
