//! Per-origin quota accounting
use async_trait::async_trait;
use cachestorage_core::{Origin, Result};
use dashmap::DashMap;
use tracing::trace;

/// Source of truth for how much an origin may store
#[async_trait]
pub trait QuotaManager: Send + Sync {
    /// Current `(usage, quota)` in bytes for `origin`
    async fn get_usage_and_quota(&self, origin: &Origin) -> Result<(u64, u64)>;

    /// Record that `origin`'s stored size changed by `delta` bytes
    async fn notify_storage_modified(&self, origin: &Origin, delta: i64);
}

/// Bytes still available to `origin`
pub async fn remaining_quota(quota: &dyn QuotaManager, origin: &Origin) -> Result<u64> {
    let (usage, quota) = quota.get_usage_and_quota(origin).await?;
    Ok(quota.saturating_sub(usage))
}

/// Quota manager granting every origin the same fixed allowance
#[derive(Debug)]
pub struct FixedQuotaManager {
    quota: u64,
    usage: DashMap<Origin, i64>,
}

impl FixedQuotaManager {
    pub fn new(quota: u64) -> Self {
        Self {
            quota,
            usage: DashMap::new(),
        }
    }

    pub fn usage(&self, origin: &Origin) -> u64 {
        self.usage
            .get(origin)
            .map_or(0, |usage| (*usage.value()).max(0) as u64)
    }
}

#[async_trait]
impl QuotaManager for FixedQuotaManager {
    async fn get_usage_and_quota(&self, origin: &Origin) -> Result<(u64, u64)> {
        Ok((self.usage(origin), self.quota))
    }

    async fn notify_storage_modified(&self, origin: &Origin, delta: i64) {
        let mut usage = self.usage.entry(origin.clone()).or_insert(0);
        *usage = usage.saturating_add(delta).max(0);
        trace!("Origin {} usage now {} bytes ({:+})", origin, *usage, delta);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_usage_tracks_deltas_and_clamps() {
        let quota = FixedQuotaManager::new(1000);
        let origin = Origin::parse("https://example.com").unwrap();

        quota.notify_storage_modified(&origin, 600).await;
        assert_eq!(remaining_quota(&quota, &origin).await.unwrap(), 400);

        quota.notify_storage_modified(&origin, -900).await;
        assert_eq!(quota.usage(&origin), 0);
        assert_eq!(
            quota.get_usage_and_quota(&origin).await.unwrap(),
            (0, 1000)
        );
    }

    #[tokio::test]
    async fn test_origins_are_independent() {
        let quota = FixedQuotaManager::new(10);
        let a = Origin::parse("https://a.example").unwrap();
        let b = Origin::parse("https://b.example").unwrap();

        quota.notify_storage_modified(&a, 25).await;
        assert_eq!(remaining_quota(&quota, &a).await.unwrap(), 0);
        assert_eq!(remaining_quota(&quota, &b).await.unwrap(), 10);
    }
}
