use std::sync::Mutex;
use std::time::{Duration, Instant};

use super::Clustering;

const DEFAULT_TTL: Duration = Duration::from_secs(5);

/// Read-through cache of the active clustering row.
///
/// Purely an optimisation: `commit_clustering` invalidates it before
/// returning, so a stale entry can only outlive a commit made through
/// another `Database` handle, and then for at most one TTL.
pub struct ActiveClusteringCache {
    ttl: Duration,
    entry: Mutex<Option<(Instant, Option<Clustering>)>>,
}

impl Default for ActiveClusteringCache {
    fn default() -> Self {
        Self::with_ttl(DEFAULT_TTL)
    }
}

impl ActiveClusteringCache {
    pub fn with_ttl(ttl: Duration) -> Self {
        Self {
            ttl,
            entry: Mutex::new(None),
        }
    }

    /// `Some(value)` on a fresh hit; `None` when the caller must query.
    pub fn get(&self) -> Option<Option<Clustering>> {
        let entry = self.entry.lock().ok()?;
        match entry.as_ref() {
            Some((stored_at, value)) if stored_at.elapsed() < self.ttl => Some(value.clone()),
            _ => None,
        }
    }

    pub fn store(&self, value: Option<Clustering>) {
        if let Ok(mut entry) = self.entry.lock() {
            *entry = Some((Instant::now(), value));
        }
    }

    pub fn invalidate(&self) {
        if let Ok(mut entry) = self.entry.lock() {
            *entry = None;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn clustering(id: i64) -> Clustering {
        Clustering {
            clustering_id: id,
            threshold: 50.0,
            created_at: String::new(),
            is_active: true,
        }
    }

    #[test]
    fn test_hit_then_invalidate() {
        let cache = ActiveClusteringCache::default();
        assert!(cache.get().is_none());

        cache.store(Some(clustering(3)));
        assert_eq!(cache.get().unwrap().unwrap().clustering_id, 3);

        cache.invalidate();
        assert!(cache.get().is_none());
    }

    #[test]
    fn test_caches_absence() {
        let cache = ActiveClusteringCache::default();
        cache.store(None);
        assert_eq!(cache.get(), Some(None));
    }

    #[test]
    fn test_expires_after_ttl() {
        let cache = ActiveClusteringCache::with_ttl(Duration::from_millis(0));
        cache.store(Some(clustering(1)));
        assert!(cache.get().is_none());
    }
}
