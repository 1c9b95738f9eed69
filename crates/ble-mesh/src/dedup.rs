//! Bounded, time-windowed set of recently seen envelope ids

use crate::envelope::EnvelopeId;
use lru::LruCache;
use std::num::NonZeroUsize;
use std::time::Duration;
use tokio::time::Instant;

/// Tracks envelope ids seen within `window`, evicting the least recently
/// seen id once `capacity` is reached.
pub struct SeenCache {
    entries: LruCache<EnvelopeId, Instant>,
    window: Duration,
}

impl SeenCache {
    pub fn new(capacity: usize, window: Duration) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: LruCache::new(capacity),
            window,
        }
    }

    /// Record `id`; returns `true` if it was not seen within the window
    pub fn insert(&mut self, id: EnvelopeId) -> bool {
        let now = Instant::now();

        if let Some(seen_at) = self.entries.get(&id) {
            if now.duration_since(*seen_at) <= self.window {
                return false;
            }
        }

        self.entries.put(id, now);
        true
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use uuid::Uuid;

    impl SeenCache {
        fn contains(&self, id: &EnvelopeId) -> bool {
            match self.entries.peek(id) {
                Some(seen_at) => Instant::now().duration_since(*seen_at) <= self.window,
                None => false,
            }
        }

        fn len(&self) -> usize {
            self.entries.len()
        }
    }

    #[test]
    fn test_duplicate_detection() {
        let mut cache = SeenCache::new(16, Duration::from_secs(60));
        let id = Uuid::new_v4();

        assert!(!cache.contains(&id));
        assert!(cache.insert(id));
        assert!(cache.contains(&id));
        assert!(!cache.insert(id));
    }

    #[test]
    fn test_capacity_evicts_oldest() {
        let mut cache = SeenCache::new(2, Duration::from_secs(60));
        let first = Uuid::new_v4();
        let second = Uuid::new_v4();
        let third = Uuid::new_v4();

        cache.insert(first);
        cache.insert(second);
        cache.insert(third);

        assert_eq!(cache.len(), 2);
        assert!(!cache.contains(&first));
        assert!(cache.contains(&third));
    }

    #[tokio::test(start_paused = true)]
    async fn test_window_expiry_allows_redelivery() {
        let mut cache = SeenCache::new(16, Duration::from_secs(5));
        let id = Uuid::new_v4();

        assert!(cache.insert(id));
        tokio::time::advance(Duration::from_secs(4)).await;
        assert!(!cache.insert(id));

        tokio::time::advance(Duration::from_secs(6)).await;
        assert!(cache.insert(id));
    }

    #[test]
    fn test_zero_capacity_is_clamped() {
        let mut cache = SeenCache::new(0, Duration::from_secs(1));
        assert!(cache.insert(Uuid::new_v4()));
        assert_eq!(cache.len(), 1);
    }

    proptest! {
        #[test]
        fn prop_each_id_accepted_once(count in 1usize..200) {
            let mut cache = SeenCache::new(1024, Duration::from_secs(60));
            let ids: Vec<Uuid> = (0..count).map(|_| Uuid::new_v4()).collect();

            for id in &ids {
                prop_assert!(cache.insert(*id));
            }
            for id in &ids {
                prop_assert!(!cache.insert(*id));
            }
            prop_assert_eq!(cache.len(), count);
        }
    }
}
