use anyhow::Result;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;

use crate::model::{ElemId, Element};
use crate::store::traits::ElementsSource;

/// Cache entry for a looked-up element; `None` caches a miss
#[derive(Clone, Debug)]
struct CacheEntry {
    element: Option<Element>,
    last_accessed: Instant,
}

/// Read-through cache with TTL over another elements source.
///
/// Partial fetches and alias fallback look up the same targets repeatedly;
/// this keeps those lookups off the underlying source.
pub struct CachedElementsSource<S: ElementsSource> {
    inner: S,
    /// Cache entries keyed by element id
    entries: Arc<RwLock<HashMap<ElemId, CacheEntry>>>,
    ttl: Duration,
}

impl<S: ElementsSource> CachedElementsSource<S> {
    /// Create a new cache with 1-hour TTL
    pub fn new(inner: S) -> Self {
        Self::with_ttl(inner, Duration::from_secs(3600))
    }

    pub fn with_ttl(inner: S, ttl: Duration) -> Self {
        Self {
            inner,
            entries: Arc::new(RwLock::new(HashMap::new())),
            ttl,
        }
    }

    /// Cached lookup result if present and not expired
    async fn cached(&self, id: &ElemId) -> Option<Option<Element>> {
        let mut entries = self.entries.write().await;

        if let Some(entry) = entries.get_mut(id) {
            if entry.last_accessed.elapsed() > self.ttl {
                entries.remove(id);
                return None;
            }

            entry.last_accessed = Instant::now();
            Some(entry.element.clone())
        } else {
            None
        }
    }

    pub async fn invalidate(&self, id: &ElemId) {
        self.entries.write().await.remove(id);
    }

    /// Clear all expired entries from cache
    pub async fn clear_expired(&self) {
        let mut entries = self.entries.write().await;
        let now = Instant::now();
        let ttl = self.ttl;
        entries.retain(|_, entry| now.duration_since(entry.last_accessed) <= ttl);
    }

    pub async fn clear(&self) {
        self.entries.write().await.clear();
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }
}

#[async_trait::async_trait]
impl<S: ElementsSource> ElementsSource for CachedElementsSource<S> {
    async fn get(&self, id: &ElemId) -> Result<Option<Element>> {
        if let Some(element) = self.cached(id).await {
            return Ok(element);
        }

        let element = self.inner.get(id).await?;
        self.entries.write().await.insert(
            id.clone(),
            CacheEntry {
                element: element.clone(),
                last_accessed: Instant::now(),
            },
        );
        Ok(element)
    }

    async fn get_all(&self) -> Result<Vec<Element>> {
        self.inner.get_all().await
    }

    async fn list(&self) -> Result<Vec<ElemId>> {
        self.inner.list().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{InstanceElement, Values};
    use crate::store::memory::InMemoryElementsSource;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingSource {
        inner: InMemoryElementsSource,
        gets: AtomicUsize,
    }

    #[async_trait::async_trait]
    impl ElementsSource for CountingSource {
        async fn get(&self, id: &ElemId) -> Result<Option<Element>> {
            self.gets.fetch_add(1, Ordering::SeqCst);
            self.inner.get(id).await
        }
        async fn get_all(&self) -> Result<Vec<Element>> {
            self.inner.get_all().await
        }
        async fn list(&self) -> Result<Vec<ElemId>> {
            self.inner.list().await
        }
    }

    #[tokio::test]
    async fn test_cache_basic_operations() {
        let type_id = ElemId::type_id("zendesk", "brand");
        let brand = InstanceElement::new("main", &type_id, Values::new());
        let id = brand.elem_id.clone();
        let cache = CachedElementsSource::new(CountingSource {
            inner: InMemoryElementsSource::from_elements(vec![Element::Instance(brand)]),
            gets: AtomicUsize::new(0),
        });

        assert!(cache.get(&id).await.unwrap().is_some());
        assert!(cache.get(&id).await.unwrap().is_some());
        assert_eq!(cache.inner.gets.load(Ordering::SeqCst), 1);

        // Misses are cached too
        let missing = ElemId::instance_id("zendesk", "brand", "other");
        assert!(cache.get(&missing).await.unwrap().is_none());
        assert!(cache.get(&missing).await.unwrap().is_none());
        assert_eq!(cache.inner.gets.load(Ordering::SeqCst), 2);
        assert_eq!(cache.len().await, 2);

        cache.invalidate(&id).await;
        assert!(cache.get(&id).await.unwrap().is_some());
        assert_eq!(cache.inner.gets.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_expired_entries_are_refetched() {
        let type_id = ElemId::type_id("zendesk", "brand");
        let brand = InstanceElement::new("main", &type_id, Values::new());
        let id = brand.elem_id.clone();
        let cache = CachedElementsSource::with_ttl(
            CountingSource {
                inner: InMemoryElementsSource::from_elements(vec![Element::Instance(brand)]),
                gets: AtomicUsize::new(0),
            },
            Duration::from_millis(0),
        );

        cache.get(&id).await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
        cache.clear_expired().await;
        assert_eq!(cache.len().await, 0);
        cache.get(&id).await.unwrap();
        assert_eq!(cache.inner.gets.load(Ordering::SeqCst), 2);
    }
}
