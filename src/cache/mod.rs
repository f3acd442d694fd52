//! View caches and the entity index used to invalidate them
//!
//! A cache records which entities each of its entries depends on through
//! the [`CacheRegistry`]. Invalidating an entity only touches the caches
//! that registered it.

use crate::core::event_bus::EntityRef;
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::hash::Hash;
use std::sync::Arc;
use tokio::sync::RwLock;

/// A cache of derived views that can drop entries for one entity
#[async_trait]
pub trait ViewCache: Send + Sync {
    fn name(&self) -> &str;

    /// Drop every entry derived from `entity`. Returns the number dropped.
    async fn invalidate(&self, entity: &EntityRef) -> usize;

    async fn clear(&self);

    async fn len(&self) -> usize;
}

/// Entity → cache index
#[derive(Default)]
pub struct CacheRegistry {
    caches: RwLock<HashMap<String, Arc<dyn ViewCache>>>,
    index: RwLock<HashMap<EntityRef, HashSet<String>>>,
}

impl CacheRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn register(&self, cache: Arc<dyn ViewCache>) {
        self.caches.write().await.insert(cache.name().to_string(), cache);
    }

    /// Record that `cache` holds something derived from `entity`
    pub async fn track(&self, cache: &str, entity: EntityRef) {
        self.index
            .write()
            .await
            .entry(entity)
            .or_default()
            .insert(cache.to_string());
    }

    /// Invalidate `entity` in the caches that registered it.
    /// Returns the names of the caches that were touched.
    pub async fn invalidate(&self, entity: &EntityRef) -> Vec<String> {
        let Some(names) = self.index.write().await.remove(entity) else {
            return Vec::new();
        };

        let caches = self.caches.read().await;
        let mut touched: Vec<String> = Vec::with_capacity(names.len());
        for name in names {
            if let Some(cache) = caches.get(&name) {
                let dropped = cache.invalidate(entity).await;
                tracing::trace!(cache = %name, entity = ?entity, dropped, "Cache invalidated");
                touched.push(name);
            }
        }
        touched.sort();
        touched
    }

    pub async fn invalidate_all(&self, entities: &[EntityRef]) -> usize {
        let mut touched = 0;
        for entity in entities {
            touched += self.invalidate(entity).await.len();
        }
        touched
    }

    /// Drop everything, used after a full pass or a session switch
    pub async fn clear(&self) {
        self.index.write().await.clear();
        for cache in self.caches.read().await.values() {
            cache.clear().await;
        }
    }

    pub async fn tracked(&self, entity: &EntityRef) -> bool {
        self.index.read().await.contains_key(entity)
    }
}

/// Values keyed by the entity they describe, such as decoded thumbnails
pub struct EntityCache<V> {
    name: String,
    registry: Arc<CacheRegistry>,
    entries: RwLock<HashMap<EntityRef, V>>,
}

impl<V: Clone + Send + Sync + 'static> EntityCache<V> {
    pub async fn new(name: impl Into<String>, registry: Arc<CacheRegistry>) -> Arc<Self> {
        let cache = Arc::new(Self {
            name: name.into(),
            registry: registry.clone(),
            entries: RwLock::new(HashMap::new()),
        });
        registry.register(cache.clone()).await;
        cache
    }

    pub async fn get(&self, entity: &EntityRef) -> Option<V> {
        self.entries.read().await.get(entity).cloned()
    }

    pub async fn insert(&self, entity: EntityRef, value: V) {
        self.registry.track(&self.name, entity.clone()).await;
        self.entries.write().await.insert(entity, value);
    }
}

#[async_trait]
impl<V: Clone + Send + Sync + 'static> ViewCache for EntityCache<V> {
    fn name(&self) -> &str {
        &self.name
    }

    async fn invalidate(&self, entity: &EntityRef) -> usize {
        usize::from(self.entries.write().await.remove(entity).is_some())
    }

    async fn clear(&self) {
        self.entries.write().await.clear();
    }

    async fn len(&self) -> usize {
        self.entries.read().await.len()
    }
}

/// Listing results keyed by query; an entry depends on every entity it shows
pub struct ResultSetCache<K, V> {
    name: String,
    registry: Arc<CacheRegistry>,
    entries: RwLock<HashMap<K, (V, HashSet<EntityRef>)>>,
}

impl<K, V> ResultSetCache<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    pub async fn new(name: impl Into<String>, registry: Arc<CacheRegistry>) -> Arc<Self> {
        let cache = Arc::new(Self {
            name: name.into(),
            registry: registry.clone(),
            entries: RwLock::new(HashMap::new()),
        });
        registry.register(cache.clone()).await;
        cache
    }

    pub async fn get(&self, key: &K) -> Option<V> {
        self.entries.read().await.get(key).map(|(v, _)| v.clone())
    }

    pub async fn insert(&self, key: K, value: V, depends_on: Vec<EntityRef>) {
        for entity in &depends_on {
            self.registry.track(&self.name, entity.clone()).await;
        }
        self.entries
            .write()
            .await
            .insert(key, (value, depends_on.into_iter().collect()));
    }
}

#[async_trait]
impl<K, V> ViewCache for ResultSetCache<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    fn name(&self) -> &str {
        &self.name
    }

    async fn invalidate(&self, entity: &EntityRef) -> usize {
        let mut entries = self.entries.write().await;
        let before = entries.len();
        entries.retain(|_, (_, deps)| !deps.contains(entity));
        before - entries.len()
    }

    async fn clear(&self) {
        self.entries.write().await.clear();
    }

    async fn len(&self) -> usize {
        self.entries.read().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_only_affected_caches_invalidated() {
        let registry = Arc::new(CacheRegistry::new());
        let thumbs: Arc<EntityCache<Vec<u8>>> = EntityCache::new("thumbnails", registry.clone()).await;
        let listings: Arc<ResultSetCache<String, Vec<String>>> =
            ResultSetCache::new("series_books", registry.clone()).await;

        thumbs.insert(EntityRef::book("b1"), vec![1]).await;
        thumbs.insert(EntityRef::book("b2"), vec![2]).await;
        listings
            .insert(
                "s1".to_string(),
                vec!["b2".to_string(), "b3".to_string()],
                vec![EntityRef::series("s1"), EntityRef::book("b2"), EntityRef::book("b3")],
            )
            .await;

        assert_eq!(registry.invalidate(&EntityRef::book("b1")).await, vec!["thumbnails"]);
        assert!(thumbs.get(&EntityRef::book("b1")).await.is_none());
        assert_eq!(listings.len().await, 1);

        assert_eq!(registry.invalidate(&EntityRef::book("b3")).await, vec!["series_books"]);
        assert_eq!(listings.len().await, 0);
        assert_eq!(thumbs.get(&EntityRef::book("b2")).await, Some(vec![2]));

        assert_eq!(
            registry.invalidate(&EntityRef::book("b2")).await,
            vec!["series_books", "thumbnails"]
        );
        assert!(registry.invalidate(&EntityRef::book("b2")).await.is_empty());
        assert!(!registry.tracked(&EntityRef::library("l1")).await);
    }

    #[tokio::test]
    async fn test_clear() {
        let registry = Arc::new(CacheRegistry::new());
        let thumbs: Arc<EntityCache<u32>> = EntityCache::new("thumbnails", registry.clone()).await;
        thumbs.insert(EntityRef::series("s1"), 7).await;

        registry.clear().await;
        assert_eq!(thumbs.len().await, 0);
        assert!(!registry.tracked(&EntityRef::series("s1")).await);
    }
}
