use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use crate::error::{Error, Result};

type Factory<P> = dyn Fn(&str) -> Result<P> + Send + Sync;

/// Process-wide map from connection URI to a shared pool.
///
/// Pools are created lazily on first `open` and reused afterwards. When two
/// callers race on the same URI the first stored pool wins and the other is
/// discarded; pools connect lazily so the loser never touched the network.
pub struct PoolCache<P> {
    pools: RwLock<HashMap<String, P>>,
    factory: Arc<Factory<P>>,
}

impl<P: Clone> PoolCache<P> {
    pub fn new(factory: impl Fn(&str) -> Result<P> + Send + Sync + 'static) -> Self {
        Self {
            pools: RwLock::new(HashMap::new()),
            factory: Arc::new(factory),
        }
    }

    pub fn open(&self, uri: &str) -> Result<P> {
        {
            let pools = self.pools.read().map_err(|_| poisoned())?;
            if let Some(pool) = pools.get(uri) {
                return Ok(pool.clone());
            }
        }

        let created = (self.factory)(uri)?;
        let mut pools = self.pools.write().map_err(|_| poisoned())?;
        let pool = pools.entry(uri.to_string()).or_insert(created);
        Ok(pool.clone())
    }

    pub fn len(&self) -> usize {
        self.pools.read().map(|p| p.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Remove every pool, handing them back for teardown.
    pub fn drain(&self) -> Vec<P> {
        match self.pools.write() {
            Ok(mut pools) => pools.drain().map(|(_, p)| p).collect(),
            Err(_) => Vec::new(),
        }
    }
}

impl PoolCache<deadpool_postgres::Pool> {
    pub fn postgres() -> Self {
        Self::new(super::create_pool)
    }

    pub fn close(&self) {
        for pool in self.drain() {
            pool.close();
        }
    }
}

impl PoolCache<mysql_async::Pool> {
    pub fn mysql() -> Self {
        Self::new(super::create_mysql_pool)
    }

    pub async fn close(&self) {
        for pool in self.drain() {
            if let Err(e) = pool.disconnect().await {
                tracing::warn!(error = %e, "failed to disconnect mysql pool");
            }
        }
    }
}

fn poisoned() -> Error {
    Error::Connection("pool cache lock poisoned".into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_open_reuses_pool_per_uri() {
        let created = Arc::new(AtomicUsize::new(0));
        let counter = created.clone();
        let cache = PoolCache::new(move |uri: &str| {
            let n = counter.fetch_add(1, Ordering::SeqCst);
            Ok(Arc::new(format!("{uri}#{n}")))
        });

        let a = cache.open("postgres://a").unwrap();
        let b = cache.open("postgres://a").unwrap();
        let c = cache.open("postgres://c").unwrap();

        assert!(Arc::ptr_eq(&a, &b));
        assert!(!Arc::ptr_eq(&a, &c));
        assert_eq!(created.load(Ordering::SeqCst), 2);
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn test_factory_error_is_not_cached() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let counter = attempts.clone();
        let cache = PoolCache::new(move |_: &str| -> Result<Arc<()>> {
            if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                Err(Error::Config("boom".into()))
            } else {
                Ok(Arc::new(()))
            }
        });

        assert!(cache.open("x").is_err());
        assert!(cache.is_empty());
        assert!(cache.open("x").is_ok());
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_concurrent_open_converges_on_one_pool() {
        let cache = Arc::new(PoolCache::new(|_: &str| Ok(Arc::new(()))));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let cache = cache.clone();
                std::thread::spawn(move || cache.open("shared").unwrap())
            })
            .collect();
        let pools: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        let stored = cache.open("shared").unwrap();
        assert!(pools.iter().all(|p| Arc::ptr_eq(p, &stored)));
    }

    #[test]
    fn test_drain_empties_cache() {
        let cache = PoolCache::new(|uri: &str| Ok(uri.to_string()));
        cache.open("a").unwrap();
        cache.open("b").unwrap();
        let mut drained = cache.drain();
        drained.sort();
        assert_eq!(drained, vec!["a".to_string(), "b".to_string()]);
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn test_postgres_cache_builds_lazy_pools() {
        let cache = PoolCache::postgres();
        let pool = cache
            .open("postgres://postgres@127.0.0.1:1/postgres?sslmode=disable")
            .unwrap();
        assert_eq!(pool.status().size, 0);
        cache.close();
        assert!(cache.is_empty());
    }
}
