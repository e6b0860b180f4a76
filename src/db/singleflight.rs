use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};

use tokio::sync::watch;

use crate::error::{Error, Result};

type Calls<V> = Arc<Mutex<HashMap<String, watch::Receiver<Option<V>>>>>;

/// Coalesces concurrent calls that share a key.
///
/// The first caller for a key starts the work on its own task; everyone who
/// arrives before it finishes waits on the same result. Dropping a waiting
/// caller never cancels the work for the others.
pub struct SingleFlight<V> {
    calls: Calls<V>,
}

impl<V> Default for SingleFlight<V> {
    fn default() -> Self {
        Self {
            calls: Arc::new(Mutex::new(HashMap::new())),
        }
    }
}

impl<V> SingleFlight<V>
where
    V: Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn run<F, Fut>(&self, key: &str, work: F) -> Result<V>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = V> + Send + 'static,
    {
        let mut rx = {
            let mut calls = self
                .calls
                .lock()
                .map_err(|_| Error::Aborted(key.to_string()))?;
            match calls.get(key) {
                Some(rx) => {
                    tracing::debug!(key, "joining in-flight call");
                    rx.clone()
                }
                None => {
                    let (tx, rx) = watch::channel(None);
                    calls.insert(key.to_string(), rx.clone());

                    let forget = Forget {
                        calls: self.calls.clone(),
                        key: key.to_string(),
                    };
                    let fut = work();
                    tokio::spawn(async move {
                        let value = fut.await;
                        // Forget the key before publishing so a caller that
                        // sees this result and retries starts a fresh call.
                        drop(forget);
                        let _ = tx.send(Some(value));
                    });
                    rx
                }
            }
        };

        let done = rx
            .wait_for(Option::is_some)
            .await
            .map_err(|_| Error::Aborted(key.to_string()))?;
        done.clone().ok_or_else(|| Error::Aborted(key.to_string()))
    }

    /// Number of calls currently in flight.
    pub fn in_flight(&self) -> usize {
        self.calls.lock().map(|c| c.len()).unwrap_or(0)
    }
}

/// Removes a key from the registry when the work finishes or unwinds.
struct Forget<V> {
    calls: Calls<V>,
    key: String,
}

impl<V> Drop for Forget<V> {
    fn drop(&mut self) {
        if let Ok(mut calls) = self.calls.lock() {
            calls.remove(&self.key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn test_concurrent_calls_share_one_execution() {
        let group = Arc::new(SingleFlight::<usize>::new());
        let runs = Arc::new(AtomicUsize::new(0));

        let mut set = tokio::task::JoinSet::new();
        for _ in 0..10 {
            let group = group.clone();
            let runs = runs.clone();
            set.spawn(async move {
                group
                    .run("k", move || async move {
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        runs.fetch_add(1, Ordering::SeqCst) + 41
                    })
                    .await
                    .unwrap()
            });
        }
        while let Some(res) = set.join_next().await {
            assert_eq!(res.unwrap(), 41);
        }
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert_eq!(group.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_sequential_calls_run_again() {
        let group = SingleFlight::<u32>::new();
        assert_eq!(group.run("k", || async { 1 }).await.unwrap(), 1);
        assert_eq!(group.run("k", || async { 2 }).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_distinct_keys_do_not_coalesce() {
        let group = SingleFlight::<&'static str>::new();
        let (a, b) = tokio::join!(
            group.run("a", || async { "a" }),
            group.run("b", || async { "b" })
        );
        assert_eq!(a.unwrap(), "a");
        assert_eq!(b.unwrap(), "b");
    }

    #[tokio::test]
    async fn test_cancelled_leader_does_not_poison_waiters() {
        let group = Arc::new(SingleFlight::<u32>::new());

        let leader = {
            let group = group.clone();
            tokio::spawn(async move {
                group
                    .run("k", || async {
                        tokio::time::sleep(Duration::from_millis(100)).await;
                        7
                    })
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        let follower = {
            let group = group.clone();
            tokio::spawn(async move { group.run("k", || async { 0 }).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        leader.abort();

        assert_eq!(follower.await.unwrap().unwrap(), 7);
    }

    #[tokio::test]
    async fn test_panicking_work_reports_aborted() {
        let group = SingleFlight::<u32>::new();
        let err = group
            .run("k", || async {
                let value: Option<u32> = None;
                value.expect("work failed")
            })
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Aborted(key) if key == "k"));
        assert_eq!(group.in_flight(), 0);
        assert_eq!(group.run("k", || async { 3 }).await.unwrap(), 3);
    }
}
