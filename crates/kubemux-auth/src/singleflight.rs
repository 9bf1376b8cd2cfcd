//! Request deduplication for concurrent identical calls
//!
//! A map from key to an in-flight shared future. The first caller for a key
//! spawns the work; callers arriving while it runs await the same shared
//! result. The spawned task clears the map entry when it completes or
//! unwinds, so the next caller after completion starts a new flight.
//!
//! The work runs on its own task: a caller that gives up waiting does not
//! cancel the flight for everyone else.

use std::future::Future;
use std::hash::Hash;
use std::sync::{Arc, Weak};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::future::{BoxFuture, FutureExt, Shared};

/// The flight's task panicked or was aborted before producing a value
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("in-flight call aborted before completion")]
pub struct FlightAborted;

type Flight<V> = Shared<BoxFuture<'static, Result<V, FlightAborted>>>;

/// Removes a flight's entry when its task finishes, panics included
struct Landing<K, V>
where
    K: Eq + Hash,
{
    flights: Weak<DashMap<K, Flight<V>>>,
    key: K,
}

impl<K, V> Drop for Landing<K, V>
where
    K: Eq + Hash,
{
    fn drop(&mut self) {
        if let Some(flights) = self.flights.upgrade() {
            flights.remove(&self.key);
        }
    }
}

/// Deduplicates concurrent calls that share a key
pub struct Singleflight<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    flights: Arc<DashMap<K, Flight<V>>>,
}

impl<K, V> Default for Singleflight<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self {
            flights: Arc::new(DashMap::new()),
        }
    }
}

impl<K, V> Singleflight<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    /// Create an empty deduplicator
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `work` for `key`, or join the flight already running for it
    ///
    /// `work` is only invoked when no flight exists for `key`.
    pub async fn run<F, Fut>(&self, key: K, work: F) -> Result<V, FlightAborted>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = V> + Send + 'static,
    {
        let flight = match self.flights.entry(key.clone()) {
            Entry::Occupied(entry) => entry.get().clone(),
            Entry::Vacant(entry) => {
                let landing = Landing {
                    flights: Arc::downgrade(&self.flights),
                    key,
                };
                let fut = work();
                // The entry guard is held until insert completes, so the
                // landing's remove can only observe this flight's entry.
                let handle = tokio::spawn(async move {
                    let _landing = landing;
                    fut.await
                });
                let flight = async move { handle.await.map_err(|_| FlightAborted) }
                    .boxed()
                    .shared();
                entry.insert(flight.clone());
                flight
            }
        };

        flight.await
    }

    /// Number of keys with a flight currently running
    pub fn in_flight(&self) -> usize {
        self.flights.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::sync::Notify;

    #[tokio::test]
    async fn test_single_call_runs_work() {
        let flights: Singleflight<&'static str, u32> = Singleflight::new();
        let value = flights.run("k", || async { 7 }).await;
        assert_eq!(value, Ok(7));
    }

    #[tokio::test]
    async fn test_concurrent_callers_share_one_invocation() {
        let flights: Arc<Singleflight<String, u32>> = Arc::new(Singleflight::new());
        let invocations = Arc::new(AtomicUsize::new(0));
        let release = Arc::new(Notify::new());

        let mut handles = Vec::new();
        for _ in 0..16 {
            let flights = flights.clone();
            let invocations = invocations.clone();
            let release = release.clone();
            handles.push(tokio::spawn(async move {
                flights
                    .run("same".to_string(), move || async move {
                        invocations.fetch_add(1, Ordering::SeqCst);
                        release.notified().await;
                        99
                    })
                    .await
            }));
        }

        // Let every caller join before the flight finishes
        while flights.in_flight() == 0 {
            tokio::task::yield_now().await;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
        release.notify_waiters();

        for handle in handles {
            assert_eq!(handle.await.unwrap(), Ok(99));
        }
        assert_eq!(invocations.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_entry_cleared_after_completion() {
        let flights: Singleflight<&'static str, u32> = Singleflight::new();
        let invocations = Arc::new(AtomicUsize::new(0));

        for _ in 0..3 {
            let invocations = invocations.clone();
            let _ = flights
                .run("k", move || async move {
                    invocations.fetch_add(1, Ordering::SeqCst);
                    1
                })
                .await;
        }

        // Sequential calls never overlap, so each one runs its own flight
        assert_eq!(invocations.load(Ordering::SeqCst), 3);
        assert_eq!(flights.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_distinct_keys_do_not_share() {
        let flights: Singleflight<&'static str, &'static str> = Singleflight::new();
        let (a, b) = tokio::join!(
            flights.run("a", || async { "alpha" }),
            flights.run("b", || async { "beta" }),
        );
        assert_eq!(a, Ok("alpha"));
        assert_eq!(b, Ok("beta"));
    }

    #[tokio::test]
    async fn test_panicking_work_reports_aborted() {
        let flights: Singleflight<&'static str, u32> = Singleflight::new();
        let result = flights
            .run("boom", || async {
                panic!("work failed");
            })
            .await;
        assert_eq!(result, Err(FlightAborted));
        assert_eq!(flights.in_flight(), 0);

        // The key is free again, so the next call runs fresh work
        let invocations = Arc::new(AtomicUsize::new(0));
        let counter = invocations.clone();
        let result = flights
            .run("boom", move || async move {
                counter.fetch_add(1, Ordering::SeqCst);
                3
            })
            .await;
        assert_eq!(result, Ok(3));
        assert_eq!(invocations.load(Ordering::SeqCst), 1);
        assert_eq!(flights.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_dropped_waiter_does_not_cancel_flight() {
        let flights: Arc<Singleflight<&'static str, u32>> = Arc::new(Singleflight::new());
        let invocations = Arc::new(AtomicUsize::new(0));
        let release = Arc::new(Notify::new());

        let first = {
            let flights = flights.clone();
            let invocations = invocations.clone();
            let release = release.clone();
            tokio::spawn(async move {
                flights
                    .run("k", move || async move {
                        invocations.fetch_add(1, Ordering::SeqCst);
                        release.notified().await;
                        5
                    })
                    .await
            })
        };
        while flights.in_flight() == 0 {
            tokio::task::yield_now().await;
        }
        first.abort();

        let joiner = {
            let flights = flights.clone();
            tokio::spawn(async move { flights.run("k", || async { 0 }).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        release.notify_waiters();

        assert_eq!(joiner.await.unwrap(), Ok(5));
        assert_eq!(invocations.load(Ordering::SeqCst), 1);
    }
}
