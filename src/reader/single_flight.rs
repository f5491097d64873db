//! At most one outstanding operation per key.
//!
//! The first caller for a key spawns the work onto the runtime and registers
//! an in-flight token; later callers await the same shared result. The token
//! is removed when the work finishes (either way) or is cancelled, so a
//! failure never poisons the key.

use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use log::debug;
use std::collections::HashMap;
use std::fmt::Debug;
use std::future::Future;
use std::hash::Hash;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::task::AbortHandle;

use crate::error::{ReaderError, Result};

type SharedOutcome<V> = Shared<BoxFuture<'static, Result<V>>>;

struct Flight<V> {
    generation: u64,
    outcome: SharedOutcome<V>,
    abort: AbortHandle,
}

struct FlightMap<K, V> {
    flights: HashMap<K, Flight<V>>,
    next_generation: u64,
}

pub struct SingleFlight<K, V> {
    inner: Arc<Mutex<FlightMap<K, V>>>,
}

impl<K, V> Clone for SingleFlight<K, V> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<K, V> Default for SingleFlight<K, V> {
    fn default() -> Self {
        Self {
            inner: Arc::new(Mutex::new(FlightMap {
                flights: HashMap::new(),
                next_generation: 0,
            })),
        }
    }
}

impl<K, V> SingleFlight<K, V>
where
    K: Eq + Hash + Clone + Debug + Send + 'static,
    V: Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self::default()
    }

    /// Runs `work` unless an operation for `key` is already in flight, in
    /// which case its outcome is awaited instead. `work` is only invoked by
    /// the caller that starts the flight.
    pub async fn run<F, Fut>(&self, key: K, work: F) -> Result<V>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V>> + Send + 'static,
    {
        let outcome = {
            let mut map = lock(&self.inner);
            if let Some(flight) = map.flights.get(&key) {
                debug!("joining in-flight operation for {key:?}");
                flight.outcome.clone()
            } else {
                let generation = map.next_generation;
                map.next_generation += 1;

                let inner = Arc::clone(&self.inner);
                let task_key = key.clone();
                let fut = work();
                let handle = tokio::spawn(async move {
                    let result = fut.await;
                    finish(&inner, &task_key, generation);
                    result
                });
                let abort = handle.abort_handle();
                let outcome = async move {
                    match handle.await {
                        Ok(result) => result,
                        Err(e) if e.is_cancelled() => Err(ReaderError::Cancelled),
                        Err(e) => Err(ReaderError::RemoteFailure(format!("task failed: {e}"))),
                    }
                }
                .boxed()
                .shared();

                map.flights.insert(
                    key,
                    Flight {
                        generation,
                        outcome: outcome.clone(),
                        abort,
                    },
                );
                outcome
            }
        };
        outcome.await
    }

    pub fn is_in_flight(&self, key: &K) -> bool {
        lock(&self.inner).flights.contains_key(key)
    }

    pub fn len(&self) -> usize {
        lock(&self.inner).flights.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Aborts the flight for `key`. Waiters observe `Cancelled`. Calling this
    /// for a key with nothing in flight does nothing.
    pub fn cancel(&self, key: &K) -> bool {
        let flight = lock(&self.inner).flights.remove(key);
        match flight {
            Some(flight) => {
                debug!("cancelled in-flight operation for {key:?}");
                flight.abort.abort();
                true
            }
            None => false,
        }
    }

    pub fn cancel_all(&self) {
        let flights: Vec<Flight<V>> = lock(&self.inner).flights.drain().map(|(_, f)| f).collect();
        for flight in flights {
            flight.abort.abort();
        }
    }
}

fn lock<K, V>(inner: &Mutex<FlightMap<K, V>>) -> MutexGuard<'_, FlightMap<K, V>> {
    inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Removes the token unless it was already replaced by a newer flight.
fn finish<K: Eq + Hash, V>(inner: &Mutex<FlightMap<K, V>>, key: &K, generation: u64) {
    let mut map = lock(inner);
    if map.flights.get(key).is_some_and(|f| f.generation == generation) {
        map.flights.remove(key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn test_concurrent_callers_share_one_run() {
        let flights: SingleFlight<u32, String> = SingleFlight::new();
        let runs = Arc::new(AtomicUsize::new(0));

        let calls = (0..8).map(|_| {
            let runs = Arc::clone(&runs);
            flights.run(7, move || async move {
                runs.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(10)).await;
                Ok("page".to_string())
            })
        });
        let results = futures::future::join_all(calls).await;

        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert!(results.iter().all(|r| r.as_deref() == Ok("page")));
        assert!(flights.is_empty());
    }

    #[tokio::test]
    async fn test_concurrent_callers_share_one_failure() {
        let flights: SingleFlight<u32, String> = SingleFlight::new();
        let runs = Arc::new(AtomicUsize::new(0));

        let calls = (0..5).map(|_| {
            let runs = Arc::clone(&runs);
            flights.run(9, move || async move {
                runs.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(10)).await;
                Err(ReaderError::RemoteFailure("502".into()))
            })
        });
        let results = futures::future::join_all(calls).await;

        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert_eq!(results.len(), 5);
        for result in &results {
            assert_eq!(result, &Err(ReaderError::RemoteFailure("502".into())));
        }
        assert!(!flights.is_in_flight(&9));
    }

    #[tokio::test]
    async fn test_failure_does_not_poison_key() {
        let flights: SingleFlight<u32, u32> = SingleFlight::new();
        let first = flights
            .run(1, || async { Err(ReaderError::RemoteFailure("503".into())) })
            .await;
        assert!(matches!(first, Err(ReaderError::RemoteFailure(_))));
        assert!(!flights.is_in_flight(&1));

        let second = flights.run(1, || async { Ok(42) }).await;
        assert_eq!(second, Ok(42));
    }

    #[tokio::test]
    async fn test_cancel_is_idempotent_and_clears_token() {
        let flights: SingleFlight<u32, u32> = SingleFlight::new();
        let waiter = {
            let flights = flights.clone();
            tokio::spawn(async move {
                flights
                    .run(3, || async {
                        tokio::time::sleep(Duration::from_secs(60)).await;
                        Ok(1)
                    })
                    .await
            })
        };
        while !flights.is_in_flight(&3) {
            tokio::task::yield_now().await;
        }

        assert!(flights.cancel(&3));
        assert!(!flights.cancel(&3));
        assert!(!flights.is_in_flight(&3));
        assert_eq!(waiter.await.unwrap(), Err(ReaderError::Cancelled));

        assert_eq!(flights.run(3, || async { Ok(2) }).await, Ok(2));
    }
}
