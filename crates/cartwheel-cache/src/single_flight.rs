//! Keyed in-flight deduplication.
//!
//! For any key at most one task is producing a value at a time. Tasks that
//! ask for a key with a producer already running wait on the producer's
//! outcome instead of starting their own. When a producer fails, one waiter
//! takes over and runs its own producer; the remaining waiters are handed
//! the original error.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::{Mutex, watch};
use tracing::debug;

use cartwheel_core::error::{CartwheelError, Result};

#[derive(Clone)]
enum Outcome<T> {
    Pending,
    Done(T),
    Failed(String),
}

struct Flight<T> {
    rx: watch::Receiver<Outcome<T>>,
    /// First waiter to swap this to `true` after a failure becomes the
    /// replacement producer.
    retry_claimed: AtomicBool,
}

enum Role<T> {
    Producer {
        tx: watch::Sender<Outcome<T>>,
        flight: Arc<Flight<T>>,
    },
    Waiter(Arc<Flight<T>>),
}

enum Waited<T> {
    Done(T),
    Failed(String),
    /// Producer dropped without publishing anything (cancelled mid-flight).
    Abandoned,
}

pub struct SingleFlight<T> {
    flights: Mutex<HashMap<String, Arc<Flight<T>>>>,
}

impl<T> Default for SingleFlight<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<T> SingleFlight<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self {
            flights: Mutex::new(HashMap::new()),
        }
    }

    /// Produce the value for `key`, or wait for the task already producing
    /// it. Each caller's `produce` runs at most once.
    pub async fn run<F, Fut>(&self, key: &str, produce: F) -> Result<T>
    where
        F: FnOnce() -> Fut + Send,
        Fut: Future<Output = Result<T>> + Send,
    {
        let mut produce = Some(produce);
        loop {
            let role = {
                let mut flights = self.flights.lock().await;
                match flights.get(key) {
                    Some(flight) => Role::Waiter(flight.clone()),
                    None => {
                        let (tx, rx) = watch::channel(Outcome::Pending);
                        let flight = Arc::new(Flight {
                            rx,
                            retry_claimed: AtomicBool::new(false),
                        });
                        flights.insert(key.to_string(), flight.clone());
                        Role::Producer { tx, flight }
                    }
                }
            };

            match role {
                Role::Producer { tx, flight } => {
                    let Some(produce) = produce.take() else {
                        return Err(CartwheelError::Cache(
                            "single-flight producer re-entered".into(),
                        ));
                    };
                    let result = produce().await;
                    // Unregister before publishing so late arrivals start a
                    // fresh flight instead of joining a finished one.
                    self.unregister(key, &flight).await;
                    match result {
                        Ok(value) => {
                            let _ = tx.send(Outcome::Done(value.clone()));
                            return Ok(value);
                        }
                        Err(e) => {
                            let _ = tx.send(Outcome::Failed(e.to_string()));
                            return Err(e);
                        }
                    }
                }
                Role::Waiter(flight) => match Self::wait(&flight).await {
                    Waited::Done(value) => return Ok(value),
                    Waited::Failed(message) => {
                        if !flight.retry_claimed.swap(true, Ordering::SeqCst) {
                            debug!(key, "Single-flight producer failed, taking over");
                            continue;
                        }
                        return Err(CartwheelError::Cache(message));
                    }
                    Waited::Abandoned => {
                        self.unregister(key, &flight).await;
                        continue;
                    }
                },
            }
        }
    }

    async fn wait(flight: &Arc<Flight<T>>) -> Waited<T> {
        let mut rx = flight.rx.clone();
        loop {
            {
                let current = rx.borrow_and_update();
                match &*current {
                    Outcome::Done(value) => return Waited::Done(value.clone()),
                    Outcome::Failed(message) => return Waited::Failed(message.clone()),
                    Outcome::Pending => {}
                }
            }
            if rx.changed().await.is_err() {
                // Sender gone; pick up a value published right before the drop.
                let current = rx.borrow();
                return match &*current {
                    Outcome::Done(value) => Waited::Done(value.clone()),
                    Outcome::Failed(message) => Waited::Failed(message.clone()),
                    Outcome::Pending => Waited::Abandoned,
                };
            }
        }
    }

    /// Remove `flight` from the map if it is still the registered one.
    async fn unregister(&self, key: &str, flight: &Arc<Flight<T>>) {
        let mut flights = self.flights.lock().await;
        if let Some(current) = flights.get(key) {
            if Arc::ptr_eq(current, flight) {
                flights.remove(key);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;
    use std::time::Duration;

    #[tokio::test]
    async fn concurrent_requests_share_one_producer() {
        let flights = Arc::new(SingleFlight::<u32>::new());
        let calls = Arc::new(AtomicU32::new(0));

        let mut handles = Vec::new();
        for _ in 0..5 {
            let flights = flights.clone();
            let calls = calls.clone();
            handles.push(tokio::spawn(async move {
                flights
                    .run("speakers", || async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(200)).await;
                        Ok(42u32)
                    })
                    .await
            }));
        }

        for handle in handles {
            assert_eq!(handle.await.unwrap().unwrap(), 42);
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn one_waiter_retries_after_producer_failure() {
        let flights = Arc::new(SingleFlight::<u32>::new());
        let retries = Arc::new(AtomicU32::new(0));

        let failing = {
            let flights = flights.clone();
            tokio::spawn(async move {
                flights
                    .run("laptops", || async move {
                        tokio::time::sleep(Duration::from_millis(150)).await;
                        Err::<u32, _>(CartwheelError::Cache("backend down".into()))
                    })
                    .await
            })
        };
        // Let the failing producer register first.
        tokio::time::sleep(Duration::from_millis(30)).await;

        let mut waiters = Vec::new();
        for _ in 0..4 {
            let flights = flights.clone();
            let retries = retries.clone();
            waiters.push(tokio::spawn(async move {
                flights
                    .run("laptops", || async move {
                        retries.fetch_add(1, Ordering::SeqCst);
                        Ok(7u32)
                    })
                    .await
            }));
        }

        assert!(failing.await.unwrap().is_err());
        let mut ok = 0;
        let mut failed = 0;
        for waiter in waiters {
            match waiter.await.unwrap() {
                Ok(v) => {
                    assert_eq!(v, 7);
                    ok += 1;
                }
                Err(e) => {
                    assert!(e.to_string().contains("backend down"));
                    failed += 1;
                }
            }
        }
        assert_eq!(ok, 1);
        assert_eq!(failed, 3);
        assert_eq!(retries.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn sequential_runs_each_produce() {
        let flights = SingleFlight::<u32>::new();
        let calls = AtomicU32::new(0);
        let calls = &calls;

        for _ in 0..2 {
            let got = flights
                .run("shoes", || async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(1u32)
                })
                .await
                .unwrap();
            assert_eq!(got, 1);
        }
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn distinct_keys_do_not_interfere() {
        let flights = Arc::new(SingleFlight::<&'static str>::new());
        let a = flights.run("a", || async { Ok("a") });
        let b = flights.run("b", || async { Ok("b") });
        let (a, b) = tokio::join!(a, b);
        assert_eq!(a.unwrap(), "a");
        assert_eq!(b.unwrap(), "b");
    }
}
