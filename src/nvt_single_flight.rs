// Single-flight coordination for shared refreshes
//
// Concurrent callers asking for the same refresh share one execution. The
// work runs on its own task, so a caller that gives up does not cancel it.
use crate::nvt_error::{NVTError, Result};
use futures::future::{BoxFuture, FutureExt, Shared};
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};

type Flight<V> = Shared<BoxFuture<'static, Result<V>>>;
type Slot<V> = Arc<Mutex<Option<Flight<V>>>>;

fn lock<V>(slot: &Slot<V>) -> MutexGuard<'_, Option<Flight<V>>> {
    slot.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Empties the slot when the owning task ends, including on panic.
struct ClearOnDrop<V>(Slot<V>);

impl<V> Drop for ClearOnDrop<V> {
    fn drop(&mut self) {
        *lock(&self.0) = None;
    }
}

pub struct SingleFlight<V> {
    slot: Slot<V>,
}

impl<V> Default for SingleFlight<V> {
    fn default() -> Self {
        SingleFlight {
            slot: Arc::new(Mutex::new(None)),
        }
    }
}

impl<V: Clone + Send + Sync + 'static> SingleFlight<V> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn in_progress(&self) -> bool {
        lock(&self.slot).is_some()
    }

    /// Joins the running flight, or starts `make()` as a new one. `make` is
    /// only called when no flight is running.
    pub async fn run<F, Fut>(&self, make: F) -> Result<V>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V>> + Send + 'static,
    {
        let flight = {
            let mut slot = lock(&self.slot);
            match slot.as_ref() {
                Some(flight) => {
                    log::debug!("Joining refresh already in flight");
                    flight.clone()
                }
                None => {
                    let guard = ClearOnDrop(Arc::clone(&self.slot));
                    let work = make();
                    let handle = tokio::spawn(async move {
                        let _guard = guard;
                        work.await
                    });
                    let flight = async move {
                        handle.await.unwrap_or_else(|e| {
                            Err(NVTError::Internal(format!("refresh task failed: {}", e)))
                        })
                    }
                    .boxed()
                    .shared();
                    *slot = Some(flight.clone());
                    flight
                }
            }
        };

        flight.await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test(start_paused = true)]
    async fn concurrent_callers_share_one_execution() {
        let flight = Arc::new(SingleFlight::<usize>::new());
        let runs = Arc::new(AtomicUsize::new(0));

        let callers: Vec<_> = (0..8)
            .map(|_| {
                let flight = Arc::clone(&flight);
                let runs = Arc::clone(&runs);
                tokio::spawn(async move {
                    flight
                        .run(|| async move {
                            let n = runs.fetch_add(1, Ordering::SeqCst) + 1;
                            tokio::time::sleep(Duration::from_millis(100)).await;
                            Ok(n)
                        })
                        .await
                })
            })
            .collect();

        for caller in callers {
            assert_eq!(caller.await.unwrap(), Ok(1));
        }
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert!(!flight.in_progress());
    }

    #[tokio::test]
    async fn finished_flight_is_not_reused() {
        let flight = SingleFlight::<u32>::new();
        assert_eq!(flight.run(|| async { Ok(1) }).await, Ok(1));
        assert_eq!(flight.run(|| async { Ok(2) }).await, Ok(2));
    }

    #[tokio::test]
    async fn failures_reach_every_waiter() {
        let flight = Arc::new(SingleFlight::<u32>::new());
        let (a, b) = tokio::join!(
            flight.run(|| async {
                tokio::task::yield_now().await;
                Err(NVTError::FeedUnavailable { attempts: vec![] })
            }),
            flight.run(|| async { Ok(7) }),
        );
        assert_eq!(a, Err(NVTError::FeedUnavailable { attempts: vec![] }));
        assert_eq!(b, a);
    }

    #[tokio::test(start_paused = true)]
    async fn abandoned_caller_does_not_cancel_work() {
        let flight = SingleFlight::<()>::new();
        let done = Arc::new(AtomicUsize::new(0));

        let marker = Arc::clone(&done);
        let abandoned = tokio::time::timeout(
            Duration::from_millis(10),
            flight.run(|| async move {
                tokio::time::sleep(Duration::from_millis(50)).await;
                marker.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }),
        )
        .await;
        assert!(abandoned.is_err());

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(done.load(Ordering::SeqCst), 1);
        assert!(!flight.in_progress());
    }

    #[tokio::test]
    async fn panicking_work_surfaces_as_error_and_clears() {
        let flight = SingleFlight::<u32>::new();
        let result = flight
            .run(|| async {
                if true {
                    panic!("boom");
                }
                Ok(0)
            })
            .await;
        assert!(matches!(result, Err(NVTError::Internal(_))));
        assert!(!flight.in_progress());
        assert_eq!(flight.run(|| async { Ok(3) }).await, Ok(3));
    }
}
