//! Request coalescing: concurrent callers share one in-flight computation.

use futures_util::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use std::future::Future;
use std::sync::Arc;

/// The computation ended without a result (it panicked or the runtime is
/// shutting down).
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("in-flight computation ended without a result")]
pub struct FlightAborted;

type Flight<T> = Shared<BoxFuture<'static, Result<T, FlightAborted>>>;
type Slot<T> = Arc<Mutex<Option<Flight<T>>>>;

/// At most one computation runs at a time; callers arriving while it is
/// outstanding await the same result instead of starting their own.
pub struct SingleFlight<T: Clone> {
    slot: Slot<T>,
}

impl<T> SingleFlight<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self {
            slot: Arc::new(Mutex::new(None)),
        }
    }

    /// Join the in-flight computation, or start `work` if none is running.
    ///
    /// `work` is only invoked when this caller becomes the leader, and its
    /// future runs on a task of its own: it completes even when every caller
    /// has stopped waiting. The slot is cleared when that task finishes, so
    /// the next call after completion starts fresh.
    pub async fn run<F, Fut>(&self, work: F) -> Result<T, FlightAborted>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T> + Send + 'static,
    {
        let flight = {
            let mut slot = self.slot.lock();
            match slot.as_ref() {
                Some(flight) => flight.clone(),
                None => {
                    let fut = work();
                    // The slot stays locked until the flight is stored, so
                    // the task cannot clear it before that.
                    let release = Release(Arc::clone(&self.slot));
                    let handle = tokio::spawn(async move {
                        let _release = release;
                        fut.await
                    });
                    let flight = async move { handle.await.map_err(|_| FlightAborted) }
                        .boxed()
                        .shared();
                    *slot = Some(flight.clone());
                    flight
                }
            }
        };
        flight.await
    }

    pub fn is_in_flight(&self) -> bool {
        self.slot.lock().is_some()
    }
}

impl<T> Default for SingleFlight<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

/// Empties the slot when the computation task ends, including by panic.
struct Release<T: Clone>(Slot<T>);

impl<T: Clone> Drop for Release<T> {
    fn drop(&mut self) {
        let _finished = self.0.lock().take();
    }
}
