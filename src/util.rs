use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};

use crate::error::{Error, Result};

/// cooperative cancellation flag for long-running walks
///
/// checkout and status check the token before descending into a subtree
/// and unwind with `Cancelled` once it trips.
#[derive(Clone, Default)]
pub struct CancellationToken {
    cancelled: Arc<AtomicBool>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    /// error out if the token has tripped
    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(Error::Cancelled)
        } else {
            Ok(())
        }
    }
}

struct DeferredState<T> {
    result: Mutex<Option<Result<T>>>,
    ready: Condvar,
}

/// completion handle for an operation that may block on the backing store
///
/// the producer side completes it exactly once with a value or an error;
/// any number of waiters block until then.
pub struct Deferred<T> {
    state: Arc<DeferredState<T>>,
}

/// producer side of a [`Deferred`]
pub struct Promise<T> {
    state: Arc<DeferredState<T>>,
}

impl<T> Deferred<T> {
    pub fn new() -> (Promise<T>, Deferred<T>) {
        let state = Arc::new(DeferredState {
            result: Mutex::new(None),
            ready: Condvar::new(),
        });
        (
            Promise {
                state: state.clone(),
            },
            Deferred { state },
        )
    }

    /// a deferred that is already complete
    pub fn ready(result: Result<T>) -> Deferred<T> {
        let (promise, deferred) = Deferred::new();
        promise.complete(result);
        deferred
    }

    /// run `f` on a worker thread and complete with its result
    pub fn spawn<F>(f: F) -> Deferred<T>
    where
        T: Send + 'static,
        F: FnOnce() -> Result<T> + Send + 'static,
    {
        let (promise, deferred) = Deferred::new();
        std::thread::spawn(move || promise.complete(f()));
        deferred
    }

    /// block until the producer completes
    pub fn wait(self) -> Result<T> {
        let mut guard = self.state.result.lock();
        while guard.is_none() {
            self.state.ready.wait(&mut guard);
        }
        guard.take().expect("deferred completed")
    }

    /// non-blocking poll; `None` while the producer is still running
    pub fn try_take(&self) -> Option<Result<T>> {
        self.state.result.lock().take()
    }
}

impl<T> Promise<T> {
    pub fn complete(self, result: Result<T>) {
        let mut guard = self.state.result.lock();
        debug_assert!(guard.is_none(), "deferred completed twice");
        *guard = Some(result);
        self.state.ready.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cancellation_token() {
        let token = CancellationToken::new();
        assert!(token.check().is_ok());

        let clone = token.clone();
        clone.cancel();
        assert!(token.is_cancelled());
        assert!(matches!(token.check(), Err(Error::Cancelled)));
    }

    #[test]
    fn test_deferred_ready() {
        let deferred = Deferred::ready(Ok(7));
        assert_eq!(deferred.wait().unwrap(), 7);
    }

    #[test]
    fn test_deferred_spawn() {
        let deferred = Deferred::spawn(|| Ok("done".to_string()));
        assert_eq!(deferred.wait().unwrap(), "done");
    }

    #[test]
    fn test_deferred_error() {
        let deferred: Deferred<()> = Deferred::spawn(|| Err(Error::Cancelled));
        assert!(matches!(deferred.wait(), Err(Error::Cancelled)));
    }

    #[test]
    fn test_deferred_completes_across_threads() {
        let (promise, deferred) = Deferred::new();
        let handle = std::thread::spawn(move || deferred.wait().unwrap());
        std::thread::sleep(std::time::Duration::from_millis(10));
        promise.complete(Ok(42));
        assert_eq!(handle.join().unwrap(), 42);
    }
}
