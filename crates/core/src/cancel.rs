use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

/// Shared stop/cancel flag used by every long-running loop.
///
/// Clones observe the same flag. Waiting through [`CancellationToken::wait`]
/// wakes as soon as the flag is raised, so sleeping loops notice promptly.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    inner: Arc<Inner>,
}

#[derive(Debug, Default)]
struct Inner {
    requested: Mutex<bool>,
    changed: Condvar,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request(&self) {
        *self.lock() = true;
        self.inner.changed.notify_all();
    }

    pub fn reset(&self) {
        *self.lock() = false;
    }

    pub fn is_requested(&self) -> bool {
        *self.lock()
    }

    /// Sleep for up to `timeout`. Returns `true` if cancellation was
    /// requested before or during the wait.
    pub fn wait(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut requested = self.lock();
        while !*requested {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            requested = match self.inner.changed.wait_timeout(requested, deadline - now) {
                Ok((guard, _)) => guard,
                Err(poisoned) => poisoned.into_inner().0,
            };
        }
        true
    }

    fn lock(&self) -> MutexGuard<'_, bool> {
        // A panicking holder cannot leave a bool half-written.
        self.inner.requested.lock().unwrap_or_else(|e| e.into_inner())
    }
}
