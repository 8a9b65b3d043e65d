//! Drop-time callback guard for scoped cleanup.

/// Runs a closure when dropped unless dismissed.
///
/// Used wherever cleanup must happen on every exit path of a scope: releasing
/// run flags, rolling back replication state on early return.
#[derive(Debug)]
pub struct ScopeGuard<F: FnOnce()> {
    callback: Option<F>,
}

impl<F: FnOnce()> ScopeGuard<F> {
    /// Arms a guard with the given cleanup callback.
    #[must_use]
    pub fn new(callback: F) -> Self {
        Self {
            callback: Some(callback),
        }
    }

    /// Disarms the guard so the callback never runs.
    pub fn dismiss(&mut self) {
        self.callback = None;
    }
}

impl<F: FnOnce()> Drop for ScopeGuard<F> {
    fn drop(&mut self) {
        if let Some(callback) = self.callback.take() {
            callback();
        }
    }
}
