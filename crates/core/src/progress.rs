//! Progress reporting and cooperative cancellation.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use ndarray::Array4;

/// Emitted after every completed scheduler step.
#[derive(Debug, Clone)]
pub struct DiffusionProgress {
    pub step: usize,
    pub total: usize,
    /// Snapshot of the current latent, for intermediate previews.
    pub latent: Option<Array4<f32>>,
    /// Index within a batch run, when applicable.
    pub batch_index: Option<usize>,
}

/// Callers hand in any `Send + Sync` callable; `None` disables reporting.
pub type ProgressCallback = Arc<dyn Fn(DiffusionProgress) + Send + Sync>;

/// Invokes the callback; panics are caught and logged, never propagated.
pub fn report_progress(callback: Option<&ProgressCallback>, progress: DiffusionProgress) {
    if let Some(cb) = callback {
        let step = progress.step;
        if catch_unwind(AssertUnwindSafe(|| cb(progress))).is_err() {
            tracing::warn!(step, "progress callback panicked; ignoring");
        }
    }
}

/// Cooperative cancellation flag, checked at step boundaries and before
/// decode. In-flight inference calls are never interrupted.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    cancelled: Arc<AtomicBool>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Errors with [`DiffusionError::Cancelled`] once [`cancel`] was called.
    ///
    /// [`DiffusionError::Cancelled`]: crate::error::DiffusionError::Cancelled
    /// [`cancel`]: CancellationToken::cancel
    pub fn check(&self) -> crate::error::Result<()> {
        if self.is_cancelled() {
            Err(crate::error::DiffusionError::Cancelled)
        } else {
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn token_starts_clear() {
        let token = CancellationToken::new();
        assert!(!token.is_cancelled());
        token.check().unwrap();
    }

    #[test]
    fn cancel_is_visible_through_clones() {
        let token = CancellationToken::new();
        let clone = token.clone();
        token.cancel();
        assert!(clone.is_cancelled());
        assert!(clone.check().is_err());
    }

    #[test]
    fn progress_callback_panic_is_swallowed() {
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_in_cb = calls.clone();
        let cb: ProgressCallback = Arc::new(move |_| {
            calls_in_cb.fetch_add(1, Ordering::SeqCst);
            panic!("observer bug");
        });
        report_progress(
            Some(&cb),
            DiffusionProgress { step: 1, total: 2, latent: None, batch_index: None },
        );
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
