// src/engine/common.rs
//
// Common utilities shared across engine modules: the codec panic policy and
// the explicit progress/cancellation handles every long-running operation
// takes as parameters.

use crate::error::{Result, SlicerError};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Run a codec call, converting a panic inside third-party code into a
/// typed error built by `on_panic`.
pub(crate) fn run_with_panic_policy<T, F, E>(stage: &'static str, on_panic: E, f: F) -> Result<T>
where
    F: FnOnce() -> Result<T>,
    E: FnOnce(String) -> SlicerError,
{
    match catch_unwind(AssertUnwindSafe(f)) {
        Ok(result) => result,
        Err(payload) => {
            let detail = payload
                .downcast_ref::<&str>()
                .map(|s| (*s).to_string())
                .or_else(|| payload.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic payload".to_string());
            tracing::warn!(stage, %detail, "codec panicked");
            Err(on_panic(format!("{stage}: codec panicked: {detail}")))
        }
    }
}

/// Cooperative cancellation flag shared between the caller and a worker.
#[derive(Clone, Debug, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// `Err(Cancelled)` once the flag is set.
    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(SlicerError::cancelled())
        } else {
            Ok(())
        }
    }
}

/// Progress sink. Reported values are clamped to `[0, 100]` and never go
/// backwards, whatever the caller passes in.
pub struct Progress<'a> {
    sink: Option<&'a mut dyn FnMut(f32)>,
    last: f32,
}

impl<'a> Progress<'a> {
    pub fn new(sink: &'a mut dyn FnMut(f32)) -> Self {
        Self {
            sink: Some(sink),
            last: 0.0,
        }
    }

    /// A sink that drops every report.
    pub fn none() -> Self {
        Self {
            sink: None,
            last: 0.0,
        }
    }

    pub fn report(&mut self, percent: f32) {
        let value = if percent.is_finite() {
            percent.clamp(0.0, 100.0).max(self.last)
        } else {
            self.last
        };
        self.last = value;
        if let Some(sink) = self.sink.as_mut() {
            sink(value);
        }
    }

    /// Report `done / total` of the `[start, end]` band.
    pub fn report_fraction(&mut self, start: f32, end: f32, done: usize, total: usize) {
        let fraction = if total == 0 {
            1.0
        } else {
            done as f32 / total as f32
        };
        self.report(start + (end - start) * fraction);
    }

    pub fn last(&self) -> f32 {
        self.last
    }
}

impl Default for Progress<'_> {
    fn default() -> Self {
        Self::none()
    }
}
