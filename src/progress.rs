//! Best-effort progress reporting for the load pipeline
//!
//! The loader is uninterruptible once started; the callback only narrates.
//! Callees must tolerate repeated percentages and stale messages after the
//! final "Done!".

/// Callback invoked at coarse granularity during load and aggregation.
pub type ProgressCallback = Box<dyn FnMut(f32, &str) + Send>;

/// Owns the optional callback so pipeline stages can report without
/// borrowing the whole capture.
#[derive(Default)]
pub struct Progress {
    callback: Option<ProgressCallback>,
}

impl Progress {
    pub fn set_callback(&mut self, callback: ProgressCallback) {
        self.callback = Some(callback);
    }

    pub fn clear_callback(&mut self) {
        self.callback = None;
    }

    pub fn report(&mut self, percent: f32, message: &str) {
        if let Some(cb) = self.callback.as_mut() {
            cb(percent, message);
        }
    }
}

impl std::fmt::Debug for Progress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Progress").field("has_callback", &self.callback.is_some()).finish()
    }
}

/// Tracks the "report every 1%" cadence used by the long loops.
pub struct ProgressTicker {
    next_point: usize,
    step: usize,
}

impl ProgressTicker {
    #[must_use]
    pub fn new(total: usize) -> Self {
        Self { next_point: 0, step: (total / 100).max(1) }
    }

    /// Returns the percentage to report when `index` crosses the next
    /// 1% boundary, None otherwise.
    pub fn tick(&mut self, index: usize, total: usize) -> Option<f32> {
        if index < self.next_point {
            return None;
        }
        self.next_point += self.step;
        if total == 0 {
            return Some(100.0);
        }
        Some(index as f32 * 100.0 / total as f32)
    }
}
