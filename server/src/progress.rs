//! Monotone percentage reporting for the packaging pipeline.
//!
//! Each stage owns a fixed band of the 0..=100 range; within a band the
//! percentage is linear in items completed. The sink never reports a value
//! lower than one it has already reported.

use std::sync::atomic::{AtomicU32, Ordering};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Extract,
    Manifest,
    SmallChunks,
    MediumChunks,
    LargeChunks,
    Finalize,
}

impl Stage {
    fn band(self) -> (u32, u32) {
        match self {
            Stage::Extract => (0, 10),
            Stage::Manifest => (10, 30),
            Stage::SmallChunks => (30, 40),
            Stage::MediumChunks => (40, 55),
            Stage::LargeChunks => (55, 95),
            Stage::Finalize => (95, 100),
        }
    }
}

pub struct ProgressSink {
    last: AtomicU32,
    notify: Box<dyn Fn(u32) + Send + Sync>,
}

impl ProgressSink {
    pub fn new(notify: impl Fn(u32) + Send + Sync + 'static) -> Self {
        Self {
            last: AtomicU32::new(0),
            notify: Box::new(notify),
        }
    }

    /// A sink that only logs.
    #[cfg(test)]
    pub fn discard() -> Self {
        Self::new(|_| {})
    }

    /// Report `done` of `total` items for `stage`. A zero total counts as
    /// a completed stage.
    pub fn report(&self, stage: Stage, done: usize, total: usize) {
        let (lo, hi) = stage.band();
        let span = (hi - lo) as usize;
        let pct = if total == 0 {
            hi
        } else {
            lo + (span * done.min(total) / total) as u32
        };

        let prev = self.last.fetch_max(pct, Ordering::SeqCst);
        if pct > prev {
            tracing::debug!(percent = pct, "pipeline progress");
            (self.notify)(pct);
        }
    }

    pub fn finish(&self) {
        self.report(Stage::Finalize, 1, 1);
    }
}
