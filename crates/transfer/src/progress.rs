use std::sync::atomic::{AtomicU64, Ordering};

/// Lock-free `0.0..=1.0` progress fraction shared between a running
/// transfer and status readers.
#[derive(Debug, Default)]
pub struct Progress {
    bits: AtomicU64,
}

impl Progress {
    pub fn get(&self) -> f64 {
        f64::from_bits(self.bits.load(Ordering::Relaxed))
    }

    pub fn set(&self, value: f64) {
        let clamped = value.clamp(0.0, 1.0);
        self.bits.store(clamped.to_bits(), Ordering::Relaxed);
    }

    pub fn reset(&self) {
        self.set(0.0);
    }

    /// Report `done / total` mapped into the range `[start, start + span]`.
    pub fn report(&self, start: f64, span: f64, done: usize, total: usize) {
        let fraction = if total == 0 {
            1.0
        } else {
            done as f64 / total as f64
        };
        self.set(start + span * fraction);
    }
}
