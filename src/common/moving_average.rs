//! Exponentially weighted moving average over a lock-free f64 cell.

use std::sync::atomic::{AtomicU64, Ordering};

/// EWMA updated from many threads; readers accept eventual consistency.
#[derive(Debug)]
pub struct MovingAverage {
    weight: f64,
    bits: AtomicU64,
}

impl MovingAverage {
    pub fn new(weight: f64, initial: f64) -> Self {
        Self {
            weight,
            bits: AtomicU64::new(initial.to_bits()),
        }
    }

    /// average = (1 - weight) * average + weight * sample
    pub fn update(&self, sample: f64) {
        let _ = self
            .bits
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |bits| {
                let old = f64::from_bits(bits);
                Some(((1.0 - self.weight) * old + self.weight * sample).to_bits())
            });
    }

    pub fn get(&self) -> f64 {
        f64::from_bits(self.bits.load(Ordering::Relaxed))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn converges_towards_samples() {
        let avg = MovingAverage::new(0.5, 0.0);

        avg.update(1.0);
        assert_eq!(avg.get(), 0.5);

        avg.update(1.0);
        assert_eq!(avg.get(), 0.75);
    }

    #[test]
    fn low_weight_moves_slowly() {
        let avg = MovingAverage::new(0.01, 0.5);

        avg.update(1.0);
        assert!((avg.get() - 0.505).abs() < 1e-9);
    }
}
