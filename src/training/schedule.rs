//! Learning-rate schedule: linear warmup followed by cosine decay to zero

use std::f64::consts::PI;

#[derive(Debug, Clone, Copy)]
pub struct CosineSchedule {
    peak_lr: f64,
    warmup_steps: usize,
    total_steps: usize,
}

impl CosineSchedule {
    /// Warmup covers `ceil(total_steps * warmup_ratio)` steps
    pub fn new(peak_lr: f64, total_steps: usize, warmup_ratio: f64) -> Self {
        let warmup_steps = (total_steps as f64 * warmup_ratio).ceil() as usize;
        Self {
            peak_lr,
            warmup_steps,
            total_steps,
        }
    }

    pub fn warmup_steps(&self) -> usize {
        self.warmup_steps
    }

    pub fn total_steps(&self) -> usize {
        self.total_steps
    }

    /// Learning rate for the optimizer update at 0-based `step`
    pub fn lr_at(&self, step: usize) -> f64 {
        if step < self.warmup_steps {
            return self.peak_lr * step as f64 / self.warmup_steps.max(1) as f64;
        }
        let decay_steps = self.total_steps.saturating_sub(self.warmup_steps).max(1);
        let progress = (step - self.warmup_steps) as f64 / decay_steps as f64;
        let factor = 0.5 * (1.0 + (PI * progress.min(1.0)).cos());
        self.peak_lr * factor.max(0.0)
    }
}

#[cfg(test)]
#[allow(clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_shape_of_schedule() {
        let schedule = CosineSchedule::new(2e-4, 100, 0.1);
        assert_eq!(schedule.warmup_steps(), 10);
        assert_eq!(schedule.lr_at(0), 0.0);
        assert!((schedule.lr_at(5) - 1e-4).abs() < 1e-12);
        assert!((schedule.lr_at(10) - 2e-4).abs() < 1e-12);
        assert!((schedule.lr_at(55) - 1e-4).abs() < 1e-9);
        assert!(schedule.lr_at(100).abs() < 1e-12);
        assert!(schedule.lr_at(150).abs() < 1e-12);
    }

    #[test]
    fn test_monotonic_decay_after_warmup() {
        let schedule = CosineSchedule::new(1.0, 40, 0.1);
        let lrs: Vec<f64> = (schedule.warmup_steps()..=40).map(|s| schedule.lr_at(s)).collect();
        assert!(lrs.windows(2).all(|w| w[1] <= w[0]));
    }

    #[test]
    fn test_warmup_rounds_up() {
        let schedule = CosineSchedule::new(1.0, 7, 0.1);
        assert_eq!(schedule.warmup_steps(), 1);
        let none = CosineSchedule::new(1.0, 7, 0.0);
        assert_eq!(none.warmup_steps(), 0);
        assert!((none.lr_at(0) - 1.0).abs() < 1e-12);
    }
}
