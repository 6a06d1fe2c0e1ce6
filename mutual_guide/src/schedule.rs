use std::f64::consts::PI;

use derive_new::new;

/// Linear warmup from `warmup_lr` to `lr`, then cosine decay to `min_lr` at `end_iter`.
#[derive(Debug, Clone, Copy, PartialEq, new)]
pub struct LrSchedule {
    lr: f64,
    warmup_lr: f64,
    min_lr: f64,
    warm_iter: usize,
    end_iter: usize,
}

impl LrSchedule {
    pub fn lr_at(&self, iteration: usize) -> f64 {
        if iteration < self.warm_iter {
            let progress = iteration as f64 / self.warm_iter as f64;
            return self.warmup_lr + (self.lr - self.warmup_lr) * progress;
        }
        if self.end_iter <= self.warm_iter {
            return self.lr;
        }

        let progress = ((iteration - self.warm_iter) as f64 / (self.end_iter - self.warm_iter) as f64).min(1.0);
        self.min_lr + 0.5 * (self.lr - self.min_lr) * (1.0 + (PI * progress).cos())
    }
}
