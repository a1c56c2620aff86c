//! Learning rate scheduling.
//!
//! The schedule is advanced at two granularities: [`LearningRateScheduler::step_update`]
//! after every optimizer step (drives warmup), and [`LearningRateScheduler::step`]
//! once per epoch.

use serde::{Deserialize, Serialize};
use std::f64::consts::PI;
use vision_core::{Error, Result};

/// Learning rate scheduler type
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SchedulerType {
    /// Constant learning rate (no scheduling)
    Constant,

    /// Step decay: multiply LR by gamma every step_size epochs
    StepLR { step_size: usize, gamma: f64 },

    /// Exponential decay: multiply LR by gamma every epoch
    ExponentialLR { gamma: f64 },

    /// Cosine annealing from the base LR down to eta_min over t_max epochs
    CosineAnnealingLR { t_max: usize, eta_min: f64 },

    /// Linear per-update warmup followed by per-epoch cosine decay
    WarmupCosine {
        warmup_epochs: usize,
        total_epochs: usize,
        eta_min: f64,
    },
}

impl Default for SchedulerType {
    fn default() -> Self {
        Self::Constant
    }
}

impl SchedulerType {
    /// Resolves `Train.scheduler`
    pub fn from_name(name: &str, epochs: usize, warmup_epochs: usize) -> Result<Self> {
        match name.trim().to_lowercase().as_str() {
            "constant" => Ok(SchedulerType::Constant),
            "step" => Ok(SchedulerType::StepLR {
                step_size: (epochs / 3).max(1),
                gamma: 0.1,
            }),
            "exponential" => Ok(SchedulerType::ExponentialLR { gamma: 0.95 }),
            "cosine" if warmup_epochs == 0 => Ok(SchedulerType::CosineAnnealingLR {
                t_max: epochs,
                eta_min: 1e-6,
            }),
            "cosine" | "warmup_cosine" => Ok(SchedulerType::WarmupCosine {
                warmup_epochs,
                total_epochs: epochs,
                eta_min: 1e-6,
            }),
            other => Err(Error::Config(format!(
                "unknown scheduler '{other}' (expected constant, step, exponential, cosine or warmup_cosine)"
            ))),
        }
    }
}

/// Learning rate scheduler
#[derive(Debug, Clone)]
pub struct LearningRateScheduler {
    scheduler_type: SchedulerType,
    base_lr: f64,
    current_lr: f64,
    current_epoch: usize,
    updates_per_epoch: usize,
}

impl LearningRateScheduler {
    /// Create a new learning rate scheduler
    pub fn new(scheduler_type: SchedulerType, base_lr: f64) -> Self {
        let mut scheduler = Self {
            scheduler_type,
            base_lr,
            current_lr: base_lr,
            current_epoch: 0,
            updates_per_epoch: 1,
        };
        scheduler.step_update(0);
        scheduler
    }

    /// Sets the number of optimizer steps per epoch used by the warmup
    pub fn with_updates_per_epoch(mut self, updates: usize) -> Self {
        self.updates_per_epoch = updates.max(1);
        self.step_update(0);
        self
    }

    /// Get the current learning rate
    pub fn get_lr(&self) -> f64 {
        self.current_lr
    }

    /// Current LR relative to the base LR, used to drive a second parameter
    /// group proportionally
    pub fn factor(&self) -> f64 {
        if self.base_lr > 0.0 {
            self.current_lr / self.base_lr
        } else {
            1.0
        }
    }

    /// Per-update granularity; `num_updates` counts optimizer steps since
    /// the start of training
    pub fn step_update(&mut self, num_updates: usize) {
        if let SchedulerType::WarmupCosine { warmup_epochs, .. } = self.scheduler_type {
            let warmup_updates = warmup_epochs * self.updates_per_epoch;
            if num_updates < warmup_updates {
                self.current_lr = self.base_lr * (num_updates + 1) as f64 / warmup_updates as f64;
            } else if self.current_epoch < warmup_epochs {
                self.current_lr = self.base_lr;
            }
        }
    }

    /// Step the scheduler (call at the end of each epoch)
    pub fn step(&mut self) {
        self.current_epoch += 1;

        match &self.scheduler_type {
            SchedulerType::Constant => {}

            SchedulerType::StepLR { step_size, gamma } => {
                if self.current_epoch % step_size == 0 {
                    self.current_lr *= gamma;
                }
            }

            SchedulerType::ExponentialLR { gamma } => {
                self.current_lr *= gamma;
            }

            SchedulerType::CosineAnnealingLR { t_max, eta_min } => {
                self.current_lr = cosine(self.base_lr, *eta_min, self.current_epoch, *t_max);
            }

            SchedulerType::WarmupCosine {
                warmup_epochs,
                total_epochs,
                eta_min,
            } => {
                if self.current_epoch >= *warmup_epochs {
                    let decay_epochs = total_epochs.saturating_sub(*warmup_epochs).max(1);
                    self.current_lr = cosine(
                        self.base_lr,
                        *eta_min,
                        self.current_epoch - warmup_epochs,
                        decay_epochs,
                    );
                }
            }
        }
    }
}

fn cosine(base_lr: f64, eta_min: f64, epoch: usize, period: usize) -> f64 {
    let progress = (epoch as f64 / period.max(1) as f64).min(1.0);
    eta_min + (base_lr - eta_min) * (1.0 + (progress * PI).cos()) / 2.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_constant_scheduler() {
        let mut scheduler = LearningRateScheduler::new(SchedulerType::Constant, 0.001);
        assert_eq!(scheduler.get_lr(), 0.001);

        scheduler.step();
        scheduler.step_update(50);
        assert_eq!(scheduler.get_lr(), 0.001);
        assert_eq!(scheduler.factor(), 1.0);
    }

    #[test]
    fn test_step_lr() {
        let mut scheduler = LearningRateScheduler::new(
            SchedulerType::StepLR {
                step_size: 2,
                gamma: 0.5,
            },
            0.001,
        );

        scheduler.step(); // epoch 1
        assert_eq!(scheduler.get_lr(), 0.001);

        scheduler.step(); // epoch 2
        assert!((scheduler.get_lr() - 0.0005).abs() < 1e-9);

        scheduler.step(); // epoch 3
        scheduler.step(); // epoch 4
        assert!((scheduler.get_lr() - 0.00025).abs() < 1e-9);
    }

    #[test]
    fn test_exponential_lr() {
        let mut scheduler =
            LearningRateScheduler::new(SchedulerType::ExponentialLR { gamma: 0.9 }, 0.001);

        scheduler.step();
        assert!((scheduler.get_lr() - 0.0009).abs() < 1e-9);

        scheduler.step();
        assert!((scheduler.get_lr() - 0.00081).abs() < 1e-9);
        assert!((scheduler.factor() - 0.81).abs() < 1e-9);
    }

    #[test]
    fn test_cosine_annealing() {
        let mut scheduler = LearningRateScheduler::new(
            SchedulerType::CosineAnnealingLR {
                t_max: 10,
                eta_min: 0.0001,
            },
            0.001,
        );

        for _ in 0..5 {
            scheduler.step();
        }
        // halfway: midpoint of base and eta_min
        assert!((scheduler.get_lr() - 0.00055).abs() < 1e-9);

        for _ in 0..5 {
            scheduler.step();
        }
        assert!((scheduler.get_lr() - 0.0001).abs() < 1e-9);
    }

    #[test]
    fn test_warmup_is_per_update() {
        let mut scheduler = LearningRateScheduler::new(
            SchedulerType::WarmupCosine {
                warmup_epochs: 2,
                total_epochs: 10,
                eta_min: 0.0,
            },
            0.01,
        )
        .with_updates_per_epoch(5);

        // first update runs at 1/10 of the base rate
        assert!((scheduler.get_lr() - 0.001).abs() < 1e-12);
        scheduler.step_update(4);
        assert!((scheduler.get_lr() - 0.005).abs() < 1e-12);
        scheduler.step_update(9);
        assert!((scheduler.get_lr() - 0.01).abs() < 1e-12);

        scheduler.step();
        scheduler.step();
        scheduler.step_update(10);
        assert!((scheduler.get_lr() - 0.01).abs() < 1e-12);

        scheduler.step();
        assert!(scheduler.get_lr() < 0.01);
    }

    #[test]
    fn test_from_name() {
        assert_eq!(
            SchedulerType::from_name("cosine", 20, 0).unwrap(),
            SchedulerType::CosineAnnealingLR {
                t_max: 20,
                eta_min: 1e-6
            }
        );
        assert!(matches!(
            SchedulerType::from_name("cosine", 20, 2).unwrap(),
            SchedulerType::WarmupCosine { warmup_epochs: 2, .. }
        ));
        assert!(matches!(
            SchedulerType::from_name("step", 9, 0).unwrap(),
            SchedulerType::StepLR { step_size: 3, .. }
        ));
        assert!(matches!(
            SchedulerType::from_name("plateau", 9, 0),
            Err(Error::Config(_))
        ));
    }
}
