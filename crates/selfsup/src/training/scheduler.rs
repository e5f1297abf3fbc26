//! Learning-rate schedules and their trainer-side entries.
//!
//! A [`LearningRateScheduler`] is a stateful step function: `step()` advances
//! its counter and returns the new learning rate. An [`LrScheduleEntry`]
//! pairs a scheduler with the interval (`step` or `epoch`) and frequency at
//! which it should be advanced. Both are serde types so the scheduler
//! position is captured in checkpoints.

use std::f64::consts::PI;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{Result, TrainingError};

/// When a schedule entry advances.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum ScheduleInterval {
    /// After every optimizer step.
    Step,
    /// After the optimizer step on the last batch of an epoch.
    Epoch,
}

impl ScheduleInterval {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScheduleInterval::Step => "step",
            ScheduleInterval::Epoch => "epoch",
        }
    }
}

impl fmt::Display for ScheduleInterval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ScheduleInterval {
    type Err = TrainingError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "step" => Ok(ScheduleInterval::Step),
            "epoch" => Ok(ScheduleInterval::Epoch),
            other => Err(TrainingError::UnrecognizedInterval(other.to_string())),
        }
    }
}

impl TryFrom<String> for ScheduleInterval {
    type Error = TrainingError;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<ScheduleInterval> for String {
    fn from(value: ScheduleInterval) -> Self {
        value.as_str().to_string()
    }
}

/// Shape of the learning-rate curve.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum LrSchedule {
    /// Linear warmup from 0, then cosine decay to 0 at `total_steps`.
    ///
    /// Factor: `s / warmup_steps` while `s < warmup_steps`, otherwise
    /// `0.5 * (1 + cos(pi * (s - warmup_steps) / (total_steps - warmup_steps)))`.
    LinearWarmupCosineDecay {
        base_lr: f64,
        warmup_steps: usize,
        total_steps: usize,
    },
    /// Linear warmup from `warmup_start_lr` over `warmup_epochs`, then cosine
    /// annealing to `eta_min` at `max_epochs`.
    LinearWarmupCosineAnnealing {
        base_lr: f64,
        warmup_epochs: usize,
        max_epochs: usize,
        #[serde(default)]
        warmup_start_lr: f64,
        #[serde(default)]
        eta_min: f64,
    },
    /// Fixed learning rate.
    Constant { base_lr: f64 },
}

impl LrSchedule {
    /// Learning rate after `count` scheduler steps.
    pub fn lr_at(&self, count: usize) -> f64 {
        match *self {
            LrSchedule::LinearWarmupCosineDecay {
                base_lr,
                warmup_steps,
                total_steps,
            } => {
                if count < warmup_steps {
                    return base_lr * count as f64 / warmup_steps.max(1) as f64;
                }
                let decay_steps = total_steps.saturating_sub(warmup_steps).max(1);
                let progress = (count - warmup_steps) as f64 / decay_steps as f64;
                base_lr * 0.5 * (1.0 + (PI * progress.min(1.0)).cos())
            }
            LrSchedule::LinearWarmupCosineAnnealing {
                base_lr,
                warmup_epochs,
                max_epochs,
                warmup_start_lr,
                eta_min,
            } => {
                if count < warmup_epochs {
                    let span = warmup_epochs.saturating_sub(1).max(1) as f64;
                    return warmup_start_lr + count as f64 * (base_lr - warmup_start_lr) / span;
                }
                let anneal = max_epochs.saturating_sub(warmup_epochs).max(1) as f64;
                let progress = ((count - warmup_epochs) as f64 / anneal).min(1.0);
                eta_min + 0.5 * (base_lr - eta_min) * (1.0 + (PI * progress).cos())
            }
            LrSchedule::Constant { base_lr } => base_lr,
        }
    }
}

/// A schedule together with how far it has advanced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LearningRateScheduler {
    pub schedule: LrSchedule,
    /// Number of `step()` calls so far.
    pub last_step: usize,
}

impl LearningRateScheduler {
    pub fn new(schedule: LrSchedule) -> Self {
        Self {
            schedule,
            last_step: 0,
        }
    }

    /// Advance one step and return the new learning rate.
    pub fn step(&mut self) -> f64 {
        self.last_step += 1;
        self.current_lr()
    }

    pub fn current_lr(&self) -> f64 {
        self.schedule.lr_at(self.last_step)
    }
}

/// Trainer-side schedule record, aligned by position with the optimizer list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LrScheduleEntry {
    pub scheduler: LearningRateScheduler,
    pub interval: ScheduleInterval,
    #[serde(default = "default_frequency")]
    pub frequency: usize,
}

fn default_frequency() -> usize {
    1
}

impl LrScheduleEntry {
    pub fn new(schedule: LrSchedule, interval: ScheduleInterval) -> Self {
        Self {
            scheduler: LearningRateScheduler::new(schedule),
            interval,
            frequency: 1,
        }
    }

    /// Build an entry from an interval string, rejecting unknown values.
    pub fn parse(schedule: LrSchedule, interval: &str, frequency: usize) -> Result<Self> {
        Ok(Self {
            scheduler: LearningRateScheduler::new(schedule),
            interval: interval.parse()?,
            frequency,
        })
    }

    pub fn with_frequency(mut self, frequency: usize) -> Self {
        self.frequency = frequency;
        self
    }

    /// Schedule that never changes the rate (step size 1, decay factor 1).
    pub fn constant(base_lr: f64) -> Self {
        Self::new(LrSchedule::Constant { base_lr }, ScheduleInterval::Step)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_close(a: f64, b: f64) {
        assert!((a - b).abs() < 1e-12, "{a} != {b}");
    }

    #[test]
    fn test_warmup_cosine_decay_shape() {
        let schedule = LrSchedule::LinearWarmupCosineDecay {
            base_lr: 1.0,
            warmup_steps: 10,
            total_steps: 50,
        };
        assert_close(schedule.lr_at(0), 0.0);
        assert_close(schedule.lr_at(5), 0.5);
        assert_close(schedule.lr_at(10), 1.0);
        assert_close(schedule.lr_at(30), 0.5);
        assert_close(schedule.lr_at(50), 0.0);
        // clamps past the end
        assert_close(schedule.lr_at(80), 0.0);
    }

    #[test]
    fn test_warmup_cosine_decay_no_warmup() {
        let schedule = LrSchedule::LinearWarmupCosineDecay {
            base_lr: 2.0,
            warmup_steps: 0,
            total_steps: 4,
        };
        assert_close(schedule.lr_at(0), 2.0);
        assert_close(schedule.lr_at(2), 1.0);
    }

    #[test]
    fn test_warmup_cosine_annealing_endpoints() {
        let schedule = LrSchedule::LinearWarmupCosineAnnealing {
            base_lr: 0.2,
            warmup_epochs: 3,
            max_epochs: 7,
            warmup_start_lr: 0.0,
            eta_min: 0.01,
        };
        assert_close(schedule.lr_at(0), 0.0);
        assert_close(schedule.lr_at(1), 0.1);
        // warmup reaches base on its last epoch
        assert_close(schedule.lr_at(2), 0.2);
        assert_close(schedule.lr_at(3), 0.2);
        assert_close(schedule.lr_at(7), 0.01);
    }

    #[test]
    fn test_single_warmup_epoch_does_not_divide_by_zero() {
        let schedule = LrSchedule::LinearWarmupCosineAnnealing {
            base_lr: 1.0,
            warmup_epochs: 1,
            max_epochs: 1,
            warmup_start_lr: 0.5,
            eta_min: 0.0,
        };
        assert!(schedule.lr_at(0).is_finite());
        assert!(schedule.lr_at(1).is_finite());
    }

    #[test]
    fn test_scheduler_step_advances() {
        let mut scheduler = LearningRateScheduler::new(LrSchedule::LinearWarmupCosineDecay {
            base_lr: 1.0,
            warmup_steps: 4,
            total_steps: 8,
        });
        assert_close(scheduler.current_lr(), 0.0);
        assert_close(scheduler.step(), 0.25);
        assert_close(scheduler.step(), 0.5);
        assert_eq!(scheduler.last_step, 2);
    }

    #[test]
    fn test_interval_parsing() {
        assert_eq!("step".parse::<ScheduleInterval>().unwrap(), ScheduleInterval::Step);
        assert_eq!("epoch".parse::<ScheduleInterval>().unwrap(), ScheduleInterval::Epoch);
        match LrScheduleEntry::parse(LrSchedule::Constant { base_lr: 1.0 }, "batch", 1) {
            Err(TrainingError::UnrecognizedInterval(v)) => assert_eq!(v, "batch"),
            other => panic!("expected UnrecognizedInterval, got {other:?}"),
        }
    }

    #[test]
    fn test_entry_json_round_trip_keeps_position() {
        let mut entry = LrScheduleEntry::new(
            LrSchedule::LinearWarmupCosineDecay {
                base_lr: 0.3,
                warmup_steps: 2,
                total_steps: 10,
            },
            ScheduleInterval::Step,
        );
        entry.scheduler.step();
        entry.scheduler.step();
        let json = serde_json::to_string(&entry).unwrap();
        assert!(json.contains("\"interval\":\"step\""), "{json}");
        let restored: LrScheduleEntry = serde_json::from_str(&json).unwrap();
        assert_eq!(restored, entry);
    }

    #[test]
    fn test_entry_json_rejects_unknown_interval() {
        let json = r#"{"scheduler":{"schedule":{"type":"Constant","base_lr":1.0},"last_step":0},"interval":"batch"}"#;
        let err = serde_json::from_str::<LrScheduleEntry>(json).unwrap_err();
        assert!(err.to_string().contains("batch"), "{err}");
    }
}
