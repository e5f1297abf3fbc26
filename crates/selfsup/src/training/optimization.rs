//! Manual optimization step shared by all self-supervised modules.
//!
//! Modules that own more than one optimizer run with automatic optimization
//! off and call [`manual_optimization_step`] explicitly for each optimizer
//! they drive. The function performs zero-grad → backward → step on the
//! selected optimizer, then advances the aligned learning-rate schedule
//! according to its interval.

use burn::prelude::*;
use burn::tensor::backend::AutodiffBackend;

use crate::error::{Result, TrainingError};
use crate::training::optimizer::SharedSlot;
use crate::training::scheduler::ScheduleInterval;
use crate::training::trainer::TrainerState;

/// A module whose optimizers are stepped by the module itself.
pub trait ManualOptimization<B: AutodiffBackend> {
    /// Optimizers in `configure_optimizers` order.
    fn optimizers(&self) -> &[SharedSlot<B>];
}

/// Step optimizer `optimizer_idx` on `loss`, then advance its schedule.
///
/// The schedule entry at the same index in `trainer.lr_schedulers` is
/// advanced immediately for `step` intervals and only on the last batch of
/// the epoch for `epoch` intervals. A missing entry is a no-op; a frequency
/// other than 1 is rejected after the optimizer step has been applied.
pub fn manual_optimization_step<B, M>(
    module: &M,
    trainer: &mut TrainerState,
    loss: Tensor<B, 1>,
    optimizer_idx: usize,
) -> Result<()>
where
    B: AutodiffBackend,
    M: ManualOptimization<B> + ?Sized,
{
    let optimizers = module.optimizers();
    let slot = optimizers
        .get(optimizer_idx)
        .ok_or(TrainingError::OptimizerIndexOutOfRange {
            index: optimizer_idx,
            len: optimizers.len(),
        })?;

    {
        let mut optimizer = slot.borrow_mut();
        optimizer.zero_grad();
        optimizer.backward(loss);
        optimizer.step()?;
    }

    let Some(entry) = trainer.lr_schedulers.get_mut(optimizer_idx) else {
        return Ok(());
    };
    if entry.frequency != 1 {
        return Err(TrainingError::UnsupportedFrequency(entry.frequency));
    }
    let advance = match entry.interval {
        ScheduleInterval::Step => true,
        ScheduleInterval::Epoch => trainer.is_last_batch,
    };
    if advance {
        let lr = entry.scheduler.step();
        slot.borrow_mut().set_learning_rate(lr);
        tracing::debug!(
            optimizer_idx,
            global_step = trainer.global_step,
            interval = %entry.interval,
            lr,
            "Advanced learning rate schedule"
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::path::Path;
    use std::rc::Rc;

    use burn::backend::{Autodiff, NdArray};

    use crate::training::optimizer::OptimizerSlot;
    use crate::training::scheduler::{LrSchedule, LrScheduleEntry};

    type TestAutodiffBackend = Autodiff<NdArray<f32>>;

    /// Records the order of calls it receives.
    struct RecordingSlot {
        calls: Rc<RefCell<Vec<&'static str>>>,
        lr: f64,
    }

    impl OptimizerSlot<TestAutodiffBackend> for RecordingSlot {
        fn name(&self) -> &str {
            "recording"
        }
        fn zero_grad(&mut self) {
            self.calls.borrow_mut().push("zero_grad");
        }
        fn backward(&mut self, _loss: Tensor<TestAutodiffBackend, 1>) {
            self.calls.borrow_mut().push("backward");
        }
        fn step(&mut self) -> Result<()> {
            self.calls.borrow_mut().push("step");
            Ok(())
        }
        fn learning_rate(&self) -> f64 {
            self.lr
        }
        fn set_learning_rate(&mut self, lr: f64) {
            self.lr = lr;
        }
        fn steps_taken(&self) -> usize {
            0
        }
        fn save_state(&self, _path: &Path) -> Result<()> {
            Ok(())
        }
        fn load_state(&mut self, _path: &Path) -> Result<()> {
            Ok(())
        }
    }

    struct TwoSlots {
        slots: Vec<SharedSlot<TestAutodiffBackend>>,
    }

    impl ManualOptimization<TestAutodiffBackend> for TwoSlots {
        fn optimizers(&self) -> &[SharedSlot<TestAutodiffBackend>] {
            &self.slots
        }
    }

    fn setup() -> (TwoSlots, Rc<RefCell<Vec<&'static str>>>, Rc<RefCell<Vec<&'static str>>>) {
        let calls0 = Rc::new(RefCell::new(Vec::new()));
        let calls1 = Rc::new(RefCell::new(Vec::new()));
        let slot0: SharedSlot<TestAutodiffBackend> =
            Rc::new(RefCell::new(RecordingSlot { calls: calls0.clone(), lr: 0.0 }));
        let slot1: SharedSlot<TestAutodiffBackend> =
            Rc::new(RefCell::new(RecordingSlot { calls: calls1.clone(), lr: 0.0 }));
        (TwoSlots { slots: vec![slot0, slot1] }, calls0, calls1)
    }

    fn loss() -> Tensor<TestAutodiffBackend, 1> {
        Tensor::zeros([1], &Default::default())
    }

    fn warmup_entry() -> LrScheduleEntry {
        LrScheduleEntry::new(
            LrSchedule::LinearWarmupCosineDecay {
                base_lr: 1.0,
                warmup_steps: 10,
                total_steps: 100,
            },
            ScheduleInterval::Step,
        )
    }

    #[test]
    fn test_strict_call_order_on_selected_optimizer() {
        let (module, calls0, calls1) = setup();
        let mut trainer = TrainerState::default();
        manual_optimization_step(&module, &mut trainer, loss(), 1).unwrap();
        assert!(calls0.borrow().is_empty(), "optimizer 0 must not be touched");
        assert_eq!(*calls1.borrow(), vec!["zero_grad", "backward", "step"]);
    }

    #[test]
    fn test_index_out_of_range() {
        let (module, _, _) = setup();
        let mut trainer = TrainerState::default();
        match manual_optimization_step(&module, &mut trainer, loss(), 2) {
            Err(TrainingError::OptimizerIndexOutOfRange { index: 2, len: 2 }) => {}
            other => panic!("expected OptimizerIndexOutOfRange, got {other:?}"),
        }
    }

    #[test]
    fn test_missing_schedule_is_silent() {
        let (module, calls0, _) = setup();
        let mut trainer = TrainerState::default();
        manual_optimization_step(&module, &mut trainer, loss(), 0).unwrap();
        assert_eq!(calls0.borrow().len(), 3);
        assert_eq!(module.slots[0].borrow().learning_rate(), 0.0);
    }

    #[test]
    fn test_step_interval_advances_every_call() {
        let (module, _, _) = setup();
        let mut trainer = TrainerState::default();
        trainer.lr_schedulers = vec![warmup_entry()];
        for expected in [0.1, 0.2, 0.3] {
            manual_optimization_step(&module, &mut trainer, loss(), 0).unwrap();
            let lr = module.slots[0].borrow().learning_rate();
            assert!((lr - expected).abs() < 1e-12, "lr {lr}, expected {expected}");
        }
    }

    #[test]
    fn test_epoch_interval_waits_for_last_batch() {
        let (module, _, _) = setup();
        let mut trainer = TrainerState::default();
        let mut entry = warmup_entry();
        entry.interval = ScheduleInterval::Epoch;
        trainer.lr_schedulers = vec![entry];

        manual_optimization_step(&module, &mut trainer, loss(), 0).unwrap();
        manual_optimization_step(&module, &mut trainer, loss(), 0).unwrap();
        assert_eq!(trainer.lr_schedulers[0].scheduler.last_step, 0);

        trainer.is_last_batch = true;
        manual_optimization_step(&module, &mut trainer, loss(), 0).unwrap();
        assert_eq!(trainer.lr_schedulers[0].scheduler.last_step, 1);
        assert!((module.slots[0].borrow().learning_rate() - 0.1).abs() < 1e-12);
    }

    #[test]
    fn test_non_unit_frequency_is_rejected_after_step() {
        let (module, calls0, _) = setup();
        let mut trainer = TrainerState::default();
        trainer.lr_schedulers = vec![warmup_entry().with_frequency(2)];
        match manual_optimization_step(&module, &mut trainer, loss(), 0) {
            Err(TrainingError::UnsupportedFrequency(2)) => {}
            other => panic!("expected UnsupportedFrequency, got {other:?}"),
        }
        assert_eq!(*calls0.borrow(), vec!["zero_grad", "backward", "step"]);
        assert_eq!(trainer.lr_schedulers[0].scheduler.last_step, 0);
    }
}
