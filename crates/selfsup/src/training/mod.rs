//! Training pipeline: optimizers and schedules, the step coordinator,
//! SimCLR/BYOL modules, the online evaluator callback, checkpoints and the
//! lifecycle-driving trainer.

pub mod byol;
pub mod checkpoint;
pub mod distributed;
pub mod loss;
pub mod metrics;
pub mod module;
pub mod online_evaluator;
pub mod optimization;
pub mod optimizer;
pub mod scheduler;
pub mod simclr;
pub mod trainer;
