//! Self-supervised encoder pretraining.
//!
//! Provides SimCLR and BYOL training modules whose optimizers are stepped
//! explicitly through a dual-optimizer step coordinator, an online evaluator
//! callback that trains a linear head on detached representations alongside
//! pretraining, directory checkpoints, and a loader that turns a pretraining
//! checkpoint into a frozen-encoder image classifier.

pub mod batch;
pub mod error;
pub mod loader;
pub mod model;
pub mod training;
pub mod types;
pub mod utils;

pub use error::{Result, TrainingError};
pub use loader::create_ssl_image_classifier;
pub use types::{SslDataModuleType, SslTrainingType};
