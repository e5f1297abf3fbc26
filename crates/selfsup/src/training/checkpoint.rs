//! Checkpoint directory bundles.
//!
//! ```text
//! <dir>/
//!   checkpoint.json          epoch, global_step, hyper_parameters (with ssl_type),
//!                            lr_schedulers, optimizer_states, callbacks
//!   model.mpk                module parameters
//!   optimizer_{i}.mpk        optimizer state, in configure_optimizers order
//!   callbacks/<Name>/        one directory per callback, holding its named blocks
//! ```
//!
//! `lr_schedulers` is written collapsed to a bare object when there is only
//! one schedule and read back through [`OneOrMany`], so both shapes load.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use burn::tensor::backend::AutodiffBackend;
use serde::{Deserialize, Serialize};

use crate::error::{Result, TrainingError};
use crate::training::module::SelfSupervisedModule;
use crate::training::scheduler::LrScheduleEntry;
use crate::training::trainer::{SharedCallback, TrainerState};
use crate::types::SslTrainingType;
use crate::utils::{get_from_list_or_singleton, OneOrMany};

pub const CHECKPOINT_META_FILE: &str = "checkpoint.json";
pub const MODEL_STATE_NAME: &str = "model";
pub const CALLBACKS_DIR: &str = "callbacks";

/// Per-optimizer entry of `checkpoint.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OptimizerStateMeta {
    pub name: String,
    /// Record base name inside the checkpoint directory.
    pub file: String,
    pub learning_rate: f64,
    pub steps_taken: usize,
}

/// Contents of `checkpoint.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointMeta {
    pub epoch: usize,
    pub global_step: usize,
    pub hyper_parameters: serde_json::Value,
    pub lr_schedulers: OneOrMany<LrScheduleEntry>,
    pub optimizer_states: Vec<OptimizerStateMeta>,
    /// Callback name → state block names.
    #[serde(default)]
    pub callbacks: BTreeMap<String, Vec<String>>,
}

impl CheckpointMeta {
    /// Training-type tag recorded under `hyper_parameters.ssl_type`.
    pub fn ssl_type(&self) -> Result<SslTrainingType> {
        match self.hyper_parameters.get("ssl_type") {
            Some(serde_json::Value::String(tag)) => tag.parse(),
            Some(other) => Err(TrainingError::UnknownSslType(other.to_string())),
            None => Err(TrainingError::UnknownSslType("<missing>".to_string())),
        }
    }

    /// Module hyperparameters without the `ssl_type` tag.
    pub fn module_hyper_parameters(&self) -> serde_json::Value {
        let mut hparams = self.hyper_parameters.clone();
        if let serde_json::Value::Object(map) = &mut hparams {
            map.remove("ssl_type");
        }
        hparams
    }

    /// Schedule entries for the first `num_optimizers` optimizers.
    ///
    /// Stops at the first optimizer without an entry; remaining optimizers
    /// run unscheduled.
    pub fn schedules_for(&self, num_optimizers: usize) -> Result<Vec<LrScheduleEntry>> {
        let mut entries = Vec::new();
        for idx in 0..num_optimizers {
            match get_from_list_or_singleton(&self.lr_schedulers, idx, false)? {
                Some(entry) => entries.push(entry.clone()),
                None => break,
            }
        }
        Ok(entries)
    }
}

/// Read `checkpoint.json` from a checkpoint directory.
pub fn read_checkpoint_meta(dir: &Path) -> Result<CheckpointMeta> {
    let path = dir.join(CHECKPOINT_META_FILE);
    let file = fs::File::open(&path).map_err(|e| TrainingError::io(&path, e))?;
    Ok(serde_json::from_reader(file)?)
}

/// Total size in bytes of all files in a checkpoint directory.
pub fn checkpoint_size_bytes(dir: &Path) -> Result<u64> {
    let mut total = 0;
    for entry in fs::read_dir(dir).map_err(|e| TrainingError::io(dir, e))? {
        let entry = entry.map_err(|e| TrainingError::io(dir, e))?;
        let meta = entry.metadata().map_err(|e| TrainingError::io(entry.path(), e))?;
        total += if meta.is_dir() {
            checkpoint_size_bytes(&entry.path())?
        } else {
            meta.len()
        };
    }
    Ok(total)
}

fn optimizer_file(idx: usize) -> String {
    format!("optimizer_{idx}")
}

pub fn callback_dir(dir: &Path, callback_name: &str) -> PathBuf {
    dir.join(CALLBACKS_DIR).join(callback_name)
}

/// Save module weights, optimizer states, schedules and callback blocks.
pub fn save_checkpoint<B: AutodiffBackend>(
    dir: &Path,
    module: &dyn SelfSupervisedModule<B>,
    state: &TrainerState,
    callbacks: &[SharedCallback<B>],
) -> Result<()> {
    fs::create_dir_all(dir).map_err(|e| TrainingError::io(dir, e))?;

    module.save_weights(&dir.join(MODEL_STATE_NAME))?;

    let mut optimizer_states = Vec::new();
    for (idx, slot) in module.optimizers().iter().enumerate() {
        let slot = slot.borrow();
        let file = optimizer_file(idx);
        slot.save_state(&dir.join(&file))?;
        optimizer_states.push(OptimizerStateMeta {
            name: slot.name().to_string(),
            file,
            learning_rate: slot.learning_rate(),
            steps_taken: slot.steps_taken(),
        });
    }

    let mut callback_blocks = BTreeMap::new();
    for callback in callbacks {
        let callback = callback.borrow();
        let cb_dir = callback_dir(dir, callback.name());
        fs::create_dir_all(&cb_dir).map_err(|e| TrainingError::io(&cb_dir, e))?;
        let blocks = callback.on_save_checkpoint(&cb_dir)?;
        callback_blocks.insert(callback.name().to_string(), blocks);
    }

    let mut hyper_parameters = module.hyper_parameters()?;
    if let serde_json::Value::Object(map) = &mut hyper_parameters {
        map.insert(
            "ssl_type".to_string(),
            serde_json::Value::String(module.ssl_type().to_string()),
        );
    }

    let lr_schedulers = match state.lr_schedulers.as_slice() {
        [single] => OneOrMany::One(single.clone()),
        entries => OneOrMany::Many(entries.to_vec()),
    };

    let meta = CheckpointMeta {
        epoch: state.current_epoch,
        global_step: state.global_step,
        hyper_parameters,
        lr_schedulers,
        optimizer_states,
        callbacks: callback_blocks,
    };
    let meta_path = dir.join(CHECKPOINT_META_FILE);
    let file = fs::File::create(&meta_path).map_err(|e| TrainingError::io(&meta_path, e))?;
    serde_json::to_writer_pretty(file, &meta)?;

    tracing::info!(
        path = %dir.display(),
        epoch = meta.epoch,
        global_step = meta.global_step,
        optimizers = meta.optimizer_states.len(),
        callbacks = meta.callbacks.len(),
        "Checkpoint saved"
    );
    Ok(())
}

/// Restore a module, the loop state and callbacks from a checkpoint directory.
///
/// The module must already have its optimizers attached, in the same order
/// they were saved.
pub fn restore_checkpoint<B: AutodiffBackend>(
    dir: &Path,
    module: &mut dyn SelfSupervisedModule<B>,
    state: &mut TrainerState,
    callbacks: &[SharedCallback<B>],
) -> Result<CheckpointMeta> {
    let meta = read_checkpoint_meta(dir)?;
    let saved_type = meta.ssl_type()?;
    if saved_type != module.ssl_type() {
        return Err(TrainingError::IncompatibleConfig(format!(
            "checkpoint holds a {saved_type} module, cannot restore into {}",
            module.ssl_type()
        )));
    }

    module.load_weights(&dir.join(MODEL_STATE_NAME))?;

    let optimizers = module.optimizers();
    if optimizers.len() != meta.optimizer_states.len() {
        return Err(TrainingError::OptimizerCount {
            expected: meta.optimizer_states.len().to_string(),
            actual: optimizers.len(),
        });
    }
    for (slot, saved) in optimizers.iter().zip(&meta.optimizer_states) {
        let mut slot = slot.borrow_mut();
        slot.load_state(&dir.join(&saved.file))?;
        slot.set_learning_rate(saved.learning_rate);
    }

    state.current_epoch = meta.epoch;
    state.global_step = meta.global_step;
    state.lr_schedulers = meta.schedules_for(optimizers.len())?;

    // Callbacks restore after the module's optimizer list, so a callback's own
    // optimizer block wins over the slot it registered with the module.
    for callback in callbacks {
        let mut callback = callback.borrow_mut();
        if meta.callbacks.contains_key(callback.name()) {
            let state_dir = callback_dir(dir, callback.name());
            callback.on_load_checkpoint(&state_dir)?;
        } else {
            tracing::warn!(callback = callback.name(), "No state for callback in checkpoint");
        }
    }

    tracing::info!(
        path = %dir.display(),
        epoch = meta.epoch,
        global_step = meta.global_step,
        "Restored checkpoint"
    );
    Ok(meta)
}
