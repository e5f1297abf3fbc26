//! Data-parallel collectives.
//!
//! The trainer hands a [`ProcessGroup`] to callbacks when a run spans
//! several workers. Gradients of a wrapped module are flattened into one
//! host buffer, mean-reduced across the group, and written back into the
//! [`GradientsParams`] before the optimizer step.

use std::sync::{Arc, Condvar, Mutex};

use burn::module::{AutodiffModule, ModuleVisitor, ParamId};
use burn::optim::GradientsParams;
use burn::prelude::*;
use burn::tensor::backend::AutodiffBackend;

use crate::error::{Result, TrainingError};

/// Collective operations shared by all workers of one run.
pub trait ProcessGroup: Send + Sync {
    /// This worker's index in `0..world_size`.
    fn rank(&self) -> usize;

    fn world_size(&self) -> usize;

    /// Replace `values` with the element-wise mean over all workers.
    ///
    /// Blocks until every worker has contributed a buffer of the same length.
    fn all_reduce_mean(&self, values: &mut [f32]) -> Result<()>;
}

/// Handle describing a module wrapped for data-parallel execution.
#[derive(Clone)]
pub struct DistributedParallel {
    pub process_group: Arc<dyn ProcessGroup>,
    /// Devices the wrapped replica runs on (one per worker).
    pub device_ids: Vec<usize>,
}

impl DistributedParallel {
    pub fn new(process_group: Arc<dyn ProcessGroup>) -> Self {
        let device_ids = vec![process_group.rank()];
        Self {
            process_group,
            device_ids,
        }
    }
}

impl std::fmt::Debug for DistributedParallel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DistributedParallel")
            .field("rank", &self.process_group.rank())
            .field("world_size", &self.process_group.world_size())
            .field("device_ids", &self.device_ids)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Gradient all-reduce
// ---------------------------------------------------------------------------

/// Collects every float tensor's gradient (zeros when absent) into one buffer.
///
/// Every worker contributes the same layout. Tensors without a local gradient
/// (running statistics, unused parameters) are padded with zeros and marked
/// so the scatter pass leaves them without a gradient.
struct GradientGather<'a, B: AutodiffBackend> {
    grads: &'a mut GradientsParams,
    buffer: Vec<f32>,
    present: Vec<bool>,
    _backend: std::marker::PhantomData<B>,
}

impl<B: AutodiffBackend> ModuleVisitor<B> for GradientGather<'_, B> {
    fn visit_float<const D: usize>(&mut self, id: ParamId, tensor: &Tensor<B, D>) {
        match self.grads.remove::<B::InnerBackend, D>(id) {
            Some(grad) => {
                self.buffer.extend(grad.into_data().iter::<f32>());
                self.present.push(true);
            }
            None => {
                let numel: usize = tensor.dims().iter().product();
                self.buffer.extend(std::iter::repeat(0.0).take(numel));
                self.present.push(false);
            }
        }
    }
}

/// Writes reduced values back as gradients, in the same visit order.
struct GradientScatter<'a, B: AutodiffBackend> {
    grads: &'a mut GradientsParams,
    buffer: &'a [f32],
    present: &'a [bool],
    offset: usize,
    index: usize,
    _backend: std::marker::PhantomData<B>,
}

impl<B: AutodiffBackend> ModuleVisitor<B> for GradientScatter<'_, B> {
    fn visit_float<const D: usize>(&mut self, id: ParamId, tensor: &Tensor<B, D>) {
        let dims = tensor.dims();
        let numel: usize = dims.iter().product();
        let range = self.offset..self.offset + numel;
        let present = self.present.get(self.index).copied().unwrap_or(false);
        self.offset += numel;
        self.index += 1;
        if !present {
            return;
        }
        let values = self.buffer[range].to_vec();
        let grad = Tensor::<B::InnerBackend, D>::from_data(
            TensorData::new(values, dims),
            &tensor.device(),
        );
        self.grads.register::<B::InnerBackend, D>(id, grad);
    }
}

/// Average `grads` for every parameter of `module` across `group`.
pub fn all_reduce_gradients<B: AutodiffBackend, M: AutodiffModule<B>>(
    module: &M,
    mut grads: GradientsParams,
    group: &dyn ProcessGroup,
) -> Result<GradientsParams> {
    let mut gather = GradientGather::<B> {
        grads: &mut grads,
        buffer: Vec::with_capacity(module.num_params()),
        present: Vec::new(),
        _backend: std::marker::PhantomData,
    };
    module.visit(&mut gather);
    let GradientGather {
        mut buffer,
        present,
        ..
    } = gather;

    group.all_reduce_mean(&mut buffer)?;

    let mut scatter = GradientScatter::<B> {
        grads: &mut grads,
        buffer: &buffer,
        present: &present,
        offset: 0,
        index: 0,
        _backend: std::marker::PhantomData,
    };
    module.visit(&mut scatter);
    Ok(grads)
}

// ---------------------------------------------------------------------------
// In-memory process group
// ---------------------------------------------------------------------------

fn poisoned<T>(_: T) -> TrainingError {
    TrainingError::Distributed("reduce state poisoned".to_string())
}

#[derive(Debug, Default)]
struct ReduceInner {
    arrived: usize,
    generation: u64,
    buffer: Vec<f32>,
    result: Vec<f32>,
}

#[derive(Debug, Default)]
struct ReduceState {
    inner: Mutex<ReduceInner>,
    condvar: Condvar,
}

/// Thread-backed process group: one handle per worker thread.
#[derive(Debug)]
pub struct InMemoryProcessGroup {
    rank: usize,
    world_size: usize,
    state: Arc<ReduceState>,
}

impl InMemoryProcessGroup {
    /// Create `world_size` connected handles, ranks `0..world_size`.
    pub fn group(world_size: usize) -> Result<Vec<Arc<InMemoryProcessGroup>>> {
        if world_size == 0 {
            return Err(TrainingError::Distributed(
                "world size must be positive".to_string(),
            ));
        }
        let state = Arc::new(ReduceState::default());
        Ok((0..world_size)
            .map(|rank| {
                Arc::new(InMemoryProcessGroup {
                    rank,
                    world_size,
                    state: Arc::clone(&state),
                })
            })
            .collect())
    }
}

impl ProcessGroup for InMemoryProcessGroup {
    fn rank(&self) -> usize {
        self.rank
    }

    fn world_size(&self) -> usize {
        self.world_size
    }

    fn all_reduce_mean(&self, values: &mut [f32]) -> Result<()> {
        let mut state = self.state.inner.lock().map_err(poisoned)?;

        if state.arrived == 0 {
            state.buffer = vec![0.0; values.len()];
        } else if state.buffer.len() != values.len() {
            return Err(TrainingError::Distributed(format!(
                "buffer length mismatch on rank {}: expected {}, got {}",
                self.rank,
                state.buffer.len(),
                values.len()
            )));
        }
        for (acc, v) in state.buffer.iter_mut().zip(values.iter()) {
            *acc += *v;
        }
        state.arrived += 1;

        let generation = state.generation;
        if state.arrived == self.world_size {
            let n = self.world_size as f32;
            state.result = state.buffer.iter().map(|v| v / n).collect();
            state.arrived = 0;
            state.generation += 1;
            self.state.condvar.notify_all();
        } else {
            while state.generation == generation {
                state = self.state.condvar.wait(state).map_err(poisoned)?;
            }
        }

        values.copy_from_slice(&state.result);
        Ok(())
    }
}
