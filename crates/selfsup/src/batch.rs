//! Batches of augmented view pairs.
//!
//! A batch is either a single `(view1, view2), labels` tuple, or a map keyed
//! by [`SslDataModuleType`] when the encoder and the linear head are fed from
//! different data modules.

use std::collections::HashMap;

use burn::prelude::*;

use crate::error::{Result, TrainingError};
use crate::types::SslDataModuleType;

/// Two augmented views of the same images plus their class labels.
#[derive(Debug, Clone)]
pub struct ViewPairBatch<B: Backend> {
    /// `[batch, channels, height, width]`
    pub view1: Tensor<B, 4>,
    /// `[batch, channels, height, width]`
    pub view2: Tensor<B, 4>,
    /// `[batch]` class indices.
    pub labels: Tensor<B, 1, Int>,
}

impl<B: Backend> ViewPairBatch<B> {
    pub fn new(view1: Tensor<B, 4>, view2: Tensor<B, 4>, labels: Tensor<B, 1, Int>) -> Self {
        Self { view1, view2, labels }
    }

    pub fn batch_size(&self) -> usize {
        self.labels.dims()[0]
    }
}

/// A training or validation batch as delivered by the data loader.
#[derive(Debug, Clone)]
pub enum SslBatch<B: Backend> {
    Single(ViewPairBatch<B>),
    Keyed(HashMap<SslDataModuleType, ViewPairBatch<B>>),
}

impl<B: Backend> SslBatch<B> {
    /// Sub-batch for `key`; a single batch serves every consumer.
    pub fn select(&self, key: SslDataModuleType) -> Result<&ViewPairBatch<B>> {
        match self {
            SslBatch::Single(batch) => Ok(batch),
            SslBatch::Keyed(map) => map
                .get(&key)
                .ok_or_else(|| TrainingError::MissingSubBatch(key.to_string())),
        }
    }

    pub fn keyed(encoder: ViewPairBatch<B>, linear_head: ViewPairBatch<B>) -> Self {
        let mut map = HashMap::new();
        map.insert(SslDataModuleType::Encoder, encoder);
        map.insert(SslDataModuleType::LinearHead, linear_head);
        SslBatch::Keyed(map)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;

    type TestBackend = NdArray<f32>;

    fn batch(fill: f32, n: usize) -> ViewPairBatch<TestBackend> {
        let device = Default::default();
        ViewPairBatch::new(
            Tensor::full([n, 3, 4, 4], fill, &device),
            Tensor::full([n, 3, 4, 4], fill, &device),
            Tensor::zeros([n], &device),
        )
    }

    #[test]
    fn test_single_serves_all_keys() {
        let b = SslBatch::Single(batch(1.0, 2));
        assert_eq!(b.select(SslDataModuleType::Encoder).unwrap().batch_size(), 2);
        assert_eq!(b.select(SslDataModuleType::LinearHead).unwrap().batch_size(), 2);
    }

    #[test]
    fn test_keyed_selects_matching_entry() {
        let b = SslBatch::keyed(batch(1.0, 2), batch(2.0, 3));
        assert_eq!(b.select(SslDataModuleType::Encoder).unwrap().batch_size(), 2);
        assert_eq!(b.select(SslDataModuleType::LinearHead).unwrap().batch_size(), 3);
    }

    #[test]
    fn test_keyed_missing_entry() {
        let mut map = HashMap::new();
        map.insert(SslDataModuleType::Encoder, batch(1.0, 2));
        let b = SslBatch::Keyed(map);
        assert!(matches!(
            b.select(SslDataModuleType::LinearHead),
            Err(TrainingError::MissingSubBatch(_))
        ));
    }
}
