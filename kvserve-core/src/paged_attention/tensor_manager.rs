use std::collections::HashMap;

use candle_core::{DType, Shape};
use kvserve_paged_attn::DeviceDataPtr;
use tracing::warn;

use super::block_manager::BlockManager;
use crate::error::{BlockId, Error, Result};

/// A named weight backed by a contiguous block of one rank.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WeightTensor {
    pub shape: Shape,
    pub dtype: DType,
    pub block_id: BlockId,
    pub rank: usize,
}

impl WeightTensor {
    pub fn size_in_bytes(&self) -> usize {
        self.shape.elem_count() * self.dtype.size_in_bytes()
    }
}

/// Registry of one rank's weight tensors.
#[derive(Debug, Default)]
pub struct TensorManager {
    rank: usize,
    weights: HashMap<String, WeightTensor>,
}

impl TensorManager {
    pub fn new(rank: usize) -> Self {
        Self {
            rank,
            weights: HashMap::new(),
        }
    }

    /// Reserve device memory for a weight. The contents are left zeroed.
    ///
    /// Registering a name twice keeps the first tensor and succeeds.
    pub fn add_weight_tensor(
        &mut self,
        blocks: &mut BlockManager,
        name: &str,
        shape: impl Into<Shape>,
        dtype: DType,
    ) -> Result<()> {
        if self.weights.contains_key(name) {
            warn!(
                rank = self.rank,
                "The weight named {name} has already been created. Skip creating the weight tensor."
            );
            return Ok(());
        }
        let shape = shape.into();
        blocks.set_active_device(self.rank)?;
        let block_id = blocks.allocate_contiguous(shape.elem_count() * dtype.size_in_bytes())?;
        self.weights.insert(
            name.to_string(),
            WeightTensor {
                shape,
                dtype,
                block_id,
                rank: self.rank,
            },
        );
        Ok(())
    }

    /// Register `copy` with the shape and dtype of `origin`.
    pub fn create_tensor_with_same_shape(
        &mut self,
        blocks: &mut BlockManager,
        origin: &str,
        copy: &str,
    ) -> Result<()> {
        let WeightTensor { shape, dtype, .. } = self
            .weights
            .get(origin)
            .cloned()
            .ok_or_else(|| Error::UnknownTensor(origin.to_string()))?;
        self.add_weight_tensor(blocks, copy, shape, dtype)
    }

    pub fn get(&self, name: &str) -> Option<&WeightTensor> {
        self.weights.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.weights.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.weights.len()
    }

    pub fn is_empty(&self) -> bool {
        self.weights.is_empty()
    }

    /// Device address of a registered weight.
    pub fn address(&self, blocks: &mut BlockManager, name: &str) -> Result<DeviceDataPtr> {
        let weight = self
            .get(name)
            .ok_or_else(|| Error::UnknownTensor(name.to_string()))?;
        blocks.set_active_device(self.rank)?;
        blocks.resolve(weight.block_id)
    }
}
