//! Feature extractor boundary.
//!
//! The encoder and its per-task adapters live outside this crate. The core
//! talks to them through [`FeatureExtractor`]: token ids plus an attention
//! mask and an expert selector go in, a `batch × query_size` embedding comes
//! out.

use std::collections::hash_map::DefaultHasher;
use std::collections::{BTreeSet, HashMap};
use std::hash::{Hash, Hasher};

use candle_core::{DType, Device, Tensor};
use tracing::debug;

use crate::error::{EoeError, EoeResult};
use crate::expert::{ExpertId, ExtractMode};

/// One embedding request.
#[derive(Debug, Clone, Copy)]
pub struct ExtractRequest<'a> {
    /// Token ids, `batch × seq_len`, `u32`.
    pub input_ids: &'a Tensor,
    /// Attention mask, same shape as `input_ids`.
    pub attention_mask: &'a Tensor,
    /// Adapter to run (`Origin` runs the bare backbone).
    pub expert: ExpertId,
    /// Pooling strategy.
    pub mode: ExtractMode,
    /// Entity marker positions, `batch × 2`, when pooling in entity mode.
    pub entity_positions: Option<&'a Tensor>,
}

/// Encoder with per-task adapters.
pub trait FeatureExtractor {
    /// Width of the produced embeddings.
    fn query_size(&self) -> usize;

    /// Allocate the adapter for a task.
    fn add_adapter(&mut self, task: usize) -> EoeResult<()>;

    /// Embed a batch, returning `batch × query_size`.
    fn extract(&self, request: &ExtractRequest<'_>) -> EoeResult<Tensor>;

    /// Load backbone encoder weights (`model.*` checkpoint tensors, prefix stripped).
    fn load_backbone(&mut self, _tensors: &HashMap<String, Tensor>) -> EoeResult<()> {
        Ok(())
    }
}

/// Deterministic extractor for development and tests.
///
/// Embeddings are derived by hashing the unmasked tokens of each row together
/// with the expert and pooling mode. The same input always produces the same
/// unit-norm embedding.
#[derive(Debug, Clone)]
pub struct StubExtractor {
    query_size: usize,
    adapters: BTreeSet<usize>,
    device: Device,
}

impl StubExtractor {
    /// Create a stub producing `query_size`-wide embeddings.
    pub fn new(query_size: usize, device: &Device) -> Self {
        Self {
            query_size,
            adapters: BTreeSet::new(),
            device: device.clone(),
        }
    }

    /// Number of allocated adapters.
    pub fn num_adapters(&self) -> usize {
        self.adapters.len()
    }

    fn embed_row(&self, tokens: &[u32], expert: ExpertId, mode: ExtractMode) -> Vec<f32> {
        let mut embedding = Vec::with_capacity(self.query_size);
        for i in 0..self.query_size {
            let mut hasher = DefaultHasher::new();
            tokens.hash(&mut hasher);
            expert.hash(&mut hasher);
            mode.hash(&mut hasher);
            (i as u64).hash(&mut hasher);
            let hash = hasher.finish();

            // Map to [-1.0, 1.0] range
            let value = ((hash as f64 / u64::MAX as f64) * 2.0 - 1.0) as f32;
            embedding.push(value);
        }

        let norm: f32 = embedding.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > 0.0 {
            for v in &mut embedding {
                *v /= norm;
            }
        }
        embedding
    }
}

impl FeatureExtractor for StubExtractor {
    fn query_size(&self) -> usize {
        self.query_size
    }

    fn add_adapter(&mut self, task: usize) -> EoeResult<()> {
        self.adapters.insert(task);
        debug!(task = task, "Stub extractor allocated adapter");
        Ok(())
    }

    fn extract(&self, request: &ExtractRequest<'_>) -> EoeResult<Tensor> {
        if let Some(task) = request.expert.task() {
            if !self.adapters.contains(&task) {
                return Err(EoeError::UnregisteredExpert {
                    expert: request.expert,
                    registered: self.adapters.len(),
                });
            }
        }

        let ids = request
            .input_ids
            .to_dtype(DType::U32)
            .and_then(|t| t.to_vec2::<u32>())
            .map_err(map_candle)?;
        let mask = request
            .attention_mask
            .to_dtype(DType::U32)
            .and_then(|t| t.to_vec2::<u32>())
            .map_err(map_candle)?;
        if ids.len() != mask.len() {
            return Err(EoeError::dims(
                "attention_mask",
                &[ids.len()],
                &[mask.len()],
            ));
        }

        let mut flat = Vec::with_capacity(ids.len() * self.query_size);
        for (row, row_mask) in ids.iter().zip(&mask) {
            let tokens: Vec<u32> = row
                .iter()
                .zip(row_mask)
                .filter(|(_, m)| **m != 0)
                .map(|(t, _)| *t)
                .collect();
            flat.extend(self.embed_row(&tokens, request.expert, request.mode));
        }

        Tensor::from_vec(flat, (ids.len(), self.query_size), &self.device).map_err(map_candle)
    }
}

fn map_candle(e: candle_core::Error) -> EoeError {
    EoeError::TensorError {
        message: format!("Extractor error: {}", e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn batch(rows: &[&[u32]]) -> (Tensor, Tensor) {
        let width = rows.iter().map(|r| r.len()).max().unwrap_or(0);
        let mut ids = Vec::new();
        let mut mask = Vec::new();
        for row in rows {
            for i in 0..width {
                let t = row.get(i).copied().unwrap_or(0);
                ids.push(t);
                mask.push(u8::from(t != 0));
            }
        }
        let device = Device::Cpu;
        (
            Tensor::from_vec(ids, (rows.len(), width), &device).unwrap(),
            Tensor::from_vec(mask, (rows.len(), width), &device).unwrap(),
        )
    }

    fn request<'a>(ids: &'a Tensor, mask: &'a Tensor, expert: ExpertId) -> ExtractRequest<'a> {
        ExtractRequest {
            input_ids: ids,
            attention_mask: mask,
            expert,
            mode: ExtractMode::Cls,
            entity_positions: None,
        }
    }

    #[test]
    fn test_shape_and_norm() {
        let mut stub = StubExtractor::new(16, &Device::Cpu);
        stub.add_adapter(0).unwrap();
        let (ids, mask) = batch(&[&[5, 6, 7], &[8, 9]]);
        let out = stub.extract(&request(&ids, &mask, ExpertId::Task(0))).unwrap();
        assert_eq!(out.dims(), &[2, 16]);

        for row in out.to_vec2::<f32>().unwrap() {
            let norm: f32 = row.iter().map(|x| x * x).sum::<f32>().sqrt();
            assert!((norm - 1.0).abs() < 1e-4);
        }
    }

    #[test]
    fn test_deterministic_and_padding_insensitive() {
        let stub = StubExtractor::new(8, &Device::Cpu);
        let (a_ids, a_mask) = batch(&[&[5, 6]]);
        let (b_ids, b_mask) = batch(&[&[5, 6], &[1, 2, 3]]);
        let a = stub.extract(&request(&a_ids, &a_mask, ExpertId::Origin)).unwrap();
        let b = stub.extract(&request(&b_ids, &b_mask, ExpertId::Origin)).unwrap();
        assert_eq!(
            a.to_vec2::<f32>().unwrap()[0],
            b.to_vec2::<f32>().unwrap()[0]
        );
    }

    #[test]
    fn test_experts_differ() {
        let mut stub = StubExtractor::new(8, &Device::Cpu);
        stub.add_adapter(0).unwrap();
        let (ids, mask) = batch(&[&[5, 6]]);
        let origin = stub.extract(&request(&ids, &mask, ExpertId::Origin)).unwrap();
        let task = stub.extract(&request(&ids, &mask, ExpertId::Task(0))).unwrap();
        assert_ne!(origin.to_vec2::<f32>().unwrap(), task.to_vec2::<f32>().unwrap());
    }

    #[test]
    fn test_missing_adapter_rejected() {
        let stub = StubExtractor::new(8, &Device::Cpu);
        let (ids, mask) = batch(&[&[5, 6]]);
        assert!(matches!(
            stub.extract(&request(&ids, &mask, ExpertId::Task(2))),
            Err(EoeError::UnregisteredExpert { .. })
        ));
    }
}
