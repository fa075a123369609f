//! Extractor stand-in for routing embeddings computed elsewhere.

use std::path::Path;

use anyhow::{bail, Context, Result};
use candle_core::{Device, Tensor};
use eoe_core::{EoeError, EoeResult, ExtractRequest, FeatureExtractor};
use serde::Deserialize;

/// Embeddings file layout: one `batch × width` matrix per expert, origin first.
#[derive(Debug, Deserialize)]
pub struct EmbeddingsFile {
    pub experts: Vec<Vec<Vec<f32>>>,
}

impl EmbeddingsFile {
    pub fn read(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading embeddings file {}", path.display()))?;
        serde_json::from_str(&text).with_context(|| format!("parsing embeddings file {}", path.display()))
    }

    /// Embedding width, checked to be uniform across experts and rows.
    pub fn width(&self) -> Result<usize> {
        let width = self
            .experts
            .first()
            .and_then(|rows| rows.first())
            .map(Vec::len)
            .context("embeddings file holds no rows")?;
        let batch = self.experts[0].len();
        for (k, rows) in self.experts.iter().enumerate() {
            if rows.len() != batch {
                bail!("expert {} has {} rows, expected {}", k, rows.len(), batch);
            }
            if let Some(row) = rows.iter().find(|r| r.len() != width) {
                bail!("expert {} has a row of width {}, expected {}", k, row.len(), width);
            }
        }
        Ok(width)
    }

    pub fn tensors(&self, device: &Device) -> Result<Vec<Tensor>> {
        let width = self.width()?;
        self.experts
            .iter()
            .map(|rows| {
                let flat: Vec<f32> = rows.iter().flatten().copied().collect();
                Tensor::from_vec(flat, (rows.len(), width), device).context("building embedding tensor")
            })
            .collect()
    }
}

/// Accepts adapter allocation but never embeds; inputs arrive precomputed.
#[derive(Debug, Clone)]
pub struct PrecomputedExtractor {
    width: usize,
}

impl PrecomputedExtractor {
    pub fn new(width: usize) -> Self {
        Self { width }
    }
}

impl FeatureExtractor for PrecomputedExtractor {
    fn query_size(&self) -> usize {
        self.width
    }

    fn add_adapter(&mut self, _task: usize) -> EoeResult<()> {
        Ok(())
    }

    fn extract(&self, request: &ExtractRequest<'_>) -> EoeResult<Tensor> {
        Err(EoeError::Unimplemented {
            message: format!("precomputed extractor cannot embed tokens for {}", request.expert),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_width_checks_rows() {
        let file = EmbeddingsFile {
            experts: vec![vec![vec![1.0, 2.0]], vec![vec![3.0]]],
        };
        assert!(file.width().is_err());

        let file = EmbeddingsFile {
            experts: vec![vec![vec![1.0, 2.0]], vec![vec![3.0, 4.0]]],
        };
        assert_eq!(file.width().unwrap(), 2);
        let tensors = file.tensors(&Device::Cpu).unwrap();
        assert_eq!(tensors.len(), 2);
        assert_eq!(tensors[1].dims(), &[1, 2]);
    }

    #[test]
    fn test_read_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("emb.json");
        std::fs::write(&path, r#"{"experts": [[[0.5, 0.5]], [[1.0, 0.0]]]}"#).unwrap();
        let file = EmbeddingsFile::read(&path).unwrap();
        assert_eq!(file.experts.len(), 2);
    }
}
