//! Per-task linear classifier heads.
//!
//! One head per task maps an embedding to that task's local class logits.
//! Appending a head freezes every earlier head: frozen heads still run forward
//! but no longer expose trainable variables.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use candle_core::{safetensors, DType, Device, Tensor, Var};
use candle_nn::{Linear, Module};
use tracing::{debug, info};

use crate::error::{EoeError, EoeResult};

/// Safetensors key of a head's weight.
pub const CLASSIFIER_WEIGHT_KEY: &str = "classifier.weight";
/// Safetensors key of a head's bias.
pub const CLASSIFIER_BIAS_KEY: &str = "classifier.bias";
/// Backbone checkpoint key of the bootstrap head weight.
pub const BACKBONE_LINEAR_WEIGHT_KEY: &str = "linear.weight";
/// Backbone checkpoint key of the bootstrap head bias.
pub const BACKBONE_LINEAR_BIAS_KEY: &str = "linear.bias";

/// A linear head: `logits = x @ W^T + b`.
#[derive(Debug)]
pub struct ClassifierHead {
    /// Weight `[num_labels, in_features]`.
    weight: Var,
    /// Bias `[num_labels]`.
    bias: Var,
    frozen: bool,
}

impl ClassifierHead {
    /// Create a head with uniform `U(-1/√in, 1/√in)` initialisation.
    pub fn new(in_features: usize, num_labels: usize, device: &Device) -> EoeResult<Self> {
        if in_features == 0 || num_labels == 0 {
            return Err(EoeError::InvalidInput {
                message: format!(
                    "classifier dimensions must be > 0 (in_features = {}, num_labels = {})",
                    in_features, num_labels
                ),
            });
        }

        let bound = 1.0 / (in_features as f32).sqrt();
        let weight = Tensor::rand(-bound, bound, (num_labels, in_features), device)
            .and_then(|t| Var::from_tensor(&t))
            .map_err(map_candle)?;
        let bias = Tensor::rand(-bound, bound, (num_labels,), device)
            .and_then(|t| Var::from_tensor(&t))
            .map_err(map_candle)?;

        Ok(Self {
            weight,
            bias,
            frozen: false,
        })
    }

    /// Create a head from explicit weight and bias tensors.
    pub fn from_tensors(weight: &Tensor, bias: &Tensor) -> EoeResult<Self> {
        let (num_labels, in_features) = weight.dims2().map_err(map_candle)?;
        if bias.dims() != [num_labels] {
            return Err(EoeError::dims("classifier bias", &[num_labels], bias.dims()));
        }
        if in_features == 0 || num_labels == 0 {
            return Err(EoeError::dims("classifier weight", &[1, 1], &[num_labels, in_features]));
        }

        let weight = weight
            .to_dtype(DType::F32)
            .and_then(|t| Var::from_tensor(&t))
            .map_err(map_candle)?;
        let bias = bias
            .to_dtype(DType::F32)
            .and_then(|t| Var::from_tensor(&t))
            .map_err(map_candle)?;

        Ok(Self {
            weight,
            bias,
            frozen: false,
        })
    }

    /// Forward pass: `[batch, in_features] → [batch, num_labels]`.
    pub fn forward(&self, x: &Tensor) -> EoeResult<Tensor> {
        let (_, width) = x.dims2().map_err(map_candle)?;
        if width != self.in_features() {
            return Err(EoeError::dims(
                "classifier input",
                &[self.in_features()],
                &[width],
            ));
        }
        let linear = Linear::new(
            self.weight.as_tensor().clone(),
            Some(self.bias.as_tensor().clone()),
        );
        linear.forward(x).map_err(map_candle)
    }

    /// Number of output classes.
    pub fn num_labels(&self) -> usize {
        self.weight.as_tensor().dims()[0]
    }

    /// Input width.
    pub fn in_features(&self) -> usize {
        self.weight.as_tensor().dims()[1]
    }

    /// Whether gradients are disabled for this head.
    pub fn is_frozen(&self) -> bool {
        self.frozen
    }

    /// Disable gradients for this head.
    pub fn freeze(&mut self) {
        self.frozen = true;
    }

    /// Trainable variables; empty once frozen.
    pub fn trainable_vars(&self) -> Vec<&Var> {
        if self.frozen {
            Vec::new()
        } else {
            vec![&self.weight, &self.bias]
        }
    }

    /// Weight tensor.
    pub fn weight(&self) -> &Tensor {
        self.weight.as_tensor()
    }

    /// Bias tensor.
    pub fn bias(&self) -> &Tensor {
        self.bias.as_tensor()
    }

    /// Overwrite parameters in place, keeping shapes.
    pub fn set_parameters(&self, weight: &Tensor, bias: &Tensor) -> EoeResult<()> {
        if weight.dims() != self.weight().dims() {
            return Err(EoeError::dims("classifier weight", self.weight().dims(), weight.dims()));
        }
        if bias.dims() != self.bias().dims() {
            return Err(EoeError::dims("classifier bias", self.bias().dims(), bias.dims()));
        }
        let weight = weight
            .to_dtype(DType::F32)
            .and_then(|t| t.to_device(self.weight().device()))
            .map_err(map_candle)?;
        let bias = bias
            .to_dtype(DType::F32)
            .and_then(|t| t.to_device(self.bias().device()))
            .map_err(map_candle)?;
        self.weight.set(&weight).map_err(map_candle)?;
        self.bias.set(&bias).map_err(map_candle)
    }
}

/// Ordered, append-only collection of heads indexed by task.
#[derive(Debug)]
pub struct ClassifierBank {
    heads: Vec<ClassifierHead>,
    in_features: usize,
    device: Device,
}

impl ClassifierBank {
    /// Create an empty bank.
    pub fn new(in_features: usize, device: &Device) -> Self {
        Self {
            heads: Vec::new(),
            in_features,
            device: device.clone(),
        }
    }

    /// Freeze every existing head and append a new trainable one.
    pub fn push(&mut self, num_labels: usize) -> EoeResult<()> {
        let head = self.new_head(num_labels)?;
        self.push_head(head);
        Ok(())
    }

    /// Allocate a head matching the bank's input width without adding it.
    pub fn new_head(&self, num_labels: usize) -> EoeResult<ClassifierHead> {
        ClassifierHead::new(self.in_features, num_labels, &self.device)
    }

    /// Freeze every existing head and append `head`.
    pub fn push_head(&mut self, head: ClassifierHead) {
        for existing in &mut self.heads {
            existing.freeze();
        }
        let num_labels = head.num_labels();
        self.heads.push(head);
        debug!(
            heads = self.heads.len(),
            num_labels = num_labels,
            "Appended classifier head"
        );
    }

    /// Number of heads.
    pub fn len(&self) -> usize {
        self.heads.len()
    }

    /// Whether no head has been added.
    pub fn is_empty(&self) -> bool {
        self.heads.is_empty()
    }

    /// Head for a task.
    pub fn get(&self, task: usize) -> EoeResult<&ClassifierHead> {
        self.heads.get(task).ok_or_else(|| EoeError::InvalidInput {
            message: format!("no classifier for task {} ({} heads)", task, self.heads.len()),
        })
    }

    /// Iterate over heads, oldest first.
    pub fn iter(&self) -> impl Iterator<Item = &ClassifierHead> {
        self.heads.iter()
    }

    /// Trainable variables of every unfrozen head.
    pub fn trainable_vars(&self) -> Vec<&Var> {
        self.heads.iter().flat_map(|h| h.trainable_vars()).collect()
    }

    /// Path of a task's classifier checkpoint inside `dir`.
    pub fn checkpoint_path(dir: &Path, task: usize) -> PathBuf {
        dir.join(format!("classifier-{}.safetensors", task))
    }

    /// Save one head to `dir/classifier-{task}.safetensors`.
    pub fn save_head(&self, task: usize, dir: &Path) -> EoeResult<PathBuf> {
        let head = self.get(task)?;
        let path = Self::checkpoint_path(dir, task);

        let mut tensors = HashMap::new();
        tensors.insert(CLASSIFIER_WEIGHT_KEY.to_string(), head.weight().clone());
        tensors.insert(CLASSIFIER_BIAS_KEY.to_string(), head.bias().clone());
        safetensors::save(&tensors, &path).map_err(|e| EoeError::CheckpointError {
            message: format!("Failed to save classifier {} to '{}': {}", task, path.display(), e),
        })?;

        debug!(task = task, path = %path.display(), "Saved classifier head");
        Ok(path)
    }

    /// Load one head from `dir/classifier-{task}.safetensors`.
    pub fn load_head(&self, task: usize, dir: &Path) -> EoeResult<()> {
        let head = self.get(task)?;
        let path = Self::checkpoint_path(dir, task);

        let tensors = safetensors::load(&path, &self.device).map_err(|e| EoeError::CheckpointError {
            message: format!("Failed to load classifier {} from '{}': {}", task, path.display(), e),
        })?;
        let weight = require(&tensors, CLASSIFIER_WEIGHT_KEY, &path)?;
        let bias = require(&tensors, CLASSIFIER_BIAS_KEY, &path)?;
        head.set_parameters(weight, bias)
    }

    /// Initialise head 0 from a backbone checkpoint's linear layer.
    ///
    /// Only the first `num_labels` rows of the checkpoint layer are used.
    pub fn bootstrap_first(&self, tensors: &HashMap<String, Tensor>) -> EoeResult<()> {
        let head = self.get(0)?;
        let num_class = head.num_labels();
        let source = Path::new("<backbone>");

        let weight = require(tensors, BACKBONE_LINEAR_WEIGHT_KEY, source)?;
        let bias = require(tensors, BACKBONE_LINEAR_BIAS_KEY, source)?;
        let available = weight.dims().first().copied().unwrap_or(0);
        if available < num_class {
            return Err(EoeError::CheckpointError {
                message: format!(
                    "backbone linear layer has {} rows, head 0 needs {}",
                    available, num_class
                ),
            });
        }

        let weight = weight.narrow(0, 0, num_class).map_err(map_candle)?;
        let bias = bias.narrow(0, 0, num_class).map_err(map_candle)?;
        head.set_parameters(&weight, &bias)?;

        info!(num_class = num_class, "Bootstrapped classifier 0 from backbone checkpoint");
        Ok(())
    }
}

fn require<'a>(tensors: &'a HashMap<String, Tensor>, key: &str, path: &Path) -> EoeResult<&'a Tensor> {
    tensors.get(key).ok_or_else(|| EoeError::CheckpointError {
        message: format!("tensor '{}' not found in '{}'", key, path.display()),
    })
}

fn map_candle(e: candle_core::Error) -> EoeError {
    EoeError::TensorError {
        message: format!("Classifier error: {}", e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_head_shape() {
        let device = Device::Cpu;
        let head = ClassifierHead::new(8, 3, &device).unwrap();
        let x = Tensor::ones((4, 8), DType::F32, &device).unwrap();
        assert_eq!(head.forward(&x).unwrap().dims(), &[4, 3]);
        assert_eq!(head.trainable_vars().len(), 2);
    }

    #[test]
    fn test_head_from_tensors_forward() {
        let device = Device::Cpu;
        let w = Tensor::from_slice(&[1.0f32, 0.0, 0.0, 1.0], (2, 2), &device).unwrap();
        let b = Tensor::from_slice(&[0.5f32, -0.5], (2,), &device).unwrap();
        let head = ClassifierHead::from_tensors(&w, &b).unwrap();

        let x = Tensor::from_slice(&[2.0f32, 3.0], (1, 2), &device).unwrap();
        let logits = head.forward(&x).unwrap().to_vec2::<f32>().unwrap();
        assert_eq!(logits, vec![vec![2.5, 2.5]]);
    }

    #[test]
    fn test_head_rejects_wrong_width() {
        let device = Device::Cpu;
        let head = ClassifierHead::new(8, 3, &device).unwrap();
        let x = Tensor::ones((4, 5), DType::F32, &device).unwrap();
        assert!(matches!(
            head.forward(&x),
            Err(EoeError::DimensionMismatch { .. })
        ));
    }

    #[test]
    fn test_push_freezes_previous() {
        let mut bank = ClassifierBank::new(4, &Device::Cpu);
        for k in 1..=4 {
            bank.push(2).unwrap();
            assert_eq!(bank.len(), k);
            let frozen: Vec<bool> = bank.iter().map(|h| h.is_frozen()).collect();
            assert!(frozen[..k - 1].iter().all(|f| *f));
            assert!(!frozen[k - 1]);
        }
        assert_eq!(bank.trainable_vars().len(), 2);
    }

    #[test]
    fn test_save_and_load_head() {
        let dir = tempfile::tempdir().unwrap();
        let device = Device::Cpu;

        let mut bank = ClassifierBank::new(4, &device);
        bank.push(3).unwrap();
        let original = bank.get(0).unwrap().weight().to_vec2::<f32>().unwrap();
        bank.save_head(0, dir.path()).unwrap();

        let mut other = ClassifierBank::new(4, &device);
        other.push(3).unwrap();
        other.load_head(0, dir.path()).unwrap();
        let loaded = other.get(0).unwrap().weight().to_vec2::<f32>().unwrap();
        assert_eq!(original, loaded);
    }

    #[test]
    fn test_load_missing_head_file() {
        let dir = tempfile::tempdir().unwrap();
        let mut bank = ClassifierBank::new(4, &Device::Cpu);
        bank.push(3).unwrap();
        assert!(matches!(
            bank.load_head(0, dir.path()),
            Err(EoeError::CheckpointError { .. })
        ));
    }

    #[test]
    fn test_bootstrap_first_slices_rows() {
        let device = Device::Cpu;
        let mut bank = ClassifierBank::new(2, &device);
        bank.push(2).unwrap();

        let weight = Tensor::from_slice(&[1.0f32, 2.0, 3.0, 4.0, 5.0, 6.0], (3, 2), &device).unwrap();
        let bias = Tensor::from_slice(&[7.0f32, 8.0, 9.0], (3,), &device).unwrap();
        let mut tensors = HashMap::new();
        tensors.insert(BACKBONE_LINEAR_WEIGHT_KEY.to_string(), weight);
        tensors.insert(BACKBONE_LINEAR_BIAS_KEY.to_string(), bias);

        bank.bootstrap_first(&tensors).unwrap();
        let head = bank.get(0).unwrap();
        assert_eq!(
            head.weight().to_vec2::<f32>().unwrap(),
            vec![vec![1.0, 2.0], vec![3.0, 4.0]]
        );
        assert_eq!(head.bias().to_vec1::<f32>().unwrap(), vec![7.0, 8.0]);
    }
}
