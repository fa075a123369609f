//! Training examples and batch collation.

use std::collections::HashMap;

use candle_core::{Device, Tensor};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{EoeError, EoeResult};

/// A tokenised example as produced by the data pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawExample {
    /// Token ids with entity markers inserted.
    pub input_ids: Vec<u32>,
    /// Token ids of the plain text, used by the origin expert.
    pub input_ids_without_marker: Vec<u32>,
    /// Positions of the subject and object markers in `input_ids`.
    pub marker_positions: [usize; 2],
    /// Start positions of the subject and object in `input_ids_without_marker`.
    pub entity_positions: [usize; 2],
    /// Label name.
    pub label: String,
}

/// Bidirectional label name ↔ global id map, grown task by task.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LabelIndex {
    id2label: Vec<String>,
    label2id: HashMap<String, usize>,
    label2task: HashMap<usize, usize>,
}

impl LabelIndex {
    /// Create an empty index.
    pub fn new() -> Self {
        Self::default()
    }

    /// Assign ids to the labels of a task. Known labels keep their id.
    pub fn add_labels<S: AsRef<str>>(&mut self, labels: &[S], task: usize) {
        for label in labels {
            let label = label.as_ref();
            if self.label2id.contains_key(label) {
                continue;
            }
            let id = self.id2label.len();
            self.id2label.push(label.to_string());
            self.label2id.insert(label.to_string(), id);
            self.label2task.insert(id, task);
        }
    }

    /// Global id of a label.
    pub fn id(&self, label: &str) -> Option<usize> {
        self.label2id.get(label).copied()
    }

    /// Label name of a global id.
    pub fn label(&self, id: usize) -> Option<&str> {
        self.id2label.get(id).map(String::as_str)
    }

    /// Task that introduced a global id.
    pub fn task_of(&self, id: usize) -> Option<usize> {
        self.label2task.get(&id).copied()
    }

    /// Number of known labels.
    pub fn len(&self) -> usize {
        self.id2label.len()
    }

    /// Whether no label is known.
    pub fn is_empty(&self) -> bool {
        self.id2label.is_empty()
    }
}

/// An example ready for a training or evaluation step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrainingExample {
    /// Token ids with entity markers.
    pub input_ids: Vec<u32>,
    /// Plain token ids.
    pub input_ids_without_marker: Vec<u32>,
    /// Marker positions in `input_ids`.
    pub marker_positions: [usize; 2],
    /// Entity positions in `input_ids_without_marker`.
    pub entity_positions: [usize; 2],
    /// Global label id.
    pub label: usize,
    /// Positive description slots (descriptions of `label`).
    pub descriptions: Vec<Vec<u32>>,
    /// Negative description slots (descriptions of one previously seen label).
    pub old_descriptions: Vec<Vec<u32>>,
}

impl TrainingExample {
    /// Example without description slots, for evaluation.
    pub fn from_raw(raw: &RawExample, label: usize) -> Self {
        Self {
            input_ids: raw.input_ids.clone(),
            input_ids_without_marker: raw.input_ids_without_marker.clone(),
            marker_positions: raw.marker_positions,
            entity_positions: raw.entity_positions,
            label,
            descriptions: Vec::new(),
            old_descriptions: Vec::new(),
        }
    }
}

/// Attach description slots to every example of `labels`.
///
/// Labels are processed in order. Each example receives its own label's
/// description ids as positive slots and, when `seen_labels` is non-empty,
/// the description ids of `seen_labels[i % seen_labels.len()]` as negative
/// slots, where `i` counts examples across all labels.
///
/// # Errors
/// - `EoeError::InvalidInput` if a label has no id in `index`
pub fn build_training_examples<S: AsRef<str>>(
    labels: &[S],
    train_data: &HashMap<String, Vec<RawExample>>,
    index: &LabelIndex,
    descriptions: &HashMap<String, Vec<Vec<u32>>>,
    seen_labels: &[S],
    old_descriptions: &HashMap<String, Vec<Vec<u32>>>,
) -> EoeResult<Vec<TrainingExample>> {
    let mut out = Vec::new();
    let mut counter = 0usize;

    for label in labels {
        let label = label.as_ref();
        let id = index.id(label).ok_or_else(|| EoeError::InvalidInput {
            message: format!("label '{}' has no id", label),
        })?;
        let positives = descriptions.get(label).cloned().unwrap_or_default();
        let Some(examples) = train_data.get(label) else {
            warn!(label = label, "No training data for label");
            continue;
        };

        for raw in examples {
            let mut example = TrainingExample::from_raw(raw, id);
            example.descriptions = positives.clone();
            if !seen_labels.is_empty() {
                let negative = seen_labels[counter % seen_labels.len()].as_ref();
                example.old_descriptions = old_descriptions.get(negative).cloned().unwrap_or_default();
            }
            counter += 1;
            out.push(example);
        }
    }

    debug!(
        examples = out.len(),
        labels = labels.len(),
        seen_labels = seen_labels.len(),
        "Built training examples"
    );
    Ok(out)
}

/// Zero-padded token ids with their attention mask.
#[derive(Debug, Clone)]
pub struct TokenBatch {
    /// `batch × max_len`, `u32`.
    pub ids: Tensor,
    /// `batch × max_len`, `u8`, one where `ids != 0`.
    pub mask: Tensor,
}

impl TokenBatch {
    /// Pad rows with zeros to the longest row.
    pub fn pad(rows: &[&[u32]], device: &Device) -> EoeResult<Self> {
        let width = rows.iter().map(|r| r.len()).max().unwrap_or(0).max(1);
        let mut ids = Vec::with_capacity(rows.len() * width);
        let mut mask = Vec::with_capacity(rows.len() * width);
        for row in rows {
            for i in 0..width {
                let token = row.get(i).copied().unwrap_or(0);
                ids.push(token);
                mask.push(u8::from(token != 0));
            }
        }
        Ok(Self {
            ids: Tensor::from_vec(ids, (rows.len(), width), device).map_err(map_candle)?,
            mask: Tensor::from_vec(mask, (rows.len(), width), device).map_err(map_candle)?,
        })
    }
}

/// One description slot across a batch.
#[derive(Debug, Clone)]
pub struct DescriptionSlot {
    /// Padded description tokens; rows of absent examples are all padding.
    pub tokens: TokenBatch,
    /// `batch × 1`, `u8`, one where the example has this slot.
    pub present: Tensor,
}

/// A collated batch.
#[derive(Debug, Clone)]
pub struct Batch {
    /// Marked inputs.
    pub inputs: TokenBatch,
    /// Plain inputs for the origin expert.
    pub inputs_without_marker: TokenBatch,
    /// `batch × 2` marker positions, `u32`.
    pub marker_positions: Tensor,
    /// `batch × 2` entity positions in the plain inputs, `u32`.
    pub entity_positions: Tensor,
    /// Global labels.
    pub labels: Vec<usize>,
    /// Positive description slots.
    pub descriptions: Vec<DescriptionSlot>,
    /// Negative description slots.
    pub old_descriptions: Vec<DescriptionSlot>,
}

impl Batch {
    /// Collate examples.
    ///
    /// Description slot counts are padded to the largest in the batch; an
    /// example lacking slot `k` gets an empty row and a cleared presence flag.
    ///
    /// # Errors
    /// - `EoeError::InvalidInput` if the batch is empty
    pub fn collate(examples: &[TrainingExample], device: &Device) -> EoeResult<Self> {
        if examples.is_empty() {
            return Err(EoeError::InvalidInput {
                message: "cannot collate an empty batch".to_string(),
            });
        }
        let positive_slots = examples.iter().map(|e| e.descriptions.len()).max().unwrap_or(0);
        let negative_slots = examples.iter().map(|e| e.old_descriptions.len()).max().unwrap_or(0);
        let short = examples
            .iter()
            .filter(|e| e.descriptions.len() < positive_slots || e.old_descriptions.len() < negative_slots)
            .count();
        if short > 0 {
            debug!(
                examples = short,
                positive_slots = positive_slots,
                negative_slots = negative_slots,
                "Masking missing description slots"
            );
        }

        let marked: Vec<&[u32]> = examples.iter().map(|e| e.input_ids.as_slice()).collect();
        let plain: Vec<&[u32]> = examples
            .iter()
            .map(|e| e.input_ids_without_marker.as_slice())
            .collect();

        Ok(Self {
            inputs: TokenBatch::pad(&marked, device)?,
            inputs_without_marker: TokenBatch::pad(&plain, device)?,
            marker_positions: position_tensor(examples.iter().map(|e| e.marker_positions), examples.len(), device)?,
            entity_positions: position_tensor(examples.iter().map(|e| e.entity_positions), examples.len(), device)?,
            labels: examples.iter().map(|e| e.label).collect(),
            descriptions: slot_batches(examples.iter().map(|e| e.descriptions.as_slice()), positive_slots, device)?,
            old_descriptions: slot_batches(
                examples.iter().map(|e| e.old_descriptions.as_slice()),
                negative_slots,
                device,
            )?,
        })
    }

    /// Number of examples.
    pub fn len(&self) -> usize {
        self.labels.len()
    }

    /// Whether the batch holds no examples.
    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }
}

fn position_tensor<I>(positions: I, len: usize, device: &Device) -> EoeResult<Tensor>
where
    I: Iterator<Item = [usize; 2]>,
{
    let flat: Vec<u32> = positions.flatten().map(|p| p as u32).collect();
    Tensor::from_vec(flat, (len, 2), device).map_err(map_candle)
}

/// One padded batch per description slot, slot-major.
fn slot_batches<'a, I>(per_example: I, count: usize, device: &Device) -> EoeResult<Vec<DescriptionSlot>>
where
    I: Iterator<Item = &'a [Vec<u32>]>,
{
    let per_example: Vec<&[Vec<u32>]> = per_example.collect();
    (0..count)
        .map(|k| {
            let rows: Vec<&[u32]> = per_example
                .iter()
                .map(|slots| slots.get(k).map_or(&[][..], Vec::as_slice))
                .collect();
            let present: Vec<u8> = per_example.iter().map(|slots| u8::from(k < slots.len())).collect();
            Ok(DescriptionSlot {
                tokens: TokenBatch::pad(&rows, device)?,
                present: Tensor::from_vec(present, (per_example.len(), 1), device).map_err(map_candle)?,
            })
        })
        .collect()
}

fn map_candle(e: candle_core::Error) -> EoeError {
    EoeError::TensorError {
        message: format!("Batch collation error: {}", e),
    }
}
