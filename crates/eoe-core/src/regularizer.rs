//! Label-description contrastive regularizer.
//!
//! Pulls an example's embedding towards the descriptions of its own label and
//! away from descriptions of previously seen labels:
//!
//! ```text
//! a      = normalize(h)
//! den_p  = Σ_k exp(a·n_k / τ) + exp(a·p / τ)
//! term   = 1/|P| Σ_p [ mean_batch( Σ_k log(exp(a·n_k / τ) / den_p) ) / |N| ]
//! loss   = cross_entropy + weight · term
//! ```
//!
//! Description embeddings are used as produced by the extractor; only the
//! anchor is normalised. Slots an example lacks are masked out, and an
//! example without any positive or any negative adds zero to the batch mean.

use candle_core::{DType, Tensor};

use crate::config::RegularizerConfig;
use crate::error::{EoeError, EoeResult};

/// Description embeddings of one slot across a batch.
#[derive(Debug, Clone)]
pub struct MaskedSlot {
    /// `[B, D]` embeddings; rows of absent examples are ignored.
    pub embeddings: Tensor,
    /// `[B, 1]`, non-zero where the example has this slot.
    pub present: Tensor,
}

impl MaskedSlot {
    /// Slot present for every example.
    pub fn full(embeddings: Tensor, batch: usize) -> EoeResult<Self> {
        let present = Tensor::ones((batch, 1), DType::U8, embeddings.device()).map_err(map_candle)?;
        Ok(Self { embeddings, present })
    }

    fn mask(&self) -> EoeResult<Tensor> {
        self.present.to_dtype(DType::U8).map_err(map_candle)
    }
}

/// Contrastive term over positive and negative description slots.
#[derive(Debug, Clone)]
pub struct DescriptionContrastiveLoss {
    temperature: f32,
    weight: f32,
}

impl DescriptionContrastiveLoss {
    /// Create a regularizer with the given temperature and weight.
    pub fn new(temperature: f32, weight: f32) -> Self {
        Self { temperature, weight }
    }

    /// Create from configuration.
    pub fn from_config(config: &RegularizerConfig) -> Self {
        Self::new(config.temperature, config.weight)
    }

    /// Weight applied when combining with cross-entropy.
    pub fn weight(&self) -> f32 {
        self.weight
    }

    /// Compute the unweighted contrastive term with every slot present.
    ///
    /// # Arguments
    /// * `hidden` - Example embeddings `[B, D]` (normalised here)
    /// * `positives` - One `[B, D]` description embedding per positive slot
    /// * `negatives` - One `[B, D]` description embedding per negative slot
    ///
    /// Returns a scalar tensor. Without negatives the term is zero.
    ///
    /// # Errors
    /// - `EoeError::ConfigError` if `positives` is empty
    /// - `EoeError::DimensionMismatch` if a slot's shape differs from `hidden`
    pub fn compute(&self, hidden: &Tensor, positives: &[Tensor], negatives: &[Tensor]) -> EoeResult<Tensor> {
        let batch = hidden.dim(0).map_err(map_candle)?;
        let wrap = |slots: &[Tensor]| -> EoeResult<Vec<MaskedSlot>> {
            slots
                .iter()
                .map(|t| MaskedSlot::full(t.clone(), batch))
                .collect()
        };
        self.compute_masked(hidden, &wrap(positives)?, &wrap(negatives)?)
    }

    /// Compute the unweighted contrastive term over slots that may be absent
    /// for some examples.
    ///
    /// Example `i` uses only the slots whose `present[i]` is set:
    /// `term_i = 1/(|P_i|·|N_i|) Σ_{p∈P_i} Σ_{k∈N_i} log(num_k / den_p)` with
    /// `den_p` summing the present negatives. An example with no present
    /// positive or no present negative contributes zero. The result is the
    /// mean of `term_i` over the batch.
    ///
    /// # Errors
    /// - `EoeError::ConfigError` if `positives` is empty
    /// - `EoeError::DimensionMismatch` if a slot's shape differs from `hidden`
    ///   or its mask is not `[B, 1]`
    pub fn compute_masked(
        &self,
        hidden: &Tensor,
        positives: &[MaskedSlot],
        negatives: &[MaskedSlot],
    ) -> EoeResult<Tensor> {
        if positives.is_empty() {
            return Err(EoeError::ConfigError {
                message: "contrastive regularizer needs at least one positive description slot".to_string(),
            });
        }
        let batch = hidden.dim(0).map_err(map_candle)?;
        for slot in positives.iter().chain(negatives) {
            if slot.embeddings.dims() != hidden.dims() {
                return Err(EoeError::dims("description embedding", hidden.dims(), slot.embeddings.dims()));
            }
            if slot.present.dims() != [batch, 1] {
                return Err(EoeError::dims("description slot mask", &[batch, 1], slot.present.dims()));
            }
        }
        if negatives.is_empty() {
            return Tensor::zeros((), DType::F32, hidden.device()).map_err(map_candle);
        }

        let tau = self.temperature as f64;
        let anchor = l2_normalize(hidden)?;
        let zeros = Tensor::zeros((batch, 1), DType::F32, hidden.device()).map_err(map_candle)?;
        let ones = Tensor::ones((batch, 1), DType::F32, hidden.device()).map_err(map_candle)?;

        // Absent numerators are replaced by one so the log below stays finite.
        let mut numerators = Vec::with_capacity(negatives.len());
        let mut negative_sum = zeros.clone();
        let mut negative_count = zeros.clone();
        for n in negatives {
            let present = n.mask()?;
            let num = scaled_exp_similarity(&anchor, &n.embeddings, tau)?;
            negative_sum = present
                .where_cond(&num, &zeros)
                .and_then(|t| negative_sum.add(&t))
                .map_err(map_candle)?;
            negative_count = present
                .where_cond(&ones, &zeros)
                .and_then(|t| negative_count.add(&t))
                .map_err(map_candle)?;
            numerators.push((present.where_cond(&num, &ones).map_err(map_candle)?, present));
        }

        let mut total = zeros.clone();
        let mut positive_count = zeros.clone();
        for p in positives {
            let present = p.mask()?;
            let positive = scaled_exp_similarity(&anchor, &p.embeddings, tau)
                .and_then(|t| present.where_cond(&t, &ones).map_err(map_candle))?;
            let denominator = negative_sum.add(&positive).map_err(map_candle)?;

            let mut log_term = zeros.clone();
            for (numerator, negative_present) in &numerators {
                let ratio = numerator
                    .div(&denominator)
                    .and_then(|t| t.log())
                    .and_then(|t| negative_present.where_cond(&t, &zeros))
                    .map_err(map_candle)?;
                log_term = log_term.add(&ratio).map_err(map_candle)?;
            }

            total = present
                .where_cond(&log_term, &zeros)
                .and_then(|t| total.add(&t))
                .map_err(map_candle)?;
            positive_count = present
                .where_cond(&ones, &zeros)
                .and_then(|t| positive_count.add(&t))
                .map_err(map_candle)?;
        }

        // total_i is zero whenever either count is zero, so flooring at one is enough.
        let pairs = positive_count
            .mul(&negative_count)
            .and_then(|t| t.maximum(&ones))
            .map_err(map_candle)?;
        total.div(&pairs).and_then(|t| t.mean_all()).map_err(map_candle)
    }

    /// `cross_entropy + weight · term`.
    pub fn combine(&self, cross_entropy: &Tensor, term: &Tensor) -> EoeResult<Tensor> {
        let weighted = term.affine(self.weight as f64, 0.0).map_err(map_candle)?;
        cross_entropy.add(&weighted).map_err(map_candle)
    }
}

impl Default for DescriptionContrastiveLoss {
    fn default() -> Self {
        Self::from_config(&RegularizerConfig::default())
    }
}

/// `exp(a·b / τ)` per row, `[B, 1]`.
fn scaled_exp_similarity(anchor: &Tensor, other: &Tensor, tau: f64) -> EoeResult<Tensor> {
    anchor
        .mul(other)
        .and_then(|t| t.sum_keepdim(1))
        .and_then(|t| t.affine(1.0 / tau, 0.0))
        .and_then(|t| t.exp())
        .map_err(map_candle)
}

/// Row-wise L2 normalisation with a `1e-12` floor on the norm.
pub(crate) fn l2_normalize(x: &Tensor) -> EoeResult<Tensor> {
    let norm = x
        .sqr()
        .and_then(|t| t.sum_keepdim(1))
        .and_then(|t| t.sqrt())
        .map_err(map_candle)?;
    let floor = Tensor::ones_like(&norm)
        .and_then(|t| t.affine(1e-12, 0.0))
        .map_err(map_candle)?;
    let safe = norm.maximum(&floor).map_err(map_candle)?;
    x.broadcast_div(&safe).map_err(map_candle)
}

fn map_candle(e: candle_core::Error) -> EoeError {
    EoeError::TensorError {
        message: format!("Regularizer error: {}", e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    fn make_test_vecs(n: usize, d: usize, seed: f32) -> Tensor {
        let data: Vec<f32> = (0..n * d).map(|i| (i as f32 * 0.37 + seed).sin()).collect();
        Tensor::from_slice(&data, (n, d), &Device::Cpu).unwrap()
    }

    fn scalar(t: &Tensor) -> f32 {
        t.to_scalar::<f32>().unwrap()
    }

    #[test]
    fn test_single_pair_value() {
        let device = Device::Cpu;
        let loss = DescriptionContrastiveLoss::new(1.0, 0.5);
        let h = Tensor::from_slice(&[2.0f32, 0.0], (1, 2), &device).unwrap();
        let p = Tensor::from_slice(&[1.0f32, 0.0], (1, 2), &device).unwrap();
        let n = Tensor::from_slice(&[0.0f32, 1.0], (1, 2), &device).unwrap();

        // log(1 / (1 + e))
        let expected = -(1.0f32 + std::f32::consts::E).ln();
        let term = scalar(&loss.compute(&h, &[p], &[n]).unwrap());
        assert!((term - expected).abs() < 1e-5, "term = {}", term);
    }

    #[test]
    fn test_negative_permutation_invariant() {
        let loss = DescriptionContrastiveLoss::default();
        let h = make_test_vecs(4, 8, 0.0);
        let positives = vec![make_test_vecs(4, 8, 1.0), make_test_vecs(4, 8, 2.0)];
        let negs = vec![
            make_test_vecs(4, 8, 3.0),
            make_test_vecs(4, 8, 4.0),
            make_test_vecs(4, 8, 5.0),
        ];
        let reversed: Vec<Tensor> = negs.iter().rev().cloned().collect();

        let a = scalar(&loss.compute(&h, &positives, &negs).unwrap());
        let b = scalar(&loss.compute(&h, &positives, &reversed).unwrap());
        assert!((a - b).abs() < 1e-5);
        assert!(a.is_finite());
        assert!(a < 0.0);
    }

    #[test]
    fn test_no_negatives_is_zero() {
        let loss = DescriptionContrastiveLoss::default();
        let h = make_test_vecs(3, 4, 0.0);
        let term = loss.compute(&h, &[make_test_vecs(3, 4, 1.0)], &[]).unwrap();
        assert_eq!(scalar(&term), 0.0);
    }

    #[test]
    fn test_empty_positives_is_config_error() {
        let loss = DescriptionContrastiveLoss::default();
        let h = make_test_vecs(3, 4, 0.0);
        assert!(matches!(
            loss.compute(&h, &[], &[make_test_vecs(3, 4, 1.0)]),
            Err(EoeError::ConfigError { .. })
        ));
    }

    fn present(rows: &[u8]) -> Tensor {
        Tensor::from_slice(rows, (rows.len(), 1), &Device::Cpu).unwrap()
    }

    fn masked(t: Tensor, rows: &[u8]) -> MaskedSlot {
        MaskedSlot {
            embeddings: t,
            present: present(rows),
        }
    }

    #[test]
    fn test_masked_full_matches_unmasked() {
        let loss = DescriptionContrastiveLoss::default();
        let h = make_test_vecs(3, 4, 0.0);
        let p = make_test_vecs(3, 4, 1.0);
        let n = make_test_vecs(3, 4, 2.0);

        let plain = scalar(&loss.compute(&h, &[p.clone()], &[n.clone()]).unwrap());
        let all = scalar(
            &loss
                .compute_masked(&h, &[masked(p, &[1, 1, 1])], &[masked(n, &[1, 1, 1])])
                .unwrap(),
        );
        assert!((plain - all).abs() < 1e-6);
    }

    #[test]
    fn test_example_without_descriptions_adds_zero() {
        let device = Device::Cpu;
        let loss = DescriptionContrastiveLoss::new(1.0, 0.5);
        let h = Tensor::from_slice(&[2.0f32, 0.0, 0.0, 3.0, 1.0, 1.0], (3, 2), &device).unwrap();
        let p = Tensor::from_slice(&[1.0f32, 0.0, 5.0, 5.0, 0.0, 0.0], (3, 2), &device).unwrap();
        let n = Tensor::from_slice(&[0.0f32, 1.0, 7.0, 7.0, 0.0, 0.0], (3, 2), &device).unwrap();

        // example 1 lacks its positive, example 2 lacks its negative
        let term = loss
            .compute_masked(&h, &[masked(p, &[1, 0, 1])], &[masked(n, &[1, 1, 0])])
            .unwrap();

        // only example 0 contributes log(1 / (1 + e)), averaged over three rows
        let expected = -(1.0f32 + std::f32::consts::E).ln() / 3.0;
        assert!((scalar(&term) - expected).abs() < 1e-5, "term = {}", scalar(&term));
    }

    #[test]
    fn test_absent_slot_ignores_non_finite_rows() {
        let device = Device::Cpu;
        let loss = DescriptionContrastiveLoss::new(1.0, 0.5);
        let h = Tensor::from_slice(&[2.0f32, 0.0, 1.0, 0.0], (2, 2), &device).unwrap();
        let p = Tensor::from_slice(&[1.0f32, 0.0, 1.0, 0.0], (2, 2), &device).unwrap();
        let n = Tensor::from_slice(&[0.0f32, 1.0, f32::NAN, f32::NAN], (2, 2), &device).unwrap();

        let term = loss
            .compute_masked(&h, &[masked(p, &[1, 1])], &[masked(n, &[1, 0])])
            .unwrap();
        let expected = -(1.0f32 + std::f32::consts::E).ln() / 2.0;
        assert!((scalar(&term) - expected).abs() < 1e-5);
    }

    #[test]
    fn test_mask_shape_checked() {
        let loss = DescriptionContrastiveLoss::default();
        let h = make_test_vecs(3, 4, 0.0);
        assert!(matches!(
            loss.compute_masked(&h, &[masked(make_test_vecs(3, 4, 1.0), &[1, 1])], &[]),
            Err(EoeError::DimensionMismatch { .. })
        ));
    }

    #[test]
    fn test_shape_mismatch() {
        let loss = DescriptionContrastiveLoss::default();
        let h = make_test_vecs(3, 4, 0.0);
        assert!(matches!(
            loss.compute(&h, &[make_test_vecs(2, 4, 1.0)], &[]),
            Err(EoeError::DimensionMismatch { .. })
        ));
    }

    #[test]
    fn test_combine_weights_term() {
        let device = Device::Cpu;
        let loss = DescriptionContrastiveLoss::new(0.8, 0.5);
        let ce = Tensor::new(2.0f32, &device).unwrap();
        let term = Tensor::new(-1.0f32, &device).unwrap();
        assert!((scalar(&loss.combine(&ce, &term).unwrap()) - 1.5).abs() < 1e-6);
    }

    #[test]
    fn test_l2_normalize_rows() {
        let x = make_test_vecs(3, 5, 0.5);
        let rows = l2_normalize(&x).unwrap().to_vec2::<f32>().unwrap();
        for row in rows {
            let norm: f32 = row.iter().map(|v| v * v).sum::<f32>().sqrt();
            assert!((norm - 1.0).abs() < 1e-5);
        }
    }
}
