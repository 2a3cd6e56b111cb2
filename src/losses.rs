use anyhow::{anyhow, Result};
use candle_core::{DType, Tensor, D};

use crate::topology::ForwardOutput;

pub const DEFAULT_TRIPLET_MARGIN: f64 = 1.0;

// ---------------------------------------------------------------------------
// Categorical cross-entropy
// ---------------------------------------------------------------------------

/// Mean over the batch of -sum(y_true * log_softmax(logits)).
/// logits: (batch, classes), y_true: (batch, classes) one-hot or soft labels.
pub fn categorical_cross_entropy(logits: &Tensor, y_true: &Tensor) -> Result<Tensor> {
    let log_probs = candle_nn::ops::log_softmax(logits, D::Minus1)?;
    y_true
        .mul(&log_probs)?
        .sum(D::Minus1)?
        .neg()?
        .mean_all()
        .map_err(Into::into)
}

// ---------------------------------------------------------------------------
// Semi-hard triplet loss
// ---------------------------------------------------------------------------

/// Squared euclidean distances between rows, clamped at 0 with a zero diagonal.
pub fn pairwise_squared_distances(embeddings: &Tensor) -> Result<Tensor> {
    let (b, _) = embeddings.dims2()?;
    let sq = embeddings.sqr()?.sum_keepdim(1)?;
    let gram = embeddings.matmul(&embeddings.t()?)?;
    let dist = sq
        .broadcast_add(&sq.t()?)?
        .sub(&(gram * 2.0)?)?
        .relu()?;
    let off_diag = (Tensor::ones((b, b), DType::F32, embeddings.device())?
        - Tensor::eye(b, DType::F32, embeddings.device())?)?;
    dist.mul(&off_diag).map_err(Into::into)
}

/// Negative chosen for anchor `a` given the anchor-positive distance: the
/// closest negative strictly farther than the positive, else the farthest
/// negative, else (no negatives) the anchor itself.
fn semihard_negative(row: &[f32], labels: &[u32], a: usize, positive_dist: f32) -> usize {
    let negatives = || (0..row.len()).filter(move |&n| labels[n] != labels[a]);
    negatives()
        .filter(|&n| row[n] > positive_dist)
        .min_by(|&i, &j| row[i].total_cmp(&row[j]))
        .or_else(|| negatives().max_by(|&i, &j| row[i].total_cmp(&row[j])))
        .unwrap_or(a)
}

/// Triplet loss with online semi-hard negative mining over the batch.
/// labels: class id per row, embeddings: (batch, features).
/// Returns mean over anchor-positive pairs of relu(margin + d(a,p) - d(a,n));
/// 0 when the batch has no anchor-positive pair.
pub fn triplet_semihard_loss(labels: &[u32], embeddings: &Tensor, margin: f64) -> Result<Tensor> {
    let (b, _) = embeddings.dims2()?;
    if labels.len() != b {
        return Err(anyhow!(
            "triplet loss: {} labels for {b} embeddings",
            labels.len()
        ));
    }
    let device = embeddings.device();
    let pdist = pairwise_squared_distances(embeddings)?;
    let rows = pdist.to_vec2::<f32>()?;

    let mut positive_idx = Vec::new();
    let mut negative_idx = Vec::new();
    for a in 0..b {
        for p in 0..b {
            if a == p || labels[a] != labels[p] {
                continue;
            }
            let n = semihard_negative(&rows[a], labels, a, rows[a][p]);
            positive_idx.push((a * b + p) as u32);
            negative_idx.push((a * b + n) as u32);
        }
    }

    if positive_idx.is_empty() {
        return Tensor::zeros((), DType::F32, device).map_err(Into::into);
    }

    let num_positives = positive_idx.len();
    let flat = pdist.flatten_all()?;
    let d_pos = flat.index_select(&Tensor::new(positive_idx, device)?, 0)?;
    let d_neg = flat.index_select(&Tensor::new(negative_idx, device)?, 0)?;
    let hinge = ((d_pos - d_neg)? + margin)?.relu()?;
    (hinge.sum_all()? / num_positives as f64).map_err(Into::into)
}

/// Semi-hard triplet loss on the embeddings plus cross-entropy on the classifier.
pub fn triplet_classification_loss(
    y_true: &Tensor,
    output: &ForwardOutput,
    margin: f64,
) -> Result<Tensor> {
    let embeddings = output
        .embeddings
        .as_ref()
        .ok_or_else(|| anyhow!("triplet loss needs a topology that exposes embeddings"))?;
    let labels = y_true.argmax(D::Minus1)?.to_vec1::<u32>()?;
    let triplet = triplet_semihard_loss(&labels, embeddings, margin)?;
    let classification = categorical_cross_entropy(&output.logits, y_true)?;
    (triplet + classification).map_err(Into::into)
}

// ---------------------------------------------------------------------------
// Loss selection
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum LossKind {
    CategoricalCrossEntropy,
    TripletClassification { margin: f64 },
}

impl LossKind {
    pub fn compute(&self, y_true: &Tensor, output: &ForwardOutput) -> Result<Tensor> {
        match *self {
            LossKind::CategoricalCrossEntropy => {
                categorical_cross_entropy(&output.logits, y_true)
            }
            LossKind::TripletClassification { margin } => {
                triplet_classification_loss(y_true, output, margin)
            }
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            LossKind::CategoricalCrossEntropy => "categorical_crossentropy",
            LossKind::TripletClassification { .. } => "triplet_semihard+categorical_crossentropy",
        }
    }
}
