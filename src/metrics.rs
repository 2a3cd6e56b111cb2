// Presentation-attack-detection metrics (ISO/IEC 30107-3 naming).
//
//   APCER: attack presentations classified as bona fide / attack presentations
//   BPCER: bona fide presentations classified as attack / bona fide presentations
//   ACER:  (APCER + BPCER) / 2

use std::fmt;

use anyhow::{anyhow, Result};
use candle_core::{Tensor, D};
use serde::Serialize;

/// Class index of bona fide (genuine) windows.
pub const GENUINE: u32 = 0;
/// Class index of attack (spoof) windows.
pub const ATTACK: u32 = 1;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConfusionCounts {
    pub genuine_accepted: usize,
    pub genuine_rejected: usize,
    pub attack_rejected: usize,
    pub attack_accepted: usize,
}

impl ConfusionCounts {
    pub fn from_labels(truth: &[u32], predicted: &[u32]) -> Self {
        let mut counts = Self::default();
        for (&t, &p) in truth.iter().zip(predicted) {
            match (t == ATTACK, p == ATTACK) {
                (false, false) => counts.genuine_accepted += 1,
                (false, true) => counts.genuine_rejected += 1,
                (true, true) => counts.attack_rejected += 1,
                (true, false) => counts.attack_accepted += 1,
            }
        }
        counts
    }

    /// Argmax of one-hot `y_true` against argmax of predicted probabilities.
    pub fn from_predictions(y_true: &Tensor, y_pred: &Tensor) -> Result<Self> {
        if y_true.dims() != y_pred.dims() {
            return Err(anyhow!(
                "label shape {:?} does not match prediction shape {:?}",
                y_true.dims(),
                y_pred.dims()
            ));
        }
        let truth = y_true.argmax(D::Minus1)?.to_vec1::<u32>()?;
        let predicted = y_pred.argmax(D::Minus1)?.to_vec1::<u32>()?;
        Ok(Self::from_labels(&truth, &predicted))
    }

    pub fn merge(&mut self, other: &Self) {
        self.genuine_accepted += other.genuine_accepted;
        self.genuine_rejected += other.genuine_rejected;
        self.attack_rejected += other.attack_rejected;
        self.attack_accepted += other.attack_accepted;
    }

    pub fn genuine(&self) -> usize {
        self.genuine_accepted + self.genuine_rejected
    }

    pub fn attacks(&self) -> usize {
        self.attack_rejected + self.attack_accepted
    }

    pub fn total(&self) -> usize {
        self.genuine() + self.attacks()
    }

    pub fn accuracy(&self) -> f32 {
        ratio(self.genuine_accepted + self.attack_rejected, self.total())
    }

    pub fn apcer(&self) -> f32 {
        ratio(self.attack_accepted, self.attacks())
    }

    pub fn bpcer(&self) -> f32 {
        ratio(self.genuine_rejected, self.genuine())
    }

    pub fn acer(&self) -> f32 {
        (self.apcer() + self.bpcer()) / 2.0
    }
}

fn ratio(num: usize, den: usize) -> f32 {
    if den == 0 {
        0.0
    } else {
        num as f32 / den as f32
    }
}

pub fn accuracy(y_true: &Tensor, y_pred: &Tensor) -> Result<f32> {
    Ok(ConfusionCounts::from_predictions(y_true, y_pred)?.accuracy())
}

pub fn apcer(y_true: &Tensor, y_pred: &Tensor) -> Result<f32> {
    Ok(ConfusionCounts::from_predictions(y_true, y_pred)?.apcer())
}

pub fn bpcer(y_true: &Tensor, y_pred: &Tensor) -> Result<f32> {
    Ok(ConfusionCounts::from_predictions(y_true, y_pred)?.bpcer())
}

pub fn acer(y_true: &Tensor, y_pred: &Tensor) -> Result<f32> {
    Ok(ConfusionCounts::from_predictions(y_true, y_pred)?.acer())
}

// ---------------------------------------------------------------------------
// Evaluation report
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Evaluation {
    pub architecture: String,
    pub loss: f32,
    pub accuracy: f32,
    #[serde(rename = "APCER")]
    pub apcer: f32,
    #[serde(rename = "BPCER")]
    pub bpcer: f32,
    #[serde(rename = "ACER")]
    pub acer: f32,
    pub samples: usize,
}

impl Evaluation {
    pub fn new(architecture: &str, loss: f32, counts: &ConfusionCounts) -> Self {
        Self {
            architecture: architecture.to_string(),
            loss,
            accuracy: counts.accuracy(),
            apcer: counts.apcer(),
            bpcer: counts.bpcer(),
            acer: counts.acer(),
            samples: counts.total(),
        }
    }

    /// Metric names and values in report order.
    pub fn metrics(&self) -> [(&'static str, f32); 5] {
        [
            ("loss", self.loss),
            ("accuracy", self.accuracy),
            ("APCER", self.apcer),
            ("BPCER", self.bpcer),
            ("ACER", self.acer),
        ]
    }
}

impl fmt::Display for Evaluation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} : {{", self.architecture)?;
        for (i, (name, value)) in self.metrics().iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "'{name}': {value:.4}")?;
        }
        write!(f, "}}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    #[test]
    fn test_counts_from_labels() {
        //            genuine genuine genuine attack attack attack attack
        let truth = [0, 0, 0, 1, 1, 1, 1];
        let pred = [0, 0, 1, 1, 1, 0, 1];
        let c = ConfusionCounts::from_labels(&truth, &pred);
        assert_eq!(c.genuine_accepted, 2);
        assert_eq!(c.genuine_rejected, 1);
        assert_eq!(c.attack_rejected, 3);
        assert_eq!(c.attack_accepted, 1);
        assert!((c.apcer() - 0.25).abs() < 1e-6);
        assert!((c.bpcer() - 1.0 / 3.0).abs() < 1e-6);
        assert!((c.acer() - (0.25 + 1.0 / 3.0) / 2.0).abs() < 1e-6);
        assert!((c.accuracy() - 5.0 / 7.0).abs() < 1e-6);
    }

    #[test]
    fn test_empty_denominators_are_zero() {
        let only_genuine = ConfusionCounts::from_labels(&[0, 0], &[0, 1]);
        assert_eq!(only_genuine.apcer(), 0.0);
        assert!((only_genuine.bpcer() - 0.5).abs() < 1e-6);

        let empty = ConfusionCounts::default();
        assert_eq!(empty.accuracy(), 0.0);
        assert_eq!(empty.acer(), 0.0);
    }

    #[test]
    fn test_merge_accumulates() {
        let mut a = ConfusionCounts::from_labels(&[0, 1], &[0, 0]);
        let b = ConfusionCounts::from_labels(&[1, 1], &[1, 1]);
        a.merge(&b);
        assert_eq!(a.attacks(), 3);
        assert_eq!(a.attack_accepted, 1);
        assert!((a.apcer() - 1.0 / 3.0).abs() < 1e-6);
    }

    #[test]
    fn test_tensor_metrics() -> Result<()> {
        let device = Device::Cpu;
        let y_true = Tensor::new(&[[1f32, 0.0], [1.0, 0.0], [0.0, 1.0], [0.0, 1.0]], &device)?;
        let y_pred = Tensor::new(&[[0.9f32, 0.1], [0.2, 0.8], [0.3, 0.7], [0.6, 0.4]], &device)?;
        assert!((accuracy(&y_true, &y_pred)? - 0.5).abs() < 1e-6);
        assert!((apcer(&y_true, &y_pred)? - 0.5).abs() < 1e-6);
        assert!((bpcer(&y_true, &y_pred)? - 0.5).abs() < 1e-6);
        assert!((acer(&y_true, &y_pred)? - 0.5).abs() < 1e-6);
        Ok(())
    }

    #[test]
    fn test_tensor_metrics_shape_mismatch() -> Result<()> {
        let device = Device::Cpu;
        let y_true = Tensor::new(&[[1f32, 0.0]], &device)?;
        let y_pred = Tensor::new(&[[1f32, 0.0], [0.0, 1.0]], &device)?;
        assert!(accuracy(&y_true, &y_pred).is_err());
        Ok(())
    }

    #[test]
    fn test_evaluation_display() {
        let counts = ConfusionCounts::from_labels(&[0, 1], &[0, 1]);
        let eval = Evaluation::new("FlatRGB", 0.5, &counts);
        assert_eq!(
            eval.to_string(),
            "FlatRGB : {'loss': 0.5000, 'accuracy': 1.0000, 'APCER': 0.0000, 'BPCER': 0.0000, 'ACER': 0.0000}"
        );
    }

    #[test]
    fn test_evaluation_serializes_metric_names() {
        let counts = ConfusionCounts::from_labels(&[0, 1], &[1, 1]);
        let eval = Evaluation::new("TripletRPPG", 1.0, &counts);
        let json = serde_json::to_value(&eval).unwrap();
        assert_eq!(json["architecture"], "TripletRPPG");
        assert_eq!(json["BPCER"], 1.0);
        assert_eq!(json["APCER"], 0.0);
        assert_eq!(json["samples"], 2);
    }
}
