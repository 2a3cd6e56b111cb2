use anyhow::Result;
use candle_core::{Device, Tensor};
use candle_nn::{AdamW, Optimizer, ParamsAdamW, VarMap};
use rand::seq::SliceRandom;
use rand::Rng;
use serde::Serialize;
use tracing::info;

use crate::error::LivenetError;
use crate::topology::NUM_CLASSES;

// ---------------------------------------------------------------------------
// Trainer (Adam)
// ---------------------------------------------------------------------------

pub const ADAM_BETA1: f64 = 0.9;
pub const ADAM_BETA2: f64 = 0.999;
pub const ADAM_EPS: f64 = 1e-7;

pub struct Trainer {
    optimizer: AdamW,
    varmap: VarMap,
    learning_rate: f64,
    step_count: usize,
}

impl Trainer {
    /// Plain Adam: AdamW with weight decay switched off.
    pub fn new(varmap: VarMap, learning_rate: f64) -> Result<Self> {
        let params = ParamsAdamW {
            lr: learning_rate,
            beta1: ADAM_BETA1,
            beta2: ADAM_BETA2,
            eps: ADAM_EPS,
            weight_decay: 0.0,
        };
        let optimizer = AdamW::new(varmap.all_vars(), params)?;
        Ok(Self {
            optimizer,
            varmap,
            learning_rate,
            step_count: 0,
        })
    }

    pub fn backward_step(&mut self, loss: &Tensor) -> Result<usize> {
        self.optimizer.backward_step(loss)?;
        self.step_count += 1;
        Ok(self.step_count)
    }

    pub fn step_count(&self) -> usize {
        self.step_count
    }

    pub fn learning_rate(&self) -> f64 {
        self.learning_rate
    }

    pub fn varmap(&self) -> &VarMap {
        &self.varmap
    }
}

// ---------------------------------------------------------------------------
// Early Stopping
// ---------------------------------------------------------------------------

/// Patience-based stopping on a monitored loss, checked once per epoch.
pub struct EarlyStopping {
    patience: usize,
    stale_count: usize,
    best_loss: f32,
    best_epoch: usize,
    enabled: bool,
}

#[derive(Debug, PartialEq)]
pub enum EarlyStopAction {
    Continue,
    NewBest,
    Stop,
}

impl EarlyStopping {
    /// Stop once the loss has not improved for `patience` consecutive checks.
    pub fn new(patience: usize) -> Self {
        Self {
            patience,
            stale_count: 0,
            best_loss: f32::MAX,
            best_epoch: 0,
            enabled: patience > 0,
        }
    }

    /// Tracks the best loss but never stops.
    pub fn disabled() -> Self {
        Self::new(0)
    }

    pub fn check(&mut self, loss: f32, epoch: usize) -> EarlyStopAction {
        if loss < self.best_loss {
            self.best_loss = loss;
            self.best_epoch = epoch;
            self.stale_count = 0;
            return EarlyStopAction::NewBest;
        }

        if self.enabled {
            self.stale_count += 1;
            if self.stale_count >= self.patience {
                info!(
                    patience = self.patience,
                    epoch,
                    best_loss = self.best_loss,
                    best_epoch = self.best_epoch,
                    "early stopping: no improvement"
                );
                return EarlyStopAction::Stop;
            }
        }
        EarlyStopAction::Continue
    }

    pub fn best_loss(&self) -> f32 {
        self.best_loss
    }

    pub fn best_epoch(&self) -> usize {
        self.best_epoch
    }
}

// ---------------------------------------------------------------------------
// Labels and batching
// ---------------------------------------------------------------------------

/// One-hot rows (n, num_classes) from class ids. Ids >= num_classes are
/// rejected with `LivenetError::InvalidLabel`.
pub fn one_hot_tensor(classes: &[u32], num_classes: usize, device: &Device) -> Result<Tensor> {
    let n = classes.len();
    let mut data = vec![0.0f32; n * num_classes];
    for (i, &class) in classes.iter().enumerate() {
        let idx = class as usize;
        if idx >= num_classes {
            return Err(LivenetError::InvalidLabel {
                index: i,
                class,
                num_classes,
            }
            .into());
        }
        data[i * num_classes + idx] = 1.0;
    }
    Tensor::from_vec(data, (n, num_classes), device).map_err(Into::into)
}

/// Genuine/attack one-hot labels.
pub fn one_hot_labels(classes: &[u32], device: &Device) -> Result<Tensor> {
    one_hot_tensor(classes, NUM_CLASSES, device)
}

/// Sample indices split into batches of `batch_size` (the last may be short),
/// in shuffled order when `shuffle` is set.
pub fn minibatches<R: Rng + ?Sized>(
    n: usize,
    batch_size: usize,
    shuffle: bool,
    rng: &mut R,
) -> Vec<Vec<u32>> {
    let mut order: Vec<u32> = (0..n as u32).collect();
    if shuffle {
        order.shuffle(rng);
    }
    order
        .chunks(batch_size.max(1))
        .map(|chunk| chunk.to_vec())
        .collect()
}

// ---------------------------------------------------------------------------
// History
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EpochLog {
    pub epoch: usize,
    pub loss: f32,
    pub accuracy: f32,
    pub val_loss: Option<f32>,
    pub val_accuracy: Option<f32>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct History {
    pub epochs: Vec<EpochLog>,
    pub stopped_early: bool,
}

impl History {
    pub fn losses(&self) -> Vec<f32> {
        self.epochs.iter().map(|e| e.loss).collect()
    }

    pub fn last(&self) -> Option<&EpochLog> {
        self.epochs.last()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::DType;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn test_trainer_creation() -> Result<()> {
        let varmap = VarMap::new();
        let _var = varmap.get(
            (4, 4),
            "test_weight",
            candle_nn::Init::Randn {
                mean: 0.0,
                stdev: 0.01,
            },
            DType::F32,
            &Device::Cpu,
        )?;
        let trainer = Trainer::new(varmap, 1e-4)?;
        assert_eq!(trainer.step_count(), 0);
        assert_eq!(trainer.learning_rate(), 1e-4);
        assert_eq!(trainer.varmap().all_vars().len(), 1);
        Ok(())
    }

    #[test]
    fn test_trainer_step_moves_weights() -> Result<()> {
        let varmap = VarMap::new();
        let w = varmap.get((2,), "w", candle_nn::Init::Const(1.0), DType::F32, &Device::Cpu)?;
        let mut trainer = Trainer::new(varmap, 1e-1)?;
        let before = w.to_vec1::<f32>()?;
        let loss = w.sqr()?.sum_all()?;
        assert_eq!(trainer.backward_step(&loss)?, 1);
        let after = w.to_vec1::<f32>()?;
        for (b, a) in before.iter().zip(after.iter()) {
            assert!(a < b, "adam step should descend: {b} -> {a}");
        }
        Ok(())
    }

    #[test]
    fn test_early_stopping_stale_stop() {
        let mut es = EarlyStopping::new(3);

        assert_eq!(es.check(1.0, 0), EarlyStopAction::NewBest);
        assert_eq!(es.check(0.9, 1), EarlyStopAction::NewBest);

        assert_eq!(es.check(1.0, 2), EarlyStopAction::Continue);
        assert_eq!(es.check(1.1, 3), EarlyStopAction::Continue);

        assert_eq!(es.check(1.2, 4), EarlyStopAction::Stop);
        assert_eq!(es.best_epoch(), 1);
        assert!((es.best_loss() - 0.9).abs() < 1e-6);
    }

    #[test]
    fn test_early_stopping_reset_on_improvement() {
        let mut es = EarlyStopping::new(2);
        es.check(1.0, 0);
        assert_eq!(es.check(1.5, 1), EarlyStopAction::Continue);
        assert_eq!(es.check(0.5, 2), EarlyStopAction::NewBest);
        assert_eq!(es.check(0.6, 3), EarlyStopAction::Continue);
        assert_eq!(es.check(0.7, 4), EarlyStopAction::Stop);
    }

    #[test]
    fn test_early_stopping_disabled() {
        let mut es = EarlyStopping::disabled();
        for i in 0..100 {
            assert_ne!(es.check(1.0 + i as f32, i), EarlyStopAction::Stop);
        }
    }

    #[test]
    fn test_one_hot_labels() -> Result<()> {
        let t = one_hot_labels(&[0, 1, 1, 0], &Device::Cpu)?;
        assert_eq!(
            t.to_vec2::<f32>()?,
            vec![
                vec![1.0, 0.0],
                vec![0.0, 1.0],
                vec![0.0, 1.0],
                vec![1.0, 0.0]
            ]
        );
        Ok(())
    }

    #[test]
    fn test_one_hot_rejects_out_of_range_class() {
        let err = one_hot_labels(&[0, 1, 1, 7], &Device::Cpu).err().unwrap();
        assert!(matches!(
            err.downcast_ref::<LivenetError>(),
            Some(LivenetError::InvalidLabel {
                index: 3,
                class: 7,
                num_classes: 2
            })
        ));

        let t = one_hot_tensor(&[2, 0], 3, &Device::Cpu).unwrap();
        assert_eq!(t.dims2().unwrap(), (2, 3));
    }

    #[test]
    fn test_minibatches_cover_all_samples() {
        let mut rng = StdRng::seed_from_u64(7);
        let batches = minibatches(10, 4, true, &mut rng);
        assert_eq!(
            batches.iter().map(|b| b.len()).collect::<Vec<_>>(),
            vec![4, 4, 2]
        );
        let mut all: Vec<u32> = batches.into_iter().flatten().collect();
        all.sort_unstable();
        assert_eq!(all, (0..10).collect::<Vec<u32>>());
    }

    #[test]
    fn test_minibatches_unshuffled_in_order() {
        let mut rng = StdRng::seed_from_u64(7);
        let batches = minibatches(5, 2, false, &mut rng);
        assert_eq!(batches, vec![vec![0, 1], vec![2, 3], vec![4]]);
    }

    #[test]
    fn test_minibatches_empty() {
        let mut rng = StdRng::seed_from_u64(7);
        assert!(minibatches(0, 8, true, &mut rng).is_empty());
    }

    #[test]
    fn test_history_losses() {
        let history = History {
            epochs: vec![
                EpochLog {
                    epoch: 0,
                    loss: 0.7,
                    accuracy: 0.5,
                    val_loss: None,
                    val_accuracy: None,
                },
                EpochLog {
                    epoch: 1,
                    loss: 0.6,
                    accuracy: 0.6,
                    val_loss: Some(0.65),
                    val_accuracy: Some(0.55),
                },
            ],
            stopped_early: false,
        };
        assert_eq!(history.losses(), vec![0.7, 0.6]);
        assert_eq!(history.last().unwrap().epoch, 1);
    }
}
