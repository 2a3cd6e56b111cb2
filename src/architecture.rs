use std::fmt;
use std::str::FromStr;

use anyhow::Result;
use candle_core::{DType, Device, Tensor};
use candle_nn::{VarBuilder, VarMap};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::{debug, info, warn};

use crate::config::{ArchitectureConfig, FitConfig};
use crate::error::LivenetError;
use crate::losses::{LossKind, DEFAULT_TRIPLET_MARGIN};
use crate::metrics::{ConfusionCounts, Evaluation};
use crate::topology::{
    Convolutional, Depth, Flat, ForwardOutput, LayerSummary, SignalBatch, Topology, NUM_CLASSES,
};
use crate::training::{minibatches, EarlyStopAction, EarlyStopping, EpochLog, History, Trainer};

/// Windows per forward pass in `evaluate` / `predict`.
pub const EVAL_BATCH_SIZE: usize = 32;

// ---------------------------------------------------------------------------
// Architecture catalogue
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ArchitectureKind {
    FlatRgb,
    SimpleConvolutionalRgb,
    DeepConvolutionalRgb,
    FlatRppg,
    SimpleConvolutionalRppg,
    DeepConvolutionalRppg,
    TripletRgb,
    TripletRppg,
}

impl ArchitectureKind {
    pub const ALL: [ArchitectureKind; 8] = [
        ArchitectureKind::FlatRgb,
        ArchitectureKind::SimpleConvolutionalRgb,
        ArchitectureKind::DeepConvolutionalRgb,
        ArchitectureKind::FlatRppg,
        ArchitectureKind::SimpleConvolutionalRppg,
        ArchitectureKind::DeepConvolutionalRppg,
        ArchitectureKind::TripletRgb,
        ArchitectureKind::TripletRppg,
    ];

    pub fn name(self) -> &'static str {
        match self {
            ArchitectureKind::FlatRgb => "FlatRGB",
            ArchitectureKind::SimpleConvolutionalRgb => "SimpleConvolutionalRGB",
            ArchitectureKind::DeepConvolutionalRgb => "DeepConvolutionalRGB",
            ArchitectureKind::FlatRppg => "FlatRPPG",
            ArchitectureKind::SimpleConvolutionalRppg => "SimpleConvolutionalRPPG",
            ArchitectureKind::DeepConvolutionalRppg => "DeepConvolutionalRPPG",
            ArchitectureKind::TripletRgb => "TripletRGB",
            ArchitectureKind::TripletRppg => "TripletRPPG",
        }
    }

    pub fn uses_rppg(self) -> bool {
        matches!(
            self,
            ArchitectureKind::FlatRppg
                | ArchitectureKind::SimpleConvolutionalRppg
                | ArchitectureKind::DeepConvolutionalRppg
                | ArchitectureKind::TripletRppg
        )
    }

    pub fn loss(self) -> LossKind {
        match self {
            ArchitectureKind::TripletRgb | ArchitectureKind::TripletRppg => {
                LossKind::TripletClassification {
                    margin: DEFAULT_TRIPLET_MARGIN,
                }
            }
            _ => LossKind::CategoricalCrossEntropy,
        }
    }

    /// Convolution depth, or `None` for the flat topologies.
    fn depth(self) -> Option<Depth> {
        match self {
            ArchitectureKind::FlatRgb | ArchitectureKind::FlatRppg => None,
            ArchitectureKind::SimpleConvolutionalRgb
            | ArchitectureKind::SimpleConvolutionalRppg => Some(Depth::Simple),
            ArchitectureKind::DeepConvolutionalRgb
            | ArchitectureKind::DeepConvolutionalRppg
            | ArchitectureKind::TripletRgb
            | ArchitectureKind::TripletRppg => Some(Depth::Deep),
        }
    }

    fn embeds(self) -> bool {
        matches!(self, ArchitectureKind::TripletRgb | ArchitectureKind::TripletRppg)
    }

    pub fn min_dimension(self) -> usize {
        self.depth().map(Depth::min_dimension).unwrap_or(1)
    }

    fn build(self, dimension: usize, vb: VarBuilder) -> Result<Box<dyn Topology>> {
        Ok(match self.depth() {
            None => Box::new(Flat::new(dimension, self.uses_rppg(), vb)?),
            Some(depth) => Box::new(Convolutional::new(
                dimension,
                depth,
                self.uses_rppg(),
                self.embeds(),
                vb,
            )?),
        })
    }

    /// Kebab-case identifier used on the command line.
    pub fn slug(self) -> &'static str {
        match self {
            ArchitectureKind::FlatRgb => "flat-rgb",
            ArchitectureKind::SimpleConvolutionalRgb => "simple-conv-rgb",
            ArchitectureKind::DeepConvolutionalRgb => "deep-conv-rgb",
            ArchitectureKind::FlatRppg => "flat-rppg",
            ArchitectureKind::SimpleConvolutionalRppg => "simple-conv-rppg",
            ArchitectureKind::DeepConvolutionalRppg => "deep-conv-rppg",
            ArchitectureKind::TripletRgb => "triplet-rgb",
            ArchitectureKind::TripletRppg => "triplet-rppg",
        }
    }
}

impl fmt::Display for ArchitectureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for ArchitectureKind {
    type Err = LivenetError;

    /// Accepts the class-style name (`DeepConvolutionalRGB`) or the slug
    /// (`deep-conv-rgb`), case-insensitively.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|k| k.name().eq_ignore_ascii_case(s) || k.slug().eq_ignore_ascii_case(s))
            .ok_or_else(|| LivenetError::UnknownArchitecture(s.to_string()))
    }
}

// ---------------------------------------------------------------------------
// Architecture: built graph + optimizer
// ---------------------------------------------------------------------------

pub struct Architecture {
    kind: ArchitectureKind,
    config: ArchitectureConfig,
    varmap: VarMap,
    topology: Box<dyn Topology>,
    trainer: Trainer,
    device: Device,
}

impl Architecture {
    /// Builds the graph for windows of `config.dimension` samples and attaches
    /// an Adam optimizer. Logs the layer summary when `config.verbose`.
    pub fn new(kind: ArchitectureKind, config: &ArchitectureConfig, device: &Device) -> Result<Self> {
        config.validate()?;
        let minimum = kind.min_dimension();
        if config.dimension < minimum {
            return Err(LivenetError::DimensionTooSmall {
                arch: kind.name(),
                dimension: config.dimension,
                minimum,
            }
            .into());
        }

        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, device);
        let topology = kind.build(config.dimension, vb)?;
        let trainer = Trainer::new(varmap.clone(), config.learning_rate)?;

        let arch = Self {
            kind,
            config: config.clone(),
            varmap,
            topology,
            trainer,
            device: device.clone(),
        };

        if config.verbose {
            info!("\n{}", arch.summary());
        } else {
            debug!(
                arch = kind.name(),
                dimension = config.dimension,
                params = arch.trainable_params(),
                "built architecture"
            );
        }
        Ok(arch)
    }

    pub fn kind(&self) -> ArchitectureKind {
        self.kind
    }

    pub fn name(&self) -> &'static str {
        self.kind.name()
    }

    pub fn uses_rppg(&self) -> bool {
        self.kind.uses_rppg()
    }

    pub fn config(&self) -> &ArchitectureConfig {
        &self.config
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    /// The trainable parameters of the built graph.
    pub fn varmap(&self) -> &VarMap {
        &self.varmap
    }

    pub fn trainable_params(&self) -> usize {
        self.varmap
            .all_vars()
            .iter()
            .map(|v| v.as_tensor().elem_count())
            .sum()
    }

    pub fn layers(&self) -> Vec<LayerSummary> {
        self.topology.layers()
    }

    pub fn optimizer_steps(&self) -> usize {
        self.trainer.step_count()
    }

    /// Keras-style layer table.
    pub fn summary(&self) -> String {
        let layers = self.layers();
        let rule = "_".repeat(72);
        let mut out = format!("Model: \"{}\"\n{rule}\n", self.name());
        out.push_str(&format!(
            "{:<40}{:<22}{:>10}\n",
            "Layer (type)", "Output Shape", "Param #"
        ));
        out.push_str(&"=".repeat(72));
        out.push('\n');
        for layer in &layers {
            out.push_str(&format!(
                "{:<40}{:<22}{:>10}\n",
                format!("{} ({})", layer.name, layer.kind),
                layer.shape_display(),
                layer.params
            ));
        }
        let total: usize = layers.iter().map(|l| l.params).sum();
        let non_trainable: usize = layers.iter().map(|l| l.non_trainable).sum();
        out.push_str(&"=".repeat(72));
        out.push('\n');
        out.push_str(&format!("Total params: {total}\n"));
        out.push_str(&format!("Trainable params: {}\n", total - non_trainable));
        out.push_str(&format!("Non-trainable params: {non_trainable}\n"));
        out.push_str(&rule);
        out
    }

    /// Validates windows and labels; returns the batch size.
    fn check_inputs(&self, x: &SignalBatch, y: &Tensor) -> Result<usize> {
        let batch = x.validate(self.name(), self.config.dimension, self.uses_rppg())?;
        if y.dims() != [batch, NUM_CLASSES] {
            return Err(LivenetError::LabelShape {
                batch,
                got: y.dims().to_vec(),
            }
            .into());
        }
        let sums = y.sum(1)?.to_vec1::<f32>()?;
        if let Some((index, &sum)) = sums
            .iter()
            .enumerate()
            .find(|(_, s)| !s.is_finite() || (*s - 1.0).abs() > 1e-3)
        {
            return Err(LivenetError::LabelRow { index, sum }.into());
        }
        Ok(batch)
    }

    pub fn forward_t(&self, x: &SignalBatch, train: bool) -> Result<ForwardOutput> {
        self.topology.forward_t(x, train)
    }

    /// Loss of the compiled objective on one batch.
    pub fn loss(&self, x: &SignalBatch, y: &Tensor, train: bool) -> Result<Tensor> {
        let output = self.forward_t(x, train)?;
        self.kind.loss().compute(y, &output)
    }

    // -----------------------------------------------------------------------
    // fit
    // -----------------------------------------------------------------------

    /// Minibatch training with Adam. Batch-norm layers run in training mode.
    /// `validation` is evaluated after every epoch; early stopping monitors
    /// validation loss when present, training loss otherwise.
    pub fn fit(
        &mut self,
        x: &SignalBatch,
        y: &Tensor,
        options: &FitConfig,
        validation: Option<(&SignalBatch, &Tensor)>,
    ) -> Result<History> {
        options.validate()?;
        let n = self.check_inputs(x, y)?;
        if let Some((vx, vy)) = validation {
            self.check_inputs(vx, vy)?;
        }

        let mut rng = StdRng::seed_from_u64(options.seed);
        let mut early_stop = EarlyStopping::new(options.early_stopping_patience);
        let mut history = History::default();
        let loss_kind = self.kind.loss();

        for epoch in 0..options.epochs {
            let mut loss_sum = 0.0f64;
            let mut counts = ConfusionCounts::default();

            for batch in minibatches(n, options.batch_size, options.shuffle, &mut rng) {
                let len = batch.len();
                let idx = Tensor::from_vec(batch, len, &self.device)?;
                let bx = x.select(&idx)?;
                let by = y.index_select(&idx, 0)?;

                let output = self.topology.forward_t(&bx, true)?;
                let loss = loss_kind.compute(&by, &output)?;
                let loss_val = loss.to_scalar::<f32>()?;
                if !loss_val.is_finite() {
                    warn!(arch = self.name(), epoch, "non-finite training loss");
                }
                self.trainer.backward_step(&loss)?;

                loss_sum += loss_val as f64 * len as f64;
                counts.merge(&ConfusionCounts::from_predictions(&by, &output.probabilities)?);
            }

            let mut log = EpochLog {
                epoch,
                loss: (loss_sum / n as f64) as f32,
                accuracy: counts.accuracy(),
                val_loss: None,
                val_accuracy: None,
            };
            if let Some((vx, vy)) = validation {
                let eval = self.evaluate(vx, vy)?;
                log.val_loss = Some(eval.loss);
                log.val_accuracy = Some(eval.accuracy);
            }

            if self.config.verbose {
                info!(
                    arch = self.name(),
                    epoch = epoch + 1,
                    epochs = options.epochs,
                    loss = log.loss,
                    accuracy = log.accuracy,
                    val_loss = ?log.val_loss,
                    val_accuracy = ?log.val_accuracy,
                    "epoch"
                );
            } else {
                debug!(arch = self.name(), epoch = epoch + 1, loss = log.loss, "epoch");
            }

            let monitored = log.val_loss.unwrap_or(log.loss);
            history.epochs.push(log);
            if early_stop.check(monitored, epoch) == EarlyStopAction::Stop {
                history.stopped_early = true;
                break;
            }
        }

        Ok(history)
    }

    // -----------------------------------------------------------------------
    // evaluate / predict
    // -----------------------------------------------------------------------

    /// Loss (weighted by batch size) and PAD metrics over the whole set, with
    /// batch-norm layers in inference mode.
    pub fn evaluate(&self, x: &SignalBatch, y: &Tensor) -> Result<Evaluation> {
        let n = self.check_inputs(x, y)?;
        let loss_kind = self.kind.loss();
        let mut loss_sum = 0.0f64;
        let mut counts = ConfusionCounts::default();

        let mut start = 0;
        while start < n {
            let len = EVAL_BATCH_SIZE.min(n - start);
            let bx = x.narrow(start, len)?;
            let by = y.narrow(0, start, len)?;

            let output = self.topology.forward_t(&bx, false)?;
            let loss = loss_kind.compute(&by, &output)?;
            loss_sum += loss.to_scalar::<f32>()? as f64 * len as f64;
            counts.merge(&ConfusionCounts::from_predictions(&by, &output.probabilities)?);

            start += len;
        }

        if counts.attacks() == 0 || counts.genuine() == 0 {
            warn!(
                arch = self.name(),
                genuine = counts.genuine(),
                attacks = counts.attacks(),
                "evaluation set lacks one class; its error rate is reported as 0"
            );
        }

        let evaluation = Evaluation::new(self.name(), (loss_sum / n as f64) as f32, &counts);
        if self.config.verbose {
            info!("{evaluation}");
        }
        Ok(evaluation)
    }

    /// Class probabilities (batch, 2) in inference mode.
    pub fn predict(&self, x: &SignalBatch) -> Result<Tensor> {
        let n = x.validate(self.name(), self.config.dimension, self.uses_rppg())?;
        let mut chunks = Vec::with_capacity(n.div_ceil(EVAL_BATCH_SIZE));
        let mut start = 0;
        while start < n {
            let len = EVAL_BATCH_SIZE.min(n - start);
            let output = self.topology.forward_t(&x.narrow(start, len)?, false)?;
            chunks.push(output.probabilities);
            start += len;
        }
        Tensor::cat(&chunks, 0).map_err(Into::into)
    }
}

// ---------------------------------------------------------------------------
// Gradient Check
// ---------------------------------------------------------------------------

/// Compares autograd against central finite differences on up to `n_params`
/// randomly chosen weights (two per variable). Returns the max relative error,
/// with relative errors taken against max(|numerical|, |autograd|, 1e-3).
/// Batch norm runs in training mode so its batch statistics are differentiated;
/// running statistics are restored afterwards, leaving inference unchanged.
pub fn gradient_check(
    arch: &Architecture,
    x: &SignalBatch,
    y: &Tensor,
    n_params: usize,
    eps: f64,
) -> Result<f64> {
    arch.check_inputs(x, y)?;
    let batch_norms = arch.topology.batch_norms();
    let saved = batch_norms
        .iter()
        .map(|bn| bn.running_stats())
        .collect::<Result<Vec<_>>>()?;

    let result = finite_difference_check(arch, x, y, n_params, eps);

    for (bn, stats) in batch_norms.iter().zip(&saved) {
        bn.restore_running_stats(stats)?;
    }
    result
}

fn finite_difference_check(
    arch: &Architecture,
    x: &SignalBatch,
    y: &Tensor,
    n_params: usize,
    eps: f64,
) -> Result<f64> {
    let device = arch.device();
    let loss = arch.loss(x, y, true)?;
    let grads = loss.backward()?;

    let mut rng = StdRng::seed_from_u64(0x6EAD);
    let mut max_rel_err = 0.0f64;
    let mut checked = 0usize;

    for var in arch.varmap().all_vars() {
        if checked >= n_params {
            break;
        }
        let auto_grad = match grads.get(var.as_tensor()) {
            Some(g) => g.flatten_all()?.to_vec1::<f32>()?,
            None => continue,
        };

        let data = var.as_tensor().flatten_all()?.to_vec1::<f32>()?;
        let shape = var.as_tensor().shape().clone();
        let n_elements = data.len();
        let indices: Vec<usize> = if n_elements <= 2 {
            (0..n_elements).collect()
        } else {
            (0..2).map(|_| rng.gen_range(0..n_elements)).collect()
        };

        for idx in indices {
            if checked >= n_params {
                break;
            }

            let mut plus = data.clone();
            plus[idx] += eps as f32;
            var.set(&Tensor::from_vec(plus, shape.clone(), device)?)?;
            let lp = arch.loss(x, y, true)?.to_scalar::<f32>()? as f64;

            let mut minus = data.clone();
            minus[idx] -= eps as f32;
            var.set(&Tensor::from_vec(minus, shape.clone(), device)?)?;
            let lm = arch.loss(x, y, true)?.to_scalar::<f32>()? as f64;

            var.set(&Tensor::from_vec(data.clone(), shape.clone(), device)?)?;

            let numerical = (lp - lm) / (2.0 * eps);
            let autograd = auto_grad[idx] as f64;
            let denom = numerical.abs().max(autograd.abs()).max(1e-3);
            let rel_err = (numerical - autograd).abs() / denom;
            if rel_err > max_rel_err {
                max_rel_err = rel_err;
            }
            checked += 1;
        }
    }

    Ok(max_rel_err)
}
