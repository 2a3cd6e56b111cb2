// Graph topologies for signal-window classification.
//
//   Flat:           flatten(rgb) [+ flatten(ppg)] -> Dense(2) -> softmax
//   Convolutional:  per branch ConvBlock x {1 | 2} -> global_avg_pool,
//                   concat branches [-> l2_normalize = embeddings] -> Dense(2) -> softmax

use anyhow::Result;
use candle_core::{IndexOp, Module, Tensor};
use candle_nn::{linear, Linear, VarBuilder};

use crate::error::LivenetError;
use crate::layers::{
    conv_output_len, flatten, global_avg_pool, grad_softmax, l2_normalize, ConvBlock,
    GradBatchNorm1d, KERNEL_SIZE,
};

pub const NUM_CLASSES: usize = 2;
pub const RGB_CHANNELS: usize = 3;
pub const PPG_CHANNELS: usize = 1;

// ---------------------------------------------------------------------------
// Input batch
// ---------------------------------------------------------------------------

/// A batch of signal windows, channels-last: rgb (batch, D, 3), ppg (batch, D, 1).
#[derive(Debug, Clone)]
pub struct SignalBatch {
    pub rgb: Tensor,
    pub ppg: Option<Tensor>,
}

impl SignalBatch {
    pub fn rgb_only(rgb: Tensor) -> Self {
        Self { rgb, ppg: None }
    }

    pub fn with_ppg(rgb: Tensor, ppg: Tensor) -> Self {
        Self {
            rgb,
            ppg: Some(ppg),
        }
    }

    /// Same windows with the rPPG signal dropped.
    pub fn without_ppg(&self) -> Self {
        Self::rgb_only(self.rgb.clone())
    }

    pub fn batch_size(&self) -> Result<usize> {
        Ok(self.rgb.dim(0)?)
    }

    pub fn dimension(&self) -> Result<usize> {
        Ok(self.rgb.dim(1)?)
    }

    /// Gather windows by index along the batch axis.
    pub fn select(&self, indices: &Tensor) -> Result<Self> {
        Ok(Self {
            rgb: self.rgb.index_select(indices, 0)?,
            ppg: self
                .ppg
                .as_ref()
                .map(|p| p.index_select(indices, 0))
                .transpose()?,
        })
    }

    pub fn narrow(&self, start: usize, len: usize) -> Result<Self> {
        Ok(Self {
            rgb: self.rgb.i(start..start + len)?,
            ppg: self
                .ppg
                .as_ref()
                .map(|p| p.i(start..start + len))
                .transpose()?,
        })
    }

    /// Check shapes against an architecture; returns the batch size.
    pub fn validate(&self, arch: &'static str, dimension: usize, uses_rppg: bool) -> Result<usize> {
        let rgb_dims = self.rgb.dims();
        let batch = rgb_dims.first().copied().unwrap_or(0);
        if rgb_dims.len() != 3 || rgb_dims[1] != dimension || rgb_dims[2] != RGB_CHANNELS {
            return Err(LivenetError::InputShape {
                input: "rgb",
                expected: vec![batch, dimension, RGB_CHANNELS],
                got: rgb_dims.to_vec(),
            }
            .into());
        }
        if batch == 0 {
            return Err(LivenetError::EmptyBatch.into());
        }

        match (&self.ppg, uses_rppg) {
            (None, true) => return Err(LivenetError::MissingRppg { arch }.into()),
            (Some(_), false) => return Err(LivenetError::UnexpectedRppg { arch }.into()),
            (Some(ppg), true) => {
                let ppg_dims = ppg.dims();
                if ppg_dims.len() != 3 || ppg_dims[1] != dimension || ppg_dims[2] != PPG_CHANNELS
                {
                    return Err(LivenetError::InputShape {
                        input: "ppg",
                        expected: vec![batch, dimension, PPG_CHANNELS],
                        got: ppg_dims.to_vec(),
                    }
                    .into());
                }
                if ppg_dims[0] != batch {
                    return Err(LivenetError::BatchMismatch {
                        rgb: batch,
                        ppg: ppg_dims[0],
                    }
                    .into());
                }
            }
            (None, false) => {}
        }
        Ok(batch)
    }
}

// ---------------------------------------------------------------------------
// Topology trait
// ---------------------------------------------------------------------------

pub struct ForwardOutput {
    /// (batch, 2) pre-softmax scores.
    pub logits: Tensor,
    /// (batch, 2) softmax of `logits`.
    pub probabilities: Tensor,
    /// (batch, features) unit-norm embeddings, only for metric-learning topologies.
    pub embeddings: Option<Tensor>,
}

/// One row of a model summary.
#[derive(Debug, Clone, PartialEq)]
pub struct LayerSummary {
    pub name: String,
    pub kind: &'static str,
    /// Per-sample output shape (batch axis omitted).
    pub output_shape: Vec<usize>,
    pub params: usize,
    pub non_trainable: usize,
}

impl LayerSummary {
    fn new(name: impl Into<String>, kind: &'static str, output_shape: Vec<usize>) -> Self {
        Self {
            name: name.into(),
            kind,
            output_shape,
            params: 0,
            non_trainable: 0,
        }
    }

    fn with_params(mut self, params: usize) -> Self {
        self.params = params;
        self
    }

    fn with_non_trainable(mut self, non_trainable: usize) -> Self {
        self.non_trainable = non_trainable;
        self
    }

    pub fn shape_display(&self) -> String {
        let dims: Vec<String> = self.output_shape.iter().map(|d| d.to_string()).collect();
        format!("(None, {})", dims.join(", "))
    }
}

pub trait Topology {
    fn forward_t(&self, x: &SignalBatch, train: bool) -> Result<ForwardOutput>;

    fn layers(&self) -> Vec<LayerSummary>;

    /// Batch-norm layers whose running statistics train-mode passes move.
    fn batch_norms(&self) -> Vec<&GradBatchNorm1d> {
        Vec::new()
    }
}

fn classify(dense: &Linear, features: &Tensor, embeddings: Option<Tensor>) -> Result<ForwardOutput> {
    let logits = dense.forward(features)?;
    let probabilities = grad_softmax(&logits)?;
    Ok(ForwardOutput {
        logits,
        probabilities,
        embeddings,
    })
}

fn require_ppg(x: &SignalBatch) -> Result<&Tensor> {
    x.ppg.as_ref().ok_or_else(|| {
        LivenetError::MissingRppg {
            arch: "rPPG topology",
        }
        .into()
    })
}

// ---------------------------------------------------------------------------
// Flat
// ---------------------------------------------------------------------------

pub struct Flat {
    dense: Linear,
    dimension: usize,
    rppg: bool,
}

impl Flat {
    pub fn new(dimension: usize, rppg: bool, vb: VarBuilder) -> Result<Self> {
        let features = dimension * RGB_CHANNELS + if rppg { dimension * PPG_CHANNELS } else { 0 };
        Ok(Self {
            dense: linear(features, NUM_CLASSES, vb.pp("dense"))?,
            dimension,
            rppg,
        })
    }

    fn features(&self) -> usize {
        self.dimension * RGB_CHANNELS + if self.rppg { self.dimension * PPG_CHANNELS } else { 0 }
    }
}

impl Topology for Flat {
    fn forward_t(&self, x: &SignalBatch, _train: bool) -> Result<ForwardOutput> {
        let rgb = flatten(&x.rgb)?;
        let features = if self.rppg {
            let ppg = flatten(require_ppg(x)?)?;
            Tensor::cat(&[&rgb, &ppg], 1)?
        } else {
            rgb
        };
        classify(&self.dense, &features, None)
    }

    fn layers(&self) -> Vec<LayerSummary> {
        let d = self.dimension;
        let mut layers = vec![
            LayerSummary::new("input_rgb", "InputLayer", vec![d, RGB_CHANNELS]),
            LayerSummary::new("flatten_rgb", "Flatten", vec![d * RGB_CHANNELS]),
        ];
        if self.rppg {
            layers.push(LayerSummary::new("input_ppg", "InputLayer", vec![d, PPG_CHANNELS]));
            layers.push(LayerSummary::new("flatten_ppg", "Flatten", vec![d * PPG_CHANNELS]));
            layers.push(LayerSummary::new("concatenate", "Concatenate", vec![self.features()]));
        }
        layers.push(
            LayerSummary::new("dense", "Dense", vec![NUM_CLASSES])
                .with_params(self.features() * NUM_CLASSES + NUM_CLASSES),
        );
        layers
    }
}

// ---------------------------------------------------------------------------
// Convolutional
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Depth {
    /// Conv(64, k5, s1)
    Simple,
    /// Conv(64, k5, s2) -> Conv(128, k5, s2)
    Deep,
}

impl Depth {
    /// (filters, stride) per block.
    pub fn blocks(self) -> &'static [(usize, usize)] {
        match self {
            Depth::Simple => &[(64, 1)],
            Depth::Deep => &[(64, 2), (128, 2)],
        }
    }

    /// Shortest window that still leaves one output step after every block.
    pub fn min_dimension(self) -> usize {
        self.blocks()
            .iter()
            .rev()
            .fold(1, |need, &(_, stride)| (need - 1) * stride + KERNEL_SIZE)
    }

    pub fn features(self) -> usize {
        self.blocks().last().map(|&(filters, _)| filters).unwrap_or(0)
    }
}

struct Branch {
    name: &'static str,
    in_channels: usize,
    blocks: Vec<ConvBlock>,
}

impl Branch {
    fn new(name: &'static str, in_channels: usize, depth: Depth, vb: VarBuilder) -> Result<Self> {
        let mut blocks = Vec::with_capacity(depth.blocks().len());
        let mut channels = in_channels;
        for (i, &(filters, stride)) in depth.blocks().iter().enumerate() {
            blocks.push(ConvBlock::new(
                channels,
                filters,
                KERNEL_SIZE,
                stride,
                vb.pp(format!("block_{i}")),
            )?);
            channels = filters;
        }
        Ok(Self {
            name,
            in_channels,
            blocks,
        })
    }

    /// x: (batch, D, channels) -> (batch, features)
    fn forward_t(&self, x: &Tensor, train: bool) -> Result<Tensor> {
        let mut h = x.transpose(1, 2)?.contiguous()?;
        for block in &self.blocks {
            h = block.forward_t(&h, train)?;
        }
        global_avg_pool(&h)
    }

    fn layers(&self, dimension: usize, out: &mut Vec<LayerSummary>) {
        out.push(LayerSummary::new(
            format!("input_{}", self.name),
            "InputLayer",
            vec![dimension, self.in_channels],
        ));
        let mut len = dimension;
        for (i, block) in self.blocks.iter().enumerate() {
            len = block.output_len(len);
            let c = block.out_channels();
            let bn = block.batch_norm();
            out.push(
                LayerSummary::new(format!("{}_conv_{i}", self.name), "Conv1D", vec![len, c])
                    .with_params(block.conv_params()),
            );
            out.push(
                LayerSummary::new(
                    format!("{}_bn_{i}", self.name),
                    "BatchNormalization",
                    vec![len, c],
                )
                .with_params(bn.trainable_params() + bn.non_trainable_params())
                .with_non_trainable(bn.non_trainable_params()),
            );
            out.push(LayerSummary::new(
                format!("{}_relu_{i}", self.name),
                "Activation",
                vec![len, c],
            ));
        }
        let features = self.blocks.last().map(|b| b.out_channels()).unwrap_or(0);
        out.push(LayerSummary::new(
            format!("{}_pool", self.name),
            "GlobalAveragePooling1D",
            vec![features],
        ));
    }
}

pub struct Convolutional {
    rgb: Branch,
    ppg: Option<Branch>,
    dense: Linear,
    depth: Depth,
    dimension: usize,
    embed: bool,
}

impl Convolutional {
    /// `rppg` adds a ppg branch fused by concatenation; `embed` L2-normalises the
    /// pooled features and exposes them as embeddings for metric learning.
    pub fn new(
        dimension: usize,
        depth: Depth,
        rppg: bool,
        embed: bool,
        vb: VarBuilder,
    ) -> Result<Self> {
        let rgb = Branch::new("rgb", RGB_CHANNELS, depth, vb.pp("rgb"))?;
        let ppg = if rppg {
            Some(Branch::new("ppg", PPG_CHANNELS, depth, vb.pp("ppg"))?)
        } else {
            None
        };
        let branches = if rppg { 2 } else { 1 };
        let dense = linear(depth.features() * branches, NUM_CLASSES, vb.pp("dense"))?;
        Ok(Self {
            rgb,
            ppg,
            dense,
            depth,
            dimension,
            embed,
        })
    }

    fn features(&self) -> usize {
        self.depth.features() * if self.ppg.is_some() { 2 } else { 1 }
    }

    /// Sequence length left after the last conv block.
    pub fn output_len(&self) -> usize {
        self.depth
            .blocks()
            .iter()
            .fold(self.dimension, |len, &(_, stride)| {
                conv_output_len(len, KERNEL_SIZE, stride)
            })
    }
}

impl Topology for Convolutional {
    fn forward_t(&self, x: &SignalBatch, train: bool) -> Result<ForwardOutput> {
        let rgb = self.rgb.forward_t(&x.rgb, train)?;
        let features = match &self.ppg {
            Some(branch) => {
                let ppg = branch.forward_t(require_ppg(x)?, train)?;
                Tensor::cat(&[&rgb, &ppg], 1)?
            }
            None => rgb,
        };

        if self.embed {
            let embeddings = l2_normalize(&features)?;
            classify(&self.dense, &embeddings, Some(embeddings.clone()))
        } else {
            classify(&self.dense, &features, None)
        }
    }

    fn batch_norms(&self) -> Vec<&GradBatchNorm1d> {
        self.rgb
            .blocks
            .iter()
            .chain(self.ppg.iter().flat_map(|branch| branch.blocks.iter()))
            .map(ConvBlock::batch_norm)
            .collect()
    }

    fn layers(&self) -> Vec<LayerSummary> {
        let mut layers = Vec::new();
        self.rgb.layers(self.dimension, &mut layers);
        if let Some(ppg) = &self.ppg {
            ppg.layers(self.dimension, &mut layers);
            layers.push(LayerSummary::new(
                "concatenate",
                "Concatenate",
                vec![self.features()],
            ));
        }
        if self.embed {
            layers.push(LayerSummary::new(
                "l2_normalize",
                "Lambda",
                vec![self.features()],
            ));
        }
        layers.push(
            LayerSummary::new("dense", "Dense", vec![NUM_CLASSES])
                .with_params(self.features() * NUM_CLASSES + NUM_CLASSES),
        );
        layers
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::VarMap;

    fn batch(b: usize, d: usize, ppg: bool) -> Result<SignalBatch> {
        let device = Device::Cpu;
        let rgb = Tensor::randn(0f32, 1.0, (b, d, RGB_CHANNELS), &device)?;
        Ok(if ppg {
            SignalBatch::with_ppg(rgb, Tensor::randn(0f32, 1.0, (b, d, PPG_CHANNELS), &device)?)
        } else {
            SignalBatch::rgb_only(rgb)
        })
    }

    fn vb(varmap: &VarMap) -> VarBuilder<'_> {
        VarBuilder::from_varmap(varmap, DType::F32, &Device::Cpu)
    }

    #[test]
    fn test_depth_min_dimension() {
        assert_eq!(Depth::Simple.min_dimension(), 5);
        assert_eq!(Depth::Deep.min_dimension(), 13);
        assert_eq!(Depth::Simple.features(), 64);
        assert_eq!(Depth::Deep.features(), 128);
    }

    #[test]
    fn test_flat_rgb_forward_shapes() -> Result<()> {
        let varmap = VarMap::new();
        let flat = Flat::new(16, false, vb(&varmap))?;
        let out = flat.forward_t(&batch(4, 16, false)?, true)?;
        assert_eq!(out.logits.dims2()?, (4, NUM_CLASSES));
        assert_eq!(out.probabilities.dims2()?, (4, NUM_CLASSES));
        assert!(out.embeddings.is_none());
        Ok(())
    }

    #[test]
    fn test_flat_rppg_concatenates_both_inputs() -> Result<()> {
        let varmap = VarMap::new();
        let flat = Flat::new(16, true, vb(&varmap))?;
        let layers = flat.layers();
        let dense = layers.last().unwrap();
        assert_eq!(dense.params, (16 * 3 + 16) * 2 + 2);
        let out = flat.forward_t(&batch(3, 16, true)?, false)?;
        assert_eq!(out.probabilities.dims2()?, (3, NUM_CLASSES));
        Ok(())
    }

    #[test]
    fn test_flat_rppg_without_ppg_fails() -> Result<()> {
        let varmap = VarMap::new();
        let flat = Flat::new(16, true, vb(&varmap))?;
        let err = flat.forward_t(&batch(2, 16, false)?, true).err().unwrap();
        assert!(matches!(
            err.downcast_ref::<LivenetError>(),
            Some(LivenetError::MissingRppg { .. })
        ));
        Ok(())
    }

    #[test]
    fn test_convolutional_probabilities_sum_to_one() -> Result<()> {
        let varmap = VarMap::new();
        let net = Convolutional::new(32, Depth::Deep, true, false, vb(&varmap))?;
        let out = net.forward_t(&batch(4, 32, true)?, true)?;
        let sums = out.probabilities.sum(1)?.to_vec1::<f32>()?;
        for s in sums {
            assert!((s - 1.0).abs() < 1e-5, "row should sum to 1, got {s}");
        }
        Ok(())
    }

    #[test]
    fn test_embeddings_are_unit_norm() -> Result<()> {
        let varmap = VarMap::new();
        let net = Convolutional::new(32, Depth::Deep, true, true, vb(&varmap))?;
        let out = net.forward_t(&batch(4, 32, true)?, true)?;
        let emb = out.embeddings.expect("triplet topology exposes embeddings");
        assert_eq!(emb.dims2()?, (4, 256));
        let norms = emb.sqr()?.sum(1)?.sqrt()?.to_vec1::<f32>()?;
        for n in norms {
            assert!((n - 1.0).abs() < 1e-4, "embedding norm should be 1, got {n}");
        }
        Ok(())
    }

    #[test]
    fn test_convolutional_layer_summary() -> Result<()> {
        let varmap = VarMap::new();
        let net = Convolutional::new(128, Depth::Simple, false, false, vb(&varmap))?;
        let layers = net.layers();
        let conv = layers.iter().find(|l| l.kind == "Conv1D").unwrap();
        assert_eq!(conv.output_shape, vec![124, 64]);
        assert_eq!(conv.params, 3 * 64 * 5 + 64);
        assert_eq!(conv.shape_display(), "(None, 124, 64)");
        let bn = layers.iter().find(|l| l.kind == "BatchNormalization").unwrap();
        assert_eq!(bn.params, 256);
        assert_eq!(bn.non_trainable, 128);
        assert_eq!(net.output_len(), 124);
        Ok(())
    }

    #[test]
    fn test_batch_norms_cover_every_branch() -> Result<()> {
        let varmap = VarMap::new();
        let deep_rppg = Convolutional::new(32, Depth::Deep, true, false, vb(&varmap))?;
        assert_eq!(deep_rppg.batch_norms().len(), 4);
        let flat_vars = VarMap::new();
        let flat = Flat::new(16, true, vb(&flat_vars))?;
        assert!(flat.batch_norms().is_empty());
        Ok(())
    }

    #[test]
    fn test_signal_batch_validate() -> Result<()> {
        let x = batch(2, 16, true)?;
        assert_eq!(x.validate("X", 16, true)?, 2);

        let err = x.validate("X", 17, true).err().unwrap();
        assert!(matches!(
            err.downcast_ref::<LivenetError>(),
            Some(LivenetError::InputShape { input: "rgb", .. })
        ));

        let err = x.validate("X", 16, false).err().unwrap();
        assert!(matches!(
            err.downcast_ref::<LivenetError>(),
            Some(LivenetError::UnexpectedRppg { .. })
        ));

        let err = x.without_ppg().validate("X", 16, true).err().unwrap();
        assert!(matches!(
            err.downcast_ref::<LivenetError>(),
            Some(LivenetError::MissingRppg { .. })
        ));
        Ok(())
    }

    #[test]
    fn test_signal_batch_validate_ppg_batch_mismatch() -> Result<()> {
        let device = Device::Cpu;
        let x = SignalBatch::with_ppg(
            Tensor::zeros((3, 8, 3), DType::F32, &device)?,
            Tensor::zeros((2, 8, 1), DType::F32, &device)?,
        );
        let err = x.validate("X", 8, true).err().unwrap();
        assert!(matches!(
            err.downcast_ref::<LivenetError>(),
            Some(LivenetError::BatchMismatch { rgb: 3, ppg: 2 })
        ));
        Ok(())
    }

    #[test]
    fn test_signal_batch_select_and_narrow() -> Result<()> {
        let x = batch(5, 8, true)?;
        let idx = Tensor::new(&[4u32, 0], &Device::Cpu)?;
        let picked = x.select(&idx)?;
        assert_eq!(picked.batch_size()?, 2);
        assert_eq!(picked.ppg.as_ref().unwrap().dims3()?, (2, 8, 1));

        let window = x.narrow(1, 3)?;
        assert_eq!(window.batch_size()?, 3);
        assert_eq!(window.dimension()?, 8);
        Ok(())
    }
}
