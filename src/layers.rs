use anyhow::Result;
use candle_core::{DType, Module, Tensor, Var, D};
use candle_nn::{conv1d, Conv1d, Conv1dConfig, VarBuilder};

// ---------------------------------------------------------------------------
// Gradient-safe BatchNorm over (batch, channels, time)
// Built from basic tensor ops so the backward pass reaches gamma, beta and the
// batch statistics.
// ---------------------------------------------------------------------------

pub const BN_MOMENTUM: f64 = 0.99;
pub const BN_EPS: f64 = 1e-3;

/// Saved running mean/variance of one `GradBatchNorm1d`.
pub struct RunningStats {
    mean: Tensor,
    var: Tensor,
}

pub struct GradBatchNorm1d {
    gamma: Tensor,
    beta: Tensor,
    // Not in the VarMap: the optimizer never sees them.
    running_mean: Var,
    running_var: Var,
    channels: usize,
    momentum: f64,
    eps: f64,
}

impl GradBatchNorm1d {
    pub fn new(channels: usize, vb: VarBuilder) -> Result<Self> {
        let gamma = vb.get_with_hints(channels, "gamma", candle_nn::Init::Const(1.0))?;
        let beta = vb.get_with_hints(channels, "beta", candle_nn::Init::Const(0.0))?;
        let running_mean = Var::zeros(channels, DType::F32, vb.device())?;
        let running_var = Var::ones(channels, DType::F32, vb.device())?;
        Ok(Self {
            gamma,
            beta,
            running_mean,
            running_var,
            channels,
            momentum: BN_MOMENTUM,
            eps: BN_EPS,
        })
    }

    /// x: (batch, channels, time). `train` normalises by batch statistics and
    /// moves the running averages; otherwise the running averages are used.
    pub fn forward_t(&self, x: &Tensor, train: bool) -> Result<Tensor> {
        let (b, c, l) = x.dims3()?;
        let (mean, var) = if train {
            let mean = x.mean_keepdim(2)?.mean_keepdim(0)?;
            let var = x
                .broadcast_sub(&mean)?
                .sqr()?
                .mean_keepdim(2)?
                .mean_keepdim(0)?;
            self.update_running(&mean, &var, b * l)?;
            (mean, var)
        } else {
            (
                self.running_mean.as_tensor().reshape((1, c, 1))?,
                self.running_var.as_tensor().reshape((1, c, 1))?,
            )
        };

        let std = (var + self.eps)?.sqrt()?;
        let normed = x.broadcast_sub(&mean)?.broadcast_div(&std)?;
        let gamma = self.gamma.reshape((1, c, 1))?;
        let beta = self.beta.reshape((1, c, 1))?;
        normed
            .broadcast_mul(&gamma)?
            .broadcast_add(&beta)
            .map_err(Into::into)
    }

    fn update_running(&self, mean: &Tensor, var: &Tensor, n: usize) -> Result<()> {
        let batch_mean = mean.detach().flatten_all()?;
        let correction = if n > 1 { n as f64 / (n - 1) as f64 } else { 1.0 };
        let batch_var = (var.detach().flatten_all()? * correction)?;

        let keep = self.momentum;
        let new_mean =
            ((self.running_mean.as_tensor() * keep)? + (batch_mean * (1.0 - keep))?)?;
        let new_var = ((self.running_var.as_tensor() * keep)? + (batch_var * (1.0 - keep))?)?;
        self.running_mean.set(&new_mean)?;
        self.running_var.set(&new_var)?;
        Ok(())
    }

    /// Detached copy of the running averages.
    pub fn running_stats(&self) -> Result<RunningStats> {
        Ok(RunningStats {
            mean: self.running_mean.as_tensor().copy()?,
            var: self.running_var.as_tensor().copy()?,
        })
    }

    pub fn restore_running_stats(&self, stats: &RunningStats) -> Result<()> {
        self.running_mean.set(&stats.mean)?;
        self.running_var.set(&stats.var)?;
        Ok(())
    }

    pub fn running_mean(&self) -> &Tensor {
        self.running_mean.as_tensor()
    }

    pub fn running_var(&self) -> &Tensor {
        self.running_var.as_tensor()
    }

    pub fn trainable_params(&self) -> usize {
        2 * self.channels
    }

    pub fn non_trainable_params(&self) -> usize {
        2 * self.channels
    }
}

// ---------------------------------------------------------------------------
// Conv1D (valid padding, linear) -> BatchNorm -> ReLU
// ---------------------------------------------------------------------------

pub const KERNEL_SIZE: usize = 5;

pub struct ConvBlock {
    conv: Conv1d,
    bn: GradBatchNorm1d,
    in_channels: usize,
    out_channels: usize,
    kernel_size: usize,
    stride: usize,
}

impl ConvBlock {
    pub fn new(
        in_channels: usize,
        out_channels: usize,
        kernel_size: usize,
        stride: usize,
        vb: VarBuilder,
    ) -> Result<Self> {
        let cfg = Conv1dConfig {
            stride,
            ..Default::default()
        };
        Ok(Self {
            conv: conv1d(in_channels, out_channels, kernel_size, cfg, vb.pp("conv"))?,
            bn: GradBatchNorm1d::new(out_channels, vb.pp("bn"))?,
            in_channels,
            out_channels,
            kernel_size,
            stride,
        })
    }

    /// x: (batch, in_channels, time) -> (batch, out_channels, output_len(time))
    pub fn forward_t(&self, x: &Tensor, train: bool) -> Result<Tensor> {
        let h = self.conv.forward(x)?;
        self.bn.forward_t(&h, train)?.relu().map_err(Into::into)
    }

    pub fn output_len(&self, len: usize) -> usize {
        conv_output_len(len, self.kernel_size, self.stride)
    }

    pub fn out_channels(&self) -> usize {
        self.out_channels
    }

    pub fn conv_params(&self) -> usize {
        self.in_channels * self.out_channels * self.kernel_size + self.out_channels
    }

    pub fn batch_norm(&self) -> &GradBatchNorm1d {
        &self.bn
    }
}

/// Output length of a valid-padded convolution; 0 if the input is shorter
/// than the kernel.
pub fn conv_output_len(len: usize, kernel_size: usize, stride: usize) -> usize {
    if len < kernel_size {
        0
    } else {
        (len - kernel_size) / stride + 1
    }
}

// ---------------------------------------------------------------------------
// Stateless ops
// ---------------------------------------------------------------------------

/// (batch, channels, time) -> (batch, channels)
pub fn global_avg_pool(x: &Tensor) -> Result<Tensor> {
    x.mean(D::Minus1).map_err(Into::into)
}

/// (batch, ...) -> (batch, prod(...)), row-major.
pub fn flatten(x: &Tensor) -> Result<Tensor> {
    x.flatten_from(1).map_err(Into::into)
}

pub const L2_EPS: f64 = 1e-12;

/// x / sqrt(max(sum(x^2), eps)) along the last axis.
pub fn l2_normalize(x: &Tensor) -> Result<Tensor> {
    let sq = x.sqr()?.sum_keepdim(D::Minus1)?;
    // max(s, eps) == relu(s - eps) + eps
    let clamped = ((sq - L2_EPS)?.relu()? + L2_EPS)?;
    x.broadcast_div(&clamped.sqrt()?).map_err(Into::into)
}

/// Softmax along the last axis using only ops with working autograd.
pub fn grad_softmax(x: &Tensor) -> Result<Tensor> {
    let max = x.max_keepdim(D::Minus1)?;
    let shifted = x.broadcast_sub(&max)?;
    let exp = shifted.exp()?;
    let sum = exp.sum_keepdim(D::Minus1)?;
    exp.broadcast_div(&sum).map_err(Into::into)
}
