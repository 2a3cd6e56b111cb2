// Synthetic signal windows for smoke-testing architectures end to end.
//
// Bona fide windows: skin-tone colour means modulated by a cardiac pulse
// (0.8-2.5 Hz, strongest in green) and an rPPG trace carrying the same pulse.
// Attack windows: flat screen/print colour means with slow illumination drift
// and an rPPG trace of noise only.

use std::f32::consts::PI;

use anyhow::Result;
use candle_core::{Device, Tensor};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::metrics::{ATTACK, GENUINE};
use crate::topology::{SignalBatch, PPG_CHANNELS, RGB_CHANNELS};
use crate::training::one_hot_labels;

#[derive(Debug, Clone)]
pub struct SyntheticConfig {
    pub samples: usize,
    pub dimension: usize,
    /// Frames per second of the simulated camera.
    pub fps: f32,
    pub noise: f32,
    pub seed: u64,
}

impl Default for SyntheticConfig {
    fn default() -> Self {
        Self {
            samples: 64,
            dimension: 128,
            fps: 30.0,
            noise: 0.02,
            seed: 7,
        }
    }
}

const SKIN_TONE: [f32; 3] = [0.62, 0.45, 0.36];
const PULSE_WEIGHTS: [f32; 3] = [0.3, 1.0, 0.5];
const PULSE_AMPLITUDE: f32 = 0.05;
const ATTACK_TONE: [f32; 3] = [0.55, 0.52, 0.50];

fn gaussian(rng: &mut StdRng) -> f32 {
    // Box-Muller
    let u1: f32 = rng.gen_range(f32::EPSILON..1.0);
    let u2: f32 = rng.gen();
    (-2.0 * u1.ln()).sqrt() * (2.0 * PI * u2).cos()
}

/// Class of the i-th synthetic window; classes alternate so any prefix is balanced.
pub fn class_of(i: usize) -> u32 {
    if i % 2 == 0 {
        GENUINE
    } else {
        ATTACK
    }
}

/// Windows with both rgb and ppg populated, plus one-hot labels.
/// Use `SignalBatch::without_ppg` for RGB-only architectures.
pub fn generate(config: &SyntheticConfig, device: &Device) -> Result<(SignalBatch, Tensor)> {
    let mut rng = StdRng::seed_from_u64(config.seed);
    let (n, d) = (config.samples, config.dimension);
    let mut rgb = Vec::with_capacity(n * d * RGB_CHANNELS);
    let mut ppg = Vec::with_capacity(n * d * PPG_CHANNELS);
    let mut classes = Vec::with_capacity(n);

    for i in 0..n {
        let class = class_of(i);
        classes.push(class);

        if class == GENUINE {
            let heart_rate_hz: f32 = rng.gen_range(0.8..2.5);
            let phase: f32 = rng.gen_range(0.0..2.0 * PI);
            let offset: Vec<f32> = (0..RGB_CHANNELS).map(|_| 0.03 * gaussian(&mut rng)).collect();
            for t in 0..d {
                let pulse = (2.0 * PI * heart_rate_hz * t as f32 / config.fps + phase).sin();
                for c in 0..RGB_CHANNELS {
                    rgb.push(
                        SKIN_TONE[c]
                            + offset[c]
                            + PULSE_AMPLITUDE * PULSE_WEIGHTS[c] * pulse
                            + config.noise * gaussian(&mut rng),
                    );
                }
                ppg.push(pulse + config.noise * gaussian(&mut rng));
            }
        } else {
            let drift: f32 = rng.gen_range(-0.1..0.1);
            let offset: Vec<f32> = (0..RGB_CHANNELS).map(|_| 0.03 * gaussian(&mut rng)).collect();
            for t in 0..d {
                let trend = drift * t as f32 / d as f32;
                for c in 0..RGB_CHANNELS {
                    rgb.push(ATTACK_TONE[c] + offset[c] + trend + config.noise * gaussian(&mut rng));
                }
                ppg.push(gaussian(&mut rng));
            }
        }
    }

    let batch = SignalBatch::with_ppg(
        Tensor::from_vec(rgb, (n, d, RGB_CHANNELS), device)?,
        Tensor::from_vec(ppg, (n, d, PPG_CHANNELS), device)?,
    );
    let labels = one_hot_labels(&classes, device)?;
    Ok((batch, labels))
}
