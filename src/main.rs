// livenet: build, inspect and smoke-train the presentation-attack detection
// architectures.
//
// Commands:
//   livenet list                          Architectures and their inputs
//   livenet summary <ARCH>                Layer table for a window length
//   livenet bench [ARCH...]               Fit + evaluate on synthetic windows
//   livenet gradcheck <ARCH>              Autograd vs finite differences

use std::path::PathBuf;

use anyhow::Result;
use candle_core::Device;
use clap::{Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use livenet::synthetic::{self, SyntheticConfig};
use livenet::{gradient_check, Architecture, ArchitectureConfig, ArchitectureKind, Config};

#[derive(Parser)]
#[command(name = "livenet", version, about = "Face presentation-attack detection networks")]
struct Cli {
    /// Use CUDA device 0 when built with the `cuda` feature.
    #[arg(long, global = true)]
    cuda: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// List architectures and whether they fuse rPPG.
    List,
    /// Print the layer table of an architecture.
    Summary {
        /// Architecture name (e.g. DeepConvolutionalRGB or deep-conv-rgb).
        arch: ArchitectureKind,
        #[arg(long, default_value_t = 128)]
        dimension: usize,
    },
    /// Fit architectures on synthetic windows and print their evaluation.
    Bench {
        /// Architectures to run (all when omitted).
        archs: Vec<ArchitectureKind>,
        /// TOML file with [architecture] and [fit] sections.
        #[arg(long)]
        config: Option<PathBuf>,
        /// Synthetic training windows (evaluation uses half as many).
        #[arg(long, default_value_t = 256)]
        samples: usize,
        /// Print evaluations as JSON lines.
        #[arg(long)]
        json: bool,
    },
    /// Compare autograd against finite differences.
    Gradcheck {
        arch: ArchitectureKind,
        #[arg(long, default_value_t = 32)]
        dimension: usize,
        #[arg(long, default_value_t = 50)]
        params: usize,
        #[arg(long, default_value_t = 1e-2)]
        eps: f64,
    },
}

fn select_device(cuda: bool) -> Device {
    if !cuda {
        return Device::Cpu;
    }

    #[cfg(feature = "cuda")]
    {
        match Device::new_cuda(0) {
            Ok(dev) => {
                info!("using CUDA device 0");
                return dev;
            }
            Err(e) => warn!(error = %e, "CUDA init failed, falling back to CPU"),
        }
    }

    #[cfg(not(feature = "cuda"))]
    warn!("built without the cuda feature, using CPU");

    Device::Cpu
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let device = select_device(cli.cuda);

    match cli.command {
        Command::List => {
            for kind in ArchitectureKind::ALL {
                let inputs = if kind.uses_rppg() { "rgb + rppg" } else { "rgb" };
                println!(
                    "{:<26}{:<20}{:<12}min dimension {}",
                    kind.name(),
                    kind.slug(),
                    inputs,
                    kind.min_dimension()
                );
            }
        }
        Command::Summary { arch, dimension } => {
            let config = ArchitectureConfig::with_dimension(dimension);
            let arch = Architecture::new(arch, &config, &device)?;
            println!("{}", arch.summary());
        }
        Command::Bench {
            archs,
            config,
            samples,
            json,
        } => {
            let config = match config {
                Some(path) => Config::load(&path)?,
                None => Config::default(),
            };
            let archs = if archs.is_empty() {
                ArchitectureKind::ALL.to_vec()
            } else {
                archs
            };
            run_bench(&archs, &config, samples, json, &device)?;
        }
        Command::Gradcheck {
            arch,
            dimension,
            params,
            eps,
        } => {
            let config = ArchitectureConfig::with_dimension(dimension);
            let model = Architecture::new(arch, &config, &device)?;
            let (x, y) = synthetic::generate(
                &SyntheticConfig {
                    samples: 8,
                    dimension,
                    ..SyntheticConfig::default()
                },
                &device,
            )?;
            let x = if arch.uses_rppg() { x } else { x.without_ppg() };
            let max_rel_err = gradient_check(&model, &x, &y, params, eps)?;
            println!("{} gradient check: max relative error {max_rel_err:.3e}", arch.name());
        }
    }

    Ok(())
}

fn run_bench(
    archs: &[ArchitectureKind],
    config: &Config,
    samples: usize,
    json: bool,
    device: &Device,
) -> Result<()> {
    let dimension = config.architecture.dimension;
    let (train_x, train_y) = synthetic::generate(
        &SyntheticConfig {
            samples,
            dimension,
            seed: config.fit.seed,
            ..SyntheticConfig::default()
        },
        device,
    )?;
    let (test_x, test_y) = synthetic::generate(
        &SyntheticConfig {
            samples: (samples / 2).max(2),
            dimension,
            seed: config.fit.seed.wrapping_add(1),
            ..SyntheticConfig::default()
        },
        device,
    )?;

    for &kind in archs {
        let mut arch = Architecture::new(kind, &config.architecture, device)?;
        let (x, tx) = if kind.uses_rppg() {
            (train_x.clone(), test_x.clone())
        } else {
            (train_x.without_ppg(), test_x.without_ppg())
        };

        let history = arch.fit(&x, &train_y, &config.fit, None)?;
        if let Some(last) = history.last() {
            info!(
                arch = kind.name(),
                epochs = history.epochs.len(),
                loss = last.loss,
                accuracy = last.accuracy,
                "trained"
            );
        }

        let evaluation = arch.evaluate(&tx, &test_y)?;
        if json {
            println!("{}", serde_json::to_string(&evaluation)?);
        } else {
            println!("{evaluation}");
        }
    }
    Ok(())
}
