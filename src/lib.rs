#![deny(dead_code)]
#![deny(unused_imports)]
#![deny(unused_variables)]

pub mod architecture;
pub mod config;
pub mod error;
pub mod layers;
pub mod losses;
pub mod metrics;
pub mod synthetic;
pub mod topology;
pub mod training;

pub use architecture::{gradient_check, Architecture, ArchitectureKind};
pub use config::{ArchitectureConfig, Config, FitConfig};
pub use error::LivenetError;
pub use metrics::{ConfusionCounts, Evaluation};
pub use topology::SignalBatch;
pub use training::{one_hot_labels, History};
