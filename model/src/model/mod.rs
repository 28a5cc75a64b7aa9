pub mod builder;
pub mod capsule;
pub mod config;
pub mod core;
pub mod decoder;
pub mod error;
pub mod layers;
pub mod loss;
pub mod masking;
pub mod routing;

// Réexportations principales
pub use builder::ModelBuilder;
pub use config::{LossConfig, NetworkConfig};
pub use core::{CapNet, ForwardOutput, Mode};
pub use error::{CapsNetError, Result};
pub use loss::{CombinedLoss, LossBreakdown, LossFunction, MarginLoss, ReconstructionLoss};
pub use masking::MaskSelector;
