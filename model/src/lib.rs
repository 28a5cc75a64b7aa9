//! Réseau de capsules avec routage dynamique par agreement.
//!
//! conv1 -> capsules primaires -> capsules de sortie (routage) -> longueurs,
//! avec un décodeur de reconstruction optionnel servant de régularisation.

pub mod model;

pub use model::{
    CapNet, CapsNetError, ForwardOutput, LossBreakdown, LossConfig, MaskSelector, Mode,
    ModelBuilder, NetworkConfig, Result,
};
