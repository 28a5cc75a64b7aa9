use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

use super::error::{config, Result};

/// Fonction d'activation appliquée en sortie de couche
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum Activation {
    ReLU,
    Sigmoid,
    None,
}

impl Activation {
    #[inline]
    pub fn apply(self, x: f32) -> f32 {
        match self {
            Activation::ReLU => x.max(0.0),
            Activation::Sigmoid => 1.0 / (1.0 + (-x).exp()),
            Activation::None => x,
        }
    }
}

/// Couche convolutive d'extraction de caractéristiques (conv1)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConvConfig {
    pub out_channels: usize,
    pub kernel_size: usize,
    pub stride: usize,
    pub padding: usize,
    pub activation: Activation,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrimaryCapsConfig {
    pub in_channels: usize,
    /// Nombre de types de capsules par position spatiale
    pub num_types: usize,
    pub capsule_dim: usize,
    pub kernel_size: usize,
    pub stride: usize,
    pub padding: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DigitCapsConfig {
    pub input_capsule_dim: usize,
    pub num_capsules: usize,
    pub capsule_dim: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecoderConfig {
    pub hidden_sizes: Vec<usize>,
    pub output_size: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// (hauteur, largeur, canaux)
    pub input_shape: (usize, usize, usize),
    pub conv1: ConvConfig,
    pub primary_capsules: PrimaryCapsConfig,
    pub digit_capsules: DigitCapsConfig,
    pub routing_iterations: usize,
    pub use_reconstruction: bool,
    pub decoder: DecoderConfig,
    #[serde(default)]
    pub seed: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LossConfig {
    pub positive_margin: f32,
    pub negative_margin: f32,
    pub down_weighting: f32,
    pub reconstruction_weight: f32,
}

/// Taille de sortie d'une convolution le long d'un axe
pub fn conv_output_size(
    input: usize,
    kernel: usize,
    stride: usize,
    padding: usize,
) -> Result<usize> {
    if kernel == 0 || stride == 0 {
        return Err(config("noyau et pas de convolution doivent être > 0"));
    }
    let padded = input + 2 * padding;
    if padded < kernel {
        return Err(config(format!(
            "noyau {} plus grand que l'entrée {} (padding {})",
            kernel, input, padding
        )));
    }
    Ok((padded - kernel) / stride + 1)
}

impl NetworkConfig {
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let raw = fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&raw)?;
        Ok(config)
    }

    pub fn to_json_string(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn num_classes(&self) -> usize {
        self.digit_capsules.num_capsules
    }

    pub fn image_pixels(&self) -> usize {
        let (h, w, c) = self.input_shape;
        h * w * c
    }

    /// Forme (H, W, C) de la sortie de conv1
    pub fn conv1_output_shape(&self) -> Result<(usize, usize, usize)> {
        let (h, w, _) = self.input_shape;
        let c = &self.conv1;
        Ok((
            conv_output_size(h, c.kernel_size, c.stride, c.padding)?,
            conv_output_size(w, c.kernel_size, c.stride, c.padding)?,
            c.out_channels,
        ))
    }

    /// Grille spatiale (H', W') des capsules primaires
    pub fn primary_grid(&self) -> Result<(usize, usize)> {
        let (h, w, _) = self.conv1_output_shape()?;
        let p = &self.primary_capsules;
        Ok((
            conv_output_size(h, p.kernel_size, p.stride, p.padding)?,
            conv_output_size(w, p.kernel_size, p.stride, p.padding)?,
        ))
    }

    pub fn num_primary_capsules(&self) -> Result<usize> {
        let (h, w) = self.primary_grid()?;
        Ok(h * w * self.primary_capsules.num_types)
    }

    pub fn validate(&self) -> Result<()> {
        let (h, w, c) = self.input_shape;
        if h == 0 || w == 0 || c == 0 {
            return Err(config("input_shape doit être strictement positif"));
        }
        if self.conv1.out_channels == 0 {
            return Err(config("conv1.out_channels doit être > 0"));
        }

        let p = &self.primary_capsules;
        if p.in_channels != self.conv1.out_channels {
            return Err(config(format!(
                "primary_capsules.in_channels ({}) != conv1.out_channels ({})",
                p.in_channels, self.conv1.out_channels
            )));
        }
        if p.num_types == 0 || p.capsule_dim == 0 {
            return Err(config("les capsules primaires doivent avoir num_types et capsule_dim > 0"));
        }

        let d = &self.digit_capsules;
        if d.input_capsule_dim != p.capsule_dim {
            return Err(config(format!(
                "digit_capsules.input_capsule_dim ({}) != primary_capsules.capsule_dim ({})",
                d.input_capsule_dim, p.capsule_dim
            )));
        }
        if d.num_capsules == 0 || d.capsule_dim == 0 {
            return Err(config("capsules de sortie: num_capsules et capsule_dim doivent être > 0"));
        }

        if self.routing_iterations < 1 {
            return Err(config("routing_iterations doit être >= 1"));
        }

        // Vérifie toute la géométrie conv1 -> capsules primaires
        self.num_primary_capsules()?;

        if self.use_reconstruction {
            if self.decoder.output_size != self.image_pixels() {
                return Err(config(format!(
                    "decoder.output_size ({}) != nombre de pixels de l'image ({})",
                    self.decoder.output_size,
                    self.image_pixels()
                )));
            }
            if self.decoder.hidden_sizes.iter().any(|&s| s == 0) {
                return Err(config("les couches cachées du décodeur doivent être non vides"));
            }
        }

        Ok(())
    }
}

impl LossConfig {
    pub fn validate(&self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.negative_margin)
            || !(0.0..=1.0).contains(&self.positive_margin)
            || self.negative_margin >= self.positive_margin
        {
            return Err(config(format!(
                "marges invalides: m- = {}, m+ = {}",
                self.negative_margin, self.positive_margin
            )));
        }
        if self.down_weighting < 0.0 || self.reconstruction_weight < 0.0 {
            return Err(config("les pondérations de perte doivent être >= 0"));
        }
        Ok(())
    }
}

impl Default for NetworkConfig {
    /// Réseau MNIST: conv 256 9x9, 32 types de capsules 8D, 10 capsules 16D
    fn default() -> Self {
        Self {
            input_shape: (28, 28, 1),
            conv1: ConvConfig {
                out_channels: 256,
                kernel_size: 9,
                stride: 1,
                padding: 0,
                activation: Activation::ReLU,
            },
            primary_capsules: PrimaryCapsConfig {
                in_channels: 256,
                num_types: 32,
                capsule_dim: 8,
                kernel_size: 9,
                stride: 2,
                padding: 0,
            },
            digit_capsules: DigitCapsConfig {
                input_capsule_dim: 8,
                num_capsules: 10,
                capsule_dim: 16,
            },
            routing_iterations: 2,
            use_reconstruction: true,
            decoder: DecoderConfig {
                hidden_sizes: vec![512, 1024],
                output_size: 784,
            },
            seed: None,
        }
    }
}

impl Default for LossConfig {
    fn default() -> Self {
        Self {
            positive_margin: 0.9,
            negative_margin: 0.1,
            down_weighting: 0.5,
            reconstruction_weight: 0.0005,
        }
    }
}
