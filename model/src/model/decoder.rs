use ndarray::{Array2, ArrayView2};
use rand::Rng;
use tracing::debug;

use super::config::{Activation, DecoderConfig};
use super::error::{config, shape_mismatch, Result};
use super::layers::DenseLayer;

/// Décodeur de reconstruction: capsule masquée -> pixels
///
/// Un seul jeu de paramètres nommés (`reconstruction1`, `reconstruction2`, ...),
/// emprunté par les appels de prédiction et d'entraînement.
pub struct ReconstructionDecoder {
    pub name: String,
    layers: Vec<DenseLayer>,
}

impl ReconstructionDecoder {
    pub fn new<R: Rng + ?Sized>(
        name: impl Into<String>,
        input_size: usize,
        decoder_config: &DecoderConfig,
        rng: &mut R,
    ) -> Result<Self> {
        let name = name.into();
        let mut layers = Vec::with_capacity(decoder_config.hidden_sizes.len() + 1);
        let mut in_features = input_size;

        for &hidden in &decoder_config.hidden_sizes {
            let layer_name = format!("{}{}", name, layers.len() + 1);
            layers.push(DenseLayer::new(
                layer_name,
                in_features,
                hidden,
                Activation::ReLU,
                &mut *rng,
            )?);
            in_features = hidden;
        }

        // Sortie bornée à [0, 1]
        let layer_name = format!("{}{}", name, layers.len() + 1);
        layers.push(DenseLayer::new(
            layer_name,
            in_features,
            decoder_config.output_size,
            Activation::Sigmoid,
            rng,
        )?);

        Self::from_layers(name, layers)
    }

    pub fn from_layers(name: impl Into<String>, layers: Vec<DenseLayer>) -> Result<Self> {
        if layers.is_empty() {
            return Err(config("le décodeur doit avoir au moins une couche"));
        }
        for pair in layers.windows(2) {
            if pair[0].out_features() != pair[1].in_features() {
                return Err(shape_mismatch(
                    format!("chaînage {} -> {}", pair[0].name, pair[1].name),
                    pair[0].out_features(),
                    pair[1].in_features(),
                ));
            }
        }

        Ok(Self {
            name: name.into(),
            layers,
        })
    }

    pub fn input_size(&self) -> usize {
        self.layers[0].in_features()
    }

    pub fn output_size(&self) -> usize {
        self.layers[self.layers.len() - 1].out_features()
    }

    pub fn layers(&self) -> &[DenseLayer] {
        &self.layers
    }

    /// Recherche d'une couche par nom
    pub fn layer(&self, name: &str) -> Option<&DenseLayer> {
        self.layers.iter().find(|layer| layer.name == name)
    }

    pub fn num_parameters(&self) -> usize {
        self.layers.iter().map(DenseLayer::num_parameters).sum()
    }

    /// `[batch, num_classes·dim]` -> `[batch, pixels]`
    pub fn forward(&self, masked: &ArrayView2<f32>) -> Result<Array2<f32>> {
        let mut output = masked.to_owned();
        for layer in &self.layers {
            output = layer.forward(&output.view())?;
        }

        debug!(decoder = %self.name, shape = ?output.dim(), "reconstruction");
        Ok(output)
    }
}
