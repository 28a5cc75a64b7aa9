use ndarray::{Array1, Array2, Array3, ArrayView2, ArrayView3, ArrayView4};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::{
    capsule::{DigitCapsLayer, PrimaryCapsLayer},
    config::{LossConfig, NetworkConfig},
    decoder::ReconstructionDecoder,
    error::{config, shape_mismatch, CapsNetError, Result},
    layers::{capsule_lengths, ConvLayer},
    loss::{CombinedLoss, LossBreakdown},
    masking::{argmax_rows, mask_capsules, one_hot, MaskSelector},
    routing::softmax_rows,
};

/// Mode d'exécution du forward
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Mode {
    Train,
    Eval,
    Predict,
}

impl Mode {
    pub fn requires_labels(self) -> bool {
        !matches!(self, Mode::Predict)
    }
}

/// Résultat d'un forward
#[derive(Debug, Clone)]
pub struct ForwardOutput {
    /// Capsules de sortie `[batch, num_classes, dim]`
    pub capsules: Array3<f32>,
    /// Longueur de chaque capsule `[batch, num_classes]`
    pub lengths: Array2<f32>,
    /// Softmax des longueurs
    pub probabilities: Array2<f32>,
    pub predicted_class: Array1<usize>,
    /// Reconstruction masquée par la classe prédite, si la régularisation est active
    pub reconstruction: Option<Array2<f32>>,
    /// Absente en mode Predict
    pub loss: Option<LossBreakdown>,
}

/// Modèle CapsNet principal
pub struct CapNet {
    pub network_config: NetworkConfig,
    pub loss_config: LossConfig,
    pub conv1: ConvLayer,
    pub primary_caps: PrimaryCapsLayer,
    pub digit_caps: DigitCapsLayer,
    pub decoder: Option<ReconstructionDecoder>,
    pub loss_fn: CombinedLoss,
}

impl CapNet {
    /// Assemble un modèle à partir de couches existantes en vérifiant leur chaînage
    pub fn from_parts(
        network_config: NetworkConfig,
        loss_config: LossConfig,
        conv1: ConvLayer,
        primary_caps: PrimaryCapsLayer,
        digit_caps: DigitCapsLayer,
        decoder: Option<ReconstructionDecoder>,
    ) -> Result<Self> {
        let (height, width, channels) = network_config.input_shape;

        // La configuration stockée doit décrire les couches fournies
        if network_config.use_reconstruction && decoder.is_none() {
            return Err(config("use_reconstruction est actif sans décodeur"));
        }
        let expected_digit = (
            network_config.num_classes(),
            network_config.digit_capsules.capsule_dim,
        );
        let actual_digit = (digit_caps.num_capsules(), digit_caps.capsule_dim());
        if expected_digit != actual_digit {
            return Err(shape_mismatch(
                "capsules de sortie (nombre, dim)",
                expected_digit,
                actual_digit,
            ));
        }
        if digit_caps.routing.num_iterations != network_config.routing_iterations {
            return Err(shape_mismatch(
                "itérations de routage",
                network_config.routing_iterations,
                digit_caps.routing.num_iterations,
            ));
        }

        if conv1.in_channels() != channels {
            return Err(shape_mismatch("canaux de conv1", channels, conv1.in_channels()));
        }
        let primary_in = primary_caps.conv_layers[0].in_channels();
        if primary_in != conv1.out_channels() {
            return Err(shape_mismatch(
                "canaux des capsules primaires",
                conv1.out_channels(),
                primary_in,
            ));
        }

        let (h1, w1) = conv1.output_size(height, width)?;
        let num_primary = primary_caps.num_capsules(h1, w1)?;
        let expected_lower = (num_primary, primary_caps.capsule_dim);
        let actual_lower = (digit_caps.num_input_capsules(), digit_caps.input_capsule_dim());
        if expected_lower != actual_lower {
            return Err(shape_mismatch(
                "transformations (capsules inférieures, dim)",
                expected_lower,
                actual_lower,
            ));
        }

        let num_classes = digit_caps.num_capsules();
        if let Some(decoder) = &decoder {
            let expected_in = num_classes * digit_caps.capsule_dim();
            if decoder.input_size() != expected_in {
                return Err(shape_mismatch(
                    "entrée du décodeur",
                    expected_in,
                    decoder.input_size(),
                ));
            }
            if decoder.output_size() != network_config.image_pixels() {
                return Err(shape_mismatch(
                    "sortie du décodeur",
                    network_config.image_pixels(),
                    decoder.output_size(),
                ));
            }
        }

        let loss_fn = CombinedLoss::from_config(&loss_config, decoder.is_some());

        Ok(Self {
            network_config,
            loss_config,
            conv1,
            primary_caps,
            digit_caps,
            decoder,
            loss_fn,
        })
    }

    pub fn num_classes(&self) -> usize {
        self.digit_caps.num_capsules()
    }

    pub fn num_parameters(&self) -> usize {
        self.conv1.num_parameters()
            + self.primary_caps.num_parameters()
            + self.digit_caps.num_parameters()
            + self.decoder.as_ref().map_or(0, ReconstructionDecoder::num_parameters)
    }

    /// Forward sur des images aplaties `[batch, H·W·C]`
    pub fn forward(
        &self,
        images: &ArrayView2<f32>,
        mode: Mode,
        labels: Option<&[usize]>,
    ) -> Result<ForwardOutput> {
        let (height, width, channels) = self.network_config.input_shape;
        let (batch_size, pixels) = images.dim();
        if pixels != self.network_config.image_pixels() {
            return Err(CapsNetError::InvalidInput(format!(
                "{} pixels par image, {} attendus",
                pixels,
                self.network_config.image_pixels()
            )));
        }

        let reshaped = images.to_shape((batch_size, height, width, channels))?;
        self.forward_images(&reshaped.view(), mode, labels)
    }

    /// Forward sur des images `[batch, H, W, C]`
    pub fn forward_images(
        &self,
        images: &ArrayView4<f32>,
        mode: Mode,
        labels: Option<&[usize]>,
    ) -> Result<ForwardOutput> {
        let (batch_size, height, width, channels) = images.dim();
        if (height, width, channels) != self.network_config.input_shape {
            return Err(shape_mismatch(
                "images",
                self.network_config.input_shape,
                (height, width, channels),
            ));
        }

        // Les étiquettes sont ignorées en mode Predict
        let targets = if mode.requires_labels() {
            let labels = labels.ok_or(CapsNetError::MissingLabels(mode))?;
            if labels.len() != batch_size {
                return Err(CapsNetError::BatchMismatch {
                    images: batch_size,
                    labels: labels.len(),
                });
            }
            Some(one_hot(labels, self.num_classes())?)
        } else {
            None
        };

        let features = self.conv1.forward(images)?;
        let primary = self.primary_caps.forward(&features.view())?;
        let capsules = self.digit_caps.forward(&primary.view())?;

        let lengths = capsule_lengths(&capsules.view());
        let probabilities = softmax_rows(&lengths.view());
        let predicted_class = argmax_rows(&lengths.view());

        let reconstruction =
            self.reconstruct(&capsules.view(), MaskSelector::Lengths(lengths.view()))?;

        let loss = match &targets {
            Some(targets) => {
                // Le décodeur apprend toujours à partir de la vraie classe
                let label_reconstruction =
                    self.reconstruct(&capsules.view(), MaskSelector::Labels(targets.view()))?;
                let flat = images.to_shape((batch_size, height * width * channels))?;
                let flat = flat.view();
                let label_reconstruction = label_reconstruction.as_ref().map(|r| r.view());

                let breakdown = self.loss_fn.compute_total(
                    &lengths.view(),
                    &targets.view(),
                    label_reconstruction.as_ref().map(|r| (r, &flat)),
                );
                debug!(
                    ?mode,
                    margin = breakdown.margin,
                    reconstruction = ?breakdown.reconstruction,
                    total = breakdown.total,
                    "perte"
                );
                Some(breakdown)
            }
            None => None,
        };

        Ok(ForwardOutput {
            capsules,
            lengths,
            probabilities,
            predicted_class,
            reconstruction,
            loss,
        })
    }

    /// Masquage puis décodage; `None` si la régularisation est désactivée
    ///
    /// Les deux sites d'appel du forward passent par ici et empruntent le même décodeur.
    pub fn reconstruct(
        &self,
        capsules: &ArrayView3<f32>,
        selector: MaskSelector<'_>,
    ) -> Result<Option<Array2<f32>>> {
        let Some(decoder) = &self.decoder else {
            return Ok(None);
        };
        let masked = mask_capsules(capsules, selector)?;
        decoder.forward(&masked.view()).map(Some)
    }

    /// Prédiction
    pub fn predict(&self, images: &ArrayView2<f32>) -> Result<Array1<usize>> {
        Ok(self.forward(images, Mode::Predict, None)?.predicted_class)
    }

    /// Résumé des couches
    pub fn summary(&self) {
        let (h, w, c) = self.network_config.input_shape;
        info!("🔍 RÉSUMÉ DU MODÈLE");
        info!("   Entrée: {}x{}x{}", h, w, c);
        info!(
            "   conv1: {} filtres {}x{}, pas {}",
            self.conv1.out_channels(),
            self.conv1.kernel_size(),
            self.conv1.kernel_size(),
            self.conv1.stride
        );
        if let Ok((h1, w1)) = self.conv1.output_size(h, w) {
            if let Ok(n) = self.primary_caps.num_capsules(h1, w1) {
                info!(
                    "   Capsules primaires: {} ({} types, dim {})",
                    n, self.primary_caps.num_types, self.primary_caps.capsule_dim
                );
            }
        }
        info!(
            "   Capsules de sortie: {} (dim {}), {} itérations de routage",
            self.digit_caps.num_capsules(),
            self.digit_caps.capsule_dim(),
            self.digit_caps.routing.num_iterations
        );
        match &self.decoder {
            Some(decoder) => info!(
                "   Décodeur '{}': {:?}",
                decoder.name,
                decoder.layers().iter().map(|l| l.out_features()).collect::<Vec<_>>()
            ),
            None => info!("   Décodeur: désactivé"),
        }
        info!("   Paramètres: {}", self.num_parameters());
    }
}
