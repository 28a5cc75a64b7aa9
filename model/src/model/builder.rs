use rand::rngs::StdRng;
use rand::SeedableRng;
use tracing::info;

use super::{
    capsule::{DigitCapsLayer, PrimaryCapsLayer},
    config::{LossConfig, NetworkConfig},
    core::CapNet,
    decoder::ReconstructionDecoder,
    error::{config, Result},
    layers::ConvLayer,
};

/// Constructeur de modèle
pub struct ModelBuilder {
    network_config: Option<NetworkConfig>,
    loss_config: Option<LossConfig>,
    seed: Option<u64>,
}

impl ModelBuilder {
    pub fn new() -> Self {
        Self {
            network_config: None,
            loss_config: None,
            seed: None,
        }
    }

    pub fn with_network_config(mut self, config: NetworkConfig) -> Self {
        self.network_config = Some(config);
        self
    }

    pub fn with_loss_config(mut self, config: LossConfig) -> Self {
        self.loss_config = Some(config);
        self
    }

    /// Prioritaire sur `NetworkConfig::seed`
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    pub fn build(self) -> Result<CapNet> {
        let network_config = self
            .network_config
            .ok_or_else(|| config("configuration réseau requise"))?;
        let loss_config = self.loss_config.unwrap_or_default();

        // Validation
        network_config.validate()?;
        loss_config.validate()?;

        let mut rng = match self.seed.or(network_config.seed) {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };

        let (_, _, channels) = network_config.input_shape;
        let c = &network_config.conv1;
        let conv1 = ConvLayer::new(
            channels,
            c.out_channels,
            c.kernel_size,
            c.stride,
            c.padding,
            c.activation,
            &mut rng,
        )?;

        let p = &network_config.primary_capsules;
        let primary_caps = PrimaryCapsLayer::new(
            p.in_channels,
            p.num_types,
            p.capsule_dim,
            p.kernel_size,
            p.stride,
            p.padding,
            &mut rng,
        )?;

        let d = &network_config.digit_capsules;
        let digit_caps = DigitCapsLayer::new(
            network_config.num_primary_capsules()?,
            d.input_capsule_dim,
            d.num_capsules,
            d.capsule_dim,
            network_config.routing_iterations,
            &mut rng,
        )?;

        let decoder = if network_config.use_reconstruction {
            Some(ReconstructionDecoder::new(
                "reconstruction",
                d.num_capsules * d.capsule_dim,
                &network_config.decoder,
                &mut rng,
            )?)
        } else {
            None
        };

        let model = CapNet::from_parts(
            network_config,
            loss_config,
            conv1,
            primary_caps,
            digit_caps,
            decoder,
        )?;

        info!(parameters = model.num_parameters(), "✅ modèle construit");
        Ok(model)
    }
}

impl Default for ModelBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::error::CapsNetError;

    #[test]
    fn test_build_requires_network_config() {
        let result = ModelBuilder::new().build();
        assert!(matches!(result, Err(CapsNetError::Config(_))));
    }

    #[test]
    fn test_build_default_mnist_shapes() {
        let mut config = NetworkConfig::default();
        // Décodeur et conv1 réduits pour garder le test rapide
        config.conv1.out_channels = 8;
        config.primary_capsules.in_channels = 8;
        config.primary_capsules.num_types = 2;
        config.decoder.hidden_sizes = vec![4];

        let model = ModelBuilder::new()
            .with_network_config(config)
            .with_seed(3)
            .build()
            .unwrap();

        assert_eq!(model.digit_caps.weights.dim(), (72, 10, 16, 8));
        assert_eq!(model.decoder.as_ref().unwrap().input_size(), 160);
        assert_eq!(model.decoder.as_ref().unwrap().output_size(), 784);
        assert_eq!(model.num_classes(), 10);
    }

    #[test]
    fn test_build_rejects_invalid_config() {
        let mut config = NetworkConfig::default();
        config.routing_iterations = 0;
        let result = ModelBuilder::new().with_network_config(config).build();
        assert!(matches!(result, Err(CapsNetError::Config(_))));

        let loss = LossConfig {
            reconstruction_weight: -1.0,
            ..LossConfig::default()
        };
        let result = ModelBuilder::new()
            .with_network_config(NetworkConfig::default())
            .with_loss_config(loss)
            .build();
        assert!(result.is_err());
    }
}
