use ndarray::{Array2, ArrayView2, Axis, Zip};
use serde::Serialize;

use super::config::LossConfig;

/// Trait pour les fonctions de perte
///
/// `predictions` et `targets` ont la même forme `[batch, n]`.
pub trait LossFunction: Send + Sync {
    fn compute(&self, predictions: &ArrayView2<f32>, targets: &ArrayView2<f32>) -> f32;
}

/// Margin Loss pour CapsNet (Sabour et al., 2017)
#[derive(Debug, Clone)]
pub struct MarginLoss {
    pub positive_margin: f32, // m+ = 0.9
    pub negative_margin: f32, // m- = 0.1
    pub down_weighting: f32,  // λ = 0.5
}

impl MarginLoss {
    pub fn new(positive_margin: f32, negative_margin: f32, down_weighting: f32) -> Self {
        Self {
            positive_margin,
            negative_margin,
            down_weighting,
        }
    }

    /// Terme de perte de chaque classe: `[batch, num_classes]`
    pub fn per_class(&self, lengths: &ArrayView2<f32>, targets: &ArrayView2<f32>) -> Array2<f32> {
        let mut losses = Array2::zeros(lengths.raw_dim());

        Zip::from(&mut losses)
            .and(lengths)
            .and(targets)
            .for_each(|loss, &norm, &target| {
                // T_k * max(0, m+ - ||v_k||)^2
                let present = target * (self.positive_margin - norm).max(0.0).powi(2);
                // λ * (1 - T_k) * max(0, ||v_k|| - m-)^2
                let absent = (1.0 - target) * (norm - self.negative_margin).max(0.0).powi(2);
                *loss = present + self.down_weighting * absent;
            });

        losses
    }
}

impl LossFunction for MarginLoss {
    /// Moyenne sur le batch de la somme sur les classes
    fn compute(&self, lengths: &ArrayView2<f32>, targets: &ArrayView2<f32>) -> f32 {
        let per_class = self.per_class(lengths, targets);
        per_class.sum_axis(Axis(1)).mean().unwrap_or(0.0)
    }
}

/// Perte de reconstruction: MSE pondérée
#[derive(Debug, Clone)]
pub struct ReconstructionLoss {
    pub weight: f32, // Facteur de pondération (α)
}

impl ReconstructionLoss {
    pub fn new(weight: f32) -> Self {
        Self { weight }
    }

    pub fn mean_squared_error(reconstruction: &ArrayView2<f32>, original: &ArrayView2<f32>) -> f32 {
        let n = reconstruction.len();
        if n == 0 {
            return 0.0;
        }
        let sum = Zip::from(reconstruction)
            .and(original)
            .fold(0.0f32, |acc, &r, &x| acc + (r - x) * (r - x));
        sum / n as f32
    }
}

impl LossFunction for ReconstructionLoss {
    fn compute(&self, reconstruction: &ArrayView2<f32>, original: &ArrayView2<f32>) -> f32 {
        self.weight * Self::mean_squared_error(reconstruction, original)
    }
}

/// Détail des pertes d'un forward
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct LossBreakdown {
    pub margin: f32,
    /// Terme déjà pondéré, absent sans régularisation
    pub reconstruction: Option<f32>,
    pub total: f32,
}

/// Perte combinée: Margin Loss + Reconstruction Loss
#[derive(Debug, Clone)]
pub struct CombinedLoss {
    margin_loss: MarginLoss,
    reconstruction_loss: Option<ReconstructionLoss>,
}

impl CombinedLoss {
    pub fn new(
        positive_margin: f32,
        negative_margin: f32,
        down_weighting: f32,
        reconstruction_weight: Option<f32>,
    ) -> Self {
        let margin_loss = MarginLoss::new(positive_margin, negative_margin, down_weighting);
        let reconstruction_loss = reconstruction_weight.map(ReconstructionLoss::new);

        Self {
            margin_loss,
            reconstruction_loss,
        }
    }

    pub fn from_config(config: &LossConfig, use_reconstruction: bool) -> Self {
        Self::new(
            config.positive_margin,
            config.negative_margin,
            config.down_weighting,
            use_reconstruction.then_some(config.reconstruction_weight),
        )
    }

    /// `reconstruction`: (reconstruction, image originale aplatie)
    pub fn compute_total(
        &self,
        lengths: &ArrayView2<f32>,
        targets: &ArrayView2<f32>,
        reconstruction: Option<(&ArrayView2<f32>, &ArrayView2<f32>)>,
    ) -> LossBreakdown {
        let margin = self.margin_loss.compute(lengths, targets);

        let reconstruction = match (reconstruction, &self.reconstruction_loss) {
            (Some((recon, original)), Some(recon_loss)) => {
                Some(recon_loss.compute(recon, original))
            }
            _ => None,
        };

        LossBreakdown {
            margin,
            reconstruction,
            total: margin + reconstruction.unwrap_or(0.0),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    fn default_margin() -> MarginLoss {
        MarginLoss::new(0.9, 0.1, 0.5)
    }

    #[test]
    fn test_margin_loss_zero_at_margins() {
        let loss_fn = default_margin();
        let lengths = array![[0.9f32, 0.1, 0.1]];
        let targets = array![[1.0f32, 0.0, 0.0]];

        let per_class = loss_fn.per_class(&lengths.view(), &targets.view());
        assert!(per_class.iter().all(|&l| l == 0.0));
        assert_eq!(loss_fn.compute(&lengths.view(), &targets.view()), 0.0);
    }

    #[test]
    fn test_margin_loss_known_value() {
        let loss_fn = default_margin();
        let lengths = array![[0.5f32, 0.5], [0.0, 1.0]];
        let targets = array![[1.0f32, 0.0], [0.0, 1.0]];

        // Exemple 0: 0.4² + 0.5·0.4² = 0.24 ; exemple 1: 0 + 0 = 0
        let loss = loss_fn.compute(&lengths.view(), &targets.view());
        assert_abs_diff_eq!(loss, 0.12, epsilon = 1e-6);
    }

    #[test]
    fn test_margin_loss_non_negative() {
        let loss_fn = default_margin();
        let targets = array![[0.0f32, 1.0, 0.0, 0.0]];
        for step in 0..=10 {
            let len = step as f32 / 10.0;
            let lengths = array![[len, len, 1.0 - len, 0.0]];
            let loss = loss_fn.compute(&lengths.view(), &targets.view());
            assert!(loss >= 0.0);
        }
    }

    #[test]
    fn test_reconstruction_loss_weighted_mse() {
        let loss_fn = ReconstructionLoss::new(0.0005);
        let recon = array![[0.0f32, 1.0], [0.5, 0.5]];
        let original = array![[1.0f32, 1.0], [0.5, 0.0]];

        // MSE = (1 + 0 + 0 + 0.25) / 4
        let loss = loss_fn.compute(&recon.view(), &original.view());
        assert_abs_diff_eq!(loss, 0.0005 * 0.3125, epsilon = 1e-9);
    }

    #[test]
    fn test_combined_loss() {
        let combined = CombinedLoss::from_config(&LossConfig::default(), true);
        let lengths = array![[0.5f32, 0.5]];
        let targets = array![[1.0f32, 0.0]];
        let recon = array![[1.0f32, 0.0]];
        let original = array![[0.0f32, 0.0]];

        let breakdown = combined.compute_total(
            &lengths.view(),
            &targets.view(),
            Some((&recon.view(), &original.view())),
        );
        assert_abs_diff_eq!(breakdown.margin, 0.24, epsilon = 1e-6);
        assert_abs_diff_eq!(breakdown.reconstruction.unwrap(), 0.00025, epsilon = 1e-9);
        assert_abs_diff_eq!(breakdown.total, 0.24025, epsilon = 1e-6);

        let margin_only = CombinedLoss::from_config(&LossConfig::default(), false);
        let breakdown = margin_only.compute_total(
            &lengths.view(),
            &targets.view(),
            Some((&recon.view(), &original.view())),
        );
        assert_eq!(breakdown.reconstruction, None);
        assert_eq!(breakdown.total, breakdown.margin);
    }
}
