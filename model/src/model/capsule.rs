use ndarray::{s, Array3, Array4, ArrayView3, ArrayView4, Axis};
use ndarray_rand::rand_distr::Normal;
use ndarray_rand::RandomExt;
use rand::Rng;
use rayon::prelude::*;
use tracing::debug;

use super::config::Activation;
use super::error::{config, shape_mismatch, Result};
use super::layers::{squash, ConvLayer};
use super::routing::{DynamicRouting, RoutingTrace};

/// Écart type de l'initialisation des matrices de transformation
const TRANSFORM_INIT_STD: f32 = 0.01;

/// Couche de capsules primaires
///
/// Une convolution par type de capsule, chacune produisant `capsule_dim` canaux.
pub struct PrimaryCapsLayer {
    pub conv_layers: Vec<ConvLayer>,
    pub num_types: usize,
    pub capsule_dim: usize,
}

impl PrimaryCapsLayer {
    pub fn new<R: Rng + ?Sized>(
        in_channels: usize,
        num_types: usize,
        capsule_dim: usize,
        kernel_size: usize,
        stride: usize,
        padding: usize,
        rng: &mut R,
    ) -> Result<Self> {
        let conv_layers = (0..num_types)
            .map(|_| {
                ConvLayer::new(
                    in_channels,
                    capsule_dim,
                    kernel_size,
                    stride,
                    padding,
                    Activation::None,
                    &mut *rng,
                )
            })
            .collect::<Result<Vec<_>>>()?;

        Self::from_convs(conv_layers)
    }

    pub fn from_convs(conv_layers: Vec<ConvLayer>) -> Result<Self> {
        let first = conv_layers
            .first()
            .ok_or_else(|| config("au moins un type de capsule primaire est requis"))?;
        let capsule_dim = first.out_channels();

        for conv in &conv_layers[1..] {
            if conv.out_channels() != capsule_dim
                || conv.in_channels() != first.in_channels()
                || conv.kernel_size() != first.kernel_size()
                || conv.stride != first.stride
                || conv.padding != first.padding
            {
                return Err(config("géométries de capsules primaires incohérentes"));
            }
        }

        Ok(Self {
            num_types: conv_layers.len(),
            conv_layers,
            capsule_dim,
        })
    }

    pub fn num_parameters(&self) -> usize {
        self.conv_layers.iter().map(ConvLayer::num_parameters).sum()
    }

    /// Nombre de capsules produites pour une carte `height x width`
    pub fn num_capsules(&self, height: usize, width: usize) -> Result<usize> {
        let (h, w) = self.conv_layers[0].output_size(height, width)?;
        Ok(h * w * self.num_types)
    }

    /// `[batch, H, W, C_in]` -> `[batch, H'·W'·num_types, capsule_dim]`
    pub fn forward(&self, input: &ArrayView4<f32>) -> Result<Array3<f32>> {
        let (batch_size, in_height, in_width, _) = input.dim();
        let (out_height, out_width) = self.conv_layers[0].output_size(in_height, in_width)?;

        // [batch, H', W', num_types, capsule_dim]
        let mut grouped = ndarray::Array5::zeros((
            batch_size,
            out_height,
            out_width,
            self.num_types,
            self.capsule_dim,
        ));

        for (t, conv) in self.conv_layers.iter().enumerate() {
            let conv_output = conv.forward(input)?;
            grouped
                .slice_mut(s![.., .., .., t, ..])
                .assign(&conv_output);
        }

        let num_capsules = out_height * out_width * self.num_types;
        let capsules =
            grouped.into_shape_with_order((batch_size, num_capsules, self.capsule_dim))?;

        debug!(
            grid = ?(out_height, out_width),
            num_capsules,
            capsule_dim = self.capsule_dim,
            "capsules primaires"
        );

        Ok(squash(&capsules))
    }
}

/// Couche de capsules de sortie avec routage par agreement
pub struct DigitCapsLayer {
    pub routing: DynamicRouting,
    /// `[num_lower, num_higher, higher_dim, lower_dim]`
    pub weights: Array4<f32>,
}

impl DigitCapsLayer {
    pub fn new<R: Rng + ?Sized>(
        input_capsules: usize,
        input_capsule_dim: usize,
        output_capsules: usize,
        output_capsule_dim: usize,
        routing_iterations: usize,
        rng: &mut R,
    ) -> Result<Self> {
        let dist = Normal::new(0.0, TRANSFORM_INIT_STD)
            .map_err(|e| config(format!("init des transformations: {}", e)))?;
        let weights = Array4::random_using(
            (input_capsules, output_capsules, output_capsule_dim, input_capsule_dim),
            dist,
            rng,
        );

        Self::from_weights(weights, routing_iterations)
    }

    pub fn from_weights(weights: Array4<f32>, routing_iterations: usize) -> Result<Self> {
        if weights.iter().any(|&w| !w.is_finite()) {
            return Err(config("matrices de transformation non finies"));
        }
        if weights.is_empty() {
            return Err(config("matrices de transformation vides"));
        }

        Ok(Self {
            routing: DynamicRouting::new(routing_iterations)?,
            weights,
        })
    }

    pub fn num_input_capsules(&self) -> usize {
        self.weights.dim().0
    }

    pub fn num_capsules(&self) -> usize {
        self.weights.dim().1
    }

    pub fn capsule_dim(&self) -> usize {
        self.weights.dim().2
    }

    pub fn input_capsule_dim(&self) -> usize {
        self.weights.dim().3
    }

    pub fn num_parameters(&self) -> usize {
        self.weights.len()
    }

    /// Votes û_j|i = W_ij · u_i: `[batch, num_lower, num_higher, higher_dim]`
    pub fn predictions(&self, capsules: &ArrayView3<f32>) -> Result<Array4<f32>> {
        let (batch_size, num_lower, lower_dim) = capsules.dim();
        let expected = (self.num_input_capsules(), self.input_capsule_dim());
        if (num_lower, lower_dim) != expected {
            return Err(shape_mismatch(
                "capsules d'entrée (nombre, dim)",
                expected,
                (num_lower, lower_dim),
            ));
        }

        let mut votes =
            Array4::zeros((batch_size, num_lower, self.num_capsules(), self.capsule_dim()));

        votes
            .axis_iter_mut(Axis(0))
            .into_par_iter()
            .zip(capsules.axis_iter(Axis(0)))
            .for_each(|(mut votes_b, caps_b)| {
                for (i, u_i) in caps_b.outer_iter().enumerate() {
                    let w_i = self.weights.index_axis(Axis(0), i);
                    for (j, w_ij) in w_i.outer_iter().enumerate() {
                        votes_b.slice_mut(s![i, j, ..]).assign(&w_ij.dot(&u_i));
                    }
                }
            });

        Ok(votes)
    }

    /// `[batch, num_lower, lower_dim]` -> `[batch, num_higher, higher_dim]`
    pub fn forward(&self, capsules: &ArrayView3<f32>) -> Result<Array3<f32>> {
        Ok(self.forward_with_trace(capsules)?.outputs)
    }

    pub fn forward_with_trace(&self, capsules: &ArrayView3<f32>) -> Result<RoutingTrace> {
        let votes = self.predictions(capsules)?;
        Ok(self.routing.route_with_coeffs(&votes.view()))
    }
}
