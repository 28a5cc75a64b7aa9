use ndarray::{
    s, Array, Array1, Array2, Array4, ArrayBase, ArrayView2, ArrayView3, ArrayView4, ArrayViewMut1,
    Axis, CowArray, Data, Dimension, Ix4, Zip,
};
use ndarray_rand::rand_distr::Normal;
use ndarray_rand::RandomExt;
use rand::Rng;
use rayon::prelude::*;

use crate::model::config::{conv_output_size, Activation};
use crate::model::error::{config, shape_mismatch, Result};

/// Epsilon ajouté sous la racine lors du calcul des normes de capsules
pub const SQUASH_EPSILON: f32 = 1e-9;

/// Couche de convolution (entrée NHWC)
///
/// Les poids sont rangés en `(out_channels, kernel, kernel, in_channels)` pour
/// que le canal d'entrée soit contigu, comme l'entrée NHWC.
pub struct ConvLayer {
    pub weights: Array4<f32>,
    pub biases: Array1<f32>,
    pub stride: usize,
    pub padding: usize,
    pub activation: Activation,
}

impl ConvLayer {
    pub fn new<R: Rng + ?Sized>(
        in_channels: usize,
        out_channels: usize,
        kernel_size: usize,
        stride: usize,
        padding: usize,
        activation: Activation,
        rng: &mut R,
    ) -> Result<Self> {
        // Initialisation He
        let fan_in = (in_channels * kernel_size * kernel_size).max(1);
        let std_dev = (2.0 / fan_in as f32).sqrt();
        let dist = Normal::new(0.0, std_dev).map_err(|e| config(format!("init conv: {}", e)))?;
        let weights = Array4::random_using(
            (out_channels, kernel_size, kernel_size, in_channels),
            dist,
            rng,
        );

        Self::from_parts(weights, Array1::zeros(out_channels), stride, padding, activation)
    }

    pub fn from_parts(
        weights: Array4<f32>,
        biases: Array1<f32>,
        stride: usize,
        padding: usize,
        activation: Activation,
    ) -> Result<Self> {
        let (out_channels, kh, kw, _) = weights.dim();
        if kh != kw {
            return Err(shape_mismatch("noyau de convolution carré", (kh, kh), (kh, kw)));
        }
        if biases.len() != out_channels {
            return Err(shape_mismatch("biais de convolution", out_channels, biases.len()));
        }
        if stride == 0 {
            return Err(config("le pas de convolution doit être > 0"));
        }

        Ok(Self {
            weights,
            biases,
            stride,
            padding,
            activation,
        })
    }

    pub fn in_channels(&self) -> usize {
        self.weights.dim().3
    }

    pub fn out_channels(&self) -> usize {
        self.weights.dim().0
    }

    pub fn kernel_size(&self) -> usize {
        self.weights.dim().1
    }

    pub fn num_parameters(&self) -> usize {
        self.weights.len() + self.biases.len()
    }

    /// Dimensions spatiales de sortie pour une entrée `height x width`
    pub fn output_size(&self, height: usize, width: usize) -> Result<(usize, usize)> {
        let k = self.kernel_size();
        Ok((
            conv_output_size(height, k, self.stride, self.padding)?,
            conv_output_size(width, k, self.stride, self.padding)?,
        ))
    }

    /// `[batch, H, W, C_in]` -> `[batch, H', W', C_out]`, parallélisé par batch
    pub fn forward(&self, input: &ArrayView4<f32>) -> Result<Array4<f32>> {
        let (batch_size, in_height, in_width, in_channels) = input.dim();
        if in_channels != self.in_channels() {
            return Err(shape_mismatch(
                "canaux d'entrée de la convolution",
                self.in_channels(),
                in_channels,
            ));
        }

        let (out_height, out_width) = self.output_size(in_height, in_width)?;
        let out_channels = self.out_channels();
        let k = self.kernel_size();

        let padded: CowArray<f32, Ix4> = if self.padding > 0 {
            self.pad_input(input).into()
        } else {
            input.view().into()
        };

        let mut output = Array4::zeros((batch_size, out_height, out_width, out_channels));

        output
            .axis_iter_mut(Axis(0))
            .into_par_iter()
            .enumerate()
            .for_each(|(b, mut out_batch)| {
                let input_batch = padded.index_axis(Axis(0), b);

                for oh in 0..out_height {
                    for ow in 0..out_width {
                        let ih = oh * self.stride;
                        let iw = ow * self.stride;
                        let patch = input_batch.slice(s![ih..ih + k, iw..iw + k, ..]);

                        for oc in 0..out_channels {
                            let kernel = self.weights.index_axis(Axis(0), oc);
                            let sum = Zip::from(&patch)
                                .and(&kernel)
                                .fold(0.0f32, |acc, &x, &w| acc + x * w);
                            out_batch[[oh, ow, oc]] =
                                self.activation.apply(sum + self.biases[oc]);
                        }
                    }
                }
            });

        Ok(output)
    }

    fn pad_input(&self, input: &ArrayView4<f32>) -> Array4<f32> {
        let (batch_size, height, width, channels) = input.dim();
        let p = self.padding;

        let mut padded = Array4::zeros((batch_size, height + 2 * p, width + 2 * p, channels));
        padded
            .slice_mut(s![.., p..height + p, p..width + p, ..])
            .assign(input);
        padded
    }
}

/// Couche dense `[batch, in] -> [batch, out]`
pub struct DenseLayer {
    pub name: String,
    pub weights: Array2<f32>,
    pub biases: Array1<f32>,
    pub activation: Activation,
}

impl DenseLayer {
    pub fn new<R: Rng + ?Sized>(
        name: impl Into<String>,
        in_features: usize,
        out_features: usize,
        activation: Activation,
        rng: &mut R,
    ) -> Result<Self> {
        // He pour ReLU, Xavier sinon
        let gain = match activation {
            Activation::ReLU => 2.0,
            _ => 1.0,
        };
        let std_dev = (gain / in_features.max(1) as f32).sqrt();
        let dist = Normal::new(0.0, std_dev).map_err(|e| config(format!("init dense: {}", e)))?;
        let weights = Array2::random_using((in_features, out_features), dist, rng);

        Self::from_parts(name, weights, Array1::zeros(out_features), activation)
    }

    pub fn from_parts(
        name: impl Into<String>,
        weights: Array2<f32>,
        biases: Array1<f32>,
        activation: Activation,
    ) -> Result<Self> {
        let name = name.into();
        if biases.len() != weights.ncols() {
            return Err(shape_mismatch(
                format!("biais de {}", name),
                weights.ncols(),
                biases.len(),
            ));
        }
        Ok(Self {
            name,
            weights,
            biases,
            activation,
        })
    }

    pub fn in_features(&self) -> usize {
        self.weights.nrows()
    }

    pub fn out_features(&self) -> usize {
        self.weights.ncols()
    }

    pub fn num_parameters(&self) -> usize {
        self.weights.len() + self.biases.len()
    }

    pub fn forward(&self, input: &ArrayView2<f32>) -> Result<Array2<f32>> {
        if input.ncols() != self.in_features() {
            return Err(shape_mismatch(
                format!("entrée de {}", self.name),
                self.in_features(),
                input.ncols(),
            ));
        }

        let mut output = input.dot(&self.weights) + &self.biases;
        let activation = self.activation;
        output.par_mapv_inplace(|v| activation.apply(v));
        Ok(output)
    }
}

/// Squash d'un vecteur capsule, en place
pub fn squash_vector(vector: &mut ArrayViewMut1<f32>) {
    let norm_squared: f32 = vector.iter().map(|v| v * v).sum();

    // Stabilité numérique
    let norm = (norm_squared + SQUASH_EPSILON).sqrt();
    let factor = norm_squared / (1.0 + norm_squared) / norm;

    vector.mapv_inplace(|v| v * factor);
}

/// Squash appliqué à chaque vecteur le long du dernier axe
pub fn squash<S, D>(vectors: &ArrayBase<S, D>) -> Array<f32, D>
where
    S: Data<Elem = f32>,
    D: Dimension,
{
    let mut result = vectors.to_owned();
    if result.ndim() == 0 {
        return result;
    }

    let last = Axis(result.ndim() - 1);
    Zip::from(result.lanes_mut(last)).par_for_each(|mut lane| squash_vector(&mut lane));
    result
}

/// Longueur `sqrt(Σ v² + ε)` de chaque capsule: `[batch, n, d] -> [batch, n]`
pub fn capsule_lengths(capsules: &ArrayView3<f32>) -> Array2<f32> {
    capsules.map_axis(Axis(2), |v| (v.dot(&v) + SQUASH_EPSILON).sqrt())
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::{array, Array3};
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn norm(v: &[f32]) -> f32 {
        v.iter().map(|x| x * x).sum::<f32>().sqrt()
    }

    #[test]
    fn test_squash_length_below_one() {
        let vectors = array![[[0.01f32, -0.02, 0.0], [3.0, 4.0, 0.0], [-50.0, 20.0, 10.0]]];
        let squashed = squash(&vectors);

        for lane in squashed.lanes(Axis(2)) {
            let len = norm(lane.as_slice().unwrap());
            assert!((0.0..1.0).contains(&len), "longueur {}", len);
        }

        // ||s|| = 5 -> 25/26
        let len = norm(&squashed.slice(s![0, 1, ..]).to_vec());
        assert_abs_diff_eq!(len, 25.0 / 26.0, epsilon = 1e-5);
    }

    #[test]
    fn test_squash_preserves_direction() {
        let s = array![[1.5f32, -2.0, 0.5, 3.0]];
        let v = squash(&s);

        let dot: f32 = s.iter().zip(v.iter()).map(|(a, b)| a * b).sum();
        let cosine = dot / (norm(s.as_slice().unwrap()) * norm(v.as_slice().unwrap()));
        assert_abs_diff_eq!(cosine, 1.0, epsilon = 1e-5);
    }

    #[test]
    fn test_squash_zero_is_finite() {
        let zeros = Array3::<f32>::zeros((2, 3, 4));
        let squashed = squash(&zeros);

        assert!(squashed.iter().all(|v| v.is_finite()));
        assert!(squashed.iter().all(|&v| v == 0.0));
    }

    #[test]
    fn test_capsule_lengths() {
        let caps = array![[[3.0f32, 4.0], [0.0, 0.0]]];
        let lengths = capsule_lengths(&caps.view());

        assert_eq!(lengths.dim(), (1, 2));
        assert_abs_diff_eq!(lengths[[0, 0]], 5.0, epsilon = 1e-5);
        assert!(lengths[[0, 1]] > 0.0 && lengths[[0, 1]] < 1e-3);
    }

    #[test]
    fn test_conv_output_dimensions() {
        let mut rng = StdRng::seed_from_u64(3);
        let conv = ConvLayer::new(1, 4, 3, 2, 1, Activation::ReLU, &mut rng).unwrap();
        let input = Array4::ones((2, 7, 7, 1));

        let output = conv.forward(&input.view()).unwrap();
        assert_eq!(output.dim(), (2, 4, 4, 4));
        assert!(output.iter().all(|&v| v >= 0.0));
    }

    #[test]
    fn test_conv_known_values() {
        // Noyau 2x2 de uns: somme des fenêtres
        let weights = Array4::ones((1, 2, 2, 1));
        let conv =
            ConvLayer::from_parts(weights, array![0.5], 1, 0, Activation::None).unwrap();
        let input = Array4::from_shape_vec(
            (1, 3, 3, 1),
            vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0, 8.0, 9.0],
        )
        .unwrap();

        let output = conv.forward(&input.view()).unwrap();
        assert_eq!(output.dim(), (1, 2, 2, 1));
        assert_abs_diff_eq!(output[[0, 0, 0, 0]], 12.5);
        assert_abs_diff_eq!(output[[0, 0, 1, 0]], 16.5);
        assert_abs_diff_eq!(output[[0, 1, 0, 0]], 24.5);
        assert_abs_diff_eq!(output[[0, 1, 1, 0]], 28.5);
    }

    #[test]
    fn test_conv_rejects_wrong_channels() {
        let mut rng = StdRng::seed_from_u64(3);
        let conv = ConvLayer::new(3, 4, 3, 1, 0, Activation::ReLU, &mut rng).unwrap();
        let input = Array4::ones((1, 5, 5, 1));

        assert!(conv.forward(&input.view()).is_err());
    }

    #[test]
    fn test_dense_forward() {
        let layer = DenseLayer::from_parts(
            "fc",
            array![[1.0, -1.0], [2.0, 0.5]],
            array![0.0, 1.0],
            Activation::ReLU,
        )
        .unwrap();

        let output = layer.forward(&array![[1.0, 1.0]].view()).unwrap();
        assert_abs_diff_eq!(output[[0, 0]], 3.0);
        assert_abs_diff_eq!(output[[0, 1]], 0.5);

        assert!(layer.forward(&array![[1.0, 1.0, 1.0]].view()).is_err());
    }
}
