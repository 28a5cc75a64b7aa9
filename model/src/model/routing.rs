use ndarray::{s, Array2, Array3, ArrayView2, ArrayView3, ArrayView4, Axis, Zip};
use rayon::prelude::*;
use tracing::{debug, trace};

use super::error::{config, Result};
use super::layers::squash;

/// Routage dynamique par agreement
///
/// Les logits `b` et les coefficients `c` sont locaux à chaque appel: rien
/// n'est conservé d'un batch à l'autre.
#[derive(Debug, Clone)]
pub struct DynamicRouting {
    pub num_iterations: usize,
}

/// Sorties du routage avec les coefficients de couplage de chaque itération
#[derive(Debug, Clone)]
pub struct RoutingTrace {
    /// `[batch, num_higher, higher_dim]`
    pub outputs: Array3<f32>,
    /// Un tableau `[batch, num_lower, num_higher]` par itération
    pub coupling: Vec<Array3<f32>>,
}

impl DynamicRouting {
    pub fn new(num_iterations: usize) -> Result<Self> {
        if num_iterations < 1 {
            return Err(config("le routage demande au moins une itération"));
        }
        Ok(Self { num_iterations })
    }

    /// `predictions`: votes `[batch, num_lower, num_higher, higher_dim]`
    pub fn route(&self, predictions: &ArrayView4<f32>) -> Array3<f32> {
        self.route_with_coeffs(predictions).outputs
    }

    /// Routage avec retour des coefficients de couplage, parallélisé par exemple
    pub fn route_with_coeffs(&self, predictions: &ArrayView4<f32>) -> RoutingTrace {
        let (batch_size, num_lower, num_higher, dim) = predictions.dim();

        let per_example: Vec<(Array2<f32>, Vec<Array2<f32>>)> = predictions
            .axis_iter(Axis(0))
            .into_par_iter()
            .map(|votes| self.route_example(&votes))
            .collect();

        let mut outputs = Array3::zeros((batch_size, num_higher, dim));
        let mut coupling =
            vec![Array3::zeros((batch_size, num_lower, num_higher)); self.num_iterations];

        for (b, (v, rounds)) in per_example.into_iter().enumerate() {
            outputs.index_axis_mut(Axis(0), b).assign(&v);
            for (round, c) in rounds.iter().enumerate() {
                coupling[round].index_axis_mut(Axis(0), b).assign(c);
            }
        }

        debug!(
            batch_size,
            num_lower,
            num_higher,
            iterations = self.num_iterations,
            "routage terminé"
        );

        RoutingTrace { outputs, coupling }
    }

    /// Routage d'un seul exemple: `votes` est `[num_lower, num_higher, dim]`
    fn route_example(&self, votes: &ArrayView3<f32>) -> (Array2<f32>, Vec<Array2<f32>>) {
        let (num_lower, num_higher, dim) = votes.dim();

        // Prior uniforme: b_ij = 0
        let mut logits = Array2::<f32>::zeros((num_lower, num_higher));
        let mut rounds = Vec::with_capacity(self.num_iterations);
        let mut outputs = Array2::zeros((num_higher, dim));

        for iteration in 0..self.num_iterations {
            // c_ij = softmax_j(b_i)
            let coupling = softmax_rows(&logits.view());

            // s_j = Σ_i c_ij * û_j|i
            let weighted = weighted_sum(votes, &coupling.view());

            // v_j = squash(s_j)
            outputs = squash(&weighted);

            // Pas de mise à jour après la dernière itération
            if iteration + 1 < self.num_iterations {
                update_logits(votes, &outputs.view(), &mut logits);
            }

            trace!(
                iteration,
                max_coupling = coupling.iter().cloned().fold(0.0f32, f32::max),
                "itération de routage"
            );
            rounds.push(coupling);
        }

        (outputs, rounds)
    }
}

/// Softmax de chaque ligne (axe des capsules supérieures pendant le routage)
pub(crate) fn softmax_rows(logits: &ArrayView2<f32>) -> Array2<f32> {
    let mut result = logits.to_owned();

    for mut row in result.outer_iter_mut() {
        // Stabilité numérique
        let max_val = row.iter().cloned().fold(f32::NEG_INFINITY, f32::max);
        row.mapv_inplace(|x| (x - max_val).exp());
        let sum = row.sum();
        row /= sum;
    }

    result
}

fn weighted_sum(votes: &ArrayView3<f32>, coupling: &ArrayView2<f32>) -> Array2<f32> {
    let (_, num_higher, dim) = votes.dim();
    let mut sums = Array2::zeros((num_higher, dim));

    for (i, votes_i) in votes.outer_iter().enumerate() {
        for (j, mut s_j) in sums.outer_iter_mut().enumerate() {
            s_j.scaled_add(coupling[[i, j]], &votes_i.row(j));
        }
    }

    sums
}

/// b_ij += û_j|i · v_j
fn update_logits(votes: &ArrayView3<f32>, outputs: &ArrayView2<f32>, logits: &mut Array2<f32>) {
    Zip::indexed(logits).for_each(|(i, j), b| {
        *b += votes.slice(s![i, j, ..]).dot(&outputs.row(j));
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::Array4;
    use ndarray_rand::rand_distr::Normal;
    use ndarray_rand::RandomExt;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn random_votes(shape: (usize, usize, usize, usize)) -> Array4<f32> {
        let mut rng = StdRng::seed_from_u64(42);
        Array4::random_using(shape, Normal::new(0.0f32, 0.5).unwrap(), &mut rng)
    }

    #[test]
    fn test_routing_dimensions() {
        let routing = DynamicRouting::new(3).unwrap();
        let predictions = Array4::ones((2, 36, 10, 16));

        let output = routing.route(&predictions.view());

        assert_eq!(output.dim(), (2, 10, 16));
    }

    #[test]
    fn test_zero_iterations_rejected() {
        assert!(DynamicRouting::new(0).is_err());
    }

    #[test]
    fn test_coupling_sums_to_one_every_round() {
        let routing = DynamicRouting::new(3).unwrap();
        let predictions = random_votes((2, 12, 5, 4));

        let trace = routing.route_with_coeffs(&predictions.view());
        assert_eq!(trace.coupling.len(), 3);

        for coupling in &trace.coupling {
            for b in 0..2 {
                for i in 0..12 {
                    let sum: f32 = coupling.slice(s![b, i, ..]).sum();
                    assert_abs_diff_eq!(sum, 1.0, epsilon = 1e-5);
                }
            }
        }
    }

    #[test]
    fn test_single_iteration_is_uniform_average() {
        let routing = DynamicRouting::new(1).unwrap();
        let predictions = random_votes((1, 4, 3, 2));

        let trace = routing.route_with_coeffs(&predictions.view());
        assert!(trace.coupling[0].iter().all(|&c| (c - 1.0 / 3.0).abs() < 1e-6));

        // v_j = squash(Σ_i û_ij / 3)
        let expected = squash(&(predictions.sum_axis(Axis(1)) / 3.0));
        for (a, b) in trace.outputs.iter().zip(expected.iter()) {
            assert_abs_diff_eq!(a, b, epsilon = 1e-6);
        }
    }

    #[test]
    fn test_agreement_increases_dominant_coupling() {
        // Capsule supérieure 0: tous les votes concordent.
        // Capsule supérieure 1: votes contradictoires.
        let mut predictions = Array4::zeros((1, 3, 2, 2));
        for i in 0..3 {
            predictions[[0, i, 0, 0]] = 1.0;
        }
        predictions[[0, 0, 1, 0]] = 1.0;
        predictions[[0, 1, 1, 0]] = -1.0;
        predictions[[0, 2, 1, 1]] = 1.0;

        let routing = DynamicRouting::new(3).unwrap();
        let trace = routing.route_with_coeffs(&predictions.view());

        let first = &trace.coupling[0];
        let last = &trace.coupling[2];
        for i in 0..3 {
            assert_abs_diff_eq!(first[[0, i, 0]], 0.5, epsilon = 1e-6);
            assert!(
                last[[0, i, 0]] > first[[0, i, 0]],
                "couplage {} n'a pas augmenté: {}",
                i,
                last[[0, i, 0]]
            );
        }
    }

    #[test]
    fn test_routing_is_deterministic() {
        let routing = DynamicRouting::new(2).unwrap();
        let predictions = random_votes((3, 8, 4, 6));

        let a = routing.route(&predictions.view());
        let b = routing.route(&predictions.view());
        assert_eq!(a, b);
    }

    #[test]
    fn test_softmax_rows_sum_to_one() {
        let logits = ndarray::array![[1.0f32, 2.0, 3.0], [100.0, 100.0, -100.0]];
        let coeffs = softmax_rows(&logits.view());

        for row in coeffs.outer_iter() {
            assert_abs_diff_eq!(row.sum(), 1.0, epsilon = 1e-6);
        }
        assert_abs_diff_eq!(coeffs[[1, 0]], 0.5, epsilon = 1e-6);
    }
}
