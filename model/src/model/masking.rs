use ndarray::{Array1, Array2, Array3, ArrayView2, ArrayView3, Axis, Zip};

use super::error::{shape_mismatch, CapsNetError, Result};

/// Sélection de la capsule conservée pour chaque exemple
#[derive(Debug, Clone, Copy)]
pub enum MaskSelector<'a> {
    /// One-hot de vérité terrain `[batch, num_classes]` (entraînement)
    Labels(ArrayView2<'a, f32>),
    /// Longueurs des capsules `[batch, num_classes]`, converties en one-hot par argmax
    Lengths(ArrayView2<'a, f32>),
}

/// Indice du maximum de chaque ligne; le premier l'emporte en cas d'égalité
pub fn argmax_rows(values: &ArrayView2<f32>) -> Array1<usize> {
    values.map_axis(Axis(1), |row| {
        row.iter()
            .enumerate()
            .fold((0, f32::NEG_INFINITY), |(best, best_val), (i, &v)| {
                if v > best_val {
                    (i, v)
                } else {
                    (best, best_val)
                }
            })
            .0
    })
}

/// Étiquettes entières -> one-hot `[batch, num_classes]`
pub fn one_hot(labels: &[usize], num_classes: usize) -> Result<Array2<f32>> {
    let mut encoded = Array2::zeros((labels.len(), num_classes));
    for (index, &label) in labels.iter().enumerate() {
        if label >= num_classes {
            return Err(CapsNetError::InvalidLabel {
                index,
                label,
                num_classes,
            });
        }
        encoded[[index, label]] = 1.0;
    }
    Ok(encoded)
}

/// Met à zéro toutes les capsules sauf celle sélectionnée, puis aplatit
///
/// `[batch, num_classes, dim]` -> `[batch, num_classes·dim]`
pub fn mask_capsules(
    capsules: &ArrayView3<f32>,
    selector: MaskSelector<'_>,
) -> Result<Array2<f32>> {
    let (batch_size, num_classes, dim) = capsules.dim();

    let mask = match selector {
        MaskSelector::Labels(labels) => {
            check_selector_shape(&labels, (batch_size, num_classes))?;
            labels.to_owned()
        }
        MaskSelector::Lengths(lengths) => {
            check_selector_shape(&lengths, (batch_size, num_classes))?;
            let predicted = argmax_rows(&lengths);
            let mut mask = Array2::zeros((batch_size, num_classes));
            for (b, &class) in predicted.iter().enumerate() {
                mask[[b, class]] = 1.0;
            }
            mask
        }
    };

    let mut masked = Array3::zeros((batch_size, num_classes, dim));
    Zip::from(masked.lanes_mut(Axis(2)))
        .and(capsules.lanes(Axis(2)))
        .and(&mask)
        .for_each(|mut out, caps, &m| {
            if m != 0.0 {
                out.assign(&(&caps * m));
            }
        });

    Ok(masked.into_shape_with_order((batch_size, num_classes * dim))?)
}

fn check_selector_shape(selector: &ArrayView2<f32>, expected: (usize, usize)) -> Result<()> {
    if selector.dim() != expected {
        return Err(shape_mismatch("sélecteur du masque", expected, selector.dim()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{array, s};

    fn sample_capsules() -> Array3<f32> {
        array![
            [[1.0, 2.0], [3.0, 4.0], [0.1, 0.1]],
            [[5.0, 6.0], [7.0, 8.0], [9.0, 10.0]]
        ]
    }

    #[test]
    fn test_mask_with_labels_keeps_selected_capsule() {
        let capsules = sample_capsules();
        let labels = one_hot(&[2, 0], 3).unwrap();

        let masked = mask_capsules(&capsules.view(), MaskSelector::Labels(labels.view())).unwrap();
        assert_eq!(masked.dim(), (2, 6));

        // Exemple 0: seule la capsule 2 subsiste, même si elle est la plus courte
        assert_eq!(masked.row(0).to_vec(), vec![0.0, 0.0, 0.0, 0.0, 0.1, 0.1]);
        assert_eq!(masked.row(1).to_vec(), vec![5.0, 6.0, 0.0, 0.0, 0.0, 0.0]);
    }

    #[test]
    fn test_mask_with_lengths_uses_argmax() {
        let capsules = sample_capsules();
        let lengths = array![[0.2f32, 0.9, 0.1], [0.3, 0.3, 0.8]];

        let masked =
            mask_capsules(&capsules.view(), MaskSelector::Lengths(lengths.view())).unwrap();

        assert_eq!(masked.slice(s![0, 2..4]).to_vec(), vec![3.0, 4.0]);
        assert_eq!(masked.slice(s![1, 4..6]).to_vec(), vec![9.0, 10.0]);
        assert_eq!(masked.iter().filter(|&&v| v != 0.0).count(), 4);
    }

    #[test]
    fn test_mask_rejects_wrong_selector_shape() {
        let capsules = sample_capsules();
        let labels = one_hot(&[0, 1], 2).unwrap();
        assert!(mask_capsules(&capsules.view(), MaskSelector::Labels(labels.view())).is_err());
    }

    #[test]
    fn test_one_hot_rejects_out_of_range() {
        let err = one_hot(&[0, 10], 10).unwrap_err();
        assert!(matches!(
            err,
            CapsNetError::InvalidLabel {
                index: 1,
                label: 10,
                num_classes: 10
            }
        ));
    }

    #[test]
    fn test_argmax_first_on_ties() {
        let values = array![[0.5f32, 0.5, 0.1], [0.0, 0.0, 0.0]];
        assert_eq!(argmax_rows(&values.view()).to_vec(), vec![0, 0]);
    }
}
