use thiserror::Error;

pub type Result<T> = std::result::Result<T, CapsNetError>;

/// Erreurs du réseau de capsules
#[derive(Debug, Error)]
pub enum CapsNetError {
    #[error("configuration invalide: {0}")]
    Config(String),

    #[error("dimensions incompatibles pour {what}: attendu {expected}, obtenu {actual}")]
    ShapeMismatch {
        what: String,
        expected: String,
        actual: String,
    },

    #[error("les étiquettes sont requises en mode {0:?}")]
    MissingLabels(crate::model::core::Mode),

    #[error("étiquette {label} hors de [0, {num_classes}) à l'index {index}")]
    InvalidLabel {
        index: usize,
        label: usize,
        num_classes: usize,
    },

    #[error("taille de batch incohérente: {images} images pour {labels} étiquettes")]
    BatchMismatch { images: usize, labels: usize },

    #[error("entrée invalide: {0}")]
    InvalidInput(String),

    #[error(transparent)]
    Shape(#[from] ndarray::ShapeError),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

pub(crate) fn config(msg: impl Into<String>) -> CapsNetError {
    CapsNetError::Config(msg.into())
}

pub(crate) fn shape_mismatch(
    what: impl Into<String>,
    expected: impl std::fmt::Debug,
    actual: impl std::fmt::Debug,
) -> CapsNetError {
    CapsNetError::ShapeMismatch {
        what: what.into(),
        expected: format!("{:?}", expected),
        actual: format!("{:?}", actual),
    }
}
