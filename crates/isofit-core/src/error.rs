use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum IsofitError {
    #[error("Invalid image: {0}")]
    InvalidImage(String),

    #[error("Invalid geometry: {0}")]
    InvalidGeometry(String),

    #[error("Invalid fitter configuration: {0}")]
    InvalidConfig(String),

    #[error("Harmonic fit is underdetermined: need {needed} valid points, got {got}")]
    Underdetermined { needed: usize, got: usize },

    #[error("Singular normal matrix in harmonic fit")]
    SingularMatrix,

    #[error("Angle and intensity arrays differ in length: {angles} vs {intensities}")]
    LengthMismatch { angles: usize, intensities: usize },
}

pub type Result<T> = std::result::Result<T, IsofitError>;
