pub mod batch;
pub mod consts;
pub mod error;
pub mod fitter;
pub mod geometry;
pub mod harmonics;
pub mod integrator;
pub mod isophote;
pub mod sample;
pub mod testdata;

pub use error::{IsofitError, Result};
pub use fitter::{CentralFitter, Fitter, FitterConfig, StopCode};
pub use geometry::{Direction, Geometry, StepPolicy};
pub use integrator::IntegrationMode;
pub use isophote::Isophote;
pub use sample::{Sample, SigmaClip};
