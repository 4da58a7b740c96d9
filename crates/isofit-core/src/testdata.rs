//! Synthetic galaxy images with a known elliptical de Vaucouleurs profile.

use ndarray::Array2;
use rand::rngs::StdRng;
use rand::SeedableRng;
use rand_distr::{Distribution, Normal};
use serde::{Deserialize, Serialize};

use crate::consts::DE_VAUCOULEURS_B;
use crate::error::{IsofitError, Result};

/// Shape and profile of a synthetic image.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct TestImageParams {
    pub width: usize,
    pub height: usize,
    /// Galaxy center; `None` uses the image center.
    pub x0: Option<f64>,
    pub y0: Option<f64>,
    pub background: f64,
    /// Standard deviation of the additive Gaussian noise.
    pub noise: f64,
    /// Intensity above background at the effective radius.
    pub i0: f64,
    /// Effective radius along the major axis.
    pub sma: f64,
    pub eps: f64,
    pub pa: f64,
}

impl Default for TestImageParams {
    fn default() -> Self {
        Self {
            width: 512,
            height: 512,
            x0: None,
            y0: None,
            background: 100.0,
            noise: 1e-6,
            i0: 100.0,
            sma: 40.0,
            eps: 0.2,
            pa: 0.0,
        }
    }
}

impl TestImageParams {
    pub fn center(&self) -> (f64, f64) {
        (
            self.x0.unwrap_or(self.width as f64 / 2.0),
            self.y0.unwrap_or(self.height as f64 / 2.0),
        )
    }

    /// Noise-free profile value at pixel `(x, y)`.
    pub fn profile(&self, x: f64, y: f64) -> f64 {
        let (x0, y0) = self.center();
        let (dx, dy) = (x - x0, y - y0);
        let (sin_pa, cos_pa) = self.pa.sin_cos();
        let major = dx * cos_pa + dy * sin_pa;
        let minor = -dx * sin_pa + dy * cos_pa;
        let r = major.hypot(minor / (1.0 - self.eps));
        self.background + self.i0 * (-DE_VAUCOULEURS_B * ((r / self.sma).powf(0.25) - 1.0)).exp()
    }
}

/// Render the profile described by `params`, adding seeded Gaussian noise.
pub fn make_test_image(params: &TestImageParams, seed: u64) -> Result<Array2<f32>> {
    if params.width == 0 || params.height == 0 {
        return Err(IsofitError::InvalidImage(format!(
            "test image shape {}x{} has no pixels",
            params.height, params.width
        )));
    }
    if !(params.sma > 0.0) || !(0.0..1.0).contains(&params.eps) {
        return Err(IsofitError::InvalidGeometry(format!(
            "test profile needs sma > 0 and eps in [0, 1), got sma {} eps {}",
            params.sma, params.eps
        )));
    }

    let mut image = Array2::from_shape_fn((params.height, params.width), |(row, col)| {
        params.profile(col as f64, row as f64) as f32
    });

    if params.noise > 0.0 {
        let normal = Normal::new(0.0, params.noise)
            .map_err(|e| IsofitError::InvalidConfig(format!("noise: {e}")))?;
        let mut rng = StdRng::seed_from_u64(seed);
        image.mapv_inplace(|v| v + normal.sample(&mut rng) as f32);
    }
    Ok(image)
}
