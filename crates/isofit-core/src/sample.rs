//! Intensity sampling along an elliptical path.
//!
//! A [`Sample`] walks its geometry's ellipse, integrating the image at each
//! polar position. Points without a valid pixel contribution are kept in
//! place with `intensity: None` so that indices stay aligned with the walk.
//! [`Sample::update`] then derives the mean intensity, the radial gradient
//! and its errors from a second walk slightly further out.

use std::f64::consts::TAU;

use ndarray::ArrayView2;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::consts::{
    DEFAULT_EPS, DEFAULT_PREVIOUS_GRADIENT, DEFAULT_SCLIP, FALLBACK_GRADIENT_FACTOR,
    GRADIENT_ACCEPT_FRACTION, MAX_PHI_STEP, MIN_AREA_INTEGRATOR_SECTOR, WALK_OVERSHOOT,
};
use crate::error::{IsofitError, Result};
use crate::geometry::Geometry;
use crate::harmonics::population_std;
use crate::integrator::IntegrationMode;

/// Iterative sigma clipping of sampled intensities.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct SigmaClip {
    /// Clipping threshold in standard deviations.
    #[serde(default = "default_sclip")]
    pub sclip: f64,
    /// Number of clipping passes; zero disables clipping.
    #[serde(default)]
    pub nclip: usize,
}

fn default_sclip() -> f64 {
    DEFAULT_SCLIP
}

impl Default for SigmaClip {
    fn default() -> Self {
        Self {
            sclip: DEFAULT_SCLIP,
            nclip: 0,
        }
    }
}

/// One position visited by the elliptical walk.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SamplePoint {
    /// Polar angle relative to the major axis, in `[0, 2pi)`.
    pub angle: f64,
    /// Elliptical radius at `angle`.
    pub radius: f64,
    /// Integrated intensity; `None` when masked.
    pub intensity: Option<f64>,
}

/// Quantities derived by [`Sample::update`].
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SampleStats {
    /// Mean of the valid intensities.
    pub mean: f64,
    /// Derivative of the mean intensity with respect to sma.
    pub gradient: f64,
    /// Absolute gradient error; `None` when the gradient is a fallback guess.
    pub gradient_error: Option<f64>,
    /// `gradient_error / |gradient|`, when a non-zero error exists.
    pub gradient_relative_error: Option<f64>,
    /// Mean pixel area represented by one sample point.
    pub sector_area: f64,
}

/// Valid samples unpacked into parallel arrays.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct SampleValues {
    pub angles: Vec<f64>,
    pub radii: Vec<f64>,
    pub intensities: Vec<f64>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum SampleKind {
    Elliptical,
    Central,
}

#[derive(Clone, Debug)]
struct Extraction {
    points: Vec<SamplePoint>,
    sector_area: f64,
}

/// Intensities sampled along one ellipse of a shared, read-only image.
#[derive(Clone, Debug)]
pub struct Sample<'a> {
    image: ArrayView2<'a, f32>,
    geometry: Geometry,
    mode: IntegrationMode,
    clip: SigmaClip,
    kind: SampleKind,
    extraction: Option<Extraction>,
    stats: Option<SampleStats>,
}

impl<'a> Sample<'a> {
    pub fn new(image: ArrayView2<'a, f32>, geometry: Geometry) -> Result<Self> {
        let (h, w) = image.dim();
        if h == 0 || w == 0 {
            return Err(IsofitError::InvalidImage(format!(
                "image shape {h}x{w} has no pixels"
            )));
        }
        Ok(Self {
            image,
            geometry,
            mode: IntegrationMode::default(),
            clip: SigmaClip::default(),
            kind: SampleKind::Elliptical,
            extraction: None,
            stats: None,
        })
    }

    /// Sample centred on the image with the default ellipticity and a zero
    /// position angle.
    pub fn at_image_center(image: ArrayView2<'a, f32>, sma: f64) -> Result<Self> {
        let (h, w) = image.dim();
        let geometry = Geometry::new(w as f64 / 2.0, h as f64 / 2.0, sma, DEFAULT_EPS, 0.0)?;
        Self::new(image, geometry)
    }

    /// Degenerate single-point sample at the geometry's center.
    pub fn central(image: ArrayView2<'a, f32>, geometry: Geometry) -> Result<Self> {
        let geometry = geometry.with_sma(0.0)?;
        Ok(Self {
            kind: SampleKind::Central,
            ..Self::new(image, geometry)?
        })
    }

    pub fn with_integration_mode(self, mode: IntegrationMode) -> Self {
        Self {
            mode,
            extraction: None,
            stats: None,
            ..self
        }
    }

    pub fn with_sigma_clip(self, clip: SigmaClip) -> Self {
        Self {
            clip,
            extraction: None,
            stats: None,
            ..self
        }
    }

    /// A fresh, not yet extracted sample of the same image and settings.
    pub fn with_geometry(&self, geometry: Geometry) -> Self {
        Self {
            image: self.image,
            geometry,
            mode: self.mode,
            clip: self.clip,
            kind: self.kind,
            extraction: None,
            stats: None,
        }
    }

    /// The same sample reduced to its center pixel.
    pub fn into_central(self) -> Self {
        if self.is_central() {
            return self;
        }
        let geometry = self.geometry.with_sma(0.0).unwrap_or(self.geometry);
        Self {
            kind: SampleKind::Central,
            ..self.with_geometry(geometry)
        }
    }

    pub fn image(&self) -> ArrayView2<'a, f32> {
        self.image
    }

    pub fn geometry(&self) -> &Geometry {
        &self.geometry
    }

    pub fn integration_mode(&self) -> IntegrationMode {
        self.mode
    }

    pub fn sigma_clip(&self) -> SigmaClip {
        self.clip
    }

    pub fn is_central(&self) -> bool {
        self.kind == SampleKind::Central
    }

    /// Statistics computed by the last [`Sample::update`].
    pub fn stats(&self) -> Option<&SampleStats> {
        self.stats.as_ref()
    }

    /// All walked points, masked ones included. Empty before extraction.
    pub fn points(&self) -> &[SamplePoint] {
        match &self.extraction {
            Some(extraction) => &extraction.points,
            None => &[],
        }
    }

    /// Number of positions attempted by the walk.
    pub fn total_points(&self) -> usize {
        self.points().len()
    }

    /// Number of positions that produced a valid intensity.
    pub fn actual_points(&self) -> usize {
        self.points().iter().filter(|p| p.intensity.is_some()).count()
    }

    /// Valid samples, in walk order.
    pub fn values(&self) -> SampleValues {
        let mut values = SampleValues::default();
        for point in self.points() {
            if let Some(intensity) = point.intensity {
                values.angles.push(point.angle);
                values.radii.push(point.radius);
                values.intensities.push(intensity);
            }
        }
        values
    }

    /// Image coordinates of the valid samples.
    pub fn coordinates(&self) -> Vec<(f64, f64)> {
        self.points()
            .iter()
            .filter(|p| p.intensity.is_some())
            .map(|p| self.geometry.to_cartesian(p.radius, p.angle))
            .collect()
    }

    /// Walk the ellipse unless that already happened.
    pub fn extract(mut self) -> Self {
        if self.extraction.is_none() {
            self.extraction = Some(match self.kind {
                SampleKind::Elliptical => self.walk(),
                SampleKind::Central => self.center_point(),
            });
        }
        self
    }

    /// Extract (if needed) and compute mean, gradient and sector area.
    ///
    /// Updating an already updated sample reuses its extraction and seeds
    /// the gradient search with the previous gradient.
    pub fn update(self) -> Self {
        let previous_gradient = self.stats.map(|s| s.gradient);
        let mut sample = self.extract();
        let stats = match sample.kind {
            SampleKind::Central => sample.central_stats(),
            SampleKind::Elliptical => sample.elliptical_stats(previous_gradient),
        };
        debug!(
            sma = sample.geometry.sma(),
            mean = stats.mean,
            gradient = stats.gradient,
            ndata = sample.actual_points(),
            "Sample updated"
        );
        sample.stats = Some(stats);
        sample
    }

    fn walk(&self) -> Extraction {
        let geometry = &self.geometry;
        let sign = geometry.direction().sign();
        let mut integrator = self.mode.integrator();
        let mut width = geometry.sector_angular_width();
        let mut phi = geometry.initial_polar_angle();
        let mut radius = geometry.initial_polar_radius();

        // Area integrators misbehave on tiny sectors.
        if integrator.is_area() {
            let probe = integrator.integrate(self.image, geometry, radius, sign * phi, width);
            if probe.sector_area < MIN_AREA_INTEGRATOR_SECTOR {
                debug!(
                    sma = geometry.sma(),
                    area = probe.sector_area,
                    "Sector too small, using bilinear integration"
                );
                integrator = IntegrationMode::Bilinear.integrator();
            } else {
                width = probe.phi_step;
            }
        }

        let mut points = Vec::new();
        let mut area_sum = 0.0;
        while phi <= TAU + WALK_OVERSHOOT {
            let angle = sign * phi;
            let integration = integrator.integrate(self.image, geometry, radius, angle, width);
            points.push(SamplePoint {
                angle: angle.rem_euclid(TAU),
                radius,
                intensity: integration.value,
            });
            area_sum += integration.sector_area;

            let step = integration.phi_step.min(MAX_PHI_STEP);
            if step.is_nan() || step <= 0.0 {
                break;
            }
            width = integration.phi_step;
            phi += step;
            radius = geometry.radius(sign * phi);
        }

        if self.clip.nclip > 0 {
            sigma_clip(&mut points, self.clip);
        }

        let sector_area = if points.is_empty() {
            0.0
        } else {
            area_sum / points.len() as f64
        };
        Extraction {
            points,
            sector_area,
        }
    }

    fn center_point(&self) -> Extraction {
        let (x0, y0) = (self.geometry.x0(), self.geometry.y0());
        Extraction {
            points: vec![SamplePoint {
                angle: 0.0,
                radius: 0.0,
                intensity: self.mode.point_value(self.image, x0, y0),
            }],
            sector_area: 0.0,
        }
    }

    fn central_stats(&self) -> SampleStats {
        SampleStats {
            mean: self
                .points()
                .first()
                .and_then(|p| p.intensity)
                .unwrap_or(f64::NAN),
            gradient: 0.0,
            gradient_error: Some(0.0),
            gradient_relative_error: Some(0.0),
            sector_area: 0.0,
        }
    }

    fn elliptical_stats(&self, previous_gradient: Option<f64>) -> SampleStats {
        let intensities = self.values().intensities;
        let mean = mean(&intensities);
        let step = self.geometry.astep();

        let previous = previous_gradient
            .filter(|g| *g != 0.0 && g.is_finite())
            .unwrap_or(DEFAULT_PREVIOUS_GRADIENT);
        let limit = previous * GRADIENT_ACCEPT_FRACTION;
        // The gradient is negative for a well-behaved profile.
        let accept = |estimate: &Option<(f64, f64)>| matches!(estimate, Some((g, _)) if *g < limit);

        let mut estimate = self.gradient_estimate(mean, &intensities, step);
        if !accept(&estimate) {
            estimate = self.gradient_estimate(mean, &intensities, 2.0 * step);
        }
        let (gradient, gradient_error) = match estimate {
            Some((g, e)) if g < limit => (g, Some(e)),
            _ => (previous * FALLBACK_GRADIENT_FACTOR, None),
        };
        let gradient_relative_error = gradient_error
            .filter(|e| *e != 0.0)
            .map(|e| e / gradient.abs());

        SampleStats {
            mean,
            gradient,
            gradient_error,
            gradient_relative_error,
            sector_area: self.extraction.as_ref().map_or(0.0, |e| e.sector_area),
        }
    }

    /// Gradient and its error from a sample at `(1 + step) * sma`.
    fn gradient_estimate(&self, mean: f64, intensities: &[f64], step: f64) -> Option<(f64, f64)> {
        let sma = self.geometry.sma();
        let geometry = self.geometry.with_sma((1.0 + step) * sma).ok()?;
        let outer = self.with_geometry(geometry).extract();
        let outer_intensities = outer.values().intensities;
        if intensities.is_empty() || outer_intensities.is_empty() {
            return None;
        }

        let outer_mean = self::mean(&outer_intensities);
        let gradient = (outer_mean - mean) / sma / step;

        let sigma = population_std(intensities);
        let sigma_g = population_std(&outer_intensities);
        let error = (sigma * sigma / intensities.len() as f64
            + sigma_g * sigma_g / outer_intensities.len() as f64)
            .sqrt()
            / sma
            / step;
        Some((gradient, error))
    }
}

fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        return f64::NAN;
    }
    values.iter().sum::<f64>() / values.len() as f64
}

/// Mask points lying more than `sclip` standard deviations from the mean,
/// repeated `nclip` times.
fn sigma_clip(points: &mut [SamplePoint], clip: SigmaClip) {
    for _ in 0..clip.nclip {
        let values: Vec<f64> = points.iter().filter_map(|p| p.intensity).collect();
        if values.is_empty() {
            return;
        }
        let center = mean(&values);
        let sigma = population_std(&values);
        let lower = center - clip.sclip * sigma;
        let upper = center + clip.sclip * sigma;
        for point in points.iter_mut() {
            if matches!(point.intensity, Some(v) if v < lower || v > upper) {
                point.intensity = None;
            }
        }
    }
}
