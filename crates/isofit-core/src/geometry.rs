//! Ellipse geometry used to sample an image along an isophote.
//!
//! A [`Geometry`] is a value object: every change produces a new instance
//! with its derived sector quantities recomputed. Angles are polar angles
//! measured counter-clockwise from the major axis; the position angle is
//! measured counter-clockwise from the image x axis.

use std::f64::consts::{PI, TAU};

use ndarray::ArrayView2;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::consts::{
    CENTERER_INNER_RADIUS, CENTERER_MASK_HALF_SIZE, CENTERER_OUTER_RADIUS,
    CENTERER_WINDOW_HALF_SIZE, DEFAULT_ASTEP, MAX_INNER_SECTOR_WIDTH, PHI_MAX, PHI_MIN,
};
use crate::error::{IsofitError, Result};

/// How the semi-major axis grows between consecutive ellipses.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepPolicy {
    /// `sma` changes by `astep` pixels.
    Linear,
    /// `sma` changes by the fraction `astep` of itself.
    #[default]
    Geometric,
}

/// Direction in which the elliptical path is walked.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    #[default]
    CounterClockwise,
    Clockwise,
}

impl Direction {
    pub fn sign(self) -> f64 {
        match self {
            Direction::CounterClockwise => 1.0,
            Direction::Clockwise => -1.0,
        }
    }
}

/// One elliptical sector between the two bounding ellipses.
#[derive(Clone, Copy, Debug)]
pub struct Sector {
    /// Polar angle of the leading side.
    pub phi1: f64,
    /// Polar angle of the trailing side.
    pub phi2: f64,
    /// Vertex x coordinates, counter-clockwise from the inner leading corner.
    pub vertices_x: [f64; 4],
    /// Vertex y coordinates, same order as `vertices_x`.
    pub vertices_y: [f64; 4],
    /// Sector area in pixels.
    pub area: f64,
    /// Angular width that keeps the next sector at roughly the same area.
    pub next_width: f64,
}

/// Ellipse center, shape, orientation and sampling parameters.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Geometry {
    x0: f64,
    y0: f64,
    sma: f64,
    eps: f64,
    pa: f64,
    astep: f64,
    step_policy: StepPolicy,
    direction: Direction,
    area_factor: f64,
    sector_angular_width: f64,
    initial_polar_angle: f64,
    initial_polar_radius: f64,
}

impl Geometry {
    /// Build a geometry with default sampling (geometric growth, `astep` 0.1,
    /// counter-clockwise walk).
    pub fn new(x0: f64, y0: f64, sma: f64, eps: f64, pa: f64) -> Result<Self> {
        Self::build(
            x0,
            y0,
            sma,
            eps,
            pa,
            DEFAULT_ASTEP,
            StepPolicy::default(),
            Direction::default(),
        )
    }

    #[allow(clippy::too_many_arguments)]
    fn build(
        x0: f64,
        y0: f64,
        sma: f64,
        eps: f64,
        pa: f64,
        astep: f64,
        step_policy: StepPolicy,
        direction: Direction,
    ) -> Result<Self> {
        if !x0.is_finite() || !y0.is_finite() {
            return Err(IsofitError::InvalidGeometry(format!(
                "center ({x0}, {y0}) is not finite"
            )));
        }
        if !sma.is_finite() || sma < 0.0 {
            return Err(IsofitError::InvalidGeometry(format!(
                "semi-major axis {sma} must be finite and non-negative"
            )));
        }
        if !eps.is_finite() || !(0.0..1.0).contains(&eps) {
            return Err(IsofitError::InvalidGeometry(format!(
                "ellipticity {eps} must lie in [0, 1)"
            )));
        }
        if !pa.is_finite() {
            return Err(IsofitError::InvalidGeometry(format!(
                "position angle {pa} is not finite"
            )));
        }
        if !astep.is_finite() || astep <= 0.0 {
            return Err(IsofitError::InvalidGeometry(format!(
                "radial step {astep} must be positive"
            )));
        }
        if step_policy == StepPolicy::Geometric && astep >= 2.0 {
            return Err(IsofitError::InvalidGeometry(format!(
                "geometric radial step {astep} must be below 2"
            )));
        }

        let mut geometry = Self {
            x0,
            y0,
            sma,
            eps,
            pa,
            astep,
            step_policy,
            direction,
            area_factor: 0.0,
            sector_angular_width: 0.0,
            initial_polar_angle: 0.0,
            initial_polar_radius: 0.0,
        };

        let (sma1, sma2) = geometry.bounding_ellipses();
        let inner_sma = (sma2 - sma1).min(MAX_INNER_SECTOR_WIDTH);
        geometry.area_factor = (sma2 - sma1) * inner_sma;

        // A central geometry has no sectors.
        if sma > 0.0 {
            geometry.sector_angular_width = (inner_sma / sma).clamp(PHI_MIN, PHI_MAX);
            geometry.initial_polar_angle = geometry.sector_angular_width / 2.0;
            geometry.initial_polar_radius = geometry.radius(geometry.initial_polar_angle);
        }

        Ok(geometry)
    }

    fn rebuild(&self) -> Result<Self> {
        Self::build(
            self.x0,
            self.y0,
            self.sma,
            self.eps,
            self.pa,
            self.astep,
            self.step_policy,
            self.direction,
        )
    }

    /// Same ellipse with different radial sampling.
    pub fn with_sampling(&self, astep: f64, step_policy: StepPolicy) -> Result<Self> {
        Self {
            astep,
            step_policy,
            ..*self
        }
        .rebuild()
    }

    pub fn with_direction(&self, direction: Direction) -> Self {
        Self { direction, ..*self }
    }

    pub fn with_center(&self, x0: f64, y0: f64) -> Result<Self> {
        Self { x0, y0, ..*self }.rebuild()
    }

    pub fn with_sma(&self, sma: f64) -> Result<Self> {
        Self { sma, ..*self }.rebuild()
    }

    pub fn with_eps(&self, eps: f64) -> Result<Self> {
        Self { eps, ..*self }.rebuild()
    }

    pub fn with_pa(&self, pa: f64) -> Result<Self> {
        Self { pa, ..*self }.rebuild()
    }

    pub fn x0(&self) -> f64 {
        self.x0
    }

    pub fn y0(&self) -> f64 {
        self.y0
    }

    pub fn sma(&self) -> f64 {
        self.sma
    }

    pub fn eps(&self) -> f64 {
        self.eps
    }

    pub fn pa(&self) -> f64 {
        self.pa
    }

    pub fn astep(&self) -> f64 {
        self.astep
    }

    pub fn step_policy(&self) -> StepPolicy {
        self.step_policy
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    /// Angular width of the first sector of a walk.
    pub fn sector_angular_width(&self) -> f64 {
        self.sector_angular_width
    }

    /// Polar angle at which a walk starts.
    pub fn initial_polar_angle(&self) -> f64 {
        self.initial_polar_angle
    }

    /// Elliptical radius at the initial polar angle.
    pub fn initial_polar_radius(&self) -> f64 {
        self.initial_polar_radius
    }

    /// Distance from the center to the ellipse at polar angle `angle`.
    pub fn radius(&self, angle: f64) -> f64 {
        ellipse_radius(self.sma, self.eps, angle)
    }

    /// Image coordinates of the point at `(radius, angle)`.
    pub fn to_cartesian(&self, radius: f64, angle: f64) -> (f64, f64) {
        let theta = angle + self.pa;
        (
            radius * theta.cos() + self.x0,
            radius * theta.sin() + self.y0,
        )
    }

    /// Polar coordinates `(radius, angle)` of image position `(x, y)`, with
    /// the angle relative to the major axis in `[0, 2pi)`.
    pub fn to_polar(&self, x: f64, y: f64) -> (f64, f64) {
        let dx = x - self.x0;
        let dy = y - self.y0;
        let radius = dx.hypot(dy);
        let angle = (dy.atan2(dx) - self.pa).rem_euclid(TAU);
        (radius, angle)
    }

    /// Semi-major axes of the inner and outer ellipses bounding a sector.
    pub fn bounding_ellipses(&self) -> (f64, f64) {
        match self.step_policy {
            StepPolicy::Linear => (self.sma - self.astep / 2.0, self.sma + self.astep / 2.0),
            StepPolicy::Geometric => (
                self.sma * (1.0 - self.astep / 2.0),
                self.sma * (1.0 + self.astep / 2.0),
            ),
        }
    }

    /// Semi-major axis one step outwards (or inwards for a negative step).
    pub fn update_sma(&self, step: f64) -> f64 {
        match self.step_policy {
            StepPolicy::Linear => self.sma + step,
            StepPolicy::Geometric => self.sma * (1.0 + step),
        }
    }

    /// Reverse the growth direction: returns the semi-major axis one step
    /// back and the step to use from there on.
    pub fn reset_sma(&self, step: f64) -> (f64, f64) {
        match self.step_policy {
            StepPolicy::Linear => (self.sma - step, -step),
            StepPolicy::Geometric => {
                let aux = 1.0 / (1.0 + step);
                (self.sma * aux, aux - 1.0)
            }
        }
    }

    /// Elliptical sector of angular `width` centred on polar angle `phi`.
    pub fn sector(&self, phi: f64, width: f64) -> Sector {
        let (sma1, sma2) = self.bounding_ellipses();

        let phi1 = phi - width / 2.0;
        let phi2 = phi + width / 2.0;
        let r1 = ellipse_radius(sma1, self.eps, phi1);
        let r2 = ellipse_radius(sma2, self.eps, phi1);
        let r3 = ellipse_radius(sma2, self.eps, phi2);
        let r4 = ellipse_radius(sma1, self.eps, phi2);

        let sa1 = sector_sweep_area(sma1, self.eps, phi1, r1);
        let sa2 = sector_sweep_area(sma2, self.eps, phi1, r2);
        let sa3 = sector_sweep_area(sma2, self.eps, phi2, r3);
        let sa4 = sector_sweep_area(sma1, self.eps, phi2, r4);
        let area = ((sa3 - sa2) - (sa4 - sa1)).abs();

        let next_width = if r4 > 0.0 && r3 > r4 {
            (self.area_factor / (r3 - r4) / r4).clamp(PHI_MIN, PHI_MAX)
        } else {
            PHI_MAX
        };

        let (c1, s1) = ((phi1 + self.pa).cos(), (phi1 + self.pa).sin());
        let (c2, s2) = ((phi2 + self.pa).cos(), (phi2 + self.pa).sin());
        Sector {
            phi1,
            phi2,
            vertices_x: [
                r1 * c1 + self.x0,
                r2 * c1 + self.x0,
                r4 * c2 + self.x0,
                r3 * c2 + self.x0,
            ],
            vertices_y: [
                r1 * s1 + self.y0,
                r2 * s1 + self.y0,
                r4 * s2 + self.y0,
                r3 * s2 + self.y0,
            ],
            area,
            next_width,
        }
    }

    /// Refine the center by scanning a small window around `(x0, y0)`.
    ///
    /// Each candidate is scored by the contrast between an inner disk and an
    /// outer annulus. The center moves only when the best figure of merit
    /// exceeds `threshold`. A center outside the frame is first reset to the
    /// image center.
    pub fn find_center(&self, image: ArrayView2<'_, f32>, threshold: f64) -> Result<Self> {
        let (h, w) = image.dim();
        if h == 0 || w == 0 {
            return Err(IsofitError::InvalidImage("image has no pixels".into()));
        }

        let (start_x, start_y) =
            if self.x0 < 0.0 || self.x0 >= w as f64 || self.y0 < 0.0 || self.y0 >= h as f64 {
                (w as f64 / 2.0, h as f64 / 2.0)
            } else {
                (self.x0, self.y0)
            };

        let cx = start_x as i64;
        let cy = start_y as i64;
        let mut best: Option<(f64, i64, i64)> = None;

        for i in (cx - CENTERER_WINDOW_HALF_SIZE)..=(cx + CENTERER_WINDOW_HALF_SIZE) {
            for j in (cy - CENTERER_WINDOW_HALF_SIZE)..=(cy + CENTERER_WINDOW_HALF_SIZE) {
                if let Some(fom) = center_figure_of_merit(image, i, j) {
                    if best.map_or(true, |(b, _, _)| fom > b) {
                        best = Some((fom, i, j));
                    }
                }
            }
        }

        match best {
            Some((fom, i, j)) if fom > threshold => {
                debug!(x0 = i, y0 = j, fom, "Found center");
                self.with_center(i as f64, j as f64)
            }
            _ => {
                warn!(
                    threshold,
                    "Center figure of merit below threshold, keeping the input center"
                );
                self.with_center(start_x, start_y)
            }
        }
    }
}

pub(crate) fn ellipse_radius(sma: f64, eps: f64, angle: f64) -> f64 {
    let q = 1.0 - eps;
    sma * q / ((q * angle.cos()).powi(2) + angle.sin().powi(2)).sqrt()
}

/// Area swept by the ellipse of semi-major axis `sma` from the major axis to
/// the polar vector of length `r` at angle `phi`.
fn sector_sweep_area(sma: f64, eps: f64, phi: f64, r: f64) -> f64 {
    if sma <= 0.0 {
        return 0.0;
    }
    let aux = (r * phi.cos() / sma).clamp(-1.0, 1.0);
    (sma * sma * (1.0 - eps) / 2.0 * aux.acos()).abs()
}

/// Contrast of an inner disk against an outer annulus centred on `(i, j)`.
fn center_figure_of_merit(image: ArrayView2<'_, f32>, i: i64, j: i64) -> Option<f64> {
    let (h, w) = image.dim();
    let mut inner = Vec::new();
    let mut outer = Vec::new();

    for dj in -CENTERER_MASK_HALF_SIZE..=CENTERER_MASK_HALF_SIZE {
        for di in -CENTERER_MASK_HALF_SIZE..=CENTERER_MASK_HALF_SIZE {
            let (col, row) = (i + di, j + dj);
            if col < 0 || row < 0 || col >= w as i64 || row >= h as i64 {
                continue;
            }
            let distance = ((di * di + dj * dj) as f64).sqrt();
            let value = image[[row as usize, col as usize]] as f64;
            if distance <= CENTERER_INNER_RADIUS {
                inner.push(value);
            } else if distance >= CENTERER_OUTER_RADIUS
                && distance <= CENTERER_MASK_HALF_SIZE as f64
            {
                outer.push(value);
            }
        }
    }

    let (inner_mean, inner_std) = mean_std(&inner)?;
    let (outer_mean, outer_std) = mean_std(&outer)?;
    let stddev = inner_std.hypot(outer_std);
    if stddev <= 0.0 {
        return None;
    }
    Some((inner_mean - outer_mean) / stddev)
}

fn mean_std(values: &[f64]) -> Option<(f64, f64)> {
    if values.is_empty() {
        return None;
    }
    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    let var = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;
    Some((mean, var.sqrt()))
}

/// Fold a position angle into `[0, pi)`.
pub fn normalize_pa(pa: f64) -> f64 {
    pa.rem_euclid(PI)
}
