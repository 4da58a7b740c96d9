//! Pixel integration strategies.
//!
//! An integrator turns a polar position on an ellipse into one intensity
//! value. Positions whose pixels fall outside the image produce `None`
//! instead of a value so callers can mask them.

use std::f64::consts::{PI, TAU};

use ndarray::ArrayView2;
use serde::{Deserialize, Serialize};

use crate::consts::{BILINEAR_SECTOR_AREA, MIN_AREA_INTEGRATOR_PIXELS, NEAREST_SECTOR_AREA};
use crate::geometry::{ellipse_radius, Geometry};

/// Integration mode selected by the caller of a sample.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IntegrationMode {
    NearestNeighbor,
    #[default]
    Bilinear,
    Mean,
    Median,
}

impl IntegrationMode {
    /// The strategy implementing this mode.
    pub fn integrator(self) -> &'static dyn Integrator {
        match self {
            IntegrationMode::NearestNeighbor => &NearestNeighborIntegrator,
            IntegrationMode::Bilinear => &BilinearIntegrator,
            IntegrationMode::Mean => &MEAN_INTEGRATOR,
            IntegrationMode::Median => &MEDIAN_INTEGRATOR,
        }
    }

    /// Value at a single image position, used where no sector exists.
    pub fn point_value(self, image: ArrayView2<'_, f32>, x: f64, y: f64) -> Option<f64> {
        match self {
            IntegrationMode::NearestNeighbor => nearest_at(image, x, y),
            _ => bilinear_at(image, x, y),
        }
    }
}

impl std::fmt::Display for IntegrationMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            IntegrationMode::NearestNeighbor => write!(f, "Nearest Neighbor"),
            IntegrationMode::Bilinear => write!(f, "Bilinear"),
            IntegrationMode::Mean => write!(f, "Mean"),
            IntegrationMode::Median => write!(f, "Median"),
        }
    }
}

/// Result of integrating at one position along an ellipse.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Integration {
    /// Integrated intensity, `None` when no valid pixel contributed.
    pub value: Option<f64>,
    /// Polar-angle step to the next position.
    pub phi_step: f64,
    /// Pixel area represented by this position.
    pub sector_area: f64,
}

/// Shared "integrate at point" capability.
pub trait Integrator: Sync {
    /// Integrate at polar position `(radius, phi)` of `geometry`.
    ///
    /// `sector_width` is the angular width of the current sector; pointwise
    /// integrators ignore it.
    fn integrate(
        &self,
        image: ArrayView2<'_, f32>,
        geometry: &Geometry,
        radius: f64,
        phi: f64,
        sector_width: f64,
    ) -> Integration;

    /// Whether the integrator averages over a sector area.
    fn is_area(&self) -> bool;
}

/// Value of the pixel nearest to `(x, y)`.
pub fn nearest_at(image: ArrayView2<'_, f32>, x: f64, y: f64) -> Option<f64> {
    let (h, w) = image.dim();
    let col = x.round();
    let row = y.round();
    if !(col >= 0.0 && row >= 0.0 && col < w as f64 && row < h as f64) {
        return None;
    }
    Some(image[[row as usize, col as usize]] as f64)
}

/// Bilinear interpolation at `(x, y)`; `None` when any of the four
/// contributing pixels lies outside the image.
pub fn bilinear_at(image: ArrayView2<'_, f32>, x: f64, y: f64) -> Option<f64> {
    let (h, w) = image.dim();
    let col = x.floor();
    let row = y.floor();
    if !(col >= 0.0 && row >= 0.0 && col < w as f64 - 1.0 && row < h as f64 - 1.0) {
        return None;
    }
    let (c, r) = (col as usize, row as usize);
    let fx = x - col;
    let fy = y - row;
    let qx = 1.0 - fx;
    let qy = 1.0 - fy;

    let v00 = image[[r, c]] as f64;
    let v10 = image[[r + 1, c]] as f64;
    let v01 = image[[r, c + 1]] as f64;
    let v11 = image[[r + 1, c + 1]] as f64;

    Some(v00 * qx * qy + v10 * qx * fy + v01 * fx * qy + v11 * fx * fy)
}

#[derive(Clone, Copy, Debug)]
pub struct NearestNeighborIntegrator;

impl Integrator for NearestNeighborIntegrator {
    fn integrate(
        &self,
        image: ArrayView2<'_, f32>,
        geometry: &Geometry,
        radius: f64,
        phi: f64,
        _sector_width: f64,
    ) -> Integration {
        let (x, y) = geometry.to_cartesian(radius, phi);
        Integration {
            value: nearest_at(image, x, y),
            phi_step: 1.0 / radius,
            sector_area: NEAREST_SECTOR_AREA,
        }
    }

    fn is_area(&self) -> bool {
        false
    }
}

#[derive(Clone, Copy, Debug)]
pub struct BilinearIntegrator;

impl Integrator for BilinearIntegrator {
    fn integrate(
        &self,
        image: ArrayView2<'_, f32>,
        geometry: &Geometry,
        radius: f64,
        phi: f64,
        _sector_width: f64,
    ) -> Integration {
        let (x, y) = geometry.to_cartesian(radius, phi);
        Integration {
            value: bilinear_at(image, x, y),
            phi_step: 1.0 / radius,
            sector_area: BILINEAR_SECTOR_AREA,
        }
    }

    fn is_area(&self) -> bool {
        false
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Reducer {
    Mean,
    Median,
}

impl Reducer {
    fn reduce(self, values: &mut [f64]) -> f64 {
        match self {
            Reducer::Mean => values.iter().sum::<f64>() / values.len() as f64,
            Reducer::Median => median(values),
        }
    }
}

static MEAN_INTEGRATOR: AreaIntegrator = AreaIntegrator {
    reducer: Reducer::Mean,
};

static MEDIAN_INTEGRATOR: AreaIntegrator = AreaIntegrator {
    reducer: Reducer::Median,
};

/// Integrates every pixel whose center falls inside the elliptical sector.
#[derive(Clone, Copy, Debug)]
pub struct AreaIntegrator {
    reducer: Reducer,
}

impl Integrator for AreaIntegrator {
    fn integrate(
        &self,
        image: ArrayView2<'_, f32>,
        geometry: &Geometry,
        radius: f64,
        phi: f64,
        sector_width: f64,
    ) -> Integration {
        let (h, w) = image.dim();
        let sector = geometry.sector(phi, sector_width);
        let (sma1, sma2) = geometry.bounding_ellipses();

        let (min_x, max_x) = min_max(&sector.vertices_x);
        let (min_y, max_y) = min_max(&sector.vertices_y);
        let i1 = (min_x.floor() as i64 - 1).max(0);
        let j1 = (min_y.floor() as i64 - 1).max(0);
        let i2 = (max_x.floor() as i64 + 1).min(w as i64 - 1);
        let j2 = (max_y.floor() as i64 + 1).min(h as i64 - 1);

        let half_width = sector_width / 2.0;
        let mut values = Vec::new();
        for j in j1..j2 {
            for i in i1..i2 {
                let (r, angle) = geometry.to_polar(i as f64, j as f64);
                let mut offset = (angle - phi).rem_euclid(TAU);
                if offset >= PI {
                    offset -= TAU;
                }
                if offset < -half_width || offset >= half_width {
                    continue;
                }
                let r_inner = ellipse_radius(sma1, geometry.eps(), angle);
                let r_outer = ellipse_radius(sma2, geometry.eps(), angle);
                if r >= r_inner && r < r_outer {
                    values.push(image[[j as usize, i as usize]] as f64);
                }
            }
        }

        let value = if values.len() < MIN_AREA_INTEGRATOR_PIXELS {
            let (x, y) = geometry.to_cartesian(radius, phi);
            bilinear_at(image, x, y)
        } else {
            Some(self.reducer.reduce(&mut values))
        };

        Integration {
            value,
            phi_step: sector.next_width,
            sector_area: sector.area,
        }
    }

    fn is_area(&self) -> bool {
        true
    }
}

fn min_max(values: &[f64; 4]) -> (f64, f64) {
    values
        .iter()
        .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), &v| {
            (lo.min(v), hi.max(v))
        })
}

fn median(values: &mut [f64]) -> f64 {
    let n = values.len();
    let mid = n / 2;
    values.select_nth_unstable_by(mid, |a, b| a.total_cmp(b));
    if n % 2 == 1 {
        values[mid]
    } else {
        let upper = values[mid];
        let lower = values[..mid]
            .iter()
            .copied()
            .fold(f64::NEG_INFINITY, f64::max);
        (lower + upper) / 2.0
    }
}
