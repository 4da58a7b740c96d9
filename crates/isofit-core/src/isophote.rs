//! Fitted isophote with derived photometry and error estimates.

use ndarray::ArrayView2;

use crate::consts::DEFAULT_GRADIENT_RELATIVE_ERROR;
use crate::fitter::StopCode;
use crate::geometry::Geometry;
use crate::harmonics::{fit_first_and_second_harmonics, fit_upper_harmonic, population_std};
use crate::sample::Sample;

/// Third and fourth harmonic deviations from a pure ellipse, normalized by
/// `sma * |grad|`.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct HarmonicDeviations {
    pub a3: f64,
    pub b3: f64,
    pub a4: f64,
    pub b4: f64,
    pub a3_err: f64,
    pub b3_err: f64,
    pub a4_err: f64,
    pub b4_err: f64,
}

/// Result of fitting one ellipse. Immutable once built.
#[derive(Clone, Debug)]
pub struct Isophote<'a> {
    sample: Sample<'a>,
    pub niter: usize,
    pub valid: bool,
    pub stop_code: StopCode,

    pub sma: f64,
    /// Mean intensity along the ellipse.
    pub intens: f64,
    pub x0: f64,
    pub y0: f64,
    pub eps: f64,
    pub pa: f64,

    /// Standard deviation of the sampled intensities.
    pub rms: f64,
    /// Error of the mean intensity.
    pub int_err: f64,
    /// Pixel-level standard deviation, `rms * sqrt(sarea)`.
    pub pix_stddev: f64,
    pub grad: f64,
    pub grad_error: Option<f64>,
    pub grad_r_error: Option<f64>,
    /// Mean sector area per sample point.
    pub sarea: f64,
    /// Valid sample points.
    pub ndata: usize,
    /// Masked sample points.
    pub nflag: usize,

    /// Total flux inside the ellipse.
    pub tflux_e: f64,
    /// Total flux inside the circle of radius `sma`.
    pub tflux_c: f64,
    pub npix_e: usize,
    pub npix_c: usize,

    /// `None` when the upper harmonics could not be fitted.
    pub deviations: Option<HarmonicDeviations>,

    pub x0_err: f64,
    pub y0_err: f64,
    pub ellip_err: f64,
    pub pa_err: f64,
}

impl<'a> Isophote<'a> {
    /// Derive all photometric quantities from the final sample of a fit.
    pub fn new(sample: Sample<'a>, niter: usize, valid: bool, stop_code: StopCode) -> Self {
        let g = *sample.geometry();
        let stats = sample.stats().copied();
        let values = sample.values();
        let ndata = sample.actual_points();
        let nflag = sample.total_points() - ndata;

        let intens = stats.map_or(f64::NAN, |s| s.mean);
        let grad = stats.map_or(0.0, |s| s.gradient);
        let grad_error = stats.and_then(|s| s.gradient_error);
        let grad_r_error = stats.and_then(|s| s.gradient_relative_error);
        let sarea = stats.map_or(0.0, |s| s.sector_area);

        let rms = population_std(&values.intensities);
        let int_err = if ndata > 0 {
            rms / (ndata as f64).sqrt()
        } else {
            f64::NAN
        };
        let pix_stddev = rms * sarea.sqrt();

        let flux = total_flux(sample.image(), &g);

        let deviations = harmonic_deviations(
            &values.angles,
            &values.intensities,
            g.sma(),
            grad,
            grad_r_error,
        );

        let errors = if valid {
            geometry_errors(&values.angles, &values.intensities, &g, grad)
        } else {
            GeometryErrors::default()
        };

        Self {
            sample,
            niter,
            valid,
            stop_code,
            sma: g.sma(),
            intens,
            x0: g.x0(),
            y0: g.y0(),
            eps: g.eps(),
            pa: g.pa(),
            rms,
            int_err,
            pix_stddev,
            grad,
            grad_error,
            grad_r_error,
            sarea,
            ndata,
            nflag,
            tflux_e: flux.ellipse,
            tflux_c: flux.circle,
            npix_e: flux.ellipse_pixels,
            npix_c: flux.circle_pixels,
            deviations,
            x0_err: errors.x0,
            y0_err: errors.y0,
            ellip_err: errors.eps,
            pa_err: errors.pa,
        }
    }

    /// One-point isophote at the center. Everything but the intensity and
    /// the point count is zero.
    pub fn central(sample: Sample<'a>) -> Self {
        let g = *sample.geometry();
        let intens = sample.stats().map_or(f64::NAN, |s| s.mean);
        let ndata = sample.actual_points();
        Self {
            niter: 0,
            valid: ndata > 0,
            stop_code: StopCode::CentralPixel,
            sma: 0.0,
            intens,
            x0: g.x0(),
            y0: g.y0(),
            eps: g.eps(),
            pa: g.pa(),
            rms: 0.0,
            int_err: 0.0,
            pix_stddev: 0.0,
            grad: 0.0,
            grad_error: Some(0.0),
            grad_r_error: Some(0.0),
            sarea: 0.0,
            ndata,
            nflag: sample.total_points() - ndata,
            tflux_e: 0.0,
            tflux_c: 0.0,
            npix_e: 0,
            npix_c: 0,
            deviations: None,
            x0_err: 0.0,
            y0_err: 0.0,
            ellip_err: 0.0,
            pa_err: 0.0,
            sample,
        }
    }

    pub fn sample(&self) -> &Sample<'a> {
        &self.sample
    }

    pub fn geometry(&self) -> &Geometry {
        self.sample.geometry()
    }

    pub fn into_sample(self) -> Sample<'a> {
        self.sample
    }
}

struct Flux {
    ellipse: f64,
    circle: f64,
    ellipse_pixels: usize,
    circle_pixels: usize,
}

/// Sum the pixels inside the ellipse and inside the circle of radius sma.
fn total_flux(image: ArrayView2<'_, f32>, geometry: &Geometry) -> Flux {
    let (h, w) = image.dim();
    let (x0, y0, sma) = (geometry.x0(), geometry.y0(), geometry.sma());
    let mut flux = Flux {
        ellipse: 0.0,
        circle: 0.0,
        ellipse_pixels: 0,
        circle_pixels: 0,
    };

    let imin = ((x0 - sma - 0.5) as i64 - 1).max(0);
    let jmin = ((y0 - sma - 0.5) as i64 - 1).max(0);
    let imax = ((x0 + sma + 0.5) as i64 + 1).min(w as i64);
    let jmax = ((y0 + sma + 0.5) as i64 + 1).min(h as i64);
    if imax - imin <= 1 || jmax - jmin <= 1 {
        return flux;
    }

    for j in jmin..jmax {
        for i in imin..imax {
            let (radius, angle) = geometry.to_polar(i as f64, j as f64);
            let value = image[[j as usize, i as usize]] as f64;
            if radius <= sma {
                flux.circle += value;
                flux.circle_pixels += 1;
            }
            if radius <= geometry.radius(angle) {
                flux.ellipse += value;
                flux.ellipse_pixels += 1;
            }
        }
    }
    flux
}

fn harmonic_deviations(
    angles: &[f64],
    intensities: &[f64],
    sma: f64,
    grad: f64,
    grad_r_error: Option<f64>,
) -> Option<HarmonicDeviations> {
    let scale = sma * grad.abs();
    if !(scale > 0.0) {
        return None;
    }
    let gre = grad_r_error
        .filter(|e| *e != 0.0)
        .unwrap_or(DEFAULT_GRADIENT_RELATIVE_ERROR);

    let deviation = |order: u32| -> Option<(f64, f64, f64, f64)> {
        let fit = fit_upper_harmonic(angles, intensities, order).ok()?;
        let a = fit.coefficients[1] / scale;
        let b = fit.coefficients[2] / scale;
        let a_err = a.abs() * ((fit.errors[1] / fit.coefficients[1]).powi(2) + gre * gre).sqrt();
        let b_err = b.abs() * ((fit.errors[2] / fit.coefficients[2]).powi(2) + gre * gre).sqrt();
        Some((a, b, a_err, b_err))
    };

    let (a3, b3, a3_err, b3_err) = deviation(3)?;
    let (a4, b4, a4_err, b4_err) = deviation(4)?;
    Some(HarmonicDeviations {
        a3,
        b3,
        a4,
        b4,
        a3_err,
        b3_err,
        a4_err,
        b4_err,
    })
}

#[derive(Default)]
struct GeometryErrors {
    x0: f64,
    y0: f64,
    eps: f64,
    pa: f64,
}

/// Parameter errors propagated from the first and second harmonic errors.
fn geometry_errors(
    angles: &[f64],
    intensities: &[f64],
    geometry: &Geometry,
    grad: f64,
) -> GeometryErrors {
    let Ok(fit) = fit_first_and_second_harmonics(angles, intensities) else {
        return GeometryErrors::default();
    };
    let errors = fit.errors;
    let (eps, pa, sma) = (geometry.eps(), geometry.pa(), geometry.sma());

    let ea = (errors[2] / grad).abs();
    let eb = (errors[1] * (1.0 - eps) / grad).abs();
    let pa_err = if eps.abs() > 1e-15 {
        (2.0 * errors[3] * (1.0 - eps) / sma / grad / (1.0 - (1.0 - eps).powi(2))).abs()
    } else {
        0.0
    };

    GeometryErrors {
        x0: (ea * pa.cos()).hypot(eb * pa.sin()),
        y0: (ea * pa.sin()).hypot(eb * pa.cos()),
        eps: (2.0 * errors[4] * (1.0 - eps) / sma / grad).abs(),
        pa: pa_err,
    }
}
