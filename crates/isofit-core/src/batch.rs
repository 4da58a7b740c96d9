use std::sync::atomic::{AtomicUsize, Ordering};

use ndarray::ArrayView2;
use rayon::prelude::*;
use tracing::info;

use crate::consts::PARALLEL_FIT_THRESHOLD;
use crate::error::{IsofitError, Result};
use crate::fitter::{CentralFitter, Fitter, FitterConfig};
use crate::geometry::Geometry;
use crate::integrator::IntegrationMode;
use crate::isophote::Isophote;
use crate::sample::Sample;

/// Fit each starting geometry independently over the same image.
///
/// Results come back in input order. A geometry with `sma == 0` yields a
/// central-pixel isophote.
pub fn fit_independent<'a>(
    image: ArrayView2<'a, f32>,
    geometries: &[Geometry],
    mode: IntegrationMode,
    config: &FitterConfig,
) -> Result<Vec<Isophote<'a>>> {
    fit_independent_with_progress(image, geometries, mode, config, |_| {})
}

/// [`fit_independent`] with a callback receiving the number of finished fits.
pub fn fit_independent_with_progress<'a, F>(
    image: ArrayView2<'a, f32>,
    geometries: &[Geometry],
    mode: IntegrationMode,
    config: &FitterConfig,
    on_fit_done: F,
) -> Result<Vec<Isophote<'a>>>
where
    F: Fn(usize) + Send + Sync,
{
    config.validate()?;
    let (h, w) = image.dim();
    if h == 0 || w == 0 {
        return Err(IsofitError::InvalidImage(format!(
            "image shape {h}x{w} has no pixels"
        )));
    }

    let counter = AtomicUsize::new(0);
    let fit_one = |geometry: &Geometry| -> Result<Isophote<'a>> {
        let isophote = fit_geometry(image, *geometry, mode, config)?;
        let done = counter.fetch_add(1, Ordering::Relaxed) + 1;
        on_fit_done(done);
        Ok(isophote)
    };

    let isophotes = if geometries.len() >= PARALLEL_FIT_THRESHOLD {
        let results: Vec<Result<Isophote<'a>>> = geometries.par_iter().map(fit_one).collect();
        results.into_iter().collect::<Result<Vec<_>>>()?
    } else {
        geometries.iter().map(fit_one).collect::<Result<Vec<_>>>()?
    };

    info!(
        count = isophotes.len(),
        converged = isophotes.iter().filter(|i| i.stop_code.code() == 0).count(),
        "Independent fits finished"
    );
    Ok(isophotes)
}

fn fit_geometry<'a>(
    image: ArrayView2<'a, f32>,
    geometry: Geometry,
    mode: IntegrationMode,
    config: &FitterConfig,
) -> Result<Isophote<'a>> {
    if geometry.sma() == 0.0 {
        let sample = Sample::central(image, geometry)?.with_integration_mode(mode);
        return Ok(CentralFitter::new(sample).fit());
    }
    let sample = Sample::new(image, geometry)?.with_integration_mode(mode);
    Ok(Fitter::with_config(sample, config.clone())?.fit())
}
