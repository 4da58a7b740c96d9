mod common;

use std::f64::consts::{FRAC_PI_4, PI};

use approx::assert_abs_diff_eq;
use ndarray::Array2;

use isofit_core::harmonics::fit_first_and_second_harmonics;
use isofit_core::testdata::{make_test_image, TestImageParams};
use isofit_core::{
    CentralFitter, Fitter, FitterConfig, Geometry, IntegrationMode, IsofitError, Sample, StopCode,
};

use common::DEFAULT_POS;

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn geometry(x0: f64, y0: f64, sma: f64, eps: f64, pa: f64) -> Geometry {
    Geometry::new(x0, y0, sma, eps, pa).unwrap()
}

/// Angular distance between two position angles, modulo pi.
fn pa_distance(a: f64, b: f64) -> f64 {
    let d = (a - b).rem_euclid(PI);
    d.min(PI - d)
}

// ---------------------------------------------------------------------------
// Single correction step
// ---------------------------------------------------------------------------

#[test]
fn test_fitting_raw() {
    let image = common::default_image();
    let sample = Sample::new(image.view(), geometry(DEFAULT_POS, DEFAULT_POS, 40.0, 0.4, 0.0))
        .unwrap()
        .update();
    let values = sample.values();
    let fit = fit_first_and_second_harmonics(&values.angles, &values.intensities).unwrap();
    let [a1, b1, a2, b2] = fit.harmonics();

    // A wrong ellipticity shows up in b2.
    assert!(b2.abs() > a1.abs());
    assert!(b2.abs() > b1.abs());
    assert!(b2.abs() > a2.abs());

    let g = sample.geometry();
    let gradient = sample.stats().unwrap().gradient;
    let correction = b2 * 2.0 * (1.0 - g.eps()) / g.sma() / gradient;
    let new_eps = g.eps() - correction;
    assert_abs_diff_eq!(new_eps, 0.21, epsilon = 0.01);
}

// ---------------------------------------------------------------------------
// Convergence from perturbed guesses
// ---------------------------------------------------------------------------

#[test]
fn test_fitting_small_radii() {
    let image = common::default_image();
    let sample =
        Sample::new(image.view(), geometry(DEFAULT_POS, DEFAULT_POS, 2.0, 0.2, 0.0)).unwrap();
    let isophote = Fitter::new(sample).fit();
    assert_eq!(isophote.ndata, 13);
}

#[test]
fn test_fitting_eps() {
    let image = common::default_image();
    let sample =
        Sample::new(image.view(), geometry(DEFAULT_POS, DEFAULT_POS, 40.0, 0.4, 0.0)).unwrap();
    let isophote = Fitter::new(sample).fit();

    assert_eq!(isophote.stop_code, StopCode::Converged);
    assert!(isophote.valid);
    let g = isophote.geometry();
    assert!(
        g.eps() >= 0.19 && g.eps() <= 0.21,
        "eps {} should be within 0.01 of 0.2",
        g.eps()
    );
}

#[test]
fn test_fitting_pa() {
    let image = common::image_with(TestImageParams {
        pa: FRAC_PI_4,
        noise: 0.01,
        ..TestImageParams::default()
    });
    let sample = Sample::at_image_center(image.view(), 40.0).unwrap();
    let isophote = Fitter::new(sample).fit();
    let g = isophote.geometry();
    assert!(
        pa_distance(g.pa(), FRAC_PI_4) <= 0.05,
        "pa {} should be within 0.05 of pi/4",
        g.pa()
    );
}

#[test]
fn test_fitting_xy() {
    let pos = DEFAULT_POS - 5.0;
    let image = common::image_with(TestImageParams {
        x0: Some(pos),
        y0: Some(pos),
        ..TestImageParams::default()
    });
    let sample = Sample::at_image_center(image.view(), 40.0).unwrap();
    let isophote = Fitter::new(sample).fit();
    let g = isophote.geometry();
    assert!((g.x0() - pos).abs() <= 1.0, "x0 {} should be near {pos}", g.x0());
    assert!((g.y0() - pos).abs() <= 1.0, "y0 {} should be near {pos}", g.y0());
}

fn all_parameters_image() -> Array2<f32> {
    common::image_with(TestImageParams {
        x0: Some(DEFAULT_POS - 5.0),
        y0: Some(DEFAULT_POS - 5.0),
        eps: 0.4,
        pa: FRAC_PI_4,
        ..TestImageParams::default()
    })
}

#[test]
fn test_fitting_all() {
    let pos = DEFAULT_POS - 5.0;
    let image = all_parameters_image();
    // The position angle guess must be within about 20% for this image.
    let sample =
        Sample::new(image.view(), geometry(DEFAULT_POS, DEFAULT_POS, 60.0, 0.2, 1.2 * FRAC_PI_4))
            .unwrap();
    let isophote = Fitter::new(sample).fit();

    assert_eq!(isophote.stop_code, StopCode::Converged);
    assert_eq!(isophote.stop_code.code(), 0);
    let g = isophote.geometry();
    assert!((g.x0() - pos).abs() <= 1.5, "x0 {}", g.x0());
    assert!((g.y0() - pos).abs() <= 1.5, "y0 {}", g.y0());
    assert!((g.eps() - 0.4).abs() <= 0.01, "eps {}", g.eps());
    assert!(pa_distance(g.pa(), FRAC_PI_4) <= 0.05, "pa {}", g.pa());
}

#[test]
fn test_fitting_all_mean_mode() {
    let pos = DEFAULT_POS - 5.0;
    let image = all_parameters_image();
    let sample =
        Sample::new(image.view(), geometry(DEFAULT_POS, DEFAULT_POS, 60.0, 0.2, 1.2 * FRAC_PI_4))
            .unwrap()
            .with_integration_mode(IntegrationMode::Mean);
    let isophote = Fitter::new(sample).fit();

    assert_eq!(isophote.stop_code, StopCode::Converged);
    let g = isophote.geometry();
    assert!((g.x0() - pos).abs() <= 1.5, "x0 {}", g.x0());
    assert!((g.eps() - 0.4).abs() <= 0.02, "eps {}", g.eps());
    assert!(pa_distance(g.pa(), FRAC_PI_4) <= 0.05, "pa {}", g.pa());
}

// ---------------------------------------------------------------------------
// Fixed parameters
// ---------------------------------------------------------------------------

#[test]
fn test_everything_fixed_converges_immediately() {
    let image = common::default_image();
    let start = geometry(DEFAULT_POS, DEFAULT_POS, 40.0, 0.4, 0.3);
    let config = FitterConfig {
        fix_center: true,
        fix_pa: true,
        fix_eps: true,
        ..FitterConfig::default()
    };
    let sample = Sample::new(image.view(), start).unwrap();
    let isophote = Fitter::with_config(sample, config).unwrap().fit();

    assert_eq!(isophote.stop_code, StopCode::Converged);
    assert_eq!(isophote.niter, 1);
    assert_eq!(*isophote.geometry(), start);
}

#[test]
fn test_fixed_eps_is_never_corrected() {
    let image = common::default_image();
    let config = FitterConfig {
        fix_eps: true,
        ..FitterConfig::default()
    };
    let sample =
        Sample::new(image.view(), geometry(DEFAULT_POS, DEFAULT_POS, 40.0, 0.4, 0.0)).unwrap();
    let isophote = Fitter::with_config(sample, config).unwrap().fit();
    assert_eq!(isophote.eps, 0.4);
}

// ---------------------------------------------------------------------------
// Stop conditions
// ---------------------------------------------------------------------------

#[test]
fn test_sma_above_max_is_disk_edge() {
    let image = common::default_image();
    let config = FitterConfig {
        max_sma: Some(10.0),
        ..FitterConfig::default()
    };
    let sample =
        Sample::new(image.view(), geometry(DEFAULT_POS, DEFAULT_POS, 40.0, 0.2, 0.0)).unwrap();
    let isophote = Fitter::with_config(sample, config).unwrap().fit();
    assert_eq!(isophote.stop_code, StopCode::DiskEdge);
    assert_eq!(isophote.stop_code.code(), 3);
    assert!(!isophote.valid);
    assert_eq!(isophote.niter, 0);
}

#[test]
fn test_ellipse_outside_image_is_disk_edge() {
    let image = common::default_image();
    let sample = Sample::new(image.view(), geometry(2000.0, 2000.0, 40.0, 0.2, 0.0)).unwrap();
    let isophote = Fitter::new(sample).fit();
    assert_eq!(isophote.stop_code, StopCode::DiskEdge);
    assert_eq!(isophote.ndata, 0);
    assert!(!isophote.valid);
}

#[test]
fn test_too_many_flagged_points() {
    // Center one pixel from the left edge: almost half the ellipse is outside.
    let image = common::ramp_image(10, 10);
    let sample = Sample::new(image.view(), geometry(1.0, 5.0, 4.0, 0.05, 0.0)).unwrap();
    let isophote = Fitter::new(sample).fit();

    assert_eq!(isophote.stop_code, StopCode::DiskEdge);
    assert_eq!(isophote.niter, 1);
    assert!(isophote.valid);
    assert!(isophote.nflag > 0);
    assert!((isophote.ndata as f64) < 0.7 * (isophote.ndata + isophote.nflag) as f64);
}

#[test]
fn test_flat_image_stops_on_missing_gradient() {
    let image = Array2::<f32>::from_elem((200, 200), 3.0);
    let sample = Sample::new(image.view(), geometry(100.0, 100.0, 30.0, 0.2, 0.0)).unwrap();
    let isophote = Fitter::new(sample).fit();
    assert_eq!(isophote.stop_code, StopCode::Diverging);
    assert_eq!(isophote.stop_code.code(), 4);
}

#[test]
fn test_invalid_config_is_rejected() {
    let image = common::default_image();
    let sample = Sample::at_image_center(image.view(), 40.0).unwrap();
    let config = FitterConfig {
        minit: 60,
        maxit: 50,
        ..FitterConfig::default()
    };
    assert!(matches!(
        Fitter::with_config(sample, config),
        Err(IsofitError::InvalidConfig(_))
    ));
}

#[test]
fn test_max_iterations_reports_best_sample() {
    let image = common::default_image();
    let config = FitterConfig {
        minit: 2,
        maxit: 2,
        ..FitterConfig::default()
    };
    let sample =
        Sample::new(image.view(), geometry(DEFAULT_POS, DEFAULT_POS, 40.0, 0.4, 0.0)).unwrap();
    let isophote = Fitter::with_config(sample, config).unwrap().fit();
    assert_eq!(isophote.stop_code, StopCode::MaxIterations);
    assert_eq!(isophote.stop_code.code(), 1);
    assert_eq!(isophote.niter, 2);
    assert!(isophote.valid);
    // Two corrections leave eps between the guess and the truth.
    assert!(isophote.eps < 0.4 && isophote.eps > 0.15, "eps {}", isophote.eps);
}

// ---------------------------------------------------------------------------
// Position-angle freeze
// ---------------------------------------------------------------------------

#[test]
fn test_pa_frozen_on_nearly_round_ellipse() {
    // eps below the default freeze threshold: a2 never drives a correction.
    let image = common::image_with(TestImageParams {
        eps: 0.02,
        pa: 1.0,
        ..TestImageParams::default()
    });
    let config = FitterConfig {
        fix_eps: true,
        ..FitterConfig::default()
    };
    let sample =
        Sample::new(image.view(), geometry(DEFAULT_POS, DEFAULT_POS, 40.0, 0.03, 0.3)).unwrap();
    let isophote = Fitter::with_config(sample, config).unwrap().fit();

    assert_eq!(isophote.pa, 0.3);
    // The wrong position angle still shows in a2, which blocks convergence.
    assert_eq!(isophote.stop_code, StopCode::MaxIterations);
    assert!(isophote.valid);
}

#[test]
fn test_pa_freeze_threshold_is_configurable() {
    let image = common::default_image();
    let start = geometry(DEFAULT_POS, DEFAULT_POS, 40.0, 0.2, 0.5);

    let frozen = FitterConfig {
        fix_eps: true,
        pa_freeze_eps: 0.5,
        ..FitterConfig::default()
    };
    let sample = Sample::new(image.view(), start).unwrap();
    let isophote = Fitter::with_config(sample, frozen).unwrap().fit();
    assert_eq!(isophote.pa, 0.5);
    assert_eq!(isophote.stop_code, StopCode::MaxIterations);

    let free = FitterConfig {
        fix_eps: true,
        ..FitterConfig::default()
    };
    let sample = Sample::new(image.view(), start).unwrap();
    let isophote = Fitter::with_config(sample, free).unwrap().fit();
    assert_eq!(isophote.stop_code, StopCode::Converged);
    assert!(pa_distance(isophote.pa, 0.0) <= 0.05, "pa {}", isophote.pa);
}

// ---------------------------------------------------------------------------
// Oscillation
// ---------------------------------------------------------------------------

fn noisy_image(seed: u64) -> Array2<f32> {
    let params = TestImageParams {
        noise: 30.0,
        ..TestImageParams::default()
    };
    make_test_image(&params, seed).unwrap()
}

fn oscillation_config(max_oscillations: usize) -> FitterConfig {
    FitterConfig {
        max_oscillations,
        maxgerr: 100.0,
        ..FitterConfig::default()
    }
}

/// Stop code, validity and iteration count of a fit from the image center.
fn fit_outcome(image: &Array2<f32>, sma: f64, config: FitterConfig) -> (StopCode, bool, usize) {
    let sample = Sample::at_image_center(image.view(), sma).unwrap();
    let isophote = Fitter::with_config(sample, config).unwrap().fit();
    (isophote.stop_code, isophote.valid, isophote.niter)
}

/// First noisy image and sma whose fit ends as an invalid `Diverging`,
/// with the iteration it stopped at.
fn oscillating_fit() -> (Array2<f32>, f64, usize) {
    for seed in 0..40 {
        let image = noisy_image(seed);
        for sma in [60.0, 100.0, 150.0] {
            let (stop_code, valid, niter) = fit_outcome(&image, sma, oscillation_config(3));
            if stop_code == StopCode::Diverging && !valid {
                return (image, sma, niter);
            }
        }
    }
    panic!("no noisy fit stopped on oscillation");
}

#[test]
fn test_noisy_fit_stops_on_oscillation() {
    let (image, sma, niter) = oscillating_fit();
    assert!(niter >= 3, "stopped at iteration {niter}");

    // Same trajectory with a looser limit: the fit keeps going.
    let relaxed = fit_outcome(&image, sma, oscillation_config(1000));
    assert_ne!(
        relaxed,
        (StopCode::Diverging, false, niter),
        "sma {sma}: the stop at iteration {niter} was not caused by oscillation"
    );
}

#[test]
fn test_flips_within_tolerance_do_not_count() {
    let (image, sma, niter) = oscillating_fit();

    // Every iteration is within tolerance, so flips never accumulate.
    let config = FitterConfig {
        conver: 1.0e6,
        minit: 50,
        maxit: 50,
        ..oscillation_config(1)
    };
    let (stop_code, valid, tolerant_niter) = fit_outcome(&image, sma, config);
    assert!(
        !(stop_code == StopCode::Diverging && !valid),
        "sma {sma}: tolerant fit oscillated at iteration {tolerant_niter}"
    );
    assert!(tolerant_niter >= niter);
}

// ---------------------------------------------------------------------------
// Isophote quantities
// ---------------------------------------------------------------------------

#[test]
fn test_isophote_photometry() {
    let image = common::default_image();
    let sample =
        Sample::new(image.view(), geometry(DEFAULT_POS, DEFAULT_POS, 40.0, 0.4, 0.0)).unwrap();
    let iso = Fitter::new(sample).fit();

    assert_eq!(iso.sma, 40.0);
    assert_abs_diff_eq!(iso.intens, 200.0, epsilon = 0.1);
    assert_eq!(iso.ndata, 225);
    assert_eq!(iso.nflag, 0);
    assert!(iso.rms < 0.1, "rms {}", iso.rms);
    assert_abs_diff_eq!(iso.int_err, iso.rms / 15.0, epsilon = 1e-12);
    assert_abs_diff_eq!(iso.pix_stddev, iso.rms * 2f64.sqrt(), epsilon = 1e-12);
    assert_abs_diff_eq!(iso.grad, -4.22, epsilon = 0.01);
    assert!(iso.grad_error.is_some());
    assert_abs_diff_eq!(iso.sarea, 2.0, epsilon = 1e-12);

    // The ellipse is inside the circle of radius sma.
    assert!(iso.npix_e < iso.npix_c);
    assert!(iso.tflux_e < iso.tflux_c);
    assert!((iso.npix_c as f64 - PI * 1600.0).abs() < 60.0, "npix_c {}", iso.npix_c);
    assert!((iso.npix_e as f64 - PI * 1280.0).abs() < 60.0, "npix_e {}", iso.npix_e);

    let deviations = iso.deviations.expect("upper harmonics should fit");
    for value in [deviations.a3, deviations.b3, deviations.a4, deviations.b4] {
        assert!(value.abs() < 1e-3, "deviation {value} too large for a pure ellipse");
    }

    for err in [iso.x0_err, iso.y0_err, iso.ellip_err, iso.pa_err] {
        assert!(err.is_finite() && err >= 0.0 && err < 0.1, "error {err}");
    }
}

// ---------------------------------------------------------------------------
// Central pixel
// ---------------------------------------------------------------------------

#[test]
fn test_central_fitter() {
    let image = common::default_image();
    let sample =
        Sample::central(image.view(), geometry(DEFAULT_POS, DEFAULT_POS, 0.0, 0.0, 0.0)).unwrap();
    let isophote = CentralFitter::new(sample).fit();

    assert_eq!(isophote.ndata, 1);
    assert_eq!(isophote.stop_code, StopCode::CentralPixel);
    assert_eq!(isophote.stop_code.code(), 5);
    assert_eq!(isophote.niter, 0);
    assert!(isophote.valid);
    assert_eq!(isophote.sma, 0.0);
    // Peak of the r^1/4 profile: 100 + 100 * exp(7.669).
    assert_abs_diff_eq!(isophote.intens, 214_193.9, epsilon = 1.0);
    assert_eq!(isophote.rms, 0.0);
    assert_eq!(isophote.grad, 0.0);
}

#[test]
fn test_fitter_delegates_central_samples() {
    let image = common::default_image();
    let sample =
        Sample::central(image.view(), geometry(DEFAULT_POS, DEFAULT_POS, 10.0, 0.2, 0.0)).unwrap();
    let isophote = Fitter::new(sample).fit();
    assert_eq!(isophote.stop_code, StopCode::CentralPixel);
    assert_eq!(isophote.ndata, 1);
}

#[test]
fn test_central_fitter_reduces_elliptical_sample() {
    let image = common::default_image();
    let sample =
        Sample::new(image.view(), geometry(DEFAULT_POS, DEFAULT_POS, 10.0, 0.2, 0.0)).unwrap();
    let isophote = CentralFitter::new(sample).fit();
    assert_eq!(isophote.ndata, 1);
    assert_eq!(isophote.geometry().sma(), 0.0);
    assert!(isophote.sample().is_central());
}
