//! Iterative refinement of one isophote's geometry.
//!
//! Each iteration fits the first and second harmonics to the current sample,
//! picks the largest free harmonic, and converts it into a correction of the
//! one geometric parameter it measures:
//!
//! | harmonic | corrects |
//! |---|---|
//! | `a1` | center, along the minor axis |
//! | `b1` | center, along the major axis |
//! | `a2` | position angle |
//! | `b2` | ellipticity |
//!
//! The corrected geometry yields a new sample; nothing is mutated in place.
//! Every termination, successful or not, is reported through a [`StopCode`]
//! on the returned [`Isophote`].

use std::f64::consts::FRAC_PI_2;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::consts::{
    DEFAULT_CONVERGENCE, DEFAULT_FLAGGED_FRACTION, DEFAULT_MAX_EPS_STEP,
    DEFAULT_MAX_GRADIENT_ERROR, DEFAULT_MAX_ITERATIONS, DEFAULT_MAX_OSCILLATIONS,
    DEFAULT_MAX_PA_STEP, DEFAULT_MAX_POSITION_STEP_FRACTION, DEFAULT_MIN_ITERATIONS,
    DEFAULT_PA_FREEZE_EPS, MAX_EPS, MIN_EPS, MIN_POSITION_STEP,
};
use crate::error::{IsofitError, Result};
use crate::geometry::{normalize_pa, Geometry};
use crate::harmonics::fit_first_and_second_harmonics;
use crate::isophote::Isophote;
use crate::sample::Sample;

/// Why a fit terminated.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum StopCode {
    /// Harmonic amplitudes fell below the convergence criterion.
    Converged,
    /// Iteration limit reached; the best sample so far is reported.
    MaxIterations,
    /// Too few valid points (or a singular system) for the harmonic fit.
    InsufficientData,
    /// The ellipse left the usable image area.
    DiskEdge,
    /// The geometry became invalid, oscillated, or lost its gradient.
    Diverging,
    /// Single-pixel isophote at the center.
    CentralPixel,
}

impl StopCode {
    pub fn code(self) -> i32 {
        match self {
            StopCode::Converged => 0,
            StopCode::MaxIterations => 1,
            StopCode::InsufficientData => 2,
            StopCode::DiskEdge => 3,
            StopCode::Diverging => 4,
            StopCode::CentralPixel => 5,
        }
    }
}

impl std::fmt::Display for StopCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StopCode::Converged => write!(f, "Converged"),
            StopCode::MaxIterations => write!(f, "Max Iterations"),
            StopCode::InsufficientData => write!(f, "Insufficient Data"),
            StopCode::DiskEdge => write!(f, "Disk Edge"),
            StopCode::Diverging => write!(f, "Diverging"),
            StopCode::CentralPixel => write!(f, "Central Pixel"),
        }
    }
}

/// Convergence criteria, iteration limits and correction damping.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FitterConfig {
    /// Converged when the largest harmonic is below
    /// `conver * sector_area * rms(residual)`.
    #[serde(default = "default_conver")]
    pub conver: f64,
    /// Minimum number of iterations.
    #[serde(default = "default_minit")]
    pub minit: usize,
    /// Maximum number of iterations.
    #[serde(default = "default_maxit")]
    pub maxit: usize,
    /// Minimum fraction of sample points that must be valid.
    #[serde(default = "default_fflag")]
    pub fflag: f64,
    /// Maximum gradient relative error tolerated (once) before stopping.
    #[serde(default = "default_maxgerr")]
    pub maxgerr: f64,
    /// Skip the gradient quality check, as when fitting towards the center.
    #[serde(default)]
    pub going_inwards: bool,
    #[serde(default)]
    pub fix_center: bool,
    #[serde(default)]
    pub fix_pa: bool,
    #[serde(default)]
    pub fix_eps: bool,
    /// Largest sma worth fitting; `None` uses half the image diagonal.
    #[serde(default)]
    pub max_sma: Option<f64>,
    #[serde(default = "default_max_eps")]
    pub max_eps: f64,
    /// Ellipticity substituted for an exact circle.
    #[serde(default = "default_min_eps")]
    pub min_eps: f64,
    /// Position-angle corrections are frozen below this ellipticity.
    ///
    /// A frozen `a2` still counts towards convergence, so a nearly round
    /// ellipse started at the wrong position angle usually runs to
    /// `MaxIterations` with that angle unchanged.
    #[serde(default = "default_pa_freeze_eps")]
    pub pa_freeze_eps: f64,
    /// Undamped sign flips tolerated before the fit is declared diverging.
    #[serde(default = "default_max_oscillations")]
    pub max_oscillations: usize,
    /// Largest center shift per iteration, as a fraction of sma.
    #[serde(default = "default_max_position_step_fraction")]
    pub max_position_step_fraction: f64,
    #[serde(default = "default_max_eps_step")]
    pub max_eps_step: f64,
    #[serde(default = "default_max_pa_step")]
    pub max_pa_step: f64,
}

fn default_conver() -> f64 {
    DEFAULT_CONVERGENCE
}
fn default_minit() -> usize {
    DEFAULT_MIN_ITERATIONS
}
fn default_maxit() -> usize {
    DEFAULT_MAX_ITERATIONS
}
fn default_fflag() -> f64 {
    DEFAULT_FLAGGED_FRACTION
}
fn default_maxgerr() -> f64 {
    DEFAULT_MAX_GRADIENT_ERROR
}
fn default_max_eps() -> f64 {
    MAX_EPS
}
fn default_min_eps() -> f64 {
    MIN_EPS
}
fn default_pa_freeze_eps() -> f64 {
    DEFAULT_PA_FREEZE_EPS
}
fn default_max_oscillations() -> usize {
    DEFAULT_MAX_OSCILLATIONS
}
fn default_max_position_step_fraction() -> f64 {
    DEFAULT_MAX_POSITION_STEP_FRACTION
}
fn default_max_eps_step() -> f64 {
    DEFAULT_MAX_EPS_STEP
}
fn default_max_pa_step() -> f64 {
    DEFAULT_MAX_PA_STEP
}

impl Default for FitterConfig {
    fn default() -> Self {
        Self {
            conver: DEFAULT_CONVERGENCE,
            minit: DEFAULT_MIN_ITERATIONS,
            maxit: DEFAULT_MAX_ITERATIONS,
            fflag: DEFAULT_FLAGGED_FRACTION,
            maxgerr: DEFAULT_MAX_GRADIENT_ERROR,
            going_inwards: false,
            fix_center: false,
            fix_pa: false,
            fix_eps: false,
            max_sma: None,
            max_eps: MAX_EPS,
            min_eps: MIN_EPS,
            pa_freeze_eps: DEFAULT_PA_FREEZE_EPS,
            max_oscillations: DEFAULT_MAX_OSCILLATIONS,
            max_position_step_fraction: DEFAULT_MAX_POSITION_STEP_FRACTION,
            max_eps_step: DEFAULT_MAX_EPS_STEP,
            max_pa_step: DEFAULT_MAX_PA_STEP,
        }
    }
}

impl FitterConfig {
    pub fn validate(&self) -> Result<()> {
        let positive = |name: &str, value: f64| {
            if value.is_finite() && value > 0.0 {
                Ok(())
            } else {
                Err(IsofitError::InvalidConfig(format!(
                    "{name} must be positive, got {value}"
                )))
            }
        };
        positive("conver", self.conver)?;
        positive("maxgerr", self.maxgerr)?;
        positive("max_position_step_fraction", self.max_position_step_fraction)?;
        positive("max_eps_step", self.max_eps_step)?;
        positive("max_pa_step", self.max_pa_step)?;
        if let Some(max_sma) = self.max_sma {
            positive("max_sma", max_sma)?;
        }
        if self.maxit == 0 {
            return Err(IsofitError::InvalidConfig("maxit must be at least 1".into()));
        }
        if self.minit > self.maxit {
            return Err(IsofitError::InvalidConfig(format!(
                "minit ({}) exceeds maxit ({})",
                self.minit, self.maxit
            )));
        }
        if !(0.0..=1.0).contains(&self.fflag) {
            return Err(IsofitError::InvalidConfig(format!(
                "fflag must lie in [0, 1], got {}",
                self.fflag
            )));
        }
        if !(self.min_eps > 0.0 && self.min_eps < self.max_eps && self.max_eps < 1.0) {
            return Err(IsofitError::InvalidConfig(format!(
                "need 0 < min_eps ({}) < max_eps ({}) < 1",
                self.min_eps, self.max_eps
            )));
        }
        if !(self.pa_freeze_eps >= 0.0 && self.pa_freeze_eps < 1.0) {
            return Err(IsofitError::InvalidConfig(format!(
                "pa_freeze_eps must lie in [0, 1), got {}",
                self.pa_freeze_eps
            )));
        }
        if self.max_oscillations == 0 {
            return Err(IsofitError::InvalidConfig(
                "max_oscillations must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

/// Harmonic amplitudes in the order returned by the harmonic fit.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Harmonic {
    A1,
    B1,
    A2,
    B2,
}

const HARMONICS: [Harmonic; 4] = [Harmonic::A1, Harmonic::B1, Harmonic::A2, Harmonic::B2];

impl Harmonic {
    fn index(self) -> usize {
        self as usize
    }

    /// Whether the parameter this harmonic measures may be refined.
    fn is_free(self, config: &FitterConfig) -> bool {
        match self {
            Harmonic::A1 | Harmonic::B1 => !config.fix_center,
            Harmonic::A2 => !config.fix_pa,
            Harmonic::B2 => !config.fix_eps,
        }
    }
}

/// Largest free harmonic in absolute value, optionally skipping `a2`.
fn largest_harmonic(
    values: &[f64; 4],
    config: &FitterConfig,
    freeze_pa: bool,
) -> Option<(Harmonic, f64)> {
    HARMONICS
        .iter()
        .filter(|h| h.is_free(config))
        .filter(|h| !(freeze_pa && **h == Harmonic::A2))
        .map(|&h| (h, values[h.index()]))
        .fold(None, |best: Option<(Harmonic, f64)>, (h, v)| match best {
            Some((_, b)) if b.abs() >= v.abs() => best,
            _ => Some((h, v)),
        })
}

/// Detects a correction that keeps flipping sign without shrinking.
struct OscillationTracker {
    last: [Option<f64>; 4],
    count: usize,
    limit: usize,
}

impl OscillationTracker {
    fn new(limit: usize) -> Self {
        Self {
            last: [None; 4],
            count: 0,
            limit,
        }
    }

    /// Record the harmonic driving this iteration's correction. Returns
    /// `true` once the undamped flip count reaches the limit.
    fn observe(&mut self, harmonic: Harmonic, value: f64) -> bool {
        let slot = &mut self.last[harmonic.index()];
        if let Some(previous) = *slot {
            if value.abs() < previous.abs() {
                self.count = 0;
            } else if value.signum() != previous.signum() {
                self.count += 1;
            }
        }
        *slot = Some(value);
        self.count >= self.limit
    }

    fn reset(&mut self) {
        self.count = 0;
    }
}

/// Fits one elliptical isophote starting from a sample's geometry.
pub struct Fitter<'a> {
    sample: Sample<'a>,
    config: FitterConfig,
}

impl<'a> Fitter<'a> {
    pub fn new(sample: Sample<'a>) -> Self {
        Self {
            sample,
            config: FitterConfig::default(),
        }
    }

    pub fn with_config(sample: Sample<'a>, config: FitterConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self { sample, config })
    }

    pub fn config(&self) -> &FitterConfig {
        &self.config
    }

    /// Iterate until a stop condition fires.
    pub fn fit(self) -> Isophote<'a> {
        let Self { sample, config } = self;

        if sample.is_central() {
            return CentralFitter::new(sample).fit();
        }

        let (h, w) = sample.image().dim();
        let sma = sample.geometry().sma();
        let max_sma = config
            .max_sma
            .unwrap_or_else(|| 0.5 * (w as f64).hypot(h as f64));
        if sma <= 0.0 {
            return finish(sample.update(), 0, false, StopCode::Diverging);
        }
        if sma > max_sma {
            return finish(sample.update(), 0, false, StopCode::DiskEdge);
        }

        let mut sample = if sample.stats().is_some() {
            sample
        } else {
            sample.update()
        };
        let mut best: Option<(f64, Sample<'a>)> = None;
        let mut gradient_exceeded = false;
        let mut oscillations = OscillationTracker::new(config.max_oscillations);

        for iteration in 0..config.maxit {
            let niter = iteration + 1;

            if sample.actual_points() == 0 {
                return finish(sample, niter, false, StopCode::DiskEdge);
            }

            let values = sample.values();
            let harmonics =
                match fit_first_and_second_harmonics(&values.angles, &values.intensities) {
                    Ok(fit) => fit,
                    Err(err) => {
                        debug!(%err, niter, "Harmonic fit failed");
                        return finish(sample, niter, false, StopCode::InsufficientData);
                    }
                };
            let amplitudes = harmonics.harmonics();

            let Some((_, largest)) = largest_harmonic(&amplitudes, &config, false) else {
                // Every parameter is fixed: nothing left to refine.
                return finish(sample, niter, true, StopCode::Converged);
            };
            let amplitude = largest.abs();
            if best.as_ref().map_or(true, |(b, _)| amplitude < *b) {
                best = Some((amplitude, sample.clone()));
            }

            let Some(stats) = sample.stats().copied() else {
                return finish(sample, niter, false, StopCode::InsufficientData);
            };
            let tolerance = config.conver * stats.sector_area * harmonics.residual_std;
            let within_tolerance = tolerance > amplitude;

            debug!(
                niter,
                amplitude,
                tolerance,
                eps = sample.geometry().eps(),
                pa = sample.geometry().pa(),
                "Fit iteration"
            );

            if within_tolerance && niter >= config.minit {
                return finish(sample, niter, true, StopCode::Converged);
            }

            if (sample.actual_points() as f64) < sample.total_points() as f64 * config.fflag {
                let reported = best.map_or(sample, |(_, s)| s);
                return finish(reported, niter, true, StopCode::DiskEdge);
            }

            let freeze_pa = sample.geometry().eps() < config.pa_freeze_eps;
            let Some((driver, value)) = largest_harmonic(&amplitudes, &config, freeze_pa) else {
                return finish(sample, niter, true, StopCode::Converged);
            };

            if within_tolerance {
                oscillations.reset();
            } else if oscillations.observe(driver, value) {
                return finish(sample, niter, false, StopCode::Diverging);
            }

            let geometry = match correct(sample.geometry(), stats.gradient, driver, value, &config)
            {
                Ok(geometry) => geometry,
                Err(err) => {
                    debug!(%err, niter, ?driver, "Correction produced an invalid geometry");
                    return finish(sample, niter, false, StopCode::Diverging);
                }
            };

            sample = sample.with_geometry(geometry).update();

            if let Some(code) = check_conditions(&sample, &config, &mut gradient_exceeded) {
                return finish(sample, niter, true, code);
            }
        }

        let reported = best.map_or(sample, |(_, s)| s);
        finish(reported, config.maxit, true, StopCode::MaxIterations)
    }
}

fn finish<'a>(sample: Sample<'a>, niter: usize, valid: bool, stop_code: StopCode) -> Isophote<'a> {
    let g = sample.geometry();
    info!(
        sma = g.sma(),
        x0 = g.x0(),
        y0 = g.y0(),
        eps = g.eps(),
        pa = g.pa(),
        niter,
        stop_code = stop_code.code(),
        "Isophote fit finished"
    );
    Isophote::new(sample, niter, valid, stop_code)
}

/// New geometry with the parameter measured by `harmonic` corrected.
fn correct(
    geometry: &Geometry,
    gradient: f64,
    harmonic: Harmonic,
    value: f64,
    config: &FitterConfig,
) -> Result<Geometry> {
    let eps = geometry.eps();
    let pa = geometry.pa();
    let sma = geometry.sma();

    match harmonic {
        Harmonic::A1 => {
            let aux = -value * (1.0 - eps) / gradient;
            shift_center(geometry, -aux * pa.sin(), aux * pa.cos(), config)
        }
        Harmonic::B1 => {
            let aux = -value / gradient;
            shift_center(geometry, aux * pa.cos(), aux * pa.sin(), config)
        }
        Harmonic::A2 => {
            let q = 1.0 - eps;
            let correction = value * 2.0 * q / sma / gradient / (q * q - 1.0);
            let correction = correction.clamp(-config.max_pa_step, config.max_pa_step);
            geometry.with_pa(normalize_pa(pa + correction))
        }
        Harmonic::B2 => {
            let correction = value * 2.0 * (1.0 - eps) / sma / gradient;
            let correction = correction.clamp(-config.max_eps_step, config.max_eps_step);
            set_eps(geometry, (eps - correction).min(config.max_eps), config)
        }
    }
}

fn shift_center(geometry: &Geometry, dx: f64, dy: f64, config: &FitterConfig) -> Result<Geometry> {
    let limit = (config.max_position_step_fraction * geometry.sma()).max(MIN_POSITION_STEP);
    let length = dx.hypot(dy);
    let scale = if length > limit { limit / length } else { 1.0 };
    geometry.with_center(geometry.x0() + dx * scale, geometry.y0() + dy * scale)
}

/// Apply a new ellipticity. A negative value describes the same ellipse
/// rotated by 90 degrees; an exact circle gets `min_eps` so the position
/// angle stays defined.
fn set_eps(geometry: &Geometry, eps: f64, config: &FitterConfig) -> Result<Geometry> {
    let (eps, pa) = if eps < 0.0 {
        let pa = geometry.pa();
        let rotated = if pa < FRAC_PI_2 {
            pa + FRAC_PI_2
        } else {
            pa - FRAC_PI_2
        };
        ((-eps).min(config.max_eps), rotated)
    } else {
        (eps, geometry.pa())
    };
    let eps = if eps == 0.0 { config.min_eps } else { eps };
    geometry.with_eps(eps)?.with_pa(pa)
}

/// Conditions evaluated on the freshly corrected sample.
fn check_conditions(
    sample: &Sample<'_>,
    config: &FitterConfig,
    gradient_exceeded: &mut bool,
) -> Option<StopCode> {
    let stats = sample.stats()?;
    match (stats.gradient_error, stats.gradient_relative_error) {
        (Some(_), Some(relative)) => {
            if !config.going_inwards && (relative > config.maxgerr || stats.gradient >= 0.0) {
                if *gradient_exceeded {
                    return Some(StopCode::Diverging);
                }
                *gradient_exceeded = true;
            }
        }
        _ => return Some(StopCode::Diverging),
    }

    let g = sample.geometry();
    if !(g.eps() <= config.max_eps) {
        return Some(StopCode::Diverging);
    }

    let (h, w) = sample.image().dim();
    if g.x0() < 1.0 || g.x0() > w as f64 || g.y0() < 1.0 || g.y0() > h as f64 {
        return Some(StopCode::DiskEdge);
    }
    None
}

/// Evaluates the single central pixel, without iterating.
pub struct CentralFitter<'a> {
    sample: Sample<'a>,
}

impl<'a> CentralFitter<'a> {
    pub fn new(sample: Sample<'a>) -> Self {
        Self { sample }
    }

    pub fn fit(self) -> Isophote<'a> {
        let sample = self.sample.into_central().update();
        debug!(
            x0 = sample.geometry().x0(),
            y0 = sample.geometry().y0(),
            "Central pixel evaluated"
        );
        Isophote::central(sample)
    }
}
