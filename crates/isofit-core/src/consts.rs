use std::f64::consts::FRAC_PI_4;

/// Default ellipticity of a starting geometry built from an image center.
pub const DEFAULT_EPS: f64 = 0.2;

/// Default radial step between consecutive ellipses (fraction of sma for
/// geometric growth, pixels for linear growth).
pub const DEFAULT_ASTEP: f64 = 0.1;

/// Lower clamp for the angular width of an elliptical sector (radians).
pub const PHI_MIN: f64 = 0.05;

/// Upper clamp for the angular width of an elliptical sector (radians).
pub const PHI_MAX: f64 = 0.2;

/// Largest polar-angle increment taken while walking an ellipse (radians).
pub const MAX_PHI_STEP: f64 = 0.5;

/// Overshoot past a full turn so the walk closes the ellipse.
pub const WALK_OVERSHOOT: f64 = 0.05;

/// Inner sector width is never computed from more than this many pixels
/// of radial extent.
pub const MAX_INNER_SECTOR_WIDTH: f64 = 3.0;

/// Area integrators with fewer accumulated pixels fall back to bilinear.
pub const MIN_AREA_INTEGRATOR_PIXELS: usize = 7;

/// Area integrators whose sectors are smaller than this (pixels) are
/// replaced by bilinear integration for the whole walk.
pub const MIN_AREA_INTEGRATOR_SECTOR: f64 = 1.0;

/// Sector area reported by the bilinear integrator.
pub const BILINEAR_SECTOR_AREA: f64 = 2.0;

/// Sector area reported by the nearest-neighbor integrator.
pub const NEAREST_SECTOR_AREA: f64 = 1.0;

/// Gradient assumed when no previous estimate exists.
pub const DEFAULT_PREVIOUS_GRADIENT: f64 = -0.05;

/// A measured gradient must be steeper than this fraction of the previous one.
pub const GRADIENT_ACCEPT_FRACTION: f64 = 1.0 / 3.0;

/// Factor applied to the previous gradient when no gradient can be measured.
pub const FALLBACK_GRADIENT_FACTOR: f64 = 0.8;

/// Gradient relative error assumed for harmonic deviations when none was measured.
pub const DEFAULT_GRADIENT_RELATIVE_ERROR: f64 = 0.64;

/// Default sigma-clipping threshold in standard deviations.
pub const DEFAULT_SCLIP: f64 = 3.0;

/// Number of coefficients in the first+second harmonic model.
pub const HARMONIC_COEFFICIENTS: usize = 5;

/// Number of coefficients in a single upper harmonic model.
pub const UPPER_HARMONIC_COEFFICIENTS: usize = 3;

/// Largest deviation of `N * N^-1` from identity accepted for a normal matrix.
pub const SINGULAR_TOLERANCE: f64 = 1e-6;

/// Default convergence criterion (fraction of residual rms times sector area).
pub const DEFAULT_CONVERGENCE: f64 = 0.05;

/// Default minimum number of iterations before convergence is accepted.
pub const DEFAULT_MIN_ITERATIONS: usize = 10;

/// Default maximum number of iterations.
pub const DEFAULT_MAX_ITERATIONS: usize = 50;

/// Default minimum fraction of valid sample points.
pub const DEFAULT_FLAGGED_FRACTION: f64 = 0.7;

/// Default maximum acceptable gradient relative error.
pub const DEFAULT_MAX_GRADIENT_ERROR: f64 = 0.5;

/// Largest ellipticity a correction may produce.
pub const MAX_EPS: f64 = 0.95;

/// Ellipticity substituted for an exact circle so the position angle stays defined.
pub const MIN_EPS: f64 = 0.05;

/// Below this ellipticity, position-angle corrections are frozen.
pub const DEFAULT_PA_FREEZE_EPS: f64 = 0.05;

/// Undamped sign flips tolerated before a fit is declared diverging.
pub const DEFAULT_MAX_OSCILLATIONS: usize = 8;

/// Largest center shift per iteration as a fraction of sma.
pub const DEFAULT_MAX_POSITION_STEP_FRACTION: f64 = 0.25;

/// The center shift cap never drops below this many pixels.
pub const MIN_POSITION_STEP: f64 = 1.0;

/// Largest ellipticity change per iteration.
pub const DEFAULT_MAX_EPS_STEP: f64 = 0.25;

/// Largest position-angle change per iteration (radians).
pub const DEFAULT_MAX_PA_STEP: f64 = FRAC_PI_4;

/// Half size of the candidate window scanned by the center finder.
pub const CENTERER_WINDOW_HALF_SIZE: i64 = 5;

/// Half size of the stamp used to score one candidate center.
pub const CENTERER_MASK_HALF_SIZE: i64 = 10;

/// Radius of the inner disk of the center finder stamp.
pub const CENTERER_INNER_RADIUS: f64 = 4.0;

/// Inner radius of the outer annulus of the center finder stamp.
pub const CENTERER_OUTER_RADIUS: f64 = 7.0;

/// Default figure-of-merit threshold for accepting a new center.
pub const DEFAULT_CENTERER_THRESHOLD: f64 = 0.1;

/// Minimum geometry count to fit in parallel with Rayon.
pub const PARALLEL_FIT_THRESHOLD: usize = 4;

/// Exponent constant of the de Vaucouleurs r^1/4 law used for test images.
pub const DE_VAUCOULEURS_B: f64 = 7.669;
