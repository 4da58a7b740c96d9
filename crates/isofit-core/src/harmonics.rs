//! Least-squares fits of angular harmonics to sampled intensities.
//!
//! Both models are linear in their coefficients, so the fit solves the
//! normal equations directly. The covariance returned is the unscaled
//! `(J^T J)^-1`; standard errors scale it by the residual rms.

use nalgebra::{DMatrix, DVector};

use crate::consts::{HARMONIC_COEFFICIENTS, SINGULAR_TOLERANCE, UPPER_HARMONIC_COEFFICIENTS};
use crate::error::{IsofitError, Result};

/// Fit of `y0 + a1 sin t + b1 cos t + a2 sin 2t + b2 cos 2t`.
#[derive(Clone, Debug)]
pub struct HarmonicFit {
    /// `[y0, a1, b1, a2, b2]`.
    pub coefficients: [f64; HARMONIC_COEFFICIENTS],
    /// Unscaled covariance `(J^T J)^-1`.
    pub covariance: [[f64; HARMONIC_COEFFICIENTS]; HARMONIC_COEFFICIENTS],
    /// Standard errors of the coefficients.
    pub errors: [f64; HARMONIC_COEFFICIENTS],
    /// Population standard deviation of the fit residuals.
    pub residual_std: f64,
}

impl HarmonicFit {
    pub fn y0(&self) -> f64 {
        self.coefficients[0]
    }

    /// The four harmonic amplitudes `[a1, b1, a2, b2]`.
    pub fn harmonics(&self) -> [f64; 4] {
        [
            self.coefficients[1],
            self.coefficients[2],
            self.coefficients[3],
            self.coefficients[4],
        ]
    }

    /// Model value at angle `phi`.
    pub fn evaluate(&self, phi: f64) -> f64 {
        first_and_second_harmonic_function(phi, &self.coefficients)
    }
}

/// Fit of `y0 + an sin(n t) + bn cos(n t)`.
#[derive(Clone, Debug)]
pub struct UpperHarmonicFit {
    pub order: u32,
    /// `[y0, an, bn]`.
    pub coefficients: [f64; UPPER_HARMONIC_COEFFICIENTS],
    pub covariance: [[f64; UPPER_HARMONIC_COEFFICIENTS]; UPPER_HARMONIC_COEFFICIENTS],
    pub errors: [f64; UPPER_HARMONIC_COEFFICIENTS],
    pub residual_std: f64,
}

/// Evaluate the first+second harmonic model.
pub fn first_and_second_harmonic_function(phi: f64, c: &[f64; HARMONIC_COEFFICIENTS]) -> f64 {
    c[0] + c[1] * phi.sin() + c[2] * phi.cos() + c[3] * (2.0 * phi).sin() + c[4] * (2.0 * phi).cos()
}

fn first_and_second_basis(phi: f64) -> [f64; HARMONIC_COEFFICIENTS] {
    [
        1.0,
        phi.sin(),
        phi.cos(),
        (2.0 * phi).sin(),
        (2.0 * phi).cos(),
    ]
}

/// Fit the first and second harmonics to `intensities` sampled at `angles`.
pub fn fit_first_and_second_harmonics(angles: &[f64], intensities: &[f64]) -> Result<HarmonicFit> {
    let solution =
        least_squares::<HARMONIC_COEFFICIENTS>(angles, intensities, first_and_second_basis)?;
    Ok(HarmonicFit {
        coefficients: solution.coefficients,
        covariance: solution.covariance,
        errors: solution.errors,
        residual_std: solution.residual_std,
    })
}

/// Fit a single harmonic of order `order` to `intensities` sampled at `angles`.
pub fn fit_upper_harmonic(
    angles: &[f64],
    intensities: &[f64],
    order: u32,
) -> Result<UpperHarmonicFit> {
    let n = order as f64;
    let solution = least_squares::<UPPER_HARMONIC_COEFFICIENTS>(angles, intensities, |phi| {
        [1.0, (n * phi).sin(), (n * phi).cos()]
    })?;
    Ok(UpperHarmonicFit {
        order,
        coefficients: solution.coefficients,
        covariance: solution.covariance,
        errors: solution.errors,
        residual_std: solution.residual_std,
    })
}

struct Solution<const N: usize> {
    coefficients: [f64; N],
    covariance: [[f64; N]; N],
    errors: [f64; N],
    residual_std: f64,
}

fn least_squares<const N: usize>(
    angles: &[f64],
    intensities: &[f64],
    basis: impl Fn(f64) -> [f64; N],
) -> Result<Solution<N>> {
    if angles.len() != intensities.len() {
        return Err(IsofitError::LengthMismatch {
            angles: angles.len(),
            intensities: intensities.len(),
        });
    }
    if angles.len() < N {
        return Err(IsofitError::Underdetermined {
            needed: N,
            got: angles.len(),
        });
    }

    let mut normal = DMatrix::<f64>::zeros(N, N);
    let mut rhs = DVector::<f64>::zeros(N);
    for (&phi, &y) in angles.iter().zip(intensities) {
        let row = DVector::from_vec(basis(phi).to_vec());
        normal += &row * row.transpose();
        rhs += &row * y;
    }

    let inverse = normal
        .clone()
        .try_inverse()
        .ok_or(IsofitError::SingularMatrix)?;
    // A near-singular system inverts to garbage rather than failing.
    let identity_error = (&normal * &inverse - DMatrix::<f64>::identity(N, N))
        .iter()
        .fold(0.0_f64, |acc, v| acc.max(v.abs()));
    if !identity_error.is_finite() || identity_error > SINGULAR_TOLERANCE {
        return Err(IsofitError::SingularMatrix);
    }
    let solution = &inverse * rhs;

    let mut coefficients = [0.0; N];
    for (c, s) in coefficients.iter_mut().zip(solution.iter()) {
        *c = *s;
    }
    let residuals: Vec<f64> = angles
        .iter()
        .zip(intensities)
        .map(|(&phi, &y)| {
            let model: f64 = basis(phi).iter().zip(&coefficients).map(|(b, c)| b * c).sum();
            y - model
        })
        .collect();
    let residual_std = population_std(&residuals);

    let mut covariance = [[0.0; N]; N];
    let mut errors = [0.0; N];
    for i in 0..N {
        for j in 0..N {
            covariance[i][j] = inverse[(i, j)];
        }
        errors[i] = inverse[(i, i)].max(0.0).sqrt() * residual_std;
    }

    Ok(Solution {
        coefficients,
        covariance,
        errors,
        residual_std,
    })
}

pub(crate) fn population_std(values: &[f64]) -> f64 {
    if values.is_empty() {
        return f64::NAN;
    }
    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    (values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n).sqrt()
}
