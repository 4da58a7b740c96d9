#![allow(dead_code)]

use ndarray::Array2;

use isofit_core::testdata::{make_test_image, TestImageParams};

/// Seed shared by every synthetic image in the test suite.
pub const SEED: u64 = 123;

/// Galaxy center of the default test image.
pub const DEFAULT_POS: f64 = 256.0;

/// Default 512x512 galaxy: center (256, 256), sma 40, eps 0.2, pa 0.
pub fn default_image() -> Array2<f32> {
    make_test_image(&TestImageParams::default(), SEED).unwrap()
}

/// Test image with selected parameters overridden.
pub fn image_with(params: TestImageParams) -> Array2<f32> {
    make_test_image(&params, SEED).unwrap()
}

/// Flat disk of `radius` pixels on a faint horizontal ramp.
pub fn disk_image(h: usize, w: usize, cx: f64, cy: f64, radius: f64) -> Array2<f32> {
    Array2::from_shape_fn((h, w), |(row, col)| {
        let dx = col as f64 - cx;
        let dy = row as f64 - cy;
        let disk = if dx * dx + dy * dy <= radius * radius {
            10.0
        } else {
            0.0
        };
        (disk + 0.01 * col as f64) as f32
    })
}

/// `row + col` at every pixel.
pub fn ramp_image(h: usize, w: usize) -> Array2<f32> {
    Array2::from_shape_fn((h, w), |(row, col)| (row + col) as f32)
}
