//! Numerical stabilization of relevance denominators.
//!
//! The proportional redistribution step of most rules divides incoming
//! relevance by the de-activated layer output `Z`. Where `Z` can be zero,
//! the Epsilon rule shifts the denominator away from zero by a signed
//! epsilon; zero is treated as positive so the result is never exactly
//! zero for finite input.

use ndarray::ArrayD;

/// Default stabilization constant.
pub const DEFAULT_EPSILON: f32 = 1e-7;

/// `x + sign(x) * DEFAULT_EPSILON`, with `sign(0) = +1`.
pub fn stabilize(x: &ArrayD<f32>) -> ArrayD<f32> {
    stabilize_with(x, DEFAULT_EPSILON)
}

/// `x + sign(x) * epsilon`, with `sign(0) = +1`.
pub fn stabilize_with(x: &ArrayD<f32>, epsilon: f32) -> ArrayD<f32> {
    x.mapv(|v| if v >= 0.0 { v + epsilon } else { v - epsilon })
}
