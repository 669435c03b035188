//! Integration-style tests for the relevance engine.
//!
//! Shared fixtures live here; each submodule covers one seam of the
//! engine (rule math, dispatch, conservation, gradient equivalence).

pub use crate::*;

use ndarray::{arr1, Array1, Array2, Array4, ArrayD, IxDyn};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

mod dispatch;

/// Dense layer from row slices.
pub fn dense_from(rows: &[&[f32]], bias: Option<&[f32]>, activation: Activation) -> Layer {
    let nrows = rows.len();
    let ncols = rows[0].len();
    let data: Vec<f32> = rows.iter().flat_map(|r| r.iter().copied()).collect();
    Layer::Dense(
        DenseLayer::new(
            Array2::from_shape_vec((nrows, ncols), data).unwrap(),
            bias.map(|b| arr1(b)),
            activation,
        )
        .unwrap(),
    )
}

/// Two linear dense layers, no biases: 2 -> 2 -> 1.
pub fn two_dense_net() -> Network {
    Network::new(vec![
        dense_from(&[&[1.0, 0.0], &[0.0, 3.0]], None, Activation::Linear),
        dense_from(&[&[1.0, 1.0]], None, Activation::Linear),
    ])
}

/// Small convolutional classifier with biases and fused rectifiers:
/// conv(2@1x2x2, relu) -> maxpool(2x2) -> flatten -> dense(relu) -> dense.
///
/// Weights are seeded random values; with continuous draws the
/// pre-activations are never exactly zero and pool maxima are unique,
/// which the gradient-equivalence check relies on.
pub fn conv_classifier(seed: u64) -> Network {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut draw = |n: usize| -> Vec<f32> {
        (0..n).map(|_| rng.gen_range(-0.7f32..0.7)).collect()
    };

    let conv_w = Array4::from_shape_vec((2, 1, 2, 2), draw(8)).unwrap();
    let conv_b = Array1::from_vec(draw(2));
    // conv: (1, 5, 5) -> (2, 4, 4); pool -> (2, 2, 2); flatten -> (8,)
    let dense1_w = Array2::from_shape_vec((4, 8), draw(32)).unwrap();
    let dense1_b = Array1::from_vec(draw(4));
    let dense2_w = Array2::from_shape_vec((2, 4), draw(8)).unwrap();
    let dense2_b = Array1::from_vec(draw(2));

    Network::new(vec![
        Layer::Conv2d(
            Conv2dLayer::new(conv_w, Some(conv_b), (1, 1), (0, 0), Activation::Relu).unwrap(),
        ),
        Layer::MaxPool2d(MaxPool2dLayer::new((2, 2))),
        Layer::Flatten(FlattenLayer),
        Layer::Dense(DenseLayer::new(dense1_w, Some(dense1_b), Activation::Relu).unwrap()),
        Layer::Dense(DenseLayer::new(dense2_w, Some(dense2_b), Activation::Linear).unwrap()),
    ])
}

/// Seeded random input tensor with values in (-1, 1).
pub fn random_input(shape: &[usize], seed: u64) -> ArrayD<f32> {
    let mut rng = StdRng::seed_from_u64(seed);
    let n: usize = shape.iter().product();
    let data: Vec<f32> = (0..n).map(|_| rng.gen_range(-1.0f32..1.0)).collect();
    ArrayD::from_shape_vec(IxDyn(shape), data).unwrap()
}

/// Assert element-wise closeness with a relative-plus-absolute tolerance.
pub fn assert_all_close(actual: &ArrayD<f32>, expected: &ArrayD<f32>, tol: f32) {
    assert_eq!(actual.shape(), expected.shape());
    for (i, (&a, &e)) in actual.iter().zip(expected.iter()).enumerate() {
        let bound = tol * (1.0 + e.abs());
        assert!(
            (a - e).abs() <= bound,
            "mismatch at flat index {}: {} vs {}",
            i,
            a,
            e
        );
    }
}
