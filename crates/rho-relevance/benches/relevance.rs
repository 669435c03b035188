//! Criterion benchmarks for the relevance engine.
//!
//! Run with: cargo bench -p rho-relevance
//! HTML reports: target/criterion/report/index.html

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use ndarray::{Array1, Array2, Array4, ArrayD, IxDyn};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rho_relevance::{
    Activation, AnalyzerConfig, Conv2dLayer, DenseLayer, FlattenLayer, Layer, LrpAnalyzer,
    MaxPool2dLayer, Network, RuleKind, ZRule,
};

fn random_vec(rng: &mut StdRng, n: usize) -> Vec<f32> {
    (0..n).map(|_| rng.gen_range(-0.5f32..0.5)).collect()
}

fn dense_stack(rng: &mut StdRng, dims: &[usize]) -> Network {
    let mut layers = Vec::new();
    for (i, pair) in dims.windows(2).enumerate() {
        let (inp, out) = (pair[0], pair[1]);
        let activation = if i + 2 == dims.len() {
            Activation::Linear
        } else {
            Activation::Relu
        };
        layers.push(Layer::Dense(
            DenseLayer::new(
                Array2::from_shape_vec((out, inp), random_vec(rng, inp * out)).unwrap(),
                Some(Array1::from_vec(random_vec(rng, out))),
                activation,
            )
            .unwrap(),
        ));
    }
    Network::new(layers)
}

fn conv_net(rng: &mut StdRng, channels: usize, side: usize) -> Network {
    let conv_w =
        Array4::from_shape_vec((channels, 1, 3, 3), random_vec(rng, channels * 9)).unwrap();
    let pooled = (side - 2) / 2;
    let flat = channels * pooled * pooled;
    Network::new(vec![
        Layer::Conv2d(
            Conv2dLayer::new(
                conv_w,
                Some(Array1::from_vec(random_vec(rng, channels))),
                (1, 1),
                (0, 0),
                Activation::Relu,
            )
            .unwrap(),
        ),
        Layer::MaxPool2d(MaxPool2dLayer::new((2, 2))),
        Layer::Flatten(FlattenLayer),
        Layer::Dense(
            DenseLayer::new(
                Array2::from_shape_vec((10, flat), random_vec(rng, 10 * flat)).unwrap(),
                None,
                Activation::Linear,
            )
            .unwrap(),
        ),
    ])
}

fn bench_dense_analyze(c: &mut Criterion) {
    let mut group = c.benchmark_group("analyze/dense");
    let mut rng = StdRng::seed_from_u64(7);

    for width in [64usize, 256, 512] {
        let network = dense_stack(&mut rng, &[width, width, width, 10]);
        let input =
            ArrayD::from_shape_vec(IxDyn(&[width]), random_vec(&mut rng, width)).unwrap();
        let analyzer = LrpAnalyzer::new(network, AnalyzerConfig::lrp_epsilon()).unwrap();

        group.throughput(Throughput::Elements((width * width) as u64));
        group.bench_with_input(BenchmarkId::new("epsilon", width), &input, |b, input| {
            b.iter(|| analyzer.analyze(black_box(input)))
        });
    }
    group.finish();
}

fn bench_conv_analyze(c: &mut Criterion) {
    let mut group = c.benchmark_group("analyze/conv");
    let mut rng = StdRng::seed_from_u64(11);

    for side in [16usize, 28] {
        let network = conv_net(&mut rng, 4, side);
        let input = ArrayD::from_shape_vec(
            IxDyn(&[1, side, side]),
            random_vec(&mut rng, side * side),
        )
        .unwrap();
        let analyzer = LrpAnalyzer::new(network, AnalyzerConfig::lrp_z()).unwrap();

        group.throughput(Throughput::Elements((side * side) as u64));
        group.bench_with_input(BenchmarkId::new("z", side), &input, |b, input| {
            b.iter(|| analyzer.analyze(black_box(input)))
        });
    }
    group.finish();
}

fn bench_rule_apply(c: &mut Criterion) {
    let mut group = c.benchmark_group("rule/apply");
    let mut rng = StdRng::seed_from_u64(3);

    for width in [64usize, 512] {
        let layer = Layer::Dense(
            DenseLayer::new(
                Array2::from_shape_vec((width, width), random_vec(&mut rng, width * width))
                    .unwrap(),
                None,
                Activation::Linear,
            )
            .unwrap(),
        );
        let rule = ZRule::new(&layer).unwrap();
        let x = ArrayD::from_shape_vec(IxDyn(&[width]), random_vec(&mut rng, width)).unwrap();
        let r = ArrayD::from_shape_vec(IxDyn(&[width]), random_vec(&mut rng, width)).unwrap();

        group.throughput(Throughput::Elements((width * width) as u64));
        group.bench_with_input(
            BenchmarkId::new("z", width),
            &(&rule, &x, &r),
            |b, (rule, x, r)| b.iter(|| rule.apply(black_box(x), black_box(r))),
        );
    }
    group.finish();
}

fn bench_rule_instantiate(c: &mut Criterion) {
    let mut group = c.benchmark_group("rule/instantiate");
    let mut rng = StdRng::seed_from_u64(5);

    let layer = Layer::Dense(
        DenseLayer::new(
            Array2::from_shape_vec((256, 256), random_vec(&mut rng, 256 * 256)).unwrap(),
            Some(Array1::from_vec(random_vec(&mut rng, 256))),
            Activation::Relu,
        )
        .unwrap(),
    );

    for kind in [RuleKind::Z, RuleKind::WSquare, RuleKind::alpha1_beta1()] {
        group.bench_with_input(
            BenchmarkId::new("dense_256", kind.name()),
            &kind,
            |b, kind| b.iter(|| kind.instantiate(black_box(&layer))),
        );
    }
    group.finish();
}

criterion_group!(
    benches,
    bench_dense_analyze,
    bench_conv_analyze,
    bench_rule_apply,
    bench_rule_instantiate
);
criterion_main!(benches);
