//! Forward layers and their vector-Jacobian products.
//!
//! The rule engine needs three things from the forward model: evaluating a
//! node, the VJP of a node's outputs with respect to its input (the
//! gradient-of-subgraph primitive), and derived copies of kernel layers
//! with the activation stripped and the weights masked (weight surgery).
//! All of it lives here, on single-sample `f32` tensors.
//!
//! Shape conventions:
//! - Dense: input `(in,)`, kernel `(out, in)`, output `(out,)`
//! - Conv2d: input `(c_in, h, w)`, kernel `(c_out, c_in, kh, kw)`,
//!   output `(c_out, oh, ow)` with zero padding and stride support
//! - Pooling: input/output `(c, h, w)`; Flatten: anything -> `(n,)`

use ndarray::{Array1, Array2, Array3, Array4, ArrayD, Ix1, Ix3, IxDyn};
use rho_core::{Activation, LayerKind, Result, RhoError};

fn shape_err(expected: &[usize], got: &[usize]) -> RhoError {
    RhoError::ShapeMismatch {
        expected: expected.to_vec(),
        got: got.to_vec(),
    }
}

/// Fully connected layer: `y = act(W x + b)`.
#[derive(Debug, Clone)]
pub struct DenseLayer {
    /// Kernel, shape `(out, in)`.
    pub weights: Array2<f32>,
    /// Optional bias, shape `(out,)`.
    pub bias: Option<Array1<f32>>,
    pub activation: Activation,
}

impl DenseLayer {
    pub fn new(
        weights: Array2<f32>,
        bias: Option<Array1<f32>>,
        activation: Activation,
    ) -> Result<Self> {
        if let Some(b) = &bias {
            if b.len() != weights.nrows() {
                return Err(shape_err(&[weights.nrows()], &[b.len()]));
            }
        }
        Ok(Self {
            weights,
            bias,
            activation,
        })
    }

    pub fn in_features(&self) -> usize {
        self.weights.ncols()
    }

    pub fn out_features(&self) -> usize {
        self.weights.nrows()
    }

    /// Pre-activation output `W x + b`.
    fn pre_activation(&self, x: &ArrayD<f32>) -> Result<Array1<f32>> {
        let x1 = x
            .view()
            .into_dimensionality::<Ix1>()
            .map_err(|_| shape_err(&[self.in_features()], x.shape()))?;
        if x1.len() != self.in_features() {
            return Err(shape_err(&[self.in_features()], x.shape()));
        }
        let mut z = self.weights.dot(&x1);
        if let Some(b) = &self.bias {
            z += b;
        }
        Ok(z)
    }

    fn forward(&self, x: &ArrayD<f32>) -> Result<ArrayD<f32>> {
        let z = self.pre_activation(x)?;
        Ok(apply_activation(self.activation, z.into_dyn()))
    }

    fn vjp(&self, x: &ArrayD<f32>, cotangent: &ArrayD<f32>) -> Result<ArrayD<f32>> {
        let s = cotangent
            .view()
            .into_dimensionality::<Ix1>()
            .map_err(|_| shape_err(&[self.out_features()], cotangent.shape()))?;
        if s.len() != self.out_features() {
            return Err(shape_err(&[self.out_features()], cotangent.shape()));
        }
        let z = self.pre_activation(x)?;
        let s_eff = &s.to_owned() * &activation_grad(self.activation, &z);
        Ok(self.weights.t().dot(&s_eff).into_dyn())
    }
}

/// 2-D convolution: `y = act(conv(x, W) + b)`, zero padding.
#[derive(Debug, Clone)]
pub struct Conv2dLayer {
    /// Kernel, shape `(c_out, c_in, kh, kw)`.
    pub weights: Array4<f32>,
    /// Optional bias, shape `(c_out,)`.
    pub bias: Option<Array1<f32>>,
    pub stride: (usize, usize),
    pub padding: (usize, usize),
    pub activation: Activation,
}

impl Conv2dLayer {
    pub fn new(
        weights: Array4<f32>,
        bias: Option<Array1<f32>>,
        stride: (usize, usize),
        padding: (usize, usize),
        activation: Activation,
    ) -> Result<Self> {
        if stride.0 == 0 || stride.1 == 0 {
            return Err(RhoError::InvalidConfig("conv stride must be >= 1".into()));
        }
        if let Some(b) = &bias {
            if b.len() != weights.dim().0 {
                return Err(shape_err(&[weights.dim().0], &[b.len()]));
            }
        }
        Ok(Self {
            weights,
            bias,
            stride,
            padding,
            activation,
        })
    }

    fn as_3d<'a>(&self, x: &'a ArrayD<f32>) -> Result<ndarray::ArrayView3<'a, f32>> {
        x.view()
            .into_dimensionality::<Ix3>()
            .map_err(|_| shape_err(&[self.weights.dim().1, 0, 0], x.shape()))
    }

    fn pre_activation(&self, x: &ArrayD<f32>) -> Result<Array3<f32>> {
        let x3 = self.as_3d(x)?;
        conv2d_single(
            &x3.to_owned(),
            &self.weights,
            self.bias.as_ref(),
            self.stride,
            self.padding,
        )
    }

    fn forward(&self, x: &ArrayD<f32>) -> Result<ArrayD<f32>> {
        let z = self.pre_activation(x)?;
        Ok(apply_activation(self.activation, z.into_dyn()))
    }

    fn vjp(&self, x: &ArrayD<f32>, cotangent: &ArrayD<f32>) -> Result<ArrayD<f32>> {
        let z = self.pre_activation(x)?;
        let s3 = cotangent
            .view()
            .into_dimensionality::<Ix3>()
            .map_err(|_| shape_err(z.shape(), cotangent.shape()))?;
        if s3.dim() != z.dim() {
            return Err(shape_err(z.shape(), cotangent.shape()));
        }
        let s_eff = &s3.to_owned() * &activation_grad3(self.activation, &z);
        let x3 = self.as_3d(x)?;
        let g = conv2d_transpose(&s_eff, &self.weights, self.stride, self.padding, x3.dim())?;
        Ok(g.into_dyn())
    }
}

/// Max pooling over non-overlapping or strided windows, no padding.
#[derive(Debug, Clone, Copy)]
pub struct MaxPool2dLayer {
    pub kernel: (usize, usize),
    pub stride: (usize, usize),
}

impl MaxPool2dLayer {
    pub fn new(kernel: (usize, usize)) -> Self {
        Self {
            kernel,
            stride: kernel,
        }
    }

    pub fn with_stride(kernel: (usize, usize), stride: (usize, usize)) -> Self {
        Self { kernel, stride }
    }

    fn out_dims(&self, c: usize, h: usize, w: usize) -> Result<(usize, usize, usize)> {
        let (kh, kw) = self.kernel;
        let (sh, sw) = self.stride;
        if h < kh || w < kw {
            return Err(shape_err(&[c, kh, kw], &[c, h, w]));
        }
        Ok((c, (h - kh) / sh + 1, (w - kw) / sw + 1))
    }

    fn forward(&self, x: &ArrayD<f32>) -> Result<ArrayD<f32>> {
        let x3 = as_chw(x)?;
        let (c, h, w) = x3.dim();
        let (_, oh, ow) = self.out_dims(c, h, w)?;
        let (kh, kw) = self.kernel;
        let (sh, sw) = self.stride;
        let mut out = Array3::<f32>::zeros((c, oh, ow));
        for ch in 0..c {
            for i in 0..oh {
                for j in 0..ow {
                    let mut best = f32::NEG_INFINITY;
                    for u in 0..kh {
                        for v in 0..kw {
                            best = best.max(x3[[ch, i * sh + u, j * sw + v]]);
                        }
                    }
                    out[[ch, i, j]] = best;
                }
            }
        }
        Ok(out.into_dyn())
    }

    /// Routes the cotangent to the (first) maximum of each window.
    fn vjp(&self, x: &ArrayD<f32>, cotangent: &ArrayD<f32>) -> Result<ArrayD<f32>> {
        let x3 = as_chw(x)?;
        let (c, h, w) = x3.dim();
        let (_, oh, ow) = self.out_dims(c, h, w)?;
        let s3 = cotangent
            .view()
            .into_dimensionality::<Ix3>()
            .map_err(|_| shape_err(&[c, oh, ow], cotangent.shape()))?;
        if s3.dim() != (c, oh, ow) {
            return Err(shape_err(&[c, oh, ow], cotangent.shape()));
        }
        let (kh, kw) = self.kernel;
        let (sh, sw) = self.stride;
        let mut g = Array3::<f32>::zeros((c, h, w));
        for ch in 0..c {
            for i in 0..oh {
                for j in 0..ow {
                    let mut best = f32::NEG_INFINITY;
                    let mut arg = (0, 0);
                    for u in 0..kh {
                        for v in 0..kw {
                            let val = x3[[ch, i * sh + u, j * sw + v]];
                            if val > best {
                                best = val;
                                arg = (i * sh + u, j * sw + v);
                            }
                        }
                    }
                    g[[ch, arg.0, arg.1]] += s3[[ch, i, j]];
                }
            }
        }
        Ok(g.into_dyn())
    }
}

/// Average pooling, no padding.
#[derive(Debug, Clone, Copy)]
pub struct AvgPool2dLayer {
    pub kernel: (usize, usize),
    pub stride: (usize, usize),
}

impl AvgPool2dLayer {
    pub fn new(kernel: (usize, usize)) -> Self {
        Self {
            kernel,
            stride: kernel,
        }
    }

    fn out_dims(&self, c: usize, h: usize, w: usize) -> Result<(usize, usize, usize)> {
        let (kh, kw) = self.kernel;
        let (sh, sw) = self.stride;
        if h < kh || w < kw {
            return Err(shape_err(&[c, kh, kw], &[c, h, w]));
        }
        Ok((c, (h - kh) / sh + 1, (w - kw) / sw + 1))
    }

    fn forward(&self, x: &ArrayD<f32>) -> Result<ArrayD<f32>> {
        let x3 = as_chw(x)?;
        let (c, h, w) = x3.dim();
        let (_, oh, ow) = self.out_dims(c, h, w)?;
        let (kh, kw) = self.kernel;
        let (sh, sw) = self.stride;
        let norm = (kh * kw) as f32;
        let mut out = Array3::<f32>::zeros((c, oh, ow));
        for ch in 0..c {
            for i in 0..oh {
                for j in 0..ow {
                    let mut acc = 0.0;
                    for u in 0..kh {
                        for v in 0..kw {
                            acc += x3[[ch, i * sh + u, j * sw + v]];
                        }
                    }
                    out[[ch, i, j]] = acc / norm;
                }
            }
        }
        Ok(out.into_dyn())
    }

    fn vjp(&self, x: &ArrayD<f32>, cotangent: &ArrayD<f32>) -> Result<ArrayD<f32>> {
        let x3 = as_chw(x)?;
        let (c, h, w) = x3.dim();
        let (_, oh, ow) = self.out_dims(c, h, w)?;
        let s3 = cotangent
            .view()
            .into_dimensionality::<Ix3>()
            .map_err(|_| shape_err(&[c, oh, ow], cotangent.shape()))?;
        if s3.dim() != (c, oh, ow) {
            return Err(shape_err(&[c, oh, ow], cotangent.shape()));
        }
        let (kh, kw) = self.kernel;
        let (sh, sw) = self.stride;
        let norm = (kh * kw) as f32;
        let mut g = Array3::<f32>::zeros((c, h, w));
        for ch in 0..c {
            for i in 0..oh {
                for j in 0..ow {
                    let share = s3[[ch, i, j]] / norm;
                    for u in 0..kh {
                        for v in 0..kw {
                            g[[ch, i * sh + u, j * sw + v]] += share;
                        }
                    }
                }
            }
        }
        Ok(g.into_dyn())
    }
}

/// Flatten to a 1-D vector (row-major order).
#[derive(Debug, Clone, Copy, Default)]
pub struct FlattenLayer;

impl FlattenLayer {
    fn forward(&self, x: &ArrayD<f32>) -> Result<ArrayD<f32>> {
        let flat: Vec<f32> = x.iter().copied().collect();
        let n = flat.len();
        ArrayD::from_shape_vec(IxDyn(&[n]), flat).map_err(|_| shape_err(&[n], x.shape()))
    }

    fn vjp(&self, x: &ArrayD<f32>, cotangent: &ArrayD<f32>) -> Result<ArrayD<f32>> {
        if cotangent.len() != x.len() {
            return Err(shape_err(&[x.len()], cotangent.shape()));
        }
        let flat: Vec<f32> = cotangent.iter().copied().collect();
        ArrayD::from_shape_vec(x.raw_dim(), flat).map_err(|_| shape_err(x.shape(), &[x.len()]))
    }
}

/// Standalone rectifier node (no kernel).
#[derive(Debug, Clone, Copy, Default)]
pub struct ReluLayer;

impl ReluLayer {
    fn forward(&self, x: &ArrayD<f32>) -> Result<ArrayD<f32>> {
        Ok(x.mapv(|v| v.max(0.0)))
    }

    fn vjp(&self, x: &ArrayD<f32>, cotangent: &ArrayD<f32>) -> Result<ArrayD<f32>> {
        if cotangent.shape() != x.shape() {
            return Err(shape_err(x.shape(), cotangent.shape()));
        }
        Ok(cotangent * &x.mapv(|v| if v > 0.0 { 1.0 } else { 0.0 }))
    }
}

/// A node of the forward graph.
#[derive(Debug, Clone)]
pub enum Layer {
    Dense(DenseLayer),
    Conv2d(Conv2dLayer),
    MaxPool2d(MaxPool2dLayer),
    AvgPool2d(AvgPool2dLayer),
    Flatten(FlattenLayer),
    Relu(ReluLayer),
}

impl Layer {
    pub fn kind(&self) -> LayerKind {
        match self {
            Layer::Dense(_) => LayerKind::Dense,
            Layer::Conv2d(_) => LayerKind::Conv2d,
            Layer::MaxPool2d(_) => LayerKind::MaxPool2d,
            Layer::AvgPool2d(_) => LayerKind::AvgPool2d,
            Layer::Flatten(_) => LayerKind::Flatten,
            Layer::Relu(_) => LayerKind::Relu,
        }
    }

    /// Whether this node owns learnable weights.
    ///
    /// The dispatcher only assigns rules to kernel nodes; everything else
    /// takes the default reverse mapping.
    pub fn contains_kernel(&self) -> bool {
        matches!(self, Layer::Dense(_) | Layer::Conv2d(_))
    }

    /// The fused activation, if this node has one.
    pub fn activation(&self) -> Option<Activation> {
        match self {
            Layer::Dense(l) => Some(l.activation),
            Layer::Conv2d(l) => Some(l.activation),
            _ => None,
        }
    }

    /// Single-sample forward evaluation.
    pub fn forward(&self, x: &ArrayD<f32>) -> Result<ArrayD<f32>> {
        match self {
            Layer::Dense(l) => l.forward(x),
            Layer::Conv2d(l) => l.forward(x),
            Layer::MaxPool2d(l) => l.forward(x),
            Layer::AvgPool2d(l) => l.forward(x),
            Layer::Flatten(l) => l.forward(x),
            Layer::Relu(l) => l.forward(x),
        }
    }

    /// Vector-Jacobian product of this node's output with respect to its
    /// input, evaluated at `x` and weighted by `cotangent`.
    pub fn vjp(&self, x: &ArrayD<f32>, cotangent: &ArrayD<f32>) -> Result<ArrayD<f32>> {
        match self {
            Layer::Dense(l) => l.vjp(x, cotangent),
            Layer::Conv2d(l) => l.vjp(x, cotangent),
            Layer::MaxPool2d(l) => l.vjp(x, cotangent),
            Layer::AvgPool2d(l) => l.vjp(x, cotangent),
            Layer::Flatten(l) => l.vjp(x, cotangent),
            Layer::Relu(l) => l.vjp(x, cotangent),
        }
    }

    /// Output shape for a given input shape, without evaluating.
    pub fn output_shape(&self, input_shape: &[usize]) -> Result<Vec<usize>> {
        match self {
            Layer::Dense(l) => {
                if input_shape != [l.in_features()] {
                    return Err(shape_err(&[l.in_features()], input_shape));
                }
                Ok(vec![l.out_features()])
            }
            Layer::Conv2d(l) => {
                let (c_out, c_in, kh, kw) = l.weights.dim();
                let (sh, sw) = l.stride;
                let (ph, pw) = l.padding;
                match input_shape {
                    [c, h, w] if *c == c_in && h + 2 * ph >= kh && w + 2 * pw >= kw => Ok(vec![
                        c_out,
                        (h + 2 * ph - kh) / sh + 1,
                        (w + 2 * pw - kw) / sw + 1,
                    ]),
                    _ => Err(shape_err(&[c_in, kh, kw], input_shape)),
                }
            }
            Layer::MaxPool2d(l) => match input_shape {
                [c, h, w] => {
                    let (c, oh, ow) = l.out_dims(*c, *h, *w)?;
                    Ok(vec![c, oh, ow])
                }
                _ => Err(shape_err(&[0, 0, 0], input_shape)),
            },
            Layer::AvgPool2d(l) => match input_shape {
                [c, h, w] => {
                    let (c, oh, ow) = l.out_dims(*c, *h, *w)?;
                    Ok(vec![c, oh, ow])
                }
                _ => Err(shape_err(&[0, 0, 0], input_shape)),
            },
            Layer::Flatten(_) => Ok(vec![input_shape.iter().product()]),
            Layer::Relu(_) => Ok(input_shape.to_vec()),
        }
    }
}

/// Element-wise kernel mask applied during weight surgery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WeightMask {
    Unchanged,
    /// Keep positive entries, zero the rest.
    Positive,
    /// Keep negative entries, zero the rest.
    Negative,
    /// Square every entry.
    Squared,
    /// Replace every entry by 1.
    Unit,
}

impl WeightMask {
    fn apply(&self, v: f32) -> f32 {
        match self {
            WeightMask::Unchanged => v,
            WeightMask::Positive => {
                if v > 0.0 {
                    v
                } else {
                    0.0
                }
            }
            WeightMask::Negative => {
                if v < 0.0 {
                    v
                } else {
                    0.0
                }
            }
            WeightMask::Squared => v * v,
            WeightMask::Unit => 1.0,
        }
    }
}

/// Whether the derived layer keeps the (masked) bias or drops it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BiasMode {
    Keep,
    Drop,
}

/// Build a derived copy of a kernel layer: activation stripped, weights
/// (and kept bias) transformed element-wise by `mask`.
///
/// The derived layer computes the same shape transformation as the
/// original; its numerical behavior is fully determined by the substituted
/// parameters. Deriving a kernel-free layer is an error.
pub fn derive_layer(layer: &Layer, mask: WeightMask, bias: BiasMode) -> Result<Layer> {
    match layer {
        Layer::Dense(l) => {
            let weights = l.weights.mapv(|v| mask.apply(v));
            let bias = match bias {
                BiasMode::Drop => None,
                BiasMode::Keep => l.bias.as_ref().map(|b| b.mapv(|v| mask.apply(v))),
            };
            Ok(Layer::Dense(DenseLayer {
                weights,
                bias,
                activation: Activation::Linear,
            }))
        }
        Layer::Conv2d(l) => {
            let weights = l.weights.mapv(|v| mask.apply(v));
            let bias = match bias {
                BiasMode::Drop => None,
                BiasMode::Keep => l.bias.as_ref().map(|b| b.mapv(|v| mask.apply(v))),
            };
            Ok(Layer::Conv2d(Conv2dLayer {
                weights,
                bias,
                stride: l.stride,
                padding: l.padding,
                activation: Activation::Linear,
            }))
        }
        other => Err(RhoError::UnsupportedLayer(format!(
            "cannot derive weight-masked copy of kernel-free layer {}",
            other.kind()
        ))),
    }
}

/// Direct 2-D convolution of a single sample.
pub fn conv2d_single(
    x: &Array3<f32>,
    w: &Array4<f32>,
    bias: Option<&Array1<f32>>,
    stride: (usize, usize),
    padding: (usize, usize),
) -> Result<Array3<f32>> {
    let (c_in, h, wd) = x.dim();
    let (c_out, wc_in, kh, kw) = w.dim();
    if wc_in != c_in {
        return Err(shape_err(&[wc_in, kh, kw], &[c_in, h, wd]));
    }
    let (sh, sw) = stride;
    let (ph, pw) = padding;
    if h + 2 * ph < kh || wd + 2 * pw < kw {
        return Err(shape_err(&[c_in, kh, kw], &[c_in, h, wd]));
    }
    let oh = (h + 2 * ph - kh) / sh + 1;
    let ow = (wd + 2 * pw - kw) / sw + 1;

    let mut out = Array3::<f32>::zeros((c_out, oh, ow));
    for o in 0..c_out {
        let b = bias.map(|b| b[o]).unwrap_or(0.0);
        for i in 0..oh {
            for j in 0..ow {
                let mut acc = b;
                for c in 0..c_in {
                    for u in 0..kh {
                        for v in 0..kw {
                            let hi = i * sh + u;
                            let wi = j * sw + v;
                            if hi < ph || wi < pw {
                                continue;
                            }
                            let (hi, wi) = (hi - ph, wi - pw);
                            if hi >= h || wi >= wd {
                                continue;
                            }
                            acc += w[[o, c, u, v]] * x[[c, hi, wi]];
                        }
                    }
                }
                out[[o, i, j]] = acc;
            }
        }
    }
    Ok(out)
}

/// Transposed convolution: scatters an output-shaped cotangent back to the
/// input, i.e. the VJP of [`conv2d_single`] with respect to `x`.
pub fn conv2d_transpose(
    cotangent: &Array3<f32>,
    w: &Array4<f32>,
    stride: (usize, usize),
    padding: (usize, usize),
    input_dim: (usize, usize, usize),
) -> Result<Array3<f32>> {
    let (c_in, h, wd) = input_dim;
    let (c_out, wc_in, kh, kw) = w.dim();
    if wc_in != c_in {
        return Err(shape_err(&[wc_in, kh, kw], &[c_in, h, wd]));
    }
    let (co, oh, ow) = cotangent.dim();
    if co != c_out {
        return Err(shape_err(&[c_out, oh, ow], &[co, oh, ow]));
    }
    let (sh, sw) = stride;
    let (ph, pw) = padding;

    let mut g = Array3::<f32>::zeros((c_in, h, wd));
    for o in 0..c_out {
        for i in 0..oh {
            for j in 0..ow {
                let s = cotangent[[o, i, j]];
                if s == 0.0 {
                    continue;
                }
                for c in 0..c_in {
                    for u in 0..kh {
                        for v in 0..kw {
                            let hi = i * sh + u;
                            let wi = j * sw + v;
                            if hi < ph || wi < pw {
                                continue;
                            }
                            let (hi, wi) = (hi - ph, wi - pw);
                            if hi >= h || wi >= wd {
                                continue;
                            }
                            g[[c, hi, wi]] += w[[o, c, u, v]] * s;
                        }
                    }
                }
            }
        }
    }
    Ok(g)
}

fn as_chw(x: &ArrayD<f32>) -> Result<ndarray::ArrayView3<'_, f32>> {
    x.view()
        .into_dimensionality::<Ix3>()
        .map_err(|_| shape_err(&[0, 0, 0], x.shape()))
}

fn apply_activation(activation: Activation, z: ArrayD<f32>) -> ArrayD<f32> {
    match activation {
        Activation::Linear => z,
        Activation::Relu => z.mapv(|v| v.max(0.0)),
        Activation::Sigmoid => z.mapv(|v| 1.0 / (1.0 + (-v).exp())),
    }
}

fn activation_grad(activation: Activation, z: &Array1<f32>) -> Array1<f32> {
    match activation {
        Activation::Linear => Array1::ones(z.len()),
        Activation::Relu => z.mapv(|v| if v > 0.0 { 1.0 } else { 0.0 }),
        Activation::Sigmoid => z.mapv(|v| {
            let s = 1.0 / (1.0 + (-v).exp());
            s * (1.0 - s)
        }),
    }
}

fn activation_grad3(activation: Activation, z: &Array3<f32>) -> Array3<f32> {
    match activation {
        Activation::Linear => Array3::ones(z.dim()),
        Activation::Relu => z.mapv(|v| if v > 0.0 { 1.0 } else { 0.0 }),
        Activation::Sigmoid => z.mapv(|v| {
            let s = 1.0 / (1.0 + (-v).exp());
            s * (1.0 - s)
        }),
    }
}
