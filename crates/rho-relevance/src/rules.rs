//! The relevance redistribution rules.
//!
//! Every rule follows the same proportional-redistribution template on a
//! kernel node with input `x`, incoming relevance `R`, and a derived copy
//! `L` of the node (activation stripped, weights possibly masked):
//!
//! 1. `Z = L(x)` (or a rule-specific variant),
//! 2. `S = R / Z` element-wise,
//! 3. pull `S` back through `L` with its VJP, and for the input-dependent
//!    rules multiply by `x`.
//!
//! Only the Epsilon rule stabilizes the denominator; the plain Z rule lets
//! a zero `Z` produce non-finite output by design of the division.

use ndarray::ArrayD;
use rho_core::Result;
use serde::{Deserialize, Serialize};

use crate::layers::{derive_layer, BiasMode, Layer, WeightMask};
use crate::network::ReverseState;
use crate::stabilize::{stabilize_with, DEFAULT_EPSILON};

/// Parameter-only description of a rule, as stored in assignments and
/// resolved through the registry. Instantiating it against a concrete
/// kernel node yields a ready-to-apply [`Rule`].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum RuleKind {
    /// Plain proportional redistribution.
    Z,
    /// Proportional redistribution with a stabilized denominator.
    Epsilon { epsilon: f32 },
    /// Redistribution by squared weight magnitude, input-independent.
    WSquare,
    /// Uniform redistribution across contributing inputs.
    Flat,
    /// Separate positive and negative contribution streams.
    AlphaBeta { alpha: f32, beta: f32 },
    /// First-layer rule for inputs confined to `[low, high]`.
    Boxed { low: f32, high: f32 },
}

impl RuleKind {
    /// Epsilon rule with the default stabilization constant.
    pub fn epsilon() -> Self {
        RuleKind::Epsilon {
            epsilon: DEFAULT_EPSILON,
        }
    }

    /// Alpha-Beta with both streams weighted 1.
    pub fn alpha1_beta1() -> Self {
        RuleKind::AlphaBeta {
            alpha: 1.0,
            beta: 1.0,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            RuleKind::Z => "Z",
            RuleKind::Epsilon { .. } => "Epsilon",
            RuleKind::WSquare => "WSquare",
            RuleKind::Flat => "Flat",
            RuleKind::AlphaBeta { .. } => "AlphaBeta",
            RuleKind::Boxed { .. } => "Boxed",
        }
    }

    /// Bind this rule to a kernel node, deriving the masked layer copies
    /// it needs. Fails on kernel-free layers.
    pub fn instantiate(&self, layer: &Layer) -> Result<Rule> {
        Ok(match *self {
            RuleKind::Z => Rule::Z(ZRule::new(layer)?),
            RuleKind::Epsilon { epsilon } => Rule::Epsilon(EpsilonRule::new(layer, epsilon)?),
            RuleKind::WSquare => Rule::WSquare(WSquareRule::new(layer)?),
            RuleKind::Flat => Rule::Flat(FlatRule::new(layer)?),
            RuleKind::AlphaBeta { alpha, beta } => {
                Rule::AlphaBeta(AlphaBetaRule::new(layer, alpha, beta)?)
            }
            RuleKind::Boxed { low, high } => Rule::Boxed(BoxedRule::new(layer, low, high)?),
        })
    }
}

/// `R_in = x * vjp(R / L(x))` with the unmodified kernel and bias.
#[derive(Debug, Clone)]
pub struct ZRule {
    layer: Layer,
}

impl ZRule {
    pub fn new(layer: &Layer) -> Result<Self> {
        Ok(Self {
            layer: derive_layer(layer, WeightMask::Unchanged, BiasMode::Keep)?,
        })
    }

    pub fn apply(&self, x: &ArrayD<f32>, r: &ArrayD<f32>) -> Result<ArrayD<f32>> {
        let z = self.layer.forward(x)?;
        let s = r / &z;
        Ok(x * &self.layer.vjp(x, &s)?)
    }
}

/// Z rule with `Z` shifted away from zero by a signed epsilon.
#[derive(Debug, Clone)]
pub struct EpsilonRule {
    layer: Layer,
    epsilon: f32,
}

impl EpsilonRule {
    pub fn new(layer: &Layer, epsilon: f32) -> Result<Self> {
        Ok(Self {
            layer: derive_layer(layer, WeightMask::Unchanged, BiasMode::Keep)?,
            epsilon,
        })
    }

    pub fn apply(&self, x: &ArrayD<f32>, r: &ArrayD<f32>) -> Result<ArrayD<f32>> {
        let z = stabilize_with(&self.layer.forward(x)?, self.epsilon);
        let s = r / &z;
        Ok(x * &self.layer.vjp(x, &s)?)
    }
}

/// Squared weights, no bias, evaluated on a ones tensor. The input values
/// never enter the redistribution.
#[derive(Debug, Clone)]
pub struct WSquareRule {
    layer: Layer,
}

impl WSquareRule {
    pub fn new(layer: &Layer) -> Result<Self> {
        Ok(Self {
            layer: derive_layer(layer, WeightMask::Squared, BiasMode::Drop)?,
        })
    }

    pub fn apply(&self, x: &ArrayD<f32>, r: &ArrayD<f32>) -> Result<ArrayD<f32>> {
        let ones = ArrayD::from_elem(x.raw_dim(), 1.0f32);
        let z = self.layer.forward(&ones)?;
        let s = r / &z;
        self.layer.vjp(&ones, &s)
    }
}

/// Unit weights, no bias: incoming relevance splits evenly across the
/// inputs wired to each output.
#[derive(Debug, Clone)]
pub struct FlatRule {
    layer: Layer,
}

impl FlatRule {
    pub fn new(layer: &Layer) -> Result<Self> {
        Ok(Self {
            layer: derive_layer(layer, WeightMask::Unit, BiasMode::Drop)?,
        })
    }

    pub fn apply(&self, x: &ArrayD<f32>, r: &ArrayD<f32>) -> Result<ArrayD<f32>> {
        let ones = ArrayD::from_elem(x.raw_dim(), 1.0f32);
        let z = self.layer.forward(&ones)?;
        let s = r / &z;
        self.layer.vjp(&ones, &s)
    }
}

/// Two Z-style streams over the positive-masked and negative-masked
/// parameters, recombined as `alpha * positive + beta * negative`.
///
/// Meaningful on rectified-linear networks; the masks apply to the bias
/// as well as the kernel.
#[derive(Debug, Clone)]
pub struct AlphaBetaRule {
    positive: Layer,
    negative: Layer,
    alpha: f32,
    beta: f32,
}

impl AlphaBetaRule {
    pub fn new(layer: &Layer, alpha: f32, beta: f32) -> Result<Self> {
        Ok(Self {
            positive: derive_layer(layer, WeightMask::Positive, BiasMode::Keep)?,
            negative: derive_layer(layer, WeightMask::Negative, BiasMode::Keep)?,
            alpha,
            beta,
        })
    }

    fn stream(layer: &Layer, x: &ArrayD<f32>, r: &ArrayD<f32>) -> Result<ArrayD<f32>> {
        let z = layer.forward(x)?;
        let s = r / &z;
        Ok(x * &layer.vjp(x, &s)?)
    }

    pub fn apply(&self, x: &ArrayD<f32>, r: &ArrayD<f32>) -> Result<ArrayD<f32>> {
        let pos = Self::stream(&self.positive, x, r)?;
        let neg = Self::stream(&self.negative, x, r)?;
        Ok(pos.mapv(|v| v * self.alpha) + neg.mapv(|v| v * self.beta))
    }
}

/// First-layer rule for inputs bounded to `[low, high]`.
///
/// The denominator is `L(x) + L+(low) + L-(high)` where `L+`/`L-` carry
/// the positive/negative-masked parameters and `low`/`high` are constant
/// tensors at the domain bounds. Only `L(x)` depends on the input, so the
/// pullback runs through the unmasked copy alone.
#[derive(Debug, Clone)]
pub struct BoxedRule {
    layer: Layer,
    positive: Layer,
    negative: Layer,
    low: f32,
    high: f32,
}

impl BoxedRule {
    pub fn new(layer: &Layer, low: f32, high: f32) -> Result<Self> {
        Ok(Self {
            layer: derive_layer(layer, WeightMask::Unchanged, BiasMode::Keep)?,
            positive: derive_layer(layer, WeightMask::Positive, BiasMode::Keep)?,
            negative: derive_layer(layer, WeightMask::Negative, BiasMode::Keep)?,
            low,
            high,
        })
    }

    pub fn apply(&self, x: &ArrayD<f32>, r: &ArrayD<f32>) -> Result<ArrayD<f32>> {
        let low = ArrayD::from_elem(x.raw_dim(), self.low);
        let high = ArrayD::from_elem(x.raw_dim(), self.high);
        let z = self.layer.forward(x)? + self.positive.forward(&low)? + self.negative.forward(&high)?;
        let s = r / &z;
        self.layer.vjp(x, &s)
    }
}

/// A rule bound to a concrete kernel node, ready to apply.
#[derive(Debug, Clone)]
pub enum Rule {
    Z(ZRule),
    Epsilon(EpsilonRule),
    WSquare(WSquareRule),
    Flat(FlatRule),
    AlphaBeta(AlphaBetaRule),
    Boxed(BoxedRule),
}

impl Rule {
    /// Redistribute `relevance` from the node's output to its input.
    ///
    /// `output` is the node's forward output; the current rules do not
    /// consult it, but the reverse-mapping interface carries it so that
    /// output-dependent mappings fit the same seam.
    pub fn apply(
        &self,
        input: &ArrayD<f32>,
        _output: &ArrayD<f32>,
        relevance: &ArrayD<f32>,
        state: &ReverseState,
    ) -> Result<ArrayD<f32>> {
        tracing::trace!(node = %state.node_name, rule = self.name(), "applying rule");
        match self {
            Rule::Z(rule) => rule.apply(input, relevance),
            Rule::Epsilon(rule) => rule.apply(input, relevance),
            Rule::WSquare(rule) => rule.apply(input, relevance),
            Rule::Flat(rule) => rule.apply(input, relevance),
            Rule::AlphaBeta(rule) => rule.apply(input, relevance),
            Rule::Boxed(rule) => rule.apply(input, relevance),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Rule::Z(_) => "Z",
            Rule::Epsilon(_) => "Epsilon",
            Rule::WSquare(_) => "WSquare",
            Rule::Flat(_) => "Flat",
            Rule::AlphaBeta(_) => "AlphaBeta",
            Rule::Boxed(_) => "Boxed",
        }
    }
}
