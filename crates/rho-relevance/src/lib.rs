//! Reverse-propagation rule engine for layer-wise relevance propagation (LRP).
//!
//! Given a trained feed-forward network and an input, LRP attributes the
//! network's output score back to the input elements by walking the forward
//! graph in reverse and redistributing relevance at each node according to a
//! per-layer rule:
//!
//! - Z / Epsilon: redistribute proportional to each input's contribution to
//!   the de-activated output (Epsilon stabilizes the denominator).
//! - WSquare / Flat: redistribute by squared-weight magnitude or uniformly,
//!   independent of the input values.
//! - AlphaBeta: separate positive and negative contribution streams.
//! - Boxed: first-layer rule for bounded input domains (e.g. pixel ranges).
//!
//! The engine is assembled from small parts: forward [`layers`] with their
//! vector-Jacobian products, the [`rules`] themselves, a string-keyed
//! [`registry`], a three-mode [`dispatch`] policy, and the [`reverse`]
//! adapter that the sequential driver in [`analyzer`] stitches together.

pub mod analyzer;
pub mod dispatch;
pub mod layers;
pub mod network;
pub mod registry;
pub mod reverse;
pub mod rules;
pub mod stabilize;

pub use analyzer::{AnalyzerConfig, BaselineLrpZ, LrpAnalyzer};
pub use dispatch::{DispatchSession, RuleAssignment, RuleCondition, RuleSpec};
pub use layers::{
    conv2d_single, conv2d_transpose, derive_layer, AvgPool2dLayer, BiasMode, Conv2dLayer,
    DenseLayer, FlattenLayer, Layer, MaxPool2dLayer, ReluLayer, WeightMask,
};
pub use network::{Network, ReverseState};
pub use registry::lookup;
pub use reverse::{default_reverse_mapping, ReverseLayer};
pub use rules::{
    AlphaBetaRule, BoxedRule, EpsilonRule, FlatRule, Rule, RuleKind, WSquareRule, ZRule,
};
pub use stabilize::{stabilize, stabilize_with, DEFAULT_EPSILON};

// Re-export core types for downstream use.
pub use rho_core::{
    Activation, LayerKind, RelevanceReport, RelevanceSummary, Result, RhoError,
};

#[cfg(test)]
mod tests;
