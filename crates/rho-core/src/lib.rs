//! Core types for ρ-LRP layer-wise relevance propagation.
//!
//! This crate provides the foundational abstractions shared by the
//! relevance engine: the error type, layer/activation descriptors, and
//! the per-node relevance report used for inspecting an attribution pass.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Layer types understood by the relevance engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LayerKind {
    /// Fully connected layer with kernel, optional bias and fused activation.
    Dense,
    /// 2-D convolution with kernel, optional bias and fused activation.
    Conv2d,
    /// Max pooling over spatial dimensions.
    MaxPool2d,
    /// Average pooling over spatial dimensions.
    AvgPool2d,
    /// Flatten to a 1-D vector.
    Flatten,
    /// Standalone rectifier node.
    Relu,
}

impl LayerKind {
    /// Lower-case identifier used when naming graph nodes.
    pub fn snake(&self) -> &'static str {
        match self {
            LayerKind::Dense => "dense",
            LayerKind::Conv2d => "conv2d",
            LayerKind::MaxPool2d => "max_pool2d",
            LayerKind::AvgPool2d => "avg_pool2d",
            LayerKind::Flatten => "flatten",
            LayerKind::Relu => "relu",
        }
    }
}

impl std::fmt::Display for LayerKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Activation fused into a kernel layer.
///
/// Rules always operate on a derived copy with the activation stripped
/// (set to `Linear`); the fused activation only matters for the forward
/// pass and for gradient-based default mappings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Activation {
    Linear,
    Relu,
    Sigmoid,
}

impl Activation {
    /// Whether this activation keeps the network rectified-linear.
    ///
    /// Alpha-Beta and Box rules are only meaningful on rectified-linear
    /// networks; the model check uses this to emit advisory warnings.
    pub fn is_rectified_linear(&self) -> bool {
        matches!(self, Activation::Linear | Activation::Relu)
    }
}

/// Error type for relevance propagation.
#[derive(Debug, Error)]
pub enum RhoError {
    #[error("shape mismatch: expected {expected:?}, got {got:?}")]
    ShapeMismatch {
        expected: Vec<usize>,
        got: Vec<usize>,
    },

    #[error("unsupported layer: {0}")]
    UnsupportedLayer(String),

    #[error("unknown rule name: {0:?}")]
    UnknownRule(String),

    #[error("no dispatch condition matched node {node}")]
    NoRuleApplies { node: String },

    #[error("ordered rule list exhausted at node {node} ({provided} rules provided)")]
    RulesExhausted { node: String, provided: usize },

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("layer {index} ({kind}) failed: {source}")]
    LayerError {
        index: usize,
        kind: String,
        #[source]
        source: Box<RhoError>,
    },
}

impl RhoError {
    /// Wrap an error with the index and kind of the node it occurred at.
    pub fn at_layer(self, index: usize, kind: LayerKind) -> Self {
        RhoError::LayerError {
            index,
            kind: kind.to_string(),
            source: Box::new(self),
        }
    }
}

pub type Result<T> = std::result::Result<T, RhoError>;

/// Relevance statistics at a single node of the reverse graph.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelevanceSummary {
    /// Node index in forward order (0-based).
    pub node_index: usize,
    /// Node name (e.g. "dense_2").
    pub name: String,
    /// Layer type (e.g. "Dense", "Flatten").
    pub kind: String,
    /// Sum of relevance over the node's input tensor.
    pub sum: f32,
    /// Minimum relevance value.
    pub min: f32,
    /// Maximum relevance value.
    pub max: f32,
    /// Number of relevance values.
    pub len: usize,
}

impl RelevanceSummary {
    pub fn new(node_index: usize, name: String, kind: String, values: &[f32]) -> Self {
        let sum = values.iter().sum();
        let min = values.iter().copied().fold(f32::INFINITY, f32::min);
        let max = values.iter().copied().fold(f32::NEG_INFINITY, f32::max);
        Self {
            node_index,
            name,
            kind,
            sum,
            min,
            max,
            len: values.len(),
        }
    }
}

/// Per-node trace of one attribution pass, in reverse traversal order.
///
/// Useful for checking the conservation property layer by layer and for
/// spotting where relevance is absorbed (biases) or blown up (unstabilized
/// denominators).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RelevanceReport {
    /// Per-node summaries, deepest node first.
    pub nodes: Vec<RelevanceSummary>,
    /// Sum of the initial (output) relevance.
    pub output_sum: f32,
}

impl RelevanceReport {
    pub fn new(output_sum: f32) -> Self {
        Self {
            nodes: Vec::new(),
            output_sum,
        }
    }

    pub fn push(&mut self, summary: RelevanceSummary) {
        self.nodes.push(summary);
    }

    /// Ratio of input relevance to output relevance.
    ///
    /// 1.0 means perfect conservation; NaN when the pass produced no nodes.
    pub fn conservation_ratio(&self) -> f32 {
        match self.nodes.last() {
            Some(input) if self.output_sum != 0.0 => input.sum / self.output_sum,
            _ => f32::NAN,
        }
    }

    /// Formatted per-node table.
    pub fn summary(&self) -> String {
        let mut lines = Vec::new();
        lines.push("Relevance propagation trace".to_string());
        lines.push("===========================".to_string());
        lines.push(format!(
            "{:<20} | {:>12} | {:>12} | {:>12} | {:>8}",
            "Node", "Sum", "Min", "Max", "Values"
        ));
        for node in &self.nodes {
            lines.push(format!(
                "{:<20} | {:>12.4e} | {:>12.4e} | {:>12.4e} | {:>8}",
                node.name, node.sum, node.min, node.max, node.len
            ));
        }
        lines.push(String::new());
        lines.push(format!(
            "Output relevance: {:.4e} | Conservation ratio: {:.4}",
            self.output_sum,
            self.conservation_ratio()
        ));
        lines.join("\n")
    }
}
