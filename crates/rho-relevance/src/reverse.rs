//! Reverse-node adapter: one forward node plus its relevance mapping.

use ndarray::ArrayD;
use rho_core::Result;

use crate::layers::Layer;
use crate::network::ReverseState;
use crate::rules::{Rule, RuleKind};

/// Fallback mapping for nodes without an assigned rule.
///
/// Shape-preserving nodes (activations, identity-like nodes) pass the
/// relevance through untouched. Shape-changing nodes (pooling, flatten)
/// pull the relevance back with the node's VJP, using it as the
/// cotangent; for max pooling this is winner-take-all routing, for
/// flatten a reshape.
pub fn default_reverse_mapping(
    layer: &Layer,
    input: &ArrayD<f32>,
    _output: &ArrayD<f32>,
    relevance: &ArrayD<f32>,
    state: &ReverseState,
) -> Result<ArrayD<f32>> {
    if relevance.shape() == input.shape() {
        tracing::trace!(node = %state.node_name, "default mapping: pass-through");
        return Ok(relevance.clone());
    }
    tracing::trace!(node = %state.node_name, "default mapping: vjp");
    layer.vjp(input, relevance)
}

/// A node of the reverse graph: the forward layer together with the
/// mapping that carries relevance across it.
#[derive(Debug, Clone)]
pub struct ReverseLayer {
    layer: Layer,
    rule: Option<Rule>,
}

impl ReverseLayer {
    /// Bind a node to a rule (kernel nodes) or to the default mapping.
    ///
    /// Instantiation derives the masked layer copies the rule needs, so
    /// rule errors surface here rather than mid-pass.
    pub fn new(layer: Layer, rule: Option<&RuleKind>) -> Result<Self> {
        let rule = match rule {
            Some(kind) => Some(kind.instantiate(&layer)?),
            None => None,
        };
        Ok(Self { layer, rule })
    }

    pub fn layer(&self) -> &Layer {
        &self.layer
    }

    /// Name of the bound rule, if any.
    pub fn rule_name(&self) -> Option<&'static str> {
        self.rule.as_ref().map(Rule::name)
    }

    /// Carry relevance from the node's output to its input.
    pub fn backward(
        &self,
        input: &ArrayD<f32>,
        output: &ArrayD<f32>,
        relevance: &ArrayD<f32>,
        state: &ReverseState,
    ) -> Result<ArrayD<f32>> {
        match &self.rule {
            Some(rule) => rule.apply(input, output, relevance, state),
            None => default_reverse_mapping(&self.layer, input, output, relevance, state),
        }
    }
}
