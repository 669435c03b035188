//! Rule-to-node dispatch.
//!
//! An analysis pass is configured with a [`RuleAssignment`] describing
//! which rule each kernel node gets. Three modes exist:
//!
//! - `Single`: one rule for every kernel node.
//! - `Ordered`: one rule per kernel node, listed in forward-layer order.
//!   The reverse traversal visits the deepest node first, so entries are
//!   consumed from the end of the list; running out is an error.
//! - `Conditioned`: a list of `(condition, rule)` pairs, first match wins;
//!   a kernel node matching no condition is an error.
//!
//! The assignment itself is never mutated. Each pass opens a
//! [`DispatchSession`] holding the consumption cursor, so an assignment
//! can drive any number of passes.

use serde::{Deserialize, Serialize};

use rho_core::{LayerKind, Result, RhoError};

use crate::layers::Layer;
use crate::network::ReverseState;
use crate::registry;
use crate::rules::RuleKind;

/// A rule reference in an assignment: a registry name resolved at
/// dispatch time, or an inline parameterized kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RuleSpec {
    Named(String),
    Inline(RuleKind),
}

impl RuleSpec {
    pub fn named(name: impl Into<String>) -> Self {
        RuleSpec::Named(name.into())
    }

    pub fn resolve(&self) -> Result<RuleKind> {
        match self {
            RuleSpec::Named(name) => registry::lookup(name),
            RuleSpec::Inline(kind) => Ok(*kind),
        }
    }
}

impl From<RuleKind> for RuleSpec {
    fn from(kind: RuleKind) -> Self {
        RuleSpec::Inline(kind)
    }
}

impl From<&str> for RuleSpec {
    fn from(name: &str) -> Self {
        RuleSpec::Named(name.to_string())
    }
}

/// Predicate over a kernel node, evaluated in conditioned mode.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RuleCondition {
    /// Matches every kernel node. Useful as a trailing catch-all.
    Always,
    /// Matches nodes of the given layer kind.
    KindIs(LayerKind),
    /// Matches the node with this exact name.
    NameIs(String),
    /// Matches the node at this forward index.
    IndexIs(usize),
    /// Matches nodes at forward index `<=` the bound (e.g. input-side
    /// layers that want a domain rule).
    IndexAtMost(usize),
}

impl RuleCondition {
    pub fn matches(&self, state: &ReverseState, layer: &Layer) -> bool {
        match self {
            RuleCondition::Always => true,
            RuleCondition::KindIs(kind) => layer.kind() == *kind,
            RuleCondition::NameIs(name) => state.node_name == *name,
            RuleCondition::IndexIs(index) => state.node_index == *index,
            RuleCondition::IndexAtMost(bound) => state.node_index <= *bound,
        }
    }
}

/// How rules are assigned to the kernel nodes of a network.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RuleAssignment {
    /// Every kernel node gets the same rule.
    Single(RuleSpec),
    /// One rule per kernel node, in forward-layer order.
    Ordered(Vec<RuleSpec>),
    /// First matching condition selects the rule.
    Conditioned(Vec<(RuleCondition, RuleSpec)>),
}

impl RuleAssignment {
    pub fn single(spec: impl Into<RuleSpec>) -> Self {
        RuleAssignment::Single(spec.into())
    }
}

/// Per-pass cursor over a [`RuleAssignment`].
#[derive(Debug)]
pub struct DispatchSession<'a> {
    assignment: &'a RuleAssignment,
    /// Entries of an ordered list not yet consumed; unused otherwise.
    remaining: usize,
}

impl<'a> DispatchSession<'a> {
    pub fn new(assignment: &'a RuleAssignment) -> Self {
        let remaining = match assignment {
            RuleAssignment::Ordered(specs) => specs.len(),
            _ => 0,
        };
        Self {
            assignment,
            remaining,
        }
    }

    /// Select the rule for a kernel node.
    ///
    /// Called once per kernel node, in reverse traversal order.
    pub fn select(&mut self, state: &ReverseState, layer: &Layer) -> Result<RuleKind> {
        match self.assignment {
            RuleAssignment::Single(spec) => spec.resolve(),
            RuleAssignment::Ordered(specs) => {
                if self.remaining == 0 {
                    return Err(RhoError::RulesExhausted {
                        node: state.node_name.clone(),
                        provided: specs.len(),
                    });
                }
                self.remaining -= 1;
                specs[self.remaining].resolve()
            }
            RuleAssignment::Conditioned(pairs) => {
                for (condition, spec) in pairs {
                    if condition.matches(state, layer) {
                        tracing::debug!(
                            node = %state.node_name,
                            condition = ?condition,
                            "dispatch condition matched"
                        );
                        return spec.resolve();
                    }
                }
                Err(RhoError::NoRuleApplies {
                    node: state.node_name.clone(),
                })
            }
        }
    }
}
