//! Sequential attribution drivers.
//!
//! [`LrpAnalyzer`] runs the full rule-dispatched reverse pass;
//! [`BaselineLrpZ`] is the gradient-times-input shortcut that the Z rule
//! collapses to on rectified-linear networks, kept around as a cheap
//! cross-check.

use ndarray::ArrayD;
use rho_core::{RelevanceReport, RelevanceSummary, Result, RhoError};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::dispatch::{DispatchSession, RuleAssignment, RuleSpec};
use crate::network::{Network, ReverseState};
use crate::reverse::ReverseLayer;
use crate::rules::RuleKind;

/// Configuration of an attribution pass.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalyzerConfig {
    /// Rule assignment for kernel nodes.
    pub assignment: RuleAssignment,
    /// Optional override for the first kernel node (e.g. a Boxed rule on
    /// a pixel-domain input layer). Applied instead of the assignment and
    /// without consuming an ordered entry.
    pub first_layer_rule: Option<RuleSpec>,
}

impl AnalyzerConfig {
    pub fn new(assignment: RuleAssignment) -> Self {
        Self {
            assignment,
            first_layer_rule: None,
        }
    }

    pub fn with_first_layer_rule(mut self, spec: impl Into<RuleSpec>) -> Self {
        self.first_layer_rule = Some(spec.into());
        self
    }

    /// Plain LRP-Z on every kernel node.
    pub fn lrp_z() -> Self {
        Self::new(RuleAssignment::single("Z"))
    }

    /// LRP-Epsilon with the default stabilizer on every kernel node.
    pub fn lrp_epsilon() -> Self {
        Self::new(RuleAssignment::single("Epsilon"))
    }

    /// W-square redistribution on every kernel node.
    pub fn lrp_w_square() -> Self {
        Self::new(RuleAssignment::single("WSquare"))
    }

    /// Uniform (flat) redistribution on every kernel node.
    pub fn lrp_flat() -> Self {
        Self::new(RuleAssignment::single("Flat"))
    }

    /// Alpha-Beta with alpha = beta = 1 on every kernel node.
    pub fn lrp_alpha1_beta1() -> Self {
        Self::new(RuleAssignment::single("A1B1"))
    }

    /// Boxed rule with the given input bounds on every kernel node.
    pub fn lrp_boxed(low: f32, high: f32) -> Self {
        Self::new(RuleAssignment::single(RuleKind::Boxed { low, high }))
    }

    /// Serialize to JSON, e.g. for storing an analysis setup alongside
    /// its results.
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self).map_err(|e| RhoError::InvalidConfig(e.to_string()))
    }

    /// Parse a configuration serialized with [`AnalyzerConfig::to_json`].
    pub fn from_json(text: &str) -> Result<Self> {
        serde_json::from_str(text).map_err(|e| RhoError::InvalidConfig(e.to_string()))
    }

    /// Save to a file atomically (write-to-temp-then-rename), so a crash
    /// mid-write never leaves a corrupt config behind.
    pub fn save(&self, path: &std::path::Path) -> Result<()> {
        use std::io::Write;

        let json = self.to_json()?;
        let temp_path = path.with_extension("json.tmp");
        let mut file = std::fs::File::create(&temp_path).map_err(|e| {
            RhoError::InvalidConfig(format!("failed to create temp config file: {e}"))
        })?;
        file.write_all(json.as_bytes())
            .map_err(|e| RhoError::InvalidConfig(format!("failed to write config: {e}")))?;
        file.sync_all()
            .map_err(|e| RhoError::InvalidConfig(format!("failed to sync config: {e}")))?;
        drop(file);
        std::fs::rename(&temp_path, path)
            .map_err(|e| RhoError::InvalidConfig(format!("failed to rename config: {e}")))?;
        Ok(())
    }

    /// Load a configuration saved with [`AnalyzerConfig::save`].
    ///
    /// Cleans up a stale temp file left by an interrupted save.
    pub fn load(path: &std::path::Path) -> Result<Self> {
        let temp_path = path.with_extension("json.tmp");
        if temp_path.exists() {
            let _ = std::fs::remove_file(&temp_path);
        }
        let json = std::fs::read_to_string(path)
            .map_err(|e| RhoError::InvalidConfig(format!("failed to read config: {e}")))?;
        Self::from_json(&json)
    }

    fn specs(&self) -> Vec<&RuleSpec> {
        let mut specs: Vec<&RuleSpec> = match &self.assignment {
            RuleAssignment::Single(spec) => vec![spec],
            RuleAssignment::Ordered(list) => list.iter().collect(),
            RuleAssignment::Conditioned(pairs) => pairs.iter().map(|(_, s)| s).collect(),
        };
        if let Some(first) = &self.first_layer_rule {
            specs.push(first);
        }
        specs
    }

    /// Whether any referenced rule assumes a rectified-linear network.
    fn wants_rectified_linear(&self) -> bool {
        self.specs().iter().any(|spec| match spec {
            RuleSpec::Named(name) => name == "A1B1" || name == "Boxed",
            RuleSpec::Inline(kind) => {
                matches!(kind, RuleKind::AlphaBeta { .. } | RuleKind::Boxed { .. })
            }
        })
    }
}

/// Rule-dispatched layer-wise relevance propagation over a sequential
/// network.
///
/// The initial relevance is the network's raw output; each node's
/// reverse mapping then redistributes it toward the input.
#[derive(Debug, Clone)]
pub struct LrpAnalyzer {
    network: Network,
    config: AnalyzerConfig,
}

impl LrpAnalyzer {
    pub fn new(network: Network, config: AnalyzerConfig) -> Result<Self> {
        if network.is_empty() {
            return Err(RhoError::InvalidConfig("network has no layers".into()));
        }
        if config.wants_rectified_linear() && !network.is_rectified_linear() {
            warn!(
                "Alpha-Beta and Boxed rules assume a rectified-linear network; \
                 this network has other activations"
            );
        }
        Ok(Self { network, config })
    }

    pub fn network(&self) -> &Network {
        &self.network
    }

    /// Attribute the network's output onto `input`, seeding the pass
    /// with the raw output itself.
    pub fn analyze(&self, input: &ArrayD<f32>) -> Result<ArrayD<f32>> {
        self.run(input, None, None)
    }

    /// Attribute with a caller-chosen initial relevance (e.g. a one-hot
    /// selection of a single output unit). Must match the output shape.
    pub fn analyze_with_relevance(
        &self,
        input: &ArrayD<f32>,
        initial: &ArrayD<f32>,
    ) -> Result<ArrayD<f32>> {
        self.run(input, Some(initial), None)
    }

    /// Attribute and record a per-node trace of the pass.
    pub fn analyze_with_report(
        &self,
        input: &ArrayD<f32>,
    ) -> Result<(ArrayD<f32>, RelevanceReport)> {
        let mut report = RelevanceReport::default();
        let relevance = self.run(input, None, Some(&mut report))?;
        Ok((relevance, report))
    }

    fn run(
        &self,
        input: &ArrayD<f32>,
        initial: Option<&ArrayD<f32>>,
        mut report: Option<&mut RelevanceReport>,
    ) -> Result<ArrayD<f32>> {
        let trace = self.network.forward_trace(input)?;
        let output = &trace[trace.len() - 1];
        let mut relevance = match initial {
            Some(seed) => {
                if seed.shape() != output.shape() {
                    return Err(RhoError::ShapeMismatch {
                        expected: output.shape().to_vec(),
                        got: seed.shape().to_vec(),
                    });
                }
                seed.clone()
            }
            None => output.clone(),
        };
        if let Some(report) = report.as_deref_mut() {
            report.output_sum = relevance.iter().sum();
        }
        info!(
            layers = self.network.len(),
            output_sum = relevance.iter().sum::<f32>(),
            "starting relevance pass"
        );

        let first_kernel = self.network.first_kernel_index();
        let mut session = DispatchSession::new(&self.config.assignment);

        for index in (0..self.network.len()).rev() {
            let layer = &self.network.layers()[index];
            let state = ReverseState::new(&self.network, index);

            let rule = if layer.contains_kernel() {
                let kind = match (&self.config.first_layer_rule, first_kernel) {
                    (Some(first), Some(fk)) if index == fk => first.resolve()?,
                    _ => session.select(&state, layer)?,
                };
                Some(kind)
            } else {
                None
            };

            let node = ReverseLayer::new(layer.clone(), rule.as_ref())?;
            relevance = node.backward(&trace[index], &trace[index + 1], &relevance, &state)?;
            debug!(
                node = %state.node_name,
                rule = node.rule_name().unwrap_or("default"),
                sum = relevance.iter().sum::<f32>(),
                "node reversed"
            );

            if let Some(report) = report.as_deref_mut() {
                let values: Vec<f32> = relevance.iter().copied().collect();
                report.push(RelevanceSummary::new(
                    index,
                    state.node_name.clone(),
                    layer.kind().to_string(),
                    &values,
                ));
            }
        }

        Ok(relevance)
    }
}

/// Gradient times input.
///
/// On rectified-linear networks this coincides with LRP-Z seeded with the
/// raw output; elsewhere it is only a saliency heuristic, and a warning
/// is logged at construction.
#[derive(Debug, Clone)]
pub struct BaselineLrpZ {
    network: Network,
}

impl BaselineLrpZ {
    pub fn new(network: Network) -> Result<Self> {
        if network.is_empty() {
            return Err(RhoError::InvalidConfig("network has no layers".into()));
        }
        if !network.is_rectified_linear() {
            warn!("gradient-times-input only matches LRP-Z on rectified-linear networks");
        }
        Ok(Self { network })
    }

    pub fn analyze(&self, input: &ArrayD<f32>) -> Result<ArrayD<f32>> {
        let trace = self.network.forward_trace(input)?;
        let output = &trace[trace.len() - 1];
        let mut cotangent = ArrayD::from_elem(output.raw_dim(), 1.0f32);
        for index in (0..self.network.len()).rev() {
            let layer = &self.network.layers()[index];
            cotangent = layer
                .vjp(&trace[index], &cotangent)
                .map_err(|e| e.at_layer(index, layer.kind()))?;
        }
        Ok(input * &cotangent)
    }
}
