//! Sequential forward graph and the per-node reverse-pass context.

use ndarray::ArrayD;
use rho_core::Result;

use crate::layers::Layer;

/// A feed-forward network as an ordered list of nodes.
///
/// Node `i` consumes the output of node `i - 1`; node 0 consumes the
/// network input. Names are derived from the layer kind and forward
/// index ("dense_0", "max_pool2d_1", ...).
#[derive(Debug, Clone, Default)]
pub struct Network {
    layers: Vec<Layer>,
}

impl Network {
    pub fn new(layers: Vec<Layer>) -> Self {
        Self { layers }
    }

    pub fn layers(&self) -> &[Layer] {
        &self.layers
    }

    pub fn len(&self) -> usize {
        self.layers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }

    /// Number of kernel-bearing nodes (the ones the dispatcher assigns
    /// rules to).
    pub fn kernel_count(&self) -> usize {
        self.layers.iter().filter(|l| l.contains_kernel()).count()
    }

    /// Forward index of the first kernel node, if any.
    pub fn first_kernel_index(&self) -> Option<usize> {
        self.layers.iter().position(|l| l.contains_kernel())
    }

    pub fn node_name(&self, index: usize) -> String {
        format!("{}_{}", self.layers[index].kind().snake(), index)
    }

    /// Whether every fused activation keeps the network rectified-linear.
    pub fn is_rectified_linear(&self) -> bool {
        self.layers
            .iter()
            .filter_map(|l| l.activation())
            .all(|a| a.is_rectified_linear())
    }

    /// Evaluate the network, recording every intermediate tensor.
    ///
    /// Returns `len() + 1` tensors: the input followed by each node's
    /// output. The reverse pass needs the input side of every node, so
    /// the full trace is kept rather than just the final output.
    pub fn forward_trace(&self, input: &ArrayD<f32>) -> Result<Vec<ArrayD<f32>>> {
        let mut trace = Vec::with_capacity(self.layers.len() + 1);
        trace.push(input.clone());
        for (index, layer) in self.layers.iter().enumerate() {
            let out = layer
                .forward(&trace[index])
                .map_err(|e| e.at_layer(index, layer.kind()))?;
            trace.push(out);
        }
        Ok(trace)
    }

    /// Evaluate the network and return the final output only.
    pub fn forward(&self, input: &ArrayD<f32>) -> Result<ArrayD<f32>> {
        let mut x = input.clone();
        for (index, layer) in self.layers.iter().enumerate() {
            x = layer
                .forward(&x)
                .map_err(|e| e.at_layer(index, layer.kind()))?;
        }
        Ok(x)
    }
}

/// Context handed to reverse mappings at each node.
#[derive(Debug, Clone)]
pub struct ReverseState {
    /// Forward index of the node being reversed.
    pub node_index: usize,
    /// Name of the node being reversed.
    pub node_name: String,
}

impl ReverseState {
    pub fn new(network: &Network, node_index: usize) -> Self {
        Self {
            node_index,
            node_name: network.node_name(node_index),
        }
    }
}
