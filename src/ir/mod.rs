//! IR — the dataflow graph the compiler optimizes and lowers.
//!
//! The graph is a static DAG: insertion-ordered nodes referencing tensors
//! by name in a name-keyed table. Nodes never own tensors. The importer
//! builds one graph, the optimizer and quantizer mutate it in place, and
//! the backend consumes it read-only.

pub mod builder;
pub mod data;

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;

use petgraph::algo::is_cyclic_directed;
use petgraph::graph::DiGraph;

use crate::error::CompileError;
pub use data::TensorData;

// ─── Element types and layouts ────────────────────────────────────

/// Tensor element type.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DataType {
    F32,
    F16,
    I32,
    I16,
    I8,
    U8,
}

impl DataType {
    /// Width of one element in bytes.
    pub fn width(&self) -> usize {
        match self {
            DataType::F32 | DataType::I32 => 4,
            DataType::F16 | DataType::I16 => 2,
            DataType::I8 | DataType::U8 => 1,
        }
    }
}

/// Tensor data layout tag. Advisory; attached by the layout pass.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Layout {
    /// Batch, channel, height, width — importer default.
    Nchw,
    /// Batch, height, width, channel — preferred activation layout.
    Nhwc,
    /// Batch, channel — fully-connected activations.
    Nc,
    /// Out-channel, height, width, in-channel — preferred conv weights.
    Ohwi,
    /// Out-features, in-features — fully-connected weights.
    Oi,
}

/// Activation function fused into a compute node.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Activation {
    Relu,
    Relu6,
    Sigmoid,
    Tanh,
    Swish,
    Gelu,
}

impl Activation {
    /// Hardware activation-unit code (0 is "none", carried by absence).
    pub fn code(&self) -> u8 {
        match self {
            Activation::Relu => 1,
            Activation::Relu6 => 2,
            Activation::Sigmoid => 3,
            Activation::Tanh => 4,
            Activation::Swish => 5,
            Activation::Gelu => 6,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Activation::Relu => "relu",
            Activation::Relu6 => "relu6",
            Activation::Sigmoid => "sigmoid",
            Activation::Tanh => "tanh",
            Activation::Swish => "swish",
            Activation::Gelu => "gelu",
        }
    }

    pub fn parse(s: &str) -> Option<Activation> {
        match s {
            "relu" => Some(Activation::Relu),
            "relu6" => Some(Activation::Relu6),
            "sigmoid" => Some(Activation::Sigmoid),
            "tanh" => Some(Activation::Tanh),
            "swish" => Some(Activation::Swish),
            "gelu" => Some(Activation::Gelu),
            _ => None,
        }
    }
}

// ─── Operators ────────────────────────────────────────────────────

/// Closed operator enumeration. Every kind the importer may produce; the
/// emitter matches this exhaustively so a missing lowering is a compile
/// error in *this* crate, not a silent hole in the binary.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum OpKind {
    // Compute
    Conv2d,
    DepthwiseConv2d,
    FullyConnected,
    MatMul,
    // Activations
    Relu,
    Relu6,
    Sigmoid,
    Tanh,
    LeakyRelu,
    Swish,
    Gelu,
    Softmax,
    // Pooling
    MaxPool2d,
    AvgPool2d,
    GlobalAvgPool,
    // Elementwise
    Add,
    Sub,
    Mul,
    Div,
    // Normalization
    BatchNorm,
    LayerNorm,
    // Shape
    Reshape,
    Transpose,
    Concat,
    Split,
    Pad,
    // Data
    Input,
    Output,
    Constant,
}

impl OpKind {
    /// Operators executed on the PE array.
    pub fn is_compute(&self) -> bool {
        matches!(
            self,
            OpKind::Conv2d | OpKind::DepthwiseConv2d | OpKind::FullyConnected | OpKind::MatMul
        )
    }

    /// Operators executed on the activation unit.
    pub fn is_activation(&self) -> bool {
        matches!(
            self,
            OpKind::Relu
                | OpKind::Relu6
                | OpKind::Sigmoid
                | OpKind::Tanh
                | OpKind::LeakyRelu
                | OpKind::Swish
                | OpKind::Gelu
                | OpKind::Softmax
        )
    }

    /// Operators executed on the pooling unit.
    pub fn is_pooling(&self) -> bool {
        matches!(
            self,
            OpKind::MaxPool2d | OpKind::AvgPool2d | OpKind::GlobalAvgPool
        )
    }

    pub fn is_eltwise(&self) -> bool {
        matches!(self, OpKind::Add | OpKind::Sub | OpKind::Mul | OpKind::Div)
    }
}

impl fmt::Display for OpKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            OpKind::Conv2d => "conv2d",
            OpKind::DepthwiseConv2d => "depthwise_conv2d",
            OpKind::FullyConnected => "fully_connected",
            OpKind::MatMul => "matmul",
            OpKind::Relu => "relu",
            OpKind::Relu6 => "relu6",
            OpKind::Sigmoid => "sigmoid",
            OpKind::Tanh => "tanh",
            OpKind::LeakyRelu => "leaky_relu",
            OpKind::Swish => "swish",
            OpKind::Gelu => "gelu",
            OpKind::Softmax => "softmax",
            OpKind::MaxPool2d => "max_pool2d",
            OpKind::AvgPool2d => "avg_pool2d",
            OpKind::GlobalAvgPool => "global_avg_pool",
            OpKind::Add => "add",
            OpKind::Sub => "sub",
            OpKind::Mul => "mul",
            OpKind::Div => "div",
            OpKind::BatchNorm => "batch_norm",
            OpKind::LayerNorm => "layer_norm",
            OpKind::Reshape => "reshape",
            OpKind::Transpose => "transpose",
            OpKind::Concat => "concat",
            OpKind::Split => "split",
            OpKind::Pad => "pad",
            OpKind::Input => "input",
            OpKind::Output => "output",
            OpKind::Constant => "constant",
        };
        f.write_str(name)
    }
}

// ─── Attributes ───────────────────────────────────────────────────

/// Attribute keys. A closed set, so a typo is a compile error instead of a
/// silently ignored map entry.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum AttrKey {
    KernelSize,
    Stride,
    Padding,
    Groups,
    Activation,
    Epsilon,
    Axis,
    Shape,
    Perm,
    InputLayout,
    WeightLayout,
    OutputLayout,
    WeightScales,
    WeightZeroPoints,
}

/// Attribute values: closed tagged variants, never arbitrary dynamic data.
#[derive(Clone, Debug, PartialEq)]
pub enum Attr {
    /// A (height, width) style pair: kernel size, stride, padding.
    IntPair(usize, usize),
    Int(i64),
    Float(f32),
    Shape(Vec<usize>),
    Activation(Activation),
    Layout(Layout),
    /// Per-channel quantization scales.
    FloatVec(Vec<f32>),
    /// Per-channel quantization zero points.
    IntVec(Vec<i32>),
}

/// Tile configuration computed by the tiling pass for the code generator.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TileConfig {
    /// Output-channel (or output-feature) tile.
    pub tile_oc: usize,
    /// Input-channel (or input-feature) tile.
    pub tile_ic: usize,
    pub tile_oh: usize,
    pub tile_ow: usize,
}

// ─── Tensors ──────────────────────────────────────────────────────

/// A tensor: identity, shape, element type, optional constant payload and
/// quantization metadata. A payload marks a compile-time constant; its
/// absence marks a runtime activation.
#[derive(Clone, Debug)]
pub struct IRTensor {
    pub name: String,
    pub shape: Vec<usize>,
    pub dtype: DataType,
    pub layout: Layout,
    pub data: Option<TensorData>,
    pub scale: f32,
    pub zero_point: i32,
    pub is_quantized: bool,
}

impl IRTensor {
    pub fn new(name: impl Into<String>, shape: Vec<usize>) -> Self {
        Self {
            name: name.into(),
            shape,
            dtype: DataType::F32,
            layout: Layout::Nchw,
            data: None,
            scale: 1.0,
            zero_point: 0,
            is_quantized: false,
        }
    }

    pub fn with_data(mut self, data: TensorData) -> Self {
        self.dtype = data.dtype();
        self.data = Some(data);
        self
    }

    pub fn with_dtype(mut self, dtype: DataType) -> Self {
        self.dtype = dtype;
        self
    }

    /// Total number of elements.
    pub fn size(&self) -> usize {
        self.shape.iter().product()
    }

    /// Size in bytes.
    pub fn nbytes(&self) -> usize {
        self.size() * self.dtype.width()
    }

    /// True if this tensor carries a constant payload.
    pub fn is_const(&self) -> bool {
        self.data.is_some()
    }
}

// ─── Nodes ────────────────────────────────────────────────────────

/// One operation in the graph. References tensors by name only.
#[derive(Clone, Debug)]
pub struct IRNode {
    pub name: String,
    pub op: OpKind,
    pub inputs: Vec<String>,
    pub outputs: Vec<String>,
    pub attrs: BTreeMap<AttrKey, Attr>,
    /// Position in the scheduled order; filled by the backend.
    pub schedule_order: Option<usize>,
    /// Tile configuration; filled by the tiling pass.
    pub tile: Option<TileConfig>,
}

impl IRNode {
    pub fn new(name: impl Into<String>, op: OpKind) -> Self {
        Self {
            name: name.into(),
            op,
            inputs: Vec::new(),
            outputs: Vec::new(),
            attrs: BTreeMap::new(),
            schedule_order: None,
            tile: None,
        }
    }

    pub fn with_io(mut self, inputs: Vec<String>, outputs: Vec<String>) -> Self {
        self.inputs = inputs;
        self.outputs = outputs;
        self
    }

    pub fn set_attr(&mut self, key: AttrKey, value: Attr) {
        self.attrs.insert(key, value);
    }

    pub fn attr(&self, key: AttrKey) -> Option<&Attr> {
        self.attrs.get(&key)
    }

    /// (height, width) pair attribute, e.g. kernel size or stride.
    pub fn int_pair(&self, key: AttrKey) -> Option<(usize, usize)> {
        match self.attrs.get(&key) {
            Some(Attr::IntPair(h, w)) => Some((*h, *w)),
            _ => None,
        }
    }

    pub fn int(&self, key: AttrKey) -> Option<i64> {
        match self.attrs.get(&key) {
            Some(Attr::Int(v)) => Some(*v),
            _ => None,
        }
    }

    pub fn float(&self, key: AttrKey) -> Option<f32> {
        match self.attrs.get(&key) {
            Some(Attr::Float(v)) => Some(*v),
            _ => None,
        }
    }

    pub fn shape_attr(&self, key: AttrKey) -> Option<&[usize]> {
        match self.attrs.get(&key) {
            Some(Attr::Shape(v)) => Some(v),
            _ => None,
        }
    }

    /// Fused activation, if any.
    pub fn activation(&self) -> Option<Activation> {
        match self.attrs.get(&AttrKey::Activation) {
            Some(Attr::Activation(a)) => Some(*a),
            _ => None,
        }
    }
}

// ─── Graph ────────────────────────────────────────────────────────

/// The dataflow graph: insertion-ordered nodes over a name-keyed tensor
/// table. The tensor table is a `BTreeMap` so table-iteration order (and
/// with it weight placement) is deterministic under mutation.
#[derive(Clone, Debug, Default)]
pub struct IRGraph {
    pub name: String,
    pub nodes: Vec<IRNode>,
    pub tensors: BTreeMap<String, IRTensor>,
    pub inputs: Vec<String>,
    pub outputs: Vec<String>,
}

impl IRGraph {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn add_node(&mut self, node: IRNode) {
        self.nodes.push(node);
    }

    pub fn add_tensor(&mut self, tensor: IRTensor) {
        self.tensors.insert(tensor.name.clone(), tensor);
    }

    pub fn node(&self, name: &str) -> Option<&IRNode> {
        self.nodes.iter().find(|n| n.name == name)
    }

    pub fn tensor(&self, name: &str) -> Option<&IRTensor> {
        self.tensors.get(name)
    }

    pub fn tensor_mut(&mut self, name: &str) -> Option<&mut IRTensor> {
        self.tensors.get_mut(name)
    }

    /// Indices of nodes producing `tensor_name`.
    pub fn producers(&self, tensor_name: &str) -> Vec<usize> {
        self.nodes
            .iter()
            .enumerate()
            .filter(|(_, n)| n.outputs.iter().any(|o| o == tensor_name))
            .map(|(i, _)| i)
            .collect()
    }

    /// Indices of nodes consuming `tensor_name`.
    pub fn consumers(&self, tensor_name: &str) -> Vec<usize> {
        self.nodes
            .iter()
            .enumerate()
            .filter(|(_, n)| n.inputs.iter().any(|i| i == tensor_name))
            .map(|(i, _)| i)
            .collect()
    }

    /// Node indices in topological order: producers of every input come
    /// first, first-seen order breaks ties. Deterministic, so schedules
    /// and memory layouts are reproducible.
    pub fn topological_sort(&self) -> Vec<usize> {
        // tensor name -> producer node indices, computed once
        let mut produced_by: HashMap<&str, Vec<usize>> = HashMap::new();
        for (i, node) in self.nodes.iter().enumerate() {
            for out in &node.outputs {
                produced_by.entry(out).or_default().push(i);
            }
        }

        fn visit(
            i: usize,
            nodes: &[IRNode],
            produced_by: &HashMap<&str, Vec<usize>>,
            visited: &mut HashSet<usize>,
            order: &mut Vec<usize>,
        ) {
            if !visited.insert(i) {
                return;
            }
            for inp in &nodes[i].inputs {
                if let Some(producers) = produced_by.get(inp.as_str()) {
                    for &p in producers {
                        visit(p, nodes, produced_by, visited, order);
                    }
                }
            }
            order.push(i);
        }

        let mut visited = HashSet::new();
        let mut order = Vec::with_capacity(self.nodes.len());
        for i in 0..self.nodes.len() {
            visit(i, &self.nodes, &produced_by, &mut visited, &mut order);
        }
        order
    }

    /// Structural validation. Must pass before compilation proceeds.
    ///
    /// Checks that every referenced tensor name resolves and that the
    /// producer/consumer edges form a DAG.
    pub fn validate(&self) -> Result<(), CompileError> {
        let mut errors = Vec::new();

        for node in &self.nodes {
            for inp in &node.inputs {
                if !self.tensors.contains_key(inp) {
                    errors.push(format!("node '{}': input tensor '{}' not found", node.name, inp));
                }
            }
            for out in &node.outputs {
                if !self.tensors.contains_key(out) {
                    errors.push(format!("node '{}': output tensor '{}' not found", node.name, out));
                }
            }
        }
        for inp in &self.inputs {
            if !self.tensors.contains_key(inp) {
                errors.push(format!("graph input '{}' not found in tensor table", inp));
            }
        }
        for out in &self.outputs {
            if !self.tensors.contains_key(out) {
                errors.push(format!("graph output '{}' not found in tensor table", out));
            }
        }
        for (name, tensor) in &self.tensors {
            if tensor.shape.iter().any(|&d| d == 0) {
                errors.push(format!("tensor '{}': shape {:?} has a zero dimension", name, tensor.shape));
            }
            if let Some(data) = &tensor.data {
                if data.len() != tensor.size() {
                    errors.push(format!(
                        "tensor '{}': payload has {} elements, shape {:?} implies {}",
                        name,
                        data.len(),
                        tensor.shape,
                        tensor.size()
                    ));
                }
            }
        }

        if self.has_cycle() {
            errors.push("graph contains a producer/consumer cycle".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(CompileError::Validation(errors))
        }
    }

    fn has_cycle(&self) -> bool {
        let mut dag = DiGraph::<usize, ()>::new();
        let ids: Vec<_> = (0..self.nodes.len()).map(|i| dag.add_node(i)).collect();
        for (ci, consumer) in self.nodes.iter().enumerate() {
            for inp in &consumer.inputs {
                for pi in self.producers(inp) {
                    dag.add_edge(ids[pi], ids[ci], ());
                }
            }
        }
        is_cyclic_directed(&dag)
    }

    /// Text summary of the graph in topological order.
    pub fn summary(&self) -> String {
        let mut lines = vec![
            format!("graph {}", self.name),
            format!("  nodes: {}", self.nodes.len()),
            format!("  tensors: {}", self.tensors.len()),
            format!("  inputs: {:?}", self.inputs),
            format!("  outputs: {:?}", self.outputs),
            String::new(),
        ];
        for i in self.topological_sort() {
            let node = &self.nodes[i];
            lines.push(format!("  {}: {}", node.name, node.op));
            lines.push(format!("    in:  {:?}", node.inputs));
            lines.push(format!("    out: {:?}", node.outputs));
            if let Some(act) = node.activation() {
                lines.push(format!("    activation: {}", act.as_str()));
            }
        }
        lines.join("\n")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn act(name: &str, shape: Vec<usize>) -> IRTensor {
        IRTensor::new(name, shape)
    }

    /// input -> relu -> sigmoid, with nodes inserted in reverse order.
    fn two_node_chain() -> IRGraph {
        let mut g = IRGraph::new("chain");
        g.add_tensor(act("a", vec![1, 8]));
        g.add_tensor(act("b", vec![1, 8]));
        g.add_tensor(act("c", vec![1, 8]));
        g.inputs = vec!["a".to_string()];
        g.outputs = vec!["c".to_string()];
        g.add_node(
            IRNode::new("sig", OpKind::Sigmoid).with_io(vec!["b".to_string()], vec!["c".to_string()]),
        );
        g.add_node(
            IRNode::new("relu", OpKind::Relu).with_io(vec!["a".to_string()], vec!["b".to_string()]),
        );
        g
    }

    #[test]
    fn test_toposort_orders_producer_first() {
        let g = two_node_chain();
        let order = g.topological_sort();
        assert_eq!(order.len(), 2);
        // relu (index 1) produces b, consumed by sig (index 0)
        assert_eq!(order, vec![1, 0]);
    }

    #[test]
    fn test_toposort_is_deterministic() {
        let g = two_node_chain();
        assert_eq!(g.topological_sort(), g.topological_sort());
    }

    #[test]
    fn test_validate_rejects_dangling_reference() {
        let mut g = two_node_chain();
        g.nodes[0].inputs.push("ghost".to_string());
        let err = g.validate().unwrap_err();
        match err {
            CompileError::Validation(errors) => {
                assert!(errors.iter().any(|e| e.contains("ghost")));
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn test_validate_rejects_cycle() {
        let mut g = two_node_chain();
        // sig output feeds relu input: b -> c -> b
        g.nodes[1].inputs = vec!["c".to_string()];
        assert!(matches!(g.validate(), Err(CompileError::Validation(_))));
    }

    #[test]
    fn test_validate_rejects_payload_shape_mismatch() {
        let mut g = two_node_chain();
        g.add_tensor(IRTensor::new("w", vec![4]).with_data(TensorData::F32(vec![1.0, 2.0])));
        assert!(g.validate().is_err());
    }

    #[test]
    fn test_tensor_nbytes() {
        let t = IRTensor::new("t", vec![2, 3, 4]).with_dtype(DataType::I8);
        assert_eq!(t.size(), 24);
        assert_eq!(t.nbytes(), 24);
        let t = t.with_dtype(DataType::F32);
        assert_eq!(t.nbytes(), 96);
    }

    #[test]
    fn test_producers_consumers() {
        let g = two_node_chain();
        assert_eq!(g.producers("b"), vec![1]);
        assert_eq!(g.consumers("b"), vec![0]);
        assert!(g.producers("a").is_empty());
    }
}
