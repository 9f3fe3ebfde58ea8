//! Programmatic graph construction with shape inference.
//!
//! Importers (and tests) use this instead of assembling `IRNode`s by hand:
//! output tensors are created and shaped here, so a built graph always
//! passes validation or `build()` says why not.

use super::{
    Activation, Attr, AttrKey, DataType, IRGraph, IRNode, IRTensor, OpKind, TensorData,
};
use crate::error::CompileError;

pub struct IRBuilder {
    graph: IRGraph,
    tensor_counter: usize,
    node_counter: usize,
}

impl IRBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            graph: IRGraph::new(name),
            tensor_counter: 0,
            node_counter: 0,
        }
    }

    fn gen_tensor_name(&mut self, prefix: &str) -> String {
        let name = format!("{}_{}", prefix, self.tensor_counter);
        self.tensor_counter += 1;
        name
    }

    fn gen_node_name(&mut self, prefix: &str) -> String {
        let name = format!("{}_{}", prefix, self.node_counter);
        self.node_counter += 1;
        name
    }

    /// Shape of a tensor added so far. Importers use this to size the next
    /// layer's parameters.
    pub fn shape(&self, tensor: &str) -> Option<&[usize]> {
        self.graph.tensor(tensor).map(|t| t.shape.as_slice())
    }

    fn shape_of(&self, tensor: &str) -> Vec<usize> {
        self.graph
            .tensor(tensor)
            .map(|t| t.shape.clone())
            .unwrap_or_else(|| vec![1])
    }

    fn push_output(&mut self, prefix: &str, shape: Vec<usize>) -> String {
        let name = self.gen_tensor_name(prefix);
        self.graph.add_tensor(IRTensor::new(&name, shape));
        name
    }

    /// Declare a graph input.
    pub fn add_input(&mut self, name: &str, shape: Vec<usize>, dtype: DataType) -> String {
        self.graph
            .add_tensor(IRTensor::new(name, shape).with_dtype(dtype));
        self.graph.inputs.push(name.to_string());
        name.to_string()
    }

    /// Mark a tensor as a graph output.
    pub fn add_output(&mut self, tensor: &str) {
        self.graph.outputs.push(tensor.to_string());
    }

    /// Declare a constant tensor with a payload.
    pub fn add_constant(&mut self, name: &str, shape: Vec<usize>, data: TensorData) -> String {
        self.graph
            .add_tensor(IRTensor::new(name, shape).with_data(data));
        name.to_string()
    }

    /// Conv2D (or depthwise when `groups > 1`). Weight shape is
    /// `[out_ch, in_ch, kh, kw]`; output shape follows the usual padded
    /// convolution arithmetic.
    #[allow(clippy::too_many_arguments)]
    pub fn conv2d(
        &mut self,
        input: &str,
        weight: &str,
        bias: Option<&str>,
        kernel: (usize, usize),
        stride: (usize, usize),
        padding: (usize, usize),
        groups: usize,
        activation: Option<Activation>,
    ) -> String {
        let in_shape = self.shape_of(input);
        let w_shape = self.shape_of(weight);
        let (n, h, w) = (in_shape[0], in_shape[2], in_shape[3]);
        let out_c = w_shape[0];
        let out_h = (h + 2 * padding.0 - kernel.0) / stride.0 + 1;
        let out_w = (w + 2 * padding.1 - kernel.1) / stride.1 + 1;
        let output = self.push_output("conv_out", vec![n, out_c, out_h, out_w]);

        let op = if groups > 1 {
            OpKind::DepthwiseConv2d
        } else {
            OpKind::Conv2d
        };
        let mut inputs = vec![input.to_string(), weight.to_string()];
        if let Some(b) = bias {
            inputs.push(b.to_string());
        }
        let name = self.gen_node_name("conv2d");
        let mut node = IRNode::new(name, op).with_io(inputs, vec![output.clone()]);
        node.set_attr(AttrKey::KernelSize, Attr::IntPair(kernel.0, kernel.1));
        node.set_attr(AttrKey::Stride, Attr::IntPair(stride.0, stride.1));
        node.set_attr(AttrKey::Padding, Attr::IntPair(padding.0, padding.1));
        node.set_attr(AttrKey::Groups, Attr::Int(groups as i64));
        if let Some(act) = activation {
            node.set_attr(AttrKey::Activation, Attr::Activation(act));
        }
        self.graph.add_node(node);
        output
    }

    /// Fully connected. Weight shape is `[out_features, in_features]`.
    pub fn fully_connected(
        &mut self,
        input: &str,
        weight: &str,
        bias: Option<&str>,
        activation: Option<Activation>,
    ) -> String {
        let batch = self.shape_of(input)[0];
        let out_features = self.shape_of(weight)[0];
        let output = self.push_output("fc_out", vec![batch, out_features]);

        let mut inputs = vec![input.to_string(), weight.to_string()];
        if let Some(b) = bias {
            inputs.push(b.to_string());
        }
        let name = self.gen_node_name("fc");
        let mut node =
            IRNode::new(name, OpKind::FullyConnected).with_io(inputs, vec![output.clone()]);
        if let Some(act) = activation {
            node.set_attr(AttrKey::Activation, Attr::Activation(act));
        }
        self.graph.add_node(node);
        output
    }

    fn unary(&mut self, input: &str, op: OpKind, prefix: &str) -> String {
        let shape = self.shape_of(input);
        let output = self.push_output(&format!("{}_out", prefix), shape);
        let name = self.gen_node_name(prefix);
        self.graph.add_node(
            IRNode::new(name, op).with_io(vec![input.to_string()], vec![output.clone()]),
        );
        output
    }

    pub fn relu(&mut self, input: &str) -> String {
        self.unary(input, OpKind::Relu, "relu")
    }

    pub fn relu6(&mut self, input: &str) -> String {
        self.unary(input, OpKind::Relu6, "relu6")
    }

    pub fn sigmoid(&mut self, input: &str) -> String {
        self.unary(input, OpKind::Sigmoid, "sigmoid")
    }

    pub fn tanh(&mut self, input: &str) -> String {
        self.unary(input, OpKind::Tanh, "tanh")
    }

    pub fn softmax(&mut self, input: &str, axis: i64) -> String {
        let shape = self.shape_of(input);
        let output = self.push_output("softmax_out", shape);
        let name = self.gen_node_name("softmax");
        let mut node = IRNode::new(name, OpKind::Softmax)
            .with_io(vec![input.to_string()], vec![output.clone()]);
        node.set_attr(AttrKey::Axis, Attr::Int(axis));
        self.graph.add_node(node);
        output
    }

    fn pool(
        &mut self,
        input: &str,
        op: OpKind,
        kernel: (usize, usize),
        stride: (usize, usize),
    ) -> String {
        let s = self.shape_of(input);
        let (n, c, h, w) = (s[0], s[1], s[2], s[3]);
        let out_h = (h - kernel.0) / stride.0 + 1;
        let out_w = (w - kernel.1) / stride.1 + 1;
        let output = self.push_output("pool_out", vec![n, c, out_h, out_w]);
        let name = self.gen_node_name("pool");
        let mut node = IRNode::new(name, op).with_io(vec![input.to_string()], vec![output.clone()]);
        node.set_attr(AttrKey::KernelSize, Attr::IntPair(kernel.0, kernel.1));
        node.set_attr(AttrKey::Stride, Attr::IntPair(stride.0, stride.1));
        self.graph.add_node(node);
        output
    }

    pub fn max_pool2d(&mut self, input: &str, kernel: (usize, usize), stride: (usize, usize)) -> String {
        self.pool(input, OpKind::MaxPool2d, kernel, stride)
    }

    pub fn avg_pool2d(&mut self, input: &str, kernel: (usize, usize), stride: (usize, usize)) -> String {
        self.pool(input, OpKind::AvgPool2d, kernel, stride)
    }

    pub fn global_avg_pool(&mut self, input: &str) -> String {
        let s = self.shape_of(input);
        let output = self.push_output("gap_out", vec![s[0], s[1], 1, 1]);
        let name = self.gen_node_name("global_avg_pool");
        self.graph.add_node(
            IRNode::new(name, OpKind::GlobalAvgPool)
                .with_io(vec![input.to_string()], vec![output.clone()]),
        );
        output
    }

    fn eltwise(&mut self, a: &str, b: &str, op: OpKind, prefix: &str) -> String {
        let shape = self.shape_of(a);
        let output = self.push_output(&format!("{}_out", prefix), shape);
        let name = self.gen_node_name(prefix);
        self.graph.add_node(
            IRNode::new(name, op).with_io(vec![a.to_string(), b.to_string()], vec![output.clone()]),
        );
        output
    }

    pub fn add(&mut self, a: &str, b: &str) -> String {
        self.eltwise(a, b, OpKind::Add, "add")
    }

    pub fn sub(&mut self, a: &str, b: &str) -> String {
        self.eltwise(a, b, OpKind::Sub, "sub")
    }

    pub fn mul(&mut self, a: &str, b: &str) -> String {
        self.eltwise(a, b, OpKind::Mul, "mul")
    }

    pub fn div(&mut self, a: &str, b: &str) -> String {
        self.eltwise(a, b, OpKind::Div, "div")
    }

    pub fn reshape(&mut self, input: &str, new_shape: Vec<usize>) -> String {
        let output = self.push_output("reshape_out", new_shape.clone());
        let name = self.gen_node_name("reshape");
        let mut node = IRNode::new(name, OpKind::Reshape)
            .with_io(vec![input.to_string()], vec![output.clone()]);
        node.set_attr(AttrKey::Shape, Attr::Shape(new_shape));
        self.graph.add_node(node);
        output
    }

    pub fn transpose(&mut self, input: &str, perm: Vec<usize>) -> String {
        let shape = self.shape_of(input);
        let new_shape: Vec<usize> = perm.iter().map(|&p| shape[p]).collect();
        let output = self.push_output("transpose_out", new_shape);
        let name = self.gen_node_name("transpose");
        let mut node = IRNode::new(name, OpKind::Transpose)
            .with_io(vec![input.to_string()], vec![output.clone()]);
        node.set_attr(AttrKey::Perm, Attr::Shape(perm));
        self.graph.add_node(node);
        output
    }

    pub fn concat(&mut self, inputs: &[&str], axis: usize) -> String {
        let mut shape = self.shape_of(inputs[0]);
        shape[axis] = inputs.iter().map(|i| self.shape_of(i)[axis]).sum();
        let output = self.push_output("concat_out", shape);
        let name = self.gen_node_name("concat");
        let mut node = IRNode::new(name, OpKind::Concat).with_io(
            inputs.iter().map(|s| s.to_string()).collect(),
            vec![output.clone()],
        );
        node.set_attr(AttrKey::Axis, Attr::Int(axis as i64));
        self.graph.add_node(node);
        output
    }

    /// Batch normalization over `[input, gamma, beta, mean, var]`.
    pub fn batch_norm(
        &mut self,
        input: &str,
        gamma: &str,
        beta: &str,
        mean: &str,
        var: &str,
        epsilon: f32,
    ) -> String {
        let shape = self.shape_of(input);
        let output = self.push_output("bn_out", shape);
        let name = self.gen_node_name("batch_norm");
        let mut node = IRNode::new(name, OpKind::BatchNorm).with_io(
            vec![
                input.to_string(),
                gamma.to_string(),
                beta.to_string(),
                mean.to_string(),
                var.to_string(),
            ],
            vec![output.clone()],
        );
        node.set_attr(AttrKey::Epsilon, Attr::Float(epsilon));
        self.graph.add_node(node);
        output
    }

    /// Validate and hand out the finished graph.
    pub fn build(self) -> Result<IRGraph, CompileError> {
        self.graph.validate()?;
        Ok(self.graph)
    }
}
