//! Operator fusion.
//!
//! Two rewrites: batch-norm folded into the preceding convolution's
//! weights and bias, and activation functions absorbed into the preceding
//! compute node's activation attribute. Both rewire the producer's output
//! to the fused node's output and delete the fused node; the orphaned
//! intermediate tensor is left for the following DCE sweep.

use super::Pass;
use crate::ir::{Activation, Attr, AttrKey, IRGraph, IRNode, IRTensor, OpKind, TensorData};

/// Fold `conv2d -> batch_norm` into the convolution.
///
/// `scale = gamma / sqrt(var + eps)` is folded into the weight along the
/// output-channel axis, and into (or creating) the bias:
/// `new_bias = (bias - mean) * scale + beta`. Applies only when all four
/// batch-norm parameter tensors carry payload data and the intermediate
/// tensor has no other consumer.
pub struct FuseConvBatchNorm;

impl Pass for FuseConvBatchNorm {
    fn name(&self) -> &'static str {
        "fuse_conv_bn"
    }

    fn run(&self, graph: &mut IRGraph) -> Result<(), String> {
        let mut fused: Vec<usize> = Vec::new();

        for bn_idx in 0..graph.nodes.len() {
            if graph.nodes[bn_idx].op != OpKind::BatchNorm {
                continue;
            }
            let bn = graph.nodes[bn_idx].clone();
            let Some(bn_input) = bn.inputs.first() else {
                continue;
            };
            let producers = graph.producers(bn_input);
            let Some(&conv_idx) = producers.first() else {
                continue;
            };
            if !matches!(
                graph.nodes[conv_idx].op,
                OpKind::Conv2d | OpKind::DepthwiseConv2d
            ) {
                continue;
            }
            if graph.consumers(bn_input).len() != 1 {
                continue;
            }

            if fold_bn_into_conv(graph, conv_idx, &bn)? {
                graph.nodes[conv_idx].outputs = bn.outputs.clone();
                fused.push(bn_idx);
            }
        }

        for idx in fused.into_iter().rev() {
            graph.nodes.remove(idx);
        }
        Ok(())
    }
}

fn const_f32(graph: &IRGraph, name: &str) -> Option<Vec<f32>> {
    graph.tensor(name)?.data.as_ref().map(|d| d.as_f32())
}

fn fold_bn_into_conv(graph: &mut IRGraph, conv_idx: usize, bn: &IRNode) -> Result<bool, String> {
    if bn.inputs.len() < 5 {
        return Ok(false);
    }
    // bn inputs: [input, gamma, beta, mean, var]
    let (Some(gamma), Some(beta), Some(mean), Some(var)) = (
        const_f32(graph, &bn.inputs[1]),
        const_f32(graph, &bn.inputs[2]),
        const_f32(graph, &bn.inputs[3]),
        const_f32(graph, &bn.inputs[4]),
    ) else {
        return Ok(false);
    };
    let eps = bn.float(AttrKey::Epsilon).unwrap_or(1e-5);

    let conv = graph.nodes[conv_idx].clone();
    let Some(weight_name) = conv.inputs.get(1) else {
        return Ok(false);
    };
    let Some(weight_tensor) = graph.tensor(weight_name) else {
        return Ok(false);
    };
    let Some(weight) = weight_tensor.data.as_ref().map(|d| d.as_f32()) else {
        return Ok(false);
    };
    let out_ch = weight_tensor.shape[0];
    if gamma.len() != out_ch || beta.len() != out_ch || mean.len() != out_ch || var.len() != out_ch
    {
        return Err(format!(
            "batch-norm parameter length does not match {} output channels of '{}'",
            out_ch, conv.name
        ));
    }

    let scale: Vec<f32> = gamma
        .iter()
        .zip(&var)
        .map(|(&g, &v)| g / (v + eps).sqrt())
        .collect();

    // Broadcast scale over the output-channel axis of [oc, ic, kh, kw].
    let per_channel = weight.len() / out_ch;
    let mut new_weight = weight;
    for oc in 0..out_ch {
        for k in 0..per_channel {
            new_weight[oc * per_channel + k] *= scale[oc];
        }
    }

    let bias = conv
        .inputs
        .get(2)
        .and_then(|name| const_f32(graph, name))
        .unwrap_or_else(|| vec![0.0; out_ch]);
    let new_bias: Vec<f32> = (0..out_ch)
        .map(|i| (bias[i] - mean[i]) * scale[i] + beta[i])
        .collect();

    graph
        .tensor_mut(&conv.inputs[1])
        .expect("conv weight exists")
        .data = Some(TensorData::F32(new_weight));

    if let Some(bias_name) = conv.inputs.get(2) {
        let t = graph.tensor_mut(bias_name).expect("conv bias exists");
        t.data = Some(TensorData::F32(new_bias));
    } else {
        let bias_name = format!("{}_bias", conv.name);
        graph.add_tensor(
            IRTensor::new(&bias_name, vec![out_ch]).with_data(TensorData::F32(new_bias)),
        );
        graph.nodes[conv_idx].inputs.push(bias_name);
    }
    Ok(true)
}

/// Absorb `relu`/`relu6`/`sigmoid`/`tanh` into the preceding conv/fc node's
/// activation attribute, when that node has none and the intermediate
/// tensor has exactly one consumer.
pub struct FuseConvActivation;

fn fusable_activation(op: OpKind) -> Option<Activation> {
    match op {
        OpKind::Relu => Some(Activation::Relu),
        OpKind::Relu6 => Some(Activation::Relu6),
        OpKind::Sigmoid => Some(Activation::Sigmoid),
        OpKind::Tanh => Some(Activation::Tanh),
        _ => None,
    }
}

impl Pass for FuseConvActivation {
    fn name(&self) -> &'static str {
        "fuse_conv_activation"
    }

    fn run(&self, graph: &mut IRGraph) -> Result<(), String> {
        let mut fused: Vec<usize> = Vec::new();

        for act_idx in 0..graph.nodes.len() {
            let Some(activation) = fusable_activation(graph.nodes[act_idx].op) else {
                continue;
            };
            let act = graph.nodes[act_idx].clone();
            let Some(act_input) = act.inputs.first() else {
                continue;
            };
            let producers = graph.producers(act_input);
            let Some(&prod_idx) = producers.first() else {
                continue;
            };
            if !matches!(
                graph.nodes[prod_idx].op,
                OpKind::Conv2d | OpKind::DepthwiseConv2d | OpKind::FullyConnected
            ) {
                continue;
            }
            if graph.consumers(act_input).len() != 1 {
                continue;
            }
            if graph.nodes[prod_idx].activation().is_some() {
                continue;
            }

            let producer = &mut graph.nodes[prod_idx];
            producer.set_attr(AttrKey::Activation, Attr::Activation(activation));
            producer.outputs = act.outputs.clone();
            fused.push(act_idx);
        }

        for idx in fused.into_iter().rev() {
            graph.nodes.remove(idx);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::builder::IRBuilder;
    use crate::ir::DataType;

    fn conv_graph(with_bias: bool) -> (IRGraph, String) {
        let mut b = IRBuilder::new("m");
        b.add_input("x", vec![1, 2, 4, 4], DataType::F32);
        b.add_constant("w", vec![2, 2, 1, 1], TensorData::F32(vec![1.0, 0.0, 0.0, 1.0]));
        if with_bias {
            b.add_constant("bias", vec![2], TensorData::F32(vec![0.5, -0.5]));
        }
        let conv = b.conv2d(
            "x",
            "w",
            with_bias.then_some("bias"),
            (1, 1),
            (1, 1),
            (0, 0),
            1,
            None,
        );
        (b.build().unwrap(), conv)
    }

    #[test]
    fn test_bn_folds_into_weights_and_bias() {
        let mut b = IRBuilder::new("m");
        b.add_input("x", vec![1, 2, 4, 4], DataType::F32);
        b.add_constant("w", vec![2, 2, 1, 1], TensorData::F32(vec![1.0, 0.0, 0.0, 1.0]));
        let conv = b.conv2d("x", "w", None, (1, 1), (1, 1), (0, 0), 1, None);
        b.add_constant("gamma", vec![2], TensorData::F32(vec![2.0, 1.0]));
        b.add_constant("beta", vec![2], TensorData::F32(vec![0.0, 1.0]));
        b.add_constant("mean", vec![2], TensorData::F32(vec![0.0, 0.0]));
        b.add_constant("var", vec![2], TensorData::F32(vec![1.0, 1.0]));
        let bn = b.batch_norm(&conv, "gamma", "beta", "mean", "var", 0.0);
        b.add_output(&bn);
        let mut g = b.build().unwrap();

        FuseConvBatchNorm.run(&mut g).unwrap();

        assert_eq!(g.nodes.len(), 1);
        let conv_node = &g.nodes[0];
        assert_eq!(conv_node.outputs, vec![bn.clone()]);
        // gamma/sqrt(var) = [2, 1] scales the weight's output channels
        let w = g.tensor("w").unwrap().data.as_ref().unwrap().as_f32();
        assert_eq!(w, vec![2.0, 0.0, 0.0, 1.0]);
        // a bias tensor was created: (0 - 0) * scale + beta = beta
        let bias_name = &conv_node.inputs[2];
        let bias = g.tensor(bias_name).unwrap().data.as_ref().unwrap().as_f32();
        assert_eq!(bias, vec![0.0, 1.0]);
    }

    #[test]
    fn test_bn_without_payload_is_not_fused() {
        let mut b = IRBuilder::new("m");
        b.add_input("x", vec![1, 2, 4, 4], DataType::F32);
        b.add_constant("w", vec![2, 2, 1, 1], TensorData::F32(vec![1.0; 4]));
        let conv = b.conv2d("x", "w", None, (1, 1), (1, 1), (0, 0), 1, None);
        // runtime batch-norm parameters: no payloads
        b.add_input("gamma", vec![2], DataType::F32);
        b.add_input("beta", vec![2], DataType::F32);
        b.add_input("mean", vec![2], DataType::F32);
        b.add_input("var", vec![2], DataType::F32);
        let bn = b.batch_norm(&conv, "gamma", "beta", "mean", "var", 1e-5);
        b.add_output(&bn);
        let mut g = b.build().unwrap();

        FuseConvBatchNorm.run(&mut g).unwrap();
        assert_eq!(g.nodes.len(), 2);
    }

    #[test]
    fn test_activation_fuses_into_conv_attr() {
        let (mut g, conv_out) = {
            let mut b = IRBuilder::new("m");
            b.add_input("x", vec![1, 2, 4, 4], DataType::F32);
            b.add_constant("w", vec![2, 2, 1, 1], TensorData::F32(vec![1.0; 4]));
            let conv = b.conv2d("x", "w", None, (1, 1), (1, 1), (0, 0), 1, None);
            let act = b.relu(&conv);
            b.add_output(&act);
            (b.build().unwrap(), conv)
        };

        FuseConvActivation.run(&mut g).unwrap();
        assert_eq!(g.nodes.len(), 1);
        assert_eq!(g.nodes[0].activation(), Some(Activation::Relu));
        assert!(!g.nodes[0].outputs.contains(&conv_out));
    }

    #[test]
    fn test_shared_intermediate_blocks_activation_fusion() {
        let (mut g, conv_out) = conv_graph(false);
        // two consumers of the conv output
        let relu = IRNode::new("relu_x", OpKind::Relu)
            .with_io(vec![conv_out.clone()], vec!["r_out".to_string()]);
        let sig = IRNode::new("sig_x", OpKind::Sigmoid)
            .with_io(vec![conv_out.clone()], vec!["s_out".to_string()]);
        g.add_tensor(IRTensor::new("r_out", vec![1, 2, 4, 4]));
        g.add_tensor(IRTensor::new("s_out", vec![1, 2, 4, 4]));
        g.add_node(relu);
        g.add_node(sig);
        g.outputs = vec!["r_out".to_string(), "s_out".to_string()];

        FuseConvActivation.run(&mut g).unwrap();
        // neither activation may fuse: the intermediate has two consumers
        assert_eq!(g.nodes.len(), 3);
        assert_eq!(g.nodes[0].activation(), None);
    }

    #[test]
    fn test_existing_activation_blocks_fusion() {
        let mut b = IRBuilder::new("m");
        b.add_input("x", vec![1, 2, 4, 4], DataType::F32);
        b.add_constant("w", vec![2, 2, 1, 1], TensorData::F32(vec![1.0; 4]));
        let conv = b.conv2d("x", "w", None, (1, 1), (1, 1), (0, 0), 1, Some(Activation::Relu));
        let act = b.tanh(&conv);
        b.add_output(&act);
        let mut g = b.build().unwrap();

        FuseConvActivation.run(&mut g).unwrap();
        assert_eq!(g.nodes.len(), 2);
        assert_eq!(g.nodes[0].activation(), Some(Activation::Relu));
    }
}
