//! Constant folding.
//!
//! A node whose inputs are all constant payloads and whose operator is
//! arithmetic or a shape op is computed at compile time: the result becomes
//! the output tensor's payload and the node is deleted. Runs to a fixpoint
//! so chains of constants collapse completely.

use super::Pass;
use crate::ir::data::{elementwise, transpose};
use crate::ir::{AttrKey, IRGraph, OpKind, TensorData};

pub struct ConstantFolding;

impl Pass for ConstantFolding {
    fn name(&self) -> &'static str {
        "constant_folding"
    }

    fn run(&self, graph: &mut IRGraph) -> Result<(), String> {
        loop {
            let Some(index) = find_foldable(graph) else {
                return Ok(());
            };
            fold_node(graph, index)?;
        }
    }
}

fn is_foldable_op(op: OpKind) -> bool {
    matches!(
        op,
        OpKind::Add | OpKind::Sub | OpKind::Mul | OpKind::Div | OpKind::Reshape | OpKind::Transpose
    )
}

fn find_foldable(graph: &IRGraph) -> Option<usize> {
    graph.nodes.iter().position(|node| {
        is_foldable_op(node.op)
            && !node.inputs.is_empty()
            && node
                .inputs
                .iter()
                .all(|i| graph.tensor(i).is_some_and(|t| t.is_const()))
    })
}

fn fold_node(graph: &mut IRGraph, index: usize) -> Result<(), String> {
    let node = graph.nodes[index].clone();
    let inputs: Vec<(Vec<f32>, Vec<usize>)> = node
        .inputs
        .iter()
        .map(|name| {
            let t = graph.tensor(name).expect("foldable input exists");
            (t.data.as_ref().expect("foldable input is const").as_f32(), t.shape.clone())
        })
        .collect();

    let (result, shape) = match node.op {
        OpKind::Add => (elementwise(&inputs[0].0, &inputs[1].0, |a, b| a + b)?, inputs[0].1.clone()),
        OpKind::Sub => (elementwise(&inputs[0].0, &inputs[1].0, |a, b| a - b)?, inputs[0].1.clone()),
        OpKind::Mul => (elementwise(&inputs[0].0, &inputs[1].0, |a, b| a * b)?, inputs[0].1.clone()),
        OpKind::Div => (elementwise(&inputs[0].0, &inputs[1].0, |a, b| a / b)?, inputs[0].1.clone()),
        OpKind::Reshape => {
            let shape = node
                .shape_attr(AttrKey::Shape)
                .ok_or("reshape node missing shape attribute")?
                .to_vec();
            (inputs[0].0.clone(), shape)
        }
        OpKind::Transpose => {
            let perm = node
                .shape_attr(AttrKey::Perm)
                .ok_or("transpose node missing perm attribute")?
                .to_vec();
            transpose(&inputs[0].0, &inputs[0].1, &perm)?
        }
        other => return Err(format!("operator {} is not foldable", other)),
    };

    let output_name = node
        .outputs
        .first()
        .ok_or("foldable node has no output")?;
    let tensor = graph
        .tensor_mut(output_name)
        .ok_or_else(|| format!("folded output tensor '{}' not found", output_name))?;
    tensor.shape = shape;
    tensor.dtype = crate::ir::DataType::F32;
    tensor.data = Some(TensorData::F32(result));

    graph.nodes.remove(index);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::builder::IRBuilder;
    use crate::ir::DataType;

    #[test]
    fn test_folds_chain_to_fixpoint() {
        let mut b = IRBuilder::new("m");
        b.add_constant("a", vec![2], TensorData::F32(vec![2.0, 4.0]));
        b.add_constant("c", vec![2], TensorData::F32(vec![1.0, 1.0]));
        let s = b.sub("a", "c");
        let m = b.mul(&s, "a");
        b.add_output(&m);
        let mut g = b.build().unwrap();

        ConstantFolding.run(&mut g).unwrap();
        assert!(g.nodes.is_empty());
        assert_eq!(
            g.tensor(&m).unwrap().data,
            Some(TensorData::F32(vec![2.0, 12.0]))
        );
    }

    #[test]
    fn test_runtime_input_blocks_folding() {
        let mut b = IRBuilder::new("m");
        b.add_input("x", vec![2], DataType::F32);
        b.add_constant("c", vec![2], TensorData::F32(vec![1.0, 1.0]));
        let out = b.add("x", "c");
        b.add_output(&out);
        let mut g = b.build().unwrap();

        ConstantFolding.run(&mut g).unwrap();
        assert_eq!(g.nodes.len(), 1);
    }

    #[test]
    fn test_folds_constant_transpose() {
        let mut b = IRBuilder::new("m");
        b.add_constant("c", vec![2, 3], TensorData::F32(vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]));
        let out = b.transpose("c", vec![1, 0]);
        b.add_output(&out);
        let mut g = b.build().unwrap();

        ConstantFolding.run(&mut g).unwrap();
        let t = g.tensor(&out).unwrap();
        assert_eq!(t.shape, vec![3, 2]);
        assert_eq!(
            t.data,
            Some(TensorData::F32(vec![1.0, 4.0, 2.0, 5.0, 3.0, 6.0]))
        );
    }
}
