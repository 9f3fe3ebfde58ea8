//! Dead-code elimination.
//!
//! Backward reachability from the declared graph outputs: a node survives
//! only if one of its outputs is reachable, a tensor only if it is
//! reachable or a graph input. Re-run after fusion, which orphans the
//! original intermediate tensors.

use std::collections::HashSet;

use super::Pass;
use crate::ir::IRGraph;

pub struct DeadCodeElimination;

impl Pass for DeadCodeElimination {
    fn name(&self) -> &'static str {
        "dead_code_elimination"
    }

    fn run(&self, graph: &mut IRGraph) -> Result<(), String> {
        let mut used: HashSet<String> = graph.outputs.iter().cloned().collect();

        // If any output of a node is used, all of its inputs are used.
        let mut changed = true;
        while changed {
            changed = false;
            for node in &graph.nodes {
                if node.outputs.iter().any(|o| used.contains(o)) {
                    for inp in &node.inputs {
                        if used.insert(inp.clone()) {
                            changed = true;
                        }
                    }
                }
            }
        }
        used.extend(graph.inputs.iter().cloned());

        graph
            .nodes
            .retain(|node| node.outputs.iter().any(|o| used.contains(o)));
        graph.tensors.retain(|name, _| used.contains(name));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::builder::IRBuilder;
    use crate::ir::DataType;

    fn graph_with_dead_branch() -> IRGraph {
        let mut b = IRBuilder::new("m");
        b.add_input("x", vec![1, 4], DataType::F32);
        let live = b.relu("x");
        let _dead = b.sigmoid("x");
        b.add_output(&live);
        b.build().unwrap()
    }

    #[test]
    fn test_removes_unreachable_branch() {
        let mut g = graph_with_dead_branch();
        assert_eq!(g.nodes.len(), 2);
        DeadCodeElimination.run(&mut g).unwrap();
        assert_eq!(g.nodes.len(), 1);
        assert_eq!(g.nodes[0].op, crate::ir::OpKind::Relu);
        // the dead branch's output tensor is gone too
        assert_eq!(g.tensors.len(), 2);
    }

    #[test]
    fn test_idempotent() {
        let mut g = graph_with_dead_branch();
        DeadCodeElimination.run(&mut g).unwrap();
        let nodes_once: Vec<String> = g.nodes.iter().map(|n| n.name.clone()).collect();
        let tensors_once: Vec<String> = g.tensors.keys().cloned().collect();
        DeadCodeElimination.run(&mut g).unwrap();
        let nodes_twice: Vec<String> = g.nodes.iter().map(|n| n.name.clone()).collect();
        let tensors_twice: Vec<String> = g.tensors.keys().cloned().collect();
        assert_eq!(nodes_once, nodes_twice);
        assert_eq!(tensors_once, tensors_twice);
    }

    #[test]
    fn test_keeps_graph_inputs_even_if_unconsumed() {
        let mut b = IRBuilder::new("m");
        b.add_input("x", vec![1, 4], DataType::F32);
        b.add_input("unused", vec![1, 4], DataType::F32);
        let out = b.relu("x");
        b.add_output(&out);
        let mut g = b.build().unwrap();
        DeadCodeElimination.run(&mut g).unwrap();
        assert!(g.tensor("unused").is_some());
    }
}
