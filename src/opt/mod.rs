//! Optimization pipeline.
//!
//! An ordered list of rewrite passes selected by [`OptLevel`]. Passes are
//! best-effort: a failing pass is reported as a warning and skipped, the
//! pipeline continues with the unmodified graph. Correctness of the final
//! binary never depends on a pass having run.

pub mod dce;
pub mod fold;
pub mod fuse;
pub mod layout;
pub mod tiling;

use crate::diagnostic::Diagnostic;
use crate::ir::IRGraph;
use crate::target::NpuConfig;

/// A single rewrite pass over the graph.
pub trait Pass {
    fn name(&self) -> &'static str;
    fn run(&self, graph: &mut IRGraph) -> Result<(), String>;
}

/// Optimization level. Each level runs every pass of the levels below it,
/// in a fixed order.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum OptLevel {
    /// No optimization.
    O0,
    /// Constant folding, dead-code elimination.
    O1,
    /// Adds conv+batchnorm fusion, conv/fc+activation fusion, a second
    /// DCE sweep, layout annotation.
    O2,
    /// Adds tiling.
    O3,
}

impl OptLevel {
    pub fn from_u8(level: u8) -> OptLevel {
        match level {
            0 => OptLevel::O0,
            1 => OptLevel::O1,
            2 => OptLevel::O2,
            _ => OptLevel::O3,
        }
    }
}

/// Per-pass outcome for the report.
#[derive(Clone, Debug)]
pub struct PassStat {
    pub name: &'static str,
    pub nodes_removed: isize,
    pub skipped: bool,
}

/// Result of one optimizer run.
#[derive(Clone, Debug, Default)]
pub struct OptimizeReport {
    pub original_nodes: usize,
    pub final_nodes: usize,
    pub passes: Vec<PassStat>,
    pub diagnostics: Vec<Diagnostic>,
}

impl OptimizeReport {
    pub fn nodes_reduced(&self) -> isize {
        self.original_nodes as isize - self.final_nodes as isize
    }

    pub fn format_report(&self) -> String {
        let mut lines = vec![
            "optimization:".to_string(),
            format!("  nodes: {} -> {}", self.original_nodes, self.final_nodes),
        ];
        for p in &self.passes {
            if p.skipped {
                lines.push(format!("  {}: skipped", p.name));
            } else {
                lines.push(format!("  {}: -{} nodes", p.name, p.nodes_removed));
            }
        }
        lines.join("\n")
    }
}

fn passes_for(level: OptLevel, config: &NpuConfig) -> Vec<Box<dyn Pass>> {
    let mut passes: Vec<Box<dyn Pass>> = Vec::new();
    if level >= OptLevel::O1 {
        passes.push(Box::new(fold::ConstantFolding));
        passes.push(Box::new(dce::DeadCodeElimination));
    }
    if level >= OptLevel::O2 {
        passes.push(Box::new(fuse::FuseConvBatchNorm));
        passes.push(Box::new(fuse::FuseConvActivation));
        // Fusion can orphan the folded batch-norm/activation tensors.
        passes.push(Box::new(dce::DeadCodeElimination));
        passes.push(Box::new(layout::LayoutAnnotation));
    }
    if level >= OptLevel::O3 {
        passes.push(Box::new(tiling::Tiling::new(config)));
    }
    passes
}

/// Run the pass pipeline for `level` over `graph` in place.
pub fn optimize(graph: &mut IRGraph, level: OptLevel, config: &NpuConfig) -> OptimizeReport {
    let mut report = OptimizeReport {
        original_nodes: graph.nodes.len(),
        ..Default::default()
    };

    for pass in passes_for(level, config) {
        let before = graph.nodes.len() as isize;
        match pass.run(graph) {
            Ok(()) => report.passes.push(PassStat {
                name: pass.name(),
                nodes_removed: before - graph.nodes.len() as isize,
                skipped: false,
            }),
            Err(e) => {
                report.diagnostics.push(
                    Diagnostic::warning(format!("pass '{}' failed: {}", pass.name(), e))
                        .with_note("continuing with unmodified graph".to_string()),
                );
                report.passes.push(PassStat {
                    name: pass.name(),
                    nodes_removed: 0,
                    skipped: true,
                });
            }
        }
    }

    report.final_nodes = graph.nodes.len();
    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::builder::IRBuilder;
    use crate::ir::{DataType, TensorData};

    #[test]
    fn test_o0_runs_no_passes() {
        let mut b = IRBuilder::new("m");
        b.add_input("x", vec![1, 4], DataType::F32);
        let out = b.relu("x");
        b.add_output(&out);
        let mut g = b.build().unwrap();
        let report = optimize(&mut g, OptLevel::O0, &NpuConfig::edge16());
        assert!(report.passes.is_empty());
        assert_eq!(g.nodes.len(), 1);
    }

    #[test]
    fn test_failing_pass_is_skipped_not_fatal() {
        struct Exploding;
        impl Pass for Exploding {
            fn name(&self) -> &'static str {
                "exploding"
            }
            fn run(&self, _graph: &mut IRGraph) -> Result<(), String> {
                Err("boom".to_string())
            }
        }

        let mut g = IRGraph::new("m");
        let before = g.clone();
        let pass = Exploding;
        assert!(pass.run(&mut g).is_err());
        assert_eq!(g.nodes.len(), before.nodes.len());
    }

    #[test]
    fn test_level_ordering() {
        assert!(OptLevel::O0 < OptLevel::O1);
        assert!(OptLevel::O2 < OptLevel::O3);
        assert_eq!(OptLevel::from_u8(7), OptLevel::O3);
    }

    #[test]
    fn test_o1_folds_constant_subgraph() {
        let mut b = IRBuilder::new("m");
        b.add_input("x", vec![1, 2], DataType::F32);
        b.add_constant("c1", vec![2], TensorData::F32(vec![1.0, 2.0]));
        b.add_constant("c2", vec![2], TensorData::F32(vec![3.0, 4.0]));
        let folded = b.add("c1", "c2");
        let out = b.add("x", &folded);
        b.add_output(&out);
        let mut g = b.build().unwrap();

        let report = optimize(&mut g, OptLevel::O1, &NpuConfig::edge16());
        assert_eq!(report.final_nodes, 1);
        let t = g.tensor(&folded).unwrap();
        assert_eq!(t.data, Some(TensorData::F32(vec![4.0, 6.0])));
    }
}
