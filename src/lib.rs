//! edgenpu — an ahead-of-time neural network compiler for a small edge
//! NPU with a weight-stationary PE array.
//!
//! The pipeline is linear: import a model into the [`ir`] graph, run the
//! [`opt`] pass pipeline, optionally run the [`quant`] post-training
//! quantizer, then let the [`backend`] schedule it, place it in on-chip
//! memory, and serialize a loadable binary artifact.
//!
//! ```no_run
//! use edgenpu::{compile, CompileOptions};
//!
//! let def = edgenpu::modeldef::parse(&std::fs::read_to_string("model.json")?)?;
//! let graph = edgenpu::modeldef::to_graph(&def)?;
//! let output = compile(graph, &CompileOptions::default())?;
//! output.model.save("model.npubin")?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

pub mod backend;
pub mod diagnostic;
pub mod error;
pub mod ir;
pub mod modeldef;
pub mod opt;
pub mod quant;
pub mod target;

use rayon::prelude::*;

pub use backend::codegen::{CodeGenerator, CompiledModel, ModelHeader};
pub use diagnostic::Diagnostic;
pub use error::CompileError;
pub use ir::builder::IRBuilder;
pub use ir::IRGraph;
pub use opt::{optimize, OptLevel, OptimizeReport};
pub use quant::{CalibrationData, QuantConfig, Quantizer};
pub use target::NpuConfig;

/// Everything `compile` needs besides the graph.
#[derive(Clone, Debug)]
pub struct CompileOptions {
    pub opt_level: OptLevel,
    /// Run post-training quantization before code generation.
    pub quantize: bool,
    pub quant_config: QuantConfig,
    /// Input samples for activation calibration; constants calibrate from
    /// their payloads regardless.
    pub calibration: CalibrationData,
    pub target: NpuConfig,
}

impl Default for CompileOptions {
    fn default() -> Self {
        Self {
            opt_level: OptLevel::O2,
            quantize: false,
            quant_config: QuantConfig::default(),
            calibration: CalibrationData::default(),
            target: NpuConfig::default(),
        }
    }
}

/// One compiled graph plus everything worth reporting about the run.
#[derive(Clone, Debug)]
pub struct CompileOutput {
    pub model: CompiledModel,
    pub report: OptimizeReport,
    pub schedule_report: String,
    pub memory_report: String,
}

/// Compile a graph end to end.
pub fn compile(mut graph: IRGraph, options: &CompileOptions) -> Result<CompileOutput, CompileError> {
    graph.validate()?;

    let report = optimize(&mut graph, options.opt_level, &options.target);

    if options.quantize {
        let mut quantizer = Quantizer::new(options.quant_config.clone());
        quantizer.calibrate(&graph, &options.calibration);
        quantizer.quantize(&mut graph);
    }

    let generator = CodeGenerator::new(options.target.clone());
    let (sched, memory_report) = generator.report(&graph)?;
    let schedule_report = sched.format_report(options.target.clock_mhz);
    let model = generator.generate(&mut graph)?;
    Ok(CompileOutput {
        model,
        report,
        schedule_report,
        memory_report,
    })
}

/// Compile independent graphs in parallel. Each graph gets its own
/// pipeline state; results come back in input order.
pub fn compile_batch(
    graphs: Vec<IRGraph>,
    options: &CompileOptions,
) -> Vec<Result<CompileOutput, CompileError>> {
    graphs
        .into_par_iter()
        .map(|graph| compile(graph, options))
        .collect()
}
