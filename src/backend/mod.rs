//! Backend: everything after the optimized, quantized graph.
//!
//! Order matters. The allocator fixes weight and activation offsets, the
//! scheduler fixes execution order, the emitter lowers nodes against both,
//! and codegen serializes the result. [`codegen::CodeGenerator`] is the
//! one entry point that runs the stages in that order.

pub mod codegen;
pub mod emit;
pub mod isa;
pub mod memory;
pub mod schedule;
