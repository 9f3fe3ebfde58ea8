//! Binary artifact generation.
//!
//! Drives the backend end to end (allocate, schedule, emit) and serializes
//! the result: a 64-byte little-endian header, the instruction stream, the
//! packed weight image in allocated-offset order, and the bias table. Also
//! renders the firmware-embeddable C header form of the same artifact.

use std::collections::BTreeSet;
use std::fmt::Write as _;
use std::path::Path;

use super::emit::InstructionEmitter;
use super::isa::{Inst, FORMAT_WIDE};
use super::memory::MemoryAllocator;
use super::schedule::{schedule, Schedule};
use crate::error::CompileError;
use crate::ir::{DataType, IRGraph, TensorData};
use crate::quant::quantize_symmetric;
use crate::target::NpuConfig;

pub const MODEL_MAGIC: u32 = 0x4E50_5545;
pub const HEADER_SIZE: usize = 64;

/// Fixed-size artifact header. All fields little-endian; the tail of the
/// 64 bytes is zero padding reserved for future fields.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ModelHeader {
    pub magic: u32,
    pub version: u16,
    pub layer_count: u16,
    pub weight_size: u32,
    pub instruction_count: u32,
    pub input_size: u32,
    pub output_size: u32,
    pub total_payload: u32,
    pub checksum: u32,
}

impl ModelHeader {
    pub fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut out = [0u8; HEADER_SIZE];
        out[0..4].copy_from_slice(&self.magic.to_le_bytes());
        out[4..6].copy_from_slice(&self.version.to_le_bytes());
        out[6..8].copy_from_slice(&self.layer_count.to_le_bytes());
        out[8..12].copy_from_slice(&self.weight_size.to_le_bytes());
        out[12..16].copy_from_slice(&self.instruction_count.to_le_bytes());
        out[16..20].copy_from_slice(&self.input_size.to_le_bytes());
        out[20..24].copy_from_slice(&self.output_size.to_le_bytes());
        out[24..28].copy_from_slice(&self.total_payload.to_le_bytes());
        out[28..32].copy_from_slice(&self.checksum.to_le_bytes());
        out
    }

    pub fn parse(bytes: &[u8]) -> Result<ModelHeader, CompileError> {
        if bytes.len() < HEADER_SIZE {
            return Err(CompileError::ModelDef(format!(
                "artifact too short for header: {} bytes",
                bytes.len()
            )));
        }
        let u32_at = |o: usize| u32::from_le_bytes(bytes[o..o + 4].try_into().expect("4 bytes"));
        let u16_at = |o: usize| u16::from_le_bytes(bytes[o..o + 2].try_into().expect("2 bytes"));
        let magic = u32_at(0);
        if magic != MODEL_MAGIC {
            return Err(CompileError::ModelDef(format!(
                "bad magic 0x{:08X}, expected 0x{:08X}",
                magic, MODEL_MAGIC
            )));
        }
        Ok(ModelHeader {
            magic,
            version: u16_at(4),
            layer_count: u16_at(6),
            weight_size: u32_at(8),
            instruction_count: u32_at(12),
            input_size: u32_at(16),
            output_size: u32_at(20),
            total_payload: u32_at(24),
            checksum: u32_at(28),
        })
    }
}

fn checksum(sections: &[&[u8]]) -> u32 {
    let mut sum = 0u32;
    for section in sections {
        for &b in *section {
            sum = sum.wrapping_add(b as u32);
        }
    }
    sum
}

/// The compiled artifact: instruction stream plus packed constant images,
/// with the metadata the runtime and reports need.
#[derive(Clone, Debug)]
pub struct CompiledModel {
    pub name: String,
    pub version: u16,
    pub instructions: Vec<u8>,
    pub weights: Vec<u8>,
    pub bias: Vec<u8>,
    pub instruction_count: usize,
    /// Number of matrix-op layers (conv, depthwise, fully connected).
    pub layer_count: usize,
    pub input_size: usize,
    pub output_size: usize,
    pub estimated_cycles: u64,
    pub weight_peak: usize,
    pub activation_peak: usize,
}

impl CompiledModel {
    pub fn header(&self) -> ModelHeader {
        ModelHeader {
            magic: MODEL_MAGIC,
            version: self.version,
            layer_count: self.layer_count as u16,
            weight_size: self.weights.len() as u32,
            instruction_count: self.instruction_count as u32,
            input_size: self.input_size as u32,
            output_size: self.output_size as u32,
            total_payload: (self.instructions.len() + self.weights.len() + self.bias.len())
                as u32,
            checksum: checksum(&[&self.instructions, &self.weights, &self.bias]),
        }
    }

    /// Header, instructions, weights, bias, in that order.
    pub fn to_binary(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(
            HEADER_SIZE + self.instructions.len() + self.weights.len() + self.bias.len(),
        );
        out.extend_from_slice(&self.header().encode());
        out.extend_from_slice(&self.instructions);
        out.extend_from_slice(&self.weights);
        out.extend_from_slice(&self.bias);
        out
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), CompileError> {
        std::fs::write(path, self.to_binary())?;
        Ok(())
    }

    /// BLAKE3 digest of the full artifact, for build reproducibility checks.
    pub fn digest(&self) -> String {
        blake3::hash(&self.to_binary()).to_hex().to_string()
    }

    /// Decode the instruction stream back to mnemonics. Wide format only.
    pub fn disassemble(&self) -> Result<String, String> {
        let mut out = String::new();
        for (i, chunk) in self.instructions.chunks_exact(8).enumerate() {
            let word = u64::from_le_bytes(chunk.try_into().expect("8 bytes"));
            let inst = Inst::decode(word)?;
            let _ = writeln!(out, "{:4}: {}", i, inst);
        }
        Ok(out)
    }

    /// Render the artifact as a C header for firmware that links the model
    /// in rather than loading it from storage.
    pub fn to_c_header(&self) -> String {
        let guard = format!(
            "NPU_MODEL_{}_H",
            self.name
                .chars()
                .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_uppercase() } else { '_' })
                .collect::<String>()
        );
        let mut out = String::new();
        let _ = writeln!(out, "/* model '{}', generated by edgenpu */", self.name);
        let _ = writeln!(out, "#ifndef {}", guard);
        let _ = writeln!(out, "#define {}", guard);
        let _ = writeln!(out, "\n#include <stdint.h>\n");

        let _ = writeln!(out, "#define NPU_NUM_INSTRUCTIONS {}", self.instruction_count);
        let _ = writeln!(out, "static const uint64_t npu_instructions[] = {{");
        for chunk in self.instructions.chunks_exact(8) {
            let word = u64::from_le_bytes(chunk.try_into().expect("8 bytes"));
            let _ = writeln!(out, "    0x{:016X}ULL,", word);
        }
        let _ = writeln!(out, "}};\n");

        let _ = writeln!(out, "#define NPU_WEIGHTS_SIZE {}", self.weights.len());
        let _ = writeln!(out, "static const int8_t npu_weights[] = {{");
        for row in self.weights.chunks(16) {
            let items: Vec<String> = row.iter().map(|&b| format!("{}", b as i8)).collect();
            let _ = writeln!(out, "    {},", items.join(", "));
        }
        let _ = writeln!(out, "}};\n");

        let _ = writeln!(out, "#define NPU_BIAS_SIZE {}", self.bias.len());
        let _ = writeln!(out, "static const int8_t npu_bias[] = {{");
        for row in self.bias.chunks(16) {
            let items: Vec<String> = row.iter().map(|&b| format!("{}", b as i8)).collect();
            let _ = writeln!(out, "    {},", items.join(", "));
        }
        let _ = writeln!(out, "}};\n");

        let _ = writeln!(out, "#endif /* {} */", guard);
        out
    }

    pub fn write_c_header(&self, path: impl AsRef<Path>) -> Result<(), CompileError> {
        std::fs::write(path, self.to_c_header())?;
        Ok(())
    }

    pub fn summary(&self) -> String {
        [
            format!("model {}", self.name),
            format!("  format version: 0x{:04X}", self.version),
            format!("  layers: {}", self.layer_count),
            format!("  instructions: {}", self.instruction_count),
            format!("  weights: {} bytes (peak {} on chip)", self.weights.len(), self.weight_peak),
            format!("  bias: {} bytes", self.bias.len()),
            format!("  activations: peak {} bytes on chip", self.activation_peak),
            format!("  estimated cycles: {}", self.estimated_cycles),
            format!("  digest: {}", self.digest()),
        ]
        .join("\n")
    }
}

/// Pack one constant payload to exactly the byte width its declared dtype
/// implies. An F32 payload under an I8 dtype is quantized on the fly, so
/// tensors the quantizer tagged but did not rewrite still land at the size
/// the allocator reserved.
fn pack_payload(data: &TensorData, dtype: DataType) -> Vec<u8> {
    match (data, dtype) {
        (TensorData::F32(v), DataType::I8) => {
            let (q, _) = quantize_symmetric(v);
            q.iter().map(|&b| b as u8).collect()
        }
        (TensorData::F32(v), DataType::U8) => {
            let (q, _, _) = crate::quant::quantize_asymmetric(v);
            q
        }
        _ => data.to_bytes(),
    }
}

/// Orchestrates allocation, scheduling, emission and packing.
pub struct CodeGenerator {
    config: NpuConfig,
}

impl CodeGenerator {
    pub fn new(config: NpuConfig) -> Self {
        Self { config }
    }

    pub fn generate(&self, graph: &mut IRGraph) -> Result<CompiledModel, CompileError> {
        let mut allocator = MemoryAllocator::new(&self.config);
        allocator.allocate(graph)?;

        let sched = schedule(graph, &self.config);
        let order = sched.node_order();
        for (pos, &node_idx) in order.iter().enumerate() {
            graph.nodes[node_idx].schedule_order = Some(pos);
        }

        let mut emitter = InstructionEmitter::new(
            allocator.weight_offsets().clone(),
            allocator.activation_offsets().clone(),
        );
        emitter.emit_prologue();
        for &node_idx in &order {
            emitter.emit_node(graph, &graph.nodes[node_idx])?;
        }
        emitter.emit_epilogue();

        let count = emitter.len();
        if count > self.config.inst_buf_entries {
            return Err(CompileError::InstructionOverflow {
                count,
                capacity: self.config.inst_buf_entries,
            });
        }

        let weights = pack_weights(graph, &allocator);
        let bias = pack_bias(graph, &order);

        let layer_count = graph.nodes.iter().filter(|n| n.op.is_compute()).count();
        let input_size: usize = graph
            .inputs
            .iter()
            .filter_map(|n| graph.tensor(n))
            .map(|t| t.nbytes())
            .sum();
        let output_size: usize = graph
            .outputs
            .iter()
            .filter_map(|n| graph.tensor(n))
            .map(|t| t.nbytes())
            .sum();

        Ok(CompiledModel {
            name: graph.name.clone(),
            version: FORMAT_WIDE,
            instructions: emitter.into_bytes(),
            weights,
            bias,
            instruction_count: count,
            layer_count,
            input_size,
            output_size,
            estimated_cycles: sched.total_cycles,
            weight_peak: allocator.weight_peak(),
            activation_peak: allocator.activation_peak(),
        })
    }

    /// Schedule and memory reports for verbose output, computed the same
    /// way `generate` computes them.
    pub fn report(&self, graph: &IRGraph) -> Result<(Schedule, String), CompileError> {
        let mut allocator = MemoryAllocator::new(&self.config);
        allocator.allocate(graph)?;
        let sched = schedule(graph, &self.config);
        Ok((sched, allocator.format_report()))
    }
}

/// Weight image in allocated-offset order, zero-padded between blocks so
/// DMA source offsets in the instruction stream index it directly.
fn pack_weights(graph: &IRGraph, alloc: &MemoryAllocator) -> Vec<u8> {
    let mut entries: Vec<(&String, usize)> = alloc
        .weight_offsets()
        .iter()
        .map(|(name, &off)| (name, off))
        .collect();
    entries.sort_by_key(|&(_, off)| off);

    let mut out = Vec::new();
    for (name, offset) in entries {
        let Some(tensor) = graph.tensor(name) else {
            continue;
        };
        let Some(data) = &tensor.data else {
            continue;
        };
        if out.len() < offset {
            out.resize(offset, 0);
        }
        let mut bytes = pack_payload(data, tensor.dtype);
        bytes.resize(tensor.nbytes(), 0);
        out.extend_from_slice(&bytes);
    }
    out
}

/// Bias table: the bias payload of each matrix op, in scheduled order,
/// each tensor once.
fn pack_bias(graph: &IRGraph, order: &[usize]) -> Vec<u8> {
    let mut seen = BTreeSet::new();
    let mut out = Vec::new();
    for &i in order {
        let node = &graph.nodes[i];
        if !node.op.is_compute() {
            continue;
        }
        let Some(bias_name) = node.inputs.get(2) else {
            continue;
        };
        if !seen.insert(bias_name.clone()) {
            continue;
        }
        if let Some(tensor) = graph.tensor(bias_name) {
            if let Some(data) = &tensor.data {
                out.extend_from_slice(&pack_payload(data, tensor.dtype));
            }
        }
    }
    out
}
