//! Instruction emission.
//!
//! Lowers scheduled nodes to wide-format instruction sequences against the
//! offsets the allocator assigned. Convolutions expand to the canonical
//! micro-sequence (weight DMA, DMA barrier, accumulator clear, configure,
//! compute, sync); most other operators are single instructions. An
//! operator with no lowering is a fatal error: skipping it would hand the
//! runtime an incomplete program.

use std::collections::BTreeMap;

use super::isa::{flags, Inst, Instruction};
use crate::error::CompileError;
use crate::ir::{Activation, AttrKey, IRGraph, IRNode, OpKind};

pub struct InstructionEmitter {
    insts: Vec<Inst>,
    weight_offsets: BTreeMap<String, usize>,
    activation_offsets: BTreeMap<String, usize>,
}

impl InstructionEmitter {
    pub fn new(
        weight_offsets: BTreeMap<String, usize>,
        activation_offsets: BTreeMap<String, usize>,
    ) -> Self {
        Self {
            insts: Vec::new(),
            weight_offsets,
            activation_offsets,
        }
    }

    fn push(&mut self, op: Instruction) {
        self.insts.push(Inst::new(op));
    }

    fn push_flags(&mut self, op: Instruction, flags: u8) {
        self.insts.push(Inst::with_flags(op, flags));
    }

    pub fn instructions(&self) -> &[Inst] {
        &self.insts
    }

    pub fn len(&self) -> usize {
        self.insts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.insts.is_empty()
    }

    pub fn into_bytes(self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(self.insts.len() * 8);
        for inst in &self.insts {
            bytes.extend_from_slice(&inst.to_le_bytes());
        }
        bytes
    }

    /// Program entry barrier.
    pub fn emit_prologue(&mut self) {
        self.push(Instruction::Sync);
    }

    /// Drain, then halt with the LAST marker the sequencer stops on.
    pub fn emit_epilogue(&mut self) {
        self.push(Instruction::Sync);
        self.push_flags(Instruction::Halt, flags::LAST);
    }

    fn weight_offset(&self, name: &str) -> u32 {
        self.weight_offsets.get(name).copied().unwrap_or(0) as u32
    }

    #[allow(dead_code)]
    fn activation_offset(&self, name: &str) -> u32 {
        self.activation_offsets.get(name).copied().unwrap_or(0) as u32
    }

    /// Output-path flags shared by the matrix ops: fused ReLU, bias add
    /// when a third input is present, requantize when the output tensor
    /// carries quantization parameters.
    fn compute_flags(&self, graph: &IRGraph, node: &IRNode) -> u8 {
        let mut f = 0u8;
        if node.activation() == Some(Activation::Relu) {
            f |= flags::RELU;
        }
        if node.inputs.len() > 2 {
            f |= flags::BIAS;
        }
        if node
            .outputs
            .first()
            .and_then(|o| graph.tensor(o))
            .is_some_and(|t| t.is_quantized)
        {
            f |= flags::QUANT;
        }
        f
    }

    fn emit_conv(&mut self, graph: &IRGraph, node: &IRNode, depthwise: bool) {
        let (kh, kw) = node.int_pair(AttrKey::KernelSize).unwrap_or((3, 3));
        let (sh, sw) = node.int_pair(AttrKey::Stride).unwrap_or((1, 1));
        let (ph, pw) = node.int_pair(AttrKey::Padding).unwrap_or((0, 0));

        let weight_name = node.inputs.get(1).map(String::as_str).unwrap_or("");
        let weight_bytes = graph.tensor(weight_name).map(|t| t.nbytes()).unwrap_or(0);

        // weight DMA length is in 16-byte beats
        self.push(Instruction::DmaLoadWeight {
            src: self.weight_offset(weight_name),
            dst: 0,
            len: (weight_bytes / 16) as u32,
        });
        self.push(Instruction::WaitDma);

        let f = self.compute_flags(graph, node);
        self.push(Instruction::ClearAcc);
        let geometry = (kh as u8, kw as u8, sh as u8, sw as u8, ph as u8, pw as u8);
        let config = if depthwise {
            Instruction::DwConv {
                kh: geometry.0,
                kw: geometry.1,
                sh: geometry.2,
                sw: geometry.3,
                ph: geometry.4,
                pw: geometry.5,
            }
        } else {
            Instruction::Conv {
                kh: geometry.0,
                kw: geometry.1,
                sh: geometry.2,
                sw: geometry.3,
                ph: geometry.4,
                pw: geometry.5,
            }
        };
        self.push_flags(config, f);
        self.push_flags(Instruction::Compute, f);
        self.push(Instruction::Sync);
    }

    fn emit_fc(&mut self, graph: &IRGraph, node: &IRNode) {
        let weight = node.inputs.get(1).and_then(|w| graph.tensor(w));
        let (out_features, in_features) = weight
            .filter(|t| t.shape.len() >= 2)
            .map(|t| (t.shape[0], t.shape[1]))
            .unwrap_or((0, 0));

        let f = self.compute_flags(graph, node);
        self.push(Instruction::ClearAcc);
        self.push_flags(
            Instruction::Fc {
                in_features: in_features as u16,
                out_features: out_features as u16,
            },
            f,
        );
        self.push_flags(Instruction::Compute, f);
        self.push(Instruction::Sync);
    }

    fn emit_matmul(&mut self, graph: &IRGraph, node: &IRNode) {
        let a = node.inputs.first().and_then(|t| graph.tensor(t));
        let b = node.inputs.get(1).and_then(|t| graph.tensor(t));
        let m = a.and_then(|t| t.shape.first().copied()).unwrap_or(0);
        let k = a.and_then(|t| t.shape.get(1).copied()).unwrap_or(0);
        let n = b.and_then(|t| t.shape.get(1).copied()).unwrap_or(0);

        self.push(Instruction::ClearAcc);
        self.push(Instruction::Gemm {
            m: m as u16,
            n: n as u16,
            k: k as u16,
        });
        self.push(Instruction::Compute);
        self.push(Instruction::Sync);
    }

    fn emit_pool(&mut self, node: &IRNode, avg: bool) {
        let (kh, kw) = node.int_pair(AttrKey::KernelSize).unwrap_or((2, 2));
        let (sh, sw) = node.int_pair(AttrKey::Stride).unwrap_or((kh, kw));
        let geometry = (kh as u8, kw as u8, sh as u8, sw as u8);
        let inst = if avg {
            Instruction::AvgPool { kh: geometry.0, kw: geometry.1, sh: geometry.2, sw: geometry.3 }
        } else {
            Instruction::MaxPool { kh: geometry.0, kw: geometry.1, sh: geometry.2, sw: geometry.3 }
        };
        self.push(inst);
    }

    /// Lower one node. Exhaustive over the operator set.
    pub fn emit_node(&mut self, graph: &IRGraph, node: &IRNode) -> Result<(), CompileError> {
        match node.op {
            OpKind::Conv2d => self.emit_conv(graph, node, false),
            OpKind::DepthwiseConv2d => self.emit_conv(graph, node, true),
            OpKind::FullyConnected => self.emit_fc(graph, node),
            OpKind::MatMul => self.emit_matmul(graph, node),

            OpKind::Relu => self.push(Instruction::Relu),
            OpKind::Relu6 => self.push(Instruction::Relu6),
            OpKind::Sigmoid => self.push(Instruction::Sigmoid),
            OpKind::Tanh => self.push(Instruction::Tanh),
            OpKind::Softmax => {
                let axis = node.int(AttrKey::Axis).unwrap_or(-1);
                self.push(Instruction::Softmax { axis: axis as i8 });
            }

            OpKind::MaxPool2d => self.emit_pool(node, false),
            OpKind::AvgPool2d => self.emit_pool(node, true),
            OpKind::GlobalAvgPool => self.push(Instruction::GlobalAvgPool),

            OpKind::Add => self.push(Instruction::Add),
            OpKind::Sub => self.push(Instruction::Sub),
            OpKind::Mul => self.push(Instruction::Mul),

            OpKind::BatchNorm => self.push(Instruction::BatchNorm),

            // pure view change, no data movement
            OpKind::Reshape => {}
            // graph structure markers, nothing to execute
            OpKind::Input | OpKind::Output | OpKind::Constant => {}

            OpKind::Div
            | OpKind::LeakyRelu
            | OpKind::Swish
            | OpKind::Gelu
            | OpKind::LayerNorm
            | OpKind::Transpose
            | OpKind::Concat
            | OpKind::Split
            | OpKind::Pad => {
                return Err(CompileError::UnsupportedOp {
                    node: node.name.clone(),
                    op: node.op,
                });
            }
        }
        Ok(())
    }

    /// Human-readable disassembly of the emitted stream.
    pub fn dump(&self) -> String {
        self.insts
            .iter()
            .enumerate()
            .map(|(i, inst)| format!("{:4}: {}", i, inst))
            .collect::<Vec<_>>()
            .join("\n")
    }
}
