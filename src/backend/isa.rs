//! Instruction set encoding.
//!
//! Every instruction is a 64-bit little-endian word. The canonical wide
//! format is `[63:56]` opcode, `[55:48]` flags, `[47:0]` operand; the
//! operand sub-fields are per-opcode. A legacy compact format (4-bit
//! opcode, register-style operands) survives in [`compact`] for
//! first-generation firmware.
//!
//! Instructions are a closed sum type: each variant owns its operand
//! fields and its own packing, so an unrepresentable combination does not
//! exist and decode/encode round-trips by construction.

use std::fmt;

/// Binary format version for the wide encoding.
pub const FORMAT_WIDE: u16 = 0x0100;
/// Binary format version for the legacy compact encoding.
pub const FORMAT_COMPACT: u16 = 0x0101;

/// Flag bits, `[55:48]` of the wide word.
pub mod flags {
    /// Final instruction of the program.
    pub const LAST: u8 = 0x01;
    /// Raise an interrupt on completion.
    pub const IRQ: u8 = 0x02;
    /// Chain into the next instruction without a sync point.
    pub const CHAIN: u8 = 0x04;
    /// Issue asynchronously.
    pub const ASYNC: u8 = 0x08;
    /// Apply ReLU on the output path.
    pub const RELU: u8 = 0x10;
    /// Add the bias vector on the output path.
    pub const BIAS: u8 = 0x20;
    /// Requantize the output path.
    pub const QUANT: u8 = 0x40;
    /// Accumulate onto existing partial sums instead of overwriting.
    pub const ACCUM: u8 = 0x80;
}

/// Wide-format opcode byte. The full firmware opcode map; the emitter uses
/// a subset but decode accepts anything listed here.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum Opcode {
    Nop = 0x00,
    Halt = 0x01,
    Sync = 0x02,
    WaitDma = 0x03,
    WaitPe = 0x04,
    Irq = 0x05,
    LoopStart = 0x06,
    LoopEnd = 0x07,
    DmaLoadWeight = 0x10,
    DmaLoadActivation = 0x11,
    DmaStore = 0x12,
    Conv = 0x20,
    DwConv = 0x21,
    Gemm = 0x22,
    Fc = 0x23,
    ClearAcc = 0x26,
    LoadWeight = 0x27,
    Compute = 0x28,
    Drain = 0x29,
    Relu = 0x40,
    Relu6 = 0x41,
    Sigmoid = 0x42,
    Tanh = 0x43,
    MaxPool = 0x50,
    AvgPool = 0x51,
    GlobalAvgPool = 0x52,
    Add = 0x60,
    Sub = 0x61,
    Mul = 0x62,
    BatchNorm = 0x70,
    Softmax = 0x72,
    Quantize = 0x80,
    Requantize = 0x82,
    BiasAdd = 0x84,
}

/// One decoded instruction with its operand fields.
///
/// DMA source addresses are 24-bit, destinations 16-bit, lengths 8-bit
/// (in 16-byte beats); convolution geometry fields are 4-bit nibbles.
/// Encode masks to the field width, so out-of-range values truncate the
/// same way the hardware would latch them.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Instruction {
    Nop,
    Halt,
    Sync,
    WaitDma,
    WaitPe,
    Irq,
    LoopStart { count: u16 },
    LoopEnd { target: u16 },
    DmaLoadWeight { src: u32, dst: u16, len: u32 },
    DmaLoadActivation { src: u32, dst: u16, len: u32 },
    DmaStore { src: u32, dst: u16, len: u32 },
    Conv { kh: u8, kw: u8, sh: u8, sw: u8, ph: u8, pw: u8 },
    DwConv { kh: u8, kw: u8, sh: u8, sw: u8, ph: u8, pw: u8 },
    Gemm { m: u16, n: u16, k: u16 },
    Fc { in_features: u16, out_features: u16 },
    ClearAcc,
    LoadWeight { addr: u32, count: u16 },
    Compute,
    Drain { addr: u64 },
    Relu,
    Relu6,
    Sigmoid,
    Tanh,
    MaxPool { kh: u8, kw: u8, sh: u8, sw: u8 },
    AvgPool { kh: u8, kw: u8, sh: u8, sw: u8 },
    GlobalAvgPool,
    Add,
    Sub,
    Mul,
    BatchNorm,
    Softmax { axis: i8 },
    Quantize { scale_addr: u32 },
    Requantize { scale_addr: u32 },
    BiasAdd { addr: u32 },
}

const OPERAND_MASK: u64 = 0x0000_FFFF_FFFF_FFFF;

fn dma_operand(src: u32, dst: u16, len: u32) -> u64 {
    (src as u64 & 0xFF_FFFF) | ((dst as u64) << 24) | ((len as u64 & 0xFF) << 40)
}

fn geometry_operand(fields: &[u8]) -> u64 {
    let mut operand = 0u64;
    for (i, &f) in fields.iter().enumerate() {
        operand |= ((f & 0xF) as u64) << (i * 4);
    }
    operand
}

fn nibble(word: u64, i: usize) -> u8 {
    ((word >> (i * 4)) & 0xF) as u8
}

impl Instruction {
    pub fn opcode(&self) -> Opcode {
        match self {
            Instruction::Nop => Opcode::Nop,
            Instruction::Halt => Opcode::Halt,
            Instruction::Sync => Opcode::Sync,
            Instruction::WaitDma => Opcode::WaitDma,
            Instruction::WaitPe => Opcode::WaitPe,
            Instruction::Irq => Opcode::Irq,
            Instruction::LoopStart { .. } => Opcode::LoopStart,
            Instruction::LoopEnd { .. } => Opcode::LoopEnd,
            Instruction::DmaLoadWeight { .. } => Opcode::DmaLoadWeight,
            Instruction::DmaLoadActivation { .. } => Opcode::DmaLoadActivation,
            Instruction::DmaStore { .. } => Opcode::DmaStore,
            Instruction::Conv { .. } => Opcode::Conv,
            Instruction::DwConv { .. } => Opcode::DwConv,
            Instruction::Gemm { .. } => Opcode::Gemm,
            Instruction::Fc { .. } => Opcode::Fc,
            Instruction::ClearAcc => Opcode::ClearAcc,
            Instruction::LoadWeight { .. } => Opcode::LoadWeight,
            Instruction::Compute => Opcode::Compute,
            Instruction::Drain { .. } => Opcode::Drain,
            Instruction::Relu => Opcode::Relu,
            Instruction::Relu6 => Opcode::Relu6,
            Instruction::Sigmoid => Opcode::Sigmoid,
            Instruction::Tanh => Opcode::Tanh,
            Instruction::MaxPool { .. } => Opcode::MaxPool,
            Instruction::AvgPool { .. } => Opcode::AvgPool,
            Instruction::GlobalAvgPool => Opcode::GlobalAvgPool,
            Instruction::Add => Opcode::Add,
            Instruction::Sub => Opcode::Sub,
            Instruction::Mul => Opcode::Mul,
            Instruction::BatchNorm => Opcode::BatchNorm,
            Instruction::Softmax { .. } => Opcode::Softmax,
            Instruction::Quantize { .. } => Opcode::Quantize,
            Instruction::Requantize { .. } => Opcode::Requantize,
            Instruction::BiasAdd { .. } => Opcode::BiasAdd,
        }
    }

    pub fn mnemonic(&self) -> &'static str {
        match self.opcode() {
            Opcode::Nop => "nop",
            Opcode::Halt => "halt",
            Opcode::Sync => "sync",
            Opcode::WaitDma => "wait_dma",
            Opcode::WaitPe => "wait_pe",
            Opcode::Irq => "irq",
            Opcode::LoopStart => "loop_start",
            Opcode::LoopEnd => "loop_end",
            Opcode::DmaLoadWeight => "dma_load_w",
            Opcode::DmaLoadActivation => "dma_load_a",
            Opcode::DmaStore => "dma_store",
            Opcode::Conv => "conv",
            Opcode::DwConv => "dwconv",
            Opcode::Gemm => "gemm",
            Opcode::Fc => "fc",
            Opcode::ClearAcc => "clear_acc",
            Opcode::LoadWeight => "load_weight",
            Opcode::Compute => "compute",
            Opcode::Drain => "drain",
            Opcode::Relu => "relu",
            Opcode::Relu6 => "relu6",
            Opcode::Sigmoid => "sigmoid",
            Opcode::Tanh => "tanh",
            Opcode::MaxPool => "max_pool",
            Opcode::AvgPool => "avg_pool",
            Opcode::GlobalAvgPool => "global_avg_pool",
            Opcode::Add => "add",
            Opcode::Sub => "sub",
            Opcode::Mul => "mul",
            Opcode::BatchNorm => "batch_norm",
            Opcode::Softmax => "softmax",
            Opcode::Quantize => "quantize",
            Opcode::Requantize => "requantize",
            Opcode::BiasAdd => "bias_add",
        }
    }

    /// The 48-bit operand field.
    pub fn operand(&self) -> u64 {
        let operand = match *self {
            Instruction::LoopStart { count } => count as u64,
            Instruction::LoopEnd { target } => target as u64,
            Instruction::DmaLoadWeight { src, dst, len }
            | Instruction::DmaLoadActivation { src, dst, len }
            | Instruction::DmaStore { src, dst, len } => dma_operand(src, dst, len),
            Instruction::Conv { kh, kw, sh, sw, ph, pw }
            | Instruction::DwConv { kh, kw, sh, sw, ph, pw } => {
                geometry_operand(&[kh, kw, sh, sw, ph, pw])
            }
            Instruction::Gemm { m, n, k } => {
                (m as u64) | ((n as u64) << 16) | ((k as u64) << 32)
            }
            Instruction::Fc { in_features, out_features } => {
                (in_features as u64) | ((out_features as u64) << 16)
            }
            Instruction::LoadWeight { addr, count } => {
                (addr as u64 & 0xFF_FFFF) | ((count as u64) << 24)
            }
            Instruction::Drain { addr } => addr,
            Instruction::MaxPool { kh, kw, sh, sw }
            | Instruction::AvgPool { kh, kw, sh, sw } => geometry_operand(&[kh, kw, sh, sw]),
            Instruction::Softmax { axis } => axis as u8 as u64,
            Instruction::Quantize { scale_addr }
            | Instruction::Requantize { scale_addr } => scale_addr as u64,
            Instruction::BiasAdd { addr } => addr as u64,
            _ => 0,
        };
        operand & OPERAND_MASK
    }

    /// Pack into a wide word with the given flag byte.
    pub fn encode(&self, flags: u8) -> u64 {
        ((self.opcode() as u64) << 56) | ((flags as u64) << 48) | self.operand()
    }

    /// Unpack a wide word into the instruction and its flag byte.
    pub fn decode(word: u64) -> Result<(Instruction, u8), String> {
        let opcode = (word >> 56) as u8;
        let flags = (word >> 48) as u8;
        let operand = word & OPERAND_MASK;

        let dma = |operand: u64| {
            (
                (operand & 0xFF_FFFF) as u32,
                ((operand >> 24) & 0xFFFF) as u16,
                ((operand >> 40) & 0xFF) as u32,
            )
        };

        let inst = match opcode {
            0x00 => Instruction::Nop,
            0x01 => Instruction::Halt,
            0x02 => Instruction::Sync,
            0x03 => Instruction::WaitDma,
            0x04 => Instruction::WaitPe,
            0x05 => Instruction::Irq,
            0x06 => Instruction::LoopStart { count: operand as u16 },
            0x07 => Instruction::LoopEnd { target: operand as u16 },
            0x10 => {
                let (src, dst, len) = dma(operand);
                Instruction::DmaLoadWeight { src, dst, len }
            }
            0x11 => {
                let (src, dst, len) = dma(operand);
                Instruction::DmaLoadActivation { src, dst, len }
            }
            0x12 => {
                let (src, dst, len) = dma(operand);
                Instruction::DmaStore { src, dst, len }
            }
            0x20 => Instruction::Conv {
                kh: nibble(operand, 0),
                kw: nibble(operand, 1),
                sh: nibble(operand, 2),
                sw: nibble(operand, 3),
                ph: nibble(operand, 4),
                pw: nibble(operand, 5),
            },
            0x21 => Instruction::DwConv {
                kh: nibble(operand, 0),
                kw: nibble(operand, 1),
                sh: nibble(operand, 2),
                sw: nibble(operand, 3),
                ph: nibble(operand, 4),
                pw: nibble(operand, 5),
            },
            0x22 => Instruction::Gemm {
                m: operand as u16,
                n: (operand >> 16) as u16,
                k: (operand >> 32) as u16,
            },
            0x23 => Instruction::Fc {
                in_features: operand as u16,
                out_features: (operand >> 16) as u16,
            },
            0x26 => Instruction::ClearAcc,
            0x27 => Instruction::LoadWeight {
                addr: (operand & 0xFF_FFFF) as u32,
                count: (operand >> 24) as u16,
            },
            0x28 => Instruction::Compute,
            0x29 => Instruction::Drain { addr: operand },
            0x40 => Instruction::Relu,
            0x41 => Instruction::Relu6,
            0x42 => Instruction::Sigmoid,
            0x43 => Instruction::Tanh,
            0x50 => Instruction::MaxPool {
                kh: nibble(operand, 0),
                kw: nibble(operand, 1),
                sh: nibble(operand, 2),
                sw: nibble(operand, 3),
            },
            0x51 => Instruction::AvgPool {
                kh: nibble(operand, 0),
                kw: nibble(operand, 1),
                sh: nibble(operand, 2),
                sw: nibble(operand, 3),
            },
            0x52 => Instruction::GlobalAvgPool,
            0x60 => Instruction::Add,
            0x61 => Instruction::Sub,
            0x62 => Instruction::Mul,
            0x70 => Instruction::BatchNorm,
            0x72 => Instruction::Softmax { axis: operand as u8 as i8 },
            0x80 => Instruction::Quantize { scale_addr: operand as u32 },
            0x82 => Instruction::Requantize { scale_addr: operand as u32 },
            0x84 => Instruction::BiasAdd { addr: operand as u32 },
            other => return Err(format!("unknown opcode 0x{:02X}", other)),
        };
        Ok((inst, flags))
    }
}

/// An instruction paired with its flag byte. This is what the emitter
/// collects and the binary serializes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Inst {
    pub op: Instruction,
    pub flags: u8,
}

impl Inst {
    pub fn new(op: Instruction) -> Self {
        Self { op, flags: 0 }
    }

    pub fn with_flags(op: Instruction, flags: u8) -> Self {
        Self { op, flags }
    }

    pub fn encode(&self) -> u64 {
        self.op.encode(self.flags)
    }

    pub fn to_le_bytes(&self) -> [u8; 8] {
        self.encode().to_le_bytes()
    }

    pub fn decode(word: u64) -> Result<Inst, String> {
        let (op, flags) = Instruction::decode(word)?;
        Ok(Inst { op, flags })
    }
}

impl fmt::Display for Inst {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:<16} flags=0x{:02X} operand=0x{:012X}",
            self.op.mnemonic(),
            self.flags,
            self.op.operand()
        )
    }
}

/// Legacy compact encoding: `[63:60]` opcode, `[59:56]` flags, `[55:48]`
/// dst, `[47:40]` src0, `[39:32]` src1, `[31:0]` immediate.
pub mod compact {
    /// Compact 4-bit opcodes.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    #[repr(u8)]
    pub enum CompactOp {
        Nop = 0x0,
        Conv = 0x1,
        Fc = 0x2,
        Pool = 0x3,
        Act = 0x4,
        Load = 0x5,
        Store = 0x6,
        Sync = 0x7,
        Add = 0x8,
        Mul = 0x9,
        Concat = 0xA,
        Split = 0xB,
    }

    impl CompactOp {
        pub fn from_u8(v: u8) -> Option<CompactOp> {
            Some(match v {
                0x0 => CompactOp::Nop,
                0x1 => CompactOp::Conv,
                0x2 => CompactOp::Fc,
                0x3 => CompactOp::Pool,
                0x4 => CompactOp::Act,
                0x5 => CompactOp::Load,
                0x6 => CompactOp::Store,
                0x7 => CompactOp::Sync,
                0x8 => CompactOp::Add,
                0x9 => CompactOp::Mul,
                0xA => CompactOp::Concat,
                0xB => CompactOp::Split,
                _ => return None,
            })
        }
    }

    /// Pooling selector carried in a compact pool immediate.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    #[repr(u8)]
    pub enum PoolKind {
        Max = 0,
        Avg = 1,
        Global = 2,
    }

    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct CompactInst {
        pub op: CompactOp,
        /// 4-bit flag field.
        pub flags: u8,
        pub dst: u8,
        pub src0: u8,
        pub src1: u8,
        pub imm: u32,
    }

    impl CompactInst {
        pub fn new(op: CompactOp) -> Self {
            Self { op, flags: 0, dst: 0, src0: 0, src1: 0, imm: 0 }
        }

        pub fn to_word(&self) -> u64 {
            ((self.op as u64) << 60)
                | (((self.flags & 0xF) as u64) << 56)
                | ((self.dst as u64) << 48)
                | ((self.src0 as u64) << 40)
                | ((self.src1 as u64) << 32)
                | (self.imm as u64)
        }

        pub fn from_word(word: u64) -> Result<CompactInst, String> {
            let op = CompactOp::from_u8((word >> 60) as u8)
                .ok_or_else(|| format!("unknown compact opcode 0x{:X}", word >> 60))?;
            Ok(CompactInst {
                op,
                flags: ((word >> 56) & 0xF) as u8,
                dst: (word >> 48) as u8,
                src0: (word >> 40) as u8,
                src1: (word >> 32) as u8,
                imm: word as u32,
            })
        }
    }

    /// Convolution geometry packed into a compact immediate:
    /// `[31:28]` kernel, `[27:24]` stride, `[23:20]` padding,
    /// `[19:17]` activation code.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct ConvParams {
        pub kernel: u8,
        pub stride: u8,
        pub padding: u8,
        pub activation: u8,
    }

    impl ConvParams {
        pub fn to_immediate(self) -> u32 {
            (((self.kernel & 0xF) as u32) << 28)
                | (((self.stride & 0xF) as u32) << 24)
                | (((self.padding & 0xF) as u32) << 20)
                | (((self.activation & 0x7) as u32) << 17)
        }

        pub fn from_immediate(imm: u32) -> Self {
            Self {
                kernel: ((imm >> 28) & 0xF) as u8,
                stride: ((imm >> 24) & 0xF) as u8,
                padding: ((imm >> 20) & 0xF) as u8,
                activation: ((imm >> 17) & 0x7) as u8,
            }
        }
    }
}
