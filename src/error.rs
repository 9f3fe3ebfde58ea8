use std::fmt;

use crate::backend::memory::Region;
use crate::ir::OpKind;

/// Fatal compilation errors.
///
/// Pass failures are deliberately *not* represented here: optimization is
/// best-effort and a failing pass is reported as a [`crate::diagnostic::Diagnostic`]
/// warning and skipped. Everything in this enum aborts compilation.
#[derive(Clone, Debug, PartialEq)]
pub enum CompileError {
    /// The graph failed structural validation before any pass ran.
    Validation(Vec<String>),
    /// An on-chip pool ran out of space. Reports the offending tensor,
    /// the bytes it needed, and the pool's fixed capacity.
    PoolOverflow {
        region: Region,
        tensor: String,
        needed: usize,
        capacity: usize,
    },
    /// The emitter met an operator it cannot lower. Skipping would silently
    /// produce an incomplete binary, so this is fatal.
    UnsupportedOp { node: String, op: OpKind },
    /// The instruction stream exceeds the instruction buffer.
    InstructionOverflow { count: usize, capacity: usize },
    /// Unknown hardware target name.
    UnknownTarget(String),
    /// Malformed model definition input.
    ModelDef(String),
    /// File I/O failure, carrying the underlying message.
    Io(String),
}

impl fmt::Display for CompileError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CompileError::Validation(errors) => {
                writeln!(f, "graph validation failed:")?;
                for e in errors {
                    writeln!(f, "  {}", e)?;
                }
                Ok(())
            }
            CompileError::PoolOverflow {
                region,
                tensor,
                needed,
                capacity,
            } => write!(
                f,
                "out of memory in {}: tensor '{}' needs {} bytes, capacity {} bytes",
                region, tensor, needed, capacity
            ),
            CompileError::UnsupportedOp { node, op } => {
                write!(f, "cannot lower node '{}': unsupported operator {}", node, op)
            }
            CompileError::InstructionOverflow { count, capacity } => write!(
                f,
                "instruction stream too long: {} instructions, buffer holds {}",
                count, capacity
            ),
            CompileError::UnknownTarget(name) => write!(f, "unknown target '{}'", name),
            CompileError::ModelDef(msg) => write!(f, "invalid model definition: {}", msg),
            CompileError::Io(msg) => write!(f, "i/o error: {}", msg),
        }
    }
}

impl std::error::Error for CompileError {}

impl From<std::io::Error> for CompileError {
    fn from(e: std::io::Error) -> Self {
        CompileError::Io(e.to_string())
    }
}
