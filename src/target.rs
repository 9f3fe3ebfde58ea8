use crate::error::CompileError;

/// NPU hardware configuration — replaces all hardcoded constants.
///
/// Every numeric constant of the target accelerator (PE array geometry,
/// on-chip buffer capacities, clock) lives here so the optimizer, scheduler,
/// allocator and emitter never bake in device-specific numbers.
#[derive(Clone, Debug)]
pub struct NpuConfig {
    /// Short identifier used in CLI and reports (e.g. "edge16").
    pub name: String,
    /// Rows of the PE (MAC) array.
    pub pe_rows: usize,
    /// Columns of the PE (MAC) array.
    pub pe_cols: usize,
    /// Core clock in MHz, used for wall-time estimates in reports.
    pub clock_mhz: u32,
    /// On-chip weight buffer capacity in KiB.
    pub weight_buf_kb: usize,
    /// On-chip activation buffer capacity in KiB.
    pub act_buf_kb: usize,
    /// Instruction buffer capacity in 64-bit entries.
    pub inst_buf_entries: usize,
    /// Byte alignment for on-chip buffer allocations.
    pub alignment: usize,
    /// File extension for compiled output (e.g. ".npubin").
    pub output_extension: String,
}

impl NpuConfig {
    /// Built-in EdgeNPU-16 configuration: 16x16 PE array, 256 KiB weight
    /// and activation buffers, 500 MHz.
    pub fn edge16() -> Self {
        Self {
            name: "edge16".to_string(),
            pe_rows: 16,
            pe_cols: 16,
            clock_mhz: 500,
            weight_buf_kb: 256,
            act_buf_kb: 256,
            inst_buf_entries: 1024,
            alignment: 16,
            output_extension: ".npubin".to_string(),
        }
    }

    /// Weight buffer capacity in bytes.
    pub fn weight_buf_bytes(&self) -> usize {
        self.weight_buf_kb * 1024
    }

    /// Activation buffer capacity in bytes.
    pub fn act_buf_bytes(&self) -> usize {
        self.act_buf_kb * 1024
    }

    /// MACs the PE array completes per cycle.
    pub fn macs_per_cycle(&self) -> usize {
        self.pe_rows * self.pe_cols
    }

    /// Resolve a configuration by name.
    pub fn resolve(name: &str) -> Result<Self, CompileError> {
        match name {
            "edge16" => Ok(Self::edge16()),
            other => Err(CompileError::UnknownTarget(other.to_string())),
        }
    }
}

impl Default for NpuConfig {
    fn default() -> Self {
        Self::edge16()
    }
}
