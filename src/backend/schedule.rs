//! Instruction scheduler.
//!
//! Greedy list scheduling over the topological node order, with one
//! availability cursor per hardware resource. This is a cycle *estimator*
//! of the target's timing, not a hardware simulator: resource contention is
//! integer cursor bookkeeping, ties resolve in topological (first-seen)
//! order, and the result is deterministic for a given graph.

use std::collections::HashMap;

use crate::ir::{IRGraph, IRNode, OpKind};
use crate::target::NpuConfig;

/// Contended hardware resources.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Resource {
    PeArray,
    DmaEngine,
    ActivationUnit,
    PoolingUnit,
}

impl Resource {
    pub const COUNT: usize = 4;

    fn index(self) -> usize {
        match self {
            Resource::PeArray => 0,
            Resource::DmaEngine => 1,
            Resource::ActivationUnit => 2,
            Resource::PoolingUnit => 3,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Resource::PeArray => "pe_array",
            Resource::DmaEngine => "dma",
            Resource::ActivationUnit => "act_unit",
            Resource::PoolingUnit => "pool_unit",
        }
    }
}

/// Fixed resource table per operator kind.
pub fn required_resources(op: OpKind) -> Vec<Resource> {
    if op.is_compute() {
        vec![Resource::PeArray]
    } else if op.is_activation() {
        vec![Resource::ActivationUnit]
    } else if op.is_pooling() {
        vec![Resource::PoolingUnit]
    } else if matches!(
        op,
        OpKind::Reshape | OpKind::Transpose | OpKind::Concat | OpKind::Split | OpKind::Pad
    ) {
        // memory movement only
        vec![Resource::DmaEngine]
    } else {
        Vec::new()
    }
}

/// One scheduled node: a half-open cycle interval and the resources held.
#[derive(Clone, Debug)]
pub struct ScheduleSlot {
    /// Index into `graph.nodes`.
    pub node: usize,
    pub name: String,
    pub start: u64,
    pub end: u64,
    pub resources: Vec<Resource>,
}

impl ScheduleSlot {
    pub fn duration(&self) -> u64 {
        self.end - self.start
    }
}

#[derive(Clone, Debug, Default)]
pub struct Schedule {
    pub slots: Vec<ScheduleSlot>,
    pub total_cycles: u64,
}

impl Schedule {
    fn add_slot(&mut self, slot: ScheduleSlot) {
        self.total_cycles = self.total_cycles.max(slot.end);
        self.slots.push(slot);
    }

    /// Node indices ordered by start cycle (stable on ties).
    pub fn node_order(&self) -> Vec<usize> {
        let mut order: Vec<usize> = (0..self.slots.len()).collect();
        order.sort_by_key(|&i| self.slots[i].start);
        order.into_iter().map(|i| self.slots[i].node).collect()
    }

    /// PE-array busy fraction of the total makespan.
    pub fn pe_utilization(&self) -> f64 {
        if self.total_cycles == 0 {
            return 0.0;
        }
        let busy: u64 = self
            .slots
            .iter()
            .filter(|s| s.resources.contains(&Resource::PeArray))
            .map(|s| s.duration())
            .sum();
        busy as f64 / self.total_cycles as f64
    }

    pub fn format_report(&self, clock_mhz: u32) -> String {
        let mut lines = vec![
            "schedule:".to_string(),
            format!("  total cycles: {}", self.total_cycles),
            format!(
                "  estimated time @ {} MHz: {:.3} ms",
                clock_mhz,
                self.total_cycles as f64 / (clock_mhz as f64 * 1000.0)
            ),
            format!("  pe utilization: {:.1}%", self.pe_utilization() * 100.0),
        ];
        let mut sorted: Vec<&ScheduleSlot> = self.slots.iter().collect();
        sorted.sort_by_key(|s| s.start);
        for slot in sorted {
            let resources: Vec<&str> = slot.resources.iter().map(|r| r.name()).collect();
            lines.push(format!(
                "  [{:>8} - {:>8}] {} [{}]",
                slot.start,
                slot.end,
                slot.name,
                resources.join(", ")
            ));
        }
        lines.join("\n")
    }
}

/// Per-operation cycle estimates for the configured PE geometry.
pub struct CostModel {
    pe_rows: usize,
    pe_cols: usize,
    /// Fixed cycles added per conv tile switch.
    tile_overhead: u64,
    activation_latency: u64,
    pooling_latency: u64,
    /// DMA setup cost in cycles.
    dma_base: u64,
}

impl CostModel {
    pub fn new(config: &NpuConfig) -> Self {
        Self {
            pe_rows: config.pe_rows,
            pe_cols: config.pe_cols,
            tile_overhead: 10,
            activation_latency: 4,
            pooling_latency: 8,
            dma_base: 50,
        }
    }

    fn macs_per_cycle(&self) -> u64 {
        (self.pe_rows * self.pe_cols) as u64
    }

    pub fn conv_cycles(
        &self,
        out_ch: u64,
        in_ch: u64,
        out_h: u64,
        out_w: u64,
        kh: u64,
        kw: u64,
    ) -> u64 {
        let macs = out_ch * in_ch * out_h * out_w * kh * kw;
        let compute = macs.div_ceil(self.macs_per_cycle());
        let oc_tiles = out_ch.div_ceil(self.pe_cols as u64);
        let ic_tiles = in_ch.div_ceil(self.pe_rows as u64);
        compute + oc_tiles * ic_tiles * self.tile_overhead
    }

    pub fn fc_cycles(&self, in_features: u64, out_features: u64) -> u64 {
        (in_features * out_features).div_ceil(self.macs_per_cycle()) + self.tile_overhead
    }

    pub fn pool_cycles(&self, h: u64, w: u64, kh: u64, kw: u64) -> u64 {
        (h / kh.max(1)) * (w / kw.max(1)) * self.pooling_latency
    }

    pub fn activation_cycles(&self, size: u64) -> u64 {
        size.div_ceil(16) * self.activation_latency
    }

    /// Bandwidth-bound estimate: one cycle per 10 bytes plus setup.
    pub fn dma_cycles(&self, bytes: u64) -> u64 {
        bytes / 10 + self.dma_base
    }

    /// Estimated duration of one node.
    pub fn node_cycles(&self, graph: &IRGraph, node: &IRNode) -> u64 {
        match node.op {
            OpKind::Conv2d | OpKind::DepthwiseConv2d => {
                let weight = node.inputs.get(1).and_then(|n| graph.tensor(n));
                let output = node.outputs.first().and_then(|n| graph.tensor(n));
                if let (Some(w), Some(o)) = (weight, output) {
                    if w.shape.len() == 4 && o.shape.len() == 4 {
                        return self.conv_cycles(
                            w.shape[0] as u64,
                            w.shape[1] as u64,
                            o.shape[2] as u64,
                            o.shape[3] as u64,
                            w.shape[2] as u64,
                            w.shape[3] as u64,
                        );
                    }
                }
                100
            }
            OpKind::FullyConnected | OpKind::MatMul => {
                if let Some(w) = node.inputs.get(1).and_then(|n| graph.tensor(n)) {
                    if w.shape.len() >= 2 {
                        return self.fc_cycles(w.shape[1] as u64, w.shape[0] as u64);
                    }
                }
                100
            }
            OpKind::MaxPool2d | OpKind::AvgPool2d => {
                let kernel = node.int_pair(crate::ir::AttrKey::KernelSize).unwrap_or((2, 2));
                if let Some(t) = node.inputs.first().and_then(|n| graph.tensor(n)) {
                    if t.shape.len() == 4 {
                        return self.pool_cycles(
                            t.shape[2] as u64,
                            t.shape[3] as u64,
                            kernel.0 as u64,
                            kernel.1 as u64,
                        );
                    }
                }
                100
            }
            op if op.is_activation() => {
                if let Some(t) = node.inputs.first().and_then(|n| graph.tensor(n)) {
                    return self.activation_cycles(t.size() as u64);
                }
                100
            }
            OpKind::Reshape | OpKind::Transpose | OpKind::Concat | OpKind::Split | OpKind::Pad => {
                if let Some(t) = node.outputs.first().and_then(|n| graph.tensor(n)) {
                    return self.dma_cycles(t.nbytes() as u64);
                }
                100
            }
            _ => 100,
        }
    }
}

/// Schedule the graph. All scheduling state (resource cursors, tensor
/// readiness) is local to this call, so runs are independent.
pub fn schedule(graph: &IRGraph, config: &NpuConfig) -> Schedule {
    let cost = CostModel::new(config);
    let mut result = Schedule::default();

    let mut resource_free = [0u64; Resource::COUNT];
    let mut tensor_ready: HashMap<&str, u64> = HashMap::new();
    // graph inputs and constants are resident before cycle 0
    for name in &graph.inputs {
        tensor_ready.insert(name, 0);
    }
    for (name, tensor) in &graph.tensors {
        if tensor.is_const() {
            tensor_ready.insert(name, 0);
        }
    }

    for i in graph.topological_sort() {
        let node = &graph.nodes[i];

        let mut earliest = 0u64;
        for inp in &node.inputs {
            if let Some(&ready) = tensor_ready.get(inp.as_str()) {
                earliest = earliest.max(ready);
            }
        }
        let resources = required_resources(node.op);
        for r in &resources {
            earliest = earliest.max(resource_free[r.index()]);
        }

        let duration = cost.node_cycles(graph, node);
        let end = earliest + duration;
        for r in &resources {
            resource_free[r.index()] = end;
        }
        for out in &node.outputs {
            tensor_ready.insert(out, end);
        }

        result.add_slot(ScheduleSlot {
            node: i,
            name: node.name.clone(),
            start: earliest,
            end,
            resources,
        });
    }

    result
}
