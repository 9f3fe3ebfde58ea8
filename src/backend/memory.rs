//! On-chip memory allocation.
//!
//! Two fixed-capacity SRAM pools: a weight buffer holding every constant
//! for the whole run, and an activation buffer shared between intermediate
//! tensors via liveness. Allocation is bump-pointer with alignment padding;
//! freeing a block rolls the bump pointer back to the end of the highest
//! surviving block, so the arena behind a freed interval is reusable.
//! Overflow of either pool is a fatal compile error, never a truncation.

use std::collections::BTreeMap;

use crate::error::CompileError;
use crate::ir::IRGraph;
use crate::target::NpuConfig;

/// Which on-chip SRAM a block lives in.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Region {
    WeightBuffer,
    ActivationBuffer,
}

impl std::fmt::Display for Region {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Region::WeightBuffer => "weight buffer",
            Region::ActivationBuffer => "activation buffer",
        })
    }
}

/// One placed allocation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MemoryBlock {
    pub name: String,
    pub region: Region,
    pub offset: usize,
    pub size: usize,
    /// Tensor this block backs.
    pub tensor: String,
}

impl MemoryBlock {
    pub fn end(&self) -> usize {
        self.offset + self.size
    }
}

/// A bump-pointer pool over one region.
#[derive(Debug)]
pub struct MemoryPool {
    region: Region,
    capacity: usize,
    alignment: usize,
    blocks: Vec<MemoryBlock>,
    free_offset: usize,
    peak_usage: usize,
}

impl MemoryPool {
    pub fn new(region: Region, capacity: usize, alignment: usize) -> Self {
        Self {
            region,
            capacity,
            alignment: alignment.max(1),
            blocks: Vec::new(),
            free_offset: 0,
            peak_usage: 0,
        }
    }

    fn align_up(&self, v: usize) -> usize {
        v.div_ceil(self.alignment) * self.alignment
    }

    /// Place a block at the current bump pointer, aligned up.
    pub fn allocate(
        &mut self,
        name: impl Into<String>,
        size: usize,
        tensor: impl Into<String>,
    ) -> Result<MemoryBlock, CompileError> {
        let tensor = tensor.into();
        let offset = self.align_up(self.free_offset);
        if offset + size > self.capacity {
            return Err(CompileError::PoolOverflow {
                region: self.region,
                tensor,
                needed: size,
                capacity: self.capacity,
            });
        }
        let block = MemoryBlock {
            name: name.into(),
            region: self.region,
            offset,
            size,
            tensor,
        };
        self.free_offset = block.end();
        self.peak_usage = self.peak_usage.max(self.free_offset);
        self.blocks.push(block.clone());
        Ok(block)
    }

    /// Release the block backing `tensor`. The bump pointer retreats to the
    /// end of the highest surviving block, so trailing space is reclaimed.
    pub fn free(&mut self, tensor: &str) {
        let before = self.blocks.len();
        self.blocks.retain(|b| b.tensor != tensor);
        if self.blocks.len() != before {
            self.free_offset = self.blocks.iter().map(|b| b.end()).max().unwrap_or(0);
        }
    }

    pub fn live_blocks(&self) -> &[MemoryBlock] {
        &self.blocks
    }

    pub fn peak_usage(&self) -> usize {
        self.peak_usage
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn reset(&mut self) {
        self.blocks.clear();
        self.free_offset = 0;
        self.peak_usage = 0;
    }
}

/// Tensor live ranges in scheduled-order positions, inclusive on both ends.
#[derive(Clone, Debug, Default)]
pub struct Liveness {
    ranges: BTreeMap<String, (usize, usize)>,
}

impl Liveness {
    /// Walk `order` and record each tensor's first and last touch.
    pub fn analyze(graph: &IRGraph, order: &[usize]) -> Self {
        let mut ranges: BTreeMap<String, (usize, usize)> = BTreeMap::new();
        for (pos, &i) in order.iter().enumerate() {
            let node = &graph.nodes[i];
            for name in node.inputs.iter().chain(node.outputs.iter()) {
                ranges
                    .entry(name.clone())
                    .and_modify(|r| r.1 = pos)
                    .or_insert((pos, pos));
            }
        }
        Self { ranges }
    }

    pub fn range(&self, tensor: &str) -> Option<(usize, usize)> {
        self.ranges.get(tensor).copied()
    }

    /// True when the two live ranges share at least one position.
    pub fn overlaps(&self, a: &str, b: &str) -> bool {
        match (self.range(a), self.range(b)) {
            (Some((a0, a1)), Some((b0, b1))) => a0 <= b1 && b0 <= a1,
            _ => false,
        }
    }
}

/// Allocates both pools for a graph and keeps the resulting offset maps.
pub struct MemoryAllocator {
    weight_pool: MemoryPool,
    activation_pool: MemoryPool,
    weight_offsets: BTreeMap<String, usize>,
    activation_offsets: BTreeMap<String, usize>,
    liveness: Liveness,
}

impl MemoryAllocator {
    pub fn new(config: &NpuConfig) -> Self {
        Self {
            weight_pool: MemoryPool::new(
                Region::WeightBuffer,
                config.weight_buf_bytes(),
                config.alignment,
            ),
            activation_pool: MemoryPool::new(
                Region::ActivationBuffer,
                config.act_buf_bytes(),
                config.alignment,
            ),
            weight_offsets: BTreeMap::new(),
            activation_offsets: BTreeMap::new(),
            liveness: Liveness::default(),
        }
    }

    pub fn allocate(&mut self, graph: &IRGraph) -> Result<(), CompileError> {
        self.allocate_weights(graph)?;
        self.allocate_activations(graph)?;
        Ok(())
    }

    /// Constants are resident for the whole run: one pass over the tensor
    /// table in name order, which is deterministic.
    fn allocate_weights(&mut self, graph: &IRGraph) -> Result<(), CompileError> {
        for (name, tensor) in &graph.tensors {
            if !tensor.is_const() {
                continue;
            }
            let block =
                self.weight_pool
                    .allocate(format!("weight_{}", name), tensor.nbytes(), name)?;
            self.weight_offsets.insert(name.clone(), block.offset);
        }
        Ok(())
    }

    /// Activations share the pool via liveness: before placing a node's
    /// outputs, free every tensor whose last use is already behind us.
    fn allocate_activations(&mut self, graph: &IRGraph) -> Result<(), CompileError> {
        let order = graph.topological_sort();
        self.liveness = Liveness::analyze(graph, &order);

        let mut live: Vec<String> = Vec::new();
        for (pos, &i) in order.iter().enumerate() {
            live.retain(|tensor| {
                let (_, last) = self.liveness.range(tensor).unwrap_or((0, 0));
                if last < pos {
                    self.activation_pool.free(tensor);
                    false
                } else {
                    true
                }
            });

            let node = &graph.nodes[i];
            for out in &node.outputs {
                let Some(tensor) = graph.tensor(out) else {
                    continue;
                };
                if tensor.is_const() {
                    continue;
                }
                let block =
                    self.activation_pool
                        .allocate(format!("act_{}", out), tensor.nbytes(), out)?;
                self.activation_offsets.insert(out.clone(), block.offset);
                live.push(out.clone());
            }
        }
        Ok(())
    }

    pub fn weight_offsets(&self) -> &BTreeMap<String, usize> {
        &self.weight_offsets
    }

    pub fn activation_offsets(&self) -> &BTreeMap<String, usize> {
        &self.activation_offsets
    }

    pub fn liveness(&self) -> &Liveness {
        &self.liveness
    }

    pub fn weight_peak(&self) -> usize {
        self.weight_pool.peak_usage()
    }

    pub fn activation_peak(&self) -> usize {
        self.activation_pool.peak_usage()
    }

    pub fn format_report(&self) -> String {
        let mut lines = vec!["memory:".to_string()];
        for (label, pool) in [
            ("weight", &self.weight_pool),
            ("activation", &self.activation_pool),
        ] {
            lines.push(format!(
                "  {} pool: peak {} / {} bytes ({:.1}%)",
                label,
                pool.peak_usage(),
                pool.capacity(),
                pool.peak_usage() as f64 / pool.capacity() as f64 * 100.0
            ));
        }
        for (name, offset) in &self.weight_offsets {
            lines.push(format!("  weight {:>8}  {}", offset, name));
        }
        for (name, offset) in &self.activation_offsets {
            lines.push(format!("  act    {:>8}  {}", offset, name));
        }
        lines.join("\n")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::builder::IRBuilder;
    use crate::ir::{DataType, TensorData};

    #[test]
    fn test_alloc_respects_alignment() {
        let mut pool = MemoryPool::new(Region::ActivationBuffer, 1024, 16);
        let a = pool.allocate("a", 10, "t_a").unwrap();
        let b = pool.allocate("b", 10, "t_b").unwrap();
        assert_eq!(a.offset, 0);
        assert_eq!(b.offset, 16);
    }

    #[test]
    fn test_overflow_is_an_error() {
        let mut pool = MemoryPool::new(Region::WeightBuffer, 64, 16);
        pool.allocate("a", 48, "t_a").unwrap();
        let err = pool.allocate("b", 48, "t_b").unwrap_err();
        assert!(matches!(err, CompileError::PoolOverflow { needed: 48, .. }));
    }

    #[test]
    fn test_free_rolls_back_bump_pointer() {
        let mut pool = MemoryPool::new(Region::ActivationBuffer, 256, 16);
        pool.allocate("a", 32, "t_a").unwrap();
        pool.allocate("b", 32, "t_b").unwrap();
        pool.free("t_b");
        // t_b's arena is reclaimed: next block lands where t_b was
        let c = pool.allocate("c", 32, "t_c").unwrap();
        assert_eq!(c.offset, 32);
    }

    #[test]
    fn test_peak_usage_survives_free() {
        let mut pool = MemoryPool::new(Region::ActivationBuffer, 256, 16);
        pool.allocate("a", 64, "t_a").unwrap();
        pool.free("t_a");
        pool.allocate("b", 16, "t_b").unwrap();
        assert_eq!(pool.peak_usage(), 64);
    }

    fn chain_graph() -> crate::ir::IRGraph {
        let mut b = IRBuilder::new("m");
        b.add_input("x", vec![1, 16], DataType::F32);
        let a = b.relu("x");
        let c = b.sigmoid(&a);
        let d = b.tanh(&c);
        b.add_output(&d);
        b.build().unwrap()
    }

    #[test]
    fn test_liveness_ranges() {
        let g = chain_graph();
        let order = g.topological_sort();
        let live = Liveness::analyze(&g, &order);
        // relu output: produced at 0, consumed at 1
        assert_eq!(live.range("relu_out_0"), Some((0, 1)));
        assert!(live.overlaps("relu_out_0", "sigmoid_out_1"));
        assert!(!live.overlaps("relu_out_0", "tanh_out_2"));
    }

    #[test]
    fn test_chain_allocation_is_deterministic() {
        let g = chain_graph();
        let mut a = MemoryAllocator::new(&NpuConfig::edge16());
        let mut b = MemoryAllocator::new(&NpuConfig::edge16());
        a.allocate(&g).unwrap();
        b.allocate(&g).unwrap();
        assert_eq!(a.activation_offsets(), b.activation_offsets());
        assert_eq!(a.weight_offsets(), b.weight_offsets());
    }

    #[test]
    fn test_overlapping_tensors_get_disjoint_blocks() {
        let g = chain_graph();
        let mut alloc = MemoryAllocator::new(&NpuConfig::edge16());
        alloc.allocate(&g).unwrap();
        let a = alloc.activation_offsets()["relu_out_0"];
        let b = alloc.activation_offsets()["sigmoid_out_1"];
        assert_ne!(a, b);
    }

    #[test]
    fn test_weights_are_never_freed() {
        let mut b = IRBuilder::new("m");
        b.add_input("x", vec![1, 4, 8, 8], DataType::F32);
        b.add_constant("w1", vec![4, 4, 1, 1], TensorData::F32(vec![0.1; 16]));
        b.add_constant("w2", vec![4, 4, 1, 1], TensorData::F32(vec![0.2; 16]));
        let c1 = b.conv2d("x", "w1", None, (1, 1), (1, 1), (0, 0), 1, None);
        let c2 = b.conv2d(&c1, "w2", None, (1, 1), (1, 1), (0, 0), 1, None);
        b.add_output(&c2);
        let g = b.build().unwrap();

        let mut alloc = MemoryAllocator::new(&NpuConfig::edge16());
        alloc.allocate(&g).unwrap();
        let w1 = alloc.weight_offsets()["w1"];
        let w2 = alloc.weight_offsets()["w2"];
        assert_ne!(w1, w2);
        assert_eq!(alloc.weight_offsets().len(), 2);
    }
}
