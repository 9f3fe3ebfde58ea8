//! Tiling.
//!
//! Conv and fully-connected weights rarely fit the PE array or the weight
//! buffer whole. This pass picks output/input-channel tile sizes bounded by
//! the PE geometry, then halves the output-channel tile until the per-tile
//! weight footprint fits the weight buffer. The result lands on the node as
//! a tile configuration for the scheduler and code generator.

use super::Pass;
use crate::ir::{IRGraph, OpKind, TileConfig};
use crate::target::NpuConfig;

pub struct Tiling {
    pe_rows: usize,
    pe_cols: usize,
    weight_buf_bytes: usize,
}

impl Tiling {
    pub fn new(config: &NpuConfig) -> Self {
        Self {
            pe_rows: config.pe_rows,
            pe_cols: config.pe_cols,
            weight_buf_bytes: config.weight_buf_bytes(),
        }
    }
}

impl Pass for Tiling {
    fn name(&self) -> &'static str {
        "tiling"
    }

    fn run(&self, graph: &mut IRGraph) -> Result<(), String> {
        for i in 0..graph.nodes.len() {
            let node = &graph.nodes[i];
            let tile = match node.op {
                OpKind::Conv2d | OpKind::DepthwiseConv2d => {
                    let Some(weight) = node.inputs.get(1).and_then(|w| graph.tensor(w)) else {
                        continue;
                    };
                    if weight.shape.len() != 4 {
                        return Err(format!(
                            "conv weight '{}' has rank {}, expected 4",
                            weight.name,
                            weight.shape.len()
                        ));
                    }
                    let (out_ch, in_ch, kh, kw) =
                        (weight.shape[0], weight.shape[1], weight.shape[2], weight.shape[3]);
                    let width = weight.dtype.width();

                    let mut tile_oc = out_ch.min(self.pe_cols);
                    let tile_ic = in_ch.min(self.pe_rows);
                    while tile_oc * tile_ic * kh * kw * width > self.weight_buf_bytes && tile_oc > 1
                    {
                        tile_oc /= 2;
                    }
                    TileConfig {
                        tile_oc,
                        tile_ic,
                        tile_oh: 1,
                        tile_ow: 1,
                    }
                }
                OpKind::FullyConnected => {
                    let Some(weight) = node.inputs.get(1).and_then(|w| graph.tensor(w)) else {
                        continue;
                    };
                    let (out_features, in_features) = (weight.shape[0], weight.shape[1]);
                    TileConfig {
                        tile_oc: out_features.min(self.pe_cols),
                        tile_ic: in_features.min(self.pe_rows),
                        tile_oh: 1,
                        tile_ow: 1,
                    }
                }
                _ => continue,
            };
            graph.nodes[i].tile = Some(tile);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::builder::IRBuilder;
    use crate::ir::{DataType, TensorData};

    #[test]
    fn test_tile_bounded_by_pe_array() {
        let mut b = IRBuilder::new("m");
        b.add_input("x", vec![1, 64, 8, 8], DataType::F32);
        b.add_constant("w", vec![128, 64, 3, 3], TensorData::F32(vec![0.0; 128 * 64 * 9]));
        let out = b.conv2d("x", "w", None, (3, 3), (1, 1), (1, 1), 1, None);
        b.add_output(&out);
        let mut g = b.build().unwrap();

        Tiling::new(&NpuConfig::edge16()).run(&mut g).unwrap();
        let tile = g.nodes[0].tile.unwrap();
        assert_eq!(tile.tile_oc, 16);
        assert_eq!(tile.tile_ic, 16);
    }

    #[test]
    fn test_tile_oc_halved_until_buffer_fits() {
        let mut b = IRBuilder::new("m");
        b.add_input("x", vec![1, 4, 8, 8], DataType::F32);
        b.add_constant("w", vec![8, 4, 3, 3], TensorData::F32(vec![0.0; 8 * 4 * 9]));
        let out = b.conv2d("x", "w", None, (3, 3), (1, 1), (1, 1), 1, None);
        b.add_output(&out);
        let mut g = b.build().unwrap();

        // per-tile f32 bytes = tile_oc * 4 * 3 * 3 * 4 = 144 * tile_oc
        Tiling {
            pe_rows: 16,
            pe_cols: 16,
            weight_buf_bytes: 300,
        }
        .run(&mut g)
        .unwrap();

        let tile = g.nodes[0].tile.unwrap();
        // 144 * 2 = 288 <= 300, 144 * 4 = 576 > 300
        assert_eq!(tile.tile_oc, 2);
        assert_eq!(tile.tile_ic, 4);
    }
}
