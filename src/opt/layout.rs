//! Layout annotation.
//!
//! The PE array streams activations in NHWC and weights in OHWI; this pass
//! tags convolution and fully-connected nodes with those preferred layouts
//! for the code generator. Purely advisory, no structural change.

use super::Pass;
use crate::ir::{Attr, AttrKey, IRGraph, Layout, OpKind};

pub struct LayoutAnnotation;

impl Pass for LayoutAnnotation {
    fn name(&self) -> &'static str {
        "layout_annotation"
    }

    fn run(&self, graph: &mut IRGraph) -> Result<(), String> {
        for node in &mut graph.nodes {
            match node.op {
                OpKind::Conv2d | OpKind::DepthwiseConv2d => {
                    node.set_attr(AttrKey::InputLayout, Attr::Layout(Layout::Nhwc));
                    node.set_attr(AttrKey::WeightLayout, Attr::Layout(Layout::Ohwi));
                    node.set_attr(AttrKey::OutputLayout, Attr::Layout(Layout::Nhwc));
                }
                OpKind::FullyConnected => {
                    node.set_attr(AttrKey::InputLayout, Attr::Layout(Layout::Nc));
                    node.set_attr(AttrKey::WeightLayout, Attr::Layout(Layout::Oi));
                    node.set_attr(AttrKey::OutputLayout, Attr::Layout(Layout::Nc));
                }
                _ => {}
            }
        }
        Ok(())
    }
}
