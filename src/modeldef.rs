//! JSON model definitions.
//!
//! The host-side exporter writes a model as a flat layer list with inline
//! weights. [`parse`] deserializes it, [`to_graph`] lowers it onto the
//! [`IRBuilder`] (the normal path), and [`compile_compact`] is the legacy
//! path that bypasses the graph pipeline and emits the first-generation
//! compact encoding directly, one instruction pair per layer.

use serde::Deserialize;

use crate::backend::codegen::CompiledModel;
use crate::backend::isa::compact::{CompactInst, CompactOp, ConvParams, PoolKind};
use crate::backend::isa::FORMAT_COMPACT;
use crate::error::CompileError;
use crate::ir::builder::IRBuilder;
use crate::ir::{Activation, DataType, IRGraph, TensorData};
use crate::quant::quantize_symmetric;

#[derive(Debug, Deserialize)]
pub struct ModelDef {
    pub name: String,
    /// NCHW shape of the single model input.
    pub input_shape: Vec<usize>,
    #[serde(default)]
    pub layers: Vec<LayerDef>,
}

#[derive(Debug, Default, Deserialize)]
pub struct LayerDef {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub out_channels: Option<usize>,
    #[serde(default)]
    pub kernel_size: Option<usize>,
    #[serde(default)]
    pub stride: Option<usize>,
    #[serde(default)]
    pub padding: Option<usize>,
    #[serde(default)]
    pub groups: Option<usize>,
    #[serde(default)]
    pub out_features: Option<usize>,
    #[serde(default)]
    pub activation: Option<String>,
    #[serde(default)]
    pub axis: Option<i64>,
    #[serde(default)]
    pub epsilon: Option<f32>,
    #[serde(default)]
    pub shape: Option<Vec<usize>>,
    #[serde(default)]
    pub weights: Option<Vec<f32>>,
    #[serde(default)]
    pub bias: Option<Vec<f32>>,
    #[serde(default)]
    pub gamma: Option<Vec<f32>>,
    #[serde(default)]
    pub beta: Option<Vec<f32>>,
    #[serde(default)]
    pub mean: Option<Vec<f32>>,
    #[serde(default)]
    pub variance: Option<Vec<f32>>,
}

impl LayerDef {
    fn parse_activation(&self) -> Result<Option<Activation>, CompileError> {
        match &self.activation {
            None => Ok(None),
            Some(s) => Activation::parse(s)
                .map(Some)
                .ok_or_else(|| CompileError::ModelDef(format!("unknown activation '{}'", s))),
        }
    }
}

/// Deserialize a model definition from JSON text.
pub fn parse(json: &str) -> Result<ModelDef, CompileError> {
    let def: ModelDef =
        serde_json::from_str(json).map_err(|e| CompileError::ModelDef(e.to_string()))?;
    if def.input_shape.is_empty() {
        return Err(CompileError::ModelDef("input_shape must not be empty".to_string()));
    }
    Ok(def)
}

fn constant(
    builder: &mut IRBuilder,
    name: String,
    shape: Vec<usize>,
    values: Option<&Vec<f32>>,
) -> Result<String, CompileError> {
    let size: usize = shape.iter().product();
    let data = match values {
        Some(v) if v.len() == size => v.clone(),
        Some(v) => {
            return Err(CompileError::ModelDef(format!(
                "'{}' has {} values, shape {:?} needs {}",
                name,
                v.len(),
                shape,
                size
            )));
        }
        // exporter omitted the payload (weight-less export); zeros keep
        // the pipeline exercisable
        None => vec![0.0; size],
    };
    Ok(builder.add_constant(&name, shape, TensorData::F32(data)))
}

/// Lower a definition onto the IR builder.
pub fn to_graph(def: &ModelDef) -> Result<IRGraph, CompileError> {
    let mut b = IRBuilder::new(&def.name);
    let mut cur = b.add_input("input", def.input_shape.clone(), DataType::F32);

    for (i, layer) in def.layers.iter().enumerate() {
        let in_shape: Vec<usize> = b
            .shape(&cur)
            .ok_or_else(|| CompileError::ModelDef(format!("layer {}: no input shape", i)))?
            .to_vec();

        cur = match layer.kind.as_str() {
            "conv2d" | "depthwise_conv2d" => {
                if in_shape.len() != 4 {
                    return Err(CompileError::ModelDef(format!(
                        "layer {}: conv2d needs a rank-4 input, got {:?}",
                        i, in_shape
                    )));
                }
                let in_ch = in_shape[1];
                let out_ch = layer.out_channels.unwrap_or(in_ch);
                let k = layer.kernel_size.unwrap_or(3);
                let s = layer.stride.unwrap_or(1);
                let p = layer.padding.unwrap_or(0);
                let groups = if layer.kind == "depthwise_conv2d" {
                    layer.groups.unwrap_or(in_ch)
                } else {
                    layer.groups.unwrap_or(1)
                };
                let w_in = if groups > 1 { 1 } else { in_ch };

                let w = constant(
                    &mut b,
                    format!("layer{}.weight", i),
                    vec![out_ch, w_in, k, k],
                    layer.weights.as_ref(),
                )?;
                let bias = match &layer.bias {
                    Some(values) => Some(constant(
                        &mut b,
                        format!("layer{}.bias", i),
                        vec![out_ch],
                        Some(values),
                    )?),
                    None => None,
                };
                b.conv2d(
                    &cur,
                    &w,
                    bias.as_deref(),
                    (k, k),
                    (s, s),
                    (p, p),
                    groups,
                    layer.parse_activation()?,
                )
            }
            "fully_connected" => {
                let in_features: usize = in_shape[1..].iter().product();
                let out_features = layer
                    .out_features
                    .ok_or_else(|| CompileError::ModelDef(format!("layer {}: out_features missing", i)))?;
                let flat = if in_shape.len() > 2 {
                    b.reshape(&cur, vec![in_shape[0], in_features])
                } else {
                    cur.clone()
                };
                let w = constant(
                    &mut b,
                    format!("layer{}.weight", i),
                    vec![out_features, in_features],
                    layer.weights.as_ref(),
                )?;
                let bias = match &layer.bias {
                    Some(values) => Some(constant(
                        &mut b,
                        format!("layer{}.bias", i),
                        vec![out_features],
                        Some(values),
                    )?),
                    None => None,
                };
                b.fully_connected(&flat, &w, bias.as_deref(), layer.parse_activation()?)
            }
            "relu" => b.relu(&cur),
            "relu6" => b.relu6(&cur),
            "sigmoid" => b.sigmoid(&cur),
            "tanh" => b.tanh(&cur),
            "softmax" => b.softmax(&cur, layer.axis.unwrap_or(-1)),
            "max_pool2d" | "avg_pool2d" => {
                let k = layer.kernel_size.unwrap_or(2);
                let s = layer.stride.unwrap_or(k);
                if layer.kind == "max_pool2d" {
                    b.max_pool2d(&cur, (k, k), (s, s))
                } else {
                    b.avg_pool2d(&cur, (k, k), (s, s))
                }
            }
            "global_avg_pool" => b.global_avg_pool(&cur),
            "flatten" => {
                let flat: usize = in_shape[1..].iter().product();
                b.reshape(&cur, vec![in_shape[0], flat])
            }
            "reshape" => {
                let shape = layer
                    .shape
                    .clone()
                    .ok_or_else(|| CompileError::ModelDef(format!("layer {}: shape missing", i)))?;
                b.reshape(&cur, shape)
            }
            "batch_norm" => {
                let ch = in_shape.get(1).copied().unwrap_or(1);
                let gamma = constant(&mut b, format!("layer{}.gamma", i), vec![ch], layer.gamma.as_ref())?;
                let beta = constant(&mut b, format!("layer{}.beta", i), vec![ch], layer.beta.as_ref())?;
                let mean = constant(&mut b, format!("layer{}.mean", i), vec![ch], layer.mean.as_ref())?;
                let var = constant(
                    &mut b,
                    format!("layer{}.variance", i),
                    vec![ch],
                    layer.variance.as_ref(),
                )?;
                b.batch_norm(&cur, &gamma, &beta, &mean, &var, layer.epsilon.unwrap_or(1e-5))
            }
            other => {
                return Err(CompileError::ModelDef(format!(
                    "layer {}: unknown layer type '{}'",
                    i, other
                )));
            }
        };
    }

    b.add_output(&cur);
    b.build()
}

fn activation_code(name: Option<&String>) -> u8 {
    name.and_then(|s| Activation::parse(s)).map(|a| a.code()).unwrap_or(0)
}

/// Legacy compact-format compilation, straight from the layer list.
///
/// One load/compute instruction pair per layer against a register-style
/// tensor numbering: layer `i` reads slot `i` and writes slot `i + 1`.
/// Weights and biases are INT8-quantized inline with no alignment padding.
pub fn compile_compact(def: &ModelDef) -> Result<CompiledModel, CompileError> {
    let mut insts: Vec<CompactInst> = Vec::new();
    let mut weights: Vec<u8> = Vec::new();
    let mut bias: Vec<u8> = Vec::new();
    let mut layer_count = 0usize;
    let mut shape = def.input_shape.clone();
    let input_size: usize = shape.iter().product();

    for (i, layer) in def.layers.iter().enumerate() {
        let slot = i as u8;
        match layer.kind.as_str() {
            "conv2d" => {
                if shape.len() != 4 {
                    return Err(CompileError::ModelDef(format!(
                        "layer {}: conv2d needs a rank-4 input",
                        i
                    )));
                }
                let in_ch = shape[1];
                let out_ch = layer.out_channels.unwrap_or(in_ch);
                let k = layer.kernel_size.unwrap_or(3);
                let s = layer.stride.unwrap_or(1);
                let p = layer.padding.unwrap_or(0);

                let mut load = CompactInst::new(CompactOp::Load);
                load.dst = 0;
                load.imm = weights.len() as u32;
                insts.push(load);

                let count = out_ch * in_ch * k * k;
                let values = layer.weights.clone().unwrap_or_else(|| vec![0.0; count]);
                let (q, _) = quantize_symmetric(&values);
                weights.extend(q.iter().map(|&v| v as u8));
                if let Some(b) = &layer.bias {
                    let (q, _) = quantize_symmetric(b);
                    bias.extend(q.iter().map(|&v| v as u8));
                }

                let mut conv = CompactInst::new(CompactOp::Conv);
                conv.dst = slot + 1;
                conv.src0 = slot;
                conv.imm = ConvParams {
                    kernel: k as u8,
                    stride: s as u8,
                    padding: p as u8,
                    activation: activation_code(layer.activation.as_ref()),
                }
                .to_immediate();
                insts.push(conv);

                let oh = (shape[2] + 2 * p - k) / s + 1;
                let ow = (shape[3] + 2 * p - k) / s + 1;
                shape = vec![shape[0], out_ch, oh, ow];
                layer_count += 1;
            }
            "fully_connected" => {
                let in_features: usize = shape[1..].iter().product();
                let out_features = layer
                    .out_features
                    .ok_or_else(|| CompileError::ModelDef(format!("layer {}: out_features missing", i)))?;

                let mut load = CompactInst::new(CompactOp::Load);
                load.imm = weights.len() as u32;
                insts.push(load);

                let values = layer
                    .weights
                    .clone()
                    .unwrap_or_else(|| vec![0.0; in_features * out_features]);
                let (q, _) = quantize_symmetric(&values);
                weights.extend(q.iter().map(|&v| v as u8));
                if let Some(b) = &layer.bias {
                    let (q, _) = quantize_symmetric(b);
                    bias.extend(q.iter().map(|&v| v as u8));
                }

                let mut fc = CompactInst::new(CompactOp::Fc);
                fc.dst = slot + 1;
                fc.src0 = slot;
                fc.imm = ((in_features as u32 & 0xFFFF) << 16) | (out_features as u32 & 0xFFFF);
                insts.push(fc);

                shape = vec![shape[0], out_features];
                layer_count += 1;
            }
            "max_pool2d" | "avg_pool2d" | "global_avg_pool" => {
                let (kind, k, s) = match layer.kind.as_str() {
                    "max_pool2d" => {
                        let k = layer.kernel_size.unwrap_or(2);
                        (PoolKind::Max, k, layer.stride.unwrap_or(k))
                    }
                    "avg_pool2d" => {
                        let k = layer.kernel_size.unwrap_or(2);
                        (PoolKind::Avg, k, layer.stride.unwrap_or(k))
                    }
                    _ => (PoolKind::Global, shape.get(2).copied().unwrap_or(1), 1),
                };
                let mut pool = CompactInst::new(CompactOp::Pool);
                pool.dst = slot + 1;
                pool.src0 = slot;
                pool.imm = ((kind as u32) << 28) | ((k as u32 & 0xFF) << 4) | (s as u32 & 0xF);
                insts.push(pool);

                if shape.len() == 4 {
                    shape = match kind {
                        PoolKind::Global => vec![shape[0], shape[1], 1, 1],
                        _ => vec![
                            shape[0],
                            shape[1],
                            (shape[2] - k) / s + 1,
                            (shape[3] - k) / s + 1,
                        ],
                    };
                }
            }
            "relu" | "relu6" | "sigmoid" | "tanh" => {
                let mut act = CompactInst::new(CompactOp::Act);
                act.dst = slot + 1;
                act.src0 = slot;
                act.imm = Activation::parse(&layer.kind).map(|a| a.code()).unwrap_or(0) as u32;
                insts.push(act);
            }
            "flatten" => {
                let flat: usize = shape[1..].iter().product();
                shape = vec![shape[0], flat];
            }
            other => {
                return Err(CompileError::ModelDef(format!(
                    "layer {}: '{}' is not representable in the compact format",
                    i, other
                )));
            }
        }
    }

    // terminator; flag bit 0 marks the final instruction
    let mut sync = CompactInst::new(CompactOp::Sync);
    sync.flags = 0x1;
    insts.push(sync);

    let mut instructions = Vec::with_capacity(insts.len() * 8);
    for inst in &insts {
        instructions.extend_from_slice(&inst.to_word().to_le_bytes());
    }

    let output_size: usize = shape.iter().product();
    Ok(CompiledModel {
        name: def.name.clone(),
        version: FORMAT_COMPACT,
        instruction_count: insts.len(),
        instructions,
        weights,
        bias,
        layer_count,
        input_size,
        output_size,
        estimated_cycles: 0,
        weight_peak: 0,
        activation_peak: 0,
    })
}
