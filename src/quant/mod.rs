//! Post-training quantizer.
//!
//! Converts floating-point weights and activation metadata to fixed-point
//! (INT8/UINT8) with per-tensor or per-channel scale and zero point:
//! `real = scale * (quantized - zero_point)`. Calibration collects running
//! min/max (and a bounded value sample for percentile clipping); `quantize`
//! then rewrites constant payloads in place and tags every tensor with its
//! affine parameters so the backend stays consistent.

use std::collections::BTreeMap;

use statrs::statistics::{Data, OrderStatistics};

use crate::ir::{Attr, AttrKey, DataType, IRGraph, OpKind, TensorData};

/// Number of elements sampled per tensor for percentile calibration.
const SAMPLE_CAP: usize = 1000;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CalibrationMethod {
    MinMax,
    Percentile,
}

#[derive(Clone, Debug)]
pub struct QuantConfig {
    pub weight_dtype: DataType,
    pub activation_dtype: DataType,
    pub per_channel_weights: bool,
    pub symmetric_weights: bool,
    pub symmetric_activations: bool,
    pub calibration: CalibrationMethod,
    /// Percentile (e.g. 99.99) used when `calibration` is `Percentile`.
    pub percentile: f64,
    /// Operator kinds whose weights are quantized.
    pub quantize_ops: Vec<OpKind>,
}

impl Default for QuantConfig {
    fn default() -> Self {
        Self {
            weight_dtype: DataType::I8,
            activation_dtype: DataType::U8,
            per_channel_weights: true,
            symmetric_weights: true,
            symmetric_activations: false,
            calibration: CalibrationMethod::MinMax,
            percentile: 99.99,
            quantize_ops: vec![
                OpKind::Conv2d,
                OpKind::DepthwiseConv2d,
                OpKind::FullyConnected,
            ],
        }
    }
}

/// Calibration samples for the graph inputs.
#[derive(Clone, Debug, Default)]
pub struct CalibrationData {
    samples: Vec<Vec<f32>>,
}

impl CalibrationData {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_sample(&mut self, sample: Vec<f32>) {
        self.samples.push(sample);
    }

    pub fn num_samples(&self) -> usize {
        self.samples.len()
    }
}

#[derive(Clone, Debug)]
struct TensorStats {
    min: f32,
    max: f32,
    samples: Vec<f32>,
}

impl TensorStats {
    fn empty() -> Self {
        Self {
            min: f32::INFINITY,
            max: f32::NEG_INFINITY,
            samples: Vec::new(),
        }
    }

    fn observe(&mut self, values: &[f32]) {
        for &v in values {
            self.min = self.min.min(v);
            self.max = self.max.max(v);
        }
        let room = SAMPLE_CAP.saturating_sub(self.samples.len());
        self.samples.extend(values.iter().take(room));
    }
}

/// Symmetric 8-bit quantization: `scale = max(|min|,|max|) / 127`, zero
/// point 0. A constant-zero range degenerates to scale 1.0.
pub fn quantize_symmetric(data: &[f32]) -> (Vec<i8>, f32) {
    let abs_max = data.iter().fold(0.0f32, |m, &v| m.max(v.abs()));
    let scale = if abs_max > 0.0 { abs_max / 127.0 } else { 1.0 };
    let q = data
        .iter()
        .map(|&v| (v / scale).round().clamp(-128.0, 127.0) as i8)
        .collect();
    (q, scale)
}

/// Asymmetric 8-bit quantization: `scale = (max-min) / 255`,
/// `zero_point = round(-min/scale)` clamped to `[0, 255]`.
pub fn quantize_asymmetric(data: &[f32]) -> (Vec<u8>, f32, i32) {
    let (mut min, mut max) = (f32::INFINITY, f32::NEG_INFINITY);
    for &v in data {
        min = min.min(v);
        max = max.max(v);
    }
    let (scale, zero_point) = asymmetric_params(min, max);
    let q = data
        .iter()
        .map(|&v| (v / scale + zero_point as f32).round().clamp(0.0, 255.0) as u8)
        .collect();
    (q, scale, zero_point)
}

fn symmetric_params(min: f32, max: f32) -> (f32, i32) {
    let abs_max = min.abs().max(max.abs());
    let scale = if abs_max > 0.0 { abs_max / 127.0 } else { 1.0 };
    (scale, 0)
}

fn asymmetric_params(min: f32, max: f32) -> (f32, i32) {
    if max <= min {
        return (1.0, 0);
    }
    let scale = (max - min) / 255.0;
    let zero_point = (-min / scale).round().clamp(0.0, 255.0) as i32;
    (scale, zero_point)
}

/// Dequantize one symmetric INT8 value.
pub fn dequantize_symmetric(q: i8, scale: f32) -> f32 {
    q as f32 * scale
}

pub struct Quantizer {
    config: QuantConfig,
    stats: BTreeMap<String, TensorStats>,
    scale_map: BTreeMap<String, f32>,
    zero_point_map: BTreeMap<String, i32>,
}

impl Quantizer {
    pub fn new(config: QuantConfig) -> Self {
        Self {
            config,
            stats: BTreeMap::new(),
            scale_map: BTreeMap::new(),
            zero_point_map: BTreeMap::new(),
        }
    }

    /// Collect per-tensor min/max statistics: constant payloads contribute
    /// directly, calibration samples feed the graph inputs.
    pub fn calibrate(&mut self, graph: &IRGraph, data: &CalibrationData) {
        for (name, tensor) in &graph.tensors {
            let stats = self.stats.entry(name.clone()).or_insert_with(TensorStats::empty);
            if let Some(payload) = &tensor.data {
                stats.observe(&payload.as_f32());
            }
        }
        for input in &graph.inputs {
            let stats = self
                .stats
                .entry(input.clone())
                .or_insert_with(TensorStats::empty);
            for sample in &data.samples {
                stats.observe(sample);
            }
        }
        self.compute_params();
    }

    fn compute_params(&mut self) {
        for (name, stats) in &self.stats {
            if stats.min == f32::INFINITY {
                // nothing observed
                self.scale_map.insert(name.clone(), 1.0);
                self.zero_point_map.insert(name.clone(), 0);
                continue;
            }

            let (mut min, mut max) = (stats.min, stats.max);
            if self.config.calibration == CalibrationMethod::Percentile && !stats.samples.is_empty()
            {
                let mut data =
                    Data::new(stats.samples.iter().map(|&v| v as f64).collect::<Vec<f64>>());
                let tau = self.config.percentile / 100.0;
                min = data.quantile(1.0 - tau) as f32;
                max = data.quantile(tau) as f32;
            }

            let (scale, zero_point) = if self.config.symmetric_activations {
                symmetric_params(min, max)
            } else {
                asymmetric_params(min, max)
            };
            self.scale_map.insert(name.clone(), scale);
            self.zero_point_map.insert(name.clone(), zero_point);
        }
    }

    /// Rewrite weight payloads of allow-listed nodes to INT8, requantize
    /// biases to I32, and tag every tensor with scale/zero-point/dtype.
    pub fn quantize(&mut self, graph: &mut IRGraph) {
        for i in 0..graph.nodes.len() {
            if !self.config.quantize_ops.contains(&graph.nodes[i].op) {
                continue;
            }
            self.quantize_node_weights(graph, i);
        }

        for (name, tensor) in graph.tensors.iter_mut() {
            if tensor.data.is_some() {
                if !tensor.is_quantized {
                    // payload outside the allow-list keeps its data, tagged only
                    tensor.dtype = self.config.weight_dtype;
                }
            } else {
                tensor.dtype = self.config.activation_dtype;
            }
            tensor.scale = self.scale_map.get(name).copied().unwrap_or(1.0);
            tensor.zero_point = self.zero_point_map.get(name).copied().unwrap_or(0);
            tensor.is_quantized = true;
        }
    }

    fn quantize_node_weights(&mut self, graph: &mut IRGraph, node_idx: usize) {
        let node = graph.nodes[node_idx].clone();
        let Some(weight_name) = node.inputs.get(1) else {
            return;
        };
        let Some(weight_tensor) = graph.tensor(weight_name) else {
            return;
        };
        let Some(weight) = weight_tensor.data.as_ref().map(|d| d.as_f32()) else {
            return;
        };
        let out_ch = weight_tensor.shape.first().copied().unwrap_or(1);

        let (quantized, scales, zero_points) = if self.config.per_channel_weights && out_ch > 0 {
            per_channel_symmetric(&weight, out_ch)
        } else {
            let (q, scale) = quantize_symmetric(&weight);
            (q, vec![scale], vec![0])
        };

        {
            let t = graph.tensor_mut(weight_name).expect("weight exists");
            t.data = Some(TensorData::I8(quantized));
            t.dtype = self.config.weight_dtype;
            t.scale = scales[0];
            t.zero_point = zero_points[0];
            t.is_quantized = true;
        }
        self.scale_map.insert(weight_name.clone(), scales[0]);
        self.zero_point_map.insert(weight_name.clone(), zero_points[0]);

        // Bias requantized to I32 with the (averaged, if per-channel) scale.
        let bias_scale = scales.iter().sum::<f32>() / scales.len() as f32;
        if let Some(bias_name) = node.inputs.get(2) {
            if let Some(bias_tensor) = graph.tensor_mut(bias_name) {
                if let Some(bias) = bias_tensor.data.as_ref().map(|d| d.as_f32()) {
                    let q: Vec<i32> = bias.iter().map(|&b| (b / bias_scale).round() as i32).collect();
                    bias_tensor.data = Some(TensorData::I32(q));
                    bias_tensor.dtype = DataType::I32;
                    bias_tensor.scale = bias_scale;
                    bias_tensor.zero_point = 0;
                    bias_tensor.is_quantized = true;
                    self.scale_map.insert(bias_name.clone(), bias_scale);
                    self.zero_point_map.insert(bias_name.clone(), 0);
                }
            }
        }

        let node = &mut graph.nodes[node_idx];
        node.set_attr(AttrKey::WeightScales, Attr::FloatVec(scales));
        node.set_attr(AttrKey::WeightZeroPoints, Attr::IntVec(zero_points));
    }

    pub fn scale_of(&self, tensor: &str) -> Option<f32> {
        self.scale_map.get(tensor).copied()
    }

    pub fn zero_point_of(&self, tensor: &str) -> Option<i32> {
        self.zero_point_map.get(tensor).copied()
    }
}

/// Independent symmetric scale per output channel (axis 0). Channel chunks
/// of a `[oc, ...]` row-major payload are contiguous, so quantization runs
/// chunk-wise in place order.
fn per_channel_symmetric(weight: &[f32], out_ch: usize) -> (Vec<i8>, Vec<f32>, Vec<i32>) {
    let per = weight.len() / out_ch;
    let mut quantized = Vec::with_capacity(weight.len());
    let mut scales = Vec::with_capacity(out_ch);
    let mut zero_points = Vec::with_capacity(out_ch);
    for oc in 0..out_ch {
        let chunk = &weight[oc * per..(oc + 1) * per];
        let (q, scale) = quantize_symmetric(chunk);
        quantized.extend(q);
        scales.push(scale);
        zero_points.push(0);
    }
    (quantized, scales, zero_points)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::builder::IRBuilder;

    #[test]
    fn test_symmetric_round_trip_bound() {
        let values = [-1.5f32, -0.3, 0.0, 0.7, 1.5];
        let (q, scale) = quantize_symmetric(&values);
        for (&v, &qv) in values.iter().zip(&q) {
            let back = dequantize_symmetric(qv, scale);
            assert!(
                (back - v).abs() <= scale / 2.0 + 1e-6,
                "value {} round-tripped to {} with scale {}",
                v,
                back,
                scale
            );
        }
    }

    #[test]
    fn test_zero_range_defaults_scale_one() {
        let (q, scale) = quantize_symmetric(&[0.0, 0.0]);
        assert_eq!(scale, 1.0);
        assert_eq!(q, vec![0, 0]);
        let (_, scale, zp) = quantize_asymmetric(&[2.5, 2.5]);
        assert_eq!(scale, 1.0);
        assert_eq!(zp, 0);
    }

    #[test]
    fn test_asymmetric_zero_point_in_range() {
        let (_, scale, zp) = quantize_asymmetric(&[-0.5, 2.0]);
        assert!((scale - 2.5 / 255.0).abs() < 1e-7);
        assert!((0..=255).contains(&zp));
    }

    #[test]
    fn test_per_channel_scales_are_independent() {
        // channel 0 in [-1,1], channel 1 in [-10,10]
        let weight = [1.0f32, -1.0, 10.0, -10.0];
        let (q, scales, zps) = per_channel_symmetric(&weight, 2);
        assert_eq!(scales.len(), 2);
        assert!((scales[0] - 1.0 / 127.0).abs() < 1e-7);
        assert!((scales[1] - 10.0 / 127.0).abs() < 1e-6);
        assert_eq!(q, vec![127, -127, 127, -127]);
        assert_eq!(zps, vec![0, 0]);
    }

    #[test]
    fn test_quantize_graph_rewrites_weights_and_bias() {
        let mut b = IRBuilder::new("m");
        b.add_input("x", vec![1, 4], DataType::F32);
        b.add_constant("w", vec![2, 4], TensorData::F32(vec![0.5; 8]));
        b.add_constant("bias", vec![2], TensorData::F32(vec![1.0, -1.0]));
        let out = b.fully_connected("x", "w", Some("bias"), None);
        b.add_output(&out);
        let mut g = b.build().unwrap();

        let mut quantizer = Quantizer::new(QuantConfig::default());
        quantizer.calibrate(&g, &CalibrationData::new());
        quantizer.quantize(&mut g);

        let w = g.tensor("w").unwrap();
        assert_eq!(w.dtype, DataType::I8);
        assert!(matches!(w.data, Some(TensorData::I8(_))));
        let bias = g.tensor("bias").unwrap();
        assert_eq!(bias.dtype, DataType::I32);
        // every tensor is tagged
        assert!(g.tensors.values().all(|t| t.is_quantized));
        // per-channel vectors live on the node
        assert!(matches!(
            g.nodes[0].attr(AttrKey::WeightScales),
            Some(Attr::FloatVec(v)) if v.len() == 2
        ));
    }

    #[test]
    fn test_allow_list_limits_weight_quantization() {
        let mut b = IRBuilder::new("m");
        b.add_constant("c1", vec![2], TensorData::F32(vec![1.0, 2.0]));
        b.add_input("x", vec![2], DataType::F32);
        let out = b.add("x", "c1");
        b.add_output(&out);
        let mut g = b.build().unwrap();

        let mut quantizer = Quantizer::new(QuantConfig::default());
        quantizer.calibrate(&g, &CalibrationData::new());
        quantizer.quantize(&mut g);

        // ADD is not in the allow-list: payload untouched but tagged
        let c1 = g.tensor("c1").unwrap();
        assert!(matches!(c1.data, Some(TensorData::F32(_))));
        assert!(c1.is_quantized);
    }
}
