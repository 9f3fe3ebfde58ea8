//! End-to-end pipeline tests: build a graph, optimize, quantize, compile,
//! and check the artifact and intermediate invariants against reference
//! float computations.

use edgenpu::backend::codegen::HEADER_SIZE;
use edgenpu::backend::memory::MemoryAllocator;
use edgenpu::ir::{Activation, AttrKey, DataType, IRGraph, OpKind, TensorData};
use edgenpu::opt::dce::DeadCodeElimination;
use edgenpu::opt::Pass;
use edgenpu::quant::{dequantize_symmetric, quantize_symmetric};
use edgenpu::{compile, optimize, CompileOptions, IRBuilder, NpuConfig, OptLevel};

/// Deterministic pseudo-random floats in [-1, 1).
fn pseudo_random(n: usize, mut seed: u64) -> Vec<f32> {
    (0..n)
        .map(|_| {
            seed = seed.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
            ((seed >> 32) as u32 as f32 / (1u32 << 31) as f32) - 1.0
        })
        .collect()
}

/// Naive NCHW convolution, batch 1.
#[allow(clippy::too_many_arguments)]
fn ref_conv2d(
    input: &[f32],
    (in_c, in_h, in_w): (usize, usize, usize),
    weight: &[f32],
    (out_c, kh, kw): (usize, usize, usize),
    bias: Option<&[f32]>,
    stride: usize,
    pad: usize,
) -> Vec<f32> {
    let out_h = (in_h + 2 * pad - kh) / stride + 1;
    let out_w = (in_w + 2 * pad - kw) / stride + 1;
    let mut out = vec![0.0f32; out_c * out_h * out_w];
    for oc in 0..out_c {
        for oy in 0..out_h {
            for ox in 0..out_w {
                let mut acc = bias.map(|b| b[oc]).unwrap_or(0.0);
                for ic in 0..in_c {
                    for ky in 0..kh {
                        for kx in 0..kw {
                            let iy = (oy * stride + ky) as isize - pad as isize;
                            let ix = (ox * stride + kx) as isize - pad as isize;
                            if iy < 0 || ix < 0 || iy >= in_h as isize || ix >= in_w as isize {
                                continue;
                            }
                            let i = ic * in_h * in_w + iy as usize * in_w + ix as usize;
                            let w = ((oc * in_c + ic) * kh + ky) * kw + kx;
                            acc += input[i] * weight[w];
                        }
                    }
                }
                out[(oc * out_h + oy) * out_w + ox] = acc;
            }
        }
    }
    out
}

fn ref_batchnorm(
    x: &[f32],
    (c, h, w): (usize, usize, usize),
    gamma: &[f32],
    beta: &[f32],
    mean: &[f32],
    var: &[f32],
    eps: f32,
) -> Vec<f32> {
    let mut out = vec![0.0f32; x.len()];
    for ch in 0..c {
        let scale = gamma[ch] / (var[ch] + eps).sqrt();
        for i in 0..h * w {
            let idx = ch * h * w + i;
            out[idx] = (x[idx] - mean[ch]) * scale + beta[ch];
        }
    }
    out
}

/// conv 3x3 s1 p1 (3 -> 16 channels), relu, maxpool 2x2.
fn small_cnn() -> IRGraph {
    let mut b = IRBuilder::new("small_cnn");
    b.add_input("x", vec![1, 3, 8, 8], DataType::F32);
    b.add_constant(
        "conv.weight",
        vec![16, 3, 3, 3],
        TensorData::F32(pseudo_random(16 * 3 * 3 * 3, 7)),
    );
    b.add_constant("conv.bias", vec![16], TensorData::F32(pseudo_random(16, 11)));
    let conv = b.conv2d("x", "conv.weight", Some("conv.bias"), (3, 3), (1, 1), (1, 1), 1, None);
    let act = b.relu(&conv);
    let pool = b.max_pool2d(&act, (2, 2), (2, 2));
    b.add_output(&pool);
    b.build().unwrap()
}

#[test]
fn test_o2_fuses_relu_into_conv() {
    let mut g = small_cnn();
    optimize(&mut g, OptLevel::O2, &NpuConfig::edge16());

    let convs: Vec<_> = g.nodes.iter().filter(|n| n.op == OpKind::Conv2d).collect();
    assert_eq!(convs.len(), 1);
    assert_eq!(convs[0].activation(), Some(Activation::Relu));
    assert_eq!(g.nodes.iter().filter(|n| n.op == OpKind::Relu).count(), 0);
    // the pool survives
    assert_eq!(g.nodes.iter().filter(|n| n.op == OpKind::MaxPool2d).count(), 1);
}

#[test]
fn test_binary_section_lengths_match_header() {
    let out = compile(small_cnn(), &CompileOptions::default()).unwrap();
    let model = &out.model;
    let binary = model.to_binary();
    assert_eq!(
        binary.len(),
        HEADER_SIZE + model.instruction_count * 8 + model.weights.len() + model.bias.len()
    );
}

#[test]
fn test_quantized_weight_image_is_one_byte_per_element() {
    let options = CompileOptions {
        quantize: true,
        ..Default::default()
    };
    let out = compile(small_cnn(), &options).unwrap();
    // 16x3x3x3 INT8 weights padded to 16, then 16 I32 bias values
    let weight_bytes: usize = 16 * 3 * 3 * 3;
    let aligned = weight_bytes.div_ceil(16) * 16;
    assert_eq!(out.model.weights.len(), aligned + 16 * 4);
}

#[test]
fn test_no_live_overlap_shares_memory() {
    let mut g = small_cnn();
    optimize(&mut g, OptLevel::O2, &NpuConfig::edge16());

    let mut alloc = MemoryAllocator::new(&NpuConfig::edge16());
    alloc.allocate(&g).unwrap();
    let offsets = alloc.activation_offsets();
    let live = alloc.liveness();

    let names: Vec<&String> = offsets.keys().collect();
    for (i, a) in names.iter().enumerate() {
        for b in &names[i + 1..] {
            if !live.overlaps(a, b) {
                continue;
            }
            let (a_off, a_len) = (offsets[*a], g.tensor(a).unwrap().nbytes());
            let (b_off, b_len) = (offsets[*b], g.tensor(b).unwrap().nbytes());
            let disjoint = a_off + a_len <= b_off || b_off + b_len <= a_off;
            assert!(
                disjoint,
                "tensors '{}' and '{}' are live together but overlap in memory",
                a, b
            );
        }
    }
}

#[test]
fn test_dce_is_idempotent() {
    let mut g = small_cnn();
    // dangling branch with no path to an output
    let orphan = {
        let mut b = IRBuilder::new("tmp");
        b.add_input("y", vec![1, 4], DataType::F32);
        let o = b.relu("y");
        b.add_output(&o);
        b.build().unwrap()
    };
    for (name, t) in orphan.tensors {
        g.tensors.insert(name, t);
    }
    g.nodes.extend(orphan.nodes);

    DeadCodeElimination.run(&mut g).unwrap();
    let after_first: Vec<String> = g.nodes.iter().map(|n| n.name.clone()).collect();
    DeadCodeElimination.run(&mut g).unwrap();
    let after_second: Vec<String> = g.nodes.iter().map(|n| n.name.clone()).collect();
    assert_eq!(after_first, after_second);
    assert_eq!(g.nodes.len(), 3);
}

#[test]
fn test_symmetric_round_trip_error_bound() {
    let values = pseudo_random(512, 3);
    let (q, scale) = quantize_symmetric(&values);
    for (&v, &qv) in values.iter().zip(&q) {
        let back = dequantize_symmetric(qv, scale);
        assert!(
            (v - back).abs() <= scale / 2.0 + 1e-6,
            "value {} -> {} exceeds half-step error bound",
            v,
            back
        );
    }
}

#[test]
fn test_conv_batchnorm_fusion_preserves_outputs() {
    let (in_c, h, w) = (3usize, 6usize, 6usize);
    let out_c = 4usize;
    let input = pseudo_random(in_c * h * w, 21);
    let weight = pseudo_random(out_c * in_c * 9, 22);
    let bias = pseudo_random(out_c, 23);
    let gamma = pseudo_random(out_c, 24).iter().map(|v| v + 1.5).collect::<Vec<_>>();
    let beta = pseudo_random(out_c, 25);
    let mean = pseudo_random(out_c, 26);
    let var = pseudo_random(out_c, 27).iter().map(|v| v.abs() + 0.5).collect::<Vec<_>>();
    let eps = 1e-5f32;

    // reference: batchnorm applied to the unfused convolution
    let conv_out = ref_conv2d(
        &input,
        (in_c, h, w),
        &weight,
        (out_c, 3, 3),
        Some(&bias),
        1,
        1,
    );
    let expected = ref_batchnorm(&conv_out, (out_c, h, w), &gamma, &beta, &mean, &var, eps);

    let mut b = IRBuilder::new("m");
    b.add_input("x", vec![1, in_c, h, w], DataType::F32);
    b.add_constant("w", vec![out_c, in_c, 3, 3], TensorData::F32(weight));
    b.add_constant("bias", vec![out_c], TensorData::F32(bias));
    b.add_constant("gamma", vec![out_c], TensorData::F32(gamma));
    b.add_constant("beta", vec![out_c], TensorData::F32(beta));
    b.add_constant("mean", vec![out_c], TensorData::F32(mean));
    b.add_constant("var", vec![out_c], TensorData::F32(var));
    let conv = b.conv2d("x", "w", Some("bias"), (3, 3), (1, 1), (1, 1), 1, None);
    let bn = b.batch_norm(&conv, "gamma", "beta", "mean", "var", eps);
    b.add_output(&bn);
    let mut g = b.build().unwrap();

    optimize(&mut g, OptLevel::O2, &NpuConfig::edge16());
    assert_eq!(g.nodes.iter().filter(|n| n.op == OpKind::BatchNorm).count(), 0);

    // run the reference convolution with the fused parameters
    let fused_w = g.tensor("w").unwrap().data.as_ref().unwrap().as_f32();
    let fused_b = g.tensor("bias").unwrap().data.as_ref().unwrap().as_f32();
    let actual = ref_conv2d(
        &input,
        (in_c, h, w),
        &fused_w,
        (out_c, 3, 3),
        Some(&fused_b),
        1,
        1,
    );

    for (e, a) in expected.iter().zip(&actual) {
        assert!((e - a).abs() < 1e-4, "fused output {} != reference {}", a, e);
    }
}

#[test]
fn test_schedule_order_respects_dependencies() {
    let out = compile(small_cnn(), &CompileOptions::default()).unwrap();
    // recompile to inspect the annotated graph
    let mut g = small_cnn();
    optimize(&mut g, OptLevel::O2, &NpuConfig::edge16());
    let model =
        edgenpu::CodeGenerator::new(NpuConfig::edge16()).generate(&mut g).unwrap();
    assert_eq!(model.instruction_count, out.model.instruction_count);

    for (ci, consumer) in g.nodes.iter().enumerate() {
        let c_pos = consumer.schedule_order.unwrap();
        for inp in &consumer.inputs {
            for pi in g.producers(inp) {
                if pi == ci {
                    continue;
                }
                let p_pos = g.nodes[pi].schedule_order.unwrap();
                assert!(p_pos < c_pos, "producer scheduled after consumer");
            }
        }
    }
}

#[test]
fn test_compilation_is_reproducible() {
    let a = compile(small_cnn(), &CompileOptions::default()).unwrap();
    let b = compile(small_cnn(), &CompileOptions::default()).unwrap();
    assert_eq!(a.model.to_binary(), b.model.to_binary());
    assert_eq!(a.model.digest(), b.model.digest());
}

#[test]
fn test_artifact_survives_save_and_header_parse() {
    use edgenpu::backend::codegen::ModelHeader;

    let out = compile(small_cnn(), &CompileOptions::default()).unwrap();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("small_cnn.npubin");
    out.model.save(&path).unwrap();

    let bytes = std::fs::read(&path).unwrap();
    let header = ModelHeader::parse(&bytes).unwrap();
    assert_eq!(header.instruction_count as usize, out.model.instruction_count);
    assert_eq!(header.weight_size as usize, out.model.weights.len());
    assert_eq!(header.total_payload as usize, bytes.len() - HEADER_SIZE);
}

#[test]
fn test_unsupported_op_fails_compilation() {
    let mut b = IRBuilder::new("m");
    b.add_input("x", vec![1, 8], DataType::F32);
    b.add_input("y", vec![1, 8], DataType::F32);
    let out = b.div("x", "y");
    b.add_output(&out);
    let g = b.build().unwrap();

    let err = compile(g, &CompileOptions::default()).unwrap_err();
    assert!(matches!(err, edgenpu::CompileError::UnsupportedOp { .. }));
}

#[test]
fn test_graph_summary_snapshot() {
    let mut b = IRBuilder::new("mlp");
    b.add_input("x", vec![1, 4], DataType::F32);
    let out = b.relu("x");
    b.add_output(&out);
    let g = b.build().unwrap();

    insta::assert_snapshot!(g.summary(), @r#"
    graph mlp
      nodes: 1
      tensors: 2
      inputs: ["x"]
      outputs: ["relu_out_0"]

      relu_0: relu
        in:  ["x"]
        out: ["relu_out_0"]
    "#);
}

#[test]
fn test_tiling_annotations_at_o3() {
    let mut g = small_cnn();
    let options = CompileOptions {
        opt_level: OptLevel::O3,
        ..Default::default()
    };
    optimize(&mut g, options.opt_level, &options.target);
    let conv = g.nodes.iter().find(|n| n.op == OpKind::Conv2d).unwrap();
    let tile = conv.tile.expect("conv tiled at O3");
    assert_eq!(tile.tile_oc, 16);
    assert_eq!(tile.tile_ic, 3);
    assert!(conv.attr(AttrKey::WeightLayout).is_some());
}
