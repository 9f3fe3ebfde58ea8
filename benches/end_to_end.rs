use criterion::{black_box, criterion_group, criterion_main, Criterion};

use edgenpu::ir::{DataType, TensorData};
use edgenpu::{compile, CompileOptions, IRBuilder, IRGraph, OptLevel};

fn cnn(channels: usize) -> IRGraph {
    let mut b = IRBuilder::new("bench_cnn");
    b.add_input("x", vec![1, 3, 32, 32], DataType::F32);
    b.add_constant(
        "c1.weight",
        vec![channels, 3, 3, 3],
        TensorData::F32(vec![0.02; channels * 27]),
    );
    b.add_constant("c1.bias", vec![channels], TensorData::F32(vec![0.1; channels]));
    let c1 = b.conv2d("x", "c1.weight", Some("c1.bias"), (3, 3), (1, 1), (1, 1), 1, None);
    let r1 = b.relu(&c1);
    let p1 = b.max_pool2d(&r1, (2, 2), (2, 2));
    b.add_constant(
        "c2.weight",
        vec![channels * 2, channels, 3, 3],
        TensorData::F32(vec![0.01; channels * 2 * channels * 9]),
    );
    let c2 = b.conv2d(&p1, "c2.weight", None, (3, 3), (1, 1), (1, 1), 1, None);
    let r2 = b.relu(&c2);
    let gap = b.global_avg_pool(&r2);
    let flat = b.reshape(&gap, vec![1, channels * 2]);
    b.add_constant(
        "fc.weight",
        vec![10, channels * 2],
        TensorData::F32(vec![0.05; 10 * channels * 2]),
    );
    let fc = b.fully_connected(&flat, "fc.weight", None, None);
    let out = b.softmax(&fc, -1);
    b.add_output(&out);
    b.build().unwrap()
}

fn bench_compile(c: &mut Criterion) {
    let graph = cnn(16);

    let o2 = CompileOptions::default();
    c.bench_function("compile_o2", |b| {
        b.iter(|| compile(black_box(graph.clone()), &o2).unwrap())
    });

    let o3_quant = CompileOptions {
        opt_level: OptLevel::O3,
        quantize: true,
        ..Default::default()
    };
    c.bench_function("compile_o3_quantized", |b| {
        b.iter(|| compile(black_box(graph.clone()), &o3_quant).unwrap())
    });
}

criterion_group!(benches, bench_compile);
criterion_main!(benches);
