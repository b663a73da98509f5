//! Rate-Matrix Benchmarks
//!
//! Compares the two rate-constant evaluators on a synthetic network with many
//! reactions and a large batch of parameter rows, and measures how long it
//! takes to parse and compile the rate laws in the first place.
//!
//! Run with: `cargo bench --bench rate_matrix`

use std::hint::black_box;

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use cupsoda_sim::{
    config::EvaluatorBackend,
    model::{Model, Parameter, Reaction, Species},
    rates::RateCompiler,
};

/// A chain of reversible binding steps `S_i + S_{i+1} <-> S_{i+2}` with
/// composite rate constants, `n` reactions in each direction.
fn chain_model(n: usize) -> Model {
    let species = (0..n + 2).map(|i| Species::new(format!("S{i}()"))).collect();
    let mut parameters = Vec::new();
    let mut reactions = Vec::new();
    for i in 0..n {
        parameters.push(Parameter::new(format!("kf{i}"), 1.0 + i as f64));
        parameters.push(Parameter::new(format!("kr{i}"), 0.5 / (1.0 + i as f64)));
        reactions.push(Reaction::new(
            vec![i, i + 1],
            vec![i + 2],
            format!("2*kf{i}*__s{i}*__s{}", i + 1),
        ));
        reactions.push(Reaction::new(
            vec![i + 2],
            vec![i, i + 1],
            format!("kr{i}/kf{i}*__s{}", i + 2),
        ));
    }
    Model {
        name: "chain".to_string(),
        species,
        reactions,
        parameters,
        observables: vec![],
        initial_conditions: vec![],
    }
}

fn parameter_rows(model: &Model, n_sims: usize) -> Vec<Vec<f64>> {
    (0..n_sims)
        .map(|s| {
            model
                .parameters
                .iter()
                .map(|p| p.value * (1.0 + s as f64 * 1e-3))
                .collect()
        })
        .collect()
}

fn benchmark_rate_matrix(c: &mut Criterion) {
    let mut group = c.benchmark_group("Rate Matrix");
    let model = chain_model(200);
    let rows = parameter_rows(&model, 4096);

    for (name, backend) in [
        ("JIT", EvaluatorBackend::Jit),
        ("Interpreted", EvaluatorBackend::Interpreted),
    ] {
        let compiler = RateCompiler::new(&model, backend).unwrap();
        group.bench_with_input(BenchmarkId::new(name, rows.len()), &rows, |b, rows| {
            b.iter(|| compiler.compute(black_box(rows), black_box(Some(1e-19))).unwrap())
        });
    }
    group.finish();
}

fn benchmark_compilation_time(c: &mut Criterion) {
    let mut group = c.benchmark_group("Compilation Time");
    for n in [10, 100, 1000] {
        let model = chain_model(n);
        group.bench_with_input(BenchmarkId::new("Compile", n * 2), &model, |b, model| {
            b.iter(|| RateCompiler::new(black_box(model), EvaluatorBackend::Jit).unwrap())
        });
    }
    group.finish();
}

criterion_group!(benches, benchmark_rate_matrix, benchmark_compilation_time);
criterion_main!(benches);
