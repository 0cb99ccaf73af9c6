use binquery::bitvector::Bitvector;
use binquery::column::{ArrayRef, Column};
use binquery::histogram::adaptive_bins;
use binquery::options::{BinningOptions, IndexOptions};
use binquery::query::{CountQuery, Table};
use criterion::{black_box, criterion_group, criterion_main, Criterion};
use rand::distributions::{Distribution, Uniform};
use rand_distr::{Geometric, Normal};

/// sparse and dense random bitvectors of 1M bits
fn random_bitvector(n: u32, density: f64) -> Bitvector {
    let mut rng = rand::thread_rng();
    let gap = Geometric::new(density).unwrap();
    let mut pos = 0_u64;
    let mut positions = Vec::new();
    loop {
        pos += gap.sample(&mut rng);
        if pos >= n as u64 {
            break;
        }
        positions.push(pos as u32);
        pos += 1;
    }
    Bitvector::from_positions(positions, n).unwrap()
}

/// AND/OR/XOR and counting on compressed bitvectors
fn bitvector_ops(c: &mut Criterion) {
    let n = 1_000_000;
    for density in [0.001, 0.1] {
        let a = random_bitvector(n, density);
        let b = random_bitvector(n, density);
        c.bench_function(&format!("AND density {density}"), |bench| bench.iter(|| black_box(&a) & black_box(&b)));
        c.bench_function(&format!("OR density {density}"), |bench| bench.iter(|| black_box(&a) | black_box(&b)));
        c.bench_function(&format!("XOR density {density}"), |bench| bench.iter(|| black_box(&a) ^ black_box(&b)));
        c.bench_function(&format!("count density {density}"), |bench| bench.iter(|| black_box(&a).count()));
    }
}

fn table(n: usize) -> Table {
    let mut rng = rand::thread_rng();
    let normal = Normal::new(0.0, 1.0).unwrap();
    let uniform = Uniform::new(0_i32, 1000);
    let x: Vec<f64> = (0..n).map(|_| normal.sample(&mut rng)).collect();
    let y: Vec<i32> = (0..n).map(|_| uniform.sample(&mut rng)).collect();

    let mut t = Table::new();
    t.add_column(Column::new("x", ArrayRef::from(x)).unwrap()).unwrap();
    t.add_column(Column::new("y", ArrayRef::from(y)).unwrap()).unwrap();
    t
}

/// range queries answered by scan, relic index and bin index
fn query_evaluate(c: &mut Criterion) {
    let n = 1_000_000;
    let clause = "x > 0.5 AND y < 100";

    let t = table(n);
    c.bench_function(&format!("scan {clause}"), |bench| {
        bench.iter(|| {
            let mut q = CountQuery::new(&t);
            q.set_where_clause(clause).unwrap();
            q.evaluate().unwrap()
        })
    });

    if let (Some(x), Some(y)) = (t.get("x"), t.get("y")) {
        x.build_index(IndexOptions::bin(256)).unwrap();
        y.build_index(IndexOptions::relic()).unwrap();
    }
    c.bench_function(&format!("indexed {clause}"), |bench| {
        bench.iter(|| {
            let mut q = CountQuery::new(&t);
            q.set_where_clause(clause).unwrap();
            q.evaluate().unwrap()
        })
    });
    c.bench_function(&format!("estimate {clause}"), |bench| {
        bench.iter(|| {
            let mut q = CountQuery::new(&t);
            q.set_where_clause(clause).unwrap();
            q.estimate().unwrap();
            q.max_hits()
        })
    });
}

/// 1D and 2D adaptive binning of 1M rows
fn adaptive_binning(c: &mut Criterion) {
    let n = 1_000_000;
    let t = table(n);
    let all = Bitvector::filled(true, n as u32);
    let options = BinningOptions::default();
    let (Some(x), Some(y)) = (t.get("x"), t.get("y")) else { return };

    c.bench_function("adaptive 1D, 100 bins", |bench| bench.iter(|| adaptive_bins(&[&**x], &[100], &all, &options).unwrap()));
    c.bench_function("adaptive 2D, 50x50 bins", |bench| {
        bench.iter(|| adaptive_bins(&[&**x, &**y], &[50, 50], &all, &options).unwrap())
    });
}

criterion_group!(benches, bitvector_ops, query_evaluate, adaptive_binning);
criterion_main!(benches);
