//! Timing demo: index build, query evaluation and binning over random columns.
use std::time::Instant;

use binquery::column::{ArrayRef, Column};
use binquery::histogram::{adaptive_bins, index_bins};
use binquery::options::{BinningOptions, IndexOptions};
use binquery::query::{CountQuery, Table};
use binquery::Bitvector;
use rand::distributions::{Distribution, Uniform};
use rand_distr::{Geometric, Normal};

/// runs each step once and prints its wall time
pub fn main() {
    let n = 10_000_000;
    let table = random_table(n);

    if let Some(column) = table.get("hits") {
        for options in [IndexOptions::relic(), IndexOptions::bin(256)] {
            let now = Instant::now();
            match column.build_index(options) {
                Ok(ix) => println!("build {:?} on hits\t\t {} bins in {:?}", options.kind, ix.num_bins(), now.elapsed()),
                Err(e) => println!("build {:?} on hits failed: {e}", options.kind),
            }
        }
    }
    if let Some(energy) = table.get("energy") {
        let now = Instant::now();
        if energy.build_index(IndexOptions::bin(512)).is_ok() {
            println!("build Bin on energy\t\t in {:?}", now.elapsed());
        }
    }

    let mut q = CountQuery::new(&table);
    for clause in ["hits < 10", "energy > 1.5 AND hits IN (3, 5, 7)", "NOT (energy BETWEEN -1 AND 1) XOR hits >= 50"] {
        if let Err(e) = q.set_where_clause(clause) {
            println!("{clause}: {e}");
            continue;
        }
        let now = Instant::now();
        let estimated = q.estimate().map(|_| (q.min_hits(), q.max_hits()));
        let t_estimate = now.elapsed();
        let now = Instant::now();
        let hits = q.evaluate();
        println!("{clause}\t\t estimate {estimated:?} in {t_estimate:?}, exact {hits:?} in {:?}", now.elapsed());
    }

    let all = Bitvector::filled(true, n as u32);
    if let (Some(energy), Some(hits)) = (table.get("energy"), table.get("hits")) {
        let now = Instant::now();
        let h = adaptive_bins(&[&**energy, &**hits], &[100, 20], &all, &BinningOptions::default());
        println!("adaptive 100x20\t\t {:?} cells in {:?}", h.map(|h| h.counts.len()), now.elapsed());

        let now = Instant::now();
        let h = index_bins(energy, 100, &all);
        println!("index bins 100\t\t {:?} cells in {:?}", h.map(|h| h.counts.len()), now.elapsed());
    }
}

fn random_table(n: usize) -> Table {
    let mut rng = rand::thread_rng();
    let hits_dist = Geometric::new(0.05).unwrap();
    let energy_dist = Normal::new(0.0, 2.0).unwrap();
    let phase_dist = Uniform::new(0_u32, 360);

    let hits: Vec<u32> = (0..n).map(|_| hits_dist.sample(&mut rng) as u32).collect();
    let energy: Vec<f64> = (0..n).map(|_| energy_dist.sample(&mut rng)).collect();
    let phase: Vec<u32> = (0..n).map(|_| phase_dist.sample(&mut rng)).collect();

    let mut table = Table::new();
    for (name, data) in [("hits", ArrayRef::from(hits)), ("energy", ArrayRef::from(energy)), ("phase", ArrayRef::category(phase))] {
        table.add_column(Column::new(name, data).unwrap()).unwrap();
    }
    table
}
