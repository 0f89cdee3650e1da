//! Benchmark iPRF evaluation and hint generation throughput.
//!
//! Run: cargo build --release -p plinko --bin bench_iprf
//!      ./target/release/bench_iprf [--entries N] [--lambda L] [--mode exact|normal_approx]

use clap::Parser;
use std::time::Instant;

use plinko::engine::ClientEngine;
use plinko::iprf::Iprf;
use plinko::params::{derive_block_key, BinomialMode, Entry, PirParams, ENTRY_SIZE};

#[derive(Parser, Debug)]
#[command(author, version, about = "Benchmark iPRF and hint generation")]
struct Args {
    /// Number of database entries to simulate
    #[arg(long, default_value_t = 100_000)]
    entries: u64,

    /// Security parameter (lambda)
    #[arg(long, default_value_t = 64)]
    lambda: u64,

    /// Binomial sampler mode
    #[arg(long, default_value = "normal_approx")]
    mode: BinomialMode,

    /// Forward/inverse evaluations to time
    #[arg(long, default_value_t = 100_000)]
    evals: u64,
}

fn main() {
    let args = Args::parse();
    let params = PirParams::derive(args.entries, args.lambda, u64::MAX, args.mode);

    println!("=== iPRF / hint generation benchmark ===");
    println!("entries: {}", params.n_raw);
    println!("chunk_size (m): {}", params.chunk_size);
    println!("set_size (k): {}", params.set_size);
    println!("hint domain (H): {}", params.hint_domain());
    println!("mode: {}", params.binomial_mode);
    println!();

    let key = derive_block_key(&[0x42u8; 32], 0);
    let iprf = Iprf::new(key, params.hint_domain(), params.chunk_size, args.mode);

    let start = Instant::now();
    let mut acc = 0u64;
    for x in 0..args.evals {
        acc = acc.wrapping_add(iprf.forward(x % params.hint_domain()));
    }
    let fwd = start.elapsed();
    println!(
        "forward:  {:>10.3} ns/op  (acc={})",
        fwd.as_nanos() as f64 / args.evals as f64,
        acc % 1000
    );

    let start = Instant::now();
    let mut total_preimages = 0usize;
    for y in 0..args.evals.min(params.chunk_size) {
        total_preimages += iprf.inverse(y).len();
    }
    let inv = start.elapsed();
    let inv_ops = args.evals.min(params.chunk_size);
    println!(
        "inverse:  {:>10.3} us/op  ({} preimages total)",
        inv.as_micros() as f64 / inv_ops as f64,
        total_preimages
    );

    let db: Vec<Entry> = (0..args.entries)
        .map(|i| {
            let mut entry = [0u8; ENTRY_SIZE];
            entry[0..8].copy_from_slice(&i.to_le_bytes());
            entry
        })
        .collect();

    let mut engine = ClientEngine::new([0x42u8; 32], params);
    let start = Instant::now();
    engine.hint_init(&db);
    let elapsed = start.elapsed().as_secs_f64();
    println!(
        "hint init: {:.2} s ({:.2} us/entry, {} hints)",
        elapsed,
        elapsed * 1_000_000.0 / args.entries as f64,
        engine.hints().len()
    );
}
