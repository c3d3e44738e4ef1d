//! Throughput of the advisor stages over fixed inputs.
//!
//! `cargo bench --bench rule_engine -- --stage n1 200_000`

use std::hint::black_box;
use std::time::{Duration, Instant};

use clap::{Parser, ValueEnum};
use pg_advisor::{n1, Advisor, N1Config, QueryText, RuleEngine, StatRow};

const QUERY: &str = "SELECT * FROM orders o \
                     LEFT JOIN customers c ON c.id = o.customer_id \
                     JOIN items i \
                     WHERE lower(c.email) = 'a@b.c' OR o.note LIKE '%rush' \
                     AND o.id IN (SELECT order_id FROM refunds) \
                     ORDER BY o.created_at DESC OFFSET 100";

#[derive(Clone, Copy, Debug, ValueEnum)]
enum Stage {
    /// Normalization plus the full rule catalogue
    Rules,
    /// Column extraction for index suggestions
    Indexes,
    /// Scoring and ranking a synthetic statistics snapshot
    N1,
}

#[derive(Parser, Debug)]
struct BenchArgs {
    #[arg(long, value_enum, default_value = "rules")]
    stage: Stage,
    /// Rows in the synthetic snapshot used by the n1 stage
    #[arg(long, default_value_t = 1_000)]
    rows: usize,
    #[arg(value_parser = parse_count, default_value = "10_000")]
    iterations: u64,
    // `cargo bench` appends `--bench` even for `harness = false` targets.
    #[arg(long = "bench", hide = true)]
    _bench: bool,
}

fn parse_count(raw: &str) -> Result<u64, String> {
    match raw.replace('_', "").parse::<u64>() {
        Ok(count) if count > 0 => Ok(count),
        _ => Err(format!("expected a positive count, got `{raw}`")),
    }
}

fn synthetic_rows(count: usize) -> Vec<StatRow> {
    (0..count)
        .map(|i| {
            let query = match i % 3 {
                0 => format!("SELECT * FROM t{i} WHERE id = $1"),
                1 => format!("SELECT * FROM t{i} LIMIT 1"),
                _ => format!("SELECT a, b FROM t{i} WHERE created_at > now()"),
            };
            StatRow::new(query, 50 + (i as u64 * 37) % 5_000, (i as u64 * 13) % 20_000, 0.5 + (i % 40) as f64)
                .with_queryid(i as i64)
        })
        .collect()
}

fn run(stage: Stage, iterations: u64, rows: usize) -> Duration {
    let start;
    match stage {
        Stage::Rules => {
            let engine = RuleEngine::new();
            start = Instant::now();
            for _ in 0..iterations {
                black_box(engine.analyze(&QueryText::new(black_box(QUERY))));
            }
        }
        Stage::Indexes => {
            let advisor = Advisor::default();
            start = Instant::now();
            for _ in 0..iterations {
                black_box(advisor.recommend_indexes(black_box(QUERY)));
            }
        }
        Stage::N1 => {
            let snapshot = synthetic_rows(rows);
            let config = N1Config::default();
            start = Instant::now();
            for _ in 0..iterations {
                black_box(n1::detect_n_plus_one(black_box(&snapshot), &config));
            }
        }
    }
    start.elapsed()
}

fn main() {
    let args = BenchArgs::parse();
    let elapsed = run(args.stage, args.iterations, args.rows);
    let seconds = elapsed.as_secs_f64().max(f64::MIN_POSITIVE);
    let per_iteration_us = seconds * 1e6 / args.iterations as f64;

    println!("stage={:?}", args.stage);
    println!("iterations={}", args.iterations);
    if matches!(args.stage, Stage::N1) {
        println!("snapshot_rows={}", args.rows);
    }
    println!("elapsed_seconds={seconds:.6}");
    println!("per_iteration_us={per_iteration_us:.3}");
}
