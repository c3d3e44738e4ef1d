use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use anyhow::Context;
use clap::{ArgAction, Parser, Subcommand};
use pg_advisor::autovacuum::AUTOVACUUM_OK_MESSAGE;
use pg_advisor::rules::OK_RULE_ID;
use pg_advisor::stats::TIMING_COLUMNS_PROBE;
use pg_advisor::{
    tuning, Advisor, AdvisorConfig, N1Report, PlanSummary, Severity, StatsSnapshot, TimingColumns,
};
use serde::Serialize;
use tracing::debug;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "pgadvise")]
#[command(about = "Heuristic advice for PostgreSQL queries and workloads.")]
struct Cli {
    /// TOML file with rule and threshold overrides
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Print machine-readable JSON instead of text lines
    #[arg(long, global = true)]
    json: bool,
    /// Increase log verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = ArgAction::Count, global = true)]
    verbose: u8,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Flag anti-patterns in a SQL statement
    Analyze { query: String },
    /// Suggest indexes from WHERE, JOIN and ORDER BY columns
    Indexes { query: String },
    /// Rank N+1 candidates in an exported pg_stat_statements snapshot
    N1 { path: PathBuf },
    /// Autovacuum hints from the statement mix of a snapshot
    Autovacuum { path: PathBuf },
    /// Print the SQL to run against the server before exporting a snapshot
    StatsQuery {
        /// Column names returned by the probe query; prints the probe when omitted
        #[arg(long, value_delimiter = ',')]
        columns: Vec<String>,
        #[arg(long, default_value_t = 500)]
        limit: usize,
    },
    /// Summarise EXPLAIN (ANALYZE, BUFFERS, FORMAT JSON) output
    Explain { path: PathBuf },
    /// Recommend memory settings for the given hardware
    Tune {
        #[arg(long)]
        ram_gb: u64,
        #[arg(long)]
        max_connections: u64,
        /// Current value as reported by SHOW, e.g. --current work_mem=4MB
        #[arg(long, value_parser = parse_setting)]
        current: Vec<(String, String)>,
    },
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let config = match &cli.config {
        Some(path) => AdvisorConfig::load(path)
            .with_context(|| format!("failed to load config {}", path.display()))?,
        None => AdvisorConfig::default(),
    };
    let advisor = Advisor::new(config)?;

    match cli.command {
        Command::Analyze { query } => {
            let recommendations = advisor.analyze_query(&query);
            if cli.json {
                return print_json(&recommendations);
            }
            for rec in recommendations {
                let label = match (rec.rule_id, rec.severity) {
                    (OK_RULE_ID, _) => "OK",
                    (_, Severity::Error) => "CRITICAL",
                    (_, Severity::Warning) => "WARNING",
                    (_, Severity::Info) => "INFO",
                };
                println!("{label}: {}", rec.message);
            }
        }
        Command::Indexes { query } => {
            let report = advisor.recommend_indexes(&query);
            if cli.json {
                return print_json(&report);
            }
            if report.suggestions.is_empty() {
                println!("OK: {}", report.messages().join(" "));
            } else {
                for message in report.messages() {
                    println!("SUGGESTION: {message}");
                }
            }
        }
        Command::N1 { path } => {
            let snapshot = read_snapshot(&path)?;
            let report = advisor.detect_n_plus_one(&snapshot);
            if cli.json {
                return print_json(&report);
            }
            match &report {
                N1Report::NoStatistics => println!("OK: The snapshot has no statistics rows."),
                N1Report::Ranked { candidates, .. } if candidates.is_empty() => {
                    println!("OK: No N+1 candidates found.");
                }
                N1Report::Ranked {
                    considered,
                    candidates,
                } => {
                    println!(
                        "CRITICAL: {} suspected N+1 statement(s) out of {considered}.",
                        candidates.len()
                    );
                    for candidate in candidates {
                        println!(
                            "SCORE={} CALLS={} ROWS_PER_CALL={:.2} MEAN_MS={:.2} PATTERNS={} QUERY={}",
                            candidate.score,
                            candidate.calls,
                            candidate.rows_per_call,
                            candidate.mean_ms,
                            candidate.matched_patterns.join(","),
                            candidate.query_snippet
                        );
                    }
                    let mut suggestions: Vec<&str> = Vec::new();
                    for candidate in candidates {
                        if !suggestions.contains(&candidate.suggestion.as_str()) {
                            suggestions.push(&candidate.suggestion);
                        }
                    }
                    for suggestion in suggestions {
                        for line in suggestion.lines() {
                            println!("SUGGESTION: {line}");
                        }
                    }
                }
            }
            for hint in report.hints() {
                println!("HINT: {hint}");
            }
        }
        Command::Autovacuum { path } => {
            let snapshot = read_snapshot(&path)?;
            let report = advisor.advise_autovacuum(&snapshot);
            if cli.json {
                return print_json(&report);
            }
            for stats in report.query_summary.values() {
                println!(
                    "SUMMARY: {} calls={} rows={} avg_ms={:.2}",
                    stats.query_type, stats.calls, stats.rows, stats.avg_exec_time
                );
            }
            for rec in &report.recommendations {
                let label = if rec.as_str() == AUTOVACUUM_OK_MESSAGE {
                    "OK"
                } else {
                    "SUGGESTION"
                };
                println!("{label}: {rec}");
            }
        }
        Command::StatsQuery { columns, limit } => {
            let sql = if columns.is_empty() {
                TIMING_COLUMNS_PROBE.to_string()
            } else {
                TimingColumns::detect(columns.iter().map(|c| c.trim()))?
                    .snapshot_query(advisor.config().n1.min_calls, limit)
            };
            if cli.json {
                return print_json(&serde_json::json!({ "query": sql }));
            }
            println!("{sql}");
        }
        Command::Explain { path } => {
            let contents = fs::read_to_string(&path)
                .with_context(|| format!("failed to read plan file {}", path.display()))?;
            let summary = PlanSummary::from_explain_json(&contents)
                .with_context(|| format!("failed to summarise {}", path.display()))?;
            if cli.json {
                return print_json(&summary);
            }
            print!("{}", summary.render());
        }
        Command::Tune {
            ram_gb,
            max_connections,
            current,
        } => {
            let recommended = tuning::recommend_memory_settings(ram_gb, max_connections)?;
            let current: BTreeMap<String, String> = current.into_iter().collect();
            let report = tuning::compare_settings(&current, &recommended);
            if cli.json {
                return print_json(&report);
            }
            for setting in &report.settings {
                let label = if setting.current.is_some() && !setting.differs() {
                    "OK"
                } else {
                    "SETTING"
                };
                println!(
                    "{label}: {} current={} recommended={}",
                    setting.parameter,
                    setting.current.as_deref().unwrap_or("unknown"),
                    setting.recommended
                );
            }
        }
    }

    Ok(())
}

fn init_tracing(verbose: u8) {
    let default_level = match verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();
}

fn read_snapshot(path: &Path) -> anyhow::Result<StatsSnapshot> {
    let contents = fs::read_to_string(path)
        .with_context(|| format!("failed to read statistics file {}", path.display()))?;
    let snapshot = StatsSnapshot::from_json_str(&contents)
        .with_context(|| format!("failed to load statistics from {}", path.display()))?;
    debug!(rows = snapshot.rows().len(), timing = ?snapshot.timing(), "snapshot loaded");
    Ok(snapshot)
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn parse_setting(raw: &str) -> Result<(String, String), String> {
    let Some((name, value)) = raw.split_once('=') else {
        return Err(format!("expected name=value, got `{raw}`"));
    };
    let name = name.trim();
    if name.is_empty() {
        return Err(format!("setting name is empty in `{raw}`"));
    }
    Ok((name.to_string(), value.trim().to_string()))
}
