//! N+1 detection from aggregated statement statistics.
//!
//! A statement issued once per parent row shows up in `pg_stat_statements`
//! as a high call count, very few rows per call, a fast mean time and a
//! point-lookup shape. Each signal adds to a score; rows that reach
//! `min_score` are ranked by call volume.

use std::sync::LazyLock;

use regex::Regex;
use serde::Serialize;
use tracing::debug;

use crate::config::N1Config;
use crate::stats::StatRow;

/// Point-lookup signatures, checked in this order.
static SIGNATURES: LazyLock<[(&'static str, Regex); 4]> = LazyLock::new(|| {
    [
        ("positional-param", Regex::new(r"(?i)\bwhere\b[^;]*=\s*\$\d+").unwrap()),
        ("integer-literal", Regex::new(r"(?i)\bwhere\b[^;]*=\s*\d+").unwrap()),
        ("limit-one", Regex::new(r"(?i)\blimit\s+1\b").unwrap()),
        ("named-param", Regex::new(r"(?i)\bwhere\b[^;]*=\s*%\(\w+\)s").unwrap()),
    ]
});

const BATCHING_SUGGESTION: &str = "Suspected N+1: many single-row lookups.\n\
- ORM: use eager loading (SQLAlchemy joinedload/selectinload, Django select_related/prefetch_related).\n\
- Batch the lookups: WHERE id IN (...), then a JOIN or aggregate instead of one SELECT per row.\n\
- For per-row counters: a single LEFT JOIN + GROUP BY, or window functions.\n\
- Consider caching frequently requested entities.";

const HOT_PATH_SUGGESTION: &str =
    "High call volume: check for an N+1 pattern or a hot path in the code.";

const NO_CANDIDATE_HINTS: &[&str] = &[
    "Make sure pg_stat_statements is loaded and pg_stat_statements.track = 'all'.",
    "Run a representative workload (for example a loop issuing many single-row SELECTs) before sampling.",
    "Lower n1.min_calls or raise the export LIMIT if the workload is small.",
];

/// Names of the point-lookup signatures that match `query`, in catalogue order.
pub fn matched_signatures(query: &str) -> Vec<&'static str> {
    SIGNATURES
        .iter()
        .filter(|(_, pattern)| pattern.is_match(query))
        .map(|(id, _)| *id)
        .collect()
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct N1Candidate {
    pub queryid: Option<i64>,
    pub query_snippet: String,
    pub calls: u64,
    pub rows_per_call: f64,
    pub mean_ms: f64,
    pub matched_patterns: Vec<&'static str>,
    pub score: u32,
    pub suggestion: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum N1Report {
    /// The snapshot held no rows at all.
    NoStatistics,
    Ranked {
        considered: usize,
        candidates: Vec<N1Candidate>,
    },
}

impl N1Report {
    pub fn candidates(&self) -> &[N1Candidate] {
        match self {
            Self::NoStatistics => &[],
            Self::Ranked { candidates, .. } => candidates,
        }
    }

    /// Diagnostic hints for callers when there is nothing to show.
    pub fn hints(&self) -> &'static [&'static str] {
        if self.candidates().is_empty() {
            NO_CANDIDATE_HINTS
        } else {
            &[]
        }
    }
}

pub fn score_row(row: &StatRow, config: &N1Config) -> (u32, Vec<&'static str>) {
    let matched = matched_signatures(&row.query_text);
    let rows_per_call = row.rows_per_call();
    let mut score = 0;
    if row.calls >= config.min_calls {
        score += 1;
    }
    if rows_per_call <= config.max_rows_per_call {
        score += 1;
    }
    if !matched.is_empty() {
        score += 2;
    }
    if row.mean_time_ms <= config.fast_mean_ms && row.calls >= config.fast_path_min_calls {
        score += 1;
    }
    (score, matched)
}

pub fn detect_n_plus_one(rows: &[StatRow], config: &N1Config) -> N1Report {
    if rows.is_empty() {
        debug!("no statistics rows, skipping N+1 detection");
        return N1Report::NoStatistics;
    }

    let mut candidates = rows
        .iter()
        .filter_map(|row| {
            let (score, matched_patterns) = score_row(row, config);
            if score < config.min_score {
                return None;
            }
            let rows_per_call = row.rows_per_call();
            let suggestion = if !matched_patterns.is_empty()
                || rows_per_call <= config.max_rows_per_call
            {
                BATCHING_SUGGESTION
            } else {
                HOT_PATH_SUGGESTION
            };
            Some(N1Candidate {
                queryid: row.queryid,
                query_snippet: snippet(&row.query_text, config.snippet_chars),
                calls: row.calls,
                rows_per_call,
                mean_ms: row.mean_time_ms,
                matched_patterns,
                score,
                suggestion: suggestion.to_string(),
            })
        })
        .collect::<Vec<_>>();

    candidates.sort_by(|a, b| {
        b.calls
            .cmp(&a.calls)
            .then_with(|| a.rows_per_call.total_cmp(&b.rows_per_call))
    });
    candidates.truncate(config.max_candidates);
    debug!(
        considered = rows.len(),
        candidates = candidates.len(),
        "N+1 detection finished"
    );

    N1Report::Ranked {
        considered: rows.len(),
        candidates,
    }
}

fn snippet(query: &str, max_chars: usize) -> String {
    query
        .trim()
        .chars()
        .map(|ch| if ch == '\n' || ch == '\r' { ' ' } else { ch })
        .take(max_chars)
        .collect()
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn config() -> N1Config {
        N1Config::default()
    }

    #[test]
    fn signatures_are_case_insensitive_and_ordered() {
        assert_eq!(
            matched_signatures("SELECT * FROM users WHERE id = $1 LIMIT 1"),
            vec!["positional-param", "limit-one"]
        );
        assert_eq!(matched_signatures("select * from t where id = 42"), vec!["integer-literal"]);
        assert_eq!(
            matched_signatures("SELECT * FROM t WHERE id = %(id)s"),
            vec!["named-param"]
        );
        assert!(matched_signatures("SELECT * FROM t LIMIT 10").is_empty());
    }

    #[test]
    fn point_lookup_outranks_bulk_read() {
        let lookup = StatRow::new("SELECT * FROM users WHERE id = $1", 150, 100, 5.0);
        let bulk = StatRow::new("SELECT * FROM users", 150, 900, 50.0);
        assert_eq!(score_row(&lookup, &config()).0, 5);
        assert_eq!(score_row(&bulk, &config()).0, 1);

        let report = detect_n_plus_one(&[bulk, lookup], &config());
        let candidates = report.candidates();
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].calls, 150);
        assert_eq!(candidates[0].matched_patterns, vec!["positional-param"]);
        assert!(candidates[0].suggestion.starts_with("Suspected N+1"));
        assert!((candidates[0].rows_per_call - 0.6667).abs() < 1e-3);
    }

    #[test]
    fn each_signal_never_lowers_the_score() {
        let base = StatRow::new("SELECT * FROM t", 10, 100, 100.0);
        let (base_score, _) = score_row(&base, &config());
        let variants = [
            StatRow::new("SELECT * FROM t", 200, 2000, 100.0),
            StatRow::new("SELECT * FROM t", 10, 10, 100.0),
            StatRow::new("SELECT * FROM t WHERE id = 1", 10, 100, 100.0),
            StatRow::new("SELECT * FROM t", 10, 100, 1.0),
        ];
        for variant in &variants {
            assert!(score_row(variant, &config()).0 >= base_score);
        }
    }

    #[test]
    fn ranking_by_calls_then_rows_per_call() {
        let rows = vec![
            StatRow::new("select * from a where id = $1", 200, 200, 1.0),
            StatRow::new("select * from b where id = $1", 500, 500, 1.0),
            StatRow::new("select * from c where id = $1", 500, 100, 1.0),
        ];
        let report = detect_n_plus_one(&rows, &config());
        let order: Vec<_> = report
            .candidates()
            .iter()
            .map(|c| c.query_snippet.as_str())
            .collect();
        assert_eq!(
            order,
            vec![
                "select * from c where id = $1",
                "select * from b where id = $1",
                "select * from a where id = $1",
            ]
        );
    }

    #[test]
    fn truncates_to_max_candidates() {
        let rows: Vec<_> = (0..10)
            .map(|i| StatRow::new(format!("select * from t{i} where id = $1"), 100 + i, 1, 1.0))
            .collect();
        let report = detect_n_plus_one(
            &rows,
            &N1Config {
                max_candidates: 3,
                ..N1Config::default()
            },
        );
        let calls: Vec<_> = report.candidates().iter().map(|c| c.calls).collect();
        assert_eq!(calls, vec![109, 108, 107]);
    }

    #[test]
    fn hot_path_suggestion_for_wide_rows() {
        let row = StatRow::new("select * from big", 5000, 500_000, 3.0);
        let report = detect_n_plus_one(&[row], &config());
        assert_eq!(report.candidates()[0].score, 2);
        assert_eq!(report.candidates()[0].suggestion, HOT_PATH_SUGGESTION);
    }

    #[test]
    fn snippet_collapses_newlines_and_truncates() {
        let long = format!("select *\nfrom t\r\nwhere id = $1 {}", "x".repeat(400));
        let row = StatRow::new(long, 1000, 1, 1.0);
        let report = detect_n_plus_one(&[row], &config());
        let snippet = &report.candidates()[0].query_snippet;
        assert_eq!(snippet.chars().count(), 300);
        assert!(snippet.starts_with("select * from t  where id = $1"));
    }

    #[test]
    fn empty_input_is_distinct_from_no_candidates() {
        let empty = detect_n_plus_one(&[], &config());
        assert_eq!(empty, N1Report::NoStatistics);
        assert!(!empty.hints().is_empty());

        let quiet = detect_n_plus_one(&[StatRow::new("select * from t", 1, 50, 90.0)], &config());
        assert_eq!(
            quiet,
            N1Report::Ranked {
                considered: 1,
                candidates: Vec::new()
            }
        );
        assert!(!quiet.hints().is_empty());
    }
}
