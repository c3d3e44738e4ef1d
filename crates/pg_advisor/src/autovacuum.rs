//! Autovacuum tuning hints from the statement-type mix.

use std::collections::BTreeMap;
use std::fmt;

use serde::Serialize;
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::keywords::Keyword;
use sqlparser::tokenizer::{Token, Tokenizer};
use tracing::debug;

use crate::config::AutovacuumConfig;
use crate::stats::StatRow;

pub const AUTOVACUUM_OK_MESSAGE: &str = "Autovacuum looks healthy: nothing critical detected.";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum StatementKind {
    Select,
    Insert,
    Update,
    Delete,
    Other,
}

impl StatementKind {
    /// Classifies a statement by its first keyword, ignoring leading comments.
    pub fn classify(query: &str) -> Self {
        let dialect = PostgreSqlDialect {};
        match Tokenizer::new(&dialect, query).tokenize() {
            Ok(tokens) => tokens
                .iter()
                .find_map(|token| match token {
                    Token::Whitespace(_) | Token::LParen => None,
                    Token::Word(word) => Some(Self::from_keyword(word.keyword)),
                    _ => Some(Self::Other),
                })
                .unwrap_or(Self::Other),
            Err(err) => {
                debug!(%err, "tokenizer rejected statement, classifying by prefix");
                Self::from_prefix(query)
            }
        }
    }

    fn from_keyword(keyword: Keyword) -> Self {
        match keyword {
            Keyword::SELECT => Self::Select,
            Keyword::INSERT => Self::Insert,
            Keyword::UPDATE => Self::Update,
            Keyword::DELETE => Self::Delete,
            _ => Self::Other,
        }
    }

    fn from_prefix(query: &str) -> Self {
        let head = query.trim_start().to_ascii_uppercase();
        [
            ("SELECT", Self::Select),
            ("INSERT", Self::Insert),
            ("UPDATE", Self::Update),
            ("DELETE", Self::Delete),
        ]
        .into_iter()
        .find(|(prefix, _)| head.starts_with(prefix))
        .map_or(Self::Other, |(_, kind)| kind)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Select => "SELECT",
            Self::Insert => "INSERT",
            Self::Update => "UPDATE",
            Self::Delete => "DELETE",
            Self::Other => "OTHER",
        }
    }
}

impl fmt::Display for StatementKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AggregatedTypeStats {
    pub query_type: StatementKind,
    pub calls: u64,
    pub rows: u64,
    /// Call-weighted mean execution time in milliseconds.
    pub avg_exec_time: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AutovacuumReport {
    pub query_summary: BTreeMap<StatementKind, AggregatedTypeStats>,
    pub recommendations: Vec<String>,
}

pub fn aggregate_by_type(rows: &[StatRow]) -> BTreeMap<StatementKind, AggregatedTypeStats> {
    let mut totals: BTreeMap<StatementKind, (u64, u64, f64)> = BTreeMap::new();
    for row in rows {
        let entry = totals
            .entry(StatementKind::classify(&row.query_text))
            .or_default();
        entry.0 = entry.0.saturating_add(row.calls);
        entry.1 = entry.1.saturating_add(row.rows);
        entry.2 += row.mean_time_ms * row.calls as f64;
    }

    totals
        .into_iter()
        .map(|(kind, (calls, rows, weighted_time))| {
            let avg_exec_time = if calls > 0 {
                weighted_time / calls as f64
            } else {
                0.0
            };
            (
                kind,
                AggregatedTypeStats {
                    query_type: kind,
                    calls,
                    rows,
                    avg_exec_time,
                },
            )
        })
        .collect()
}

pub fn autovacuum_recommendations(
    summary: &BTreeMap<StatementKind, AggregatedTypeStats>,
    config: &AutovacuumConfig,
) -> Vec<String> {
    let calls = |kind: StatementKind| summary.get(&kind).map_or(0, |stats| stats.calls);
    let total_calls = summary
        .values()
        .fold(0u64, |total, stats| total.saturating_add(stats.calls))
        .max(1) as f64;
    let mut recommendations = Vec::new();

    let write_ratio =
        calls(StatementKind::Update).saturating_add(calls(StatementKind::Delete)) as f64 / total_calls;
    if write_ratio > config.write_ratio {
        recommendations.push(format!(
            "UPDATE/DELETE make up {:.0}% of calls: lower autovacuum_vacuum_scale_factor to 0.01-0.05 on hot tables.",
            write_ratio * 100.0
        ));
    }

    let insert_ratio = calls(StatementKind::Insert) as f64 / total_calls;
    if insert_ratio > config.insert_ratio {
        recommendations.push(format!(
            "INSERT makes up {:.0}% of calls: lower autovacuum_analyze_scale_factor to 0.05 to keep planner statistics fresh.",
            insert_ratio * 100.0
        ));
    }

    if let Some(select) = summary.get(&StatementKind::Select) {
        if select.avg_exec_time > config.slow_select_ms {
            recommendations.push(format!(
                "Average SELECT time is {:.2} ms: tables may be bloated, run autovacuum more often.",
                select.avg_exec_time
            ));
        }
    }

    if recommendations.is_empty() {
        recommendations.push(AUTOVACUUM_OK_MESSAGE.to_string());
    }
    recommendations
}

pub fn advise_autovacuum(rows: &[StatRow], config: &AutovacuumConfig) -> AutovacuumReport {
    let query_summary = aggregate_by_type(rows);
    let recommendations = autovacuum_recommendations(&query_summary, config);
    debug!(
        kinds = query_summary.len(),
        recommendations = recommendations.len(),
        "autovacuum analysis finished"
    );
    AutovacuumReport {
        query_summary,
        recommendations,
    }
}
