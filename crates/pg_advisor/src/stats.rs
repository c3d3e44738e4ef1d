//! `pg_stat_statements` rows as the advisor sees them.
//!
//! Fetching is the caller's job. This module only fixes the contract: which
//! columns to select, how to pick the timing pair for the server version, and
//! how loosely-typed exported rows become [`StatRow`]s.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, warn};

use crate::error::{AdvisorError, Result};

/// Lists whichever timing columns the installed extension version exposes.
pub const TIMING_COLUMNS_PROBE: &str = "SELECT column_name FROM information_schema.columns \
WHERE table_name = 'pg_stat_statements' \
AND column_name IN ('total_exec_time', 'mean_exec_time', 'total_time', 'mean_time')";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatRow {
    pub queryid: Option<i64>,
    pub dbid: Option<i64>,
    pub userid: Option<i64>,
    pub calls: u64,
    pub rows: u64,
    pub total_time_ms: f64,
    pub mean_time_ms: f64,
    #[serde(rename = "query")]
    pub query_text: String,
}

impl StatRow {
    pub fn new(query_text: impl Into<String>, calls: u64, rows: u64, mean_time_ms: f64) -> Self {
        Self {
            queryid: None,
            dbid: None,
            userid: None,
            calls,
            rows,
            total_time_ms: mean_time_ms * calls as f64,
            mean_time_ms,
            query_text: query_text.into(),
        }
    }

    pub fn with_queryid(mut self, queryid: i64) -> Self {
        self.queryid = Some(queryid);
        self
    }

    pub fn rows_per_call(&self) -> f64 {
        if self.calls > 0 {
            self.rows as f64 / self.calls as f64
        } else {
            0.0
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TimingColumns {
    pub total: &'static str,
    pub mean: &'static str,
}

impl TimingColumns {
    /// PostgreSQL 13 and later.
    pub const EXEC: Self = Self {
        total: "total_exec_time",
        mean: "mean_exec_time",
    };
    pub const LEGACY: Self = Self {
        total: "total_time",
        mean: "mean_time",
    };

    pub fn detect<'a>(columns: impl IntoIterator<Item = &'a str>) -> Result<Self> {
        let found: BTreeSet<&str> = columns.into_iter().collect();
        for candidate in [Self::EXEC, Self::LEGACY] {
            if found.contains(candidate.total) && found.contains(candidate.mean) {
                debug!(total = candidate.total, mean = candidate.mean, "timing columns detected");
                return Ok(candidate);
            }
        }
        Err(AdvisorError::MissingTimingColumns {
            found: found.into_iter().map(str::to_string).collect(),
        })
    }

    /// The snapshot query for this column pair. Column names are kept as-is
    /// so that exported rows can be probed again by [`StatsSnapshot::from_records`].
    pub fn snapshot_query(&self, min_calls: u64, limit: usize) -> String {
        format!(
            "SELECT queryid, dbid, userid, calls, rows, {total}, {mean}, query \
             FROM pg_stat_statements \
             WHERE calls >= {min_calls} \
             ORDER BY calls DESC \
             LIMIT {limit}",
            total = self.total,
            mean = self.mean,
        )
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct StatsSnapshot {
    timing: Option<TimingColumns>,
    rows: Vec<StatRow>,
}

impl StatsSnapshot {
    pub fn from_rows(rows: Vec<StatRow>) -> Self {
        Self { timing: None, rows }
    }

    pub fn from_json_str(contents: &str) -> Result<Self> {
        let value: Value = serde_json::from_str(contents)?;
        match value {
            Value::Array(records) => Self::from_records(records),
            other => Err(AdvisorError::InvalidRecord {
                index: 0,
                reason: format!("expected an array of rows, got {}", json_kind(&other)),
            }),
        }
    }

    /// Builds a snapshot from exported rows. An empty export is a valid,
    /// empty snapshot and is never probed for timing columns.
    pub fn from_records(records: Vec<Value>) -> Result<Self> {
        if records.is_empty() {
            return Ok(Self::default());
        }
        let mut objects = Vec::with_capacity(records.len());
        for (index, record) in records.into_iter().enumerate() {
            match record {
                Value::Object(object) => objects.push(object),
                other => {
                    return Err(AdvisorError::InvalidRecord {
                        index,
                        reason: format!("expected an object, got {}", json_kind(&other)),
                    })
                }
            }
        }

        let timing =
            TimingColumns::detect(objects.iter().flat_map(|object| object.keys().map(String::as_str)))?;
        let rows = objects
            .iter()
            .enumerate()
            .map(|(index, object)| row_from_object(index, object, timing))
            .collect::<Result<Vec<_>>>()?;
        debug!(rows = rows.len(), "statistics snapshot loaded");
        Ok(Self {
            timing: Some(timing),
            rows,
        })
    }

    pub fn timing(&self) -> Option<TimingColumns> {
        self.timing
    }

    pub fn rows(&self) -> &[StatRow] {
        &self.rows
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

fn row_from_object(index: usize, object: &Map<String, Value>, timing: TimingColumns) -> Result<StatRow> {
    let number = |field: &str| -> Result<f64> {
        match object.get(field) {
            None | Some(Value::Null) => {
                warn!(index, field, "missing counter treated as 0");
                Ok(0.0)
            }
            Some(value) => coerce_number(value).ok_or_else(|| AdvisorError::InvalidRecord {
                index,
                reason: format!("`{field}` is not numeric: {value}"),
            }),
        }
    };
    let count = |field: &str| -> Result<u64> {
        if let Some(exact) = object.get(field).and_then(Value::as_u64) {
            return Ok(exact);
        }
        let value = number(field)?;
        if value < 0.0 {
            return Err(AdvisorError::InvalidRecord {
                index,
                reason: format!("`{field}` is negative: {value}"),
            });
        }
        Ok(value as u64)
    };
    let id = |field: &str| object.get(field).and_then(coerce_id);

    Ok(StatRow {
        queryid: id("queryid"),
        dbid: id("dbid"),
        userid: id("userid"),
        calls: count("calls")?,
        rows: count("rows")?,
        total_time_ms: number(timing.total)?,
        mean_time_ms: number(timing.mean)?,
        query_text: object
            .get("query")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .trim()
            .to_string(),
    })
}

// numeric/bigint columns often arrive as strings from exporters.
fn coerce_number(value: &Value) -> Option<f64> {
    let parsed = match value {
        Value::Number(number) => number.as_f64(),
        Value::String(text) => text.trim().parse::<f64>().ok(),
        Value::Null => Some(0.0),
        _ => None,
    };
    parsed.filter(|v| v.is_finite())
}

// queryid is a 64-bit hash. Unsigned renderings keep their bit pattern.
fn coerce_id(value: &Value) -> Option<i64> {
    match value {
        Value::Number(number) => number
            .as_i64()
            .or_else(|| number.as_u64().map(|v| v as i64)),
        Value::String(text) => {
            let text = text.trim();
            text.parse::<i64>()
                .ok()
                .or_else(|| text.parse::<u64>().ok().map(|v| v as i64))
        }
        _ => None,
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}
