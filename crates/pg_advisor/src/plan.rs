//! Summaries of `EXPLAIN (ANALYZE, BUFFERS, FORMAT JSON)` output.
//!
//! The plan is produced by the caller against a live server; this module only
//! reads the JSON document and renders the per-node metrics.

use std::collections::BTreeMap;
use std::fmt::Write as _;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{AdvisorError, Result};

const BUFFER_FIELDS: [&str; 10] = [
    "Shared Hit Blocks",
    "Shared Read Blocks",
    "Shared Dirtied Blocks",
    "Shared Written Blocks",
    "Local Hit Blocks",
    "Local Read Blocks",
    "Local Dirtied Blocks",
    "Local Written Blocks",
    "Temp Read Blocks",
    "Temp Written Blocks",
];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanNode {
    #[serde(rename = "Node Type")]
    pub node_type: String,
    #[serde(rename = "Relation Name", default)]
    pub relation_name: Option<String>,
    #[serde(rename = "Plan Rows", default)]
    pub plan_rows: Option<f64>,
    #[serde(rename = "Actual Rows", default)]
    pub actual_rows: Option<f64>,
    #[serde(rename = "Total Cost", default)]
    pub total_cost: Option<f64>,
    #[serde(rename = "Actual Total Time", default)]
    pub actual_total_time: Option<f64>,
    #[serde(rename = "Actual Loops", alias = "Loops", default)]
    pub loops: Option<f64>,
    #[serde(rename = "Sort Method", default)]
    pub sort_method: Option<String>,
    #[serde(rename = "Sort Space Used", default)]
    pub sort_space_used: Option<f64>,
    #[serde(rename = "Plans", default)]
    pub children: Vec<PlanNode>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl PlanNode {
    /// Buffer counters present on this node. EXPLAIN reports them
    /// cumulatively, so a parent already includes its children.
    pub fn buffers(&self) -> BTreeMap<&'static str, u64> {
        BUFFER_FIELDS
            .iter()
            .filter_map(|field| {
                self.extra
                    .get(*field)
                    .and_then(Value::as_u64)
                    .map(|blocks| (*field, blocks))
            })
            .collect()
    }

    fn node_count(&self) -> usize {
        1 + self.children.iter().map(PlanNode::node_count).sum::<usize>()
    }

    fn render_into(&self, depth: usize, out: &mut String) {
        let pad = "  ".repeat(depth);
        let show = |value: Option<f64>| value.map_or_else(|| "-".to_string(), |v| v.to_string());

        let _ = writeln!(out, "{pad}Node Type: {}", self.node_type);
        if let Some(relation) = &self.relation_name {
            let _ = writeln!(out, "{pad}Relation Name: {relation}");
        }
        let _ = writeln!(
            out,
            "{pad}Plan Rows: {}, Actual Rows: {}",
            show(self.plan_rows),
            show(self.actual_rows)
        );
        let _ = writeln!(
            out,
            "{pad}Total Cost: {}, Actual Total Time: {} ms",
            show(self.total_cost),
            show(self.actual_total_time)
        );
        let _ = writeln!(out, "{pad}Loops: {}", show(self.loops.or(Some(1.0))));

        let buffers = self.buffers();
        if !buffers.is_empty() {
            let joined = buffers
                .iter()
                .map(|(name, blocks)| format!("{name}: {blocks}"))
                .collect::<Vec<_>>()
                .join(", ");
            let _ = writeln!(out, "{pad}Buffers: {joined}");
        }
        if self.node_type == "Sort" {
            let _ = writeln!(
                out,
                "{pad}Sort Method: {}",
                self.sort_method.as_deref().unwrap_or("-")
            );
            let _ = writeln!(out, "{pad}Sort Space Used: {}", self.sort_space_used.unwrap_or(0.0));
        }
        for child in &self.children {
            child.render_into(depth + 1, out);
        }
    }
}

#[derive(Debug, Deserialize)]
struct ExplainDocument {
    #[serde(rename = "Plan")]
    plan: PlanNode,
    #[serde(rename = "Planning Time", default)]
    planning_time: Option<f64>,
    #[serde(rename = "Execution Time", default)]
    execution_time: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PlanSummary {
    pub planning_time_ms: Option<f64>,
    pub execution_time_ms: Option<f64>,
    pub root_actual_time_ms: f64,
    pub total_buffers: u64,
    pub node_count: usize,
    pub root: PlanNode,
}

impl PlanSummary {
    /// Accepts the bare `[{"Plan": ...}]` array, a single document object, or
    /// a row exported as `{"QUERY PLAN": [...]}`.
    pub fn from_explain_json(contents: &str) -> Result<Self> {
        let mut value: Value = serde_json::from_str(contents)?;
        if let Some(inner) = value.get_mut("QUERY PLAN") {
            value = inner.take();
        }
        let document = match value {
            Value::Array(mut items) if !items.is_empty() => items.swap_remove(0),
            Value::Array(_) => return Err(AdvisorError::Plan("empty plan array".to_string())),
            other => other,
        };
        if document.get("Plan").is_none() {
            return Err(AdvisorError::Plan("missing `Plan` key".to_string()));
        }
        let document: ExplainDocument =
            serde_json::from_value(document).map_err(|e| AdvisorError::Plan(e.to_string()))?;

        let root = document.plan;
        Ok(Self {
            planning_time_ms: document.planning_time,
            execution_time_ms: document.execution_time,
            root_actual_time_ms: root.actual_total_time.unwrap_or(0.0),
            total_buffers: root.buffers().values().sum(),
            node_count: root.node_count(),
            root,
        })
    }

    pub fn render(&self) -> String {
        let mut out = String::new();
        self.root.render_into(0, &mut out);
        if let Some(planning) = self.planning_time_ms {
            let _ = writeln!(out, "Planning Time: {planning} ms");
        }
        if let Some(execution) = self.execution_time_ms {
            let _ = writeln!(out, "Execution Time: {execution} ms");
        }
        let _ = writeln!(out, "Total Actual Time: {} ms", self.root_actual_time_ms);
        let _ = writeln!(out, "Total Buffers: {}", self.total_buffers);
        let _ = writeln!(out, "Plan Nodes: {}", self.node_count);
        out
    }
}
