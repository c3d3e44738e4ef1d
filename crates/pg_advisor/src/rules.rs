//! Lexical anti-pattern rules over normalized SQL.
//!
//! Each rule is an independent object in a fixed, ordered catalogue. The
//! engine runs every enabled rule, keeps the first occurrence of each message
//! and falls back to a single `ok` recommendation when nothing fires.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::str::FromStr;
use std::sync::LazyLock;

use regex::Regex;
use serde::Serialize;
use tracing::{debug, trace};

use crate::config::RulesConfig;
use crate::error::{AdvisorError, Result};
use crate::normalize::{clause_body, scan_to_boundary, Clause, QueryText, JOIN_BOUNDARY};

pub const OK_RULE_ID: &str = "ok";
pub const OK_MESSAGE: &str = "Query looks fine.";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Error,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Info => "info",
            Self::Warning => "warning",
            Self::Error => "error",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Severity {
    type Err = AdvisorError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "info" => Ok(Self::Info),
            "warning" | "warn" => Ok(Self::Warning),
            "error" => Ok(Self::Error),
            other => Err(AdvisorError::Config(format!("unknown severity `{other}`"))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Recommendation {
    pub rule_id: &'static str,
    pub severity: Severity,
    pub message: String,
}

impl Recommendation {
    fn ok() -> Self {
        Self {
            rule_id: OK_RULE_ID,
            severity: Severity::Info,
            message: OK_MESSAGE.to_string(),
        }
    }
}

pub trait Rule: Send + Sync {
    fn id(&self) -> &'static str;

    fn default_severity(&self) -> Severity;

    /// Messages produced for `query`; empty when the rule does not apply.
    fn check(&self, query: &QueryText) -> Vec<String>;
}

/// A rule that is a plain predicate with a fixed message.
pub struct PatternRule {
    pub id: &'static str,
    pub severity: Severity,
    pub message: &'static str,
    pub applies: fn(&str) -> bool,
}

impl Rule for PatternRule {
    fn id(&self) -> &'static str {
        self.id
    }

    fn default_severity(&self) -> Severity {
        self.severity
    }

    fn check(&self, query: &QueryText) -> Vec<String> {
        if (self.applies)(query.normalized()) {
            vec![self.message.to_string()]
        } else {
            Vec::new()
        }
    }
}

static SELECT_KW: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\bselect\b").unwrap());
static FROM_KW: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\bfrom\b").unwrap());
static WHERE_KW: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\bwhere\b").unwrap());
static LIMIT_KW: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\blimit\b").unwrap());
static OFFSET_KW: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\boffset\b").unwrap());
static HAVING_KW: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\bhaving\b").unwrap());
static OR_KW: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\bor\b").unwrap());
static BETWEEN_KW: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\bbetween\b").unwrap());
static UNION_KW: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\bunion\b").unwrap());
static UNION_ALL_TAIL: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^\s+all\b").unwrap());
static GROUP_BY: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\bgroup\s+by\b").unwrap());
static ORDER_BY: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\border\s+by\b").unwrap());
static WILDCARD_SELECT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\bselect\s+(?:distinct\s+|all\s+)?\*").unwrap());
static NESTED_SELECT: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\(\s*select\b").unwrap());
static IN_SUBQUERY: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\bin\s*\(\s*select\b").unwrap());
static COLUMN_FUNCTION: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"\b(?:date|lower|upper|cast|coalesce|trim|date_trunc|to_char|extract|abs|round)\s*\(\s*[a-z_][\w.]*",
    )
    .unwrap()
});
static LIKE_LITERAL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b(?:like|ilike)\s*e?''").unwrap());
static COUNT_STAR: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\bcount\s*\(\s*\*\s*\)").unwrap());
static LEFT_JOIN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\bleft\s+(?:outer\s+)?join\b").unwrap());
static JOIN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\b(?:(cross|natural)\s+(?:(?:inner|left|right|full)\s+)?(?:outer\s+)?)?join\b")
        .unwrap()
});
static JOIN_CONDITION: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b(?:on|using)\b").unwrap());

const IN_SUBQUERY_MESSAGE: &str =
    "IN (subquery): EXISTS is usually more efficient when the subquery returns many rows.";

fn wildcard_select(sql: &str) -> bool {
    WILDCARD_SELECT.is_match(sql)
}

// Every SELECT list counts, including the main query after a CTE.
fn subquery_in_select(sql: &str) -> bool {
    SELECT_KW.find_iter(sql).any(|select| {
        let end = scan_to_boundary(sql, select.end(), &FROM_KW);
        NESTED_SELECT.is_match(&sql[select.end()..end])
    })
}

fn missing_limit(sql: &str) -> bool {
    SELECT_KW.is_match(sql) && !LIMIT_KW.is_match(sql)
}

fn function_on_where_column(sql: &str) -> bool {
    COLUMN_FUNCTION.is_match(clause_body(sql, Clause::Where))
}

fn or_in_where(sql: &str) -> bool {
    OR_KW.is_match(clause_body(sql, Clause::Where))
}

fn between_in_where(sql: &str) -> bool {
    BETWEEN_KW.is_match(clause_body(sql, Clause::Where))
}

fn in_subquery(sql: &str) -> bool {
    IN_SUBQUERY.is_match(clause_body(sql, Clause::Where))
}

fn in_subquery_anywhere(sql: &str) -> bool {
    IN_SUBQUERY.is_match(sql) && WHERE_KW.is_match(sql)
}

fn left_join(sql: &str) -> bool {
    LEFT_JOIN.is_match(sql)
}

fn union_without_all(sql: &str) -> bool {
    UNION_KW
        .find_iter(sql)
        .any(|union| !UNION_ALL_TAIL.is_match(&sql[union.end()..]))
}

fn multiple_unions(sql: &str) -> bool {
    UNION_KW.find_iter(sql).nth(1).is_some()
}

fn order_by_without_limit(sql: &str) -> bool {
    ORDER_BY.is_match(sql) && !LIMIT_KW.is_match(sql)
}

fn having_without_group_by(sql: &str) -> bool {
    HAVING_KW.is_match(sql) && !GROUP_BY.is_match(sql)
}

fn unbounded_count_star(sql: &str) -> bool {
    COUNT_STAR.is_match(sql) && !WHERE_KW.is_match(sql)
}

fn offset_pagination(sql: &str) -> bool {
    OFFSET_KW.is_match(sql)
}

/// Needs the collapsed literal bodies, so it cannot be a [`PatternRule`].
struct LeadingWildcardLike;

impl Rule for LeadingWildcardLike {
    fn id(&self) -> &'static str {
        "leading-wildcard-like"
    }

    fn default_severity(&self) -> Severity {
        Severity::Warning
    }

    fn check(&self, query: &QueryText) -> Vec<String> {
        let leading_wildcard = LIKE_LITERAL.find_iter(query.normalized()).any(|like| {
            query
                .literal_at(like.end() - 2)
                .is_some_and(|literal| literal.body.starts_with(['%', '_']))
        });
        if leading_wildcard {
            vec![
                "LIKE/ILIKE pattern starts with a wildcard: a B-tree index cannot be used; consider pg_trgm (GIN) or full-text search."
                    .to_string(),
            ]
        } else {
            Vec::new()
        }
    }
}

struct JoinWithoutCondition;

impl Rule for JoinWithoutCondition {
    fn id(&self) -> &'static str {
        "join-without-condition"
    }

    fn default_severity(&self) -> Severity {
        Severity::Error
    }

    fn check(&self, query: &QueryText) -> Vec<String> {
        let sql = query.normalized();
        let mut messages = Vec::new();
        for (ordinal, join) in JOIN.captures_iter(sql).enumerate() {
            let Some(whole) = join.get(0) else {
                continue;
            };
            // CROSS and NATURAL joins carry no condition by definition.
            if join.get(1).is_some() {
                continue;
            }
            let end = scan_to_boundary(sql, whole.end(), &JOIN_BOUNDARY);
            let fragment = &sql[whole.end()..end];
            if JOIN_CONDITION.is_match(fragment) {
                continue;
            }
            let relation = fragment.split_whitespace().next().unwrap_or("?");
            messages.push(format!(
                "JOIN #{} ({relation}) has no ON/USING condition: this can produce a Cartesian product.",
                ordinal + 1
            ));
        }
        messages
    }
}

struct ExcessiveJoins {
    max_joins: usize,
}

impl Rule for ExcessiveJoins {
    fn id(&self) -> &'static str {
        "excessive-joins"
    }

    fn default_severity(&self) -> Severity {
        Severity::Warning
    }

    fn check(&self, query: &QueryText) -> Vec<String> {
        let count = JOIN.find_iter(query.normalized()).count();
        if count > self.max_joins {
            vec![format!(
                "Many JOINs ({count}): check that each one is needed and that join columns are indexed."
            )]
        } else {
            Vec::new()
        }
    }
}

fn catalogue(config: &RulesConfig) -> Vec<Box<dyn Rule>> {
    vec![
        Box::new(PatternRule {
            id: "wildcard-select",
            severity: Severity::Error,
            message: "SELECT * is used: list only the columns you need.",
            applies: wildcard_select,
        }),
        Box::new(PatternRule {
            id: "subquery-in-select",
            severity: Severity::Warning,
            message: "Subquery in the SELECT list: rewrite it as a JOIN or a CTE.",
            applies: subquery_in_select,
        }),
        Box::new(PatternRule {
            id: "missing-limit",
            severity: Severity::Warning,
            message: "No LIMIT: if you do not need every row, bound the result set.",
            applies: missing_limit,
        }),
        Box::new(PatternRule {
            id: "function-on-where-column",
            severity: Severity::Error,
            message: "A function wraps a column in WHERE: a plain index on that column cannot be used.",
            applies: function_on_where_column,
        }),
        Box::new(PatternRule {
            id: "or-in-where",
            severity: Severity::Warning,
            message: "OR in WHERE can defeat index usage: consider UNION ALL, IN, EXISTS or an expression index.",
            applies: or_in_where,
        }),
        Box::new(PatternRule {
            id: "between-in-where",
            severity: Severity::Info,
            message: "BETWEEN in WHERE: half-open ranges (>= and <) are safer for time intervals.",
            applies: between_in_where,
        }),
        Box::new(LeadingWildcardLike),
        Box::new(PatternRule {
            id: "in-subquery",
            severity: Severity::Warning,
            message: IN_SUBQUERY_MESSAGE,
            applies: in_subquery,
        }),
        Box::new(PatternRule {
            id: "left-join",
            severity: Severity::Info,
            message: "LEFT JOIN is used: check whether an INNER JOIN is what you meant.",
            applies: left_join,
        }),
        Box::new(JoinWithoutCondition),
        Box::new(ExcessiveJoins {
            max_joins: config.max_joins,
        }),
        Box::new(PatternRule {
            id: "in-subquery-anywhere",
            severity: Severity::Warning,
            message: IN_SUBQUERY_MESSAGE,
            applies: in_subquery_anywhere,
        }),
        Box::new(PatternRule {
            id: "union-without-all",
            severity: Severity::Warning,
            message: "UNION removes duplicates: use UNION ALL when duplicates are acceptable, it is cheaper.",
            applies: union_without_all,
        }),
        Box::new(PatternRule {
            id: "multiple-unions",
            severity: Severity::Warning,
            message: "Several UNIONs in a row: consider a temporary table or a CTE.",
            applies: multiple_unions,
        }),
        Box::new(PatternRule {
            id: "order-by-without-limit",
            severity: Severity::Warning,
            message: "ORDER BY without LIMIT sorts the whole result: add a LIMIT or an index that covers the ORDER BY.",
            applies: order_by_without_limit,
        }),
        Box::new(PatternRule {
            id: "having-without-group-by",
            severity: Severity::Error,
            message: "HAVING without GROUP BY: move the condition into WHERE.",
            applies: having_without_group_by,
        }),
        Box::new(PatternRule {
            id: "unbounded-count-star",
            severity: Severity::Warning,
            message: "COUNT(*) without WHERE reads the whole table: consider a maintained counter or the pg_class.reltuples estimate.",
            applies: unbounded_count_star,
        }),
        Box::new(PatternRule {
            id: "offset-pagination",
            severity: Severity::Warning,
            message: "OFFSET pagination slows down as the offset grows: prefer keyset pagination (WHERE id > ?).",
            applies: offset_pagination,
        }),
    ]
}

pub struct RuleEngine {
    rules: Vec<Box<dyn Rule>>,
    severity_overrides: HashMap<&'static str, Severity>,
}

impl Default for RuleEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for RuleEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RuleEngine")
            .field("rules", &self.rule_ids())
            .field("severity_overrides", &self.severity_overrides)
            .finish()
    }
}

impl RuleEngine {
    pub fn new() -> Self {
        Self {
            rules: catalogue(&RulesConfig::default()),
            severity_overrides: HashMap::new(),
        }
    }

    pub fn with_config(config: &RulesConfig) -> Result<Self> {
        let rules: Vec<Box<dyn Rule>> = catalogue(config)
            .into_iter()
            .filter(|rule| !config.is_disabled(rule.id()))
            .collect();
        let mut severity_overrides = HashMap::new();
        for rule in &rules {
            if let Some(severity) = config.severity_override(rule.id())? {
                severity_overrides.insert(rule.id(), severity);
            }
        }
        Ok(Self {
            rules,
            severity_overrides,
        })
    }

    pub fn rule_ids(&self) -> Vec<&'static str> {
        self.rules.iter().map(|rule| rule.id()).collect()
    }

    pub fn analyze(&self, query: &QueryText) -> Vec<Recommendation> {
        let mut seen = HashSet::new();
        let mut recommendations = Vec::new();
        for rule in &self.rules {
            let severity = self
                .severity_overrides
                .get(rule.id())
                .copied()
                .unwrap_or_else(|| rule.default_severity());
            for message in rule.check(query) {
                trace!(rule = rule.id(), %message, "rule fired");
                if seen.insert(message.clone()) {
                    recommendations.push(Recommendation {
                        rule_id: rule.id(),
                        severity,
                        message,
                    });
                }
            }
        }
        debug!(
            rules = self.rules.len(),
            fired = recommendations.len(),
            "query shape analysis finished"
        );
        if recommendations.is_empty() {
            recommendations.push(Recommendation::ok());
        }
        recommendations
    }
}
