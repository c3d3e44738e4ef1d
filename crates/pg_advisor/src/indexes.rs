//! Index candidates from WHERE filters, JOIN keys and ORDER BY items.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::LazyLock;

use regex::Regex;
use serde::Serialize;
use tracing::debug;

use crate::normalize::{clause_body, scan_to_boundary, Clause, QueryText, JOIN_BOUNDARY};

pub const NO_INDEX_MESSAGE: &str = "No index suggestions.";

static WHERE_CONDITION: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"([a-z_]\w*(?:\.[a-z_]\w*)?)\s*(?:>=|<=|<>|!=|>|<|=|\bnot\s+i?like\b|\bi?like\b|\bnot\s+between\b|\bbetween\b|\bnot\s+in\b|\bin\b)\s*(?:''|-?\d+(?:\.\d+)?|\$\d+|\()",
    )
    .unwrap()
});
static JOIN_ON: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\bjoin\s+(?:lateral\s+)?[\w.]+(?:\s+(?:as\s+)?\w+)?\s+on\b").unwrap()
});
static JOIN_USING: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\bjoin\s+[\w.]+(?:\s+(?:as\s+)?\w+)?\s+using\s*\(([^)]*)\)").unwrap()
});
static EQUALITY: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"([a-z_]\w*(?:\.[a-z_]\w*)?)\s*=\s*([a-z_]\w*(?:\.[a-z_]\w*)?)").unwrap()
});
static SORT_MODIFIERS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?:\s+nulls\s+(?:first|last))?(?:\s+(?:asc|desc))?(?:\s+nulls\s+(?:first|last))?\s*;?$").unwrap());
static IDENTIFIER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-z_]\w*(?:\.[a-z_]\w*)*$").unwrap());

const NOT_COLUMNS: &[&str] = &[
    "and", "or", "not", "is", "null", "true", "false", "case", "when", "then", "else", "end",
    "select", "where", "on", "exists", "any", "all", "some",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ClauseKind {
    Where,
    Join,
    OrderBy,
}

impl ClauseKind {
    pub fn reason(&self) -> &'static str {
        match self {
            Self::Where => "filtering",
            Self::Join => "joins",
            Self::OrderBy => "sorting",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct ColumnReference {
    pub qualifier: Option<String>,
    pub column: String,
    pub clause_kind: ClauseKind,
}

impl ColumnReference {
    fn parse(text: &str, clause_kind: ClauseKind) -> Option<Self> {
        let text = text.trim();
        if text.is_empty() || NOT_COLUMNS.contains(&text) {
            return None;
        }
        let (qualifier, column) = match text.rsplit_once('.') {
            Some((qualifier, column)) if IDENTIFIER.is_match(text) => {
                (Some(qualifier.to_string()), column.to_string())
            }
            _ => (None, text.to_string()),
        };
        Some(Self {
            qualifier,
            column,
            clause_kind,
        })
    }
}

impl fmt::Display for ColumnReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.qualifier {
            Some(qualifier) => write!(f, "{qualifier}.{}", self.column),
            None => f.write_str(&self.column),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub struct IndexSuggestion {
    pub reference: ColumnReference,
    pub message: String,
}

impl From<ColumnReference> for IndexSuggestion {
    fn from(reference: ColumnReference) -> Self {
        let message = format!(
            "Create an index on {reference} to speed up {}.",
            reference.clause_kind.reason()
        );
        Self { reference, message }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct IndexReport {
    pub suggestions: Vec<IndexSuggestion>,
}

impl IndexReport {
    /// One line per suggestion, or the "nothing to do" line.
    pub fn messages(&self) -> Vec<String> {
        if self.suggestions.is_empty() {
            return vec![NO_INDEX_MESSAGE.to_string()];
        }
        self.suggestions
            .iter()
            .map(|suggestion| suggestion.message.clone())
            .collect()
    }
}

pub fn extract_column_references(query: &QueryText) -> Vec<ColumnReference> {
    let sql = query.normalized();
    let mut refs = Vec::new();

    let where_body = clause_body(sql, Clause::Where);
    for condition in WHERE_CONDITION.captures_iter(where_body) {
        refs.extend(ColumnReference::parse(&condition[1], ClauseKind::Where));
    }

    for join in JOIN_ON.find_iter(sql) {
        let end = scan_to_boundary(sql, join.end(), &JOIN_BOUNDARY);
        for pair in EQUALITY.captures_iter(&sql[join.end()..end]) {
            refs.extend(ColumnReference::parse(&pair[1], ClauseKind::Join));
            refs.extend(ColumnReference::parse(&pair[2], ClauseKind::Join));
        }
    }

    for join in JOIN_USING.captures_iter(sql) {
        for column in join[1].split(',') {
            refs.extend(ColumnReference::parse(column, ClauseKind::Join));
        }
    }

    for item in split_top_level(clause_body(sql, Clause::OrderBy)) {
        let item = SORT_MODIFIERS.replace(item.trim(), "");
        if item.chars().all(|ch| ch.is_ascii_digit()) {
            continue;
        }
        refs.extend(ColumnReference::parse(&item, ClauseKind::OrderBy));
    }

    refs
}

pub fn recommend_indexes(query: &QueryText) -> IndexReport {
    let unique: BTreeSet<IndexSuggestion> = extract_column_references(query)
        .into_iter()
        .map(IndexSuggestion::from)
        .collect();
    debug!(suggestions = unique.len(), "index analysis finished");
    IndexReport {
        suggestions: unique.into_iter().collect(),
    }
}

/// Splits on commas that are not inside parentheses.
fn split_top_level(text: &str) -> Vec<&str> {
    let mut items = Vec::new();
    let mut depth = 0i32;
    let mut start = 0;
    for (idx, ch) in text.char_indices() {
        match ch {
            '(' => depth += 1,
            ')' => depth -= 1,
            ',' if depth == 0 => {
                items.push(&text[start..idx]);
                start = idx + 1;
            }
            _ => {}
        }
    }
    items.push(&text[start..]);
    items
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn names(sql: &str, kind: ClauseKind) -> Vec<String> {
        extract_column_references(&QueryText::new(sql))
            .into_iter()
            .filter(|r| r.clause_kind == kind)
            .map(|r| r.to_string())
            .collect()
    }

    #[test]
    fn filter_join_and_sort_references() {
        let sql = "SELECT a FROM t JOIN u ON t.id = u.id WHERE t.x = 1 ORDER BY t.y LIMIT 10";
        assert_eq!(names(sql, ClauseKind::Where), vec!["t.x"]);
        assert_eq!(names(sql, ClauseKind::Join), vec!["t.id", "u.id"]);
        assert_eq!(names(sql, ClauseKind::OrderBy), vec!["t.y"]);

        let messages = recommend_indexes(&QueryText::new(sql)).messages();
        assert!(messages.contains(&"Create an index on t.x to speed up filtering.".to_string()));
        assert!(messages.contains(&"Create an index on t.y to speed up sorting.".to_string()));
        assert!(messages.contains(&"Create an index on u.id to speed up joins.".to_string()));
    }

    #[test]
    fn where_operators() {
        let sql = "SELECT * FROM t WHERE a >= 5 AND b LIKE 'x%' AND c BETWEEN 1 AND 9 \
                   AND d IN (1, 2) AND e <> $1 AND f NOT IN (3) AND g IS NULL";
        assert_eq!(names(sql, ClauseKind::Where), vec!["a", "b", "c", "d", "e", "f"]);
    }

    #[test]
    fn join_using_and_multi_key_on() {
        let sql = "SELECT 1 FROM a JOIN b AS bb ON a.x = bb.x AND a.y = bb.y JOIN c USING (k1, k2)";
        assert_eq!(
            names(sql, ClauseKind::Join),
            vec!["a.x", "bb.x", "a.y", "bb.y", "k1", "k2"]
        );
    }

    #[test]
    fn order_by_strips_direction_and_skips_positions() {
        let sql = "SELECT a, b FROM t ORDER BY a DESC, coalesce(b, 0) ASC NULLS LAST, 2";
        assert_eq!(names(sql, ClauseKind::OrderBy), vec!["a", "coalesce(b, 0)"]);
    }

    #[test]
    fn window_order_by_does_not_hide_the_sort_key() {
        let sql = "SELECT row_number() OVER (ORDER BY a) FROM t ORDER BY b LIMIT 5";
        assert_eq!(names(sql, ClauseKind::OrderBy), vec!["b"]);
        assert_eq!(
            recommend_indexes(&QueryText::new(sql)).messages(),
            vec!["Create an index on b to speed up sorting.".to_string()]
        );
    }

    #[test]
    fn duplicates_collapse_and_empty_yields_sentinel() {
        let report = recommend_indexes(&QueryText::new("SELECT 1 FROM t WHERE a = 1 OR a = 2"));
        assert_eq!(report.suggestions.len(), 1);

        let report = recommend_indexes(&QueryText::new("SELECT 1"));
        assert_eq!(report.messages(), vec![NO_INDEX_MESSAGE.to_string()]);
    }
}
