//! Query advisory engine for PostgreSQL workloads.
//!
//! Everything here is a pure function of its inputs: SQL text, an exported
//! `pg_stat_statements` snapshot or an `EXPLAIN` document. Connecting to the
//! server and fetching those inputs is left to the caller.

pub mod autovacuum;
pub mod config;
pub mod error;
pub mod indexes;
pub mod n1;
pub mod normalize;
pub mod plan;
pub mod rules;
pub mod stats;
pub mod tuning;

pub use autovacuum::{AggregatedTypeStats, AutovacuumReport, StatementKind};
pub use config::{AdvisorConfig, AutovacuumConfig, N1Config, RulesConfig};
pub use error::{AdvisorError, Result};
pub use indexes::{ClauseKind, ColumnReference, IndexReport, IndexSuggestion};
pub use n1::{N1Candidate, N1Report};
pub use normalize::QueryText;
pub use plan::{PlanNode, PlanSummary};
pub use rules::{Recommendation, Rule, RuleEngine, Severity};
pub use stats::{StatRow, StatsSnapshot, TimingColumns};
pub use tuning::{MemorySettings, SettingsReport};

/// A configured engine. Building one validates the configuration; every
/// method afterwards is infallible.
#[derive(Debug)]
pub struct Advisor {
    engine: RuleEngine,
    config: AdvisorConfig,
}

impl Advisor {
    pub fn new(config: AdvisorConfig) -> Result<Self> {
        config.validate()?;
        let engine = RuleEngine::with_config(&config.rules)?;
        Ok(Self { engine, config })
    }

    pub fn config(&self) -> &AdvisorConfig {
        &self.config
    }

    pub fn analyze_query(&self, sql: &str) -> Vec<Recommendation> {
        self.engine.analyze(&QueryText::new(sql))
    }

    pub fn recommend_indexes(&self, sql: &str) -> IndexReport {
        indexes::recommend_indexes(&QueryText::new(sql))
    }

    pub fn detect_n_plus_one(&self, snapshot: &StatsSnapshot) -> N1Report {
        n1::detect_n_plus_one(snapshot.rows(), &self.config.n1)
    }

    pub fn advise_autovacuum(&self, snapshot: &StatsSnapshot) -> AutovacuumReport {
        autovacuum::advise_autovacuum(snapshot.rows(), &self.config.autovacuum)
    }
}

impl Default for Advisor {
    fn default() -> Self {
        Self {
            engine: RuleEngine::new(),
            config: AdvisorConfig::default(),
        }
    }
}

/// Query-shape recommendations with the default rule set.
pub fn analyze(sql: &str) -> Vec<Recommendation> {
    RuleEngine::new().analyze(&QueryText::new(sql))
}

pub fn recommend_indexes(sql: &str) -> IndexReport {
    indexes::recommend_indexes(&QueryText::new(sql))
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use serde_json::json;

    use super::*;

    fn messages(recs: &[Recommendation]) -> Vec<&str> {
        recs.iter().map(|rec| rec.message.as_str()).collect()
    }

    #[test]
    fn analyze_is_order_stable() {
        let sql = "SELECT * FROM orders o JOIN items i WHERE o.note LIKE '%x' ORDER BY o.id OFFSET 20";
        let first = analyze(sql);
        assert_eq!(first, analyze(sql));
        assert_eq!(first, Advisor::default().analyze_query(sql));
    }

    #[test]
    fn wildcard_and_missing_limit() {
        let recs = analyze("SELECT * FROM t");
        let ids: Vec<_> = recs.iter().map(|rec| rec.rule_id).collect();
        assert!(ids.contains(&"wildcard-select"));
        assert!(ids.contains(&"missing-limit"));
    }

    #[test]
    fn index_references_for_filter_sort_and_join() {
        let report = recommend_indexes(
            "SELECT a FROM t JOIN u ON t.id = u.id WHERE t.x = 1 ORDER BY t.y LIMIT 10",
        );
        let found: Vec<(String, ClauseKind)> = report
            .suggestions
            .iter()
            .map(|s| (s.reference.to_string(), s.reference.clause_kind))
            .collect();
        for expected in [
            ("t.x".to_string(), ClauseKind::Where),
            ("t.y".to_string(), ClauseKind::OrderBy),
            ("t.id".to_string(), ClauseKind::Join),
            ("u.id".to_string(), ClauseKind::Join),
        ] {
            assert!(found.contains(&expected), "missing {expected:?} in {found:?}");
        }
    }

    #[test]
    fn join_without_condition_fires_once_per_join() {
        let recs = analyze("SELECT a.id FROM a JOIN b JOIN c ON b.id = c.id JOIN d WHERE a.id = 1 LIMIT 5");
        let hits = recs
            .iter()
            .filter(|rec| rec.rule_id == "join-without-condition")
            .count();
        assert_eq!(hits, 2);
        assert!(recs
            .iter()
            .filter(|rec| rec.rule_id == "join-without-condition")
            .all(|rec| rec.severity == Severity::Error));
    }

    #[test]
    fn repeated_rule_paths_dedupe() {
        let recs = analyze("SELECT id FROM t WHERE id IN (SELECT t_id FROM u) LIMIT 1");
        let texts = messages(&recs);
        let mut unique = texts.clone();
        unique.sort_unstable();
        unique.dedup();
        assert_eq!(texts.len(), unique.len());
    }

    #[test]
    fn configured_advisor_applies_overrides() {
        let config = AdvisorConfig::from_toml_str(
            r#"
            [rules]
            disabled = ["MISSING-LIMIT"]

            [rules.severity]
            wildcard-select = "error"
            "#,
        )
        .unwrap();
        let advisor = Advisor::new(config).unwrap();
        let recs = advisor.analyze_query("SELECT * FROM t");
        assert!(recs.iter().all(|rec| rec.rule_id != "missing-limit"));
        let wildcard = recs
            .iter()
            .find(|rec| rec.rule_id == "wildcard-select")
            .unwrap();
        assert_eq!(wildcard.severity, Severity::Error);
    }

    #[test]
    fn invalid_config_is_rejected_at_construction() {
        let mut config = AdvisorConfig::default();
        config
            .rules
            .severity
            .insert("wildcard-select".to_string(), "fatal".to_string());
        assert!(matches!(Advisor::new(config), Err(AdvisorError::Config(_))));
    }

    #[test]
    fn snapshot_flows_through_both_stat_stages() {
        let snapshot = StatsSnapshot::from_records(vec![
            json!({"queryid": 1, "calls": 30, "rows": 30, "total_exec_time": 30.0, "mean_exec_time": 1.0,
                   "query": "UPDATE t SET a = $1 WHERE id = $2"}),
            json!({"queryid": 2, "calls": 20, "rows": 20, "total_exec_time": 20.0, "mean_exec_time": 1.0,
                   "query": "DELETE FROM t WHERE id = $1"}),
            json!({"queryid": 3, "calls": 500, "rows": 300, "total_exec_time": 500.0, "mean_exec_time": 1.0,
                   "query": "SELECT * FROM t WHERE id = $1"}),
        ])
        .unwrap();
        let advisor = Advisor::default();

        let n1 = advisor.detect_n_plus_one(&snapshot);
        assert_eq!(n1.candidates()[0].queryid, Some(3));

        let vacuum = advisor.advise_autovacuum(&snapshot);
        assert_eq!(vacuum.query_summary[&StatementKind::Select].calls, 500);
        assert_eq!(vacuum.query_summary[&StatementKind::Update].calls, 30);
    }

    #[test]
    fn empty_snapshot_yields_sentinels() {
        let snapshot = StatsSnapshot::from_json_str("[]").unwrap();
        let advisor = Advisor::default();
        assert_eq!(advisor.detect_n_plus_one(&snapshot), N1Report::NoStatistics);
        assert_eq!(
            advisor.advise_autovacuum(&snapshot).recommendations,
            vec![autovacuum::AUTOVACUUM_OK_MESSAGE.to_string()]
        );
    }
}
