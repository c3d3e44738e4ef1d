//! Thresholds for every advisor stage.
//!
//! ```toml
//! [rules]
//! disabled = ["offset-pagination"]
//! max_joins = 6
//!
//! [rules.severity]
//! missing-limit = "info"
//!
//! [n1]
//! min_calls = 500
//!
//! [autovacuum]
//! slow_select_ms = 25.0
//! ```

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{AdvisorError, Result};
use crate::rules::Severity;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AdvisorConfig {
    pub rules: RulesConfig,
    pub n1: N1Config,
    pub autovacuum: AutovacuumConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RulesConfig {
    /// Rule ids to skip, matched case-insensitively.
    pub disabled: Vec<String>,
    /// Severity overrides keyed by rule id.
    pub severity: BTreeMap<String, String>,
    /// JOIN count above which `excessive-joins` fires.
    pub max_joins: usize,
}

impl Default for RulesConfig {
    fn default() -> Self {
        Self {
            disabled: Vec::new(),
            severity: BTreeMap::new(),
            max_joins: 4,
        }
    }
}

impl RulesConfig {
    pub fn is_disabled(&self, rule_id: &str) -> bool {
        self.disabled
            .iter()
            .any(|disabled| disabled.eq_ignore_ascii_case(rule_id))
    }

    pub fn severity_override(&self, rule_id: &str) -> Result<Option<Severity>> {
        self.severity
            .iter()
            .find(|(id, _)| id.eq_ignore_ascii_case(rule_id))
            .map(|(_, name)| name.parse::<Severity>())
            .transpose()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct N1Config {
    pub min_calls: u64,
    pub max_rows_per_call: f64,
    pub fast_mean_ms: f64,
    /// Call volume required before a fast mean time counts towards the score.
    pub fast_path_min_calls: u64,
    pub min_score: u32,
    pub max_candidates: usize,
    pub snippet_chars: usize,
}

impl Default for N1Config {
    fn default() -> Self {
        Self {
            min_calls: 100,
            max_rows_per_call: 2.0,
            fast_mean_ms: 30.0,
            fast_path_min_calls: 100,
            min_score: 2,
            max_candidates: 50,
            snippet_chars: 300,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AutovacuumConfig {
    /// Share of UPDATE+DELETE calls above which vacuum should run sooner.
    pub write_ratio: f64,
    /// Share of INSERT calls above which analyze should run sooner.
    pub insert_ratio: f64,
    pub slow_select_ms: f64,
}

impl Default for AutovacuumConfig {
    fn default() -> Self {
        Self {
            write_ratio: 0.2,
            insert_ratio: 0.2,
            slow_select_ms: 10.0,
        }
    }
}

impl AdvisorConfig {
    pub fn from_toml_str(contents: &str) -> Result<Self> {
        let config: Self =
            toml::from_str(contents).map_err(|e| AdvisorError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .map_err(|e| AdvisorError::Config(format!("failed to read {}: {e}", path.display())))?;
        Self::from_toml_str(&contents)
    }

    pub fn validate(&self) -> Result<()> {
        for name in self.rules.severity.values() {
            name.parse::<Severity>()?;
        }
        let thresholds = [
            ("n1.max_rows_per_call", self.n1.max_rows_per_call),
            ("n1.fast_mean_ms", self.n1.fast_mean_ms),
            ("autovacuum.write_ratio", self.autovacuum.write_ratio),
            ("autovacuum.insert_ratio", self.autovacuum.insert_ratio),
            ("autovacuum.slow_select_ms", self.autovacuum.slow_select_ms),
        ];
        for (name, value) in thresholds {
            if !value.is_finite() || value < 0.0 {
                return Err(AdvisorError::Config(format!(
                    "{name} must be a non-negative number, got {value}"
                )));
            }
        }
        if self.n1.max_candidates == 0 {
            return Err(AdvisorError::Config(
                "n1.max_candidates must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_document_yields_defaults() {
        let config = AdvisorConfig::from_toml_str("").unwrap();
        assert_eq!(config, AdvisorConfig::default());
        assert_eq!(config.n1.min_calls, 100);
        assert_eq!(config.rules.max_joins, 4);
    }

    #[test]
    fn partial_sections_keep_other_defaults() {
        let config = AdvisorConfig::from_toml_str(
            r#"
[rules]
disabled = ["Offset-Pagination"]

[rules.severity]
missing-limit = "info"

[n1]
min_calls = 500
"#,
        )
        .unwrap();
        assert!(config.rules.is_disabled("offset-pagination"));
        assert_eq!(
            config.rules.severity_override("missing-limit").unwrap(),
            Some(Severity::Info)
        );
        assert_eq!(config.n1.min_calls, 500);
        assert_eq!(config.n1.max_candidates, 50);
        assert_eq!(config.autovacuum.slow_select_ms, 10.0);
    }

    #[test]
    fn rejects_unknown_severity_and_bad_thresholds() {
        let err = AdvisorConfig::from_toml_str("[rules.severity]\nmissing-limit = \"fatal\"")
            .unwrap_err();
        assert!(matches!(err, AdvisorError::Config(_)));

        let err = AdvisorConfig::from_toml_str("[autovacuum]\nwrite_ratio = -0.5").unwrap_err();
        assert!(err.to_string().contains("autovacuum.write_ratio"));

        let err = AdvisorConfig::from_toml_str("[n1]\nmax_candidates = 0").unwrap_err();
        assert!(err.to_string().contains("max_candidates"));
    }
}
