//! Memory settings derived from server RAM and `max_connections`.

use std::collections::BTreeMap;

use serde::Serialize;
use tracing::debug;

use crate::error::{AdvisorError, Result};

const MAINTENANCE_WORK_MEM_CAP_MB: u64 = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct MemorySettings {
    pub shared_buffers_mb: u64,
    pub effective_cache_size_mb: u64,
    pub work_mem_mb: u64,
    pub maintenance_work_mem_mb: u64,
}

impl MemorySettings {
    /// Parameter name and its `postgresql.conf` value.
    pub fn entries(&self) -> [(&'static str, String); 4] {
        [
            ("shared_buffers", format!("{}MB", self.shared_buffers_mb)),
            ("effective_cache_size", format!("{}MB", self.effective_cache_size_mb)),
            ("work_mem", format!("{}MB", self.work_mem_mb)),
            ("maintenance_work_mem", format!("{}MB", self.maintenance_work_mem_mb)),
        ]
    }
}

pub fn recommend_memory_settings(ram_gb: u64, max_connections: u64) -> Result<MemorySettings> {
    if ram_gb == 0 {
        return Err(AdvisorError::InvalidInput("ram_gb must be positive".to_string()));
    }
    if max_connections == 0 {
        return Err(AdvisorError::InvalidInput(
            "max_connections must be positive".to_string(),
        ));
    }
    let ram_mb = ram_gb.saturating_mul(1024);
    let settings = MemorySettings {
        shared_buffers_mb: ram_mb / 4,
        effective_cache_size_mb: ram_mb.saturating_mul(3) / 4,
        work_mem_mb: ram_mb / 4 / max_connections,
        maintenance_work_mem_mb: (ram_mb / 20).min(MAINTENANCE_WORK_MEM_CAP_MB),
    };
    debug!(ram_gb, max_connections, ?settings, "memory settings computed");
    Ok(settings)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SettingComparison {
    pub parameter: &'static str,
    pub current: Option<String>,
    pub recommended: String,
}

impl SettingComparison {
    pub fn differs(&self) -> bool {
        self.current.as_deref() != Some(self.recommended.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SettingsReport {
    pub settings: Vec<SettingComparison>,
}

/// Lines up `SHOW <param>` values, keyed by parameter name, against the
/// recommendation. Parameters missing from `current` compare as `None`.
pub fn compare_settings(
    current: &BTreeMap<String, String>,
    recommended: &MemorySettings,
) -> SettingsReport {
    let settings = recommended
        .entries()
        .into_iter()
        .map(|(parameter, recommended)| SettingComparison {
            parameter,
            current: current.get(parameter).map(|value| value.trim().to_string()),
            recommended,
        })
        .collect();
    SettingsReport { settings }
}
