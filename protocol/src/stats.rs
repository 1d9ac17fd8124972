//! GET_STATISTICS response body builder (spec §6.1, supplemented per
//! `SPEC_FULL.md`'s host/process info section).

use serde::Serialize;

#[derive(Debug, Clone, Serialize)]
pub struct HostInfo {
    pub hostname: String,
    pub pid: u32,
}

#[derive(Debug, Clone, Serialize)]
pub struct SoftwareInfo {
    pub version: String,
    pub protocol_version: u8,
}

#[derive(Debug, Clone, Serialize)]
pub struct ConfigEcho {
    pub default_refresh_period_seconds: u64,
    pub cron_period_seconds: u64,
    pub max_key_len: u32,
}

#[derive(Debug, Clone, Serialize)]
pub struct ArenaStats {
    pub capacity_bytes: usize,
    pub used_bytes: usize,
    pub free_bytes: usize,
    pub row_avg_size_bytes: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct HashStats {
    pub total_slots: usize,
    pub used_slots: usize,
    pub free_slots: usize,
    pub fill_factor_perc: f64,
    pub queries: u64,
    pub probes: u64,
    pub probes_per_query_avg: f64,
    pub probes_p50: u32,
    pub probes_p95: u32,
    pub probes_p99: u32,
}

#[derive(Debug, Clone, Serialize)]
pub struct TableStats {
    pub id: u8,
    pub period: u64,
    pub rows: u32,
    pub min_id: Option<i64>,
    pub max_id: Option<i64>,
    pub last_loaded: i64,
    pub arena: ArenaStats,
    /// Keyed by the indexed column name, not by index id: operators read
    /// this document by the column they configured, not its internal id.
    pub hashes: std::collections::BTreeMap<String, HashStats>,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatsDocument {
    pub host: HostInfo,
    pub software: SoftwareInfo,
    pub config: ConfigEcho,
    pub uptime_seconds: u64,
    pub tables: std::collections::BTreeMap<String, TableStats>,
}

impl StatsDocument {
    pub fn to_json_bytes(&self) -> Vec<u8> {
        serde_json::to_vec(self).expect("stats document is always serializable")
    }
}
