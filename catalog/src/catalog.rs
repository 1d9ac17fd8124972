//! Dense table-id lookup and cached schema/stats JSON (spec §3.4, §4.8).

use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use common::config::{Config, KeyType};
use common::err::CResult;
use hashindex::Hit;
use protocol::schema::{IndexDescriptor, KeyTypeName, SchemaDocument, TableDescriptor};
use protocol::stats::{ArenaStats, ConfigEcho, HashStats, HostInfo, SoftwareInfo, StatsDocument, TableStats};
use protocol::PROTOCOL_VERSION;

use crate::table::TableState;

const TABLE_SLOTS: usize = 256;

pub struct Catalog {
    config: Config,
    tables_by_id: Vec<Option<Arc<TableState>>>,
    ordered: Vec<Arc<TableState>>,
    schema_json: Bytes,
    started_at: Instant,
}

fn key_type_name(k: KeyType) -> KeyTypeName {
    match k {
        KeyType::Int => KeyTypeName::Int,
        KeyType::String => KeyTypeName::String,
    }
}

impl Catalog {
    /// Builds a catalog from a validated `Config`. Every table starts with
    /// an empty slot; the caller is expected to drive an initial refresh
    /// (via `Cron` or directly) before serving traffic.
    pub fn new(config: Config) -> CResult<Self> {
        config.validate()?;
        let mut tables_by_id: Vec<Option<Arc<TableState>>> = (0..TABLE_SLOTS).map(|_| None).collect();
        let mut ordered = Vec::with_capacity(config.tables.len());

        for spec in &config.tables {
            let state = Arc::new(TableState::new(spec.clone()));
            tables_by_id[spec.id as usize] = Some(state.clone());
            ordered.push(state);
        }

        let schema_json = Bytes::from(build_schema_json(&config));

        Ok(Catalog {
            config,
            tables_by_id,
            ordered,
            schema_json,
            started_at: Instant::now(),
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn tables(&self) -> &[Arc<TableState>] {
        &self.ordered
    }

    pub fn table(&self, table_id: u8) -> Option<&Arc<TableState>> {
        self.tables_by_id[table_id as usize].as_ref()
    }

    pub fn fetch(&self, table_id: u8, index_id: u8, key: &[u8]) -> Option<Hit> {
        self.table(table_id)?.fetch(index_id, key)
    }

    /// Immutable since construction; DESCRIBE_SCHEMA serves this by
    /// reference (spec §4.8).
    pub fn schema_json(&self) -> Bytes {
        self.schema_json.clone()
    }

    /// Rebuilt on demand for GET_STATISTICS (spec §4.8, §6.1).
    pub fn stats_json(&self) -> CResult<Bytes> {
        let mut tables = std::collections::BTreeMap::new();
        for table in &self.ordered {
            let counters = table.counters();
            let (capacity_bytes, used_bytes) = table.arena_stats();
            let row_avg_size_bytes = if counters.rows == 0 {
                0.0
            } else {
                used_bytes as f64 / counters.rows as f64
            };

            let hashes = table
                .index_stats()
                .into_iter()
                .map(|(column, snap, capacity, len)| {
                    (
                        column,
                        HashStats {
                            total_slots: capacity,
                            used_slots: len,
                            free_slots: capacity - len,
                            fill_factor_perc: if capacity == 0 { 0.0 } else { len as f64 / capacity as f64 * 100.0 },
                            queries: snap.queries,
                            probes: snap.probes_total,
                            probes_per_query_avg: snap.probes_per_query_avg(),
                            probes_p50: snap.p50,
                            probes_p95: snap.p95,
                            probes_p99: snap.p99,
                        },
                    )
                })
                .collect();

            tables.insert(
                table.spec.name.clone(),
                TableStats {
                    id: table.spec.id,
                    period: table.spec.period_seconds,
                    rows: counters.rows,
                    min_id: counters.min_id,
                    max_id: counters.max_id,
                    last_loaded: counters.last_loaded_unix,
                    arena: ArenaStats {
                        capacity_bytes,
                        used_bytes,
                        free_bytes: capacity_bytes - used_bytes,
                        row_avg_size_bytes,
                    },
                    hashes,
                },
            );
        }

        let doc = StatsDocument {
            host: HostInfo {
                hostname: std::env::var("HOSTNAME").unwrap_or_else(|_| "unknown".to_string()),
                pid: std::process::id(),
            },
            software: SoftwareInfo {
                version: env!("CARGO_PKG_VERSION").to_string(),
                protocol_version: PROTOCOL_VERSION,
            },
            config: ConfigEcho {
                default_refresh_period_seconds: self.config.default_refresh_period_seconds,
                cron_period_seconds: self.config.cron_period_seconds,
                max_key_len: self.config.caps.max_key_len,
            },
            uptime_seconds: self.started_at.elapsed().as_secs(),
            tables,
        };
        Ok(Bytes::from(doc.to_json_bytes()))
    }
}

fn build_schema_json(config: &Config) -> Vec<u8> {
    let tables = config
        .tables
        .iter()
        .map(|t| TableDescriptor {
            id: t.id,
            name: t.name.clone(),
            period: t.period_seconds,
            indexes: t
                .indexes
                .iter()
                .map(|idx| IndexDescriptor {
                    id: idx.id,
                    column: idx.column.clone(),
                    key_type: key_type_name(idx.key_type),
                })
                .collect(),
        })
        .collect();
    SchemaDocument { tables }.to_json_bytes()
}

#[cfg(test)]
mod test {
    use super::*;
    use common::config::{DbConfig, IndexSpec, ListenConfig, ResourceCaps, TableSpec};

    fn sample_config() -> Config {
        Config {
            db: DbConfig {
                driver: "mysql".to_string(),
                dsn: "mysql://localhost/app".to_string(),
            },
            listen: ListenConfig {
                tcp_host: Some("0.0.0.0".to_string()),
                tcp_port: Some(6033),
                unix_path: None,
                backlog: 128,
            },
            default_refresh_period_seconds: 30,
            cron_period_seconds: 5,
            strip_nulls: false,
            caps: ResourceCaps::default(),
            tables: vec![TableSpec {
                name: "accounts".to_string(),
                id: 0,
                period_seconds: 30,
                select_text: "select id from accounts".to_string(),
                indexes: vec![IndexSpec {
                    id: 0,
                    column: "id".to_string(),
                    key_type: KeyType::Int,
                }],
            }],
        }
    }

    #[test]
    fn schema_json_describes_configured_tables() {
        let catalog = Catalog::new(sample_config()).unwrap();
        let value: serde_json::Value = serde_json::from_slice(&catalog.schema_json()).unwrap();
        assert_eq!(value["tables"][0]["name"], "accounts");
    }

    #[test]
    fn fetch_on_empty_table_is_a_miss() {
        let catalog = Catalog::new(sample_config()).unwrap();
        assert!(catalog.fetch(0, 0, b"anything").is_none());
    }

    #[test]
    fn fetch_on_unconfigured_table_id_is_a_miss() {
        let catalog = Catalog::new(sample_config()).unwrap();
        assert!(catalog.fetch(200, 0, b"anything").is_none());
    }

    #[test]
    fn stats_json_includes_table_counters() {
        let catalog = Catalog::new(sample_config()).unwrap();
        let value: serde_json::Value = serde_json::from_slice(&catalog.stats_json().unwrap()).unwrap();
        assert_eq!(value["tables"]["accounts"]["rows"], 0);
        assert_eq!(value["software"]["protocol_version"], 0x11);
    }

    #[test]
    fn stats_json_has_nested_arena_and_hashes_shape() {
        let catalog = Catalog::new(sample_config()).unwrap();
        let value: serde_json::Value = serde_json::from_slice(&catalog.stats_json().unwrap()).unwrap();
        let accounts = &value["tables"]["accounts"];
        assert_eq!(accounts["id"], 0);
        assert_eq!(accounts["period"], 30);
        assert!(accounts["arena"]["capacity_bytes"].is_number());
        assert!(accounts["arena"]["used_bytes"].is_number());
        assert!(accounts["arena"]["free_bytes"].is_number());
        assert_eq!(accounts["hashes"]["id"]["total_slots"].as_u64().unwrap() > 0, true);
        assert!(accounts["hashes"]["id"]["fill_factor_perc"].is_number());
        assert!(accounts["hashes"].get("indexes").is_none());
    }
}
