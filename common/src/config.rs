use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::err::{CResult, CacheError};

/// Key type of a declared index column (spec §3.2/§6.4).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeyType {
    Int,
    String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexSpec {
    pub id: u8,
    pub column: String,
    #[serde(rename = "type")]
    pub key_type: KeyType,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableSpec {
    pub name: String,
    pub id: u8,
    pub period_seconds: u64,
    pub select_text: String,
    pub indexes: Vec<IndexSpec>,
}

/// Database driver selection and connection parameters. The core treats
/// this opaquely; a `RowSource` implementation interprets it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DbConfig {
    pub driver: String,
    pub dsn: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListenConfig {
    pub tcp_host: Option<String>,
    pub tcp_port: Option<u16>,
    pub unix_path: Option<String>,
    #[serde(default = "default_backlog")]
    pub backlog: u32,
}

fn default_backlog() -> u32 {
    128
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceCaps {
    #[serde(default = "default_max_key_len")]
    pub max_key_len: u32,
    #[serde(default = "default_read_buf_small")]
    pub read_buf_small: u32,
    #[serde(default = "default_write_buf_max")]
    pub write_buf_max: u32,
    #[serde(default = "default_max_indexes_per_table")]
    pub max_indexes_per_table: u8,
    #[serde(default = "default_max_tables")]
    pub max_tables: u16,
    #[serde(default = "default_max_fields_per_row")]
    pub max_fields_per_row: u32,
    #[serde(default = "default_max_field_name_len")]
    pub max_field_name_len: u16,
}

fn default_max_key_len() -> u32 {
    1 << 16
}
fn default_read_buf_small() -> u32 {
    4 * 1024
}
fn default_write_buf_max() -> u32 {
    64 * 1024
}
fn default_max_indexes_per_table() -> u8 {
    16
}
fn default_max_tables() -> u16 {
    64
}
fn default_max_fields_per_row() -> u32 {
    99
}
fn default_max_field_name_len() -> u16 {
    100
}

impl Default for ResourceCaps {
    fn default() -> Self {
        Self {
            max_key_len: default_max_key_len(),
            read_buf_small: default_read_buf_small(),
            write_buf_max: default_write_buf_max(),
            max_indexes_per_table: default_max_indexes_per_table(),
            max_tables: default_max_tables(),
            max_fields_per_row: default_max_fields_per_row(),
            max_field_name_len: default_max_field_name_len(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub db: DbConfig,
    pub listen: ListenConfig,
    #[serde(default = "default_refresh_period")]
    pub default_refresh_period_seconds: u64,
    #[serde(default = "default_cron_period")]
    pub cron_period_seconds: u64,
    #[serde(default)]
    pub strip_nulls: bool,
    #[serde(default)]
    pub caps: ResourceCaps,
    pub tables: Vec<TableSpec>,
}

fn default_refresh_period() -> u64 {
    30
}
fn default_cron_period() -> u64 {
    5
}

impl Config {
    pub fn from_toml_str(s: &str) -> CResult<Self> {
        toml::from_str(s).map_err(|e| CacheError::Config(e.to_string()))
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> CResult<Self> {
        let s = fs::read_to_string(path)?;
        Self::from_toml_str(&s)
    }

    /// Validates the cross-table invariants spec §3.4 requires: unique
    /// table ids in range, at least one index per table, unique index ids
    /// within a table.
    pub fn validate(&self) -> CResult<()> {
        if self.tables.is_empty() {
            return Err(CacheError::Config("no tables configured".to_string()));
        }
        if self.tables.len() > self.caps.max_tables as usize {
            return Err(CacheError::Config(format!(
                "{} tables exceeds max_tables {}",
                self.tables.len(),
                self.caps.max_tables
            )));
        }
        let mut seen_ids = std::collections::HashSet::new();
        for t in &self.tables {
            if !seen_ids.insert(t.id) {
                return Err(CacheError::Config(format!("duplicate table id {}", t.id)));
            }
            if t.indexes.is_empty() {
                return Err(CacheError::Config(format!(
                    "table {} has no indexes",
                    t.name
                )));
            }
            if t.indexes.len() > self.caps.max_indexes_per_table as usize {
                return Err(CacheError::Config(format!(
                    "table {} has too many indexes",
                    t.name
                )));
            }
            let mut seen_index_ids = std::collections::HashSet::new();
            for idx in &t.indexes {
                if !seen_index_ids.insert(idx.id) {
                    return Err(CacheError::Config(format!(
                        "table {} has duplicate index id {}",
                        t.name, idx.id
                    )));
                }
                if idx.column.len() > self.caps.max_field_name_len as usize {
                    return Err(CacheError::Config(format!(
                        "table {} index column name too long",
                        t.name
                    )));
                }
            }
        }
        if self.listen.tcp_port.is_none() && self.listen.unix_path.is_none() {
            return Err(CacheError::Config(
                "at least one of tcp_port or unix_path must be configured".to_string(),
            ));
        }
        Ok(())
    }
}
