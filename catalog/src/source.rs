//! Database access boundary (spec §4.3, §9 "Row Source").
//!
//! The cache core never speaks to a concrete driver directly; it only
//! calls `RowSource`. Production wiring picks a driver-backed
//! implementation at startup, tests use `VecRowSource`.

use async_trait::async_trait;
use common::config::TableSpec;
use common::err::CResult;
use futures_util::stream::{self, BoxStream};
use protocol::Row;

#[async_trait]
pub trait RowSource: Send + Sync {
    async fn connect(&self) -> CResult<()>;

    async fn disconnect(&self) -> CResult<()>;

    /// Row count for a table's configured `select_text`, used to size the
    /// hash index before the refresh scan begins (spec §4.2).
    async fn count_rows(&self, spec: &TableSpec) -> CResult<u32>;

    /// Streams every row of a table's configured `select_text` in whatever
    /// order the underlying query returns them.
    async fn iterate_rows(&self, spec: &TableSpec) -> CResult<BoxStream<'static, CResult<Row>>>;
}

/// Deterministic, in-memory `RowSource` used by tests and by the reference
/// integration harness. Holds a fixed row set per table name; `connect`/
/// `disconnect` are no-ops so refresh logic can be exercised without a
/// real database driver.
pub struct VecRowSource {
    tables: std::sync::Mutex<std::collections::HashMap<String, Vec<Row>>>,
}

impl VecRowSource {
    pub fn new() -> Self {
        VecRowSource {
            tables: std::sync::Mutex::new(std::collections::HashMap::new()),
        }
    }

    pub fn set_rows(&self, table_name: &str, rows: Vec<Row>) {
        self.tables
            .lock()
            .unwrap()
            .insert(table_name.to_string(), rows);
    }
}

impl Default for VecRowSource {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RowSource for VecRowSource {
    async fn connect(&self) -> CResult<()> {
        Ok(())
    }

    async fn disconnect(&self) -> CResult<()> {
        Ok(())
    }

    async fn count_rows(&self, spec: &TableSpec) -> CResult<u32> {
        let tables = self.tables.lock().unwrap();
        Ok(tables.get(&spec.name).map(|r| r.len() as u32).unwrap_or(0))
    }

    async fn iterate_rows(&self, spec: &TableSpec) -> CResult<BoxStream<'static, CResult<Row>>> {
        let rows = {
            let tables = self.tables.lock().unwrap();
            tables.get(&spec.name).cloned().unwrap_or_default()
        };
        Ok(Box::pin(stream::iter(rows.into_iter().map(Ok))))
    }
}
