//! One configured table's snapshot and refresh driver (spec §3.3, §4.3).

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, Ordering};

use arena::{Arena, FrozenArena};
use common::config::{IndexSpec, KeyType, ResourceCaps, TableSpec};
use common::err::{CResult, CacheError};
use futures_util::StreamExt;
use hashindex::{capacity_for_row_count, HashIndex, HashIndexBuilder};
use protocol::{encode_row, Field, Row, Value};
use tracing::{debug, info, warn};

use crate::snapshot::TableSnapshot;
use crate::source::RowSource;

/// Defensive ceiling on a single refresh's row count, beyond which the
/// hash capacity computation could overflow `usize` on 32-bit targets.
const MAX_ROW_COUNT: u32 = 8_000_000;

/// One of the table's two (conceptually) double-buffered slots, modeled
/// here as the value type published through a `TableSnapshot`.
pub struct TableSlot {
    pub arena: FrozenArena,
    pub indexes: HashMap<u8, HashIndex>,
}

impl TableSlot {
    fn empty() -> Self {
        TableSlot {
            arena: Arena::new().finalize(),
            indexes: HashMap::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct TableCounters {
    pub rows: u32,
    pub min_id: Option<i64>,
    pub max_id: Option<i64>,
    pub last_loaded_unix: i64,
}

pub struct TableState {
    pub spec: TableSpec,
    snapshot: TableSnapshot<TableSlot>,
    last_loaded: AtomicI64,
    rows: AtomicU32,
    min_id: AtomicI64,
    max_id: AtomicI64,
    has_min_max: AtomicBool,
}

fn key_bytes_for(row: &Row, idx_spec: &IndexSpec) -> Option<Vec<u8>> {
    let field = row.fields.iter().find(|f| f.name == idx_spec.column)?;
    match (idx_spec.key_type, &field.value) {
        (KeyType::Int, Value::Int64(v)) => i32::try_from(*v).ok().map(|v| v.to_le_bytes().to_vec()),
        (KeyType::String, Value::Bytes(b)) => Some(b.clone()),
        _ => None,
    }
}

fn validate_row(row: &Row, caps: &ResourceCaps) -> CResult<()> {
    if row.fields.len() > caps.max_fields_per_row as usize {
        return Err(CacheError::Protocol(format!(
            "row has {} fields, exceeds max_fields_per_row {}",
            row.fields.len(),
            caps.max_fields_per_row
        )));
    }
    for field in &row.fields {
        if field.name.len() > caps.max_field_name_len as usize {
            return Err(CacheError::Protocol(format!(
                "field name {:?} exceeds max_field_name_len {}",
                field.name, caps.max_field_name_len
            )));
        }
    }
    Ok(())
}

impl TableState {
    pub fn new(spec: TableSpec) -> Self {
        TableState {
            spec,
            snapshot: TableSnapshot::new(TableSlot::empty()),
            last_loaded: AtomicI64::new(0),
            rows: AtomicU32::new(0),
            min_id: AtomicI64::new(0),
            max_id: AtomicI64::new(0),
            has_min_max: AtomicBool::new(false),
        }
    }

    /// `load_from_db(now, do_load=false)`: refresh-eligibility test.
    pub fn needs_refresh(&self, now: i64) -> bool {
        let last = self.last_loaded.load(Ordering::Relaxed);
        now - last >= self.spec.period_seconds as i64
    }

    pub fn fetch(&self, index_id: u8, key: &[u8]) -> Option<hashindex::Hit> {
        let slot = self.snapshot.load();
        slot.indexes.get(&index_id)?.get(key)
    }

    pub fn counters(&self) -> TableCounters {
        TableCounters {
            rows: self.rows.load(Ordering::Relaxed),
            min_id: self
                .has_min_max
                .load(Ordering::Relaxed)
                .then(|| self.min_id.load(Ordering::Relaxed)),
            max_id: self
                .has_min_max
                .load(Ordering::Relaxed)
                .then(|| self.max_id.load(Ordering::Relaxed)),
            last_loaded_unix: self.last_loaded.load(Ordering::Relaxed),
        }
    }

    /// Returns `(capacity_bytes, used_bytes)` for the currently published
    /// arena slot.
    pub fn arena_stats(&self) -> (usize, usize) {
        let slot = self.snapshot.load();
        (slot.arena.capacity(), slot.arena.len())
    }

    /// Per-index probe/occupancy snapshot, keyed by the index's configured
    /// column name (spec §6.1's `hashes` map key).
    pub fn index_stats(&self) -> Vec<(String, hashindex::ProbeSnapshot, usize, usize)> {
        let slot = self.snapshot.load();
        self.spec
            .indexes
            .iter()
            .filter_map(|idx| {
                slot.indexes
                    .get(&idx.id)
                    .map(|h| (idx.column.clone(), h.probe_snapshot(), h.capacity(), h.len()))
            })
            .collect()
    }

    /// `load_from_db(now, do_load=true)`: builds a fresh slot from
    /// `source` and publishes it. Any hard error aborts the refresh and
    /// leaves the previous slot current (spec §4.3, §7 `RefreshFailure`).
    /// Arena exhaustion (`CacheError::Allocation`) is propagated as-is
    /// rather than folded into `RefreshFailure`, since it is fatal (spec
    /// §7) and the caller needs to tell it apart from a retryable source
    /// error.
    pub async fn refresh(
        &self,
        source: &dyn RowSource,
        caps: &ResourceCaps,
        strip_nulls: bool,
        now: i64,
    ) -> CResult<()> {
        let row_count = source.count_rows(&self.spec).await.map_err(|e| {
            CacheError::RefreshFailure {
                table: self.spec.name.clone(),
                reason: e.to_string(),
            }
        })?;
        if row_count > MAX_ROW_COUNT {
            warn!(table = %self.spec.name, row_count, "row count exceeds sanity cap, skipping refresh");
            return Ok(());
        }

        let capacity = capacity_for_row_count(row_count as usize);
        let mut arena = Arena::new();
        let mut builders: HashMap<u8, HashIndexBuilder> = self
            .spec
            .indexes
            .iter()
            .map(|idx| (idx.id, HashIndexBuilder::with_capacity(capacity)))
            .collect();

        let primary = self.spec.indexes.first().cloned();
        let mut min_id: Option<i64> = None;
        let mut max_id: Option<i64> = None;
        let mut loaded_rows = 0u32;

        let mut stream = source.iterate_rows(&self.spec).await.map_err(|e| CacheError::RefreshFailure {
            table: self.spec.name.clone(),
            reason: e.to_string(),
        })?;

        while let Some(row_result) = stream.next().await {
            let row = match row_result {
                Ok(r) => r,
                Err(e) => {
                    debug!(table = %self.spec.name, error = %e, "row decode failed, skipping row");
                    continue;
                }
            };
            if let Err(e) = validate_row(&row, caps) {
                debug!(table = %self.spec.name, error = %e, "row failed validation, skipping row");
                continue;
            }

            let encoded = if strip_nulls {
                let stripped: Vec<Field> = row
                    .fields
                    .iter()
                    .filter(|f| !matches!(f.value, Value::Null))
                    .cloned()
                    .collect();
                encode_row(&Row::new(stripped))
            } else {
                encode_row(&row)
            };
            let payload_offset = arena.store_framed(&encoded)?;
            let payload_len = 4 + encoded.len() as u32;

            let mut keys_by_index = Vec::with_capacity(self.spec.indexes.len());
            let mut row_ok = true;
            for idx_spec in &self.spec.indexes {
                match key_bytes_for(&row, idx_spec) {
                    Some(k) => keys_by_index.push((idx_spec.id, k)),
                    None => {
                        row_ok = false;
                        break;
                    }
                }
            }
            if !row_ok {
                debug!(table = %self.spec.name, "row missing a configured index column, skipping row");
                continue;
            }

            for (index_id, key) in &keys_by_index {
                let builder = builders.get_mut(index_id).expect("builder exists for every configured index");
                builder.insert(&mut arena, key, payload_offset, payload_len)?;
            }

            if let Some(primary) = &primary {
                if primary.key_type == KeyType::Int {
                    if let Some(field) = row.fields.iter().find(|f| f.name == primary.column) {
                        if let Value::Int64(v) = field.value {
                            min_id = Some(min_id.map_or(v, |m| m.min(v)));
                            max_id = Some(max_id.map_or(v, |m| m.max(v)));
                        }
                    }
                }
            }

            loaded_rows += 1;
        }

        let frozen = arena.finalize();
        let indexes: HashMap<u8, HashIndex> = builders
            .into_iter()
            .map(|(id, builder)| (id, builder.finalize(&frozen)))
            .collect();

        self.snapshot.publish(TableSlot {
            arena: frozen,
            indexes,
        });
        self.last_loaded.store(now, Ordering::Relaxed);
        self.rows.store(loaded_rows, Ordering::Relaxed);
        if let (Some(min_id), Some(max_id)) = (min_id, max_id) {
            self.min_id.store(min_id, Ordering::Relaxed);
            self.max_id.store(max_id, Ordering::Relaxed);
            self.has_min_max.store(true, Ordering::Relaxed);
        }
        info!(table = %self.spec.name, rows = loaded_rows, "refresh complete");
        Ok(())
    }
}
