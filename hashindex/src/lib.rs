//! Open-addressed, linear-probe hash map from variable-length key to a
//! framed payload reference, backed by an `Arena` (spec §3.2, §4.2).
//!
//! `HashIndexBuilder` is the build-phase counterpart: it stores keys via
//! `Arena::store` and keeps arena offsets as placeholder references.
//! `finalize` converts those offsets into `Bytes` slices of the frozen
//! arena, the safe-Rust collapse of "index placeholder" into "pointer"
//! the design notes call for.

use std::hash::Hasher;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use arena::{Arena, FrozenArena};
use bytes::Bytes;
use common::err::{CResult, CacheError};
use fnv::FnvHasher;

const HISTOGRAM_BUCKETS: usize = 64;
const MIN_CAPACITY: usize = 16;

fn next_pow2(n: usize) -> usize {
    n.max(1).next_power_of_two()
}

/// Capacity policy from spec §4.2: keep load factor <= 0.5.
pub fn capacity_for_row_count(row_count: usize) -> usize {
    next_pow2((2 * row_count).max(MIN_CAPACITY))
}

fn hash_key(key: &[u8]) -> u64 {
    let mut h = FnvHasher::default();
    h.write(key);
    h.finish()
}

struct BuildBucket {
    hash: u64,
    key_len: u32,
    key_offset: u32,
    payload_offset: u32,
    payload_len: u32,
}

/// Build-phase hash index: entries reference arena offsets, not yet
/// resolved to stable byte slices.
pub struct HashIndexBuilder {
    buckets: Vec<Option<BuildBucket>>,
    mask: usize,
    len: usize,
}

impl HashIndexBuilder {
    pub fn with_capacity(capacity: usize) -> Self {
        let cap = next_pow2(capacity.max(MIN_CAPACITY));
        let mut buckets = Vec::with_capacity(cap);
        buckets.resize_with(cap, || None);
        HashIndexBuilder {
            buckets,
            mask: cap - 1,
            len: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.mask + 1
    }

    pub fn len(&self) -> usize {
        self.len
    }

    /// Stores `key` in `arena` and inserts a bucket pointing at
    /// `(payload_offset, payload_len)`, an already-framed slice of the same
    /// arena. Fails only if the hash is completely full, which a caller
    /// sized via `capacity_for_row_count` should never hit.
    pub fn insert(
        &mut self,
        arena: &mut Arena,
        key: &[u8],
        payload_offset: u32,
        payload_len: u32,
    ) -> CResult<()> {
        if self.len >= self.buckets.len() {
            return Err(CacheError::Allocation(
                "hash index full: caller undersized capacity".to_string(),
            ));
        }
        let hash = hash_key(key);
        let key_offset = arena.store(key)?;
        let mut idx = (hash as usize) & self.mask;
        loop {
            if self.buckets[idx].is_none() {
                self.buckets[idx] = Some(BuildBucket {
                    hash,
                    key_len: key.len() as u32,
                    key_offset,
                    payload_offset,
                    payload_len,
                });
                self.len += 1;
                return Ok(());
            }
            idx = (idx + 1) & self.mask;
        }
    }

    /// Converts every occupied bucket's arena offsets into `Bytes` slices
    /// of the now-frozen arena.
    pub fn finalize(self, frozen: &FrozenArena) -> HashIndex {
        let buckets = self
            .buckets
            .into_iter()
            .map(|b| {
                b.map(|b| Bucket {
                    hash: b.hash,
                    key: frozen.slice(b.key_offset, b.key_len),
                    payload: frozen.slice(b.payload_offset, b.payload_len),
                })
            })
            .collect();
        HashIndex {
            buckets,
            mask: self.mask,
            len: self.len,
            stats: ProbeStats::new(),
        }
    }
}

struct Bucket {
    hash: u64,
    key: Bytes,
    payload: Bytes,
}

pub struct Hit {
    /// The framed payload: 4-byte big-endian length followed by the
    /// encoded row. This is exactly the wire response body for a FETCH hit.
    pub payload: Bytes,
}

struct ProbeStats {
    queries: AtomicU64,
    probes_total: AtomicU64,
    histogram: [AtomicU32; HISTOGRAM_BUCKETS],
}

impl ProbeStats {
    fn new() -> Self {
        ProbeStats {
            queries: AtomicU64::new(0),
            probes_total: AtomicU64::new(0),
            histogram: std::array::from_fn(|_| AtomicU32::new(0)),
        }
    }

    fn record(&self, probes: usize) {
        self.queries.fetch_add(1, Ordering::Relaxed);
        self.probes_total.fetch_add(probes as u64, Ordering::Relaxed);
        let bucket = probes.min(HISTOGRAM_BUCKETS - 1);
        self.histogram[bucket].fetch_add(1, Ordering::Relaxed);
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ProbeSnapshot {
    pub queries: u64,
    pub probes_total: u64,
    pub p50: u32,
    pub p95: u32,
    pub p99: u32,
}

impl ProbeSnapshot {
    pub fn probes_per_query_avg(&self) -> f64 {
        if self.queries == 0 {
            0.0
        } else {
            self.probes_total as f64 / self.queries as f64
        }
    }
}

/// Finalized, read-only hash index. Safe for concurrent lookups: `get`
/// only reads `buckets` and atomically updates the probe histogram.
pub struct HashIndex {
    buckets: Vec<Option<Bucket>>,
    mask: usize,
    len: usize,
    stats: ProbeStats,
}

impl HashIndex {
    pub fn capacity(&self) -> usize {
        self.mask + 1
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn fill_factor(&self) -> f64 {
        self.len as f64 / self.capacity() as f64
    }

    /// Probes linearly for `key`, stopping at the first empty bucket
    /// (miss) or a hash+length+byte match (hit). Probe count is bounded by
    /// `len + 1` (spec §8) and is recorded for the stats histogram.
    pub fn get(&self, key: &[u8]) -> Option<Hit> {
        if self.buckets.is_empty() {
            return None;
        }
        let hash = hash_key(key);
        let mut idx = (hash as usize) & self.mask;
        let mut probes = 0usize;
        loop {
            probes += 1;
            match &self.buckets[idx] {
                None => {
                    self.stats.record(probes);
                    return None;
                }
                Some(b) => {
                    if b.hash == hash && b.key.len() == key.len() && b.key.as_ref() == key {
                        self.stats.record(probes);
                        return Some(Hit {
                            payload: b.payload.clone(),
                        });
                    }
                }
            }
            idx = (idx + 1) & self.mask;
            if probes > self.buckets.len() {
                // Defensive: should be unreachable given load factor <= 0.5.
                self.stats.record(probes);
                return None;
            }
        }
    }

    pub fn probe_snapshot(&self) -> ProbeSnapshot {
        let queries = self.stats.queries.load(Ordering::Relaxed);
        let probes_total = self.stats.probes_total.load(Ordering::Relaxed);
        let counts: Vec<u64> = self
            .stats
            .histogram
            .iter()
            .map(|c| c.load(Ordering::Relaxed) as u64)
            .collect();
        let total: u64 = counts.iter().sum();
        let percentile = |p: f64| -> u32 {
            if total == 0 {
                return 0;
            }
            let target = (p * total as f64).ceil() as u64;
            let mut cumulative = 0u64;
            for (i, c) in counts.iter().enumerate() {
                cumulative += c;
                if cumulative >= target {
                    return i as u32;
                }
            }
            (HISTOGRAM_BUCKETS - 1) as u32
        };
        ProbeSnapshot {
            queries,
            probes_total,
            p50: percentile(0.50),
            p95: percentile(0.95),
            p99: percentile(0.99),
        }
    }
}
