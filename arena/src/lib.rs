//! Append-only byte region with bump allocation (spec §3.1, §4.1).
//!
//! `Arena` is the mutable build-phase: `store`/`store_framed` append and
//! return indices, `reset` rewinds the write cursor without releasing
//! storage. `finalize` freezes the backing buffer into a `FrozenArena`,
//! whose `Bytes` slices are cheap, refcounted, zero-copy references into
//! the same storage, the safe-Rust equivalent of collapsing arena indices
//! into pointers (spec §9, "Arena indices vs. pointers").

use bytes::{BufMut, Bytes, BytesMut};
use common::err::{CResult, CacheError};
use tracing::warn;

const MIN_CAPACITY: usize = 4 * 1024;
/// Platform sanity cap: refuse to grow past 1 GiB for a single table slot.
const MAX_CAPACITY: usize = 1 << 30;

fn next_pow2(n: usize) -> usize {
    if n <= 1 {
        return 1;
    }
    n.next_power_of_two()
}

pub struct Arena {
    buf: BytesMut,
    capacity: usize,
}

impl Arena {
    pub fn new() -> Self {
        Self::with_capacity(MIN_CAPACITY)
    }

    pub fn with_capacity(initial: usize) -> Self {
        let capacity = next_pow2(initial.max(1)).max(MIN_CAPACITY);
        Arena {
            buf: BytesMut::with_capacity(capacity),
            capacity,
        }
    }

    pub fn used(&self) -> usize {
        self.buf.len()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    fn ensure_capacity(&mut self, additional: usize) -> CResult<()> {
        let needed = self.buf.len() + additional;
        if needed <= self.capacity {
            return Ok(());
        }
        let new_cap = next_pow2(needed);
        if new_cap > MAX_CAPACITY {
            warn!("arena growth to {} exceeds sanity cap {}", new_cap, MAX_CAPACITY);
            return Err(CacheError::Allocation(format!(
                "requested capacity {new_cap} exceeds {MAX_CAPACITY}"
            )));
        }
        self.buf.reserve(new_cap - self.buf.len());
        self.capacity = new_cap;
        Ok(())
    }

    /// Copies `src` to the tail, growing if needed. Returns the offset at
    /// which the bytes were placed.
    pub fn store(&mut self, src: &[u8]) -> CResult<u32> {
        self.ensure_capacity(src.len())?;
        let offset = self.buf.len() as u32;
        self.buf.extend_from_slice(src);
        Ok(offset)
    }

    /// Writes a 4-byte big-endian length header followed by `src`. Returns
    /// the offset of the header; this is the exact on-wire FETCH payload
    /// layout (spec §4.1, §6.1).
    pub fn store_framed(&mut self, src: &[u8]) -> CResult<u32> {
        self.ensure_capacity(4 + src.len())?;
        let offset = self.buf.len() as u32;
        self.buf.put_u32(src.len() as u32);
        self.buf.extend_from_slice(src);
        Ok(offset)
    }

    /// Rewinds the write cursor to zero without releasing storage.
    pub fn reset(&mut self) {
        self.buf.clear();
    }

    /// Freezes the arena. After this, indices handed out by `store`/
    /// `store_framed` are valid offsets into the returned `FrozenArena` for
    /// as long as it lives.
    pub fn finalize(self) -> FrozenArena {
        FrozenArena {
            bytes: self.buf.freeze(),
            capacity: self.capacity,
        }
    }
}

impl Default for Arena {
    fn default() -> Self {
        Self::new()
    }
}

/// Read-only, finalized arena. Slicing is O(1) and refcounted; callers get
/// zero-copy references into the same backing storage.
#[derive(Clone)]
pub struct FrozenArena {
    bytes: Bytes,
    capacity: usize,
}

impl FrozenArena {
    pub fn empty() -> Self {
        FrozenArena {
            bytes: Bytes::new(),
            capacity: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    /// Bytes reserved for this arena before it was finalized, i.e. the
    /// high-water mark of `Arena::ensure_capacity`'s doublings. Always
    /// `>= len()`; the gap is free space this table slot will not reclaim
    /// until its next refresh builds a fresh arena.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Returns the raw slice `[offset, offset+len)`.
    pub fn get(&self, offset: u32, len: u32) -> &[u8] {
        let start = offset as usize;
        let end = start + len as usize;
        &self.bytes[start..end]
    }

    /// Returns a cheap, refcounted clone of `[offset, offset+len)`.
    pub fn slice(&self, offset: u32, len: u32) -> Bytes {
        let start = offset as usize;
        let end = start + len as usize;
        self.bytes.slice(start..end)
    }

    /// Reads the frame written by `Arena::store_framed` at `offset`: the
    /// 4-byte big-endian length followed by that many bytes. Returns the
    /// *entire* frame (length header included) since that is exactly the
    /// wire payload for a FETCH hit.
    pub fn read_framed(&self, offset: u32) -> Bytes {
        let start = offset as usize;
        let len = u32::from_be_bytes(self.bytes[start..start + 4].try_into().unwrap());
        self.bytes.slice(start..start + 4 + len as usize)
    }
}
