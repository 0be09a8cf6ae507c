//! The paged KV pool: a request-to-token lookup table plus a slot allocator.
//!
//! Both the draft and target workers share one allocator and one
//! request-to-token table (spec §5); each writes only to the slot ranges it
//! owns. This module models that shared state as a single-owner type
//! (`PagedKvAllocator` trait + `RequestToTokenTable`) that callers hold
//! behind a lease, never a copy — see `Worker` in `crate::worker`.

mod allocator;
pub mod layout;

pub use allocator::BumpPagedKvAllocator;

use crate::error::Result;

/// Opaque checkpoint returned by `PagedKvAllocator::backup_state`. Two
/// tokens compare equal iff the allocator's full internal state was
/// identical at the moment each was taken (spec §8, testable property 7).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AllocatorStateToken {
    pub(crate) watermark: i64,
    pub(crate) free_list: Vec<i64>,
}

/// Bridge to the device-side (or, in this crate, host-side bookkeeping)
/// paged KV slot allocator. Slot ids are opaque non-negative integers; the
/// allocator never interprets their placement in any particular storage
/// layout, which is what "paged" or "contiguous" layouts above it
/// (`layout::compute_draft_cache_layout`) reason about.
pub trait PagedKvAllocator: Send + Sync {
    /// Allocates `n` individual slots (`page_size == 1` case, or anywhere a
    /// flat contiguous range is not required). Returns the new slots and,
    /// if `backup_state` is true, a checkpoint to roll back to if the
    /// caller later decides to release everything allocated in this call.
    fn alloc_token_slots(
        &mut self,
        n: usize,
        backup_state: bool,
    ) -> Result<(Vec<i64>, Option<AllocatorStateToken>)>;

    /// Allocates `n` slots for a paged extend. `prefix_lens`/`seq_lens`/
    /// `last_loc` describe the logical extend being performed (spec §4.2)
    /// so a real paged allocator can preserve page alignment; this crate's
    /// bridge implementation (`BumpPagedKvAllocator`) only needs `n` since
    /// it does not model physical page frames, but keeps the full
    /// signature so alternative allocators can use the context.
    fn alloc_paged_token_slots_extend(
        &mut self,
        prefix_lens: &[i64],
        seq_lens: &[i64],
        last_loc: &[i64],
        n: usize,
        backup_state: bool,
    ) -> Result<(Vec<i64>, Option<AllocatorStateToken>)>;

    /// Takes a checkpoint without allocating.
    fn backup_state(&mut self) -> AllocatorStateToken;

    /// Releases every slot allocated since `token` was taken. After this
    /// call the allocator's state must be byte-equal to the state at the
    /// time `token` was produced (spec §8, property 7).
    fn restore_state(&mut self, token: AllocatorStateToken) -> Result<()>;

    /// Returns `slots` to the free pool.
    fn free(&mut self, slots: &[i64]);
}

/// Maps `(req_pool_index, position) -> cache_slot` for committed tokens
/// only (spec §3). Speculative, not-yet-verified slot assignments live in
/// the flat `out_cache_loc` buffers passed between `DraftLoop`,
/// `TreeBuilder`, and `Verifier`; they are never written here until a
/// verification step accepts them.
#[derive(Debug, Default, Clone)]
pub struct RequestToTokenTable {
    rows: Vec<Vec<i64>>,
}

impl RequestToTokenTable {
    pub fn new() -> Self {
        Self::default()
    }

    fn ensure_row(&mut self, req_pool_index: usize) -> &mut Vec<i64> {
        if req_pool_index >= self.rows.len() {
            self.rows.resize_with(req_pool_index + 1, Vec::new);
        }
        &mut self.rows[req_pool_index]
    }

    /// The slot committed at `(req_pool_index, position)`, or `None` if
    /// nothing has been written there yet (spec invariant 1 requires this
    /// to be `Some` for every position in `[0, seq_len)`).
    pub fn get(&self, req_pool_index: usize, position: usize) -> Option<i64> {
        self.rows.get(req_pool_index)?.get(position).copied()
    }

    /// The slot id of the last committed token before `prefix_len`, i.e.
    /// `(req_pool_index, prefix_len - 1)`. Used by `DraftCacheLayout` to
    /// locate the trailing partial page of an existing sequence.
    pub fn last_loc(&self, req_pool_index: usize, prefix_len: i64) -> i64 {
        assert!(prefix_len > 0, "last_loc requires a non-empty prefix");
        self.get(req_pool_index, (prefix_len - 1) as usize)
            .expect("request-to-token invariant: every position below seq_len must be allocated")
    }

    /// Commits `slots` at consecutive positions starting at `start_pos` for
    /// `req_pool_index`. Used after verification to write accepted tokens
    /// (spec invariant 2).
    pub fn commit(&mut self, req_pool_index: usize, start_pos: usize, slots: &[i64]) {
        let row = self.ensure_row(req_pool_index);
        if row.len() < start_pos + slots.len() {
            row.resize(start_pos + slots.len(), -1);
        }
        row[start_pos..start_pos + slots.len()].copy_from_slice(slots);
    }

    pub fn seq_len(&self, req_pool_index: usize) -> usize {
        self.rows.get(req_pool_index).map_or(0, Vec::len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn commit_then_last_loc_round_trips() {
        let mut table = RequestToTokenTable::new();
        table.commit(0, 0, &[10, 11, 12]);
        assert_eq!(table.last_loc(0, 3), 12);
        assert_eq!(table.seq_len(0), 3);
    }

    #[test]
    fn append_after_initial_commit() {
        let mut table = RequestToTokenTable::new();
        table.commit(2, 0, &[5, 6]);
        table.commit(2, 2, &[7]);
        assert_eq!(table.get(2, 0), Some(5));
        assert_eq!(table.get(2, 2), Some(7));
        assert_eq!(table.seq_len(2), 3);
    }
}
