//! `BumpPagedKvAllocator`: the bridge implementation of `PagedKvAllocator`
//! kept by this crate in place of the teacher's CUDA-backed
//! `mistralrs-paged-attn` crate (out of scope, see `DESIGN.md`). It is pure
//! bookkeeping over integer slot ids — no device kernel, no physical page
//! frames — matching the spec's own framing of the allocator as something
//! this crate only needs to reason about at the slot-id level (spec §3 "KV
//! pool", §4.2).

use super::{AllocatorStateToken, PagedKvAllocator};
use crate::error::{Result, WorkerError};

/// A bump allocator over a fixed-size slot space with a free list for
/// reclaimed slots. `backup_state`/`restore_state` capture exactly the two
/// numbers that determine everything reachable from the allocator
/// (watermark plus free list contents), so two tokens compare equal iff the
/// allocator's state was identical, which is what spec §8 testable
/// property 7 requires.
pub struct BumpPagedKvAllocator {
    capacity: i64,
    watermark: i64,
    free_list: Vec<i64>,
}

impl BumpPagedKvAllocator {
    pub fn new(capacity: i64) -> Self {
        Self {
            capacity,
            watermark: 0,
            free_list: Vec::new(),
        }
    }

    pub fn available(&self) -> i64 {
        self.capacity - self.watermark + self.free_list.len() as i64
    }

    fn take_n(&mut self, n: usize) -> Option<Vec<i64>> {
        if (self.available() as usize) < n {
            return None;
        }
        let mut slots = Vec::with_capacity(n);
        while slots.len() < n {
            if let Some(slot) = self.free_list.pop() {
                slots.push(slot);
            } else {
                slots.push(self.watermark);
                self.watermark += 1;
            }
        }
        Some(slots)
    }
}

impl PagedKvAllocator for BumpPagedKvAllocator {
    fn alloc_token_slots(
        &mut self,
        n: usize,
        backup_state: bool,
    ) -> Result<(Vec<i64>, Option<AllocatorStateToken>)> {
        let token = backup_state.then(|| self.backup_state());
        match self.take_n(n) {
            Some(slots) => Ok((slots, token)),
            None => Err(WorkerError::Allocator {
                requested: n,
                reason: format!(
                    "requested {n} slots but only {} are available",
                    self.available()
                ),
                backup: token.unwrap_or_else(|| self.backup_state()),
            }),
        }
    }

    fn alloc_paged_token_slots_extend(
        &mut self,
        _prefix_lens: &[i64],
        _seq_lens: &[i64],
        _last_loc: &[i64],
        n: usize,
        backup_state: bool,
    ) -> Result<(Vec<i64>, Option<AllocatorStateToken>)> {
        // This bridge does not model physical page frames (see module
        // docs), so a paged extend allocates exactly like a flat one; a
        // real paged allocator would use `prefix_lens`/`seq_lens`/`last_loc`
        // to keep pages contiguous.
        self.alloc_token_slots(n, backup_state)
    }

    fn backup_state(&mut self) -> AllocatorStateToken {
        AllocatorStateToken {
            watermark: self.watermark,
            free_list: self.free_list.clone(),
        }
    }

    fn restore_state(&mut self, token: AllocatorStateToken) -> Result<()> {
        self.watermark = token.watermark;
        self.free_list = token.free_list;
        Ok(())
    }

    fn free(&mut self, slots: &[i64]) {
        self.free_list.extend_from_slice(slots);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocates_sequential_slots() {
        let mut alloc = BumpPagedKvAllocator::new(10);
        let (slots, _) = alloc.alloc_token_slots(3, false).unwrap();
        assert_eq!(slots, vec![0, 1, 2]);
    }

    #[test]
    fn restore_state_is_byte_equal_to_backup() {
        let mut alloc = BumpPagedKvAllocator::new(10);
        alloc.alloc_token_slots(4, false).unwrap();
        let backup = alloc.backup_state();
        alloc.alloc_token_slots(3, false).unwrap();
        alloc.restore_state(backup.clone()).unwrap();
        assert_eq!(alloc.backup_state(), backup);
    }

    #[test]
    fn exhaustion_is_recoverable_via_backup() {
        let mut alloc = BumpPagedKvAllocator::new(4);
        let backup = alloc.backup_state();
        let err = alloc.alloc_token_slots(5, true).unwrap_err();
        match err {
            WorkerError::Allocator { requested, backup: got, .. } => {
                assert_eq!(requested, 5);
                assert_eq!(got, backup);
            }
            other => panic!("expected allocator error, got {other:?}"),
        }
        // Allocator is untouched by the failed request.
        assert_eq!(alloc.backup_state(), backup);
    }

    #[test]
    fn free_then_alloc_reuses_slots() {
        let mut alloc = BumpPagedKvAllocator::new(10);
        let (slots, _) = alloc.alloc_token_slots(3, false).unwrap();
        alloc.free(&slots);
        let (reused, _) = alloc.alloc_token_slots(3, false).unwrap();
        assert_eq!(reused.len(), 3);
        assert_eq!(alloc.watermark, 3);
    }
}
