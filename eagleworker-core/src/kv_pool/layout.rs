//! `DraftCacheLayout`: prefix/extend length and last-location math for
//! page-sized draft allocations (spec §4.2). Must match
//! `get_last_loc_large_page_size_top_k_1` / `get_last_loc_large_page_size_large_top_k`
//! in `eagle_worker.py` exactly, including integer (ceiling) division
//! semantics — this is load-bearing for boundary scenario 3 (spec §8).

use super::RequestToTokenTable;

/// What `DraftCacheLayout` hands to `PagedKvAllocator::alloc_paged_token_slots_extend`
/// (or, for `page_size == 1`, the flat slot count) to allocate one step's
/// worth of draft cache locations for a whole batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DraftCacheLayout {
    pub prefix_lens: Vec<i64>,
    pub new_seq_lens: Vec<i64>,
    pub last_loc: Vec<i64>,
    pub extend_lens: Vec<i64>,
    /// Total slots this layout's allocation call must request.
    pub total_extend: i64,
}

/// Computes the draft cache layout for one decode step's allocation (spec
/// §4.2). `seq_lens` and `req_pool_indices` must be the same length (one
/// entry per request in the batch).
pub fn compute_draft_cache_layout(
    table: &RequestToTokenTable,
    req_pool_indices: &[usize],
    seq_lens: &[i64],
    speculative_num_steps: usize,
    topk: usize,
    page_size: usize,
) -> DraftCacheLayout {
    assert_eq!(req_pool_indices.len(), seq_lens.len());
    let steps = speculative_num_steps as i64;
    let k = topk as i64;
    let page = page_size as i64;

    if page == 1 {
        // Unpaged: no prefix/page reasoning, just a flat slot count. No
        // last-location lookup either (spec §4.2): that field only matters
        // for locating a sequence's trailing partial page, which doesn't
        // exist without paging, so it is left unused (`-1`) rather than
        // touching `table` at all.
        let total = seq_lens.len() as i64 * steps * k;
        return DraftCacheLayout {
            prefix_lens: seq_lens.to_vec(),
            new_seq_lens: seq_lens.iter().map(|&p| p + steps * k).collect(),
            last_loc: vec![-1; seq_lens.len()],
            extend_lens: vec![steps * k; seq_lens.len()],
            total_extend: total,
        };
    }

    let last_loc: Vec<i64> = req_pool_indices
        .iter()
        .zip(seq_lens)
        .map(|(&idx, &prefix)| table.last_loc(idx, prefix))
        .collect();

    if topk == 1 {
        let new_seq_lens: Vec<i64> = seq_lens.iter().map(|&p| p + steps).collect();
        let extend_lens: Vec<i64> = vec![steps; seq_lens.len()];
        return DraftCacheLayout {
            prefix_lens: seq_lens.to_vec(),
            total_extend: extend_lens.iter().sum(),
            new_seq_lens,
            last_loc,
            extend_lens,
        };
    }

    // page_size > 1, topk > 1: the trailing partial page of each sequence
    // must be logically duplicated `topk` times so every branch has
    // contiguous trailing pages (spec §4.2).
    let mut new_seq_lens = Vec::with_capacity(seq_lens.len());
    let mut extend_lens = Vec::with_capacity(seq_lens.len());
    for &prefix in seq_lens {
        let last_page_len = prefix % page;
        let num_new_pages_per_topk = ceil_div(last_page_len + steps, page);
        let new_len = (prefix / page) * page + num_new_pages_per_topk * page * k;
        new_seq_lens.push(new_len);
        extend_lens.push(new_len - prefix);
    }

    DraftCacheLayout {
        prefix_lens: seq_lens.to_vec(),
        total_extend: extend_lens.iter().sum(),
        new_seq_lens,
        last_loc,
        extend_lens,
    }
}

fn ceil_div(a: i64, b: i64) -> i64 {
    (a + b - 1) / b
}
