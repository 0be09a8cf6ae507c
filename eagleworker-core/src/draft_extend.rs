//! `DraftExtendAfterDecode`: re-primes the draft model's own KV cache over
//! the tokens a decode step just accepted, re-capturing the hidden state
//! and top-k that seed the next iteration's `DraftLoop` (spec §4.6).
//! Grounded on `forward_draft_extend_after_decode` in `eagle_worker.py`.
//!
//! The source routine backs up `seq_lens`/`req_pool_indices`/
//! `accept_length`/`return_logprob` before mutating them in place for shape
//! convenience and restores them after. This crate's `Batch`/`Request`
//! types are never mutated in place — every caller already works from its
//! own `Vec` copies — so there is nothing to back up; the mutate-then-
//! restore dance in the source is a Python-batch-object idiom this crate
//! has no equivalent need for.
//!
//! Idle requests (already finished, `accept_length == 0`) are spec's
//! concern for keeping a tensor-parallel draft group's collective shape
//! stable across ranks; this crate handles that one level up, in
//! `Worker::forward_idle`, since by the time a `Batch` reaches this module
//! every request in it is live with `accept_length >= 1` (acceptance
//! sampling always draws at least the guaranteed fallback token).

use candle_core::Tensor;

use crate::batch::CaptureHiddenMode;
use crate::error::{Result, WorkerError};
use crate::hot_token::HotTokenMap;
use crate::kv_pool::PagedKvAllocator;
use crate::runner::{DraftRunner, ForwardBatch};
use crate::tp_group;

/// What one draft extend-after-decode pass produces: the seed for the next
/// iteration's `DraftInput`.
pub struct DraftExtendOutput {
    pub hidden_states: Tensor,
    pub topk_p: Vec<Vec<f32>>,
    pub topk_index: Vec<Vec<i64>>,
}

/// Runs the draft model once over each request's newly accepted tokens
/// (`committed_tokens[b]`, `accept_length[b]` long) to extend its own KV
/// cache and recapture `(hidden_states, topk_p, topk_index)` at the new
/// last position, per request.
pub fn run<R: DraftRunner>(
    runner: &mut R,
    allocator: &mut dyn PagedKvAllocator,
    seq_lens_before_verify: &[i64],
    committed_tokens: &[Vec<i64>],
    hot_tokens: Option<&HotTokenMap>,
    enable_dp_attention: bool,
) -> Result<DraftExtendOutput> {
    let batch_size = committed_tokens.len();
    if seq_lens_before_verify.len() != batch_size {
        return Err(WorkerError::Invariant(
            "draft extend-after-decode requires one seq_len per committed-token row".into(),
        ));
    }
    if committed_tokens.iter().any(Vec::is_empty) {
        return Err(WorkerError::Invariant(
            "draft extend-after-decode requires at least one committed token per request \
             (accept_length is always >= 1)"
                .into(),
        ));
    }

    let extend_lens: Vec<i64> = committed_tokens.iter().map(|c| c.len() as i64).collect();
    let total: usize = extend_lens.iter().sum::<i64>() as usize;
    let (slots, _) = allocator.alloc_token_slots(total, false)?;

    let mut input_ids = Vec::with_capacity(total);
    let mut positions = Vec::with_capacity(total);
    let mut row_offsets = Vec::with_capacity(batch_size);
    let mut offset = 0usize;
    for (b, tokens) in committed_tokens.iter().enumerate() {
        row_offsets.push(offset);
        input_ids.extend_from_slice(tokens);
        let base = seq_lens_before_verify[b];
        positions.extend(base..base + tokens.len() as i64);
        offset += tokens.len();
    }

    let new_seq_lens: Vec<i64> = seq_lens_before_verify
        .iter()
        .zip(&extend_lens)
        .map(|(&s, &e)| s + e)
        .collect();
    let forward_batch = ForwardBatch {
        input_ids,
        positions,
        out_cache_loc: slots,
        seq_lens: new_seq_lens,
        seq_lens_sum: total as i64,
        tree_mask: None,
        capture_hidden_mode: CaptureHiddenMode::Last,
    };

    let output = tp_group::with_draft_group(enable_dp_attention, || runner.forward(&forward_batch, false))
        .map_err(|e| WorkerError::Upstream(format!("draft extend-after-decode forward failed: {e}")))?;

    let hidden = output.hidden_states.ok_or_else(|| {
        WorkerError::Invariant("draft extend-after-decode did not return hidden states".into())
    })?;
    let topk_p_all = output.topk_p.ok_or_else(|| {
        WorkerError::Invariant("draft extend-after-decode did not return top-k probabilities".into())
    })?;
    let topk_index_all = output.topk_index.ok_or_else(|| {
        WorkerError::Invariant("draft extend-after-decode did not return top-k indices".into())
    })?;

    let last_rows: Vec<usize> = row_offsets
        .iter()
        .zip(&extend_lens)
        .map(|(&off, &len)| off + (len as usize - 1))
        .collect();

    let idx: Vec<u32> = last_rows.iter().map(|&i| i as u32).collect();
    let idx_tensor = Tensor::new(idx, hidden.device())
        .map_err(|e| WorkerError::Numeric(format!("failed to build gather index: {e}")))?;
    let hidden_states = hidden
        .index_select(&idx_tensor, 0)
        .map_err(|e| WorkerError::Numeric(format!("failed to gather draft-extend hidden states: {e}")))?;

    let mut topk_p = Vec::with_capacity(batch_size);
    let mut topk_index = Vec::with_capacity(batch_size);
    for &row in &last_rows {
        if row >= topk_p_all.len() || row >= topk_index_all.len() {
            return Err(WorkerError::Invariant(
                "draft extend-after-decode top-k rows do not cover every request's last position"
                    .into(),
            ));
        }
        topk_p.push(topk_p_all[row].clone());
        let remapped = match hot_tokens {
            Some(map) => map.remap_all(&topk_index_all[row]),
            None => topk_index_all[row].clone(),
        };
        topk_index.push(remapped);
    }

    Ok(DraftExtendOutput {
        hidden_states,
        topk_p,
        topk_index,
    })
}

#[cfg(test)]
mod tests {
    use candle_core::{DType, Device};

    use super::*;
    use crate::config::AttentionBackendKind;
    use crate::kv_pool::BumpPagedKvAllocator;
    use crate::runner::LogitsOutput;

    /// A draft runner that returns a distinct top-k row per input token so
    /// the test can check the last-row gather picks the right one.
    struct RowIndexedDraftRunner {
        topk: usize,
    }

    impl DraftRunner for RowIndexedDraftRunner {
        fn forward(
            &mut self,
            batch: &ForwardBatch,
            _skip_attn_backend_init: bool,
        ) -> candle_core::Result<LogitsOutput> {
            let rows = batch.input_ids.len();
            let device = Device::Cpu;
            let hidden = Tensor::arange(0f32, (rows * 4) as f32, &device)?.reshape((rows, 4))?;
            let topk_p: Vec<Vec<f32>> = (0..rows).map(|r| vec![1.0 - r as f32 * 0.01; self.topk]).collect();
            let topk_index: Vec<Vec<i64>> = (0..rows).map(|r| vec![100 + r as i64; self.topk]).collect();
            Ok(LogitsOutput {
                next_token_logits: Tensor::zeros((rows, 1), DType::F32, &device)?,
                hidden_states: Some(hidden),
                topk_p: Some(topk_p),
                topk_index: Some(topk_index),
            })
        }

        fn init_attention_backend(&mut self, _kind: AttentionBackendKind) -> candle_core::Result<()> {
            Ok(())
        }

        fn set_embed_and_head(&mut self, _embed: Tensor, _head: Option<Tensor>) -> candle_core::Result<()> {
            Ok(())
        }

        fn hidden_size(&self) -> usize {
            4
        }
    }

    #[test]
    fn gathers_last_position_per_request() {
        let mut runner = RowIndexedDraftRunner { topk: 2 };
        let mut allocator = BumpPagedKvAllocator::new(1_000);
        let committed = vec![vec![1i64, 2, 3], vec![9i64]];
        let out = run(&mut runner, &mut allocator, &[5, 8], &committed, None, false).unwrap();
        // Request 0 spans flat rows 0..3, last row is 2; request 1 is row 3.
        assert_eq!(out.topk_index, vec![vec![102, 102], vec![103, 103]]);
        assert_eq!(out.topk_p.len(), 2);
        let hidden: Vec<Vec<f32>> = out.hidden_states.to_vec2().unwrap();
        assert_eq!(hidden[0], vec![8.0, 9.0, 10.0, 11.0]);
        assert_eq!(hidden[1], vec![12.0, 13.0, 14.0, 15.0]);
    }

    #[test]
    fn applies_hot_token_remap() {
        let mut runner = RowIndexedDraftRunner { topk: 1 };
        let mut allocator = BumpPagedKvAllocator::new(1_000);
        let committed = vec![vec![1i64]];
        let map = HotTokenMap::new(vec![500]).unwrap();
        let out = run(&mut runner, &mut allocator, &[0], &committed, Some(&map), false).unwrap();
        assert_eq!(out.topk_index, vec![vec![500]]);
    }

    #[test]
    fn rejects_empty_committed_row() {
        let mut runner = RowIndexedDraftRunner { topk: 1 };
        let mut allocator = BumpPagedKvAllocator::new(1_000);
        let committed: Vec<Vec<i64>> = vec![vec![]];
        let err = run(&mut runner, &mut allocator, &[0], &committed, None, false).unwrap_err();
        assert!(matches!(err, WorkerError::Invariant(_)));
    }
}
