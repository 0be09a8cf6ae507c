//! `DraftLoop`: the `S`-step host-side drive loop around `DraftRunner`,
//! turning one `DraftInput` into the per-step `(score, token, parent)`
//! lists `TreeBuilder` assembles into a tree (spec §4.3). Grounded on
//! `draft`/`draft_forward`/`select_top_k_tokens` in `eagle_worker.py`.
//!
//! Step 0 needs no draft forward at all: it is exactly the target's
//! post-verify top-k (`DraftInput::topk_p`/`topk_index`), already computed
//! by the previous iteration's `Verifier`. Steps `1..speculative_num_steps`
//! each forward the `topk` current leaf tokens through the draft model,
//! multiply each child's probability into its parent's cumulative score,
//! and keep the best `topk` of the resulting `topk * topk` candidates —
//! this crate's literal reading of spec §4.3's "keep K active paths per
//! batch" (see `crate::tree` module docs for why this fixes the candidate
//! pool size at `1 + topk * speculative_num_steps`).

use crate::batch::DraftInput;
use crate::error::{Result, WorkerError};
use crate::hot_token::HotTokenMap;
use crate::runner::{DraftRunner, ForwardBatch};
use crate::tp_group;
use crate::tree::DraftStepLists;

fn remap_row(row: &[i64], hot_tokens: Option<&HotTokenMap>) -> Vec<i64> {
    match hot_tokens {
        Some(map) => map.remap_all(row),
        None => row.to_vec(),
    }
}

/// Runs the full draft loop for one batch and returns the per-step lists
/// `TreeBuilder` needs. `cache_locs_per_step[i]` is the flat
/// `batch_size * topk`-long set of cache slots the worker has already
/// allocated (via `kv_pool::layout` + a `PagedKvAllocator`) for draft step
/// `i + 1`; step 0 writes nothing since it reuses the previous forward's
/// top-k without a new model call.
pub fn run_draft_loop<R: DraftRunner>(
    runner: &mut R,
    draft_input: &DraftInput,
    hot_tokens: Option<&HotTokenMap>,
    cache_locs_per_step: &[Vec<i64>],
    seq_lens: &[i64],
    topk: usize,
    steps: usize,
    enable_dp_attention: bool,
) -> Result<DraftStepLists> {
    if steps == 0 {
        return Err(WorkerError::Invariant(
            "speculative_num_steps must be >= 1".into(),
        ));
    }
    if cache_locs_per_step.len() != steps - 1 {
        return Err(WorkerError::Invariant(format!(
            "expected {} cache location rows for {steps} draft steps, got {}",
            steps - 1,
            cache_locs_per_step.len()
        )));
    }
    let batch_size = seq_lens.len();
    if draft_input.topk_p.len() != batch_size || draft_input.topk_index.len() != batch_size {
        return Err(WorkerError::Invariant(
            "draft_input top-k rows must match the batch's request count".into(),
        ));
    }

    let mut scores: Vec<Vec<Vec<f32>>> = Vec::with_capacity(steps);
    let mut tokens: Vec<Vec<Vec<i64>>> = Vec::with_capacity(steps);
    let mut parents: Vec<Vec<Vec<i64>>> = Vec::with_capacity(steps);

    let step0_tokens: Vec<Vec<i64>> = draft_input
        .topk_index
        .iter()
        .map(|row| remap_row(row, hot_tokens))
        .collect();
    scores.push(draft_input.topk_p.clone());
    tokens.push(step0_tokens);
    parents.push(vec![vec![-1i64; topk]; batch_size]);

    for step in 1..steps {
        let cache_locs = &cache_locs_per_step[step - 1];
        let prev_tokens = &tokens[step - 1];
        let prev_scores = &scores[step - 1];

        let input_ids: Vec<i64> = prev_tokens.iter().flatten().copied().collect();
        let positions: Vec<i64> = seq_lens
            .iter()
            .flat_map(|&base| std::iter::repeat(base + step as i64).take(topk))
            .collect();
        let forward_batch = ForwardBatch {
            input_ids,
            positions,
            out_cache_loc: cache_locs.clone(),
            seq_lens: seq_lens.iter().map(|&s| s + step as i64).collect(),
            seq_lens_sum: seq_lens.iter().sum::<i64>() + (batch_size * topk * step) as i64,
            tree_mask: None,
            capture_hidden_mode: draft_input.capture_hidden_mode,
        };

        let output = tp_group::with_draft_group(enable_dp_attention, || {
            runner.forward(&forward_batch, step > 1)
        })
        .map_err(|e| WorkerError::Upstream(format!("draft forward failed at step {step}: {e}")))?;

        let child_p = output.topk_p.ok_or_else(|| {
            WorkerError::Invariant("draft runner did not return top-k probabilities".into())
        })?;
        let child_idx = output.topk_index.ok_or_else(|| {
            WorkerError::Invariant("draft runner did not return top-k indices".into())
        })?;
        if child_p.len() != batch_size * topk || child_idx.len() != batch_size * topk {
            return Err(WorkerError::Invariant(format!(
                "draft step {step}: expected {} top-k rows, got {}",
                batch_size * topk,
                child_p.len()
            )));
        }

        let mut step_scores = Vec::with_capacity(batch_size);
        let mut step_tokens = Vec::with_capacity(batch_size);
        let mut step_parents = Vec::with_capacity(batch_size);

        for b in 0..batch_size {
            let mut candidates: Vec<(f32, i64, i64)> = Vec::with_capacity(topk * topk);
            for parent_k in 0..topk {
                let row = b * topk + parent_k;
                let parent_score = prev_scores[b][parent_k];
                let remapped = remap_row(&child_idx[row], hot_tokens);
                for child_k in 0..topk {
                    let combined = parent_score * child_p[row][child_k];
                    candidates.push((combined, remapped[child_k], parent_k as i64));
                }
            }
            candidates.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));
            candidates.truncate(topk);

            step_scores.push(candidates.iter().map(|c| c.0).collect());
            step_tokens.push(candidates.iter().map(|c| c.1).collect());
            step_parents.push(candidates.iter().map(|c| c.2).collect());
        }

        scores.push(step_scores);
        tokens.push(step_tokens);
        parents.push(step_parents);
    }

    Ok(DraftStepLists {
        scores,
        tokens,
        parents,
    })
}

#[cfg(test)]
mod tests {
    use candle_core::{DType, Device, Tensor};

    use super::*;
    use crate::batch::CaptureHiddenMode;
    use crate::config::AttentionBackendKind;
    use crate::runner::LogitsOutput;

    /// A draft runner whose forward always returns the same top-k
    /// distribution per row, so the resulting tree is easy to hand-verify.
    struct FixedDraftRunner {
        child_p: Vec<f32>,
        child_tokens: Vec<i64>,
        topk: usize,
        calls: usize,
    }

    impl DraftRunner for FixedDraftRunner {
        fn forward(
            &mut self,
            batch: &ForwardBatch,
            _skip_attn_backend_init: bool,
        ) -> candle_core::Result<LogitsOutput> {
            self.calls += 1;
            let rows = batch.input_ids.len();
            let device = Device::Cpu;
            Ok(LogitsOutput {
                next_token_logits: Tensor::zeros((rows, 1), DType::F32, &device)?,
                hidden_states: None,
                topk_p: Some(vec![self.child_p.clone(); rows]),
                topk_index: Some(vec![self.child_tokens.clone(); rows]),
            })
        }

        fn init_attention_backend(&mut self, _kind: AttentionBackendKind) -> candle_core::Result<()> {
            Ok(())
        }

        fn set_embed_and_head(&mut self, _embed: Tensor, _head: Option<Tensor>) -> candle_core::Result<()> {
            Ok(())
        }

        fn hidden_size(&self) -> usize {
            self.topk
        }
    }

    /// Builds a fixture `DraftInput` with a fixed top-2 distribution; every
    /// test in this module uses `topk == 2`.
    fn idle_draft_input(batch_size: usize, topk: usize) -> DraftInput {
        assert_eq!(topk, 2, "fixture assumes topk == 2");
        DraftInput {
            hidden_states: Tensor::zeros((batch_size, 4), DType::F32, &Device::Cpu).unwrap(),
            verified_id: vec![0; batch_size],
            topk_p: vec![vec![0.6, 0.4]; batch_size],
            topk_index: vec![vec![10, 20]; batch_size],
            positions: vec![5; batch_size],
            accept_length: vec![1; batch_size],
            capture_hidden_mode: CaptureHiddenMode::Last,
        }
    }

    #[test]
    fn step_zero_is_taken_directly_from_draft_input() {
        let mut runner = FixedDraftRunner {
            child_p: vec![0.7, 0.3],
            child_tokens: vec![1, 2],
            topk: 2,
            calls: 0,
        };
        let draft_input = idle_draft_input(1, 2);
        let lists = run_draft_loop(&mut runner, &draft_input, None, &[vec![]], &[5], 2, 2, false)
            .unwrap();
        assert_eq!(lists.scores[0], vec![vec![0.6, 0.4]]);
        assert_eq!(lists.tokens[0], vec![vec![10, 20]]);
        assert_eq!(lists.parents[0], vec![vec![-1, -1]]);
    }

    #[test]
    fn later_steps_combine_parent_and_child_scores() {
        let mut runner = FixedDraftRunner {
            child_p: vec![0.5, 0.5],
            child_tokens: vec![100, 200],
            topk: 2,
            calls: 0,
        };
        let draft_input = idle_draft_input(1, 2);
        let cache_locs = vec![vec![0, 1, 2, 3]];
        let lists =
            run_draft_loop(&mut runner, &draft_input, None, &cache_locs, &[5], 2, 2, false).unwrap();
        // Best parent (0.6) combined with either child (0.5) beats the
        // worse parent (0.4) combined with either child.
        assert_eq!(lists.scores[1].len(), 1);
        assert_eq!(lists.scores[1][0].len(), 2);
        for &s in &lists.scores[1][0] {
            assert!((s - 0.3).abs() < 1e-6);
        }
        assert_eq!(lists.parents[1][0], vec![0, 0]);
        assert_eq!(runner.calls, 1);
    }

    #[test]
    fn hot_token_remap_applies_to_every_step() {
        let mut runner = FixedDraftRunner {
            child_p: vec![1.0, 0.0],
            child_tokens: vec![0, 1],
            topk: 2,
            calls: 0,
        };
        let map = HotTokenMap::new(vec![900, 901]).unwrap();
        let draft_input = idle_draft_input(1, 2);
        let lists = run_draft_loop(
            &mut runner,
            &draft_input,
            Some(&map),
            &[vec![0, 1, 2, 3]],
            &[5],
            2,
            2,
            false,
        )
        .unwrap();
        assert!(lists.tokens[1][0].iter().all(|&t| t == 900 || t == 901));
    }

    #[test]
    fn rejects_mismatched_cache_location_row_count() {
        let mut runner = FixedDraftRunner {
            child_p: vec![0.5, 0.5],
            child_tokens: vec![1, 2],
            topk: 2,
            calls: 0,
        };
        let draft_input = idle_draft_input(1, 2);
        let err = run_draft_loop(&mut runner, &draft_input, None, &[], &[5], 2, 2, false)
            .unwrap_err();
        assert!(matches!(err, WorkerError::Invariant(_)));
    }
}
