//! `Worker`: the orchestrator tying every other module together into the
//! `forward_batch_speculative_generation` dispatch (spec §4.1). Grounded
//! on `EAGLEWorker` in `eagle_worker.py` end to end: construction shares
//! the target's embedding/head with the draft model, `forward` dispatches
//! on the batch's mode, and decode iterations run the full
//! draft -> tree -> verify -> logprob -> commit pipeline every call.

use std::collections::HashMap;

use candle_core::Tensor;

use crate::batch::{Batch, CaptureHiddenMode, DraftInput, ForwardMode};
use crate::config::SpeculativeWorkerConfig;
use crate::draft_extend;
use crate::draft_loop::run_draft_loop;
use crate::error::{Result, WorkerError};
use crate::hot_token::HotTokenMap;
use crate::kv_pool::layout::compute_draft_cache_layout;
use crate::kv_pool::{AllocatorStateToken, PagedKvAllocator, RequestToTokenTable};
use crate::logprob::{self, RequestLogprobs};
use crate::numeric::detect_nan;
use crate::runner::{DraftRunner, ForwardBatch, LogitsOutput, TargetRunner};
use crate::sampling::RequestSampler;
use crate::tp_group;
use crate::tree::build_batch_tree;
use crate::verifier;

/// What one `Worker::forward` call returns: spec §4.1's
/// `(logits_output, next_tokens, batch_id, num_accepted, can_use_graph)`,
/// expanded with the per-request bookkeeping the rest of this crate's
/// modules produce along the way.
pub struct ForwardOutput {
    /// The target forward's raw output for this step, `None` for an idle
    /// batch that ran no real forward.
    pub logits_output: Option<LogitsOutput>,
    pub verified_id: Vec<i64>,
    pub accept_length: Vec<i64>,
    pub committed_tokens: Vec<Vec<i64>>,
    pub logprobs: Vec<Option<RequestLogprobs>>,
    pub batch_id: u64,
    /// Total accepted tokens across the batch this step; always `0` for an
    /// extend/prefill dispatch (spec §4.1).
    pub num_accepted: i64,
    /// Whether a captured device-side graph replay was eligible for this
    /// step. This crate does not itself implement graph capture (spec §9
    /// treats it as an opaque transform over the eager S-step loop), so
    /// this is always the configuration's own `!disable_cuda_graph`.
    pub can_use_graph: bool,
    /// Seed for the next iteration's draft loop.
    pub next_draft_input: DraftInput,
}

/// The speculative decoding worker (spec §1). Owns both model runtimes,
/// the shared KV pool, and per-request sampler state across the whole
/// request lifetime.
pub struct Worker<D: DraftRunner, T: TargetRunner> {
    config: SpeculativeWorkerConfig,
    draft_runner: D,
    target_runner: T,
    allocator: Box<dyn PagedKvAllocator>,
    table: RequestToTokenTable,
    hot_tokens: Option<HotTokenMap>,
    samplers: HashMap<usize, RequestSampler>,
}

impl<D: DraftRunner, T: TargetRunner> Worker<D, T> {
    /// Builds a worker, validating `config`, selecting attention backends
    /// on both runtimes, and sharing the target's embedding (and, outside
    /// EAGLE3, its projected head) with the draft model (spec §6,
    /// `get_embed_and_head`/`set_embed_and_head`).
    pub fn new(
        config: SpeculativeWorkerConfig,
        mut draft_runner: D,
        mut target_runner: T,
        allocator: Box<dyn PagedKvAllocator>,
        hot_tokens: Option<HotTokenMap>,
    ) -> Result<Self> {
        config.validate()?;
        if config.speculative_algorithm.is_eagle3() && hot_tokens.is_some() {
            return Err(WorkerError::Configuration(
                "EAGLE3 draft models own their vocabulary end to end and never take a hot-token \
                 map"
                    .into(),
            ));
        }

        target_runner
            .init_attention_backend(config.attention_backend)
            .map_err(|e| WorkerError::Configuration(format!("target attention backend: {e}")))?;
        draft_runner
            .init_attention_backend(config.attention_backend)
            .map_err(|e| WorkerError::Configuration(format!("draft attention backend: {e}")))?;

        let (embed, head) = target_runner
            .get_embed_and_head()
            .map_err(|e| WorkerError::Configuration(format!("failed to read target embed/head: {e}")))?;
        let shared_head = if config.speculative_algorithm.is_eagle3() {
            None
        } else if let Some(map) = &hot_tokens {
            // eagle_worker.py:150-157: `head.data = head.data[self.hot_token_id]` —
            // row-select the target head onto the hot vocabulary before sharing it
            // with the draft model, so the draft's own head outputs compact
            // hot-vocab indices rather than full-target-vocab ones. `draft_loop`
            // unconditionally remaps every draft-produced index through this same
            // map, so skipping this step here would corrupt it.
            let hot_index: Vec<u32> = map.table().iter().map(|&id| id as u32).collect();
            let hot_index = Tensor::new(hot_index, head.device())
                .map_err(|e| WorkerError::Configuration(format!("failed to build hot-token index tensor: {e}")))?;
            let hot_head = head
                .index_select(&hot_index, 0)
                .map_err(|e| WorkerError::Configuration(format!("failed to row-select target head onto hot vocabulary: {e}")))?;
            Some(hot_head)
        } else {
            Some(head)
        };
        draft_runner
            .set_embed_and_head(embed, shared_head)
            .map_err(|e| WorkerError::Configuration(format!("failed to share embed/head: {e}")))?;

        Ok(Self {
            config,
            draft_runner,
            target_runner,
            allocator,
            table: RequestToTokenTable::new(),
            hot_tokens,
            samplers: HashMap::new(),
        })
    }

    /// Dispatches one forward call (spec §4.1). Decode and extend both
    /// require `draft_input` to have been seeded by the previous call's
    /// `next_draft_input`; the caller supplies the idle stand-in itself on
    /// the first call for a fresh batch.
    pub fn forward(&mut self, batch: &Batch, draft_input: &DraftInput) -> Result<ForwardOutput> {
        if batch.is_idle() {
            return self.forward_idle(batch.id, draft_input);
        }
        match batch.mode {
            ForwardMode::Extend => self.forward_extend(batch, draft_input),
            ForwardMode::Decode => self.forward_decode(batch, draft_input),
            ForwardMode::Idle => self.forward_idle(batch.id, draft_input),
        }
    }

    /// Under tensor-parallel data-parallel attention, collective ops must
    /// run in lockstep across every rank even when this rank's batch is
    /// idle (spec §4.6; decided in favor of always executing rather than
    /// skipping, since silently dropping a peer's in-flight request is a
    /// correctness hazard — see `DESIGN.md`).
    fn forward_idle(&mut self, batch_id: u64, draft_input: &DraftInput) -> Result<ForwardOutput> {
        if self.config.enable_dp_attention {
            let idle_batch = ForwardBatch {
                input_ids: Vec::new(),
                positions: Vec::new(),
                out_cache_loc: Vec::new(),
                seq_lens: Vec::new(),
                seq_lens_sum: 0,
                tree_mask: None,
                capture_hidden_mode: CaptureHiddenMode::None,
            };
            tp_group::with_draft_group(true, || self.draft_runner.forward(&idle_batch, true))
                .map_err(|e| WorkerError::Upstream(format!("idle draft collective failed: {e}")))?;
        }
        Ok(ForwardOutput {
            logits_output: None,
            verified_id: Vec::new(),
            accept_length: Vec::new(),
            committed_tokens: Vec::new(),
            logprobs: Vec::new(),
            batch_id,
            num_accepted: 0,
            can_use_graph: !self.config.disable_cuda_graph,
            next_draft_input: draft_input.clone(),
        })
    }

    /// Prefill/extend: runs the target over the new prompt tokens, then
    /// primes the draft model's own KV cache over the same span
    /// (`forward_draft_extend` in the source worker) so decode can start
    /// from a warm draft cache.
    fn forward_extend(&mut self, batch: &Batch, draft_input: &DraftInput) -> Result<ForwardOutput> {
        let req_pool_indices = batch.req_pool_indices();
        let seq_lens = batch.seq_lens();
        let prompt_lens: Vec<i64> = seq_lens.clone();
        let total_tokens: i64 = prompt_lens.iter().sum();

        let (slots, _) = self
            .allocator
            .alloc_token_slots(total_tokens as usize, false)?;

        let mut offset = 0usize;
        let mut input_ids = Vec::with_capacity(total_tokens as usize);
        let mut positions = Vec::with_capacity(total_tokens as usize);
        for (&idx, &len) in req_pool_indices.iter().zip(&prompt_lens) {
            let row_slots = &slots[offset..offset + len as usize];
            self.table.commit(idx, 0, row_slots);
            input_ids.extend(std::iter::repeat(0i64).take(len as usize));
            positions.extend(0..len);
            offset += len as usize;
        }

        let forward_batch = ForwardBatch {
            input_ids,
            positions,
            out_cache_loc: slots.clone(),
            seq_lens: prompt_lens.clone(),
            seq_lens_sum: total_tokens,
            tree_mask: None,
            capture_hidden_mode: CaptureHiddenMode::Full,
        };
        let output = self
            .target_runner
            .forward(&forward_batch, false)
            .map_err(|e| WorkerError::Upstream(format!("target extend forward failed: {e}")))?;
        detect_nan(&output.next_token_logits, self.config.enable_nan_detection)?;
        let logits_output = output.clone();

        self.draft_runner
            .forward(&forward_batch, false)
            .map_err(|e| WorkerError::Upstream(format!("draft extend priming failed: {e}")))?;

        let hidden = output
            .hidden_states
            .ok_or_else(|| WorkerError::Invariant("target extend did not return hidden states".into()))?;
        let topk_p = output
            .topk_p
            .ok_or_else(|| WorkerError::Invariant("target extend did not return top-k probabilities".into()))?;
        let topk_index = output
            .topk_index
            .ok_or_else(|| WorkerError::Invariant("target extend did not return top-k indices".into()))?;

        let verified_id: Vec<i64> = topk_index.iter().map(|row| row[0]).collect();
        let accept_length = vec![1i64; batch.batch_size()];

        Ok(ForwardOutput {
            logits_output: Some(logits_output),
            committed_tokens: verified_id.iter().map(|&t| vec![t]).collect(),
            verified_id: verified_id.clone(),
            accept_length: accept_length.clone(),
            logprobs: vec![None; batch.batch_size()],
            batch_id: batch.id,
            num_accepted: 0,
            can_use_graph: !self.config.disable_cuda_graph,
            next_draft_input: DraftInput {
                hidden_states: hidden,
                verified_id,
                topk_p,
                topk_index,
                positions: prompt_lens,
                accept_length,
                capture_hidden_mode: CaptureHiddenMode::Last,
            },
        })
    }

    /// Steady-state decode iteration: draft loop, tree build, verify,
    /// logprob attachment, cache commit. This is the method spec §4
    /// describes end to end.
    fn forward_decode(&mut self, batch: &Batch, draft_input: &DraftInput) -> Result<ForwardOutput> {
        let topk = self.config.speculative_eagle_topk;
        let steps = self.config.speculative_num_steps;
        let draft_token_num = self.config.speculative_num_draft_tokens;
        let batch_size = batch.batch_size();
        let req_pool_indices = batch.req_pool_indices();
        let seq_lens = batch.seq_lens();

        // spec §4.2: "the draft layout is always allocated with backup so
        // that, if verification rejects many branches, the unaccepted slots
        // are reclaimed in bulk." This step's two allocations (draft layout,
        // then verify slots) must roll back together on failure, so the
        // backup is taken once here rather than per call — a JIT backup
        // taken at the second call's own failure would already have the
        // first call's slots counted as allocated, leaking them on restore.
        let step_backup = self.allocator.backup_state();

        // spec §4.2: the draft cache layout reasons about the full S-step
        // tree (page alignment, last-location lookup) under this
        // deployment's page_size/topk regime; only S-1 of those steps
        // actually run a draft forward (the last step's children are never
        // forwarded), so any slots beyond that in the layout's allocation
        // are page-alignment slack this host-only allocator bridge has no
        // use for and frees straight back.
        let layout = compute_draft_cache_layout(
            &self.table,
            &req_pool_indices,
            &seq_lens,
            steps,
            topk,
            self.config.page_size,
        );
        let (layout_slots, _) = self
            .allocator
            .alloc_paged_token_slots_extend(
                &layout.prefix_lens,
                &layout.new_seq_lens,
                &layout.last_loc,
                layout.total_extend as usize,
                false,
            )
            .map_err(|e| self.recover_step_allocation(step_backup.clone(), e))?;
        let needed = (steps.saturating_sub(1)) * batch_size * topk;
        let (draft_slots, layout_slack) = layout_slots.split_at(needed.min(layout_slots.len()));
        if !layout_slack.is_empty() {
            self.allocator.free(layout_slack);
        }
        let cache_locs_per_step: Vec<Vec<i64>> = draft_slots
            .chunks(batch_size * topk)
            .map(<[i64]>::to_vec)
            .collect();

        let step_lists = run_draft_loop(
            &mut self.draft_runner,
            draft_input,
            self.hot_tokens.as_ref(),
            &cache_locs_per_step,
            &seq_lens,
            topk,
            steps,
            self.config.enable_dp_attention,
        )?;

        let batch_tree = build_batch_tree(
            &draft_input.verified_id,
            &seq_lens,
            &step_lists,
            topk,
            steps,
            draft_token_num,
        )?;

        let verify_slot_count = batch_size * draft_token_num;
        let (verify_slots, _) = self
            .allocator
            .alloc_token_slots(verify_slot_count, false)
            .map_err(|e| self.recover_step_allocation(step_backup.clone(), e))?;

        let forward_batch = ForwardBatch {
            input_ids: batch_tree.draft_tokens.clone(),
            positions: batch_tree.positions.clone(),
            out_cache_loc: verify_slots.clone(),
            seq_lens: seq_lens.iter().map(|&s| s + draft_token_num as i64).collect(),
            seq_lens_sum: batch_tree.seq_lens_sum,
            tree_mask: Some(batch_tree.tree_mask.clone()),
            capture_hidden_mode: CaptureHiddenMode::Full,
        };
        let output = self
            .target_runner
            .forward(&forward_batch, false)
            .map_err(|e| WorkerError::Upstream(format!("target verify forward failed: {e}")))?;
        detect_nan(&output.next_token_logits, self.config.enable_nan_detection)?;

        let mut samplers: Vec<RequestSampler> = batch
            .requests
            .iter()
            .map(|r| {
                self.samplers
                    .remove(&r.req_pool_index)
                    .unwrap_or_else(|| RequestSampler::from_seed(r.sampling.seed))
            })
            .collect();
        let verify_result = verifier::run(
            &output,
            &batch_tree,
            draft_token_num,
            &batch.requests,
            &mut samplers,
        );
        for (request, sampler) in batch.requests.iter().zip(samplers) {
            self.samplers.insert(request.req_pool_index, sampler);
        }
        let verify_result = verify_result?;

        let logprobs = logprob::attach(
            &output,
            &batch_tree,
            draft_token_num,
            &batch.requests,
            &verify_result,
        )?;

        let mut leftover_slots: Vec<i64> = Vec::new();
        for (b, &req_pool_index) in req_pool_indices.iter().enumerate() {
            let accepted_local = &verify_result.accepted_indices[b];
            let accepted_slots: Vec<i64> = accepted_local
                .iter()
                .map(|&n| verify_slots[b * draft_token_num + n])
                .collect();
            self.table.commit(req_pool_index, seq_lens[b] as usize, &accepted_slots);

            let accepted_set: std::collections::HashSet<usize> = accepted_local.iter().copied().collect();
            for local_node in 0..draft_token_num {
                if !accepted_set.contains(&local_node) {
                    leftover_slots.push(verify_slots[b * draft_token_num + local_node]);
                }
            }
        }
        leftover_slots.extend(draft_slots.iter().copied());
        self.allocator.free(&leftover_slots);

        let new_positions: Vec<i64> = seq_lens
            .iter()
            .zip(&verify_result.accept_length)
            .map(|(&s, &a)| s + a)
            .collect();

        // spec §4.6: re-prime the draft model's own KV cache over this
        // round's accepted tokens and recapture the top-k/hidden state that
        // actually seeds the next decode iteration's draft loop, rather
        // than reusing the target forward's own post-verify top-k
        // directly.
        let extend_output = draft_extend::run(
            &mut self.draft_runner,
            self.allocator.as_mut(),
            &seq_lens,
            &verify_result.committed_tokens,
            self.hot_tokens.as_ref(),
            self.config.enable_dp_attention,
        )?;

        let num_accepted: i64 = verify_result.accept_length.iter().sum();

        Ok(ForwardOutput {
            logits_output: Some(output),
            verified_id: verify_result.verified_id.clone(),
            accept_length: verify_result.accept_length.clone(),
            committed_tokens: verify_result.committed_tokens,
            logprobs,
            batch_id: batch.id,
            num_accepted,
            can_use_graph: !self.config.disable_cuda_graph,
            next_draft_input: DraftInput {
                hidden_states: extend_output.hidden_states,
                verified_id: verify_result.verified_id,
                topk_p: extend_output.topk_p,
                topk_index: extend_output.topk_index,
                positions: new_positions,
                accept_length: verify_result.accept_length,
                capture_hidden_mode: CaptureHiddenMode::Last,
            },
        })
    }

    /// Backs out a failed decode step's allocator state, matching
    /// `forward_draft_extend_after_decode`'s backup/restore pattern in the
    /// source worker (spec §4.2, §7 allocator errors).
    pub fn restore_allocator(&mut self, token: AllocatorStateToken) -> Result<()> {
        self.allocator.restore_state(token)
    }

    /// Rolls back every allocation `forward_decode` has made so far this
    /// step to `step_backup` and rewrites the propagated error's own
    /// `backup` token to match it, so the rollback has already happened by
    /// the time the caller sees the error instead of depending on a second
    /// `restore_allocator` call against a JIT backup that only reflects
    /// whatever earlier calls in the same step already succeeded (spec
    /// §4.2: "always allocated with backup"; §7 error kind 2: "no partial
    /// state persists").
    fn recover_step_allocation(&mut self, step_backup: AllocatorStateToken, err: WorkerError) -> WorkerError {
        let _ = self.allocator.restore_state(step_backup.clone());
        match err {
            WorkerError::Allocator { requested, reason, .. } => WorkerError::Allocator {
                requested,
                reason,
                backup: step_backup,
            },
            other => other,
        }
    }

    pub fn hidden_size(&self) -> usize {
        self.target_runner.hidden_size()
    }

    /// An idle `DraftInput` sized for this worker's hidden dimension and
    /// device, for callers bootstrapping a fresh batch.
    pub fn idle_draft_input(&self, device: &candle_core::Device) -> candle_core::Result<DraftInput> {
        DraftInput::idle(self.hidden_size(), device)
    }
}
