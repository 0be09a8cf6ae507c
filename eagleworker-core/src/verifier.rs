//! `Verifier`: walks a `BatchTree` against one target forward's logits,
//! drawing exactly one acceptance sample per visited node until a sample
//! fails to match any drafted child (spec §4.5). Grounded on `verify` in
//! `eagle_worker.py`, generalized from its CUDA kernel walk
//! (`tree_speculative_sampling_target_only`) to plain host-side array
//! indexing per "Tree as arrays, not pointers" (spec §9).
//!
//! Every visited node draws exactly one sample: if it matches a drafted
//! child's token, that child is accepted and becomes the next node to
//! sample from; if not, the draw itself becomes the round's fallback
//! token and the walk stops. So `accept_length == accepted edges + 1`
//! always — the "+1 for the guaranteed fallback sample" the glossary
//! describes.

use candle_core::{DType, Tensor};

use crate::batch::Request;
use crate::error::{Result, WorkerError};
use crate::runner::LogitsOutput;
use crate::sampling::{softmax_with_temperature, RequestSampler};
use crate::tree::BatchTree;

/// What one verification pass produces for a batch (spec §3 "Worker
/// output").
pub struct VerifyOutput {
    /// The token to condition the next draft round on, one per request
    /// (the round's fallback sample — always the last token committed).
    pub verified_id: Vec<i64>,
    /// Samples drawn this round, one per request; always `>= 1`.
    pub accept_length: Vec<i64>,
    /// Request-local tree node indices visited, root (0) first, length
    /// equal to `accept_length[b]`. Strictly increasing because node
    /// indices are assigned in depth-major (BFS) order by `TreeBuilder`.
    pub accepted_indices: Vec<Vec<usize>>,
    /// Newly committed tokens this round, parallel to `accepted_indices`.
    pub committed_tokens: Vec<Vec<i64>>,
    /// Global flat node index of each request's final accepted node, for
    /// the caller to map back into cache slots / `out_cache_loc`.
    pub final_node_global: Vec<usize>,
    /// Hidden state at each request's final accepted node, `(batch, hidden)`.
    pub hidden_states: Tensor,
}

/// Runs one verification pass. `output` must be the target forward's
/// result for `batch_tree` with `capture_hidden_mode` asking for hidden
/// states; sampling happens host-side from raw `next_token_logits` (spec
/// §4.5: "Sampling is not performed inside the forward"), so a
/// spec-conformant `TargetRunner` need not return top-k at all — that
/// contract is draft-only (`runner.rs`). `samplers`/`requests` must be
/// parallel to each other and to `batch_tree`'s per-request blocks.
pub fn run(
    output: &LogitsOutput,
    batch_tree: &BatchTree,
    draft_token_num: usize,
    requests: &[Request],
    samplers: &mut [RequestSampler],
) -> Result<VerifyOutput> {
    if requests.len() != samplers.len() {
        return Err(WorkerError::Invariant(
            "verifier requires one sampler per request".into(),
        ));
    }
    let batch_size = requests.len();
    if batch_tree.draft_tokens.len() != batch_size * draft_token_num {
        return Err(WorkerError::Invariant(
            "batch tree size does not match batch_size * draft_token_num".into(),
        ));
    }

    let all_logits: Vec<Vec<f32>> = output
        .next_token_logits
        .to_dtype(DType::F32)
        .and_then(|t| t.to_vec2())
        .map_err(|e| WorkerError::Numeric(format!("failed to read verify logits: {e}")))?;
    let hidden = output.hidden_states.as_ref().ok_or_else(|| {
        WorkerError::Invariant("target forward did not return hidden states".into())
    })?;

    let mut verified_id = Vec::with_capacity(batch_size);
    let mut accept_length = Vec::with_capacity(batch_size);
    let mut accepted_indices = Vec::with_capacity(batch_size);
    let mut committed_tokens = Vec::with_capacity(batch_size);
    let mut final_node_global = Vec::with_capacity(batch_size);

    for (b, request) in requests.iter().enumerate() {
        let sampler = &mut samplers[b];
        let temperature = request.sampling.temperature;
        let mut node_local = 0usize;
        let mut local_path = vec![0usize];
        let mut committed = Vec::new();

        loop {
            let global_node = b * draft_token_num + node_local;
            let mut logits = all_logits[global_node].clone();
            if let Some(grammar) = &request.grammar {
                let path_tokens: Vec<i64> = local_path
                    .iter()
                    .map(|&n| batch_tree.draft_tokens[b * draft_token_num + n])
                    .collect();
                let forbidden = grammar.forbidden_mask(&path_tokens, logits.len());
                for (logit, bad) in logits.iter_mut().zip(forbidden) {
                    if bad {
                        *logit = f32::NEG_INFINITY;
                    }
                }
            }

            let sampled_token = if temperature <= 1e-6 {
                RequestSampler::sample_greedy(&logits)? as i64
            } else {
                let probs = softmax_with_temperature(&logits, temperature);
                sampler.sample(&probs)? as i64
            };

            let mut matched_child = None;
            let mut child = batch_tree.retrive_next_token[global_node];
            while child != -1 {
                let child_idx = child as usize;
                if batch_tree.draft_tokens[child_idx] == sampled_token {
                    matched_child = Some(child_idx - b * draft_token_num);
                    break;
                }
                child = batch_tree.retrive_next_sibling[child_idx];
            }

            committed.push(sampled_token);
            match matched_child {
                Some(child_local) => {
                    node_local = child_local;
                    local_path.push(node_local);
                }
                None => break,
            }
        }

        let final_global = b * draft_token_num + *local_path.last().expect("path is never empty");
        accept_length.push(committed.len() as i64);
        verified_id.push(*committed.last().expect("at least one sample is always drawn"));
        accepted_indices.push(local_path);
        committed_tokens.push(committed);
        final_node_global.push(final_global);
    }

    let device = hidden.device();
    let idx: Vec<u32> = final_node_global.iter().map(|&i| i as u32).collect();
    let idx_tensor = Tensor::new(idx, device)
        .map_err(|e| WorkerError::Numeric(format!("failed to build gather index: {e}")))?;
    let hidden_states = hidden
        .index_select(&idx_tensor, 0)
        .map_err(|e| WorkerError::Numeric(format!("failed to gather accepted hidden states: {e}")))?;

    Ok(VerifyOutput {
        verified_id,
        accept_length,
        accepted_indices,
        committed_tokens,
        final_node_global,
        hidden_states,
    })
}

#[cfg(test)]
mod tests {
    use candle_core::Device;

    use super::*;
    use crate::batch::{LogprobRequest, SamplingParams};
    use crate::tree::mask::TreeMask;

    fn request(temperature: f32) -> Request {
        Request {
            req_pool_index: 0,
            seq_len: 5,
            sampling: SamplingParams {
                temperature,
                seed: 1,
            },
            grammar: None,
            logprob_request: Some(LogprobRequest::default()),
        }
    }

    /// One request, a 3-node chain tree (root -> tok 1 -> tok 2), vocab
    /// size 4. Target logits are rigged so argmax always matches the
    /// drafted child, so greedy decoding should walk the whole chain.
    fn chain_tree() -> BatchTree {
        BatchTree {
            draft_tokens: vec![0, 1, 2],
            positions: vec![5, 6, 7],
            retrive_index: vec![0, 1, 2],
            retrive_next_token: vec![1, 2, -1],
            retrive_next_sibling: vec![-1, -1, -1],
            tree_mask: TreeMask::new(3, 3),
            seq_lens_sum: 8,
        }
    }

    /// `topk_p`/`topk_index` are left `None`, matching a spec-conformant
    /// target forward run with `skip_sample=True` (spec §4.5): the verifier
    /// must derive the acceptance walk purely from `next_token_logits`.
    fn logits_output(rows: usize, vocab: usize, argmax_per_row: &[usize]) -> LogitsOutput {
        let device = Device::Cpu;
        let mut data = vec![0.0f32; rows * vocab];
        for (row, &amax) in argmax_per_row.iter().enumerate() {
            data[row * vocab + amax] = 10.0;
        }
        let next_token_logits = Tensor::from_vec(data, (rows, vocab), &device).unwrap();
        let hidden_states = Tensor::zeros((rows, 4), DType::F32, &device).unwrap();
        LogitsOutput {
            next_token_logits,
            hidden_states: Some(hidden_states),
            topk_p: None,
            topk_index: None,
        }
    }

    #[test]
    fn greedy_walk_accepts_whole_matching_chain() {
        let tree = chain_tree();
        let output = logits_output(3, 4, &[1, 2, 3]);
        let requests = vec![request(0.0)];
        let mut samplers = vec![RequestSampler::from_seed(1)];
        let result = run(&output, &tree, 3, &requests, &mut samplers).unwrap();
        assert_eq!(result.accept_length, vec![3]);
        assert_eq!(result.accepted_indices, vec![vec![0, 1, 2]]);
        assert_eq!(result.committed_tokens, vec![vec![1, 2, 3]]);
        assert_eq!(result.verified_id, vec![3]);
    }

    #[test]
    fn mismatch_at_root_stops_immediately_with_one_sample() {
        let tree = chain_tree();
        // argmax at root (node 0) is token 7, which matches no child.
        let output = logits_output(3, 8, &[7, 2, 3]);
        let requests = vec![request(0.0)];
        let mut samplers = vec![RequestSampler::from_seed(1)];
        let result = run(&output, &tree, 3, &requests, &mut samplers).unwrap();
        assert_eq!(result.accept_length, vec![1]);
        assert_eq!(result.accepted_indices, vec![vec![0]]);
        assert_eq!(result.verified_id, vec![7]);
    }

    #[test]
    fn accepted_indices_strictly_increase() {
        let tree = chain_tree();
        let output = logits_output(3, 4, &[1, 2, 3]);
        let requests = vec![request(0.0)];
        let mut samplers = vec![RequestSampler::from_seed(7)];
        let result = run(&output, &tree, 3, &requests, &mut samplers).unwrap();
        let path = &result.accepted_indices[0];
        assert!(path.windows(2).all(|w| w[0] < w[1]));
    }
}
