//! `LogprobAttachment`: per-accepted-token logprob computation (spec §4.7).
//! Grounded on `add_logprob_values` in `eagle_worker.py`, which recomputes
//! log-probabilities from the verify forward's raw logits at each accepted
//! node rather than reusing any intermediate the acceptance sampler kept
//! around — this module does the same, taking `LogitsOutput` and
//! `VerifyOutput` as independent inputs.

use crate::batch::Request;
use crate::error::{Result, WorkerError};
use crate::runner::LogitsOutput;
use crate::sampling::log_softmax;
use crate::tree::BatchTree;
use crate::verifier::VerifyOutput;
use candle_core::DType;

#[derive(Debug, Clone, PartialEq)]
pub struct TokenLogprob {
    pub token_id: i64,
    pub logprob: f32,
}

/// Logprobs attached to one newly committed token (spec §4.7).
#[derive(Debug, Clone)]
pub struct StepLogprobs {
    pub selected: TokenLogprob,
    /// Up to `top_n` entries, descending by logprob.
    pub top: Vec<TokenLogprob>,
    /// Logprobs for the request's explicitly requested token ids, in the
    /// order they were requested.
    pub requested: Vec<TokenLogprob>,
}

/// One request's logprobs for every token committed this round, parallel
/// to `VerifyOutput::committed_tokens[b]`.
#[derive(Debug, Clone)]
pub struct RequestLogprobs {
    pub steps: Vec<StepLogprobs>,
}

/// Computes logprobs for every request that asked for them. Requests with
/// no `logprob_request` get `None` (spec §4.7: "logprob attachment is
/// opt-in per request").
pub fn attach(
    output: &LogitsOutput,
    batch_tree: &BatchTree,
    draft_token_num: usize,
    requests: &[Request],
    verify: &VerifyOutput,
) -> Result<Vec<Option<RequestLogprobs>>> {
    if requests.len() != verify.accepted_indices.len() {
        return Err(WorkerError::Invariant(
            "logprob attachment requires one verify result per request".into(),
        ));
    }

    let all_logits: Vec<Vec<f32>> = output
        .next_token_logits
        .to_dtype(DType::F32)
        .and_then(|t| t.to_vec2())
        .map_err(|e| WorkerError::Numeric(format!("failed to read logprob logits: {e}")))?;

    let mut result = Vec::with_capacity(requests.len());
    for (b, request) in requests.iter().enumerate() {
        let Some(logprob_request) = &request.logprob_request else {
            result.push(None);
            continue;
        };
        if batch_tree.draft_tokens.len() < (b + 1) * draft_token_num {
            return Err(WorkerError::Invariant(
                "batch tree is smaller than draft_token_num * batch_size".into(),
            ));
        }

        let temperature = request.sampling.temperature.max(1e-6);
        let local_path = &verify.accepted_indices[b];
        let committed = &verify.committed_tokens[b];
        let mut steps = Vec::with_capacity(local_path.len());

        for (&node_local, &token) in local_path.iter().zip(committed.iter()) {
            let global_node = b * draft_token_num + node_local;
            let logp = log_softmax(&all_logits[global_node], temperature);

            let selected_logprob = *logp.get(token as usize).ok_or_else(|| {
                WorkerError::Invariant(format!(
                    "committed token {token} is out of range for a vocabulary of size {}",
                    logp.len()
                ))
            })?;

            let mut ranked: Vec<(usize, f32)> = logp.iter().copied().enumerate().collect();
            ranked.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
            let top = ranked
                .iter()
                .take(logprob_request.top_n)
                .map(|&(id, lp)| TokenLogprob {
                    token_id: id as i64,
                    logprob: lp,
                })
                .collect();

            let requested = logprob_request
                .token_ids
                .iter()
                .map(|&id| {
                    logp.get(id as usize)
                        .copied()
                        .map(|lp| TokenLogprob {
                            token_id: id,
                            logprob: lp,
                        })
                        .ok_or_else(|| {
                            WorkerError::Invariant(format!(
                                "requested logprob token id {id} is out of vocabulary range"
                            ))
                        })
                })
                .collect::<Result<Vec<_>>>()?;

            steps.push(StepLogprobs {
                selected: TokenLogprob {
                    token_id: token,
                    logprob: selected_logprob,
                },
                top,
                requested,
            });
        }

        result.push(Some(RequestLogprobs { steps }));
    }

    Ok(result)
}

#[cfg(test)]
mod tests {
    use candle_core::{Device, Tensor};

    use super::*;
    use crate::batch::{LogprobRequest, SamplingParams};
    use crate::tree::mask::TreeMask;

    fn request_with_logprobs(top_n: usize, token_ids: Vec<i64>) -> Request {
        Request {
            req_pool_index: 0,
            seq_len: 0,
            sampling: SamplingParams {
                temperature: 1.0,
                seed: 0,
            },
            grammar: None,
            logprob_request: Some(LogprobRequest { top_n, token_ids }),
        }
    }

    fn fixture() -> (LogitsOutput, BatchTree, VerifyOutput) {
        let device = Device::Cpu;
        let data = vec![
            1.0f32, 2.0, 3.0, 0.0, // node 0
            0.1, 0.2, 0.3, 5.0, // node 1
        ];
        let next_token_logits = Tensor::from_vec(data, (2, 4), &device).unwrap();
        let output = LogitsOutput {
            next_token_logits,
            hidden_states: None,
            topk_p: None,
            topk_index: None,
        };
        let batch_tree = BatchTree {
            draft_tokens: vec![0, 3],
            positions: vec![0, 1],
            retrive_index: vec![0, 1],
            retrive_next_token: vec![1, -1],
            retrive_next_sibling: vec![-1, -1],
            tree_mask: TreeMask::new(2, 2),
            seq_lens_sum: 2,
        };
        let verify = VerifyOutput {
            verified_id: vec![3],
            accept_length: vec![2],
            accepted_indices: vec![vec![0, 1]],
            committed_tokens: vec![vec![2, 3]],
            final_node_global: vec![1],
            hidden_states: Tensor::zeros((1, 1), DType::F32, &device).unwrap(),
        };
        (output, batch_tree, verify)
    }

    #[test]
    fn no_logprob_request_yields_none() {
        let (output, tree, verify) = fixture();
        let requests = vec![Request {
            req_pool_index: 0,
            seq_len: 0,
            sampling: SamplingParams {
                temperature: 1.0,
                seed: 0,
            },
            grammar: None,
            logprob_request: None,
        }];
        let result = attach(&output, &tree, 2, &requests, &verify).unwrap();
        assert!(result[0].is_none());
    }

    #[test]
    fn selected_logprob_matches_committed_token() {
        let (output, tree, verify) = fixture();
        let requests = vec![request_with_logprobs(2, vec![0])];
        let result = attach(&output, &tree, 2, &requests, &verify).unwrap();
        let steps = &result[0].as_ref().unwrap().steps;
        assert_eq!(steps[0].selected.token_id, 2);
        assert_eq!(steps[1].selected.token_id, 3);
        // node 1's logit for token 3 (5.0) dominates, so its logprob is
        // close to zero.
        assert!(steps[1].selected.logprob > -0.1);
    }

    #[test]
    fn top_n_is_sorted_descending() {
        let (output, tree, verify) = fixture();
        let requests = vec![request_with_logprobs(3, vec![])];
        let result = attach(&output, &tree, 2, &requests, &verify).unwrap();
        let top = &result[0].as_ref().unwrap().steps[0].top;
        assert_eq!(top.len(), 3);
        assert!(top.windows(2).all(|w| w[0].logprob >= w[1].logprob));
        assert_eq!(top[0].token_id, 2);
    }

    #[test]
    fn requested_token_ids_are_resolved() {
        let (output, tree, verify) = fixture();
        let requests = vec![request_with_logprobs(0, vec![1, 3])];
        let result = attach(&output, &tree, 2, &requests, &verify).unwrap();
        let requested = &result[0].as_ref().unwrap().steps[0].requested;
        assert_eq!(requested.len(), 2);
        assert_eq!(requested[0].token_id, 1);
        assert_eq!(requested[1].token_id, 3);
    }
}
