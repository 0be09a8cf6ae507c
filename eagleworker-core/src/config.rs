use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

use crate::error::{Result, WorkerError};

/// Which speculative decoding algorithm the draft model implements.
///
/// `Eagle3` differs from `Eagle` in that the draft model does not share the
/// target's `lm_head` and therefore never needs hot-token remapping: it has
/// its own (possibly compact) vocabulary end to end.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SpeculativeAlgorithm {
    Eagle,
    Eagle3,
}

impl SpeculativeAlgorithm {
    pub fn is_eagle3(self) -> bool {
        matches!(self, SpeculativeAlgorithm::Eagle3)
    }
}

/// One of the attention kernel backends the surrounding runtime may select.
/// The worker only uses this to pick which multi-step draft backend and
/// (optionally) prefill-capable extend backend to ask the `DraftRunner` for;
/// the kernels themselves are out of scope for this crate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum AttentionBackendKind {
    FlashInfer,
    FlashInferMla,
    Triton,
    Fa3,
    FlashMla,
}

impl AttentionBackendKind {
    /// Whether this backend exposes a separate prefill-capable extend
    /// backend (`has_prefill_wrapper_verify` in the original worker), used
    /// during `forward_draft_extend`/`forward_draft_extend_after_decode`.
    pub fn has_prefill_extend_backend(self) -> bool {
        matches!(
            self,
            AttentionBackendKind::FlashInfer | AttentionBackendKind::FlashInferMla
        )
    }
}

/// Full configuration recognized by the worker (spec §6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpeculativeWorkerConfig {
    pub speculative_algorithm: SpeculativeAlgorithm,
    /// K: branching factor at each draft step. Must be positive.
    pub speculative_eagle_topk: usize,
    /// S: depth of the draft expansion before verification.
    pub speculative_num_steps: usize,
    /// D: total candidate-tree nodes kept per request.
    /// Must satisfy `1 <= D <= 1 + K + K^2 + ... + K^S`.
    pub speculative_num_draft_tokens: usize,
    /// Optional path (local file or `hf-hub` repo-relative path) to an
    /// injective draft-vocabulary -> target-vocabulary map. Ignored for
    /// `Eagle3`.
    pub speculative_token_map: Option<String>,
    /// Fixed KV page size for this deployment. 1 means unpaged.
    pub page_size: usize,
    pub attention_backend: AttentionBackendKind,
    pub enable_nan_detection: bool,
    /// When true, the draft model runs inside its own TP group rather than
    /// sharing the target's; see `tp_group`.
    pub enable_dp_attention: bool,
    /// When true, the draft S-step loop runs eagerly instead of via a
    /// captured device-side graph replay.
    pub disable_cuda_graph: bool,
}

impl SpeculativeWorkerConfig {
    /// Validates the configuration, returning the fatal
    /// `WorkerError::Configuration` class described in spec §7 on failure.
    /// Must be called once at construction; the worker never re-validates
    /// per batch.
    pub fn validate(&self) -> Result<()> {
        if self.speculative_eagle_topk == 0 {
            return Err(WorkerError::Configuration(
                "speculative_eagle_topk must be positive".into(),
            ));
        }
        if self.speculative_num_steps == 0 {
            return Err(WorkerError::Configuration(
                "speculative_num_steps must be positive".into(),
            ));
        }
        if self.speculative_num_draft_tokens == 0 {
            return Err(WorkerError::Configuration(
                "speculative_num_draft_tokens must be positive".into(),
            ));
        }
        let max_tree_size = max_candidate_tree_size(
            self.speculative_eagle_topk,
            self.speculative_num_steps,
        );
        if self.speculative_num_draft_tokens > max_tree_size {
            return Err(WorkerError::Configuration(format!(
                "speculative_num_draft_tokens ({}) exceeds the maximum candidate tree size \
                 1 + K + K^2 + ... + K^S = {max_tree_size} for K={}, S={}",
                self.speculative_num_draft_tokens,
                self.speculative_eagle_topk,
                self.speculative_num_steps,
            )));
        }
        if self.page_size == 0 {
            return Err(WorkerError::Configuration(
                "page_size must be positive".into(),
            ));
        }
        if self.speculative_algorithm.is_eagle3() && self.speculative_token_map.is_some() {
            tracing::warn!(
                "speculative_token_map specified, but EAGLE3 models already have a hot \
                 vocabulary; ignoring the specified token map"
            );
        }
        Ok(())
    }

    /// `1 + K*S`, the typical choice of `speculative_num_draft_tokens`.
    pub fn default_draft_token_count(&self) -> usize {
        1 + self.speculative_eagle_topk * self.speculative_num_steps
    }
}

/// `1 + K + K^2 + ... + K^S`, the size of the full candidate tree before
/// `TreeBuilder` prunes it down to `D` nodes.
pub fn max_candidate_tree_size(topk: usize, steps: usize) -> usize {
    let mut total = 1usize;
    let mut term = 1usize;
    for _ in 0..steps {
        term = term.saturating_mul(topk);
        total = total.saturating_add(term);
    }
    total
}
