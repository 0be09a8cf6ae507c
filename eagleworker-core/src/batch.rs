//! The request/batch data model (spec §3). Generalizes the `Sequence`
//! references `pipeline/speculative.rs` threads through the wider pipeline
//! down to exactly what this crate's components need: enough per-request
//! bookkeeping to drive draft/verify/extend, nothing about tokenization or
//! HTTP-facing request shape (those stay with the scheduler).

use candle_core::Tensor;

/// How much of the hidden state a forward call is asked to return. Mirrors
/// `CaptureHiddenMode` in the source worker: `None` saves device memory when
/// nothing downstream needs it, `Last` is what every draft step after the
/// first needs, `Full` is required whenever a target forward seeds the next
/// `DraftInput`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureHiddenMode {
    None,
    Last,
    Full,
}

/// Which kind of forward the worker is about to dispatch. `Worker::forward`
/// picks between these based on the batch it is handed (spec §4.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForwardMode {
    /// Initial prompt, or any request still extending a prefix.
    Extend,
    /// Steady-state speculative decode iteration.
    Decode,
    /// No live work this step; collective shapes must still be honored
    /// under tensor parallelism (spec §4.6).
    Idle,
}

impl ForwardMode {
    pub fn is_extend(self) -> bool {
        matches!(self, ForwardMode::Extend)
    }

    pub fn is_idle(self) -> bool {
        matches!(self, ForwardMode::Idle)
    }
}

/// Per-request sampling configuration needed by acceptance sampling and
/// logprob attachment (spec §4.5, §4.7). The full sampling parameter set
/// (penalties, stop sequences, ...) belongs to the scheduler; only what
/// feeds the acceptance/logprob math lives here.
#[derive(Debug, Clone)]
pub struct SamplingParams {
    pub temperature: f32,
    /// Per-request RNG seed driving acceptance sampling, mirroring the
    /// teacher's per-sequence `Isaac64Rng` seeding (`pipeline/speculative.rs`).
    pub seed: u64,
}

/// What logprobs a request asked for, if any (spec §4.7).
#[derive(Debug, Clone, Default)]
pub struct LogprobRequest {
    /// Emit this many top logprobs per accepted token. Zero means "none".
    pub top_n: usize,
    /// Also emit logprobs for these specific token ids, if any.
    pub token_ids: Vec<i64>,
}

/// Narrow interface to the structured-output grammar engine (spec §1, §4.5):
/// the worker only ever needs a vocabulary mask, never the grammar's own
/// state machine.
pub trait GrammarMask: Send + Sync {
    /// Builds a `(vocab_size,)` boolean-as-f32 mask (1.0 = forbidden) for one
    /// draft node, given the node's path from the root. `forbidden` must be
    /// cleared by the caller between steps (spec §4.5: "prior-step masks
    /// must be cleared to avoid cross-step leakage").
    fn forbidden_mask(&self, path_tokens: &[i64], vocab_size: usize) -> Vec<bool>;
}

/// One active request in a batch.
pub struct Request {
    pub req_pool_index: usize,
    pub seq_len: usize,
    pub sampling: SamplingParams,
    pub grammar: Option<Box<dyn GrammarMask>>,
    pub logprob_request: Option<LogprobRequest>,
}

impl Request {
    pub fn has_grammar(&self) -> bool {
        self.grammar.is_some()
    }
}

/// An ordered batch of active requests plus the forward mode the scheduler
/// has already decided on (spec §3 "Batch"). `id` is the scheduler's own
/// handle for this batch, threaded back out unchanged in `ForwardOutput`
/// (spec §4.1's `forward(batch) -> (..., batch_id, ...)`).
pub struct Batch {
    pub id: u64,
    pub requests: Vec<Request>,
    pub mode: ForwardMode,
}

impl Batch {
    pub fn batch_size(&self) -> usize {
        self.requests.len()
    }

    pub fn is_idle(&self) -> bool {
        self.mode.is_idle() || self.requests.is_empty()
    }

    pub fn seq_lens(&self) -> Vec<i64> {
        self.requests.iter().map(|r| r.seq_len as i64).collect()
    }

    pub fn req_pool_indices(&self) -> Vec<usize> {
        self.requests.iter().map(|r| r.req_pool_index).collect()
    }

    pub fn has_grammar(&self) -> bool {
        self.requests.iter().any(Request::has_grammar)
    }
}

/// Per-iteration state produced by the previous target forward (spec §3
/// "DraftInput"). Tensor fields cross the `DraftRunner`/`TargetRunner` trait
/// boundary; everything else is plain host-side bookkeeping, per the design
/// note "Tree as arrays, not pointers" (spec §9).
#[derive(Clone)]
pub struct DraftInput {
    pub hidden_states: Tensor,
    /// The accepted token(s) to condition on next, one per request.
    pub verified_id: Vec<i64>,
    /// `topk_p[b]` has `speculative_eagle_topk` entries.
    pub topk_p: Vec<Vec<f32>>,
    /// `topk_index[b]` has `speculative_eagle_topk` entries, already passed
    /// through hot-token remap if configured (spec invariant 5).
    pub topk_index: Vec<Vec<i64>>,
    pub positions: Vec<i64>,
    pub accept_length: Vec<i64>,
    pub capture_hidden_mode: CaptureHiddenMode,
}

impl DraftInput {
    /// A `DraftInput` for a batch with no live work: dummy tensors/vectors
    /// sized to keep the collective communication shape stable under tensor
    /// parallelism (spec §4.6).
    pub fn idle(hidden_size: usize, device: &candle_core::Device) -> candle_core::Result<Self> {
        Ok(Self {
            hidden_states: Tensor::zeros((0, hidden_size), candle_core::DType::F32, device)?,
            verified_id: Vec::new(),
            topk_p: Vec::new(),
            topk_index: Vec::new(),
            positions: Vec::new(),
            accept_length: Vec::new(),
            capture_hidden_mode: CaptureHiddenMode::Last,
        })
    }
}
