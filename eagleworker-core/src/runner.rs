//! Narrow interfaces to the two model runtimes the worker orchestrates
//! (spec §6). Weight loading, tensor kernels, and tokenization live behind
//! these traits and are out of scope for this crate: the worker only ever
//! calls through them.

use candle_core::{Result, Tensor};

use crate::batch::CaptureHiddenMode;
use crate::config::AttentionBackendKind;
use crate::tree::mask::TreeMask;

/// One step's worth of input to either model runner: a prefill, a single
/// decode/draft step, or a tree-masked verify forward, always tagged with
/// the cache slots the runner should write into.
#[derive(Debug, Clone)]
pub struct ForwardBatch {
    pub input_ids: Vec<i64>,
    pub positions: Vec<i64>,
    pub out_cache_loc: Vec<i64>,
    pub seq_lens: Vec<i64>,
    pub seq_lens_sum: i64,
    /// Per-token ancestor bitset, present only for target verification
    /// forwards (spec §3 `VerifyInput::tree_mask`).
    pub tree_mask: Option<TreeMask>,
    pub capture_hidden_mode: CaptureHiddenMode,
}

/// What a model runner returns from one `forward` call (spec §6).
#[derive(Clone)]
pub struct LogitsOutput {
    pub next_token_logits: Tensor,
    pub hidden_states: Option<Tensor>,
    /// Populated only when the runner was asked for top-k (draft steps);
    /// `topk_p[i]`/`topk_index[i]` line up with `input_ids[i]`.
    pub topk_p: Option<Vec<Vec<f32>>>,
    pub topk_index: Option<Vec<Vec<i64>>>,
}

/// The draft model's runtime.
pub trait DraftRunner: Send + Sync {
    fn forward(&mut self, batch: &ForwardBatch, skip_attn_backend_init: bool) -> Result<LogitsOutput>;

    /// Selects the multi-step draft backend (and, when the backend supports
    /// it, a prefill-capable extend backend) matching `kind` (spec §6).
    fn init_attention_backend(&mut self, kind: AttentionBackendKind) -> Result<()>;

    /// Shares the target's embedding table (and, for non-EAGLE3, a
    /// hot-vocabulary-projected head) with the draft model (spec §6,
    /// `get_embed_and_head`).
    fn set_embed_and_head(&mut self, embed: Tensor, head: Option<Tensor>) -> Result<()>;

    fn hidden_size(&self) -> usize;
}

/// The target model's runtime.
pub trait TargetRunner: Send + Sync {
    fn forward(&mut self, batch: &ForwardBatch, skip_attn_backend_init: bool) -> Result<LogitsOutput>;

    fn init_attention_backend(&mut self, kind: AttentionBackendKind) -> Result<()>;

    /// Returns `(embed, head)` so the worker can hand them to the draft
    /// model at construction (spec §6).
    fn get_embed_and_head(&self) -> Result<(Tensor, Tensor)>;

    fn hidden_size(&self) -> usize;
}
