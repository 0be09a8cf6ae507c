//! A speculative decoding worker implementing EAGLE-style draft/verify
//! generation: a draft model proposes a tree of candidate continuations,
//! the target model verifies the whole tree in one masked forward pass,
//! and accepted tokens advance generation (see `worker::Worker`).

pub mod batch;
pub mod config;
pub mod draft_extend;
pub mod draft_loop;
pub mod error;
pub mod hot_token;
pub mod kv_pool;
pub mod logprob;
pub mod numeric;
pub mod runner;
pub mod sampling;
pub mod tp_group;
pub mod tree;
pub mod verifier;
pub mod worker;

pub use batch::{Batch, CaptureHiddenMode, DraftInput, ForwardMode, GrammarMask, Request, SamplingParams};
pub use config::{AttentionBackendKind, SpeculativeAlgorithm, SpeculativeWorkerConfig};
pub use error::{Result, WorkerError};
pub use runner::{DraftRunner, ForwardBatch, LogitsOutput, TargetRunner};
pub use worker::{ForwardOutput, Worker};
