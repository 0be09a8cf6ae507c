use thiserror::Error;

use crate::kv_pool::AllocatorStateToken;

/// Error taxonomy for the speculative worker, matching the five classes the
/// surrounding scheduler distinguishes: configuration errors are fatal at
/// construction, allocator errors are locally recoverable, numeric and
/// invariant errors are fatal for the current batch, and upstream conditions
/// (empty/idle batch) are not errors at all and never construct this type.
#[derive(Debug, Error)]
pub enum WorkerError {
    /// Unsupported backend, malformed hot-token map, or another problem that
    /// can only be fixed by reconfiguring the worker. Fatal at construction.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// The KV allocator could not satisfy a request. The allocator state has
    /// already been restored to `backup` by the time this is returned; the
    /// scheduler may retry the batch after shedding load.
    #[error("allocator exhausted while allocating {requested} slots: {reason}")]
    Allocator {
        requested: usize,
        reason: String,
        backup: AllocatorStateToken,
    },

    /// NaN observed in logits with NaN detection enabled. Fatal for the
    /// batch; no partial state may be committed after this is raised.
    #[error("numeric error: {0}")]
    Numeric(String),

    /// A structural invariant (tree size, capture-mode agreement, per-step
    /// list lengths) was violated. This is always a programmer error, never
    /// a condition recoverable by the caller.
    #[error("invariant violation: {0}")]
    Invariant(String),

    /// A condition on the upstream (scheduler-supplied) batch that this
    /// worker cannot proceed with but that is not itself a bug — e.g. a
    /// batch mixing extend and decode requests in a way the caller should
    /// never construct. Unlike the other variants, a genuinely empty or
    /// idle batch is never reported through this type at all; it produces
    /// an idle `ForwardOutput` instead (spec §7, error kind 5).
    #[error("upstream batch error: {0}")]
    Upstream(String),
}

pub type Result<T> = std::result::Result<T, WorkerError>;

impl WorkerError {
    /// Logs the error at the level appropriate to its class before the
    /// caller propagates it, mirroring `eagle_worker.py`'s
    /// `logger.error(...)` immediately preceding its `raise`.
    pub fn log(self) -> Self {
        match &self {
            WorkerError::Configuration(msg) => tracing::error!(%msg, "configuration error"),
            WorkerError::Allocator { reason, .. } => {
                tracing::warn!(reason = %reason, "allocator backout, scheduler should shed load")
            }
            WorkerError::Numeric(msg) => tracing::error!(%msg, "fatal numeric error"),
            WorkerError::Invariant(msg) => tracing::error!(%msg, "invariant violation"),
            WorkerError::Upstream(msg) => tracing::error!(%msg, "upstream batch error"),
        }
        self
    }
}
