//! Error types for the kvserve engine core.

use thiserror::Error;

/// Index of a block within one rank's pool.
pub type BlockId = usize;
/// Caller-assigned sequence identifier.
pub type SeqId = usize;

/// Error type for the engine core.
///
/// Kernel-level failures arrive as [`candle_core::Error`] and are wrapped in
/// [`KernelLaunchFailure`](Self::KernelLaunchFailure) by the dispatcher.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum Error {
    /// Device memory is exhausted or the request does not fit a block.
    #[error("allocation failed on rank {rank}: {reason}")]
    AllocationFailure { rank: usize, reason: String },

    /// A block id that the pool does not own, or that is already free.
    #[error("invalid block id {block_id} on rank {rank}")]
    InvalidBlockId { rank: usize, block_id: BlockId },

    /// A sequence would need more blocks than `max_blocks_per_seq`.
    #[error("sequence {seq_id} needs {required} blocks but at most {max} are allowed")]
    CapacityExceeded {
        seq_id: SeqId,
        required: usize,
        max: usize,
    },

    /// Inconsistent argument arrays, detected before any kernel launch.
    #[error("shape mismatch: {0}")]
    ShapeMismatch(String),

    /// The backend kernel reported an error. Not retried.
    #[error("{backend} attention kernel failed: {source}")]
    KernelLaunchFailure {
        backend: &'static str,
        #[source]
        source: candle_core::Error,
    },

    #[error("unknown sequence {0}")]
    UnknownSequence(SeqId),

    #[error("sequence {0} already exists")]
    DuplicateSequence(SeqId),

    /// `forward` was called before `initialize`.
    #[error("attention dispatcher is not initialized")]
    NotInitialized,

    #[error("attention dispatcher is already initialized")]
    AlreadyInitialized,

    #[error("position {position} is outside the rotary cache of {max} positions")]
    PositionOutOfRange { position: usize, max: usize },

    #[error("device rank {rank} is out of range for {num_devices} devices")]
    InvalidDevice { rank: usize, num_devices: usize },

    #[error("unknown tensor `{0}`")]
    UnknownTensor(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Candle(#[from] candle_core::Error),
}

/// Convenience type alias for `std::result::Result<T, Error>`.
pub type Result<T> = std::result::Result<T, Error>;
