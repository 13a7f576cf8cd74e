//! Error taxonomy for the capture core
//!
//! Every component returns its own error to the immediate caller. None of
//! these are fatal: the orchestrator logs them and carries on polling.

use thiserror::Error;

use crate::capture::frame::ConsumerId;

/// Errors raised by a sensor backend
#[derive(Debug, Error)]
pub enum SensorError {
    #[error("sensor I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("sensor stream is not running")]
    NotStreaming,

    #[error("unsupported sensor configuration: {0}")]
    Unsupported(String),
}

/// Failures of [`FrameSource::acquire`](crate::capture::FrameSource::acquire)
#[derive(Debug, Error)]
pub enum AcquireError {
    #[error("all {pool_size} frame buffers are checked out")]
    Busy { pool_size: usize },

    #[error("sensor hardware failure: {0}")]
    HardwareFailure(#[from] SensorError),
}

impl AcquireError {
    pub fn is_busy(&self) -> bool {
        matches!(self, AcquireError::Busy { .. })
    }
}

/// Misuse of a buffer checkout. These indicate a bug in the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ReleaseError {
    #[error("checkout belongs to a different frame source")]
    ForeignSource,

    #[error("slot {slot} does not exist in a pool of {pool_size}")]
    UnknownSlot { slot: usize, pool_size: usize },

    #[error("slot {slot} is not checked out")]
    NotCheckedOut { slot: usize },

    #[error("slot {slot} was re-acquired since this checkout (generation {held}, now {current})")]
    Stale {
        slot: usize,
        held: u64,
        current: u64,
    },

    #[error("slot {slot} is owned by {owner}, not {caller}")]
    NotOwner {
        slot: usize,
        owner: ConsumerId,
        caller: ConsumerId,
    },

    #[error("slot {slot} is mid-conversion")]
    Converting { slot: usize },
}

/// Failures of [`FrameCodec::normalize`](crate::capture::FrameCodec::normalize)
#[derive(Debug, Error)]
pub enum EncodingError {
    #[error("frame has zero area ({width}x{height})")]
    EmptyFrame { width: u32, height: u32 },

    #[error("{format:?} frame of {width}x{height} needs {expected} bytes, buffer holds {actual}")]
    BufferSize {
        format: crate::capture::PixelFormat,
        width: u32,
        height: u32,
        expected: usize,
        actual: usize,
    },

    #[error("JPEG encoder rejected frame: {0}")]
    Encoder(#[from] image::ImageError),

    #[error("frame checkout is invalid: {0}")]
    Checkout(#[from] ReleaseError),
}

/// Failures of the client transport
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("peer disconnected")]
    Disconnected,

    #[error("transport buffer is full")]
    Full,

    #[error("transport write failed: {0}")]
    Io(#[from] std::io::Error),
}

/// Failures of the persistence collaborator
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("storage I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid image name: {0:?}")]
    InvalidName(String),

    #[error("image not found: {0}")]
    NotFound(String),
}

/// Outcome of a failed capture-and-persist cycle
#[derive(Debug, Error)]
pub enum CaptureError {
    #[error(transparent)]
    Acquire(#[from] AcquireError),

    #[error(transparent)]
    Encoding(#[from] EncodingError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Release(#[from] ReleaseError),

    #[error("capture orchestrator is not running")]
    Unavailable,
}

impl CaptureError {
    /// Whether trying again on a later poll can succeed
    pub fn is_retryable(&self) -> bool {
        matches!(self, CaptureError::Acquire(_) | CaptureError::Encoding(_))
    }
}

/// Configuration loading and validation errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to load configuration: {0}")]
    Load(#[from] config::ConfigError),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}
