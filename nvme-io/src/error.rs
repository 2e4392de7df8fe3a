//! Error types for nvme-io

use crate::dma::DmaBuf;

/// Result type for nvme-io operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for nvme-io operations
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Invalid argument provided
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Enumerating controllers on the transport failed
    #[error("Failed to enumerate NVMe controllers: {0}")]
    ProbeFailed(String),

    /// Controller not found or could not be attached
    #[error("NVMe controller not found: {0}")]
    ControllerNotFound(String),

    /// Controller still referenced by namespaces, queue pairs or buffers
    #[error("NVMe controller {0} still has outstanding references")]
    ControllerBusy(String),

    /// Transport refused to detach the controller
    #[error("Failed to detach NVMe controller {0}")]
    DetachFailed(String),

    /// Namespace not found or inactive
    #[error("NVMe namespace {0} not found")]
    NamespaceNotFound(u32),

    /// Queue pair allocation failed
    #[error("NVMe queue pair allocation failed")]
    QpairAlloc,

    /// Memory allocation failed on every tier
    #[error("DMA allocation of {0} bytes failed")]
    MemoryAlloc(usize),

    /// Command was not accepted by the controller
    #[error("Command submission failed: {0}")]
    SubmitFailed(String),

    /// Transport-level failure while processing completions
    #[error("Transport error: {0}")]
    Transport(String),

    /// NVMe command completed with an error status
    #[error("NVMe error: SCT={sct}, SC={sc}")]
    NvmeError {
        /// Status Code Type
        sct: u8,
        /// Status Code
        sc: u8,
    },

    /// Polling limit reached before the awaited completions arrived
    #[error("Completion polling gave up after {iterations} iterations")]
    PollTimeout {
        /// Number of poll iterations performed
        iterations: u64,
    },

    /// Operation was cancelled
    #[error("Operation cancelled")]
    Cancelled,

    /// Configuration could not be parsed
    #[error("Invalid configuration: {0}")]
    Config(#[from] serde_json::Error),
}

/// A submission the controller did not accept.
///
/// The command never reached the device, so its buffer comes back to the
/// submitter, which is responsible for releasing it. Dropping the error frees
/// the buffer through its own tier.
#[derive(Debug, thiserror::Error)]
#[error("{error}")]
pub struct SubmitError {
    /// Why the command was rejected
    #[source]
    pub error: Error,
    /// The buffer that was attached to the rejected command
    pub buf: DmaBuf,
}

impl SubmitError {
    /// Take the buffer back, discarding the reason.
    pub fn into_buf(self) -> DmaBuf {
        self.buf
    }
}

impl From<SubmitError> for Error {
    fn from(err: SubmitError) -> Self {
        err.error
    }
}
