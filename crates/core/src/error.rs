//! Error types for the stream multiplexer.

/// Errors that can occur in the stream multiplexer.
///
/// Variants map to specific failure modes across the stack:
///
/// - **Admission**: [`CapacityExceeded`](Self::CapacityExceeded),
///   [`InvalidSource`](Self::InvalidSource). Rejected synchronously by
///   `start_stream`; no state is created.
/// - **Lookup**: [`StreamNotFound`](Self::StreamNotFound),
///   [`NotAvailable`](Self::NotAvailable).
/// - **Adapter**: [`Connect`](Self::Connect), [`Runtime`](Self::Runtime).
///   Drive a stream into `Retrying`. Never returned to callers, only carried
///   by [`StreamEvent::Error`](crate::events::StreamEvent::Error).
/// - **Terminal**: [`TerminalFailure`](Self::TerminalFailure). Retries
///   exhausted, surfaced through
///   [`StreamEvent::Failed`](crate::events::StreamEvent::Failed).
#[derive(Debug, thiserror::Error)]
pub enum MuxError {
    /// Underlying I/O or process error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The configured ceiling of concurrently active streams is reached.
    #[error("connection ceiling reached ({max} active streams)")]
    CapacityExceeded { max: usize },

    /// No stream with the given id is registered.
    #[error("stream not found: {0}")]
    StreamNotFound(String),

    /// The adapter failed to establish output.
    #[error("connect error: {0}")]
    Connect(String),

    /// The adapter died after output was flowing.
    #[error("runtime error: {0}")]
    Runtime(String),

    /// Retries are exhausted; the stream will not be retried again.
    #[error("retries exhausted for {id} after {attempts} failed attempts")]
    TerminalFailure { id: String, attempts: u32 },

    /// The stream exists but is not producing output a client can attach to.
    #[error("stream not available: {0}")]
    NotAvailable(String),

    /// The source descriptor cannot serve the requested stream.
    #[error("invalid source: {0}")]
    InvalidSource(String),

    /// Rejected [`ManagerConfig`](crate::config::ManagerConfig) value.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

/// Convenience alias for `Result<T, MuxError>`.
pub type Result<T> = std::result::Result<T, MuxError>;
