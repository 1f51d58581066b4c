use std::{fmt, io};
use thiserror::Error;

/// Unified error type for all hhj operations.
///
/// The join engine distinguishes fatal failures (configuration, resource
/// exhaustion, row source and spill corruption) from the cooperative
/// [`Error::Cancelled`] signal. Fatal errors abort the join after its scoped
/// working directory has been removed; cancellation is reported to the caller
/// as its own outcome.
///
/// # Thread Safety
///
/// `Error` is `Send` and `Sync` so it can cross the thread boundary between a
/// join running in a worker and the caller polling its monitor.
#[derive(Error, Debug)]
pub enum Error {
    /// I/O error during spill directory or spill file operations.
    ///
    /// Raw `io::Error`s only surface here when they happen outside a spill
    /// write (for example while creating the scoped working directory). Spill
    /// writes and handle allocation failures are reported as
    /// [`Error::ResourceExhausted`] instead.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Arrow library error raised while adapting record batches into rows.
    #[error("Arrow error: {0}")]
    Arrow(#[from] arrow::error::ArrowError),

    /// Malformed join specification or tuning parameters.
    ///
    /// Raised before any row is processed:
    /// - join key lists of different arity on the two sides
    /// - key columns that do not exist in the input schema
    /// - key column types that cannot be compared with each other
    /// - thresholds outside their permitted range (e.g. a memory threshold of
    ///   `1.5`, or fewer than two permitted open files)
    ///
    /// # Recovery
    ///
    /// Fix the specification and invoke the join again.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Disk or file-handle resources ran out.
    ///
    /// This covers failed spill writes (disk full, permission denied) and the
    /// case where a file handle is needed but every permitted handle is held by
    /// an active reader, so nothing can be evicted. The join aborts; the
    /// temporary working directory is removed before the error reaches the
    /// caller.
    #[error("Resource exhausted: {0}")]
    ResourceExhausted(String),

    /// The join was cancelled cooperatively.
    ///
    /// Not a failure in the usual sense: the coordinator converts this into
    /// a cancellation outcome and never hands partial output to the caller.
    #[error("join cancelled")]
    Cancelled,

    /// A row source failed to deliver a row, or a row's values disagree with
    /// the schema it was declared with.
    ///
    /// The join cannot decide per-cell correctness on its own, so these are
    /// fatal.
    #[error("Row source error: {0}")]
    RowSource(String),

    /// A spilled frame could not be decoded when its bucket was reloaded.
    #[error("Spill file corrupted: {0}")]
    SpillCorrupted(String),

    /// Internal error indicating a bug or unexpected state.
    ///
    /// This error should never occur during normal operation. The message
    /// names the invariant that was violated.
    #[error("An internal operation failed: {0}")]
    Internal(String),
}

impl Error {
    /// Create a configuration error from any displayable message.
    ///
    /// # Examples
    ///
    /// ```
    /// use hhj_result::Error;
    ///
    /// let err = Error::configuration("left and right key lists differ in length");
    /// assert!(matches!(err, Error::Configuration(msg) if msg.contains("differ")));
    /// ```
    #[inline]
    pub fn configuration<E: fmt::Display>(err: E) -> Self {
        Error::Configuration(err.to_string())
    }

    /// Create a resource exhaustion error from any displayable error.
    ///
    /// # Examples
    ///
    /// ```
    /// use hhj_result::Error;
    ///
    /// let io_err = std::io::Error::other("disk full");
    /// let err = Error::resource_exhausted(io_err);
    /// assert!(matches!(err, Error::ResourceExhausted(msg) if msg.contains("disk full")));
    /// ```
    #[inline]
    pub fn resource_exhausted<E: fmt::Display>(err: E) -> Self {
        Error::ResourceExhausted(err.to_string())
    }

    /// Create a row source error from any displayable error.
    #[inline]
    pub fn row_source<E: fmt::Display>(err: E) -> Self {
        Error::RowSource(err.to_string())
    }

    /// Whether this error is the cooperative cancellation signal.
    #[inline]
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Error::Cancelled)
    }
}
