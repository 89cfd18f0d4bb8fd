//! Error types for the download pipeline.

use thiserror::Error;

/// Errors from a single track's download pipeline.
///
/// Every variant is terminal for the attempt: the worker reports it via
/// `mark_failed` and the item waits for an explicit retry.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// Every catalog endpoint was exhausted without data.
    #[error("no endpoint returned data for {operation}")]
    NoEndpointData {
        /// The operation that came up empty.
        operation: &'static str,
    },

    /// The stream-URL payload was missing or malformed.
    #[error("malformed stream payload: {message}")]
    BadStreamPayload {
        /// What was wrong with it.
        message: String,
    },

    /// The stream host rejected the transfer.
    #[error("stream request returned HTTP {status}")]
    StreamStatus {
        /// The status code.
        status: u16,
    },

    /// HTTP transport failure during the transfer.
    #[error("stream transfer failed: {0}")]
    Http(#[from] reqwest::Error),

    /// Writing the file to disk failed.
    #[error("disk write failed: {0}")]
    Io(#[from] std::io::Error),

    /// The post-processor rejected the file.
    #[error("post-processing failed: {message}")]
    PostProcess {
        /// The post-processor's failure message.
        message: String,
    },
}
