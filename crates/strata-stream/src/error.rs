//! Streaming error types.

/// Errors that abort an update tick. Transient resource and state-desync
/// conditions are handled in place and never surface here.
#[derive(Debug, thiserror::Error)]
pub enum StreamingError {
    /// More viewers than the configured pairing table supports.
    #[error("viewer count {count} exceeds the configured maximum {max}")]
    TooManyViewers { count: usize, max: u32 },
}
