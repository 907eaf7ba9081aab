use thiserror::Error;

/// Errors that can occur while reading byte-aligned message buffers
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BufferError {
    /// Attempted to read past the end of the buffer
    #[error("read of {requested} bytes overruns buffer ({remaining} remaining)")]
    UnexpectedEnd { requested: usize, remaining: usize },
}
