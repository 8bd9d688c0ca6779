//! Error types for the MoE dispatch layer.

use thiserror::Error;

/// Errors raised while building, initializing or running an MoE layer.
///
/// No operation retries internally. After any error returned from
/// [`crate::moe::MoELayer::dispatch`] the output buffer contents are undefined.
#[derive(Error, Debug)]
pub enum MoEError {
    /// Invalid field counts, types or shapes supplied at construction or
    /// configure time, including malformed serialized configurations.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Scratch memory or execution queue could not be provided.
    #[error("resource error: {0}")]
    Resource(String),

    /// Weight source is missing or malformed, or buffer dimensions disagree
    /// with the declared shapes.
    #[error("data error: {0}")]
    Data(String),

    /// A weight transfer or expert compute step failed mid-pipeline.
    #[error("execution error on slot {slot} (expert {expert}): {message}")]
    Execution {
        slot: usize,
        expert: usize,
        message: String,
    },

    /// A slot worker panicked; the layer must be terminated and
    /// re-initialized before it can dispatch again.
    #[error("layer is poisoned: {0}")]
    Poisoned(String),

    #[error("tensor error: {0}")]
    Tensor(#[from] candle_core::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl MoEError {
    pub(crate) fn config(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    pub(crate) fn data(msg: impl Into<String>) -> Self {
        Self::Data(msg.into())
    }

    pub(crate) fn resource(msg: impl Into<String>) -> Self {
        Self::Resource(msg.into())
    }

    /// Whether the error leaves the layer unusable for further invocations.
    pub fn is_poisoning(&self) -> bool {
        matches!(self, Self::Poisoned(_))
    }
}

pub type Result<T> = std::result::Result<T, MoEError>;
