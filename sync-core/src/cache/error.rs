//! Error types for the cache coordinator.

use thiserror::Error;

/// Errors returned synchronously by cache operations.
///
/// Only misconfiguration is an error; expiry, eviction and sweep outcomes are
/// silent to the caller.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CacheError {
    /// No policy registered for the namespace.
    #[error("no cache policy registered for namespace `{namespace}`")]
    Configuration {
        /// The namespace that was used.
        namespace: String,
    },
}

/// Failure of a caller-supplied fetch, shared with every awaiting caller.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("fetch failed: {message}")]
pub struct FetchError {
    message: String,
}

impl FetchError {
    /// Create a fetch error from anything displayable.
    pub fn new(message: impl std::fmt::Display) -> Self {
        Self {
            message: message.to_string(),
        }
    }

    /// The underlying failure message.
    pub fn message(&self) -> &str {
        &self.message
    }
}
