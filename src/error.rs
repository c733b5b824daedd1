//! Error types for the address-management engine.
//!
//! All fallible operations in this crate return [`Result<T>`], which uses
//! the [`Error`] enum for error variants. Callers that need to distinguish
//! recoverable conditions use [`Error::is_not_found`] and
//! [`Error::is_txn_failed`].

/// Errors that can occur while managing networks, members, and leases.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// File system or network I/O error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error (stored values or config).
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// YAML error while reading a spec document.
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// Malformed DHCP packet received.
    #[error("Invalid DHCP packet: {0}")]
    InvalidPacket(String),

    /// Invalid service configuration.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Socket creation or configuration error.
    #[error("Socket error: {0}")]
    Socket(String),

    /// The requested key does not exist in the store.
    #[error("not found: {0}")]
    NotFound(String),

    /// An optimistic-concurrency precondition did not hold.
    ///
    /// Another writer changed one of the keys since it was read. The caller
    /// may re-read and retry.
    #[error("txn failed: {0}")]
    TxnFailed(String),

    /// Malformed MAC, address, range, or a request that breaks a model rule.
    #[error("validation error: {0}")]
    Validation(String),

    /// Every offset in the network's pool is allocated.
    #[error("address pool for network '{0}' is exhausted")]
    PoolExhausted(String),

    /// The network has no dynamic address pool.
    #[error("network '{0}' has no address pool")]
    NoPool(String),

    /// The backing store could not be reached or answered with an error.
    #[error("store error: {0}")]
    Backend(String),
}

impl Error {
    /// Returns true when the error reports an absent key.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound(_))
    }

    /// Returns true when the error reports a concurrent-write conflict.
    pub fn is_txn_failed(&self) -> bool {
        matches!(self, Error::TxnFailed(_))
    }
}

/// A specialized Result type for address-management operations.
pub type Result<T> = std::result::Result<T, Error>;
