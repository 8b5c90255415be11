//! Error types shared by the ipguard crates

use thiserror::Error;

/// Address normalization errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AddressError {
    /// Empty address string
    #[error("empty address")]
    Empty,

    /// Not an IPv4/IPv6 address or network
    #[error("invalid address: {0}")]
    Invalid(String),

    /// Prefix length missing, unparseable or wider than the address family
    #[error("invalid prefix length in {0}")]
    InvalidPrefix(String),

    /// Port given both inline and as an argument, with different values
    #[error("conflicting ports for {address}: {inline} vs {explicit}")]
    PortMismatch {
        address: String,
        inline: u16,
        explicit: u16,
    },
}

/// Rule store errors
#[derive(Error, Debug, Clone)]
pub enum StoreError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("IO error: {0}")]
    Io(String),

    #[error("serialization error: {0}")]
    Serialization(String),
}

impl From<std::io::Error> for StoreError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

/// Result type for rule store operations
pub type StoreResult<T> = Result<T, StoreError>;
