//! Error types for the rule engine

use ipguard_common::{AddressError, StoreError};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum IpRulesError {
    /// Malformed address or port; nothing was changed
    #[error("invalid rule address: {0}")]
    Address(#[from] AddressError),

    /// Rule store write failed; in-memory state was left untouched
    #[error("rule store failure: {0}")]
    Store(#[from] StoreError),

    #[error("config error: {0}")]
    Config(String),
}

pub type IpRulesResult<T> = Result<T, IpRulesError>;
