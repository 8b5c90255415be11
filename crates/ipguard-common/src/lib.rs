//! ipguard common - shared types for per-app IP firewall rules
//!
//! This crate provides:
//! - Rule and status definitions
//! - Address normalization (host/network/port, IPv4-in-IPv6 detection)
//! - The rule store repository abstraction
//! - Error handling

#![warn(clippy::all)]

pub mod address;
pub mod error;
pub mod repository;
pub mod rule;

pub use address::{normalize_port, HostAddress, UNSPECIFIED_PORT};
pub use error::*;
pub use repository::{InMemoryRuleStore, RuleStore};
pub use rule::*;
