//! Per-app IP rule engine
//!
//! Decides, for every outbound connection `(uid, ip, port)`, whether to
//! BLOCK, TRUST, BYPASS_UNIVERSAL or defer (NONE) to the rest of the firewall.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                        resolve()                             │
//! │                                                              │
//! │  ┌────────────┐  Miss  ┌────────────┐  Miss  ┌─────────────┐ │
//! │  │  Decision  │───────►│   Exact    │───────►│  Wildcards  │ │
//! │  │   Cache    │        │   rules    │        │ (longest    │ │
//! │  │   (10K)    │        │ host[:port]│        │  prefix)    │ │
//! │  └────────────┘        └────────────┘        └─────────────┘ │
//! │                     Miss: retry without port,                │
//! │                     then with the IPv4 equivalent            │
//! └──────────────────────────────────────────────────────────────┘
//!
//!  add/update/remove ──► RuleStore ──► RuleIndex ──► cache invalidation
//! ```

#![warn(clippy::all)]

pub mod cache;
pub mod config;
pub mod engine;
pub mod error;
pub mod index;
pub mod store;

pub use cache::DecisionCache;
pub use config::IpRulesConfig;
pub use engine::{IpRulesManager, IpRulesStats};
pub use error::{IpRulesError, IpRulesResult};
pub use index::{LookupKey, RuleIndex};
pub use store::JsonFileRuleStore;

pub use ipguard_common::{
    HostAddress, InMemoryRuleStore, IpRule, IpRuleStatus, RuleId, RuleStore, UID_EVERYBODY,
};
