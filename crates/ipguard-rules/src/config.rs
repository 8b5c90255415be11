//! Rule engine configuration

use crate::cache::DEFAULT_CACHE_CAPACITY;
use crate::error::{IpRulesError, IpRulesResult};
use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct IpRulesConfig {
    /// Maximum number of cached decisions
    pub cache_capacity: u64,
    /// Translate NAT64, 6to4 and IPv4-compatible IPv6 destinations to IPv4
    /// before giving up on a lookup. IPv4-mapped addresses always translate.
    pub filter_ipv4_in_ipv6: bool,
}

impl Default for IpRulesConfig {
    fn default() -> Self {
        Self {
            cache_capacity: DEFAULT_CACHE_CAPACITY,
            filter_ipv4_in_ipv6: true,
        }
    }
}

impl IpRulesConfig {
    pub fn from_json(json: &str) -> IpRulesResult<Self> {
        let config: Self =
            serde_json::from_str(json).map_err(|e| IpRulesError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> IpRulesResult<Self> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path)
            .map_err(|e| IpRulesError::Config(format!("{}: {}", path.display(), e)))?;
        Self::from_json(&json)
    }

    fn validate(&self) -> IpRulesResult<()> {
        if self.cache_capacity == 0 {
            return Err(IpRulesError::Config("cache_capacity must be > 0".into()));
        }
        Ok(())
    }
}
