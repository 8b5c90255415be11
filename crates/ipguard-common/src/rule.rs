//! IP rule types
//!
//! A rule binds an app (uid) and a host or network address, optionally
//! narrowed to one port, to a firewall status.

use crate::address::{normalize_port, HostAddress};
use crate::error::AddressError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Uid of rules that apply to every app
pub const UID_EVERYBODY: i32 = -1000;

/// Rule status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[repr(u8)]
pub enum IpRuleStatus {
    /// No rule, defer to the rest of the firewall
    #[default]
    None = 0,
    /// Block the connection
    Block = 1,
    /// Allow the connection, skipping app-level blocks
    Trust = 2,
    /// Allow the connection, skipping universal firewall rules as well
    BypassUniversal = 3,
}

impl IpRuleStatus {
    /// Persisted id
    #[inline]
    pub const fn id(self) -> u8 {
        self as u8
    }

    /// Unknown ids map to `None`
    pub const fn from_id(id: u8) -> Self {
        match id {
            1 => Self::Block,
            2 => Self::Trust,
            3 => Self::BypassUniversal,
            _ => Self::None,
        }
    }

    #[inline]
    pub const fn is_blocked(self) -> bool {
        matches!(self, Self::Block)
    }

    #[inline]
    pub const fn is_none(self) -> bool {
        matches!(self, Self::None)
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::None => "NONE",
            Self::Block => "BLOCK",
            Self::Trust => "TRUST",
            Self::BypassUniversal => "BYPASS_UNIVERSAL",
        }
    }
}

impl fmt::Display for IpRuleStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Address family of a rule
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum IpRuleType {
    Ipv4 = 0,
    Ipv6 = 2,
}

/// Store key of a rule: `(uid, normalized address, port)`
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RuleId {
    pub uid: i32,
    pub address: String,
    pub port: Option<u16>,
}

impl RuleId {
    pub fn new(uid: i32, address: impl Into<String>, port: Option<u16>) -> Self {
        Self {
            uid,
            address: address.into(),
            port: normalize_port(port),
        }
    }
}

impl fmt::Display for RuleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.port {
            Some(port) => write!(f, "{}@{}:{}", self.uid, self.address, port),
            None => write!(f, "{}@{}", self.uid, self.address),
        }
    }
}

/// Persisted IP rule
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IpRule {
    /// Owning app, or [`UID_EVERYBODY`]
    pub uid: i32,
    /// Normalized address text (`1.2.3.4`, `10.0.0.0/8`, `::`)
    pub address: String,
    /// `None` means any port
    #[serde(default)]
    pub port: Option<u16>,
    /// Reserved, always empty
    #[serde(default)]
    pub protocol: String,
    pub status: IpRuleStatus,
    pub rule_type: IpRuleType,
    #[serde(default = "default_active")]
    pub is_active: bool,
    /// Set when the address covers more than one host
    #[serde(default)]
    pub wildcard: bool,
    pub modified_at: DateTime<Utc>,
}

fn default_active() -> bool {
    true
}

impl IpRule {
    /// Build a rule from user input, normalizing the address.
    ///
    /// Fails on malformed addresses; nothing is stored or indexed then.
    pub fn new(
        uid: i32,
        ip: &str,
        port: Option<u16>,
        status: IpRuleStatus,
    ) -> Result<Self, AddressError> {
        let host = HostAddress::parse(ip, port)?;
        Ok(Self::from_host(uid, &host, status))
    }

    pub fn from_host(uid: i32, host: &HostAddress, status: IpRuleStatus) -> Self {
        Self {
            uid,
            address: host.to_normalized_string(),
            port: host.port(),
            protocol: String::new(),
            status,
            rule_type: if host.is_ipv6() {
                IpRuleType::Ipv6
            } else {
                IpRuleType::Ipv4
            },
            is_active: true,
            wildcard: host.is_wildcard(),
            modified_at: Utc::now(),
        }
    }

    /// Normalized address and port of this rule
    pub fn host(&self) -> Result<HostAddress, AddressError> {
        HostAddress::parse(&self.address, self.port)
    }

    pub fn id(&self) -> RuleId {
        RuleId::new(self.uid, self.address.clone(), self.port)
    }

    /// Change the status and stamp the modification time
    pub fn set_status(&mut self, status: IpRuleStatus) {
        self.status = status;
        self.modified_at = Utc::now();
    }
}
