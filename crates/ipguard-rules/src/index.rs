//! In-memory rule index
//!
//! Rules are split into two partitions:
//! - exact: single-host addresses, keyed by `(host[:port], uid)`
//! - wildcards: subnets and the any-local address, grouped per uid and kept
//!   sorted most-specific-network first so the first covering entry wins
//!
//! One `RwLock` guards both partitions. Lookups hold the read guard for a
//! whole resolution, mutations take the write guard.

use ipguard_common::{HostAddress, IpRule, IpRuleStatus};
use parking_lot::{RwLock, RwLockReadGuard};
use std::collections::HashMap;

/// Lookup key shared by the index and the decision cache
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LookupKey {
    pub host: HostAddress,
    pub uid: i32,
}

impl LookupKey {
    #[inline]
    pub fn new(host: HostAddress, uid: i32) -> Self {
        Self { host, uid }
    }
}

#[derive(Debug, Clone)]
struct WildcardEntry {
    host: HostAddress,
    rule: IpRule,
}

impl WildcardEntry {
    /// Sort key: longer prefix first, then port-specific before any-port
    #[inline]
    fn rank(&self) -> (u8, bool) {
        (self.host.specificity(), self.host.port().is_some())
    }

    #[inline]
    fn matches(&self, query: &HostAddress) -> bool {
        self.host.covers(query.ip())
            && (self.host.port().is_none() || self.host.port() == query.port())
    }
}

/// Both partitions, readable through [`RuleIndex::read`]
#[derive(Debug, Default)]
pub struct RuleTable {
    exact: HashMap<LookupKey, IpRule>,
    wildcards: HashMap<i32, Vec<WildcardEntry>>,
}

impl RuleTable {
    /// Effective status of an exact rule for this host and port
    #[inline]
    pub fn exact_status(&self, uid: i32, query: &HostAddress) -> Option<IpRuleStatus> {
        self.exact
            .get(&LookupKey::new(*query, uid))
            .map(|rule| rule.status)
            .filter(|status| !status.is_none())
    }

    /// Status of the most specific wildcard rule covering `query`.
    ///
    /// A wildcard with a port only matches queries on that port; a wildcard
    /// without one matches any port.
    pub fn wildcard_status(&self, uid: i32, query: &HostAddress) -> Option<IpRuleStatus> {
        self.wildcards
            .get(&uid)?
            .iter()
            .filter(|entry| !entry.rule.status.is_none())
            .find(|entry| entry.matches(query))
            .map(|entry| entry.rule.status)
    }

    /// Exact match first, then subnet match
    #[inline]
    pub fn match_host(&self, uid: i32, query: &HostAddress) -> Option<IpRuleStatus> {
        self.exact_status(uid, query)
            .or_else(|| self.wildcard_status(uid, query))
    }

    /// The rule configured under exactly this key, in either partition
    pub fn get(&self, uid: i32, host: &HostAddress) -> Option<&IpRule> {
        if host.is_wildcard() {
            self.wildcards
                .get(&uid)?
                .iter()
                .find(|entry| entry.host == *host)
                .map(|entry| &entry.rule)
        } else {
            self.exact.get(&LookupKey::new(*host, uid))
        }
    }

    pub fn len(&self) -> usize {
        self.exact.len() + self.wildcards.values().map(Vec::len).sum::<usize>()
    }

    pub fn is_empty(&self) -> bool {
        self.exact.is_empty() && self.wildcards.is_empty()
    }
}

/// Working set of rules
#[derive(Debug, Default)]
pub struct RuleIndex {
    table: RwLock<RuleTable>,
}

impl RuleIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Read guard over both partitions
    #[inline]
    pub fn read(&self) -> RwLockReadGuard<'_, RuleTable> {
        self.table.read()
    }

    /// Insert or replace the rule stored under `(host, rule.uid)`
    pub fn put(&self, host: HostAddress, rule: IpRule) {
        let mut table = self.table.write();
        if !host.is_wildcard() {
            table.exact.insert(LookupKey::new(host, rule.uid), rule);
            return;
        }

        let entries = table.wildcards.entry(rule.uid).or_default();
        entries.retain(|entry| entry.host != host);
        let entry = WildcardEntry { host, rule };
        let rank = entry.rank();
        let at = entries.partition_point(|existing| existing.rank() >= rank);
        entries.insert(at, entry);
    }

    /// Remove the rule under `(host, uid)`; absent keys are a no-op
    pub fn remove(&self, uid: i32, host: &HostAddress) -> Option<IpRule> {
        let mut table = self.table.write();
        if !host.is_wildcard() {
            return table.exact.remove(&LookupKey::new(*host, uid));
        }

        let entries = table.wildcards.get_mut(&uid)?;
        let pos = entries.iter().position(|entry| entry.host == *host)?;
        let removed = entries.remove(pos);
        if entries.is_empty() {
            table.wildcards.remove(&uid);
        }
        Some(removed.rule)
    }

    /// Remove every rule owned by `uid`, returning how many were dropped
    pub fn remove_all_for_uid(&self, uid: i32) -> usize {
        let mut table = self.table.write();
        let before = table.exact.len();
        table.exact.retain(|key, _| key.uid != uid);
        let exact = before - table.exact.len();
        let wildcards = table.wildcards.remove(&uid).map_or(0, |v| v.len());
        exact + wildcards
    }

    pub fn clear(&self) {
        let mut table = self.table.write();
        table.exact.clear();
        table.wildcards.clear();
    }

    pub fn len(&self) -> usize {
        self.table.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.read().is_empty()
    }
}
