//! IP rule resolution engine
//!
//! Tiered lookup for every outbound connection `(uid, ip, port)`:
//!
//! 1. decision cache
//! 2. exact rule for host and port
//! 3. most specific covering wildcard rule
//! 4. steps 2-3 again without the port
//! 5. the whole chain again with the IPv4 equivalent of an IPv6 address
//!
//! Mutations write through the rule store first and only then update the
//! index and invalidate the cache, so memory never runs ahead of disk.

use crate::cache::DecisionCache;
use crate::config::IpRulesConfig;
use crate::error::{IpRulesError, IpRulesResult};
use crate::index::{LookupKey, RuleIndex, RuleTable};
use ipguard_common::{HostAddress, IpRule, IpRuleStatus, RuleId, RuleStore, UID_EVERYBODY};
use serde::Serialize;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

/// Per-app IP rule manager
pub struct IpRulesManager {
    store: Arc<dyn RuleStore>,
    index: RuleIndex,
    cache: DecisionCache,
    filter_ipv4_in_ipv6: AtomicBool,

    // Serializes store-then-memory mutations
    write_lock: Mutex<()>,

    lookups: AtomicU64,
    cache_hits: AtomicU64,
}

impl IpRulesManager {
    /// Create an engine with an empty index; call [`Self::load_rules`] next
    pub fn new(store: Arc<dyn RuleStore>, config: IpRulesConfig) -> Self {
        Self {
            store,
            index: RuleIndex::new(),
            cache: DecisionCache::new(config.cache_capacity),
            filter_ipv4_in_ipv6: AtomicBool::new(config.filter_ipv4_in_ipv6),
            write_lock: Mutex::new(()),
            lookups: AtomicU64::new(0),
            cache_hits: AtomicU64::new(0),
        }
    }

    /// Create an engine and load every stored rule
    pub async fn load(store: Arc<dyn RuleStore>, config: IpRulesConfig) -> IpRulesResult<Self> {
        let engine = Self::new(store, config);
        engine.load_rules().await?;
        Ok(engine)
    }

    /// Populate the index from a full store scan.
    ///
    /// A populated index is never reloaded. Stored rows whose address no
    /// longer parses are skipped. Returns the number of rules indexed.
    pub async fn load_rules(&self) -> IpRulesResult<usize> {
        let _guard = self.write_lock.lock().await;
        if !self.index.is_empty() {
            return Ok(0);
        }

        let rules = self.store.get_all().await?;
        let mut loaded = 0;
        for rule in rules {
            match rule.host() {
                Ok(host) => {
                    self.index.put(host, rule);
                    loaded += 1;
                }
                Err(e) => {
                    tracing::warn!(uid = rule.uid, ip = %rule.address, error = %e, "Skipping unparseable IP rule");
                }
            }
        }
        self.invalidate();

        tracing::info!(rules = loaded, "IP rules loaded");
        Ok(loaded)
    }

    // ==================== Lookup ====================

    /// Effective status for a connection from `uid` to `ip[:port]`.
    ///
    /// Never fails: malformed input and non-host addresses resolve to
    /// [`IpRuleStatus::None`].
    pub fn resolve(&self, uid: i32, ip: &str, port: Option<u16>) -> IpRuleStatus {
        match HostAddress::parse(ip, port) {
            Ok(query) if query.is_host() => self.resolve_host(uid, &query),
            Ok(query) => {
                tracing::debug!(uid, ip = %query, "Not a single host, no rule applies");
                IpRuleStatus::None
            }
            Err(e) => {
                tracing::debug!(uid, ip, error = %e, "Unparseable address, no rule applies");
                IpRuleStatus::None
            }
        }
    }

    /// [`Self::resolve`] for an already normalized host
    #[inline]
    pub fn resolve_host(&self, uid: i32, query: &HostAddress) -> IpRuleStatus {
        self.lookups.fetch_add(1, Ordering::Relaxed);
        let key = LookupKey::new(*query, uid);

        // read before touching the index, see DecisionCache
        let generation = self.cache.generation();
        if let Some(status) = self.cache.get(&key) {
            self.cache_hits.fetch_add(1, Ordering::Relaxed);
            return status;
        }

        let status = {
            let table = self.index.read();
            self.resolve_uncached(&table, uid, query)
        };

        self.cache.insert(key, generation, status);
        status
    }

    fn resolve_uncached(&self, table: &RuleTable, uid: i32, query: &HostAddress) -> IpRuleStatus {
        if let Some(status) = table.match_host(uid, query) {
            return status;
        }

        // a port-specific miss may still hit an any-port rule
        if query.port().is_some() {
            if let Some(status) = table.match_host(uid, &query.without_port()) {
                return status;
            }
        }

        if query.is_ipv6() {
            let translate = self.filter_ipv4_in_ipv6.load(Ordering::Relaxed);
            if let Some(v4) = query.ipv4_equivalent(translate) {
                tracing::trace!(uid, ip = %query, ipv4 = %v4, "Retrying with IPv4 equivalent");
                return self.resolve_uncached(table, uid, &v4);
            }
        }

        IpRuleStatus::None
    }

    /// App rule first, falling back to rules for every app
    pub fn resolve_for_app(&self, uid: i32, ip: &str, port: Option<u16>) -> IpRuleStatus {
        let status = self.resolve(uid, ip, port);
        if status.is_none() && uid != UID_EVERYBODY {
            return self.resolve(UID_EVERYBODY, ip, port);
        }
        status
    }

    /// Status of the rule configured under exactly this key.
    ///
    /// No subnet fallback and no cache; used to show the literal rule.
    pub fn is_rule_directly_configured(
        &self,
        uid: i32,
        ip: &str,
        port: Option<u16>,
    ) -> IpRuleStatus {
        self.get_rule(uid, ip, port)
            .map_or(IpRuleStatus::None, |rule| rule.status)
    }

    /// The rule configured under exactly this key
    pub fn get_rule(&self, uid: i32, ip: &str, port: Option<u16>) -> Option<IpRule> {
        let host = HostAddress::parse(ip, port).ok()?;
        self.index.read().get(uid, &host).cloned()
    }

    // ==================== Mutation ====================

    /// Insert or overwrite the rule for `(uid, ip, port)`
    pub async fn add_or_update(
        &self,
        uid: i32,
        ip: &str,
        port: Option<u16>,
        status: IpRuleStatus,
    ) -> IpRulesResult<IpRule> {
        let host = HostAddress::parse(ip, port)?;
        let rule = IpRule::from_host(uid, &host, status);

        tracing::info!(uid, ip = %host, status = %status, "IP rule add/update");

        let _guard = self.write_lock.lock().await;
        self.store.insert(&rule).await.map_err(|e| {
            tracing::warn!(uid, ip = %host, error = %e, "IP rule insert failed");
            e
        })?;
        self.index.put(host, rule.clone());
        self.invalidate();
        Ok(rule)
    }

    /// Remove the rule for `(uid, ip, port)`; a missing rule is not an error
    pub async fn remove(&self, uid: i32, ip: &str, port: Option<u16>) -> IpRulesResult<()> {
        let host = HostAddress::parse(ip, port)?;
        let id = RuleId::new(uid, host.to_normalized_string(), host.port());

        tracing::info!(uid, ip = %host, "IP rule remove");

        let _guard = self.write_lock.lock().await;
        self.store.delete(&id).await?;
        if self.index.remove(uid, &host).is_some() {
            self.invalidate();
        }
        Ok(())
    }

    /// Remove every rule of an app, e.g. on uninstall
    pub async fn remove_all_for_uid(&self, uid: i32) -> IpRulesResult<()> {
        tracing::info!(uid, "IP rules remove all for uid");

        let _guard = self.write_lock.lock().await;
        self.store.delete_all_for_uid(uid).await?;
        let removed = self.index.remove_all_for_uid(uid);
        self.invalidate();

        tracing::debug!(uid, removed, "IP rules removed");
        Ok(())
    }

    /// Remove every rule of every app
    pub async fn remove_all(&self) -> IpRulesResult<()> {
        tracing::info!("IP rules remove all");

        let _guard = self.write_lock.lock().await;
        self.store.delete_all().await?;
        self.index.clear();
        self.invalidate();
        Ok(())
    }

    pub async fn block_ip(&self, rule: &IpRule) -> IpRulesResult<IpRule> {
        self.set_status(rule, IpRuleStatus::Block).await
    }

    pub async fn trust_ip(&self, rule: &IpRule) -> IpRulesResult<IpRule> {
        self.set_status(rule, IpRuleStatus::Trust).await
    }

    pub async fn bypass_universal(&self, rule: &IpRule) -> IpRulesResult<IpRule> {
        self.set_status(rule, IpRuleStatus::BypassUniversal).await
    }

    /// Soft delete: the rule stays stored with status `None`
    pub async fn no_rule(&self, rule: &IpRule) -> IpRulesResult<IpRule> {
        self.set_status(rule, IpRuleStatus::None).await
    }

    /// Change the status of an existing rule
    pub async fn set_status(&self, rule: &IpRule, status: IpRuleStatus) -> IpRulesResult<IpRule> {
        let host = rule.host()?;
        let updated = IpRule {
            protocol: rule.protocol.clone(),
            is_active: rule.is_active,
            ..IpRule::from_host(rule.uid, &host, status)
        };

        tracing::info!(
            uid = rule.uid,
            ip = %host,
            previous = %rule.status,
            status = %status,
            "IP rule status change"
        );

        let _guard = self.write_lock.lock().await;
        self.store.update(&updated).await?;
        self.index.put(host, updated.clone());
        self.invalidate();
        Ok(updated)
    }

    /// Replace `prev` with `next`, e.g. after the address or port was edited
    pub async fn replace_rule(&self, prev: &IpRule, next: IpRule) -> IpRulesResult<IpRule> {
        let prev_host = prev.host()?;
        let next_host = next.host()?;
        let prev_id = RuleId::new(prev.uid, prev_host.to_normalized_string(), prev_host.port());
        let next = IpRule {
            protocol: next.protocol,
            is_active: next.is_active,
            ..IpRule::from_host(next.uid, &next_host, next.status)
        };

        tracing::info!(
            uid = prev.uid,
            ip = %prev_host,
            new_ip = %next_host,
            status = %next.status,
            "IP rule replace"
        );

        let _guard = self.write_lock.lock().await;
        self.store.delete(&prev_id).await?;
        if let Err(e) = self.store.insert(&next).await {
            // prev is gone from the store, keep the index in step with it
            self.index.remove(prev.uid, &prev_host);
            self.invalidate();
            return Err(IpRulesError::Store(e));
        }
        self.index.remove(prev.uid, &prev_host);
        self.index.put(next_host, next.clone());
        self.invalidate();
        Ok(next)
    }

    /// Toggle NAT64/6to4/IPv4-compatible translation at runtime
    pub fn set_filter_ipv4_in_ipv6(&self, enabled: bool) {
        let previous = self.filter_ipv4_in_ipv6.swap(enabled, Ordering::Relaxed);
        if previous != enabled {
            tracing::info!(enabled, "IPv4-in-IPv6 filtering changed");
            self.invalidate();
        }
    }

    pub fn filter_ipv4_in_ipv6(&self) -> bool {
        self.filter_ipv4_in_ipv6.load(Ordering::Relaxed)
    }

    /// Run a mutation as a background task.
    ///
    /// Failures are logged; the handle can be awaited for the result.
    pub fn spawn<F, Fut, T>(self: &Arc<Self>, op: F) -> JoinHandle<IpRulesResult<T>>
    where
        F: FnOnce(Arc<Self>) -> Fut,
        Fut: Future<Output = IpRulesResult<T>> + Send + 'static,
        T: Send + 'static,
    {
        let fut = op(Arc::clone(self));
        tokio::spawn(async move {
            let result = fut.await;
            if let Err(e) = &result {
                tracing::warn!(error = %e, "Background IP rule update failed");
            }
            result
        })
    }

    fn invalidate(&self) {
        self.cache.invalidate_all();
        tracing::debug!(generation = self.cache.generation(), "IP rule decision cache cleared");
    }

    /// Get engine statistics
    pub fn stats(&self) -> IpRulesStats {
        let total = self.lookups.load(Ordering::Relaxed);
        let hits = self.cache_hits.load(Ordering::Relaxed);

        IpRulesStats {
            total_lookups: total,
            cache_hits: hits,
            cache_hit_rate: if total > 0 {
                hits as f64 / total as f64
            } else {
                0.0
            },
            rules_loaded: self.index.len(),
            cache_generation: self.cache.generation(),
        }
    }
}

/// Engine statistics
#[derive(Debug, Clone, Serialize)]
pub struct IpRulesStats {
    pub total_lookups: u64,
    pub cache_hits: u64,
    pub cache_hit_rate: f64,
    pub rules_loaded: usize,
    pub cache_generation: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use ipguard_common::{InMemoryRuleStore, StoreError, StoreResult};
    use proptest::prelude::*;

    const U: i32 = 10_145;

    fn engine() -> IpRulesManager {
        IpRulesManager::new(Arc::new(InMemoryRuleStore::new()), IpRulesConfig::default())
    }

    /// Store whose writes can be switched to fail
    #[derive(Default)]
    struct FlakyStore {
        inner: InMemoryRuleStore,
        fail_writes: AtomicBool,
    }

    impl FlakyStore {
        fn check(&self) -> StoreResult<()> {
            if self.fail_writes.load(Ordering::SeqCst) {
                Err(StoreError::Storage("disk full".into()))
            } else {
                Ok(())
            }
        }
    }

    #[async_trait]
    impl RuleStore for FlakyStore {
        async fn get_all(&self) -> StoreResult<Vec<IpRule>> {
            self.inner.get_all().await
        }
        async fn get(&self, id: &RuleId) -> StoreResult<Option<IpRule>> {
            self.inner.get(id).await
        }
        async fn insert(&self, rule: &IpRule) -> StoreResult<()> {
            self.check()?;
            self.inner.insert(rule).await
        }
        async fn update(&self, rule: &IpRule) -> StoreResult<()> {
            self.check()?;
            self.inner.update(rule).await
        }
        async fn delete(&self, id: &RuleId) -> StoreResult<()> {
            self.check()?;
            self.inner.delete(id).await
        }
        async fn delete_all_for_uid(&self, uid: i32) -> StoreResult<()> {
            self.check()?;
            self.inner.delete_all_for_uid(uid).await
        }
        async fn delete_all(&self) -> StoreResult<()> {
            self.check()?;
            self.inner.delete_all().await
        }
    }

    #[tokio::test]
    async fn test_write_then_read() {
        let engine = engine();
        engine
            .add_or_update(U, "93.184.216.34", Some(443), IpRuleStatus::Block)
            .await
            .unwrap();

        assert_eq!(engine.resolve(U, "93.184.216.34", Some(443)), IpRuleStatus::Block);
        // port-specific rule does not cover other ports or other apps
        assert_eq!(engine.resolve(U, "93.184.216.34", Some(80)), IpRuleStatus::None);
        assert_eq!(engine.resolve(U + 1, "93.184.216.34", Some(443)), IpRuleStatus::None);
    }

    #[tokio::test]
    async fn test_unknown_and_malformed_resolve_to_none() {
        let engine = engine();
        assert_eq!(engine.resolve(U, "198.51.100.7", None), IpRuleStatus::None);
        assert_eq!(engine.resolve(U, "not an ip", Some(443)), IpRuleStatus::None);
        assert_eq!(engine.resolve(U, "", None), IpRuleStatus::None);
    }

    #[tokio::test]
    async fn test_malformed_mutation_rejected() {
        let engine = engine();
        let result = engine.add_or_update(U, "300.1.1.1", None, IpRuleStatus::Block).await;
        assert!(matches!(result, Err(IpRulesError::Address(_))));
        assert!(engine.remove(U, "bogus", None).await.is_err());
        assert_eq!(engine.stats().rules_loaded, 0);
    }

    #[tokio::test]
    async fn test_remove() {
        let engine = engine();
        engine.add_or_update(U, "1.2.3.4", None, IpRuleStatus::Trust).await.unwrap();
        assert_eq!(engine.resolve(U, "1.2.3.4", None), IpRuleStatus::Trust);

        engine.remove(U, "1.2.3.4", None).await.unwrap();
        assert_eq!(engine.resolve(U, "1.2.3.4", None), IpRuleStatus::None);

        // removing again is a no-op
        engine.remove(U, "1.2.3.4", None).await.unwrap();
    }

    #[tokio::test]
    async fn test_subnet_precedence() {
        let engine = engine();
        engine.add_or_update(U, "10.1.0.0/16", None, IpRuleStatus::Trust).await.unwrap();
        engine.add_or_update(U, "10.0.0.0/8", None, IpRuleStatus::Block).await.unwrap();

        assert_eq!(engine.resolve(U, "10.1.2.3", None), IpRuleStatus::Trust);
        assert_eq!(engine.resolve(U, "10.2.0.1", None), IpRuleStatus::Block);
    }

    #[tokio::test]
    async fn test_exact_beats_subnet() {
        let engine = engine();
        engine.add_or_update(U, "10.0.0.0/8", None, IpRuleStatus::Block).await.unwrap();
        engine.add_or_update(U, "10.0.0.5", None, IpRuleStatus::Trust).await.unwrap();

        assert_eq!(engine.resolve(U, "10.0.0.5", None), IpRuleStatus::Trust);
        assert_eq!(engine.resolve(U, "10.0.0.6", None), IpRuleStatus::Block);

        // with a port, the any-port subnet matches before the port-less retry
        assert_eq!(engine.resolve(U, "10.0.0.5", Some(443)), IpRuleStatus::Block);
        engine.add_or_update(U, "10.0.0.5", Some(443), IpRuleStatus::Trust).await.unwrap();
        assert_eq!(engine.resolve(U, "10.0.0.5", Some(443)), IpRuleStatus::Trust);
    }

    #[tokio::test]
    async fn test_any_local_wildcard() {
        let engine = engine();
        engine.add_or_update(U, "0.0.0.0", Some(443), IpRuleStatus::Block).await.unwrap();

        assert_eq!(engine.resolve(U, "203.0.113.5", Some(443)), IpRuleStatus::Block);
        assert_eq!(engine.resolve(U, "203.0.113.5", Some(80)), IpRuleStatus::None);
        assert_eq!(engine.resolve(U, "2001:db8::5", Some(443)), IpRuleStatus::None);
    }

    #[tokio::test]
    async fn test_zero_based_subnet_is_not_any_local() {
        let engine = engine();
        engine.add_or_update(U, "0.0.0.0/8", None, IpRuleStatus::Block).await.unwrap();
        engine.add_or_update(U, "::/96", None, IpRuleStatus::Block).await.unwrap();

        assert_eq!(engine.resolve(U, "0.1.2.3", None), IpRuleStatus::Block);
        assert_eq!(engine.resolve(U, "93.184.216.34", None), IpRuleStatus::None);
        assert_eq!(engine.resolve(U, "2001:db8::1", None), IpRuleStatus::None);
    }

    #[tokio::test]
    async fn test_port_less_fallback() {
        let engine = engine();
        engine.add_or_update(U, "192.0.2.1", None, IpRuleStatus::Block).await.unwrap();

        assert_eq!(engine.resolve(U, "192.0.2.1", Some(8080)), IpRuleStatus::Block);
        assert_eq!(engine.resolve(U, "192.0.2.1:53", None), IpRuleStatus::Block);
    }

    #[tokio::test]
    async fn test_ipv4_in_ipv6_fallback() {
        let engine = engine();
        engine.add_or_update(U, "93.184.216.34", None, IpRuleStatus::Block).await.unwrap();

        assert_eq!(engine.resolve(U, "::ffff:93.184.216.34", None), IpRuleStatus::Block);
        assert_eq!(
            engine.resolve(U, "::ffff:93.184.216.34", Some(443)),
            IpRuleStatus::Block
        );
        assert_eq!(engine.resolve(U, "64:ff9b::5db8:d822", None), IpRuleStatus::Block);

        // translated hit is served from the cache under the IPv6 key
        let hits = engine.stats().cache_hits;
        assert_eq!(engine.resolve(U, "::ffff:93.184.216.34", None), IpRuleStatus::Block);
        assert_eq!(engine.stats().cache_hits, hits + 1);
    }

    #[tokio::test]
    async fn test_auto_translation_toggle() {
        let engine = engine();
        engine.add_or_update(U, "93.184.216.34", None, IpRuleStatus::Block).await.unwrap();
        assert_eq!(engine.resolve(U, "64:ff9b::5db8:d822", None), IpRuleStatus::Block);

        engine.set_filter_ipv4_in_ipv6(false);
        assert!(!engine.filter_ipv4_in_ipv6());
        assert_eq!(engine.resolve(U, "64:ff9b::5db8:d822", None), IpRuleStatus::None);
        // embedded form still translates
        assert_eq!(engine.resolve(U, "::ffff:93.184.216.34", None), IpRuleStatus::Block);
    }

    #[tokio::test]
    async fn test_cache_invalidated_on_mutation() {
        let engine = engine();
        engine.add_or_update(U, "10.0.0.0/8", None, IpRuleStatus::Block).await.unwrap();
        assert_eq!(engine.resolve(U, "10.1.2.3", None), IpRuleStatus::Block);
        assert_eq!(engine.resolve(U, "10.1.2.3", None), IpRuleStatus::Block);
        assert_eq!(engine.stats().cache_hits, 1);

        engine.add_or_update(U, "10.1.0.0/16", None, IpRuleStatus::Trust).await.unwrap();
        assert_eq!(engine.resolve(U, "10.1.2.3", None), IpRuleStatus::Trust);
    }

    #[tokio::test]
    async fn test_remove_all_for_uid() {
        let engine = engine();
        engine.add_or_update(U, "1.2.3.4", None, IpRuleStatus::Block).await.unwrap();
        engine.add_or_update(U, "10.0.0.0/8", Some(22), IpRuleStatus::Block).await.unwrap();
        engine.add_or_update(U + 1, "1.2.3.4", None, IpRuleStatus::Trust).await.unwrap();
        assert_eq!(engine.resolve(U, "1.2.3.4", None), IpRuleStatus::Block);

        engine.remove_all_for_uid(U).await.unwrap();
        assert_eq!(engine.resolve(U, "1.2.3.4", None), IpRuleStatus::None);
        assert_eq!(engine.resolve(U, "10.9.9.9", Some(22)), IpRuleStatus::None);
        assert_eq!(engine.resolve(U + 1, "1.2.3.4", None), IpRuleStatus::Trust);

        engine.remove_all().await.unwrap();
        assert_eq!(engine.resolve(U + 1, "1.2.3.4", None), IpRuleStatus::None);
        assert_eq!(engine.stats().rules_loaded, 0);
    }

    #[tokio::test]
    async fn test_resolve_for_app_falls_back_to_everybody() {
        let engine = engine();
        engine
            .add_or_update(UID_EVERYBODY, "198.51.100.0/24", None, IpRuleStatus::Block)
            .await
            .unwrap();
        engine.add_or_update(U, "198.51.100.9", None, IpRuleStatus::Trust).await.unwrap();

        assert_eq!(engine.resolve(U, "198.51.100.1", None), IpRuleStatus::None);
        assert_eq!(engine.resolve_for_app(U, "198.51.100.1", None), IpRuleStatus::Block);
        assert_eq!(engine.resolve_for_app(U, "198.51.100.9", None), IpRuleStatus::Trust);
    }

    #[tokio::test]
    async fn test_directly_configured_is_literal() {
        let engine = engine();
        engine.add_or_update(U, "10.0.0.0/8", None, IpRuleStatus::Block).await.unwrap();

        assert_eq!(
            engine.is_rule_directly_configured(U, "10.0.0.0/8", None),
            IpRuleStatus::Block
        );
        assert_eq!(
            engine.is_rule_directly_configured(U, "10.1.2.3", None),
            IpRuleStatus::None
        );
        assert_eq!(engine.is_rule_directly_configured(U, "junk", None), IpRuleStatus::None);
    }

    #[tokio::test]
    async fn test_status_shortcuts_and_soft_delete() {
        let engine = engine();
        let rule = engine
            .add_or_update(U, "203.0.113.0/24", None, IpRuleStatus::Block)
            .await
            .unwrap();

        let rule = engine.trust_ip(&rule).await.unwrap();
        assert_eq!(engine.resolve(U, "203.0.113.7", None), IpRuleStatus::Trust);

        let rule = engine.bypass_universal(&rule).await.unwrap();
        assert_eq!(engine.resolve(U, "203.0.113.7", None), IpRuleStatus::BypassUniversal);

        let rule = engine.no_rule(&rule).await.unwrap();
        assert_eq!(engine.resolve(U, "203.0.113.7", None), IpRuleStatus::None);
        assert_eq!(
            engine.is_rule_directly_configured(U, "203.0.113.0/24", None),
            IpRuleStatus::None
        );
        assert!(engine.get_rule(U, "203.0.113.0/24", None).is_some());

        engine.block_ip(&rule).await.unwrap();
        assert_eq!(engine.resolve(U, "203.0.113.7", None), IpRuleStatus::Block);
    }

    #[tokio::test]
    async fn test_replace_rule() {
        let engine = engine();
        let prev = engine.add_or_update(U, "1.2.3.4", Some(80), IpRuleStatus::Block).await.unwrap();
        let next = IpRule::new(U, "1.2.3.0/24", Some(443), IpRuleStatus::Block).unwrap();

        engine.replace_rule(&prev, next).await.unwrap();
        assert_eq!(engine.resolve(U, "1.2.3.4", Some(80)), IpRuleStatus::None);
        assert_eq!(engine.resolve(U, "1.2.3.9", Some(443)), IpRuleStatus::Block);
        assert_eq!(engine.stats().rules_loaded, 1);
    }

    #[tokio::test]
    async fn test_replace_rule_normalizes_stored_address() {
        let store = Arc::new(InMemoryRuleStore::new());
        let engine = IpRulesManager::new(store.clone(), IpRulesConfig::default());
        let prev = engine.add_or_update(U, "1.2.3.4", None, IpRuleStatus::Block).await.unwrap();

        // address edited by hand, host bits still set
        let mut next = prev.clone();
        next.address = "1.2.3.4/24".into();
        let replaced = engine.replace_rule(&prev, next).await.unwrap();
        assert_eq!(replaced.address, "1.2.3.0/24");
        assert!(replaced.wildcard);
        assert_eq!(engine.resolve(U, "1.2.3.9", None), IpRuleStatus::Block);

        engine.remove(U, "1.2.3.0/24", None).await.unwrap();
        assert!(store.is_empty());

        let reloaded = IpRulesManager::load(store, IpRulesConfig::default()).await.unwrap();
        assert_eq!(reloaded.resolve(U, "1.2.3.9", None), IpRuleStatus::None);
    }

    #[tokio::test]
    async fn test_set_status_writes_normalized_address() {
        let store = Arc::new(InMemoryRuleStore::new());
        let engine = IpRulesManager::new(store.clone(), IpRulesConfig::default());
        let rule = engine.add_or_update(U, "2001:db8::1", None, IpRuleStatus::Block).await.unwrap();

        let mut edited = rule.clone();
        edited.address = "2001:DB8::1".into();
        let trusted = engine.trust_ip(&edited).await.unwrap();
        assert_eq!(trusted.address, rule.address);
        assert_eq!(store.len(), 1);
        assert_eq!(
            store.get(&rule.id()).await.unwrap().map(|r| r.status),
            Some(IpRuleStatus::Trust)
        );
    }

    #[tokio::test]
    async fn test_store_failure_leaves_memory_untouched() {
        let store = Arc::new(FlakyStore::default());
        let engine = IpRulesManager::new(store.clone(), IpRulesConfig::default());
        engine.add_or_update(U, "1.2.3.4", None, IpRuleStatus::Block).await.unwrap();

        store.fail_writes.store(true, Ordering::SeqCst);

        let result = engine.add_or_update(U, "1.2.3.4", None, IpRuleStatus::Trust).await;
        assert!(matches!(result, Err(IpRulesError::Store(_))));
        assert_eq!(engine.resolve(U, "1.2.3.4", None), IpRuleStatus::Block);

        assert!(engine.remove(U, "1.2.3.4", None).await.is_err());
        assert!(engine.remove_all_for_uid(U).await.is_err());
        assert!(engine.remove_all().await.is_err());
        assert_eq!(engine.resolve(U, "1.2.3.4", None), IpRuleStatus::Block);
        assert_eq!(engine.stats().rules_loaded, 1);
    }

    #[tokio::test]
    async fn test_load_rules_is_idempotent() {
        let store = Arc::new(InMemoryRuleStore::with_rules([
            IpRule::new(U, "10.0.0.0/8", None, IpRuleStatus::Block).unwrap(),
            IpRule::new(U, "10.1.0.0/16", None, IpRuleStatus::Trust).unwrap(),
            IpRule::new(U, "1.2.3.4", Some(443), IpRuleStatus::Block).unwrap(),
        ]));
        let mut corrupt = IpRule::new(U, "5.6.7.8", None, IpRuleStatus::Block).unwrap();
        corrupt.address = "garbage".into();
        store.insert(&corrupt).await.unwrap();

        let engine = IpRulesManager::load(store, IpRulesConfig::default()).await.unwrap();
        assert_eq!(engine.stats().rules_loaded, 3);
        assert_eq!(engine.load_rules().await.unwrap(), 0);

        assert_eq!(engine.resolve(U, "10.1.2.3", None), IpRuleStatus::Trust);
        assert_eq!(engine.resolve(U, "1.2.3.4", Some(443)), IpRuleStatus::Block);
    }

    #[tokio::test]
    async fn test_idempotent_add() {
        let engine = engine();
        for _ in 0..2 {
            engine.add_or_update(U, "fd00::/8", Some(53), IpRuleStatus::Block).await.unwrap();
        }
        assert_eq!(engine.stats().rules_loaded, 1);
        assert_eq!(engine.resolve(U, "fd12::1", Some(53)), IpRuleStatus::Block);
    }

    #[tokio::test]
    async fn test_spawned_mutation() {
        let engine = Arc::new(engine());
        let handle = engine.spawn(|e| async move {
            e.add_or_update(U, "192.0.2.10", None, IpRuleStatus::Trust).await
        });
        handle.await.unwrap().unwrap();
        assert_eq!(engine.resolve(U, "192.0.2.10", None), IpRuleStatus::Trust);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_lookups_during_writes() {
        let engine = Arc::new(engine());
        engine.add_or_update(U, "10.0.0.0/8", None, IpRuleStatus::Block).await.unwrap();

        let readers: Vec<_> = (0..4)
            .map(|_| {
                let engine = Arc::clone(&engine);
                tokio::task::spawn_blocking(move || {
                    for i in 0..2_000u32 {
                        let ip = format!("10.0.{}.{}", (i >> 8) & 0xff, i & 0xff);
                        let status = engine.resolve(U, &ip, None);
                        assert!(matches!(status, IpRuleStatus::Block | IpRuleStatus::Trust));
                    }
                })
            })
            .collect();

        for i in 0..50u16 {
            let status = if i % 2 == 0 { IpRuleStatus::Trust } else { IpRuleStatus::Block };
            engine.add_or_update(U, "10.0.0.0/16", None, status).await.unwrap();
        }
        for r in readers {
            r.await.unwrap();
        }

        // last write wins once writers are done
        assert_eq!(engine.resolve(U, "10.0.1.1", None), IpRuleStatus::Block);
    }

    fn status_strategy() -> impl Strategy<Value = IpRuleStatus> {
        prop_oneof![
            Just(IpRuleStatus::Block),
            Just(IpRuleStatus::Trust),
            Just(IpRuleStatus::BypassUniversal),
        ]
    }

    proptest! {
        #[test]
        fn prop_write_then_read(
            uid in -1000i32..100_000,
            octets in any::<[u8; 4]>(),
            port in proptest::option::of(1u16..),
            status in status_strategy(),
        ) {
            let ip = std::net::Ipv4Addr::from(octets).to_string();
            let rt = tokio::runtime::Builder::new_current_thread().build().unwrap();
            let engine = engine();
            rt.block_on(engine.add_or_update(uid, &ip, port, status)).unwrap();
            prop_assert_eq!(engine.resolve(uid, &ip, port), status);
        }
    }
}
