//! Rule store - persistence abstraction for IP rules
//!
//! The store is the single source of truth. The rule engine reads it once
//! at startup and writes through it before touching any in-memory state.

use crate::error::{StoreError, StoreResult};
use crate::rule::{IpRule, RuleId};
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;

/// Durable table of IP rules keyed by `(uid, address, port)`
#[async_trait]
pub trait RuleStore: Send + Sync {
    /// Full scan
    async fn get_all(&self) -> StoreResult<Vec<IpRule>>;

    /// Rule detail by key
    async fn get(&self, id: &RuleId) -> StoreResult<Option<IpRule>>;

    /// Insert, replacing any rule with the same key
    async fn insert(&self, rule: &IpRule) -> StoreResult<()>;

    /// Update an existing rule
    async fn update(&self, rule: &IpRule) -> StoreResult<()>;

    /// Delete by key; deleting a missing rule is not an error
    async fn delete(&self, id: &RuleId) -> StoreResult<()>;

    /// Delete every rule owned by `uid`
    async fn delete_all_for_uid(&self, uid: i32) -> StoreResult<()>;

    /// Delete every rule
    async fn delete_all(&self) -> StoreResult<()>;
}

/// In-memory rule store (for testing and development)
pub struct InMemoryRuleStore {
    rules: RwLock<HashMap<RuleId, IpRule>>,
}

impl InMemoryRuleStore {
    pub fn new() -> Self {
        Self {
            rules: RwLock::new(HashMap::new()),
        }
    }

    /// Create pre-populated with `rules`
    pub fn with_rules(rules: impl IntoIterator<Item = IpRule>) -> Self {
        let rules = rules.into_iter().map(|r| (r.id(), r)).collect();
        Self {
            rules: RwLock::new(rules),
        }
    }

    pub fn len(&self) -> usize {
        self.rules.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.read().is_empty()
    }
}

impl Default for InMemoryRuleStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RuleStore for InMemoryRuleStore {
    async fn get_all(&self) -> StoreResult<Vec<IpRule>> {
        Ok(self.rules.read().values().cloned().collect())
    }

    async fn get(&self, id: &RuleId) -> StoreResult<Option<IpRule>> {
        Ok(self.rules.read().get(id).cloned())
    }

    async fn insert(&self, rule: &IpRule) -> StoreResult<()> {
        self.rules.write().insert(rule.id(), rule.clone());
        Ok(())
    }

    async fn update(&self, rule: &IpRule) -> StoreResult<()> {
        let id = rule.id();
        let mut rules = self.rules.write();
        match rules.get_mut(&id) {
            Some(existing) => {
                *existing = rule.clone();
                Ok(())
            }
            None => Err(StoreError::NotFound(id.to_string())),
        }
    }

    async fn delete(&self, id: &RuleId) -> StoreResult<()> {
        self.rules.write().remove(id);
        Ok(())
    }

    async fn delete_all_for_uid(&self, uid: i32) -> StoreResult<()> {
        self.rules.write().retain(|id, _| id.uid != uid);
        Ok(())
    }

    async fn delete_all(&self) -> StoreResult<()> {
        self.rules.write().clear();
        Ok(())
    }
}
