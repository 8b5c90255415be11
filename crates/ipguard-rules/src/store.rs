//! JSON file backed rule store
//!
//! The whole rule table lives in one JSON document. Every mutation writes a
//! full copy to a temporary file, syncs it to disk and renames it over the
//! original. The in-memory table is only replaced after the rename succeeded.

use async_trait::async_trait;
use ipguard_common::{IpRule, RuleId, RuleStore, StoreError, StoreResult};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

type Table = BTreeMap<RuleId, IpRule>;

pub struct JsonFileRuleStore {
    path: PathBuf,
    rules: Mutex<Table>,
}

impl JsonFileRuleStore {
    /// Open the store at `path`, starting empty if the file does not exist
    pub async fn open(path: impl Into<PathBuf>) -> StoreResult<Self> {
        let path = path.into();
        let rules: Table = match tokio::fs::read(&path).await {
            Ok(bytes) => {
                let list: Vec<IpRule> = serde_json::from_slice(&bytes)
                    .map_err(|e| StoreError::Serialization(e.to_string()))?;
                list.into_iter().map(|r| (r.id(), r)).collect()
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Table::new(),
            Err(e) => return Err(e.into()),
        };

        tracing::debug!(path = %path.display(), rules = rules.len(), "Rule store opened");

        Ok(Self {
            path,
            rules: Mutex::new(rules),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Apply `change` to a copy of the table, persist it, then commit
    async fn mutate<F>(&self, change: F) -> StoreResult<()>
    where
        F: FnOnce(&mut Table) -> StoreResult<()>,
    {
        let mut rules = self.rules.lock().await;
        let mut next = rules.clone();
        change(&mut next)?;
        self.persist(&next).await?;
        *rules = next;
        Ok(())
    }

    async fn persist(&self, rules: &Table) -> StoreResult<()> {
        let list: Vec<&IpRule> = rules.values().collect();
        let json = serde_json::to_vec_pretty(&list)
            .map_err(|e| StoreError::Serialization(e.to_string()))?;

        let mut tmp = self.path.clone().into_os_string();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);

        // contents must be on disk before the rename
        let mut file = tokio::fs::File::create(&tmp).await?;
        file.write_all(&json).await?;
        file.sync_all().await?;
        drop(file);
        tokio::fs::rename(&tmp, &self.path).await?;
        Ok(())
    }
}

#[async_trait]
impl RuleStore for JsonFileRuleStore {
    async fn get_all(&self) -> StoreResult<Vec<IpRule>> {
        Ok(self.rules.lock().await.values().cloned().collect())
    }

    async fn get(&self, id: &RuleId) -> StoreResult<Option<IpRule>> {
        Ok(self.rules.lock().await.get(id).cloned())
    }

    async fn insert(&self, rule: &IpRule) -> StoreResult<()> {
        self.mutate(|rules| {
            rules.insert(rule.id(), rule.clone());
            Ok(())
        })
        .await
    }

    async fn update(&self, rule: &IpRule) -> StoreResult<()> {
        self.mutate(|rules| match rules.get_mut(&rule.id()) {
            Some(existing) => {
                *existing = rule.clone();
                Ok(())
            }
            None => Err(StoreError::NotFound(rule.id().to_string())),
        })
        .await
    }

    async fn delete(&self, id: &RuleId) -> StoreResult<()> {
        self.mutate(|rules| {
            rules.remove(id);
            Ok(())
        })
        .await
    }

    async fn delete_all_for_uid(&self, uid: i32) -> StoreResult<()> {
        self.mutate(|rules| {
            rules.retain(|id, _| id.uid != uid);
            Ok(())
        })
        .await
    }

    async fn delete_all(&self) -> StoreResult<()> {
        self.mutate(|rules| {
            rules.clear();
            Ok(())
        })
        .await
    }
}
