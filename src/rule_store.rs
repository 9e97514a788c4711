// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
// http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! The rule store: per-service weighting rules, keyed by
//! `(service, content hash of the rule)` so that writing the same rule twice is a
//! no-op, while distinct versions of a rule for the same service coexist freely.

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;

use crate::error::Result;
use crate::lock::RegionLockService;
use crate::model::Rule;

#[async_trait]
pub trait RuleStore: Send + Sync {
    async fn create_rule(&self, rule: Rule) -> Result<()>;
    async fn delete_rule(&self, service: &str, content_hash: &str) -> Result<()>;
    async fn get_rules(&self, service: &str) -> Result<Vec<Rule>>;
}

/// `DashMap<service, DashMap<content_hash, Rule>>` behind the same
/// `RegionLockService` setup/teardown uses, so a real column-family store fronted
/// by a real region lock would show the identical concurrency behaviour.
pub struct InMemoryRuleStore {
    rules: DashMap<String, DashMap<String, Rule>>,
    lock_service: Arc<dyn RegionLockService>,
}

impl InMemoryRuleStore {
    pub fn new(lock_service: Arc<dyn RegionLockService>) -> Self {
        Self { rules: DashMap::new(), lock_service }
    }
}

#[async_trait]
impl RuleStore for InMemoryRuleStore {
    /// Locks by service, deletes any existing rule that shares
    /// `rule`'s version (by its own content hash), then inserts. The delete happens
    /// before the insert, so a reader racing the two steps can briefly observe zero
    /// rules for the version being replaced. Kept faithfully rather than made atomic.
    async fn create_rule(&self, rule: Rule) -> Result<()> {
        let _guard = self.lock_service.clone().lock(&rule.service).await?;

        let column = self.rules.entry(rule.service.clone()).or_default();
        let stale: Vec<String> = column
            .iter()
            .filter(|e| e.value().version == rule.version && e.value().content_hash() != rule.content_hash())
            .map(|e| e.key().clone())
            .collect();
        for key in stale {
            column.remove(&key);
        }
        column.insert(rule.content_hash(), rule);
        Ok(())
    }

    async fn delete_rule(&self, service: &str, content_hash: &str) -> Result<()> {
        let _guard = self.lock_service.clone().lock(service).await?;
        if let Some(column) = self.rules.get(service) {
            column.remove(content_hash);
        }
        Ok(())
    }

    async fn get_rules(&self, service: &str) -> Result<Vec<Rule>> {
        Ok(self
            .rules
            .get(service)
            .map(|column| column.iter().map(|e| e.value().clone()).collect())
            .unwrap_or_default())
    }
}
