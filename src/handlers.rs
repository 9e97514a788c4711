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

//! EventHandlers: thin, stateless adapters from discovery's
//! up/down announcements and rule-CRUD requests onto the reconciler and rule
//! store, publishing an audit event for every rule mutation.

use std::sync::Arc;

use crate::audit::{AuditAction, AuditEvent, AuditSink};
use crate::broker::BrokerAdmin;
use crate::error::Result;
use crate::model::{Rule, Service, TOPIC_EXCHANGE, topic_binding_def};
use crate::reconciler::ReconcilerContext;
use crate::rule_store::RuleStore;

pub struct EventHandlers {
    reconciler: Arc<ReconcilerContext>,
    rule_store: Arc<dyn RuleStore>,
    audit: Arc<dyn AuditSink>,
    broker: Arc<dyn BrokerAdmin>,
}

impl EventHandlers {
    pub fn new(reconciler: Arc<ReconcilerContext>, rule_store: Arc<dyn RuleStore>, audit: Arc<dyn AuditSink>, broker: Arc<dyn BrokerAdmin>) -> Self {
        Self { reconciler, rule_store, audit, broker }
    }

    /// Create bindings on this broker and every remote broker for a newly announced
    /// service instance.
    pub async fn service_up(&self, service: &Service) -> Result<()> {
        self.reconciler.setup_service(service).await
    }

    /// Remove bindings for a service instance that went away, unbinding remotely
    /// too if it was the last instance of its service in this AZ.
    pub async fn service_down(&self, service: &str, instance: &str, az_name: &str) -> Result<()> {
        self.reconciler.teardown_service(service, instance, az_name).await
    }

    /// Pass-through used by discovery's own subscription setup at bootstrap and by
    /// any service wanting a direct topic subscription outside the up/down flow.
    pub async fn subscribe_topic(&self, queue: &str, topic: &str) -> Result<()> {
        let b = topic_binding_def(TOPIC_EXCHANGE, queue, topic);
        self.broker.create_binding(&self.reconciler.local_host, &b).await
    }

    pub async fn create_rule(&self, rule: Rule, user: &str) -> Result<()> {
        let event = AuditEvent::new(AuditAction::RuleCreated, &rule.service, &rule.version, &self.reconciler.local_az)
            .with_weight(rule.weight)
            .with_user(user);
        self.rule_store.create_rule(rule).await?;
        self.audit.publish(event).await;
        Ok(())
    }

    pub async fn delete_rule(&self, service: &str, content_hash: &str, rule: &Rule, user: &str) -> Result<()> {
        let event = AuditEvent::new(AuditAction::RuleDeleted, service, &rule.version, &self.reconciler.local_az)
            .with_weight(rule.weight)
            .with_user(user);
        self.rule_store.delete_rule(service, content_hash).await?;
        self.audit.publish(event).await;
        Ok(())
    }

    pub async fn list_rules(&self, service: &str) -> Result<Vec<Rule>> {
        self.rule_store.get_rules(service).await
    }
}
