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

//! The convergence engine: `setup_service`, `teardown_service`
//! and the periodic `rebind_all` sweep that keeps broker binding topology in line
//! with the live service inventory across AZs.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::broker::BrokerAdmin;
use crate::discovery::DiscoveryClient;
use crate::error::Result;
use crate::hosts::HostMap;
use crate::lock::RegionLockService;
use crate::model::{
    BindingDef, DestinationType, MAIN_EXCHANGE, Rule, Service, TOPIC_EXCHANGE, apply_rules, binding_def_from_service,
    default_rule, exchange_binding_def_from_service, is_local_only_service, looks_like_az_exchange, topic_binding_def,
};
use crate::rule_store::RuleStore;

/// Everything every reconciler operation needs, bundled and `Arc`-shared rather
/// than kept as process-wide mutable state.
pub struct ReconcilerContext {
    pub local_az: String,
    pub local_host: String,
    pub is_rabbit_failed_over: AtomicBool,
    pub broker: Arc<dyn BrokerAdmin>,
    pub rule_store: Arc<dyn RuleStore>,
    pub lock_service: Arc<dyn RegionLockService>,
    pub discovery: Arc<dyn DiscoveryClient>,
    pub hosts: HostMap,
}

impl ReconcilerContext {
    fn remote_hosts(&self) -> Vec<crate::model::RabbitHost> {
        self.hosts.representatives().into_iter().filter(|h| h.az_name != self.local_az).collect()
    }

    async fn rules_for(&self, service: &Service) -> Result<Vec<Rule>> {
        let rules = self.rule_store.get_rules(&service.service).await?;
        if rules.is_empty() { Ok(vec![default_rule(service)]) } else { Ok(rules) }
    }

    /// Best-effort delete: logs and swallows the error. Used everywhere the
    /// original treated "probably already gone" as success.
    async fn try_delete(&self, host: &str, b: &BindingDef) {
        if let Err(e) = self.broker.delete_binding(host, b).await {
            log::debug!("best-effort delete of binding {b:?} on {host} failed: {e}");
        }
    }

    /// Creates the local queue binding and, when this is the first instance of
    /// the service in this AZ, the remote AZ-exchange bindings too.
    pub async fn setup_service(&self, s: &Service) -> Result<()> {
        if s.az_name != self.local_az {
            return Ok(());
        }
        log::debug!("setting up service {s:?}");

        let _guard = self.lock_service.clone().lock(&lock_key(&s.service, &s.az_name)).await?;

        let rules = self.rules_for(s).await?;
        let mut desired = binding_def_from_service(s);
        apply_rules(&rules, &mut desired, s);

        self.broker.create_binding(&self.local_host, &desired).await?;

        let existing = self.broker.get_bindings(&self.local_host, MAIN_EXCHANGE, DestinationType::Queue, &s.instance).await?;
        log::debug!("there are {} bindings for queue {}", existing.len(), s.instance);
        if existing.len() > 1 {
            let to_prune: Vec<_> = existing.iter().filter(|b| !desired.eq_ignoring_properties_key(b)).collect();
            let max_deletable = existing.len() - 1;
            for (deleted, b) in to_prune.into_iter().enumerate() {
                if deleted == max_deletable {
                    log::debug!("binding {b:?} doesn't match desired but won't delete: would leave zero bindings");
                    break;
                }
                self.try_delete(&self.local_host, b).await;
            }
        }

        for sub in s.subscriptions.iter().filter(|sub| !sub.is_empty()) {
            let b = topic_binding_def(TOPIC_EXCHANGE, &s.instance, sub);
            self.broker.create_binding(&self.local_host, &b).await?;
        }

        if !is_local_only_service(&s.service) && !self.is_rabbit_failed_over.load(Ordering::Relaxed) {
            for host in self.remote_hosts() {
                let eb = exchange_binding_def_from_service(s, &self.local_az);
                self.broker.create_binding(&host.host, &eb).await?;
            }
        }

        Ok(())
    }

    pub async fn teardown_service(&self, service: &str, instance: &str, az_name: &str) -> Result<()> {
        if az_name != self.local_az {
            return Ok(());
        }
        log::debug!("tearing down service {service} instance {instance}");

        // Scoped to this instance's own queue binding, not every h2o-sourced binding
        // on the broker: the latter would wipe every other service's local binding
        // on a single teardown.
        let local_bindings = self.broker.get_bindings(&self.local_host, MAIN_EXCHANGE, DestinationType::Queue, instance).await?;
        for b in &local_bindings {
            self.try_delete(&self.local_host, b).await;
        }

        self.teardown_remote_service_bindings(service, az_name).await
    }

    async fn teardown_remote_service_bindings(&self, service: &str, az_name: &str) -> Result<()> {
        if is_local_only_service(service) {
            return Ok(());
        }
        let _guard = self.lock_service.clone().lock(&lock_key(service, az_name)).await?;

        match self.is_last_instance_in_az(service).await {
            Ok(true) => {
                log::debug!("last instance of {service} in {az_name}, unbinding remotely");
                for host in self.remote_hosts() {
                    self.delete_remote_service_bindings(&host.host, service, az_name).await?;
                }
            }
            Ok(false) => {}
            Err(e) => log::error!("error while finding last instance: {e}"),
        }
        Ok(())
    }

    async fn delete_remote_service_bindings(&self, host: &str, service: &str, az_name: &str) -> Result<()> {
        let bindings = self.broker.get_bindings(host, MAIN_EXCHANGE, DestinationType::Exchange, az_name).await?;
        for b in &bindings {
            if b.arguments.get("service").and_then(|v| v.as_str()) == Some(service) {
                self.try_delete(host, b).await;
            }
        }
        Ok(())
    }

    async fn is_last_instance_in_az(&self, service: &str) -> Result<bool> {
        let bindings = self.broker.get_exchange_bindings_as_source(&self.local_host, MAIN_EXCHANGE).await?;
        let found = bindings
            .iter()
            .any(|b| b.destination_type == DestinationType::Queue && b.arguments.get("service").and_then(|v| v.as_str()) == Some(service));
        Ok(!found)
    }

    /// Runs once at bootstrap.
    pub async fn detect_rabbit_failed_over(&self) -> bool {
        match self.broker.get_exchange_bindings_as_source(&self.local_host, &self.local_az).await {
            Ok(bindings) if bindings.is_empty() => true,
            Ok(bindings) => !bindings.iter().any(|b| b.destination == MAIN_EXCHANGE),
            Err(e) => {
                log::error!("could not determine failover state, assuming healthy: {e}");
                false
            }
        }
    }

    /// The periodic sweep: sets up every locally running instance, then tears
    /// down bindings for whatever is no longer running.
    pub async fn rebind_all(&self) {
        log::debug!("rebinding all service instances");
        let instances = match self.discovery.list_instances().await {
            Ok(i) => i,
            Err(e) => {
                log::error!("failed to query discovery for rebind_all: {e}");
                return;
            }
        };

        let mut remote_running: HashMap<String, Service> = HashMap::new();
        for s in &instances {
            if s.az_name == self.local_az {
                if let Err(e) = self.setup_service(s).await {
                    log::error!("error setting up service {s:?}: {e}");
                }
            } else {
                remote_running.insert(format!("{}{}", s.az_name, s.service), s.clone());
            }
        }
        log::debug!("rebinding all service instances complete");

        if self.is_rabbit_failed_over.load(Ordering::Relaxed) {
            self.teardown_remotes_for_az(&self.local_az).await;
        } else {
            self.teardown_missing(&remote_running).await;
        }
    }

    /// Stops at the first host error, leaving remaining hosts uncleaned,
    /// matching the original.
    async fn teardown_remotes_for_az(&self, az: &str) {
        log::debug!("tearing down remotes for AZ {az}");
        for host in self.remote_hosts() {
            let bindings = match self.broker.get_exchange_bindings_as_source(&host.host, az).await {
                Ok(b) => b,
                Err(e) => {
                    log::debug!("error getting exchange bindings on {}: {e}", host.host);
                    return;
                }
            };
            for b in &bindings {
                self.try_delete(&host.host, b).await;
            }
        }
        log::debug!("tearing down remotes for AZ {az} complete");
    }

    /// Deletes AZ-exchange bindings on the local broker for any remote service
    /// that is no longer running anywhere.
    async fn teardown_missing(&self, remote_running: &HashMap<String, Service>) {
        log::debug!("tearing down any missing services");
        let exchanges = match self.broker.get_all_exchanges(&self.local_host).await {
            Ok(e) => e,
            Err(e) => {
                log::error!("error determining remote exchanges: {e}");
                return;
            }
        };
        let az_exchanges: HashSet<String> =
            exchanges.into_iter().map(|e| e.name).filter(|n| looks_like_az_exchange(n)).collect();

        for x in az_exchanges.iter().filter(|x| x.as_str() != self.local_az) {
            let bindings = match self.broker.get_bindings(&self.local_host, MAIN_EXCHANGE, DestinationType::Exchange, x).await {
                Ok(b) => b,
                Err(e) => {
                    log::error!("error getting bindings for exchange {x}: {e}");
                    continue;
                }
            };
            for b in &bindings {
                let Some(service) = b.arguments.get("service").and_then(|v| v.as_str()) else {
                    continue;
                };
                if !remote_running.contains_key(&format!("{x}{service}")) {
                    log::debug!("deleting binding for missing service {b:?}");
                    self.try_delete(&self.local_host, b).await;
                }
            }
        }
        log::debug!("tearing down any missing services complete");
    }
}

fn lock_key(service: &str, az_name: &str) -> String {
    format!("{service}{az_name}")
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use dashmap::DashMap;

    use super::*;
    use crate::discovery::InProcessDiscovery;
    use crate::hosts::HostMap;
    use crate::lock::InMemoryRegionLockService;
    use crate::model::{ExchangeDef, QueueDef, RabbitHost};
    use crate::rule_store::InMemoryRuleStore;

    /// An in-memory broker fake keyed by `(host, source, dest_type, destination)`,
    /// good enough to exercise every reconciler code path without a real broker.
    #[derive(Default)]
    struct FakeBroker {
        bindings: DashMap<String, Vec<BindingDef>>,
        exchanges: DashMap<String, Vec<ExchangeDef>>,
    }

    impl FakeBroker {
        fn key(host: &str, source: &str) -> String {
            format!("{host}|{source}")
        }

        fn seed_exchange(&self, host: &str, name: &str) {
            self.exchanges.entry(host.to_owned()).or_default().push(ExchangeDef {
                name: name.to_owned(),
                vhost: "/".to_owned(),
                exchange_type: "headers".to_owned(),
                durable: true,
                arguments: Default::default(),
            });
        }
    }

    #[async_trait]
    impl BrokerAdmin for FakeBroker {
        async fn create_binding(&self, host: &str, b: &BindingDef) -> Result<()> {
            self.bindings.entry(Self::key(host, &b.source)).or_default().push(b.clone());
            Ok(())
        }

        async fn delete_binding(&self, host: &str, b: &BindingDef) -> Result<()> {
            if let Some(mut v) = self.bindings.get_mut(&Self::key(host, &b.source)) {
                v.retain(|existing| !existing.eq_ignoring_properties_key(b));
            }
            Ok(())
        }

        async fn get_bindings(&self, host: &str, source: &str, dest_type: DestinationType, destination: &str) -> Result<Vec<BindingDef>> {
            Ok(self
                .bindings
                .get(&Self::key(host, source))
                .map(|v| v.iter().filter(|b| b.destination_type == dest_type && b.destination == destination).cloned().collect())
                .unwrap_or_default())
        }

        async fn get_exchange_bindings_as_source(&self, host: &str, exchange: &str) -> Result<Vec<BindingDef>> {
            Ok(self.bindings.get(&Self::key(host, exchange)).map(|v| v.clone()).unwrap_or_default())
        }

        async fn get_all_bindings(&self, host: &str) -> Result<Vec<BindingDef>> {
            Ok(self
                .bindings
                .iter()
                .filter(|e| e.key().starts_with(&format!("{host}|")))
                .flat_map(|e| e.value().clone())
                .collect())
        }

        async fn get_all_exchanges(&self, host: &str) -> Result<Vec<ExchangeDef>> {
            Ok(self.exchanges.get(host).map(|v| v.clone()).unwrap_or_default())
        }

        async fn create_exchange(&self, host: &str, exchange: &ExchangeDef) -> Result<()> {
            self.seed_exchange(host, &exchange.name);
            Ok(())
        }

        async fn create_queue(&self, _host: &str, _queue: &QueueDef) -> Result<()> {
            Ok(())
        }

        async fn create_policy(&self, _host: &str, _name: &str, _pattern: &str) -> Result<()> {
            Ok(())
        }

        async fn create_federation_upstream(&self, _host: &str, _name: &str, _uri: &str) -> Result<()> {
            Ok(())
        }
    }

    fn service(instance: &str, svc: &str, az: &str) -> Service {
        Service { service: svc.to_owned(), version: "1".to_owned(), instance: instance.to_owned(), az_name: az.to_owned(), subscriptions: vec![] }
    }

    fn context(broker: Arc<FakeBroker>, local_az: &str) -> ReconcilerContext {
        context_with_discovery(broker, local_az, Arc::new(InProcessDiscovery::new()))
    }

    fn context_with_discovery(broker: Arc<FakeBroker>, local_az: &str, discovery: Arc<InProcessDiscovery>) -> ReconcilerContext {
        let hosts = HostMap::from_pairs(vec![
            RabbitHost { host: "broker-a".to_owned(), az_name: "eu-west-1a".to_owned() },
            RabbitHost { host: "broker-b".to_owned(), az_name: "eu-west-1b".to_owned() },
        ]);
        let lock_service = InMemoryRegionLockService::new();
        ReconcilerContext {
            local_az: local_az.to_owned(),
            local_host: hosts.representatives().into_iter().find(|h| h.az_name == local_az).unwrap().host,
            is_rabbit_failed_over: AtomicBool::new(false),
            broker,
            rule_store: Arc::new(InMemoryRuleStore::new(lock_service.clone())),
            lock_service,
            discovery,
            hosts,
        }
    }

    #[tokio::test]
    async fn setup_service_creates_local_binding_and_remote_exchange_bindings() {
        let broker = Arc::new(FakeBroker::default());
        let ctx = context(broker.clone(), "eu-west-1a");
        let s = service("i1", "svc.a", "eu-west-1a");

        ctx.setup_service(&s).await.unwrap();

        let local = broker.get_bindings("broker-a", MAIN_EXCHANGE, DestinationType::Queue, "i1").await.unwrap();
        assert_eq!(local.len(), 1);

        let remote = broker.get_bindings("broker-b", MAIN_EXCHANGE, DestinationType::Exchange, "eu-west-1a").await.unwrap();
        assert_eq!(remote.len(), 1);
    }

    #[tokio::test]
    async fn setup_service_noop_outside_local_az() {
        let broker = Arc::new(FakeBroker::default());
        let ctx = context(broker.clone(), "eu-west-1a");
        let s = service("i1", "svc.a", "eu-west-1b");
        ctx.setup_service(&s).await.unwrap();
        assert!(broker.get_bindings("broker-a", MAIN_EXCHANGE, DestinationType::Queue, "i1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn setup_service_never_prunes_down_to_zero_bindings() {
        let broker = Arc::new(FakeBroker::default());
        let ctx = context(broker.clone(), "eu-west-1a");
        let s = service("i1", "svc.a", "eu-west-1a");

        let mut stale = binding_def_from_service(&s);
        stale.properties_key = Some("~old".to_owned());
        stale.routing_key = "something-else".to_owned();
        broker.create_binding("broker-a", &stale).await.unwrap();

        ctx.setup_service(&s).await.unwrap();

        let local = broker.get_bindings("broker-a", MAIN_EXCHANGE, DestinationType::Queue, "i1").await.unwrap();
        assert_eq!(local.len(), 1, "mismatched binding should have been pruned since it wasn't the only one");
    }

    #[tokio::test]
    async fn teardown_service_is_a_noop_outside_local_az() {
        let broker = Arc::new(FakeBroker::default());
        let ctx = context(broker.clone(), "eu-west-1a");
        ctx.teardown_service("svc.a", "i1", "eu-west-1b").await.unwrap();
    }

    #[tokio::test]
    async fn teardown_service_unbinds_remotely_when_last_instance() {
        let broker = Arc::new(FakeBroker::default());
        let ctx = context(broker.clone(), "eu-west-1a");
        let s = service("i1", "svc.a", "eu-west-1a");
        ctx.setup_service(&s).await.unwrap();

        ctx.teardown_service("svc.a", "i1", "eu-west-1a").await.unwrap();

        let remote = broker.get_bindings("broker-b", MAIN_EXCHANGE, DestinationType::Exchange, "eu-west-1a").await.unwrap();
        assert!(remote.is_empty(), "last instance torn down should unbind remotely");
    }

    #[tokio::test]
    async fn teardown_service_does_not_disturb_other_services_local_bindings() {
        let broker = Arc::new(FakeBroker::default());
        let ctx = context(broker.clone(), "eu-west-1a");
        let a = service("i1", "svc.a", "eu-west-1a");
        let b = service("i2", "svc.b", "eu-west-1a");
        ctx.setup_service(&a).await.unwrap();
        ctx.setup_service(&b).await.unwrap();

        ctx.teardown_service("svc.a", "i1", "eu-west-1a").await.unwrap();

        let still_bound = broker.get_bindings("broker-a", MAIN_EXCHANGE, DestinationType::Queue, "i2").await.unwrap();
        assert_eq!(still_bound.len(), 1, "tearing down one service must not wipe another service's local binding");
    }

    #[tokio::test]
    async fn local_only_service_never_gets_remote_bindings() {
        let broker = Arc::new(FakeBroker::default());
        let ctx = context(broker.clone(), "eu-west-1a");
        let s = service("i1", "com.HailoOSS.kernel.binding", "eu-west-1a");

        ctx.setup_service(&s).await.unwrap();

        let remote = broker.get_bindings("broker-b", MAIN_EXCHANGE, DestinationType::Exchange, "eu-west-1a").await.unwrap();
        assert!(remote.is_empty());
    }

    #[tokio::test]
    async fn detect_rabbit_failed_over_true_when_bindings_empty() {
        let broker = Arc::new(FakeBroker::default());
        let ctx = context(broker.clone(), "eu-west-1a");
        assert!(ctx.detect_rabbit_failed_over().await);
    }

    #[tokio::test]
    async fn detect_rabbit_failed_over_false_when_main_exchange_present() {
        let broker = Arc::new(FakeBroker::default());
        let ctx = context(broker.clone(), "eu-west-1a");
        let healthy = BindingDef {
            source: "eu-west-1a".to_owned(),
            vhost: "/".to_owned(),
            destination: MAIN_EXCHANGE.to_owned(),
            destination_type: DestinationType::Exchange,
            routing_key: String::new(),
            properties_key: None,
            arguments: Default::default(),
        };
        broker.create_binding("broker-a", &healthy).await.unwrap();
        assert!(!ctx.detect_rabbit_failed_over().await);
    }

    #[tokio::test]
    async fn rebind_all_in_failover_mode_only_tears_down_never_sets_up_remotes() {
        let broker = Arc::new(FakeBroker::default());
        let discovery = Arc::new(InProcessDiscovery::new());
        let remote = service("server-svc-1", "svc.remote", "eu-west-1b");
        discovery.register(remote);

        let ctx = context_with_discovery(broker.clone(), "eu-west-1a", discovery);
        ctx.is_rabbit_failed_over.store(true, Ordering::Relaxed);

        let stray = BindingDef {
            source: "eu-west-1a".to_owned(),
            vhost: "/".to_owned(),
            destination: "server-svc-1".to_owned(),
            destination_type: DestinationType::Queue,
            routing_key: "svc.remote".to_owned(),
            properties_key: None,
            arguments: Default::default(),
        };
        broker.create_binding("broker-b", &stray).await.unwrap();

        ctx.rebind_all().await;

        assert!(broker.get_exchange_bindings_as_source("broker-b", "eu-west-1a").await.unwrap().is_empty());
        assert!(broker.get_bindings("broker-a", MAIN_EXCHANGE, DestinationType::Queue, "server-svc-1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn rebind_all_in_normal_mode_prunes_bindings_for_services_no_longer_running() {
        let broker = Arc::new(FakeBroker::default());
        broker.seed_exchange("broker-a", "eu-west-1b");
        let ctx = context(broker.clone(), "eu-west-1a");

        let stale = BindingDef {
            source: MAIN_EXCHANGE.to_owned(),
            vhost: "/".to_owned(),
            destination: "eu-west-1b".to_owned(),
            destination_type: DestinationType::Exchange,
            routing_key: "svc.gone".to_owned(),
            properties_key: None,
            arguments: {
                let mut m = crate::model::Arguments::new();
                m.insert("service".to_owned(), "svc.gone".into());
                m
            },
        };
        broker.create_binding("broker-a", &stale).await.unwrap();

        ctx.rebind_all().await;

        let remaining = broker.get_bindings("broker-a", MAIN_EXCHANGE, DestinationType::Exchange, "eu-west-1b").await.unwrap();
        assert!(remaining.is_empty(), "binding for a service no longer running anywhere should be pruned");
    }
}
