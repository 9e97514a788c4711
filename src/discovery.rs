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

//! The service-discovery boundary: the inventory of live
//! service instances this system reconciles broker topology against. The discovery
//! backend itself (etcd, a service registry, whatever an operator runs) is out of
//! scope; this module only states the shape of the query this system needs.

use async_trait::async_trait;
use dashmap::DashMap;

use crate::error::Result;
use crate::model::Service;

#[async_trait]
pub trait DiscoveryClient: Send + Sync {
    /// All instances currently registered, across every AZ.
    async fn list_instances(&self) -> Result<Vec<Service>>;

    /// Instances registered for a single service name, across every AZ.
    async fn list_instances_for_service(&self, service: &str) -> Result<Vec<Service>>;
}

/// An in-process registry used for bootstrap and tests: instances are pushed in by
/// whatever is feeding service-up/service-down events, rather than pulled from a
/// remote registry.
#[derive(Default)]
pub struct InProcessDiscovery {
    instances: DashMap<String, Service>,
}

impl InProcessDiscovery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, service: Service) {
        self.instances.insert(service.instance.clone(), service);
    }

    pub fn deregister(&self, instance: &str) {
        self.instances.remove(instance);
    }
}

#[async_trait]
impl DiscoveryClient for InProcessDiscovery {
    async fn list_instances(&self) -> Result<Vec<Service>> {
        Ok(self.instances.iter().map(|e| e.value().clone()).collect())
    }

    async fn list_instances_for_service(&self, service: &str) -> Result<Vec<Service>> {
        Ok(self
            .instances
            .iter()
            .filter(|e| e.value().service == service)
            .map(|e| e.value().clone())
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn service(instance: &str, service: &str, az: &str) -> Service {
        Service {
            service: service.to_owned(),
            version: "1".to_owned(),
            instance: instance.to_owned(),
            az_name: az.to_owned(),
            subscriptions: vec![],
        }
    }

    #[tokio::test]
    async fn lists_only_registered_instances() {
        let d = InProcessDiscovery::new();
        d.register(service("i1", "svc.a", "eu-west-1a"));
        d.register(service("i2", "svc.b", "eu-west-1b"));
        assert_eq!(d.list_instances().await.unwrap().len(), 2);
        assert_eq!(d.list_instances_for_service("svc.a").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn deregister_removes_the_instance() {
        let d = InProcessDiscovery::new();
        d.register(service("i1", "svc.a", "eu-west-1a"));
        d.deregister("i1");
        assert!(d.list_instances().await.unwrap().is_empty());
    }
}
