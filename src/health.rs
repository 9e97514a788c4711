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

//! The health checker: cross-checks discovery's live-instance
//! inventory against the bindings actually present on each AZ's broker, so a
//! supervisor can surface "instance X is running but has no binding" as a failure
//! before it causes silent message loss.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::broker::BrokerAdmin;
use crate::discovery::DiscoveryClient;
use crate::error::Result;
use crate::hosts::HostMap;
use crate::model::{DestinationType, MAIN_EXCHANGE};

const MAX_MESSAGE_LEN: usize = 255;

pub struct HealthCheckResult {
    pub missing: BTreeMap<String, String>,
    pub healthy: bool,
}

impl HealthCheckResult {
    /// A single human-readable line, truncated to 255 characters like the original.
    pub fn summary(&self) -> Option<String> {
        if self.missing.is_empty() {
            return None;
        }
        let mut labels: Vec<&str> = self.missing.keys().map(String::as_str).collect();
        labels.sort_unstable();
        let mut joined = labels.join(", ");
        joined.truncate(MAX_MESSAGE_LEN);
        Some(format!("{} inconsistent bindings: {joined}", self.missing.len()))
    }
}

pub struct HealthChecker {
    broker: Arc<dyn BrokerAdmin>,
    discovery: Arc<dyn DiscoveryClient>,
    hosts: HostMap,
}

impl HealthChecker {
    pub fn new(broker: Arc<dyn BrokerAdmin>, discovery: Arc<dyn DiscoveryClient>, hosts: HostMap) -> Self {
        Self { broker, discovery, hosts }
    }

    pub async fn check(&self) -> Result<HealthCheckResult> {
        let mut missing = BTreeMap::new();

        for az_name in self.hosts.az_names() {
            let instances = self.discovery.list_instances().await?;
            let local_instances: Vec<_> = instances.into_iter().filter(|s| s.az_name == az_name).collect();

            for host in self.hosts.representatives().into_iter().filter(|h| h.az_name == az_name) {
                let bindings = self.broker.get_all_bindings(&host.host).await?;

                for instance in &local_instances {
                    let found = bindings.iter().any(|b| {
                        b.source == MAIN_EXCHANGE
                            && b.destination_type == DestinationType::Queue
                            && b.routing_key == instance.service
                            && b.destination == instance.instance
                    });
                    if !found {
                        let label = format!("{az_name}-rabbit.{}-{}", host.host, instance.service);
                        missing.insert(label, instance.instance.clone());
                    }
                }
            }
        }

        let healthy = missing.is_empty();
        Ok(HealthCheckResult { missing, healthy })
    }
}
