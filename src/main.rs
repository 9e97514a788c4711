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

//! Bootstrap: loads configuration, detects the local AZ and
//! failover state, runs a synchronous first sweep, then hands off to the
//! periodic task. The RPC/topic transport that would drive `EventHandlers` in a
//! full deployment is an external collaborator and is not
//! reimplemented here; this binary wires up the reconciler and runs the sweep.

use std::process::ExitCode;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;

use rand::RngExt;
use reqwest::Client as HttpClient;

use binding_reconciler::audit::LoggingAuditSink;
use binding_reconciler::az::detect_local_az;
use binding_reconciler::broker::BrokerAdminClient;
use binding_reconciler::config::Config;
use binding_reconciler::discovery::InProcessDiscovery;
use binding_reconciler::error::ReconcilerError;
use binding_reconciler::handlers::EventHandlers;
use binding_reconciler::hosts::HostMap;
use binding_reconciler::lock::{InMemoryRegionLockService, RegionLockService};
use binding_reconciler::model::TOPIC_EXCHANGE;
use binding_reconciler::reconciler::ReconcilerContext;
use binding_reconciler::rule_store::InMemoryRuleStore;

#[tokio::main]
async fn main() -> ExitCode {
    env_logger::init();

    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            log::error!("fatal startup error: {e}");
            ExitCode::FAILURE
        }
    }
}

async fn run() -> Result<(), ReconcilerError> {
    let config = Config::load()?;
    log::info!("loaded configuration: rebind_interval={:?} rebind_timeout={:?}", config.rebind_interval, config.rebind_timeout);

    let http = HttpClient::new();
    let local_az = detect_local_az(&http, config.local_az_override.as_deref()).await?;
    log::info!("local AZ is {local_az}");

    let hosts = HostMap::load_csv(&config.rabbit_hosts_file)?;
    let local_host = hosts
        .representatives()
        .into_iter()
        .find(|h| h.az_name == local_az)
        .ok_or_else(|| ReconcilerError::Unrecoverable(format!("no broker host configured for local AZ {local_az}")))?
        .host;

    let broker = Arc::new(BrokerAdminClient::new(
        http.clone(),
        config.rabbit_port,
        config.rabbit_user.clone(),
        config.rabbit_password.clone(),
    ));
    let lock_service: Arc<dyn RegionLockService> = InMemoryRegionLockService::new();
    let rule_store = Arc::new(InMemoryRuleStore::new(lock_service.clone()));
    let discovery = Arc::new(InProcessDiscovery::new());

    let ctx = Arc::new(ReconcilerContext {
        local_az: local_az.clone(),
        local_host: local_host.clone(),
        is_rabbit_failed_over: AtomicBool::new(false),
        broker: broker.clone(),
        rule_store: rule_store.clone(),
        lock_service,
        discovery: discovery.clone(),
        hosts: hosts.clone(),
    });

    let failed_over = ctx.detect_rabbit_failed_over().await;
    ctx.is_rabbit_failed_over.store(failed_over, std::sync::atomic::Ordering::Relaxed);
    if failed_over {
        log::warn!("broker in {local_az} appears to be failed over; remote cleanup will run in reverse");
    }

    let handlers = EventHandlers::new(ctx.clone(), rule_store.clone(), Arc::new(LoggingAuditSink), broker.clone());
    post_connect(&handlers).await?;

    // Synchronous first sweep, then hand off to the periodic task.
    ctx.rebind_all().await;

    spawn_periodic_sweep(ctx, config.rebind_interval, config.rebind_timeout).await;
    Ok(())
}

/// Registers this process's own topic subscriptions so discovery's up/down
/// announcements reach it. The announcements themselves arrive over the
/// surrounding RPC framework (out of scope here); this only
/// creates the bindings that framework would rely on.
async fn post_connect(handlers: &EventHandlers) -> Result<(), ReconcilerError> {
    handlers.subscribe_topic("binding-reconciler", "discovery.serviceup").await?;
    handlers.subscribe_topic("binding-reconciler", "discovery.servicedown").await?;
    log::debug!("subscribed to discovery topics on {TOPIC_EXCHANGE}");
    Ok(())
}

/// Each iteration gets a hard deadline; on expiry the
/// process exits abnormally so a supervisor restarts it cleanly. Between
/// iterations the loop sleeps `interval + uniform(0, interval)`.
async fn spawn_periodic_sweep(ctx: Arc<ReconcilerContext>, interval: std::time::Duration, timeout: std::time::Duration) {
    loop {
        let jitter = rand::rng().random_range(0.0..1.0);
        let sleep_for = interval + interval.mul_f64(jitter);
        tokio::time::sleep(sleep_for).await;

        match tokio::time::timeout(timeout, ctx.rebind_all()).await {
            Ok(()) => {}
            Err(_) => {
                log::error!("rebind_all exceeded its {timeout:?} deadline; exiting for supervisor restart");
                std::process::exit(1);
            }
        }
    }
}
