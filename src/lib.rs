//! A control-plane reconciler that converges message-broker routing topology
//! (exchanges, queues, bindings, federation policies) to the live service
//! inventory reported by an external discovery bus, across a fleet of
//! clusters distributed over multiple availability zones.
//!
//! The [`reconciler`] module is the core: the convergence loop that drives
//! [`broker::BrokerAdmin`] towards the desired state derived from
//! [`discovery::DiscoveryClient`] and [`rule_store::RuleStore`], serialised by
//! [`lock::RegionLockService`]. [`handlers`] adapts external RPC/event traffic
//! onto the reconciler; [`health`] independently audits the result.

/// Audit events published on every rule mutation.
pub mod audit;
/// Local availability-zone detection.
pub mod az;
/// Typed async wrapper over the broker's HTTP management API.
pub mod broker;
/// Runtime configuration, loaded from the environment.
pub mod config;
/// The service-discovery boundary: live instance inventory.
pub mod discovery;
/// The error taxonomy shared by every fallible operation.
pub mod error;
/// Thin adapters from external RPC/event traffic onto the reconciler.
pub mod handlers;
/// Cross-checks discovery inventory against actual broker bindings.
pub mod health;
/// The broker host map, one representative host per availability zone.
pub mod hosts;
/// Per-`(service, az)` and per-service region locking.
pub mod lock;
/// Value types: services, rules, bindings, and their derivation laws.
pub mod model;
/// The convergence engine: setup/teardown and the periodic sweep.
pub mod reconciler;
/// The per-service weighting rule store.
pub mod rule_store;
