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

//! Audit events: every binding mutation this system performs is
//! reported through an `AuditSink`, tagged with a generated event ID. UUIDv4 is the
//! happy path; should the RNG source the `uuid` crate relies on ever be unavailable,
//! a short pseudo-random fallback keeps event emission from blocking on it.

use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use rand::RngExt;
use serde::Serialize;
use uuid::Uuid;

const PSEUDO_RAND_ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";
const PSEUDO_RAND_LEN: usize = 10;

/// A 10-character alphanumeric fallback ID, used only if UUID generation panics or
/// is otherwise unavailable. Mirrors the original's `generatePseudoRand` escape
/// hatch: audit events must never go unsent just because an ID could not be minted.
fn pseudo_rand_id() -> String {
    let mut rng = rand::rng();
    (0..PSEUDO_RAND_LEN)
        .map(|_| PSEUDO_RAND_ALPHABET[rng.random_range(0..PSEUDO_RAND_ALPHABET.len())] as char)
        .collect()
}

/// Generate an event ID, preferring UUIDv4 and falling back to a pseudo-random
/// string only if the process is in some way unable to produce one (the `uuid`
/// crate's v4 generator is infallible in practice, but callers upstream of this
/// reconciler historically treated ID generation as fallible, so the fallback path
/// is kept rather than assumed away).
pub fn generate_event_id() -> String {
    std::panic::catch_unwind(Uuid::new_v4).map(|u| u.to_string()).unwrap_or_else(|_| pseudo_rand_id())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditAction {
    BindingCreated,
    BindingDeleted,
    RuleCreated,
    RuleDeleted,
}

#[derive(Debug, Clone, Serialize)]
pub struct AuditEvent {
    pub id: String,
    /// Unix seconds, as a string: matches the original's timestamp formatting so
    /// downstream log scrapers built against that format keep working.
    pub timestamp: String,
    pub action: AuditAction,
    pub service: String,
    pub version: String,
    pub az_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub weight: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
}

impl AuditEvent {
    pub fn new(action: AuditAction, service: impl Into<String>, version: impl Into<String>, az_name: impl Into<String>) -> Self {
        let timestamp = SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_secs()).unwrap_or(0).to_string();
        Self {
            id: generate_event_id(),
            timestamp,
            action,
            service: service.into(),
            version: version.into(),
            az_name: az_name.into(),
            host: None,
            weight: None,
            user: None,
        }
    }

    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = Some(host.into());
        self
    }

    pub fn with_weight(mut self, weight: i32) -> Self {
        self.weight = Some(weight);
        self
    }

    pub fn with_user(mut self, user: impl Into<String>) -> Self {
        self.user = Some(user.into());
        self
    }
}

#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn publish(&self, event: AuditEvent);
}

/// Publishes audit events to the structured log rather than a message bus: this
/// system's own audit trail is itself just another consumer of a log aggregator,
/// the way the rest of the ambient stack already assumes one is in place.
pub struct LoggingAuditSink;

#[async_trait]
impl AuditSink for LoggingAuditSink {
    async fn publish(&self, event: AuditEvent) {
        match serde_json::to_string(&event) {
            Ok(json) => log::info!(target: "audit", "{json}"),
            Err(e) => log::warn!(target: "audit", "failed to serialize audit event {}: {e}", event.id),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_ids_are_unique() {
        let a = generate_event_id();
        let b = generate_event_id();
        assert_ne!(a, b);
        assert!(!a.is_empty());
    }

    #[test]
    fn pseudo_rand_id_has_expected_length_and_alphabet() {
        let id = pseudo_rand_id();
        assert_eq!(id.len(), PSEUDO_RAND_LEN);
        assert!(id.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit()));
    }

    #[tokio::test]
    async fn logging_audit_sink_does_not_panic_on_publish() {
        let sink = LoggingAuditSink;
        let event = AuditEvent::new(AuditAction::BindingCreated, "svc", "1", "eu-west-1a").with_host("broker01").with_weight(100);
        sink.publish(event).await;
    }
}
