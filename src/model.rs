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

//! Value types shared by every other module: the live service inventory, the routing
//! rules that parameterise bindings, and the wire shape of a binding/exchange/queue
//! as the broker's HTTP management API understands them.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// The headers-match exchange on which service requests are published.
pub const MAIN_EXCHANGE: &str = "h2o";
/// The topic exchange carrying pub/sub event traffic.
pub const TOPIC_EXCHANGE: &str = "h2o.topic";
/// Default broker management API port.
pub const DEFAULT_BROKER_PORT: u16 = 15672;
/// The only vhost this system operates against.
pub const VHOST: &str = "/";

/// Services which must never cross AZs: their bindings are purely local.
pub fn is_local_only_service(service: &str) -> bool {
    service == "com.HailoOSS.kernel.binding"
}

/// A scalar argument value as carried in a binding's `arguments` map.
///
/// The broker's HTTP API accepts heterogeneous JSON values here; we constrain what
/// this system produces to strings, floats and bools, and document that `x-weight`
/// is always serialized as a float (the broker does not distinguish JSON integers
/// from floats, but some client libraries do, so the type is written explicitly).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ArgumentValue {
    String(String),
    Number(f64),
    Bool(bool),
}

impl ArgumentValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            ArgumentValue::String(s) => Some(s),
            _ => None,
        }
    }
}

impl From<&str> for ArgumentValue {
    fn from(value: &str) -> Self {
        ArgumentValue::String(value.to_owned())
    }
}

impl From<String> for ArgumentValue {
    fn from(value: String) -> Self {
        ArgumentValue::String(value)
    }
}

impl From<f64> for ArgumentValue {
    fn from(value: f64) -> Self {
        ArgumentValue::Number(value)
    }
}

pub type Arguments = BTreeMap<String, ArgumentValue>;

/// The destination type of a binding, as spelled out in JSON payloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DestinationType {
    Queue,
    Exchange,
}

impl DestinationType {
    /// The single-letter code used in URL path segments (`q` or `e`).
    pub fn path_code(self) -> &'static str {
        match self {
            DestinationType::Queue => "q",
            DestinationType::Exchange => "e",
        }
    }
}

/// A live service instance as announced by discovery. Identity is `instance`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Service {
    pub service: String,
    pub version: String,
    pub instance: String,
    pub az_name: String,
    pub subscriptions: Vec<String>,
}

/// An operator-defined routing rule. Identity is `(service, content hash of the JSON form)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rule {
    pub service: String,
    /// Technically numeric, kept as a string: comparisons behave identically and it's
    /// more flexible for services that mint non-numeric version identifiers.
    pub version: String,
    pub weight: i32,
}

impl Rule {
    pub fn is_applicable(&self, s: &Service) -> bool {
        self.service == s.service && self.version == s.version
    }

    /// The overlay this rule contributes to a binding's arguments.
    pub fn argument_overlay(&self) -> Arguments {
        let mut m = Arguments::new();
        m.insert("service".to_owned(), self.service.clone().into());
        m.insert("x-weight".to_owned(), ArgumentValue::from(self.weight as f64));
        m
    }

    /// The content hash RuleStore uses as a column name. Two rules that serialize
    /// identically hash identically, which is what makes repeated writes idempotent.
    pub fn content_hash(&self) -> String {
        let bytes = serde_json::to_vec(self).expect("Rule always serializes");
        format!("{:x}", md5::compute(bytes))
    }
}

/// A binding as exchanged with the broker's HTTP management API.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BindingDef {
    pub source: String,
    pub vhost: String,
    pub destination: String,
    pub destination_type: DestinationType,
    pub routing_key: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub properties_key: Option<String>,
    #[serde(skip_serializing_if = "Arguments::is_empty", default)]
    pub arguments: Arguments,
}

impl BindingDef {
    /// Equality used to decide whether an already-bound binding matches the desired
    /// one. `properties_key` is excluded: it is assigned by the broker, not by us.
    pub fn eq_ignoring_properties_key(&self, other: &BindingDef) -> bool {
        self.source == other.source
            && self.vhost == other.vhost
            && self.destination == other.destination
            && self.routing_key == other.routing_key
            && self.arguments == other.arguments
    }
}

/// The queue binding every live local service instance must have:
/// `MAIN_EXCHANGE -> queue s.instance`, routed by service name.
pub fn binding_def_from_service(s: &Service) -> BindingDef {
    let mut arguments = Arguments::new();
    arguments.insert("x-match".to_owned(), "all".into());
    arguments.insert("service".to_owned(), s.service.clone().into());
    BindingDef {
        source: MAIN_EXCHANGE.to_owned(),
        vhost: VHOST.to_owned(),
        destination: s.instance.clone(),
        destination_type: DestinationType::Queue,
        routing_key: s.service.clone(),
        properties_key: None,
        arguments,
    }
}

/// The staging binding every *other* AZ needs so a request can federate in:
/// `MAIN_EXCHANGE -> exchange az`, with `x-nofed` so it never loops back out.
pub fn exchange_binding_def_from_service(s: &Service, az_name: &str) -> BindingDef {
    let mut arguments = Arguments::new();
    arguments.insert("x-match".to_owned(), "all".into());
    arguments.insert("x-nofed".to_owned(), "yes".into());
    arguments.insert("service".to_owned(), s.service.clone().into());
    BindingDef {
        source: MAIN_EXCHANGE.to_owned(),
        vhost: VHOST.to_owned(),
        destination: az_name.to_owned(),
        destination_type: DestinationType::Exchange,
        routing_key: s.service.clone(),
        properties_key: None,
        arguments,
    }
}

/// A plain topic subscription binding: `from -> queue dest_queue`, routed by `topic`.
pub fn topic_binding_def(from_exchange: &str, dest_queue: &str, topic: &str) -> BindingDef {
    BindingDef {
        source: from_exchange.to_owned(),
        vhost: VHOST.to_owned(),
        destination: dest_queue.to_owned(),
        destination_type: DestinationType::Queue,
        routing_key: topic.to_owned(),
        properties_key: None,
        arguments: Arguments::new(),
    }
}

/// Overlay every applicable rule's arguments onto `b`. Matches §4.3.1 step 3: later
/// rules win on key collisions, mirroring a plain iterate-and-insert loop.
pub fn apply_rules(rules: &[Rule], b: &mut BindingDef, s: &Service) {
    for r in rules {
        if r.is_applicable(s) {
            for (k, v) in r.argument_overlay() {
                b.arguments.insert(k, v);
            }
        }
    }
}

/// Synthesises the implicit default rule (weight 100) used whenever the rule store
/// has nothing on file for a service.
pub fn default_rule(s: &Service) -> Rule {
    Rule {
        service: s.service.clone(),
        version: s.version.clone(),
        weight: 100,
    }
}

/// A broker-side exchange descriptor, read-only to this system except at creation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExchangeDef {
    pub name: String,
    #[serde(default)]
    pub vhost: String,
    #[serde(rename = "type")]
    pub exchange_type: String,
    #[serde(default)]
    pub durable: bool,
    #[serde(default)]
    pub arguments: Arguments,
}

/// A broker-side queue descriptor, read-only to this system except at creation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueDef {
    pub name: String,
    #[serde(default)]
    pub durable: bool,
    #[serde(default)]
    pub arguments: Arguments,
}

/// One broker host, tagged with the AZ it serves.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RabbitHost {
    pub host: String,
    pub az_name: String,
}

/// Exchange names that are *not* a remote AZ's staging exchange: the main exchange,
/// RabbitMQ's own `amq.*` exchanges, and federation-internal exchanges.
pub fn looks_like_az_exchange(name: &str) -> bool {
    !name.is_empty()
        && !name.starts_with("amq")
        && !name.starts_with(MAIN_EXCHANGE)
        && !name.starts_with("federation")
}
