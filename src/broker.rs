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

//! A typed async wrapper over the broker's HTTP management API.
//!
//! Every path is built by hand rather than through a general-purpose percent-encoder
//! for the vhost segment: the vhost is always `/` and must appear on the wire as the
//! literal, lowercase `%2f`. `url::Url::parse` does not re-encode escapes that are
//! already present in the string it is given, so building the path as a string first
//! and parsing it afterwards is what defeats an HTTP library's tendency to normalize
//! (and thus mangle) that escape.

use async_trait::async_trait;
use percent_encoding::{AsciiSet, CONTROLS, utf8_percent_encode};
use reqwest::{Client as HttpClient, StatusCode};
use serde_json::{Value, json};
use url::Url;

use crate::error::{ReconcilerError, Result};
use crate::model::{Arguments, BindingDef, DestinationType, ExchangeDef, QueueDef, VHOST};

/// Characters a path segment must escape beyond what `CONTROLS` already covers.
/// Letters, digits, `.`, `-` and `_` pass through unescaped for readability; everything
/// else (including `/`) is escaped so a segment can never smuggle in an extra path hop.
const PATH_SEGMENT: &AsciiSet = &CONTROLS
    .add(b' ')
    .add(b'/')
    .add(b'%')
    .add(b'?')
    .add(b'#')
    .add(b'[')
    .add(b']')
    .add(b'@')
    .add(b':');

fn encode_segment(s: &str) -> String {
    utf8_percent_encode(s, PATH_SEGMENT).to_string()
}

/// The subset of broker operations this system needs. Kept as a trait so the
/// reconciler can be driven against an in-memory fake in tests without a real broker.
#[async_trait]
pub trait BrokerAdmin: Send + Sync {
    async fn create_binding(&self, host: &str, b: &BindingDef) -> Result<()>;
    async fn delete_binding(&self, host: &str, b: &BindingDef) -> Result<()>;
    async fn get_bindings(
        &self,
        host: &str,
        source: &str,
        dest_type: DestinationType,
        destination: &str,
    ) -> Result<Vec<BindingDef>>;
    async fn get_exchange_bindings_as_source(&self, host: &str, exchange: &str) -> Result<Vec<BindingDef>>;
    /// Every binding on the vhost, regardless of source — used by the health checker,
    /// which cross-checks the whole local topology rather than one exchange at a time.
    async fn get_all_bindings(&self, host: &str) -> Result<Vec<BindingDef>>;
    async fn get_all_exchanges(&self, host: &str) -> Result<Vec<ExchangeDef>>;
    async fn create_exchange(&self, host: &str, exchange: &ExchangeDef) -> Result<()>;
    async fn create_queue(&self, host: &str, queue: &QueueDef) -> Result<()>;
    async fn create_policy(&self, host: &str, name: &str, pattern: &str) -> Result<()>;
    async fn create_federation_upstream(&self, host: &str, upstream_name: &str, amqp_uri: &str) -> Result<()>;
}

/// A real client, talking to the broker's management API over HTTP(S) with basic auth.
#[derive(Clone)]
pub struct BrokerAdminClient {
    http: HttpClient,
    port: u16,
    username: String,
    password: String,
    scheme: &'static str,
}

impl BrokerAdminClient {
    pub fn new(http: HttpClient, port: u16, username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            http,
            port,
            username: username.into(),
            password: password.into(),
            scheme: "http",
        }
    }

    fn rooted_url(&self, host: &str, path: &str) -> Result<Url> {
        let raw = format!("{}://{}:{}/api/{}", self.scheme, host, self.port, path);
        Url::parse(&raw).map_err(|e| ReconcilerError::Unrecoverable(format!("invalid broker URL {raw}: {e}")))
    }

    async fn ok_or_status_error(&self, response: reqwest::Response) -> Result<reqwest::Response> {
        let status = response.status();
        if status.is_client_error() || status.is_server_error() {
            let body = response.text().await.unwrap_or_default();
            return Err(ReconcilerError::BrokerStatus {
                status: status.as_u16(),
                body,
                trace: backtrace::Backtrace::new(),
            });
        }
        Ok(response)
    }

    async fn get(&self, host: &str, path: &str) -> Result<reqwest::Response> {
        let url = self.rooted_url(host, path)?;
        let response = self
            .http
            .get(url)
            .basic_auth(&self.username, Some(&self.password))
            .send()
            .await?;
        self.ok_or_status_error(response).await
    }

    async fn get_ignoring_not_found(&self, host: &str, path: &str) -> Result<Option<reqwest::Response>> {
        let url = self.rooted_url(host, path)?;
        let response = self
            .http
            .get(url)
            .basic_auth(&self.username, Some(&self.password))
            .send()
            .await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        Ok(Some(self.ok_or_status_error(response).await?))
    }

    async fn put(&self, host: &str, path: &str, payload: &Value) -> Result<()> {
        let url = self.rooted_url(host, path)?;
        let response = self
            .http
            .put(url)
            .basic_auth(&self.username, Some(&self.password))
            .json(payload)
            .send()
            .await?;
        self.ok_or_status_error(response).await?;
        Ok(())
    }

    async fn post(&self, host: &str, path: &str, payload: &Value) -> Result<()> {
        let url = self.rooted_url(host, path)?;
        let response = self
            .http
            .post(url)
            .basic_auth(&self.username, Some(&self.password))
            .json(payload)
            .send()
            .await?;
        self.ok_or_status_error(response).await?;
        Ok(())
    }

    async fn delete(&self, host: &str, path: &str) -> Result<()> {
        let url = self.rooted_url(host, path)?;
        let response = self
            .http
            .delete(url)
            .basic_auth(&self.username, Some(&self.password))
            .send()
            .await?;
        if response.status() == StatusCode::NOT_FOUND {
            // The queue/binding is usually already gone; not-found on delete is not an error.
            return Ok(());
        }
        self.ok_or_status_error(response).await?;
        Ok(())
    }

    fn binding_path(source: &str, dest_type: DestinationType, dest: &str) -> String {
        format!(
            "bindings/%2f/e/{}/{}/{}",
            encode_segment(source),
            dest_type.path_code(),
            encode_segment(dest)
        )
    }
}

#[async_trait]
impl BrokerAdmin for BrokerAdminClient {
    async fn create_binding(&self, host: &str, b: &BindingDef) -> Result<()> {
        let path = Self::binding_path(&b.source, b.destination_type, &b.destination);
        self.post(host, &path, &serde_json::to_value(b)?).await
    }

    async fn delete_binding(&self, host: &str, b: &BindingDef) -> Result<()> {
        let mut path = Self::binding_path(&b.source, b.destination_type, &b.destination);
        if let Some(pk) = &b.properties_key {
            path.push('/');
            path.push_str(&encode_segment(pk));
        }
        self.delete(host, &path).await
    }

    async fn get_bindings(
        &self,
        host: &str,
        source: &str,
        dest_type: DestinationType,
        destination: &str,
    ) -> Result<Vec<BindingDef>> {
        let path = Self::binding_path(source, dest_type, destination);
        match self.get_ignoring_not_found(host, &path).await? {
            Some(response) => Ok(response.json().await?),
            None => Ok(Vec::new()),
        }
    }

    async fn get_exchange_bindings_as_source(&self, host: &str, exchange: &str) -> Result<Vec<BindingDef>> {
        let path = format!("exchanges/%2f/{}/bindings/source", encode_segment(exchange));
        match self.get_ignoring_not_found(host, &path).await? {
            Some(response) => Ok(response.json().await?),
            None => Ok(Vec::new()),
        }
    }

    async fn get_all_bindings(&self, host: &str) -> Result<Vec<BindingDef>> {
        let response = self.get(host, "bindings/%2f").await?;
        Ok(response.json().await?)
    }

    async fn get_all_exchanges(&self, host: &str) -> Result<Vec<ExchangeDef>> {
        let response = self.get(host, "exchanges/%2f").await?;
        Ok(response.json().await?)
    }

    async fn create_exchange(&self, host: &str, exchange: &ExchangeDef) -> Result<()> {
        let path = format!("exchanges/%2f/{}", encode_segment(&exchange.name));
        let mut payload = json!({ "type": exchange.exchange_type, "durable": true });
        if !exchange.arguments.is_empty() {
            payload["arguments"] = serde_json::to_value(&exchange.arguments)?;
        }
        self.put(host, &path, &payload).await
    }

    async fn create_queue(&self, host: &str, queue: &QueueDef) -> Result<()> {
        let path = format!("queues/%2f/{}", encode_segment(&queue.name));
        let mut payload = json!({ "durable": true });
        if !queue.arguments.is_empty() {
            payload["arguments"] = serde_json::to_value(&queue.arguments)?;
        }
        self.put(host, &path, &payload).await
    }

    async fn create_policy(&self, host: &str, name: &str, pattern: &str) -> Result<()> {
        let path = format!("policies/%2f/{}", encode_segment(name));
        let payload = json!({
            "pattern": pattern,
            "definition": { "federation-upstream-set": "all" },
        });
        self.put(host, &path, &payload).await
    }

    async fn create_federation_upstream(&self, host: &str, upstream_name: &str, amqp_uri: &str) -> Result<()> {
        let path = format!("parameters/federation-upstream/%2f/{}", encode_segment(upstream_name));
        let payload = json!({
            "value": {
                "ack-mode": "no-ack",
                "expires": 360_000,
                "uri": amqp_uri,
            }
        });
        self.put(host, &path, &payload).await
    }
}

/// Use when the vhost segment needs spelling out explicitly (federation upstream URIs,
/// for instance, embed it); kept separate from the hardcoded `%2f` used in the path
/// builders above, which apply only to this system's single vhost.
pub fn encode_vhost(vhost: &str) -> String {
    if vhost == VHOST { "%2f".to_owned() } else { encode_segment(vhost) }
}

pub fn arguments_to_json(args: &Arguments) -> Result<Value> {
    Ok(serde_json::to_value(args)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn binding_path_contains_literal_lowercase_percent_2f() {
        let path = BrokerAdminClient::binding_path("h2o", DestinationType::Queue, "instance-1");
        assert!(path.contains("/%2f/"));
        assert!(!path.contains("%2F"));
    }

    #[test]
    fn rooted_url_preserves_percent_2f_on_the_wire() {
        let client = BrokerAdminClient::new(HttpClient::new(), 15672, "guest", "guest");
        let path = BrokerAdminClient::binding_path("h2o", DestinationType::Exchange, "eu-west-1a");
        let url = client.rooted_url("broker01", &path).unwrap();
        assert!(url.as_str().contains("/%2f/"), "url was {url}");
    }

    #[test]
    fn encode_segment_escapes_path_separators() {
        assert_eq!(encode_segment("a/b"), "a%2Fb");
        assert_eq!(encode_segment("service.name-1_2"), "service.name-1_2");
    }
}
