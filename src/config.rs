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

//! Runtime configuration: loaded from the environment, with
//! `.env`-file support for local development via `dotenvy`.

use std::time::Duration;

use crate::error::{ReconcilerError, Result};
use crate::model::DEFAULT_BROKER_PORT;

const DEFAULT_HOSTS_FILE: &str = "/etc/h2o/rabbithosts";
const DEFAULT_REBIND_INTERVAL_SECS: u64 = 180;
const DEFAULT_REBIND_TIMEOUT_SECS: u64 = 120;

#[derive(Debug, Clone)]
pub struct Config {
    pub rabbit_hosts_file: String,
    pub rabbit_user: String,
    pub rabbit_password: String,
    pub rabbit_port: u16,
    pub rebind_interval: Duration,
    pub rebind_timeout: Duration,
    pub local_az_override: Option<String>,
}

impl Config {
    /// Loads `.env` if present (missing is not an error) then reads the process
    /// environment.
    pub fn load() -> Result<Self> {
        match dotenvy::dotenv() {
            Ok(_) | Err(dotenvy::Error::Io(_)) => {}
            Err(e) => return Err(ReconcilerError::Unrecoverable(format!("failed to parse .env: {e}"))),
        }

        Ok(Self {
            rabbit_hosts_file: env_or("BINDING_RABBIT_HOSTS_FILE", DEFAULT_HOSTS_FILE),
            rabbit_user: env_or("BINDING_RABBIT_USER", "guest"),
            rabbit_password: env_or("BINDING_RABBIT_PASSWORD", "guest"),
            rabbit_port: env_parsed_or("BINDING_RABBIT_PORT", DEFAULT_BROKER_PORT)?,
            rebind_interval: Duration::from_secs(env_parsed_or("BINDING_REBIND_INTERVAL_SECS", DEFAULT_REBIND_INTERVAL_SECS)?),
            rebind_timeout: Duration::from_secs(env_parsed_or("BINDING_REBIND_TIMEOUT_SECS", DEFAULT_REBIND_TIMEOUT_SECS)?),
            local_az_override: std::env::var("BINDING_LOCAL_AZ").ok(),
        })
    }
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_owned())
}

fn env_parsed_or<T: std::str::FromStr>(key: &str, default: T) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(raw) => raw.parse().map_err(|e| ReconcilerError::Unrecoverable(format!("invalid {key}={raw:?}: {e}"))),
        Err(_) => Ok(default),
    }
}
