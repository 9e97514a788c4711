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

//! The broker host map: a CSV file of `host,az_name` rows,
//! loaded once at bootstrap, collapsed down to one representative host per AZ.

use std::collections::HashMap;
use std::io::Read;
use std::path::Path;

use rand::RngExt;

use crate::error::{ReconcilerError, Result};
use crate::model::RabbitHost;

#[derive(Debug, Clone)]
pub struct HostMap {
    by_az: HashMap<String, Vec<String>>,
}

impl HostMap {
    pub fn from_pairs(hosts: Vec<RabbitHost>) -> Self {
        let mut by_az: HashMap<String, Vec<String>> = HashMap::new();
        for h in hosts {
            by_az.entry(h.az_name).or_default().push(h.host);
        }
        Self { by_az }
    }

    pub fn load_csv(path: impl AsRef<Path>) -> Result<Self> {
        let mut contents = String::new();
        std::fs::File::open(path.as_ref())
            .map_err(|e| ReconcilerError::Unrecoverable(format!("couldn't read {}: {e}", path.as_ref().display())))?
            .read_to_string(&mut contents)
            .map_err(|e| ReconcilerError::Unrecoverable(format!("couldn't read {}: {e}", path.as_ref().display())))?;
        Self::parse_csv(&contents)
    }

    fn parse_csv(contents: &str) -> Result<Self> {
        let mut by_az: HashMap<String, Vec<String>> = HashMap::new();
        let mut reader = csv::ReaderBuilder::new().has_headers(false).from_reader(contents.as_bytes());
        for record in reader.records() {
            let record = record.map_err(|e| ReconcilerError::Unrecoverable(format!("malformed rabbithosts row: {e}")))?;
            let host = record
                .get(0)
                .ok_or_else(|| ReconcilerError::Unrecoverable("rabbithosts row missing host column".to_owned()))?;
            let az_name = record
                .get(1)
                .ok_or_else(|| ReconcilerError::Unrecoverable("rabbithosts row missing az_name column".to_owned()))?;
            by_az.entry(az_name.to_owned()).or_default().push(host.to_owned());
        }
        Ok(Self { by_az })
    }

    /// One randomly chosen host per AZ, suitable for use as that AZ's representative
    /// when fanning a binding change out to every cluster.
    pub fn representatives(&self) -> Vec<RabbitHost> {
        let mut rng = rand::rng();
        self.by_az
            .iter()
            .map(|(az_name, hosts)| {
                let idx = rng.random_range(0..hosts.len());
                RabbitHost { host: hosts[idx].clone(), az_name: az_name.clone() }
            })
            .collect()
    }

    pub fn az_names(&self) -> impl Iterator<Item = &str> {
        self.by_az.keys().map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_host_az_rows() {
        let map = HostMap::parse_csv("broker01,eu-west-1a\nbroker02,eu-west-1a\nbroker03,eu-west-1b\n").unwrap();
        assert_eq!(map.az_names().count(), 2);
        let reps = map.representatives();
        assert_eq!(reps.len(), 2);
        assert!(reps.iter().all(|h| ["broker01", "broker02", "broker03"].contains(&h.host.as_str())));
    }

    #[test]
    fn rejects_rows_missing_the_az_column() {
        assert!(HostMap::parse_csv("broker01\n").is_err());
    }

    #[test]
    fn representative_is_stable_for_a_single_host_az() {
        let map = HostMap::parse_csv("only-host,eu-west-1c\n").unwrap();
        let reps = map.representatives();
        assert_eq!(reps[0].host, "only-host");
        assert_eq!(reps[0].az_name, "eu-west-1c");
    }
}
