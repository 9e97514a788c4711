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

//! Local AZ detection: an explicit override for local
//! development and tests, falling back to the AWS instance metadata service that
//! the original process queried unconditionally at startup. Either path failing
//! is unrecoverable: the reconciler cannot know what it owns without its AZ.

use reqwest::Client as HttpClient;

use crate::error::{ReconcilerError, Result};

const IMDS_AZ_URL: &str = "http://169.254.169.254/latest/meta-data/placement/availability-zone";

pub async fn detect_local_az(http: &HttpClient, override_az: Option<&str>) -> Result<String> {
    if let Some(az) = override_az {
        return Ok(az.to_owned());
    }

    let response = http
        .get(IMDS_AZ_URL)
        .send()
        .await
        .map_err(|e| ReconcilerError::Unrecoverable(format!("could not reach instance metadata service: {e}")))?;
    if !response.status().is_success() {
        return Err(ReconcilerError::Unrecoverable(format!(
            "instance metadata service returned status {}",
            response.status()
        )));
    }
    let az = response
        .text()
        .await
        .map_err(|e| ReconcilerError::Unrecoverable(format!("could not read instance metadata response: {e}")))?;
    let az = az.trim();
    if az.is_empty() {
        return Err(ReconcilerError::Unrecoverable("instance metadata service returned an empty AZ name".to_owned()));
    }
    Ok(az.to_owned())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn override_short_circuits_the_metadata_call() {
        let http = HttpClient::new();
        let az = detect_local_az(&http, Some("eu-west-1a")).await.unwrap();
        assert_eq!(az, "eu-west-1a");
    }
}
