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

//! The error taxonomy: transient broker errors, lock failures,
//! rule store failures, and the handful of unrecoverable conditions that are meant
//! to take the whole process down so a supervisor can restart it cleanly.

use backtrace::Backtrace as CapturedTrace;

pub type Result<T> = std::result::Result<T, ReconcilerError>;

#[derive(Debug, thiserror::Error)]
pub enum ReconcilerError {
    /// The broker responded with a non-2xx status code.
    #[error("broker responded with status {status}: {body}")]
    BrokerStatus {
        status: u16,
        body: String,
        trace: CapturedTrace,
    },

    /// The underlying HTTP request failed before a response was available.
    #[error("HTTP request to the broker failed: {0}")]
    Http(#[from] reqwest::Error),

    /// Failed to (de)serialize a payload exchanged with the broker.
    #[error("failed to (de)serialize JSON: {0}")]
    Json(#[from] serde_json::Error),

    /// The rule store failed to read or write.
    #[error("rule store error: {0}")]
    RuleStore(String),

    /// Could not acquire the region lock for the given key.
    #[error("failed to acquire region lock for {key}: {reason}")]
    LockUnavailable { key: String, reason: String },

    /// Discovery could not be queried.
    #[error("discovery query failed: {0}")]
    Discovery(String),

    /// A condition severe enough that the process should exit and let its
    /// supervisor restart it: the periodic sweep overran its deadline, the local
    /// AZ could not be determined at startup, or post-connect setup failed.
    #[error("unrecoverable: {0}")]
    Unrecoverable(String),
}

impl ReconcilerError {
    /// Whether this failure is the kind that should make a handler RPC report
    /// bad-request rather than internal-error: an inability to
    /// lock during teardown usually signals upstream misuse.
    pub fn is_lock_failure(&self) -> bool {
        matches!(self, ReconcilerError::LockUnavailable { .. })
    }
}
