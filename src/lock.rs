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

//! The region lock: serializes setup/teardown for a given
//! `(service, az)` pair so two concurrent service-up events don't race each other's
//! binding changes.
//!
//! The original took an explicit `Unlock()` call threaded through every return path.
//! Here the lock is represented by a guard that releases on `Drop`, so an early
//! `?`-return can never leak it the way a forgotten `Unlock()` call could.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashSet;

use crate::error::{ReconcilerError, Result};

#[async_trait]
pub trait RegionLockService: Send + Sync {
    /// Acquire the lock for `key`, waiting if it is already held. Returns a guard
    /// that releases the lock when dropped.
    async fn lock(self: Arc<Self>, key: &str) -> Result<LockGuard>;

    /// Non-blocking variant: fails immediately instead of waiting.
    async fn try_lock(self: Arc<Self>, key: &str) -> Result<LockGuard>;

    /// Internal hook the guard's `Drop` calls to release the lock.
    fn release(&self, key: &str);
}

/// Held for as long as the caller wants the lock. Dropping it (including via an
/// early `?` return) releases the lock.
pub struct LockGuard {
    key: String,
    service: Arc<dyn RegionLockService>,
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        self.service.release(&self.key);
    }
}

/// A single-process lock table backed by `DashSet`. Good enough for a single
/// reconciler instance; a production multi-replica deployment would back this with
/// a distributed lock service instead, which is why the trait boundary exists.
#[derive(Default)]
pub struct InMemoryRegionLockService {
    held: DashSet<String>,
}

impl InMemoryRegionLockService {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

#[async_trait]
impl RegionLockService for InMemoryRegionLockService {
    async fn lock(self: Arc<Self>, key: &str) -> Result<LockGuard> {
        while !self.held.insert(key.to_owned()) {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        Ok(LockGuard { key: key.to_owned(), service: self })
    }

    async fn try_lock(self: Arc<Self>, key: &str) -> Result<LockGuard> {
        if self.held.insert(key.to_owned()) {
            return Ok(LockGuard { key: key.to_owned(), service: self });
        }
        Err(ReconcilerError::LockUnavailable {
            key: key.to_owned(),
            reason: "already held".to_owned(),
        })
    }

    fn release(&self, key: &str) {
        self.held.remove(key);
    }
}
