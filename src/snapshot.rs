// Copyright 2021 Datafuse Labs
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Snapshot providing a point-in-time view of a region-partitioned store.

use std::time::Instant;

use crate::backoff::Backoffer;
use crate::config::ScannerConfig;
use crate::lock::LockExtractor;
use crate::region::RegionLocator;
use crate::rpc::ScanSender;
use crate::ScanError;
use crate::Scanner;
use crate::Value;
use crate::Version;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum IsolationLevel {
    /// Snapshot isolation: locks older than the read version must be resolved.
    #[default]
    Si,
    /// Read committed: locks are ignored.
    Rc,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum Priority {
    #[default]
    Normal,
    Low,
    High,
}

/// Options sent along with every read of a snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct ReadOptions {
    pub isolation_level: IsolationLevel,
    pub priority: Priority,
    /// Whether the store should populate its block cache with the data read.
    pub fill_cache: bool,
}

impl Default for ReadOptions {
    fn default() -> Self {
        Self {
            isolation_level: IsolationLevel::default(),
            priority: Priority::default(),
            fill_cache: true,
        }
    }
}

/// Reads a single key as of a version.
#[async_trait::async_trait]
pub trait PointGet: Send + Sync {
    /// Returns the value of `key` visible at `version`.
    ///
    /// A missing or deleted key yields an empty value.
    /// Locks met on the way are resolved by the implementation, backing off with `bo`.
    async fn get(
        &self,
        bo: &mut Backoffer,
        key: &[u8],
        version: Version,
        options: &ReadOptions,
    ) -> Result<Value, ScanError>;
}

/// The visibility window of a store.
pub trait SafePoint: Send + Sync {
    /// Fails with [`ScanError::StaleVersion`] if data at `version` may already be garbage collected.
    fn check_visibility(&self, version: Version) -> Result<(), ScanError>;
}

/// Everything a [`Snapshot`] needs from the underlying store.
pub trait Store: RegionLocator + ScanSender + PointGet + SafePoint + LockExtractor {}

impl<T> Store for T where T: RegionLocator + ScanSender + PointGet + SafePoint + LockExtractor {}

/// A read-only view of the store fixed at one version.
///
/// Every read issued through a snapshot, including all pages of a [`Scanner`],
/// uses the same version and [`ReadOptions`].
#[derive(Debug, Clone)]
pub struct Snapshot<D>
where D: Store
{
    /// Values written after this version are invisible.
    version: Version,
    options: ReadOptions,
    config: ScannerConfig,
    /// Retries through this snapshot give up once it is reached.
    deadline: Option<Instant>,
    data: D,
}

impl<D> Snapshot<D>
where D: Store
{
    pub fn new(version: Version, data: D) -> Self {
        Self {
            version,
            options: ReadOptions::default(),
            config: ScannerConfig::default(),
            deadline: None,
            data,
        }
    }

    pub fn with_options(mut self, options: ReadOptions) -> Self {
        self.options = options;
        self
    }

    pub fn with_config(mut self, config: ScannerConfig) -> Self {
        self.config = config;
        self
    }

    /// Bounds every backoff of reads through this snapshot, including scanner advances,
    /// by `deadline`. Passing it fails the retry with [`ScanError::DeadlineExceeded`].
    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn version(&self) -> Version {
        self.version
    }

    pub fn options(&self) -> &ReadOptions {
        &self.options
    }

    pub fn config(&self) -> &ScannerConfig {
        &self.config
    }

    pub fn data(&self) -> &D {
        &self.data
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// A fresh backoffer with `max_sleep_ms` budget, bounded by the snapshot deadline.
    pub fn backoffer(&self, max_sleep_ms: u64) -> Backoffer {
        Backoffer::new(max_sleep_ms).with_deadline(self.deadline)
    }

    /// Reads one key with its own backoff budget.
    pub async fn get(&self, key: &[u8]) -> Result<Value, ScanError> {
        let mut bo = self.backoffer(self.config.get_max_backoff_ms);
        self.get_with_backoff(&mut bo, key).await
    }

    /// Reads one key, drawing retries from the caller's budget.
    pub async fn get_with_backoff(&self, bo: &mut Backoffer, key: &[u8]) -> Result<Value, ScanError> {
        self.data.get(bo, key, self.version, &self.options).await
    }

    /// Creates a scanner positioned at the first visible key `>= start_key`,
    /// fetching `config().page_size` entries per page.
    pub async fn iter(&self, start_key: &[u8]) -> Result<Scanner<'_, D>, ScanError> {
        Scanner::new(self, start_key, self.config.page_size).await
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::Mutex;
    use std::time::Duration;

    use pretty_assertions::assert_eq;

    use super::*;
    use crate::region::KeyLocation;
    use crate::region::RegionVerId;
    use crate::rpc::ScanRequest;
    use crate::rpc::ScanResponse;

    #[derive(Debug, Clone, Default)]
    struct MockData {
        calls: Arc<Mutex<Vec<String>>>,
    }

    impl MockData {
        fn record_call(&self, call: String) {
            self.calls.lock().unwrap().push(call);
        }

        fn get_calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait::async_trait]
    impl RegionLocator for MockData {
        async fn locate_key(
            &self,
            _bo: &mut Backoffer,
            _key: &[u8],
        ) -> Result<KeyLocation, ScanError> {
            Ok(KeyLocation {
                region: RegionVerId { id: 1, epoch: 1 },
                start_key: vec![],
                end_key: vec![],
            })
        }
    }

    #[async_trait::async_trait]
    impl ScanSender for MockData {
        async fn send_scan(
            &self,
            _bo: &mut Backoffer,
            _region: &RegionVerId,
            req: &ScanRequest,
            _timeout: Duration,
        ) -> Result<ScanResponse, ScanError> {
            self.record_call(format!("scan(version:{})", req.version));
            Ok(ScanResponse::with_pairs(vec![]))
        }
    }

    #[async_trait::async_trait]
    impl PointGet for MockData {
        async fn get(
            &self,
            _bo: &mut Backoffer,
            key: &[u8],
            version: Version,
            options: &ReadOptions,
        ) -> Result<Value, ScanError> {
            self.record_call(format!(
                "get(key:{}, version:{}, {:?})",
                String::from_utf8_lossy(key),
                version,
                options.isolation_level
            ));
            Ok(b"v".to_vec())
        }
    }

    impl SafePoint for MockData {
        fn check_visibility(&self, _version: Version) -> Result<(), ScanError> {
            Ok(())
        }
    }

    impl LockExtractor for MockData {}

    #[tokio::test]
    async fn test_snapshot_delegates_to_data() -> anyhow::Result<()> {
        let mock = MockData::default();
        let snapshot = Snapshot::new(42, mock.clone()).with_options(ReadOptions {
            isolation_level: IsolationLevel::Rc,
            ..Default::default()
        });

        assert_eq!(snapshot.get(b"k").await?, b"v".to_vec());

        let scanner = snapshot.iter(b"").await?;
        assert!(!scanner.valid());

        assert_eq!(mock.get_calls(), vec![
            "get(key:k, version:42, Rc)".to_string(),
            "scan(version:42)".to_string(),
        ]);
        Ok(())
    }

    #[test]
    fn test_default_read_options() {
        let opts = ReadOptions::default();
        assert_eq!(opts.isolation_level, IsolationLevel::Si);
        assert_eq!(opts.priority, Priority::Normal);
        assert!(opts.fill_cache);
    }
}
