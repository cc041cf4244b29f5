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

//! An in-process, multi-region, multi-version store.
//!
//! It implements every collaborator a [`Snapshot`](crate::Snapshot) needs, keeps a log of
//! received scan requests and can inject faults into the scan path.

use std::cmp::Reverse;
use std::collections::BTreeMap;
use std::collections::VecDeque;
use std::io;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::time::Duration;

use log::debug;
use log::warn;

use crate::backoff::BackoffKind;
use crate::backoff::Backoffer;
use crate::key::next_key;
use crate::key::DisplayKey;
use crate::lock::Lock;
use crate::lock::LockExtractor;
use crate::region::KeyLocation;
use crate::region::RegionLocator;
use crate::region::RegionVerId;
use crate::rpc::LockInfo;
use crate::rpc::RawKvPair;
use crate::rpc::RoutingError;
use crate::rpc::ScanRequest;
use crate::rpc::ScanResponse;
use crate::rpc::ScanSender;
use crate::snapshot::IsolationLevel;
use crate::snapshot::PointGet;
use crate::snapshot::ReadOptions;
use crate::snapshot::SafePoint;
use crate::Key;
use crate::ScanError;
use crate::Value;
use crate::Version;

/// Outcome of the transaction that owns a lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxnStatus {
    Pending,
    Committed(Version),
    RolledBack,
}

/// A failure to return, in order, from the next scan requests instead of serving them.
#[derive(Debug, Clone)]
pub enum Fault {
    Routing(RoutingError),
    MissingBody,
    Transport(String),
    /// Answer with this response regardless of the request.
    Respond(ScanResponse),
}

#[derive(Debug, Clone)]
struct Region {
    id: u64,
    epoch: u64,
    start_key: Key,
    end_key: Key,
}

impl Region {
    fn location(&self) -> KeyLocation {
        KeyLocation {
            region: RegionVerId {
                id: self.id,
                epoch: self.epoch,
            },
            start_key: self.start_key.clone(),
            end_key: self.end_key.clone(),
        }
    }
}

#[derive(Debug, Clone)]
struct PendingWrite {
    lock: Lock,
    /// `None` is a pending delete.
    value: Option<Value>,
}

#[derive(Debug)]
struct Inner {
    last_region_id: u64,

    /// Sorted, contiguous, and together covering the whole key space.
    regions: Vec<Region>,

    /// Keep the most recent version of a key first. A deletion has no value.
    data: BTreeMap<(Key, Reverse<Version>), Option<Value>>,

    locks: BTreeMap<Key, PendingWrite>,
    txns: BTreeMap<Version, TxnStatus>,
    safe_point: Version,
    faults: VecDeque<Fault>,
    scans: Vec<ScanRequest>,
}

impl Default for Inner {
    fn default() -> Self {
        Self {
            last_region_id: 1,
            regions: vec![Region {
                id: 1,
                epoch: 1,
                start_key: vec![],
                end_key: vec![],
            }],
            data: BTreeMap::new(),
            locks: BTreeMap::new(),
            txns: BTreeMap::new(),
            safe_point: 0,
            faults: VecDeque::new(),
            scans: Vec::new(),
        }
    }
}

impl Inner {
    fn region_of(&self, key: &[u8]) -> Option<&Region> {
        self.regions
            .iter()
            .find(|r| r.location().contains(key))
    }

    /// The committed record of `key` with the greatest version `<= version`.
    fn committed(&self, key: &[u8], version: Version) -> Option<&Option<Value>> {
        let start = (key.to_vec(), Reverse(version));
        let ((k, _), v) = self.data.range(start..).next()?;
        (k.as_slice() == key).then_some(v)
    }

    /// The lock on `key` that a read at `version` must wait for, if any.
    fn blocking_lock(&self, key: &[u8], version: Version, options: &ReadOptions) -> Option<&PendingWrite> {
        if options.isolation_level == IsolationLevel::Rc {
            return None;
        }
        self.locks.get(key).filter(|pw| pw.lock.txn_id <= version)
    }

    /// Reads `key`, first cleaning up a lock whose transaction has finished.
    ///
    /// Returns the lock if its transaction is still pending.
    fn read_resolving(
        &mut self,
        key: &[u8],
        version: Version,
        options: &ReadOptions,
    ) -> Result<Value, Lock> {
        if let Some(pw) = self.blocking_lock(key, version, options).cloned() {
            let status = self
                .txns
                .get(&pw.lock.txn_id)
                .copied()
                .unwrap_or(TxnStatus::Pending);

            match status {
                TxnStatus::Pending => return Err(pw.lock),
                TxnStatus::Committed(commit_version) => {
                    debug!("commit {} at {}", pw.lock, commit_version);
                    self.data
                        .insert((key.to_vec(), Reverse(commit_version)), pw.value);
                    self.locks.remove(key);
                }
                TxnStatus::RolledBack => {
                    debug!("roll back {}", pw.lock);
                    self.locks.remove(key);
                }
            }
        }

        let value = self.committed(key, version).cloned().flatten();
        Ok(value.unwrap_or_default())
    }

    /// Collects at most `req.limit` entries of `region` starting at `req.start_key`.
    ///
    /// Deleted keys are returned with an empty value; locked keys carry the lock.
    fn scan(&self, req: &ScanRequest, region: &Region) -> Vec<RawKvPair> {
        let location = region.location();
        let limit = req.limit as usize;

        let mut pairs = Vec::new();
        let mut cursor = req.start_key.clone();

        while pairs.len() < limit {
            let data_key = self
                .data
                .range((cursor.clone(), Reverse(Version::MAX))..)
                .next()
                .map(|((k, _), _)| k);
            let lock_key = self.locks.range(cursor.clone()..).next().map(|(k, _)| k);

            let key = match (data_key, lock_key) {
                (Some(d), Some(l)) => d.min(l).clone(),
                (Some(k), None) | (None, Some(k)) => k.clone(),
                (None, None) => break,
            };

            if !location.contains(&key) {
                break;
            }

            if let Some(pw) = self.blocking_lock(&key, req.version, &req.context) {
                pairs.push(RawKvPair::locked(key.clone(), LockInfo {
                    key: pw.lock.key.clone(),
                    primary_lock: pw.lock.primary.clone(),
                    lock_version: pw.lock.txn_id,
                    lock_ttl: pw.lock.ttl,
                }));
            } else if let Some(v) = self.committed(&key, req.version) {
                pairs.push(RawKvPair::new(key.clone(), v.clone().unwrap_or_default()));
            }

            cursor = next_key(&key);
        }

        pairs
    }
}

/// An in-memory store split into regions.
///
/// A new store has a single region covering all keys.
#[derive(Debug, Default)]
pub struct MemStore {
    inner: Mutex<Inner>,
}

impl MemStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn inner(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Writes a committed value.
    pub fn put(&self, key: impl AsRef<[u8]>, version: Version, value: impl Into<Value>) {
        let mut inner = self.inner();
        inner
            .data
            .insert((key.as_ref().to_vec(), Reverse(version)), Some(value.into()));
    }

    /// Writes a committed deletion.
    pub fn delete(&self, key: impl AsRef<[u8]>, version: Version) {
        let mut inner = self.inner();
        inner.data.insert((key.as_ref().to_vec(), Reverse(version)), None);
    }

    /// Leaves a prewritten, not yet committed write of transaction `txn_id` on `key`.
    ///
    /// `value == None` is a pending delete. The transaction stays [`TxnStatus::Pending`]
    /// until [`MemStore::commit`] or [`MemStore::rollback`].
    pub fn lock(&self, key: impl AsRef<[u8]>, txn_id: Version, value: Option<Value>) {
        let key = key.as_ref().to_vec();
        let mut inner = self.inner();
        inner.txns.entry(txn_id).or_insert(TxnStatus::Pending);
        inner.locks.insert(key.clone(), PendingWrite {
            lock: Lock {
                primary: key.clone(),
                key,
                txn_id,
                ttl: 3_000,
            },
            value,
        });
    }

    /// Marks transaction `txn_id` committed; its locks are resolved lazily on read.
    pub fn commit(&self, txn_id: Version, commit_version: Version) {
        self.inner()
            .txns
            .insert(txn_id, TxnStatus::Committed(commit_version));
    }

    pub fn rollback(&self, txn_id: Version) {
        self.inner().txns.insert(txn_id, TxnStatus::RolledBack);
    }

    /// Splits the region containing `key` at `key`.
    ///
    /// Both halves get a new epoch, so requests addressed to the old region fail
    /// with [`RoutingError::EpochNotMatch`].
    pub fn split(&self, key: impl AsRef<[u8]>) {
        let key = key.as_ref();
        let mut inner = self.inner();

        let Some(idx) = inner
            .regions
            .iter()
            .position(|r| r.location().contains(key))
        else {
            return;
        };

        if inner.regions[idx].start_key.as_slice() == key {
            return;
        }

        inner.last_region_id += 1;
        let new_id = inner.last_region_id;

        let left = &mut inner.regions[idx];
        left.epoch += 1;
        let right = Region {
            id: new_id,
            epoch: left.epoch,
            start_key: key.to_vec(),
            end_key: std::mem::replace(&mut left.end_key, key.to_vec()),
        };

        debug!("split region {} at {}", left.id, DisplayKey(key));
        inner.regions.insert(idx + 1, right);
    }

    pub fn set_safe_point(&self, safe_point: Version) {
        self.inner().safe_point = safe_point;
    }

    /// Queues a fault returned by an upcoming scan request.
    pub fn inject(&self, fault: Fault) {
        self.inner().faults.push_back(fault);
    }

    /// All scan requests received so far, including the failed ones.
    pub fn scan_requests(&self) -> Vec<ScanRequest> {
        self.inner().scans.clone()
    }

    pub fn regions(&self) -> Vec<KeyLocation> {
        self.inner().regions.iter().map(Region::location).collect()
    }
}

#[async_trait::async_trait]
impl RegionLocator for MemStore {
    async fn locate_key(&self, _bo: &mut Backoffer, key: &[u8]) -> Result<KeyLocation, ScanError> {
        let inner = self.inner();
        let region = inner.region_of(key).ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::NotFound,
                format!("no region contains key {}", DisplayKey(key)),
            )
        })?;
        Ok(region.location())
    }
}

#[async_trait::async_trait]
impl ScanSender for MemStore {
    async fn send_scan(
        &self,
        _bo: &mut Backoffer,
        region: &RegionVerId,
        req: &ScanRequest,
        _timeout: Duration,
    ) -> Result<ScanResponse, ScanError> {
        let mut inner = self.inner();
        inner.scans.push(req.clone());

        if let Some(fault) = inner.faults.pop_front() {
            warn!("inject fault into scan at region {}: {:?}", region, fault);
            return match fault {
                Fault::Routing(err) => Ok(ScanResponse::with_routing_error(err)),
                Fault::MissingBody => Ok(ScanResponse::default()),
                Fault::Respond(resp) => Ok(resp),
                Fault::Transport(msg) => Err(ScanError::Transport(io::Error::new(
                    io::ErrorKind::ConnectionReset,
                    msg,
                ))),
            };
        }

        let Some(current) = inner.regions.iter().find(|r| r.id == region.id) else {
            return Ok(ScanResponse::with_routing_error(
                RoutingError::RegionNotFound {
                    region_id: region.id,
                },
            ));
        };

        if current.epoch != region.epoch {
            return Ok(ScanResponse::with_routing_error(
                RoutingError::EpochNotMatch {
                    region_id: region.id,
                    current_epoch: current.epoch,
                },
            ));
        }

        if !current.location().contains(&req.start_key) {
            return Ok(ScanResponse::with_routing_error(
                RoutingError::KeyNotInRegion {
                    key: req.start_key.clone(),
                    region_id: region.id,
                },
            ));
        }

        let pairs = inner.scan(req, current);
        Ok(ScanResponse::with_pairs(pairs))
    }
}

#[async_trait::async_trait]
impl PointGet for MemStore {
    async fn get(
        &self,
        bo: &mut Backoffer,
        key: &[u8],
        version: Version,
        options: &ReadOptions,
    ) -> Result<Value, ScanError> {
        self.check_visibility(version)?;

        loop {
            let lock = {
                let mut inner = self.inner();
                match inner.read_resolving(key, version, options) {
                    Ok(value) => return Ok(value),
                    Err(lock) => lock,
                }
            };

            bo.backoff(BackoffKind::TxnLock, format!("key is locked: {}", lock))
                .await?;
        }
    }
}

impl SafePoint for MemStore {
    fn check_visibility(&self, version: Version) -> Result<(), ScanError> {
        let safe_point = self.inner().safe_point;
        if version < safe_point {
            return Err(ScanError::StaleVersion {
                read_version: version,
                safe_point,
            });
        }
        Ok(())
    }
}

impl LockExtractor for MemStore {}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn req(start: &[u8], limit: u32, version: Version) -> ScanRequest {
        ScanRequest {
            start_key: start.to_vec(),
            limit,
            version,
            context: ReadOptions::default(),
        }
    }

    async fn scan(store: &MemStore, start: &[u8], limit: u32, version: Version) -> ScanResponse {
        let mut bo = Backoffer::new(0);
        let loc = store.locate_key(&mut bo, start).await.unwrap();
        store
            .send_scan(&mut bo, &loc.region, &req(start, limit, version), Duration::from_secs(1))
            .await
            .unwrap()
    }

    fn keys(resp: &ScanResponse) -> Vec<String> {
        resp.body
            .as_ref()
            .unwrap()
            .pairs
            .iter()
            .map(|p| String::from_utf8_lossy(&p.key).to_string())
            .collect()
    }

    #[tokio::test]
    async fn test_get_versions() -> anyhow::Result<()> {
        let store = MemStore::new();
        store.put("a", 1, "a1");
        store.put("a", 5, "a5");
        store.delete("a", 7);

        let mut bo = Backoffer::new(0);
        let opts = ReadOptions::default();

        assert_eq!(store.get(&mut bo, b"a", 0, &opts).await?, b"".to_vec());
        assert_eq!(store.get(&mut bo, b"a", 1, &opts).await?, b"a1".to_vec());
        assert_eq!(store.get(&mut bo, b"a", 6, &opts).await?, b"a5".to_vec());
        assert_eq!(store.get(&mut bo, b"a", 7, &opts).await?, b"".to_vec());
        assert_eq!(store.get(&mut bo, b"b", 7, &opts).await?, b"".to_vec());
        Ok(())
    }

    #[tokio::test]
    async fn test_get_resolves_finished_locks() -> anyhow::Result<()> {
        let store = MemStore::new();
        store.put("a", 1, "old");
        store.put("b", 1, "old");

        store.lock("a", 5, Some(b"new".to_vec()));
        store.commit(5, 8);

        store.lock("b", 6, Some(b"new".to_vec()));
        store.rollback(6);

        let mut bo = Backoffer::new(0);
        let opts = ReadOptions::default();

        // Committed after the read version: the old value stays visible.
        assert_eq!(store.get(&mut bo, b"a", 7, &opts).await?, b"old".to_vec());
        assert_eq!(store.get(&mut bo, b"a", 10, &opts).await?, b"new".to_vec());
        assert_eq!(store.get(&mut bo, b"b", 10, &opts).await?, b"old".to_vec());
        assert_eq!(bo.total_sleep_ms(), 0);
        Ok(())
    }

    #[tokio::test]
    async fn test_get_pending_lock_exhausts_backoff() {
        let store = MemStore::new();
        store.lock("a", 5, Some(b"new".to_vec()));

        let mut bo = Backoffer::new(10);
        let err = store
            .get(&mut bo, b"a", 10, &ReadOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, ScanError::RetryBudgetExhausted { .. }));
    }

    #[tokio::test]
    async fn test_get_ignores_newer_and_rc_locks() -> anyhow::Result<()> {
        let store = MemStore::new();
        store.put("a", 1, "old");
        store.lock("a", 5, Some(b"new".to_vec()));

        let mut bo = Backoffer::new(10);

        // Lock started after the read version.
        let got = store.get(&mut bo, b"a", 4, &ReadOptions::default()).await?;
        assert_eq!(got, b"old".to_vec());

        let rc = ReadOptions {
            isolation_level: IsolationLevel::Rc,
            ..Default::default()
        };
        assert_eq!(store.get(&mut bo, b"a", 10, &rc).await?, b"old".to_vec());
        Ok(())
    }

    #[tokio::test]
    async fn test_scan_limit_tombstones_and_locks() {
        let store = MemStore::new();
        store.put("a", 1, "a");
        store.put("b", 1, "b");
        store.delete("b", 2);
        store.put("c", 20, "c");
        store.lock("d", 3, None);
        store.put("e", 1, "e");

        let resp = scan(&store, b"", 10, 10).await;
        let pairs = resp.body.unwrap().pairs;

        assert_eq!(pairs, vec![
            RawKvPair::new(b"a".to_vec(), b"a".to_vec()),
            RawKvPair::new(b"b".to_vec(), vec![]),
            RawKvPair::locked(b"d".to_vec(), LockInfo {
                key: b"d".to_vec(),
                primary_lock: b"d".to_vec(),
                lock_version: 3,
                lock_ttl: 3_000,
            }),
            RawKvPair::new(b"e".to_vec(), b"e".to_vec()),
        ]);

        let resp = scan(&store, b"b\x00", 2, 10).await;
        assert_eq!(keys(&resp), vec!["d", "e"]);
    }

    #[tokio::test]
    async fn test_split_and_routing() {
        let store = MemStore::new();
        for k in ["a", "b", "m", "n"] {
            store.put(k, 1, k);
        }

        let mut bo = Backoffer::new(0);
        let stale = store.locate_key(&mut bo, b"a").await.unwrap();

        store.split("m");
        store.split("m");
        assert_eq!(store.regions().len(), 2);

        let left = store.locate_key(&mut bo, b"a").await.unwrap();
        assert_eq!(left.end_key, b"m".to_vec());
        let right = store.locate_key(&mut bo, b"z").await.unwrap();
        assert_eq!(right.start_key, b"m".to_vec());
        assert!(right.is_last());

        // Scans stop at the region boundary.
        assert_eq!(keys(&scan(&store, b"", 10, 10).await), vec!["a", "b"]);
        assert_eq!(keys(&scan(&store, b"m", 10, 10).await), vec!["m", "n"]);

        let timeout = Duration::from_secs(1);

        let resp = store
            .send_scan(&mut bo, &stale.region, &req(b"a", 10, 10), timeout)
            .await
            .unwrap();
        assert_eq!(
            resp.routing_error,
            Some(RoutingError::EpochNotMatch {
                region_id: 1,
                current_epoch: 2
            })
        );

        let resp = store
            .send_scan(&mut bo, &left.region, &req(b"m", 10, 10), timeout)
            .await
            .unwrap();
        assert!(matches!(
            resp.routing_error,
            Some(RoutingError::KeyNotInRegion { region_id: 1, .. })
        ));
    }

    #[tokio::test]
    async fn test_faults_and_request_log() {
        let store = MemStore::new();
        store.put("a", 1, "a");
        store.inject(Fault::Routing(RoutingError::NotLeader { region_id: 1 }));
        store.inject(Fault::MissingBody);
        store.inject(Fault::Transport("connection reset".to_string()));

        let mut bo = Backoffer::new(0);
        let region = RegionVerId { id: 1, epoch: 1 };
        let timeout = Duration::from_secs(1);
        let r = req(b"", 10, 10);

        let resp = store.send_scan(&mut bo, &region, &r, timeout).await.unwrap();
        assert_eq!(
            resp.routing_error,
            Some(RoutingError::NotLeader { region_id: 1 })
        );

        let resp = store.send_scan(&mut bo, &region, &r, timeout).await.unwrap();
        assert_eq!(resp, ScanResponse::default());

        let err = store
            .send_scan(&mut bo, &region, &r, timeout)
            .await
            .unwrap_err();
        assert!(matches!(err, ScanError::Transport(ref e) if e.kind() == io::ErrorKind::ConnectionReset));

        let resp = store.send_scan(&mut bo, &region, &r, timeout).await.unwrap();
        assert_eq!(keys(&resp), vec!["a"]);

        assert_eq!(store.scan_requests().len(), 4);
    }

    #[test]
    fn test_safe_point() {
        let store = MemStore::new();
        store.set_safe_point(10);
        assert!(store.check_visibility(10).is_ok());
        assert!(matches!(
            store.check_visibility(9),
            Err(ScanError::StaleVersion {
                read_version: 9,
                safe_point: 10
            })
        ));
    }
}
