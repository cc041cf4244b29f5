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

//! Scan request and response shapes, and the trait that delivers them to a region.

use std::time::Duration;

use crate::backoff::Backoffer;
use crate::region::RegionVerId;
use crate::snapshot::ReadOptions;
use crate::Key;
use crate::ScanError;
use crate::Value;
use crate::Version;

/// Ask a region for at most `limit` entries with key `>= start_key`, as of `version`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanRequest {
    pub start_key: Key,
    pub limit: u32,
    pub version: Version,
    pub context: ReadOptions,
}

/// Lock information attached to a key that a concurrent transaction is writing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockInfo {
    pub key: Key,
    pub primary_lock: Key,
    pub lock_version: Version,
    pub lock_ttl: u64,
}

/// A per-key error in a scan response.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum KeyError {
    #[error("key is locked: {0:?}")]
    Locked(LockInfo),

    #[error("write conflict: start_version={start_version} conflict_version={conflict_version}")]
    Conflict {
        start_version: Version,
        conflict_version: Version,
    },

    #[error("abort: {0}")]
    Abort(String),
}

/// One entry of a scan response.
///
/// `error` is set instead of a meaningful `value` when the key could not be read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawKvPair {
    pub key: Key,
    pub value: Value,
    pub error: Option<KeyError>,
}

impl RawKvPair {
    pub fn new(key: impl Into<Key>, value: impl Into<Value>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
            error: None,
        }
    }

    pub fn locked(key: impl Into<Key>, lock: LockInfo) -> Self {
        Self {
            key: key.into(),
            value: vec![],
            error: Some(KeyError::Locked(lock)),
        }
    }
}

/// The region rejected a request because it is not, or no longer, the right target.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RoutingError {
    #[error("not leader of region {region_id}")]
    NotLeader { region_id: u64 },

    #[error("epoch not match: region {region_id} current epoch {current_epoch}")]
    EpochNotMatch { region_id: u64, current_epoch: u64 },

    #[error("key {key:?} is not in region {region_id}")]
    KeyNotInRegion { key: Key, region_id: u64 },

    #[error("region {region_id} not found")]
    RegionNotFound { region_id: u64 },
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScanBody {
    pub pairs: Vec<RawKvPair>,
}

/// What a region answered to a [`ScanRequest`].
///
/// A well-formed response has either a routing error or a body.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScanResponse {
    pub routing_error: Option<RoutingError>,
    pub body: Option<ScanBody>,
}

impl ScanResponse {
    pub fn with_pairs(pairs: Vec<RawKvPair>) -> Self {
        Self {
            routing_error: None,
            body: Some(ScanBody { pairs }),
        }
    }

    pub fn with_routing_error(err: RoutingError) -> Self {
        Self {
            routing_error: Some(err),
            body: None,
        }
    }
}

/// Delivers scan requests to a region.
///
/// Transport failures are returned as [`ScanError::Transport`]; retrying them is up to
/// the implementation, which may use the supplied backoffer. Region-level rejections are
/// returned inside [`ScanResponse::routing_error`], not as `Err`.
#[async_trait::async_trait]
pub trait ScanSender: Send + Sync {
    async fn send_scan(
        &self,
        bo: &mut Backoffer,
        region: &RegionVerId,
        req: &ScanRequest,
        timeout: Duration,
    ) -> Result<ScanResponse, ScanError>;
}
