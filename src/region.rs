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

//! Region addressing: which region owns a key.

use std::fmt;

use crate::backoff::Backoffer;
use crate::key::DisplayKey;
use crate::Key;
use crate::ScanError;

/// Identifies one incarnation of a region.
///
/// `epoch` changes whenever the region's key range changes, e.g., on split,
/// so a request addressed with an old epoch is rejected by the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RegionVerId {
    pub id: u64,
    pub epoch: u64,
}

impl fmt::Display for RegionVerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.id, self.epoch)
    }
}

/// The region a key belongs to and the region's `[start_key, end_key)` range.
///
/// An empty `end_key` means the region is the last one and is unbounded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyLocation {
    pub region: RegionVerId,
    pub start_key: Key,
    pub end_key: Key,
}

impl KeyLocation {
    pub fn contains(&self, key: &[u8]) -> bool {
        key >= self.start_key.as_slice() && (self.end_key.is_empty() || key < self.end_key.as_slice())
    }

    pub fn is_last(&self) -> bool {
        self.end_key.is_empty()
    }
}

impl fmt::Display for KeyLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "region {} [{}, {})",
            self.region,
            DisplayKey(&self.start_key),
            DisplayKey(&self.end_key)
        )
    }
}

/// Resolves a key to the region currently responsible for it.
///
/// Implementations may cache locations; a stale answer is corrected when the store
/// rejects a request with a routing error and the caller locates the key again.
#[async_trait::async_trait]
pub trait RegionLocator: Send + Sync {
    async fn locate_key(&self, bo: &mut Backoffer, key: &[u8]) -> Result<KeyLocation, ScanError>;
}
