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

//! Locks held by concurrent writers and their extraction from key errors.

use std::fmt;

use crate::key::DisplayKey;
use crate::rpc::KeyError;
use crate::rpc::LockInfo;
use crate::Key;
use crate::ScanError;
use crate::Version;

/// An uncommitted write intent held by another transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lock {
    pub key: Key,
    pub primary: Key,
    /// Start version of the transaction holding the lock.
    pub txn_id: Version,
    pub ttl: u64,
}

impl From<LockInfo> for Lock {
    fn from(info: LockInfo) -> Self {
        Self {
            key: info.key,
            primary: info.primary_lock,
            txn_id: info.lock_version,
            ttl: info.lock_ttl,
        }
    }
}

impl fmt::Display for Lock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "lock(key={}, primary={}, txn_id={}, ttl={})",
            DisplayKey(&self.key),
            DisplayKey(&self.primary),
            self.txn_id,
            self.ttl
        )
    }
}

/// Turns a per-key error of a scan response into a [`Lock`].
///
/// The default implementation accepts only [`KeyError::Locked`]; every other key error
/// can not be resolved by reading the key again and is returned as [`ScanError::KeyError`].
pub trait LockExtractor: Send + Sync {
    fn extract_lock(&self, err: &KeyError) -> Result<Lock, ScanError> {
        match err {
            KeyError::Locked(info) => Ok(Lock::from(info.clone())),
            other => Err(ScanError::KeyError(other.clone())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Extractor;

    impl LockExtractor for Extractor {}

    #[test]
    fn test_extract_lock() {
        let info = LockInfo {
            key: b"k".to_vec(),
            primary_lock: b"p".to_vec(),
            lock_version: 5,
            lock_ttl: 3000,
        };

        let lock = Extractor.extract_lock(&KeyError::Locked(info)).unwrap();
        assert_eq!(lock, Lock {
            key: b"k".to_vec(),
            primary: b"p".to_vec(),
            txn_id: 5,
            ttl: 3000,
        });
        assert_eq!(
            lock.to_string(),
            "lock(key=\"k\", primary=\"p\", txn_id=5, ttl=3000)"
        );
    }

    #[test]
    fn test_extract_non_lock_error() {
        let err = Extractor
            .extract_lock(&KeyError::Abort("txn aborted".to_string()))
            .unwrap_err();
        assert!(matches!(err, ScanError::KeyError(KeyError::Abort(ref s)) if s == "txn aborted"));

        let err = Extractor
            .extract_lock(&KeyError::Conflict {
                start_version: 1,
                conflict_version: 2,
            })
            .unwrap_err();
        assert!(matches!(err, ScanError::KeyError(KeyError::Conflict { .. })));
    }
}
