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

//! Errors surfaced by the scanner and its collaborators.

use std::io;

use crate::rpc::KeyError;
use crate::Version;

/// Errors that can occur while scanning a snapshot.
///
/// Every variant except [`ScanError::NotFound`] is fatal for a [`Scanner`](crate::Scanner):
/// the scanner is closed before the error is returned.
#[derive(Debug, thiserror::Error)]
pub enum ScanError {
    /// No visible key exists. Swallowed when constructing a scanner.
    #[error("key not found")]
    NotFound,

    /// The scanner was already closed, either explicitly or by an earlier failure.
    #[error("scanner iterator is invalid")]
    InvalidIterator,

    /// The backoff budget of a single advance is spent.
    #[error("backoff max sleep {max_sleep_ms}ms is exceeded, errors: [{}]", .errors.join("; "))]
    RetryBudgetExhausted {
        max_sleep_ms: u64,
        errors: Vec<String>,
    },

    /// The deadline attached to a backoffer has passed.
    #[error("deadline exceeded while backing off: {cause}")]
    DeadlineExceeded { cause: String },

    /// A scan response carried neither a routing error nor a body.
    #[error("response body is missing")]
    BodyMissing,

    /// The read version is older than the store's GC safe point.
    #[error("read version {read_version} is older than safe point {safe_point}")]
    StaleVersion {
        read_version: Version,
        safe_point: Version,
    },

    /// A per-key error in a scan response that is not a lock.
    #[error("unexpected key error: {0}")]
    KeyError(KeyError),

    /// Failure delivering a request, passed through unchanged.
    #[error("transport error: {0}")]
    Transport(#[from] io::Error),
}

impl ScanError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, ScanError::NotFound)
    }
}
