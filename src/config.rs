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

use std::time::Duration;

/// Number of entries requested per scan RPC when the caller does not specify one.
///
/// Must be greater than 1: a page of one entry can not tell a full page from the last one.
pub const DEFAULT_PAGE_SIZE: usize = 256;

/// Tuning knobs for scanners created from a [`Snapshot`](crate::Snapshot).
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct ScannerConfig {
    /// Entries requested per page by [`Snapshot::iter`](crate::Snapshot::iter).
    pub page_size: usize,

    /// Timeout of a single scan RPC.
    pub read_timeout_ms: u64,

    /// Total backoff sleep allowed within one [`Scanner::next`](crate::Scanner::next) call.
    pub next_max_backoff_ms: u64,

    /// Total backoff sleep allowed for a standalone point read.
    pub get_max_backoff_ms: u64,
}

impl Default for ScannerConfig {
    fn default() -> Self {
        Self {
            page_size: DEFAULT_PAGE_SIZE,
            read_timeout_ms: 60_000,
            next_max_backoff_ms: 20_000,
            get_max_backoff_ms: 20_000,
        }
    }
}

impl ScannerConfig {
    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }
}
