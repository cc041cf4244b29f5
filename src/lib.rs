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

//! # Region Scan
//!
//! A consistent range scanner over a key-value store that is split into regions and
//! versioned with MVCC.
//!
//! A [`Scanner`] enumerates keys in ascending order from an arbitrary start key, reading
//! every page at the single version of its [`Snapshot`]. It pages across region
//! boundaries, retries requests rejected by a region that moved or split, and resolves
//! keys locked by concurrent writers, so the caller only sees committed, non-deleted
//! key-value pairs.
//!
//! ## Core Components
//!
//! - [`Snapshot`]: fixed read version and [`ReadOptions`] over a [`Store`]
//! - [`Scanner`]: the cursor, see [`Scanner::next`] and [`Scanner::into_stream`]
//! - [`Store`]: the collaborators a snapshot reads through:
//!   [`RegionLocator`], [`ScanSender`], [`PointGet`], [`SafePoint`] and [`LockExtractor`]
//! - [`Backoffer`]: budgeted retry sleeps
//! - [`impls::mem_store::MemStore`]: an in-memory store implementing all of the above
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use futures_util::TryStreamExt;
//! use region_scan::impls::mem_store::MemStore;
//! use region_scan::ScanError;
//! use region_scan::Snapshot;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), ScanError> {
//!     let store = MemStore::new();
//!     store.put("a", 1, "1");
//!     store.put("b", 1, "2");
//!     store.split("b");
//!
//!     let snapshot = Snapshot::new(5, store);
//!
//!     let mut scanner = snapshot.iter(b"").await?;
//!     while scanner.valid() {
//!         println!("{:?}", scanner.key());
//!         scanner.next().await?;
//!     }
//!
//!     // Or as a stream
//!     let all = snapshot.iter(b"").await?.into_stream().try_collect::<Vec<_>>().await?;
//!     assert_eq!(all.len(), 2);
//!     Ok(())
//! }
//! ```

use futures_util::stream::BoxStream;

pub mod backoff;
pub mod config;
pub mod error;
pub mod impls;
pub mod key;
pub mod lock;
mod page;
pub mod region;
pub mod rpc;
pub mod scanner;
pub mod snapshot;


pub use crate::backoff::BackoffKind;
pub use crate::backoff::Backoffer;
pub use crate::config::ScannerConfig;
pub use crate::config::DEFAULT_PAGE_SIZE;
pub use crate::error::ScanError;
pub use crate::lock::Lock;
pub use crate::lock::LockExtractor;
pub use crate::region::KeyLocation;
pub use crate::region::RegionLocator;
pub use crate::rpc::ScanSender;
pub use crate::scanner::Scanner;
pub use crate::snapshot::PointGet;
pub use crate::snapshot::ReadOptions;
pub use crate::snapshot::SafePoint;
pub use crate::snapshot::Snapshot;
pub use crate::snapshot::Store;

/// A raw key. Keys are ordered bytewise.
pub type Key = Vec<u8>;

/// A raw value. An empty value stands for a deleted key.
pub type Value = Vec<u8>;

/// A read or commit version of the store.
pub type Version = u64;

/// A stream of the key-value pairs left in a [`Scanner`].
pub type KVResultStream<'a> = BoxStream<'a, Result<(Key, Value), ScanError>>;
