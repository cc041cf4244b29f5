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

//! Cursor over all visible keys of a snapshot, paging through regions one RPC at a time.

use futures_util::StreamExt;
use log::debug;
use log::trace;
use log::warn;

use crate::backoff::BackoffKind;
use crate::backoff::Backoffer;
use crate::config::DEFAULT_PAGE_SIZE;
use crate::key::next_key;
use crate::key::DisplayKey;
use crate::page::Entry;
use crate::page::EntryState;
use crate::page::Page;
use crate::region::KeyLocation;
use crate::rpc::RawKvPair;
use crate::rpc::ScanRequest;
use crate::rpc::ScanResponse;
use crate::snapshot::Snapshot;
use crate::snapshot::Store;
use crate::Key;
use crate::KVResultStream;
use crate::ScanError;
use crate::Version;

/// Steps of fetching one page.
///
/// Only `Handle` can go back to `Locate`, and only after the backoffer allowed another try.
enum FetchState {
    Locate,
    Send(KeyLocation),
    Handle(KeyLocation, ScanResponse),
}

/// Iterates the keys of a [`Snapshot`] in ascending order, starting at a given key.
///
/// Keys are served from an in-memory page. When the page is used up, the next one is
/// fetched from the region owning the next key, so pages never span regions.
/// Locked keys are resolved with a point read at the snapshot version before they are
/// returned, and deleted keys are skipped.
///
/// ```rust,no_run
/// # use region_scan::impls::mem_store::MemStore;
/// # use region_scan::Snapshot;
/// # async fn f() -> Result<(), region_scan::ScanError> {
/// let snapshot = Snapshot::new(10, MemStore::new());
/// let mut scanner = snapshot.iter(b"a").await?;
/// while scanner.valid() {
///     println!("{:?} => {:?}", scanner.key(), scanner.value());
///     scanner.next().await?;
/// }
/// # Ok(())
/// # }
/// ```
///
/// A scanner is not synchronized; it is driven by one task through `&mut self`.
/// Any error closes it.
pub struct Scanner<'a, D>
where D: Store
{
    snapshot: &'a Snapshot<D>,
    page_size: usize,
    page: Page,
    /// Where the next page starts. Keys before it are already in `page` or consumed.
    next_start_key: Key,
    /// The last region has been read to its end.
    eof: bool,
    valid: bool,
    /// Number of page fetches, to correlate log messages of one scanner.
    fetches: u64,
}

impl<'a, D> Scanner<'a, D>
where D: Store + 'a
{
    /// Creates a scanner positioned at the first visible key `>= start_key`.
    ///
    /// `page_size <= 1` is replaced with [`DEFAULT_PAGE_SIZE`]: a page of a single entry
    /// can not tell whether the region has more data.
    ///
    /// If there is no such key the scanner is returned already invalid.
    pub async fn new(
        snapshot: &'a Snapshot<D>,
        start_key: &[u8],
        page_size: usize,
    ) -> Result<Self, ScanError> {
        let page_size = if page_size <= 1 {
            DEFAULT_PAGE_SIZE
        } else {
            page_size.min(u32::MAX as usize)
        };

        let mut scanner = Self {
            snapshot,
            page_size,
            page: Page::default(),
            next_start_key: start_key.to_vec(),
            eof: false,
            valid: true,
            fetches: 0,
        };

        match scanner.next().await {
            Ok(()) => Ok(scanner),
            Err(e) if e.is_not_found() => Ok(scanner),
            Err(e) => Err(e),
        }
    }

    /// Whether the scanner is positioned on a visible pair.
    pub fn valid(&self) -> bool {
        self.valid
    }

    /// The current key, or empty if the scanner is invalid.
    pub fn key(&self) -> &[u8] {
        if !self.valid {
            return &[];
        }
        self.page
            .current()
            .map(|e| e.key.as_slice())
            .unwrap_or_default()
    }

    /// The current value, or empty if the scanner is invalid.
    pub fn value(&self) -> &[u8] {
        if !self.valid {
            return &[];
        }
        self.page
            .current()
            .and_then(Entry::value)
            .unwrap_or_default()
    }

    /// The read version of every page, i.e., the snapshot version.
    pub fn version(&self) -> Version {
        self.snapshot.version()
    }

    /// Moves to the next visible key.
    ///
    /// Reaching the end is not an error: the scanner becomes invalid and `Ok(())` is returned.
    /// Each call gets its own backoff budget of `next_max_backoff_ms`, bounded by the
    /// snapshot deadline if one is set.
    pub async fn next(&mut self) -> Result<(), ScanError> {
        let mut bo = self.snapshot.backoffer(self.snapshot.config().next_max_backoff_ms);

        if !self.valid {
            return Err(ScanError::InvalidIterator);
        }

        let res = self.advance(&mut bo).await;
        if let Err(e) = &res {
            debug!(
                "scanner closed on error: read_version={} fetches={} error={}",
                self.version(),
                self.fetches,
                e
            );
            self.close();
        }
        res
    }

    /// Invalidates the scanner for good: further `next` calls fail.
    pub fn close(&mut self) {
        self.valid = false;
    }

    /// Converts the scanner into a stream of the remaining key-value pairs.
    ///
    /// The current pair is yielded first. An error ends the stream after being yielded.
    pub fn into_stream(self) -> KVResultStream<'a> {
        enum State<S> {
            Running(S),
            Failed(ScanError),
            Done,
        }

        futures::stream::unfold(State::Running(self), |state| async move {
            match state {
                State::Running(mut scanner) => {
                    if !scanner.valid() {
                        return None;
                    }
                    let kv = (scanner.key().to_vec(), scanner.value().to_vec());
                    match scanner.next().await {
                        Ok(()) => Some((Ok(kv), State::Running(scanner))),
                        Err(e) => Some((Ok(kv), State::Failed(e))),
                    }
                }
                State::Failed(e) => Some((Err(e), State::Done)),
                State::Done => None,
            }
        })
        .boxed()
    }

    async fn advance(&mut self, bo: &mut Backoffer) -> Result<(), ScanError> {
        loop {
            if !self.page.advance() {
                if self.eof {
                    debug!(
                        "scanner reached the end: read_version={} fetches={}",
                        self.version(),
                        self.fetches
                    );
                    self.close();
                    return Ok(());
                }

                // An empty page does not mean the end: the next region may have data.
                self.fetch_page(bo).await?;
                continue;
            }

            self.resolve_current_lock(bo).await?;

            let Some(entry) = self.page.current() else {
                continue;
            };

            if entry.value().map_or(true, <[u8]>::is_empty) {
                trace!("scanner skips deleted key {}", DisplayKey(&entry.key));
                continue;
            }

            return Ok(());
        }
    }

    async fn resolve_current_lock(&mut self, bo: &mut Backoffer) -> Result<(), ScanError> {
        let snapshot = self.snapshot;

        let Some(entry) = self.page.current_mut() else {
            return Ok(());
        };

        let EntryState::Conflict(lock) = &entry.state else {
            return Ok(());
        };

        // The scanned key decides the position; the lock only tells why it must be re-read.
        if lock.key != entry.key {
            warn!(
                "scanner met {} on a different key {}",
                lock,
                DisplayKey(&entry.key)
            );
        } else {
            debug!("scanner resolves {}", lock);
        }

        let value = snapshot.get_with_backoff(bo, &entry.key).await?;
        entry.resolve(value);
        Ok(())
    }

    async fn fetch_page(&mut self, bo: &mut Backoffer) -> Result<(), ScanError> {
        let snapshot = self.snapshot;
        let store = snapshot.data();

        self.fetches += 1;
        let mut state = FetchState::Locate;

        loop {
            state = match state {
                FetchState::Locate => {
                    let loc = store.locate_key(bo, &self.next_start_key).await?;
                    FetchState::Send(loc)
                }

                FetchState::Send(loc) => {
                    let req = self.scan_request();
                    debug!(
                        "scanner fetch #{}: read_version={} start_key={} limit={} {}",
                        self.fetches,
                        req.version,
                        DisplayKey(&req.start_key),
                        req.limit,
                        loc
                    );

                    let timeout = snapshot.config().read_timeout();
                    let resp = store.send_scan(bo, &loc.region, &req, timeout).await?;
                    FetchState::Handle(loc, resp)
                }

                FetchState::Handle(loc, resp) => {
                    if let Some(err) = resp.routing_error {
                        debug!(
                            "scanner fetch #{}: {} rejected the request: {}",
                            self.fetches, loc, err
                        );
                        bo.backoff(BackoffKind::RegionMiss, err.to_string()).await?;
                        FetchState::Locate
                    } else {
                        let body = resp.body.ok_or(ScanError::BodyMissing)?;

                        store.check_visibility(snapshot.version())?;

                        let entries = body
                            .pairs
                            .into_iter()
                            .map(|pair| Self::entry_of(store, pair))
                            .collect::<Result<Vec<_>, _>>()?;

                        self.install_page(&loc, entries);
                        return Ok(());
                    }
                }
            };
        }
    }

    fn scan_request(&self) -> ScanRequest {
        ScanRequest {
            start_key: self.next_start_key.clone(),
            limit: self.page_size as u32,
            version: self.snapshot.version(),
            context: *self.snapshot.options(),
        }
    }

    fn entry_of(store: &D, pair: RawKvPair) -> Result<Entry, ScanError> {
        match pair.error {
            None => Ok(Entry::new(pair.key, pair.value)),
            Some(err) => {
                let lock = store.extract_lock(&err)?;
                Ok(Entry::conflict(pair.key, lock))
            }
        }
    }

    fn install_page(&mut self, loc: &KeyLocation, entries: Vec<Entry>) {
        self.page = Page::new(entries);
        let n = self.page.len();

        if n < self.page_size {
            // The region has nothing more; continue from the next one.
            self.next_start_key = loc.end_key.clone();
            if loc.is_last() {
                self.eof = true;
            }
        } else if let Some(last) = self.page.last_key() {
            // The next page may come back empty if `last` was the region's last key.
            self.next_start_key = next_key(last);
        }

        debug!(
            "scanner fetch #{}: got {} entries, next_start_key={} eof={}",
            self.fetches,
            n,
            DisplayKey(&self.next_start_key),
            self.eof
        );
    }
}
