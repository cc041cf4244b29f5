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

//! One page of scanned entries and the cursor over it.

use crate::lock::Lock;
use crate::Key;
use crate::Value;

/// What is known about a scanned key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntryState {
    /// The value visible at the read version. Empty means deleted.
    Value(Value),
    /// Another transaction holds a lock; the value must be read again once resolved.
    Conflict(Lock),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    pub key: Key,
    pub state: EntryState,
}

impl Entry {
    pub fn new(key: Key, value: Value) -> Self {
        Self {
            key,
            state: EntryState::Value(value),
        }
    }

    pub fn conflict(key: Key, lock: Lock) -> Self {
        Self {
            key,
            state: EntryState::Conflict(lock),
        }
    }

    /// The resolved value, or `None` if the entry is still locked.
    pub fn value(&self) -> Option<&[u8]> {
        match &self.state {
            EntryState::Value(v) => Some(v),
            EntryState::Conflict(_) => None,
        }
    }

    pub fn resolve(&mut self, value: Value) {
        self.state = EntryState::Value(value);
    }
}

/// Entries of the latest page with a cursor.
///
/// `next` is the index of the entry the next [`Page::advance`] moves onto;
/// the current entry is at `next - 1`. `0 <= next <= entries.len()` always holds,
/// and `next == entries.len()` means the page is used up.
#[derive(Debug, Default)]
pub(crate) struct Page {
    entries: Vec<Entry>,
    next: usize,
}

impl Page {
    pub(crate) fn new(entries: Vec<Entry>) -> Self {
        Self { entries, next: 0 }
    }

    /// Moves onto the following entry. Returns `false` without moving if the page is used up.
    pub(crate) fn advance(&mut self) -> bool {
        if self.next < self.entries.len() {
            self.next += 1;
            true
        } else {
            false
        }
    }

    pub(crate) fn current(&self) -> Option<&Entry> {
        self.next.checked_sub(1).and_then(|i| self.entries.get(i))
    }

    pub(crate) fn current_mut(&mut self) -> Option<&mut Entry> {
        self.next.checked_sub(1).and_then(|i| self.entries.get_mut(i))
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    pub(crate) fn last_key(&self) -> Option<&[u8]> {
        self.entries.last().map(|e| e.key.as_slice())
    }
}
