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

//! Budgeted exponential backoff shared by the retry loops of one operation.

use std::collections::HashMap;
use std::fmt;
use std::time::Duration;
use std::time::Instant;

use log::debug;
use log::warn;
use rand::Rng;

use crate::ScanError;

/// How a sleep is randomized around its exponential value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Jitter {
    /// Sleep exactly the exponential value.
    None,
    /// Sleep `v/2` plus a uniform random amount in `[0, v/2)`.
    Equal,
}

/// The category of a failure being backed off.
///
/// Each category keeps its own attempt counter within a [`Backoffer`],
/// while all of them draw from the same sleep budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BackoffKind {
    /// Waiting for the transaction holding a lock to finish.
    TxnLock,
    /// The region routing was stale and must be looked up again.
    RegionMiss,
}

impl BackoffKind {
    /// Returns `(base_ms, cap_ms, jitter)`.
    pub fn params(&self) -> (u64, u64, Jitter) {
        match self {
            BackoffKind::TxnLock => (200, 3_000, Jitter::Equal),
            BackoffKind::RegionMiss => (2, 500, Jitter::None),
        }
    }
}

impl fmt::Display for BackoffKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            BackoffKind::TxnLock => "txnLock",
            BackoffKind::RegionMiss => "regionMiss",
        };
        write!(f, "{}", s)
    }
}

/// `min(cap, base * 2^n)`
fn expo(base: u64, cap: u64, n: u32) -> u64 {
    let factor = 1u64.checked_shl(n).unwrap_or(u64::MAX);
    base.saturating_mul(factor).min(cap)
}

#[derive(Debug)]
struct BackoffFn {
    base: u64,
    cap: u64,
    jitter: Jitter,
    attempts: u32,
}

impl BackoffFn {
    fn new(kind: BackoffKind) -> Self {
        let (base, cap, jitter) = kind.params();
        Self {
            base,
            cap,
            jitter,
            attempts: 0,
        }
    }

    fn next_sleep_ms(&mut self) -> u64 {
        let v = expo(self.base, self.cap, self.attempts);
        let sleep = match self.jitter {
            Jitter::None => v,
            Jitter::Equal => {
                let half = v / 2;
                if half == 0 {
                    v
                } else {
                    half + rand::thread_rng().gen_range(0..half)
                }
            }
        };
        self.attempts = self.attempts.saturating_add(1);
        sleep
    }
}

/// Sleeps between retries and gives up once the total sleep reaches `max_sleep_ms`.
///
/// A `Backoffer` is meant to live for one logical operation, e.g., one
/// [`Scanner::next`](crate::Scanner::next) call. `max_sleep_ms == 0` means no budget.
#[derive(Debug)]
pub struct Backoffer {
    max_sleep_ms: u64,
    total_sleep_ms: u64,
    deadline: Option<Instant>,
    fns: HashMap<BackoffKind, BackoffFn>,
    errors: Vec<String>,
}

impl Backoffer {
    pub fn new(max_sleep_ms: u64) -> Self {
        Self {
            max_sleep_ms,
            total_sleep_ms: 0,
            deadline: None,
            fns: HashMap::new(),
            errors: Vec::new(),
        }
    }

    /// Stop backing off once `deadline` is reached, regardless of the remaining budget.
    pub fn with_deadline(mut self, deadline: Option<Instant>) -> Self {
        self.deadline = deadline;
        self
    }

    pub fn total_sleep_ms(&self) -> u64 {
        self.total_sleep_ms
    }

    /// Causes of every backoff so far, oldest first.
    pub fn errors(&self) -> &[String] {
        &self.errors
    }

    /// Sleeps for the next delay of `kind`.
    ///
    /// The sleep happens first; the budget is checked after it, so the call that
    /// crosses the budget still sleeps before failing.
    pub async fn backoff(&mut self, kind: BackoffKind, cause: String) -> Result<(), ScanError> {
        if let Some(deadline) = self.deadline {
            if Instant::now() >= deadline {
                return Err(ScanError::DeadlineExceeded { cause });
            }
        }

        let f = self.fns.entry(kind).or_insert_with(|| BackoffFn::new(kind));
        let mut sleep_ms = f.next_sleep_ms();

        if let Some(deadline) = self.deadline {
            let remaining = deadline.saturating_duration_since(Instant::now());
            sleep_ms = sleep_ms.min(remaining.as_millis() as u64);
        }

        debug!(
            "backoff: kind={} sleep={}ms total={}ms cause={}",
            kind, sleep_ms, self.total_sleep_ms, cause
        );

        tokio::time::sleep(Duration::from_millis(sleep_ms)).await;

        self.total_sleep_ms += sleep_ms;
        self.errors.push(format!("{}: {}", kind, cause));

        if self.max_sleep_ms > 0 && self.total_sleep_ms >= self.max_sleep_ms {
            warn!(
                "backoff: max sleep {}ms exceeded after {} attempts",
                self.max_sleep_ms,
                self.errors.len()
            );
            return Err(ScanError::RetryBudgetExhausted {
                max_sleep_ms: self.max_sleep_ms,
                errors: self.errors.clone(),
            });
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn test_expo() {
        assert_eq!(expo(2, 500, 0), 2);
        assert_eq!(expo(2, 500, 3), 16);
        assert_eq!(expo(2, 500, 8), 500);
        assert_eq!(expo(2, 500, 200), 500);
    }

    #[test]
    fn test_region_miss_sleeps_are_deterministic() {
        let mut f = BackoffFn::new(BackoffKind::RegionMiss);
        let got = (0..10).map(|_| f.next_sleep_ms()).collect::<Vec<_>>();
        assert_eq!(got, vec![2, 4, 8, 16, 32, 64, 128, 256, 500, 500]);
    }

    #[test]
    fn test_equal_jitter_range() {
        let mut f = BackoffFn::new(BackoffKind::TxnLock);
        let first = f.next_sleep_ms();
        assert!((100..200).contains(&first), "got {}", first);
        let second = f.next_sleep_ms();
        assert!((200..400).contains(&second), "got {}", second);
    }

    #[tokio::test]
    async fn test_budget_exhausted_after_sleep() {
        let mut bo = Backoffer::new(10);

        bo.backoff(BackoffKind::RegionMiss, "e1".to_string())
            .await
            .unwrap();
        assert_eq!(bo.total_sleep_ms(), 2);

        bo.backoff(BackoffKind::RegionMiss, "e2".to_string())
            .await
            .unwrap();
        assert_eq!(bo.total_sleep_ms(), 6);

        let err = bo
            .backoff(BackoffKind::RegionMiss, "e3".to_string())
            .await
            .unwrap_err();
        assert_eq!(bo.total_sleep_ms(), 14);

        match err {
            ScanError::RetryBudgetExhausted {
                max_sleep_ms,
                errors,
            } => {
                assert_eq!(max_sleep_ms, 10);
                assert_eq!(errors, vec![
                    "regionMiss: e1",
                    "regionMiss: e2",
                    "regionMiss: e3"
                ]);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_zero_budget_is_unbounded() {
        let mut bo = Backoffer::new(0);
        for i in 0..5 {
            bo.backoff(BackoffKind::RegionMiss, format!("e{i}"))
                .await
                .unwrap();
        }
        assert_eq!(bo.total_sleep_ms(), 2 + 4 + 8 + 16 + 32);
        assert_eq!(bo.errors().len(), 5);
    }

    #[tokio::test]
    async fn test_kinds_have_separate_attempts() {
        let mut bo = Backoffer::new(0);
        bo.backoff(BackoffKind::RegionMiss, "a".to_string())
            .await
            .unwrap();
        bo.backoff(BackoffKind::RegionMiss, "b".to_string())
            .await
            .unwrap();
        assert_eq!(bo.total_sleep_ms(), 6);

        // A fresh kind starts over at its own base.
        bo.backoff(BackoffKind::TxnLock, "c".to_string())
            .await
            .unwrap();
        let txn_lock_sleep = bo.total_sleep_ms() - 6;
        assert!((100..200).contains(&txn_lock_sleep));
    }

    #[tokio::test]
    async fn test_deadline() {
        let mut bo = Backoffer::new(0).with_deadline(Some(Instant::now()));
        let err = bo
            .backoff(BackoffKind::RegionMiss, "late".to_string())
            .await
            .unwrap_err();
        assert!(matches!(err, ScanError::DeadlineExceeded { ref cause } if cause == "late"));
        assert_eq!(bo.total_sleep_ms(), 0);
    }
}
