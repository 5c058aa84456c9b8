// Copyright 2020 Graydon Hoare <graydon@pobox.com>
// Licensed under the MIT and Apache-2.0 licenses.

use crate::TxId;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Trait to support multiple sorts of clock-source.
pub trait Clock: Send + Sync {
    fn current_time(&self) -> SystemTime;
}

/// An implementation of [Clock] that calls [std::time::SystemTime::now].
pub struct RealClock;
impl Clock for RealClock {
    fn current_time(&self) -> SystemTime {
        std::time::SystemTime::now()
    }
}

/// An implementation of [Clock] that holds a shared [AtomicU64] representing
/// the current millisecond count since the epoch, incrementing on each call
/// to `Clock::current_time`. Log entries stamped through it come out strictly
/// ordered, which keeps verifier tests deterministic.
pub struct TestClock(Arc<AtomicU64>);
impl TestClock {
    pub fn new() -> Self {
        TestClock(Arc::new(AtomicU64::from(0)))
    }
}
impl Clock for TestClock {
    fn current_time(&self) -> SystemTime {
        SystemTime::UNIX_EPOCH + Duration::from_millis(self.0.fetch_add(1, Ordering::SeqCst))
    }
}

/// Milliseconds since the unix epoch according to `clock`, saturating at zero
/// if the clock reads before the epoch. This is the timestamp format carried
/// by every log entry.
pub fn epoch_millis(clock: &dyn Clock) -> u64 {
    match clock.current_time().duration_since(UNIX_EPOCH) {
        Ok(dur) => dur.as_millis() as u64,
        Err(_) => 0,
    }
}

/// TidMgr issues the transaction IDs ([TxId]s) coordinated by a run. IDs are
/// unique and strictly increasing regardless of what the wall clock does; the
/// clock is consulted only for log-entry timestamps.
pub struct TidMgr {
    clock: Box<dyn Clock>,
    next: u64,
}

impl TidMgr {
    pub fn new(clock: Box<dyn Clock>) -> Self {
        TidMgr { clock, next: 1 }
    }

    /// Issue the next transaction ID.
    pub fn issue(&mut self) -> TxId {
        let tid = TxId(self.next);
        self.next += 1;
        tid
    }

    /// Timestamp for a log entry being appended right now.
    pub fn stamp(&self) -> u64 {
        epoch_millis(&*self.clock)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_unique_and_increasing() {
        let mut mgr = TidMgr::new(Box::new(TestClock::new()));
        let a = mgr.issue();
        let b = mgr.issue();
        let c = mgr.issue();
        assert!(a < b && b < c);
        assert_eq!(a, TxId(1));
    }

    #[test]
    fn test_clock_advances_per_read() {
        let clock = TestClock::new();
        let a = epoch_millis(&clock);
        let b = epoch_millis(&clock);
        assert!(b > a);
    }
}
