//! Injectable time source
//!
//! Components never read the wall clock directly; they hold an `Arc<dyn Clock>`
//! handed to them at construction. Tests use `MockClock` to pin time.

use chrono::{DateTime, Local, NaiveDate, TimeZone, Utc};
use parking_lot::Mutex;
use std::time::Duration;

pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;

    /// Current time as unix seconds
    fn unix(&self) -> i64 {
        self.now().timestamp()
    }

    /// Calendar day of the current time in the device's local timezone
    fn local_date(&self) -> NaiveDate {
        self.now().with_timezone(&Local).date_naive()
    }
}

/// Wall clock
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Settable clock for tests and simulations
#[derive(Debug)]
pub struct MockClock {
    now: Mutex<DateTime<Utc>>,
}

impl MockClock {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self { now: Mutex::new(now) }
    }

    /// Mock pinned to a unix timestamp (seconds)
    pub fn at_unix(secs: i64) -> Self {
        Self::new(Utc.timestamp_opt(secs, 0).single().unwrap_or_default())
    }

    pub fn set(&self, now: DateTime<Utc>) {
        *self.now.lock() = now;
    }

    /// Step forward; a step past the representable range leaves the clock put
    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock();
        if let Some(next) =
            chrono::Duration::from_std(by).ok().and_then(|delta| now.checked_add_signed(delta))
        {
            *now = next;
        }
    }
}

impl Clock for MockClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock()
    }
}

/// Local calendar day of a unix timestamp
pub fn local_date_of(unix_secs: i64) -> NaiveDate {
    Utc.timestamp_opt(unix_secs, 0)
        .single()
        .unwrap_or_default()
        .with_timezone(&Local)
        .date_naive()
}
