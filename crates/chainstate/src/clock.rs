use std::sync::atomic::{AtomicI64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// Wall clock with an optional mock time and the peer-reported offset used
/// for adjusted time.
#[derive(Debug, Default)]
pub struct Clock {
    mock_time: AtomicI64,
    offset: AtomicI64,
}

impl Clock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seconds since the epoch, or the mock time when one is set.
    pub fn now(&self) -> i64 {
        let mock = self.mock_time.load(Ordering::Relaxed);
        if mock != 0 {
            return mock;
        }
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|elapsed| elapsed.as_secs() as i64)
            .unwrap_or(0)
    }

    pub fn now_micros(&self) -> i64 {
        let mock = self.mock_time.load(Ordering::Relaxed);
        if mock != 0 {
            return mock.saturating_mul(1_000_000);
        }
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|elapsed| elapsed.as_micros() as i64)
            .unwrap_or(0)
    }

    pub fn adjusted_time(&self) -> i64 {
        self.now() + self.offset.load(Ordering::Relaxed)
    }

    /// `0` returns to the system clock.
    pub fn set_mock_time(&self, time: i64) {
        self.mock_time.store(time, Ordering::Relaxed);
    }

    pub fn time_offset(&self) -> i64 {
        self.offset.load(Ordering::Relaxed)
    }

    pub fn set_time_offset(&self, offset: i64) {
        self.offset.store(offset, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mock_time_and_offset() {
        let clock = Clock::new();
        clock.set_mock_time(1_000);
        clock.set_time_offset(-30);
        assert_eq!(clock.now(), 1_000);
        assert_eq!(clock.now_micros(), 1_000_000_000);
        assert_eq!(clock.adjusted_time(), 970);
        clock.set_mock_time(0);
        assert!(clock.now() > 1_000);
    }
}
