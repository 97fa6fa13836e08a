use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;

/// Global pause requested by the accrual authority.
///
/// A throttled poll defers every further poll until `next_allowed_poll`.
/// Several deferrals in one tick keep the latest deadline.
#[derive(Debug, Default)]
pub struct Backoff {
    next_allowed_poll: Mutex<Option<Instant>>,
}

impl Backoff {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn defer(&self, secs: u64) {
        let until = Instant::now() + Duration::from_secs(secs);
        let mut next = self.next_allowed_poll.lock();
        if next.map_or(true, |current| until > current) {
            *next = Some(until);
        }
    }

    /// Time left before polling may resume; `None` when it may resume now.
    pub fn remaining(&self) -> Option<Duration> {
        let mut next = self.next_allowed_poll.lock();
        match *next {
            Some(until) if until > Instant::now() => Some(until - Instant::now()),
            Some(_) => {
                *next = None;
                None
            }
            None => None,
        }
    }

    pub fn is_ready(&self) -> bool {
        self.remaining().is_none()
    }
}
