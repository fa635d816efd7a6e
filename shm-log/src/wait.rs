//! Bounded polling, the only way participants of different processes wait on each other.
use std::time::{Duration, Instant};

use crate::config::BackoffPolicy;

pub(crate) struct Waiter {
    policy: BackoffPolicy,
    started: Instant,
    timeout: Duration,
    round: u32,
    sleep: Duration,
}

impl Waiter {
    pub(crate) fn new(policy: BackoffPolicy, timeout: Duration) -> Self {
        Waiter {
            policy,
            started: Instant::now(),
            timeout,
            round: 0,
            sleep: policy.initial_sleep,
        }
    }

    /// Back off once before the caller polls again.
    ///
    /// Returns the time waited so far as an error once the deadline has passed.
    pub(crate) fn snooze(&mut self) -> Result<(), Duration> {
        let waited = self.started.elapsed();
        if waited >= self.timeout {
            return Err(waited);
        }

        let round = self.round;
        self.round = self.round.saturating_add(1);

        if round < self.policy.spin_rounds {
            for _ in 0..(1u32 << round.min(10)) {
                core::hint::spin_loop();
            }
        } else if round < self.policy.spin_rounds + self.policy.yield_rounds {
            std::thread::yield_now();
        } else {
            let remaining = self.timeout - waited;
            std::thread::sleep(self.sleep.min(remaining));
            self.sleep = (self.sleep * 2).min(self.policy.max_sleep);
        }

        Ok(())
    }
}
