//! A count-down latch synchronizing failover (and the RC connect
//! handshake) with threads blocked in ordinary operations.

use parking_lot::{Condvar, Mutex};
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LatchOutcome {
    /// The latch was reset while waiting.
    Reset,
    /// The wait timed out.
    TimedOut,
    /// The count reached zero and all parties acknowledged.
    Done,
}

struct LatchState {
    /// Negative while the latch is being reset.
    count: i32,
    waiters: i32,
}

/// Count-down latch with two-phase handshake: waiters block until the
/// count reaches zero, and the counter-downer in turn waits until every
/// waiter has observed the release.
pub struct CountDownLatch {
    state: Mutex<LatchState>,
    count_cond: Condvar,
    notify_cond: Condvar,
}

impl CountDownLatch {
    pub fn new(count: i32) -> CountDownLatch {
        CountDownLatch {
            state: Mutex::new(LatchState { count, waiters: 0 }),
            count_cond: Condvar::new(),
            notify_cond: Condvar::new(),
        }
    }

    /// Waits for the count to reach zero. `None` waits forever.
    pub fn wait(&self, timeout: Option<Duration>) -> LatchOutcome {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut state = self.state.lock();
        if state.count < 0 {
            return LatchOutcome::Reset;
        }
        if state.count == 0 {
            return LatchOutcome::Done;
        }

        state.waiters += 1;
        while state.count > 0 {
            let timed_out = match deadline {
                Some(d) => self.count_cond.wait_until(&mut state, d).timed_out(),
                None => {
                    self.count_cond.wait(&mut state);
                    false
                }
            };
            if timed_out {
                state.waiters -= 1;
                return LatchOutcome::TimedOut;
            }
        }
        if state.count < 0 {
            state.waiters -= 1;
            return LatchOutcome::Reset;
        }

        state.waiters -= 1;
        self.notify_cond.notify_all();
        LatchOutcome::Done
    }

    /// Reduces the count by one; once zero, wakes the waiters and waits
    /// (up to `timeout`) for them all to acknowledge.
    pub fn count_down(&self, timeout: Option<Duration>) -> LatchOutcome {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut state = self.state.lock();
        if state.count < 0 {
            return LatchOutcome::Reset;
        }
        if state.count == 0 {
            return LatchOutcome::Done;
        }

        state.count -= 1;
        if state.count == 0 {
            self.count_cond.notify_all();
        }

        while state.waiters > 0 {
            let timed_out = match deadline {
                Some(d) => self.notify_cond.wait_until(&mut state, d).timed_out(),
                None => {
                    self.notify_cond.wait(&mut state);
                    false
                }
            };
            if timed_out {
                return LatchOutcome::TimedOut;
            }
            if state.count < 0 {
                return LatchOutcome::Reset;
            }
        }
        LatchOutcome::Done
    }

    /// Disables the latch, wakes every party, optionally pauses so they
    /// can observe the reset, then re-arms with `count`.
    pub fn reset(&self, count: i32, pause: Option<Duration>) {
        {
            let mut state = self.state.lock();
            state.count = -1;
            self.count_cond.notify_all();
            self.notify_cond.notify_all();
        }
        if let Some(p) = pause {
            std::thread::sleep(p);
        }
        self.state.lock().count = count;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn waiter_is_released_by_count_down() {
        let latch = Arc::new(CountDownLatch::new(1));
        let waiter = {
            let latch = latch.clone();
            thread::spawn(move || latch.wait(Some(Duration::from_secs(5))))
        };
        thread::sleep(Duration::from_millis(50));
        assert_eq!(
            latch.count_down(Some(Duration::from_secs(5))),
            LatchOutcome::Done
        );
        assert_eq!(waiter.join().unwrap(), LatchOutcome::Done);
    }

    #[test]
    fn wait_times_out_when_nobody_counts() {
        let latch = CountDownLatch::new(1);
        assert_eq!(
            latch.wait(Some(Duration::from_millis(20))),
            LatchOutcome::TimedOut
        );
    }

    #[test]
    fn zero_count_is_an_immediate_pass() {
        let latch = CountDownLatch::new(0);
        assert_eq!(latch.wait(Some(Duration::from_millis(5))), LatchOutcome::Done);
        assert_eq!(latch.count_down(None), LatchOutcome::Done);
    }
}
