//! Pending-request tables for sendAndGet and subscribeAndGet.
//!
//! Each table is a fixed-size array of slots. A slot is claimed on call,
//! its id travels to the server, and the caller parks on the slot's
//! condvar until a matching reply arrives, the server dies, or the
//! deadline passes. Unclaimed slots mean the table is full.

use crate::error::{CmsgError, CmsgResult};
use crate::subscription::compile_pattern;
use cmsg_proto::Message;
use parking_lot::{Condvar, Mutex};
use regex::Regex;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Maximum simultaneous subscribeAndGets per connection.
pub const MAX_SUBSCRIBE_AND_GET: usize = 20;
/// Maximum simultaneous sendAndGets per connection.
pub const MAX_SEND_AND_GET: usize = 20;

/// What ended a pending wait.
pub(crate) enum WaitOutcome {
    Reply(Message),
    Failed(CmsgError),
    TimedOut,
}

struct SlotState {
    msg: Option<Message>,
    error: Option<CmsgError>,
    woken: bool,
}

/// One claimed pending request.
pub(crate) struct PendingEntry {
    pub id: i32,
    /// Compiled patterns; present only for subscribeAndGet slots, which
    /// match deliveries by subject/type rather than token.
    patterns: Option<(Regex, Regex)>,
    state: Mutex<SlotState>,
    cond: Condvar,
}

impl PendingEntry {
    /// Parks until woken or the deadline passes. `None` waits forever.
    pub fn wait(&self, timeout: Option<Duration>) -> WaitOutcome {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut state = self.state.lock();
        while !state.woken {
            match deadline {
                Some(d) => {
                    if self.cond.wait_until(&mut state, d).timed_out() {
                        break;
                    }
                }
                None => self.cond.wait(&mut state),
            }
        }
        if !state.woken {
            return WaitOutcome::TimedOut;
        }
        if let Some(err) = state.error.take() {
            return WaitOutcome::Failed(err);
        }
        match state.msg.take() {
            Some(msg) => WaitOutcome::Reply(msg),
            None => WaitOutcome::Failed(CmsgError::ServerDied),
        }
    }

    fn wake_with(&self, msg: Option<Message>, error: Option<CmsgError>) {
        let mut state = self.state.lock();
        state.msg = msg;
        state.error = error;
        state.woken = true;
        self.cond.notify_all();
    }
}

/// Fixed-capacity table of pending request slots.
pub(crate) struct PendingTable {
    slots: Mutex<Vec<Arc<PendingEntry>>>,
    capacity: usize,
}

impl PendingTable {
    pub fn new(capacity: usize) -> PendingTable {
        PendingTable {
            slots: Mutex::new(Vec::new()),
            capacity,
        }
    }

    /// Claims a slot. `with_patterns` selects subject/type matching
    /// (subscribeAndGet) over token matching (sendAndGet).
    pub fn claim(
        &self,
        id: i32,
        subject: &str,
        msg_type: &str,
        with_patterns: bool,
    ) -> CmsgResult<Arc<PendingEntry>> {
        let mut slots = self.slots.lock();
        if slots.len() >= self.capacity {
            return Err(CmsgError::OutOfMemory);
        }
        let entry = Arc::new(PendingEntry {
            id,
            patterns: with_patterns
                .then(|| (compile_pattern(subject), compile_pattern(msg_type))),
            state: Mutex::new(SlotState {
                msg: None,
                error: None,
                woken: false,
            }),
            cond: Condvar::new(),
        });
        slots.push(entry.clone());
        Ok(entry)
    }

    /// Releases a slot once its caller returns.
    pub fn release(&self, id: i32) {
        self.slots.lock().retain(|e| e.id != id);
    }

    /// Wakes the sendAndGet whose id matches the reply's sender token.
    /// Returns false when nobody is waiting (the message is discarded).
    pub fn wake_token(&self, msg: Message) -> bool {
        let entry = {
            let slots = self.slots.lock();
            slots.iter().find(|e| e.id == msg.sender_token).cloned()
        };
        match entry {
            Some(e) => {
                e.wake_with(Some(msg), None);
                true
            }
            None => false,
        }
    }

    /// Hands an independent copy of a delivery to every subscribeAndGet
    /// whose patterns match.
    pub fn wake_matching(&self, msg: &Message) {
        let matching: Vec<Arc<PendingEntry>> = {
            let slots = self.slots.lock();
            slots
                .iter()
                .filter(|e| {
                    e.patterns.as_ref().is_some_and(|(subj, typ)| {
                        subj.is_match(&msg.subject) && typ.is_match(&msg.msg_type)
                    })
                })
                .cloned()
                .collect()
        };
        for entry in matching {
            entry.wake_with(Some(msg.clone()), None);
        }
    }

    /// Wakes every pending caller with an error (server death, shutdown).
    pub fn wake_all(&self, error: CmsgError) {
        for entry in self.slots.lock().iter() {
            entry.wake_with(None, Some(error.clone()));
        }
    }

    pub fn len(&self) -> usize {
        self.slots.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn token_wakeup_delivers_the_reply() {
        let table = PendingTable::new(MAX_SEND_AND_GET);
        let entry = table.claim(42, "s", "t", false).unwrap();

        let waiter = thread::spawn(move || entry.wait(Some(Duration::from_secs(5))));
        thread::sleep(Duration::from_millis(20));

        let mut reply = Message::new("s", "t");
        reply.sender_token = 42;
        assert!(table.wake_token(reply));

        match waiter.join().unwrap() {
            WaitOutcome::Reply(m) => assert_eq!(m.sender_token, 42),
            _ => panic!("expected a reply"),
        }
    }

    #[test]
    fn unmatched_token_is_discarded() {
        let table = PendingTable::new(MAX_SEND_AND_GET);
        let _entry = table.claim(1, "s", "t", false).unwrap();
        let mut reply = Message::new("s", "t");
        reply.sender_token = 2;
        assert!(!table.wake_token(reply));
    }

    #[test]
    fn matching_wakes_every_interested_slot_with_copies() {
        let table = PendingTable::new(MAX_SUBSCRIBE_AND_GET);
        let a = table.claim(1, "news.*", "t", true).unwrap();
        let b = table.claim(2, "news.sports", "t", true).unwrap();
        let c = table.claim(3, "other", "t", true).unwrap();

        let msg = Message::new("news.sports", "t").with_text("scores");
        table.wake_matching(&msg);

        for entry in [a, b] {
            match entry.wait(Some(Duration::from_millis(100))) {
                WaitOutcome::Reply(m) => assert_eq!(m.text.as_deref(), Some("scores")),
                _ => panic!("expected a reply"),
            }
        }
        assert!(matches!(
            c.wait(Some(Duration::from_millis(50))),
            WaitOutcome::TimedOut
        ));
    }

    #[test]
    fn full_table_reports_out_of_memory() {
        let table = PendingTable::new(2);
        let _a = table.claim(1, "s", "t", false).unwrap();
        let _b = table.claim(2, "s", "t", false).unwrap();
        assert!(matches!(
            table.claim(3, "s", "t", false),
            Err(CmsgError::OutOfMemory)
        ));
        table.release(1);
        assert!(table.claim(4, "s", "t", false).is_ok());
    }
}
