//! Subscription table, per-callback bounded queues, and the worker pool
//! that drains them.
//!
//! Each connection owns one table of up to [`MAX_SUBSCRIPTIONS`] entries
//! keyed by (subject pattern, type pattern); each entry holds up to
//! [`MAX_CALLBACKS`] callback records. A callback record owns a bounded
//! FIFO of pending messages and a primary worker thread; supplemental
//! workers come and go with the backlog. Producers into a full queue
//! either drop the oldest messages (skip policy) or block on the table's
//! room condvar until a consumer frees a slot.

use crate::error::{CmsgError, CmsgResult};
use crate::registry;
use cmsg_proto::{Message, SubscriptionContext};
use parking_lot::{Condvar, Mutex};
use regex::Regex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

/// Maximum subscriptions per client connection.
pub const MAX_SUBSCRIPTIONS: usize = 40;
/// Maximum callbacks per subscription.
pub const MAX_CALLBACKS: usize = 20;

/// How long a producer waits per round when a no-skip queue is full.
const FULL_QUEUE_RECHECK: Duration = Duration::from_secs(3);
/// Supplemental worker poll interval while idle.
const SUPPLEMENTAL_POLL: Duration = Duration::from_millis(200);
/// Consecutive empty polls before a supplemental worker retires.
const SUPPLEMENTAL_EMPTY_LIMIT: u32 = 10;

/// A subscription callback. Implemented for plain closures; hand the same
/// `Arc` to subscribe twice and the duplicate is refused.
pub trait SubscriptionCallback: Send + Sync + 'static {
    fn on_message(&self, msg: Message);
}

impl<F> SubscriptionCallback for F
where
    F: Fn(Message) + Send + Sync + 'static,
{
    fn on_message(&self, msg: Message) {
        self(msg)
    }
}

/// Behavior knobs for one callback's queue and worker pool.
#[derive(Debug, Clone)]
pub struct SubscribeConfig {
    /// Drop the oldest messages instead of blocking the producer.
    pub may_skip: bool,
    /// Exactly one concurrent invocation of the callback.
    pub must_serialize: bool,
    /// Queue depth bound.
    pub max_queue: usize,
    /// Messages dropped per skip when the queue is full.
    pub skip_size: usize,
    /// Supplemental worker cap when serialization is off.
    pub max_threads: usize,
    /// Backlog per worker before more workers are spawned.
    pub msgs_per_thread: usize,
    /// Worker stack size in bytes; 0 leaves the platform default.
    pub stack_size: usize,
}

impl Default for SubscribeConfig {
    fn default() -> Self {
        SubscribeConfig {
            may_skip: false,
            must_serialize: true,
            max_queue: 10_000,
            skip_size: 2_000,
            max_threads: 100,
            msgs_per_thread: 150,
            stack_size: 0,
        }
    }
}

/// Escapes a subject/type pattern into an anchored regular expression,
/// honoring the `*` (any run) and `?` (any one) wildcards.
pub(crate) fn compile_pattern(pattern: &str) -> Regex {
    let mut escaped = String::with_capacity(pattern.len() + 8);
    escaped.push('^');
    for c in pattern.chars() {
        match c {
            '*' => escaped.push_str(".*"),
            '?' => escaped.push('.'),
            c if "\\.+()[]{}|^$#&-~".contains(c) => {
                escaped.push('\\');
                escaped.push(c);
            }
            c => escaped.push(c),
        }
    }
    escaped.push('$');
    Regex::new(&escaped).expect("escaped subscription pattern")
}

/// Identifies one callback registration for unsubscribing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionHandle {
    pub(crate) entry_index: usize,
    pub(crate) cb_id: u64,
}

/// Context every worker stamps onto messages before invoking the
/// callback.
#[derive(Clone)]
pub(crate) struct WorkerContext {
    pub domain: &'static str,
    pub subject: String,
    pub msg_type: String,
    pub locator: String,
}

static NEXT_CB_ID: AtomicU64 = AtomicU64::new(1);

/// One registered callback with its queue and worker bookkeeping.
pub(crate) struct CallbackRecord {
    id: u64,
    callback: Arc<dyn SubscriptionCallback>,
    config: SubscribeConfig,
    active: AtomicBool,
    quit: AtomicBool,
    queue: Mutex<VecDeque<Message>>,
    cond: Condvar,
    queued: Arc<AtomicUsize>,
    delivered: AtomicU64,
    /// Supplemental workers currently alive.
    workers: AtomicUsize,
}

impl CallbackRecord {
    fn new(callback: Arc<dyn SubscriptionCallback>, config: SubscribeConfig) -> Arc<CallbackRecord> {
        Arc::new(CallbackRecord {
            id: NEXT_CB_ID.fetch_add(1, Ordering::Relaxed),
            callback,
            config,
            active: AtomicBool::new(true),
            quit: AtomicBool::new(false),
            queue: Mutex::new(VecDeque::new()),
            cond: Condvar::new(),
            queued: Arc::new(AtomicUsize::new(0)),
            delivered: AtomicU64::new(0),
            workers: AtomicUsize::new(0),
        })
    }

    pub(crate) fn delivered(&self) -> u64 {
        self.delivered.load(Ordering::Relaxed)
    }

    pub(crate) fn queued_len(&self) -> usize {
        self.queued.load(Ordering::Relaxed)
    }

    fn stop(&self) {
        self.quit.store(true, Ordering::SeqCst);
        self.active.store(false, Ordering::SeqCst);
        self.cond.notify_all();
    }
}

/// One (subject, type) entry and its callbacks.
pub(crate) struct SubscriptionEntry {
    pub id: i32,
    pub subject: String,
    pub msg_type: String,
    subject_re: Regex,
    type_re: Regex,
    pub callbacks: Vec<Arc<CallbackRecord>>,
}

/// Whether a subscribe added to an existing entry or claimed a new one
/// that the server must now be told about.
pub(crate) enum SubscribeOutcome {
    Existing(SubscriptionHandle),
    New(SubscriptionHandle, i32),
}

/// The per-connection subscription table.
pub(crate) struct SubscriptionTable {
    entries: Mutex<Vec<Option<SubscriptionEntry>>>,
    /// Producers blocked on a full no-skip queue wait here; consumers
    /// signal after every dequeue.
    room: Condvar,
}

impl SubscriptionTable {
    pub fn new() -> Arc<SubscriptionTable> {
        Arc::new(SubscriptionTable {
            entries: Mutex::new(Vec::new()),
            room: Condvar::new(),
        })
    }

    pub fn notify_room(&self) {
        self.room.notify_all();
    }

    /// Registers a callback, spawning its primary worker. Refuses exact
    /// duplicates of (subject, type, callback instance).
    pub fn add(
        self: &Arc<Self>,
        subject: &str,
        msg_type: &str,
        callback: Arc<dyn SubscriptionCallback>,
        config: SubscribeConfig,
        domain: &'static str,
        locator: &str,
    ) -> CmsgResult<SubscribeOutcome> {
        let mut entries = self.entries.lock();

        // Existing entry for this subject/type pair?
        if let Some(index) = entries.iter().position(|e| {
            e.as_ref()
                .is_some_and(|e| e.subject == subject && e.msg_type == msg_type)
        }) {
            let entry = entries[index].as_mut().expect("entry just matched");
            if entry
                .callbacks
                .iter()
                .any(|cb| Arc::ptr_eq(&cb.callback, &callback))
            {
                return Err(CmsgError::AlreadyExists);
            }
            if entry.callbacks.len() >= MAX_CALLBACKS {
                return Err(CmsgError::OutOfMemory);
            }
            let record = CallbackRecord::new(callback, config);
            let handle = SubscriptionHandle {
                entry_index: index,
                cb_id: record.id,
            };
            entry.callbacks.push(record.clone());
            drop(entries);
            spawn_primary(record, self.clone(), worker_context(domain, subject, msg_type, locator));
            return Ok(SubscribeOutcome::Existing(handle));
        }

        // Claim a free slot.
        let index = match entries.iter().position(Option::is_none) {
            Some(i) => i,
            None if entries.len() < MAX_SUBSCRIPTIONS => {
                entries.push(None);
                entries.len() - 1
            }
            None => return Err(CmsgError::OutOfMemory),
        };

        let unique_id = registry::next_unique_id();
        let record = CallbackRecord::new(callback, config);
        let handle = SubscriptionHandle {
            entry_index: index,
            cb_id: record.id,
        };
        entries[index] = Some(SubscriptionEntry {
            id: unique_id,
            subject: subject.to_string(),
            msg_type: msg_type.to_string(),
            subject_re: compile_pattern(subject),
            type_re: compile_pattern(msg_type),
            callbacks: vec![record.clone()],
        });
        drop(entries);
        spawn_primary(record, self.clone(), worker_context(domain, subject, msg_type, locator));
        Ok(SubscribeOutcome::New(handle, unique_id))
    }

    /// Rolls back a freshly claimed entry whose subscribe frame failed to
    /// reach the server.
    pub fn rollback_new(&self, handle: &SubscriptionHandle) {
        let mut entries = self.entries.lock();
        if let Some(slot) = entries.get_mut(handle.entry_index) {
            if let Some(entry) = slot.take() {
                for cb in &entry.callbacks {
                    cb.stop();
                }
            }
        }
        self.notify_room();
    }

    /// Removes one callback. When the last callback of an entry is going
    /// away, `notify_last` runs first (with the entry's server id,
    /// subject, and type) so the server learns about the unsubscribe
    /// before the table mutates; its failure aborts the removal.
    pub fn remove<F>(&self, handle: &SubscriptionHandle, notify_last: F) -> CmsgResult<()>
    where
        F: FnOnce(i32, &str, &str) -> CmsgResult<()>,
    {
        let mut entries = self.entries.lock();
        let slot = entries
            .get_mut(handle.entry_index)
            .ok_or(CmsgError::BadArgument)?;
        let entry = slot.as_mut().ok_or(CmsgError::BadArgument)?;
        let pos = entry
            .callbacks
            .iter()
            .position(|cb| cb.id == handle.cb_id)
            .ok_or(CmsgError::BadArgument)?;

        if entry.callbacks.len() == 1 {
            notify_last(entry.id, &entry.subject, &entry.msg_type)?;
        }

        let record = entry.callbacks.remove(pos);
        record.stop();
        if entry.callbacks.is_empty() {
            *slot = None;
        }
        drop(entries);
        // A producer may be blocked on this callback's full queue.
        self.notify_room();
        Ok(())
    }

    /// Stops every callback worker. Used at disconnect.
    pub fn stop_all(&self) {
        let mut entries = self.entries.lock();
        for slot in entries.iter_mut() {
            if let Some(entry) = slot.take() {
                for cb in &entry.callbacks {
                    cb.stop();
                }
            }
        }
        drop(entries);
        self.notify_room();
    }

    /// The active (index, subject, type) triples, for failover
    /// resubscription.
    pub fn active_subscriptions(&self) -> Vec<(usize, String, String)> {
        self.entries
            .lock()
            .iter()
            .enumerate()
            .filter_map(|(i, e)| {
                e.as_ref()
                    .map(|e| (i, e.subject.clone(), e.msg_type.clone()))
            })
            .collect()
    }

    /// Re-assigns the server id of an entry after failover.
    pub fn set_entry_id(&self, index: usize, id: i32) {
        if let Some(Some(entry)) = self.entries.lock().get_mut(index) {
            entry.id = id;
        }
    }

    /// Visits each active entry with its live callback records, in slot
    /// order. Used by the monitoring report.
    pub fn for_each_active<F>(&self, mut f: F)
    where
        F: FnMut(&str, &str, &[Arc<CallbackRecord>]),
    {
        for slot in self.entries.lock().iter() {
            if let Some(entry) = slot {
                f(&entry.subject, &entry.msg_type, &entry.callbacks);
            }
        }
    }

    /// Delivers one inbound message to every matching active callback.
    ///
    /// Each callback receives an independent deep copy. When a no-skip
    /// queue is full, this producer blocks on the room condvar until a
    /// worker dequeues, the callback goes away (the copy is dropped), or
    /// `kill_receiver` aborts the delivery with `ServerDied`.
    pub fn run_callbacks(&self, msg: &Message, kill_receiver: &AtomicBool) -> CmsgResult<()> {
        let matching: Vec<Arc<CallbackRecord>> = {
            let entries = self.entries.lock();
            entries
                .iter()
                .flatten()
                .filter(|e| e.subject_re.is_match(&msg.subject) && e.type_re.is_match(&msg.msg_type))
                .flat_map(|e| e.callbacks.iter().cloned())
                .collect()
        };

        'callbacks: for cb in matching {
            if !cb.active.load(Ordering::SeqCst) {
                continue;
            }
            let copy = msg.clone();
            loop {
                if cb.queued.load(Ordering::SeqCst) >= cb.config.max_queue {
                    if cb.config.may_skip {
                        let mut q = cb.queue.lock();
                        let dropped = q.len().min(cb.config.skip_size);
                        for _ in 0..dropped {
                            q.pop_front();
                        }
                        cb.queued.fetch_sub(dropped, Ordering::SeqCst);
                        tracing::debug!(dropped, subject = %msg.subject, "skipped oldest queued messages");
                    } else {
                        let mut entries = self.entries.lock();
                        let _ = self.room.wait_for(&mut entries, FULL_QUEUE_RECHECK);
                        drop(entries);
                        if kill_receiver.load(Ordering::SeqCst) {
                            return Err(CmsgError::ServerDied);
                        }
                        if !cb.active.load(Ordering::SeqCst) {
                            // Unsubscribed while we waited.
                            continue 'callbacks;
                        }
                        continue;
                    }
                }
                let mut q = cb.queue.lock();
                if !cb.config.may_skip && q.len() >= cb.config.max_queue {
                    continue;
                }
                q.push_back(copy);
                cb.queued.fetch_add(1, Ordering::SeqCst);
                cb.cond.notify_all();
                break;
            }
        }
        Ok(())
    }
}

fn worker_context(
    domain: &'static str,
    subject: &str,
    msg_type: &str,
    locator: &str,
) -> WorkerContext {
    WorkerContext {
        domain,
        subject: subject.to_string(),
        msg_type: msg_type.to_string(),
        locator: locator.to_string(),
    }
}

fn spawn_primary(cb: Arc<CallbackRecord>, table: Arc<SubscriptionTable>, ctx: WorkerContext) {
    let builder = worker_builder(&cb, "cmsg-callback");
    builder
        .spawn(move || primary_worker(cb, table, ctx))
        .expect("spawn callback worker");
}

fn spawn_supplemental(cb: Arc<CallbackRecord>, table: Arc<SubscriptionTable>, ctx: WorkerContext) {
    let builder = worker_builder(&cb, "cmsg-callback-extra");
    builder
        .spawn(move || supplemental_worker(cb, table, ctx))
        .expect("spawn supplemental worker");
}

fn worker_builder(cb: &CallbackRecord, name: &str) -> thread::Builder {
    let mut builder = thread::Builder::new().name(name.to_string());
    if cb.config.stack_size > 0 {
        builder = builder.stack_size(cb.config.stack_size);
    }
    builder
}

fn deliver(cb: &CallbackRecord, ctx: &WorkerContext, mut msg: Message) {
    msg.context = Some(SubscriptionContext {
        domain: ctx.domain.to_string(),
        subject: ctx.subject.clone(),
        msg_type: ctx.msg_type.clone(),
        locator: ctx.locator.clone(),
        queued: cb.queued.clone(),
    });
    cb.delivered.fetch_add(1, Ordering::Relaxed);
    cb.callback.on_message(msg);
}

fn drain_on_quit(cb: &CallbackRecord, table: &SubscriptionTable, q: &mut VecDeque<Message>) {
    cb.active.store(false, Ordering::SeqCst);
    q.clear();
    cb.queued.store(0, Ordering::SeqCst);
    // A producer may be blocked waiting for room that will never come.
    table.notify_room();
}

fn primary_worker(cb: Arc<CallbackRecord>, table: Arc<SubscriptionTable>, ctx: WorkerContext) {
    loop {
        // Spawn supplemental help when the backlog runs ahead of the pool.
        let queued = cb.queued.load(Ordering::Relaxed);
        let threads = cb.workers.load(Ordering::Relaxed);
        if !cb.config.must_serialize
            && threads < cb.config.max_threads
            && queued > cb.config.msgs_per_thread
        {
            let need = queued / cb.config.msgs_per_thread;
            if need > threads {
                let adding = (need - threads).min(cb.config.max_threads - threads);
                for _ in 0..adding {
                    spawn_supplemental(cb.clone(), table.clone(), ctx.clone());
                }
                cb.workers.fetch_add(adding, Ordering::SeqCst);
                tracing::debug!(workers = threads + adding, subject = %ctx.subject, "grew callback worker pool");
            }
        }

        let msg = {
            let mut q = cb.queue.lock();
            loop {
                if cb.quit.load(Ordering::SeqCst) {
                    drain_on_quit(&cb, &table, &mut q);
                    return;
                }
                if let Some(m) = q.pop_front() {
                    cb.queued.fetch_sub(1, Ordering::SeqCst);
                    break m;
                }
                cb.cond.wait(&mut q);
            }
        };
        table.notify_room();
        deliver(&cb, &ctx, msg);
    }
}

fn supplemental_worker(cb: Arc<CallbackRecord>, table: Arc<SubscriptionTable>, ctx: WorkerContext) {
    let mut empty_polls = 0u32;
    loop {
        let msg = {
            let mut q = cb.queue.lock();
            loop {
                if cb.quit.load(Ordering::SeqCst) {
                    drain_on_quit(&cb, &table, &mut q);
                    return;
                }
                if let Some(m) = q.pop_front() {
                    cb.queued.fetch_sub(1, Ordering::SeqCst);
                    empty_polls = 0;
                    break m;
                }
                if cb.cond.wait_for(&mut q, SUPPLEMENTAL_POLL).timed_out() {
                    empty_polls += 1;
                    if empty_polls >= SUPPLEMENTAL_EMPTY_LIMIT {
                        cb.workers.fetch_sub(1, Ordering::SeqCst);
                        return;
                    }
                }
            }
        };
        table.notify_room();
        deliver(&cb, &ctx, msg);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wildcards_become_anchored_regexes() {
        let re = compile_pattern("run.*");
        assert!(re.is_match("run.control"));
        assert!(re.is_match("run."));
        assert!(!re.is_match("prefix run.x"));

        let re = compile_pattern("a?c");
        assert!(re.is_match("abc"));
        assert!(!re.is_match("ac"));
        assert!(!re.is_match("abbc"));

        // Literal dots must not match arbitrary characters.
        let re = compile_pattern("a.c");
        assert!(re.is_match("a.c"));
        assert!(!re.is_match("axc"));
    }
}
