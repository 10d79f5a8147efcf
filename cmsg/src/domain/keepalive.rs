//! Keep-alive supervision and failover.
//!
//! The keep-alive thread pings the server once a second. Any I/O failure
//! is treated as server death: the thread closes the server-facing
//! sockets and walks the failover list, reconnecting and restoring every
//! active subscription on the first server that takes them all. Ordinary
//! operations that failed meanwhile wait in [`failover_successful`] for
//! the latch and retry exactly once.

use crate::domain::cmsg::{connect_direct, discover_name_server};
use crate::domain::state::DomainState;
use crate::error::{CmsgError, CmsgResult};
use crate::registry;
use crate::sync::LatchOutcome;
use cmsg_proto::{codec, frame, RequestId};
use std::io::{Read, Write};
use std::net::TcpStream;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

const PING_INTERVAL: Duration = Duration::from_secs(1);
/// How long operations wait for a failover in flight.
const FAILOVER_WAIT: Duration = Duration::from_secs(3);
/// Bound on the latch handshake with woken waiters.
const LATCH_NOTIFY_WAIT: Duration = Duration::from_millis(1100);
/// Grace period for the delivery handler to drain before its socket is
/// pulled out from under it.
const RECEIVER_DRAIN: Duration = Duration::from_millis(500);

pub(crate) fn spawn(state: Arc<DomainState>) {
    thread::Builder::new()
        .name("cmsg-keepalive".to_string())
        .spawn(move || keep_alive_loop(state))
        .expect("spawn keep-alive thread");
}

fn keep_alive_loop(state: Arc<DomainState>) {
    loop {
        // Steady state: ping until the socket breaks.
        loop {
            if state.quit.load(Ordering::SeqCst) {
                return;
            }
            let Some(sock) = state.keepalive_sock.lock().clone() else {
                break;
            };
            if ping(&state, &sock).is_err() {
                break;
            }
            thread::sleep(PING_INTERVAL);
        }
        if state.quit.load(Ordering::SeqCst) {
            return;
        }

        tracing::warn!("keep-alive failed, server presumed dead");
        state.shutdown_server_sockets();
        state.resubscribe_complete.store(false, Ordering::SeqCst);

        if !try_failover(&state) {
            tracing::error!("failover list exhausted, disconnecting");
            disconnect_from_keepalive(&state);
            return;
        }
    }
}

/// One keep-alive round trip: write the frame, read back the server's
/// monitoring report and store it unparsed.
fn ping(state: &DomainState, sock: &Arc<TcpStream>) -> CmsgResult<()> {
    let mut buf = Vec::new();
    codec::encode_bare(&mut buf, RequestId::KeepAlive);
    (&**sock).write_all(&buf)?;

    let mut reader = &**sock;
    let len = frame::read_len(&mut reader)?;
    let mut report = vec![0u8; len];
    reader.read_exact(&mut report)?;
    *state.latest_server_report.lock() = report;
    Ok(())
}

/// Walks the failover list starting past the current entry, wrapping to
/// zero. True once a new server is connected and resubscribed.
fn try_failover(state: &Arc<DomainState>) -> bool {
    if !state.implement_failovers.load(Ordering::SeqCst) {
        return false;
    }
    let count = state.failovers.lock().len();
    if count == 0 {
        return false;
    }
    let current = state.failover_index.load(Ordering::SeqCst);

    for step in 0..count {
        if state.quit.load(Ordering::SeqCst) {
            return false;
        }
        let index = (current + 1 + step) % count;
        let mut entry = state.failovers.lock()[index].clone();
        if !entry.valid {
            continue;
        }
        tracing::info!(locator = %entry.locator, "trying failover server");

        if entry.must_broadcast {
            if discover_name_server(&mut entry).is_err() {
                continue;
            }
            state.failovers.lock()[index] = entry.clone();
        }
        if let Err(e) = reconnect(state, &entry) {
            tracing::debug!(error = %e, "failover reconnect failed");
            continue;
        }
        if let Err(e) = restore_subscriptions(state) {
            // A server that cannot take our subscriptions is no good.
            tracing::debug!(error = %e, "failover resubscription failed");
            state.shutdown_server_sockets();
            continue;
        }

        state.failover_index.store(index, Ordering::SeqCst);
        state.resubscribe_complete.store(true, Ordering::SeqCst);
        state.sync_latch.count_down(Some(LATCH_NOTIFY_WAIT));
        state.sync_latch.reset(1, None);
        tracing::info!(locator = %entry.locator, "failover complete");
        return true;
    }
    false
}

/// Re-runs the connect dialogue against one failover entry, reusing the
/// listening socket and all callback workers. The two handler threads of
/// the dead server are torn down; the new server connects a fresh pair.
fn reconnect(state: &Arc<DomainState>, entry: &crate::locator::CmsgDomainLocator) -> CmsgResult<()> {
    let _write = state.connect_lock.write();

    // Pending request/response calls cannot survive a server identity
    // change.
    state.send_and_gets.wake_all(CmsgError::ServerDied);
    state.subscribe_and_gets.wake_all(CmsgError::ServerDied);

    // The delivery handler may be blocked producing into a full queue;
    // let it notice the teardown, then pull its socket.
    state.kill_receiver.store(true, Ordering::SeqCst);
    state.subscriptions.notify_room();
    thread::sleep(RECEIVER_DRAIN);
    state.shutdown_handler_sockets();
    state.kill_receiver.store(false, Ordering::SeqCst);

    connect_direct(state, entry)
}

/// Re-issues a subscribe frame, with a fresh unique id, for every active
/// subscription table entry.
fn restore_subscriptions(state: &Arc<DomainState>) -> CmsgResult<()> {
    for (index, subject, msg_type) in state.subscriptions.active_subscriptions() {
        let unique_id = registry::next_unique_id();
        state.subscriptions.set_entry_id(index, unique_id);
        let mut io = state.io.lock();
        let io = &mut *io;
        codec::encode_subscription(
            &mut io.buffer,
            RequestId::Subscribe,
            unique_id,
            &subject,
            &msg_type,
        );
        io.write_tcp()?;
        tracing::debug!(%subject, %msg_type, unique_id, "restored subscription");
    }
    Ok(())
}

/// Called by an operation that just failed on the transport: waits a
/// bounded time for the keep-alive thread to produce a new server.
pub(crate) fn failover_successful(state: &Arc<DomainState>, wait_for_resubscribe: bool) -> bool {
    if !state.implement_failovers.load(Ordering::SeqCst) {
        return false;
    }
    match state.sync_latch.wait(Some(FAILOVER_WAIT)) {
        LatchOutcome::Done => {
            state.connected.load(Ordering::SeqCst)
                && (!wait_for_resubscribe || state.resubscribe_complete.load(Ordering::SeqCst))
        }
        LatchOutcome::Reset | LatchOutcome::TimedOut => false,
    }
}

/// Terminal teardown once the failover list is exhausted.
fn disconnect_from_keepalive(state: &Arc<DomainState>) {
    let _write = state.connect_lock.write();
    state.connected.store(false, Ordering::SeqCst);
    state.quit.store(true, Ordering::SeqCst);

    state.shutdown_server_sockets();
    state.shutdown_handler_sockets();
    state.subscriptions.stop_all();
    state.send_and_gets.wake_all(CmsgError::ServerDied);
    state.subscribe_and_gets.wake_all(CmsgError::ServerDied);
    state.restore_sigpipe_once();
}
