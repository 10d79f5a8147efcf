//! The client's listening thread and the per-socket handler threads that
//! read frames sent by the server.
//!
//! The server opens two TCP connections back to the client (message
//! delivery and keep-alive inquiries); the listening thread accepts each
//! and spawns a handler. It keeps accepting so failover can reuse the
//! same listening port with a fresh pair. There is no thread
//! cancellation: the accept loop polls a quit flag, and handler reads are
//! unblocked by shutting their sockets down.

use crate::domain::state::DomainState;
use crate::domain::rc;
use crate::error::CmsgResult;
use crate::monitor;
use cmsg_proto::message::now_ms;
use cmsg_proto::{codec, frame, ids, DeliveredMessage, Message};
use std::io::{Read, Write};
use std::net::TcpStream;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

const ACCEPT_POLL: Duration = Duration::from_millis(100);

pub(crate) fn spawn_listening_thread(state: Arc<DomainState>) {
    thread::Builder::new()
        .name("cmsg-listen".to_string())
        .spawn(move || listening_loop(state))
        .expect("spawn listening thread");
}

fn listening_loop(state: Arc<DomainState>) {
    if state.listener.set_nonblocking(true).is_err() {
        tracing::error!("listening socket cannot be polled, receiver disabled");
        return;
    }
    loop {
        if state.quit.load(Ordering::SeqCst) {
            return;
        }
        match state.listener.accept() {
            Ok((sock, peer)) => {
                tracing::debug!(%peer, "accepted server connection");
                let _ = sock.set_nonblocking(false);
                let _ = sock.set_nodelay(true);
                crate::sys::set_recv_buffer(&sock, ids::BIG_SOCK_BUF_SIZE);
                let sock = Arc::new(sock);
                state.handler_socks.lock().push(sock.clone());
                let state = state.clone();
                let spawned = thread::Builder::new()
                    .name("cmsg-handler".to_string())
                    .spawn(move || handler_loop(state, sock));
                if spawned.is_err() {
                    tracing::error!("could not spawn server handler thread");
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                thread::sleep(ACCEPT_POLL);
            }
            Err(e) => {
                if state.quit.load(Ordering::SeqCst) {
                    return;
                }
                tracing::debug!(error = %e, "accept failed");
                thread::sleep(ACCEPT_POLL);
            }
        }
    }
}

/// Reads frames off one server connection until it breaks.
fn handler_loop(state: Arc<DomainState>, sock: Arc<TcpStream>) {
    loop {
        if state.quit.load(Ordering::SeqCst) {
            break;
        }
        let mut reader = &*sock;
        let (size, id) = match frame::read_header(&mut reader) {
            Ok(v) => v,
            Err(_) => break,
        };
        if handle_frame(&state, &sock, size, id).is_err() {
            break;
        }
    }
    state
        .handler_socks
        .lock()
        .retain(|s| !Arc::ptr_eq(s, &sock));
    tracing::debug!("server handler thread exiting");
}

fn handle_frame(
    state: &Arc<DomainState>,
    sock: &Arc<TcpStream>,
    size: usize,
    id: u32,
) -> CmsgResult<()> {
    let mut reader = &**sock;
    match id {
        id if id == ids::ResponseId::SubscribeResponse as u32 => {
            let delivered = codec::read_delivery(&mut reader)?;
            let msg = stamp(state, delivered.message);
            if delivered.acknowledge {
                write_status_ok(sock)?;
            }
            dispatch_delivery(state, msg)?;
        }
        id if id == ids::ResponseId::GetResponse as u32 => {
            let delivered = codec::read_delivery(&mut reader)?;
            let msg = stamp(state, delivered.message);
            if delivered.acknowledge {
                write_status_ok(sock)?;
            }
            if !state.send_and_gets.wake_token(msg) {
                tracing::debug!("get response with no pending sendAndGet, dropped");
            }
        }
        id if id == ids::RequestId::KeepAlive as u32 => {
            let counts = state.stats.snapshot();
            let xml = monitor::subscription_xml(&state.subscriptions);
            let mut buf = Vec::new();
            codec::encode_monitor_report(&mut buf, &counts, &xml);
            (&**sock).write_all(&buf).map_err(crate::error::CmsgError::from)?;
        }
        id if id == ids::RequestId::ShutdownClients as u32 => {
            let acknowledge = frame::read_len(&mut reader)? != 0;
            if acknowledge {
                write_status_ok(sock)?;
            }
            tracing::warn!("server ordered this client to shut down");
            state.run_shutdown_handler();
        }
        id if id == ids::ResponseId::RcConnect as u32 => {
            let delivered: DeliveredMessage = codec::read_delivery(&mut reader)?;
            rc::handle_rc_connect(state, delivered, sock)?;
        }
        id if id == ids::ResponseId::RcConnectAbort as u32 => {
            state.rc_connect_abort.store(true, Ordering::SeqCst);
            state.sync_latch.count_down(Some(Duration::from_secs(1)));
        }
        other => {
            tracing::debug!(id = other, "unknown frame id, skipping body");
            let mut remaining = size - 4;
            let mut sink = [0u8; 512];
            while remaining > 0 {
                let n = reader.read(&mut sink[..remaining.min(512)])?;
                if n == 0 {
                    return Err(crate::error::CmsgError::NetworkError);
                }
                remaining -= n;
            }
        }
    }
    Ok(())
}

/// Fills in the receiver-side fields the wire does not carry.
fn stamp(state: &DomainState, mut msg: Message) -> Message {
    msg.domain = Some(state.kind.to_string());
    msg.receiver = Some(state.name.clone());
    msg.receiver_host = Some(state.my_host.clone());
    msg.receiver_time_ms = now_ms();
    msg
}

/// Routes one delivery: pending subscribeAndGets first (each gets its own
/// copy), then - receive state permitting - the subscription table.
fn dispatch_delivery(state: &Arc<DomainState>, msg: Message) -> CmsgResult<()> {
    state.subscribe_and_gets.wake_matching(&msg);
    if !state.receive_state.load(Ordering::SeqCst) {
        return Ok(());
    }
    state
        .subscriptions
        .run_callbacks(&msg, &state.kill_receiver)
}

fn write_status_ok(sock: &Arc<TcpStream>) -> CmsgResult<()> {
    (&**sock)
        .write_all(&0u32.to_be_bytes())
        .map_err(crate::error::CmsgError::from)
}
