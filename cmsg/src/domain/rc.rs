//! The RC (run control) domain client.
//!
//! Connect is a three-party handshake: UDP broadcast discovery of the RC
//! broadcast server, then a TCP connection *initiated by the RC server*
//! back to this client's listening port, delivering an `RcConnect`
//! message that names the real send endpoints. Sends and subscriptions
//! reuse the cMsg domain's machinery; there is no server-side
//! subscription state, and the request/response operations are
//! unsupported.

use crate::domain::state::{DomainState, INITIAL_RC_SEND_BUFFER};
use crate::domain::{bind_listening_socket, listen, DomainClient};
use crate::error::{CmsgError, CmsgResult};
use crate::locator::{parse_rc_domain, ResolvedLocator};
use crate::subscription::{SubscribeConfig, SubscriptionCallback, SubscriptionHandle};
use crate::sync::LatchOutcome;
use crate::sys;
use cmsg_proto::{check_string, codec, ids, DeliveredMessage, Message};
use std::io::Write;
use std::net::{TcpStream, UdpSocket};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// A connection to an RC server.
pub(crate) struct RcClient {
    pub(crate) state: Arc<DomainState>,
}

pub fn connect(
    resolved: &ResolvedLocator,
    name: &str,
    description: &str,
) -> CmsgResult<DomainClient> {
    let rc = parse_rc_domain(&resolved.entries[0].remainder)?;
    let expid = rc.expid.clone().ok_or(CmsgError::Error)?;

    let (listener, listen_port) =
        bind_listening_socket("CMSG_RC_CLIENT_PORT", ids::RC_CLIENT_LISTENING_PORT)?;
    let state = DomainState::new(
        "rc",
        name,
        description,
        &resolved.canonical,
        listener,
        listen_port,
        INITIAL_RC_SEND_BUFFER,
    );

    sys::block_sigpipe();
    listen::spawn_listening_thread(state.clone());

    let teardown = |state: &Arc<DomainState>| {
        state.quit.store(true, Ordering::SeqCst);
        state.restore_sigpipe_once();
    };

    // Stage one: find the RC broadcast server.
    if let Err(e) = discover(&state, &rc, &expid) {
        teardown(&state);
        return Err(e);
    }

    // Stage two: the RC server connects back to our listening port and
    // sends RcConnect with its send endpoints; the handler thread counts
    // the latch down.
    let connect_timeout =
        (rc.connect_timeout_secs > 0).then(|| Duration::from_secs(rc.connect_timeout_secs as u64));
    let outcome = state.sync_latch.wait(connect_timeout);
    if state.rc_connect_abort.load(Ordering::SeqCst) {
        teardown(&state);
        return Err(CmsgError::Abort);
    }
    if outcome != LatchOutcome::Done || !state.rc_connect_complete.load(Ordering::SeqCst) {
        teardown(&state);
        return Err(CmsgError::Timeout);
    }

    // Open the send sockets to the endpoints the handshake recorded.
    if let Err(e) = open_send_sockets(&state) {
        teardown(&state);
        return Err(e);
    }

    *state.shutdown_handler.lock() = Some(Box::new(|| std::process::exit(1)));
    state.connected.store(true, Ordering::SeqCst);
    tracing::info!(locator = %state.locator, "connected to RC server");
    Ok(DomainClient::Rc(RcClient { state }))
}

/// Broadcasts the discovery datagram once a second until a reply with the
/// right magic and expid arrives or the timeout passes. Replies with a
/// foreign expid are ignored.
fn discover(
    state: &Arc<DomainState>,
    rc: &crate::locator::RcDomainLocator,
    expid: &str,
) -> CmsgResult<()> {
    let udp = UdpSocket::bind(("0.0.0.0", 0)).map_err(|_| CmsgError::SocketError)?;
    udp.set_broadcast(true).map_err(|_| CmsgError::SocketError)?;
    udp.set_read_timeout(Some(Duration::from_secs(1)))
        .map_err(|_| CmsgError::SocketError)?;

    let datagram = codec::encode_rc_discovery(state.listen_port, &state.name, expid);
    let deadline = (rc.broadcast_timeout_secs > 0)
        .then(|| Instant::now() + Duration::from_secs(rc.broadcast_timeout_secs as u64));
    let mut buf = [0u8; 1024];
    loop {
        udp.send_to(&datagram, (rc.host.as_str(), rc.port))?;
        match udp.recv_from(&mut buf) {
            Ok((n, _)) => {
                if let Some(reply) = codec::parse_rc_discovery_reply(&buf[..n]) {
                    if reply.expid.as_deref().is_some_and(|e| e != expid) {
                        tracing::debug!(got = ?reply.expid, "discovery reply with foreign expid ignored");
                        continue;
                    }
                    tracing::debug!(host = %reply.host, port = reply.port, "RC broadcast server found");
                    return Ok(());
                }
            }
            Err(e)
                if e.kind() == std::io::ErrorKind::WouldBlock
                    || e.kind() == std::io::ErrorKind::TimedOut => {}
            Err(_) => return Err(CmsgError::NetworkError),
        }
        if deadline.is_some_and(|d| Instant::now() >= d) {
            return Err(CmsgError::Timeout);
        }
    }
}

fn open_send_sockets(state: &Arc<DomainState>) -> CmsgResult<()> {
    let host = state.send_host.lock().clone();
    let tcp = TcpStream::connect((host.as_str(), state.send_port()))
        .map_err(|_| CmsgError::NetworkError)?;
    let _ = tcp.set_nodelay(true);
    sys::set_send_buffer(&tcp, ids::BIG_SOCK_BUF_SIZE);

    let udp = UdpSocket::bind(("0.0.0.0", 0)).map_err(|_| CmsgError::SocketError)?;
    sys::set_send_buffer(&udp, ids::BIG_SOCK_BUF_SIZE);
    udp.connect((host.as_str(), state.send_udp_port()))
        .map_err(|_| CmsgError::SocketError)?;

    let mut io = state.io.lock();
    io.tcp = Some(Arc::new(tcp));
    io.udp = Some(udp);
    Ok(())
}

/// Handles an `RcConnect` delivery on a handler connection. First time
/// through it completes the connect handshake; on an already-connected
/// client it means the RC server died and came back, so the send sockets
/// are rebuilt in place while subscriptions stay intact.
pub(crate) fn handle_rc_connect(
    state: &Arc<DomainState>,
    delivered: DeliveredMessage,
    sock: &Arc<std::net::TcpStream>,
) -> CmsgResult<()> {
    let msg = delivered.message;
    let text = msg.text.as_deref().unwrap_or("");
    let mut ports = text.split(':');
    let udp_port: u16 = ports
        .next()
        .and_then(|p| p.parse().ok())
        .ok_or(CmsgError::BadFormat)?;
    let tcp_port: u16 = ports
        .next()
        .and_then(|p| p.parse().ok())
        .ok_or(CmsgError::BadFormat)?;

    state.send_udp_port.store(udp_port as u32, Ordering::SeqCst);
    state.send_port.store(tcp_port as u32, Ordering::SeqCst);
    if let Some(host) = msg.sender_host {
        *state.send_host.lock() = host;
    }

    if !state.connected.load(Ordering::SeqCst) {
        state.rc_connect_complete.store(true, Ordering::SeqCst);
        state.sync_latch.count_down(Some(Duration::from_secs(1)));
    } else {
        tracing::info!(tcp_port, udp_port, "RC server re-established, reopening send sockets");
        let host = state.send_host.lock().clone();
        let tcp = TcpStream::connect((host.as_str(), tcp_port))
            .map_err(|_| CmsgError::NetworkError)?;
        let _ = tcp.set_nodelay(true);
        sys::set_send_buffer(&tcp, ids::BIG_SOCK_BUF_SIZE);
        let udp = UdpSocket::bind(("0.0.0.0", 0)).map_err(|_| CmsgError::SocketError)?;
        sys::set_send_buffer(&udp, ids::BIG_SOCK_BUF_SIZE);
        udp.connect((host.as_str(), udp_port))
            .map_err(|_| CmsgError::SocketError)?;
        let mut io = state.io.lock();
        io.tcp = Some(Arc::new(tcp));
        io.udp = Some(udp);
    }

    // Identify ourselves back to the RC server.
    let mut buf = Vec::new();
    codec::encode_name_reply(&mut buf, &state.name);
    (&**sock).write_all(&buf)?;
    Ok(())
}

impl RcClient {
    pub fn send(&self, msg: &Message) -> CmsgResult<()> {
        if !check_string(&msg.subject) || !check_string(&msg.msg_type) {
            return Err(CmsgError::BadArgument);
        }
        let state = &self.state;
        let _read = state.connect_lock.read();
        if !state.connected.load(Ordering::SeqCst) {
            return Err(CmsgError::LostConnection);
        }
        let mut io = state.io.lock();
        let io = &mut *io;
        codec::encode_rc_publish(&mut io.buffer, msg, &state.name);
        if io.buffer.len() > ids::BIGGEST_UDP_PACKET {
            return Err(CmsgError::LimitExceeded);
        }
        if msg.reliable_send {
            io.write_tcp()?;
            state.stats.tcp_sends.fetch_add(1, Ordering::Relaxed);
        } else {
            io.write_udp()?;
            state.stats.udp_sends.fetch_add(1, Ordering::Relaxed);
        }
        Ok(())
    }

    /// Same subscription machinery as the cMsg domain, with no server to
    /// notify.
    pub fn subscribe(
        &self,
        subject: &str,
        msg_type: &str,
        callback: Arc<dyn SubscriptionCallback>,
        config: SubscribeConfig,
    ) -> CmsgResult<SubscriptionHandle> {
        if !check_string(subject) || !check_string(msg_type) {
            return Err(CmsgError::BadArgument);
        }
        let state = &self.state;
        let _read = state.connect_lock.read();
        if !state.connected.load(Ordering::SeqCst) {
            return Err(CmsgError::LostConnection);
        }
        let outcome = state
            .subscriptions
            .add(subject, msg_type, callback, config, "rc", &state.locator)?;
        state.stats.subscribes.fetch_add(1, Ordering::Relaxed);
        Ok(match outcome {
            crate::subscription::SubscribeOutcome::Existing(h) => h,
            crate::subscription::SubscribeOutcome::New(h, _) => h,
        })
    }

    pub fn unsubscribe(&self, handle: &SubscriptionHandle) -> CmsgResult<()> {
        let state = &self.state;
        let _read = state.connect_lock.read();
        if !state.connected.load(Ordering::SeqCst) {
            return Err(CmsgError::LostConnection);
        }
        state.subscriptions.remove(handle, |_, _, _| Ok(()))?;
        state.stats.unsubscribes.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    pub fn start(&self) {
        self.state.receive_state.store(true, Ordering::SeqCst);
    }

    pub fn stop(&self) {
        self.state.receive_state.store(false, Ordering::SeqCst);
    }

    pub fn set_shutdown_handler(&self, handler: Box<dyn Fn() + Send + Sync>) {
        *self.state.shutdown_handler.lock() = Some(handler);
    }

    pub fn flush(&self) -> CmsgResult<()> {
        Ok(())
    }

    pub fn disconnect(&self) {
        let state = &self.state;
        let _write = state.connect_lock.write();
        state.connected.store(false, Ordering::SeqCst);
        state.quit.store(true, Ordering::SeqCst);
        state.shutdown_server_sockets();
        state.shutdown_handler_sockets();
        state.subscriptions.stop_all();
        std::thread::sleep(Duration::from_millis(100));
        state.restore_sigpipe_once();
        tracing::info!("disconnected from RC server");
    }
}
