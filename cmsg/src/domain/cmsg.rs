//! The cMsg domain client: bidirectional TCP/UDP client with a listening
//! thread, keep-alive/failover supervisor, subscription dispatch, and the
//! request/response correlator.

use crate::domain::state::{DomainState, INITIAL_SEND_BUFFER};
use crate::domain::{bind_listening_socket, keepalive, listen, DomainClient};
use crate::error::{CmsgError, CmsgResult};
use crate::locator::{parse_cmsg_domain, CmsgDomainLocator, ResolvedLocator};
use crate::pending::WaitOutcome;
use crate::registry;
use crate::subscription::{SubscribeConfig, SubscribeOutcome, SubscriptionCallback, SubscriptionHandle};
use crate::sys;
use cmsg_proto::codec::{self, NameServerVerdict, ServerConnectRequest};
use cmsg_proto::{check_string, frame, ids, Message, RequestId};
use std::io::Read;
use std::net::{TcpStream, UdpSocket};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// A connection to a cMsg domain server.
pub(crate) struct CmsgClient {
    pub(crate) state: Arc<DomainState>,
}

/// Connects to the first reachable entry of the resolved locator list.
pub fn connect(
    resolved: &ResolvedLocator,
    name: &str,
    description: &str,
) -> CmsgResult<DomainClient> {
    let parsed: Vec<CmsgDomainLocator> = resolved.entries.iter().map(parse_cmsg_domain).collect();
    let viable = parsed.iter().filter(|p| p.valid).count();
    if viable == 0 {
        return Err(CmsgError::BadFormat);
    }

    let (listener, listen_port) =
        bind_listening_socket("CMSG_PORT", ids::CLIENT_LISTENING_PORT)?;
    let state = DomainState::new(
        "cMsg",
        name,
        description,
        &resolved.canonical,
        listener,
        listen_port,
        INITIAL_SEND_BUFFER,
    );
    *state.failovers.lock() = parsed;
    state
        .implement_failovers
        .store(viable > 1, Ordering::SeqCst);

    sys::block_sigpipe();
    listen::spawn_listening_thread(state.clone());

    let count = state.failovers.lock().len();
    let mut last_err = CmsgError::NetworkError;
    let mut connected_at = None;
    for index in 0..count {
        let mut entry = state.failovers.lock()[index].clone();
        if !entry.valid {
            continue;
        }
        if entry.must_broadcast {
            if let Err(e) = discover_name_server(&mut entry) {
                last_err = e;
                continue;
            }
            state.failovers.lock()[index] = entry.clone();
        }
        match connect_direct(&state, &entry) {
            Ok(()) => {
                connected_at = Some(index);
                break;
            }
            Err(e) => {
                tracing::debug!(locator = %entry.locator, error = %e, "connect attempt failed");
                last_err = e;
            }
        }
    }

    let Some(index) = connected_at else {
        state.quit.store(true, Ordering::SeqCst);
        state.restore_sigpipe_once();
        return Err(last_err);
    };
    state.failover_index.store(index, Ordering::SeqCst);

    keepalive::spawn(state.clone());
    *state.shutdown_handler.lock() = Some(Box::new(|| std::process::exit(1)));
    state.connected.store(true, Ordering::SeqCst);
    tracing::info!(locator = %state.locator, "connected to cMsg server");
    Ok(DomainClient::CMsg(CmsgClient { state }))
}

/// Resolves a broadcast entry's host and port by UDP discovery: send the
/// discovery datagram once a second and collect the first valid reply.
pub(crate) fn discover_name_server(entry: &mut CmsgDomainLocator) -> CmsgResult<()> {
    let udp = UdpSocket::bind(("0.0.0.0", 0)).map_err(|_| CmsgError::SocketError)?;
    udp.set_broadcast(true).map_err(|_| CmsgError::SocketError)?;
    udp.set_read_timeout(Some(Duration::from_secs(1)))
        .map_err(|_| CmsgError::SocketError)?;

    let datagram = codec::encode_cmsg_discovery(entry.password.as_deref());
    let deadline = (entry.broadcast_timeout_secs > 0)
        .then(|| Instant::now() + Duration::from_secs(entry.broadcast_timeout_secs as u64));
    let mut buf = [0u8; 1024];
    loop {
        udp.send_to(&datagram, ("255.255.255.255", entry.port))?;
        match udp.recv_from(&mut buf) {
            Ok((n, _)) => {
                if let Some((port, host)) = codec::parse_cmsg_discovery_reply(&buf[..n]) {
                    tracing::debug!(%host, port, "name server discovered");
                    entry.host = host;
                    entry.port = port;
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

/// The direct-connect sequence: name-server dialogue, then the three TCP
/// sockets and the connected UDP socket to the domain server.
pub(crate) fn connect_direct(state: &Arc<DomainState>, entry: &CmsgDomainLocator) -> CmsgResult<()> {
    let mut name_sock =
        TcpStream::connect((entry.host.as_str(), entry.port)).map_err(|_| CmsgError::NetworkError)?;
    let _ = name_sock.set_nodelay(true);
    let reply = talk_to_name_server(state, &mut name_sock, entry)?;
    drop(name_sock);

    let host = reply.send_host.as_str();
    let receive = TcpStream::connect((host, reply.send_port))?;
    let keep_alive = match TcpStream::connect((host, reply.send_port)) {
        Ok(s) => s,
        Err(e) => {
            let _ = receive.shutdown(std::net::Shutdown::Both);
            return Err(e.into());
        }
    };
    let send = match TcpStream::connect((host, reply.send_port)) {
        Ok(s) => s,
        Err(e) => {
            let _ = receive.shutdown(std::net::Shutdown::Both);
            let _ = keep_alive.shutdown(std::net::Shutdown::Both);
            return Err(e.into());
        }
    };
    let _ = send.set_nodelay(true);
    sys::set_send_buffer(&send, ids::BIG_SOCK_BUF_SIZE);

    let udp = UdpSocket::bind(("0.0.0.0", 0)).map_err(|_| CmsgError::SocketError)?;
    sys::set_send_buffer(&udp, ids::BIG_SOCK_BUF_SIZE);
    udp.connect((host, reply.udp_port))
        .map_err(|_| CmsgError::SocketError)?;

    *state.capabilities.lock() = reply.capabilities;
    *state.send_host.lock() = reply.send_host.clone();
    state
        .send_port
        .store(reply.send_port as u32, Ordering::SeqCst);
    state
        .send_udp_port
        .store(reply.udp_port as u32, Ordering::SeqCst);
    *state.receive_sock.lock() = Some(Arc::new(receive));
    *state.keepalive_sock.lock() = Some(Arc::new(keep_alive));
    {
        let mut io = state.io.lock();
        io.tcp = Some(Arc::new(send));
        io.udp = Some(udp);
    }
    Ok(())
}

/// Sends the server-connect frame and reads the verdict.
fn talk_to_name_server(
    state: &DomainState,
    sock: &mut TcpStream,
    entry: &CmsgDomainLocator,
) -> CmsgResult<codec::ServerConnectReply> {
    let request = ServerConnectRequest {
        version_major: ids::VERSION_MAJOR,
        version_minor: ids::VERSION_MINOR,
        listening_port: state.listen_port,
        password: entry.password.clone(),
        domain: "cMsg".to_string(),
        subdomain: entry.subdomain.clone(),
        sub_remainder: entry.sub_remainder.clone(),
        host: state.my_host.clone(),
        name: state.name.clone(),
        locator: state.locator.clone(),
        description: state.description.clone(),
    };
    let mut buf = Vec::new();
    codec::encode_server_connect(&mut buf, &request);
    frame::write_all(sock, &buf)?;

    match codec::read_name_server_verdict(sock)? {
        NameServerVerdict::Accepted(reply) => Ok(reply),
        NameServerVerdict::Refused { code, message } => {
            tracing::warn!(code, %message, "name server refused connection");
            Err(CmsgError::ServerRefused { code, message })
        }
    }
}

fn is_transport_error(e: &CmsgError) -> bool {
    matches!(
        e,
        CmsgError::NetworkError | CmsgError::LostConnection | CmsgError::SocketError
    )
}

impl CmsgClient {
    /// Runs `op` once, and one more time if it failed on the transport
    /// and a failover produced a live server meanwhile.
    fn with_failover_retry<T>(
        &self,
        wait_for_resubscribe: bool,
        op: impl Fn() -> CmsgResult<T>,
    ) -> CmsgResult<T> {
        match op() {
            Err(e) if is_transport_error(&e) => {
                if keepalive::failover_successful(&self.state, wait_for_resubscribe) {
                    tracing::info!("failover successful, retrying operation");
                    op()
                } else {
                    Err(e)
                }
            }
            other => other,
        }
    }

    fn check_publishable(&self, msg: &Message) -> CmsgResult<()> {
        if !check_string(&msg.subject) || !check_string(&msg.msg_type) {
            return Err(CmsgError::BadArgument);
        }
        Ok(())
    }

    pub fn send(&self, msg: &Message) -> CmsgResult<()> {
        if !self.state.capabilities.lock().has_send {
            return Err(CmsgError::NotImplemented);
        }
        self.check_publishable(msg)?;
        let state = &self.state;
        self.with_failover_retry(false, || {
            let _read = state.connect_lock.read();
            if !state.connected.load(Ordering::SeqCst) {
                return Err(CmsgError::LostConnection);
            }
            let mut io = state.io.lock();
            let io = &mut *io;
            codec::encode_publish(&mut io.buffer, RequestId::Send, msg, &state.name);
            if msg.reliable_send {
                io.write_tcp()?;
                state.stats.tcp_sends.fetch_add(1, Ordering::Relaxed);
            } else {
                if io.buffer.len() > ids::MAX_UDP_FRAME {
                    return Err(CmsgError::OutOfRange);
                }
                io.write_udp()?;
                state.stats.udp_sends.fetch_add(1, Ordering::Relaxed);
            }
            Ok(())
        })
    }

    /// Publishes and waits for the server's status integer on the receive
    /// socket. Replies are correlated positionally, so the exchange is
    /// serialized per connection.
    pub fn sync_send(&self, msg: &Message, _timeout: Option<Duration>) -> CmsgResult<i32> {
        if !self.state.capabilities.lock().has_sync_send {
            return Err(CmsgError::NotImplemented);
        }
        self.check_publishable(msg)?;
        let state = &self.state;
        self.with_failover_retry(false, || {
            let _read = state.connect_lock.read();
            if !state.connected.load(Ordering::SeqCst) {
                return Err(CmsgError::LostConnection);
            }
            let _sync = state.sync_send.lock();
            {
                let mut io = state.io.lock();
                let io = &mut *io;
                codec::encode_publish(&mut io.buffer, RequestId::SyncSend, msg, &state.name);
                io.write_tcp()?;
            }
            let reply_sock = state
                .receive_sock
                .lock()
                .clone()
                .ok_or(CmsgError::LostConnection)?;
            let mut raw = [0u8; 4];
            (&*reply_sock).read_exact(&mut raw)?;
            state.stats.sync_sends.fetch_add(1, Ordering::Relaxed);
            Ok(i32::from_be_bytes(raw))
        })
    }

    pub fn subscribe(
        &self,
        subject: &str,
        msg_type: &str,
        callback: Arc<dyn SubscriptionCallback>,
        config: SubscribeConfig,
    ) -> CmsgResult<SubscriptionHandle> {
        if !self.state.capabilities.lock().has_subscribe {
            return Err(CmsgError::NotImplemented);
        }
        if !check_string(subject) || !check_string(msg_type) {
            return Err(CmsgError::BadArgument);
        }
        let state = &self.state;
        self.with_failover_retry(false, || {
            let _read = state.connect_lock.read();
            if !state.connected.load(Ordering::SeqCst) {
                return Err(CmsgError::LostConnection);
            }
            match state.subscriptions.add(
                subject,
                msg_type,
                callback.clone(),
                config.clone(),
                "cMsg",
                &state.locator,
            )? {
                SubscribeOutcome::Existing(handle) => {
                    state.stats.subscribes.fetch_add(1, Ordering::Relaxed);
                    Ok(handle)
                }
                SubscribeOutcome::New(handle, unique_id) => {
                    let wrote = {
                        let mut io = state.io.lock();
                        let io = &mut *io;
                        codec::encode_subscription(
                            &mut io.buffer,
                            RequestId::Subscribe,
                            unique_id,
                            subject,
                            msg_type,
                        );
                        io.write_tcp()
                    };
                    match wrote {
                        Ok(()) => {
                            state.stats.subscribes.fetch_add(1, Ordering::Relaxed);
                            Ok(handle)
                        }
                        Err(e) => {
                            state.subscriptions.rollback_new(&handle);
                            Err(e)
                        }
                    }
                }
            }
        })
    }

    pub fn unsubscribe(&self, handle: &SubscriptionHandle) -> CmsgResult<()> {
        if !self.state.capabilities.lock().has_unsubscribe {
            return Err(CmsgError::NotImplemented);
        }
        let state = &self.state;
        self.with_failover_retry(true, || {
            let _read = state.connect_lock.read();
            if !state.connected.load(Ordering::SeqCst) {
                return Err(CmsgError::LostConnection);
            }
            state.subscriptions.remove(handle, |id, subject, msg_type| {
                let mut io = state.io.lock();
                let io = &mut *io;
                codec::encode_subscription(
                    &mut io.buffer,
                    RequestId::Unsubscribe,
                    id,
                    subject,
                    msg_type,
                );
                io.write_tcp()
            })?;
            state.stats.unsubscribes.fetch_add(1, Ordering::Relaxed);
            Ok(())
        })
    }

    /// One-shot subscription: waits for a single matching message.
    pub fn subscribe_and_get(
        &self,
        subject: &str,
        msg_type: &str,
        timeout: Option<Duration>,
    ) -> CmsgResult<Message> {
        if !self.state.capabilities.lock().has_subscribe_and_get {
            return Err(CmsgError::NotImplemented);
        }
        if !check_string(subject) || !check_string(msg_type) {
            return Err(CmsgError::BadArgument);
        }
        let state = &self.state;
        let unique_id = registry::next_unique_id();
        let entry = {
            let _read = state.connect_lock.read();
            if !state.connected.load(Ordering::SeqCst) {
                return Err(CmsgError::LostConnection);
            }
            let entry = state
                .subscribe_and_gets
                .claim(unique_id, subject, msg_type, true)?;
            let wrote = {
                let mut io = state.io.lock();
                let io = &mut *io;
                codec::encode_subscription(
                    &mut io.buffer,
                    RequestId::SubscribeAndGet,
                    unique_id,
                    subject,
                    msg_type,
                );
                io.write_tcp()
            };
            if let Err(e) = wrote {
                state.subscribe_and_gets.release(unique_id);
                return Err(e);
            }
            state
                .stats
                .subscribe_and_gets
                .fetch_add(1, Ordering::Relaxed);
            state
                .stats
                .pending_subscribe_and_gets
                .fetch_add(1, Ordering::Relaxed);
            entry
        };

        let outcome = entry.wait(timeout);
        state
            .stats
            .pending_subscribe_and_gets
            .fetch_sub(1, Ordering::Relaxed);
        state.subscribe_and_gets.release(unique_id);

        match outcome {
            WaitOutcome::Reply(msg) => Ok(msg),
            WaitOutcome::Failed(e) => Err(e),
            WaitOutcome::TimedOut => {
                // Tell the server to forget this one-shot subscription.
                let mut io = state.io.lock();
                let io = &mut *io;
                codec::encode_subscription(
                    &mut io.buffer,
                    RequestId::UnsubscribeAndGet,
                    unique_id,
                    subject,
                    msg_type,
                );
                let _ = io.write_tcp();
                Err(CmsgError::Timeout)
            }
        }
    }

    /// Peer request/response: publishes a request and waits for the one
    /// matching reply, correlated by sender token.
    pub fn send_and_get(&self, msg: &Message, timeout: Option<Duration>) -> CmsgResult<Message> {
        if !self.state.capabilities.lock().has_send_and_get {
            return Err(CmsgError::NotImplemented);
        }
        self.check_publishable(msg)?;
        let state = &self.state;
        let token = registry::next_unique_id();
        let entry = {
            let _read = state.connect_lock.read();
            if !state.connected.load(Ordering::SeqCst) {
                return Err(CmsgError::LostConnection);
            }
            let entry = state
                .send_and_gets
                .claim(token, &msg.subject, &msg.msg_type, false)?;
            let wrote = {
                let mut io = state.io.lock();
                let io = &mut *io;
                codec::encode_send_and_get(&mut io.buffer, msg, token, &state.name);
                io.write_tcp()
            };
            if let Err(e) = wrote {
                state.send_and_gets.release(token);
                return Err(e);
            }
            state.stats.send_and_gets.fetch_add(1, Ordering::Relaxed);
            state
                .stats
                .pending_send_and_gets
                .fetch_add(1, Ordering::Relaxed);
            entry
        };

        let outcome = entry.wait(timeout);
        state
            .stats
            .pending_send_and_gets
            .fetch_sub(1, Ordering::Relaxed);
        state.send_and_gets.release(token);

        match outcome {
            WaitOutcome::Reply(msg) => Ok(msg),
            WaitOutcome::Failed(e) => Err(e),
            WaitOutcome::TimedOut => {
                let mut io = state.io.lock();
                let io = &mut *io;
                codec::encode_un_send_and_get(&mut io.buffer, token);
                let _ = io.write_tcp();
                Err(CmsgError::Timeout)
            }
        }
    }

    /// Asks the server for its monitoring snapshot; the reply's XML comes
    /// back as the message text.
    pub fn monitor(&self, _command: &str) -> CmsgResult<Message> {
        let state = &self.state;
        self.with_failover_retry(false, || {
            let _read = state.connect_lock.read();
            if !state.connected.load(Ordering::SeqCst) {
                return Err(CmsgError::LostConnection);
            }
            let _sync = state.sync_send.lock();
            {
                let mut io = state.io.lock();
                let io = &mut *io;
                codec::encode_bare(&mut io.buffer, RequestId::Monitor);
                io.write_tcp()?;
            }
            let reply_sock = state
                .receive_sock
                .lock()
                .clone()
                .ok_or(CmsgError::LostConnection)?;
            let mut reader = &*reply_sock;
            let (time_ms, xml) = codec::read_monitor_reply(&mut reader)?;
            let mut reply = Message::default();
            reply.sender_time_ms = time_ms;
            reply.text = Some(xml);
            Ok(reply)
        })
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

    pub fn shutdown_clients(&self, client: Option<&str>, flag: u32) -> CmsgResult<()> {
        self.shutdown_peers(RequestId::ShutdownClients, client, flag)
    }

    pub fn shutdown_servers(&self, server: Option<&str>, flag: u32) -> CmsgResult<()> {
        self.shutdown_peers(RequestId::ShutdownServers, server, flag)
    }

    fn shutdown_peers(&self, id: RequestId, target: Option<&str>, flag: u32) -> CmsgResult<()> {
        let state = &self.state;
        if !state.capabilities.lock().has_shutdown {
            return Err(CmsgError::NotImplemented);
        }
        let _write = state.connect_lock.write();
        if !state.connected.load(Ordering::SeqCst) {
            return Err(CmsgError::LostConnection);
        }
        let mut io = state.io.lock();
        let io = &mut *io;
        codec::encode_shutdown(&mut io.buffer, id, target, flag);
        io.write_tcp()
    }

    pub fn flush(&self) -> CmsgResult<()> {
        // All sockets are TCP_NODELAY; writes leave immediately.
        Ok(())
    }

    /// Explicit disconnect: stop the keep-alive supervisor first so it
    /// does not mistake our own teardown for server death.
    pub fn disconnect(&self) {
        let state = &self.state;
        let _write = state.connect_lock.write();
        state.connected.store(false, Ordering::SeqCst);
        state.quit.store(true, Ordering::SeqCst);

        if let Some(ka) = state.keepalive_sock.lock().take() {
            let _ = ka.shutdown(std::net::Shutdown::Both);
        }

        // Best effort: tell the server we are going away.
        {
            let mut io = state.io.lock();
            let io = &mut *io;
            codec::encode_bare(&mut io.buffer, RequestId::ServerDisconnect);
            if io.write_tcp().is_err() {
                tracing::debug!("disconnect notification failed, continuing teardown");
            }
        }

        state.shutdown_server_sockets();
        state.shutdown_handler_sockets();
        state.subscriptions.stop_all();
        state.send_and_gets.wake_all(CmsgError::ServerDied);
        state.subscribe_and_gets.wake_all(CmsgError::ServerDied);

        // Give workers a moment to observe their quit flags.
        std::thread::sleep(Duration::from_millis(100));
        state.restore_sigpipe_once();
        tracing::info!("disconnected from cMsg server");
    }
}
