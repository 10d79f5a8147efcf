//! In-process stub servers for exercising the client runtime end to end.
//!
//! [`StubServer`] speaks the cMsg server side of the wire protocol: the
//! name-server dialogue, the three client sockets, the two server-to-
//! client connections, keep-alive responses, and delivery injection.
//! [`StubRcServer`] plays the RC broadcast/run-control pair. Every frame
//! the stub reads is surfaced as a [`ServerEvent`] for assertions.

use crate::error::CmsgResult;
use byteorder::{BigEndian, ReadBytesExt};
use cmsg_proto::codec::{self, ServerConnectReply, ServerConnectRequest};
use cmsg_proto::{frame, ids, Capabilities, Message, RequestId, ResponseId};
use crossbeam::channel::{unbounded, Receiver, Sender};
use parking_lot::Mutex;
use std::io::{Cursor, Read, Write};
use std::net::{Shutdown, TcpListener, TcpStream, UdpSocket};
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

/// Everything a stub server observed from the client.
#[derive(Debug)]
pub enum ServerEvent {
    Connect(ServerConnectRequest),
    Send(Message),
    UdpSend(Message),
    SyncSend(Message),
    Subscribe {
        id: i32,
        subject: String,
        msg_type: String,
    },
    Unsubscribe {
        id: i32,
        subject: String,
        msg_type: String,
    },
    SubscribeAndGet {
        id: i32,
        subject: String,
        msg_type: String,
    },
    UnsubscribeAndGet {
        id: i32,
        subject: String,
        msg_type: String,
    },
    SendAndGet(Message),
    UnSendAndGet(i32),
    Monitor,
    KeepAlive,
    ShutdownClients {
        flag: u32,
        target: String,
    },
    ShutdownServers {
        flag: u32,
        target: String,
    },
    Disconnect,
    RcDiscovery {
        client_port: u16,
        name: String,
        expid: String,
    },
    RcSend(Message),
    RcUdpSend(Message),
}

struct StubShared {
    events: Sender<ServerEvent>,
    /// Server-to-client delivery connection, once dialed.
    delivery: Mutex<Option<TcpStream>>,
    /// The client's receive socket; syncSend and monitor replies go here.
    receive_conn: Mutex<Option<TcpStream>>,
    live_socks: Mutex<Vec<TcpStream>>,
    sync_send_reply: AtomicI32,
    killed: AtomicBool,
}

impl StubShared {
    fn track(&self, sock: &TcpStream) {
        if let Ok(clone) = sock.try_clone() {
            self.live_socks.lock().push(clone);
        }
    }
}

/// A stub cMsg name/domain server pair on loopback.
pub struct StubServer {
    name_port: u16,
    shared: Arc<StubShared>,
    events: Receiver<ServerEvent>,
}

impl StubServer {
    /// Starts a stub that grants every capability.
    pub fn start() -> CmsgResult<StubServer> {
        StubServer::start_with(Capabilities::all())
    }

    pub fn start_with(capabilities: Capabilities) -> CmsgResult<StubServer> {
        let name_listener = TcpListener::bind("127.0.0.1:0").map_err(crate::CmsgError::from)?;
        let domain_listener = TcpListener::bind("127.0.0.1:0").map_err(crate::CmsgError::from)?;
        let udp = UdpSocket::bind("127.0.0.1:0").map_err(crate::CmsgError::from)?;
        let name_port = name_listener.local_addr()?.port();
        let domain_port = domain_listener.local_addr()?.port();
        let udp_port = udp.local_addr()?.port();

        let (tx, rx) = unbounded();
        let shared = Arc::new(StubShared {
            events: tx,
            delivery: Mutex::new(None),
            receive_conn: Mutex::new(None),
            live_socks: Mutex::new(Vec::new()),
            sync_send_reply: AtomicI32::new(0),
            killed: AtomicBool::new(false),
        });

        {
            let shared = shared.clone();
            thread::spawn(move || {
                control_loop(
                    name_listener,
                    domain_listener,
                    domain_port,
                    udp_port,
                    capabilities,
                    shared,
                );
            });
        }
        {
            let shared = shared.clone();
            thread::spawn(move || udp_loop(udp, shared));
        }

        Ok(StubServer {
            name_port,
            shared,
            events: rx,
        })
    }

    /// The name server port clients should dial.
    pub fn port(&self) -> u16 {
        self.name_port
    }

    /// A locator for this stub with the given subdomain remainder.
    pub fn locator(&self, sub_remainder: &str) -> String {
        format!("cMsg:cMsg://127.0.0.1:{}/cMsg/{}", self.name_port, sub_remainder)
    }

    /// The next observed event, within `timeout`.
    pub fn next_event(&self, timeout: Duration) -> Option<ServerEvent> {
        self.events.recv_timeout(timeout).ok()
    }

    /// Waits for an event satisfying `pred`, discarding others.
    pub fn wait_for(
        &self,
        timeout: Duration,
        mut pred: impl FnMut(&ServerEvent) -> bool,
    ) -> Option<ServerEvent> {
        let deadline = std::time::Instant::now() + timeout;
        loop {
            let remaining = deadline.checked_duration_since(std::time::Instant::now())?;
            let event = self.events.recv_timeout(remaining).ok()?;
            if pred(&event) {
                return Some(event);
            }
        }
    }

    /// Delivers a message to the client as a subscribe response.
    pub fn deliver(&self, msg: &Message, acknowledge: bool) -> CmsgResult<()> {
        self.deliver_as(ResponseId::SubscribeResponse, msg, acknowledge)
    }

    /// Delivers a sendAndGet reply to the client.
    pub fn deliver_get_response(&self, msg: &Message, acknowledge: bool) -> CmsgResult<()> {
        self.deliver_as(ResponseId::GetResponse, msg, acknowledge)
    }

    fn deliver_as(&self, id: ResponseId, msg: &Message, acknowledge: bool) -> CmsgResult<()> {
        let mut buf = Vec::new();
        codec::encode_delivery(&mut buf, id, msg, acknowledge);
        let mut guard = self.shared.delivery.lock();
        let sock = guard.as_mut().ok_or(crate::CmsgError::LostConnection)?;
        sock.write_all(&buf).map_err(crate::CmsgError::from)?;
        if acknowledge {
            let mut raw = [0u8; 4];
            sock.read_exact(&mut raw).map_err(crate::CmsgError::from)?;
        }
        Ok(())
    }

    /// The status the stub answers syncSends with.
    pub fn set_sync_send_reply(&self, status: i32) {
        self.shared.sync_send_reply.store(status, Ordering::SeqCst);
    }

    /// Simulates server death: every live socket is shut down.
    pub fn kill(&self) {
        self.shared.killed.store(true, Ordering::SeqCst);
        if let Some(sock) = self.shared.delivery.lock().take() {
            let _ = sock.shutdown(Shutdown::Both);
        }
        if let Some(sock) = self.shared.receive_conn.lock().take() {
            let _ = sock.shutdown(Shutdown::Both);
        }
        for sock in self.shared.live_socks.lock().drain(..) {
            let _ = sock.shutdown(Shutdown::Both);
        }
    }
}

fn control_loop(
    name_listener: TcpListener,
    domain_listener: TcpListener,
    domain_port: u16,
    udp_port: u16,
    capabilities: Capabilities,
    shared: Arc<StubShared>,
) {
    // Each (re)connect dials the name server afresh, so keep accepting.
    for conn in name_listener.incoming() {
        if shared.killed.load(Ordering::SeqCst) {
            return;
        }
        let Ok(mut name_conn) = conn else { continue };
        let request = {
            let mut r = &name_conn;
            let Ok((_, id)) = frame::read_header(&mut r) else { continue };
            if id != RequestId::ServerConnect as u32 {
                continue;
            }
            let Ok(req) = codec::read_server_connect(&mut r) else { continue };
            req
        };
        let client_port = request.listening_port;
        let _ = shared.events.send(ServerEvent::Connect(request));

        let mut buf = Vec::new();
        codec::encode_name_server_accept(
            &mut buf,
            &ServerConnectReply {
                capabilities,
                send_port: domain_port,
                udp_port,
                send_host: "127.0.0.1".to_string(),
            },
        );
        if name_conn.write_all(&buf).is_err() {
            continue;
        }
        drop(name_conn);

        // The client now opens receive, keep-alive, and send sockets in
        // that order.
        let Ok((receive_conn, _)) = domain_listener.accept() else { continue };
        let Ok((ka_conn, _)) = domain_listener.accept() else { continue };
        let Ok((send_conn, _)) = domain_listener.accept() else { continue };
        shared.track(&ka_conn);
        shared.track(&send_conn);
        *shared.receive_conn.lock() = Some(receive_conn);

        // And we connect the delivery/keep-alive pair back to it.
        let Ok(delivery) = TcpStream::connect(("127.0.0.1", client_port)) else { continue };
        let Ok(ka_back) = TcpStream::connect(("127.0.0.1", client_port)) else { continue };
        shared.track(&delivery);
        shared.track(&ka_back);
        *shared.delivery.lock() = Some(delivery);

        {
            let shared = shared.clone();
            thread::spawn(move || frame_reader(send_conn, shared));
        }
        {
            let shared = shared.clone();
            thread::spawn(move || keep_alive_responder(ka_conn, shared));
        }
    }
}

/// Parses the client's send-socket traffic into events.
fn frame_reader(sock: TcpStream, shared: Arc<StubShared>) {
    let mut r = &sock;
    loop {
        let Ok((size, id)) = frame::read_header(&mut r) else { return };
        if read_one_frame(&mut r, size, id, &shared, false).is_err() {
            return;
        }
    }
}

fn read_one_frame<R: Read>(
    r: &mut R,
    size: usize,
    id: u32,
    shared: &StubShared,
    from_udp: bool,
) -> CmsgResult<()> {
    let event = match id {
        x if x == RequestId::Send as u32 => {
            let msg = codec::read_publish(r)?;
            if from_udp {
                ServerEvent::UdpSend(msg)
            } else {
                ServerEvent::Send(msg)
            }
        }
        x if x == RequestId::SyncSend as u32 => {
            let msg = codec::read_publish(r)?;
            let status = shared.sync_send_reply.load(Ordering::SeqCst);
            if let Some(conn) = shared.receive_conn.lock().as_mut() {
                let _ = conn.write_all(&status.to_be_bytes());
            }
            ServerEvent::SyncSend(msg)
        }
        x if x == RequestId::Subscribe as u32 => {
            let (id, subject, msg_type) = codec::read_subscription(r)?;
            ServerEvent::Subscribe {
                id,
                subject,
                msg_type,
            }
        }
        x if x == RequestId::Unsubscribe as u32 => {
            let (id, subject, msg_type) = codec::read_subscription(r)?;
            ServerEvent::Unsubscribe {
                id,
                subject,
                msg_type,
            }
        }
        x if x == RequestId::SubscribeAndGet as u32 => {
            let (id, subject, msg_type) = codec::read_subscription(r)?;
            ServerEvent::SubscribeAndGet {
                id,
                subject,
                msg_type,
            }
        }
        x if x == RequestId::UnsubscribeAndGet as u32 => {
            let (id, subject, msg_type) = codec::read_subscription(r)?;
            ServerEvent::UnsubscribeAndGet {
                id,
                subject,
                msg_type,
            }
        }
        x if x == RequestId::SendAndGet as u32 => {
            ServerEvent::SendAndGet(codec::read_send_and_get(r)?)
        }
        x if x == RequestId::UnSendAndGet as u32 => {
            ServerEvent::UnSendAndGet(codec::read_un_send_and_get(r)?)
        }
        x if x == RequestId::Monitor as u32 => {
            let mut reply = Vec::new();
            frame::put_ms(&mut reply, cmsg_proto::message::now_ms());
            let xml = "<stub/>";
            frame::put_u32(&mut reply, xml.len() as u32);
            reply.extend_from_slice(xml.as_bytes());
            if let Some(conn) = shared.receive_conn.lock().as_mut() {
                let _ = conn.write_all(&reply);
            }
            ServerEvent::Monitor
        }
        x if x == RequestId::ServerDisconnect as u32 => ServerEvent::Disconnect,
        x if x == RequestId::ShutdownClients as u32 => {
            let (flag, target) = codec::read_shutdown(r)?;
            ServerEvent::ShutdownClients { flag, target }
        }
        x if x == RequestId::ShutdownServers as u32 => {
            let (flag, target) = codec::read_shutdown(r)?;
            ServerEvent::ShutdownServers { flag, target }
        }
        _ => {
            let mut sink = vec![0u8; size - 4];
            r.read_exact(&mut sink)?;
            return Ok(());
        }
    };
    let _ = shared.events.send(event);
    Ok(())
}

/// Answers the client's keep-alive frames with a minimal report blob.
fn keep_alive_responder(sock: TcpStream, shared: Arc<StubShared>) {
    let mut r = &sock;
    loop {
        let Ok((_, id)) = frame::read_header(&mut r) else { return };
        if id != RequestId::KeepAlive as u32 {
            return;
        }
        let _ = shared.events.send(ServerEvent::KeepAlive);
        let mut reply = Vec::new();
        frame::put_u32(&mut reply, 4);
        frame::put_u32(&mut reply, 0);
        if (&sock).write_all(&reply).is_err() {
            return;
        }
    }
}

fn udp_loop(udp: UdpSocket, shared: Arc<StubShared>) {
    let mut buf = [0u8; 65536];
    while let Ok((n, _)) = udp.recv_from(&mut buf) {
        let mut r = Cursor::new(&buf[..n]);
        let Ok((size, id)) = frame::read_header(&mut r) else { continue };
        let _ = read_one_frame(&mut r, size, id, &shared, true);
    }
}

struct RcShared {
    events: Sender<ServerEvent>,
    /// The TCP connection the stub opened to the client's listening
    /// port; RcConnect messages and deliveries travel here.
    handshake: Mutex<Option<TcpStream>>,
    udp_send_port: u16,
    tcp_send_port: u16,
}

/// A stub RC broadcast/run-control server pair.
pub struct StubRcServer {
    udp_port: u16,
    shared: Arc<RcShared>,
    events: Receiver<ServerEvent>,
}

impl StubRcServer {
    /// Starts the stub. `expid_reply` is the expid echoed in discovery
    /// replies; a client scoped to a different expid must ignore it.
    pub fn start(expid_reply: &str) -> CmsgResult<StubRcServer> {
        let discovery = UdpSocket::bind("127.0.0.1:0").map_err(crate::CmsgError::from)?;
        let send_listener = TcpListener::bind("127.0.0.1:0").map_err(crate::CmsgError::from)?;
        let send_udp = UdpSocket::bind("127.0.0.1:0").map_err(crate::CmsgError::from)?;
        let udp_port = discovery.local_addr()?.port();
        let tcp_send_port = send_listener.local_addr()?.port();
        let udp_send_port = send_udp.local_addr()?.port();

        let (tx, rx) = unbounded();
        let shared = Arc::new(RcShared {
            events: tx,
            handshake: Mutex::new(None),
            udp_send_port,
            tcp_send_port,
        });
        {
            let shared = shared.clone();
            let expid_reply = expid_reply.to_string();
            thread::spawn(move || rc_discovery_loop(discovery, udp_port, expid_reply, shared));
        }
        {
            let shared = shared.clone();
            thread::spawn(move || rc_accept_loop(send_listener, shared));
        }
        {
            let shared = shared.clone();
            thread::spawn(move || rc_udp_loop(send_udp, shared));
        }

        Ok(StubRcServer {
            udp_port,
            shared,
            events: rx,
        })
    }

    /// The UDP discovery port, for building locators.
    pub fn port(&self) -> u16 {
        self.udp_port
    }

    pub fn locator(&self, expid: &str, broadcast_to: u32, connect_to: u32) -> String {
        format!(
            "cMsg:rc://127.0.0.1:{}/?expid={}&broadcastTO={}&connectTO={}",
            self.udp_port, expid, broadcast_to, connect_to
        )
    }

    pub fn next_event(&self, timeout: Duration) -> Option<ServerEvent> {
        self.events.recv_timeout(timeout).ok()
    }

    /// Waits for an event satisfying `pred`, discarding others.
    pub fn wait_for(
        &self,
        timeout: Duration,
        mut pred: impl FnMut(&ServerEvent) -> bool,
    ) -> Option<ServerEvent> {
        let deadline = std::time::Instant::now() + timeout;
        loop {
            let remaining = deadline.checked_duration_since(std::time::Instant::now())?;
            let event = self.events.recv_timeout(remaining).ok()?;
            if pred(&event) {
                return Some(event);
            }
        }
    }

    /// Delivers a message to the client over the handshake connection.
    pub fn deliver(&self, msg: &Message) -> CmsgResult<()> {
        let mut buf = Vec::new();
        codec::encode_delivery(&mut buf, ResponseId::SubscribeResponse, msg, false);
        let mut guard = self.shared.handshake.lock();
        let sock = guard.as_mut().ok_or(crate::CmsgError::LostConnection)?;
        sock.write_all(&buf).map_err(crate::CmsgError::from)
    }

    /// Replays the RcConnect handshake on the live connection, as the
    /// real server does after dying and coming back.
    pub fn resend_rc_connect(&self) -> CmsgResult<()> {
        let mut msg = Message::new("rc", "connect");
        msg.text = Some(format!(
            "{}:{}",
            self.shared.udp_send_port, self.shared.tcp_send_port
        ));
        msg.sender_host = Some("127.0.0.1".to_string());
        let mut buf = Vec::new();
        codec::encode_delivery(&mut buf, ResponseId::RcConnect, &msg, false);
        let mut guard = self.shared.handshake.lock();
        let sock = guard.as_mut().ok_or(crate::CmsgError::LostConnection)?;
        sock.write_all(&buf).map_err(crate::CmsgError::from)?;
        // The client answers with its name again.
        let mut r = &*sock;
        let len = frame::read_len(&mut r)?;
        let mut name = vec![0u8; len];
        r.read_exact(&mut name).map_err(crate::CmsgError::from)?;
        Ok(())
    }
}

fn rc_discovery_loop(
    discovery: UdpSocket,
    udp_port: u16,
    expid_reply: String,
    shared: Arc<RcShared>,
) {
    let mut buf = [0u8; 1024];
    let client_port = loop {
        let Ok((n, peer)) = discovery.recv_from(&mut buf) else { return };
        let mut r = Cursor::new(&buf[..n]);
        let Ok(kind) = r.read_u32::<BigEndian>() else { continue };
        if kind != ids::RC_DOMAIN_BROADCAST {
            continue;
        }
        let Ok(client_port) = r.read_u32::<BigEndian>() else { continue };
        let Ok(name_len) = r.read_u32::<BigEndian>() else { continue };
        let Ok(expid_len) = r.read_u32::<BigEndian>() else { continue };
        let pos = r.position() as usize;
        let rest = &buf[pos..n];
        if rest.len() < (name_len + expid_len) as usize {
            continue;
        }
        let name = String::from_utf8_lossy(&rest[..name_len as usize]).into_owned();
        let expid =
            String::from_utf8_lossy(&rest[name_len as usize..(name_len + expid_len) as usize])
                .into_owned();
        let _ = shared.events.send(ServerEvent::RcDiscovery {
            client_port: client_port as u16,
            name,
            expid,
        });

        let reply = codec::encode_rc_discovery_reply(udp_port, "127.0.0.1", &expid_reply);
        let _ = discovery.send_to(&reply, peer);
        break client_port as u16;
    };

    // Second stage: dial the client's listening port and complete the
    // handshake with an RcConnect message naming our send endpoints.
    thread::sleep(Duration::from_millis(50));
    let Ok(mut handshake) = TcpStream::connect(("127.0.0.1", client_port)) else { return };
    let mut msg = Message::new("rc", "connect");
    msg.text = Some(format!(
        "{}:{}",
        shared.udp_send_port, shared.tcp_send_port
    ));
    msg.sender_host = Some("127.0.0.1".to_string());
    let mut frame_buf = Vec::new();
    codec::encode_delivery(&mut frame_buf, ResponseId::RcConnect, &msg, false);
    if handshake.write_all(&frame_buf).is_err() {
        return;
    }
    // Client identifies itself back.
    let mut r = &handshake;
    let Ok(name_len) = frame::read_len(&mut r) else { return };
    let mut name = vec![0u8; name_len];
    if r.read_exact(&mut name).is_err() {
        return;
    }
    *shared.handshake.lock() = Some(handshake);
}

/// Accepts every TCP send connection the client opens (a fresh one after
/// each reconnect) and parses its publish frames.
fn rc_accept_loop(send_listener: TcpListener, shared: Arc<RcShared>) {
    for conn in send_listener.incoming() {
        let Ok(send_conn) = conn else { return };
        let shared = shared.clone();
        thread::spawn(move || {
            let mut r = &send_conn;
            loop {
                let Ok((_, id)) = frame::read_header(&mut r) else { return };
                if id != ResponseId::SubscribeResponse as u32
                    && id != ResponseId::GetResponse as u32
                {
                    return;
                }
                let Ok(msg) = codec::read_rc_publish(&mut r) else { return };
                let _ = shared.events.send(ServerEvent::RcSend(msg));
            }
        });
    }
}

fn rc_udp_loop(udp: UdpSocket, shared: Arc<RcShared>) {
    let mut buf = [0u8; 65536];
    while let Ok((n, _)) = udp.recv_from(&mut buf) {
        let mut r = Cursor::new(&buf[..n]);
        let Ok((_, id)) = frame::read_header(&mut r) else { continue };
        if id != ResponseId::SubscribeResponse as u32 && id != ResponseId::GetResponse as u32 {
            continue;
        }
        let Ok(msg) = codec::read_rc_publish(&mut r) else { continue };
        let _ = shared.events.send(ServerEvent::RcUdpSend(msg));
    }
}
