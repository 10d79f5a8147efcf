//! Shared connection state for the socket-based domains.
//!
//! One struct serves both the cMsg and RC domains, exactly as their
//! operations overlap: the RC client leaves the failover fields idle and
//! the cMsg client leaves the RC handshake fields idle.
//!
//! Lock regions, in nesting order: `connect_lock` (readers: all
//! operations; writer: connect, disconnect, failover), then the
//! subscription table lock, then `io` (send sockets plus the reusable
//! send buffer). `sync_send` serializes request/reply pairs on the
//! receive socket and is taken before `io`.

use crate::error::{CmsgError, CmsgResult};
use crate::locator::CmsgDomainLocator;
use crate::monitor::MonitorStats;
use crate::pending::{PendingTable, MAX_SEND_AND_GET, MAX_SUBSCRIBE_AND_GET};
use crate::subscription::SubscriptionTable;
use crate::sync::CountDownLatch;
use cmsg_proto::Capabilities;
use parking_lot::{Mutex, RwLock};
use std::io::Write;
use std::net::{Shutdown, TcpListener, TcpStream, UdpSocket};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;

/// Initial size of the reusable send buffer for the cMsg domain.
pub const INITIAL_SEND_BUFFER: usize = 15_000;
/// Initial size of the reusable send buffer for the RC domain.
pub const INITIAL_RC_SEND_BUFFER: usize = 1_500;

pub(crate) type ShutdownHandler = Box<dyn Fn() + Send + Sync>;

/// Send-side sockets and the reusable frame buffer, all guarded by one
/// mutex so writes are serialized and the buffer never races.
pub(crate) struct SendIo {
    pub buffer: Vec<u8>,
    pub tcp: Option<Arc<TcpStream>>,
    pub udp: Option<UdpSocket>,
}

impl SendIo {
    pub fn write_tcp(&mut self) -> CmsgResult<()> {
        let sock = self.tcp.as_ref().ok_or(CmsgError::LostConnection)?;
        (&**sock).write_all(&self.buffer)?;
        Ok(())
    }

    pub fn write_udp(&mut self) -> CmsgResult<()> {
        let sock = self.udp.as_ref().ok_or(CmsgError::LostConnection)?;
        let sent = sock.send(&self.buffer)?;
        if sent != self.buffer.len() {
            return Err(CmsgError::NetworkError);
        }
        Ok(())
    }
}

/// Everything one domain connection owns.
pub(crate) struct DomainState {
    /// Domain label stamped into delivered messages.
    pub kind: &'static str,
    pub name: String,
    pub description: String,
    /// Canonical (reconstructed) locator list.
    pub locator: String,
    pub my_host: String,

    /// Readers: every ordinary operation. Writer: connect teardown and
    /// failover, so nothing is mid-flight while sockets are replaced.
    pub connect_lock: RwLock<()>,
    pub connected: AtomicBool,
    /// Messages are delivered to callbacks only while true.
    pub receive_state: AtomicBool,
    /// Aborts producers blocked on full queues during failover teardown.
    pub kill_receiver: AtomicBool,
    /// Tells the listening and keep-alive threads to exit.
    pub quit: AtomicBool,
    sigpipe_restored: AtomicBool,

    pub listen_port: u16,
    pub listener: TcpListener,
    /// Sockets of live server-to-client handler threads, retained so
    /// failover and disconnect can unblock their reads.
    pub handler_socks: Mutex<Vec<Arc<TcpStream>>>,

    pub io: Mutex<SendIo>,
    pub receive_sock: Mutex<Option<Arc<TcpStream>>>,
    pub keepalive_sock: Mutex<Option<Arc<TcpStream>>>,
    /// Serializes request/reply exchanges on the receive socket.
    pub sync_send: Mutex<()>,

    pub subscriptions: Arc<SubscriptionTable>,
    pub subscribe_and_gets: PendingTable,
    pub send_and_gets: PendingTable,
    pub stats: MonitorStats,
    pub shutdown_handler: Mutex<Option<ShutdownHandler>>,
    /// Most recent monitoring blob read back by the keep-alive thread.
    /// The server owns the format; it is stored unparsed.
    pub latest_server_report: Mutex<Vec<u8>>,

    // Failover (cMsg domain).
    pub failovers: Mutex<Vec<CmsgDomainLocator>>,
    pub failover_index: AtomicUsize,
    pub implement_failovers: AtomicBool,
    pub resubscribe_complete: AtomicBool,
    pub capabilities: Mutex<Capabilities>,
    /// Synchronizes failover (and the RC connect handshake) with blocked
    /// operations.
    pub sync_latch: CountDownLatch,

    // RC handshake and reconnection.
    pub rc_connect_complete: AtomicBool,
    pub rc_connect_abort: AtomicBool,
    pub send_host: Mutex<String>,
    pub send_port: AtomicU32,
    pub send_udp_port: AtomicU32,
}

impl DomainState {
    pub fn new(
        kind: &'static str,
        name: &str,
        description: &str,
        locator: &str,
        listener: TcpListener,
        listen_port: u16,
        send_buffer: usize,
    ) -> Arc<DomainState> {
        Arc::new(DomainState {
            kind,
            name: name.to_string(),
            description: description.to_string(),
            locator: locator.to_string(),
            my_host: crate::sys::local_host_name(),
            connect_lock: RwLock::new(()),
            connected: AtomicBool::new(false),
            receive_state: AtomicBool::new(false),
            kill_receiver: AtomicBool::new(false),
            quit: AtomicBool::new(false),
            sigpipe_restored: AtomicBool::new(false),
            listen_port,
            listener,
            handler_socks: Mutex::new(Vec::new()),
            io: Mutex::new(SendIo {
                buffer: Vec::with_capacity(send_buffer),
                tcp: None,
                udp: None,
            }),
            receive_sock: Mutex::new(None),
            keepalive_sock: Mutex::new(None),
            sync_send: Mutex::new(()),
            subscriptions: SubscriptionTable::new(),
            subscribe_and_gets: PendingTable::new(MAX_SUBSCRIBE_AND_GET),
            send_and_gets: PendingTable::new(MAX_SEND_AND_GET),
            stats: MonitorStats::default(),
            shutdown_handler: Mutex::new(None),
            latest_server_report: Mutex::new(Vec::new()),
            failovers: Mutex::new(Vec::new()),
            failover_index: AtomicUsize::new(0),
            implement_failovers: AtomicBool::new(false),
            resubscribe_complete: AtomicBool::new(false),
            capabilities: Mutex::new(Capabilities::all()),
            sync_latch: CountDownLatch::new(1),
            rc_connect_complete: AtomicBool::new(false),
            rc_connect_abort: AtomicBool::new(false),
            send_host: Mutex::new(String::new()),
            send_port: AtomicU32::new(0),
            send_udp_port: AtomicU32::new(0),
        })
    }

    /// Closes the three server-facing sockets so any thread blocked on
    /// them unblocks with an error.
    pub fn shutdown_server_sockets(&self) {
        if let Some(sock) = self.receive_sock.lock().take() {
            let _ = sock.shutdown(Shutdown::Both);
        }
        if let Some(sock) = self.keepalive_sock.lock().take() {
            let _ = sock.shutdown(Shutdown::Both);
        }
        let mut io = self.io.lock();
        if let Some(sock) = io.tcp.take() {
            let _ = sock.shutdown(Shutdown::Both);
        }
        io.udp = None;
    }

    /// Unblocks and forgets every server-to-client handler thread.
    pub fn shutdown_handler_sockets(&self) {
        for sock in self.handler_socks.lock().drain(..) {
            let _ = sock.shutdown(Shutdown::Both);
        }
    }

    /// Runs the registered shutdown handler, if any.
    pub fn run_shutdown_handler(&self) {
        if let Some(handler) = self.shutdown_handler.lock().as_ref() {
            handler();
        }
    }

    /// Restores the SIGPIPE mask exactly once per connection, whether the
    /// teardown came from disconnect or from the keep-alive thread.
    pub fn restore_sigpipe_once(&self) {
        if !self.sigpipe_restored.swap(true, Ordering::SeqCst) {
            crate::sys::restore_sigpipe();
        }
    }

    pub fn send_port(&self) -> u16 {
        self.send_port.load(Ordering::SeqCst) as u16
    }

    pub fn send_udp_port(&self) -> u16 {
        self.send_udp_port.load(Ordering::SeqCst) as u16
    }
}
