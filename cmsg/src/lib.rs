//! # cMsg client runtime
//!
//! A client runtime for the cMsg publish/subscribe and peer-to-peer
//! messaging system. A program opens one or more [`Connection`]s via a
//! textual locator, then publishes messages, subscribes to subject/type
//! patterns, performs request/response exchanges with peers, and monitors
//! or shuts down other clients. Each connection is multiplexed to the
//! domain implementation its locator names: the full `cmsg` domain, the
//! UDP-discovered `rc` (run control) domain, or the `file` sink domain.
//!
//! ```no_run
//! use cmsg::{connect, Message, SubscribeConfig};
//! use std::sync::Arc;
//!
//! let conn = connect(
//!     "cMsg:cMsg://server.site:45000/cMsg/myNamespace",
//!     "myClient",
//!     "an example client",
//! )?;
//! let handle = conn.subscribe(
//!     "run.*",
//!     "status",
//!     Arc::new(|msg: Message| println!("got {:?}", msg.text)),
//!     SubscribeConfig::default(),
//! )?;
//! conn.start()?;
//! conn.send(&Message::new("run.42", "status").with_text("going"))?;
//! conn.unsubscribe(handle)?;
//! conn.disconnect()?;
//! # Ok::<(), cmsg::CmsgError>(())
//! ```

pub mod error;
pub mod locator;
pub mod testing;

mod domain;
mod monitor;
mod pending;
mod registry;
mod subscription;
mod sync;
mod sys;

pub use cmsg_proto::{ByteArray, Message, MsgInfo, SubscriptionContext};
pub use error::{CmsgError, CmsgResult};
pub use subscription::{SubscribeConfig, SubscriptionCallback, SubscriptionHandle};

#[cfg(feature = "dynamic-domains")]
pub use domain::DynamicDomain;
#[cfg(feature = "dynamic-domains")]
pub use registry::{register_domain, DynamicConstructor};

use cmsg_proto::check_string;
use domain::DomainClient;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Shutdown flag: include the calling client/server itself.
pub const SHUTDOWN_INCLUDE_ME: u32 = 1;

/// One open connection to a messaging domain.
///
/// All operations require a live connection; after [`disconnect`] (or a
/// failover that exhausted its locator list) they fail with
/// [`CmsgError::LostConnection`].
///
/// [`disconnect`]: Connection::disconnect
pub struct Connection {
    connected: AtomicBool,
    domain: String,
    client: DomainClient,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("connected", &self.connected.load(Ordering::Relaxed))
            .field("domain", &self.domain)
            .finish_non_exhaustive()
    }
}

/// Connects to the domain named by `locator`.
///
/// The locator may be a semicolon-separated list; every entry must
/// resolve to the same domain, `configFile` entries are expanded (one
/// level), and duplicates are dropped. For the cMsg domain a multi-entry
/// list doubles as the failover list.
pub fn connect(locator: &str, name: &str, description: &str) -> CmsgResult<Connection> {
    if !check_string(name) || !check_string(description) {
        return Err(CmsgError::BadArgument);
    }
    let resolved = locator::resolve(locator)?;
    let client = match registry::lookup(&resolved.domain)? {
        registry::Resolver::Builtin(constructor) => constructor(&resolved, name, description)?,
        #[cfg(feature = "dynamic-domains")]
        registry::Resolver::Dynamic(constructor) => {
            DomainClient::Dynamic(constructor(&resolved, name, description)?)
        }
    };
    Ok(Connection {
        connected: AtomicBool::new(true),
        domain: resolved.domain,
        client,
    })
}

impl Connection {
    /// The domain this connection was multiplexed to.
    pub fn domain(&self) -> &str {
        &self.domain
    }

    fn check_connected(&self) -> CmsgResult<()> {
        if self.connected.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(CmsgError::LostConnection)
        }
    }

    /// Publishes a message. TCP by default; a message with
    /// `reliable_send == false` goes out as a single UDP datagram.
    pub fn send(&self, msg: &Message) -> CmsgResult<()> {
        self.check_connected()?;
        self.client.send(msg)
    }

    /// Publishes a message and waits for the server's status reply.
    pub fn sync_send(&self, msg: &Message, timeout: Option<Duration>) -> CmsgResult<i32> {
        self.check_connected()?;
        self.client.sync_send(msg, timeout)
    }

    /// Pushes out any pending communication. A no-op in the socket
    /// domains, whose writes leave immediately.
    pub fn flush(&self, _timeout: Option<Duration>) -> CmsgResult<()> {
        self.check_connected()?;
        self.client.flush()
    }

    /// Subscribes `callback` to messages matching the subject and type
    /// patterns. At most one subscription per (subject, type, callback
    /// instance) tuple may exist.
    pub fn subscribe(
        &self,
        subject: &str,
        msg_type: &str,
        callback: Arc<dyn SubscriptionCallback>,
        config: SubscribeConfig,
    ) -> CmsgResult<SubscriptionHandle> {
        self.check_connected()?;
        self.client.subscribe(subject, msg_type, callback, config)
    }

    /// Removes the subscription `handle` refers to.
    pub fn unsubscribe(&self, handle: SubscriptionHandle) -> CmsgResult<()> {
        self.check_connected()?;
        self.client.unsubscribe(&handle)
    }

    /// One-shot subscription: returns the first matching message, then
    /// unregisters. `None` waits forever.
    pub fn subscribe_and_get(
        &self,
        subject: &str,
        msg_type: &str,
        timeout: Option<Duration>,
    ) -> CmsgResult<Message> {
        self.check_connected()?;
        self.client.subscribe_and_get(subject, msg_type, timeout)
    }

    /// Peer request/response: publishes `msg` marked as a request and
    /// waits for the single matching response.
    pub fn send_and_get(&self, msg: &Message, timeout: Option<Duration>) -> CmsgResult<Message> {
        self.check_connected()?;
        self.client.send_and_get(msg, timeout)
    }

    /// Fetches the server's monitoring snapshot; its XML arrives as the
    /// returned message's text.
    pub fn monitor(&self, command: &str) -> CmsgResult<Message> {
        self.check_connected()?;
        self.client.monitor(command)
    }

    /// Enables delivery of received messages to callbacks. Delivery is
    /// disabled when a connection is first made.
    pub fn start(&self) -> CmsgResult<()> {
        self.check_connected()?;
        self.client.start();
        Ok(())
    }

    /// Disables delivery of received messages to callbacks.
    pub fn stop(&self) -> CmsgResult<()> {
        self.check_connected()?;
        self.client.stop();
        Ok(())
    }

    /// Installs the handler run when a server orders this client to shut
    /// down. The default handler exits the process.
    pub fn set_shutdown_handler(
        &self,
        handler: Box<dyn Fn() + Send + Sync>,
    ) -> CmsgResult<()> {
        self.check_connected()?;
        self.client.set_shutdown_handler(handler);
        Ok(())
    }

    /// Asks the server to shut down the clients matching `client`
    /// (all of them when `None`).
    pub fn shutdown_clients(&self, client: Option<&str>, flag: u32) -> CmsgResult<()> {
        self.check_connected()?;
        self.client.shutdown_clients(client, flag)
    }

    /// Asks the server to shut down the servers matching `server`.
    pub fn shutdown_servers(&self, server: Option<&str>, flag: u32) -> CmsgResult<()> {
        self.check_connected()?;
        self.client.shutdown_servers(server, flag)
    }

    /// Closes the connection. Concurrent calls short-circuit: the flag
    /// flips before any teardown begins.
    pub fn disconnect(&self) -> CmsgResult<()> {
        if self.connected.swap(false, Ordering::SeqCst) {
            self.client.disconnect();
            Ok(())
        } else {
            Err(CmsgError::LostConnection)
        }
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        if self.connected.swap(false, Ordering::SeqCst) {
            self.client.disconnect();
        }
    }
}
