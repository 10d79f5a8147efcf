//! Domain implementations and the capability dispatch between them.

pub(crate) mod cmsg;
pub(crate) mod file;
pub(crate) mod keepalive;
pub(crate) mod listen;
pub(crate) mod rc;
pub(crate) mod state;

use crate::error::{CmsgError, CmsgResult};
use crate::subscription::{SubscribeConfig, SubscriptionCallback, SubscriptionHandle};
use cmsg_proto::{ids, Message};
use std::net::TcpListener;
use std::sync::Arc;
use std::time::Duration;

/// The full capability surface a domain may implement. Domains return
/// `NotImplemented` for operations they lack.
#[cfg(feature = "dynamic-domains")]
pub trait DynamicDomain: Send + Sync {
    fn send(&self, msg: &Message) -> CmsgResult<()>;
    fn sync_send(&self, msg: &Message, timeout: Option<Duration>) -> CmsgResult<i32>;
    fn flush(&self) -> CmsgResult<()>;
    fn subscribe(
        &self,
        subject: &str,
        msg_type: &str,
        callback: Arc<dyn SubscriptionCallback>,
        config: SubscribeConfig,
    ) -> CmsgResult<SubscriptionHandle>;
    fn unsubscribe(&self, handle: &SubscriptionHandle) -> CmsgResult<()>;
    fn subscribe_and_get(
        &self,
        subject: &str,
        msg_type: &str,
        timeout: Option<Duration>,
    ) -> CmsgResult<Message>;
    fn send_and_get(&self, msg: &Message, timeout: Option<Duration>) -> CmsgResult<Message>;
    fn monitor(&self, command: &str) -> CmsgResult<Message>;
    fn start(&self);
    fn stop(&self);
    fn disconnect(&self);
    fn set_shutdown_handler(&self, handler: Box<dyn Fn() + Send + Sync>);
    fn shutdown_clients(&self, client: Option<&str>, flag: u32) -> CmsgResult<()>;
    fn shutdown_servers(&self, server: Option<&str>, flag: u32) -> CmsgResult<()>;
}

/// A connected domain instance. Statically linked domains are enum
/// variants with inherent implementations; further domains ride behind
/// the `dynamic-domains` feature.
pub(crate) enum DomainClient {
    CMsg(cmsg::CmsgClient),
    Rc(rc::RcClient),
    File(file::FileClient),
    #[cfg(feature = "dynamic-domains")]
    Dynamic(Arc<dyn DynamicDomain>),
}

impl DomainClient {
    pub fn send(&self, msg: &Message) -> CmsgResult<()> {
        match self {
            DomainClient::CMsg(c) => c.send(msg),
            DomainClient::Rc(c) => c.send(msg),
            DomainClient::File(c) => c.send(msg),
            #[cfg(feature = "dynamic-domains")]
            DomainClient::Dynamic(c) => c.send(msg),
        }
    }

    pub fn sync_send(&self, msg: &Message, timeout: Option<Duration>) -> CmsgResult<i32> {
        match self {
            DomainClient::CMsg(c) => c.sync_send(msg, timeout),
            DomainClient::Rc(_) => Err(CmsgError::NotImplemented),
            DomainClient::File(c) => c.sync_send(msg),
            #[cfg(feature = "dynamic-domains")]
            DomainClient::Dynamic(c) => c.sync_send(msg, timeout),
        }
    }

    pub fn flush(&self) -> CmsgResult<()> {
        match self {
            DomainClient::CMsg(c) => c.flush(),
            DomainClient::Rc(c) => c.flush(),
            DomainClient::File(c) => c.flush(),
            #[cfg(feature = "dynamic-domains")]
            DomainClient::Dynamic(c) => c.flush(),
        }
    }

    pub fn subscribe(
        &self,
        subject: &str,
        msg_type: &str,
        callback: Arc<dyn SubscriptionCallback>,
        config: SubscribeConfig,
    ) -> CmsgResult<SubscriptionHandle> {
        match self {
            DomainClient::CMsg(c) => c.subscribe(subject, msg_type, callback, config),
            DomainClient::Rc(c) => c.subscribe(subject, msg_type, callback, config),
            DomainClient::File(_) => Err(CmsgError::NotImplemented),
            #[cfg(feature = "dynamic-domains")]
            DomainClient::Dynamic(c) => c.subscribe(subject, msg_type, callback, config),
        }
    }

    pub fn unsubscribe(&self, handle: &SubscriptionHandle) -> CmsgResult<()> {
        match self {
            DomainClient::CMsg(c) => c.unsubscribe(handle),
            DomainClient::Rc(c) => c.unsubscribe(handle),
            DomainClient::File(_) => Err(CmsgError::NotImplemented),
            #[cfg(feature = "dynamic-domains")]
            DomainClient::Dynamic(c) => c.unsubscribe(handle),
        }
    }

    pub fn subscribe_and_get(
        &self,
        subject: &str,
        msg_type: &str,
        timeout: Option<Duration>,
    ) -> CmsgResult<Message> {
        match self {
            DomainClient::CMsg(c) => c.subscribe_and_get(subject, msg_type, timeout),
            DomainClient::Rc(_) | DomainClient::File(_) => Err(CmsgError::NotImplemented),
            #[cfg(feature = "dynamic-domains")]
            DomainClient::Dynamic(c) => c.subscribe_and_get(subject, msg_type, timeout),
        }
    }

    pub fn send_and_get(&self, msg: &Message, timeout: Option<Duration>) -> CmsgResult<Message> {
        match self {
            DomainClient::CMsg(c) => c.send_and_get(msg, timeout),
            DomainClient::Rc(_) | DomainClient::File(_) => Err(CmsgError::NotImplemented),
            #[cfg(feature = "dynamic-domains")]
            DomainClient::Dynamic(c) => c.send_and_get(msg, timeout),
        }
    }

    pub fn monitor(&self, command: &str) -> CmsgResult<Message> {
        match self {
            DomainClient::CMsg(c) => c.monitor(command),
            DomainClient::Rc(_) | DomainClient::File(_) => Err(CmsgError::NotImplemented),
            #[cfg(feature = "dynamic-domains")]
            DomainClient::Dynamic(c) => c.monitor(command),
        }
    }

    pub fn start(&self) {
        match self {
            DomainClient::CMsg(c) => c.start(),
            DomainClient::Rc(c) => c.start(),
            DomainClient::File(_) => {}
            #[cfg(feature = "dynamic-domains")]
            DomainClient::Dynamic(c) => c.start(),
        }
    }

    pub fn stop(&self) {
        match self {
            DomainClient::CMsg(c) => c.stop(),
            DomainClient::Rc(c) => c.stop(),
            DomainClient::File(_) => {}
            #[cfg(feature = "dynamic-domains")]
            DomainClient::Dynamic(c) => c.stop(),
        }
    }

    pub fn disconnect(&self) {
        match self {
            DomainClient::CMsg(c) => c.disconnect(),
            DomainClient::Rc(c) => c.disconnect(),
            DomainClient::File(c) => c.disconnect(),
            #[cfg(feature = "dynamic-domains")]
            DomainClient::Dynamic(c) => c.disconnect(),
        }
    }

    pub fn set_shutdown_handler(&self, handler: Box<dyn Fn() + Send + Sync>) {
        match self {
            DomainClient::CMsg(c) => c.set_shutdown_handler(handler),
            DomainClient::Rc(c) => c.set_shutdown_handler(handler),
            DomainClient::File(_) => {}
            #[cfg(feature = "dynamic-domains")]
            DomainClient::Dynamic(c) => c.set_shutdown_handler(handler),
        }
    }

    pub fn shutdown_clients(&self, client: Option<&str>, flag: u32) -> CmsgResult<()> {
        match self {
            DomainClient::CMsg(c) => c.shutdown_clients(client, flag),
            DomainClient::Rc(_) | DomainClient::File(_) => Err(CmsgError::NotImplemented),
            #[cfg(feature = "dynamic-domains")]
            DomainClient::Dynamic(c) => c.shutdown_clients(client, flag),
        }
    }

    pub fn shutdown_servers(&self, server: Option<&str>, flag: u32) -> CmsgResult<()> {
        match self {
            DomainClient::CMsg(c) => c.shutdown_servers(server, flag),
            DomainClient::Rc(_) | DomainClient::File(_) => Err(CmsgError::NotImplemented),
            #[cfg(feature = "dynamic-domains")]
            DomainClient::Dynamic(c) => c.shutdown_servers(server, flag),
        }
    }
}

/// Finds a free TCP listening port: start at the environment override (or
/// the given default) and probe upward.
pub(crate) fn bind_listening_socket(
    env_var: &str,
    default_port: u16,
) -> CmsgResult<(TcpListener, u16)> {
    let start = std::env::var(env_var)
        .ok()
        .and_then(|v| v.parse::<u32>().ok())
        .filter(|p| (1025..=65535).contains(p))
        .map(|p| p as u16)
        .unwrap_or(default_port);

    for offset in 0..ids::PORT_SEARCH_RANGE {
        let Some(port) = start.checked_add(offset) else {
            break;
        };
        if let Ok(listener) = TcpListener::bind(("0.0.0.0", port)) {
            tracing::debug!(port, "listening socket bound");
            return Ok((listener, port));
        }
    }
    Err(CmsgError::SocketError)
}
