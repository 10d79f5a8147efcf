//! Protocol identifiers and constants.

/// Wire protocol major version, sent in every server-connect frame.
pub const VERSION_MAJOR: u32 = 1;
/// Wire protocol minor version.
pub const VERSION_MINOR: u32 = 0;

/// Magic value opening a cMsg-domain discovery datagram and its reply.
pub const CMSG_DISCOVERY_MAGIC: u32 = 0xc0da1;
/// Magic value opening an RC-domain discovery reply.
pub const RC_DISCOVERY_MAGIC: u32 = 0xc0da;

/// Discovery kind sent when looking for a cMsg name server.
pub const CMSG_DOMAIN_BROADCAST: u32 = 1;
/// Discovery kind sent when looking for an RC broadcast server.
pub const RC_DOMAIN_BROADCAST: u32 = 2;

/// Starting port for the cMsg client's TCP listening socket.
pub const CLIENT_LISTENING_PORT: u16 = 2345;
/// Default TCP port of a cMsg name server.
pub const NAME_SERVER_PORT: u16 = 3456;
/// UDP port a cMsg name server watches for discovery broadcasts.
pub const NAME_SERVER_BROADCAST_PORT: u16 = 7654;
/// Starting port for the RC client's TCP listening socket.
pub const RC_CLIENT_LISTENING_PORT: u16 = 6543;
/// UDP port an RC broadcast server listens on.
pub const RC_BROADCAST_PORT: u16 = 6543;

/// Number of ports probed past the starting port when binding a listener.
pub const PORT_SEARCH_RANGE: u16 = 500;

/// Largest complete frame accepted for a UDP send in the cMsg domain.
pub const MAX_UDP_FRAME: usize = 8192;
/// Largest single UDP datagram the RC domain will emit
/// (2^16 minus IP and UDP headers).
pub const BIGGEST_UDP_PACKET: usize = 65463;
/// Send/receive buffer size requested for the bulk-transfer sockets.
pub const BIG_SOCK_BUF_SIZE: usize = 131072;

/// Commands sent from client to server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum RequestId {
    /// Connect client to name server.
    ServerConnect = 0,
    /// Disconnect client from the domain server.
    ServerDisconnect = 1,
    /// Tell me if you are alive.
    KeepAlive = 2,
    /// Shut down matching clients.
    ShutdownClients = 3,
    /// Shut down matching servers.
    ShutdownServers = 4,
    /// Publish a message.
    Send = 5,
    /// Publish a message and wait for a status reply.
    SyncSend = 6,
    /// Register a subscription.
    Subscribe = 7,
    /// Remove a subscription.
    Unsubscribe = 8,
    /// One-shot subscription.
    SubscribeAndGet = 9,
    /// Cancel a one-shot subscription after a timeout.
    UnsubscribeAndGet = 10,
    /// Peer request expecting a single matching response.
    SendAndGet = 11,
    /// Cancel a peer request after a timeout.
    UnSendAndGet = 12,
    /// Ask for the server's monitoring snapshot.
    Monitor = 13,
}

impl RequestId {
    pub fn from_u32(v: u32) -> Option<RequestId> {
        use RequestId::*;
        Some(match v {
            0 => ServerConnect,
            1 => ServerDisconnect,
            2 => KeepAlive,
            3 => ShutdownClients,
            4 => ShutdownServers,
            5 => Send,
            6 => SyncSend,
            7 => Subscribe,
            8 => Unsubscribe,
            9 => SubscribeAndGet,
            10 => UnsubscribeAndGet,
            11 => SendAndGet,
            12 => UnSendAndGet,
            13 => Monitor,
            _ => return None,
        })
    }
}

/// Responses sent from server to client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum ResponseId {
    /// Reply to a sendAndGet.
    GetResponse = 20,
    /// Delivery for a matching subscription.
    SubscribeResponse = 21,
    /// Reply to a server's own sendAndGet.
    ServerGetResponse = 22,
    /// RC server's TCP connect handshake.
    RcConnect = 23,
    /// RC broadcast server aborting an RC client's connect.
    RcConnectAbort = 24,
}

impl ResponseId {
    pub fn from_u32(v: u32) -> Option<ResponseId> {
        use ResponseId::*;
        Some(match v {
            20 => GetResponse,
            21 => SubscribeResponse,
            22 => ServerGetResponse,
            23 => RcConnect,
            24 => RcConnectAbort,
            _ => return None,
        })
    }
}
