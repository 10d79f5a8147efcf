//! # cMsg wire protocol
//!
//! Sans-I/O wire types for the cMsg publish/subscribe and peer-to-peer
//! messaging protocol: the message record itself, the request/response id
//! space, and the length-prefixed big-endian frame codec shared by the TCP
//! and UDP transports.
//!
//! ## Framing
//!
//! Every frame begins with a 32-bit big-endian body length (exclusive of
//! itself) followed by a 32-bit message id. The fixed integer body that
//! follows depends on the id; trailing variable-length payloads (UTF-8
//! strings and one opaque byte array) are concatenated without delimiters,
//! their lengths carried in the fixed body. 64-bit millisecond timestamps
//! travel as (high32, low32) pairs.

pub mod codec;
pub mod frame;
pub mod ids;
pub mod message;

pub use codec::{
    Capabilities, DeliveredMessage, MonitorCounts, RcDiscoveryReply, ServerConnectReply,
    ServerConnectRequest,
};
pub use frame::FrameError;
pub use ids::{RequestId, ResponseId};
pub use message::{check_string, ByteArray, Message, MsgInfo, SubscriptionContext};
