//! The message record exchanged between cMsg clients and servers.

use bitflags::bitflags;
use std::sync::atomic::AtomicUsize;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

bitflags! {
    /// Per-message info word carried in every published frame.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct MsgInfo: u32 {
        /// Message is a sendAndGet request.
        const IS_GET_REQUEST = 0x1;
        /// Message is the response to a sendAndGet request.
        const IS_GET_RESPONSE = 0x2;
        /// The response stands in for a null reply.
        const IS_NULL_GET_RESPONSE = 0x4;
        /// The byte-array payload is big-endian (reflects the bytes, not
        /// the host).
        const BIG_ENDIAN_BYTES = 0x8;
    }
}

/// Byte-array payload with explicit ownership, replacing the original's
/// copied-bit plus raw pointer.
#[derive(Debug, Clone, Default)]
pub enum ByteArray {
    #[default]
    None,
    /// The message owns the bytes outright.
    Owned(Vec<u8>),
    /// The message references a window of caller-owned bytes.
    Shared {
        data: Arc<Vec<u8>>,
        offset: usize,
        len: usize,
    },
}

impl ByteArray {
    pub fn len(&self) -> usize {
        match self {
            ByteArray::None => 0,
            ByteArray::Owned(v) => v.len(),
            ByteArray::Shared { len, .. } => *len,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The window of interest.
    pub fn as_slice(&self) -> &[u8] {
        match self {
            ByteArray::None => &[],
            ByteArray::Owned(v) => v,
            ByteArray::Shared { data, offset, len } => &data[*offset..*offset + *len],
        }
    }
}

/// Context stamped onto a message for the duration of a subscription
/// callback: which subscription delivered it and how deep its queue is.
#[derive(Debug, Clone)]
pub struct SubscriptionContext {
    pub domain: String,
    pub subject: String,
    pub msg_type: String,
    pub locator: String,
    /// Live queue-depth counter of the delivering callback.
    pub queued: Arc<AtomicUsize>,
}

/// A cMsg message.
///
/// Created empty by a client, or populated from the wire by the receiving
/// path. Subject and type are required for every send-side operation and
/// must pass [`check_string`].
#[derive(Debug, Clone)]
pub struct Message {
    /// Wire protocol major version.
    pub version: u32,
    /// Server-assigned id used to correlate request/response.
    pub sys_msg_id: i32,
    /// Client-assigned id tracking sendAndGet exchanges.
    pub sender_token: i32,
    pub info: MsgInfo,

    /// Domain the message was received in; set by the receiving path.
    pub domain: Option<String>,
    pub subject: String,
    pub msg_type: String,
    /// Original publisher; assigned at first send and never rewritten.
    pub creator: Option<String>,
    pub sender: Option<String>,
    pub sender_host: Option<String>,
    pub receiver: Option<String>,
    pub receiver_host: Option<String>,

    /// Milliseconds since the Unix epoch.
    pub sender_time_ms: i64,
    pub user_time_ms: i64,
    pub receiver_time_ms: i64,

    pub user_int: i32,
    pub text: Option<String>,
    pub bytes: ByteArray,

    /// Send context: true selects TCP, false a single UDP datagram.
    pub reliable_send: bool,
    /// Populated only while a subscription callback is processing the
    /// message.
    pub context: Option<SubscriptionContext>,
}

impl Default for Message {
    fn default() -> Self {
        Message {
            version: crate::ids::VERSION_MAJOR,
            sys_msg_id: 0,
            sender_token: 0,
            info: MsgInfo::empty(),
            domain: None,
            subject: String::new(),
            msg_type: String::new(),
            creator: None,
            sender: None,
            sender_host: None,
            receiver: None,
            receiver_host: None,
            sender_time_ms: 0,
            user_time_ms: 0,
            receiver_time_ms: 0,
            user_int: 0,
            text: None,
            bytes: ByteArray::None,
            reliable_send: true,
            context: None,
        }
    }
}

impl Message {
    pub fn new(subject: impl Into<String>, msg_type: impl Into<String>) -> Message {
        Message {
            subject: subject.into(),
            msg_type: msg_type.into(),
            ..Message::default()
        }
    }

    pub fn with_text(mut self, text: impl Into<String>) -> Message {
        self.text = Some(text.into());
        self
    }

    pub fn is_get_request(&self) -> bool {
        self.info.contains(MsgInfo::IS_GET_REQUEST)
    }

    pub fn is_get_response(&self) -> bool {
        self.info.contains(MsgInfo::IS_GET_RESPONSE)
    }

    pub fn set_get_response(&mut self, on: bool) {
        self.info.set(MsgInfo::IS_GET_RESPONSE, on);
    }

    /// Whether the byte array travels in big-endian order. Tested as
    /// flag-set, not the original's `> 1` comparison.
    pub fn byte_array_is_big_endian(&self) -> bool {
        self.info.contains(MsgInfo::BIG_ENDIAN_BYTES)
    }

    /// Copies caller bytes into the message (the message owns the copy).
    pub fn copy_byte_array(&mut self, data: &[u8]) {
        self.bytes = ByteArray::Owned(data.to_vec());
    }

    /// Adopts shared bytes without copying; the window must lie inside
    /// the buffer.
    pub fn set_byte_array(&mut self, data: Arc<Vec<u8>>, offset: usize, len: usize) -> bool {
        if offset + len > data.len() {
            return false;
        }
        self.bytes = ByteArray::Shared { data, offset, len };
        true
    }

    /// Builds the response skeleton for answering a sendAndGet request:
    /// same sys-msg-id and sender-token, response bit set.
    pub fn response_to(&self) -> Message {
        let mut resp = Message::default();
        resp.sys_msg_id = self.sys_msg_id;
        resp.sender_token = self.sender_token;
        resp.info = MsgInfo::IS_GET_RESPONSE;
        resp
    }
}

/// Current wall-clock time in milliseconds since the Unix epoch.
pub fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// Validates a subject, type, name, or description string: non-empty,
/// printable, and free of back-tick, single-quote, and double-quote.
pub fn check_string(s: &str) -> bool {
    !s.is_empty()
        && s.chars()
            .all(|c| (c == ' ' || c.is_ascii_graphic()) && !matches!(c, '`' | '\'' | '"'))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn check_string_rejects_quotes_and_empties() {
        assert!(check_string("run/control.status"));
        assert!(check_string("a subject with spaces"));
        assert!(!check_string(""));
        assert!(!check_string("bad`tick"));
        assert!(!check_string("bad'quote"));
        assert!(!check_string("bad\"quote"));
        assert!(!check_string("tab\there"));
    }

    #[test]
    fn response_skeleton_correlates_with_request() {
        let mut req = Message::new("s", "t");
        req.sys_msg_id = 77;
        req.sender_token = 42;
        req.info = MsgInfo::IS_GET_REQUEST;
        let resp = req.response_to();
        assert_eq!(resp.sender_token, 42);
        assert_eq!(resp.sys_msg_id, 77);
        assert!(resp.is_get_response());
        assert!(!resp.is_get_request());
    }

    #[test]
    fn shared_bytes_window_is_bounds_checked() {
        let data = Arc::new(vec![1u8, 2, 3, 4]);
        let mut msg = Message::new("s", "t");
        assert!(msg.set_byte_array(data.clone(), 1, 2));
        assert_eq!(msg.bytes.as_slice(), &[2, 3]);
        assert!(!msg.set_byte_array(data, 3, 2));
    }
}
