//! Frame encoders and decoders for every message the client runtime
//! exchanges with cMsg and RC servers.
//!
//! Encoders append a complete frame (leading body-length word included) to
//! a caller-supplied buffer so send paths can reuse one growable buffer per
//! connection. Decoders assume the caller has already consumed the frame
//! header via [`frame::read_header`] and read the remaining body from the
//! stream.

use crate::frame::{self, FrameError};
use crate::ids::{self, RequestId, ResponseId};
use crate::message::{now_ms, ByteArray, Message, MsgInfo};
use byteorder::{BigEndian, ReadBytesExt};
use std::io::Read;

/// Subdomain handler capabilities, sent by the name server as seven bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capabilities {
    pub has_send: bool,
    pub has_sync_send: bool,
    pub has_subscribe_and_get: bool,
    pub has_send_and_get: bool,
    pub has_subscribe: bool,
    pub has_unsubscribe: bool,
    pub has_shutdown: bool,
}

impl Capabilities {
    pub fn all() -> Capabilities {
        Capabilities::from_mask([1; 7])
    }

    pub fn from_mask(mask: [u8; 7]) -> Capabilities {
        Capabilities {
            has_send: mask[0] == 1,
            has_sync_send: mask[1] == 1,
            has_subscribe_and_get: mask[2] == 1,
            has_send_and_get: mask[3] == 1,
            has_subscribe: mask[4] == 1,
            has_unsubscribe: mask[5] == 1,
            has_shutdown: mask[6] == 1,
        }
    }

    pub fn to_mask(self) -> [u8; 7] {
        [
            self.has_send as u8,
            self.has_sync_send as u8,
            self.has_subscribe_and_get as u8,
            self.has_send_and_get as u8,
            self.has_subscribe as u8,
            self.has_unsubscribe as u8,
            self.has_shutdown as u8,
        ]
    }
}

/// Body of the server-connect dialogue with a name server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConnectRequest {
    pub version_major: u32,
    pub version_minor: u32,
    pub listening_port: u16,
    pub password: Option<String>,
    pub domain: String,
    pub subdomain: String,
    pub sub_remainder: String,
    pub host: String,
    pub name: String,
    pub locator: String,
    pub description: String,
}

/// Successful name-server reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConnectReply {
    pub capabilities: Capabilities,
    pub send_port: u16,
    pub udp_port: u16,
    pub send_host: String,
}

/// Name-server verdict on a connect attempt.
#[derive(Debug, Clone)]
pub enum NameServerVerdict {
    Accepted(ServerConnectReply),
    Refused { code: u32, message: String },
}

/// A message delivered by the server together with its acknowledge flag.
#[derive(Debug, Clone)]
pub struct DeliveredMessage {
    pub message: Message,
    pub acknowledge: bool,
}

/// Counter block embedded in the monitoring report.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MonitorCounts {
    pub pending_subscribe_and_gets: u32,
    pub pending_send_and_gets: u32,
    pub tcp_sends: u64,
    pub udp_sends: u64,
    pub sync_sends: u64,
    pub send_and_gets: u64,
    pub subscribe_and_gets: u64,
    pub subscribes: u64,
    pub unsubscribes: u64,
}

/// Validated reply to an RC discovery broadcast.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RcDiscoveryReply {
    pub port: u16,
    pub host: String,
    pub expid: Option<String>,
}

fn opt_len(s: &Option<String>) -> usize {
    s.as_deref().map_or(0, str::len)
}

fn put_opt(buf: &mut Vec<u8>, s: &Option<String>) {
    if let Some(s) = s {
        buf.extend_from_slice(s.as_bytes());
    }
}

/// Encodes a published message (`Send` or `SyncSend`).
///
/// `creator` is the name substituted when the message has never been sent
/// before; the sender time is stamped here.
pub fn encode_publish(buf: &mut Vec<u8>, id: RequestId, msg: &Message, creator: &str) {
    let creator = msg.creator.as_deref().unwrap_or(creator);
    buf.clear();
    frame::put_u32(buf, 0);
    frame::put_u32(buf, id as u32);
    frame::put_u32(buf, 0); // reserved
    frame::put_i32(buf, msg.user_int);
    frame::put_i32(buf, msg.sys_msg_id);
    frame::put_i32(buf, msg.sender_token);
    frame::put_u32(buf, msg.info.bits());
    frame::put_ms(buf, now_ms());
    frame::put_ms(buf, msg.user_time_ms);
    frame::put_u32(buf, msg.subject.len() as u32);
    frame::put_u32(buf, msg.msg_type.len() as u32);
    frame::put_u32(buf, creator.len() as u32);
    frame::put_u32(buf, opt_len(&msg.text) as u32);
    frame::put_u32(buf, msg.bytes.len() as u32);
    buf.extend_from_slice(msg.subject.as_bytes());
    buf.extend_from_slice(msg.msg_type.as_bytes());
    buf.extend_from_slice(creator.as_bytes());
    put_opt(buf, &msg.text);
    buf.extend_from_slice(msg.bytes.as_slice());
    frame::patch_len(buf);
}

/// Decodes a published message (server side of `Send`/`SyncSend`).
pub fn read_publish<R: Read>(r: &mut R) -> Result<Message, FrameError> {
    let mut msg = Message::default();
    let _reserved = r.read_u32::<BigEndian>()?;
    msg.user_int = r.read_i32::<BigEndian>()?;
    msg.sys_msg_id = r.read_i32::<BigEndian>()?;
    msg.sender_token = r.read_i32::<BigEndian>()?;
    msg.info = MsgInfo::from_bits_retain(r.read_u32::<BigEndian>()?);
    msg.sender_time_ms = frame::read_ms(r)?;
    msg.user_time_ms = frame::read_ms(r)?;
    let len_subject = frame::read_len(r)?;
    let len_type = frame::read_len(r)?;
    let len_creator = frame::read_len(r)?;
    let len_text = frame::read_len(r)?;
    let len_bytes = frame::read_len(r)?;
    msg.subject = frame::read_string(r, len_subject)?;
    msg.msg_type = frame::read_string(r, len_type)?;
    let creator = frame::read_string(r, len_creator)?;
    msg.creator = (!creator.is_empty()).then_some(creator);
    let text = frame::read_string(r, len_text)?;
    msg.text = (len_text > 0).then_some(text);
    if len_bytes > 0 {
        let mut bytes = vec![0u8; len_bytes];
        r.read_exact(&mut bytes)?;
        msg.bytes = ByteArray::Owned(bytes);
    }
    Ok(msg)
}

/// Encodes a sendAndGet request. The claimed unique id rides as the
/// sender token and the request bit is forced on.
pub fn encode_send_and_get(buf: &mut Vec<u8>, msg: &Message, token: i32, creator: &str) {
    let creator = msg.creator.as_deref().unwrap_or(creator);
    buf.clear();
    frame::put_u32(buf, 0);
    frame::put_u32(buf, RequestId::SendAndGet as u32);
    frame::put_u32(buf, 0); // reserved
    frame::put_i32(buf, msg.user_int);
    frame::put_i32(buf, token);
    frame::put_u32(buf, (msg.info | MsgInfo::IS_GET_REQUEST).bits());
    frame::put_ms(buf, now_ms());
    frame::put_ms(buf, msg.user_time_ms);
    frame::put_u32(buf, msg.subject.len() as u32);
    frame::put_u32(buf, msg.msg_type.len() as u32);
    frame::put_u32(buf, 0); // namespace, server-to-server only
    frame::put_u32(buf, creator.len() as u32);
    frame::put_u32(buf, opt_len(&msg.text) as u32);
    frame::put_u32(buf, msg.bytes.len() as u32);
    buf.extend_from_slice(msg.subject.as_bytes());
    buf.extend_from_slice(msg.msg_type.as_bytes());
    buf.extend_from_slice(creator.as_bytes());
    put_opt(buf, &msg.text);
    buf.extend_from_slice(msg.bytes.as_slice());
    frame::patch_len(buf);
}

/// Decodes a sendAndGet request (server side).
pub fn read_send_and_get<R: Read>(r: &mut R) -> Result<Message, FrameError> {
    let mut msg = Message::default();
    let _reserved = r.read_u32::<BigEndian>()?;
    msg.user_int = r.read_i32::<BigEndian>()?;
    msg.sender_token = r.read_i32::<BigEndian>()?;
    msg.info = MsgInfo::from_bits_retain(r.read_u32::<BigEndian>()?);
    msg.sender_time_ms = frame::read_ms(r)?;
    msg.user_time_ms = frame::read_ms(r)?;
    let len_subject = frame::read_len(r)?;
    let len_type = frame::read_len(r)?;
    let len_namespace = frame::read_len(r)?;
    let len_creator = frame::read_len(r)?;
    let len_text = frame::read_len(r)?;
    let len_bytes = frame::read_len(r)?;
    msg.subject = frame::read_string(r, len_subject)?;
    msg.msg_type = frame::read_string(r, len_type)?;
    let _namespace = frame::read_string(r, len_namespace)?;
    let creator = frame::read_string(r, len_creator)?;
    msg.creator = (!creator.is_empty()).then_some(creator);
    let text = frame::read_string(r, len_text)?;
    msg.text = (len_text > 0).then_some(text);
    if len_bytes > 0 {
        let mut bytes = vec![0u8; len_bytes];
        r.read_exact(&mut bytes)?;
        msg.bytes = ByteArray::Owned(bytes);
    }
    Ok(msg)
}

/// Encodes a subscription-shaped frame: `Subscribe`, `Unsubscribe`,
/// `SubscribeAndGet`, or `UnsubscribeAndGet`.
pub fn encode_subscription(
    buf: &mut Vec<u8>,
    id: RequestId,
    unique_id: i32,
    subject: &str,
    msg_type: &str,
) {
    buf.clear();
    frame::put_u32(buf, 0);
    frame::put_u32(buf, id as u32);
    frame::put_i32(buf, unique_id);
    frame::put_u32(buf, subject.len() as u32);
    frame::put_u32(buf, msg_type.len() as u32);
    frame::put_u32(buf, 0); // namespace, server-to-server only
    buf.extend_from_slice(subject.as_bytes());
    buf.extend_from_slice(msg_type.as_bytes());
    frame::patch_len(buf);
}

/// Decodes a subscription-shaped frame body (server side).
pub fn read_subscription<R: Read>(r: &mut R) -> Result<(i32, String, String), FrameError> {
    let unique_id = r.read_i32::<BigEndian>()?;
    let len_subject = frame::read_len(r)?;
    let len_type = frame::read_len(r)?;
    let _len_namespace = frame::read_len(r)?;
    let subject = frame::read_string(r, len_subject)?;
    let msg_type = frame::read_string(r, len_type)?;
    Ok((unique_id, subject, msg_type))
}

/// Encodes the forget-frame for a timed-out sendAndGet.
pub fn encode_un_send_and_get(buf: &mut Vec<u8>, token: i32) {
    buf.clear();
    frame::put_u32(buf, 0);
    frame::put_u32(buf, RequestId::UnSendAndGet as u32);
    frame::put_i32(buf, token);
    frame::patch_len(buf);
}

/// Decodes the forget-frame body (server side).
pub fn read_un_send_and_get<R: Read>(r: &mut R) -> Result<i32, FrameError> {
    Ok(r.read_i32::<BigEndian>()?)
}

/// Encodes a frame whose body is the id alone (`ServerDisconnect`,
/// `KeepAlive`, `Monitor`).
pub fn encode_bare(buf: &mut Vec<u8>, id: RequestId) {
    buf.clear();
    frame::put_u32(buf, 4);
    frame::put_u32(buf, id as u32);
}

/// Encodes a shutdown request for matching clients or servers.
pub fn encode_shutdown(buf: &mut Vec<u8>, id: RequestId, target: Option<&str>, flag: u32) {
    buf.clear();
    frame::put_u32(buf, 0);
    frame::put_u32(buf, id as u32);
    frame::put_u32(buf, flag);
    let target = target.unwrap_or("");
    frame::put_u32(buf, target.len() as u32);
    buf.extend_from_slice(target.as_bytes());
    frame::patch_len(buf);
}

/// Decodes a shutdown request body (server side).
pub fn read_shutdown<R: Read>(r: &mut R) -> Result<(u32, String), FrameError> {
    let flag = r.read_u32::<BigEndian>()?;
    let len = frame::read_len(r)?;
    let target = frame::read_string(r, len)?;
    Ok((flag, target))
}

/// Encodes the server-connect dialogue opener.
pub fn encode_server_connect(buf: &mut Vec<u8>, req: &ServerConnectRequest) {
    buf.clear();
    frame::put_u32(buf, 0);
    frame::put_u32(buf, RequestId::ServerConnect as u32);
    frame::put_u32(buf, req.version_major);
    frame::put_u32(buf, req.version_minor);
    frame::put_u32(buf, req.listening_port as u32);
    frame::put_u32(buf, opt_len(&req.password) as u32);
    frame::put_u32(buf, req.domain.len() as u32);
    frame::put_u32(buf, req.subdomain.len() as u32);
    frame::put_u32(buf, req.sub_remainder.len() as u32);
    frame::put_u32(buf, req.host.len() as u32);
    frame::put_u32(buf, req.name.len() as u32);
    frame::put_u32(buf, req.locator.len() as u32);
    frame::put_u32(buf, req.description.len() as u32);
    put_opt(buf, &req.password);
    buf.extend_from_slice(req.domain.as_bytes());
    buf.extend_from_slice(req.subdomain.as_bytes());
    buf.extend_from_slice(req.sub_remainder.as_bytes());
    buf.extend_from_slice(req.host.as_bytes());
    buf.extend_from_slice(req.name.as_bytes());
    buf.extend_from_slice(req.locator.as_bytes());
    buf.extend_from_slice(req.description.as_bytes());
    frame::patch_len(buf);
}

/// Decodes the server-connect dialogue opener (name-server side).
pub fn read_server_connect<R: Read>(r: &mut R) -> Result<ServerConnectRequest, FrameError> {
    let version_major = r.read_u32::<BigEndian>()?;
    let version_minor = r.read_u32::<BigEndian>()?;
    let listening_port = r.read_u32::<BigEndian>()? as u16;
    let len_password = frame::read_len(r)?;
    let len_domain = frame::read_len(r)?;
    let len_subdomain = frame::read_len(r)?;
    let len_remainder = frame::read_len(r)?;
    let len_host = frame::read_len(r)?;
    let len_name = frame::read_len(r)?;
    let len_locator = frame::read_len(r)?;
    let len_description = frame::read_len(r)?;
    let password = frame::read_string(r, len_password)?;
    Ok(ServerConnectRequest {
        version_major,
        version_minor,
        listening_port,
        password: (len_password > 0).then_some(password),
        domain: frame::read_string(r, len_domain)?,
        subdomain: frame::read_string(r, len_subdomain)?,
        sub_remainder: frame::read_string(r, len_remainder)?,
        host: frame::read_string(r, len_host)?,
        name: frame::read_string(r, len_name)?,
        locator: frame::read_string(r, len_locator)?,
        description: frame::read_string(r, len_description)?,
    })
}

/// Reads the name server's verdict: a status int, then either an error
/// string or the capability mask plus send endpoints.
pub fn read_name_server_verdict<R: Read>(r: &mut R) -> Result<NameServerVerdict, FrameError> {
    let status = r.read_u32::<BigEndian>()?;
    if status != 0 {
        let len = frame::read_len(r)?;
        let message = frame::read_string(r, len)?;
        return Ok(NameServerVerdict::Refused {
            code: status,
            message,
        });
    }
    let mut mask = [0u8; 7];
    r.read_exact(&mut mask)?;
    let send_port = r.read_u32::<BigEndian>()? as u16;
    let udp_port = r.read_u32::<BigEndian>()? as u16;
    let len_host = frame::read_len(r)?;
    let send_host = frame::read_string(r, len_host)?;
    Ok(NameServerVerdict::Accepted(ServerConnectReply {
        capabilities: Capabilities::from_mask(mask),
        send_port,
        udp_port,
        send_host,
    }))
}

/// Writes the name server's acceptance (stub-server side).
pub fn encode_name_server_accept(buf: &mut Vec<u8>, reply: &ServerConnectReply) {
    buf.clear();
    frame::put_u32(buf, 0); // status OK
    buf.extend_from_slice(&reply.capabilities.to_mask());
    frame::put_u32(buf, reply.send_port as u32);
    frame::put_u32(buf, reply.udp_port as u32);
    frame::put_u32(buf, reply.send_host.len() as u32);
    buf.extend_from_slice(reply.send_host.as_bytes());
}

/// Writes a name-server refusal (stub-server side).
pub fn encode_name_server_refusal(buf: &mut Vec<u8>, code: u32, message: &str) {
    buf.clear();
    frame::put_u32(buf, code);
    frame::put_u32(buf, message.len() as u32);
    buf.extend_from_slice(message.as_bytes());
}

/// Decodes a delivery frame body (`SubscribeResponse`, `GetResponse`,
/// `RcConnect`). The header has already been consumed.
pub fn read_delivery<R: Read>(r: &mut R) -> Result<DeliveredMessage, FrameError> {
    let mut msg = Message::default();
    msg.version = r.read_u32::<BigEndian>()?;
    let _reserved = r.read_u32::<BigEndian>()?;
    msg.user_int = r.read_i32::<BigEndian>()?;
    msg.info = MsgInfo::from_bits_retain(r.read_u32::<BigEndian>()?);
    msg.sender_time_ms = frame::read_ms(r)?;
    msg.user_time_ms = frame::read_ms(r)?;
    msg.sys_msg_id = r.read_i32::<BigEndian>()?;
    msg.sender_token = r.read_i32::<BigEndian>()?;
    let len_sender = frame::read_len(r)?;
    let len_sender_host = frame::read_len(r)?;
    let len_subject = frame::read_len(r)?;
    let len_type = frame::read_len(r)?;
    let len_creator = frame::read_len(r)?;
    let len_text = frame::read_len(r)?;
    let len_bytes = frame::read_len(r)?;
    let acknowledge = r.read_u32::<BigEndian>()? != 0;
    let sender = frame::read_string(r, len_sender)?;
    msg.sender = (len_sender > 0).then_some(sender);
    let sender_host = frame::read_string(r, len_sender_host)?;
    msg.sender_host = (len_sender_host > 0).then_some(sender_host);
    msg.subject = frame::read_string(r, len_subject)?;
    msg.msg_type = frame::read_string(r, len_type)?;
    let creator = frame::read_string(r, len_creator)?;
    msg.creator = (len_creator > 0).then_some(creator);
    let text = frame::read_string(r, len_text)?;
    msg.text = (len_text > 0).then_some(text);
    if len_bytes > 0 {
        let mut bytes = vec![0u8; len_bytes];
        r.read_exact(&mut bytes)?;
        msg.bytes = ByteArray::Owned(bytes);
    }
    Ok(DeliveredMessage {
        message: msg,
        acknowledge,
    })
}

/// Encodes a delivery frame (server side; also used by the RC domain's
/// outbound send, which publishes in delivery format).
pub fn encode_delivery(buf: &mut Vec<u8>, id: ResponseId, msg: &Message, acknowledge: bool) {
    buf.clear();
    frame::put_u32(buf, 0);
    frame::put_u32(buf, id as u32);
    frame::put_u32(buf, msg.version);
    frame::put_u32(buf, 0); // reserved
    frame::put_i32(buf, msg.user_int);
    frame::put_u32(buf, msg.info.bits());
    frame::put_ms(buf, msg.sender_time_ms);
    frame::put_ms(buf, msg.user_time_ms);
    frame::put_i32(buf, msg.sys_msg_id);
    frame::put_i32(buf, msg.sender_token);
    frame::put_u32(buf, opt_len(&msg.sender) as u32);
    frame::put_u32(buf, opt_len(&msg.sender_host) as u32);
    frame::put_u32(buf, msg.subject.len() as u32);
    frame::put_u32(buf, msg.msg_type.len() as u32);
    frame::put_u32(buf, opt_len(&msg.creator) as u32);
    frame::put_u32(buf, opt_len(&msg.text) as u32);
    frame::put_u32(buf, msg.bytes.len() as u32);
    frame::put_u32(buf, acknowledge as u32);
    put_opt(buf, &msg.sender);
    put_opt(buf, &msg.sender_host);
    buf.extend_from_slice(msg.subject.as_bytes());
    buf.extend_from_slice(msg.msg_type.as_bytes());
    put_opt(buf, &msg.creator);
    put_opt(buf, &msg.text);
    buf.extend_from_slice(msg.bytes.as_slice());
    frame::patch_len(buf);
}

/// Encodes an RC-domain publish. RC sends travel in delivery format minus
/// the receiver-side fields: the sender is the client's own name, and the
/// frame id flips to `GetResponse` when answering a peer request.
pub fn encode_rc_publish(buf: &mut Vec<u8>, msg: &Message, sender: &str) {
    let id = if msg.is_get_response() {
        ResponseId::GetResponse
    } else {
        ResponseId::SubscribeResponse
    };
    buf.clear();
    frame::put_u32(buf, 0);
    frame::put_u32(buf, id as u32);
    frame::put_u32(buf, ids::VERSION_MAJOR);
    frame::put_i32(buf, msg.user_int);
    frame::put_u32(buf, msg.info.bits());
    frame::put_i32(buf, msg.sender_token);
    frame::put_ms(buf, now_ms());
    frame::put_ms(buf, msg.user_time_ms);
    frame::put_u32(buf, sender.len() as u32);
    frame::put_u32(buf, msg.subject.len() as u32);
    frame::put_u32(buf, msg.msg_type.len() as u32);
    frame::put_u32(buf, opt_len(&msg.text) as u32);
    frame::put_u32(buf, msg.bytes.len() as u32);
    buf.extend_from_slice(sender.as_bytes());
    buf.extend_from_slice(msg.subject.as_bytes());
    buf.extend_from_slice(msg.msg_type.as_bytes());
    put_opt(buf, &msg.text);
    buf.extend_from_slice(msg.bytes.as_slice());
    frame::patch_len(buf);
}

/// Decodes an RC-domain publish (RC-server side of [`encode_rc_publish`]).
pub fn read_rc_publish<R: Read>(r: &mut R) -> Result<Message, FrameError> {
    let mut msg = Message::default();
    msg.version = r.read_u32::<BigEndian>()?;
    msg.user_int = r.read_i32::<BigEndian>()?;
    msg.info = MsgInfo::from_bits_retain(r.read_u32::<BigEndian>()?);
    msg.sender_token = r.read_i32::<BigEndian>()?;
    msg.sender_time_ms = frame::read_ms(r)?;
    msg.user_time_ms = frame::read_ms(r)?;
    let len_sender = frame::read_len(r)?;
    let len_subject = frame::read_len(r)?;
    let len_type = frame::read_len(r)?;
    let len_text = frame::read_len(r)?;
    let len_bytes = frame::read_len(r)?;
    let sender = frame::read_string(r, len_sender)?;
    msg.sender = (len_sender > 0).then_some(sender);
    msg.subject = frame::read_string(r, len_subject)?;
    msg.msg_type = frame::read_string(r, len_type)?;
    let text = frame::read_string(r, len_text)?;
    msg.text = (len_text > 0).then_some(text);
    if len_bytes > 0 {
        let mut bytes = vec![0u8; len_bytes];
        r.read_exact(&mut bytes)?;
        msg.bytes = ByteArray::Owned(bytes);
    }
    Ok(msg)
}

/// Encodes the monitoring report sent in reply to a server keep-alive.
/// The XML must already be assembled; this routine only frames it.
pub fn encode_monitor_report(buf: &mut Vec<u8>, counts: &MonitorCounts, xml: &str) {
    buf.clear();
    frame::put_u32(buf, 0);
    frame::put_u32(buf, xml.len() as u32);
    frame::put_u32(buf, 0); // not a Java client
    frame::put_u32(buf, counts.pending_subscribe_and_gets);
    frame::put_u32(buf, counts.pending_send_and_gets);
    frame::put_u64(buf, counts.tcp_sends);
    frame::put_u64(buf, counts.udp_sends);
    frame::put_u64(buf, counts.sync_sends);
    frame::put_u64(buf, counts.send_and_gets);
    frame::put_u64(buf, counts.subscribe_and_gets);
    frame::put_u64(buf, counts.subscribes);
    frame::put_u64(buf, counts.unsubscribes);
    buf.extend_from_slice(xml.as_bytes());
    frame::patch_len(buf);
}

/// Reads the server's reply to a `Monitor` request: a millisecond
/// timestamp and the monitoring XML.
pub fn read_monitor_reply<R: Read>(r: &mut R) -> Result<(i64, String), FrameError> {
    let time_ms = frame::read_ms(r)?;
    let len = frame::read_len(r)?;
    let xml = frame::read_string(r, len)?;
    Ok((time_ms, xml))
}

/// Builds a cMsg-domain discovery datagram.
pub fn encode_cmsg_discovery(password: Option<&str>) -> Vec<u8> {
    let password = password.unwrap_or("");
    let mut buf = Vec::with_capacity(12 + password.len());
    frame::put_u32(&mut buf, ids::CMSG_DISCOVERY_MAGIC);
    frame::put_u32(&mut buf, ids::CMSG_DOMAIN_BROADCAST);
    frame::put_u32(&mut buf, password.len() as u32);
    buf.extend_from_slice(password.as_bytes());
    buf
}

/// Parses a cMsg-domain discovery reply. Malformed or out-of-range
/// replies yield `None` and the discovery wait continues.
pub fn parse_cmsg_discovery_reply(datagram: &[u8]) -> Option<(u16, String)> {
    if datagram.len() < 13 {
        return None;
    }
    let mut r = datagram;
    let magic = r.read_u32::<BigEndian>().ok()?;
    let port = r.read_u32::<BigEndian>().ok()?;
    let host_len = r.read_u32::<BigEndian>().ok()? as usize;
    if magic != ids::CMSG_DISCOVERY_MAGIC || !(1024..=65535).contains(&port) {
        return None;
    }
    if host_len == 0 || host_len > r.len() {
        return None;
    }
    let host = String::from_utf8_lossy(&r[..host_len]).into_owned();
    Some((port as u16, host))
}

/// Builds an RC-domain discovery datagram.
pub fn encode_rc_discovery(listening_port: u16, name: &str, expid: &str) -> Vec<u8> {
    let mut buf = Vec::with_capacity(16 + name.len() + expid.len());
    frame::put_u32(&mut buf, ids::RC_DOMAIN_BROADCAST);
    frame::put_u32(&mut buf, listening_port as u32);
    frame::put_u32(&mut buf, name.len() as u32);
    frame::put_u32(&mut buf, expid.len() as u32);
    buf.extend_from_slice(name.as_bytes());
    buf.extend_from_slice(expid.as_bytes());
    buf
}

/// Parses an RC discovery reply: magic, server listening port, host,
/// expid. The caller validates the expid; bad magic is rejected here.
pub fn parse_rc_discovery_reply(datagram: &[u8]) -> Option<RcDiscoveryReply> {
    if datagram.len() < 18 {
        return None;
    }
    let mut r = datagram;
    let magic = r.read_u32::<BigEndian>().ok()?;
    let port = r.read_u32::<BigEndian>().ok()?;
    let host_len = r.read_u32::<BigEndian>().ok()? as usize;
    let expid_len = r.read_u32::<BigEndian>().ok()? as usize;
    if magic != ids::RC_DISCOVERY_MAGIC || port > u16::MAX as u32 {
        return None;
    }
    if host_len + expid_len > r.len() {
        return None;
    }
    let host = String::from_utf8_lossy(&r[..host_len]).into_owned();
    let expid = String::from_utf8_lossy(&r[host_len..host_len + expid_len]).into_owned();
    Some(RcDiscoveryReply {
        port: port as u16,
        host,
        expid: (expid_len > 0).then_some(expid),
    })
}

/// Builds an RC discovery reply (stub-server side).
pub fn encode_rc_discovery_reply(port: u16, host: &str, expid: &str) -> Vec<u8> {
    let mut buf = Vec::with_capacity(16 + host.len() + expid.len());
    frame::put_u32(&mut buf, ids::RC_DISCOVERY_MAGIC);
    frame::put_u32(&mut buf, port as u32);
    frame::put_u32(&mut buf, host.len() as u32);
    frame::put_u32(&mut buf, expid.len() as u32);
    buf.extend_from_slice(host.as_bytes());
    buf.extend_from_slice(expid.as_bytes());
    buf
}

/// Encodes the client's name reply, sent back over the handler connection
/// after an `RcConnect` delivery completes the RC handshake.
pub fn encode_name_reply(buf: &mut Vec<u8>, name: &str) {
    buf.clear();
    frame::put_u32(buf, name.len() as u32);
    buf.extend_from_slice(name.as_bytes());
}
