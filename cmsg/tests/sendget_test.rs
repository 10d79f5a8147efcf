//! Peer request/response correlation, timeouts, and UDP size limits.

use cmsg::testing::{ServerEvent, StubServer};
use cmsg::{connect, CmsgError, Message};
use std::time::{Duration, Instant};

const WAIT: Duration = Duration::from_secs(5);

#[test]
fn send_and_get_reply_carries_the_request_token() {
    let stub = StubServer::start().unwrap();
    let conn = connect(&stub.locator("test"), "c", "d").unwrap();

    let responder = std::thread::spawn({
        move || {
            let Some(ServerEvent::SendAndGet(req)) =
                stub.wait_for(WAIT, |e| matches!(e, ServerEvent::SendAndGet(_)))
            else {
                panic!("no sendAndGet observed");
            };
            assert!(req.is_get_request());
            let mut reply = req.response_to();
            reply.subject = "answer".to_string();
            reply.msg_type = "t".to_string();
            reply.text = Some("42".to_string());
            stub.deliver_get_response(&reply, false).unwrap();
            req.sender_token
        }
    });

    let request = Message::new("question", "t").with_text("meaning of life?");
    let reply = conn.send_and_get(&request, Some(WAIT)).unwrap();
    let token = responder.join().unwrap();
    assert_eq!(reply.sender_token, token);
    assert_eq!(reply.text.as_deref(), Some("42"));
    assert!(reply.is_get_response());
}

#[test]
fn send_and_get_timeout_sends_exactly_one_forget_frame() {
    let stub = StubServer::start().unwrap();
    let conn = connect(&stub.locator("test"), "c", "d").unwrap();

    let started = Instant::now();
    let err = conn
        .send_and_get(&Message::new("question", "t"), Some(Duration::from_secs(1)))
        .unwrap_err();
    assert_eq!(err, CmsgError::Timeout);
    let elapsed = started.elapsed();
    assert!(elapsed >= Duration::from_millis(900), "returned too early: {elapsed:?}");
    assert!(elapsed < Duration::from_secs(3), "returned too late: {elapsed:?}");

    let Some(ServerEvent::SendAndGet(req)) =
        stub.wait_for(WAIT, |e| matches!(e, ServerEvent::SendAndGet(_)))
    else {
        panic!("no sendAndGet observed");
    };
    let Some(ServerEvent::UnSendAndGet(token)) =
        stub.wait_for(WAIT, |e| matches!(e, ServerEvent::UnSendAndGet(_)))
    else {
        panic!("no unSendAndGet observed");
    };
    assert_eq!(token, req.sender_token);
    // exactly one forget frame
    assert!(stub
        .wait_for(Duration::from_millis(300), |e| matches!(
            e,
            ServerEvent::UnSendAndGet(_)
        ))
        .is_none());
}

#[test]
fn subscribe_and_get_returns_the_first_match() {
    let stub = StubServer::start().unwrap();
    let conn = connect(&stub.locator("test"), "c", "d").unwrap();

    let waiter = std::thread::spawn({
        move || {
            let Some(ServerEvent::SubscribeAndGet { subject, msg_type, .. }) =
                stub.wait_for(WAIT, |e| matches!(e, ServerEvent::SubscribeAndGet { .. }))
            else {
                panic!("no subscribeAndGet observed");
            };
            assert_eq!(subject, "alarm.*");
            assert_eq!(msg_type, "*");
            let mut msg = Message::new("alarm.hall", "loud").with_text("fire");
            msg.sender = Some("srv".to_string());
            stub.deliver(&msg, false).unwrap();
        }
    });

    // Works without start(): one-shot gets bypass the receive gate.
    let got = conn
        .subscribe_and_get("alarm.*", "*", Some(WAIT))
        .unwrap();
    assert_eq!(got.subject, "alarm.hall");
    assert_eq!(got.text.as_deref(), Some("fire"));
    waiter.join().unwrap();
}

#[test]
fn subscribe_and_get_timeout_sends_the_forget_frame() {
    let stub = StubServer::start().unwrap();
    let conn = connect(&stub.locator("test"), "c", "d").unwrap();

    let err = conn
        .subscribe_and_get("nothing", "ever", Some(Duration::from_millis(500)))
        .unwrap_err();
    assert_eq!(err, CmsgError::Timeout);

    let Some(ServerEvent::SubscribeAndGet { id, .. }) =
        stub.wait_for(WAIT, |e| matches!(e, ServerEvent::SubscribeAndGet { .. }))
    else {
        panic!("no subscribeAndGet observed");
    };
    let Some(ServerEvent::UnsubscribeAndGet { id: forgot, .. }) =
        stub.wait_for(WAIT, |e| matches!(e, ServerEvent::UnsubscribeAndGet { .. }))
    else {
        panic!("no unSubscribeAndGet observed");
    };
    assert_eq!(forgot, id);
}

#[test]
fn oversized_udp_send_is_rejected_before_writing() {
    let stub = StubServer::start().unwrap();
    let conn = connect(&stub.locator("test"), "c", "d").unwrap();

    let mut msg = Message::new("big", "t").with_text("x".repeat(9000));
    msg.reliable_send = false;
    assert_eq!(conn.send(&msg), Err(CmsgError::OutOfRange));
    // nothing went out
    assert!(stub
        .wait_for(Duration::from_millis(300), |e| matches!(
            e,
            ServerEvent::UdpSend(_) | ServerEvent::Send(_)
        ))
        .is_none());

    // The same message over TCP is fine.
    msg.reliable_send = true;
    conn.send(&msg).unwrap();
    assert!(stub
        .wait_for(WAIT, |e| matches!(e, ServerEvent::Send(_)))
        .is_some());
}
