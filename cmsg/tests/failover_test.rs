//! Failover: server death detection, reconnection to the next locator,
//! and subscription restoration.

use cmsg::testing::{ServerEvent, StubServer};
use cmsg::{connect, CmsgError, Message, SubscribeConfig};
use crossbeam::channel::unbounded;
use std::sync::Arc;
use std::time::Duration;

const WAIT: Duration = Duration::from_secs(10);

#[test]
fn dead_server_fails_over_to_the_next_locator() {
    let first = StubServer::start().unwrap();
    let second = StubServer::start().unwrap();
    let locator = format!("{};{}", first.locator("x"), second.locator("x"));

    let conn = Arc::new(connect(&locator, "survivor", "failover test").unwrap());
    conn.start().unwrap();

    // Only the first server saw the connect.
    assert!(first
        .wait_for(WAIT, |e| matches!(e, ServerEvent::Connect(_)))
        .is_some());
    assert!(second
        .wait_for(Duration::from_millis(200), |e| matches!(
            e,
            ServerEvent::Connect(_)
        ))
        .is_none());

    let (tx, rx) = unbounded();
    conn.subscribe(
        "run.*",
        "status",
        Arc::new(move |msg: Message| {
            tx.send(msg.user_int).unwrap();
        }),
        SubscribeConfig::default(),
    )
    .unwrap();
    let Some(ServerEvent::Subscribe { subject, msg_type, .. }) =
        first.wait_for(WAIT, |e| matches!(e, ServerEvent::Subscribe { .. }))
    else {
        panic!("first server never saw the subscribe");
    };
    assert_eq!(subject, "run.*");
    assert_eq!(msg_type, "status");

    // A subscribeAndGet in flight when the server dies must be woken
    // with server-died: it cannot be resumed across server identities.
    let pending = std::thread::spawn({
        let conn = conn.clone();
        move || conn.subscribe_and_get("never.comes", "t", Some(WAIT))
    });
    assert!(first
        .wait_for(WAIT, |e| matches!(e, ServerEvent::SubscribeAndGet { .. }))
        .is_some());

    // Kill the first server; the keep-alive thread detects death and
    // walks to the second locator.
    first.kill();

    assert!(second
        .wait_for(WAIT, |e| matches!(e, ServerEvent::Connect(_)))
        .is_some());
    let Some(ServerEvent::Subscribe { subject, msg_type, .. }) =
        second.wait_for(WAIT, |e| matches!(e, ServerEvent::Subscribe { .. }))
    else {
        panic!("subscription was not restored on the new server");
    };
    assert_eq!(subject, "run.*");
    assert_eq!(msg_type, "status");

    assert_eq!(pending.join().unwrap().unwrap_err(), CmsgError::ServerDied);

    // Deliveries from the new server flow into the surviving callback.
    let mut msg = Message::new("run.7", "status");
    msg.user_int = 7;
    let deadline = std::time::Instant::now() + WAIT;
    loop {
        // The delivery pair may still be settling right after failover.
        if second.deliver(&msg, false).is_ok() {
            break;
        }
        assert!(std::time::Instant::now() < deadline, "delivery path never came up");
        std::thread::sleep(Duration::from_millis(100));
    }
    assert_eq!(rx.recv_timeout(WAIT).unwrap(), 7);

    // Sends keep working against the new server.
    conn.send(&Message::new("after.failover", "status")).unwrap();
    assert!(second
        .wait_for(WAIT, |e| matches!(e, ServerEvent::Send(_)))
        .is_some());
}

#[test]
fn exhausted_failover_list_tears_the_connection_down() {
    let only = StubServer::start().unwrap();
    let conn = connect(&only.locator("x"), "lonely", "d").unwrap();

    only.kill();

    // A single-locator connection has nowhere to go: the keep-alive
    // thread disconnects and operations start failing.
    let deadline = std::time::Instant::now() + WAIT;
    loop {
        match conn.send(&Message::new("s", "t")) {
            Err(_) => break,
            Ok(()) => {
                assert!(std::time::Instant::now() < deadline, "send never failed");
                std::thread::sleep(Duration::from_millis(100));
            }
        }
    }
}
