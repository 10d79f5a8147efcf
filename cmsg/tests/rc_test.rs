//! RC domain discovery, the two-stage connect, sends, and reconnection.

use cmsg::testing::{ServerEvent, StubRcServer};
use cmsg::{connect, CmsgError, Message, SubscribeConfig};
use crossbeam::channel::unbounded;
use std::sync::Arc;
use std::time::Duration;

const WAIT: Duration = Duration::from_secs(5);

#[test]
fn discovery_and_handshake_complete_a_connection() {
    let stub = StubRcServer::start("carlExp").unwrap();
    let conn = connect(&stub.locator("carlExp", 3, 5), "rcClient", "rc test").unwrap();

    let Some(ServerEvent::RcDiscovery { name, expid, client_port }) =
        stub.wait_for(WAIT, |e| matches!(e, ServerEvent::RcDiscovery { .. }))
    else {
        panic!("no discovery datagram observed");
    };
    assert_eq!(name, "rcClient");
    assert_eq!(expid, "carlExp");
    assert!(client_port >= 6543);

    // TCP send goes to the server's TCP port...
    conn.send(&Message::new("status", "t").with_text("up")).unwrap();
    let Some(ServerEvent::RcSend(got)) =
        stub.wait_for(WAIT, |e| matches!(e, ServerEvent::RcSend(_)))
    else {
        panic!("no rc send observed");
    };
    assert_eq!(got.subject, "status");
    assert_eq!(got.sender.as_deref(), Some("rcClient"));

    // ...and an unreliable send goes out over UDP.
    let mut msg = Message::new("status", "t").with_text("udp");
    msg.reliable_send = false;
    conn.send(&msg).unwrap();
    assert!(stub
        .wait_for(WAIT, |e| matches!(e, ServerEvent::RcUdpSend(_)))
        .is_some());

    conn.disconnect().unwrap();
}

#[test]
fn foreign_expid_replies_are_ignored_until_timeout() {
    let stub = StubRcServer::start("other").unwrap();
    let err = connect(&stub.locator("carlExp", 2, 2), "rcClient", "d").unwrap_err();
    assert_eq!(err, CmsgError::Timeout);
}

#[test]
fn unsupported_operations_return_not_implemented() {
    let stub = StubRcServer::start("e").unwrap();
    let conn = connect(&stub.locator("e", 3, 5), "rcClient", "d").unwrap();

    let msg = Message::new("s", "t");
    assert_eq!(conn.sync_send(&msg, None), Err(CmsgError::NotImplemented));
    assert_eq!(
        conn.send_and_get(&msg, Some(WAIT)).unwrap_err(),
        CmsgError::NotImplemented
    );
    assert_eq!(
        conn.subscribe_and_get("s", "t", Some(WAIT)).unwrap_err(),
        CmsgError::NotImplemented
    );
    assert_eq!(conn.monitor("").unwrap_err(), CmsgError::NotImplemented);
    assert_eq!(
        conn.shutdown_clients(None, 0).unwrap_err(),
        CmsgError::NotImplemented
    );
    assert_eq!(
        conn.shutdown_servers(None, 0).unwrap_err(),
        CmsgError::NotImplemented
    );
}

#[test]
fn subscriptions_dispatch_locally_and_survive_reconnect() {
    let stub = StubRcServer::start("e").unwrap();
    let conn = connect(&stub.locator("e", 3, 5), "rcClient", "d").unwrap();
    conn.start().unwrap();

    let (tx, rx) = unbounded();
    conn.subscribe(
        "ping*",
        "*",
        Arc::new(move |msg: Message| {
            tx.send(msg.user_int).unwrap();
        }),
        SubscribeConfig::default(),
    )
    .unwrap();

    let mut msg = Message::new("ping1", "t");
    msg.user_int = 1;
    stub.deliver(&msg).unwrap();
    assert_eq!(rx.recv_timeout(WAIT).unwrap(), 1);

    // The RC server dies and re-establishes: a second RcConnect on the
    // open connection swaps the send sockets, subscriptions intact.
    stub.resend_rc_connect().unwrap();
    conn.send(&Message::new("after", "t")).unwrap();
    assert!(stub
        .wait_for(WAIT, |e| matches!(e, ServerEvent::RcSend(_)))
        .is_some());

    let mut msg = Message::new("ping2", "t");
    msg.user_int = 2;
    stub.deliver(&msg).unwrap();
    assert_eq!(rx.recv_timeout(WAIT).unwrap(), 2);

    // Context names the rc domain.
    let (ctx_tx, ctx_rx) = unbounded();
    conn.subscribe(
        "ctx",
        "t",
        Arc::new(move |msg: Message| {
            ctx_tx.send(msg.context.map(|c| c.domain)).unwrap();
        }),
        SubscribeConfig::default(),
    )
    .unwrap();
    stub.deliver(&Message::new("ctx", "t")).unwrap();
    assert_eq!(ctx_rx.recv_timeout(WAIT).unwrap().as_deref(), Some("rc"));
}
