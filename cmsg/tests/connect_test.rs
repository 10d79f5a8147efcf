//! Connect handshake and simple request/reply operations against a stub
//! cMsg server.

use cmsg::testing::{ServerEvent, StubServer};
use cmsg::{connect, Message, SHUTDOWN_INCLUDE_ME};
use std::time::Duration;

const WAIT: Duration = Duration::from_secs(5);

#[test]
fn connect_frame_carries_the_client_identity() {
    let stub = StubServer::start().unwrap();
    let locator = format!("{}?cmsgpassword=abc", stub.locator("test"));
    let conn = connect(&locator, "consumer", "a test client").unwrap();

    let Some(ServerEvent::Connect(req)) = stub.next_event(WAIT) else {
        panic!("no connect observed");
    };
    assert_eq!(req.version_major, 1);
    assert_eq!(req.version_minor, 0);
    assert!(req.listening_port >= 2345);
    assert_eq!(req.password.as_deref(), Some("abc"));
    assert_eq!(req.domain, "cMsg");
    assert_eq!(req.subdomain, "cMsg");
    assert_eq!(req.sub_remainder, "test");
    assert_eq!(req.name, "consumer");
    assert_eq!(req.description, "a test client");
    assert!(req.locator.contains("cMsg:cMsg://127.0.0.1"));
    assert!(!req.host.is_empty());

    assert_eq!(conn.domain(), "cMsg");
    conn.disconnect().unwrap();
    assert!(stub
        .wait_for(WAIT, |e| matches!(e, ServerEvent::Disconnect))
        .is_some());
}

#[test]
fn tcp_send_reaches_the_server_with_creator_filled_in() {
    let stub = StubServer::start().unwrap();
    let conn = connect(&stub.locator("test"), "producer", "d").unwrap();

    let msg = Message::new("HISTOGRAM", "data").with_text("hello");
    conn.send(&msg).unwrap();

    let Some(ServerEvent::Send(got)) =
        stub.wait_for(WAIT, |e| matches!(e, ServerEvent::Send(_)))
    else {
        panic!("no send observed");
    };
    assert_eq!(got.subject, "HISTOGRAM");
    assert_eq!(got.msg_type, "data");
    assert_eq!(got.text.as_deref(), Some("hello"));
    // creator defaults to the sending client's name
    assert_eq!(got.creator.as_deref(), Some("producer"));
}

#[test]
fn udp_send_uses_the_datagram_socket() {
    let stub = StubServer::start().unwrap();
    let conn = connect(&stub.locator("test"), "producer", "d").unwrap();

    let mut msg = Message::new("small", "t").with_text("fits in a datagram");
    msg.reliable_send = false;
    conn.send(&msg).unwrap();

    assert!(stub
        .wait_for(WAIT, |e| matches!(e, ServerEvent::UdpSend(_)))
        .is_some());
}

#[test]
fn sync_send_returns_the_server_status() {
    let stub = StubServer::start().unwrap();
    stub.set_sync_send_reply(7);
    let conn = connect(&stub.locator("test"), "c", "d").unwrap();

    let status = conn
        .sync_send(&Message::new("s", "t").with_text("x"), None)
        .unwrap();
    assert_eq!(status, 7);
    assert!(stub
        .wait_for(WAIT, |e| matches!(e, ServerEvent::SyncSend(_)))
        .is_some());
}

#[test]
fn monitor_returns_the_server_xml() {
    let stub = StubServer::start().unwrap();
    let conn = connect(&stub.locator("test"), "c", "d").unwrap();

    let reply = conn.monitor("").unwrap();
    assert_eq!(reply.text.as_deref(), Some("<stub/>"));
    assert!(reply.sender_time_ms > 0);
}

#[test]
fn keep_alives_flow_once_connected() {
    let stub = StubServer::start().unwrap();
    let _conn = connect(&stub.locator("test"), "c", "d").unwrap();
    assert!(stub
        .wait_for(WAIT, |e| matches!(e, ServerEvent::KeepAlive))
        .is_some());
}

#[test]
fn shutdown_clients_frame_carries_flag_and_target() {
    let stub = StubServer::start().unwrap();
    let conn = connect(&stub.locator("test"), "c", "d").unwrap();

    conn.shutdown_clients(Some("victim*"), SHUTDOWN_INCLUDE_ME)
        .unwrap();
    let Some(ServerEvent::ShutdownClients { flag, target }) =
        stub.wait_for(WAIT, |e| matches!(e, ServerEvent::ShutdownClients { .. }))
    else {
        panic!("no shutdown frame observed");
    };
    assert_eq!(flag, SHUTDOWN_INCLUDE_ME);
    assert_eq!(target, "victim*");
}

#[test]
fn operations_after_disconnect_report_lost_connection() {
    let stub = StubServer::start().unwrap();
    let conn = connect(&stub.locator("test"), "c", "d").unwrap();
    conn.disconnect().unwrap();
    assert_eq!(
        conn.send(&Message::new("s", "t")),
        Err(cmsg::CmsgError::LostConnection)
    );
    assert_eq!(conn.disconnect(), Err(cmsg::CmsgError::LostConnection));
}

#[test]
fn bad_arguments_fail_locally() {
    let stub = StubServer::start().unwrap();
    let conn = connect(&stub.locator("test"), "c", "d").unwrap();

    // Excluded characters in subject/type never reach the server.
    let bad = Message::new("has`tick", "t");
    assert_eq!(conn.send(&bad), Err(cmsg::CmsgError::BadArgument));
    let empty = Message::new("", "t");
    assert_eq!(conn.send(&empty), Err(cmsg::CmsgError::BadArgument));

    assert_eq!(
        connect(&stub.locator("test"), "bad\"name", "d").unwrap_err(),
        cmsg::CmsgError::BadArgument
    );
}
