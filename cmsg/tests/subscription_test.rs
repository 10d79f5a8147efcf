//! Subscription registration, dispatch, backpressure, and skip policy.

use cmsg::testing::{ServerEvent, StubServer};
use cmsg::{connect, CmsgError, Message, SubscribeConfig};
use crossbeam::channel::{bounded, unbounded};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

const WAIT: Duration = Duration::from_secs(5);

fn delivery(subject: &str, msg_type: &str, seq: i32) -> Message {
    let mut msg = Message::new(subject, msg_type).with_text(format!("m{seq}"));
    msg.user_int = seq;
    msg.sender = Some("srv".to_string());
    msg
}

#[test]
fn matching_subscription_gets_exactly_one_copy_per_callback() {
    let stub = StubServer::start().unwrap();
    let conn = connect(&stub.locator("test"), "c", "d").unwrap();
    conn.start().unwrap();

    let wild_count = Arc::new(AtomicUsize::new(0));
    let exact_count = Arc::new(AtomicUsize::new(0));
    let (tx, rx) = unbounded();

    {
        let count = wild_count.clone();
        let tx = tx.clone();
        conn.subscribe(
            "news.*",
            "*",
            Arc::new(move |msg: Message| {
                count.fetch_add(1, Ordering::SeqCst);
                tx.send(msg).unwrap();
            }),
            SubscribeConfig::default(),
        )
        .unwrap();
    }
    {
        let count = exact_count.clone();
        conn.subscribe(
            "weather",
            "report",
            Arc::new(move |_msg: Message| {
                count.fetch_add(1, Ordering::SeqCst);
            }),
            SubscribeConfig::default(),
        )
        .unwrap();
    }
    // Both subscriptions were announced to the server.
    assert!(stub
        .wait_for(WAIT, |e| matches!(e, ServerEvent::Subscribe { .. }))
        .is_some());
    assert!(stub
        .wait_for(WAIT, |e| matches!(e, ServerEvent::Subscribe { .. }))
        .is_some());

    stub.deliver(&delivery("news.sports", "scores", 1), false)
        .unwrap();

    let got = rx.recv_timeout(WAIT).unwrap();
    assert_eq!(got.subject, "news.sports");
    // Context is stamped with the delivering subscription's patterns.
    let ctx = got.context.expect("context stamped");
    assert_eq!(ctx.subject, "news.*");
    assert_eq!(ctx.msg_type, "*");
    assert_eq!(ctx.domain, "cMsg");

    std::thread::sleep(Duration::from_millis(200));
    assert_eq!(wild_count.load(Ordering::SeqCst), 1);
    assert_eq!(exact_count.load(Ordering::SeqCst), 0);
}

#[test]
fn duplicate_subscription_is_refused_without_table_damage() {
    let stub = StubServer::start().unwrap();
    let conn = connect(&stub.locator("test"), "c", "d").unwrap();
    conn.start().unwrap();

    let (tx, rx) = unbounded();
    let callback: Arc<dyn cmsg::SubscriptionCallback> = Arc::new(move |msg: Message| {
        tx.send(msg.user_int).unwrap();
    });

    conn.subscribe("SUBJECT", "TYPE", callback.clone(), SubscribeConfig::default())
        .unwrap();
    assert_eq!(
        conn.subscribe("SUBJECT", "TYPE", callback, SubscribeConfig::default())
            .unwrap_err(),
        CmsgError::AlreadyExists
    );

    // The original registration still works.
    stub.deliver(&delivery("SUBJECT", "TYPE", 9), false).unwrap();
    assert_eq!(rx.recv_timeout(WAIT).unwrap(), 9);
    assert!(rx.recv_timeout(Duration::from_millis(200)).is_err());
}

#[test]
fn unsubscribe_notifies_server_only_when_last_callback_goes() {
    let stub = StubServer::start().unwrap();
    let conn = connect(&stub.locator("test"), "c", "d").unwrap();

    let h1 = conn
        .subscribe("s", "t", Arc::new(|_: Message| {}), SubscribeConfig::default())
        .unwrap();
    let h2 = conn
        .subscribe("s", "t", Arc::new(|_: Message| {}), SubscribeConfig::default())
        .unwrap();

    let Some(ServerEvent::Subscribe { id, .. }) =
        stub.wait_for(WAIT, |e| matches!(e, ServerEvent::Subscribe { .. }))
    else {
        panic!("no subscribe observed");
    };

    conn.unsubscribe(h2).unwrap();
    // Second callback removed, entry still live: no unsubscribe frame.
    assert!(stub
        .wait_for(Duration::from_millis(300), |e| matches!(
            e,
            ServerEvent::Unsubscribe { .. }
        ))
        .is_none());

    conn.unsubscribe(h1).unwrap();
    let Some(ServerEvent::Unsubscribe {
        id: gone_id,
        subject,
        msg_type,
    }) = stub.wait_for(WAIT, |e| matches!(e, ServerEvent::Unsubscribe { .. }))
    else {
        panic!("no unsubscribe observed");
    };
    assert_eq!(gone_id, id);
    assert_eq!(subject, "s");
    assert_eq!(msg_type, "t");

    // A stale handle is refused.
    let h3 = conn
        .subscribe("s2", "t2", Arc::new(|_: Message| {}), SubscribeConfig::default())
        .unwrap();
    conn.unsubscribe(h3.clone()).unwrap();
    assert_eq!(conn.unsubscribe(h3), Err(CmsgError::BadArgument));
}

#[test]
fn messages_arrive_in_fifo_order() {
    let stub = StubServer::start().unwrap();
    let conn = connect(&stub.locator("test"), "c", "d").unwrap();
    conn.start().unwrap();

    let (tx, rx) = unbounded();
    conn.subscribe(
        "SUBJECT",
        "TYPE",
        Arc::new(move |msg: Message| {
            tx.send(msg.user_int).unwrap();
        }),
        SubscribeConfig::default(),
    )
    .unwrap();

    const N: i32 = 300;
    for seq in 0..N {
        stub.deliver(&delivery("SUBJECT", "TYPE", seq), false).unwrap();
    }
    for expect in 0..N {
        assert_eq!(rx.recv_timeout(WAIT).unwrap(), expect);
    }
}

#[test]
fn full_queue_without_skip_blocks_until_the_consumer_catches_up() {
    let stub = StubServer::start().unwrap();
    let conn = connect(&stub.locator("test"), "c", "d").unwrap();
    conn.start().unwrap();

    // Consumer takes a permit per message; with none available it parks
    // inside the callback.
    let (permit_tx, permit_rx) = bounded::<()>(0);
    let (seen_tx, seen_rx) = unbounded();
    let config = SubscribeConfig {
        max_queue: 2,
        may_skip: false,
        ..SubscribeConfig::default()
    };
    conn.subscribe(
        "SUBJECT",
        "TYPE",
        Arc::new(move |msg: Message| {
            seen_tx.send(msg.user_int).unwrap();
            permit_rx.recv().unwrap();
        }),
        config,
    )
    .unwrap();

    const N: i32 = 6;
    for seq in 0..N {
        stub.deliver(&delivery("SUBJECT", "TYPE", seq), false).unwrap();
    }
    // Every message is eventually delivered, in order, none dropped.
    for expect in 0..N {
        assert_eq!(seen_rx.recv_timeout(WAIT).unwrap(), expect);
        permit_tx.send(()).unwrap();
    }
}

#[test]
fn skip_policy_drops_the_oldest_batch() {
    let stub = StubServer::start().unwrap();
    let conn = connect(&stub.locator("test"), "c", "d").unwrap();
    conn.start().unwrap();

    let (permit_tx, permit_rx) = bounded::<()>(0);
    let (seen_tx, seen_rx) = unbounded();
    let (entered_tx, entered_rx) = unbounded();
    let config = SubscribeConfig {
        max_queue: 3,
        may_skip: true,
        skip_size: 2,
        ..SubscribeConfig::default()
    };
    conn.subscribe(
        "SUBJECT",
        "TYPE",
        Arc::new(move |msg: Message| {
            entered_tx.send(()).unwrap();
            seen_tx.send(msg.user_int).unwrap();
            permit_rx.recv().unwrap();
        }),
        config,
    )
    .unwrap();

    // First message parks the worker inside the callback.
    stub.deliver(&delivery("SUBJECT", "TYPE", 0), true).unwrap();
    entered_rx.recv_timeout(WAIT).unwrap();

    // Queue fills to 3, then each further delivery drops the oldest 2:
    // [1,2,3] -> drop 1,2 push 4 -> [3,4,5] -> drop 3,4 push 6 -> ...
    for seq in 1..=8 {
        stub.deliver(&delivery("SUBJECT", "TYPE", seq), true).unwrap();
    }
    // The sentinel's acknowledge guarantees message 8 has been fully
    // dispatched before the consumer is released below.
    stub.deliver(&delivery("SUBJECT", "TYPE", 9), true).unwrap();

    // Release the consumer; it drains what survived the skips.
    let mut seen = vec![seen_rx.recv_timeout(WAIT).unwrap()];
    permit_tx.send(()).unwrap();
    while let Ok(seq) = seen_rx.recv_timeout(Duration::from_millis(500)) {
        seen.push(seq);
        let _ = permit_tx.send(());
        let _ = entered_rx.try_recv();
    }

    assert_eq!(seen, vec![0, 7, 8, 9]);
}

#[test]
fn stopped_connection_ignores_deliveries() {
    let stub = StubServer::start().unwrap();
    let conn = connect(&stub.locator("test"), "c", "d").unwrap();
    // receive is disabled until start()

    let count = Arc::new(AtomicUsize::new(0));
    {
        let count = count.clone();
        conn.subscribe(
            "SUBJECT",
            "TYPE",
            Arc::new(move |_: Message| {
                count.fetch_add(1, Ordering::SeqCst);
            }),
            SubscribeConfig::default(),
        )
        .unwrap();
    }

    stub.deliver(&delivery("SUBJECT", "TYPE", 1), true).unwrap();
    std::thread::sleep(Duration::from_millis(200));
    assert_eq!(count.load(Ordering::SeqCst), 0);

    conn.start().unwrap();
    stub.deliver(&delivery("SUBJECT", "TYPE", 2), true).unwrap();
    let deadline = std::time::Instant::now() + WAIT;
    while count.load(Ordering::SeqCst) == 0 {
        assert!(std::time::Instant::now() < deadline, "message never arrived");
        std::thread::sleep(Duration::from_millis(20));
    }
}
