//! The file domain: messages append to a file.

use cmsg::{connect, CmsgError, Message};

#[test]
fn sends_append_text_lines() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("sink.log");
    let locator = format!("cMsg:file://{}", path.display());

    let conn = connect(&locator, "logger", "file sink").unwrap();
    assert_eq!(conn.domain(), "file");
    conn.send(&Message::new("s", "t").with_text("first line")).unwrap();
    conn.send(&Message::new("s", "t").with_text("second line")).unwrap();
    assert_eq!(
        conn.sync_send(&Message::new("s", "t").with_text("third"), None).unwrap(),
        0
    );
    conn.flush(None).unwrap();
    conn.disconnect().unwrap();

    let content = std::fs::read_to_string(&path).unwrap();
    assert_eq!(content, "first line\nsecond line\nthird\n");
}

#[test]
fn subscription_operations_are_not_implemented() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("sink.log");
    let conn = connect(&format!("file://{}", path.display()), "logger", "d").unwrap();

    assert!(matches!(
        conn.subscribe(
            "s",
            "t",
            std::sync::Arc::new(|_: Message| {}),
            cmsg::SubscribeConfig::default()
        ),
        Err(CmsgError::NotImplemented)
    ));
    assert!(matches!(
        conn.send_and_get(&Message::new("s", "t"), None),
        Err(CmsgError::NotImplemented)
    ));
}
