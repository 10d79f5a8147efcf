//! Per-connection monitoring counters and the keep-alive report.

use crate::subscription::SubscriptionTable;
use cmsg_proto::MonitorCounts;
use std::fmt::Write;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

/// Counter block for one connection. Totals only ever grow; the two
/// pending gauges track in-flight request/response calls.
#[derive(Debug, Default)]
pub struct MonitorStats {
    pub tcp_sends: AtomicU64,
    pub udp_sends: AtomicU64,
    pub sync_sends: AtomicU64,
    pub send_and_gets: AtomicU64,
    pub subscribe_and_gets: AtomicU64,
    pub subscribes: AtomicU64,
    pub unsubscribes: AtomicU64,
    pub pending_send_and_gets: AtomicU32,
    pub pending_subscribe_and_gets: AtomicU32,
}

impl MonitorStats {
    pub fn snapshot(&self) -> MonitorCounts {
        MonitorCounts {
            pending_subscribe_and_gets: self.pending_subscribe_and_gets.load(Ordering::Relaxed),
            pending_send_and_gets: self.pending_send_and_gets.load(Ordering::Relaxed),
            tcp_sends: self.tcp_sends.load(Ordering::Relaxed),
            udp_sends: self.udp_sends.load(Ordering::Relaxed),
            sync_sends: self.sync_sends.load(Ordering::Relaxed),
            send_and_gets: self.send_and_gets.load(Ordering::Relaxed),
            subscribe_and_gets: self.subscribe_and_gets.load(Ordering::Relaxed),
            subscribes: self.subscribes.load(Ordering::Relaxed),
            unsubscribes: self.unsubscribes.load(Ordering::Relaxed),
        }
    }
}

// The server parses the report with fixed expectations about indents,
// attribute order, and line ends, so the rendering below is pinned
// byte-for-byte by the test at the bottom of this file.

/// Renders the subscription state as the XML fragment embedded in
/// keep-alive responses.
///
/// The server parses this text, so the layout is fixed byte-for-byte:
/// six-space indents for subscriptions, eight for callbacks, `\n` line
/// ends, and a callback id that counts across all subscriptions.
pub fn subscription_xml(table: &SubscriptionTable) -> String {
    let mut xml = String::new();
    let mut num = 0u32;
    table.for_each_active(|subject, msg_type, callbacks| {
        write!(
            xml,
            "      <subscription subject=\"{}\" type=\"{}\">\n",
            subject, msg_type
        )
        .expect("string write");
        for cb in callbacks {
            write!(
                xml,
                "        <callback id=\"{}\" received=\"{}\" cueSize=\"{}\"/>\n",
                num,
                cb.delivered(),
                cb.queued_len()
            )
            .expect("string write");
            num += 1;
        }
        xml.push_str("      </subscription>\n");
    });
    xml
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::subscription::{SubscribeConfig, SubscriptionTable};
    use cmsg_proto::Message;
    use std::sync::Arc;

    #[test]
    fn report_xml_is_byte_exact() {
        let table = SubscriptionTable::new();
        table
            .add(
                "SUBJECT",
                "TYPE",
                Arc::new(|_: Message| {}),
                SubscribeConfig::default(),
                "cMsg",
                "cMsg:cMsg://h/cMsg/x",
            )
            .ok();
        table
            .add(
                "SUBJECT",
                "TYPE",
                Arc::new(|_: Message| {}),
                SubscribeConfig::default(),
                "cMsg",
                "cMsg:cMsg://h/cMsg/x",
            )
            .ok();

        let expected = concat!(
            "      <subscription subject=\"SUBJECT\" type=\"TYPE\">\n",
            "        <callback id=\"0\" received=\"0\" cueSize=\"0\"/>\n",
            "        <callback id=\"1\" received=\"0\" cueSize=\"0\"/>\n",
            "      </subscription>\n",
        );
        assert_eq!(subscription_xml(&table), expected);
    }

    #[test]
    fn empty_table_renders_nothing() {
        assert_eq!(subscription_xml(&SubscriptionTable::new()), "");
    }
}
