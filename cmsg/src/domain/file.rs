//! The file domain: an append-to-file message sink.

use crate::domain::DomainClient;
use crate::error::{CmsgError, CmsgResult};
use crate::locator::ResolvedLocator;
use crate::sys;
use cmsg_proto::message::now_ms;
use cmsg_proto::Message;
use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::io::Write;

/// A "connection" that appends every sent message to a file.
pub(crate) struct FileClient {
    file: Mutex<File>,
    name: String,
    host: String,
    text_only: bool,
}

pub fn connect(
    resolved: &ResolvedLocator,
    name: &str,
    _description: &str,
) -> CmsgResult<DomainClient> {
    let remainder = &resolved.entries[0].remainder;
    let (path, options) = match remainder.split_once('?') {
        Some((p, o)) => (p, o),
        None => (remainder.as_str(), ""),
    };
    if path.is_empty() {
        return Err(CmsgError::Error);
    }
    let text_only = !options.to_ascii_lowercase().contains("textonly=off");

    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|_| CmsgError::Error)?;
    Ok(DomainClient::File(FileClient {
        file: Mutex::new(file),
        name: name.to_string(),
        host: sys::local_host_name(),
        text_only,
    }))
}

impl FileClient {
    pub fn send(&self, msg: &Message) -> CmsgResult<()> {
        let line = if self.text_only {
            format!("{}\n", msg.text.as_deref().unwrap_or(""))
        } else {
            format!(
                "{} {}@{}:    [{} / {}] {}\n",
                now_ms(),
                self.name,
                self.host,
                msg.subject,
                msg.msg_type,
                msg.text.as_deref().unwrap_or("")
            )
        };
        self.file
            .lock()
            .write_all(line.as_bytes())
            .map_err(|_| CmsgError::Error)
    }

    pub fn sync_send(&self, msg: &Message) -> CmsgResult<i32> {
        self.send(msg)?;
        Ok(0)
    }

    pub fn flush(&self) -> CmsgResult<()> {
        self.file.lock().flush().map_err(|_| CmsgError::Error)
    }

    pub fn disconnect(&self) {
        let _ = self.file.lock().flush();
    }
}
