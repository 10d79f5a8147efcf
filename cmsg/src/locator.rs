//! Locator parsing and list expansion.
//!
//! A locator has the shape `cmsg:<domain>://<remainder>` where the leading
//! `cmsg:` is optional and matching is case-insensitive. A locator argument
//! may be a semicolon-separated list; connect expands `configFile` entries,
//! verifies single-domain membership, removes duplicates, and reconstructs
//! one canonical locator for the chosen domain plug-in.

use crate::error::{CmsgError, CmsgResult};
use crate::sys;
use cmsg_proto::ids;
use regex::Regex;
use std::fs;
use std::path::Path;
use std::sync::OnceLock;

/// One parsed top-level entry: its full text, domain, and the
/// domain-specific remainder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedLocator {
    pub locator: String,
    pub domain: String,
    pub remainder: String,
}

/// Result of full locator-list processing.
#[derive(Debug, Clone)]
pub struct ResolvedLocator {
    /// Domain shared by every entry.
    pub domain: String,
    /// Canonical semicolon-joined locator handed to the domain client.
    pub canonical: String,
    /// The de-duplicated entries, in order.
    pub entries: Vec<ParsedLocator>,
}

/// A cMsg-domain entry broken into its constituent parts. Invalid entries
/// are kept in failover lists with `valid == false` so index arithmetic
/// matches the original list.
#[derive(Debug, Clone)]
pub struct CmsgDomainLocator {
    pub locator: String,
    pub host: String,
    pub port: u16,
    pub subdomain: String,
    pub sub_remainder: String,
    pub password: Option<String>,
    pub must_broadcast: bool,
    pub broadcast_timeout_secs: u32,
    pub valid: bool,
}

/// An RC-domain remainder broken into its parts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RcDomainLocator {
    pub host: String,
    pub port: u16,
    pub expid: Option<String>,
    pub broadcast_timeout_secs: u32,
    pub connect_timeout_secs: u32,
    pub must_broadcast: bool,
}

fn top_level_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)^(?:cmsg:)?([A-Za-z0-9_-]+)://(.*)$").expect("locator regex"))
}

fn cmsg_remainder_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^([a-zA-Z0-9\.\-]+):?([0-9]+)?/?([a-zA-Z0-9]+)?/?(.*)$")
            .expect("cmsg remainder regex")
    })
}

fn rc_remainder_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^(([a-zA-Z][a-zA-Z0-9\.\-]*)|([0-9]+\.[0-9\.]+))?:?([0-9]+)?/?(.*)$")
            .expect("rc remainder regex")
    })
}

/// Extracts a case-insensitive `tag=value` query option from a remainder.
fn query_option<'a>(remainder: &'a str, tag: &str, value_pat: &str) -> Option<&'a str> {
    let pat = format!(r"(?i)[&\?]{tag}=({value_pat})");
    let re = Regex::new(&pat).expect("option regex");
    re.captures(remainder)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str())
}

/// Parses a single top-level locator into (domain, remainder).
pub fn parse_one(locator: &str) -> CmsgResult<ParsedLocator> {
    let caps = top_level_re()
        .captures(locator.trim())
        .ok_or(CmsgError::BadFormat)?;
    Ok(ParsedLocator {
        locator: locator.trim().to_string(),
        domain: caps[1].to_string(),
        remainder: caps[2].to_string(),
    })
}

/// Splits a semicolon-separated locator list and parses every entry.
pub fn split_list(input: &str) -> CmsgResult<Vec<ParsedLocator>> {
    let entries: Vec<ParsedLocator> = input
        .split(';')
        .filter(|s| !s.trim().is_empty())
        .map(parse_one)
        .collect::<CmsgResult<_>>()?;
    if entries.is_empty() {
        return Err(CmsgError::BadArgument);
    }
    Ok(entries)
}

/// Reads a configFile-domain file: the first non-comment, non-blank line
/// containing `://` is the substitute locator.
pub fn read_config_file(path: &Path) -> CmsgResult<String> {
    let content = fs::read_to_string(path).map_err(|_| CmsgError::Error)?;
    for line in content.lines() {
        let line = line.trim();
        if line.starts_with('#') || line.len() < 5 || !line.contains("://") {
            continue;
        }
        return Ok(line.to_string());
    }
    Err(CmsgError::Error)
}

/// Expands configFile entries in place. Expansion is single-level: a file
/// whose locator mentions the configFile domain again is a format error.
pub fn expand_config_files(list: Vec<ParsedLocator>) -> CmsgResult<Vec<ParsedLocator>> {
    let mut out = Vec::with_capacity(list.len());
    for entry in list {
        if !entry.domain.eq_ignore_ascii_case("configFile") {
            out.push(entry);
            continue;
        }
        let substitute = read_config_file(Path::new(&entry.remainder))?;
        if substitute.to_lowercase().contains("configfile") {
            return Err(CmsgError::BadFormat);
        }
        out.extend(split_list(&substitute)?);
    }
    if out.is_empty() {
        return Err(CmsgError::BadFormat);
    }
    Ok(out)
}

/// Verifies that every entry belongs to `domain` (case-insensitively).
pub fn ensure_same_domain(domain: &str, list: &[ParsedLocator]) -> CmsgResult<()> {
    if list
        .iter()
        .all(|e| e.domain.eq_ignore_ascii_case(domain))
    {
        Ok(())
    } else {
        Err(CmsgError::WrongDomainType)
    }
}

/// Removes duplicate entries by remainder equality, keeping the first
/// occurrence.
pub fn remove_duplicates(list: Vec<ParsedLocator>) -> Vec<ParsedLocator> {
    let mut out: Vec<ParsedLocator> = Vec::with_capacity(list.len());
    for entry in list {
        if out.iter().any(|e| e.remainder == entry.remainder) {
            tracing::warn!(remainder = %entry.remainder, "duplicate locator removed from list");
            continue;
        }
        out.push(entry);
    }
    out
}

/// Rebuilds the canonical semicolon-joined locator for a domain.
pub fn reconstruct(domain: &str, list: &[ParsedLocator]) -> String {
    list.iter()
        .map(|e| format!("cMsg:{}://{}", domain, e.remainder))
        .collect::<Vec<_>>()
        .join(";")
}

/// Runs the whole pipeline: split, expand configFiles, check domains,
/// de-duplicate, reconstruct.
pub fn resolve(input: &str) -> CmsgResult<ResolvedLocator> {
    let list = split_list(input)?;
    let list = expand_config_files(list)?;
    let domain = list[0].domain.clone();
    ensure_same_domain(&domain, &list)?;
    let entries = remove_duplicates(list);
    let canonical = reconstruct(&domain, &entries);
    Ok(ResolvedLocator {
        domain,
        canonical,
        entries,
    })
}

/// Parses a cMsg-domain entry. A parse failure yields an entry with
/// `valid == false` rather than an error so failover lists keep their
/// positions; a hard failure (no entries at all) is reported by the
/// caller.
pub fn parse_cmsg_domain(entry: &ParsedLocator) -> CmsgDomainLocator {
    let mut parsed = CmsgDomainLocator {
        locator: entry.locator.clone(),
        host: String::new(),
        port: 0,
        subdomain: "cMsg".to_string(),
        sub_remainder: String::new(),
        password: None,
        must_broadcast: false,
        broadcast_timeout_secs: 0,
        valid: false,
    };

    let caps = match cmsg_remainder_re().captures(&entry.remainder) {
        Some(c) => c,
        None => return parsed,
    };
    let host = match caps.get(1) {
        Some(m) => m.as_str(),
        None => return parsed,
    };
    if host.eq_ignore_ascii_case("broadcast") || host == "255.255.255.255" {
        parsed.must_broadcast = true;
        parsed.host = "255.255.255.255".to_string();
    } else if host.eq_ignore_ascii_case("localhost") {
        parsed.host = sys::local_host_name();
    } else {
        parsed.host = host.to_string();
    }

    let port = match caps.get(2) {
        Some(m) => match m.as_str().parse::<u32>() {
            Ok(p) => p,
            Err(_) => return parsed,
        },
        None if parsed.must_broadcast => ids::NAME_SERVER_BROADCAST_PORT as u32,
        None => ids::NAME_SERVER_PORT as u32,
    };
    if !(1024..=65535).contains(&port) {
        return parsed;
    }
    parsed.port = port as u16;

    if let Some(m) = caps.get(3) {
        parsed.subdomain = m.as_str().to_string();
    }

    let tail = caps.get(4).map_or("", |m| m.as_str());
    parsed.sub_remainder = tail.split('?').next().unwrap_or("").to_string();
    parsed.password = query_option(tail, "cmsgpassword", "[a-zA-Z0-9]+").map(str::to_string);
    if let Some(to) = query_option(tail, "broadcastTO", "[0-9]+") {
        parsed.broadcast_timeout_secs = to.parse().unwrap_or(0);
    }

    parsed.valid = true;
    parsed
}

/// Parses an RC-domain remainder. A missing expid falls back to the
/// `EXPID` environment variable; absence of both is an error.
pub fn parse_rc_domain(remainder: &str) -> CmsgResult<RcDomainLocator> {
    let caps = rc_remainder_re()
        .captures(remainder)
        .ok_or(CmsgError::BadFormat)?;

    let (host, must_broadcast) = match caps.get(1).map(|m| m.as_str()) {
        None | Some("") => ("255.255.255.255".to_string(), true),
        Some(h) if h.eq_ignore_ascii_case("broadcast") || h == "255.255.255.255" => {
            ("255.255.255.255".to_string(), true)
        }
        Some(h) if h.eq_ignore_ascii_case("localhost") => (sys::local_host_name(), false),
        Some(h) => (h.to_string(), false),
    };

    let port = match caps.get(4) {
        Some(m) => m.as_str().parse::<u32>().map_err(|_| CmsgError::BadFormat)?,
        None => ids::RC_BROADCAST_PORT as u32,
    };
    if !(1024..=65535).contains(&port) {
        return Err(CmsgError::OutOfRange);
    }

    let tail = caps.get(5).map_or("", |m| m.as_str());
    let expid = query_option(tail, "expid", r"[^&]+")
        .map(str::to_string)
        .or_else(|| std::env::var("EXPID").ok());

    let broadcast_timeout_secs = query_option(tail, "broadcastTO", "[0-9]+")
        .and_then(|v| v.parse().ok())
        .unwrap_or(0);
    let connect_timeout_secs = query_option(tail, "connectTO", "[0-9]+")
        .and_then(|v| v.parse().ok())
        .unwrap_or(0);

    Ok(RcDomainLocator {
        host,
        port: port as u16,
        expid,
        broadcast_timeout_secs,
        connect_timeout_secs,
        must_broadcast,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn optional_prefix_and_case_are_accepted() {
        for text in [
            "cMsg:cMsg://host:45000/cMsg/test",
            "CMSG:cmsg://host:45000/cMsg/test",
            "cmsg://host:45000/cMsg/test",
        ] {
            let p = parse_one(text).unwrap();
            assert!(p.domain.eq_ignore_ascii_case("cmsg"));
            assert_eq!(p.remainder, "host:45000/cMsg/test");
        }
        assert_eq!(parse_one("nonsense"), Err(CmsgError::BadFormat));
    }

    #[test]
    fn cmsg_domain_entry_parses_options() {
        let entry = parse_one("cMsg:cMsg://localhost:45000/mySub/the/rest?cmsgpassword=abc&broadcastTO=7").unwrap();
        let p = parse_cmsg_domain(&entry);
        assert!(p.valid);
        assert_eq!(p.port, 45000);
        assert_eq!(p.subdomain, "mySub");
        assert_eq!(p.sub_remainder, "the/rest");
        assert_eq!(p.password.as_deref(), Some("abc"));
        assert_eq!(p.broadcast_timeout_secs, 7);
        assert!(!p.must_broadcast);
        assert!(!p.host.is_empty());
    }

    #[test]
    fn cmsg_domain_defaults() {
        let entry = parse_one("cmsg://somehost").unwrap();
        let p = parse_cmsg_domain(&entry);
        assert!(p.valid);
        assert_eq!(p.port, ids::NAME_SERVER_PORT);
        assert_eq!(p.subdomain, "cMsg");
        assert_eq!(p.sub_remainder, "");

        let entry = parse_one("cmsg://broadcast").unwrap();
        let p = parse_cmsg_domain(&entry);
        assert!(p.must_broadcast);
        assert_eq!(p.port, ids::NAME_SERVER_BROADCAST_PORT);
    }

    #[test]
    fn out_of_range_port_invalidates_the_entry() {
        let entry = parse_one("cmsg://host:80/cMsg/x").unwrap();
        assert!(!parse_cmsg_domain(&entry).valid);
    }

    #[test]
    fn rc_domain_defaults_to_broadcast() {
        let p = parse_rc_domain("?expid=carlExp&broadcastTO=2&connectTO=5").unwrap();
        assert!(p.must_broadcast);
        assert_eq!(p.host, "255.255.255.255");
        assert_eq!(p.port, ids::RC_BROADCAST_PORT);
        assert_eq!(p.expid.as_deref(), Some("carlExp"));
        assert_eq!(p.broadcast_timeout_secs, 2);
        assert_eq!(p.connect_timeout_secs, 5);
    }
}
