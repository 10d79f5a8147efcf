//! Process-wide domain registry and unique-id counter.
//!
//! Both singletons deliberately span all connections: server-visible
//! unique ids must never collide between two connections in the same
//! process, and domain registration happens exactly once.

use crate::domain::DomainClient;
use crate::error::{CmsgError, CmsgResult};
use crate::locator::ResolvedLocator;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::OnceLock;

/// Maximum number of domain types a process can register.
pub(crate) const MAX_DOMAIN_TYPES: usize = 20;

/// Builds a connected built-in domain client from a resolved locator.
pub(crate) type DomainConstructor =
    fn(&ResolvedLocator, &str, &str) -> CmsgResult<DomainClient>;

/// Builds a connected user-registered domain implementation.
#[cfg(feature = "dynamic-domains")]
pub type DynamicConstructor = fn(
    &ResolvedLocator,
    &str,
    &str,
) -> CmsgResult<std::sync::Arc<dyn crate::domain::DynamicDomain>>;

/// How a domain name resolves.
pub(crate) enum Resolver {
    Builtin(DomainConstructor),
    #[cfg(feature = "dynamic-domains")]
    Dynamic(DynamicConstructor),
}

struct Registry {
    builtin: Vec<(&'static str, DomainConstructor)>,
    #[cfg(feature = "dynamic-domains")]
    dynamic: Vec<(&'static str, DynamicConstructor)>,
}

static REGISTRY: OnceLock<Mutex<Registry>> = OnceLock::new();
static NEXT_UNIQUE_ID: AtomicI32 = AtomicI32::new(1);

fn registry() -> &'static Mutex<Registry> {
    REGISTRY.get_or_init(|| {
        Mutex::new(Registry {
            builtin: vec![
                ("cmsg", crate::domain::cmsg::connect as DomainConstructor),
                ("rc", crate::domain::rc::connect as DomainConstructor),
                ("file", crate::domain::file::connect as DomainConstructor),
            ],
            #[cfg(feature = "dynamic-domains")]
            dynamic: Vec::new(),
        })
    })
}

/// Looks up the constructor registered for a domain, case-insensitively.
pub(crate) fn lookup(domain: &str) -> CmsgResult<Resolver> {
    let reg = registry().lock();
    if let Some((_, ctor)) = reg
        .builtin
        .iter()
        .find(|(name, _)| name.eq_ignore_ascii_case(domain))
    {
        return Ok(Resolver::Builtin(*ctor));
    }
    #[cfg(feature = "dynamic-domains")]
    if let Some((_, ctor)) = reg
        .dynamic
        .iter()
        .find(|(name, _)| name.eq_ignore_ascii_case(domain))
    {
        return Ok(Resolver::Dynamic(*ctor));
    }
    Err(CmsgError::BadDomainType)
}

/// Registers an additional, statically linked domain implementation.
/// The permanent cmsg/rc/file domains cannot be replaced.
#[cfg(feature = "dynamic-domains")]
pub fn register_domain(name: &'static str, constructor: DynamicConstructor) -> CmsgResult<()> {
    let mut reg = registry().lock();
    let taken = reg
        .builtin
        .iter()
        .any(|(existing, _)| existing.eq_ignore_ascii_case(name))
        || reg
            .dynamic
            .iter()
            .any(|(existing, _)| existing.eq_ignore_ascii_case(name));
    if taken {
        return Err(CmsgError::AlreadyExists);
    }
    if reg.builtin.len() + reg.dynamic.len() >= MAX_DOMAIN_TYPES {
        return Err(CmsgError::LimitExceeded);
    }
    reg.dynamic.push((name, constructor));
    Ok(())
}

/// The next process-local unique id, used for subscriptions and pending
/// request correlation.
pub(crate) fn next_unique_id() -> i32 {
    NEXT_UNIQUE_ID.fetch_add(1, Ordering::SeqCst)
}
