//! Process-wide metadata registry for live transport instances.
//!
//! The owning transport is the only writer for its entry; third parties
//! read cloned snapshots for introspection (protocol stack, addresses).

use std::{
    collections::HashMap,
    fmt,
    sync::atomic::{AtomicU64, Ordering},
};

use multiaddr::Multiaddr;
use once_cell::sync::Lazy;
use parking_lot::RwLock;

use crate::traits::Kind;

static REGISTRY: Lazy<RwLock<HashMap<InstanceId, StreamMetadata>>> =
    Lazy::new(|| RwLock::new(HashMap::new()));

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

/// Unique identifier of a transport instance within this process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct InstanceId(u64);

impl InstanceId {
    pub(crate) fn next() -> Self {
        Self(NEXT_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Introspection metadata attached to a transport instance.
#[derive(Debug, Clone, Default)]
pub struct StreamMetadata {
    /// Handlers installed over the instance's lifetime, oldest first, each
    /// with the role it ran under.
    pub stack: Vec<(String, Kind)>,
    /// `(local, peer)` addresses, set once on connect/adopt.
    pub addr_info: Option<(Multiaddr, Multiaddr)>,
}

/// Snapshot of an instance's metadata, if it is live.
pub fn snapshot(id: InstanceId) -> Option<StreamMetadata> {
    REGISTRY.read().get(&id).cloned()
}

/// The instance's handler stack, if it is live.
pub fn stack(id: InstanceId) -> Option<Vec<(String, Kind)>> {
    REGISTRY.read().get(&id).map(|meta| meta.stack.clone())
}

/// The instance's `(local, peer)` addresses, if it is live and connected.
pub fn addr_info(id: InstanceId) -> Option<(Multiaddr, Multiaddr)> {
    REGISTRY.read().get(&id).and_then(|meta| meta.addr_info.clone())
}

pub(crate) fn insert(id: InstanceId, meta: StreamMetadata) {
    REGISTRY.write().insert(id, meta);
}

pub(crate) fn remove(id: InstanceId) {
    REGISTRY.write().remove(&id);
}

pub(crate) fn push_stack(id: InstanceId, protocol: &str, kind: Kind) {
    if let Some(meta) = REGISTRY.write().get_mut(&id) {
        meta.stack.push((protocol.to_string(), kind));
    }
}

pub(crate) fn set_top_kind(id: InstanceId, kind: Kind) {
    if let Some(meta) = REGISTRY.write().get_mut(&id) {
        if let Some(top) = meta.stack.last_mut() {
            top.1 = kind;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ids_are_unique() {
        let a = InstanceId::next();
        let b = InstanceId::next();
        assert_ne!(a, b);
    }

    #[test]
    fn test_stack_lifecycle() {
        let id = InstanceId::next();
        insert(
            id,
            StreamMetadata {
                stack: vec![("/multistream/1.0.0".to_string(), Kind::Server)],
                addr_info: None,
            },
        );

        push_stack(id, "/echo/1.0.0", Kind::Server);
        set_top_kind(id, Kind::Client);
        let stack = stack(id).unwrap();
        assert_eq!(
            stack,
            vec![
                ("/multistream/1.0.0".to_string(), Kind::Server),
                ("/echo/1.0.0".to_string(), Kind::Client),
            ]
        );

        remove(id);
        assert!(snapshot(id).is_none());
    }

    #[test]
    fn test_missing_instance_reads_as_none() {
        let id = InstanceId::next();
        assert!(snapshot(id).is_none());
        assert!(addr_info(id).is_none());
        push_stack(id, "/echo/1.0.0", Kind::Client);
        assert!(stack(id).is_none());
    }
}
