//! Propagation router: per-link outbound queues and scoped fan-out.
//!
//! Every connection, client or peer server, registers one bounded outbound
//! queue here. Sends never block: a full or closed queue drops the line for
//! that link only and bumps its drop counter. Ordering is per link.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use parking_lot::RwLock;
use tokio::sync::mpsc;

/// Identifies one connection (client or peer link) for the lifetime of the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LinkId(u64);

impl LinkId {
    /// Allocate a fresh, never-reused id.
    pub fn next() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for LinkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "link-{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkKind {
    Client,
    Peer,
}

/// Who receives a fan-out.
#[derive(Debug, Clone, Copy)]
pub enum Scope<'a> {
    /// Every registered peer server.
    Mesh,
    /// The given links (local channel members).
    Members(&'a [LinkId]),
}

/// Outcome of a fan-out, mostly for logging and tests.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Delivery {
    pub sent: usize,
    pub dropped: usize,
}

struct Link {
    kind: LinkKind,
    name: String,
    tx: mpsc::Sender<String>,
    dropped: AtomicU64,
    violations: AtomicU32,
}

#[derive(Default)]
pub struct Router {
    links: RwLock<HashMap<LinkId, Link>>,
}

impl Router {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a link under a freshly allocated id.
    pub fn register(&self, kind: LinkKind, name: &str, tx: mpsc::Sender<String>) -> LinkId {
        let id = LinkId::next();
        self.register_as(id, kind, name, tx);
        id
    }

    /// Register a link under an id chosen by the caller (peer links allocate
    /// their id before the handshake completes).
    pub fn register_as(&self, id: LinkId, kind: LinkKind, name: &str, tx: mpsc::Sender<String>) {
        let link = Link {
            kind,
            name: name.to_string(),
            tx,
            dropped: AtomicU64::new(0),
            violations: AtomicU32::new(0),
        };
        self.links.write().insert(id, link);
        tracing::debug!(link = %id, ?kind, name, "Link registered");
    }

    pub fn unregister(&self, id: LinkId) {
        if let Some(link) = self.links.write().remove(&id) {
            tracing::debug!(link = %id, kind = ?link.kind, name = %link.name, "Link unregistered");
        }
    }

    /// Queue one line for one link. Returns false if it was dropped.
    pub fn send_one(&self, id: LinkId, line: &str) -> bool {
        let links = self.links.read();
        match links.get(&id) {
            Some(link) => Self::deliver(id, link, line),
            None => false,
        }
    }

    /// Queue `line` for every link in `scope` that is not in `exclude`.
    pub fn fan_out(&self, scope: Scope<'_>, exclude: &[LinkId], line: &str) -> Delivery {
        let links = self.links.read();
        let mut delivery = Delivery::default();
        let mut push = |id: LinkId, link: &Link| {
            if Self::deliver(id, link, line) {
                delivery.sent += 1;
            } else {
                delivery.dropped += 1;
            }
        };
        match scope {
            Scope::Mesh => {
                for (id, link) in links.iter() {
                    if link.kind == LinkKind::Peer && !exclude.contains(id) {
                        push(*id, link);
                    }
                }
            }
            Scope::Members(members) => {
                for id in members {
                    if exclude.contains(id) {
                        continue;
                    }
                    if let Some(link) = links.get(id) {
                        push(*id, link);
                    }
                }
            }
        }
        delivery
    }

    fn deliver(id: LinkId, link: &Link, line: &str) -> bool {
        match link.tx.try_send(line.to_string()) {
            Ok(()) => true,
            Err(e) => {
                let dropped = link.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                let reason = match e {
                    mpsc::error::TrySendError::Full(_) => "queue full",
                    mpsc::error::TrySendError::Closed(_) => "queue closed",
                };
                tracing::warn!(link = %id, name = %link.name, dropped, "Outbound line dropped: {reason}");
                false
            }
        }
    }

    /// Count a protocol violation against a link. Returns the new total.
    pub fn record_violation(&self, id: LinkId, reason: &str) -> u32 {
        let links = self.links.read();
        let Some(link) = links.get(&id) else {
            return 0;
        };
        let total = link.violations.fetch_add(1, Ordering::Relaxed) + 1;
        tracing::warn!(link = %id, name = %link.name, total, "Protocol violation: {reason}");
        total
    }

    pub fn violations(&self, id: LinkId) -> u32 {
        self.links
            .read()
            .get(&id)
            .map(|l| l.violations.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    pub fn dropped(&self, id: LinkId) -> u64 {
        self.links
            .read()
            .get(&id)
            .map(|l| l.dropped.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    pub fn kind(&self, id: LinkId) -> Option<LinkKind> {
        self.links.read().get(&id).map(|l| l.kind)
    }

    pub fn name(&self, id: LinkId) -> Option<String> {
        self.links.read().get(&id).map(|l| l.name.clone())
    }

    /// Registered peer links as `(id, server name)`.
    pub fn peers(&self) -> Vec<(LinkId, String)> {
        let mut peers: Vec<_> = self
            .links
            .read()
            .iter()
            .filter(|(_, l)| l.kind == LinkKind::Peer)
            .map(|(id, l)| (*id, l.name.clone()))
            .collect();
        peers.sort();
        peers
    }

    pub fn peer_by_name(&self, name: &str) -> Option<LinkId> {
        self.links
            .read()
            .iter()
            .find(|(_, l)| l.kind == LinkKind::Peer && l.name.eq_ignore_ascii_case(name))
            .map(|(id, _)| *id)
    }
}
