//! Channel lookup.
//!
//! The topic core never owns the channel table. It reaches channels through
//! the [`Directory`] trait so it can run against the live registry or a test
//! fixture alike.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use crate::channel::{Channel, Rank, normalize_channel};
use crate::source::Source;

/// A channel behind its own lock. All topic reads and writes happen with
/// this lock held.
pub type ChannelRef = Arc<Mutex<Channel>>;

/// Read access to channels plus the send-permission predicate.
pub trait Directory: Send + Sync {
    fn find_channel(&self, name: &str) -> Option<ChannelRef>;

    /// Whether `source` may speak in `channel` (bans and moderation live here).
    fn can_send(&self, source: &Source, channel: &Channel) -> bool;
}

/// In-memory channel table, keyed by lowercased name.
#[derive(Default)]
pub struct ChannelRegistry {
    channels: RwLock<HashMap<String, ChannelRef>>,
}

impl ChannelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the channel, creating it with `creation_ts` if it is unknown.
    /// The bool is true when this call created it.
    pub fn get_or_create(&self, name: &str, creation_ts: u64) -> (ChannelRef, bool) {
        let key = normalize_channel(name);
        if let Some(ch) = self.channels.read().get(&key) {
            return (Arc::clone(ch), false);
        }
        let mut channels = self.channels.write();
        if let Some(ch) = channels.get(&key) {
            return (Arc::clone(ch), false);
        }
        let ch = Arc::new(Mutex::new(Channel::new(name, creation_ts)));
        channels.insert(key, Arc::clone(&ch));
        tracing::debug!(channel = name, creation_ts, "Channel created");
        (ch, true)
    }

    /// Insert a fully built channel. Used by fixtures and simulations.
    pub fn insert(&self, channel: Channel) -> ChannelRef {
        let key = normalize_channel(channel.name());
        let ch = Arc::new(Mutex::new(channel));
        self.channels.write().insert(key, Arc::clone(&ch));
        ch
    }

    /// Run `f` on the named channel with its lock held, creating the channel
    /// if it is unknown. `f` also gets whether this call created it. A channel
    /// that was removed between lookup and lock is looked up again.
    pub fn with_live_channel<R>(
        &self,
        name: &str,
        creation_ts: u64,
        f: impl FnOnce(&mut Channel, bool) -> R,
    ) -> R {
        loop {
            let (handle, created) = self.get_or_create(name, creation_ts);
            let mut channel = handle.lock();
            if channel.is_detached() {
                continue;
            }
            return f(&mut *channel, created);
        }
    }

    /// Drop a channel if it has no local members left. The emptiness check
    /// and the removal happen under the table's write lock, and the channel
    /// is marked detached so late holders of its handle can tell.
    pub fn remove_if_empty(&self, name: &str) -> bool {
        let key = normalize_channel(name);
        let mut channels = self.channels.write();
        let removed = match channels.get(&key) {
            Some(ch) => {
                let mut ch = ch.lock();
                if ch.is_empty() {
                    ch.detach();
                }
                ch.is_detached()
            }
            None => false,
        };
        if removed {
            channels.remove(&key);
            tracing::debug!(channel = name, "Channel destroyed");
        }
        removed
    }

    /// Snapshot of every channel handle, for bursts and cleanup.
    pub fn all(&self) -> Vec<ChannelRef> {
        self.channels.read().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.channels.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.channels.read().is_empty()
    }
}

impl Directory for ChannelRegistry {
    fn find_channel(&self, name: &str) -> Option<ChannelRef> {
        self.channels.read().get(&normalize_channel(name)).cloned()
    }

    fn can_send(&self, source: &Source, channel: &Channel) -> bool {
        if source.is_server() {
            return true;
        }
        match channel.membership(source) {
            Some(member) if member.rank >= Rank::Voice => true,
            Some(_) => !channel.modes.moderated,
            None => !(channel.modes.moderated || channel.modes.no_external),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::Membership;
    use crate::router::LinkId;
    use crate::source::Identity;

    fn local(link: LinkId) -> Source {
        Source::Local { link, ident: Identity::new("n", "u", "h") }
    }

    #[test]
    fn lookup_is_case_insensitive_and_create_is_idempotent() {
        let registry = ChannelRegistry::new();
        let (_, created) = registry.get_or_create("#Rust", 100);
        assert!(created);
        let (ch, created) = registry.get_or_create("#rust", 999);
        assert!(!created);
        assert_eq!(ch.lock().creation_ts(), 100);
        assert!(registry.find_channel("#RUST").is_some());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn empty_channels_are_removed() {
        let registry = ChannelRegistry::new();
        registry.get_or_create("&tmp", 1);
        assert!(registry.remove_if_empty("&tmp"));
        assert!(registry.find_channel("&tmp").is_none());
    }

    #[test]
    fn removed_channel_is_detached_and_recreated_on_next_use() {
        let registry = ChannelRegistry::new();
        let (stale, _) = registry.get_or_create("&tmp", 1);
        assert!(registry.remove_if_empty("&tmp"));
        assert!(stale.lock().is_detached());

        let created = registry.with_live_channel("&tmp", 2, |ch, created| {
            assert!(!ch.is_detached());
            assert_eq!(ch.creation_ts(), 2);
            created
        });
        assert!(created);
        let fresh = registry.find_channel("&tmp").unwrap();
        assert!(!Arc::ptr_eq(&stale, &fresh));
    }

    #[test]
    fn occupied_channel_is_not_removed() {
        let registry = ChannelRegistry::new();
        let link = LinkId::next();
        registry.with_live_channel("&busy", 1, |ch, _| {
            ch.add_member(
                link,
                Membership { nick: "n".into(), hostmask: "n!u@h".into(), rank: Rank::Op, delayed_join: false },
            );
        });
        assert!(!registry.remove_if_empty("&busy"));
        assert!(!registry.find_channel("&busy").unwrap().lock().is_detached());
    }

    #[test]
    fn join_racing_last_part_never_lands_in_a_removed_channel() {
        let registry = ChannelRegistry::new();
        std::thread::scope(|s| {
            for _ in 0..4 {
                s.spawn(|| {
                    let link = LinkId::next();
                    for _ in 0..500 {
                        registry.with_live_channel("&churn", 1, |ch, _| {
                            ch.add_member(
                                link,
                                Membership {
                                    nick: "n".into(),
                                    hostmask: "n!u@h".into(),
                                    rank: Rank::None,
                                    delayed_join: false,
                                },
                            );
                        });
                        // While we are a member the channel must stay registered.
                        let handle = registry.find_channel("&churn").expect("member's channel is registered");
                        assert!(handle.lock().remove_member(link).is_some());
                        registry.remove_if_empty("&churn");
                    }
                });
            }
        });
        assert!(registry.find_channel("&churn").is_none());
    }

    #[test]
    fn send_predicate_follows_moderation() {
        let registry = ChannelRegistry::new();
        let link = LinkId::next();
        let outsider = LinkId::next();
        let mut channel = Channel::new("#a", 1);
        channel.add_member(
            link,
            Membership { nick: "n".into(), hostmask: "n!u@h".into(), rank: Rank::None, delayed_join: false },
        );

        assert!(registry.can_send(&local(link), &channel));
        assert!(!registry.can_send(&local(outsider), &channel));

        channel.modes.moderated = true;
        assert!(!registry.can_send(&local(link), &channel));
        channel.member_mut(link).unwrap().rank = Rank::Voice;
        assert!(registry.can_send(&local(link), &channel));

        let server = Source::Server { link: outsider, name: "s.test".into() };
        assert!(registry.can_send(&server, &channel));
    }
}
