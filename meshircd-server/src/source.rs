//! Who a request came from, and which link it arrived on.

use crate::router::LinkId;

/// Display identity of a user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub nick: String,
    pub user: String,
    pub host: String,
}

impl Identity {
    pub fn new(nick: &str, user: &str, host: &str) -> Self {
        Self {
            nick: nick.to_string(),
            user: user.to_string(),
            host: host.to_string(),
        }
    }

    pub fn hostmask(&self) -> String {
        format!("{}!{}@{}", self.nick, self.user, self.host)
    }

    /// Parse `nick!user@host`. Missing parts become `*`.
    pub fn from_prefix(prefix: &str) -> Self {
        let (nick, rest) = prefix.split_once('!').unwrap_or((prefix, "*@*"));
        let (user, host) = rest.split_once('@').unwrap_or((rest, "*"));
        Self::new(nick, user, host)
    }
}

/// Origin of a topic request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Source {
    /// A client connected directly to this server.
    Local { link: LinkId, ident: Identity },
    /// A user elsewhere in the mesh, reached through `link`.
    Remote { link: LinkId, ident: Identity },
    /// A peer server acting on its own behalf (topic bursts after a link comes up).
    Server { link: LinkId, name: String },
}

impl Source {
    /// Parse the prefix of a line received on peer link `link`. A prefix with
    /// `!` is a remote user, anything else is a server name. No prefix means
    /// the peer itself.
    pub fn from_peer_prefix(link: LinkId, peer_name: &str, prefix: Option<&str>) -> Self {
        match prefix {
            Some(p) if p.contains('!') => Source::Remote {
                link,
                ident: Identity::from_prefix(p),
            },
            Some(p) => Source::Server {
                link,
                name: p.to_string(),
            },
            None => Source::Server {
                link,
                name: peer_name.to_string(),
            },
        }
    }

    /// The link the request arrived on.
    pub fn link(&self) -> LinkId {
        match self {
            Source::Local { link, .. } | Source::Remote { link, .. } | Source::Server { link, .. } => *link,
        }
    }

    /// True only for clients directly connected to this server.
    pub fn is_local_user(&self) -> bool {
        matches!(self, Source::Local { .. })
    }

    pub fn is_server(&self) -> bool {
        matches!(self, Source::Server { .. })
    }

    /// Nick for users, server name for servers.
    pub fn name(&self) -> &str {
        match self {
            Source::Local { ident, .. } | Source::Remote { ident, .. } => &ident.nick,
            Source::Server { name, .. } => name,
        }
    }

    /// Line prefix identifying this source on the wire.
    pub fn prefix(&self) -> String {
        match self {
            Source::Local { ident, .. } | Source::Remote { ident, .. } => ident.hostmask(),
            Source::Server { name, .. } => name.clone(),
        }
    }

    pub fn ident(&self) -> Option<&Identity> {
        match self {
            Source::Local { ident, .. } | Source::Remote { ident, .. } => Some(ident),
            Source::Server { .. } => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hostmask_round_trips_through_prefix() {
        let ident = Identity::from_prefix("alice!al@example.org");
        assert_eq!(ident, Identity::new("alice", "al", "example.org"));
        assert_eq!(ident.hostmask(), "alice!al@example.org");
    }

    #[test]
    fn peer_prefix_classifies_users_and_servers() {
        let link = LinkId::next();
        let user = Source::from_peer_prefix(link, "hub.test", Some("bob!b@h"));
        assert!(matches!(user, Source::Remote { .. }));
        assert_eq!(user.name(), "bob");

        let server = Source::from_peer_prefix(link, "hub.test", Some("leaf.test"));
        assert!(server.is_server());
        assert_eq!(server.prefix(), "leaf.test");

        let bare = Source::from_peer_prefix(link, "hub.test", None);
        assert_eq!(bare.name(), "hub.test");
        assert_eq!(bare.link(), link);
        assert!(!bare.is_local_user());
    }
}
