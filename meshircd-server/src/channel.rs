//! Channel state: modes, local membership, and the replicated topic.

use std::collections::BTreeMap;

use crate::bounded::{SetterDisplay, TopicText};
use crate::router::LinkId;
use crate::source::Source;

/// Longest accepted channel name, in bytes.
pub const CHANNEL_LEN: usize = 200;

/// `#name` channels span the mesh; `&name` channels stay on one server.
pub fn is_channel_name(name: &str) -> bool {
    (name.starts_with('#') || name.starts_with('&'))
        && name.len() > 1
        && name.len() <= CHANNEL_LEN
        && !name.contains([' ', ',', '\x07', '\r', '\n'])
}

/// Channels that never leave the server they were created on.
pub fn is_local_channel(name: &str) -> bool {
    name.starts_with('&')
}

/// Registry key for a channel name.
pub fn normalize_channel(name: &str) -> String {
    name.to_lowercase()
}

/// Channel flag modes understood by this server.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChannelModes {
    /// +t: only half-ops and ops may change the topic.
    pub topic_limit: bool,
    /// +s: hidden from non-members.
    pub secret: bool,
    /// +m: only voiced users and above may speak.
    pub moderated: bool,
    /// +n: no messages from outside the channel.
    pub no_external: bool,
    /// +c: reject text carrying color codes.
    pub no_color: bool,
    /// +S: strip color codes from text.
    pub strip_color: bool,
    /// +D: joins stay hidden until the member does something visible.
    pub delayed_join: bool,
}

impl ChannelModes {
    /// Modes a freshly created channel starts with.
    pub fn initial() -> Self {
        Self {
            topic_limit: true,
            no_external: true,
            ..Self::default()
        }
    }

    /// Toggle a flag by its mode letter. Returns false for letters we don't know.
    /// `c` and `S` exclude each other: setting one clears the other.
    pub fn apply(&mut self, letter: char, on: bool) -> bool {
        match (letter, on) {
            ('c', true) => self.strip_color = false,
            ('S', true) => self.no_color = false,
            _ => {}
        }
        let flag = match letter {
            't' => &mut self.topic_limit,
            's' => &mut self.secret,
            'm' => &mut self.moderated,
            'n' => &mut self.no_external,
            'c' => &mut self.no_color,
            'S' => &mut self.strip_color,
            'D' => &mut self.delayed_join,
            _ => return false,
        };
        *flag = on;
        true
    }

    pub fn to_mode_string(&self) -> String {
        let mut m = String::from("+");
        if self.no_color { m.push('c'); }
        if self.delayed_join { m.push('D'); }
        if self.moderated { m.push('m'); }
        if self.no_external { m.push('n'); }
        if self.secret { m.push('s'); }
        if self.strip_color { m.push('S'); }
        if self.topic_limit { m.push('t'); }
        m
    }
}

/// Rank of a member within a channel.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord)]
pub enum Rank {
    #[default]
    None,
    Voice,
    HalfOp,
    Op,
}

impl Rank {
    pub fn prefix(&self) -> &'static str {
        match self {
            Rank::None => "",
            Rank::Voice => "+",
            Rank::HalfOp => "%",
            Rank::Op => "@",
        }
    }
}

/// A local client's membership in a channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Membership {
    pub nick: String,
    pub hostmask: String,
    pub rank: Rank,
    /// Joined under +D and not yet shown to the rest of the channel.
    pub delayed_join: bool,
}

impl Membership {
    pub fn can_set_limited_topic(&self) -> bool {
        self.rank >= Rank::HalfOp
    }
}

/// The replicated topic. Replaced as a whole, never field by field.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Topic {
    pub text: TopicText,
    pub setter: SetterDisplay,
    pub set_at: u64,
}

impl Topic {
    pub fn is_set(&self) -> bool {
        !self.text.is_empty()
    }
}

#[derive(Debug, Clone)]
pub struct Channel {
    name: String,
    creation_ts: u64,
    topic: Topic,
    pub modes: ChannelModes,
    members: BTreeMap<LinkId, Membership>,
    /// Removed from the registry; a handle still held elsewhere must not be joined.
    detached: bool,
}

impl Channel {
    pub fn new(name: &str, creation_ts: u64) -> Self {
        Self {
            name: name.to_string(),
            creation_ts,
            topic: Topic::default(),
            modes: ChannelModes::initial(),
            members: BTreeMap::new(),
            detached: false,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn creation_ts(&self) -> u64 {
        self.creation_ts
    }

    /// Adopt an older creation time announced by a peer. Newer ones are
    /// ignored. Returns true if ours changed.
    pub fn lower_creation_ts(&mut self, creation_ts: u64) -> bool {
        if creation_ts == 0 || creation_ts >= self.creation_ts {
            return false;
        }
        self.creation_ts = creation_ts;
        true
    }

    pub fn detach(&mut self) {
        self.detached = true;
    }

    pub fn is_detached(&self) -> bool {
        self.detached
    }

    pub fn is_local(&self) -> bool {
        is_local_channel(&self.name)
    }

    pub fn topic(&self) -> &Topic {
        &self.topic
    }

    /// Install a new topic in one assignment.
    pub fn replace_topic(&mut self, topic: Topic) {
        self.topic = topic;
    }

    /// Membership of a request's source. Only local clients have one here;
    /// remote membership is tracked by the servers those users are on.
    pub fn membership(&self, source: &Source) -> Option<&Membership> {
        match source {
            Source::Local { link, .. } => self.members.get(link),
            _ => None,
        }
    }

    pub fn member(&self, link: LinkId) -> Option<&Membership> {
        self.members.get(&link)
    }

    pub fn member_mut(&mut self, link: LinkId) -> Option<&mut Membership> {
        self.members.get_mut(&link)
    }

    pub fn add_member(&mut self, link: LinkId, membership: Membership) {
        self.members.insert(link, membership);
    }

    pub fn remove_member(&mut self, link: LinkId) -> Option<Membership> {
        self.members.remove(&link)
    }

    pub fn member_count(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn member_links(&self) -> Vec<LinkId> {
        self.members.keys().copied().collect()
    }

    pub fn members(&self) -> impl Iterator<Item = (&LinkId, &Membership)> {
        self.members.iter()
    }

    pub fn find_member_by_nick(&self, nick: &str) -> Option<LinkId> {
        self.members
            .iter()
            .find(|(_, m)| m.nick.eq_ignore_ascii_case(nick))
            .map(|(link, _)| *link)
    }

    /// Clear a member's delayed-join flag. Returns true if it was set.
    pub fn reveal_delayed_join(&mut self, link: LinkId) -> bool {
        match self.members.get_mut(&link) {
            Some(m) if m.delayed_join => {
                m.delayed_join = false;
                true
            }
            _ => false,
        }
    }
}
