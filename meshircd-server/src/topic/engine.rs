//! Applying an authorized topic change and fanning it out.

use crate::bounded::{NICK_LEN, SetterDisplay, TOPIC_LEN, TopicText, truncate};
use crate::channel::{Channel, Topic};
use crate::irc::Message;
use crate::router::{LinkId, Scope};
use crate::source::Source;

use super::TopicService;

/// A topic change ready to be applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TopicChange<'a> {
    pub text: &'a str,
    /// Explicit topic time; 0 means now.
    pub timestamp: u64,
    /// Setter display relayed from upstream, used verbatim.
    pub setter: Option<&'a str>,
}

impl<'a> TopicChange<'a> {
    /// A change made here, timestamped now, credited to the source.
    pub fn local(text: &'a str) -> Self {
        Self { text, timestamp: 0, setter: None }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Applied {
    /// The text differs from what was there before.
    pub changed: bool,
    pub set_at: u64,
}

impl TopicService {
    /// Store `change` on `channel` and propagate it.
    ///
    /// The caller holds the channel lock, so the text, setter and timestamp
    /// are replaced together before anyone else can look.
    pub fn apply_topic(&self, source: &Source, channel: &mut Channel, change: TopicChange<'_>) -> Applied {
        let changed = channel.topic().text.as_str() != truncate(change.text, TOPIC_LEN);

        let setter = match change.setter {
            Some(explicit) => SetterDisplay::new(explicit),
            None => SetterDisplay::new(&self.setter_for(source)),
        };
        let current = channel.topic().set_at;
        // A change made here must be strictly newer than what peers hold, or
        // their merge discards it as stale.
        let set_at = match change.timestamp {
            0 => self.clock.now().max(current + 1),
            explicit => explicit.max(current),
        };
        channel.replace_topic(Topic {
            text: TopicText::new(change.text),
            setter,
            set_at,
        });

        let inbound = source.link();
        let topic = channel.topic().clone();
        let name = channel.name().to_string();

        if !channel.is_local() {
            let cts = channel.creation_ts().to_string();
            let tts = topic.set_at.to_string();
            let prefix = source.prefix();
            let params = match change.setter {
                Some(_) => vec![name.as_str(), topic.setter.as_str(), cts.as_str(), tts.as_str(), topic.text.as_str()],
                None => vec![name.as_str(), cts.as_str(), tts.as_str(), topic.text.as_str()],
            };
            let line = Message::new(Some(&prefix), "TOPIC", params).to_line();
            let delivery = self.router.fan_out(Scope::Mesh, &[inbound], &line);
            tracing::debug!(channel = %name, sent = delivery.sent, dropped = delivery.dropped, "Topic relayed to peers");
        }

        let from = self.display_prefix(source);
        if changed {
            if let Source::Local { link, .. } = source {
                self.reveal_delayed_join(channel, *link);
            }
            let shown = match change.setter {
                Some(explicit) => format!("{} ({})", topic.text, setter_nick(explicit)),
                None => topic.text.to_string(),
            };
            let line = Message::new(Some(&from), "TOPIC", vec![name.as_str(), shown.as_str()]).to_line();
            // Local setters see their own change; a relayed one skips the link it came in on.
            let skip = [inbound];
            let exclude: &[LinkId] = if source.is_local_user() { &[] } else { &skip };
            self.router.fan_out(Scope::Members(&channel.member_links()), exclude, &line);
        } else if source.is_local_user() {
            let line = Message::new(Some(&from), "TOPIC", vec![name.as_str(), topic.text.as_str()]).to_line();
            self.router.send_one(inbound, &line);
        }

        tracing::info!(
            channel = %name,
            setter = %topic.setter,
            set_at,
            changed,
            "Topic set"
        );
        Applied { changed, set_at }
    }

    /// Setter display synthesized from the source.
    fn setter_for(&self, source: &Source) -> String {
        match source {
            Source::Server { .. } => self.display_prefix(source),
            Source::Local { ident, .. } | Source::Remote { ident, .. } => {
                if self.features.host_in_topic {
                    ident.hostmask()
                } else {
                    ident.nick.clone()
                }
            }
        }
    }

    /// Prefix shown to local clients for a change by `source`.
    pub(crate) fn display_prefix(&self, source: &Source) -> String {
        match source {
            Source::Server { .. } if self.features.hide_server_names => {
                self.features.hidden_server_name.clone()
            }
            _ => source.prefix(),
        }
    }

    /// Show a hidden (+D) member to the rest of the channel.
    fn reveal_delayed_join(&self, channel: &mut Channel, link: LinkId) {
        if !channel.reveal_delayed_join(link) {
            return;
        }
        let Some(member) = channel.member(link) else {
            return;
        };
        let join = Message::new(Some(&member.hostmask), "JOIN", vec![channel.name()]).to_line();
        self.router.fan_out(Scope::Members(&channel.member_links()), &[link], &join);
        tracing::debug!(channel = channel.name(), nick = %member.nick, "Delayed join revealed");
    }
}

/// Nick part of a `nick!user@host` setter display.
fn setter_nick(setter: &str) -> &str {
    let nick = setter.split('!').next().unwrap_or(setter);
    truncate(nick, NICK_LEN)
}
