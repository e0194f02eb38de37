//! Channel topics: the TOPIC command from clients and from peer servers.
//!
//! A client request goes through the [`gate`] and then the [`engine`]. A
//! relayed request from a peer goes through [`reconcile`] first, which
//! decides whether the relayed topic beats ours, and then the engine. The
//! engine hands every resulting line to the [`Router`].
//!
//! Each channel is locked for the whole decide-and-apply step, so two
//! concurrent TOPICs for one channel are applied one after the other.

pub mod engine;
pub mod gate;
pub mod reconcile;

use std::sync::Arc;

use crate::channel::{Channel, is_channel_name};
use crate::clock::Clock;
use crate::config::Features;
use crate::error::TopicError;
use crate::irc::{self, Message};
use crate::registry::Directory;
use crate::router::{LinkId, Router};
use crate::source::Source;

pub use engine::{Applied, TopicChange};
pub use gate::{Access, Allowed, authorize};
pub use reconcile::{DiscardReason, Reconciled, RemoteTopic, reconcile};

/// What happened to one channel of a TOPIC command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TopicOutcome {
    /// The topic was reported back to the requester.
    Queried,
    /// The topic was stored.
    Set(Applied),
    /// A relayed topic lost the merge and was dropped.
    Discarded(DiscardReason),
}

pub type ChannelResult = Result<TopicOutcome, TopicError>;

/// Everything the topic subsystem needs from the rest of the server.
pub struct TopicService {
    pub server_name: String,
    pub features: Features,
    pub directory: Arc<dyn Directory>,
    pub router: Arc<Router>,
    pub clock: Arc<dyn Clock>,
}

impl TopicService {
    pub fn new(
        server_name: &str,
        features: Features,
        directory: Arc<dyn Directory>,
        router: Arc<Router>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            server_name: server_name.to_string(),
            features,
            directory,
            router,
            clock,
        }
    }

    /// `TOPIC <chan>[,<chan>...] [:<text>]` from a directly connected client.
    ///
    /// Errors are sent to the client as numerics and also returned, one
    /// entry per channel named.
    pub fn handle_client_topic(&self, source: &Source, params: &[String]) -> Vec<ChannelResult> {
        let Some(targets) = params.first() else {
            self.reply_error(source, &TopicError::NeedMoreParams);
            return vec![Err(TopicError::NeedMoreParams)];
        };
        let text = if params.len() > 1 { params.last().map(String::as_str) } else { None };

        split_targets(targets)
            .map(|name| {
                let result = self.client_topic_one(source, name, text);
                if let Err(ref e) = result {
                    tracing::debug!(channel = name, nick = source.name(), "TOPIC refused: {e}");
                    self.reply_error(source, e);
                }
                result
            })
            .collect()
    }

    fn client_topic_one(&self, source: &Source, name: &str, text: Option<&str>) -> ChannelResult {
        let handle = is_channel_name(name)
            .then(|| self.directory.find_channel(name))
            .flatten()
            .ok_or_else(|| TopicError::ChannelNotFound(name.to_string()))?;
        let access = match text {
            Some(t) => Access::Write(t),
            None => Access::Read,
        };

        let mut channel = handle.lock();
        match authorize(self.directory.as_ref(), source, name, Some(&*channel), access)? {
            Allowed::Read => {
                self.send_topic_replies(source.link(), source.name(), &channel);
                Ok(TopicOutcome::Queried)
            }
            Allowed::Write(text) => {
                let applied = self.apply_topic(source, &mut channel, TopicChange::local(&text));
                Ok(TopicOutcome::Set(applied))
            }
        }
    }

    /// `TOPIC <chan>[,<chan>...] [[[setter] cts] tts] :<text>` relayed by a peer.
    ///
    /// Nothing is sent back to the peer; failures are logged, and protocol
    /// violations are counted against the link.
    pub fn handle_server_topic(&self, source: &Source, params: &[String]) -> Vec<ChannelResult> {
        if params.len() < 2 {
            self.router.record_violation(source.link(), "TOPIC with too few parameters");
            return vec![Err(TopicError::NeedMoreParams)];
        }
        let fields = &params[1..];

        split_targets(&params[0])
            .map(|name| {
                let result = self.server_topic_one(source, name, fields);
                match result {
                    Err(TopicError::ProtocolViolation { ref channel, reason }) => {
                        self.router
                            .record_violation(source.link(), &format!("{channel}: {reason}"));
                    }
                    Err(ref e) => {
                        tracing::debug!(link = %source.link(), from = source.name(), "Relayed TOPIC refused: {e}");
                    }
                    Ok(TopicOutcome::Discarded(reason)) => {
                        tracing::debug!(channel = name, from = source.name(), ?reason, "Relayed TOPIC lost merge");
                    }
                    Ok(_) => {}
                }
                result
            })
            .collect()
    }

    fn server_topic_one(&self, source: &Source, name: &str, fields: &[String]) -> ChannelResult {
        let handle = is_channel_name(name)
            .then(|| self.directory.find_channel(name))
            .flatten()
            .ok_or_else(|| TopicError::ChannelNotFound(name.to_string()))?;

        let mut channel = handle.lock();
        match reconcile(source, &channel, fields)? {
            Reconciled::Discarded(reason) => Ok(TopicOutcome::Discarded(reason)),
            Reconciled::Accepted(remote) => {
                let change = TopicChange {
                    text: &remote.text,
                    timestamp: remote.topic_ts,
                    setter: remote.setter.as_deref(),
                };
                Ok(TopicOutcome::Set(self.apply_topic(source, &mut channel, change)))
            }
        }
    }

    /// RPL_NOTOPIC, or RPL_TOPIC followed by RPL_TOPICWHOTIME.
    pub fn send_topic_replies(&self, link: LinkId, nick: &str, channel: &Channel) {
        let topic = channel.topic();
        let name = channel.name();
        if !topic.is_set() {
            let reply = Message::from_server(&self.server_name, irc::RPL_NOTOPIC, vec![nick, name, "No topic is set"]);
            self.router.send_one(link, &reply.to_line());
            return;
        }
        let rpl = Message::from_server(&self.server_name, irc::RPL_TOPIC, vec![nick, name, topic.text.as_str()]);
        self.router.send_one(link, &rpl.to_line());
        let set_at = topic.set_at.to_string();
        let rpl_who = Message::from_server(
            &self.server_name,
            irc::RPL_TOPICWHOTIME,
            vec![nick, name, topic.setter.as_str(), set_at.as_str()],
        );
        self.router.send_one(link, &rpl_who.to_line());
    }

    fn reply_error(&self, source: &Source, error: &TopicError) {
        let reply = error.to_reply(&self.server_name, source.name());
        self.router.send_one(source.link(), &reply.to_line());
    }
}

/// Comma-separated channel list, skipping empty entries.
fn split_targets(targets: &str) -> impl Iterator<Item = &str> {
    targets.split(',').filter(|s| !s.is_empty())
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::bounded::{SetterDisplay, TopicText};
    use crate::channel::{Membership, Rank, Topic};
    use crate::clock::ManualClock;
    use crate::registry::{ChannelRef, ChannelRegistry};
    use crate::router::LinkKind;
    use crate::source::Identity;
    use tokio::sync::mpsc;

    /// One server's topic service with a single channel and a manual clock at 1000.
    pub(crate) struct Harness {
        pub service: TopicService,
        pub registry: Arc<ChannelRegistry>,
        pub channel: ChannelRef,
        pub clock: Arc<ManualClock>,
    }

    impl Harness {
        pub fn new() -> Self {
            Self::with_channel("#a", 100)
        }

        pub fn with_channel(name: &str, creation_ts: u64) -> Self {
            let registry = Arc::new(ChannelRegistry::new());
            let (channel, _) = registry.get_or_create(name, creation_ts);
            let clock = Arc::new(ManualClock::new(1_000));
            let service = TopicService::new(
                "irc.test",
                Features::default(),
                registry.clone(),
                Arc::new(Router::new()),
                clock.clone(),
            );
            Self { service, registry, channel, clock }
        }

        /// A local client joined to the channel with `rank`.
        pub fn client(&self, nick: &str, rank: Rank) -> (Source, mpsc::Receiver<String>) {
            let (tx, rx) = mpsc::channel(64);
            let link = self.service.router.register(LinkKind::Client, nick, tx);
            let ident = Identity::new(nick, nick, "host");
            self.channel.lock().add_member(
                link,
                Membership { nick: nick.into(), hostmask: ident.hostmask(), rank, delayed_join: false },
            );
            (Source::Local { link, ident }, rx)
        }

        /// A local client that is not on the channel.
        pub fn outsider(&self, nick: &str) -> (Source, mpsc::Receiver<String>) {
            let (tx, rx) = mpsc::channel(64);
            let link = self.service.router.register(LinkKind::Client, nick, tx);
            (Source::Local { link, ident: Identity::new(nick, nick, "host") }, rx)
        }

        pub fn peer(&self, name: &str) -> (LinkId, mpsc::Receiver<String>) {
            let (tx, rx) = mpsc::channel(64);
            (self.service.router.register(LinkKind::Peer, name, tx), rx)
        }

        pub fn apply(&self, source: &Source, change: TopicChange<'_>) -> Applied {
            let mut channel = self.channel.lock();
            self.service.apply_topic(source, &mut channel, change)
        }

        pub fn topic(&self) -> Topic {
            self.channel.lock().topic().clone()
        }

        pub fn drain(rx: &mut mpsc::Receiver<String>) -> Vec<String> {
            let mut out = Vec::new();
            while let Ok(line) = rx.try_recv() {
                out.push(line);
            }
            out
        }
    }

    fn params(parts: &[&str]) -> Vec<String> {
        parts.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn no_params_is_need_more_params() {
        let h = Harness::new();
        let (alice, mut rx) = h.client("alice", Rank::Op);
        let results = h.service.handle_client_topic(&alice, &[]);
        assert_eq!(results, vec![Err(TopicError::NeedMoreParams)]);
        assert_eq!(Harness::drain(&mut rx), vec![":irc.test 461 alice TOPIC :Not enough parameters\r\n"]);
    }

    #[test]
    fn query_without_topic_says_so() {
        let h = Harness::new();
        let (alice, mut rx) = h.client("alice", Rank::None);
        let results = h.service.handle_client_topic(&alice, &params(&["#a"]));
        assert_eq!(results, vec![Ok(TopicOutcome::Queried)]);
        assert_eq!(Harness::drain(&mut rx), vec![":irc.test 331 alice #a :No topic is set\r\n"]);
    }

    #[test]
    fn query_reports_topic_and_who_set_it() {
        let h = Harness::new();
        let (alice, mut rx) = h.client("alice", Rank::Op);
        h.service.handle_client_topic(&alice, &params(&["#a", "hello there"]));
        Harness::drain(&mut rx);

        let (bob, mut bob_rx) = h.outsider("bob");
        h.service.handle_client_topic(&bob, &params(&["#a"]));
        assert_eq!(
            Harness::drain(&mut bob_rx),
            vec![
                ":irc.test 332 bob #a :hello there\r\n",
                ":irc.test 333 bob #a alice!alice@host :1000\r\n",
            ]
        );
    }

    #[test]
    fn outsider_cannot_query_secret_channel() {
        let h = Harness::new();
        h.channel.lock().modes.secret = true;
        let (bob, mut rx) = h.outsider("bob");
        let results = h.service.handle_client_topic(&bob, &params(&["#a"]));
        assert_eq!(results, vec![Err(TopicError::NotOnChannel("#a".into()))]);
        assert_eq!(Harness::drain(&mut rx), vec![":irc.test 442 bob #a :You're not on that channel\r\n"]);
    }

    #[test]
    fn unranked_member_cannot_set_under_topic_limit() {
        let h = Harness::new();
        let (bob, mut rx) = h.client("bob", Rank::None);
        let results = h.service.handle_client_topic(&bob, &params(&["#a", "mine now"]));
        assert_eq!(results, vec![Err(TopicError::OpsNeeded("#a".into()))]);
        assert_eq!(Harness::drain(&mut rx), vec![":irc.test 482 bob #a :You're not channel operator\r\n"]);
        assert!(!h.topic().is_set());
    }

    #[test]
    fn multi_channel_request_reports_each_failure_and_continues() {
        let h = Harness::new();
        let (alice, mut rx) = h.client("alice", Rank::Op);
        let results = h.service.handle_client_topic(&alice, &params(&["#nope,bad,#a", "t"]));
        assert_eq!(
            results[..2],
            [
                Err(TopicError::ChannelNotFound("#nope".into())),
                Err(TopicError::ChannelNotFound("bad".into())),
            ]
        );
        assert!(matches!(results[2], Ok(TopicOutcome::Set(Applied { changed: true, .. }))));
        let lines = Harness::drain(&mut rx);
        assert_eq!(lines[0], ":irc.test 403 alice #nope :No such channel\r\n");
        assert_eq!(lines[1], ":irc.test 403 alice bad :No such channel\r\n");
        assert_eq!(lines[2], ":alice!alice@host TOPIC #a :t\r\n");
    }

    #[test]
    fn empty_trailing_clears_the_topic() {
        let h = Harness::new();
        let (alice, _rx) = h.client("alice", Rank::Op);
        h.service.handle_client_topic(&alice, &params(&["#a", "something"]));
        let results = h.service.handle_client_topic(&alice, &params(&["#a", ""]));
        assert!(matches!(results[0], Ok(TopicOutcome::Set(Applied { changed: true, .. }))));
        assert!(!h.topic().is_set());
    }

    #[test]
    fn strip_color_policy_stores_sanitized_text() {
        let h = Harness::new();
        h.channel.lock().modes.strip_color = true;
        let (alice, _rx) = h.client("alice", Rank::Op);
        h.service.handle_client_topic(&alice, &params(&["#a", "\x02bold\x02 and \x0304red"]));
        assert_eq!(h.topic().text, "bold and red");
    }

    #[test]
    fn relayed_topic_scenario() {
        let h = Harness::new();
        h.channel.lock().replace_topic(Topic {
            text: TopicText::new("old"),
            setter: SetterDisplay::new("someone"),
            set_at: 500,
        });
        let (hub, _hub_rx) = h.peer("hub.test");
        let remote = Source::Remote { link: hub, ident: Identity::new("r", "r", "far") };

        let results = h.service.handle_server_topic(&remote, &params(&["#a", "600", "new"]));
        assert!(matches!(results[0], Ok(TopicOutcome::Set(Applied { set_at: 600, changed: true }))));
        assert_eq!(h.topic().text, "new");
        assert_eq!(h.topic().set_at, 600);

        let results = h.service.handle_server_topic(&remote, &params(&["#a", "550", "stale"]));
        assert!(matches!(results[0], Ok(TopicOutcome::Discarded(DiscardReason::StaleTopic { .. }))));
        assert_eq!(h.topic().text, "new");
        assert_eq!(h.topic().set_at, 600);
    }

    #[test]
    fn relay_into_local_channel_counts_violation_and_changes_nothing() {
        let h = Harness::with_channel("&mine", 100);
        let (hub, mut hub_rx) = h.peer("hub.test");
        let server = Source::Server { link: hub, name: "hub.test".into() };
        let results = h.service.handle_server_topic(&server, &params(&["&mine", "600", "intrusion"]));
        assert!(matches!(results[0], Err(TopicError::ProtocolViolation { .. })));
        assert_eq!(h.service.router.violations(hub), 1);
        assert!(!h.topic().is_set());
        assert!(Harness::drain(&mut hub_rx).is_empty());
    }

    #[test]
    fn short_relay_is_a_violation() {
        let h = Harness::new();
        let (hub, _rx) = h.peer("hub.test");
        let server = Source::Server { link: hub, name: "hub.test".into() };
        let results = h.service.handle_server_topic(&server, &params(&["#a"]));
        assert_eq!(results, vec![Err(TopicError::NeedMoreParams)]);
        assert_eq!(h.service.router.violations(hub), 1);
    }

    #[test]
    fn concurrent_writers_never_mix_fields() {
        const ROUNDS: u64 = 300;
        let h = Harness::new();
        let (alice, _alice_rx) = h.client("alice", Rank::Op);
        let (bob, _bob_rx) = h.client("bob", Rank::Op);

        let h = &h;
        let logs: Vec<Vec<(String, u64)>> = std::thread::scope(|s| {
            let writers: Vec<_> = [&alice, &bob]
                .into_iter()
                .map(|source| {
                    s.spawn(move || {
                        (0..ROUNDS)
                            .map(|i| {
                                let text = format!("{} {i}", source.name());
                                let applied = h.apply(source, TopicChange::local(&text));
                                (text, applied.set_at)
                            })
                            .collect::<Vec<_>>()
                    })
                })
                .collect();
            writers.into_iter().map(|w| w.join().unwrap()).collect()
        });

        let topic = h.topic();
        let (writer, _) = topic.text.as_str().split_once(' ').unwrap();
        assert_eq!(topic.setter.as_str().split('!').next(), Some(writer), "{topic:?}");
        let own = if writer == "alice" { &logs[0] } else { &logs[1] };
        assert!(own.contains(&(topic.text.as_str().to_string(), topic.set_at)), "{topic:?}");
        // Every set was applied after the previous one, each one second newer.
        assert_eq!(topic.set_at, 1_000 + 2 * ROUNDS - 1);
    }

    #[test]
    fn relay_for_unknown_channel_is_not_found() {
        let h = Harness::new();
        let (hub, _rx) = h.peer("hub.test");
        let server = Source::Server { link: hub, name: "hub.test".into() };
        let results = h.service.handle_server_topic(&server, &params(&["#unknown", "1", "x"]));
        assert_eq!(results, vec![Err(TopicError::ChannelNotFound("#unknown".into()))]);
        assert_eq!(h.service.router.violations(hub), 0);
    }
}
