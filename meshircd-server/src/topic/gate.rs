//! Who may read or change a channel topic.

use std::borrow::Cow;

use crate::channel::{Channel, is_channel_name};
use crate::color::{has_color, strip_color};
use crate::error::TopicError;
use crate::registry::Directory;
use crate::source::Source;

/// What the requester wants to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access<'a> {
    Read,
    Write(&'a str),
}

/// A granted request. Writes carry the text to store, which may have had
/// its color codes stripped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Allowed<'a> {
    Read,
    Write(Cow<'a, str>),
}

/// Decide a client's topic request. `channel` is `None` when `name` did not
/// resolve. Pure: nothing is modified.
pub fn authorize<'a>(
    directory: &dyn Directory,
    source: &Source,
    name: &str,
    channel: Option<&Channel>,
    access: Access<'a>,
) -> Result<Allowed<'a>, TopicError> {
    let channel = match channel {
        Some(ch) if is_channel_name(name) => ch,
        _ => return Err(TopicError::ChannelNotFound(name.to_string())),
    };
    let chname = channel.name();
    let member = channel.membership(source);

    // Setting always needs membership; reading only for secret channels.
    let wants_write = matches!(access, Access::Write(_));
    if (wants_write || channel.modes.secret) && member.is_none() {
        return Err(TopicError::NotOnChannel(chname.to_string()));
    }

    let text = match access {
        Access::Read => return Ok(Allowed::Read),
        Access::Write(text) => text,
    };

    if channel.modes.topic_limit && !member.is_some_and(|m| m.can_set_limited_topic()) {
        return Err(TopicError::OpsNeeded(chname.to_string()));
    }
    if !directory.can_send(source, channel) {
        return Err(TopicError::CannotSend(chname.to_string()));
    }

    if has_color(text) {
        if channel.modes.no_color {
            return Err(TopicError::CannotSend(chname.to_string()));
        }
        if channel.modes.strip_color {
            return Ok(Allowed::Write(Cow::Owned(strip_color(text))));
        }
    }
    Ok(Allowed::Write(Cow::Borrowed(text)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::{Membership, Rank};
    use crate::registry::ChannelRegistry;
    use crate::router::LinkId;
    use crate::source::Identity;

    struct Fixture {
        registry: ChannelRegistry,
        channel: Channel,
        member: Source,
        outsider: Source,
    }

    fn fixture(rank: Rank) -> Fixture {
        let member_link = LinkId::next();
        let mut channel = Channel::new("#a", 100);
        channel.add_member(
            member_link,
            Membership { nick: "m".into(), hostmask: "m!u@h".into(), rank, delayed_join: false },
        );
        Fixture {
            registry: ChannelRegistry::new(),
            channel,
            member: Source::Local { link: member_link, ident: Identity::new("m", "u", "h") },
            outsider: Source::Local { link: LinkId::next(), ident: Identity::new("o", "u", "h") },
        }
    }

    fn check<'a>(f: &Fixture, who: &Source, access: Access<'a>) -> Result<Allowed<'a>, TopicError> {
        authorize(&f.registry, who, "#a", Some(&f.channel), access)
    }

    #[test]
    fn missing_channel_is_not_found() {
        let f = fixture(Rank::Op);
        let err = authorize(&f.registry, &f.member, "#gone", None, Access::Read).unwrap_err();
        assert_eq!(err, TopicError::ChannelNotFound("#gone".into()));
        let err = authorize(&f.registry, &f.member, "nochan", Some(&f.channel), Access::Read).unwrap_err();
        assert_eq!(err, TopicError::ChannelNotFound("nochan".into()));
    }

    #[test]
    fn outsider_reads_public_but_not_secret_topic() {
        let mut f = fixture(Rank::None);
        assert_eq!(check(&f, &f.outsider, Access::Read), Ok(Allowed::Read));
        f.channel.modes.secret = true;
        assert_eq!(
            check(&f, &f.outsider, Access::Read),
            Err(TopicError::NotOnChannel("#a".into()))
        );
        assert_eq!(check(&f, &f.member, Access::Read), Ok(Allowed::Read));
    }

    #[test]
    fn outsider_cannot_set() {
        let mut f = fixture(Rank::None);
        f.channel.modes.topic_limit = false;
        assert_eq!(
            check(&f, &f.outsider, Access::Write("hi")),
            Err(TopicError::NotOnChannel("#a".into()))
        );
    }

    #[test]
    fn topic_limit_needs_halfop_or_op() {
        let f = fixture(Rank::Voice);
        assert_eq!(
            check(&f, &f.member, Access::Write("hi")),
            Err(TopicError::OpsNeeded("#a".into()))
        );
        let f = fixture(Rank::HalfOp);
        assert_eq!(check(&f, &f.member, Access::Write("hi")), Ok(Allowed::Write("hi".into())));

        let mut f = fixture(Rank::None);
        f.channel.modes.topic_limit = false;
        assert_eq!(check(&f, &f.member, Access::Write("hi")), Ok(Allowed::Write("hi".into())));
    }

    #[test]
    fn moderated_channel_blocks_unvoiced_member() {
        let mut f = fixture(Rank::None);
        f.channel.modes.topic_limit = false;
        f.channel.modes.moderated = true;
        assert_eq!(
            check(&f, &f.member, Access::Write("hi")),
            Err(TopicError::CannotSend("#a".into()))
        );
    }

    #[test]
    fn color_policy_reject_strip_or_pass() {
        let colored = "\x0304red\x03 topic";

        let mut f = fixture(Rank::Op);
        assert_eq!(
            check(&f, &f.member, Access::Write(colored)),
            Ok(Allowed::Write(Cow::Borrowed(colored)))
        );

        f.channel.modes.strip_color = true;
        assert_eq!(
            check(&f, &f.member, Access::Write(colored)),
            Ok(Allowed::Write(Cow::Owned("red topic".to_string())))
        );

        f.channel.modes.no_color = true;
        assert_eq!(
            check(&f, &f.member, Access::Write(colored)),
            Err(TopicError::CannotSend("#a".into()))
        );
        // Plain text is unaffected by either policy.
        assert_eq!(check(&f, &f.member, Access::Write("plain")), Ok(Allowed::Write("plain".into())));
    }
}
