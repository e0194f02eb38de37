//! Merge rule for topics relayed by peer servers.
//!
//! A relayed topic competes with ours on `(creation_ts, topic_ts)`:
//! an older channel always wins, and among equally old channels only a
//! strictly newer topic replaces ours. Every server applies the same rule
//! to the same data, so after a netsplit heals the mesh converges no matter
//! in which order the bursts arrive.

use crate::channel::Channel;
use crate::error::TopicError;
use crate::source::Source;

/// A relayed topic that won the merge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteTopic {
    pub text: String,
    /// Setter display supplied upstream, if any.
    pub setter: Option<String>,
    /// Topic time to record; 0 lets the engine use the current time.
    pub topic_ts: u64,
}

/// Why a relayed topic lost the merge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscardReason {
    /// The sender's channel was created later than ours.
    YoungerChannel { ours: u64, theirs: u64 },
    /// Our topic is at least as recent as the relayed one.
    StaleTopic { ours: u64, theirs: u64 },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reconciled {
    Accepted(RemoteTopic),
    Discarded(DiscardReason),
}

/// Optional fields of a relayed TOPIC, read from the end of the parameter list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct RelayFields<'a> {
    text: &'a str,
    topic_ts: Option<&'a str>,
    creation_ts: Option<&'a str>,
    setter: Option<&'a str>,
}

impl<'a> RelayFields<'a> {
    /// `fields` is everything after the channel name:
    /// `[[[setter] cts] tts] text`.
    fn split(fields: &'a [String]) -> Option<Self> {
        let (text, rest) = fields.split_last()?;
        let from_end = |n: usize| rest.len().checked_sub(n).map(|i| rest[i].as_str());
        Some(Self {
            text,
            topic_ts: from_end(1),
            creation_ts: from_end(2),
            setter: from_end(3),
        })
    }
}

/// Parse a timestamp the lenient way: leading digits only, anything else is 0.
/// Zero means "absent" to the merge rule.
pub fn parse_ts(field: &str) -> u64 {
    let field = field.trim_start();
    if field.starts_with('-') {
        return 0;
    }
    let digits = field.strip_prefix('+').unwrap_or(field);
    digits
        .bytes()
        .take_while(u8::is_ascii_digit)
        .fold(0u64, |acc, d| acc.saturating_mul(10).saturating_add(u64::from(d - b'0')))
}

/// Apply the merge rule to a TOPIC relayed by `source` for `channel`.
///
/// `fields` are the parameters after the channel name and must not be empty.
pub fn reconcile(source: &Source, channel: &Channel, fields: &[String]) -> Result<Reconciled, TopicError> {
    let Some(relay) = RelayFields::split(fields) else {
        return Err(TopicError::NeedMoreParams);
    };

    if channel.is_local() && !source.is_local_user() {
        return Err(TopicError::ProtocolViolation {
            channel: channel.name().to_string(),
            reason: "topic relayed for a local channel",
        });
    }

    if let Some(cts) = relay.creation_ts.map(parse_ts)
        && cts > 0
        && cts > channel.creation_ts()
    {
        return Ok(Reconciled::Discarded(DiscardReason::YoungerChannel {
            ours: channel.creation_ts(),
            theirs: cts,
        }));
    }

    let topic_ts = relay.topic_ts.map(parse_ts).unwrap_or(0);
    let ours = channel.topic().set_at;
    if topic_ts > 0 && topic_ts <= ours {
        return Ok(Reconciled::Discarded(DiscardReason::StaleTopic { ours, theirs: topic_ts }));
    }

    Ok(Reconciled::Accepted(RemoteTopic {
        text: relay.text.to_string(),
        setter: relay.setter.map(str::to_string),
        topic_ts,
    }))
}
