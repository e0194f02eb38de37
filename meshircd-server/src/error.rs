//! Errors reported by the topic subsystem.

use crate::irc;

/// A rejected topic request. Each variant maps to one numeric reply.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TopicError {
    #[error("TOPIC: not enough parameters")]
    NeedMoreParams,
    #[error("{0}: no such channel")]
    ChannelNotFound(String),
    #[error("{0}: not on channel")]
    NotOnChannel(String),
    #[error("{0}: channel operator privileges needed")]
    OpsNeeded(String),
    #[error("{0}: cannot send to channel")]
    CannotSend(String),
    #[error("{channel}: protocol violation ({reason})")]
    ProtocolViolation { channel: String, reason: &'static str },
}

impl TopicError {
    /// Numeric reply code for this error.
    pub fn numeric(&self) -> &'static str {
        match self {
            TopicError::NeedMoreParams => irc::ERR_NEEDMOREPARAMS,
            TopicError::ChannelNotFound(_) => irc::ERR_NOSUCHCHANNEL,
            TopicError::NotOnChannel(_) => irc::ERR_NOTONCHANNEL,
            TopicError::OpsNeeded(_) => irc::ERR_CHANOPRIVSNEEDED,
            TopicError::CannotSend(_) | TopicError::ProtocolViolation { .. } => irc::ERR_CANNOTSENDTOCHAN,
        }
    }

    /// Parameters after the target nick: the channel (or command) and the human text.
    pub fn reply_params(&self) -> (&str, &'static str) {
        match self {
            TopicError::NeedMoreParams => ("TOPIC", "Not enough parameters"),
            TopicError::ChannelNotFound(ch) => (ch, "No such channel"),
            TopicError::NotOnChannel(ch) => (ch, "You're not on that channel"),
            TopicError::OpsNeeded(ch) => (ch, "You're not channel operator"),
            TopicError::CannotSend(ch) => (ch, "Cannot send to channel"),
            TopicError::ProtocolViolation { channel, .. } => (channel, "Cannot send to channel"),
        }
    }

    /// The numeric reply line for client `nick`.
    pub fn to_reply(&self, server_name: &str, nick: &str) -> irc::Message {
        let (target, text) = self.reply_params();
        irc::Message::from_server(server_name, self.numeric(), vec![nick, target, text])
    }
}
