//! IRC line codec and numeric reply codes.
//!
//! Parses and serializes RFC 2812 lines:
//!   [`:`prefix SPACE] command [SPACE params] [SPACE `:` trailing]
//!
//! The same codec is used for client connections and for peer links.

use std::fmt;

pub const RPL_WELCOME: &str = "001";
pub const RPL_CHANNELMODEIS: &str = "324";
pub const RPL_NOTOPIC: &str = "331";
pub const RPL_TOPIC: &str = "332";
pub const RPL_TOPICWHOTIME: &str = "333";
pub const RPL_NAMREPLY: &str = "353";
pub const RPL_ENDOFNAMES: &str = "366";
pub const ERR_NOSUCHNICK: &str = "401";
pub const ERR_NOSUCHCHANNEL: &str = "403";
pub const ERR_CANNOTSENDTOCHAN: &str = "404";
pub const ERR_UNKNOWNCOMMAND: &str = "421";
pub const ERR_NONICKNAMEGIVEN: &str = "431";
pub const ERR_ERRONEUSNICKNAME: &str = "432";
pub const ERR_NICKNAMEINUSE: &str = "433";
pub const ERR_USERNOTINCHANNEL: &str = "441";
pub const ERR_NOTONCHANNEL: &str = "442";
pub const ERR_NOTREGISTERED: &str = "451";
pub const ERR_NEEDMOREPARAMS: &str = "461";
pub const ERR_ALREADYREGISTRED: &str = "462";
pub const ERR_UNKNOWNMODE: &str = "472";
pub const ERR_CHANOPRIVSNEEDED: &str = "482";

/// A parsed IRC message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// Optional prefix (server name or `nick!user@host`).
    pub prefix: Option<String>,
    /// Command, upper-cased on parse.
    pub command: String,
    /// Parameters; the last may have been a trailing param (with spaces).
    pub params: Vec<String>,
}

impl Message {
    /// Parse one line. The trailing `\r\n` is optional.
    ///
    /// Returns `None` for blank lines and for a prefix with no command.
    pub fn parse(line: &str) -> Option<Self> {
        let line = line.trim_end_matches(['\r', '\n']);
        if line.trim().is_empty() {
            return None;
        }

        let (prefix, rest) = match line.strip_prefix(':') {
            Some(stripped) => {
                let (prefix, rest) = stripped.split_once(' ')?;
                (Some(prefix.to_string()), rest.trim_start_matches(' '))
            }
            None => (None, line),
        };

        let (command, mut remaining) = match rest.split_once(' ') {
            Some((command, params)) => (command, params),
            None => (rest, ""),
        };
        if command.is_empty() {
            return None;
        }

        let mut params = Vec::new();
        loop {
            remaining = remaining.trim_start_matches(' ');
            if remaining.is_empty() {
                break;
            }
            if let Some(trailing) = remaining.strip_prefix(':') {
                params.push(trailing.to_string());
                break;
            }
            match remaining.split_once(' ') {
                Some((param, rest)) => {
                    params.push(param.to_string());
                    remaining = rest;
                }
                None => {
                    params.push(remaining.to_string());
                    break;
                }
            }
        }

        Some(Self {
            prefix,
            command: command.to_ascii_uppercase(),
            params,
        })
    }

    /// Build a message with an explicit prefix.
    pub fn new(prefix: Option<&str>, command: &str, params: Vec<&str>) -> Self {
        Self {
            prefix: prefix.map(str::to_string),
            command: command.to_string(),
            params: params.into_iter().map(str::to_string).collect(),
        }
    }

    /// Build a message sourced from this server (numerics, notices).
    pub fn from_server(server_name: &str, command: &str, params: Vec<&str>) -> Self {
        Self::new(Some(server_name), command, params)
    }

    /// Serialize with the trailing CRLF, ready for an outbound queue.
    pub fn to_line(&self) -> String {
        format!("{self}\r\n")
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(ref prefix) = self.prefix {
            write!(f, ":{prefix} ")?;
        }
        f.write_str(&self.command)?;
        if let Some((last, head)) = self.params.split_last() {
            for param in head {
                write!(f, " {param}")?;
            }
            // Always trailing form: valid per RFC 2812 and keeps empty topics intact.
            write!(f, " :{last}")?;
        }
        Ok(())
    }
}
