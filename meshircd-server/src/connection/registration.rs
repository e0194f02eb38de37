//! NICK, USER and the welcome burst.

use std::collections::BTreeSet;

use crate::bounded::{Nick, USER_LEN, truncate};
use crate::irc::{self, Message};
use crate::registry::Directory;
use crate::router::{LinkId, Scope};
use crate::server::SharedState;

use super::Connection;

/// RFC 2812 nick syntax, checked after truncation to the nick length.
fn valid_nick(nick: &str) -> bool {
    let special = |c: char| "[]\\`_^{|}".contains(c);
    let mut chars = nick.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || special(c) => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || special(c) || c == '-')
}

pub(super) fn handle_nick(conn: &mut Connection, msg: &Message, state: &SharedState) {
    let Some(requested) = msg.params.first().filter(|n| !n.is_empty()) else {
        conn.reply(state, irc::ERR_NONICKNAMEGIVEN, &["No nickname given"]);
        return;
    };
    let nick = Nick::new(requested);
    if !valid_nick(nick.as_str()) {
        conn.reply(state, irc::ERR_ERRONEUSNICKNAME, &[requested.as_str(), "Erroneous nickname"]);
        return;
    }
    if conn.nick.as_deref() == Some(nick.as_str()) {
        return;
    }
    if !state.claim_nick(nick.as_str(), conn.link) {
        conn.reply(state, irc::ERR_NICKNAMEINUSE, &[nick.as_str(), "Nickname is already in use"]);
        return;
    }

    let old_mask = conn.hostmask();
    let old = conn.nick.replace(nick.to_string());
    if let Some(ref old) = old
        && !old.eq_ignore_ascii_case(nick.as_str())
    {
        state.release_nick(old, conn.link);
    }

    if conn.registered {
        announce_nick_change(conn, state, &old_mask);
    } else {
        try_complete_registration(conn, state);
    }
}

pub(super) fn handle_user(conn: &mut Connection, msg: &Message, state: &SharedState) {
    if conn.registered {
        conn.reply(state, irc::ERR_ALREADYREGISTRED, &["You may not reregister"]);
        return;
    }
    let Some(user) = msg.params.first().filter(|_| msg.params.len() >= 4) else {
        conn.reply(state, irc::ERR_NEEDMOREPARAMS, &["USER", "Not enough parameters"]);
        return;
    };
    conn.user = Some(truncate(user, USER_LEN).to_string());
    try_complete_registration(conn, state);
}

fn try_complete_registration(conn: &mut Connection, state: &SharedState) {
    if conn.registered || conn.nick.is_none() || conn.user.is_none() {
        return;
    }
    conn.registered = true;
    let welcome = format!("Welcome to the {} IRC mesh {}", state.server_name, conn.hostmask());
    conn.reply(state, irc::RPL_WELCOME, &[welcome.as_str()]);
    tracing::info!(link = %conn.link, nick = conn.nick_or_star(), "Client registered");
}

/// Rename us in every joined channel and tell whoever can see us.
fn announce_nick_change(conn: &Connection, state: &SharedState, old_mask: &str) {
    let new_nick = conn.nick_or_star();
    let hostmask = conn.hostmask();
    let mut audience: BTreeSet<LinkId> = BTreeSet::new();

    for key in &conn.channels {
        let Some(handle) = state.registry.find_channel(key) else {
            continue;
        };
        let mut channel = handle.lock();
        let visible = match channel.member_mut(conn.link) {
            Some(member) => {
                member.nick = new_nick.to_string();
                member.hostmask = hostmask.clone();
                !member.delayed_join
            }
            None => false,
        };
        if visible {
            audience.extend(channel.member_links());
        }
    }
    audience.insert(conn.link);

    let line = Message::new(Some(old_mask), "NICK", vec![new_nick]).to_line();
    let audience: Vec<LinkId> = audience.into_iter().collect();
    state.router.fan_out(Scope::Members(&audience), &[], &line);
}
