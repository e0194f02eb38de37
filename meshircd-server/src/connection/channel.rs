//! Channel operations: join, part, mode, topic.

use crate::channel::{Channel, Membership, Rank, is_channel_name, normalize_channel};
use crate::irc::{self, Message};
use crate::registry::Directory;
use crate::router::Scope;
use crate::server::SharedState;

use super::Connection;

fn targets(list: &str) -> impl Iterator<Item = &str> {
    list.split(',').filter(|s| !s.is_empty())
}

pub(super) fn handle_join(conn: &mut Connection, msg: &Message, state: &SharedState) {
    let Some(list) = msg.params.first() else {
        conn.reply(state, irc::ERR_NEEDMOREPARAMS, &["JOIN", "Not enough parameters"]);
        return;
    };
    for name in targets(list) {
        join_one(conn, name, state);
    }
}

fn join_one(conn: &mut Connection, name: &str, state: &SharedState) {
    if !is_channel_name(name) {
        conn.reply(state, irc::ERR_NOSUCHCHANNEL, &[name, "No such channel"]);
        return;
    }
    let key = normalize_channel(name);
    if conn.channels.contains(&key) {
        return;
    }

    state.registry.with_live_channel(name, state.clock.now(), |channel, created| {
        join_locked(conn, state, channel, created, key);
    });
}

fn join_locked(conn: &mut Connection, state: &SharedState, channel: &mut Channel, created: bool, key: String) {
    // A channel nobody is in and nobody has shaped yet counts as new.
    let fresh = created || (channel.is_empty() && !channel.topic().is_set());
    let rank = if fresh { Rank::Op } else { Rank::None };
    let delayed = channel.modes.delayed_join;
    let hostmask = conn.hostmask();
    channel.add_member(
        conn.link,
        Membership {
            nick: conn.nick_or_star().to_string(),
            hostmask: hostmask.clone(),
            rank,
            delayed_join: delayed,
        },
    );
    conn.channels.insert(key);

    let join = Message::new(Some(&hostmask), "JOIN", vec![channel.name()]).to_line();
    if delayed {
        state.router.send_one(conn.link, &join);
    } else {
        state.router.fan_out(Scope::Members(&channel.member_links()), &[], &join);
    }

    if channel.topic().is_set() {
        state.topics.send_topic_replies(conn.link, conn.nick_or_star(), channel);
    }
    send_names(conn, state, channel);

    if created && !channel.is_local() {
        let cts = channel.creation_ts().to_string();
        let line = Message::from_server(&state.server_name, "CREATE", vec![channel.name(), cts.as_str()]).to_line();
        state.router.fan_out(Scope::Mesh, &[], &line);
    }
    tracing::debug!(channel = channel.name(), nick = conn.nick_or_star(), ?rank, delayed, "Joined");
}

/// RPL_NAMREPLY for the members this client can see, then RPL_ENDOFNAMES.
fn send_names(conn: &Connection, state: &SharedState, channel: &Channel) {
    let names: Vec<String> = channel
        .members()
        .filter(|(link, m)| !m.delayed_join || **link == conn.link)
        .map(|(_, m)| format!("{}{}", m.rank.prefix(), m.nick))
        .collect();
    let kind = if channel.modes.secret { "@" } else { "=" };
    let names = names.join(" ");
    conn.reply(state, irc::RPL_NAMREPLY, &[kind, channel.name(), names.as_str()]);
    conn.reply(state, irc::RPL_ENDOFNAMES, &[channel.name(), "End of /NAMES list"]);
}

pub(super) fn handle_part(conn: &mut Connection, msg: &Message, state: &SharedState) {
    let Some(list) = msg.params.first() else {
        conn.reply(state, irc::ERR_NEEDMOREPARAMS, &["PART", "Not enough parameters"]);
        return;
    };
    let reason = msg.params.get(1).map(String::as_str);

    for name in targets(list) {
        let Some(handle) = state.registry.find_channel(name) else {
            conn.reply(state, irc::ERR_NOSUCHCHANNEL, &[name, "No such channel"]);
            continue;
        };
        let (chname, now_empty, is_local) = {
            let mut channel = handle.lock();
            let Some(member) = channel.remove_member(conn.link) else {
                conn.reply(state, irc::ERR_NOTONCHANNEL, &[channel.name(), "You're not on that channel"]);
                continue;
            };
            let mut params = vec![channel.name()];
            params.extend(reason);
            let line = Message::new(Some(&member.hostmask), "PART", params).to_line();
            if !member.delayed_join {
                state.router.fan_out(Scope::Members(&channel.member_links()), &[], &line);
            }
            state.router.send_one(conn.link, &line);
            (channel.name().to_string(), channel.is_empty(), channel.is_local())
        };
        conn.channels.remove(&normalize_channel(&chname));
        if is_local && now_empty {
            state.registry.remove_if_empty(&chname);
        }
    }
}

/// Accumulates applied mode changes into one `+ab-c args` line.
#[derive(Default)]
struct ModeChanges {
    modes: String,
    args: Vec<String>,
    sign: Option<bool>,
}

impl ModeChanges {
    fn push(&mut self, on: bool, letter: char, arg: Option<&str>) {
        if self.sign != Some(on) {
            self.modes.push(if on { '+' } else { '-' });
            self.sign = Some(on);
        }
        self.modes.push(letter);
        self.args.extend(arg.map(str::to_string));
    }

    fn is_empty(&self) -> bool {
        self.modes.is_empty()
    }
}

fn rank_for(letter: char) -> Option<Rank> {
    match letter {
        'o' => Some(Rank::Op),
        'h' => Some(Rank::HalfOp),
        'v' => Some(Rank::Voice),
        _ => None,
    }
}

pub(super) fn handle_mode(conn: &mut Connection, msg: &Message, state: &SharedState) {
    let Some(target) = msg.params.first() else {
        conn.reply(state, irc::ERR_NEEDMOREPARAMS, &["MODE", "Not enough parameters"]);
        return;
    };
    if !is_channel_name(target) {
        // User modes are not supported; asking about yourself is harmless.
        if !target.eq_ignore_ascii_case(conn.nick_or_star()) {
            conn.reply(state, irc::ERR_NOSUCHNICK, &[target.as_str(), "No such nick/channel"]);
        }
        return;
    }
    let Some(handle) = state.registry.find_channel(target) else {
        conn.reply(state, irc::ERR_NOSUCHCHANNEL, &[target.as_str(), "No such channel"]);
        return;
    };
    let mut channel = handle.lock();

    let Some(change) = msg.params.get(1) else {
        let modes = channel.modes.to_mode_string();
        conn.reply(state, irc::RPL_CHANNELMODEIS, &[channel.name(), modes.as_str()]);
        return;
    };

    let source = conn.source();
    match channel.membership(&source) {
        None => {
            conn.reply(state, irc::ERR_NOTONCHANNEL, &[channel.name(), "You're not on that channel"]);
            return;
        }
        Some(m) if m.rank < Rank::Op => {
            conn.reply(state, irc::ERR_CHANOPRIVSNEEDED, &[channel.name(), "You're not channel operator"]);
            return;
        }
        Some(_) => {}
    }

    let mut args = msg.params[2..].iter();
    let mut applied = ModeChanges::default();
    let mut on = true;
    for letter in change.chars() {
        match letter {
            '+' => on = true,
            '-' => on = false,
            _ => match rank_for(letter) {
                Some(rank) => {
                    let Some(nick) = args.next() else {
                        conn.reply(state, irc::ERR_NEEDMOREPARAMS, &["MODE", "Not enough parameters"]);
                        continue;
                    };
                    set_rank(conn, state, &mut channel, &mut applied, on, letter, rank, nick);
                }
                None => set_flag(conn, state, &mut channel, &mut applied, on, letter),
            },
        }
    }

    if applied.is_empty() {
        return;
    }
    let hostmask = conn.hostmask();
    let mut params = vec![channel.name(), applied.modes.as_str()];
    params.extend(applied.args.iter().map(String::as_str));
    let line = Message::new(Some(&hostmask), "MODE", params).to_line();
    state.router.fan_out(Scope::Members(&channel.member_links()), &[], &line);
    tracing::debug!(channel = channel.name(), modes = %applied.modes, "Channel modes changed");
}

fn set_rank(
    conn: &Connection,
    state: &SharedState,
    channel: &mut Channel,
    applied: &mut ModeChanges,
    on: bool,
    letter: char,
    rank: Rank,
    nick: &str,
) {
    let Some(link) = channel.find_member_by_nick(nick) else {
        conn.reply(state, irc::ERR_USERNOTINCHANNEL, &[nick, channel.name(), "They aren't on that channel"]);
        return;
    };
    let Some(member) = channel.member_mut(link) else {
        return;
    };
    let before = member.rank;
    if on {
        member.rank = member.rank.max(rank);
    } else if member.rank == rank {
        member.rank = Rank::None;
    }
    if member.rank != before {
        applied.push(on, letter, Some(member.nick.as_str()));
    }
}

fn set_flag(
    conn: &Connection,
    state: &SharedState,
    channel: &mut Channel,
    applied: &mut ModeChanges,
    on: bool,
    letter: char,
) {
    let before = channel.modes;
    if !channel.modes.apply(letter, on) {
        let unknown = letter.to_string();
        conn.reply(state, irc::ERR_UNKNOWNMODE, &[unknown.as_str(), "is unknown mode char to me"]);
        return;
    }
    if channel.modes == before {
        return;
    }
    applied.push(on, letter, None);
    if before.strip_color && !channel.modes.strip_color && letter == 'c' {
        applied.push(false, 'S', None);
    }
    if before.no_color && !channel.modes.no_color && letter == 'S' {
        applied.push(false, 'c', None);
    }
    if letter == 'D' && !on {
        reveal_all_delayed(state, channel);
    }
}

/// With +D lifted, every hidden member becomes visible.
fn reveal_all_delayed(state: &SharedState, channel: &mut Channel) {
    let hidden: Vec<_> = channel
        .members()
        .filter(|(_, m)| m.delayed_join)
        .map(|(link, _)| *link)
        .collect();
    for link in hidden {
        if !channel.reveal_delayed_join(link) {
            continue;
        }
        let Some(member) = channel.member(link) else { continue };
        let join = Message::new(Some(&member.hostmask), "JOIN", vec![channel.name()]).to_line();
        state.router.fan_out(Scope::Members(&channel.member_links()), &[link], &join);
    }
}

pub(super) fn handle_topic(conn: &mut Connection, msg: &Message, state: &SharedState) {
    let results = state.topics.handle_client_topic(&conn.source(), &msg.params);
    tracing::debug!(nick = conn.nick_or_star(), channels = results.len(), "TOPIC handled");
}
