//! Per-client connection handler.
//!
//! Each TCP connection gets a [`Connection`] plus a writer task draining the
//! link's outbound queue. The handler is split into submodules:
//! - [`registration`]: NICK, USER and the welcome
//! - [`channel`]: JOIN, PART, MODE, TOPIC

mod channel;
mod registration;

use std::collections::BTreeSet;
use std::sync::Arc;

use anyhow::Result;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::mpsc;

use crate::bounded::{HOST_LEN, truncate};
use crate::irc::{self, Message};
use crate::registry::Directory;
use crate::router::{LinkId, LinkKind, Scope};
use crate::server::SharedState;
use crate::source::{Identity, Source};

/// Longest accepted input line, CRLF included.
const MAX_LINE_LEN: usize = 8192;

/// State of a single client connection.
pub struct Connection {
    pub link: LinkId,
    pub nick: Option<String>,
    pub user: Option<String>,
    pub host: String,
    pub registered: bool,
    /// Joined channels, by registry key.
    pub channels: BTreeSet<String>,
}

impl Connection {
    fn new(link: LinkId, host: &str) -> Self {
        Self {
            link,
            nick: None,
            user: None,
            host: truncate(host, HOST_LEN).to_string(),
            registered: false,
            channels: BTreeSet::new(),
        }
    }

    pub(crate) fn nick_or_star(&self) -> &str {
        self.nick.as_deref().unwrap_or("*")
    }

    pub(crate) fn ident(&self) -> Identity {
        Identity::new(self.nick_or_star(), self.user.as_deref().unwrap_or("~u"), &self.host)
    }

    pub(crate) fn hostmask(&self) -> String {
        self.ident().hostmask()
    }

    /// This client as the origin of a request.
    pub(crate) fn source(&self) -> Source {
        Source::Local { link: self.link, ident: self.ident() }
    }

    /// Send a numeric addressed to this client.
    pub(crate) fn reply(&self, state: &SharedState, numeric: &str, params: &[&str]) {
        let mut all = Vec::with_capacity(params.len() + 1);
        all.push(self.nick_or_star());
        all.extend_from_slice(params);
        let msg = Message::from_server(&state.server_name, numeric, all);
        state.router.send_one(self.link, &msg.to_line());
    }

    pub(crate) fn send(&self, state: &SharedState, msg: &Message) {
        state.router.send_one(self.link, &msg.to_line());
    }
}

/// Handle a plain TCP connection.
pub async fn handle(stream: TcpStream, state: Arc<SharedState>) -> Result<()> {
    let peer = stream.peer_addr()?;
    tracing::info!(%peer, "New client connection");
    let (reader, writer) = tokio::io::split(stream);
    handle_io(BufReader::new(reader), writer, peer.ip().to_string(), state).await
}

async fn handle_io<R, W>(
    mut reader: BufReader<R>,
    writer: W,
    host: String,
    state: Arc<SharedState>,
) -> Result<()>
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (tx, mut rx) = mpsc::channel::<String>(state.config.send_queue.max(1));
    let link = state.router.register(LinkKind::Client, &host, tx);
    let mut conn = Connection::new(link, &host);

    // Writer task: ends when the link is unregistered and the queue drains.
    let mut write_half = writer;
    let write_handle = tokio::spawn(async move {
        while let Some(line) = rx.recv().await {
            if let Err(e) = write_half.write_all(line.as_bytes()).await {
                tracing::warn!(%link, "Write error: {e}");
                return;
            }
            // Batch whatever else is queued before flushing.
            let mut batch_count = 0;
            while let Ok(queued) = rx.try_recv() {
                if let Err(e) = write_half.write_all(queued.as_bytes()).await {
                    tracing::warn!(%link, "Write error: {e}");
                    return;
                }
                batch_count += 1;
                if batch_count >= 64 {
                    break;
                }
            }
            if let Err(e) = write_half.flush().await {
                tracing::warn!(%link, "Flush error: {e}");
                return;
            }
        }
        let _ = write_half.shutdown().await;
    });

    let mut line_buf = String::new();
    let mut discarding = false;
    let mut last_activity = tokio::time::Instant::now();
    let ping_interval = tokio::time::Duration::from_secs(30);
    let ping_timeout = tokio::time::Duration::from_secs(60);
    let mut awaiting_pong = false;
    let mut quit_reason = String::from("Connection closed");

    loop {
        let room = MAX_LINE_LEN.saturating_sub(line_buf.len()).max(1) as u64;
        let read_result =
            tokio::time::timeout(ping_interval, (&mut reader).take(room).read_line(&mut line_buf)).await;

        match read_result {
            Ok(Ok(0)) | Ok(Err(_)) => break,
            Err(_) => {
                if awaiting_pong {
                    if last_activity.elapsed() > ping_timeout {
                        tracing::info!(%link, "Ping timeout");
                        quit_reason = "Ping timeout".to_string();
                        break;
                    }
                } else {
                    let ping = Message::from_server(&state.server_name, "PING", vec![state.server_name.as_str()]);
                    conn.send(&state, &ping);
                    awaiting_pong = true;
                }
                continue;
            }
            Ok(Ok(_)) => {}
        }

        last_activity = tokio::time::Instant::now();
        awaiting_pong = false;

        if !line_buf.ends_with('\n') {
            if line_buf.len() < MAX_LINE_LEN {
                // Partial line; keep reading.
                continue;
            }
            if !discarding {
                tracing::warn!(%link, "Line too long, dropping");
                conn.reply(&state, "417", &["Input line was too long"]);
            }
            discarding = true;
            line_buf.clear();
            continue;
        }
        if discarding {
            // Tail of an overlong line.
            discarding = false;
            line_buf.clear();
            continue;
        }

        let parsed = Message::parse(&line_buf);
        line_buf.clear();
        let Some(msg) = parsed else {
            continue;
        };
        tracing::debug!(%link, "<- {msg}");

        match dispatch(&mut conn, &msg, &state) {
            Flow::Continue => {}
            Flow::Quit(reason) => {
                quit_reason = reason;
                break;
            }
        }
    }

    disconnect(&mut conn, &state, &quit_reason);
    let _ = tokio::time::timeout(tokio::time::Duration::from_secs(5), write_handle).await;
    Ok(())
}

enum Flow {
    Continue,
    Quit(String),
}

fn dispatch(conn: &mut Connection, msg: &Message, state: &SharedState) -> Flow {
    match msg.command.as_str() {
        "NICK" => registration::handle_nick(conn, msg, state),
        "USER" => registration::handle_user(conn, msg, state),
        "PING" => {
            let token = msg.params.first().map(String::as_str).unwrap_or(&state.server_name);
            let pong = Message::from_server(&state.server_name, "PONG", vec![state.server_name.as_str(), token]);
            conn.send(state, &pong);
        }
        "PONG" => {}
        "QUIT" => {
            let reason = msg.params.first().cloned().unwrap_or_else(|| "Client quit".to_string());
            return Flow::Quit(format!("Quit: {reason}"));
        }
        _ if !conn.registered => {
            conn.reply(state, irc::ERR_NOTREGISTERED, &["You have not registered"]);
        }
        "JOIN" => channel::handle_join(conn, msg, state),
        "PART" => channel::handle_part(conn, msg, state),
        "MODE" => channel::handle_mode(conn, msg, state),
        "TOPIC" => channel::handle_topic(conn, msg, state),
        other => {
            conn.reply(state, irc::ERR_UNKNOWNCOMMAND, &[other, "Unknown command"]);
        }
    }
    Flow::Continue
}

/// Leave every channel, tell the people who could see us, and drop the link.
fn disconnect(conn: &mut Connection, state: &SharedState, reason: &str) {
    let quit = Message::new(Some(&conn.hostmask()), "QUIT", vec![reason]).to_line();
    let mut audience = BTreeSet::new();
    let mut emptied = Vec::new();

    for key in std::mem::take(&mut conn.channels) {
        let Some(handle) = state.registry.find_channel(&key) else {
            continue;
        };
        let mut channel = handle.lock();
        if let Some(member) = channel.remove_member(conn.link)
            && !member.delayed_join
        {
            audience.extend(channel.member_links());
        }
        if channel.is_local() && channel.is_empty() {
            emptied.push(channel.name().to_string());
        }
    }
    let audience: Vec<LinkId> = audience.into_iter().collect();
    state.router.fan_out(Scope::Members(&audience), &[conn.link], &quit);

    for name in emptied {
        state.registry.remove_if_empty(&name);
    }

    if let Some(ref nick) = conn.nick {
        state.release_nick(nick, conn.link);
    }
    if conn.registered {
        let error = format!("ERROR :Closing Link: {} ({reason})\r\n", conn.host);
        state.router.send_one(conn.link, &error);
    }
    state.router.unregister(conn.link);
    tracing::info!(link = %conn.link, nick = conn.nick_or_star(), reason, "Client disconnected");
}
