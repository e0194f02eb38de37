//! Server-to-server links over TCP.
//!
//! # Protocol
//!
//! Each link carries newline-delimited IRC lines. Both sides open with
//!
//! ```text
//! SERVER <name> :<description>
//! ```
//!
//! and the link is registered with the router only once the peer's SERVER
//! line has arrived. The new link then receives a burst of our mesh
//! channels:
//!
//! ```text
//! :<server> CREATE <chan> <creation_ts>
//! :<server> TOPIC <chan> <setter> <creation_ts> <topic_ts> :<text>
//! ```
//!
//! After that, live `CREATE` and `TOPIC` lines flow in both directions.
//! `&` channels never appear on a link.
//!
//! # Topology
//!
//! Any mesh shape works. CREATE is forwarded only when it changed
//! something, and a relayed TOPIC is forwarded only when it won the merge,
//! so neither loops in a cyclic mesh.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::mpsc;

use crate::channel::{Channel, Topic, is_channel_name, is_local_channel};
use crate::irc::Message;
use crate::router::{LinkId, LinkKind, Scope};
use crate::server::SharedState;
use crate::source::Source;
use crate::topic::reconcile::parse_ts;

/// Longest accepted line on a peer link.
const MAX_LINE_LEN: usize = 8192;
/// Time allowed for the peer's SERVER line.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
/// Idle time before we PING a peer.
const PING_INTERVAL: Duration = Duration::from_secs(60);
/// Silence after which a peer is considered dead.
const PING_TIMEOUT: Duration = Duration::from_secs(180);

/// Run one peer link (accepted or dialed) until it closes.
pub async fn handle_link(stream: TcpStream, state: Arc<SharedState>, outgoing: bool) -> Result<()> {
    let remote = stream.peer_addr()?;
    let link = LinkId::next();
    let (reader, mut writer) = tokio::io::split(stream);
    let mut reader = BufReader::new(reader);

    let hello = Message::new(
        None,
        "SERVER",
        vec![state.server_name.as_str(), state.config.description.as_str()],
    );
    writer.write_all(hello.to_line().as_bytes()).await?;
    writer.flush().await?;

    let mut line = String::new();
    let n = tokio::time::timeout(HANDSHAKE_TIMEOUT, (&mut reader).take(MAX_LINE_LEN as u64).read_line(&mut line))
        .await
        .with_context(|| format!("Peer {remote} sent no SERVER line"))??;
    if n == 0 {
        bail!("Peer {remote} closed before the handshake");
    }
    let peer_name = match Message::parse(&line) {
        Some(msg) if msg.command == "SERVER" && !msg.params.is_empty() => msg.params[0].clone(),
        _ => bail!("Peer {remote} opened with {:?} instead of SERVER", line.trim_end()),
    };
    if peer_name.eq_ignore_ascii_case(&state.server_name) {
        bail!("Peer {remote} claims our own name {peer_name}");
    }

    if let Some(existing) = state.router.peer_by_name(&peer_name) {
        // Both sides dialed each other. The link opened by the server with
        // the lower name survives, on both ends.
        let keep_new = (state.server_name.as_str() < peer_name.as_str()) == outgoing;
        if !keep_new {
            bail!("Duplicate link to {peer_name}, keeping {existing}");
        }
        tracing::info!(peer = %peer_name, old = %existing, new = %link, "Replacing duplicate peer link");
        state.router.unregister(existing);
    }

    let (tx, mut rx) = mpsc::channel::<String>(state.config.send_queue.max(1));
    state.router.register_as(link, LinkKind::Peer, &peer_name, tx);
    tracing::info!(%link, peer = %peer_name, %remote, outgoing, "Peer link established");

    let write_peer = peer_name.clone();
    let write_handle = tokio::spawn(async move {
        while let Some(line) = rx.recv().await {
            if let Err(e) = writer.write_all(line.as_bytes()).await {
                tracing::warn!(peer = %write_peer, "Peer write error: {e}");
                return;
            }
            while let Ok(queued) = rx.try_recv() {
                if let Err(e) = writer.write_all(queued.as_bytes()).await {
                    tracing::warn!(peer = %write_peer, "Peer write error: {e}");
                    return;
                }
            }
            if let Err(e) = writer.flush().await {
                tracing::warn!(peer = %write_peer, "Peer flush error: {e}");
                return;
            }
        }
        let _ = writer.shutdown().await;
    });

    burst(&state, link);

    let mut last_activity = tokio::time::Instant::now();
    let mut awaiting_pong = false;
    let mut discarding = false;
    line.clear();
    loop {
        let room = MAX_LINE_LEN.saturating_sub(line.len()).max(1) as u64;
        match tokio::time::timeout(PING_INTERVAL, (&mut reader).take(room).read_line(&mut line)).await {
            Ok(Ok(0)) => break,
            Ok(Err(e)) => {
                tracing::warn!(peer = %peer_name, "Peer read error: {e}");
                break;
            }
            Err(_) => {
                if !awaiting_pong {
                    let ping = Message::from_server(&state.server_name, "PING", vec![state.server_name.as_str()]);
                    state.router.send_one(link, &ping.to_line());
                    awaiting_pong = true;
                } else if last_activity.elapsed() > PING_TIMEOUT {
                    tracing::warn!(peer = %peer_name, "Peer ping timeout");
                    break;
                }
                continue;
            }
            Ok(Ok(_)) => {}
        }
        last_activity = tokio::time::Instant::now();
        awaiting_pong = false;

        if !line.ends_with('\n') {
            if line.len() >= MAX_LINE_LEN {
                if !discarding {
                    state.router.record_violation(link, "line too long");
                }
                discarding = true;
                line.clear();
            }
            continue;
        }
        if discarding {
            discarding = false;
            line.clear();
            continue;
        }

        let parsed = Message::parse(&line);
        line.clear();
        if let Some(msg) = parsed {
            tracing::debug!(peer = %peer_name, "<< {msg}");
            process_peer_message(&state, link, &peer_name, &msg);
        }
    }

    state.router.unregister(link);
    write_handle.abort();
    tracing::info!(%link, peer = %peer_name, "Peer link closed");
    Ok(())
}

/// Queue our mesh channels, and their topics, for a newly registered link.
pub fn burst(state: &SharedState, link: LinkId) {
    let mut channels = 0usize;
    let mut topics = 0usize;
    for handle in state.registry.all() {
        let channel = handle.lock();
        if channel.is_local() {
            continue;
        }
        let cts = channel.creation_ts().to_string();
        let create = Message::from_server(&state.server_name, "CREATE", vec![channel.name(), cts.as_str()]);
        state.router.send_one(link, &create.to_line());
        channels += 1;

        let topic = channel.topic();
        if state.features.topic_burst && topic.is_set() {
            let tts = topic.set_at.to_string();
            let line = Message::from_server(
                &state.server_name,
                "TOPIC",
                vec![channel.name(), topic.setter.as_str(), cts.as_str(), tts.as_str(), topic.text.as_str()],
            );
            state.router.send_one(link, &line.to_line());
            topics += 1;
        }
    }
    tracing::info!(%link, channels, topics, "Burst sent");
}

/// Handle one line from an established peer link.
pub fn process_peer_message(state: &SharedState, link: LinkId, peer_name: &str, msg: &Message) {
    match msg.command.as_str() {
        "PING" => {
            let token = msg.params.first().map(String::as_str).unwrap_or(peer_name);
            let pong = Message::from_server(&state.server_name, "PONG", vec![state.server_name.as_str(), token]);
            state.router.send_one(link, &pong.to_line());
        }
        "PONG" => {}
        "CREATE" => handle_create(state, link, peer_name, msg),
        "TOPIC" => {
            let source = Source::from_peer_prefix(link, peer_name, msg.prefix.as_deref());
            state.topics.handle_server_topic(&source, &msg.params);
        }
        "SERVER" => {
            state.router.record_violation(link, "SERVER after handshake");
        }
        "ERROR" => {
            tracing::warn!(peer = peer_name, "Peer reported error: {}", msg.params.join(" "));
        }
        other => {
            tracing::debug!(peer = peer_name, command = other, "Ignoring peer command");
        }
    }
}

/// `CREATE <chan> <creation_ts>`: learn a mesh channel, or an older birth date for one.
fn handle_create(state: &SharedState, link: LinkId, peer_name: &str, msg: &Message) {
    let (Some(name), Some(ts)) = (msg.params.first(), msg.params.get(1)) else {
        state.router.record_violation(link, "CREATE with too few parameters");
        return;
    };
    if !is_channel_name(name) || is_local_channel(name) {
        state.router.record_violation(link, "CREATE for a local or invalid channel");
        return;
    }
    let cts = parse_ts(ts);
    if cts == 0 {
        state.router.record_violation(link, "CREATE without a creation time");
        return;
    }

    let (handle, created) = state.registry.get_or_create(name, cts);
    let lowered = !created && adopt_older_creation(state, &mut handle.lock(), cts);
    if !created && !lowered {
        return;
    }
    tracing::debug!(channel = %name, cts, created, lowered, "Channel creation time from peer");

    let origin = msg.prefix.as_deref().unwrap_or(peer_name);
    let cts = cts.to_string();
    let line = Message::new(Some(origin), "CREATE", vec![name.as_str(), cts.as_str()]);
    state.router.fan_out(Scope::Mesh, &[link], &line.to_line());
}

/// Take an older creation time. Our topic belonged to the younger channel,
/// so it is cleared and the older side's topic is left to win the merge.
fn adopt_older_creation(state: &SharedState, channel: &mut Channel, cts: u64) -> bool {
    if !channel.lower_creation_ts(cts) {
        return false;
    }
    if channel.topic().is_set() {
        // Topic time resets to 0 here on purpose: any topic the older side
        // bursts must beat the one we are dropping.
        channel.replace_topic(Topic::default());
        let from = if state.features.hide_server_names {
            state.features.hidden_server_name.as_str()
        } else {
            state.server_name.as_str()
        };
        let line = Message::new(Some(from), "TOPIC", vec![channel.name(), ""]).to_line();
        state.router.fan_out(Scope::Members(&channel.member_links()), &[], &line);
        tracing::info!(channel = channel.name(), cts, "Topic cleared by older channel");
    }
    true
}

/// Dial a peer, reconnecting with exponential backoff (1s up to 60s).
pub fn connect_peer_with_retry(addr: String, state: Arc<SharedState>) {
    tokio::spawn(async move {
        let mut backoff = Duration::from_secs(1);
        let max_backoff = Duration::from_secs(60);

        loop {
            tracing::info!(peer = %addr, "Connecting to peer");
            match TcpStream::connect(&addr).await {
                Ok(stream) => {
                    backoff = Duration::from_secs(1);
                    if let Err(e) = handle_link(stream, Arc::clone(&state), true).await {
                        tracing::warn!(peer = %addr, "Peer link failed: {e}");
                    } else {
                        tracing::warn!(peer = %addr, "Peer link dropped, will reconnect");
                    }
                }
                Err(e) => {
                    tracing::warn!(peer = %addr, backoff_secs = backoff.as_secs(), "Peer connect failed: {e}");
                }
            }

            tokio::time::sleep(backoff).await;
            backoff = (backoff * 2).min(max_backoff);
        }
    });
}
