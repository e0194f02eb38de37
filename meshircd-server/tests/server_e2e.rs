//! End-to-end tests over real TCP: two linked servers and plain IRC clients.

use std::time::Duration;

use meshircd_server::config::ServerConfig;
use meshircd_server::registry::Directory;
use meshircd_server::server::{RunningServer, Server};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::time::{sleep, timeout};

/// How long to wait for a line or a state change before failing.
const TIMEOUT: Duration = Duration::from_secs(10);

// ── Helpers ──────────────────────────────────────────────────────

async fn start(name: &str) -> RunningServer {
    Server::new(ServerConfig::for_test(name))
        .start()
        .await
        .unwrap_or_else(|e| panic!("Failed to start {name}: {e}"))
}

/// Start `a` and `b` with `b` dialing `a`, and wait for the link on both ends.
async fn linked_pair() -> (RunningServer, RunningServer) {
    let a = start("a.test").await;
    let b = start("b.test").await;
    b.connect_peer(a.peer_addr);
    eventually("link a <-> b", || {
        !a.state.router.peers().is_empty() && !b.state.router.peers().is_empty()
    })
    .await;
    (a, b)
}

async fn eventually(what: &str, check: impl Fn() -> bool) {
    timeout(TIMEOUT, async {
        while !check() {
            sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("Timed out waiting for {what}"));
}

struct Client {
    lines: Lines<BufReader<OwnedReadHalf>>,
    write: OwnedWriteHalf,
}

impl Client {
    async fn connect(server: &RunningServer, nick: &str) -> Self {
        let stream = TcpStream::connect(server.client_addr).await.expect("connect");
        let (read, write) = stream.into_split();
        let mut client = Self { lines: BufReader::new(read).lines(), write };
        client.send(&format!("NICK {nick}")).await;
        client.send(&format!("USER {nick} 0 * :{nick}")).await;
        client.expect(" 001 ").await;
        client
    }

    async fn send(&mut self, line: &str) {
        self.write.write_all(format!("{line}\r\n").as_bytes()).await.expect("write");
    }

    /// Read until a line containing `needle` arrives; returns it.
    async fn expect(&mut self, needle: &str) -> String {
        timeout(TIMEOUT, async {
            loop {
                let line = self.lines.next_line().await.expect("read").expect("connection closed");
                if line.contains(needle) {
                    return line;
                }
            }
        })
        .await
        .unwrap_or_else(|_| panic!("Timed out waiting for {needle:?}"))
    }

    async fn join(&mut self, channel: &str) {
        self.send(&format!("JOIN {channel}")).await;
        self.expect(" 366 ").await;
    }
}

fn topic_of(server: &RunningServer, channel: &str) -> Option<String> {
    let ch = server.state.registry.find_channel(channel)?;
    let text = ch.lock().topic().text.to_string();
    Some(text)
}

// ── Tests ────────────────────────────────────────────────────────

#[tokio::test]
async fn topic_set_on_one_server_reaches_members_on_the_other() {
    let (a, b) = linked_pair().await;

    let mut alice = Client::connect(&a, "alice").await;
    alice.join("#mesh").await;
    eventually("b learns #mesh", || b.state.registry.find_channel("#mesh").is_some()).await;

    let mut bob = Client::connect(&b, "bob").await;
    bob.join("#mesh").await;

    alice.send("TOPIC #mesh :hello mesh").await;
    assert_eq!(
        alice.expect(" TOPIC ").await,
        ":alice!alice@127.0.0.1 TOPIC #mesh :hello mesh"
    );
    assert_eq!(
        bob.expect(" TOPIC ").await,
        ":alice!alice@127.0.0.1 TOPIC #mesh :hello mesh"
    );
}

#[tokio::test]
async fn late_joiner_elsewhere_sees_topic_and_setter() {
    let (a, b) = linked_pair().await;

    let mut alice = Client::connect(&a, "alice").await;
    alice.join("#late").await;
    alice.send("TOPIC #late :set before you came").await;
    alice.expect(" TOPIC ").await;
    eventually("topic reaches b", || topic_of(&b, "#late").as_deref() == Some("set before you came")).await;

    let mut carol = Client::connect(&b, "carol").await;
    carol.send("JOIN #late").await;
    assert_eq!(carol.expect(" 332 ").await, ":b.test 332 carol #late :set before you came");
    let who = carol.expect(" 333 ").await;
    assert!(who.starts_with(":b.test 333 carol #late alice!alice@127.0.0.1 "), "{who}");
}

#[tokio::test]
async fn topics_set_during_a_split_converge_when_linked() {
    let a = start("a.test").await;
    let b = start("b.test").await;

    let mut alice = Client::connect(&a, "alice").await;
    alice.join("#split").await;
    alice.send("TOPIC #split :only on a").await;
    alice.expect(" TOPIC ").await;

    b.connect_peer(a.peer_addr);
    eventually("b adopts a's topic", || topic_of(&b, "#split").as_deref() == Some("only on a")).await;
    assert_eq!(topic_of(&a, "#split").as_deref(), Some("only on a"));
}

#[tokio::test]
async fn local_channels_stay_local() {
    let (a, b) = linked_pair().await;

    let mut alice = Client::connect(&a, "alice").await;
    alice.join("&here").await;
    alice.send("TOPIC &here :not for export").await;
    alice.expect(" TOPIC ").await;

    // A mesh channel created afterwards marks the point by which &here would have arrived.
    alice.join("#marker").await;
    eventually("b learns #marker", || b.state.registry.find_channel("#marker").is_some()).await;
    assert!(b.state.registry.find_channel("&here").is_none());
}

#[tokio::test]
async fn unranked_member_is_refused_under_topic_lock() {
    let a = start("a.test").await;
    let mut alice = Client::connect(&a, "alice").await;
    let mut dave = Client::connect(&a, "dave").await;
    alice.join("#locked").await;
    dave.join("#locked").await;

    dave.send("TOPIC #locked :mine").await;
    assert_eq!(dave.expect(" 482 ").await, ":a.test 482 dave #locked :You're not channel operator");

    alice.send("MODE #locked -t").await;
    dave.expect(" MODE ").await;
    dave.send("TOPIC #locked :mine").await;
    assert_eq!(alice.expect(" TOPIC ").await, ":dave!dave@127.0.0.1 TOPIC #locked :mine");
}
