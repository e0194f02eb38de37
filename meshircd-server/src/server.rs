//! Server assembly: shared state, listeners, and peer dialers.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use parking_lot::Mutex;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

use crate::clock::{Clock, SystemClock};
use crate::config::{Features, ServerConfig};
use crate::connection;
use crate::registry::ChannelRegistry;
use crate::router::{LinkId, Router};
use crate::s2s;
use crate::topic::TopicService;

/// Shared state accessible by all connection handlers and peer links.
pub struct SharedState {
    pub server_name: String,
    pub config: ServerConfig,
    pub features: Features,
    pub registry: Arc<ChannelRegistry>,
    pub router: Arc<Router>,
    pub clock: Arc<dyn Clock>,
    pub topics: TopicService,
    /// lowercased nick -> client link
    pub nicks: Mutex<HashMap<String, LinkId>>,
}

impl SharedState {
    pub fn new(config: ServerConfig, features: Features, clock: Arc<dyn Clock>) -> Self {
        let registry = Arc::new(ChannelRegistry::new());
        let router = Arc::new(Router::new());
        let topics = TopicService::new(
            &config.server_name,
            features.clone(),
            registry.clone(),
            Arc::clone(&router),
            Arc::clone(&clock),
        );
        Self {
            server_name: config.server_name.clone(),
            config,
            features,
            registry,
            router,
            clock,
            topics,
            nicks: Mutex::new(HashMap::new()),
        }
    }

    /// Claim `nick` for `link`. Fails if another link holds it.
    pub fn claim_nick(&self, nick: &str, link: LinkId) -> bool {
        let mut nicks = self.nicks.lock();
        match nicks.get(&nick.to_lowercase()) {
            Some(owner) if *owner != link => false,
            _ => {
                nicks.insert(nick.to_lowercase(), link);
                true
            }
        }
    }

    pub fn release_nick(&self, nick: &str, link: LinkId) {
        let mut nicks = self.nicks.lock();
        if nicks.get(&nick.to_lowercase()) == Some(&link) {
            nicks.remove(&nick.to_lowercase());
        }
    }
}

/// The IRC server node.
pub struct Server {
    config: ServerConfig,
    clock: Arc<dyn Clock>,
}

/// A started server: bound addresses plus the accept loops.
pub struct RunningServer {
    pub state: Arc<SharedState>,
    pub client_addr: SocketAddr,
    pub peer_addr: SocketAddr,
    client_task: JoinHandle<Result<()>>,
    peer_task: JoinHandle<Result<()>>,
}

impl Server {
    pub fn new(config: ServerConfig) -> Self {
        Self { config, clock: Arc::new(SystemClock) }
    }

    /// Create a server with a custom clock (for testing).
    pub fn with_clock(config: ServerConfig, clock: Arc<dyn Clock>) -> Self {
        Self { config, clock }
    }

    fn build_state(&self) -> Result<Arc<SharedState>> {
        let features = self
            .config
            .features()
            .context("Failed to load feature configuration")?;
        tracing::info!(?features, "Features loaded");
        Ok(Arc::new(SharedState::new(self.config.clone(), features, Arc::clone(&self.clock))))
    }

    /// Bind both listeners, spawn the accept loops and dial configured peers.
    pub async fn start(self) -> Result<RunningServer> {
        let state = self.build_state()?;

        let listener = TcpListener::bind(&self.config.listen_addr)
            .await
            .with_context(|| format!("Failed to bind client listener {}", self.config.listen_addr))?;
        let client_addr = listener.local_addr()?;
        tracing::info!("Client listener on {client_addr}");

        let peer_listener = TcpListener::bind(&self.config.peer_listen_addr)
            .await
            .with_context(|| format!("Failed to bind peer listener {}", self.config.peer_listen_addr))?;
        let peer_addr = peer_listener.local_addr()?;
        tracing::info!("Peer listener on {peer_addr}");

        let client_task = tokio::spawn(accept_clients(listener, Arc::clone(&state)));
        let peer_task = tokio::spawn(accept_peers(peer_listener, Arc::clone(&state)));

        for peer in &self.config.peers {
            s2s::connect_peer_with_retry(peer.clone(), Arc::clone(&state));
        }

        Ok(RunningServer { state, client_addr, peer_addr, client_task, peer_task })
    }

    /// Start and serve until a listener fails.
    pub async fn run(self) -> Result<()> {
        let running = self.start().await?;
        tracing::info!(server = %running.state.server_name, "Server running");
        running.wait().await
    }
}

async fn accept_clients(listener: TcpListener, state: Arc<SharedState>) -> Result<()> {
    loop {
        let (stream, _addr) = listener.accept().await.context("Client accept failed")?;
        let state = Arc::clone(&state);
        tokio::spawn(async move {
            if let Err(e) = connection::handle(stream, state).await {
                tracing::error!("Connection error: {e}");
            }
        });
    }
}

async fn accept_peers(listener: TcpListener, state: Arc<SharedState>) -> Result<()> {
    loop {
        let (stream, addr) = listener.accept().await.context("Peer accept failed")?;
        let state = Arc::clone(&state);
        tokio::spawn(async move {
            if let Err(e) = s2s::handle_link(stream, state, false).await {
                tracing::warn!(%addr, "Peer link error: {e}");
            }
        });
    }
}

impl RunningServer {
    /// Wait for either accept loop to end.
    pub async fn wait(self) -> Result<()> {
        tokio::select! {
            r = self.client_task => r?,
            r = self.peer_task => r?,
        }
    }

    /// Dial another server, reconnecting with backoff.
    pub fn connect_peer(&self, addr: SocketAddr) {
        s2s::connect_peer_with_retry(addr.to_string(), Arc::clone(&self.state));
    }

    /// Stop accepting new connections. Existing ones run until they close.
    pub fn shutdown(&self) {
        self.client_task.abort();
        self.peer_task.abort();
    }
}
