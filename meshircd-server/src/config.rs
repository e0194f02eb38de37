//! Server configuration: command line / environment, plus an optional TOML
//! file of feature flags.

use std::path::{Path, PathBuf};

use clap::Parser;
use serde::Deserialize;

/// Errors loading the features file.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}

#[derive(Debug, Clone, Parser)]
#[command(name = "meshircd-server", about = "Mesh-linked IRC server node")]
pub struct ServerConfig {
    /// Name this server announces to clients and peers.
    #[arg(long, env = "MESHIRCD_SERVER_NAME", default_value = "irc.local")]
    pub server_name: String,

    /// Free-form description sent in the SERVER handshake.
    #[arg(long, env = "MESHIRCD_DESCRIPTION", default_value = "meshircd node")]
    pub description: String,

    /// Address for client connections.
    #[arg(long, env = "MESHIRCD_LISTEN", default_value = "127.0.0.1:6667")]
    pub listen_addr: String,

    /// Address for incoming peer server links.
    #[arg(long, env = "MESHIRCD_PEER_LISTEN", default_value = "127.0.0.1:7000")]
    pub peer_listen_addr: String,

    /// Peer servers to dial (host:port), reconnecting with backoff.
    #[arg(long = "peer", env = "MESHIRCD_PEERS", value_delimiter = ',')]
    pub peers: Vec<String>,

    /// Depth of each connection's outbound queue. A full queue drops lines
    /// for that connection only.
    #[arg(long, env = "MESHIRCD_SEND_QUEUE", default_value_t = 1024)]
    pub send_queue: usize,

    /// TOML file with a `[features]` table.
    #[arg(long, env = "MESHIRCD_CONFIG")]
    pub config_file: Option<PathBuf>,

    /// Record topic setters as nick!user@host instead of nick.
    #[arg(long)]
    pub host_in_topic: Option<bool>,

    /// Show a generic name instead of real server names to clients.
    #[arg(long)]
    pub hide_server_names: Option<bool>,

    /// The generic name shown when server names are hidden.
    #[arg(long)]
    pub hidden_server_name: Option<String>,

    /// Send channel topics to peers when a link comes up.
    #[arg(long)]
    pub topic_burst: Option<bool>,
}

impl ServerConfig {
    /// Config with defaults only, ignoring the process command line.
    pub fn for_test(server_name: &str) -> Self {
        let mut config = Self::parse_from(["meshircd-server"]);
        config.server_name = server_name.to_string();
        config.listen_addr = "127.0.0.1:0".to_string();
        config.peer_listen_addr = "127.0.0.1:0".to_string();
        config
    }

    /// Load features from the config file (if any) and apply command-line overrides.
    pub fn features(&self) -> Result<Features, ConfigError> {
        let mut features = match self.config_file {
            Some(ref path) => FileConfig::load(path)?.features,
            None => Features::default(),
        };
        if let Some(v) = self.host_in_topic {
            features.host_in_topic = v;
        }
        if let Some(v) = self.hide_server_names {
            features.hide_server_names = v;
        }
        if let Some(ref name) = self.hidden_server_name {
            features.hidden_server_name = name.clone();
        }
        if let Some(v) = self.topic_burst {
            features.topic_burst = v;
        }
        Ok(features)
    }
}

/// Behaviour switches for topic handling.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct Features {
    /// Synthesized setter is `nick!user@host` rather than `nick`.
    pub host_in_topic: bool,
    /// Topic changes made by servers are shown to clients as coming from
    /// `hidden_server_name`.
    pub hide_server_names: bool,
    pub hidden_server_name: String,
    /// Send each channel's topic to a peer when the link comes up.
    pub topic_burst: bool,
}

impl Default for Features {
    fn default() -> Self {
        Self {
            host_in_topic: true,
            hide_server_names: false,
            hidden_server_name: "*.mesh".to_string(),
            topic_burst: true,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct FileConfig {
    features: Features,
}

impl FileConfig {
    fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }
}
