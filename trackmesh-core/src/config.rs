//! Configuration management for trackmesh
//!
//! Handles CLI argument parsing, config file loading, and defaults.

use clap::{Args, Parser, Subcommand};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::client::ClientConfig;
use crate::messages::PeerAddr;
use crate::node::NodeConfig;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parsing error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Default address of a local node's API, used by the client subcommands
pub const DEFAULT_API_ADDR: &str = "127.0.0.1:8070";

#[derive(Parser, Debug)]
#[command(name = "trackmesh")]
#[command(about = "Peer-to-peer mesh node for content-addressed media", long_about = None)]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Start a mesh node
    Start(StartCommand),

    /// Add a local file to a running node
    Add(AddCommand),

    /// Download a track by hash through a running node
    Get(GetCommand),

    /// List the tracks in a node's catalog
    List(ApiArgs),

    /// List a node's peers, or add one with --add
    Peers(PeersCommand),

    /// Show node statistics
    Stats(ApiArgs),
}

#[derive(Args, Debug, Clone)]
pub struct StartCommand {
    /// Data directory for catalog, peers and content
    #[arg(long, default_value = "./data")]
    pub data_dir: PathBuf,

    /// Interface to bind the HTTP server to
    #[arg(long, default_value = "0.0.0.0")]
    pub host: String,

    /// TCP port for the HTTP server (0 picks a free port)
    #[arg(long, default_value_t = 8070)]
    pub port: u16,

    /// Host other nodes should use to reach this one
    #[arg(long)]
    pub advertise_host: Option<String>,

    /// Seed peer host:port (can be specified multiple times)
    #[arg(long = "seed")]
    pub seeds: Vec<String>,

    /// Seconds between gossip rounds
    #[arg(long, default_value_t = 30)]
    pub gossip_interval_secs: u64,

    /// Upper bound on one gossip round in seconds
    #[arg(long, default_value_t = 10)]
    pub gossip_round_timeout_secs: u64,

    /// Peers contacted per gossip round
    #[arg(long, default_value_t = 8)]
    pub gossip_fanout: usize,

    /// Timeout for each outbound request in milliseconds
    #[arg(long, default_value_t = 5000)]
    pub request_timeout_ms: u64,

    /// Retries after a failed outbound request
    #[arg(long, default_value_t = 1)]
    pub request_retries: u32,

    /// Consecutive failures before a peer is evicted
    #[arg(long, default_value_t = 5)]
    pub failure_threshold: u32,

    /// Seconds without contact before a peer is deprioritized
    #[arg(long, default_value_t = 600)]
    pub stale_after_secs: u64,

    /// Peers raced in parallel when fetching a track
    #[arg(long, default_value_t = 3)]
    pub fetch_race_width: usize,

    /// Logging level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    pub log_level: String,

    /// TOML config file; replaces the flags above when given
    #[arg(long)]
    pub config: Option<PathBuf>,
}

/// Address of the node the client subcommands talk to
#[derive(Args, Debug, Clone)]
pub struct ApiArgs {
    /// Node API address (host:port)
    #[arg(long, default_value = DEFAULT_API_ADDR)]
    pub api: PeerAddr,
}

#[derive(Args, Debug, Clone)]
pub struct AddCommand {
    /// File to add
    pub file: PathBuf,

    #[arg(long)]
    pub title: String,

    #[arg(long)]
    pub artist: Option<String>,

    #[arg(long)]
    pub album: Option<String>,

    #[arg(long)]
    pub duration_seconds: Option<f64>,

    #[command(flatten)]
    pub api: ApiArgs,
}

#[derive(Args, Debug, Clone)]
pub struct GetCommand {
    /// Content hash (64 hex characters)
    pub hash: String,

    /// Where to write the track
    #[arg(long, short)]
    pub output: PathBuf,

    #[command(flatten)]
    pub api: ApiArgs,
}

#[derive(Args, Debug, Clone)]
pub struct PeersCommand {
    /// Handshake with this host:port and register it
    #[arg(long)]
    pub add: Option<PeerAddr>,

    #[command(flatten)]
    pub api: ApiArgs,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub data_dir: PathBuf,
    pub host: String,
    pub port: u16,
    pub advertise_host: Option<String>,
    pub seeds: Vec<String>,
    pub gossip_interval_secs: u64,
    pub gossip_round_timeout_secs: u64,
    pub gossip_fanout: usize,
    pub request_timeout_ms: u64,
    pub request_retries: u32,
    pub failure_threshold: u32,
    pub stale_after_secs: u64,
    pub fetch_race_width: usize,
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            data_dir: PathBuf::from("./data"),
            host: "0.0.0.0".to_string(),
            port: 8070,
            advertise_host: None,
            seeds: Vec::new(),
            gossip_interval_secs: 30,
            gossip_round_timeout_secs: 10,
            gossip_fanout: 8,
            request_timeout_ms: 5000,
            request_retries: 1,
            failure_threshold: 5,
            stale_after_secs: 600,
            fetch_race_width: 3,
            log_level: "info".to_string(),
        }
    }
}

impl Config {
    /// Build the config for `start`, preferring the file named by `--config`
    pub fn from_start_command(cmd: StartCommand) -> Result<Self, ConfigError> {
        let config = match &cmd.config {
            Some(path) => Self::load_from_file(path)?,
            None => cmd.into(),
        };
        config.validate()?;
        Ok(config)
    }

    /// Load config from a TOML file; missing keys take their defaults
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let positive = [
            ("gossip_interval_secs", self.gossip_interval_secs),
            ("gossip_round_timeout_secs", self.gossip_round_timeout_secs),
            ("gossip_fanout", self.gossip_fanout as u64),
            ("request_timeout_ms", self.request_timeout_ms),
            ("failure_threshold", u64::from(self.failure_threshold)),
            ("fetch_race_width", self.fetch_race_width as u64),
        ];
        for (name, value) in positive {
            if value == 0 {
                return Err(ConfigError::Invalid(format!("{} must be greater than 0", name)));
            }
        }
        self.seed_addrs()?;
        Ok(())
    }

    pub fn seed_addrs(&self) -> Result<Vec<PeerAddr>, ConfigError> {
        self.seeds
            .iter()
            .map(|seed| seed.parse().map_err(|e| ConfigError::Invalid(format!("{}", e))))
            .collect()
    }

    /// Host advertised to peers; a wildcard bind falls back to loopback
    pub fn advertise_host(&self) -> String {
        match &self.advertise_host {
            Some(host) => host.clone(),
            None if self.host == "0.0.0.0" => "127.0.0.1".to_string(),
            None if self.host == "::" => "::1".to_string(),
            None => self.host.clone(),
        }
    }

    pub fn bind_addr(&self) -> String {
        PeerAddr::new(self.host.clone(), self.port).to_string()
    }

    /// Node settings once the listener is bound to `port`
    pub fn node_config(&self, port: u16) -> Result<NodeConfig, ConfigError> {
        let mut node = NodeConfig::new(
            self.data_dir.clone(),
            PeerAddr::new(self.advertise_host(), port),
        );
        node.seeds = self.seed_addrs()?;
        node.gossip_interval = Duration::from_secs(self.gossip_interval_secs);
        node.gossip_round_timeout = Duration::from_secs(self.gossip_round_timeout_secs);
        node.gossip_fanout = self.gossip_fanout;
        node.failure_threshold = self.failure_threshold;
        node.stale_after = Duration::from_secs(self.stale_after_secs);
        node.fetch_race_width = self.fetch_race_width;
        node.client = ClientConfig {
            request_timeout: Duration::from_millis(self.request_timeout_ms),
            retries: self.request_retries,
        };
        Ok(node)
    }
}

impl From<StartCommand> for Config {
    fn from(cmd: StartCommand) -> Self {
        Config {
            data_dir: cmd.data_dir,
            host: cmd.host,
            port: cmd.port,
            advertise_host: cmd.advertise_host,
            seeds: cmd.seeds,
            gossip_interval_secs: cmd.gossip_interval_secs,
            gossip_round_timeout_secs: cmd.gossip_round_timeout_secs,
            gossip_fanout: cmd.gossip_fanout,
            request_timeout_ms: cmd.request_timeout_ms,
            request_retries: cmd.request_retries,
            failure_threshold: cmd.failure_threshold,
            stale_after_secs: cmd.stale_after_secs,
            fetch_race_width: cmd.fetch_race_width,
            log_level: cmd.log_level,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Commands {
        Cli::try_parse_from(args).unwrap().command
    }

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.data_dir, PathBuf::from("./data"));
        assert_eq!(config.port, 8070);
        assert_eq!(config.failure_threshold, 5);
        assert_eq!(config.stale_after_secs, 600);
        assert_eq!(config.fetch_race_width, 3);
        assert_eq!(config.log_level, "info");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_start_flags_match_defaults() {
        let Commands::Start(cmd) = parse(&["trackmesh", "start"]) else {
            panic!("Expected start command");
        };
        assert_eq!(Config::from(cmd), Config::default());
    }

    #[test]
    fn test_config_from_start_command() {
        let Commands::Start(cmd) = parse(&[
            "trackmesh",
            "start",
            "--data-dir",
            "./test-data",
            "--port",
            "9000",
            "--seed",
            "10.0.0.1:7070",
            "--seed",
            "10.0.0.2:7070",
            "--fetch-race-width",
            "2",
            "--log-level",
            "debug",
        ]) else {
            panic!("Expected start command");
        };

        let config = Config::from_start_command(cmd).unwrap();
        assert_eq!(config.data_dir, PathBuf::from("./test-data"));
        assert_eq!(config.port, 9000);
        assert_eq!(config.fetch_race_width, 2);
        assert_eq!(config.log_level, "debug");
        assert_eq!(
            config.seed_addrs().unwrap(),
            vec![PeerAddr::new("10.0.0.1", 7070), PeerAddr::new("10.0.0.2", 7070)]
        );
    }

    #[test]
    fn test_load_partial_toml() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("node.toml");
        std::fs::write(
            &path,
            "port = 9100\nseeds = [\"127.0.0.1:9200\"]\ngossip_interval_secs = 5\n",
        )
        .unwrap();

        let config = Config::load_from_file(&path).unwrap();
        assert_eq!(config.port, 9100);
        assert_eq!(config.gossip_interval_secs, 5);
        assert_eq!(config.failure_threshold, 5);
        assert_eq!(config.seeds, vec!["127.0.0.1:9200".to_string()]);
    }

    #[test]
    fn test_malformed_toml() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("node.toml");
        std::fs::write(&path, "port = \"not a number\"").unwrap();

        assert!(matches!(Config::load_from_file(&path), Err(ConfigError::Toml(_))));
    }

    #[test]
    fn test_validation() {
        let config = Config {
            fetch_race_width: 0,
            ..Config::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));

        let config = Config {
            seeds: vec!["no-port".to_string()],
            ..Config::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_node_config() {
        let config = Config {
            advertise_host: None,
            request_timeout_ms: 250,
            ..Config::default()
        };

        let node = config.node_config(9123).unwrap();
        assert_eq!(node.advertise_addr, PeerAddr::new("127.0.0.1", 9123));
        assert_eq!(node.client.request_timeout, Duration::from_millis(250));
        assert_eq!(node.gossip_interval, Duration::from_secs(30));

        let config = Config {
            advertise_host: Some("node1".to_string()),
            ..Config::default()
        };
        assert_eq!(config.node_config(1).unwrap().advertise_addr.host, "node1");
    }

    #[test]
    fn test_ipv6_wildcard_advertises_ipv6_loopback() {
        let config = Config {
            host: "::".to_string(),
            port: 9000,
            ..Config::default()
        };

        assert_eq!(config.bind_addr(), "[::]:9000");
        assert_eq!(config.advertise_host(), "::1");
        let node = config.node_config(9000).unwrap();
        assert_eq!(node.advertise_addr.base_url(), "http://[::1]:9000");
    }

    #[test]
    fn test_client_subcommands() {
        let Commands::Get(cmd) = parse(&["trackmesh", "get", "abc", "--output", "out.bin"]) else {
            panic!("Expected get command");
        };
        assert_eq!(cmd.api.api, PeerAddr::new("127.0.0.1", 8070));
        assert_eq!(cmd.output, PathBuf::from("out.bin"));

        let Commands::Peers(cmd) = parse(&[
            "trackmesh",
            "peers",
            "--api",
            "127.0.0.1:9000",
            "--add",
            "10.0.0.5:7070",
        ]) else {
            panic!("Expected peers command");
        };
        assert_eq!(cmd.api.api.port, 9000);
        assert_eq!(cmd.add, Some(PeerAddr::new("10.0.0.5", 7070)));

        assert!(Cli::try_parse_from(["trackmesh", "add", "f.mp3"]).is_err());
    }
}
