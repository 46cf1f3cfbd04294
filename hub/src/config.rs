use std::{fs, path::PathBuf, time::Duration};

use anyhow::{Context, Result};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use clap::Parser;
use serde::Deserialize;

/// Command line options for the chat hub.
#[derive(Parser, Debug, Default)]
#[command(author, version, about)]
pub struct Cli {
    /// Override bind address (host:port).
    #[arg(long)]
    pub bind: Option<String>,
    /// Override server port.
    #[arg(long)]
    pub port: Option<u16>,
    /// Enable or disable logging (true/false).
    #[arg(long)]
    pub logging: Option<bool>,
    /// Path to configuration file.
    #[arg(long)]
    pub config: Option<PathBuf>,
}

/// Shared HS256 secret used to verify bearer tokens.
#[derive(Clone, PartialEq, Eq)]
pub struct JwtSecret(pub Vec<u8>);

impl std::fmt::Debug for JwtSecret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("JwtSecret(<redacted>)")
    }
}

/// Tunables of the chat hub itself.
#[derive(Clone, Debug)]
pub struct ChatSettings {
    /// Reject join/send for houses missing from the caller's tenancy claim.
    pub require_tenancy: bool,
    /// Longest a broadcast waits on a single connection's outbox.
    pub send_timeout: Duration,
    /// Frames buffered per connection before sends start waiting.
    pub outbox_capacity: usize,
}

impl Default for ChatSettings {
    fn default() -> Self {
        Self {
            require_tenancy: true,
            send_timeout: Duration::from_millis(default_send_timeout_ms()),
            outbox_capacity: default_outbox_capacity(),
        }
    }
}

/// Runtime configuration for the server resolved from file, env and CLI.
#[derive(Clone, Debug)]
pub struct Config {
    /// Address to bind the HTTP server to.
    pub bind: String,
    /// Directory holding the message database.
    pub data_dir: PathBuf,
    /// Whether verbose logging is enabled.
    pub logging_enabled: bool,
    pub jwt_secret: JwtSecret,
    pub chat: ChatSettings,
}

#[derive(Deserialize, Default)]
struct FileConfig {
    #[serde(default)]
    server: FileServer,
    #[serde(default)]
    logging: FileLogging,
    #[serde(default)]
    auth: FileAuth,
    #[serde(default)]
    chat: FileChat,
}

#[derive(Deserialize)]
struct FileServer {
    #[serde(default = "default_port")]
    port: u16,
}

#[derive(Deserialize)]
struct FileLogging {
    #[serde(default = "default_logging")]
    enabled: bool,
}

#[derive(Deserialize, Default)]
struct FileAuth {
    #[serde(default)]
    jwt_secret: Option<String>,
}

#[derive(Deserialize)]
struct FileChat {
    #[serde(default = "default_require_tenancy")]
    require_tenancy: bool,
    #[serde(default = "default_send_timeout_ms")]
    send_timeout_ms: u64,
    #[serde(default = "default_outbox_capacity")]
    outbox_capacity: usize,
}

fn default_port() -> u16 {
    8787
}

fn default_logging() -> bool {
    true
}

fn default_require_tenancy() -> bool {
    true
}

fn default_send_timeout_ms() -> u64 {
    5000
}

fn default_outbox_capacity() -> usize {
    64
}

impl Default for FileServer {
    fn default() -> Self {
        Self {
            port: default_port(),
        }
    }
}

impl Default for FileLogging {
    fn default() -> Self {
        Self {
            enabled: default_logging(),
        }
    }
}

impl Default for FileChat {
    fn default() -> Self {
        Self {
            require_tenancy: default_require_tenancy(),
            send_timeout_ms: default_send_timeout_ms(),
            outbox_capacity: default_outbox_capacity(),
        }
    }
}

impl Config {
    /// Resolve configuration from CLI, environment variables, config file and defaults.
    pub fn load(cli: &Cli) -> Result<Self> {
        // config file path precedence: CLI -> ENV -> default
        let config_path = cli
            .config
            .clone()
            .or_else(|| std::env::var("HOUSE_CHAT_CONFIG").ok().map(PathBuf::from))
            .unwrap_or_else(|| PathBuf::from("config/house_chat.toml"));

        let file_cfg = match fs::read(&config_path) {
            Ok(bytes) => {
                let contents = String::from_utf8_lossy(&bytes);
                toml::from_str::<FileConfig>(&contents).context("invalid config file")?
            }
            Err(_) => FileConfig::default(),
        };
        let mut port = file_cfg.server.port;
        let mut logging = file_cfg.logging.enabled;
        let mut secret = file_cfg.auth.jwt_secret;

        // environment overrides
        if let Ok(p) = std::env::var("HOUSE_CHAT_PORT") {
            if let Ok(p) = p.parse::<u16>() {
                port = p;
            }
        }
        if let Ok(l) = std::env::var("HOUSE_CHAT_LOGGING") {
            if let Ok(l) = l.parse::<bool>() {
                logging = l;
            }
        }
        if let Ok(s) = std::env::var("HOUSE_CHAT_JWT_SECRET") {
            secret = Some(s);
        }

        // CLI overrides
        if let Some(p) = cli.port {
            port = p;
        }
        if let Some(l) = cli.logging {
            logging = l;
        }

        if !(1024..=65535).contains(&port) {
            anyhow::bail!("invalid_port");
        }

        let secret =
            secret.context("missing jwt secret (auth.jwt_secret or HOUSE_CHAT_JWT_SECRET)")?;
        let secret = STANDARD
            .decode(secret.trim())
            .context("jwt secret is not valid base64")?;
        if secret.is_empty() {
            anyhow::bail!("empty jwt secret");
        }

        let bind = if let Some(b) = &cli.bind {
            b.clone()
        } else if let Ok(b) = std::env::var("BIND") {
            b
        } else {
            format!("127.0.0.1:{}", port)
        };

        let data_dir = std::env::var("DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| default_data_dir());

        Ok(Self {
            bind,
            data_dir,
            logging_enabled: logging,
            jwt_secret: JwtSecret(secret),
            chat: ChatSettings {
                require_tenancy: file_cfg.chat.require_tenancy,
                send_timeout: Duration::from_millis(file_cfg.chat.send_timeout_ms),
                outbox_capacity: file_cfg.chat.outbox_capacity,
            },
        })
    }

    /// Location of the SQLite message database.
    pub fn database_path(&self) -> PathBuf {
        self.data_dir.join("chat.db")
    }
}

/// Determine the default data directory for the hub.
pub fn default_data_dir() -> PathBuf {
    if let Ok(home) = std::env::var("HOME") {
        let mut p = PathBuf::from(home);
        p.push(".local/share/house_chat");
        p
    } else {
        PathBuf::from("./house_chat_data")
    }
}
