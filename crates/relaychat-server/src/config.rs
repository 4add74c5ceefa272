//! Server configuration: TOML file + CLI overrides.

use relaychat_core::{ChatError, ChatResult};
use serde::Deserialize;
use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};

/// Top-level config file structure.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub auth: AuthSection,
}

/// `[server]` section of the config TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerSection {
    #[serde(default = "default_bind")]
    pub bind: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_send_timeout_ms")]
    pub send_timeout_ms: u64,
    #[serde(default = "default_outbound_queue")]
    pub outbound_queue: usize,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            port: default_port(),
            send_timeout_ms: default_send_timeout_ms(),
            outbound_queue: default_outbound_queue(),
        }
    }
}

/// Which identity verifier backs token logins.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VerifierKind {
    /// HTTPS token-introspection endpoint.
    Tokeninfo,
    /// Fixed token table from `[auth.static_tokens]`.
    Static,
}

/// `[auth]` section of the config TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct AuthSection {
    #[serde(default = "default_true")]
    pub allow_bootstrap: bool,
    #[serde(default = "default_bootstrap_identity")]
    pub bootstrap_identity: String,
    #[serde(default = "default_login_timeout_secs")]
    pub login_timeout_secs: u64,
    #[serde(default = "default_verifier")]
    pub verifier: VerifierKind,
    #[serde(default = "default_tokeninfo_url")]
    pub tokeninfo_url: String,
    #[serde(default = "default_identity_field")]
    pub identity_field: String,
    #[serde(default = "default_verify_timeout_secs")]
    pub verify_timeout_secs: u64,
    #[serde(default)]
    pub expected_audience: Option<String>,
    #[serde(default)]
    pub static_tokens: HashMap<String, String>,
}

impl Default for AuthSection {
    fn default() -> Self {
        Self {
            allow_bootstrap: true,
            bootstrap_identity: default_bootstrap_identity(),
            login_timeout_secs: default_login_timeout_secs(),
            verifier: default_verifier(),
            tokeninfo_url: default_tokeninfo_url(),
            identity_field: default_identity_field(),
            verify_timeout_secs: default_verify_timeout_secs(),
            expected_audience: None,
            static_tokens: HashMap::new(),
        }
    }
}

fn default_bind() -> String {
    "0.0.0.0".to_string()
}
fn default_port() -> u16 {
    8000
}
fn default_send_timeout_ms() -> u64 {
    5000
}
fn default_outbound_queue() -> usize {
    64
}
fn default_bootstrap_identity() -> String {
    "first_user".to_string()
}
fn default_login_timeout_secs() -> u64 {
    300
}
fn default_verifier() -> VerifierKind {
    VerifierKind::Tokeninfo
}
fn default_tokeninfo_url() -> String {
    "https://www.googleapis.com/oauth2/v3/tokeninfo".to_string()
}
fn default_identity_field() -> String {
    "email".to_string()
}
fn default_verify_timeout_secs() -> u64 {
    10
}
fn default_true() -> bool {
    true
}

/// Resolved authentication settings.
#[derive(Debug, Clone)]
pub struct AuthConfig {
    /// Trust the first connection ever admitted without a token.
    pub allow_bootstrap: bool,
    /// Identity granted to the bootstrap session.
    pub bootstrap_identity: String,
    /// How long a pending session may take to present its token.
    pub login_timeout: Option<Duration>,
    pub verifier: VerifierKind,
    pub tokeninfo_url: String,
    pub identity_field: String,
    pub verify_timeout: Duration,
    pub expected_audience: Option<String>,
    pub static_tokens: HashMap<String, String>,
}

/// Resolved server configuration (paths expanded, CLI overrides applied).
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind: IpAddr,
    pub port: u16,
    /// Upper bound on one enqueue to a recipient during broadcast.
    pub send_timeout: Duration,
    /// Capacity of each session's outbound queue.
    pub outbound_queue: usize,
    pub auth: AuthConfig,
}

impl From<AuthSection> for AuthConfig {
    fn from(section: AuthSection) -> Self {
        let login_timeout = match section.login_timeout_secs {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        };
        Self {
            allow_bootstrap: section.allow_bootstrap,
            bootstrap_identity: section.bootstrap_identity,
            login_timeout,
            verifier: section.verifier,
            tokeninfo_url: section.tokeninfo_url,
            identity_field: section.identity_field,
            verify_timeout: Duration::from_secs(section.verify_timeout_secs),
            expected_audience: section.expected_audience,
            static_tokens: section.static_tokens,
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: default_port(),
            send_timeout: Duration::from_millis(default_send_timeout_ms()),
            outbound_queue: default_outbound_queue(),
            auth: AuthSection::default().into(),
        }
    }
}

impl ServerConfig {
    /// Load config from TOML file, then apply CLI overrides.
    pub fn load(
        config_path: Option<&Path>,
        cli_port: Option<u16>,
        cli_bind: Option<&str>,
        cli_disable_bootstrap: bool,
        cli_client_id: Option<String>,
    ) -> ChatResult<Self> {
        let mut file_config = match config_path {
            Some(path) => {
                let expanded = expand_tilde(path);
                if expanded.exists() {
                    info!(path = %expanded.display(), "loading config file");
                    let content = std::fs::read_to_string(&expanded)?;
                    toml::from_str::<ConfigFile>(&content)
                        .map_err(|e| ChatError::Config(format!("config parse error: {e}")))?
                } else {
                    info!(path = %expanded.display(), "config file not found, using defaults");
                    ConfigFile::default()
                }
            }
            None => ConfigFile::default(),
        };

        // Merge CLI overrides
        if let Some(port) = cli_port {
            file_config.server.port = port;
        }
        if let Some(bind) = cli_bind {
            file_config.server.bind = bind.to_string();
        }
        if cli_disable_bootstrap {
            file_config.auth.allow_bootstrap = false;
        }
        if cli_client_id.is_some() {
            file_config.auth.expected_audience = cli_client_id;
        }

        Self::resolve(file_config)
    }

    /// Validate a parsed config file and convert it to runtime settings.
    pub fn resolve(file: ConfigFile) -> ChatResult<Self> {
        let bind: IpAddr = file
            .server
            .bind
            .parse()
            .map_err(|e| {
                ChatError::Config(format!(
                    "invalid bind address {:?}: {e}",
                    file.server.bind
                ))
            })?;

        if file.server.outbound_queue == 0 {
            return Err(ChatError::Config("server.outbound_queue must be at least 1".into()));
        }
        if file.server.send_timeout_ms == 0 {
            return Err(ChatError::Config("server.send_timeout_ms must be positive".into()));
        }
        if file.auth.bootstrap_identity.trim().is_empty() {
            return Err(ChatError::Config("auth.bootstrap_identity must not be empty".into()));
        }
        if file.auth.verifier == VerifierKind::Static && file.auth.static_tokens.is_empty() {
            warn!("static verifier configured with no tokens, every login will fail");
        }

        Ok(Self {
            bind,
            port: file.server.port,
            send_timeout: Duration::from_millis(file.server.send_timeout_ms),
            outbound_queue: file.server.outbound_queue,
            auth: file.auth.into(),
        })
    }

    /// Socket address the listener binds to.
    pub fn listen_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind, self.port)
    }
}

/// Expand `~` to the user's home directory.
fn expand_tilde(path: &Path) -> PathBuf {
    let s = path.to_string_lossy();
    expand_tilde_str(&s)
}

fn expand_tilde_str(s: &str) -> PathBuf {
    if let Some(rest) = s.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(s)
}
