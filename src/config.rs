//! Layered startup configuration: built-in defaults, an optional persisted
//! `config.toml` under the state directory, environment variables, then CLI
//! flags, each layer overriding the previous one.

use std::net::{IpAddr, Ipv4Addr};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

pub const DEFAULT_BIND_ADDRESS: IpAddr = IpAddr::V4(Ipv4Addr::new(0, 0, 0, 0));
pub const DEFAULT_PORT: u16 = 6339;

const PORT_POOL_START: u16 = 20000;
const PORT_POOL_END: u16 = 29999;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub bind_address: IpAddr,
    pub port: u16,

    /// Root of all persisted state: `repos/`, `worktrees/`, `state/`.
    pub state_dir: PathBuf,
    /// Directory containing bare repo mirrors.
    pub repos_dir: PathBuf,
    /// Directory containing worktree checkouts.
    pub worktrees_dir: PathBuf,
    /// Directory containing per-session JSON summaries, port allocations, logs.
    pub live_dir: PathBuf,

    pub bearer_token: Option<String>,

    pub port_pool_start: u16,
    pub port_pool_end: u16,
}

impl Default for Config {
    fn default() -> Self {
        let state_dir = dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".catnip");

        Config {
            bind_address: DEFAULT_BIND_ADDRESS,
            port: DEFAULT_PORT,
            repos_dir: state_dir.join("repos"),
            worktrees_dir: state_dir.join("worktrees"),
            live_dir: state_dir.join("state"),
            state_dir,
            bearer_token: None,
            port_pool_start: PORT_POOL_START,
            port_pool_end: PORT_POOL_END,
        }
    }
}

impl Config {
    /// Resolves configuration from (in increasing precedence): defaults, a
    /// persisted `config.toml`, environment variables, then explicit CLI
    /// overrides.
    pub fn resolve(cli_address: Option<IpAddr>, cli_port: Option<u16>) -> anyhow::Result<Config> {
        let mut config = Config::default();

        if let Ok(home) = std::env::var("CATNIP_HOME_DIR") {
            config.state_dir = PathBuf::from(home);
            config.repos_dir = config.state_dir.join("repos");
            config.worktrees_dir = config.state_dir.join("worktrees");
            config.live_dir = config.state_dir.join("state");
        }
        if let Ok(volume) = std::env::var("CATNIP_VOLUME_DIR") {
            config.repos_dir = PathBuf::from(volume).join("repos");
        }
        if let Ok(ws) = std::env::var("CATNIP_WORKSPACE_DIR") {
            config.worktrees_dir = PathBuf::from(ws);
        }
        if let Ok(live) = std::env::var("CATNIP_LIVE_DIR") {
            config.live_dir = PathBuf::from(live);
        }

        let persisted_path = config.live_dir.join("config.toml");
        if let Ok(contents) = fs_err::read_to_string(&persisted_path) {
            match toml::from_str::<PersistedConfig>(&contents) {
                Ok(persisted) => persisted.apply(&mut config),
                Err(err) => {
                    tracing::warn!(path = %persisted_path.display(), %err, "ignoring unreadable config.toml");
                }
            }
        }

        if let Ok(port) = std::env::var("PORT") {
            if let Ok(port) = port.parse() {
                config.port = port;
            }
        }
        if let Ok(token) = std::env::var("CATNIP_BEARER_TOKEN") {
            if !token.is_empty() {
                config.bearer_token = Some(token);
            }
        }

        if let Some(address) = cli_address {
            config.bind_address = address;
        }
        if let Some(port) = cli_port {
            config.port = port;
        }

        Ok(config)
    }

    pub fn bare_repo_path(&self, repo_id: &str) -> PathBuf {
        self.repos_dir.join(format!("{repo_id}.git"))
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.live_dir.join("logs")
    }

    pub fn ensure_dirs(&self) -> std::io::Result<()> {
        for dir in [&self.repos_dir, &self.worktrees_dir, &self.live_dir] {
            fs_err::create_dir_all(dir)?;
        }
        Ok(())
    }
}

/// Subset of [`Config`] that may be persisted to `state/config.toml`. Only
/// fields a user would reasonably hand-edit are included; directory layout is
/// always derived from environment/CLI at startup.
#[derive(Debug, Default, Deserialize)]
struct PersistedConfig {
    bind_address: Option<IpAddr>,
    port: Option<u16>,
    bearer_token: Option<String>,
    port_pool_start: Option<u16>,
    port_pool_end: Option<u16>,
}

impl PersistedConfig {
    fn apply(self, config: &mut Config) {
        if let Some(address) = self.bind_address {
            config.bind_address = address;
        }
        if let Some(port) = self.port {
            config.port = port;
        }
        if let Some(token) = self.bearer_token {
            config.bearer_token = Some(token);
        }
        if let Some(start) = self.port_pool_start {
            config.port_pool_start = start;
        }
        if let Some(end) = self.port_pool_end {
            config.port_pool_end = end;
        }
    }
}

pub fn resolve_path(path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()
            .unwrap_or_else(|_| PathBuf::from("."))
            .join(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_uses_catnip_home() {
        let config = Config::default();
        assert!(config.state_dir.ends_with(".catnip"));
        assert_eq!(config.port, DEFAULT_PORT);
    }

    #[test]
    fn bare_repo_path_appends_git_suffix() {
        let config = Config::default();
        let path = config.bare_repo_path("acme/demo");
        assert!(path.to_string_lossy().ends_with("acme/demo.git"));
    }
}
