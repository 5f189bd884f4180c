use serde::Deserialize;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Global configuration for the multiplexer
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    /// Public listener and admin API settings
    #[serde(default)]
    pub server: ServerConfig,

    /// Where the domain mapping lives and how it is watched
    #[serde(default)]
    pub mapping: MappingConfig,

    /// How backend processes are launched and restarted
    #[serde(default)]
    pub launcher: LauncherConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    /// Bind address for the public listener (default: 0.0.0.0)
    #[serde(default = "default_bind_address")]
    pub bind: String,

    /// Public HTTP port (default: $PORT, else 80)
    #[serde(default = "default_listen_port")]
    pub port: u16,

    /// Port for the loopback admin API (0 disables it)
    #[serde(default = "default_admin_port")]
    pub admin_port: u16,

    /// Authentication token for admin API write and listing operations.
    /// If not set, a random token is generated at startup and logged
    pub admin_token: Option<String>,

    /// Maximum idle connections per backend (default: 10)
    #[serde(default = "default_pool_max_idle_per_host")]
    pub pool_max_idle_per_host: usize,

    /// Idle connection timeout in seconds (default: 90)
    #[serde(default = "default_pool_idle_timeout")]
    pub pool_idle_timeout_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind_address(),
            port: default_listen_port(),
            admin_port: default_admin_port(),
            admin_token: None,
            pool_max_idle_per_host: default_pool_max_idle_per_host(),
            pool_idle_timeout_secs: default_pool_idle_timeout(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct MappingConfig {
    /// Path of the `domain,scriptPath` mapping file (default: ~/.hostmux)
    #[serde(default = "default_mapping_path")]
    pub path: PathBuf,

    /// Re-run reconciliation whenever the mapping file changes
    #[serde(default = "default_true")]
    pub watch: bool,

    /// Window in which bursts of file events collapse into one pass
    #[serde(default = "default_watch_debounce")]
    pub watch_debounce_ms: u64,

    /// Address the port allocator binds to when probing for a free port
    #[serde(default = "default_allocate_bind")]
    pub allocate_bind: IpAddr,
}

impl Default for MappingConfig {
    fn default() -> Self {
        Self {
            path: default_mapping_path(),
            watch: true,
            watch_debounce_ms: default_watch_debounce(),
            allocate_bind: default_allocate_bind(),
        }
    }
}

impl MappingConfig {
    pub fn watch_debounce(&self) -> Duration {
        Duration::from_millis(self.watch_debounce_ms)
    }

    /// Create an empty mapping file if none exists yet
    pub fn ensure_exists(&self) -> anyhow::Result<()> {
        if self.path.exists() {
            return Ok(());
        }
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        std::fs::write(&self.path, "").map_err(|e| {
            anyhow::anyhow!("Failed to create mapping file {}: {}", self.path.display(), e)
        })
    }
}

/// Launch settings shared by every backend
///
/// A mapping line `example.com,/srv/app/server.js` becomes
/// `<command> <args...> server.js` run from `/srv/app` with `<port_env>` set.
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct LauncherConfig {
    /// Executable used to run every script (default: node)
    #[serde(default = "default_launcher_command")]
    pub command: String,

    /// Arguments placed before the script name (default: ["--harmony"])
    #[serde(default = "default_launcher_args")]
    pub args: Vec<String>,

    /// Environment variable carrying the assigned port (default: PORT)
    #[serde(default = "default_port_env")]
    pub port_env: String,

    /// Fixed delay between a backend exit and its automatic restart
    #[serde(default = "default_restart_delay")]
    pub restart_delay_ms: u64,
}

impl Default for LauncherConfig {
    fn default() -> Self {
        Self {
            command: default_launcher_command(),
            args: default_launcher_args(),
            port_env: default_port_env(),
            restart_delay_ms: default_restart_delay(),
        }
    }
}

impl LauncherConfig {
    pub fn restart_delay(&self) -> Duration {
        Duration::from_millis(self.restart_delay_ms)
    }
}

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_listen_port() -> u16 {
    std::env::var("PORT")
        .ok()
        .and_then(|p| p.trim().parse().ok())
        .unwrap_or(80)
}

fn default_admin_port() -> u16 {
    9100
}

fn default_pool_max_idle_per_host() -> usize {
    10
}

fn default_pool_idle_timeout() -> u64 {
    90
}

fn default_mapping_path() -> PathBuf {
    dirs_next::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".hostmux")
}

fn default_true() -> bool {
    true
}

fn default_watch_debounce() -> u64 {
    250
}

fn default_allocate_bind() -> IpAddr {
    IpAddr::from([127, 0, 0, 1])
}

fn default_launcher_command() -> String {
    "node".to_string()
}

fn default_launcher_args() -> Vec<String> {
    vec!["--harmony".to_string()]
}

fn default_port_env() -> String {
    "PORT".to_string()
}

fn default_restart_delay() -> u64 {
    5000
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load the file if it exists, otherwise fall back to defaults
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        if path.as_ref().exists() {
            Self::load(path)
        } else {
            let config = Config::default();
            config.validate()?;
            Ok(config)
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.launcher.command.trim().is_empty() {
            anyhow::bail!("launcher.command must not be empty");
        }
        if self.launcher.port_env.trim().is_empty() {
            anyhow::bail!("launcher.port_env must not be empty");
        }
        if self.launcher.restart_delay_ms == 0 {
            anyhow::bail!("launcher.restart_delay_ms must be greater than zero");
        }
        if self.server.bind.parse::<IpAddr>().is_err() {
            anyhow::bail!("server.bind is not a valid IP address: {}", self.server.bind);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_config() {
        let toml = r#"
[server]
bind = "127.0.0.1"
port = 8080
admin_port = 9200
admin_token = "secret"

[mapping]
path = "/etc/hostmux/domains"
watch = false
watch_debounce_ms = 100

[launcher]
command = "deno"
args = ["run", "-A"]
port_env = "HTTP_PORT"
restart_delay_ms = 1000
"#;

        let config: Config = toml::from_str(toml).unwrap();
        config.validate().unwrap();

        assert_eq!(config.server.bind, "127.0.0.1");
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.server.admin_port, 9200);
        assert_eq!(config.server.admin_token, Some("secret".to_string()));
        assert_eq!(config.mapping.path, PathBuf::from("/etc/hostmux/domains"));
        assert!(!config.mapping.watch);
        assert_eq!(config.mapping.watch_debounce(), Duration::from_millis(100));
        assert_eq!(config.launcher.command, "deno");
        assert_eq!(config.launcher.args, vec!["run", "-A"]);
        assert_eq!(config.launcher.port_env, "HTTP_PORT");
        assert_eq!(config.launcher.restart_delay(), Duration::from_secs(1));
    }

    #[test]
    fn test_empty_config_uses_defaults() {
        let config: Config = toml::from_str("").unwrap();

        assert_eq!(config.server.bind, "0.0.0.0");
        assert_eq!(config.server.admin_port, 9100);
        assert_eq!(config.server.pool_max_idle_per_host, 10);
        assert!(config.mapping.watch);
        assert_eq!(config.mapping.allocate_bind, IpAddr::from([127, 0, 0, 1]));
        assert!(config.mapping.path.ends_with(".hostmux"));
        assert_eq!(config.launcher, LauncherConfig::default());
        assert_eq!(config.launcher.command, "node");
        assert_eq!(config.launcher.args, vec!["--harmony"]);
        assert_eq!(config.launcher.port_env, "PORT");
        assert_eq!(config.launcher.restart_delay(), Duration::from_millis(5000));
    }

    #[test]
    fn test_validate_rejects_zero_restart_delay() {
        let toml = r#"
[launcher]
restart_delay_ms = 0
"#;
        let config: Config = toml::from_str(toml).unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_bad_bind() {
        let toml = r#"
[server]
bind = "not-an-ip"
"#;
        let config: Config = toml::from_str(toml).unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_or_default_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::load_or_default(dir.path().join("absent.toml")).unwrap();
        assert_eq!(config.launcher.command, "node");
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hostmux.toml");
        std::fs::write(&path, "[server]\nport = 8181\n").unwrap();

        let config = Config::load(&path).unwrap();
        assert_eq!(config.server.port, 8181);
    }

    #[test]
    fn test_ensure_exists_creates_empty_mapping() {
        let dir = tempfile::tempdir().unwrap();
        let mapping = MappingConfig {
            path: dir.path().join("nested").join("domains"),
            ..MappingConfig::default()
        };

        mapping.ensure_exists().unwrap();
        assert_eq!(std::fs::read_to_string(&mapping.path).unwrap(), "");

        std::fs::write(&mapping.path, "a.test,/srv/a/app.js\n").unwrap();
        mapping.ensure_exists().unwrap();
        assert_eq!(
            std::fs::read_to_string(&mapping.path).unwrap(),
            "a.test,/srv/a/app.js\n"
        );
    }
}
