//! CLI configuration: layered YAML files, environment, credentials
//!
//! Files merge in a fixed order - `~/.config/burrow/*.yml` (sorted), then
//! `~/.burrow.yml`, then `./burrow.yml` - with the environment overriding
//! files and command-line flags overriding everything. The resolved
//! configuration is immutable once a command starts.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;

pub const SERVER_ENV: &str = "BURROW_SERVER";
pub const API_KEY_ENV: &str = "BURROW_API_KEY";

const DEFAULT_SERVER_URL: &str = "http://localhost:8080";

/// Get the configuration directory path
pub fn config_dir() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("burrow")
}

/// Get the credentials file path
pub fn credentials_file() -> PathBuf {
    config_dir().join("credentials.yml")
}

/// One tunnel declared in config
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TunnelEntry {
    /// Requested subdomain; omit for a server-generated label
    pub subdomain: Option<String>,

    /// Basic auth (`user:pass`) required from public callers
    pub auth: Option<String>,

    /// Default upstream host
    pub host: Option<String>,

    /// Default upstream port
    pub port: u16,

    /// Path-glob routes consulted before the default target
    #[serde(default)]
    pub routes: Vec<RouteEntry>,
}

/// A path-pattern route to a local target
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteEntry {
    /// Shell-style glob matched against the request path
    pub path: String,

    pub host: Option<String>,

    pub port: u16,
}

/// On-disk configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FileConfig {
    /// Server URL (e.g. "https://burrow.example")
    pub server: Option<String>,

    /// API key for the control plane
    pub api_key: Option<String>,

    /// Tunnels started by `burrow start`
    #[serde(default)]
    pub tunnels: Vec<TunnelEntry>,
}

impl FileConfig {
    fn load_file(path: &PathBuf) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse config file {}", path.display()))
    }

    /// Later layers win for scalars; a non-empty tunnel list replaces the
    /// previous one wholesale.
    fn merge(mut self, overlay: FileConfig) -> Self {
        if overlay.server.is_some() {
            self.server = overlay.server;
        }
        if overlay.api_key.is_some() {
            self.api_key = overlay.api_key;
        }
        if !overlay.tunnels.is_empty() {
            self.tunnels = overlay.tunnels;
        }
        self
    }
}

/// The config files consulted, least-specific first.
fn layer_paths() -> Vec<PathBuf> {
    let mut paths = Vec::new();

    let dir = config_dir();
    if let Ok(entries) = fs::read_dir(&dir) {
        let mut named: Vec<PathBuf> = entries
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| {
                p.extension().map(|ext| ext == "yml").unwrap_or(false)
                    && p.file_name().map(|n| n != "credentials.yml").unwrap_or(false)
            })
            .collect();
        named.sort();
        paths.extend(named);
    }

    if let Some(home) = dirs::home_dir() {
        paths.push(home.join(".burrow.yml"));
    }
    paths.push(PathBuf::from("./burrow.yml"));
    paths
}

/// Load the layered file configuration, then apply the environment.
pub fn load_layered() -> Result<FileConfig> {
    let mut merged = FileConfig::default();
    for path in layer_paths() {
        if path.exists() {
            merged = merged.merge(FileConfig::load_file(&path)?);
        }
    }
    Ok(apply_env(merged))
}

/// Load one explicit config file (for `start --config`), then the
/// environment.
pub fn load_single(path: &PathBuf) -> Result<FileConfig> {
    Ok(apply_env(FileConfig::load_file(path)?))
}

fn apply_env(mut config: FileConfig) -> FileConfig {
    if let Ok(server) = std::env::var(SERVER_ENV) {
        if !server.is_empty() {
            config.server = Some(server);
        }
    }
    if let Ok(key) = std::env::var(API_KEY_ENV) {
        if !key.is_empty() {
            config.api_key = Some(key);
        }
    }
    config
}

/// Final settings a command runs with.
#[derive(Debug, Clone)]
pub struct Resolved {
    pub server_url: String,
    pub api_key: Option<String>,
}

impl Resolved {
    /// Combine file+env config, stored credentials, and flags. Flags win.
    pub fn new(
        file: &FileConfig,
        server_flag: Option<String>,
        api_key_flag: Option<String>,
    ) -> Self {
        let server_url = server_flag
            .or_else(|| file.server.clone())
            .unwrap_or_else(|| DEFAULT_SERVER_URL.to_string());
        let api_key = api_key_flag
            .or_else(|| file.api_key.clone())
            .or_else(|| Credentials::load().ok().flatten().map(|c| c.api_key));
        Self {
            server_url,
            api_key,
        }
    }

    /// Control-plane WebSocket URL derived from the server URL.
    pub fn websocket_url(&self) -> String {
        let ws_scheme = if self.server_url.starts_with("https://") {
            "wss"
        } else {
            "ws"
        };
        let host = self
            .server_url
            .trim_start_matches("https://")
            .trim_start_matches("http://")
            .trim_end_matches('/');
        format!(
            "{}://{}{}",
            ws_scheme,
            host,
            burrow_common::constants::CONTROL_PATH
        )
    }
}

/// Stored login credential
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Credentials {
    pub api_key: String,
}

impl Credentials {
    pub fn load() -> Result<Option<Self>> {
        let path = credentials_file();
        if !path.exists() {
            return Ok(None);
        }
        let content =
            fs::read_to_string(&path).context("Failed to read credentials file")?;
        let creds = serde_yaml::from_str(&content).context("Failed to parse credentials file")?;
        Ok(Some(creds))
    }

    /// Write the credential file, owner-readable only.
    pub fn save(&self) -> Result<()> {
        let dir = config_dir();
        fs::create_dir_all(&dir).context("Failed to create config directory")?;
        let path = credentials_file();
        let content = serde_yaml::to_string(self).context("Failed to serialize credentials")?;
        fs::write(&path, content).context("Failed to write credentials file")?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&path, fs::Permissions::from_mode(0o600))
                .context("Failed to restrict credentials file permissions")?;
        }

        Ok(())
    }

    pub fn delete() -> Result<bool> {
        let path = credentials_file();
        if path.exists() {
            fs::remove_file(&path).context("Failed to remove credentials file")?;
            Ok(true)
        } else {
            Ok(false)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_merge_scalars_later_wins() {
        let base = FileConfig {
            server: Some("http://a".to_string()),
            api_key: Some("key-a".to_string()),
            tunnels: vec![],
        };
        let overlay = FileConfig {
            server: Some("http://b".to_string()),
            api_key: None,
            tunnels: vec![],
        };
        let merged = base.merge(overlay);
        assert_eq!(merged.server.as_deref(), Some("http://b"));
        assert_eq!(merged.api_key.as_deref(), Some("key-a"));
    }

    #[test]
    fn test_merge_tunnels_replace_wholesale() {
        let base = FileConfig {
            tunnels: vec![TunnelEntry {
                subdomain: Some("old".to_string()),
                auth: None,
                host: None,
                port: 3000,
                routes: vec![],
            }],
            ..Default::default()
        };
        let overlay = FileConfig {
            tunnels: vec![TunnelEntry {
                subdomain: Some("new".to_string()),
                auth: None,
                host: None,
                port: 4000,
                routes: vec![],
            }],
            ..Default::default()
        };
        let merged = base.merge(overlay);
        assert_eq!(merged.tunnels.len(), 1);
        assert_eq!(merged.tunnels[0].subdomain.as_deref(), Some("new"));
    }

    #[test]
    fn test_flags_override_file() {
        let file = FileConfig {
            server: Some("http://file".to_string()),
            api_key: Some("file-key".to_string()),
            tunnels: vec![],
        };
        let resolved = Resolved::new(&file, Some("http://flag".to_string()), None);
        assert_eq!(resolved.server_url, "http://flag");
        assert_eq!(resolved.api_key.as_deref(), Some("file-key"));
    }

    #[test]
    fn test_websocket_url() {
        let resolved = Resolved {
            server_url: "https://burrow.example".to_string(),
            api_key: None,
        };
        assert_eq!(resolved.websocket_url(), "wss://burrow.example/ws");

        let resolved = Resolved {
            server_url: "http://localhost:8080/".to_string(),
            api_key: None,
        };
        assert_eq!(resolved.websocket_url(), "ws://localhost:8080/ws");
    }

    #[test]
    fn test_config_parses_routes() {
        let yaml = r#"
server: https://burrow.example
tunnels:
  - subdomain: demo
    port: 3000
    routes:
      - path: "/api/*"
        port: 4000
      - path: "/*"
        port: 3000
"#;
        let config: FileConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.tunnels.len(), 1);
        assert_eq!(config.tunnels[0].routes.len(), 2);
        assert_eq!(config.tunnels[0].routes[0].path, "/api/*");
    }
}
