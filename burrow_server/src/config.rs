//! Server configuration from flags and environment variables
//!
//! Every option has an environment fallback; a flag on the command line
//! always wins over the environment.

use clap::Parser;
use std::time::Duration;

#[derive(Parser, Debug, Clone)]
#[command(name = "burrow-server", version)]
#[command(about = "Public tunnel server for Burrow", long_about = None)]
pub struct Config {
    /// Host to bind to
    #[arg(long, env = "BURROW_HOST", default_value = "0.0.0.0")]
    pub host: String,

    /// Public port for HTTP and control-plane traffic
    #[arg(long, env = "BURROW_PORT", default_value_t = 8080)]
    pub port: u16,

    /// Base domain for subdomain routing (e.g. "burrow.example")
    #[arg(long, env = "BURROW_DOMAIN", default_value = "localhost")]
    pub domain: String,

    /// Require clients to authenticate before opening tunnels
    #[arg(long, env = "BURROW_AUTH_REQUIRED")]
    pub auth_required: bool,

    /// Master API key checked in constant time. With auth required but no
    /// master key configured, any non-empty key is accepted (self-hosted
    /// mode).
    #[arg(long, env = "BURROW_MASTER_KEY")]
    pub master_key: Option<String>,

    /// Advertise https:// public URLs (TLS terminated by an upstream proxy)
    #[arg(long, env = "BURROW_HTTPS")]
    pub https: bool,

    /// Disable all rate limiting
    #[arg(long, env = "BURROW_NO_RATE_LIMITS")]
    pub no_rate_limits: bool,

    /// Seconds an in-flight proxied request may take before a 504
    #[arg(long, env = "BURROW_REQUEST_TIMEOUT", default_value_t = burrow_common::constants::DEFAULT_REQUEST_TIMEOUT_SECS)]
    pub request_timeout_secs: u64,

    /// Extra reserved subdomains, comma separated
    #[arg(long, env = "BURROW_RESERVED", value_delimiter = ',')]
    pub reserved: Vec<String>,
}

impl Config {
    pub fn scheme(&self) -> &'static str {
        if self.https {
            "https"
        } else {
            "http"
        }
    }

    /// Public URL for a subdomain, with the port elided on the scheme's
    /// default. When advertising https the upstream proxy owns 443.
    pub fn public_url(&self, subdomain: &str) -> String {
        if self.https || self.port == 80 {
            format!("{}://{}.{}", self.scheme(), subdomain, self.domain)
        } else {
            format!(
                "{}://{}.{}:{}",
                self.scheme(),
                subdomain,
                self.domain,
                self.port
            )
        }
    }

    pub fn rate_limits_enabled(&self) -> bool {
        !self.no_rate_limits
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_config() -> Config {
        Config::parse_from(["burrow-server"])
    }

    #[test]
    fn test_public_url_elides_default_ports() {
        let mut config = base_config();
        config.domain = "burrow.example".to_string();

        config.port = 8080;
        assert_eq!(
            config.public_url("demo"),
            "http://demo.burrow.example:8080"
        );

        config.port = 80;
        assert_eq!(config.public_url("demo"), "http://demo.burrow.example");

        config.https = true;
        config.port = 8080;
        assert_eq!(config.public_url("demo"), "https://demo.burrow.example");
    }

    #[test]
    fn test_flag_beats_env_default() {
        let config = Config::parse_from(["burrow-server", "--port", "9999", "--auth-required"]);
        assert_eq!(config.port, 9999);
        assert!(config.auth_required);
        assert!(config.rate_limits_enabled());
    }
}
