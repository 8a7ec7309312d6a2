//! Multi-tunnel command driven by declarative config

use crate::config::{self, Resolved, TunnelEntry};
use crate::tunnel::client::{TunnelClient, TunnelSpec};
use crate::tunnel::router::PathRouter;
use anyhow::{bail, Context, Result};
use console::style;
use std::path::PathBuf;

/// Start every tunnel declared in config.
pub async fn run(config_path: Option<PathBuf>) -> Result<()> {
    let file = match &config_path {
        Some(path) => config::load_single(path)?,
        None => config::load_layered()?,
    };

    if file.tunnels.is_empty() {
        bail!(
            "No tunnels configured. Add a `tunnels:` section to {} or pass --config.",
            config_path
                .as_ref()
                .map(|p| p.display().to_string())
                .unwrap_or_else(|| "./burrow.yml".to_string())
        );
    }

    let resolved = Resolved::new(&file, None, None);

    cliclack::intro(style(" burrow ").on_cyan().black().to_string())?;
    cliclack::log::info(format!(
        "Starting {} tunnel(s) against {}",
        file.tunnels.len(),
        style(&resolved.server_url).cyan()
    ))?;

    let specs = file
        .tunnels
        .iter()
        .map(build_spec)
        .collect::<Result<Vec<_>>>()?;

    let client = TunnelClient::new(resolved.websocket_url(), resolved.api_key.clone(), specs);
    let result = client.run().await;
    if let Err(e) = &result {
        cliclack::outro_cancel(format!("Tunnel error: {:#}", e))?;
    }
    result
}

fn build_spec(entry: &TunnelEntry) -> Result<TunnelSpec> {
    let default_host = entry.host.clone().unwrap_or_else(|| "localhost".to_string());
    let mut router = PathRouter::new(default_host.clone(), entry.port);
    for route in &entry.routes {
        let host = route.host.clone().unwrap_or_else(|| default_host.clone());
        router
            .add(&route.path, host, route.port)
            .with_context(|| format!("Invalid route pattern '{}'", route.path))?;
    }
    Ok(TunnelSpec {
        subdomain: entry.subdomain.clone(),
        basic_auth: entry.auth.clone(),
        router,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RouteEntry;

    #[test]
    fn test_build_spec_routes_in_order() {
        let entry = TunnelEntry {
            subdomain: Some("demo".to_string()),
            auth: None,
            host: None,
            port: 3000,
            routes: vec![
                RouteEntry {
                    path: "/api/*".to_string(),
                    host: None,
                    port: 4000,
                },
                RouteEntry {
                    path: "/*".to_string(),
                    host: Some("other-host".to_string()),
                    port: 5000,
                },
            ],
        };
        let spec = build_spec(&entry).unwrap();
        assert_eq!(spec.router.target("/api/x"), ("localhost", 4000));
        assert_eq!(spec.router.target("/page"), ("other-host", 5000));
    }

    #[test]
    fn test_build_spec_rejects_bad_pattern() {
        let entry = TunnelEntry {
            subdomain: None,
            auth: None,
            host: None,
            port: 3000,
            routes: vec![RouteEntry {
                path: "/[unclosed".to_string(),
                host: None,
                port: 4000,
            }],
        };
        assert!(build_spec(&entry).is_err());
    }
}
