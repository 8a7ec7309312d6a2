//! Single HTTP tunnel command

use crate::config::{self, Resolved};
use crate::inspector::{self, InspectorStore};
use crate::tunnel::client::{TunnelClient, TunnelSpec};
use crate::tunnel::router::PathRouter;
use anyhow::Result;
use console::style;
use std::sync::Arc;

const DEFAULT_INSPECTOR_PORT: u16 = 4040;

/// HTTP tunnel options
#[derive(Debug, Clone)]
pub struct HttpOptions {
    pub port: u16,
    pub subdomain: Option<String>,
    pub auth: Option<String>,
    pub host: String,
    pub server: Option<String>,
    pub api_key: Option<String>,
    pub inspector_port: Option<u16>,
    pub no_inspector: bool,
    pub open: bool,
}

/// Expose one local port through a tunnel.
pub async fn run(opts: HttpOptions) -> Result<()> {
    let file = config::load_layered()?;
    let resolved = Resolved::new(&file, opts.server.clone(), opts.api_key.clone());

    cliclack::intro(style(" burrow ").on_cyan().black().to_string())?;

    let spec = TunnelSpec {
        subdomain: opts.subdomain.clone(),
        basic_auth: opts.auth.clone(),
        router: PathRouter::new(opts.host.clone(), opts.port),
    };

    let mut client = TunnelClient::new(
        resolved.websocket_url(),
        resolved.api_key.clone(),
        vec![spec],
    );
    client.set_open_browser(opts.open);

    // Inspector is best-effort: a busy port downgrades to a warning
    let mut inspector_handle = None;
    if !opts.no_inspector {
        let port = opts.inspector_port.unwrap_or(DEFAULT_INSPECTOR_PORT);
        let store = Arc::new(InspectorStore::new());
        match inspector::serve(port, store.clone()).await {
            Ok(handle) => {
                client.set_inspector(store);
                inspector_handle = Some(handle);
                cliclack::log::info(format!(
                    "Inspector: {}",
                    style(format!("http://127.0.0.1:{}", port)).cyan()
                ))?;
            }
            Err(e) => {
                cliclack::log::warning(format!("Inspector disabled: {}", e))?;
            }
        }
    }

    let result = client.run().await;
    if let Some(handle) = inspector_handle {
        handle.abort();
    }

    if let Err(e) = &result {
        cliclack::outro_cancel(format!("Tunnel error: {:#}", e))?;
    }
    result
}
