//! Flow server command (`treq serve`).

use anyhow::Result;
use std::path::Path;
use std::sync::Arc;

use treq::config::TreqToml;
use treq::runner::ProcessBackend;
use treq::server::start_server;

pub async fn cmd_serve(
    project_dir: &Path,
    host: Option<String>,
    port: Option<u16>,
    dev: bool,
) -> Result<()> {
    let (mut toml, source) = TreqToml::discover(project_dir)?;
    match &source {
        Some(path) => tracing::info!(path = %path.display(), "loaded configuration"),
        None => tracing::debug!("no treq.toml found, using defaults"),
    }

    let mut warnings = toml.apply_env();
    warnings.extend(toml.validate());
    for warning in warnings {
        tracing::warn!("{}", warning);
    }

    if let Some(host) = host {
        toml.server.host = host;
    }
    if let Some(port) = port {
        toml.server.port = port;
    }
    toml.server.dev_mode |= dev;

    let backend = ProcessBackend::new(toml.runner_detector()).with_working_dir(project_dir);
    start_server(toml.server_config(), Arc::new(backend)).await
}
