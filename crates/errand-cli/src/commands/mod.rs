use anyhow::{Context, Result};
use errand::configuration::Settings;

use crate::ConfigArgs;

pub mod run;
pub mod tools;
pub mod version;

/// Load settings and apply the command line overrides on top
pub fn load_settings(args: &ConfigArgs) -> Result<Settings> {
    let mut settings =
        Settings::load(args.config.as_deref()).context("Failed to load configuration")?;
    if let Some(root) = &args.root {
        settings.filesystem_root = Some(root.clone());
    }
    Ok(settings)
}

/// Resolves on ctrl-c; never resolves if the signal cannot be watched
pub async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::warn!(error = %e, "unable to listen for ctrl-c");
        std::future::pending::<()>().await;
    }
}
