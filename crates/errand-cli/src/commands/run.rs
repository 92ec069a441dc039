use anyhow::{Context, Result};
use console::style;
use std::path::PathBuf;
use std::sync::Arc;

use errand::providers::factory;
use errand::runner::{RunCancelled, Runner};

use super::{load_settings, shutdown_signal};
use crate::render;
use crate::ConfigArgs;

pub async fn execute(
    task: String,
    config: ConfigArgs,
    max_steps: Option<usize>,
    save_history: Option<PathBuf>,
) -> Result<()> {
    let mut settings = load_settings(&config)?;
    if let Some(max_steps) = max_steps {
        settings.agent.max_steps = max_steps;
    }

    // Credentials are checked before any server is spawned
    let model = settings.provider.model().to_string();
    let provider = factory::get_provider(settings.provider.clone().into_config()?)?;
    let servers = settings.mcp_servers();

    println!(
        "{} {} {}",
        style("errand").bold().green(),
        style(format!("model: {}", model)).dim(),
        style(format!(
            "servers: {}",
            servers
                .iter()
                .map(|s| s.name.as_str())
                .collect::<Vec<_>>()
                .join(", ")
        ))
        .dim()
    );

    let runner = Runner::from_servers(servers)
        .with_settings(settings.agent.clone())
        .with_observer(Arc::new(render::render_message));

    let result = runner.run_until(&task, provider, shutdown_signal()).await;
    let history = match result {
        Ok(history) => history,
        Err(e) if e.downcast_ref::<RunCancelled>().is_some() => {
            println!("{}", style("Interrupted, all servers were shut down.").yellow());
            return Err(e);
        }
        Err(e) => return Err(e),
    };

    if let Some(path) = save_history {
        history
            .save(&path)
            .with_context(|| format!("Failed to save history to {}", path.display()))?;
        println!("{}", style(format!("History saved to {}", path.display())).dim());
    }

    render::render_summary(&history);
    Ok(())
}
