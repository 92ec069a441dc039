use anyhow::Result;
use console::style;

use errand::runner::{RunCancelled, Runner};

use super::{load_settings, shutdown_signal};
use crate::render::abbreviate;
use crate::ConfigArgs;

pub async fn execute(config: ConfigArgs) -> Result<()> {
    let settings = load_settings(&config)?;
    let runner = Runner::from_servers(settings.mcp_servers());

    let tools = match runner.list_tools_until(shutdown_signal()).await {
        Ok(tools) => tools,
        Err(e) if e.downcast_ref::<RunCancelled>().is_some() => {
            println!("{}", style("Interrupted, all servers were shut down.").yellow());
            return Err(e);
        }
        Err(e) => return Err(e),
    };
    if tools.is_empty() {
        println!("{}", style("No tools available").yellow());
        return Ok(());
    }

    for tool in tools {
        println!(
            "{}  {}",
            style(&tool.name).cyan().bold(),
            style(abbreviate(&tool.description, 100)).dim()
        );
    }
    Ok(())
}
