use futures::StreamExt;
use std::io::Write;
use webscout_agent::{MissionAgent, MissionRunner, MissionSettings};
use webscout_core::Config;
use webscout_gateway::relay;
use webscout_providers::create_provider;

use super::Toolkit;

/// Run a single mission locally and print each frame as it arrives.
pub async fn run(config: Config, prompt: &str, with_browser: bool) -> anyhow::Result<()> {
    let provider = create_provider(&config)?;
    let toolkit = Toolkit::build(&config, with_browser).await?;
    let agent = MissionAgent::new(
        provider,
        toolkit.registry.clone(),
        MissionSettings::from(&config.agents),
    );

    let mut frames = Box::pin(relay(agent.start(prompt.to_string()), config.agents.request_timeout()));
    let mut stdout = std::io::stdout();
    while let Some(event) = frames.next().await {
        writeln!(stdout, "data: {}\n", serde_json::to_string(&event)?)?;
        stdout.flush()?;
    }

    toolkit.shutdown().await;
    Ok(())
}
