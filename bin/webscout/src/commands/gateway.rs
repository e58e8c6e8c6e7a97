use anyhow::Context;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{info, warn};
use webscout_agent::{MissionAgent, MissionSettings};
use webscout_core::Config;
use webscout_gateway::{router, serve, GatewayState, RateLimiter};
use webscout_providers::create_provider;

use super::Toolkit;

async fn shutdown_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("Shutdown signal received"),
        Err(e) => warn!(error = %e, "Failed to listen for ctrl-c"),
    }
}

pub async fn run(mut config: Config, host: Option<String>, port: Option<u16>) -> anyhow::Result<()> {
    if let Some(host) = host {
        config.gateway.host = host;
    }
    if let Some(port) = port {
        config.gateway.port = port;
    }
    config.validate_for_gateway()?;

    let provider = create_provider(&config)?;
    let toolkit = Toolkit::build(&config, true).await?;
    let agent = MissionAgent::new(
        provider,
        toolkit.registry.clone(),
        MissionSettings::from(&config.agents),
    );

    let gw = &config.gateway;
    let state = GatewayState {
        runner: Arc::new(agent),
        limiter: Arc::new(RateLimiter::new(gw.rate_limit_rpm)),
        api_keys: Arc::new(gw.api_keys.clone()),
        browser: toolkit.browser.clone(),
        request_timeout: config.agents.request_timeout(),
        max_prompt_chars: gw.max_prompt_chars,
    };
    let app = router(state, &gw.cors_origins);

    let addr = format!("{}:{}", gw.host, gw.port);
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {}", addr))?;
    info!(
        addr = %addr,
        model = %config.agents.model,
        rpm = gw.rate_limit_rpm,
        browser = toolkit.browser.is_some(),
        "Starting gateway"
    );

    let served = serve(listener, app, shutdown_signal()).await;
    toolkit.shutdown().await;
    info!("Gateway stopped");
    served.context("gateway server error")
}
