mod commands;

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser)]
#[command(name = "webscout")]
#[command(about = "Web research agent with a streaming HTTP gateway", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    log_json: bool,

    /// Config file (defaults to ~/.webscout/config.json)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the HTTP gateway
    Gateway {
        /// Port to listen on (overrides config gateway.port)
        #[arg(short, long)]
        port: Option<u16>,

        /// Host to bind to (overrides config gateway.host)
        #[arg(long)]
        host: Option<String>,
    },

    /// Run one mission and print its frames
    Agent {
        /// Prompt for the agent
        #[arg(short, long)]
        message: String,

        /// Also start the headless browser
        #[arg(long)]
        browser: bool,
    },

    /// Inspect and run tools directly
    Tools {
        #[command(subcommand)]
        command: ToolsCommands,
    },
}

#[derive(Subcommand)]
enum ToolsCommands {
    /// List the registered tools
    List,
    /// Run a tool with JSON parameters
    Run {
        /// Tool name
        tool_name: String,
        /// JSON parameters (e.g. '{"url":"https://example.com"}')
        params: String,
    },
}

fn init_tracing(verbose: bool, json: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!(
            "{},hyper=warn,hyper_util=warn,reqwest=warn,rustls=warn,tungstenite=warn,tokio_tungstenite=warn",
            default_level
        ))
    });

    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry.with(fmt::layer().json().with_current_span(true)).init();
    } else {
        registry.with(fmt::layer()).init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose, cli.log_json);

    let config = commands::load_config(cli.config.as_deref())?;

    match cli.command {
        Commands::Gateway { port, host } => {
            commands::gateway::run(config, host, port).await?;
        }
        Commands::Agent { message, browser } => {
            commands::agent::run(config, &message, browser).await?;
        }
        Commands::Tools { command } => match command {
            ToolsCommands::List => {
                commands::tools_cmd::list(&config).await?;
            }
            ToolsCommands::Run { tool_name, params } => {
                commands::tools_cmd::run(&config, &tool_name, &params).await?;
            }
        },
    }

    Ok(())
}
