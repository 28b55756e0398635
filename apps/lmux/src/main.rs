use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing::info;

use lmux_core::Config;

mod commands;
mod router;
mod usage_sink;

#[derive(Parser)]
#[command(name = "lmux", version, about = "Multi-account AI request gateway")]
struct Cli {
    /// YAML config file; defaults apply when absent.
    #[arg(long, env = "LMUX_CONFIG")]
    config: Option<PathBuf>,
    #[arg(long)]
    host: Option<String>,
    #[arg(long)]
    port: Option<u16>,
    #[arg(long)]
    auth_dir: Option<String>,
    #[arg(long)]
    debug: bool,
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Start the gateway (default).
    Serve,
    /// Run an OAuth handshake and store the resulting credential.
    Login {
        provider: String,
        /// Optional label for the new auth file.
        #[arg(long)]
        label: Option<String>,
    },
    /// Read a credential JSON from stdin and store it as an auth file.
    Import {
        provider: String,
        #[arg(long)]
        label: Option<String>,
    },
    /// Print the resolved configuration and environment overrides.
    Env,
    /// Print the version.
    Version,
}

fn load_config(cli: &Cli) -> anyhow::Result<Config> {
    let mut config = Config::load(cli.config.as_deref()).context("loading configuration")?;
    // Flags are the top of the override chain.
    if let Some(host) = &cli.host {
        config.host = host.clone();
    }
    if let Some(port) = cli.port {
        config.port = port;
    }
    if let Some(auth_dir) = &cli.auth_dir {
        config.auth_dir = auth_dir.clone();
    }
    if cli.debug {
        config.debug = true;
    }
    Ok(config)
}

fn init_tracing(debug: bool) {
    use tracing_subscriber::EnvFilter;
    let default = if debug { "lmux=debug,info" } else { "info" };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = load_config(&cli)?;
    init_tracing(config.debug);

    match cli.command.unwrap_or(Command::Serve) {
        Command::Serve => serve(config).await,
        Command::Login { provider, label } => commands::login(&config, &provider, label).await,
        Command::Import { provider, label } => commands::import(&config, &provider, label).await,
        Command::Env => {
            commands::print_env(&config);
            Ok(())
        }
        Command::Version => {
            println!("lmux {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
    }
}

async fn serve(config: Config) -> anyhow::Result<()> {
    let bind = format!("{}:{}", config.host, config.port);
    let usage = config.usage.clone();
    let state = lmux_core::bootstrap::bootstrap(config).await?;
    if usage.enabled {
        let path = usage
            .database_path
            .unwrap_or_else(|| "lmux-usage.jsonl".to_string());
        state
            .events
            .add_sink(std::sync::Arc::new(usage_sink::JsonlUsageSink::new(path)))
            .await;
    }
    let app = router::router(state);

    let listener = tokio::net::TcpListener::bind(&bind)
        .await
        .with_context(|| format!("binding {bind}"))?;
    info!(%bind, "gateway listening");
    axum::serve(listener, app).await?;
    Ok(())
}
