//! postino command line: serve the dispatch instance or fire one-shot
//! control commands at the local database. The CLI adds no semantics of
//! its own; everything funnels into the command dispatcher.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use postino::{MailProxy, ProxyConfig};
use tokio_util::sync::CancellationToken;
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "postino", version)]
#[command(about = "Multi-tenant outbound mail dispatch service")]
struct Cli {
    /// SQLite database path
    #[arg(long, global = true, env = "POSTINO_DB", default_value = "/data/postino.db")]
    db: String,

    /// Global API token for the control surface
    #[arg(long, global = true, env = "POSTINO_API_TOKEN")]
    api_token: Option<String>,

    /// Address the HTTP control surface binds to
    #[arg(long, global = true, env = "POSTINO_BIND", default_value = "127.0.0.1:8025")]
    bind: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the dispatch service: scheduler, reporter, IMAP pollers, HTTP.
    Serve,
    /// Execute one control command against the database and print the
    /// JSON result. The command name matches the API (e.g. addTenant,
    /// listMessages, "run now").
    Cmd {
        /// Command name from the registry
        name: String,
        /// JSON payload (defaults to {})
        #[arg(long, default_value = "{}")]
        json: String,
    },
    /// List the available command names.
    Commands,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let runtime = tokio::runtime::Runtime::new().context("failed to start runtime")?;
    runtime.block_on(run(cli))
}

async fn run(cli: Cli) -> Result<()> {
    let config = ProxyConfig {
        db_path: cli.db.clone(),
        bind: cli.bind.clone(),
        api_token: cli.api_token.clone(),
        ..ProxyConfig::default()
    }
    .apply_env();

    match cli.command {
        Command::Serve => serve(config).await,
        Command::Cmd { name, json } => {
            let payload: serde_json::Value =
                serde_json::from_str(&json).context("payload is not valid JSON")?;
            let proxy = MailProxy::open(config).await?;
            let result = proxy.handle_command(&name, payload).await;
            println!("{}", serde_json::to_string_pretty(&result)?);
            let ok = result.get("ok").and_then(|v| v.as_bool()).unwrap_or(false);
            if !ok {
                std::process::exit(1);
            }
            Ok(())
        }
        Command::Commands => {
            for descriptor in postino::commands::COMMANDS {
                println!("{:<24} /commands/{}", descriptor.name, descriptor.route);
            }
            Ok(())
        }
    }
}

async fn serve(config: ProxyConfig) -> Result<()> {
    let bind = config.bind.clone();
    let proxy = MailProxy::start(config).await?;

    let cancel = CancellationToken::new();
    let http = {
        let cancel = cancel.clone();
        let server = postino::http::serve(&proxy, &bind, cancel);
        server
    };

    tokio::select! {
        result = http => result?,
        _ = tokio::signal::ctrl_c() => {
            info!("shutdown signal received");
            cancel.cancel();
        }
    }

    proxy.stop().await;
    info!("stopped");
    Ok(())
}
