mod app;
mod config;
mod marker;
mod server;
mod watcher;
mod xen;

use anyhow::{bail, Context, Result};
use clap::Parser;
use utils::version;

use crate::app::Application;
use crate::config::{Cli, Commands, DaemonArgs, RequestArgs};

/// Sets up global panic hooks.
fn setup_global_hooks() {
    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |panic_info| {
        default_hook(panic_info);
        tracing::error!("Thread panicked: {}", panic_info);
    }));
}

#[tokio::main]
async fn main() -> Result<()> {
    setup_global_hooks();

    let cli = Cli::parse();

    match cli.command {
        Commands::Daemon(daemon_args) => run_daemon(*daemon_args).await,
        Commands::Request(request_args) => run_request(request_args).await,
    }
}

async fn run_daemon(daemon_args: DaemonArgs) -> Result<()> {
    let _guard = utils::logging::init(daemon_args.log_path.as_deref())?;

    tracing::info!("Starting memman daemon {}", &**version::VERSION);

    let app = Application::build(daemon_args)?;
    app.run().await
}

async fn run_request(request_args: RequestArgs) -> Result<()> {
    let _guard = utils::logging::init(None)?;
    let amount = request_args.amount;

    let Some(reservation) = server::request_memory(&request_args.socket_path, amount).await?
    else {
        bail!("daemon could not free {amount} bytes");
    };
    tracing::info!(amount, "memory reserved");

    let Some((program, args)) = request_args.command.split_first() else {
        return Ok(());
    };
    let status = tokio::process::Command::new(program)
        .args(args)
        .status()
        .await
        .with_context(|| format!("failed to run {program}"))?;
    drop(reservation);

    if !status.success() {
        bail!("{program} exited with {status}");
    }
    Ok(())
}
