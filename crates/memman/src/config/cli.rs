use clap::{Parser, Subcommand};
use utils::version;

use crate::config::daemon::DaemonArgs;
use crate::config::request::RequestArgs;

#[derive(Parser)]
#[command(about, long_about, version = &**version::VERSION)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the memory balancing daemon
    Daemon(Box<DaemonArgs>),
    /// Ask a running daemon to free memory for a new domain
    Request(RequestArgs),
}
