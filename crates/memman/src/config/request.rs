use std::path::PathBuf;

use clap::Parser;

use crate::config::daemon::DEFAULT_SOCKET_PATH;

#[derive(Parser, Clone, Debug)]
pub struct RequestArgs {
    /// Bytes of free hypervisor memory needed
    pub amount: u64,

    #[arg(
        long,
        env = "MEMMAN_SOCKET_PATH",
        default_value = DEFAULT_SOCKET_PATH,
        value_hint = clap::ValueHint::FilePath,
        help = "Request socket of the running daemon"
    )]
    pub socket_path: PathBuf,

    /// Command to run while the freed memory is reserved, e.g. a domain start
    #[arg(last = true)]
    pub command: Vec<String>,
}
