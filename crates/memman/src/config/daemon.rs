use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use membal::{BalancerConfig, MIB};
use serde::Deserialize;

pub const DEFAULT_SOCKET_PATH: &str = "/var/run/qubes/qmemman.sock";

/// Contents of the optional YAML configuration file.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MemmanConfig {
    #[serde(default)]
    pub balancer: BalancerConfig,
}

impl MemmanConfig {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        serde_yaml::from_str(&content)
            .with_context(|| format!("failed to parse config file {}", path.display()))
    }
}

#[derive(Parser, Clone, Debug)]
pub struct DaemonArgs {
    #[arg(
        long,
        env = "MEMMAN_CONFIG",
        value_hint = clap::ValueHint::FilePath,
        help = "YAML file with balancer tunables, e.g. /etc/qubes/memman.yaml"
    )]
    pub config: Option<PathBuf>,

    #[arg(
        long,
        env = "MEMMAN_SOCKET_PATH",
        default_value = DEFAULT_SOCKET_PATH,
        value_hint = clap::ValueHint::FilePath,
        help = "Unix socket accepting memory requests for starting domains"
    )]
    pub socket_path: PathBuf,

    #[arg(
        long,
        env = "MEMMAN_SUPPRESS_MARKER",
        default_value = "/var/run/qubes/do-not-membalance",
        value_hint = clap::ValueHint::FilePath,
        help = "Balancing is paused while this file exists"
    )]
    pub suppress_marker: PathBuf,

    #[arg(
        long,
        env = "MEMMAN_POLL_INTERVAL_MS",
        default_value = "1000",
        help = "Interval between domain list and memory report scans"
    )]
    pub poll_interval_ms: u64,

    #[arg(
        long,
        env = "MEMMAN_LOG_PATH",
        value_hint = clap::ValueHint::FilePath,
        help = "Write logs to a daily rotated file instead of stderr"
    )]
    pub log_path: Option<PathBuf>,

    #[arg(long, env = "MEMMAN_XL", default_value = "xl", help = "xl binary")]
    pub xl_binary: PathBuf,

    #[arg(
        long,
        env = "MEMMAN_BALLOON_DELAY_MS",
        help = "Delay given to balloon drivers after a new target"
    )]
    pub balloon_delay_ms: Option<u64>,

    #[arg(
        long,
        env = "MEMMAN_BALLOON_MAX_TRIES",
        help = "Iteration cap of a memory request"
    )]
    pub balloon_max_tries: Option<u32>,

    #[arg(
        long,
        env = "MEMMAN_BALANCE_RETRIES",
        help = "Delays to wait for donors before a rebalance is aborted"
    )]
    pub balance_retries: Option<u32>,

    #[arg(
        long,
        env = "MEMMAN_FREE_MEM_LEFT",
        help = "Free hypervisor memory kept as safety margin (MiB)"
    )]
    pub free_mem_left: Option<u64>,

    #[arg(
        long,
        env = "MEMMAN_FREE_MEM_MIN",
        help = "Extra free memory a request must leave (MiB)"
    )]
    pub free_mem_min: Option<u64>,
}

impl DaemonArgs {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    /// Balancer tunables from the config file, overridden by flags, validated.
    pub fn balancer_config(&self) -> anyhow::Result<BalancerConfig> {
        let mut cfg = match &self.config {
            Some(path) => MemmanConfig::load(path)?.balancer,
            None => BalancerConfig::default(),
        };

        if let Some(ms) = self.balloon_delay_ms {
            cfg.balloon_delay = Duration::from_millis(ms);
        }
        if let Some(tries) = self.balloon_max_tries {
            cfg.balloon_max_tries = tries;
        }
        if let Some(retries) = self.balance_retries {
            cfg.balance_retries = retries;
        }
        if let Some(mib) = self.free_mem_left {
            cfg.free_mem_left = mib_to_bytes(mib).context("--free-mem-left is too large")?;
        }
        if let Some(mib) = self.free_mem_min {
            cfg.free_mem_min = mib_to_bytes(mib).context("--free-mem-min is too large")?;
        }

        cfg.validate()
            .map_err(|e| anyhow::anyhow!("{e:?}"))
            .context("invalid balancer configuration")?;
        Ok(cfg)
    }
}

fn mib_to_bytes(mib: u64) -> Option<u64> {
    mib.checked_mul(MIB)
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use similar_asserts::assert_eq;

    use super::*;
    use crate::config::{Cli, Commands};

    fn daemon_args(args: &[&str]) -> DaemonArgs {
        let cli = Cli::try_parse_from(["memman", "daemon"].into_iter().chain(args.iter().copied())).unwrap();
        match cli.command {
            Commands::Daemon(args) => *args,
            Commands::Request(_) => panic!("expected daemon command"),
        }
    }

    #[test]
    fn defaults_match_balancer_defaults() {
        let args = daemon_args(&[]);
        assert_eq!(args.balancer_config().unwrap(), BalancerConfig::default());
        assert_eq!(args.socket_path, PathBuf::from(DEFAULT_SOCKET_PATH));
        assert_eq!(args.poll_interval(), Duration::from_secs(1));
    }

    #[test]
    fn flags_override_file_values() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "balancer:\n  balloonDelay: 250\n  freeMemLeft: 104857600\n  balloonMaxTries: 7"
        )
        .unwrap();

        let path = file.path().to_str().unwrap();
        let args = daemon_args(&["--config", path, "--free-mem-left", "80"]);
        let cfg = args.balancer_config().unwrap();

        assert_eq!(cfg.balloon_delay, Duration::from_millis(250));
        assert_eq!(cfg.balloon_max_tries, 7);
        assert_eq!(cfg.free_mem_left, 80 * MIB);
        assert_eq!(cfg.free_mem_min, BalancerConfig::default().free_mem_min);
    }

    #[test]
    fn inconsistent_margins_are_rejected() {
        let args = daemon_args(&["--free-mem-left", "10", "--free-mem-min", "20"]);
        assert!(args.balancer_config().is_err());
    }

    #[test]
    fn oversized_margins_are_rejected() {
        let huge = u64::MAX.to_string();
        let err = daemon_args(&["--free-mem-left", &huge])
            .balancer_config()
            .unwrap_err();
        assert!(format!("{err:#}").contains("--free-mem-left"));

        let err = daemon_args(&["--free-mem-min", &huge])
            .balancer_config()
            .unwrap_err();
        assert!(format!("{err:#}").contains("--free-mem-min"));
    }

    #[test]
    fn missing_config_file_is_reported() {
        let args = daemon_args(&["--config", "/nonexistent/memman.yaml"]);
        let err = args.balancer_config().unwrap_err();
        assert!(format!("{err:#}").contains("/nonexistent/memman.yaml"));
    }

    #[test]
    fn request_takes_trailing_command() {
        let cli =
            Cli::try_parse_from(["memman", "request", "1048576", "--", "xl", "create", "vm.cfg"])
                .unwrap();
        let Commands::Request(args) = cli.command else {
            panic!("expected request command");
        };
        assert_eq!(args.amount, 1048576);
        assert_eq!(args.command, vec!["xl", "create", "vm.cfg"]);
    }
}
