use std::sync::Arc;

use anyhow::{Context, Result};
use membal::{MemoryBalancer, ProportionalPolicy, SystemState};

use crate::app::tasks::Tasks;
use crate::config::DaemonArgs;
use crate::marker::MarkerFile;
use crate::server::{BalanceGate, RequestServer};
use crate::watcher::DomainWatcher;
use crate::xen::{XenStore, XlHypervisor};

pub type Balancer = MemoryBalancer<Arc<XlHypervisor>, Arc<XenStore>, ProportionalPolicy>;
pub type Watcher = DomainWatcher<Arc<XlHypervisor>, Arc<XenStore>, ProportionalPolicy>;

/// Application core structure with explicit dependencies
pub struct Application {
    watcher: Arc<Watcher>,
    server: Arc<RequestServer<Balancer>>,
    daemon_args: DaemonArgs,
}

impl Application {
    /// Wire the Xen backend, the balancer and its event sources together
    pub fn build(daemon_args: DaemonArgs) -> Result<Self> {
        let cfg = daemon_args.balancer_config()?;
        tracing::info!(?cfg, "balancer configuration");

        let hypervisor = Arc::new(XlHypervisor::new(&daemon_args.xl_binary));
        let store = Arc::new(XenStore::default());
        let state = SystemState::new(
            hypervisor.clone(),
            store.clone(),
            ProportionalPolicy::default(),
            cfg,
        )
        .map_err(|e| anyhow::anyhow!("{e:?}"))
        .context("failed to initialize memory balancer")?
        .with_suppression(MarkerFile::new(&daemon_args.suppress_marker));

        let balancer = Arc::new(MemoryBalancer::new(state));
        let gate = BalanceGate::default();
        let watcher = Arc::new(DomainWatcher::new(
            hypervisor,
            store,
            balancer.clone(),
            gate.clone(),
        ));
        let server = Arc::new(RequestServer::new(
            balancer,
            gate,
            &daemon_args.socket_path,
        ));

        Ok(Self {
            watcher,
            server,
            daemon_args,
        })
    }

    pub fn watcher(&self) -> &Arc<Watcher> {
        &self.watcher
    }

    pub fn server(&self) -> &Arc<RequestServer<Balancer>> {
        &self.server
    }

    /// Get daemon arguments
    pub fn daemon_args(&self) -> &DaemonArgs {
        &self.daemon_args
    }

    /// Run application, start all tasks and wait for completion
    pub async fn run(&self) -> Result<()> {
        tracing::info!("Starting all application tasks...");

        let mut tasks = Tasks::new();
        tasks.spawn_all_tasks(self);

        // Wait for tasks to complete or receive shutdown signal
        if let Err(e) = tasks.wait_for_completion().await {
            tracing::error!("Error during task execution: {}", e);
            return Err(e);
        }

        tracing::info!("Application run completed");
        Ok(())
    }
}
