use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use anyhow::Result;
use membal::{AllocationPolicy, DomainId, DomainStore, Hypervisor, MemoryBalancer};
use tokio_util::sync::CancellationToken;

use crate::server::BalanceGate;

/// Keeps the balancer's domain registry in sync with the hypervisor and feeds
/// it the memory reports published by in-guest agents.
pub struct DomainWatcher<H, S, P> {
    hypervisor: H,
    store: S,
    balancer: Arc<MemoryBalancer<H, S, P>>,
    gate: BalanceGate,
    /// Last report forwarded per domain.
    reports: Mutex<HashMap<DomainId, String>>,
}

impl<H, S, P> DomainWatcher<H, S, P>
where
    H: Hypervisor + 'static,
    S: DomainStore + 'static,
    P: AllocationPolicy + 'static,
{
    pub fn new(
        hypervisor: H,
        store: S,
        balancer: Arc<MemoryBalancer<H, S, P>>,
        gate: BalanceGate,
    ) -> Self {
        Self {
            hypervisor,
            store,
            balancer,
            gate,
            reports: Mutex::default(),
        }
    }

    pub async fn run(self: Arc<Self>, poll_interval: Duration, cancellation_token: CancellationToken) {
        loop {
            tokio::select! {
                _ = cancellation_token.cancelled() => {
                    tracing::info!("domain watcher shutdown requested");
                    break;
                }
                _ = async {
                    // Admission requests hold the gate while a domain starts
                    let hold = self.gate.lock().await;
                    let watcher = self.clone();
                    match tokio::task::spawn_blocking(move || watcher.poll_once()).await {
                        Ok(Ok(())) => {}
                        Ok(Err(e)) => tracing::warn!("Failed to poll domains: {e:#}"),
                        Err(e) => tracing::error!("Domain poll task failed: {e}"),
                    }
                    drop(hold);

                    tokio::time::sleep(poll_interval).await;
                } => {}
            }
        }
    }

    /// One synchronous scan: registration changes first, then reports.
    pub fn poll_once(&self) -> Result<()> {
        let listed: BTreeSet<DomainId> = self
            .hypervisor
            .list_domains()
            .map_err(|e| anyhow::anyhow!("{e:?}"))?
            .into_iter()
            .map(|info| info.id)
            .collect();
        let registered: BTreeSet<DomainId> =
            self.balancer.registered_domains().into_iter().collect();

        let mut reports = self.reports.lock().unwrap_or_else(PoisonError::into_inner);
        for id in registered.difference(&listed) {
            tracing::info!(domain = %id, "domain gone");
            self.balancer.unregister_domain(*id);
            reports.remove(id);
        }
        for id in listed.difference(&registered) {
            tracing::info!(domain = %id, "domain appeared");
            self.balancer.register_domain(*id);
        }

        for id in &listed {
            let report = match self.store.read_meminfo(*id) {
                Ok(Some(report)) => report,
                Ok(None) => continue,
                Err(e) => {
                    tracing::debug!(domain = %id, "reading memory report failed: {e:?}");
                    continue;
                }
            };
            if reports.get(id) == Some(&report) {
                continue;
            }

            match self.balancer.on_pressure_report(*id, &report) {
                Ok(outcome) => tracing::debug!(domain = %id, %outcome, "memory report handled"),
                Err(e) => tracing::warn!(domain = %id, "rebalance after report failed: {e:?}"),
            }
            reports.insert(*id, report);
        }
        Ok(())
    }
}
