//! Unix socket server reserving memory for starting domains.
//!
//! Protocol: the client sends a decimal byte count terminated by a newline
//! and gets `OK` or `FAIL` back. After `OK` the balance gate stays locked
//! until the client closes the connection, so the freed memory is not handed
//! out again by a rebalance before the new domain claims it.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use membal::{AllocationPolicy, DomainStore, Hypervisor, MemoryBalancer};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

/// Serializes everything that triggers a balancing cycle.
pub type BalanceGate = Arc<Mutex<()>>;

const REPLY_OK: &[u8] = b"OK\n";
const REPLY_FAIL: &[u8] = b"FAIL\n";
/// Longest request line accepted from a client.
const MAX_REQUEST_LEN: u64 = 64;

/// Source of free memory for new domains.
pub trait MemoryRequests: Send + Sync + 'static {
    /// Blocks until `amount` bytes are free or the attempt is given up.
    fn request_free_memory(&self, amount: u64) -> bool;
}

impl<H, S, P> MemoryRequests for MemoryBalancer<H, S, P>
where
    H: Hypervisor + 'static,
    S: DomainStore + 'static,
    P: AllocationPolicy + 'static,
{
    fn request_free_memory(&self, amount: u64) -> bool {
        MemoryBalancer::request_free_memory(self, amount)
    }
}

pub struct RequestServer<R> {
    requests: Arc<R>,
    gate: BalanceGate,
    socket_path: PathBuf,
}

impl<R: MemoryRequests> RequestServer<R> {
    pub fn new(requests: Arc<R>, gate: BalanceGate, socket_path: impl Into<PathBuf>) -> Self {
        Self {
            requests,
            gate,
            socket_path: socket_path.into(),
        }
    }

    pub async fn run(self: Arc<Self>, cancellation_token: CancellationToken) -> Result<()> {
        // clean up a socket left over by a previous instance
        if self.socket_path.exists() {
            std::fs::remove_file(&self.socket_path).with_context(|| {
                format!("failed to remove stale socket {}", self.socket_path.display())
            })?;
        }
        let listener = UnixListener::bind(&self.socket_path)
            .with_context(|| format!("failed to bind {}", self.socket_path.display()))?;
        tracing::info!("request server listening on {}", self.socket_path.display());

        loop {
            tokio::select! {
                _ = cancellation_token.cancelled() => {
                    tracing::info!("request server shutdown requested");
                    break;
                }
                accepted = listener.accept() => match accepted {
                    Ok((stream, _)) => {
                        let server = self.clone();
                        let token = cancellation_token.clone();
                        tokio::spawn(async move {
                            if let Err(e) = server.handle_client(stream, token).await {
                                tracing::warn!("memory request failed: {e:#}");
                            }
                        });
                    }
                    Err(e) => tracing::warn!("failed to accept request connection: {e}"),
                }
            }
        }

        if let Err(e) = std::fs::remove_file(&self.socket_path) {
            tracing::debug!("failed to remove socket on shutdown: {e}");
        }
        Ok(())
    }

    async fn handle_client(
        &self,
        stream: UnixStream,
        cancellation_token: CancellationToken,
    ) -> Result<()> {
        let (reader, mut writer) = stream.into_split();
        let mut request = BufReader::new(reader).take(MAX_REQUEST_LEN);
        let mut line = String::new();
        request
            .read_line(&mut line)
            .await
            .context("failed to read request")?;
        let mut reader = request.into_inner();

        let Ok(amount) = line.trim().parse::<u64>() else {
            writer.write_all(REPLY_FAIL).await?;
            bail!("malformed request {line:?}");
        };

        let hold = self.gate.clone().lock_owned().await;
        tracing::info!(amount, "memory request");
        let requests = self.requests.clone();
        let granted = tokio::task::spawn_blocking(move || requests.request_free_memory(amount))
            .await
            .context("memory request task panicked")?;

        if !granted {
            drop(hold);
            tracing::warn!(amount, "memory request could not be satisfied");
            writer.write_all(REPLY_FAIL).await?;
            return Ok(());
        }
        writer.write_all(REPLY_OK).await?;

        // Anything the client sends from here on is ignored.
        let mut buf = [0u8; 64];
        tokio::select! {
            _ = async {
                while matches!(reader.read(&mut buf).await, Ok(n) if n > 0) {}
            } => {}
            _ = cancellation_token.cancelled() => {}
        }
        drop(hold);
        tracing::debug!(amount, "memory request released");
        Ok(())
    }
}

/// Asks the daemon at `socket_path` for `amount` free bytes.
///
/// Returns the open connection when the memory was granted; the reservation
/// lasts until it is dropped. `None` means the daemon refused.
pub async fn request_memory(socket_path: &Path, amount: u64) -> Result<Option<UnixStream>> {
    let mut stream = UnixStream::connect(socket_path)
        .await
        .with_context(|| format!("failed to connect to {}", socket_path.display()))?;
    stream.write_all(format!("{amount}\n").as_bytes()).await?;

    let mut reply = Vec::new();
    loop {
        let mut byte = [0u8; 1];
        if stream.read(&mut byte).await? == 0 || byte[0] == b'\n' {
            break;
        }
        reply.push(byte[0]);
    }

    match reply.as_slice() {
        b"OK" => Ok(Some(stream)),
        b"FAIL" => Ok(None),
        other => bail!(
            "unexpected reply from daemon: {:?}",
            String::from_utf8_lossy(other)
        ),
    }
}
