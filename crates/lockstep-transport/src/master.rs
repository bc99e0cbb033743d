//! Master role: accept loop, per-peer session tasks, batch fan-out and
//! position broadcast.
//!
//! # Lifecycle
//!
//! ```text
//! 1. MasterServer::bind(config, observer, clock)
//!       ├─ accept loop: each connection → registry + peer task
//!       └─ liveness monitor: probe every peer each probe interval
//! 2. server.send_batch(files)          ← once enough peers have joined
//!       └─ each peer task: transfer → wait for batch gate → schedule
//! 3. server.broadcast_position(sample) ← every position interval
//! 4. server.shutdown()
//! ```
//!
//! All traffic to one peer is written by that peer's task, in the order its
//! commands were queued.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use lockstep_core::{Clock, ConnectedPeer, LockstepError, PeerId, PositionSample, SessionConfig, SessionObserver, VideoFile};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::batch::{BatchGate, BatchTicket};
use crate::codec::WireStream;
use crate::position;
use crate::registry::{spawn_liveness_monitor, ConnectionRegistry, TcpProbe};
use crate::sync::ScheduleSender;
use crate::transfer::{FileSender, TransferSession};

const ACCEPT_BACKOFF: Duration = Duration::from_millis(250);

/// Work queued for one peer's session task.
#[derive(Debug)]
pub enum PeerCommand {
    Transfer(BatchTicket),
    Position(PositionSample),
}

// ── Shared context ────────────────────────────────────────────────────────────

struct MasterContext {
    config: SessionConfig,
    registry: ConnectionRegistry,
    observer: Arc<dyn SessionObserver>,
    clock: Arc<dyn Clock>,
}

impl MasterContext {
    fn admit(self: &Arc<Self>, id: PeerId, stream: TcpStream, addr: SocketAddr) -> Result<(), LockstepError> {
        stream.set_nodelay(true)?;
        let std_stream = stream.into_std()?;
        let control = std_stream.try_clone()?;
        let stream = TcpStream::from_std(std_stream)?;

        let (tx, rx) = mpsc::channel(self.config.command_queue);
        let peer = ConnectedPeer::new(id, addr);
        if !self.registry.insert(peer.clone(), Arc::new(TcpProbe::new(control)), tx) {
            return Ok(());
        }
        let ctx = Arc::clone(self);
        let task = tokio::spawn(ctx.run_peer(peer, stream, rx));
        self.registry.attach_task(id, task.abort_handle());
        Ok(())
    }

    async fn run_peer(self: Arc<Self>, peer: ConnectedPeer, stream: TcpStream, mut commands: mpsc::Receiver<PeerCommand>) {
        let mut wire = WireStream::new(stream).with_read_timeout(self.config.retry.read_timeout());
        while let Some(command) = commands.recv().await {
            self.registry.set_busy(peer.id, true);
            let result = match command {
                PeerCommand::Transfer(ticket) => self.run_batch(&peer, &mut wire, ticket).await,
                PeerCommand::Position(sample) => position::write_sample(&mut wire, &sample)
                    .await
                    .map_err(LockstepError::from),
            };
            self.registry.set_busy(peer.id, false);
            if let Err(e) = result {
                warn!("[Master] Session with {} ({}) ended: {}", peer.id, peer.host, e);
                self.observer
                    .on_error(&format!("{} ({}): {e}", peer.id, peer.host), e.is_recoverable());
                break;
            }
        }
        // Pending tickets in the queue resolve as failures when dropped.
        drop(commands);
        self.registry.remove(peer.id);
    }

    async fn run_batch(
        &self,
        peer: &ConnectedPeer,
        wire: &mut WireStream<TcpStream>,
        mut ticket: BatchTicket,
    ) -> Result<(), LockstepError> {
        let gate = Arc::clone(ticket.gate());
        let session = TransferSession::new(peer.id, Arc::clone(gate.files()));
        FileSender::new(wire, session, self.config.chunk_size, self.observer.as_ref())
            .run()
            .await?;
        ticket.finished();

        let Some(schedule) = gate.wait_schedule().await else {
            return Ok(());
        };
        let acknowledged = ScheduleSender::new(wire, &schedule, self.observer.as_ref())
            .run()
            .await?;
        if acknowledged {
            debug!("[Master] {} acknowledged batch {}", peer.id, gate.id());
        }
        ticket.acknowledged(acknowledged);
        Ok(())
    }
}

async fn accept_loop(listener: TcpListener, ctx: Arc<MasterContext>) {
    let mut next_id: u64 = 1;
    loop {
        match listener.accept().await {
            Ok((stream, addr)) => {
                let id = PeerId(next_id);
                next_id += 1;
                if let Err(e) = ctx.admit(id, stream, addr) {
                    warn!("[Master] Failed to admit {}: {}", addr, e);
                    ctx.observer.on_error(&format!("admitting {addr}: {e}"), true);
                }
            }
            Err(e) => {
                warn!("[Master] Accept failed: {}", e);
                ctx.observer.on_error(&format!("accept failed: {e}"), true);
                tokio::time::sleep(ACCEPT_BACKOFF).await;
            }
        }
    }
}

// ── MasterServer ──────────────────────────────────────────────────────────────

pub struct MasterServer {
    ctx: Arc<MasterContext>,
    local_addr: SocketAddr,
    accept_task: JoinHandle<()>,
    monitor_task: JoinHandle<()>,
}

impl MasterServer {
    /// Listen on all interfaces at `config.port`.
    pub async fn bind(
        config: SessionConfig,
        observer: Arc<dyn SessionObserver>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, LockstepError> {
        config.validate()?;
        let listener = TcpListener::bind(("0.0.0.0", config.port)).await?;
        Self::from_listener(listener, config, observer, clock)
    }

    /// Serve on an already-bound listener.
    pub fn from_listener(
        listener: TcpListener,
        config: SessionConfig,
        observer: Arc<dyn SessionObserver>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, LockstepError> {
        config.validate()?;
        let local_addr = listener.local_addr()?;
        let probe_interval = config.probe_interval();
        let registry = ConnectionRegistry::new(Arc::clone(&observer));
        let ctx = Arc::new(MasterContext {
            config,
            registry: registry.clone(),
            observer,
            clock,
        });

        let accept_task = tokio::spawn(accept_loop(listener, Arc::clone(&ctx)));
        let monitor_task = spawn_liveness_monitor(registry, probe_interval);
        info!("[Master] Listening on {}", local_addr);
        Ok(Self {
            ctx,
            local_addr,
            accept_task,
            monitor_task,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn registry(&self) -> &ConnectionRegistry {
        &self.ctx.registry
    }

    /// Wait until at least `count` peers are connected.
    pub async fn wait_for_peers(&self, count: usize) {
        let mut live = self.ctx.registry.subscribe();
        let _ = live.wait_for(|n| *n >= count).await;
    }

    /// Send `files` to every connected peer.
    ///
    /// Returns `None`, with no traffic, when there are no files or no peers.
    pub fn send_batch(&self, files: Vec<VideoFile>) -> Option<Arc<BatchGate>> {
        if files.is_empty() {
            info!("[Master] Empty batch, nothing to send");
            return None;
        }
        let senders = self.ctx.registry.senders();
        if senders.is_empty() {
            info!("[Master] No connected peers, batch not sent");
            return None;
        }

        let gate = BatchGate::new(
            files.into(),
            senders.iter().map(|(id, _)| *id),
            self.ctx.config.lead_time_ms,
            Arc::clone(&self.ctx.clock),
            Arc::clone(&self.ctx.observer),
        );
        info!(
            "[Master] Batch {}: {} file(s) to {} peer(s)",
            gate.id(),
            gate.files().len(),
            senders.len()
        );
        for (id, tx) in senders {
            // A rejected command drops its ticket, which fails the peer.
            if let Err(e) = tx.try_send(PeerCommand::Transfer(gate.ticket(id))) {
                warn!("[Master] Could not queue batch for {}: {}", id, e);
            }
        }
        Some(gate)
    }

    /// Queue `sample` for every peer. Returns how many queues accepted it;
    /// a full queue drops the sample for that peer.
    pub fn broadcast_position(&self, sample: &PositionSample) -> usize {
        let mut queued = 0;
        for (id, tx) in self.ctx.registry.senders() {
            match tx.try_send(PeerCommand::Position(sample.clone())) {
                Ok(()) => queued += 1,
                Err(TrySendError::Full(_)) => debug!("[Master] {} busy, dropping position sample", id),
                Err(TrySendError::Closed(_)) => {}
            }
        }
        queued
    }

    /// Stop accepting and close every connection. Idempotent.
    pub fn shutdown(&self) {
        self.accept_task.abort();
        self.monitor_task.abort();
        self.ctx.registry.close_all();
    }
}

impl Drop for MasterServer {
    fn drop(&mut self) {
        self.shutdown();
    }
}
