//! Master-side set of live peer connections.
//!
//! Every entry owns a control handle on the peer's socket (for liveness
//! probing and forced shutdown) and the sending half of the peer task's
//! command queue. Removing an entry closes the socket, aborts the task and
//! notifies the observer exactly once.
//!
//! Peers with a command in flight are not probed. An urgent byte sent while
//! the peer has unread backlog can end up inline in the stream, and the
//! command's own I/O already notices a dead connection.

use std::collections::BTreeMap;
use std::io;
use std::net::{Shutdown, TcpStream};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use lockstep_core::{ConnectedPeer, Liveness, LockstepError, PeerId, SessionObserver};
use socket2::SockRef;
use tokio::sync::{mpsc, watch};
use tokio::task::{AbortHandle, JoinHandle};
use tracing::{debug, info, warn};

use crate::master::PeerCommand;

/// Byte sent in TCP urgent mode. Receivers without OOB-inline discard it.
pub const URGENT_PROBE_BYTE: u8 = 0xFF;

pub trait LivenessProbe: Send + Sync {
    /// `Err` means the connection is unusable.
    fn probe(&self) -> io::Result<()>;

    fn shutdown(&self);
}

// ── TcpProbe ──────────────────────────────────────────────────────────────────

/// Probes a duplicate handle of the peer socket. The handle shares the
/// non-blocking flag with the tokio stream.
#[derive(Debug)]
pub struct TcpProbe {
    socket: TcpStream,
}

impl TcpProbe {
    pub fn new(socket: TcpStream) -> Self {
        Self { socket }
    }
}

impl LivenessProbe for TcpProbe {
    fn probe(&self) -> io::Result<()> {
        // An orderly close from the peer reads as zero bytes available.
        let mut peek = [0u8; 1];
        match self.socket.peek(&mut peek) {
            Ok(0) => {
                return Err(io::Error::new(
                    io::ErrorKind::ConnectionAborted,
                    "peer closed the connection",
                ))
            }
            Ok(_) => {}
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
            Err(e) => return Err(e),
        }
        match SockRef::from(&self.socket).send_out_of_band(&[URGENT_PROBE_BYTE]) {
            Ok(_) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(()),
            Err(e) => Err(e),
        }
    }

    fn shutdown(&self) {
        let _ = self.socket.shutdown(Shutdown::Both);
    }
}

// ── ConnectionRegistry ────────────────────────────────────────────────────────

struct PeerEntry {
    peer: ConnectedPeer,
    liveness: Liveness,
    probe: Arc<dyn LivenessProbe>,
    commands: mpsc::Sender<PeerCommand>,
    task: Option<AbortHandle>,
    busy: bool,
}

struct Inner {
    peers: Mutex<BTreeMap<PeerId, PeerEntry>>,
    live: watch::Sender<usize>,
    observer: Arc<dyn SessionObserver>,
}

#[derive(Clone)]
pub struct ConnectionRegistry {
    inner: Arc<Inner>,
}

impl ConnectionRegistry {
    pub fn new(observer: Arc<dyn SessionObserver>) -> Self {
        let (live, _) = watch::channel(0);
        Self {
            inner: Arc::new(Inner {
                peers: Mutex::new(BTreeMap::new()),
                live,
                observer,
            }),
        }
    }

    /// Add a peer. Rejects a second connection with the same id or remote
    /// address.
    pub fn insert(
        &self,
        peer: ConnectedPeer,
        probe: Arc<dyn LivenessProbe>,
        commands: mpsc::Sender<PeerCommand>,
    ) -> bool {
        let mut peers = self.lock();
        if peers.contains_key(&peer.id) || peers.values().any(|e| e.peer.addr == peer.addr) {
            warn!("[Registry] Rejecting duplicate connection {} from {}", peer.id, peer.addr);
            return false;
        }
        peers.insert(
            peer.id,
            PeerEntry {
                peer: peer.clone(),
                liveness: Liveness::Connected,
                probe,
                commands,
                task: None,
                busy: false,
            },
        );
        let count = peers.len();
        drop(peers);

        self.inner.live.send_replace(count);
        info!("[Registry] {} joined from {} ({} live)", peer.id, peer.addr, count);
        self.inner.observer.on_peer_connected(&peer);
        true
    }

    /// Tie the peer's task to its entry so removal can abort it.
    pub fn attach_task(&self, id: PeerId, task: AbortHandle) {
        match self.lock().get_mut(&id) {
            Some(entry) => entry.task = Some(task),
            // Task already ended and removed itself.
            None => task.abort(),
        }
    }

    /// Close and forget a peer. Returns false if it was already gone.
    pub fn remove(&self, id: PeerId) -> bool {
        let mut peers = self.lock();
        let Some(entry) = peers.remove(&id) else {
            return false;
        };
        let count = peers.len();
        drop(peers);

        entry.probe.shutdown();
        if let Some(task) = &entry.task {
            task.abort();
        }
        self.inner.live.send_replace(count);
        info!("[Registry] {} removed ({} live)", id, count);
        self.inner.observer.on_peer_lost(&entry.peer);
        true
    }

    pub fn live_count(&self) -> usize {
        self.lock().len()
    }

    /// Live-count updates, for callers waiting on peers to join.
    pub fn subscribe(&self) -> watch::Receiver<usize> {
        self.inner.live.subscribe()
    }

    pub fn peers(&self) -> Vec<ConnectedPeer> {
        self.lock().values().map(|e| e.peer.clone()).collect()
    }

    pub fn liveness(&self, id: PeerId) -> Option<Liveness> {
        self.lock().get(&id).map(|e| e.liveness)
    }

    pub fn is_busy(&self, id: PeerId) -> bool {
        self.lock().get(&id).is_some_and(|e| e.busy)
    }

    /// Mark whether the peer task is running a command.
    pub(crate) fn set_busy(&self, id: PeerId, busy: bool) {
        if let Some(entry) = self.lock().get_mut(&id) {
            entry.busy = busy;
        }
    }

    pub(crate) fn senders(&self) -> Vec<(PeerId, mpsc::Sender<PeerCommand>)> {
        self.lock()
            .iter()
            .map(|(id, e)| (*id, e.commands.clone()))
            .collect()
    }

    /// Probe every idle peer once; dead ones are removed. Returns the
    /// removed ids.
    pub fn probe_all(&self) -> Vec<PeerId> {
        let targets: Vec<(PeerId, Arc<dyn LivenessProbe>)> = self
            .lock()
            .iter_mut()
            .filter(|(_, entry)| !entry.busy)
            .map(|(id, entry)| {
                entry.liveness = Liveness::Probing;
                (*id, Arc::clone(&entry.probe))
            })
            .collect();

        let mut dead = Vec::new();
        for (id, probe) in targets {
            let verdict = match probe.probe() {
                Ok(()) => Liveness::Connected,
                Err(e) => {
                    debug!("[Registry] Probe of {} failed: {}", id, e);
                    dead.push(id);
                    Liveness::Dead
                }
            };
            if let Some(entry) = self.lock().get_mut(&id) {
                entry.liveness = verdict;
            }
        }

        for id in &dead {
            if self.remove(*id) {
                let err = LockstepError::Liveness { peer: *id };
                warn!("[Registry] {}", err);
                self.inner.observer.on_error(&err.to_string(), err.is_recoverable());
            }
        }
        dead
    }

    pub fn close_all(&self) {
        let ids: Vec<PeerId> = self.lock().keys().copied().collect();
        for id in ids {
            self.remove(id);
        }
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<PeerId, PeerEntry>> {
        self.inner.peers.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Probe the registry every `interval` until the task is aborted.
pub fn spawn_liveness_monitor(registry: ConnectionRegistry, interval: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // First tick completes immediately.
        ticker.tick().await;
        loop {
            ticker.tick().await;
            registry.probe_all();
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use lockstep_core::SessionEvent;
    use std::net::{SocketAddr, TcpListener};
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    #[derive(Default)]
    struct FakeProbe {
        dead: Arc<AtomicBool>,
        shutdowns: Arc<AtomicUsize>,
    }

    impl LivenessProbe for FakeProbe {
        fn probe(&self) -> io::Result<()> {
            if self.dead.load(Ordering::SeqCst) {
                Err(io::Error::from(io::ErrorKind::BrokenPipe))
            } else {
                Ok(())
            }
        }

        fn shutdown(&self) {
            self.shutdowns.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn peer(id: u64, port: u16) -> ConnectedPeer {
        ConnectedPeer::new(PeerId(id), SocketAddr::from(([10, 0, 0, 2], port)))
    }

    fn registry() -> (ConnectionRegistry, mpsc::UnboundedReceiver<SessionEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (ConnectionRegistry::new(Arc::new(tx)), rx)
    }

    fn commands() -> mpsc::Sender<PeerCommand> {
        mpsc::channel(1).0
    }

    fn lost(rx: &mut mpsc::UnboundedReceiver<SessionEvent>) -> usize {
        let mut n = 0;
        while let Ok(event) = rx.try_recv() {
            if matches!(event, SessionEvent::PeerLost(_)) {
                n += 1;
            }
        }
        n
    }

    #[test]
    fn insert_and_remove_track_live_count() {
        let (reg, mut rx) = registry();
        let counts = reg.subscribe();
        assert!(reg.insert(peer(1, 5000), Arc::new(FakeProbe::default()), commands()));
        assert!(reg.insert(peer(2, 5001), Arc::new(FakeProbe::default()), commands()));
        assert_eq!(reg.live_count(), 2);
        assert_eq!(*counts.borrow(), 2);

        assert!(reg.remove(PeerId(1)));
        assert!(!reg.remove(PeerId(1)));
        assert_eq!(reg.live_count(), 1);
        assert_eq!(*counts.borrow(), 1);
        assert_eq!(lost(&mut rx), 1);
    }

    #[test]
    fn duplicate_address_rejected() {
        let (reg, _rx) = registry();
        assert!(reg.insert(peer(1, 5000), Arc::new(FakeProbe::default()), commands()));
        assert!(!reg.insert(peer(2, 5000), Arc::new(FakeProbe::default()), commands()));
        assert!(!reg.insert(peer(1, 5001), Arc::new(FakeProbe::default()), commands()));
        assert_eq!(reg.live_count(), 1);
    }

    #[test]
    fn failed_probe_removes_only_that_peer() {
        let (reg, mut rx) = registry();
        let bad = FakeProbe::default();
        let dead = bad.dead.clone();
        let shutdowns = bad.shutdowns.clone();
        reg.insert(peer(1, 5000), Arc::new(bad), commands());
        reg.insert(peer(2, 5001), Arc::new(FakeProbe::default()), commands());

        assert!(reg.probe_all().is_empty());
        assert_eq!(reg.liveness(PeerId(1)), Some(Liveness::Connected));

        dead.store(true, Ordering::SeqCst);
        assert_eq!(reg.probe_all(), vec![PeerId(1)]);
        assert_eq!(reg.liveness(PeerId(1)), None);
        assert_eq!(reg.liveness(PeerId(2)), Some(Liveness::Connected));
        assert_eq!(shutdowns.load(Ordering::SeqCst), 1);
        assert_eq!(lost(&mut rx), 1);
    }

    #[test]
    fn busy_peer_is_not_probed() {
        let (reg, mut rx) = registry();
        let bad = FakeProbe::default();
        let dead = bad.dead.clone();
        reg.insert(peer(1, 5000), Arc::new(bad), commands());
        dead.store(true, Ordering::SeqCst);

        reg.set_busy(PeerId(1), true);
        assert!(reg.is_busy(PeerId(1)));
        assert!(reg.probe_all().is_empty());
        assert_eq!(reg.liveness(PeerId(1)), Some(Liveness::Connected));
        assert_eq!(lost(&mut rx), 0);

        reg.set_busy(PeerId(1), false);
        assert_eq!(reg.probe_all(), vec![PeerId(1)]);
        assert_eq!(lost(&mut rx), 1);
    }

    #[test]
    fn close_all_empties_registry() {
        let (reg, mut rx) = registry();
        reg.insert(peer(1, 5000), Arc::new(FakeProbe::default()), commands());
        reg.insert(peer(2, 5001), Arc::new(FakeProbe::default()), commands());
        reg.close_all();
        assert_eq!(reg.live_count(), 0);
        assert_eq!(lost(&mut rx), 2);
    }

    #[tokio::test]
    async fn removal_aborts_attached_task() {
        let (reg, _rx) = registry();
        reg.insert(peer(1, 5000), Arc::new(FakeProbe::default()), commands());
        let task = tokio::spawn(std::future::pending::<()>());
        reg.attach_task(PeerId(1), task.abort_handle());
        reg.remove(PeerId(1));
        assert!(task.await.unwrap_err().is_cancelled());
    }

    #[tokio::test(start_paused = true)]
    async fn monitor_removes_dead_peer_within_one_interval() {
        let (reg, _rx) = registry();
        let bad = FakeProbe::default();
        bad.dead.store(true, Ordering::SeqCst);
        reg.insert(peer(1, 5000), Arc::new(bad), commands());
        let mut counts = reg.subscribe();

        let monitor = spawn_liveness_monitor(reg.clone(), Duration::from_millis(3_000));
        let start = tokio::time::Instant::now();
        counts.wait_for(|n| *n == 0).await.unwrap();
        assert!(start.elapsed() <= Duration::from_millis(3_000));
        monitor.abort();
    }

    #[test]
    fn tcp_probe_detects_closed_peer() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let client = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (server, _) = listener.accept().unwrap();
        server.set_nonblocking(true).unwrap();
        let probe = TcpProbe::new(server);

        probe.probe().unwrap();
        drop(client);
        std::thread::sleep(Duration::from_millis(50));
        assert!(probe.probe().is_err());
    }
}
