//! Cross-peer barriers for one batch.
//!
//! The schedule is computed exactly once, when every participant has either
//! finished its transfer or failed, and at least one finished. Ready-to-play
//! fires exactly once, when every peer that finished has acknowledged the
//! schedule or failed, and at least one acknowledged.
//!
//! Participants are the peers connected when the batch was issued. Peers
//! that connect later are not waited on.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard};

use lockstep_core::{Clock, PeerId, PlaybackSchedule, SessionObserver, VideoFile};
use tokio::sync::watch;
use tracing::{debug, info};
use uuid::Uuid;

pub struct BatchGate {
    id: Uuid,
    files: Arc<[VideoFile]>,
    lead_time_ms: u64,
    clock: Arc<dyn Clock>,
    observer: Arc<dyn SessionObserver>,
    state: Mutex<GateState>,
    schedule: watch::Sender<Option<PlaybackSchedule>>,
}

#[derive(Default)]
struct GateState {
    participants: HashSet<PeerId>,
    finished: HashSet<PeerId>,
    failed: HashSet<PeerId>,
    acknowledged: HashSet<PeerId>,
    fired: bool,
    ready: bool,
}

impl GateState {
    fn transfers_settled(&self) -> bool {
        self.participants
            .iter()
            .all(|p| self.finished.contains(p) || self.failed.contains(p))
            && self.finished.iter().any(|p| !self.failed.contains(p))
    }

    fn acks_settled(&self) -> bool {
        self.finished
            .iter()
            .all(|p| self.acknowledged.contains(p) || self.failed.contains(p))
            && !self.acknowledged.is_empty()
    }
}

impl BatchGate {
    pub fn new(
        files: Arc<[VideoFile]>,
        participants: impl IntoIterator<Item = PeerId>,
        lead_time_ms: u64,
        clock: Arc<dyn Clock>,
        observer: Arc<dyn SessionObserver>,
    ) -> Arc<Self> {
        let (schedule, _) = watch::channel(None);
        let state = GateState {
            participants: participants.into_iter().collect(),
            ..GateState::default()
        };
        let gate = Arc::new(Self {
            id: Uuid::new_v4(),
            files,
            lead_time_ms,
            clock,
            observer,
            state: Mutex::new(state),
            schedule,
        });
        debug!(
            "[Batch] {} issued: {} file(s) to {} peer(s)",
            gate.id,
            gate.files.len(),
            gate.lock().participants.len()
        );
        gate
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn files(&self) -> &Arc<[VideoFile]> {
        &self.files
    }

    pub fn is_participant(&self, peer: PeerId) -> bool {
        self.lock().participants.contains(&peer)
    }

    /// Ticket for `peer`. Dropping an unresolved ticket counts as a failure.
    pub fn ticket(self: &Arc<Self>, peer: PeerId) -> BatchTicket {
        BatchTicket {
            gate: Arc::clone(self),
            peer,
            stage: Stage::Pending,
        }
    }

    pub fn schedule(&self) -> Option<PlaybackSchedule> {
        self.schedule.borrow().clone()
    }

    pub fn is_ready(&self) -> bool {
        self.lock().ready
    }

    /// Wait for the schedule. Resolves immediately if it already fired.
    pub async fn wait_schedule(&self) -> Option<PlaybackSchedule> {
        let mut rx = self.schedule.subscribe();
        let fired = rx.wait_for(Option::is_some).await.ok()?;
        (*fired).clone()
    }

    /// Record a completed transfer. Returns the schedule if this call fired it.
    pub fn mark_finished(&self, peer: PeerId) -> Option<PlaybackSchedule> {
        let mut state = self.lock();
        if !state.participants.contains(&peer) {
            debug!("[Batch] {} ignoring {}: not a participant", self.id, peer);
            return None;
        }
        state.finished.insert(peer);
        self.try_fire(state)
    }

    /// Record a peer that dropped out at any point of the batch.
    pub fn mark_failed(&self, peer: PeerId) -> Option<PlaybackSchedule> {
        let mut state = self.lock();
        if !state.participants.contains(&peer) || !state.failed.insert(peer) {
            return None;
        }
        debug!("[Batch] {} lost {}", self.id, peer);
        let fired = self.try_fire_locked(&mut state);
        self.try_ready(state);
        fired
    }

    /// Record a schedule acknowledgment. Returns true if this call made the
    /// batch ready to play.
    pub fn mark_acknowledged(&self, peer: PeerId) -> bool {
        let mut state = self.lock();
        if !state.finished.contains(&peer) || state.failed.contains(&peer) {
            return false;
        }
        state.acknowledged.insert(peer);
        self.try_ready(state)
    }

    fn try_fire(&self, mut state: MutexGuard<'_, GateState>) -> Option<PlaybackSchedule> {
        self.try_fire_locked(&mut state)
    }

    fn try_fire_locked(&self, state: &mut GateState) -> Option<PlaybackSchedule> {
        if state.fired || !state.transfers_settled() {
            return None;
        }
        state.fired = true;
        let names = self.files.iter().map(|f| f.name.clone()).collect();
        let schedule = PlaybackSchedule::new(names, self.clock.now_millis(), self.lead_time_ms);
        info!(
            "[Batch] {} transfers done ({} of {} peers), playback at {}",
            self.id,
            state.finished.len() - state.finished.intersection(&state.failed).count(),
            state.participants.len(),
            schedule.playback_start_epoch_millis
        );
        self.schedule.send_replace(Some(schedule.clone()));
        Some(schedule)
    }

    fn try_ready(&self, mut state: MutexGuard<'_, GateState>) -> bool {
        if state.ready || !state.fired || !state.acks_settled() {
            return false;
        }
        state.ready = true;
        drop(state);
        if let Some(schedule) = self.schedule() {
            info!("[Batch] {} ready to play", self.id);
            self.observer.on_ready_to_play(&schedule);
        }
        true
    }

    fn lock(&self) -> MutexGuard<'_, GateState> {
        // A panic under this lock leaves the sets consistent.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

// MARK: - BatchTicket

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
    Pending,
    Finished,
    Resolved,
}

/// One participant's handle on a batch, carried in its command queue.
pub struct BatchTicket {
    gate: Arc<BatchGate>,
    peer: PeerId,
    stage: Stage,
}

impl BatchTicket {
    pub fn gate(&self) -> &Arc<BatchGate> {
        &self.gate
    }

    pub fn peer(&self) -> PeerId {
        self.peer
    }

    pub fn finished(&mut self) {
        self.stage = Stage::Finished;
        self.gate.mark_finished(self.peer);
    }

    pub fn acknowledged(mut self, acknowledged: bool) {
        self.stage = Stage::Resolved;
        if acknowledged {
            self.gate.mark_acknowledged(self.peer);
        } else {
            self.gate.mark_failed(self.peer);
        }
    }
}

impl Drop for BatchTicket {
    fn drop(&mut self) {
        if self.stage != Stage::Resolved {
            self.gate.mark_failed(self.peer);
        }
    }
}

impl std::fmt::Debug for BatchTicket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BatchTicket")
            .field("batch", &self.gate.id)
            .field("peer", &self.peer)
            .field("stage", &self.stage)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lockstep_core::{ManualClock, NullObserver, SessionEvent};
    use tokio::sync::mpsc;

    fn gate_with(peers: &[u64]) -> (Arc<BatchGate>, mpsc::UnboundedReceiver<SessionEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let files: Arc<[VideoFile]> = vec![VideoFile::new("a.mp4", "/v/a.mp4", 1)].into();
        let gate = BatchGate::new(
            files,
            peers.iter().copied().map(PeerId),
            10_000,
            Arc::new(ManualClock::new(1_000)),
            Arc::new(tx),
        );
        (gate, rx)
    }

    fn ready_events(rx: &mut mpsc::UnboundedReceiver<SessionEvent>) -> usize {
        let mut n = 0;
        while let Ok(event) = rx.try_recv() {
            if matches!(event, SessionEvent::ReadyToPlay(_)) {
                n += 1;
            }
        }
        n
    }

    #[test]
    fn schedule_waits_for_every_participant() {
        let (gate, _rx) = gate_with(&[1, 2]);
        assert!(gate.mark_finished(PeerId(1)).is_none());
        assert!(gate.schedule().is_none());

        let schedule = gate.mark_finished(PeerId(2)).unwrap();
        assert_eq!(schedule.master_epoch_millis, 1_000);
        assert_eq!(schedule.playback_start_epoch_millis, 11_000);
        assert_eq!(schedule.video_names, vec!["a.mp4".to_string()]);
        assert_eq!(gate.schedule(), Some(schedule));
    }

    #[test]
    fn schedule_fires_once() {
        let (gate, _rx) = gate_with(&[1]);
        assert!(gate.mark_finished(PeerId(1)).is_some());
        assert!(gate.mark_finished(PeerId(1)).is_none());
        assert!(gate.mark_failed(PeerId(1)).is_none());
    }

    #[test]
    fn late_joiner_is_not_waited_on() {
        let (gate, _rx) = gate_with(&[1, 2]);
        assert!(!gate.is_participant(PeerId(3)));
        gate.mark_finished(PeerId(1));
        assert!(gate.mark_finished(PeerId(3)).is_none());
        assert!(gate.mark_finished(PeerId(2)).is_some());
    }

    #[test]
    fn survivors_proceed_when_a_peer_fails() {
        let (gate, mut rx) = gate_with(&[1, 2]);
        gate.mark_finished(PeerId(1));
        assert!(gate.mark_failed(PeerId(2)).is_some());
        assert!(gate.mark_acknowledged(PeerId(1)));
        assert_eq!(ready_events(&mut rx), 1);
    }

    #[test]
    fn nothing_fires_when_everyone_fails() {
        let (gate, mut rx) = gate_with(&[1, 2]);
        assert!(gate.mark_failed(PeerId(1)).is_none());
        assert!(gate.mark_failed(PeerId(2)).is_none());
        assert!(gate.schedule().is_none());
        assert_eq!(ready_events(&mut rx), 0);
    }

    #[test]
    fn ready_fires_once_after_all_acks() {
        let (gate, mut rx) = gate_with(&[1, 2]);
        gate.mark_finished(PeerId(1));
        gate.mark_finished(PeerId(2));
        assert!(!gate.mark_acknowledged(PeerId(1)));
        assert!(gate.mark_acknowledged(PeerId(2)));
        assert!(!gate.mark_acknowledged(PeerId(2)));
        assert!(gate.is_ready());
        assert_eq!(ready_events(&mut rx), 1);
    }

    #[test]
    fn failure_after_ack_does_not_refire() {
        let (gate, mut rx) = gate_with(&[1, 2]);
        gate.mark_finished(PeerId(1));
        gate.mark_finished(PeerId(2));
        gate.mark_acknowledged(PeerId(1));
        gate.mark_failed(PeerId(2));
        gate.mark_failed(PeerId(1));
        assert_eq!(ready_events(&mut rx), 1);
    }

    #[test]
    fn dropped_ticket_counts_as_failure() {
        let (gate, _rx) = gate_with(&[1, 2]);
        let mut first = gate.ticket(PeerId(1));
        let second = gate.ticket(PeerId(2));
        first.finished();
        drop(second);
        assert!(gate.schedule().is_some());
        first.acknowledged(true);
        assert!(gate.is_ready());
    }

    #[test]
    fn refused_ack_counts_as_failure() {
        let (gate, mut rx) = gate_with(&[1, 2]);
        let mut first = gate.ticket(PeerId(1));
        let mut second = gate.ticket(PeerId(2));
        first.finished();
        second.finished();
        first.acknowledged(false);
        assert!(!gate.is_ready());
        second.acknowledged(true);
        assert_eq!(ready_events(&mut rx), 1);
    }

    #[tokio::test]
    async fn waiters_see_the_fired_schedule() {
        let (gate, _rx) = gate_with(&[1]);
        let waiter = {
            let gate = Arc::clone(&gate);
            tokio::spawn(async move { gate.wait_schedule().await })
        };
        tokio::task::yield_now().await;
        let fired = gate.mark_finished(PeerId(1));
        assert_eq!(waiter.await.unwrap(), fired);
        assert_eq!(gate.wait_schedule().await, fired);
    }

    #[test]
    fn batches_get_distinct_ids() {
        let files: Arc<[VideoFile]> = Vec::new().into();
        let clock: Arc<dyn Clock> = Arc::new(ManualClock::new(0));
        let a = BatchGate::new(files.clone(), [PeerId(1)], 1, clock.clone(), Arc::new(NullObserver));
        let b = BatchGate::new(files, [PeerId(1)], 1, clock, Arc::new(NullObserver));
        assert_ne!(a.id(), b.id());
    }
}
