//! Upward event surface consumed by the UI / player collaborators.
//!
//! Components report through [`SessionObserver`]. Collaborators that prefer
//! a queue can hand over an `mpsc::UnboundedSender<SessionEvent>`, which
//! implements the trait by forwarding every callback as a [`SessionEvent`].

use tokio::sync::mpsc;

use crate::types::{ConnectedPeer, PeerId, PlaybackSchedule, PositionSample};

#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    PeerConnected(ConnectedPeer),
    PeerLost(ConnectedPeer),
    TransferProgress {
        peer: PeerId,
        file: String,
        percent: u8,
    },
    AllFilesReceived {
        video_names: Vec<String>,
        playback_start: i64,
    },
    ReadyToPlay(PlaybackSchedule),
    Position(PositionSample),
    Error {
        message: String,
        recoverable: bool,
    },
}

/// Callbacks are invoked from peer tasks and must not block.
pub trait SessionObserver: Send + Sync {
    fn on_peer_connected(&self, _peer: &ConnectedPeer) {}

    fn on_peer_lost(&self, _peer: &ConnectedPeer) {}

    fn on_transfer_progress(&self, _peer: PeerId, _file: &str, _percent: u8) {}

    /// Slave side: every file of a batch is on disk and the start time,
    /// already translated into this device's clock, is known.
    fn on_all_files_received(&self, _video_names: &[String], _playback_start: i64) {}

    /// Master side: every peer of a batch acknowledged the schedule.
    fn on_ready_to_play(&self, _schedule: &PlaybackSchedule) {}

    fn on_position(&self, _sample: &PositionSample) {}

    fn on_error(&self, _message: &str, _recoverable: bool) {}
}

/// Observer that drops everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullObserver;

impl SessionObserver for NullObserver {}

impl SessionObserver for mpsc::UnboundedSender<SessionEvent> {
    fn on_peer_connected(&self, peer: &ConnectedPeer) {
        let _ = self.send(SessionEvent::PeerConnected(peer.clone()));
    }

    fn on_peer_lost(&self, peer: &ConnectedPeer) {
        let _ = self.send(SessionEvent::PeerLost(peer.clone()));
    }

    fn on_transfer_progress(&self, peer: PeerId, file: &str, percent: u8) {
        let _ = self.send(SessionEvent::TransferProgress {
            peer,
            file: file.to_owned(),
            percent,
        });
    }

    fn on_all_files_received(&self, video_names: &[String], playback_start: i64) {
        let _ = self.send(SessionEvent::AllFilesReceived {
            video_names: video_names.to_vec(),
            playback_start,
        });
    }

    fn on_ready_to_play(&self, schedule: &PlaybackSchedule) {
        let _ = self.send(SessionEvent::ReadyToPlay(schedule.clone()));
    }

    fn on_position(&self, sample: &PositionSample) {
        let _ = self.send(SessionEvent::Position(sample.clone()));
    }

    fn on_error(&self, message: &str, recoverable: bool) {
        let _ = self.send(SessionEvent::Error {
            message: message.to_owned(),
            recoverable,
        });
    }
}
