use std::hash::{Hash, Hasher};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

// MARK: - VideoFile

/// A video selected for transfer. Treated as an opaque byte blob.
///
/// Equality and hashing only consider `name` and `path`; `size` is a
/// snapshot taken when the value was built.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VideoFile {
    pub name: String,
    pub path: PathBuf,
    pub size: u64,
}

impl VideoFile {
    pub fn new(name: impl Into<String>, path: impl Into<PathBuf>, size: u64) -> Self {
        Self {
            name: name.into(),
            path: path.into(),
            size,
        }
    }

    /// Build from a path on disk, reading the size from the file's metadata.
    pub fn from_path(path: impl AsRef<Path>) -> std::io::Result<Self> {
        let path = path.as_ref();
        let size = std::fs::metadata(path)?.len();
        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| {
                std::io::Error::new(
                    std::io::ErrorKind::InvalidInput,
                    format!("path has no UTF-8 file name: {}", path.display()),
                )
            })?
            .to_owned();
        Ok(Self::new(name, path, size))
    }
}

impl PartialEq for VideoFile {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name && self.path == other.path
    }
}

impl Eq for VideoFile {}

impl Hash for VideoFile {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.name.hash(state);
        self.path.hash(state);
    }
}

// MARK: - PeerId

/// Identifier the master assigns to each accepted connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PeerId(pub u64);

impl PeerId {
    /// How a slave refers to the master it is connected to.
    pub const MASTER: Self = Self(0);
}

impl std::fmt::Display for PeerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if *self == Self::MASTER {
            write!(f, "master")
        } else {
            write!(f, "peer#{}", self.0)
        }
    }
}

// MARK: - ConnectedPeer

/// Public view of a live connection held by the master's registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectedPeer {
    pub id: PeerId,
    pub addr: SocketAddr,
    pub host: String,
}

impl ConnectedPeer {
    pub fn new(id: PeerId, addr: SocketAddr) -> Self {
        Self {
            id,
            addr,
            host: addr.ip().to_string(),
        }
    }
}

// MARK: - Liveness

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Liveness {
    Connected,
    Probing,
    Dead,
}

// MARK: - PeerInfo

/// A master endpoint resolved by discovery.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerInfo {
    pub id: String,
    pub name: String,
    pub address: String,
    pub port: u16,
}

impl PeerInfo {
    pub fn new(id: impl Into<String>, name: impl Into<String>, address: impl Into<String>, port: u16) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            address: address.into(),
            port,
        }
    }

    pub fn socket_addr(&self) -> String {
        if self.address.contains(':') {
            format!("[{}]:{}", self.address, self.port)
        } else {
            format!("{}:{}", self.address, self.port)
        }
    }
}

// MARK: - PlaybackSchedule

/// Start instruction computed once per batch on the master.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlaybackSchedule {
    pub video_names: Vec<String>,
    pub master_epoch_millis: i64,
    pub playback_start_epoch_millis: i64,
}

impl PlaybackSchedule {
    /// `lead_time_ms` must be positive so the start lies strictly after the
    /// master's sample.
    pub fn new(video_names: Vec<String>, master_epoch_millis: i64, lead_time_ms: u64) -> Self {
        debug_assert!(lead_time_ms > 0);
        Self {
            video_names,
            master_epoch_millis,
            playback_start_epoch_millis: master_epoch_millis + lead_time_ms as i64,
        }
    }

    pub fn lead_time_ms(&self) -> i64 {
        self.playback_start_epoch_millis - self.master_epoch_millis
    }

    /// Translate into the slave's clock, sampled as `slave_now_millis`.
    pub fn localize(&self, slave_now_millis: i64) -> LocalSchedule {
        let offset_millis = slave_now_millis - self.master_epoch_millis;
        LocalSchedule {
            video_names: self.video_names.clone(),
            offset_millis,
            adjusted_playback_start: adjust_playback_start(
                self.master_epoch_millis,
                self.playback_start_epoch_millis,
                slave_now_millis,
            ),
        }
    }
}

/// Shift the master's start time by the observed clock offset.
///
/// Compensates for skew between the two clocks, not for network latency.
pub fn adjust_playback_start(master_epoch_millis: i64, playback_start_millis: i64, slave_now_millis: i64) -> i64 {
    playback_start_millis + (slave_now_millis - master_epoch_millis)
}

// MARK: - LocalSchedule

/// A schedule as seen by a slave, expressed in its own clock.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalSchedule {
    pub video_names: Vec<String>,
    pub offset_millis: i64,
    pub adjusted_playback_start: i64,
}

// MARK: - PositionSample

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PositionSample {
    pub video_id: String,
    pub position_millis: i64,
    pub sampled_at_epoch_millis: i64,
}

impl PositionSample {
    pub fn new(video_id: impl Into<String>, position_millis: i64, sampled_at_epoch_millis: i64) -> Self {
        Self {
            video_id: video_id.into(),
            position_millis,
            sampled_at_epoch_millis,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn video_identity_ignores_size() {
        let a = VideoFile::new("a.mp4", "/videos/a.mp4", 100);
        let b = VideoFile::new("a.mp4", "/videos/a.mp4", 200);
        let c = VideoFile::new("a.mp4", "/other/a.mp4", 100);
        assert_eq!(a, b);
        assert_ne!(a, c);

        let set: HashSet<_> = [a, b, c].into_iter().collect();
        assert_eq!(set.len(), 2);
    }

    #[test]
    fn video_size_read_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("clip.mkv");
        std::fs::write(&path, vec![7u8; 321]).unwrap();

        let video = VideoFile::from_path(&path).unwrap();
        assert_eq!(video.name, "clip.mkv");
        assert_eq!(video.size, 321);
    }

    #[test]
    fn schedule_adds_lead_time() {
        let schedule = PlaybackSchedule::new(vec!["a.mp4".into()], 1_000, 10_000);
        assert_eq!(schedule.playback_start_epoch_millis, 11_000);
        assert_eq!(schedule.lead_time_ms(), 10_000);
    }

    #[test]
    fn slave_offset_applied() {
        let schedule = PlaybackSchedule::new(vec!["a.mp4".into(), "b.mp4".into()], 1_000, 10_000);
        let local = schedule.localize(1_050);
        assert_eq!(local.offset_millis, 50);
        assert_eq!(local.adjusted_playback_start, 11_050);
        assert_eq!(local.video_names, schedule.video_names);
    }

    #[test]
    fn adjustment_tracks_any_fixed_skew() {
        let master = 1_700_000_000_000_i64;
        let start = master + 10_000;
        for skew in [-86_400_000_i64, -3_000, -1, 0, 1, 50, 7_777, 86_400_000] {
            assert_eq!(adjust_playback_start(master, start, master + skew), start + skew);
        }
    }

    #[test]
    fn peer_id_display() {
        assert_eq!(PeerId::MASTER.to_string(), "master");
        assert_eq!(PeerId(3).to_string(), "peer#3");
    }

    #[test]
    fn peer_socket_addr_brackets_ipv6() {
        assert_eq!(PeerInfo::new("a", "a", "10.0.0.2", 8989).socket_addr(), "10.0.0.2:8989");
        assert_eq!(PeerInfo::new("b", "b", "fe80::1", 8989).socket_addr(), "[fe80::1]:8989");
    }
}
