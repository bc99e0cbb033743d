use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use lockstep_core::{
    Clock, FileStore, LocalFileStore, PlaybackSchedule, PositionSample, SessionConfig, SessionEvent, SystemClock,
    VideoFile,
};
use lockstep_discovery::{first_master, DiscoveryService, MdnsDiscovery, StaticDiscovery};
use lockstep_transport::{MasterServer, SlaveClient};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Master role.
///
/// # Flow
/// 1. Bind the session port and advertise it over mDNS
/// 2. Pick the videos to send from `dir`
/// 3. Wait for `peers` slaves, then send the batch
/// 4. Once every slave acknowledged the schedule, broadcast the playback
///    position every position interval until interrupted
pub async fn run_master(
    config: SessionConfig,
    dir: PathBuf,
    files: Vec<String>,
    peers: usize,
    advertise: bool,
) -> Result<()> {
    let store = LocalFileStore::new(config.video_extensions.clone());
    let selection = select_videos(&store, &dir, &files).await?;
    info!("Selected {} video(s) from {}", selection.len(), dir.display());

    let (tx, mut events) = mpsc::unbounded_channel();
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let server = MasterServer::bind(config.clone(), Arc::new(tx), Arc::clone(&clock)).await?;

    let mut discovery = MdnsDiscovery::new(config.service_type.clone());
    if advertise {
        if let Err(e) = discovery.advertise(&config.service_name, server.local_addr().port()) {
            warn!("mDNS advertising unavailable: {e}");
        }
    }

    info!("Waiting for {} slave(s) on port {}...", peers, server.local_addr().port());
    tokio::select! {
        _ = server.wait_for_peers(peers.max(1)) => {}
        _ = tokio::signal::ctrl_c() => {
            info!("Interrupted before any batch was sent.");
            discovery.stop();
            server.shutdown();
            return Ok(());
        }
    }

    let gate = server
        .send_batch(selection)
        .context("every slave disconnected before the batch could be sent")?;
    info!("Batch {} sent.", gate.id());

    let mut schedule: Option<PlaybackSchedule> = None;
    let mut ticker = tokio::time::interval(config.position_interval());
    loop {
        tokio::select! {
            Some(event) = events.recv() => {
                log_event(&event);
                if let SessionEvent::ReadyToPlay(ready) = event {
                    schedule = Some(ready);
                }
            }
            _ = ticker.tick() => {
                if let Some(sample) = schedule.as_ref().and_then(|s| position_at(s, clock.now_millis())) {
                    let queued = server.broadcast_position(&sample);
                    debug!("[Position] {}ms of {} to {} slave(s)", sample.position_millis, sample.video_id, queued);
                }
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    info!("Shutting down master.");
    discovery.stop();
    server.shutdown();
    Ok(())
}

/// Slave role: find the master, then receive batches and positions until
/// interrupted or the master is unreachable.
pub async fn run_slave(config: SessionConfig, dir: PathBuf, master: Option<String>) -> Result<()> {
    let mut discovery: Box<dyn DiscoveryService> = match &master {
        Some(endpoint) => Box::new(StaticDiscovery::parse(endpoint)?),
        None => Box::new(MdnsDiscovery::new(config.service_type.clone())),
    };
    let mut found = discovery.discover()?;
    info!("Looking for a master...");
    let peer = tokio::select! {
        peer = first_master(&mut found) => peer.context("discovery ended without finding a master")?,
        _ = tokio::signal::ctrl_c() => {
            discovery.stop();
            return Ok(());
        }
    };
    discovery.stop();
    let endpoint = peer.socket_addr();
    info!("Master '{}' at {}", peer.name, endpoint);

    let (tx, mut events) = mpsc::unbounded_channel();
    let store = Arc::new(LocalFileStore::new(config.video_extensions.clone()));
    let slave = SlaveClient::new(config, dir, store, Arc::new(tx), Arc::new(SystemClock));
    let logger = tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            log_event(&event);
        }
    });

    let outcome = tokio::select! {
        result = slave.run(&endpoint) => result.map_err(anyhow::Error::from),
        _ = tokio::signal::ctrl_c() => {
            info!("Interrupted.");
            Ok(())
        }
    };
    logger.abort();
    outcome
}

/// Videos in `dir`, narrowed to `names` when any are given (in that order).
async fn select_videos(store: &dyn FileStore, dir: &Path, names: &[String]) -> Result<Vec<VideoFile>> {
    let available = store
        .list_videos(dir)
        .await
        .with_context(|| format!("listing videos in {}", dir.display()))?;
    if names.is_empty() {
        if available.is_empty() {
            bail!("no videos found in {}", dir.display());
        }
        return Ok(available);
    }
    names
        .iter()
        .map(|name| {
            available
                .iter()
                .find(|v| &v.name == name)
                .cloned()
                .with_context(|| format!("{name} is not a video in {}", dir.display()))
        })
        .collect()
}

/// Where playback of the first scheduled video stands at `now`, or `None`
/// before the start time.
fn position_at(schedule: &PlaybackSchedule, now_millis: i64) -> Option<PositionSample> {
    let video = schedule.video_names.first()?;
    let elapsed = now_millis - schedule.playback_start_epoch_millis;
    (elapsed >= 0).then(|| PositionSample::new(video.clone(), elapsed, now_millis))
}

fn log_event(event: &SessionEvent) {
    match event {
        SessionEvent::PeerConnected(peer) => info!("Slave {} connected from {}", peer.id, peer.host),
        SessionEvent::PeerLost(peer) => info!("Slave {} ({}) disconnected", peer.id, peer.host),
        SessionEvent::TransferProgress { peer, file, percent } => {
            debug!("{} {}: {}%", peer, file, percent)
        }
        SessionEvent::AllFilesReceived {
            video_names,
            playback_start,
        } => info!("All {} video(s) received, playback at {}", video_names.len(), playback_start),
        SessionEvent::ReadyToPlay(schedule) => info!(
            "Every slave is ready: {} video(s) start at {}",
            schedule.video_names.len(),
            schedule.playback_start_epoch_millis
        ),
        SessionEvent::Position(sample) => {
            debug!("Master at {}ms of {}", sample.position_millis, sample.video_id)
        }
        SessionEvent::Error { message, recoverable } => {
            if *recoverable {
                warn!("{message}")
            } else {
                warn!("Unrecoverable: {message}")
            }
        }
    }
}
