//! Slave role: connect to the master, then serve whatever it sends.
//!
//! One reader loop dispatches on the leading tag of each message:
//!
//! - `READY_TO_SEND` starts a batch: files, then the timestamp batch.
//! - `POSITION_UPDATE` carries one position sample.
//! - anything else is logged and skipped.
//!
//! Until the first schedule arrives the loop waits indefinitely for the
//! master. Afterwards the configured read timeout applies, so a master that
//! stops streaming is treated as lost and reconnected to.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use lockstep_core::{Clock, FileStore, LockstepError, SessionConfig, SessionObserver};
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, info, warn};

use crate::codec::WireStream;
use crate::position;
use crate::retry::connect_with_retry;
use crate::sync::ScheduleReceiver;
use crate::token::{POSITION_UPDATE, READY_TO_SEND};
use crate::transfer::{FileReceiver, ReceiveState};

pub struct SlaveClient {
    config: SessionConfig,
    dir: PathBuf,
    store: Arc<dyn FileStore>,
    observer: Arc<dyn SessionObserver>,
    clock: Arc<dyn Clock>,
}

impl SlaveClient {
    pub fn new(
        config: SessionConfig,
        dir: impl Into<PathBuf>,
        store: Arc<dyn FileStore>,
        observer: Arc<dyn SessionObserver>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            config,
            dir: dir.into(),
            store,
            observer,
            clock,
        }
    }

    pub fn target_dir(&self) -> &Path {
        &self.dir
    }

    /// Connect to `endpoint` and serve it, reconnecting after every lost
    /// connection. Returns only once a reconnect exhausts the retry budget.
    pub async fn run(&self, endpoint: &str) -> Result<(), LockstepError> {
        self.config.validate()?;
        loop {
            let stream = match connect_with_retry(endpoint, &self.config.retry).await {
                Ok(stream) => stream,
                Err(e) => {
                    warn!("[Slave] {}", e);
                    self.observer.on_error(&e.to_string(), false);
                    return Err(e);
                }
            };
            info!("[Slave] Connected to master at {}", endpoint);

            let mut wire = WireStream::new(stream).with_read_timeout(self.config.retry.read_timeout());
            let err = match self.serve(&mut wire).await {
                Ok(()) => continue,
                Err(e) => e,
            };
            warn!("[Slave] Lost master at {}: {}", endpoint, err);
            self.observer
                .on_error(&format!("connection to master lost: {err}"), true);
        }
    }

    /// Serve one established connection until it fails.
    pub async fn serve<S>(&self, wire: &mut WireStream<S>) -> Result<(), LockstepError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let mut streaming = false;
        loop {
            let idle = if streaming { wire.read_timeout() } else { None };
            let tag = wire.read_string_within(idle).await?;
            match tag.as_str() {
                READY_TO_SEND => {
                    let received = FileReceiver::new(
                        wire,
                        &self.dir,
                        self.store.as_ref(),
                        self.config.chunk_size,
                        self.observer.as_ref(),
                    )
                    .run_from(ReceiveState::SendReady)
                    .await?;
                    info!("[Slave] Batch of {} file(s) on disk", received.len());

                    let local = ScheduleReceiver::new(wire, self.clock.as_ref()).run().await?;
                    info!(
                        "[Slave] Playback of {} video(s) at {} (offset {}ms)",
                        local.video_names.len(),
                        local.adjusted_playback_start,
                        local.offset_millis
                    );
                    self.observer
                        .on_all_files_received(&local.video_names, local.adjusted_playback_start);
                    streaming = true;
                }
                POSITION_UPDATE => {
                    let sample = position::read_sample_body(wire).await?;
                    debug!(
                        "[Slave] Position {} at {}ms (sampled {})",
                        sample.video_id, sample.position_millis, sample.sampled_at_epoch_millis
                    );
                    self.observer.on_position(&sample);
                }
                other => debug!("[Slave] Ignoring unknown tag {:?}", other),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::token::{FILE_RECEIVED, READY, TIMESTAMP_RECEIVED};
    use crate::transfer::FileHeader;
    use lockstep_core::{LocalFileStore, ManualClock, PositionSample, SessionEvent, TransportError};
    use std::time::Duration;
    use tokio::io::duplex;
    use tokio::sync::mpsc;

    fn client(dir: &std::path::Path, tx: mpsc::UnboundedSender<SessionEvent>) -> SlaveClient {
        SlaveClient::new(
            SessionConfig::default(),
            dir,
            Arc::new(LocalFileStore::default()),
            Arc::new(tx),
            Arc::new(ManualClock::new(2_000)),
        )
    }

    #[tokio::test]
    async fn serves_batch_then_positions() {
        let dir = tempfile::tempdir().unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let slave = client(dir.path(), tx);
        let (a, b) = duplex(16 * 1024);
        let mut master = WireStream::new(a);
        let mut wire = WireStream::new(b);

        let script = async move {
            master.write_string("HELLO?").await.unwrap();
            master.write_string(READY_TO_SEND).await.unwrap();
            assert_eq!(master.read_string().await.unwrap(), READY);
            FileHeader { name: "a.mp4".into(), size: 3, is_last: true }
                .write_to(&mut master)
                .await
                .unwrap();
            master.write_chunk(b"abc").await.unwrap();
            assert_eq!(master.read_string().await.unwrap(), FILE_RECEIVED);

            master.write_i64(1_000).await.unwrap();
            master.write_i64(11_000).await.unwrap();
            master.write_i32(1).await.unwrap();
            master.write_string("a.mp4").await.unwrap();
            assert_eq!(master.read_string().await.unwrap(), TIMESTAMP_RECEIVED);

            position::write_sample(&mut master, &PositionSample::new("a.mp4", 10_000, 12_000))
                .await
                .unwrap();
        };
        let (served, ()) = tokio::join!(slave.serve(&mut wire), script);

        assert!(matches!(
            served,
            Err(LockstepError::Transport(TransportError::ConnectionClosed))
        ));
        assert_eq!(std::fs::read(dir.path().join("a.mp4")).unwrap(), b"abc");

        let mut events = Vec::new();
        while let Ok(e) = rx.try_recv() {
            events.push(e);
        }
        assert!(events.contains(&SessionEvent::AllFilesReceived {
            video_names: vec!["a.mp4".into()],
            playback_start: 12_000,
        }));
        assert!(events.contains(&SessionEvent::Position(PositionSample::new("a.mp4", 10_000, 12_000))));
    }

    #[tokio::test(start_paused = true)]
    async fn idle_before_first_batch_never_times_out() {
        let dir = tempfile::tempdir().unwrap();
        let (tx, _rx) = mpsc::unbounded_channel();
        let slave = client(dir.path(), tx);
        let (a, b) = duplex(1024);
        let mut wire = WireStream::new(b).with_read_timeout(Some(Duration::from_secs(60)));

        let served = tokio::time::timeout(Duration::from_secs(600), slave.serve(&mut wire)).await;
        assert!(served.is_err(), "serve should still be waiting");
        drop(a);
    }
}
