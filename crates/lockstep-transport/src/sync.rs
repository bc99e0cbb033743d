//! Timestamp batch: the master's clock sample, the absolute start time and
//! the playlist, sent once per peer after every participant has its files.

use lockstep_core::{Clock, LocalSchedule, LockstepError, PlaybackSchedule, ProtocolError, SessionObserver};
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, warn};

use crate::codec::WireStream;
use crate::token::TIMESTAMP_RECEIVED;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncState {
    SendMasterTime,
    SendPlaybackStart,
    SendVideoCount,
    SendVideoName(usize),
    AwaitAck,
    Done { acknowledged: bool },
}

// MARK: - ScheduleSender

pub struct ScheduleSender<'a, S> {
    wire: &'a mut WireStream<S>,
    schedule: &'a PlaybackSchedule,
    observer: &'a dyn SessionObserver,
}

impl<'a, S> ScheduleSender<'a, S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    pub fn new(
        wire: &'a mut WireStream<S>,
        schedule: &'a PlaybackSchedule,
        observer: &'a dyn SessionObserver,
    ) -> Self {
        Self { wire, schedule, observer }
    }

    /// Send the batch and report whether the peer acknowledged it.
    pub async fn run(mut self) -> Result<bool, LockstepError> {
        let mut state = SyncState::SendMasterTime;
        loop {
            state = match self.step(state).await? {
                SyncState::Done { acknowledged } => return Ok(acknowledged),
                next => next,
            };
        }
    }

    pub async fn step(&mut self, state: SyncState) -> Result<SyncState, LockstepError> {
        let names = &self.schedule.video_names;
        match state {
            SyncState::SendMasterTime => {
                self.wire.write_i64(self.schedule.master_epoch_millis).await?;
                Ok(SyncState::SendPlaybackStart)
            }
            SyncState::SendPlaybackStart => {
                self.wire.write_i64(self.schedule.playback_start_epoch_millis).await?;
                Ok(SyncState::SendVideoCount)
            }
            SyncState::SendVideoCount => {
                self.wire.write_i32(names.len() as i32).await?;
                Ok(if names.is_empty() {
                    SyncState::AwaitAck
                } else {
                    SyncState::SendVideoName(0)
                })
            }
            SyncState::SendVideoName(i) => {
                let name = names.get(i).ok_or(ProtocolError::IndexOutOfRange {
                    state: "SendVideoName",
                    index: i,
                    len: names.len(),
                })?;
                self.wire.write_string(name).await?;
                Ok(if i + 1 < names.len() {
                    SyncState::SendVideoName(i + 1)
                } else {
                    SyncState::AwaitAck
                })
            }
            SyncState::AwaitAck => {
                let token = self.wire.read_string().await?;
                let acknowledged = token == TIMESTAMP_RECEIVED;
                if !acknowledged {
                    warn!("[Sync] Schedule acknowledged with {:?}", token);
                    self.observer
                        .on_error(&format!("unexpected schedule acknowledgment {token:?}"), true);
                }
                Ok(SyncState::Done { acknowledged })
            }
            done @ SyncState::Done { .. } => Ok(done),
        }
    }
}

// MARK: - ScheduleReceiver

pub struct ScheduleReceiver<'a, S> {
    wire: &'a mut WireStream<S>,
    clock: &'a dyn Clock,
}

impl<'a, S> ScheduleReceiver<'a, S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    pub fn new(wire: &'a mut WireStream<S>, clock: &'a dyn Clock) -> Self {
        Self { wire, clock }
    }

    /// Read one timestamp batch, acknowledge it, and translate it into the
    /// local clock.
    ///
    /// The master holds the batch back until every peer has its files, so
    /// the first value is read without the idle timeout. The local clock is
    /// sampled right after both timestamps arrive.
    pub async fn run(self) -> Result<LocalSchedule, LockstepError> {
        let master_epoch_millis = self.wire.read_i64_within(None).await?;
        let playback_start_epoch_millis = self.wire.read_i64().await?;
        let slave_now = self.clock.now_millis();

        let count = self.wire.read_i32().await?;
        if count < 0 {
            return Err(ProtocolError::NegativeLength {
                field: "video count",
                value: i64::from(count),
            }
            .into());
        }
        let mut video_names = Vec::with_capacity(count as usize);
        for _ in 0..count {
            video_names.push(self.wire.read_string().await?);
        }
        self.wire.write_string(TIMESTAMP_RECEIVED).await?;

        let schedule = PlaybackSchedule {
            video_names,
            master_epoch_millis,
            playback_start_epoch_millis,
        };
        let local = schedule.localize(slave_now);
        debug!(
            "[Sync] Offset {}ms, playback at {} local",
            local.offset_millis, local.adjusted_playback_start
        );
        Ok(local)
    }
}
