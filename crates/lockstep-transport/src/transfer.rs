//! Per-peer file transfer, expressed as two explicit state machines.
//!
//! Master side ([`FileSender`]):
//!
//! ```text
//! NotifyPeer → AwaitReady → SendFileHeader(i) → SendFileBody(i) → AwaitAck(i)
//!                                 ↑                                    │
//!                                 └──────────── i + 1 < n ─────────────┤
//!                                                                      └→ Finished
//! ```
//!
//! Slave side ([`FileReceiver`]) mirrors it, ending in `Complete` after the
//! file whose header carried `is_last`.

use std::path::Path;
use std::sync::Arc;

use lockstep_core::{FileStore, LockstepError, PeerId, ProtocolError, SessionObserver, TransportError, VideoFile};
use tokio::fs::File;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, info, warn};

use crate::codec::WireStream;
use crate::token::{FILE_RECEIVED, READY, READY_TO_SEND};

/// Integer percentage of `done` over `total`. An empty file is complete.
pub fn percent(done: u64, total: u64) -> u8 {
    if total == 0 {
        return 100;
    }
    ((u128::from(done.min(total)) * 100) / u128::from(total)) as u8
}

// MARK: - FileHeader

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileHeader {
    pub name: String,
    pub size: u64,
    pub is_last: bool,
}

impl FileHeader {
    pub async fn write_to<S>(&self, wire: &mut WireStream<S>) -> Result<(), TransportError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        wire.write_string(&self.name).await?;
        wire.write_i64(self.size as i64).await?;
        wire.write_bool(self.is_last).await
    }

    pub async fn read_from<S>(wire: &mut WireStream<S>) -> Result<Self, LockstepError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let name = wire.read_string().await?;
        let size = wire.read_i64().await?;
        if size < 0 {
            return Err(ProtocolError::NegativeLength { field: "file size", value: size }.into());
        }
        let is_last = wire.read_bool().await?;
        Ok(Self { name, size: size as u64, is_last })
    }
}

// MARK: - TransferSession

/// Progress of one peer through one batch.
#[derive(Debug, Clone)]
pub struct TransferSession {
    pub peer: PeerId,
    files: Arc<[VideoFile]>,
    index: usize,
    bytes_done: u64,
}

impl TransferSession {
    pub fn new(peer: PeerId, files: Arc<[VideoFile]>) -> Self {
        Self {
            peer,
            files,
            index: 0,
            bytes_done: 0,
        }
    }

    pub fn files(&self) -> &[VideoFile] {
        &self.files
    }

    /// Number of files acknowledged so far.
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn bytes_done(&self) -> u64 {
        self.bytes_done
    }

    pub fn is_complete(&self) -> bool {
        self.index >= self.files.len()
    }

    fn advance(&mut self) {
        self.index += 1;
        self.bytes_done = 0;
    }
}

// MARK: - Sender

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendState {
    NotifyPeer,
    AwaitReady,
    SendFileHeader(usize),
    SendFileBody(usize),
    AwaitAck(usize),
    Finished,
}

pub struct FileSender<'a, S> {
    wire: &'a mut WireStream<S>,
    session: TransferSession,
    chunk_size: usize,
    observer: &'a dyn SessionObserver,
}

impl<'a, S> FileSender<'a, S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    pub fn new(
        wire: &'a mut WireStream<S>,
        session: TransferSession,
        chunk_size: usize,
        observer: &'a dyn SessionObserver,
    ) -> Self {
        Self {
            wire,
            session,
            chunk_size: chunk_size.max(1),
            observer,
        }
    }

    pub fn session(&self) -> &TransferSession {
        &self.session
    }

    /// Drive the machine to `Finished`. An empty batch sends nothing.
    pub async fn run(mut self) -> Result<TransferSession, LockstepError> {
        if self.session.files.is_empty() {
            debug!("[Transfer] {} empty batch, nothing to send", self.session.peer);
            return Ok(self.session);
        }
        let mut state = SendState::NotifyPeer;
        while state != SendState::Finished {
            state = self.step(state).await?;
        }
        info!(
            "[Transfer] {} received all {} file(s)",
            self.session.peer,
            self.session.files.len()
        );
        Ok(self.session)
    }

    pub async fn step(&mut self, state: SendState) -> Result<SendState, LockstepError> {
        let count = self.session.files.len();
        match state {
            SendState::NotifyPeer => {
                self.wire.write_string(READY_TO_SEND).await?;
                Ok(SendState::AwaitReady)
            }
            SendState::AwaitReady => {
                self.wire.expect_token(READY).await?;
                debug!("[Transfer] {} is ready", self.session.peer);
                Ok(if count == 0 {
                    SendState::Finished
                } else {
                    SendState::SendFileHeader(0)
                })
            }
            SendState::SendFileHeader(i) => {
                let file = self.file(i, "SendFileHeader")?;
                let header = FileHeader {
                    name: file.name.clone(),
                    size: file.size,
                    is_last: i + 1 == count,
                };
                header.write_to(self.wire).await?;
                Ok(SendState::SendFileBody(i))
            }
            SendState::SendFileBody(i) => {
                let file = self.file(i, "SendFileBody")?.clone();
                self.send_body(&file).await?;
                Ok(SendState::AwaitAck(i))
            }
            SendState::AwaitAck(i) => {
                let name = self.file(i, "AwaitAck")?.name.clone();
                let token = self.wire.read_string().await?;
                if token != FILE_RECEIVED {
                    warn!(
                        "[Transfer] {} acknowledged {} with {:?}, continuing",
                        self.session.peer, name, token
                    );
                    self.observer.on_error(
                        &format!("{}: unexpected acknowledgment {token:?} for {name}", self.session.peer),
                        true,
                    );
                }
                self.session.advance();
                Ok(if i + 1 < count {
                    SendState::SendFileHeader(i + 1)
                } else {
                    SendState::Finished
                })
            }
            SendState::Finished => Ok(SendState::Finished),
        }
    }

    fn file(&self, index: usize, state: &'static str) -> Result<&VideoFile, ProtocolError> {
        self.session.files.get(index).ok_or(ProtocolError::IndexOutOfRange {
            state,
            index,
            len: self.session.files.len(),
        })
    }

    async fn send_body(&mut self, file: &VideoFile) -> Result<(), LockstepError> {
        let source = File::open(&file.path).await?;
        let mut source = source.take(file.size);
        let mut buf = vec![0u8; self.chunk_size];

        self.report(file);
        while self.session.bytes_done < file.size {
            let n = source.read(&mut buf).await?;
            if n == 0 {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    format!(
                        "{} shrank to {} of {} bytes during transfer",
                        file.path.display(),
                        self.session.bytes_done,
                        file.size
                    ),
                )
                .into());
            }
            self.wire.write_chunk(&buf[..n]).await?;
            self.session.bytes_done += n as u64;
            self.report(file);
        }
        Ok(())
    }

    fn report(&self, file: &VideoFile) {
        self.observer.on_transfer_progress(
            self.session.peer,
            &file.name,
            percent(self.session.bytes_done, file.size),
        );
    }
}

// MARK: - Receiver

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReceiveState {
    AwaitSignal,
    SendReady,
    ReceiveFileHeader,
    ReceiveFileBody(FileHeader),
    SendAck(FileHeader),
    Complete,
}

pub struct FileReceiver<'a, S> {
    wire: &'a mut WireStream<S>,
    dir: &'a Path,
    store: &'a dyn FileStore,
    chunk_size: usize,
    source: PeerId,
    observer: &'a dyn SessionObserver,
    received: Vec<String>,
}

impl<'a, S> FileReceiver<'a, S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    pub fn new(
        wire: &'a mut WireStream<S>,
        dir: &'a Path,
        store: &'a dyn FileStore,
        chunk_size: usize,
        observer: &'a dyn SessionObserver,
    ) -> Self {
        Self {
            wire,
            dir,
            store,
            chunk_size: chunk_size.max(1),
            source: PeerId::MASTER,
            observer,
            received: Vec::new(),
        }
    }

    /// Wait for the batch signal, then receive every file.
    pub async fn run(self) -> Result<Vec<String>, LockstepError> {
        self.run_from(ReceiveState::AwaitSignal).await
    }

    /// Resume from `state`, for callers that already consumed the signal.
    pub async fn run_from(mut self, mut state: ReceiveState) -> Result<Vec<String>, LockstepError> {
        while state != ReceiveState::Complete {
            state = self.step(state).await?;
        }
        Ok(self.received)
    }

    pub async fn step(&mut self, state: ReceiveState) -> Result<ReceiveState, LockstepError> {
        match state {
            ReceiveState::AwaitSignal => {
                self.wire.expect_token(READY_TO_SEND).await?;
                Ok(ReceiveState::SendReady)
            }
            ReceiveState::SendReady => {
                self.wire.write_string(READY).await?;
                Ok(ReceiveState::ReceiveFileHeader)
            }
            ReceiveState::ReceiveFileHeader => {
                let header = FileHeader::read_from(self.wire).await?;
                debug!(
                    "[Transfer] Receiving {} ({} bytes, last: {})",
                    header.name, header.size, header.is_last
                );
                Ok(ReceiveState::ReceiveFileBody(header))
            }
            ReceiveState::ReceiveFileBody(header) => {
                let stored = self.receive_body(&header).await?;
                Ok(ReceiveState::SendAck(FileHeader { name: stored, ..header }))
            }
            ReceiveState::SendAck(header) => {
                self.wire.write_string(FILE_RECEIVED).await?;
                info!("[Transfer] Received {}", header.name);
                let last = header.is_last;
                self.received.push(header.name);
                Ok(if last {
                    ReceiveState::Complete
                } else {
                    ReceiveState::ReceiveFileHeader
                })
            }
            ReceiveState::Complete => Ok(ReceiveState::Complete),
        }
    }

    /// Write one body to disk and return the name it was stored under.
    async fn receive_body(&mut self, header: &FileHeader) -> Result<String, LockstepError> {
        tokio::fs::create_dir_all(self.dir).await?;
        let path = self.store.resolve_write_path(self.dir, &header.name)?;
        let stored = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| header.name.clone());
        let mut sink = File::create(&path).await?;
        let mut buf = vec![0u8; self.chunk_size];
        let mut done = 0u64;

        self.observer
            .on_transfer_progress(self.source, &header.name, percent(0, header.size));
        while done < header.size {
            let want = (header.size - done).min(buf.len() as u64) as usize;
            let n = self.wire.read_chunk(&mut buf[..want]).await?;
            if n == 0 {
                drop(sink);
                if let Err(e) = tokio::fs::remove_file(&path).await {
                    warn!("[Transfer] Could not remove partial {}: {}", path.display(), e);
                }
                return Err(TransportError::ShortRead {
                    expected: header.size,
                    received: done,
                }
                .into());
            }
            sink.write_all(&buf[..n]).await?;
            done += n as u64;
            self.observer
                .on_transfer_progress(self.source, &header.name, percent(done, header.size));
        }
        sink.flush().await?;
        Ok(stored)
    }
}
