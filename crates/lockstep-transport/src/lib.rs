pub mod batch;
pub mod codec;
pub mod master;
pub mod position;
pub mod registry;
pub mod retry;
pub mod slave;
pub mod sync;
pub mod transfer;

pub use batch::{BatchGate, BatchTicket};
pub use codec::WireStream;
pub use master::{MasterServer, PeerCommand};
pub use registry::{spawn_liveness_monitor, ConnectionRegistry, LivenessProbe, TcpProbe};
pub use retry::{connect_with_retry, retry};
pub use slave::SlaveClient;
pub use sync::{ScheduleReceiver, ScheduleSender, SyncState};
pub use transfer::{FileHeader, FileReceiver, FileSender, ReceiveState, SendState, TransferSession};

/// Control tokens exchanged as wire strings.
pub mod token {
    /// Master → slave: a batch is about to start.
    pub const READY_TO_SEND: &str = "READY_TO_SEND";
    /// Slave → master: go ahead.
    pub const READY: &str = "READY";
    /// Slave → master: one file body fully written.
    pub const FILE_RECEIVED: &str = "FILE_RECEIVED";
    /// Slave → master: schedule stored.
    pub const TIMESTAMP_RECEIVED: &str = "TIMESTAMP_RECEIVED";
    /// Master → slave: a position sample follows.
    pub const POSITION_UPDATE: &str = "POSITION_UPDATE";
}
