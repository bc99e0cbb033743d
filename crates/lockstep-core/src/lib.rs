pub mod clock;
pub mod config;
pub mod errors;
pub mod events;
pub mod store;
pub mod types;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{RetryPolicy, SessionConfig};
pub use errors::{DiscoveryError, LockstepError, ProtocolError, TransportError};
pub use events::{NullObserver, SessionEvent, SessionObserver};
pub use store::{FileStore, LocalFileStore};
pub use types::*;
