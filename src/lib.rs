//! chainmapper - tallies transaction senders seen on a live blockchain feed
//!
//! The pipeline is three worker threads sharing one shutdown flag:
//! stream ingestor -> handoff queue -> queue consumer -> SQLite store,
//! with a snapshot scheduler reading the store on a timer.

pub mod consumer;
pub mod ingestor;
pub mod models;
pub mod persistence;
pub mod queue;
pub mod settings;
pub mod shutdown;
pub mod snapshot;

pub use models::{AddressRecord, ParseError, SnapshotEntry};
pub use persistence::{AddressStore, SqliteStore};
pub use queue::{GetError, HandoffReceiver, HandoffSender, PutError, handoff_queue};
pub use shutdown::ShutdownFlag;
