pub mod snapshot;
pub mod wal;

pub use snapshot::{IndexSnapshot, SnapshotStore};
pub use wal::{IndexOp, WalReplayResult, WalStore};
