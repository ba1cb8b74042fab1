//! Data shared by the block builder, the replicated log, and the
//! leadership manager.

mod codec;
mod head;
pub mod log;
mod state;

pub use codec::{CodecError, decode_payload, encode_payload};
pub use head::ExecutionHead;
pub use log::{EntryId, LogEntry, MalformedEntry};
pub use state::{BuildState, BuildStep};

/// Milliseconds since the unix epoch.
///
/// Saturates at zero for times before the epoch.
pub fn unix_millis(time: std::time::SystemTime) -> u64 {
    time.duration_since(std::time::UNIX_EPOCH)
        .map_or(0, |since| u64::try_from(since.as_millis()).unwrap_or(u64::MAX))
}
