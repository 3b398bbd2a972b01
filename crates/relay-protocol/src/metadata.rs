use serde::{Deserialize, Serialize};

/// Metadata announcing a new file transfer, carried as UTF-8 JSON in a META
/// frame (§3). `seq` is assigned by the sender, monotonic per session
/// starting at 0.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FileMetadata {
    pub seq: u32,
    pub name: String,
    pub mime: String,
    pub size: u64,
    /// Milliseconds since epoch.
    pub mtime: i64,
    /// Milliseconds since epoch, captured when the sender pipeline started.
    pub origin_ts: i64,
}
