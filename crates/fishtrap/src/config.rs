use std::path::PathBuf;
use uuid::Uuid;

/// Shard size past which an early compaction is scheduled.
pub(crate) const DEFAULT_SIZE_THRESHOLD: u64 = 0x10000;

/// Upper clamp for the size threshold, just under the file size bound.
pub(crate) const MAX_SIZE_THRESHOLD: u64 = 0x630_0000;

/// Database configuration.
///
/// `app_uuid` identifies the logical database and is shared by every
/// cooperating process; `shard_uuid` identifies this process's private
/// append-only shard and must be unique per process.
#[derive(Debug, Clone)]
pub struct Config {
    pub app_uuid: Uuid,
    pub shard_uuid: Uuid,
    /// Directory holding snapshot, shard and lock files.
    pub base_directory: PathBuf,
    /// Shard-size bytes past which compaction is eagerly scheduled.
    pub compaction_size_threshold: u64,
    /// Periodic compaction cadence; 0 disables the timer.
    pub compaction_interval_minutes: u64,
    /// Periodic rebase-check cadence; 0 disables the timer.
    pub check_interval_minutes: u64,
}

impl Config {
    pub fn new(app_uuid: Uuid, shard_uuid: Uuid) -> Self {
        Self {
            app_uuid,
            shard_uuid,
            base_directory: PathBuf::new(),
            compaction_size_threshold: DEFAULT_SIZE_THRESHOLD,
            compaction_interval_minutes: 30,
            check_interval_minutes: 15,
        }
    }

    pub(crate) fn size_threshold(&self) -> u64 {
        self.compaction_size_threshold.min(MAX_SIZE_THRESHOLD)
    }
}
