//! Fishtrap: a file-backed, multi-process, eventually consistent database
//! for small-to-medium application state.
//!
//! Every cooperating process holds a private in-memory copy of one immutable
//! JSON value, records its local mutations as patch transactions into its own
//! append-only shard file, and reconciles with peers through snapshot
//! compactions arbitrated by lockfiles. Processes coordinate through the
//! filesystem alone; a process observes peer changes only after a compaction
//! or a rebase onto a newer snapshot.
//!
//! ```no_run
//! use fishtrap::{Config, Database, PatchMerge};
//! use serde_json::json;
//!
//! # async fn example() -> fishtrap::Result<()> {
//! let config = Config::new(uuid::Uuid::new_v4(), uuid::Uuid::new_v4());
//! let db = Database::new(config, json!({"counter": 0}), PatchMerge, None).await?;
//!
//! db.update(|doc| {
//!     doc["counter"] = json!(1);
//!     Ok(())
//! })
//! .await?;
//!
//! assert_eq!(db.get().await?["counter"], json!(1));
//! # Ok(())
//! # }
//! ```

mod compact;
mod config;
mod db;
mod merge;
mod scan;
mod state;
mod store;

pub use config::Config;
pub use db::{Database, PostCompactionHook};
pub use merge::{Merge, PatchMerge};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The handle was closed; `open` restores it.
    #[error("database is closed")]
    DatabaseClosed,

    /// A snapshot file is empty.
    #[error("snapshot holds no data")]
    NoData,

    /// A file failed structural validation.
    #[error("invalid data in {path}: {detail}")]
    InvalidData { path: String, detail: String },

    /// Another process already locked the target generation.
    #[error("compaction target generation is already locked")]
    AlreadyLocked,

    /// Another process won the lockfile race for the target generation.
    #[error("lost the compaction lock race")]
    CouldNotLock,

    /// Nothing to compact at the target generation.
    #[error("no shards target the compaction base generation")]
    NoShards,

    #[error("could not write lockfile")]
    CouldNotWriteLockfile(#[source] std::io::Error),

    #[error("failed to write snapshot")]
    FailedToWriteSnapshot(#[source] std::io::Error),

    /// The user-supplied three-way merger reported an error.
    #[error("merger failed")]
    MergerFailed(#[source] anyhow::Error),

    /// The compaction base snapshot vanished or became locked mid-flight.
    #[error("base snapshot lost or locked")]
    LastSnapshotLostOrLocked,

    /// The compaction base snapshot failed to load.
    #[error("base snapshot damaged")]
    LastSnapshotDamaged,

    /// The 32-bit transaction sequence space ran out at this generation.
    #[error("transaction sequence space exhausted")]
    SequenceExhausted,

    /// The user-supplied updater reported an error; state is unchanged.
    #[error("updater failed")]
    Updater(#[source] anyhow::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Block(#[from] sdblock::Error),
}

impl Error {
    fn invalid(path: impl Into<String>, detail: impl Into<String>) -> Self {
        Error::InvalidData {
            path: path.into(),
            detail: detail.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
