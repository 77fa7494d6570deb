//! Directory discovery: filename grammar, classification, lock arbitration.

use std::time::{Duration, SystemTime};

use lazy_static::lazy_static;
use regex::Regex;
use uuid::Uuid;

use crate::store::{self, LockRecord, TAG_LOCK};
use crate::{Config, Result};

/// Lockfiles older than this are reclaimed as stale.
pub(crate) const STALE_LOCK_AGE: Duration = Duration::from_secs(2 * 60 * 60);

/// A lockfile smaller than a complete block may still be mid-write; give it
/// the benefit of the doubt.
const LOCK_VERIFY_MIN_BYTES: u64 = 48;

/// Lock verification decodes at most this prefix of the file.
const LOCK_VERIFY_READ_BYTES: usize = 1024;

lazy_static! {
    static ref FILE_NAME_RE: Regex = Regex::new(
        r"(?i)^([0-9a-f]{8}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{12})\.([0-9a-f]{8})\.sd(sn|sh|lk)$"
    )
    .unwrap();
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FileKind {
    Snapshot,
    Shard,
    Lock,
}

impl FileKind {
    fn suffix(&self) -> &'static str {
        match self {
            FileKind::Snapshot => "sn",
            FileKind::Shard => "sh",
            FileKind::Lock => "lk",
        }
    }
}

/// A classified directory entry.
#[derive(Debug, Clone)]
pub(crate) struct FileDesc {
    pub name: String,
    pub size: u64,
    pub mtime: SystemTime,
    /// Owning shard for shards and locks, the database for snapshots.
    pub uuid: Uuid,
    pub generation: u32,
    /// For snapshots: owner of the earliest lockfile at the same generation.
    pub locked_by: Option<Uuid>,
}

/// Snapshot of the directory state, classified and sorted.
#[derive(Debug, Default)]
pub(crate) struct Listing {
    /// Sorted by generation ascending.
    pub snapshots: Vec<FileDesc>,
    /// Sorted by generation ascending.
    pub shards: Vec<FileDesc>,
    /// Sorted by mtime ascending; listing order breaks ties.
    pub locks: Vec<FileDesc>,
    /// One past the highest snapshot generation (1 when none exist).
    pub next_generation: u32,
    /// Owner of the earliest lockfile at `next_generation`, if any.
    pub next_generation_locked_by: Option<Uuid>,
}

impl Listing {
    pub fn snapshot_at(&self, generation: u32) -> Option<&FileDesc> {
        self.snapshots.iter().find(|s| s.generation == generation)
    }

    pub fn any_shard_targets(&self, generation: u32) -> bool {
        self.shards.iter().any(|s| s.generation == generation)
    }
}

/// Parse a directory entry name per the `<uuid>.<gen-hex8>.sd(sn|sh|lk)`
/// grammar. Anything else is ignored by the scanner.
pub(crate) fn parse_name(name: &str) -> Option<(Uuid, u32, FileKind)> {
    let caps = FILE_NAME_RE.captures(name)?;
    let uuid = Uuid::parse_str(&caps[1]).ok()?;
    let generation = u32::from_str_radix(&caps[2], 16).ok()?;
    let kind = match caps[3].to_ascii_lowercase().as_str() {
        "sn" => FileKind::Snapshot,
        "sh" => FileKind::Shard,
        _ => FileKind::Lock,
    };
    Some((uuid, generation, kind))
}

pub(crate) fn file_name(uuid: &Uuid, generation: u32, kind: FileKind) -> String {
    format!("{}.{:08x}.sd{}", uuid, generation, kind.suffix())
}

/// Scan the base directory and classify its entries.
///
/// With `own_shards_only`, only this process's shards are kept, and the pass
/// also performs the owner's janitorial duties: leftover own lockfiles and
/// empty own shards are unlinked. Stale lockfiles are reclaimed on every
/// pass. Entries that vanish or fail to stat mid-scan are skipped.
pub(crate) async fn scan_directory(cfg: &Config, own_shards_only: bool) -> Result<Listing> {
    let now = SystemTime::now();
    let mut listing = Listing::default();

    let mut entries = tokio::fs::read_dir(&cfg.base_directory).await?;
    loop {
        let entry = match entries.next_entry().await {
            Ok(Some(entry)) => entry,
            Ok(None) => break,
            Err(err) => {
                tracing::debug!(%err, "directory listing ended early");
                break;
            }
        };
        let name = match entry.file_name().into_string() {
            Ok(name) => name,
            Err(_) => continue,
        };
        let Some((uuid, generation, kind)) = parse_name(&name) else {
            continue;
        };
        let meta = match entry.metadata().await {
            Ok(meta) if meta.is_file() => meta,
            _ => continue,
        };
        let desc = FileDesc {
            size: meta.len(),
            mtime: meta.modified().unwrap_or(now),
            name,
            uuid,
            generation,
            locked_by: None,
        };

        match kind {
            FileKind::Lock => {
                let age = now.duration_since(desc.mtime).unwrap_or_default();
                if (own_shards_only && uuid == cfg.shard_uuid) || age > STALE_LOCK_AGE {
                    tracing::debug!(name = %desc.name, "unlinking stale lockfile");
                    store::remove_quietly(&store::path_of(cfg, &desc.name)).await;
                    continue;
                }
                if desc.size >= LOCK_VERIFY_MIN_BYTES && !verify_lock(cfg, &desc).await {
                    continue;
                }
                listing.locks.push(desc);
            }
            FileKind::Snapshot => {
                if uuid == cfg.app_uuid {
                    listing.snapshots.push(desc);
                }
            }
            FileKind::Shard => {
                if desc.size == 0 {
                    if own_shards_only && uuid == cfg.shard_uuid {
                        tracing::debug!(name = %desc.name, "unlinking empty shard");
                        store::remove_quietly(&store::path_of(cfg, &desc.name)).await;
                    }
                    continue;
                }
                if !own_shards_only || uuid == cfg.shard_uuid {
                    listing.shards.push(desc);
                }
            }
        }
    }

    listing.locks.sort_by_key(|l| l.mtime);
    listing.snapshots.sort_by_key(|s| s.generation);
    listing.shards.sort_by_key(|s| s.generation);

    for snapshot in listing.snapshots.iter_mut() {
        snapshot.locked_by = listing
            .locks
            .iter()
            .find(|l| l.generation == snapshot.generation)
            .map(|l| l.uuid);
    }
    listing.next_generation = listing
        .snapshots
        .last()
        .map(|s| s.generation + 1)
        .unwrap_or(1);
    listing.next_generation_locked_by = listing
        .locks
        .iter()
        .find(|l| l.generation == listing.next_generation)
        .map(|l| l.uuid);

    Ok(listing)
}

/// Check that a lockfile's payload matches its filename.
async fn verify_lock(cfg: &Config, desc: &FileDesc) -> bool {
    use tokio::io::AsyncReadExt;

    let mut head = Vec::with_capacity(LOCK_VERIFY_READ_BYTES);
    let opened = tokio::fs::File::open(store::path_of(cfg, &desc.name)).await;
    let read = match opened {
        Ok(file) => {
            file.take(LOCK_VERIFY_READ_BYTES as u64)
                .read_to_end(&mut head)
                .await
        }
        // Vanished mid-scan; its owner is done with it.
        Err(_) => return false,
    };
    if read.is_err() {
        return false;
    }
    match sdblock::scan_block::<LockRecord>(&head, 0).data {
        Some(rec)
            if rec.typ == TAG_LOCK
                && rec.aid == cfg.app_uuid
                && rec.sid == desc.uuid
                && rec.gen == desc.generation =>
        {
            true
        }
        _ => {
            tracing::debug!(name = %desc.name, "ignoring lockfile with mismatched payload");
            false
        }
    }
}
