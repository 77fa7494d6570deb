//! Snapshot, shard and lockfile I/O over the base directory.
//!
//! All three file kinds wrap block-framed MessagePack records. Snapshots and
//! lockfiles hold exactly one block and are written whole-file; shards hold
//! many and are append-only for their owning process.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use json_patch::Patch;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

use crate::scan::{file_name, FileDesc, FileKind};
use crate::{Config, Error, Result};

/// Files larger than this are rejected outright.
pub(crate) const MAX_FILE_BYTES: u64 = 100 * 1024 * 1024;

pub(crate) const TAG_SNAPSHOT: &str = "snp";
pub(crate) const TAG_TXN: &str = "txn";
pub(crate) const TAG_LOCK: &str = "lck";

const QUARANTINE_PROBE_LIMIT: u32 = 256;

#[derive(Debug, Deserialize)]
pub(crate) struct SnapshotRecord {
    pub typ: String,
    pub aid: Uuid,
    pub gen: u32,
    pub dat: Value,
    pub anc: BTreeMap<Uuid, u32>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct TxnRecord {
    pub typ: String,
    pub aid: Uuid,
    pub sid: Uuid,
    pub gen: u32,
    pub seq: u32,
    pub dat: Patch,
}

#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct LockRecord {
    pub typ: String,
    pub aid: Uuid,
    pub sid: Uuid,
    pub gen: u32,
}

// Write-side twins of the records above, borrowing their payloads.
#[derive(Serialize)]
struct SnapshotRecordRef<'a> {
    typ: &'static str,
    aid: Uuid,
    gen: u32,
    dat: &'a Value,
    anc: &'a BTreeMap<Uuid, u32>,
}

#[derive(Serialize)]
struct TxnRecordRef<'a> {
    typ: &'static str,
    aid: Uuid,
    sid: Uuid,
    gen: u32,
    seq: u32,
    dat: &'a Patch,
}

/// A loaded snapshot. Generation 0 with empty ancestors is the implicit
/// initial snapshot and never exists on disk.
#[derive(Debug, Clone)]
pub(crate) struct Snapshot {
    pub generation: u32,
    pub data: Arc<Value>,
    /// Highest sequence per shard incorporated into this snapshot.
    pub ancestors: BTreeMap<Uuid, u32>,
}

impl Snapshot {
    pub fn initial(data: Arc<Value>) -> Self {
        Self {
            generation: 0,
            data,
            ancestors: BTreeMap::new(),
        }
    }

    pub fn ancestor_of(&self, shard_uuid: &Uuid) -> u32 {
        self.ancestors.get(shard_uuid).copied().unwrap_or(0)
    }
}

#[derive(Debug)]
pub(crate) struct Txn {
    pub seq: u32,
    pub patch: Patch,
}

/// Transactions read from one shard, plus the shard's size after any repair.
#[derive(Debug)]
pub(crate) struct ShardRead {
    pub txns: Vec<Txn>,
    pub size: u64,
}

pub(crate) fn path_of(cfg: &Config, name: &str) -> PathBuf {
    cfg.base_directory.join(name)
}

pub(crate) async fn read_snapshot(cfg: &Config, desc: &FileDesc) -> Result<Snapshot> {
    if desc.size == 0 {
        return Err(Error::NoData);
    }
    if desc.size > MAX_FILE_BYTES {
        return Err(Error::invalid(desc.name.as_str(), "exceeds the file size bound"));
    }

    let bytes = tokio::fs::read(path_of(cfg, &desc.name)).await?;
    let Some(rec) = sdblock::scan_block::<SnapshotRecord>(&bytes, 0).data else {
        return Err(Error::invalid(desc.name.as_str(), "no decodable snapshot block"));
    };
    if rec.typ != TAG_SNAPSHOT || rec.aid != cfg.app_uuid || rec.gen != desc.generation {
        return Err(Error::invalid(desc.name.as_str(), "snapshot tags disagree"));
    }
    Ok(Snapshot {
        generation: rec.gen,
        data: Arc::new(rec.dat),
        ancestors: rec.anc,
    })
}

pub(crate) async fn write_snapshot(
    cfg: &Config,
    generation: u32,
    data: &Value,
    ancestors: &BTreeMap<Uuid, u32>,
) -> Result<()> {
    let block = sdblock::write_block(&SnapshotRecordRef {
        typ: TAG_SNAPSHOT,
        aid: cfg.app_uuid,
        gen: generation,
        dat: data,
        anc: ancestors,
    })?;
    let name = file_name(&cfg.app_uuid, generation, FileKind::Snapshot);
    tokio::fs::write(path_of(cfg, &name), &block)
        .await
        .map_err(Error::FailedToWriteSnapshot)
}

/// Read a shard's transactions, sorted by sequence.
///
/// Reading stops at the first truncated, undecodable or mismatched block.
/// When the shard is this process's `own`, the damaged tail is trimmed at the
/// last good offset via write-temp-and-rename; peer shards are left alone.
pub(crate) async fn read_shard(cfg: &Config, desc: &FileDesc, own: bool) -> Result<ShardRead> {
    if desc.size > MAX_FILE_BYTES {
        return Err(Error::invalid(desc.name.as_str(), "exceeds the file size bound"));
    }

    let path = path_of(cfg, &desc.name);
    let bytes = tokio::fs::read(&path).await?;
    let mut txns = Vec::new();
    let mut good_end = 0usize;

    let mut pos = 0usize;
    while pos < bytes.len() {
        let out = sdblock::scan_block::<TxnRecord>(&bytes, pos);
        let Some(rec) = out.data else {
            break;
        };
        if rec.typ != TAG_TXN
            || rec.aid != cfg.app_uuid
            || rec.sid != desc.uuid
            || rec.gen != desc.generation
        {
            tracing::warn!(name = %desc.name, "stopping at transaction with mismatched tags");
            break;
        }
        txns.push(Txn {
            seq: rec.seq,
            patch: rec.dat,
        });
        pos = out.offset + out.length;
        good_end = pos;
    }

    let mut size = bytes.len() as u64;
    if good_end < bytes.len() {
        if own {
            tracing::warn!(
                name = %desc.name,
                good_end,
                total = bytes.len(),
                "truncating damaged tail of own shard"
            );
            match truncate_via_rename(&path, &bytes[..good_end]).await {
                Ok(()) => size = good_end as u64,
                Err(err) => tracing::warn!(%err, name = %desc.name, "failed to trim shard tail"),
            }
        } else {
            tracing::debug!(name = %desc.name, "ignoring damaged tail of peer shard");
        }
    }

    txns.sort_by_key(|t| t.seq);
    Ok(ShardRead { txns, size })
}

async fn truncate_via_rename(path: &Path, keep: &[u8]) -> std::io::Result<()> {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);
    tokio::fs::write(&tmp, keep).await?;
    tokio::fs::rename(&tmp, path).await
}

/// Append one transaction block to this process's shard at `generation`,
/// returning the number of bytes written.
pub(crate) async fn append_txn(
    cfg: &Config,
    generation: u32,
    seq: u32,
    patch: &Patch,
) -> Result<u64> {
    let block = sdblock::write_block(&TxnRecordRef {
        typ: TAG_TXN,
        aid: cfg.app_uuid,
        sid: cfg.shard_uuid,
        gen: generation,
        seq,
        dat: patch,
    })?;
    let name = file_name(&cfg.shard_uuid, generation, FileKind::Shard);
    let mut file = tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path_of(cfg, &name))
        .await?;
    file.write_all(&block).await?;
    file.flush().await?;
    Ok(block.len() as u64)
}

pub(crate) async fn write_lockfile(cfg: &Config, generation: u32) -> std::io::Result<()> {
    let block = sdblock::write_block(&LockRecord {
        typ: TAG_LOCK.to_owned(),
        aid: cfg.app_uuid,
        sid: cfg.shard_uuid,
        gen: generation,
    })
    .map_err(|err| std::io::Error::new(std::io::ErrorKind::InvalidData, err))?;
    let name = file_name(&cfg.shard_uuid, generation, FileKind::Lock);
    tokio::fs::write(path_of(cfg, &name), &block).await
}

pub(crate) async fn delete_lockfile(cfg: &Config, generation: u32) {
    let name = file_name(&cfg.shard_uuid, generation, FileKind::Lock);
    remove_quietly(&path_of(cfg, &name)).await;
}

/// Best-effort unlink; cleanup failures are logged, never surfaced.
pub(crate) async fn remove_quietly(path: &Path) {
    if let Err(err) = tokio::fs::remove_file(path).await {
        tracing::debug!(%err, path = %path.display(), "failed to remove file");
    }
}

/// Move a broken file out of the protocol's namespace by renaming it to
/// `<name>.<hex8>.sdbf`. The suffix space is probed linearly, stopping at
/// the first rename that succeeds; no stat is interposed.
pub(crate) async fn quarantine(cfg: &Config, name: &str) {
    let from = path_of(cfg, name);
    let mut last_err = None;
    for probe in 0..QUARANTINE_PROBE_LIMIT {
        let to = path_of(cfg, &format!("{name}.{probe:08x}.sdbf"));
        match tokio::fs::rename(&from, &to).await {
            Ok(()) => {
                tracing::warn!(name, to = %to.display(), "quarantined broken file");
                return;
            }
            Err(err) => last_err = Some(err),
        }
    }
    if let Some(err) = last_err {
        tracing::warn!(%err, name, "failed to quarantine broken file");
    }
}
