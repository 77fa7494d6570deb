//! Compaction: merge every shard targeting the latest generation into a new
//! snapshot, arbitrated through lockfiles.
//!
//! The coordinator moves Idle → Locked → Published. Any abort after the
//! lockfile was written deletes it on the way out; a lockfile whose write
//! failed is left to age out through the stale check.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde_json::Value;
use uuid::Uuid;

use crate::scan::scan_directory;
use crate::state::Core;
use crate::store::{self, Snapshot};
use crate::{Error, Result};

pub(crate) async fn compact(core: &mut Core) -> Result<()> {
    let cfg = core.cfg.clone();

    // Precheck: the target generation must be unlocked, and its base
    // snapshot present and unlocked.
    let listing = scan_directory(&cfg, false).await?;
    if listing.next_generation_locked_by.is_some() {
        return Err(Error::AlreadyLocked);
    }
    let next = listing.next_generation;
    if next > 1 {
        match listing.snapshot_at(next - 1) {
            Some(base) if base.locked_by.is_none() => {}
            _ => return Err(Error::AlreadyLocked),
        }
    }

    store::write_lockfile(&cfg, next)
        .await
        .map_err(Error::CouldNotWriteLockfile)?;

    match merge_and_publish(core, next).await {
        Ok(()) => Ok(()),
        Err(err) => {
            store::delete_lockfile(&cfg, next).await;
            Err(err)
        }
    }
}

async fn merge_and_publish(core: &mut Core, next: u32) -> Result<()> {
    let cfg = core.cfg.clone();

    // Rescan: if our lockfile is no longer the earliest at the target
    // generation, another process beat us to it and we back off.
    let listing = scan_directory(&cfg, false).await?;
    match listing.locks.iter().find(|l| l.generation == next) {
        Some(winner) if winner.uuid == cfg.shard_uuid => {}
        _ => return Err(Error::CouldNotLock),
    }

    let base = if next == 1 {
        Snapshot::initial(core.initial.clone())
    } else {
        let Some(desc) = listing.snapshot_at(next - 1) else {
            return Err(Error::LastSnapshotLostOrLocked);
        };
        if desc.locked_by.is_some() {
            return Err(Error::LastSnapshotLostOrLocked);
        }
        match store::read_snapshot(&cfg, desc).await {
            Ok(snapshot) => snapshot,
            Err(err) => {
                tracing::warn!(%err, name = %desc.name, "compaction base snapshot is damaged");
                store::remove_quietly(&store::path_of(&cfg, &desc.name)).await;
                return Err(Error::LastSnapshotDamaged);
            }
        }
    };

    let shards: Vec<_> = listing
        .shards
        .iter()
        .filter(|s| s.size > 0 && s.generation == next - 1)
        .collect();
    if shards.is_empty() {
        return Err(Error::NoShards);
    }

    // Fold every readable shard's view into the merge, recording the highest
    // incorporated sequence per shard. Unreadable shards are skipped; their
    // owners will reconcile through the slow rebase path.
    let mut merged: Option<Value> = None;
    let mut ancestors: BTreeMap<Uuid, u32> = BTreeMap::new();
    for desc in shards {
        let own = desc.uuid == cfg.shard_uuid;
        let Some((view, final_seq)) = shard_view(core, desc, &base, own).await else {
            continue;
        };
        merged = Some(match merged {
            None => view,
            Some(mut target) => {
                core.merger
                    .merge(&mut target, &view, &base.data)
                    .map_err(Error::MergerFailed)?;
                target
            }
        });
        ancestors.insert(desc.uuid, final_seq);
    }
    let Some(merged) = merged else {
        return Err(Error::NoShards);
    };

    store::write_snapshot(&cfg, next, &merged, &ancestors).await?;
    store::delete_lockfile(&cfg, next).await;
    tracing::debug!(generation = next, shards = ancestors.len(), "published snapshot");

    if let Some(hook) = &core.hook {
        let hook = hook.clone();
        let merged = Arc::new(merged);
        let base_data = base.data.clone();
        tokio::spawn(async move { hook(merged, base_data) });
    }

    // We just consumed our own shard; move onto the snapshot we published.
    if core.generation == base.generation {
        if let Err(err) = core.check_rebase().await {
            tracing::warn!(%err, "rebase onto own compaction failed");
        }
    }
    Ok(())
}

/// Replay one shard over the base snapshot. Returns the shard's view of the
/// data and its final sequence, or `None` when the shard is unreadable or
/// holds no applicable transactions.
async fn shard_view(
    core: &Core,
    desc: &crate::scan::FileDesc,
    base: &Snapshot,
    own: bool,
) -> Option<(Value, u32)> {
    let read = match store::read_shard(&core.cfg, desc, own).await {
        Ok(read) => read,
        Err(err) => {
            tracing::warn!(%err, name = %desc.name, "skipping unreadable shard");
            return None;
        }
    };

    let mut view = (*base.data).clone();
    let mut final_seq = None;
    for txn in &read.txns {
        if let Err(err) = json_patch::patch(&mut view, &txn.patch) {
            tracing::warn!(%err, name = %desc.name, seq = txn.seq, "skipping shard with inapplicable transaction");
            return None;
        }
        final_seq = Some(txn.seq);
    }
    final_seq.map(|seq| (view, seq))
}
