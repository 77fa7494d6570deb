//! In-memory database state: the transaction engine, the open procedure,
//! and the rebase engine.

use std::sync::Arc;

use serde_json::Value;
use tokio::sync::Notify;

use crate::merge::Merge;
use crate::scan::{self, file_name, FileDesc, FileKind, Listing};
use crate::store::{self, Snapshot};
use crate::{Config, Error, Result};

pub(crate) type Updater = Box<dyn FnOnce(&mut Value) -> anyhow::Result<()> + Send>;
pub(crate) type HookFn = dyn Fn(Arc<Value>, Arc<Value>) + Send + Sync;

/// One process's view of the database.
///
/// Owned by the instance's actor task; all mutation passes through it in
/// queue order. `data` is the current immutable value, `sequence` the highest
/// transaction sequence this process has committed at `generation`, and
/// `shard_size` the on-disk size of the own shard targeting `generation`.
pub(crate) struct Core {
    pub cfg: Arc<Config>,
    pub initial: Arc<Value>,
    pub merger: Arc<dyn Merge>,
    pub hook: Option<Arc<HookFn>>,
    /// Signalled when the shard outgrows the compaction size threshold.
    pub compact_soon: Arc<Notify>,

    pub generation: u32,
    pub sequence: u32,
    pub data: Arc<Value>,
    pub shard_size: u64,
}

impl Core {
    /// Run the open procedure: load the latest usable snapshot, replay or
    /// reconcile the own shard, and arrive at a consistent in-memory state.
    pub async fn open(
        cfg: Arc<Config>,
        initial: Arc<Value>,
        merger: Arc<dyn Merge>,
        hook: Option<Arc<HookFn>>,
        compact_soon: Arc<Notify>,
    ) -> Result<Core> {
        let listing = scan::scan_directory(&cfg, true).await?;

        // Latest unlocked snapshot that actually loads; damaged ones are
        // skipped in favor of older generations.
        let mut last = None;
        for desc in listing.snapshots.iter().rev() {
            if desc.locked_by.is_some() {
                continue;
            }
            match store::read_snapshot(&cfg, desc).await {
                Ok(snapshot) => {
                    last = Some(snapshot);
                    break;
                }
                Err(err) => {
                    tracing::warn!(%err, name = %desc.name, "skipping damaged snapshot")
                }
            }
        }
        let last = last.unwrap_or_else(|| Snapshot::initial(initial.clone()));

        let mut core = Core {
            generation: last.generation,
            sequence: last.ancestor_of(&cfg.shard_uuid),
            data: last.data.clone(),
            shard_size: 0,
            cfg,
            initial,
            merger,
            hook,
            compact_soon,
        };

        // The scan was own-shards-only, so any shard here is ours.
        let Some(shard) = listing.shards.last().cloned() else {
            return Ok(core);
        };

        if shard.generation == last.generation {
            core.replay_own_shard(&shard, &last).await?;
            return Ok(core);
        }

        // The shard targets an older generation. Rebuild the state it was
        // written against, then rebase onto the newer snapshot. Without its
        // base snapshot the shard cannot be interpreted: quarantine it and
        // stay on the freshest snapshot we have.
        let base = match listing.snapshots.iter().find(|s| {
            s.generation == shard.generation && s.locked_by.is_none()
        }) {
            Some(desc) => match store::read_snapshot(&core.cfg, desc).await {
                Ok(snapshot) => Some(snapshot),
                Err(err) => {
                    tracing::warn!(%err, name = %desc.name, "shard's base snapshot is damaged");
                    None
                }
            },
            None if shard.generation == 0 => Some(Snapshot::initial(core.initial.clone())),
            None => None,
        };
        let Some(base) = base else {
            store::quarantine(&core.cfg, &shard.name).await;
            return Ok(core);
        };

        core.generation = base.generation;
        core.sequence = base.ancestor_of(&core.cfg.shard_uuid);
        core.data = base.data.clone();
        core.replay_own_shard(&shard, &base).await?;

        if let Err(err) = core.check_rebase().await {
            tracing::warn!(%err, "rebase on open failed; staying at shard generation");
        }
        Ok(core)
    }

    pub fn data(&self) -> Arc<Value> {
        self.data.clone()
    }

    /// Apply a local mutation: run the updater over a working copy, extract
    /// the structural delta, persist it as a transaction, then adopt the new
    /// value. A no-op updater writes nothing.
    pub async fn update(&mut self, updater: Updater) -> Result<Arc<Value>> {
        let mut next = (*self.data).clone();
        updater(&mut next).map_err(Error::Updater)?;

        let patch = json_patch::diff(&self.data, &next);
        if patch.0.is_empty() {
            return Ok(self.data.clone());
        }

        let seq = self
            .sequence
            .checked_add(1)
            .ok_or(Error::SequenceExhausted)?;
        let written = store::append_txn(&self.cfg, self.generation, seq, &patch).await?;

        self.sequence = seq;
        self.data = Arc::new(next);
        self.shard_size += written;
        if self.shard_size >= self.cfg.size_threshold() {
            self.compact_soon.notify_one();
        }
        Ok(self.data.clone())
    }

    /// Replay the own shard over its base snapshot. Patch application stops
    /// at the first transaction that no longer applies; everything before it
    /// is kept.
    async fn replay_own_shard(&mut self, shard: &FileDesc, base: &Snapshot) -> Result<()> {
        let read = store::read_shard(&self.cfg, shard, true).await?;
        let mut data = (*base.data).clone();
        for txn in &read.txns {
            if let Err(err) = json_patch::patch(&mut data, &txn.patch) {
                tracing::warn!(%err, seq = txn.seq, name = %shard.name, "transaction no longer applies");
                break;
            }
            self.sequence = txn.seq;
        }
        self.data = Arc::new(data);
        self.shard_size = read.size;
        Ok(())
    }

    /// Look for a newer unlocked snapshot and rebase onto it.
    pub async fn check_rebase(&mut self) -> Result<()> {
        let listing = scan::scan_directory(&self.cfg, false).await?;
        let Some(latest) = listing
            .snapshots
            .iter()
            .rev()
            .find(|s| s.locked_by.is_none())
        else {
            return Ok(());
        };
        if latest.generation <= self.generation {
            return Ok(());
        }

        let snapshot = match store::read_snapshot(&self.cfg, latest).await {
            Ok(snapshot) => snapshot,
            Err(err) => {
                tracing::warn!(%err, name = %latest.name, "newer snapshot failed to load");
                return Ok(());
            }
        };
        self.rebase(&listing, snapshot).await
    }

    /// Migrate local state onto `new`, a loaded snapshot at a later
    /// generation than our own.
    async fn rebase(&mut self, listing: &Listing, new: Snapshot) -> Result<()> {
        let old_generation = self.generation;
        let own_shard = file_name(&self.cfg.shard_uuid, old_generation, FileKind::Shard);

        // Fast path: the snapshot's ancestor witness proves every one of our
        // transactions is already incorporated. Adopt it verbatim.
        if new.generation == old_generation + 1
            && new.ancestor_of(&self.cfg.shard_uuid) == self.sequence
        {
            tracing::debug!(
                from = old_generation,
                to = new.generation,
                "rebase fast path: all local transactions subsumed"
            );
            self.generation = new.generation;
            self.data = new.data.clone();
            self.shard_size = 0;
            store::remove_quietly(&store::path_of(&self.cfg, &own_shard)).await;
            self.collect_garbage().await;
            return Ok(());
        }

        // Slow path: three-way merge against the common ancestor.
        let base = if old_generation == 0 {
            Snapshot::initial(self.initial.clone())
        } else {
            let Some(desc) = listing.snapshot_at(old_generation) else {
                tracing::warn!(
                    generation = old_generation,
                    "cannot rebase without the common ancestor snapshot"
                );
                return Ok(());
            };
            if desc.locked_by.is_some() {
                tracing::info!(generation = old_generation, "ancestor snapshot is locked; deferring rebase");
                return Ok(());
            }
            match store::read_snapshot(&self.cfg, desc).await {
                Ok(snapshot) => snapshot,
                Err(err) => {
                    tracing::warn!(%err, name = %desc.name, "ancestor snapshot is damaged; deferring rebase");
                    return Ok(());
                }
            }
        };

        let mut merged = (*self.data).clone();
        self.merger
            .merge(&mut merged, &new.data, &base.data)
            .map_err(Error::MergerFailed)?;

        // Our sequence numbering restarts from whatever of ours the new
        // snapshot already witnessed; a nonempty residue becomes our first
        // transaction at the new generation.
        let ancestor_seq = new.ancestor_of(&self.cfg.shard_uuid);
        let residue = json_patch::diff(&new.data, &merged);
        if residue.0.is_empty() {
            self.generation = new.generation;
            self.sequence = ancestor_seq;
            self.data = new.data.clone();
            self.shard_size = 0;
        } else {
            let seq = ancestor_seq.checked_add(1).ok_or(Error::SequenceExhausted)?;
            let written = store::append_txn(&self.cfg, new.generation, seq, &residue).await?;
            self.generation = new.generation;
            self.sequence = seq;
            self.data = Arc::new(merged);
            self.shard_size = written;
        }
        tracing::debug!(
            from = old_generation,
            to = self.generation,
            carried = self.shard_size > 0,
            "rebase slow path complete"
        );

        store::remove_quietly(&store::path_of(&self.cfg, &own_shard)).await;
        self.collect_garbage().await;
        Ok(())
    }

    /// Unlink snapshots no shard targets anymore. Best-effort.
    pub async fn collect_garbage(&self) {
        let listing = match scan::scan_directory(&self.cfg, false).await {
            Ok(listing) => listing,
            Err(err) => {
                tracing::debug!(%err, "skipping snapshot garbage collection");
                return;
            }
        };
        for snapshot in &listing.snapshots {
            if snapshot.generation < self.generation
                && snapshot.locked_by.is_none()
                && !listing.any_shard_targets(snapshot.generation)
            {
                tracing::debug!(name = %snapshot.name, "collecting unreferenced snapshot");
                store::remove_quietly(&store::path_of(&self.cfg, &snapshot.name)).await;
            }
        }
    }
}
