//! The user-facing three-way merge seam.

use serde_json::Value;

/// Three-way merge over the user value.
///
/// `base` is the common ancestor, `other` a peer's descendant of it, and
/// `target` the working copy being merged into. An implementation computes
/// what `other` changed relative to `base` and applies those changes to
/// `target`. It runs inside the mutation pipeline, so whatever it produces
/// is recorded like any local change.
pub trait Merge: Send + Sync + 'static {
    fn merge(&self, target: &mut Value, other: &Value, base: &Value) -> anyhow::Result<()>;
}

impl<F> Merge for F
where
    F: Fn(&mut Value, &Value, &Value) -> anyhow::Result<()> + Send + Sync + 'static,
{
    fn merge(&self, target: &mut Value, other: &Value, base: &Value) -> anyhow::Result<()> {
        self(target, other, base)
    }
}

/// Patch-based merge: the structural delta `base → other` is applied onto
/// `target` verbatim. Suitable when concurrent writers touch disjoint parts
/// of the document; overlapping changes resolve in favor of `other`.
#[derive(Debug, Clone, Copy, Default)]
pub struct PatchMerge;

impl Merge for PatchMerge {
    fn merge(&self, target: &mut Value, other: &Value, base: &Value) -> anyhow::Result<()> {
        let delta = json_patch::diff(base, other);
        json_patch::patch(target, &delta)?;
        Ok(())
    }
}
