//! Per-stage build state.

use dockerclient::{ImageConfig, ImageView};
use std::collections::BTreeMap;

/// The accumulator threaded through every directive handler. A stage starts
/// at FROM with a fresh state and ends at the next FROM (or the end of the
/// plan), when the cleanup marker resets it.
#[derive(Debug, Default, Clone, PartialEq)]
pub(crate) struct BuildState {
    /// Id of the current snapshot.
    pub image_id: String,
    /// Id of the snapshot the current one was committed from.
    pub parent_id: String,
    /// Container configuration inherited from the base image and mutated by
    /// directives.
    pub config: ImageConfig,
    /// Ordered commit strings accumulated since the last commit. This is the
    /// fingerprint: equality of the list decides cache identity.
    pub commits: Vec<String>,
    /// Name of the last exports helper container created by an EXPORT.
    /// Survives stage resets so a later stage can IMPORT from it.
    pub exports_id: String,
    /// ONBUILD triggers lifted from the base image, waiting to be spliced
    /// into the plan.
    pub inject: Vec<String>,
    /// The stage started from `scratch`.
    pub no_base_image: bool,
    /// Whether this stage committed at least one new snapshot.
    pub produced_image: bool,
    /// Size of the current snapshot, for produced-size bookkeeping.
    pub size: i64,
    /// Fields that never participate in the fingerprint.
    pub no_cache: NoCache,
}

/// Volatile per-stage data excluded from commit strings and cache entries.
#[derive(Debug, Default, Clone, PartialEq)]
pub(crate) struct NoCache {
    /// A container created by the last directive, waiting to be committed.
    pub container_id: String,
    /// Active bind mounts, applied to every container of this stage.
    pub binds: Vec<String>,
    /// Allowed build args declared by ARG, with their effective values.
    pub build_args: BTreeMap<String, String>,
    /// Whether a CMD directive ran in this stage; an ENTRYPOINT only clears
    /// CMD when it did not.
    pub cmd_set: bool,
    /// Set to disable cache probing for the rest of the stage.
    pub cache_busted: bool,
}

impl BuildState {
    /// Fresh state for a new stage, preserving the exports helper so
    /// IMPORT keeps working across stage boundaries.
    pub(crate) fn reset_stage(&mut self) {
        let exports_id = std::mem::take(&mut self.exports_id);
        *self = BuildState {
            exports_id,
            ..BuildState::default()
        };
    }

    pub(crate) fn join_commits(&self) -> String {
        self.commits.join("; ")
    }

    /// Adopt a newly committed (or cache-adopted) snapshot.
    pub(crate) fn advance(&mut self, image: &ImageView, produced: bool) -> i64 {
        self.parent_id = std::mem::replace(&mut self.image_id, image.id.clone());
        let delta = image.size - self.size;
        self.size = image.size;
        self.produced_image = self.produced_image || produced;
        self.commits.clear();
        delta
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn reset_preserves_exports() {
        let mut state = BuildState {
            image_id: "sha256:abc".to_string(),
            exports_id: "exports_0011aabbccdd".to_string(),
            commits: vec!["ENV A=1".to_string()],
            ..Default::default()
        };
        state.reset_stage();
        assert_eq!(state.exports_id, "exports_0011aabbccdd");
        assert!(state.image_id.is_empty());
        assert!(state.commits.is_empty());
    }

    #[test]
    fn advance_moves_parent_and_clears_commits() {
        let mut state = BuildState {
            image_id: "sha256:base".to_string(),
            size: 100,
            commits: vec!["RUN true".to_string()],
            ..Default::default()
        };
        let image = ImageView {
            id: "sha256:next".to_string(),
            size: 150,
            ..Default::default()
        };
        let delta = state.advance(&image, true);
        assert_eq!(delta, 50);
        assert_eq!(state.parent_id, "sha256:base");
        assert_eq!(state.image_id, "sha256:next");
        assert!(state.produced_image);
        assert!(state.commits.is_empty());
    }
}
