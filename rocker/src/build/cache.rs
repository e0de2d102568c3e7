//! The fingerprint-keyed layer cache.
//!
//! Each committed snapshot is recorded as a JSON entry under
//! `<cache_dir>/<parent_id>/<image_id>.json`. A lookup walks the directory
//! for the current snapshot and returns the newest entry (by modification
//! time) whose commit list equals the state's accumulated commits, so
//! concurrent builds writing the same key resolve to last-writer-wins.

use super::state::BuildState;
use anyhow::{Context, Result};
use log::trace;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub(crate) struct CacheEntry {
    pub parent_id: String,
    pub image_id: String,
    pub commit_list: Vec<String>,
}

pub(crate) struct LayerCache {
    root: PathBuf,
}

impl LayerCache {
    pub(crate) fn new<P: AsRef<Path>>(root: P) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    /// Find the newest cached snapshot committed from the state's current
    /// image with exactly the state's commit list.
    pub(crate) fn get(&self, state: &BuildState) -> Result<Option<CacheEntry>> {
        let dir = self.entry_dir(&state.image_id);
        if !dir.is_dir() {
            return Ok(None);
        }
        let mut newest: Option<(SystemTime, CacheEntry)> = None;
        for dir_entry in fs::read_dir(&dir)
            .with_context(|| format!("failed to read cache dir '{}'", dir.display()))?
        {
            let dir_entry = dir_entry?;
            let path = dir_entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let Ok(body) = fs::read(&path) else {
                continue;
            };
            let Ok(entry) = serde_json::from_slice::<CacheEntry>(&body) else {
                // A torn write from a concurrent build; skip it.
                trace!("Skipping unreadable cache entry '{}'", path.display());
                continue;
            };
            if entry.commit_list != state.commits {
                continue;
            }
            let modified = dir_entry
                .metadata()
                .and_then(|m| m.modified())
                .unwrap_or(SystemTime::UNIX_EPOCH);
            if newest.as_ref().map(|(at, _)| modified > *at).unwrap_or(true) {
                newest = Some((modified, entry));
            }
        }
        Ok(newest.map(|(_, entry)| entry))
    }

    pub(crate) fn put(&self, entry: &CacheEntry) -> Result<()> {
        let dir = self.entry_dir(&entry.parent_id);
        fs::create_dir_all(&dir)
            .with_context(|| format!("failed to create cache dir '{}'", dir.display()))?;
        let path = dir.join(format!("{}.json", sanitize(&entry.image_id)));
        let body = serde_json::to_vec_pretty(entry).context("failed to serialize cache entry")?;
        fs::write(&path, body)
            .with_context(|| format!("failed to write cache entry '{}'", path.display()))
    }

    pub(crate) fn del(&self, entry: &CacheEntry) -> Result<()> {
        let path = self
            .entry_dir(&entry.parent_id)
            .join(format!("{}.json", sanitize(&entry.image_id)));
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err)
                .with_context(|| format!("failed to remove cache entry '{}'", path.display())),
        }
    }

    fn entry_dir(&self, parent_id: &str) -> PathBuf {
        self.root.join(sanitize(parent_id))
    }
}

/// Snapshot ids carry a `sha256:` prefix; keep cache paths portable.
fn sanitize(id: &str) -> String {
    if id.is_empty() {
        "scratch".to_string()
    } else {
        id.replace(':', "-")
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn state_with(image_id: &str, commits: &[&str]) -> BuildState {
        BuildState {
            image_id: image_id.to_string(),
            commits: commits.iter().map(|c| c.to_string()).collect(),
            ..Default::default()
        }
    }

    #[test]
    fn round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let cache = LayerCache::new(dir.path());
        let entry = CacheEntry {
            parent_id: "sha256:parent".to_string(),
            image_id: "sha256:child".to_string(),
            commit_list: vec!["RUN touch /t".to_string()],
        };
        cache.put(&entry).unwrap();

        let state = state_with("sha256:parent", &["RUN touch /t"]);
        assert_eq!(cache.get(&state).unwrap(), Some(entry.clone()));

        cache.del(&entry).unwrap();
        assert_eq!(cache.get(&state).unwrap(), None);
    }

    #[test]
    fn commit_list_must_match_exactly() {
        let dir = tempfile::tempdir().unwrap();
        let cache = LayerCache::new(dir.path());
        cache
            .put(&CacheEntry {
                parent_id: "sha256:parent".to_string(),
                image_id: "sha256:child".to_string(),
                commit_list: vec!["ENV A=1".to_string(), "ENV B=2".to_string()],
            })
            .unwrap();

        // Same strings in a different order are a different fingerprint.
        let state = state_with("sha256:parent", &["ENV B=2", "ENV A=1"]);
        assert_eq!(cache.get(&state).unwrap(), None);
    }

    #[test]
    fn newest_entry_wins() {
        let dir = tempfile::tempdir().unwrap();
        let cache = LayerCache::new(dir.path());
        let older = CacheEntry {
            parent_id: "sha256:parent".to_string(),
            image_id: "sha256:old".to_string(),
            commit_list: vec!["RUN true".to_string()],
        };
        let newer = CacheEntry {
            image_id: "sha256:new".to_string(),
            ..older.clone()
        };
        cache.put(&older).unwrap();
        cache.put(&newer).unwrap();

        // Nudge mtimes so ordering does not depend on write timing.
        let old_path = dir.path().join("sha256-parent/sha256-old.json");
        let file = fs::File::options().write(true).open(old_path).unwrap();
        file.set_modified(SystemTime::UNIX_EPOCH).unwrap();

        let state = state_with("sha256:parent", &["RUN true"]);
        assert_eq!(cache.get(&state).unwrap(), Some(newer));
    }

    #[test]
    fn missing_dir_is_a_miss() {
        let dir = tempfile::tempdir().unwrap();
        let cache = LayerCache::new(dir.path().join("does-not-exist"));
        let state = state_with("sha256:parent", &["RUN true"]);
        assert_eq!(cache.get(&state).unwrap(), None);
    }
}
