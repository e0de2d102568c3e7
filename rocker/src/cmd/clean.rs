use crate::cmd::default_cache_dir;
use anyhow::{Context, Result};
use clap::Parser;
use log::info;
use std::path::PathBuf;

/// Remove the local build caches: cached layers, url downloads, and the
/// object-storage digest map. Helper containers are left alone; they are
/// reused by name.
#[derive(Debug, Parser)]
pub(crate) struct Clean {
    /// Cache directory. Defaults to ~/.rocker
    #[clap(long = "cache-dir")]
    cache_dir: Option<PathBuf>,
}

impl Clean {
    pub(super) async fn run(&self) -> Result<()> {
        let cache_dir = self.cache_dir.clone().unwrap_or_else(default_cache_dir);
        if !cache_dir.exists() {
            info!("Nothing to clean at '{}'", cache_dir.display());
            return Ok(());
        }
        std::fs::remove_dir_all(&cache_dir)
            .with_context(|| format!("failed to remove '{}'", cache_dir.display()))?;
        info!("Removed '{}'", cache_dir.display());
        Ok(())
    }
}
