use crate::cmd::default_cache_dir;
use crate::storage::Storage;
use anyhow::{Context, Result};
use clap::Parser;
use dockerclient::DockerDaemon;
use imagename::ImageName;
use std::path::PathBuf;
use std::sync::Arc;

/// Pull an image, resolving semver tags, from a registry or an object
/// store.
#[derive(Debug, Parser)]
pub(crate) struct Pull {
    /// The image reference, e.g. `lib/x:1.5.*` or `s3:bucket/app:latest`.
    reference: String,

    /// Cache directory. Defaults to ~/.rocker
    #[clap(long = "cache-dir")]
    cache_dir: Option<PathBuf>,
}

impl Pull {
    pub(super) async fn run(&self) -> Result<()> {
        let name = ImageName::parse(&self.reference)
            .with_context(|| format!("invalid image reference '{}'", self.reference))?;
        let client = Arc::new(DockerDaemon::new()?);
        let storage = Storage::new(
            client,
            &self.cache_dir.clone().unwrap_or_else(default_cache_dir),
        );
        let image = storage.pull(&name).await?;
        println!("{}", image.id);
        Ok(())
    }
}
