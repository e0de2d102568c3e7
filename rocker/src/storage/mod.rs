//! Image storage dispatch.
//!
//! References either live in a docker registry (the default) or in an
//! object store (`s3:` prefix). This module owns the resolver-aware lookup
//! used by FROM and `rocker pull`: local exact name first, then semver
//! resolution over the daemon's catalog, then the remote catalog, pulling
//! whatever the reference resolves to.

pub(crate) mod s3;

use crate::registry::Catalog;
use anyhow::{Context, Result};
use dockerclient::{ContainerClient, ImageView};
use imagename::{ImageName, Storage as StorageKind};
use log::debug;
use s3::ObjectStore;
use std::path::Path;
use std::sync::Arc;

pub(crate) struct Storage {
    client: Arc<dyn ContainerClient>,
    catalog: Catalog,
    object_store: ObjectStore,
}

impl Storage {
    pub(crate) fn new(client: Arc<dyn ContainerClient>, cache_dir: &Path) -> Self {
        Self {
            client,
            catalog: Catalog::new(),
            object_store: ObjectStore::new(cache_dir),
        }
    }

    /// Resolve a reference to a usable local image, pulling when needed.
    /// With `pull` set, local inspection is skipped and the remote wins.
    pub(crate) async fn lookup(&self, name: &ImageName, pull: bool) -> Result<ImageView> {
        if !pull && !name.is_digest() {
            if let Some(image) = self.client.inspect_image(&name.local()).await? {
                return Ok(image);
            }
            // The exact name is absent; try semver resolution over the
            // daemon's own catalog before going remote.
            let local: Vec<ImageName> = self
                .client
                .list_images()
                .await?
                .iter()
                .filter_map(|reference| ImageName::parse(reference).ok())
                .collect();
            if let Some(resolved) = name.resolve(&local) {
                debug!("'{name}' resolved locally to '{resolved}'");
                if let Some(image) = self.client.inspect_image(&resolved.local()).await? {
                    return Ok(image);
                }
            }
        }
        self.pull(name).await
    }

    /// Pull a reference, resolving ranges against the remote catalog.
    /// Digest-tagged references are strict and never consult a catalog.
    pub(crate) async fn pull(&self, name: &ImageName) -> Result<ImageView> {
        match name.storage {
            StorageKind::ObjectStore => self.object_store.pull(name, &*self.client).await,
            StorageKind::Registry => {
                let resolved = if name.is_digest() {
                    name.clone()
                } else {
                    let candidates = self.catalog.list_tags(name).await?;
                    name.resolve(&candidates)
                        .with_context(|| format!("image not found: {name}"))?
                        .clone()
                };
                debug!("Pulling '{resolved}'");
                self.client.pull_image(&resolved.local()).await?;
                self.client
                    .inspect_image(&resolved.local())
                    .await?
                    .with_context(|| format!("image '{resolved}' disappeared after pull"))
            }
        }
    }

    /// Push an already-tagged snapshot and return its content digest.
    pub(crate) async fn push(&self, name: &ImageName, image_id: &str) -> Result<String> {
        match name.storage {
            StorageKind::ObjectStore => {
                self.object_store.push(name, image_id, &*self.client).await
            }
            StorageKind::Registry => self
                .client
                .push_image(&name.repo(), name.tag_or_latest())
                .await
                .map_err(Into::into),
        }
    }
}
