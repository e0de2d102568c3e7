//! A fake daemon client for engine tests.
//!
//! The fake keeps images and containers in memory and records every
//! operation, so tests can assert on daemon traffic (e.g. "a fully cached
//! rebuild creates no containers") without a docker daemon.

use async_trait::async_trait;
use dockerclient::{
    error, ContainerClient, ContainerSpec, ContainerView, ImageConfig, ImageView, MountView,
    Result,
};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

#[derive(Default)]
pub(crate) struct FakeDaemon {
    /// Images by id and by `repo:tag`/name alias.
    images: Mutex<HashMap<String, ImageView>>,
    /// Containers by id and by name.
    containers: Mutex<HashMap<String, ContainerView>>,
    commit_messages: Mutex<Vec<String>>,
    created_specs: Mutex<Vec<ContainerSpec>>,
    ops: Mutex<Vec<String>>,
    next: AtomicUsize,
}

impl FakeDaemon {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub(crate) fn seed_image(&self, name: &str, image: ImageView) {
        let mut images = self.images.lock().unwrap();
        images.insert(image.id.clone(), image.clone());
        images.insert(name.to_string(), image);
    }

    pub(crate) fn op_count(&self, prefix: &str) -> usize {
        self.ops
            .lock()
            .unwrap()
            .iter()
            .filter(|op| op.starts_with(prefix))
            .count()
    }

    pub(crate) fn commit_messages(&self) -> Vec<String> {
        self.commit_messages.lock().unwrap().clone()
    }

    pub(crate) fn created_specs(&self) -> Vec<ContainerSpec> {
        self.created_specs.lock().unwrap().clone()
    }

    pub(crate) fn container_names_with_prefix(&self, prefix: &str) -> Vec<String> {
        let mut names: Vec<String> = self
            .containers
            .lock()
            .unwrap()
            .keys()
            .filter(|key| key.starts_with(prefix))
            .cloned()
            .collect();
        names.sort();
        names
    }

    fn record(&self, op: String) {
        self.ops.lock().unwrap().push(op);
    }

    fn next_id(&self, prefix: &str) -> String {
        format!("{prefix}{}", self.next.fetch_add(1, Ordering::SeqCst))
    }

    fn register_container(&self, spec: &ContainerSpec, name: Option<&str>) -> String {
        let id = self.next_id("container");
        let mounts = spec
            .volumes
            .iter()
            .map(|destination| MountView {
                source: format!(
                    "/var/lib/docker/volumes/{}{destination}",
                    name.unwrap_or(&id)
                ),
                destination: destination.clone(),
            })
            .collect::<Vec<_>>();
        let view = ContainerView {
            id: id.clone(),
            mounts,
        };
        let mut containers = self.containers.lock().unwrap();
        containers.insert(id.clone(), view.clone());
        if let Some(name) = name {
            containers.insert(name.to_string(), view);
        }
        self.created_specs.lock().unwrap().push(spec.clone());
        id
    }
}

#[async_trait]
impl ContainerClient for FakeDaemon {
    async fn inspect_image(&self, name: &str) -> Result<Option<ImageView>> {
        Ok(self.images.lock().unwrap().get(name).cloned())
    }

    async fn pull_image(&self, name: &str) -> Result<()> {
        self.record(format!("pull {name}"));
        // Anything pullable in tests is pre-seeded; pulling the unknown is
        // how lookup failures surface.
        if self.images.lock().unwrap().contains_key(name) {
            Ok(())
        } else {
            Err(error::Error::MissingField {
                what: format!("image '{name}'"),
            })
        }
    }

    async fn push_image(&self, name: &str, tag: &str) -> Result<String> {
        self.record(format!("push {name}:{tag}"));
        Ok("sha256-pushed".to_string())
    }

    async fn tag_image(&self, id: &str, repo: &str, tag: &str) -> Result<()> {
        self.record(format!("tag {id} {repo}:{tag}"));
        let mut images = self.images.lock().unwrap();
        if let Some(image) = images.get(id).cloned() {
            images.insert(format!("{repo}:{tag}"), image);
        }
        Ok(())
    }

    async fn list_images(&self) -> Result<Vec<String>> {
        Ok(self
            .images
            .lock()
            .unwrap()
            .keys()
            .filter(|key| key.contains(':') && !key.starts_with("sha256:"))
            .cloned()
            .collect())
    }

    async fn remove_image(&self, id: &str) -> Result<()> {
        self.record(format!("rmi {id}"));
        self.images.lock().unwrap().remove(id);
        Ok(())
    }

    async fn create_container(&self, spec: &ContainerSpec, name: Option<&str>) -> Result<String> {
        self.record(format!("create {}", spec.image));
        Ok(self.register_container(spec, name))
    }

    async fn run_container(&self, id: &str, attach_stdin: bool) -> Result<()> {
        self.record(format!("run {id} stdin={attach_stdin}"));
        Ok(())
    }

    async fn commit_container(
        &self,
        id: &str,
        message: &str,
        config: &ImageConfig,
    ) -> Result<ImageView> {
        self.record(format!("commit {id}"));
        self.commit_messages.lock().unwrap().push(message.to_string());
        let image = ImageView {
            id: format!("sha256:{}", self.next_id("img")),
            parent: String::new(),
            size: 0,
            config: config.clone(),
        };
        self.images
            .lock()
            .unwrap()
            .insert(image.id.clone(), image.clone());
        Ok(image)
    }

    async fn remove_container(&self, id: &str) -> Result<()> {
        self.record(format!("rm {id}"));
        self.containers.lock().unwrap().remove(id);
        Ok(())
    }

    async fn upload_to_container(&self, id: &str, tar: Vec<u8>, path: &str) -> Result<()> {
        self.record(format!("upload {id} {path} {} bytes", tar.len()));
        Ok(())
    }

    async fn ensure_container(
        &self,
        name: &str,
        spec: &ContainerSpec,
        purpose: &str,
    ) -> Result<String> {
        if let Some(existing) = self.containers.lock().unwrap().get(name) {
            return Ok(existing.id.clone());
        }
        self.record(format!("ensure {purpose} {name}"));
        Ok(self.register_container(spec, Some(name)))
    }

    async fn inspect_container(&self, name: &str) -> Result<Option<ContainerView>> {
        Ok(self.containers.lock().unwrap().get(name).cloned())
    }

    async fn export_image(&self, name: &str, dest: &Path) -> Result<()> {
        self.record(format!("export {name}"));
        std::fs::write(dest, b"").map_err(|source| error::Error::Io {
            about: "write export".to_string(),
            source,
        })?;
        Ok(())
    }

    async fn load_image(&self, tar: &Path) -> Result<()> {
        self.record(format!("load {}", tar.display()));
        Ok(())
    }

    async fn resolve_host_path(&self, path: &Path) -> Result<PathBuf> {
        Ok(path.to_path_buf())
    }
}
