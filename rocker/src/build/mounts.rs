//! The MOUNT registry.
//!
//! `MOUNT /dest` synthesizes a persistent helper container holding a volume
//! at `/dest`; its name is derived from the build identity and the
//! destination, so repeated builds of the same project find the same helper
//! (and its data) again. `MOUNT src:dest` binds a host directory, expanding
//! `~` and context-relative paths, and rewriting the source to the
//! host-visible path when the builder itself runs inside a container.

use anyhow::{bail, Context, Result};
use dockerclient::{ContainerClient, ContainerSpec};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};

/// Image used for volume helper containers. It is a scratch-sized image
/// whose only purpose is to own a volume.
pub(crate) const SCRATCH_VOLUME_IMAGE: &str = "rocker/scratch-with-volume:latest";

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Mount {
    Host { source: String, destination: String },
    Volume { destination: String },
}

pub(crate) fn parse_mount(arg: &str) -> Result<Mount> {
    let mut parts: Vec<&str> = arg.split(':').collect();
    // A trailing mode suffix (`:ro`/`:rw`) is accepted and ignored; binds
    // are always read-write for build purposes.
    if matches!(parts.last(), Some(&"ro") | Some(&"rw")) {
        parts.pop();
    }
    match parts.as_slice() {
        [destination] => {
            if !destination.starts_with('/') {
                bail!("MOUNT destination '{destination}' must be absolute");
            }
            Ok(Mount::Volume {
                destination: destination.to_string(),
            })
        }
        [source, destination] => {
            if !destination.starts_with('/') {
                bail!("MOUNT destination '{destination}' must be absolute");
            }
            Ok(Mount::Host {
                source: source.to_string(),
                destination: destination.to_string(),
            })
        }
        _ => bail!("invalid MOUNT argument '{arg}'"),
    }
}

/// Deterministic helper container name for a volume mount.
pub(crate) fn helper_name(build_identity: &str, destination: &str) -> String {
    format!("mount_{}", short_hash(&format!("{build_identity}{destination}")))
}

pub(crate) fn short_hash(input: &str) -> String {
    let digest = hex::encode(Sha256::digest(input.as_bytes()));
    digest[..12].to_string()
}

/// Ensure the volume helper exists and return its id together with the bind
/// line pointing at the helper's volume on the daemon host.
pub(crate) async fn ensure_volume_bind(
    client: &dyn ContainerClient,
    build_identity: &str,
    destination: &str,
) -> Result<(String, String)> {
    let name = helper_name(build_identity, destination);
    let spec = ContainerSpec {
        image: SCRATCH_VOLUME_IMAGE.to_string(),
        volumes: [destination.to_string()].into_iter().collect(),
        cmd: vec!["/true".to_string()],
        ..Default::default()
    };
    let id = client
        .ensure_container(&name, &spec, "volume")
        .await
        .with_context(|| format!("failed to ensure volume container '{name}'"))?;
    let container = client
        .inspect_container(&id)
        .await?
        .with_context(|| format!("volume container '{name}' disappeared"))?;
    let source = container
        .mounts
        .iter()
        .find(|mount| mount.destination == destination)
        .map(|mount| mount.source.clone())
        .with_context(|| format!("volume container '{name}' has no volume at '{destination}'"))?;
    Ok((id, format!("{source}:{destination}:rw")))
}

/// Expand a host-bind source (`~`, relative paths) and rewrite it to the
/// path the daemon host sees.
pub(crate) async fn host_bind(
    client: &dyn ContainerClient,
    context_dir: &Path,
    source: &str,
    destination: &str,
) -> Result<String> {
    let expanded = expand_source(source, context_dir)?;
    let host = client.resolve_host_path(&expanded).await?;
    Ok(format!("{}:{}", host.display(), destination))
}

fn expand_source(source: &str, context_dir: &Path) -> Result<PathBuf> {
    if source == "~" {
        return home_dir();
    }
    if let Some(rest) = source.strip_prefix("~/") {
        return Ok(home_dir()?.join(rest));
    }
    let path = PathBuf::from(source);
    if path.is_absolute() {
        Ok(path)
    } else {
        Ok(context_dir.join(path))
    }
}

fn home_dir() -> Result<PathBuf> {
    home::home_dir().context("cannot expand '~', no home directory found")
}
