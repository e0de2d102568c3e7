//! The EXPORT/IMPORT artifact engine.
//!
//! Artifacts cross stage boundaries through helper containers holding two
//! volumes: the artifact root, where exported files accumulate, and a tool
//! volume carrying a statically linked rsync that can run inside any image.
//! Each EXPORT creates a new helper named after the fingerprint that
//! produced it, carrying the previous helper's artifacts forward, so the
//! helper chain mirrors the build history and cache keys stay consistent
//! across stages.

use anyhow::{Context, Result};
use dockerclient::{ContainerClient, ContainerSpec};
use log::debug;

/// Path inside images where exported artifacts are staged.
pub(crate) const EXPORTS_ROOT: &str = "/.rocker_exports";
/// Volume carrying the statically linked sync tool.
pub(crate) const TOOL_ROOT: &str = "/opt/rsync";
/// The sync binary inside the tool volume.
pub(crate) const SYNC_BIN: &str = "/opt/rsync/rsync";
/// Image providing both volumes.
pub(crate) const RSYNC_IMAGE: &str = "rocker/rsync-static:latest";

/// Mount point of the previous helper's artifact root while its contents
/// are carried over into a new helper.
const CARRY_SOURCE: &str = "/.rocker_exports_prev";

/// Deterministic helper name for the exports of a given fingerprint.
pub(crate) fn helper_name(image_id: &str, commits: &[String]) -> String {
    let salt = format!("{image_id}{}", commits.join("; "));
    format!("exports_{}", super::mounts::short_hash(&salt))
}

/// Bind lines exposing a helper's volumes (artifact root and tool root) to
/// another container.
pub(crate) async fn binds_of(client: &dyn ContainerClient, helper: &str) -> Result<Vec<String>> {
    let container = client
        .inspect_container(helper)
        .await?
        .with_context(|| format!("exports container '{helper}' not found, rebuild with --no-cache"))?;
    let mut binds = Vec::new();
    for mount in &container.mounts {
        if mount.destination == EXPORTS_ROOT || mount.destination == TOOL_ROOT {
            binds.push(format!("{}:{}:rw", mount.source, mount.destination));
        }
    }
    anyhow::ensure!(
        binds.len() == 2,
        "exports container '{helper}' is missing its volumes"
    );
    Ok(binds)
}

/// Ensure an exports helper exists. When a previous helper is given, its
/// artifact history is synced into the new one so the chain accumulates.
pub(crate) async fn ensure_helper(
    client: &dyn ContainerClient,
    name: &str,
    previous: Option<&str>,
) -> Result<String> {
    if let Some(existing) = client.inspect_container(name).await? {
        debug!("Reusing exports container '{name}'");
        return Ok(existing.id);
    }

    let spec = ContainerSpec {
        image: RSYNC_IMAGE.to_string(),
        volumes: [EXPORTS_ROOT.to_string(), TOOL_ROOT.to_string()]
            .into_iter()
            .collect(),
        cmd: vec![SYNC_BIN.to_string(), "--version".to_string()],
        ..Default::default()
    };
    let id = client.ensure_container(name, &spec, "exports").await?;

    if let Some(previous) = previous {
        carry_over(client, previous, &id)
            .await
            .with_context(|| format!("failed to carry exports from '{previous}' to '{name}'"))?;
    }
    Ok(id)
}

/// Copy the artifact root of `from` into the artifact root of `to` by
/// running the sync tool in a transient container binding both volumes.
async fn carry_over(client: &dyn ContainerClient, from: &str, to: &str) -> Result<()> {
    let source = artifact_source(client, from).await?;
    let mut binds = binds_of(client, to).await?;
    binds.push(format!("{source}:{CARRY_SOURCE}:rw"));

    let spec = ContainerSpec {
        image: RSYNC_IMAGE.to_string(),
        cmd: vec![
            SYNC_BIN.to_string(),
            "-a".to_string(),
            "--delete".to_string(),
            format!("{CARRY_SOURCE}/"),
            format!("{EXPORTS_ROOT}/"),
        ],
        binds,
        ..Default::default()
    };
    let id = client.create_container(&spec, None).await?;
    let outcome = client.run_container(&id, false).await;
    client.remove_container(&id).await?;
    outcome.map_err(Into::into)
}

async fn artifact_source(client: &dyn ContainerClient, helper: &str) -> Result<String> {
    let container = client
        .inspect_container(helper)
        .await?
        .with_context(|| format!("exports container '{helper}' not found"))?;
    container
        .mounts
        .iter()
        .find(|mount| mount.destination == EXPORTS_ROOT)
        .map(|mount| mount.source.clone())
        .with_context(|| format!("exports container '{helper}' has no artifact volume"))
}
