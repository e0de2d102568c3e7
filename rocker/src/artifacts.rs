//! Artifact descriptor files written by PUSH.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::path::{Path, PathBuf};

/// One descriptor per pushed image, for downstream tooling to pick up.
#[derive(Debug, Serialize)]
pub(crate) struct Artifact {
    pub name: String,
    pub tag: String,
    pub digest: String,
    pub image_id: String,
    pub build_time: DateTime<Utc>,
    pub pushed: bool,
}

/// Write the descriptor as `<sanitized-name>_<tag>.yml` under `dir`.
pub(crate) fn write(dir: &Path, artifact: &Artifact) -> Result<PathBuf> {
    std::fs::create_dir_all(dir)
        .with_context(|| format!("failed to create artifacts dir '{}'", dir.display()))?;
    let file_name = format!("{}_{}.yml", sanitize(&artifact.name), sanitize(&artifact.tag));
    let path = dir.join(file_name);
    let body = serde_yaml::to_string(artifact).context("failed to serialize artifact")?;
    std::fs::write(&path, body)
        .with_context(|| format!("failed to write artifact '{}'", path.display()))?;
    Ok(path)
}

fn sanitize(part: &str) -> String {
    part.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '.' || c == '-' { c } else { '_' })
        .collect()
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn writes_sanitized_descriptor() {
        let dir = tempfile::tempdir().unwrap();
        let artifact = Artifact {
            name: "quay.io/lib/app".to_string(),
            tag: "1.0.0".to_string(),
            digest: "sha256-abc".to_string(),
            image_id: "sha256:def".to_string(),
            build_time: Utc::now(),
            pushed: true,
        };
        let path = write(dir.path(), &artifact).unwrap();
        assert_eq!(
            path.file_name().unwrap().to_str().unwrap(),
            "quay.io_lib_app_1.0.0.yml"
        );
        let body = std::fs::read_to_string(path).unwrap();
        assert!(body.contains("digest: sha256-abc"));
        assert!(body.contains("pushed: true"));
    }
}
