//! Deterministic context archives for COPY and ADD.
//!
//! Matched files are collected, sorted, and written with zeroed timestamps
//! and normalized ownership/modes, so the archive bytes (and therefore the
//! directive fingerprint) depend only on file paths and contents.

use super::ignore::{matches_pattern, IgnorePatterns};
use anyhow::{bail, ensure, Context, Result};
use sha2::{Digest, Sha256};
use std::fs;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

#[cfg(unix)]
use std::os::unix::fs::PermissionsExt;

pub(crate) struct PackedContext {
    pub data: Vec<u8>,
    /// `sha256:` + hex of the archive bytes.
    pub checksum: String,
    pub entries: usize,
}

/// Pack the files matched by `sources` (context-relative paths or glob
/// patterns) plus any pre-fetched `extra_files` into a tar rooted at `dest`.
pub(crate) fn pack(
    context_dir: &Path,
    sources: &[String],
    extra_files: &[(PathBuf, String)],
    dest: &str,
    ignore: &IgnorePatterns,
) -> Result<PackedContext> {
    ensure!(dest.starts_with('/'), "destination '{dest}' must be absolute");

    let walked = walk_context(context_dir, ignore)?;
    // (archive target, file on disk)
    let mut planned: Vec<(String, PathBuf)> = Vec::new();
    let mut top_level = extra_files.len();

    for source in sources {
        let pattern = source.trim_start_matches("./").trim_start_matches('/');
        ensure!(!pattern.is_empty(), "empty source path");

        let pattern = pattern.trim_end_matches('/');
        let dir_root = context_dir.join(pattern);
        if !has_glob(pattern) && dir_root.is_dir() {
            // A directory source copies its contents into the destination.
            top_level += 1;
            let prefix = format!("{pattern}/");
            for (rel, abs) in &walked {
                if let Some(inner) = rel.strip_prefix(&prefix) {
                    planned.push((join_dest(dest, inner), abs.clone()));
                }
            }
            continue;
        }

        let mut matched = false;
        for (rel, abs) in &walked {
            if !matches_pattern(pattern, rel) {
                continue;
            }
            matched = true;
            top_level += 1;
            let base = rel.rsplit('/').next().unwrap_or(rel);
            planned.push((file_dest(dest, base), abs.clone()));
        }
        ensure!(matched, "source '{source}' matched no files in the context");
    }

    for (path, base) in extra_files {
        planned.push((file_dest(dest, base), path.clone()));
    }

    if top_level > 1 && !dest.ends_with('/') {
        bail!("destination '{dest}' must end with '/' when copying multiple sources");
    }

    planned.sort_by(|a, b| a.0.cmp(&b.0));
    let entries = planned.len();

    let mut data = Vec::new();
    {
        let mut builder = tar::Builder::new(&mut data);
        for (target, path) in &planned {
            append_file(&mut builder, target, path)?;
        }
        builder.finish().context("failed to finish context archive")?;
    }

    let checksum = format!("sha256:{}", hex::encode(Sha256::digest(&data)));
    Ok(PackedContext {
        data,
        checksum,
        entries,
    })
}

/// All regular files under the context, as sorted context-relative paths,
/// with ignore patterns applied.
fn walk_context(context_dir: &Path, ignore: &IgnorePatterns) -> Result<Vec<(String, PathBuf)>> {
    let mut files = Vec::new();
    for entry in WalkDir::new(context_dir).sort_by_file_name() {
        let entry = entry.context("failed to walk build context")?;
        if !entry.file_type().is_file() && !entry.file_type().is_symlink() {
            continue;
        }
        let rel = entry
            .path()
            .strip_prefix(context_dir)
            .unwrap_or(entry.path())
            .to_string_lossy()
            .replace('\\', "/");
        if ignore.excluded(&rel) {
            continue;
        }
        files.push((rel, entry.path().to_path_buf()));
    }
    Ok(files)
}

fn append_file(builder: &mut tar::Builder<&mut Vec<u8>>, target: &str, path: &Path) -> Result<()> {
    let in_archive = target.trim_start_matches('/');
    let metadata = fs::symlink_metadata(path)
        .with_context(|| format!("failed to stat '{}'", path.display()))?;

    let mut header = tar::Header::new_gnu();
    header.set_mtime(0);
    header.set_uid(0);
    header.set_gid(0);

    if metadata.file_type().is_symlink() {
        let link = fs::read_link(path)
            .with_context(|| format!("failed to read link '{}'", path.display()))?;
        header.set_entry_type(tar::EntryType::Symlink);
        header.set_size(0);
        header.set_mode(0o777);
        builder
            .append_link(&mut header, in_archive, &link)
            .with_context(|| format!("failed to archive link '{}'", path.display()))?;
        return Ok(());
    }

    header.set_size(metadata.len());
    header.set_mode(normalized_mode(&metadata));
    let file = fs::File::open(path)
        .with_context(|| format!("failed to open '{}'", path.display()))?;
    builder
        .append_data(&mut header, in_archive, file)
        .with_context(|| format!("failed to archive '{}'", path.display()))
}

/// Collapse host modes to two values so the archive does not depend on the
/// local umask.
#[cfg(unix)]
fn normalized_mode(metadata: &fs::Metadata) -> u32 {
    if metadata.permissions().mode() & 0o111 != 0 {
        0o755
    } else {
        0o644
    }
}

#[cfg(not(unix))]
fn normalized_mode(_metadata: &fs::Metadata) -> u32 {
    0o644
}

fn has_glob(pattern: &str) -> bool {
    pattern.contains(['*', '?'])
}

fn file_dest(dest: &str, base: &str) -> String {
    if dest.ends_with('/') {
        format!("{dest}{base}")
    } else {
        dest.to_string()
    }
}

fn join_dest(dest: &str, inner: &str) -> String {
    if inner.is_empty() {
        dest.trim_end_matches('/').to_string()
    } else {
        format!("{}/{}", dest.trim_end_matches('/'), inner)
    }
}
