//! The object-storage image codec.
//!
//! Pushing serializes a daemon image to a deterministic tar: the daemon's
//! `repositories` file is dropped and a canonical one is appended last,
//! while every other entry passes through byte-identical and feeds a
//! SHA-256 hasher. The digest names the object
//! (`<bucket>/<name>/<digest>.tar`), which is then server-side copied to the
//! tag alias (`<bucket>/<name>/<tag>.tar`). A local digest map remembers
//! which snapshot produced which digest so unchanged images skip the tar
//! entirely; the alias copy is still issued. Every storage call is wrapped
//! in an exponential backoff with jitter, capped at six attempts.

use anyhow::{bail, Context, Result};
use aws_sdk_s3::error::SdkError;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{CompletedMultipartUpload, CompletedPart};
use dockerclient::{ContainerClient, ImageView};
use imagename::ImageName;
use log::{debug, info, warn};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::future::Future;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use tokio::sync::OnceCell;
use tokio_retry::strategy::{jitter, ExponentialBackoff};
use tokio_retry::RetryIf;

const DIGESTS_SUBDIR: &str = "_digests";
const PART_SIZE: usize = 64 * 1024 * 1024;
const MAX_ATTEMPTS: usize = 6;

pub(crate) struct ObjectStore {
    digests_dir: PathBuf,
    client: OnceCell<aws_sdk_s3::Client>,
}

impl ObjectStore {
    pub(crate) fn new(cache_dir: &Path) -> Self {
        Self {
            digests_dir: cache_dir.join(DIGESTS_SUBDIR),
            client: OnceCell::new(),
        }
    }

    async fn s3(&self) -> &aws_sdk_s3::Client {
        self.client
            .get_or_init(|| async {
                let config =
                    aws_config::load_defaults(aws_config::BehaviorVersion::latest()).await;
                aws_sdk_s3::Client::new(&config)
            })
            .await
    }

    pub(crate) async fn push(
        &self,
        name: &ImageName,
        image_id: &str,
        client: &dyn ContainerClient,
    ) -> Result<String> {
        let bucket = name
            .registry
            .clone()
            .with_context(|| format!("object-store reference '{name}' has no bucket"))?;
        client
            .inspect_image(image_id)
            .await?
            .with_context(|| format!("cannot push unknown snapshot '{image_id}'"))?;

        let digest = match self.load_digest(image_id)? {
            Some(digest) => {
                info!("Snapshot {image_id} already uploaded as {digest}");
                digest
            }
            None => {
                let raw = NamedTempFile::new().context("failed to create export tempfile")?;
                client.export_image(image_id, raw.path()).await?;
                let (packed, digest) = repack(raw.path(), name, image_id)
                    .context("failed to re-pack image archive")?;
                let key = object_key(name, &format!("{digest}.tar"));
                self.upload(&bucket, &key, packed.path()).await?;
                self.store_digest(image_id, &digest)?;
                digest
            }
        };

        // The tag alias is refreshed even when the tar upload was skipped.
        let source = format!("{bucket}/{}", object_key(name, &format!("{digest}.tar")));
        let alias = object_key(name, &format!("{}.tar", name.tag_or_latest()));
        debug!("Aliasing '{source}' to '{alias}'");
        let s3 = self.s3().await;
        with_retry(|| {
            s3.copy_object()
                .bucket(&bucket)
                .copy_source(&source)
                .key(&alias)
                .send()
        })
        .await
        .with_context(|| format!("failed to alias '{source}' to '{alias}'"))?;

        Ok(digest)
    }

    pub(crate) async fn pull(
        &self,
        name: &ImageName,
        client: &dyn ContainerClient,
    ) -> Result<ImageView> {
        let bucket = name
            .registry
            .clone()
            .with_context(|| format!("object-store reference '{name}' has no bucket"))?;
        let key = object_key(name, &format!("{}.tar", name.tag_or_latest()));
        info!("Pulling '{name}' from bucket '{bucket}'");

        let tar = NamedTempFile::new().context("failed to create download tempfile")?;
        self.download(&bucket, &key, tar.path()).await?;
        client.load_image(tar.path()).await?;
        client
            .inspect_image(&name.local())
            .await?
            .with_context(|| format!("daemon did not load '{name}' from the archive"))
    }

    /// Multipart upload in `PART_SIZE` chunks. Abandoned uploads are
    /// aborted best-effort.
    async fn upload(&self, bucket: &str, key: &str, path: &Path) -> Result<()> {
        let size = fs::metadata(path)
            .with_context(|| format!("failed to stat '{}'", path.display()))?
            .len();
        info!("Uploading {size} bytes to '{bucket}/{key}'");
        let s3 = self.s3().await;

        let created = with_retry(|| {
            s3.create_multipart_upload()
                .bucket(bucket)
                .key(key)
                .send()
        })
        .await
        .context("failed to start multipart upload")?;
        let upload_id = created
            .upload_id()
            .context("multipart upload has no id")?
            .to_string();

        match self
            .upload_parts(bucket, key, &upload_id, path)
            .await
        {
            Ok(parts) => {
                with_retry(|| {
                    s3.complete_multipart_upload()
                        .bucket(bucket)
                        .key(key)
                        .upload_id(&upload_id)
                        .multipart_upload(
                            CompletedMultipartUpload::builder()
                                .set_parts(Some(parts.clone()))
                                .build(),
                        )
                        .send()
                })
                .await
                .context("failed to complete multipart upload")?;
                Ok(())
            }
            Err(err) => {
                if let Err(abort_err) = s3
                    .abort_multipart_upload()
                    .bucket(bucket)
                    .key(key)
                    .upload_id(&upload_id)
                    .send()
                    .await
                {
                    warn!("Could not abort multipart upload: {abort_err}");
                }
                Err(err)
            }
        }
    }

    async fn upload_parts(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        path: &Path,
    ) -> Result<Vec<CompletedPart>> {
        let s3 = self.s3().await;
        let mut file = File::open(path)
            .with_context(|| format!("failed to open '{}'", path.display()))?;
        let mut parts = Vec::new();
        let mut part_number = 1;
        loop {
            let mut buffer = vec![0u8; PART_SIZE];
            let read = read_full(&mut file, &mut buffer)?;
            if read == 0 {
                break;
            }
            buffer.truncate(read);
            debug!("Uploading part {part_number} ({read} bytes)");
            let response = with_retry(|| {
                s3.upload_part()
                    .bucket(bucket)
                    .key(key)
                    .upload_id(upload_id)
                    .part_number(part_number)
                    .body(ByteStream::from(buffer.clone()))
                    .send()
            })
            .await
            .with_context(|| format!("failed to upload part {part_number}"))?;
            parts.push(
                CompletedPart::builder()
                    .part_number(part_number)
                    .e_tag(response.e_tag().unwrap_or_default())
                    .build(),
            );
            part_number += 1;
        }
        Ok(parts)
    }

    /// Ranged download in `PART_SIZE` chunks.
    async fn download(&self, bucket: &str, key: &str, dest: &Path) -> Result<()> {
        let s3 = self.s3().await;
        let head = with_retry(|| s3.head_object().bucket(bucket).key(key).send())
            .await
            .with_context(|| format!("object '{bucket}/{key}' is not available"))?;
        let total = head.content_length().unwrap_or_default().max(0) as u64;

        let file = File::create(dest)
            .with_context(|| format!("failed to create '{}'", dest.display()))?;
        let mut writer = BufWriter::new(file);
        let mut offset = 0u64;
        while offset < total {
            let end = (offset + PART_SIZE as u64).min(total) - 1;
            let range = format!("bytes={offset}-{end}");
            let response = with_retry(|| {
                s3.get_object()
                    .bucket(bucket)
                    .key(key)
                    .range(&range)
                    .send()
            })
            .await
            .with_context(|| format!("failed to download range {range}"))?;
            let bytes = response
                .body
                .collect()
                .await
                .context("failed to read object body")?
                .into_bytes();
            writer.write_all(&bytes).context("failed to write download")?;
            offset = end + 1;
        }
        writer.flush().context("failed to flush download")?;
        Ok(())
    }

    fn digest_path(&self, image_id: &str) -> PathBuf {
        self.digests_dir.join(image_id.replace(':', "-"))
    }

    fn load_digest(&self, image_id: &str) -> Result<Option<String>> {
        let path = self.digest_path(image_id);
        match fs::read_to_string(&path) {
            Ok(digest) => Ok(Some(digest.trim().to_string())),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => {
                Err(err).with_context(|| format!("failed to read '{}'", path.display()))
            }
        }
    }

    fn store_digest(&self, image_id: &str, digest: &str) -> Result<()> {
        fs::create_dir_all(&self.digests_dir).with_context(|| {
            format!("failed to create '{}'", self.digests_dir.display())
        })?;
        let path = self.digest_path(image_id);
        fs::write(&path, digest)
            .with_context(|| format!("failed to write '{}'", path.display()))
    }
}

fn object_key(name: &ImageName, file: &str) -> String {
    format!("{}/{file}", name.name)
}

/// Re-pack a daemon export into the canonical form: every entry except
/// `repositories` is copied byte-identical (in daemon order) through a
/// SHA-256 hasher, then a fresh `repositories` mapping both the tag and the
/// digest to the snapshot id is appended last.
fn repack(source: &Path, name: &ImageName, image_id: &str) -> Result<(NamedTempFile, String)> {
    let input = File::open(source)
        .with_context(|| format!("failed to open '{}'", source.display()))?;
    let mut archive = tar::Archive::new(BufReader::new(input));

    let output = NamedTempFile::new().context("failed to create repack tempfile")?;
    let writer = BufWriter::new(
        output
            .reopen()
            .context("failed to reopen repack tempfile")?,
    );
    let mut builder = tar::Builder::new(writer);
    let mut hasher = Sha256::new();

    for entry in archive.entries().context("failed to read image archive")? {
        let mut entry = entry.context("failed to read archive entry")?;
        let path = entry.path().context("archive entry has no path")?;
        if path == Path::new("repositories") {
            continue;
        }
        let header = entry.header().clone();
        let mut data = Vec::with_capacity(entry.size() as usize);
        entry
            .read_to_end(&mut data)
            .context("failed to read archive entry body")?;
        hasher.update(header.as_bytes().as_slice());
        hasher.update(&data);
        builder
            .append(&header, data.as_slice())
            .context("failed to append archive entry")?;
    }
    let digest = format!("sha256-{}", hex::encode(hasher.finalize()));

    let id = image_id.trim_start_matches("sha256:");
    let mut tags = BTreeMap::new();
    tags.insert(name.tag_or_latest().to_string(), id.to_string());
    tags.insert(digest.clone(), id.to_string());
    let mut repositories = BTreeMap::new();
    repositories.insert(name.repo(), tags);
    let body = serde_json::to_vec(&repositories).context("failed to encode repositories")?;
    let mut header = tar::Header::new_gnu();
    header.set_size(body.len() as u64);
    header.set_mode(0o644);
    header.set_mtime(0);
    header.set_uid(0);
    header.set_gid(0);
    builder
        .append_data(&mut header, "repositories", body.as_slice())
        .context("failed to append repositories")?;
    builder
        .into_inner()
        .and_then(|mut writer| {
            writer.flush()?;
            Ok(())
        })
        .context("failed to finish repacked archive")?;

    Ok((output, digest))
}

fn read_full(file: &mut File, buffer: &mut [u8]) -> Result<usize> {
    let mut filled = 0;
    while filled < buffer.len() {
        let read = file
            .read(&mut buffer[filled..])
            .context("failed to read upload chunk")?;
        if read == 0 {
            break;
        }
        filled += read;
    }
    Ok(filled)
}

/// Exponential backoff with jitter, at most `MAX_ATTEMPTS` tries.
/// Construction failures are not retried; everything the service or the
/// transport produced is.
async fn with_retry<T, E, Fut, F>(operation: F) -> std::result::Result<T, SdkError<E>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = std::result::Result<T, SdkError<E>>>,
    E: std::fmt::Debug,
{
    let strategy = ExponentialBackoff::from_millis(100)
        .map(jitter)
        .take(MAX_ATTEMPTS - 1);
    RetryIf::spawn(strategy, operation, |err: &SdkError<E>| {
        !matches!(err, SdkError::ConstructionFailure(_))
    })
    .await
}

#[cfg(test)]
mod test {
    use super::*;
    use std::io::Cursor;

    fn sample_export(entries: &[(&str, &[u8])]) -> Vec<u8> {
        let mut builder = tar::Builder::new(Vec::new());
        for (path, body) in entries {
            let mut header = tar::Header::new_gnu();
            header.set_size(body.len() as u64);
            header.set_mode(0o644);
            header.set_mtime(0);
            header.set_cksum();
            builder.append_data(&mut header, path, *body).unwrap();
        }
        builder.into_inner().unwrap()
    }

    fn write_temp(bytes: &[u8]) -> NamedTempFile {
        let file = NamedTempFile::new().unwrap();
        fs::write(file.path(), bytes).unwrap();
        file
    }

    fn name() -> ImageName {
        ImageName::parse("s3:bucket/lib/app:1.0.0").unwrap()
    }

    #[test]
    fn repack_is_deterministic_and_drops_repositories() {
        let export = sample_export(&[
            ("layer1/layer.tar", b"abc"),
            ("repositories", b"{\"old\":\"junk\"}"),
            ("manifest.json", b"[]"),
        ]);
        let input = write_temp(&export);

        let (first, digest_a) = repack(input.path(), &name(), "sha256:abc123").unwrap();
        let (second, digest_b) = repack(input.path(), &name(), "sha256:abc123").unwrap();
        assert_eq!(digest_a, digest_b);
        assert!(digest_a.starts_with("sha256-"));
        assert_eq!(
            fs::read(first.path()).unwrap(),
            fs::read(second.path()).unwrap()
        );

        // The rewritten archive ends with a canonical repositories entry.
        let bytes = fs::read(first.path()).unwrap();
        let mut archive = tar::Archive::new(Cursor::new(bytes));
        let mut paths = Vec::new();
        let mut last_body = Vec::new();
        for entry in archive.entries().unwrap() {
            let mut entry = entry.unwrap();
            paths.push(entry.path().unwrap().display().to_string());
            last_body.clear();
            entry.read_to_end(&mut last_body).unwrap();
        }
        assert_eq!(paths, vec!["layer1/layer.tar", "manifest.json", "repositories"]);

        // The key is the daemon-local name, so `docker load` re-creates the
        // tag the resolver will inspect after a pull.
        let map: serde_json::Value = serde_json::from_slice(&last_body).unwrap();
        assert_eq!(map["bucket/lib/app"]["1.0.0"], "abc123");
        assert_eq!(map["bucket/lib/app"][digest_a.as_str()], "abc123");
    }

    #[test]
    fn digest_ignores_the_old_repositories_entry() {
        let with = sample_export(&[
            ("layer1/layer.tar", b"abc"),
            ("repositories", b"{\"a\":\"b\"}"),
        ]);
        let without = sample_export(&[("layer1/layer.tar", b"abc")]);
        let (_, digest_with) = repack(write_temp(&with).path(), &name(), "sha256:x").unwrap();
        let (_, digest_without) =
            repack(write_temp(&without).path(), &name(), "sha256:x").unwrap();
        assert_eq!(digest_with, digest_without);
    }

    #[test]
    fn digest_tracks_entry_contents() {
        let a = sample_export(&[("layer1/layer.tar", b"abc")]);
        let b = sample_export(&[("layer1/layer.tar", b"abd")]);
        let (_, digest_a) = repack(write_temp(&a).path(), &name(), "sha256:x").unwrap();
        let (_, digest_b) = repack(write_temp(&b).path(), &name(), "sha256:x").unwrap();
        assert_ne!(digest_a, digest_b);
    }

    #[test]
    fn digest_map_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let store = ObjectStore::new(dir.path());
        assert_eq!(store.load_digest("sha256:abc").unwrap(), None);
        store.store_digest("sha256:abc", "sha256-feed").unwrap();
        assert_eq!(
            store.load_digest("sha256:abc").unwrap(),
            Some("sha256-feed".to_string())
        );
    }
}
