//! A local cache for ADD's remote sources.
//!
//! Downloads live under `<cache_dir>/url_fetcher_cache/<sha(url)[0:2]>/<sha(url)>`
//! with a `.json` sidecar recording the etag, size, and base name. A cached
//! file is revalidated with `If-None-Match` when the server supplied an etag.

use anyhow::{ensure, Context, Result};
use log::{debug, info};
use reqwest::header::{ETAG, IF_NONE_MATCH};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};

const CACHE_SUBDIR: &str = "url_fetcher_cache";

#[derive(Debug, Serialize, Deserialize)]
struct UrlMeta {
    etag: Option<String>,
    size: u64,
    base_name: String,
}

pub(crate) struct UrlFetcher {
    root: PathBuf,
    client: reqwest::Client,
}

impl UrlFetcher {
    pub(crate) fn new(cache_dir: &Path) -> Self {
        Self {
            root: cache_dir.join(CACHE_SUBDIR),
            client: reqwest::Client::new(),
        }
    }

    /// Fetch (or revalidate) a url, returning the cached file path and the
    /// base name to use for it inside the image.
    pub(crate) async fn fetch(&self, url: &str) -> Result<(PathBuf, String)> {
        let key = hex::encode(Sha256::digest(url.as_bytes()));
        let dir = self.root.join(&key[0..2]);
        let body_path = dir.join(&key);
        let meta_path = dir.join(format!("{key}.json"));

        let cached: Option<UrlMeta> = std::fs::read(&meta_path)
            .ok()
            .and_then(|bytes| serde_json::from_slice(&bytes).ok())
            .filter(|_| body_path.is_file());

        let mut request = self.client.get(url);
        if let Some(meta) = &cached {
            if let Some(etag) = &meta.etag {
                request = request.header(IF_NONE_MATCH, etag.clone());
            }
        }

        let response = request
            .send()
            .await
            .with_context(|| format!("failed to fetch '{url}'"))?;

        if response.status() == StatusCode::NOT_MODIFIED {
            let meta = cached.context("server returned 304 for a url that is not cached")?;
            debug!("Using cached download for '{url}'");
            return Ok((body_path, meta.base_name));
        }
        ensure!(
            response.status().is_success(),
            "failed to fetch '{url}': status {}",
            response.status()
        );

        info!("Downloading '{url}'");
        let etag = response
            .headers()
            .get(ETAG)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string);
        let bytes = response
            .bytes()
            .await
            .with_context(|| format!("failed to read body of '{url}'"))?;

        std::fs::create_dir_all(&dir)
            .with_context(|| format!("failed to create '{}'", dir.display()))?;
        std::fs::write(&body_path, &bytes)
            .with_context(|| format!("failed to write '{}'", body_path.display()))?;

        let meta = UrlMeta {
            etag,
            size: bytes.len() as u64,
            base_name: base_name(url),
        };
        std::fs::write(&meta_path, serde_json::to_vec_pretty(&meta)?)
            .with_context(|| format!("failed to write '{}'", meta_path.display()))?;

        Ok((body_path, meta.base_name))
    }
}

/// The file name a url maps to inside the image.
fn base_name(url: &str) -> String {
    url::Url::parse(url)
        .ok()
        .and_then(|parsed| {
            parsed
                .path_segments()
                .and_then(|segments| segments.last().map(str::to_string))
        })
        .filter(|name| !name.is_empty())
        .unwrap_or_else(|| "download".to_string())
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn base_name_from_path() {
        assert_eq!(base_name("https://example.com/dist/tool.tar.gz"), "tool.tar.gz");
        assert_eq!(base_name("https://example.com/"), "download");
        assert_eq!(base_name("https://example.com"), "download");
    }
}
