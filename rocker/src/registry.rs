//! Remote tag catalogs for the image resolver.
//!
//! Registries speaking the v2 protocol list tags at `/v2/<repo>/tags/list`.
//! When the first request bounces with a bearer challenge, the challenge
//! header is parsed for `realm`, `service` and `scope`, a token is fetched
//! from the realm, and the request is retried with it. A strict reference
//! needs no listing at all and is probed with a single manifest HEAD, which
//! also covers registries that do not implement listing. A 404 on listing
//! is an empty catalog, not an error.

use anyhow::{bail, Context, Result};
use imagename::ImageName;
use log::{debug, trace};
use regex::Regex;
use reqwest::header::{ACCEPT, WWW_AUTHENTICATE};
use reqwest::{Method, Response, StatusCode};
use serde::Deserialize;

const HUB_REGISTRY: &str = "registry-1.docker.io";
const HUB_ALIASES: &[&str] = &["docker.io", "index.docker.io", HUB_REGISTRY];

/// Media types accepted on manifest probes; harmless on tag listings.
const MANIFEST_ACCEPT: &str = "application/vnd.docker.distribution.manifest.v2+json, \
     application/vnd.docker.distribution.manifest.list.v2+json, \
     application/vnd.oci.image.manifest.v1+json, \
     application/vnd.oci.image.index.v1+json, \
     application/json";

#[derive(Debug, Deserialize)]
struct TagList {
    #[serde(default)]
    tags: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    #[serde(default)]
    token: String,
    #[serde(default)]
    access_token: String,
}

pub(crate) struct Catalog {
    client: reqwest::Client,
}

impl Catalog {
    pub(crate) fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }

    /// List the published tags a reference can resolve against.
    pub(crate) async fn list_tags(&self, name: &ImageName) -> Result<Vec<ImageName>> {
        let (host, repo) = host_and_repo(name);

        if name.is_strict() {
            // No listing needed; one manifest HEAD decides presence.
            let url = format!(
                "https://{host}/v2/{repo}/manifests/{}",
                name.tag_or_latest()
            );
            let response = self.request(Method::HEAD, &url).await?;
            return Ok(match response.status() {
                StatusCode::NOT_FOUND => Vec::new(),
                status if status.is_success() => vec![name.clone()],
                status => bail!("manifest probe of '{name}' failed with status {status}"),
            });
        }

        let url = format!("https://{host}/v2/{repo}/tags/list");
        let response = self.request(Method::GET, &url).await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(Vec::new());
        }
        if !response.status().is_success() {
            bail!(
                "tag listing for '{name}' failed with status {}",
                response.status()
            );
        }
        let list: TagList = response
            .json()
            .await
            .with_context(|| format!("invalid tag list for '{name}'"))?;
        trace!("{} tags for '{name}'", list.tags.len());
        Ok(list
            .tags
            .into_iter()
            .map(|tag| name.with_tag(tag))
            .collect())
    }

    /// Issue a request, performing the bearer-token dance on a 401.
    async fn request(&self, method: Method, url: &str) -> Result<Response> {
        let response = self
            .client
            .request(method.clone(), url)
            .header(ACCEPT, MANIFEST_ACCEPT)
            .send()
            .await
            .with_context(|| format!("request to '{url}' failed"))?;
        if response.status() != StatusCode::UNAUTHORIZED {
            return Ok(response);
        }

        let challenge = response
            .headers()
            .get(WWW_AUTHENTICATE)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string)
            .with_context(|| format!("401 from '{url}' without an auth challenge"))?;
        let token = self.fetch_token(&challenge).await?;
        debug!("Retrying '{url}' with a bearer token");
        self.client
            .request(method, url)
            .header(ACCEPT, MANIFEST_ACCEPT)
            .bearer_auth(token)
            .send()
            .await
            .with_context(|| format!("authorized request to '{url}' failed"))
    }

    async fn fetch_token(&self, challenge: &str) -> Result<String> {
        let fields = parse_challenge(challenge)?;
        let realm = fields
            .iter()
            .find(|(key, _)| key == "realm")
            .map(|(_, value)| value.clone())
            .with_context(|| format!("auth challenge '{challenge}' has no realm"))?;

        let mut request = self.client.get(&realm);
        for (key, value) in &fields {
            if key == "service" || key == "scope" {
                request = request.query(&[(key.as_str(), value.as_str())]);
            }
        }
        let response: TokenResponse = request
            .send()
            .await
            .with_context(|| format!("token request to '{realm}' failed"))?
            .error_for_status()
            .with_context(|| format!("token request to '{realm}' was rejected"))?
            .json()
            .await
            .context("invalid token response")?;

        let token = if response.token.is_empty() {
            response.access_token
        } else {
            response.token
        };
        if token.is_empty() {
            bail!("token endpoint '{realm}' returned no token");
        }
        Ok(token)
    }
}

/// The registry host to talk to and the repository path on it. Hub images
/// without a namespace live under `library/`.
fn host_and_repo(name: &ImageName) -> (String, String) {
    match name.registry.as_deref() {
        Some(host) if !HUB_ALIASES.contains(&host) => (host.to_string(), name.name.clone()),
        _ => {
            let repo = if name.name.contains('/') {
                name.name.clone()
            } else {
                format!("library/{}", name.name)
            };
            (HUB_REGISTRY.to_string(), repo)
        }
    }
}

/// Parse `Bearer realm="...",service="...",scope="..."` into key/value
/// pairs.
fn parse_challenge(header: &str) -> Result<Vec<(String, String)>> {
    // The header shape is stable enough that a field regex beats a parser.
    let field = Regex::new(r#"(\w+)="([^"]*)""#).context("invalid challenge pattern")?;
    Ok(field
        .captures_iter(header)
        .map(|caps| (caps[1].to_string(), caps[2].to_string()))
        .collect())
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn parses_bearer_challenge() {
        let fields = parse_challenge(
            r#"Bearer realm="https://auth.docker.io/token",service="registry.docker.io",scope="repository:library/busybox:pull""#,
        )
        .unwrap();
        assert_eq!(
            fields,
            vec![
                (
                    "realm".to_string(),
                    "https://auth.docker.io/token".to_string()
                ),
                ("service".to_string(), "registry.docker.io".to_string()),
                (
                    "scope".to_string(),
                    "repository:library/busybox:pull".to_string()
                ),
            ]
        );
    }

    #[test]
    fn hub_names_get_library_prefix() {
        let (host, repo) = host_and_repo(&ImageName::parse("busybox").unwrap());
        assert_eq!(host, HUB_REGISTRY);
        assert_eq!(repo, "library/busybox");

        let (host, repo) = host_and_repo(&ImageName::parse("grammarly/rocker").unwrap());
        assert_eq!(host, HUB_REGISTRY);
        assert_eq!(repo, "grammarly/rocker");

        let (host, repo) = host_and_repo(&ImageName::parse("quay.io/lib/x:1.0.0").unwrap());
        assert_eq!(host, "quay.io");
        assert_eq!(repo, "lib/x");
    }
}
