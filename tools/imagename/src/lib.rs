//! Image reference parsing and resolution.
//!
//! A reference has the shape `[storage:]host[:port]/name[:tag|@digest]`. The
//! storage prefix selects where the image lives: a docker registry (the
//! default) or an object store (`s3:`). Tags may be literal strings, content
//! digests, or semver expressions (`1.5.*`, `~1.5.2`, `^1.5`, ranges); semver
//! tags are resolved against a catalog of published tags, picking the highest
//! contained version.

use semver::{Version, VersionReq};
use snafu::{ensure, Snafu};
use std::fmt::{Display, Formatter};
use std::str::FromStr;

const DIGEST_HEX_LEN: usize = 64;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("invalid image reference '{reference}'"))]
    InvalidReference { reference: String },

    #[snafu(display("invalid image digest '{digest}', expected sha256 + 64 hex chars"))]
    InvalidDigest { digest: String },
}

pub type Result<T> = std::result::Result<T, Error>;

/// Where an image is stored and transferred from.
#[derive(Debug, Default, Clone, Copy, Eq, PartialEq, Hash)]
pub enum Storage {
    #[default]
    Registry,
    ObjectStore,
}

/// A parsed image reference such as `quay.io/lib/x:1.5.*` or
/// `s3:my-bucket/app:latest`.
#[derive(Debug, Default, Clone, Eq, PartialEq, Hash)]
pub struct ImageName {
    pub storage: Storage,
    /// Registry host (or object-store bucket), e.g. `quay.io:5000`.
    pub registry: Option<String>,
    /// Repository path, e.g. `lib/x`.
    pub name: String,
    /// Raw tag text. `None` means the reference was untagged.
    pub tag: Option<String>,
}

/// What kind of tag a reference carries, which decides how it resolves.
#[derive(Debug, Clone, PartialEq)]
pub enum TagKind {
    None,
    Literal(String),
    Digest(String),
    Range(VersionReq),
}

impl ImageName {
    pub fn parse(reference: &str) -> Result<Self> {
        let (storage, explicit_storage, rest) = split_storage(reference);

        let (rest, tag) = if let Some((name_part, digest)) = rest.split_once('@') {
            ensure!(
                is_digest_str(digest),
                InvalidDigestSnafu { digest }
            );
            (name_part, Some(digest.to_string()))
        } else {
            split_tag(rest)
        };

        let (registry, name) = split_host(rest, explicit_storage);
        ensure!(!name.is_empty(), InvalidReferenceSnafu { reference });

        Ok(Self {
            storage,
            registry,
            name,
            tag,
        })
    }

    /// The reference with an explicit tag, substituting `latest` when untagged.
    pub fn tag_or_latest(&self) -> &str {
        self.tag.as_deref().unwrap_or("latest")
    }

    /// A copy of this reference carrying the given tag.
    pub fn with_tag<S: Into<String>>(&self, tag: S) -> Self {
        Self {
            tag: Some(tag.into()),
            ..self.clone()
        }
    }

    pub fn kind(&self) -> TagKind {
        let Some(tag) = self.tag.as_deref() else {
            return TagKind::None;
        };
        if is_digest_str(tag) {
            return TagKind::Digest(tag.to_string());
        }
        let plain = tag.trim_start_matches('v');
        if Version::parse(plain).is_ok() {
            // An exact semver version is a strict tag, matched literally.
            return TagKind::Literal(tag.to_string());
        }
        if let Ok(req) = VersionReq::parse(plain) {
            return TagKind::Range(req);
        }
        TagKind::Literal(tag.to_string())
    }

    pub fn is_digest(&self) -> bool {
        matches!(self.kind(), TagKind::Digest(_))
    }

    /// A strict reference names exactly one image: a literal tag, an exact
    /// semver version, or a digest. Ranges and untagged references are not
    /// strict.
    pub fn is_strict(&self) -> bool {
        matches!(self.kind(), TagKind::Literal(_) | TagKind::Digest(_))
    }

    pub fn version_req(&self) -> Option<VersionReq> {
        match self.kind() {
            TagKind::Range(req) => Some(req),
            _ => None,
        }
    }

    /// True when this reference's range contains the other reference's
    /// version tag. A wildcard never matches itself as a published tag.
    pub fn contains(&self, other: &ImageName) -> bool {
        if self.registry != other.registry || self.name != other.name {
            return false;
        }
        let Some(req) = self.version_req() else {
            return false;
        };
        match candidate_version(other) {
            Some(version) => req.matches(&version),
            None => false,
        }
    }

    /// Pick the candidate this reference resolves to: an equal literal tag
    /// beats everything, an untagged query takes `latest`, and a range query
    /// takes the greatest contained semver (ties broken by lexicographic
    /// tag). `None` when nothing matches.
    pub fn resolve<'a>(&self, candidates: &'a [ImageName]) -> Option<&'a ImageName> {
        let pool: Vec<&ImageName> = candidates
            .iter()
            .filter(|c| c.registry == self.registry && c.name == self.name)
            .collect();

        if self.tag.is_some() {
            // Strict equality beats range containment, but a wildcard never
            // matches itself as a published tag.
            if self.is_strict() {
                if let Some(exact) = pool.iter().find(|c| c.tag == self.tag).copied() {
                    return Some(exact);
                }
            }
        } else {
            return pool
                .iter()
                .find(|c| c.tag.as_deref() == Some("latest"))
                .copied();
        }

        let req = self.version_req()?;
        let mut best: Option<(&ImageName, Version)> = None;
        for candidate in pool {
            let Some(version) = candidate_version(candidate) else {
                continue;
            };
            if !req.matches(&version) {
                continue;
            }
            let better = match &best {
                None => true,
                Some((current, current_version)) => {
                    version > *current_version
                        || (version == *current_version && candidate.tag > current.tag)
                }
            };
            if better {
                best = Some((candidate, version));
            }
        }
        best.map(|(candidate, _)| candidate)
    }

    /// The repository part as the docker daemon knows it, without tag or
    /// storage prefix.
    pub fn repo(&self) -> String {
        match &self.registry {
            Some(registry) => format!("{registry}/{}", self.name),
            None => self.name.clone(),
        }
    }

    /// The name as the docker daemon knows it, without the storage prefix.
    pub fn local(&self) -> String {
        let mut out = String::new();
        if let Some(registry) = &self.registry {
            out.push_str(registry);
            out.push('/');
        }
        out.push_str(&self.name);
        match &self.tag {
            Some(tag) if tag.starts_with("sha256:") => {
                out.push('@');
                out.push_str(tag);
            }
            Some(tag) => {
                out.push(':');
                out.push_str(tag);
            }
            None => {}
        }
        out
    }
}

impl Display for ImageName {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        if self.storage == Storage::ObjectStore {
            f.write_str("s3:")?;
        }
        f.write_str(&self.local())
    }
}

impl FromStr for ImageName {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

fn is_digest_str(tag: &str) -> bool {
    let hex = match tag.strip_prefix("sha256:").or_else(|| tag.strip_prefix("sha256-")) {
        Some(hex) => hex,
        None => return false,
    };
    hex.len() == DIGEST_HEX_LEN && hex.chars().all(|c| c.is_ascii_hexdigit())
}

fn split_storage(reference: &str) -> (Storage, bool, &str) {
    if let Some(rest) = reference.strip_prefix("s3:") {
        if !first_segment_is_port(rest) {
            return (Storage::ObjectStore, true, rest);
        }
    }
    if let Some(rest) = reference.strip_prefix("registry:") {
        // `registry:5000/name` is a host with a port, not a storage prefix.
        if !first_segment_is_port(rest) {
            return (Storage::Registry, true, rest);
        }
    }
    (Storage::Registry, false, reference)
}

fn first_segment_is_port(rest: &str) -> bool {
    let segment = rest.split('/').next().unwrap_or("");
    !segment.is_empty() && segment.chars().all(|c| c.is_ascii_digit())
}

/// Split the trailing tag off, disambiguating a port in the host: the
/// segment after the last `:` is only a tag when it contains no `/`.
fn split_tag(rest: &str) -> (&str, Option<String>) {
    match rest.rfind(':') {
        Some(idx) if !rest[idx + 1..].contains('/') && idx + 1 < rest.len() => {
            (&rest[..idx], Some(rest[idx + 1..].to_string()))
        }
        _ => (rest, None),
    }
}

fn split_host(rest: &str, explicit_storage: bool) -> (Option<String>, String) {
    match rest.split_once('/') {
        Some((first, remainder))
            if explicit_storage
                || first.contains('.')
                || first.contains(':')
                || first == "localhost" =>
        {
            (Some(first.to_string()), remainder.to_string())
        }
        _ => (None, rest.to_string()),
    }
}

fn candidate_version(candidate: &ImageName) -> Option<Version> {
    let tag = candidate.tag.as_deref()?;
    Version::parse(tag.trim_start_matches('v')).ok()
}
