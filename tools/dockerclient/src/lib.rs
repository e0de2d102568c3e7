//! Container daemon client used by the build engine.
//!
//! The engine only speaks to the daemon through the [`ContainerClient`]
//! trait, which keeps the build logic testable against a fake daemon and
//! keeps the wire client swappable. The default implementation,
//! [`DockerDaemon`], talks to a local docker daemon through bollard.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

mod daemon;

pub use daemon::DockerDaemon;

pub type Result<T> = std::result::Result<T, error::Error>;

/// Container configuration inherited from an image and mutated by build
/// directives. Set-valued fields use ordered collections so that any
/// rendering of them is deterministic.
#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ImageConfig {
    pub env: Vec<String>,
    pub cmd: Vec<String>,
    pub entrypoint: Vec<String>,
    pub labels: BTreeMap<String, String>,
    pub exposed_ports: BTreeSet<String>,
    pub volumes: BTreeSet<String>,
    pub user: String,
    pub working_dir: String,
    pub on_build: Vec<String>,
}

/// An inspected image.
#[derive(Debug, Default, Clone)]
pub struct ImageView {
    pub id: String,
    pub parent: String,
    pub size: i64,
    pub config: ImageConfig,
}

/// An inspected container.
#[derive(Debug, Default, Clone)]
pub struct ContainerView {
    pub id: String,
    pub mounts: Vec<MountView>,
}

/// One row of a container's mount table.
#[derive(Debug, Default, Clone)]
pub struct MountView {
    pub source: String,
    pub destination: String,
}

/// A container creation request.
#[derive(Debug, Default, Clone)]
pub struct ContainerSpec {
    pub image: String,
    pub cmd: Vec<String>,
    pub entrypoint: Vec<String>,
    pub env: Vec<String>,
    pub user: String,
    pub working_dir: String,
    pub labels: BTreeMap<String, String>,
    pub exposed_ports: BTreeSet<String>,
    pub volumes: BTreeSet<String>,
    pub binds: Vec<String>,
    pub attach_stdin: bool,
    pub tty: bool,
}

impl ContainerSpec {
    /// Start from an image's inherited configuration.
    pub fn from_config(image: impl Into<String>, config: &ImageConfig) -> Self {
        Self {
            image: image.into(),
            cmd: config.cmd.clone(),
            entrypoint: config.entrypoint.clone(),
            env: config.env.clone(),
            user: config.user.clone(),
            working_dir: config.working_dir.clone(),
            labels: config.labels.clone(),
            exposed_ports: config.exposed_ports.clone(),
            volumes: config.volumes.clone(),
            ..Default::default()
        }
    }
}

/// The daemon operation set consumed by the build engine.
#[async_trait]
pub trait ContainerClient: Send + Sync {
    /// Inspect an image by name or id. "No such image" is `None`, not an
    /// error.
    async fn inspect_image(&self, name: &str) -> Result<Option<ImageView>>;

    async fn pull_image(&self, name: &str) -> Result<()>;

    /// Push a tag to its registry and return the content digest reported by
    /// the daemon.
    async fn push_image(&self, name: &str, tag: &str) -> Result<String>;

    async fn tag_image(&self, id: &str, repo: &str, tag: &str) -> Result<()>;

    /// All local `repo:tag` references.
    async fn list_images(&self) -> Result<Vec<String>>;

    async fn remove_image(&self, id: &str) -> Result<()>;

    async fn create_container(&self, spec: &ContainerSpec, name: Option<&str>) -> Result<String>;

    /// Start a created container, stream its output, and wait for it to
    /// exit. The attach is established before the start so no output is
    /// lost; with `attach_stdin` the local stdin is piped in as well.
    async fn run_container(&self, id: &str, attach_stdin: bool) -> Result<()>;

    /// Commit a container into a new image carrying the given configuration.
    async fn commit_container(
        &self,
        id: &str,
        message: &str,
        config: &ImageConfig,
    ) -> Result<ImageView>;

    async fn remove_container(&self, id: &str) -> Result<()>;

    /// Upload a tar stream into the container filesystem at `path`.
    async fn upload_to_container(&self, id: &str, tar: Vec<u8>, path: &str) -> Result<()>;

    /// Return the id of the named container, creating it (and pulling its
    /// image if needed) when absent. `purpose` is only used for logging.
    async fn ensure_container(
        &self,
        name: &str,
        spec: &ContainerSpec,
        purpose: &str,
    ) -> Result<String>;

    /// Inspect a container by name or id. "No such container" is `None`.
    async fn inspect_container(&self, name: &str) -> Result<Option<ContainerView>>;

    /// Export an image as a tar archive to a local file.
    async fn export_image(&self, name: &str, dest: &Path) -> Result<()>;

    /// Load an image tar archive produced by `export_image`.
    async fn load_image(&self, tar: &Path) -> Result<()>;

    /// Rewrite a path visible to this process into the path the daemon's
    /// host sees, for bind-mount sources when the builder itself runs in a
    /// container. A no-op outside of containers.
    async fn resolve_host_path(&self, path: &Path) -> Result<PathBuf>;
}

#[test]
fn spec_inherits_image_config() {
    let config = ImageConfig {
        env: vec!["A=1".to_string()],
        user: "build".to_string(),
        working_dir: "/srv".to_string(),
        ..Default::default()
    };
    let spec = ContainerSpec::from_config("sha256:abc", &config);
    assert_eq!(spec.image, "sha256:abc");
    assert_eq!(spec.env, vec!["A=1"]);
    assert_eq!(spec.user, "build");
    assert_eq!(spec.working_dir, "/srv");
    assert!(!spec.attach_stdin);
    assert!(spec.binds.is_empty());
}

pub mod error {
    use snafu::Snafu;

    #[derive(Debug, Snafu)]
    #[snafu(visibility(pub(crate)))]
    pub enum Error {
        #[snafu(display("failed to connect to the docker daemon: {source}"))]
        Connect { source: bollard::errors::Error },

        #[snafu(display("docker api call failed, {about}: {source}"))]
        Api {
            about: String,
            source: bollard::errors::Error,
        },

        #[snafu(display("container exited with code {code}"))]
        NonZeroExit { code: i64 },

        #[snafu(display("daemon response missing {what}"))]
        MissingField { what: String },

        #[snafu(display("io error, {about}: {source}"))]
        Io {
            about: String,
            source: std::io::Error,
        },

        #[snafu(display(
            "cannot resolve host paths for bind mounts on storage driver '{driver}', \
             only overlay-class drivers are supported"
        ))]
        UnsupportedDriver { driver: String },
    }
}
