//! The bollard-backed docker daemon client.

use crate::error::{ApiSnafu, ConnectSnafu, IoSnafu};
use crate::{
    error, ContainerClient, ContainerSpec, ContainerView, ImageConfig, ImageView, MountView, Result,
};
use async_trait::async_trait;
use bollard::container::{
    AttachContainerOptions, AttachContainerResults, Config, CreateContainerOptions,
    RemoveContainerOptions, StartContainerOptions, UploadToContainerOptions,
    WaitContainerOptions,
};
use bollard::image::{
    CommitContainerOptions, CreateImageOptions, ImportImageOptions, ListImagesOptions,
    PushImageOptions, RemoveImageOptions, TagImageOptions,
};
use bollard::models::HostConfig;
use bollard::models::ImageConfig as BollardImageConfig;
use bollard::Docker;
use bytes::Bytes;
use futures::StreamExt;
use log::{debug, info, trace, warn};
use snafu::{OptionExt, ResultExt};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tokio::sync::oneshot;

/// Overlay-family storage drivers expose the container rootfs on the host
/// under a merged directory; other drivers give us nothing to map to.
const OVERLAY_DRIVERS: &[&str] = &["overlay", "overlay2"];

pub struct DockerDaemon {
    docker: Docker,
}

impl DockerDaemon {
    /// Connect using the standard environment (`DOCKER_HOST` or the local
    /// socket).
    pub fn new() -> Result<Self> {
        let docker = Docker::connect_with_local_defaults().context(ConnectSnafu)?;
        Ok(Self { docker })
    }

    fn not_found(err: &bollard::errors::Error) -> bool {
        matches!(
            err,
            bollard::errors::Error::DockerResponseServerError {
                status_code: 404,
                ..
            }
        )
    }
}

fn none_if_empty<T>(values: &[T]) -> Option<Vec<T>>
where
    T: Clone,
{
    if values.is_empty() {
        None
    } else {
        Some(values.to_vec())
    }
}

fn unit_map<'a, I: IntoIterator<Item = &'a String>>(keys: I) -> Option<HashMap<String, HashMap<(), ()>>> {
    let map: HashMap<String, HashMap<(), ()>> = keys
        .into_iter()
        .map(|key| (key.clone(), HashMap::new()))
        .collect();
    if map.is_empty() {
        None
    } else {
        Some(map)
    }
}

fn create_config(spec: &ContainerSpec) -> Config<String> {
    let host_config = HostConfig {
        binds: none_if_empty(&spec.binds),
        ..Default::default()
    };
    Config {
        image: Some(spec.image.clone()),
        cmd: none_if_empty(&spec.cmd),
        entrypoint: none_if_empty(&spec.entrypoint),
        env: none_if_empty(&spec.env),
        user: (!spec.user.is_empty()).then(|| spec.user.clone()),
        working_dir: (!spec.working_dir.is_empty()).then(|| spec.working_dir.clone()),
        labels: (!spec.labels.is_empty())
            .then(|| spec.labels.iter().map(|(k, v)| (k.clone(), v.clone())).collect()),
        exposed_ports: unit_map(&spec.exposed_ports),
        volumes: unit_map(&spec.volumes),
        attach_stdin: Some(spec.attach_stdin),
        open_stdin: Some(spec.attach_stdin),
        stdin_once: Some(spec.attach_stdin),
        tty: Some(spec.tty),
        host_config: Some(host_config),
        ..Default::default()
    }
}

fn commit_config(config: &ImageConfig) -> Config<String> {
    Config {
        cmd: none_if_empty(&config.cmd),
        entrypoint: none_if_empty(&config.entrypoint),
        env: none_if_empty(&config.env),
        user: (!config.user.is_empty()).then(|| config.user.clone()),
        working_dir: (!config.working_dir.is_empty()).then(|| config.working_dir.clone()),
        labels: (!config.labels.is_empty())
            .then(|| config.labels.iter().map(|(k, v)| (k.clone(), v.clone())).collect()),
        exposed_ports: unit_map(&config.exposed_ports),
        volumes: unit_map(&config.volumes),
        ..Default::default()
    }
}

fn view_config(config: Option<BollardImageConfig>) -> ImageConfig {
    let Some(config) = config else {
        return ImageConfig::default();
    };
    ImageConfig {
        env: config.env.unwrap_or_default(),
        cmd: config.cmd.unwrap_or_default(),
        entrypoint: config.entrypoint.unwrap_or_default(),
        labels: config.labels.unwrap_or_default().into_iter().collect(),
        exposed_ports: config
            .exposed_ports
            .unwrap_or_default()
            .into_keys()
            .collect(),
        volumes: config.volumes.unwrap_or_default().into_keys().collect(),
        user: config.user.unwrap_or_default(),
        working_dir: config.working_dir.unwrap_or_default(),
        on_build: config.on_build.unwrap_or_default(),
    }
}

#[async_trait]
impl ContainerClient for DockerDaemon {
    async fn inspect_image(&self, name: &str) -> Result<Option<ImageView>> {
        trace!("Inspecting image '{name}'");
        let inspect = match self.docker.inspect_image(name).await {
            Ok(inspect) => inspect,
            Err(ref err) if Self::not_found(err) => return Ok(None),
            Err(err) => {
                return Err(err).context(ApiSnafu {
                    about: format!("inspect image '{name}'"),
                })
            }
        };
        Ok(Some(ImageView {
            id: inspect.id.context(error::MissingFieldSnafu { what: "image id" })?,
            parent: inspect.parent.unwrap_or_default(),
            size: inspect.size.unwrap_or_default(),
            config: view_config(inspect.config),
        }))
    }

    async fn pull_image(&self, name: &str) -> Result<()> {
        info!("Pulling image '{name}'");
        let options = CreateImageOptions {
            from_image: name.to_string(),
            ..Default::default()
        };
        let mut stream = self.docker.create_image(Some(options), None, None);
        while let Some(progress) = stream.next().await {
            let progress = progress.context(ApiSnafu {
                about: format!("pull image '{name}'"),
            })?;
            if let Some(status) = progress.status {
                debug!("{status}");
            }
        }
        Ok(())
    }

    async fn push_image(&self, name: &str, tag: &str) -> Result<String> {
        info!("Pushing image '{name}:{tag}'");
        let options = PushImageOptions { tag: tag.to_string() };
        let mut stream = self.docker.push_image(name, Some(options), None);
        let mut digest = None;
        while let Some(progress) = stream.next().await {
            let progress = progress.context(ApiSnafu {
                about: format!("push image '{name}:{tag}'"),
            })?;
            if let Some(status) = progress.status {
                debug!("{status}");
                // The daemon reports "<tag>: digest: sha256:... size: ..." on
                // completion.
                if let Some(idx) = status.find("digest: ") {
                    digest = status[idx + "digest: ".len()..]
                        .split_whitespace()
                        .next()
                        .map(str::to_string);
                }
            }
        }
        digest.context(error::MissingFieldSnafu {
            what: "push digest",
        })
    }

    async fn tag_image(&self, id: &str, repo: &str, tag: &str) -> Result<()> {
        debug!("Tagging image '{id}' as '{repo}:{tag}'");
        let options = TagImageOptions {
            repo: repo.to_string(),
            tag: tag.to_string(),
        };
        self.docker
            .tag_image(id, Some(options))
            .await
            .context(ApiSnafu {
                about: format!("tag image '{id}' as '{repo}:{tag}'"),
            })
    }

    async fn list_images(&self) -> Result<Vec<String>> {
        let options = ListImagesOptions::<String> {
            all: false,
            ..Default::default()
        };
        let images = self
            .docker
            .list_images(Some(options))
            .await
            .context(ApiSnafu {
                about: "list images".to_string(),
            })?;
        Ok(images
            .into_iter()
            .flat_map(|image| image.repo_tags)
            .filter(|tag| !tag.starts_with("<none>"))
            .collect())
    }

    async fn remove_image(&self, id: &str) -> Result<()> {
        debug!("Removing image '{id}'");
        let options = RemoveImageOptions {
            force: true,
            ..Default::default()
        };
        self.docker
            .remove_image(id, Some(options), None)
            .await
            .map(|_| ())
            .context(ApiSnafu {
                about: format!("remove image '{id}'"),
            })
    }

    async fn create_container(&self, spec: &ContainerSpec, name: Option<&str>) -> Result<String> {
        let options = name.map(|name| CreateContainerOptions {
            name: name.to_string(),
            platform: None,
        });
        let response = self
            .docker
            .create_container(options, create_config(spec))
            .await
            .context(ApiSnafu {
                about: format!("create container from image '{}'", spec.image),
            })?;
        debug!("Created container '{}'", response.id);
        Ok(response.id)
    }

    async fn run_container(&self, id: &str, attach_stdin: bool) -> Result<()> {
        let options = AttachContainerOptions::<String> {
            stdin: Some(attach_stdin),
            stdout: Some(true),
            stderr: Some(true),
            stream: Some(true),
            logs: Some(false),
            detach_keys: None,
        };
        let AttachContainerResults { mut output, mut input } = self
            .docker
            .attach_container(id, Some(options))
            .await
            .context(ApiSnafu {
                about: format!("attach to container '{id}'"),
            })?;

        // The attach must be established before the container starts, or the
        // first bytes of output are lost. `done` suppresses attach errors
        // observed after the container already exited, which happens when
        // stdin stays attached across runs.
        let (ready_tx, ready_rx) = oneshot::channel::<()>();
        let (done_tx, mut done_rx) = oneshot::channel::<()>();
        let pump = tokio::spawn(async move {
            let mut stdout = tokio::io::stdout();
            let _ = ready_tx.send(());
            loop {
                tokio::select! {
                    _ = &mut done_rx => break,
                    item = output.next() => match item {
                        Some(Ok(log)) => {
                            if stdout.write_all(log.into_bytes().as_ref()).await.is_err() {
                                break;
                            }
                            let _ = stdout.flush().await;
                        }
                        Some(Err(err)) => {
                            debug!("Attach stream ended: {err}");
                            break;
                        }
                        None => break,
                    },
                }
            }
        });

        let stdin_pump = attach_stdin.then(|| {
            tokio::spawn(async move {
                let mut stdin = tokio::io::stdin();
                let _ = tokio::io::copy(&mut stdin, &mut input).await;
            })
        });

        ready_rx.await.ok();
        self.docker
            .start_container(id, None::<StartContainerOptions<String>>)
            .await
            .context(ApiSnafu {
                about: format!("start container '{id}'"),
            })?;

        let mut wait = self
            .docker
            .wait_container(id, None::<WaitContainerOptions<String>>);
        let status = wait.next().await;
        let _ = done_tx.send(());
        let _ = pump.await;
        if let Some(stdin_pump) = stdin_pump {
            stdin_pump.abort();
        }

        match status {
            Some(Ok(response)) if response.status_code == 0 => Ok(()),
            Some(Ok(response)) => error::NonZeroExitSnafu {
                code: response.status_code,
            }
            .fail(),
            Some(Err(bollard::errors::Error::DockerContainerWaitError { code, .. })) => {
                error::NonZeroExitSnafu { code }.fail()
            }
            Some(Err(err)) => Err(err).context(ApiSnafu {
                about: format!("wait for container '{id}'"),
            }),
            None => error::MissingFieldSnafu {
                what: "container wait status",
            }
            .fail(),
        }
    }

    async fn commit_container(
        &self,
        id: &str,
        message: &str,
        config: &ImageConfig,
    ) -> Result<ImageView> {
        let options = CommitContainerOptions::<String> {
            container: id.to_string(),
            repo: String::new(),
            tag: String::new(),
            comment: message.to_string(),
            author: String::new(),
            pause: true,
            changes: None,
        };
        let commit = self
            .docker
            .commit_container(options, commit_config(config))
            .await
            .context(ApiSnafu {
                about: format!("commit container '{id}'"),
            })?;
        let image_id = commit.id.context(error::MissingFieldSnafu {
            what: "committed image id",
        })?;
        self.inspect_image(&image_id)
            .await?
            .context(error::MissingFieldSnafu {
                what: "committed image",
            })
    }

    async fn remove_container(&self, id: &str) -> Result<()> {
        debug!("Removing container '{id}'");
        let options = RemoveContainerOptions {
            force: true,
            ..Default::default()
        };
        self.docker
            .remove_container(id, Some(options))
            .await
            .context(ApiSnafu {
                about: format!("remove container '{id}'"),
            })
    }

    async fn upload_to_container(&self, id: &str, tar: Vec<u8>, path: &str) -> Result<()> {
        let options = UploadToContainerOptions {
            path: path.to_string(),
            no_overwrite_dir_non_dir: String::new(),
        };
        self.docker
            .upload_to_container(id, Some(options), Bytes::from(tar))
            .await
            .context(ApiSnafu {
                about: format!("upload archive to container '{id}' at '{path}'"),
            })
    }

    async fn ensure_container(
        &self,
        name: &str,
        spec: &ContainerSpec,
        purpose: &str,
    ) -> Result<String> {
        if let Some(existing) = self.inspect_container(name).await? {
            trace!("Reusing {purpose} container '{name}'");
            return Ok(existing.id);
        }
        info!("Creating {purpose} container '{name}'");
        if self.inspect_image(&spec.image).await?.is_none() {
            self.pull_image(&spec.image).await?;
        }
        self.create_container(spec, Some(name)).await
    }

    async fn inspect_container(&self, name: &str) -> Result<Option<ContainerView>> {
        let inspect = match self.docker.inspect_container(name, None).await {
            Ok(inspect) => inspect,
            Err(ref err) if Self::not_found(err) => return Ok(None),
            Err(err) => {
                return Err(err).context(ApiSnafu {
                    about: format!("inspect container '{name}'"),
                })
            }
        };
        Ok(Some(ContainerView {
            id: inspect.id.context(error::MissingFieldSnafu {
                what: "container id",
            })?,
            mounts: inspect
                .mounts
                .unwrap_or_default()
                .into_iter()
                .map(|mount| MountView {
                    source: mount.source.unwrap_or_default(),
                    destination: mount.destination.unwrap_or_default(),
                })
                .collect(),
        }))
    }

    async fn export_image(&self, name: &str, dest: &Path) -> Result<()> {
        info!("Exporting image '{name}' to '{}'", dest.display());
        let mut stream = self.docker.export_image(name);
        let mut file = tokio::fs::File::create(dest).await.context(IoSnafu {
            about: format!("create '{}'", dest.display()),
        })?;
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.context(ApiSnafu {
                about: format!("export image '{name}'"),
            })?;
            file.write_all(&chunk).await.context(IoSnafu {
                about: format!("write '{}'", dest.display()),
            })?;
        }
        file.flush().await.context(IoSnafu {
            about: format!("flush '{}'", dest.display()),
        })
    }

    async fn load_image(&self, tar: &Path) -> Result<()> {
        info!("Loading image archive '{}'", tar.display());
        let bytes = tokio::fs::read(tar).await.context(IoSnafu {
            about: format!("read '{}'", tar.display()),
        })?;
        let options = ImportImageOptions {
            ..Default::default()
        };
        let mut stream =
            self.docker
                .import_image(options, Bytes::from(bytes), None);
        while let Some(progress) = stream.next().await {
            let progress = progress.context(ApiSnafu {
                about: format!("load image archive '{}'", tar.display()),
            })?;
            if let Some(status) = progress.stream {
                debug!("{}", status.trim_end());
            }
        }
        Ok(())
    }

    async fn resolve_host_path(&self, path: &Path) -> Result<PathBuf> {
        if !Path::new("/.dockerenv").exists() {
            return Ok(path.to_path_buf());
        }
        let Ok(hostname) = std::env::var("HOSTNAME") else {
            return Ok(path.to_path_buf());
        };
        let this = match self.docker.inspect_container(&hostname, None).await {
            Ok(inspect) => inspect,
            Err(err) => {
                warn!("Running in a container but could not inspect '{hostname}': {err}");
                return Ok(path.to_path_buf());
            }
        };

        // Bind-mounted paths map through the mount table.
        for mount in this.mounts.unwrap_or_default() {
            let (Some(source), Some(destination)) = (mount.source, mount.destination) else {
                continue;
            };
            if let Ok(rest) = path.strip_prefix(&destination) {
                return Ok(PathBuf::from(source).join(rest));
            }
        }

        // Anything else lives in the container's own filesystem, which the
        // host only exposes for overlay-class drivers.
        let graph = this.graph_driver.context(error::MissingFieldSnafu {
            what: "graph driver",
        })?;
        if !OVERLAY_DRIVERS.contains(&graph.name.as_str()) {
            return error::UnsupportedDriverSnafu { driver: graph.name }.fail();
        }
        let merged = graph
            .data
            .get("MergedDir")
            .context(error::MissingFieldSnafu {
                what: "overlay merged dir",
            })?;
        let rest = path.strip_prefix("/").unwrap_or(path);
        Ok(PathBuf::from(merged).join(rest))
    }
}
