use crate::build::{commands, plan, Build, BuildConfig};
use crate::cmd::{default_cache_dir, parse_key_val};
use crate::{parser, template};
use anyhow::{Context, Result};
use clap::Parser;
use dockerclient::{ContainerClient, DockerDaemon};
use log::{info, warn};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

/// Build an image from a Rockerfile.
#[derive(Debug, Parser)]
pub(crate) struct BuildCommand {
    /// Path to the build file. Defaults to Rockerfile in the context
    /// directory.
    #[clap(long = "file", short = 'f')]
    file: Option<PathBuf>,

    /// Build-time argument, allowed by a matching ARG directive.
    #[clap(long = "build-arg", value_parser = parse_key_val::<String, String>)]
    build_arg: Vec<(String, String)>,

    /// Template variable for the build file.
    #[clap(long = "var", value_parser = parse_key_val::<String, String>)]
    var: Vec<(String, String)>,

    /// YAML/JSON file with template variables. May be given multiple times.
    #[clap(long = "vars")]
    vars: Vec<PathBuf>,

    /// Run ATTACH directives interactively.
    #[clap(long)]
    attach: bool,

    /// Actually push images on PUSH directives (otherwise PUSH only tags).
    #[clap(long)]
    push: bool,

    /// Always check the remote for newer base images.
    #[clap(long)]
    pull: bool,

    /// Ignore the layer cache.
    #[clap(long = "no-cache")]
    no_cache: bool,

    /// Explicit build id, used to name reusable MOUNT volume containers.
    #[clap(long)]
    id: Option<String>,

    /// Write one artifact descriptor file per PUSH into this directory.
    #[clap(long = "artifacts-path")]
    artifacts_path: Option<PathBuf>,

    /// Cache directory. Defaults to ~/.rocker
    #[clap(long = "cache-dir")]
    cache_dir: Option<PathBuf>,

    /// Build context directory.
    #[clap(default_value = ".")]
    context: PathBuf,
}

impl BuildCommand {
    pub(super) async fn run(self) -> Result<()> {
        let context_dir = self
            .context
            .canonicalize()
            .with_context(|| format!("invalid context directory '{}'", self.context.display()))?;
        let file = self
            .file
            .clone()
            .unwrap_or_else(|| context_dir.join("Rockerfile"));
        let file_name = file
            .file_name()
            .map(|name| name.to_string_lossy().to_string())
            .unwrap_or_else(|| "Rockerfile".to_string());

        let content = std::fs::read_to_string(&file)
            .with_context(|| format!("failed to read build file '{}'", file.display()))?;
        let vars = template::collect_vars(&self.var, &self.vars)?;
        let expanded = template::expand(&content, &vars)?;
        let commands = commands::parse_commands(parser::parse(&expanded)?)?;
        let steps = plan::compile(commands, true);

        let cfg = BuildConfig {
            context_dir,
            file_name,
            build_id: self.id.clone(),
            cache_dir: self.cache_dir.clone().unwrap_or_else(default_cache_dir),
            pull: self.pull,
            push: self.push,
            attach: self.attach,
            no_cache: self.no_cache,
            build_args: self.build_arg.iter().cloned().collect::<BTreeMap<_, _>>(),
            artifacts_path: self.artifacts_path.clone(),
            final_cleanup: true,
        };

        let client = Arc::new(DockerDaemon::new()?);
        let mut build = Build::new(client.clone(), cfg)?;
        let active = build.active_container();

        tokio::select! {
            outcome = build.run(steps) => outcome?,
            _ = tokio::signal::ctrl_c() => {
                warn!("Interrupted, cleaning up");
                if let Some(id) = active.lock().await.take() {
                    let _ = client.remove_container(&id).await;
                }
                std::process::exit(2);
            }
        }

        info!(
            "Build added {} bytes of image data",
            build.produced_size()
        );
        if build.state.image_id.is_empty() {
            info!("Build produced no image");
        } else {
            println!("{}", build.state.image_id);
        }
        Ok(())
    }
}
