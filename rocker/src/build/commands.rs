//! One handler per build-file directive.
//!
//! Every command exposes the same small capability set: `describe` returns
//! the original source line, `should_run` gates execution on build flags,
//! `replace_env` performs shell-style variable expansion where the directive
//! accepts it, and `execute` applies the directive to the build state,
//! calling the daemon where needed. Handlers append commit strings through
//! [`Build::push_commit`] so the fingerprint they produce is deterministic.

use super::{exports, mounts, tarfile, Build};
use crate::artifacts::{self, Artifact};
use crate::parser::SourceCommand;
use anyhow::{bail, ensure, Context, Result};
use chrono::Utc;
use dockerclient::ContainerSpec;
use imagename::ImageName;
use log::{debug, info};
use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;

/// Directive names that may never appear as ONBUILD triggers.
const FORBIDDEN_TRIGGERS: &[&str] = &["onbuild", "from", "maintainer"];

#[derive(Debug, Clone)]
pub(crate) enum Command {
    From(SourceCommand),
    Maintainer(SourceCommand),
    Arg(SourceCommand),
    Env(SourceCommand),
    Label(SourceCommand),
    Workdir(SourceCommand),
    Cmd(SourceCommand),
    Entrypoint(SourceCommand),
    Expose(SourceCommand),
    Volume(SourceCommand),
    User(SourceCommand),
    Onbuild(SourceCommand),
    Run(SourceCommand),
    Attach(SourceCommand),
    Copy(SourceCommand),
    Add(SourceCommand),
    Tag(SourceCommand),
    Push(SourceCommand),
    Mount(SourceCommand),
    Export(SourceCommand),
    Import(SourceCommand),
    /// Decorator around a directive injected from a base image's ONBUILD
    /// triggers; its commits read `ONBUILD <original>`.
    OnbuildWrapped(Box<Command>),
}

impl Command {
    pub(crate) fn try_from_source(src: SourceCommand) -> Result<Self> {
        let name = src.name.clone();
        let command = match name.as_str() {
            "from" => {
                ensure_args(&src, 1, 1)?;
                Command::From(src)
            }
            "maintainer" => Command::Maintainer(src),
            "arg" => {
                ensure_args(&src, 1, 1)?;
                Command::Arg(src)
            }
            "env" => {
                ensure_args(&src, 1, usize::MAX)?;
                Command::Env(src)
            }
            "label" => {
                ensure_args(&src, 1, usize::MAX)?;
                Command::Label(src)
            }
            "workdir" => {
                ensure_args(&src, 1, 1)?;
                Command::Workdir(src)
            }
            "cmd" => Command::Cmd(src),
            "entrypoint" => Command::Entrypoint(src),
            "expose" => {
                ensure_args(&src, 1, usize::MAX)?;
                Command::Expose(src)
            }
            "volume" => {
                ensure_args(&src, 1, usize::MAX)?;
                Command::Volume(src)
            }
            "user" => {
                ensure_args(&src, 1, 1)?;
                Command::User(src)
            }
            "onbuild" => {
                let first = src
                    .rest
                    .split_whitespace()
                    .next()
                    .context("ONBUILD requires a trigger")?
                    .to_lowercase();
                if FORBIDDEN_TRIGGERS.contains(&first.as_str()) {
                    bail!("ONBUILD may not trigger {}", first.to_uppercase());
                }
                Command::Onbuild(src)
            }
            "run" => {
                ensure!(
                    !src.rest.trim().is_empty(),
                    "RUN requires a command (line {})",
                    src.line
                );
                Command::Run(src)
            }
            "attach" => Command::Attach(src),
            "copy" => {
                ensure_args(&src, 2, usize::MAX)?;
                Command::Copy(src)
            }
            "add" => {
                ensure_args(&src, 2, usize::MAX)?;
                Command::Add(src)
            }
            "tag" => {
                ensure_args(&src, 1, 1)?;
                Command::Tag(src)
            }
            "push" => {
                ensure_args(&src, 1, 1)?;
                Command::Push(src)
            }
            "mount" => {
                ensure_args(&src, 1, usize::MAX)?;
                Command::Mount(src)
            }
            "export" => {
                ensure_args(&src, 1, usize::MAX)?;
                Command::Export(src)
            }
            "import" => {
                ensure_args(&src, 1, usize::MAX)?;
                Command::Import(src)
            }
            other => bail!("unknown directive '{}' on line {}", other.to_uppercase(), src.line),
        };
        Ok(command)
    }

    fn source(&self) -> &SourceCommand {
        match self {
            Command::From(src)
            | Command::Maintainer(src)
            | Command::Arg(src)
            | Command::Env(src)
            | Command::Label(src)
            | Command::Workdir(src)
            | Command::Cmd(src)
            | Command::Entrypoint(src)
            | Command::Expose(src)
            | Command::Volume(src)
            | Command::User(src)
            | Command::Onbuild(src)
            | Command::Run(src)
            | Command::Attach(src)
            | Command::Copy(src)
            | Command::Add(src)
            | Command::Tag(src)
            | Command::Push(src)
            | Command::Mount(src)
            | Command::Export(src)
            | Command::Import(src) => src,
            Command::OnbuildWrapped(inner) => inner.source(),
        }
    }

    /// The directive name, for the plan compiler's classification.
    pub(crate) fn name(&self) -> &str {
        match self {
            Command::OnbuildWrapped(inner) => inner.name(),
            _ => &self.source().name,
        }
    }

    /// The original source line.
    pub(crate) fn describe(&self) -> String {
        match self {
            Command::OnbuildWrapped(inner) => format!("ONBUILD {}", inner.describe()),
            _ => self.source().original.clone(),
        }
    }

    pub(crate) fn should_run(&self, build: &Build) -> bool {
        match self {
            Command::Attach(_) => build.cfg.attach,
            Command::OnbuildWrapped(inner) => inner.should_run(build),
            _ => true,
        }
    }

    /// Whether the runner should expand `$VAR` in the arguments first.
    pub(crate) fn wants_env_replaced(&self) -> bool {
        matches!(
            self,
            Command::Env(_)
                | Command::Label(_)
                | Command::Workdir(_)
                | Command::Expose(_)
                | Command::Volume(_)
                | Command::User(_)
                | Command::Copy(_)
                | Command::Add(_)
                | Command::Tag(_)
                | Command::Push(_)
                | Command::Mount(_)
                | Command::Export(_)
                | Command::Import(_)
        ) || matches!(self, Command::OnbuildWrapped(inner) if inner.wants_env_replaced())
    }

    pub(crate) fn replace_env(&mut self, env: &BTreeMap<String, String>) {
        let src = match self {
            Command::OnbuildWrapped(inner) => return inner.replace_env(env),
            Command::From(src)
            | Command::Maintainer(src)
            | Command::Arg(src)
            | Command::Env(src)
            | Command::Label(src)
            | Command::Workdir(src)
            | Command::Cmd(src)
            | Command::Entrypoint(src)
            | Command::Expose(src)
            | Command::Volume(src)
            | Command::User(src)
            | Command::Onbuild(src)
            | Command::Run(src)
            | Command::Attach(src)
            | Command::Copy(src)
            | Command::Add(src)
            | Command::Tag(src)
            | Command::Push(src)
            | Command::Mount(src)
            | Command::Export(src)
            | Command::Import(src) => src,
        };
        for arg in &mut src.args {
            *arg = super::shell::expand(arg, env);
        }
        src.rest = super::shell::expand(&src.rest, env);
    }

    pub(crate) fn execute<'a>(
        &'a self,
        build: &'a mut Build,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + 'a>> {
        Box::pin(async move {
            match self {
                Command::From(src) => execute_from(src, build).await,
                Command::Maintainer(_) => Ok(()),
                Command::Arg(src) => execute_arg(src, build),
                Command::Env(src) => execute_env(src, build),
                Command::Label(src) => execute_label(src, build),
                Command::Workdir(src) => execute_workdir(src, build),
                Command::Cmd(src) => execute_cmd(src, build),
                Command::Entrypoint(src) => execute_entrypoint(src, build),
                Command::Expose(src) => execute_expose(src, build),
                Command::Volume(src) => execute_volume(src, build),
                Command::User(src) => execute_user(src, build),
                Command::Onbuild(src) => execute_onbuild(src, build),
                Command::Run(src) => execute_run(src, build).await,
                Command::Attach(src) => execute_attach(src, build).await,
                Command::Copy(src) => execute_copy(src, build, false).await,
                Command::Add(src) => execute_copy(src, build, true).await,
                Command::Tag(src) => execute_tag(src, build).await,
                Command::Push(src) => execute_push(src, build).await,
                Command::Mount(src) => execute_mount(src, build).await,
                Command::Export(src) => execute_export(src, build).await,
                Command::Import(src) => execute_import(src, build).await,
                Command::OnbuildWrapped(inner) => {
                    build.onbuild = true;
                    let outcome = inner.execute(build).await;
                    build.onbuild = false;
                    outcome
                }
            }
        })
    }
}

fn ensure_args(src: &SourceCommand, min: usize, max: usize) -> Result<()> {
    ensure!(
        src.args.len() >= min && src.args.len() <= max,
        "wrong number of arguments for {} on line {}",
        src.name.to_uppercase(),
        src.line
    );
    Ok(())
}

async fn execute_from(src: &SourceCommand, build: &mut Build) -> Result<()> {
    build.state.reset_stage();
    let reference = &src.args[0];
    if reference == "scratch" {
        build.state.no_base_image = true;
        return Ok(());
    }
    let name = ImageName::parse(reference)
        .with_context(|| format!("invalid image reference on line {}", src.line))?;
    let image = build.storage.lookup(&name, build.cfg.pull).await?;
    debug!("FROM {name} resolved to {}", image.id);
    build.state.image_id = image.id;
    build.state.size = image.size;
    build.state.config = image.config;
    // Triggers run in this build; they are not inherited further.
    build.state.inject = std::mem::take(&mut build.state.config.on_build);
    Ok(())
}

fn execute_arg(src: &SourceCommand, build: &mut Build) -> Result<()> {
    let (key, default) = match src.args[0].split_once('=') {
        Some((key, value)) => (key, Some(value.to_string())),
        None => (src.args[0].as_str(), None),
    };
    if build.cfg.build_args.contains_key(key) {
        build.consumed_args.insert(key.to_string());
    }
    let value = build.cfg.build_args.get(key).cloned().or(default);
    if let Some(value) = value {
        build.state.no_cache.build_args.insert(key.to_string(), value);
    }
    Ok(())
}

fn execute_env(src: &SourceCommand, build: &mut Build) -> Result<()> {
    let pairs: Vec<(String, String)> = if src.args.len() >= 2 && !src.args[0].contains('=') {
        vec![(src.args[0].clone(), src.args[1..].join(" "))]
    } else {
        src.args
            .iter()
            .map(|arg| {
                arg.split_once('=')
                    .map(|(k, v)| (k.to_string(), v.to_string()))
                    .with_context(|| format!("ENV expects key=value, got '{arg}'"))
            })
            .collect::<Result<_>>()?
    };
    for (key, value) in &pairs {
        upsert_env(&mut build.state.config.env, key, value);
    }
    let mut sorted: Vec<String> = pairs.iter().map(|(k, v)| format!("{k}={v}")).collect();
    sorted.sort();
    build.push_commit(format!("ENV {}", sorted.join(" ")));
    Ok(())
}

fn execute_label(src: &SourceCommand, build: &mut Build) -> Result<()> {
    let mut added = BTreeMap::new();
    for arg in &src.args {
        let (key, value) = arg
            .split_once('=')
            .with_context(|| format!("LABEL expects key=value, got '{arg}'"))?;
        added.insert(key.to_string(), value.to_string());
    }
    let rendered: Vec<String> = added.iter().map(|(k, v)| format!("{k}={v}")).collect();
    build.state.config.labels.extend(added);
    build.push_commit(format!("LABEL {}", rendered.join(" ")));
    Ok(())
}

fn execute_workdir(src: &SourceCommand, build: &mut Build) -> Result<()> {
    let dir = &src.args[0];
    let absolute = if dir.starts_with('/') {
        dir.clone()
    } else {
        let base = build.state.config.working_dir.trim_end_matches('/');
        format!("{base}/{dir}")
    };
    build.state.config.working_dir = absolute.clone();
    build.push_commit(format!("WORKDIR {absolute}"));
    Ok(())
}

fn execute_cmd(src: &SourceCommand, build: &mut Build) -> Result<()> {
    build.state.config.cmd = shell_or_exec(src);
    build.state.no_cache.cmd_set = true;
    let rendered = serde_json::to_string(&build.state.config.cmd)?;
    build.push_commit(format!("CMD {rendered}"));
    Ok(())
}

fn execute_entrypoint(src: &SourceCommand, build: &mut Build) -> Result<()> {
    build.state.config.entrypoint = shell_or_exec(src);
    // An ENTRYPOINT resets CMD unless this stage already set one.
    if !build.state.no_cache.cmd_set {
        build.state.config.cmd.clear();
    }
    let rendered = serde_json::to_string(&build.state.config.entrypoint)?;
    build.push_commit(format!("ENTRYPOINT {rendered}"));
    Ok(())
}

fn execute_expose(src: &SourceCommand, build: &mut Build) -> Result<()> {
    for arg in &src.args {
        let port = if arg.contains('/') {
            arg.clone()
        } else {
            format!("{arg}/tcp")
        };
        let (number, _proto) = port.split_once('/').unwrap_or((port.as_str(), "tcp"));
        number
            .parse::<u16>()
            .with_context(|| format!("invalid port spec '{arg}'"))?;
        build.state.config.exposed_ports.insert(port);
    }
    let rendered: Vec<String> = build.state.config.exposed_ports.iter().cloned().collect();
    build.push_commit(format!("EXPOSE {}", rendered.join(" ")));
    Ok(())
}

fn execute_volume(src: &SourceCommand, build: &mut Build) -> Result<()> {
    build
        .state
        .config
        .volumes
        .extend(src.args.iter().cloned());
    let rendered: Vec<String> = build.state.config.volumes.iter().cloned().collect();
    build.push_commit(format!("VOLUME {}", rendered.join(" ")));
    Ok(())
}

fn execute_user(src: &SourceCommand, build: &mut Build) -> Result<()> {
    build.state.config.user = src.args[0].clone();
    build.push_commit(format!("USER {}", src.args[0]));
    Ok(())
}

fn execute_onbuild(src: &SourceCommand, build: &mut Build) -> Result<()> {
    let trigger = src.rest.trim().to_string();
    build.state.config.on_build.push(trigger.clone());
    build.push_commit(format!("ONBUILD {trigger}"));
    Ok(())
}

async fn execute_run(src: &SourceCommand, build: &mut Build) -> Result<()> {
    ensure!(
        !build.state.image_id.is_empty(),
        "RUN requires a base image"
    );
    let cmd = shell_or_exec(src);
    let display = if src.json {
        serde_json::to_string(&src.args)?
    } else {
        src.rest.clone()
    };
    // Allowed build args salt the fingerprint; the `|<n>` sentinel cannot
    // collide with a user command.
    let args_env: Vec<String> = build
        .state
        .no_cache
        .build_args
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect();
    let fingerprint = if args_env.is_empty() {
        display.clone()
    } else {
        format!("|{} {} {}", args_env.len(), args_env.join(" "), display)
    };
    build.push_commit(format!("RUN {fingerprint}"));
    if build.probe_cache().await? {
        return Ok(());
    }

    let mut spec = ContainerSpec::from_config(build.state.image_id.as_str(), &build.state.config);
    spec.cmd = cmd;
    spec.entrypoint = Vec::new();
    spec.env.extend(args_env);
    spec.binds = build.state.no_cache.binds.clone();
    let id = build.client.create_container(&spec, None).await?;
    build.track_container(&id).await;
    build.client.run_container(&id, false).await?;
    build.state.no_cache.container_id = id;
    Ok(())
}

async fn execute_attach(src: &SourceCommand, build: &mut Build) -> Result<()> {
    ensure!(
        !build.state.image_id.is_empty(),
        "ATTACH requires a base image"
    );
    let mut spec = ContainerSpec::from_config(build.state.image_id.as_str(), &build.state.config);
    if !src.args.is_empty() || !src.rest.trim().is_empty() {
        spec.cmd = shell_or_exec(src);
        spec.entrypoint = Vec::new();
    }
    spec.binds = build.state.no_cache.binds.clone();
    spec.attach_stdin = true;
    spec.tty = true;
    let id = build.client.create_container(&spec, None).await?;
    build.track_container(&id).await;
    info!("Attaching to container '{id}', detach with ctrl-c");
    let outcome = build.client.run_container(&id, true).await;
    build.client.remove_container(&id).await?;
    build.untrack_container().await;
    // The interactive session leaves the build state untouched.
    outcome.map_err(Into::into)
}

async fn execute_copy(src: &SourceCommand, build: &mut Build, is_add: bool) -> Result<()> {
    ensure!(
        !build.state.image_id.is_empty() || build.state.no_base_image,
        "{} requires a FROM first",
        if is_add { "ADD" } else { "COPY" }
    );
    let name = if is_add { "ADD" } else { "COPY" };
    let (sources, dest) = split_sources(&src.args);
    let dest = if dest.starts_with('/') {
        dest
    } else {
        let base = build.state.config.working_dir.trim_end_matches('/');
        format!("{base}/{dest}")
    };

    let mut local_sources = Vec::new();
    let mut fetched = Vec::new();
    for source in &sources {
        if is_add && (source.starts_with("http://") || source.starts_with("https://")) {
            let (path, base_name) = build.urls.fetch(source).await?;
            fetched.push((path, base_name));
        } else {
            local_sources.push(source.clone());
        }
    }

    let packed = tarfile::pack(
        &build.cfg.context_dir,
        &local_sources,
        &fetched,
        &dest,
        &build.ignore,
    )
    .with_context(|| format!("{name} failed to pack the build context"))?;
    debug!("{name} packed {} files, checksum {}", packed.entries, packed.checksum);

    build.push_commit(format!("{name} {} to {dest}", packed.checksum));
    if build.probe_cache().await? {
        return Ok(());
    }

    let mut spec = ContainerSpec::from_config(build.state.image_id.as_str(), &build.state.config);
    spec.cmd = vec![
        "/bin/sh".to_string(),
        "-c".to_string(),
        format!("#(nop) {name} {}", packed.checksum),
    ];
    spec.entrypoint = Vec::new();
    spec.binds = build.state.no_cache.binds.clone();
    let id = build.client.create_container(&spec, None).await?;
    build.track_container(&id).await;
    build
        .client
        .upload_to_container(&id, packed.data, "/")
        .await?;
    build.state.no_cache.container_id = id;
    Ok(())
}

async fn execute_tag(src: &SourceCommand, build: &mut Build) -> Result<()> {
    ensure!(!build.state.image_id.is_empty(), "cannot tag an empty image");
    let name = ImageName::parse(&src.args[0])
        .with_context(|| format!("invalid tag reference on line {}", src.line))?;
    build
        .client
        .tag_image(&build.state.image_id, &name.repo(), name.tag_or_latest())
        .await?;
    info!("Tagged {} as {}", build.state.image_id, name);
    Ok(())
}

async fn execute_push(src: &SourceCommand, build: &mut Build) -> Result<()> {
    ensure!(!build.state.image_id.is_empty(), "cannot push an empty image");
    let name = ImageName::parse(&src.args[0])
        .with_context(|| format!("invalid push reference on line {}", src.line))?;
    build
        .client
        .tag_image(&build.state.image_id, &name.repo(), name.tag_or_latest())
        .await?;
    if !build.cfg.push {
        info!("Not pushing '{name}' because --push was not given");
        return Ok(());
    }
    let digest = build.storage.push(&name, &build.state.image_id).await?;
    info!("Pushed '{name}' with digest {digest}");
    if let Some(dir) = &build.cfg.artifacts_path {
        let artifact = Artifact {
            name: name.repo(),
            tag: name.tag_or_latest().to_string(),
            digest,
            image_id: build.state.image_id.clone(),
            build_time: Utc::now(),
            pushed: true,
        };
        let path = artifacts::write(dir, &artifact)?;
        debug!("Wrote artifact descriptor '{}'", path.display());
    }
    Ok(())
}

async fn execute_mount(src: &SourceCommand, build: &mut Build) -> Result<()> {
    let identity = build.cfg.mount_identity();
    let mut commit_parts = Vec::new();
    for arg in &src.args {
        match mounts::parse_mount(arg)? {
            mounts::Mount::Volume { destination } => {
                let (helper_id, bind) =
                    mounts::ensure_volume_bind(&*build.client, &identity, &destination).await?;
                commit_parts.push(format!("{helper_id}:{destination}:rw"));
                build.state.no_cache.binds.push(bind);
            }
            mounts::Mount::Host {
                source,
                destination,
            } => {
                let bind = mounts::host_bind(
                    &*build.client,
                    &build.cfg.context_dir,
                    &source,
                    &destination,
                )
                .await?;
                commit_parts.push(bind.clone());
                build.state.no_cache.binds.push(bind);
            }
        }
    }
    commit_parts.sort();
    build.push_commit(format!("MOUNT {}", commit_parts.join(" ")));
    Ok(())
}

async fn execute_export(src: &SourceCommand, build: &mut Build) -> Result<()> {
    ensure!(
        !build.state.image_id.is_empty(),
        "EXPORT requires a base image"
    );
    let (sources, dest) = split_sources_with_default(&src.args);
    let previous = (!build.state.exports_id.is_empty()).then(|| build.state.exports_id.clone());
    build.push_commit(format!(
        "EXPORT {} to {dest}, prev_export_container: {}",
        sources.join(","),
        build.state.exports_id
    ));
    // The helper is named after the fingerprint that produces it, so cache
    // hits find the helper of the earlier identical build.
    let helper = exports::helper_name(&build.state.image_id, &build.state.commits);
    if build.probe_cache().await? {
        build.state.exports_id = helper;
        return Ok(());
    }

    exports::ensure_helper(&*build.client, &helper, previous.as_deref()).await?;
    let mut binds = exports::binds_of(&*build.client, &helper).await?;
    binds.extend(build.state.no_cache.binds.clone());

    let mut target = format!("{}{}", exports::EXPORTS_ROOT, dest);
    if sources.len() > 1 && !target.ends_with('/') {
        target.push('/');
    }
    let mut cmd = vec![exports::SYNC_BIN.to_string(), "-a".to_string()];
    cmd.extend(sources.iter().cloned());
    cmd.push(target);

    let mut spec = ContainerSpec::from_config(build.state.image_id.as_str(), &build.state.config);
    spec.cmd = cmd;
    spec.entrypoint = Vec::new();
    spec.binds = binds;
    let id = build.client.create_container(&spec, None).await?;
    build.track_container(&id).await;
    build.client.run_container(&id, false).await?;
    build.state.no_cache.container_id = id;
    build.state.exports_id = helper;
    Ok(())
}

async fn execute_import(src: &SourceCommand, build: &mut Build) -> Result<()> {
    ensure!(
        !build.state.exports_id.is_empty(),
        "IMPORT requires a preceding EXPORT"
    );
    let (sources, dest) = split_sources_with_default(&src.args);
    build.push_commit(format!(
        "IMPORT {} {} to {dest}",
        build.state.exports_id,
        sources.join(",")
    ));
    if build.probe_cache().await? {
        return Ok(());
    }

    let helper = build.state.exports_id.clone();
    let mut binds = exports::binds_of(&*build.client, &helper).await?;
    binds.extend(build.state.no_cache.binds.clone());

    let mut target = dest.clone();
    if sources.len() > 1 && !target.ends_with('/') {
        target.push('/');
    }
    let mut cmd = vec![exports::SYNC_BIN.to_string(), "-a".to_string()];
    for source in &sources {
        cmd.push(format!(
            "{}/{}",
            exports::EXPORTS_ROOT,
            source.trim_start_matches('/')
        ));
    }
    cmd.push(target);

    let mut spec = ContainerSpec::from_config(build.state.image_id.as_str(), &build.state.config);
    spec.cmd = cmd;
    spec.entrypoint = Vec::new();
    spec.binds = binds;
    let id = build.client.create_container(&spec, None).await?;
    build.track_container(&id).await;
    build.client.run_container(&id, false).await?;
    build.state.no_cache.container_id = id;
    Ok(())
}

fn shell_or_exec(src: &SourceCommand) -> Vec<String> {
    if src.json {
        src.args.clone()
    } else {
        vec![
            "/bin/sh".to_string(),
            "-c".to_string(),
            src.rest.clone(),
        ]
    }
}

fn split_sources(args: &[String]) -> (Vec<String>, String) {
    let (dest, sources) = args.split_last().map(|(d, s)| (d.clone(), s.to_vec())).unwrap_or_default();
    (sources, dest)
}

/// EXPORT/IMPORT with a single argument default the destination to `/`.
fn split_sources_with_default(args: &[String]) -> (Vec<String>, String) {
    if args.len() == 1 {
        (args.to_vec(), "/".to_string())
    } else {
        split_sources(args)
    }
}

fn upsert_env(env: &mut Vec<String>, key: &str, value: &str) {
    let prefix = format!("{key}=");
    let entry = format!("{key}={value}");
    match env.iter_mut().find(|existing| existing.starts_with(&prefix)) {
        Some(existing) => *existing = entry,
        None => env.push(entry),
    }
}

pub(crate) fn parse_commands(sources: Vec<SourceCommand>) -> Result<Vec<Command>> {
    sources.into_iter().map(Command::try_from_source).collect()
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::parser;

    fn command(line: &str) -> Command {
        Command::try_from_source(parser::parse_line(line).unwrap()).unwrap()
    }

    #[test]
    fn rejects_unknown_directives() {
        let src = parser::parse_line("TELEPORT somewhere").unwrap();
        assert!(Command::try_from_source(src).is_err());
    }

    #[test]
    fn rejects_nested_onbuild() {
        for line in [
            "ONBUILD ONBUILD RUN true",
            "ONBUILD FROM busybox",
            "ONBUILD MAINTAINER x",
        ] {
            let src = parser::parse_line(line).unwrap();
            assert!(Command::try_from_source(src).is_err(), "{line}");
        }
    }

    #[test]
    fn describe_returns_source_line() {
        assert_eq!(command("RUN echo hi").describe(), "RUN echo hi");
        let wrapped = Command::OnbuildWrapped(Box::new(command("RUN echo hi")));
        assert_eq!(wrapped.describe(), "ONBUILD RUN echo hi");
        assert_eq!(wrapped.name(), "run");
    }

    #[test]
    fn replace_env_expands_args() {
        let mut cmd = command("WORKDIR $BASE/app");
        let env = [("BASE".to_string(), "/srv".to_string())].into_iter().collect();
        cmd.replace_env(&env);
        assert_eq!(cmd.source().args[0], "/srv/app");
    }

    #[test]
    fn upsert_replaces_existing_key() {
        let mut env = vec!["A=1".to_string(), "B=2".to_string()];
        upsert_env(&mut env, "A", "9");
        upsert_env(&mut env, "C", "3");
        assert_eq!(env, vec!["A=9", "B=2", "C=3"]);
    }

    #[test]
    fn export_defaults_destination() {
        let (sources, dest) = split_sources_with_default(&["f".to_string()]);
        assert_eq!(sources, vec!["f"]);
        assert_eq!(dest, "/");
        let (sources, dest) =
            split_sources_with_default(&["a".to_string(), "b".to_string(), "/out/".to_string()]);
        assert_eq!(sources, vec!["a", "b"]);
        assert_eq!(dest, "/out/");
    }
}
