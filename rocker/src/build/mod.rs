//! The build engine: plan execution, the commit state machine, and stage
//! cleanup.

pub(crate) mod cache;
pub(crate) mod commands;
pub(crate) mod exports;
pub(crate) mod ignore;
pub(crate) mod mounts;
pub(crate) mod plan;
pub(crate) mod shell;
pub(crate) mod state;
pub(crate) mod tarfile;
pub(crate) mod urlcache;

use crate::parser;
use crate::storage::Storage;
use anyhow::{bail, ensure, Context, Result};
use cache::{CacheEntry, LayerCache};
use commands::Command;
use dockerclient::{ContainerClient, ContainerSpec};
use ignore::IgnorePatterns;
use log::{debug, info};
use plan::Step;
use state::BuildState;
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::Mutex;
use urlcache::UrlFetcher;

/// Process-wide build configuration, assembled once by the CLI and threaded
/// into every handler.
#[derive(Debug, Default, Clone)]
pub(crate) struct BuildConfig {
    pub context_dir: PathBuf,
    pub file_name: String,
    /// Explicit build identity for mount helper naming; defaults to the
    /// context directory plus build file name.
    pub build_id: Option<String>,
    pub cache_dir: PathBuf,
    pub pull: bool,
    pub push: bool,
    pub attach: bool,
    pub no_cache: bool,
    pub build_args: BTreeMap<String, String>,
    pub artifacts_path: Option<PathBuf>,
    pub final_cleanup: bool,
}

impl BuildConfig {
    pub(crate) fn mount_identity(&self) -> String {
        self.build_id.clone().unwrap_or_else(|| {
            format!("{}:{}", self.context_dir.display(), self.file_name)
        })
    }
}

pub(crate) struct Build {
    pub(crate) client: Arc<dyn ContainerClient>,
    pub(crate) storage: Storage,
    pub(crate) cfg: BuildConfig,
    pub(crate) state: BuildState,
    pub(crate) ignore: IgnorePatterns,
    pub(crate) urls: UrlFetcher,
    pub(crate) consumed_args: BTreeSet<String>,
    /// Commit strings from ONBUILD-injected directives get prefixed.
    pub(crate) onbuild: bool,
    cache: LayerCache,
    /// The container currently being worked on, removed on interrupt or
    /// error.
    active_container: Arc<Mutex<Option<String>>>,
    produced_size: i64,
}

impl std::fmt::Debug for Build {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Build")
            .field("cfg", &self.cfg)
            .field("state", &self.state)
            .field("onbuild", &self.onbuild)
            .field("consumed_args", &self.consumed_args)
            .field("produced_size", &self.produced_size)
            .finish()
    }
}

impl Build {
    pub(crate) fn new(client: Arc<dyn ContainerClient>, cfg: BuildConfig) -> Result<Self> {
        let ignore = IgnorePatterns::load(&cfg.context_dir)?;
        let cache = LayerCache::new(&cfg.cache_dir);
        let urls = UrlFetcher::new(&cfg.cache_dir);
        let storage = Storage::new(client.clone(), &cfg.cache_dir);
        Ok(Self {
            client,
            storage,
            cfg,
            state: BuildState::default(),
            ignore,
            urls,
            consumed_args: BTreeSet::new(),
            onbuild: false,
            cache,
            active_container: Arc::new(Mutex::new(None)),
            produced_size: 0,
        })
    }

    /// Shared handle to the in-flight container id, for interrupt cleanup.
    pub(crate) fn active_container(&self) -> Arc<Mutex<Option<String>>> {
        self.active_container.clone()
    }

    pub(crate) async fn track_container(&self, id: &str) {
        *self.active_container.lock().await = Some(id.to_string());
    }

    pub(crate) async fn untrack_container(&self) {
        *self.active_container.lock().await = None;
    }

    pub(crate) fn push_commit(&mut self, message: String) {
        let message = if self.onbuild {
            format!("ONBUILD {message}")
        } else {
            message
        };
        self.state.commits.push(message);
    }

    pub(crate) fn produced_size(&self) -> i64 {
        self.produced_size
    }

    /// Execute the compiled plan.
    pub(crate) async fn run(&mut self, plan: Vec<Step>) -> Result<()> {
        let outcome = self.run_steps(plan).await;
        if outcome.is_err() {
            // Leave no half-built container behind when the build aborts.
            if let Some(id) = self.active_container.lock().await.take() {
                let _ = self.client.remove_container(&id).await;
            }
        }
        outcome
    }

    async fn run_steps(&mut self, plan: Vec<Step>) -> Result<()> {
        let mut steps: VecDeque<Step> = plan.into();
        while let Some(step) = steps.pop_front() {
            match step {
                Step::Command(mut command) => {
                    if !command.should_run(self) {
                        debug!("Skipping {}", command.describe());
                        continue;
                    }
                    if command.wants_env_replaced() {
                        let env = self.command_env();
                        command.replace_env(&env);
                    }
                    info!("{}", command.describe());
                    command.execute(self).await?;
                    if !self.state.inject.is_empty() {
                        let triggers = std::mem::take(&mut self.state.inject);
                        for step in self.compile_triggers(&triggers)?.into_iter().rev() {
                            steps.push_front(step);
                        }
                    }
                }
                Step::Commit => self.commit().await?,
                Step::Cleanup { is_final, tagged } => self.cleanup(is_final, tagged).await?,
            }
        }

        let unused: Vec<String> = self
            .cfg
            .build_args
            .keys()
            .filter(|key| !self.consumed_args.contains(*key))
            .cloned()
            .collect();
        ensure!(
            unused.is_empty(),
            "unused build-args [{}]",
            unused.join(", ")
        );
        Ok(())
    }

    /// The commit state machine: materialize accumulated commits as a new
    /// snapshot, preferring a cached one when no container is pending.
    async fn commit(&mut self) -> Result<()> {
        if self.state.commits.is_empty() {
            return Ok(());
        }
        if self.state.image_id.is_empty() && !self.state.no_base_image {
            bail!("no base image to commit onto, missing FROM?");
        }
        let message = self.state.join_commits();

        if self.state.no_cache.container_id.is_empty() {
            if self.probe_cache().await? {
                return Ok(());
            }
            // Nothing ran; commit configuration changes through an empty
            // no-op container.
            let mut spec =
                ContainerSpec::from_config(self.state.image_id.as_str(), &self.state.config);
            spec.cmd = vec![
                "/bin/sh".to_string(),
                "-c".to_string(),
                format!("#(nop) {message}"),
            ];
            spec.entrypoint = Vec::new();
            let id = self.client.create_container(&spec, None).await?;
            self.track_container(&id).await;
            self.state.no_cache.container_id = id;
        }

        let container_id = self.state.no_cache.container_id.clone();
        let image = self
            .client
            .commit_container(&container_id, &message, &self.state.config)
            .await?;
        debug!("Committed '{message}' as {}", image.id);

        let commit_list = self.state.commits.clone();
        let delta = self.state.advance(&image, true);
        self.produced_size += delta;

        self.client.remove_container(&container_id).await?;
        self.state.no_cache.container_id.clear();
        self.untrack_container().await;

        self.cache.put(&CacheEntry {
            parent_id: self.state.parent_id.clone(),
            image_id: self.state.image_id.clone(),
            commit_list,
        })?;
        Ok(())
    }

    /// Try to adopt a cached snapshot for the current fingerprint. Entries
    /// whose snapshot no longer exists are dropped.
    pub(crate) async fn probe_cache(&mut self) -> Result<bool> {
        if self.cfg.no_cache || self.state.no_cache.cache_busted {
            return Ok(false);
        }
        let Some(entry) = self.cache.get(&self.state)? else {
            // Once one probe misses, everything after it in the stage is new
            // work; skip further lookups.
            self.state.no_cache.cache_busted = true;
            return Ok(false);
        };
        let Some(image) = self.client.inspect_image(&entry.image_id).await? else {
            debug!("Cached snapshot {} is gone, dropping entry", entry.image_id);
            self.cache.del(&entry)?;
            self.state.no_cache.cache_busted = true;
            return Ok(false);
        };
        debug!("Cache hit: {}", entry.image_id);
        let delta = self.state.advance(&image, false);
        self.produced_size += delta;
        Ok(true)
    }

    /// A stage boundary: drop the stage image when it is an untagged
    /// intermediate, then reset state for the next stage.
    async fn cleanup(&mut self, is_final: bool, tagged: bool) -> Result<()> {
        if !is_final
            && !tagged
            && self.state.produced_image
            && !self.state.image_id.is_empty()
        {
            info!("Removing intermediate image {}", self.state.image_id);
            if let Err(err) = self.client.remove_image(&self.state.image_id).await {
                log::warn!("Could not remove intermediate image: {err}");
            }
        }
        let image_id = self.state.image_id.clone();
        self.state.reset_stage();
        if is_final {
            self.state.image_id = image_id;
        }
        Ok(())
    }

    /// ONBUILD triggers lifted from a base image become wrapped commands,
    /// compiled as a plan fragment and spliced after the current step.
    fn compile_triggers(&self, triggers: &[String]) -> Result<Vec<Step>> {
        let mut commands = Vec::with_capacity(triggers.len());
        for trigger in triggers {
            info!("Injecting ONBUILD {trigger}");
            let source = parser::parse_line(trigger)
                .with_context(|| format!("invalid ONBUILD trigger '{trigger}'"))?;
            let command = Command::try_from_source(source)
                .with_context(|| format!("invalid ONBUILD trigger '{trigger}'"))?;
            commands.push(Command::OnbuildWrapped(Box::new(command)));
        }
        Ok(plan::compile_fragment(commands))
    }

    /// Environment for `$VAR` expansion: the stage's config env with allowed
    /// build args layered on top.
    fn command_env(&self) -> BTreeMap<String, String> {
        let mut env: BTreeMap<String, String> = self
            .state
            .config
            .env
            .iter()
            .filter_map(|entry| {
                entry
                    .split_once('=')
                    .map(|(k, v)| (k.to_string(), v.to_string()))
            })
            .collect();
        env.extend(self.state.no_cache.build_args.clone());
        env
    }
}

#[cfg(test)]
mod test {
    use super::commands::parse_commands;
    use super::*;
    use crate::test::FakeDaemon;
    use dockerclient::{ImageConfig, ImageView};
    use std::path::Path;

    fn config(context: &Path, cache: &Path) -> BuildConfig {
        BuildConfig {
            context_dir: context.to_path_buf(),
            file_name: "Rockerfile".to_string(),
            cache_dir: cache.to_path_buf(),
            final_cleanup: true,
            ..Default::default()
        }
    }

    async fn run_build(
        daemon: Arc<FakeDaemon>,
        cfg: BuildConfig,
        content: &str,
    ) -> Result<Build> {
        let commands = parse_commands(parser::parse(content).unwrap())?;
        let steps = plan::compile(commands, cfg.final_cleanup);
        let mut build = Build::new(daemon, cfg)?;
        build.run(steps).await?;
        Ok(build)
    }

    fn seed_busybox(daemon: &Arc<FakeDaemon>) {
        daemon.seed_image(
            "busybox",
            ImageView {
                id: "sha256:busybox0".to_string(),
                size: 100,
                ..Default::default()
            },
        );
    }

    #[tokio::test]
    async fn cached_rebuild_creates_no_containers() {
        let context = tempfile::tempdir().unwrap();
        let cache = tempfile::tempdir().unwrap();
        let daemon = FakeDaemon::new();
        seed_busybox(&daemon);
        let content = "FROM busybox\nRUN touch /t\n";

        let first = run_build(daemon.clone(), config(context.path(), cache.path()), content)
            .await
            .unwrap();
        let first_id = first.state.image_id.clone();
        assert!(!first_id.is_empty());
        let creates_after_first = daemon.op_count("create");

        let second = run_build(daemon.clone(), config(context.path(), cache.path()), content)
            .await
            .unwrap();
        assert_eq!(second.state.image_id, first_id);
        assert_eq!(daemon.op_count("create"), creates_after_first);
    }

    #[tokio::test]
    async fn run_commits_are_cached_per_fingerprint() {
        let context = tempfile::tempdir().unwrap();
        let cache = tempfile::tempdir().unwrap();
        let daemon = FakeDaemon::new();
        seed_busybox(&daemon);

        run_build(
            daemon.clone(),
            config(context.path(), cache.path()),
            "FROM busybox\nRUN touch /a\n",
        )
        .await
        .unwrap();
        let creates = daemon.op_count("create");

        // A different command is a different fingerprint and must not hit.
        run_build(
            daemon.clone(),
            config(context.path(), cache.path()),
            "FROM busybox\nRUN touch /b\n",
        )
        .await
        .unwrap();
        assert!(daemon.op_count("create") > creates);
    }

    #[tokio::test]
    async fn expose_commit_is_order_independent() {
        let context = tempfile::tempdir().unwrap();
        let daemon_a = FakeDaemon::new();
        let daemon_b = FakeDaemon::new();
        seed_busybox(&daemon_a);
        seed_busybox(&daemon_b);
        let cache_a = tempfile::tempdir().unwrap();
        let cache_b = tempfile::tempdir().unwrap();

        run_build(
            daemon_a.clone(),
            config(context.path(), cache_a.path()),
            "FROM busybox\nEXPOSE 80 81\n",
        )
        .await
        .unwrap();
        run_build(
            daemon_b.clone(),
            config(context.path(), cache_b.path()),
            "FROM busybox\nEXPOSE 81 80\n",
        )
        .await
        .unwrap();
        assert_eq!(daemon_a.commit_messages(), daemon_b.commit_messages());
    }

    #[tokio::test]
    async fn unused_build_args_fail_the_build() {
        let context = tempfile::tempdir().unwrap();
        let cache = tempfile::tempdir().unwrap();
        let daemon = FakeDaemon::new();
        seed_busybox(&daemon);
        let mut cfg = config(context.path(), cache.path());
        cfg.build_args.insert("BAR".to_string(), "1".to_string());

        let err = run_build(daemon, cfg, "FROM busybox\nRUN true\n")
            .await
            .unwrap_err();
        assert!(err.to_string().contains("unused build-args [BAR]"), "{err}");
    }

    #[tokio::test]
    async fn build_args_salt_run_fingerprints() {
        let context = tempfile::tempdir().unwrap();
        let cache = tempfile::tempdir().unwrap();
        let daemon = FakeDaemon::new();
        seed_busybox(&daemon);
        let mut cfg = config(context.path(), cache.path());
        cfg.build_args.insert("FOO".to_string(), "custom".to_string());

        run_build(daemon.clone(), cfg, "FROM busybox\nARG FOO=default\nRUN echo $FOO\n")
            .await
            .unwrap();
        let messages = daemon.commit_messages().join("\n");
        assert!(messages.contains("|1 FOO=custom"), "{messages}");
    }

    #[tokio::test]
    async fn arg_default_applies_when_not_supplied() {
        let context = tempfile::tempdir().unwrap();
        let cache = tempfile::tempdir().unwrap();
        let daemon = FakeDaemon::new();
        seed_busybox(&daemon);

        run_build(
            daemon.clone(),
            config(context.path(), cache.path()),
            "FROM busybox\nARG FOO=default\nRUN echo $FOO\n",
        )
        .await
        .unwrap();
        let messages = daemon.commit_messages().join("\n");
        assert!(messages.contains("|1 FOO=default"), "{messages}");
    }

    #[tokio::test]
    async fn attach_is_a_noop_without_flag() {
        let context = tempfile::tempdir().unwrap();
        let cache = tempfile::tempdir().unwrap();
        let daemon = FakeDaemon::new();
        seed_busybox(&daemon);

        run_build(
            daemon.clone(),
            config(context.path(), cache.path()),
            "FROM busybox\nATTACH\n",
        )
        .await
        .unwrap();
        assert_eq!(daemon.op_count("create"), 0);
    }

    #[tokio::test]
    async fn push_without_flag_behaves_as_tag() {
        let context = tempfile::tempdir().unwrap();
        let cache = tempfile::tempdir().unwrap();
        let daemon = FakeDaemon::new();
        seed_busybox(&daemon);

        run_build(
            daemon.clone(),
            config(context.path(), cache.path()),
            "FROM busybox\nRUN true\nPUSH app:1.0.0\n",
        )
        .await
        .unwrap();
        assert_eq!(daemon.op_count("tag"), 1);
        assert_eq!(daemon.op_count("push"), 0);
    }

    #[tokio::test]
    async fn onbuild_triggers_are_injected_and_marked() {
        let context = tempfile::tempdir().unwrap();
        let cache = tempfile::tempdir().unwrap();
        let daemon = FakeDaemon::new();
        daemon.seed_image(
            "base",
            ImageView {
                id: "sha256:base0".to_string(),
                size: 10,
                config: ImageConfig {
                    on_build: vec!["RUN echo hi".to_string()],
                    ..Default::default()
                },
                ..Default::default()
            },
        );

        run_build(
            daemon.clone(),
            config(context.path(), cache.path()),
            "FROM base\nRUN true\n",
        )
        .await
        .unwrap();
        let messages = daemon.commit_messages().join("\n");
        assert!(messages.contains("ONBUILD RUN echo hi"), "{messages}");
    }

    #[tokio::test]
    async fn mount_binds_apply_to_following_runs() {
        let context = tempfile::tempdir().unwrap();
        let cache = tempfile::tempdir().unwrap();
        let daemon = FakeDaemon::new();
        seed_busybox(&daemon);

        run_build(
            daemon.clone(),
            config(context.path(), cache.path()),
            "FROM busybox\nMOUNT /data\nRUN touch /data/x\nRUN ls /data/x\n",
        )
        .await
        .unwrap();
        // The two RUN containers carry the same helper-backed bind.
        let binds: Vec<String> = daemon
            .created_specs()
            .into_iter()
            .filter(|spec| !spec.binds.is_empty())
            .flat_map(|spec| spec.binds)
            .filter(|bind| bind.contains(":/data:rw"))
            .collect();
        assert_eq!(binds.len(), 2);
        assert_eq!(binds[0], binds[1]);
    }

    #[tokio::test]
    async fn exports_chain_accumulates_helpers() {
        let context = tempfile::tempdir().unwrap();
        let cache = tempfile::tempdir().unwrap();
        let daemon = FakeDaemon::new();
        seed_busybox(&daemon);

        let build = run_build(
            daemon.clone(),
            config(context.path(), cache.path()),
            "FROM busybox\nRUN touch f\nEXPORT f\nEXPORT f\nIMPORT f /etc/\nIMPORT f /etc/\nRUN ls /etc/f\n",
        )
        .await
        .unwrap();

        let helpers = daemon.container_names_with_prefix("exports_");
        assert_eq!(helpers.len(), 2, "{helpers:?}");
        assert!(build.state.exports_id.starts_with("exports_"));

        // The second IMPORT's fingerprint names the same helper as the
        // first, which itself was salted by the first EXPORT.
        let messages = daemon.commit_messages().join("\n");
        assert!(
            messages.contains(&format!("IMPORT {}", build.state.exports_id)),
            "{messages}"
        );
    }

    #[tokio::test]
    async fn multi_stage_preserves_exports_and_drops_intermediates() {
        let context = tempfile::tempdir().unwrap();
        let cache = tempfile::tempdir().unwrap();
        let daemon = FakeDaemon::new();
        seed_busybox(&daemon);

        let build = run_build(
            daemon.clone(),
            config(context.path(), cache.path()),
            "FROM busybox\nRUN touch f\nEXPORT f\nFROM busybox\nIMPORT f /srv/\n",
        )
        .await
        .unwrap();
        assert!(!build.state.image_id.is_empty());
        // The first stage's image was an untagged intermediate.
        assert_eq!(daemon.op_count("rmi"), 1);
    }

    #[tokio::test]
    async fn missing_from_fails() {
        let context = tempfile::tempdir().unwrap();
        let cache = tempfile::tempdir().unwrap();
        let daemon = FakeDaemon::new();
        let err = run_build(
            daemon,
            config(context.path(), cache.path()),
            "ENV A=1\n",
        )
        .await
        .unwrap_err();
        assert!(err.to_string().contains("no base image"), "{err}");
    }
}
