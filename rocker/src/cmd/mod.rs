mod build;
mod clean;
mod pull;

use self::build::BuildCommand;
use self::clean::Clean;
use self::pull::Pull;
use anyhow::Result;
use clap::Parser;
use env_logger::Builder;
use log::LevelFilter;
use std::error::Error;
use std::path::PathBuf;

const DEFAULT_LEVEL_FILTER: LevelFilter = LevelFilter::Info;

/// A client-driven container image builder.
#[derive(Debug, Parser)]
#[clap(about, long_about = None, version)]
pub(crate) struct Args {
    /// Set the logging level. One of [off|error|warn|info|debug|trace]. You
    /// can also leave this unset and use the RUST_LOG env variable. See
    /// https://github.com/rust-cli/env_logger/
    #[clap(long = "log-level")]
    pub(crate) log_level: Option<LevelFilter>,

    #[clap(subcommand)]
    pub(crate) subcommand: Subcommand,
}

#[derive(Debug, Parser)]
pub(crate) enum Subcommand {
    Build(BuildCommand),

    Pull(Pull),

    Clean(Clean),
}

/// Entrypoint for the `rocker` command line program.
pub(super) async fn run(args: Args) -> Result<()> {
    match args.subcommand {
        Subcommand::Build(build_command) => build_command.run().await,
        Subcommand::Pull(pull_args) => pull_args.run().await,
        Subcommand::Clean(clean_args) => clean_args.run().await,
    }
}

/// use `level` if present, or else use `RUST_LOG` if present, or else use a default.
pub(super) fn init_logger(level: Option<LevelFilter>) {
    match (std::env::var(env_logger::DEFAULT_FILTER_ENV).ok(), level) {
        (Some(_), None) => {
            // RUST_LOG exists and level does not; use the environment variable.
            Builder::from_default_env().init();
        }
        _ => {
            // use provided log level or default for this crate only.
            Builder::new()
                .filter(
                    Some(env!("CARGO_CRATE_NAME")),
                    level.unwrap_or(DEFAULT_LEVEL_FILTER),
                )
                .init();
        }
    }
}

/// The default cache directory, `~/.rocker` unless overridden.
pub(crate) fn default_cache_dir() -> PathBuf {
    home::home_dir()
        .map(|home| home.join(".rocker"))
        .unwrap_or_else(|| PathBuf::from(".rocker"))
}

/// Parse a single key-value pair
pub(crate) fn parse_key_val<T, U>(s: &str) -> Result<(T, U), Box<dyn Error + Send + Sync + 'static>>
where
    T: std::str::FromStr,
    T::Err: Error + Send + Sync + 'static,
    U: std::str::FromStr,
    U::Err: Error + Send + Sync + 'static,
{
    let pos = s
        .find('=')
        .ok_or_else(|| format!("invalid KEY=value: no `=` found in `{s}`"))?;
    Ok((s[..pos].parse()?, s[pos + 1..].parse()?))
}
