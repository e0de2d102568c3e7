use crate::cmd::{init_logger, Args};
use anyhow::Result;
use clap::Parser;

mod artifacts;
mod build;
mod cmd;
mod parser;
mod registry;
mod storage;
mod template;
/// Test code that should only be compiled when running tests.
#[cfg(test)]
mod test;

/// `anyhow` prints a nicely formatted error message with `Debug`, so we can return a result from
/// the `main` function.
#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logger(args.log_level);
    cmd::run(args).await
}
