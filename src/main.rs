mod archive;
mod cli;
mod error;
mod normalize;
mod oneshot;
mod pipeline;
mod server;
mod source;
mod summary;
mod tabular;

use anyhow::Context;
use clap::Parser;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let args = cli::Args::parse();

    match args.cmd {
        cli::Command::Serve(cmd) => server::run(cmd).await.context("serve failed"),
        cli::Command::Summarize(cmd) => oneshot::run(cmd).await.context("summarize failed"),
    }
}
