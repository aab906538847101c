use clap::{Parser, Subcommand};

const DEFAULT_PUBLIC_DIR: &str = concat!(env!("CARGO_MANIFEST_DIR"), "/public");

#[derive(Parser, Debug)]
#[command(name = "costvista-backend")]
#[command(about = "Price-transparency ingestion API (parse + per-code summaries)", long_about = None)]
pub struct Args {
    #[command(subcommand)]
    pub cmd: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Serve the HTTP API.
    Serve(ServeArgs),
    /// Run the ingestion pipeline once against a URL or local path and print
    /// the per-code summary as JSON.
    Summarize(SummarizeArgs),
}

#[derive(clap::Args, Debug, Clone)]
pub struct ServeArgs {
    #[arg(long, default_value = "127.0.0.1")]
    pub host: String,

    #[arg(long, default_value_t = 8787)]
    pub port: u16,

    /// Root directory local-path sources are resolved under.
    #[arg(long, default_value = DEFAULT_PUBLIC_DIR)]
    pub public_dir: String,
}

#[derive(clap::Args, Debug, Clone)]
pub struct SummarizeArgs {
    /// http(s) URL or a path under --public-dir (e.g. /data/sample.csv).
    pub input: String,

    /// Restrict output to these billing codes (repeatable).
    #[arg(long = "code")]
    pub codes: Vec<String>,

    /// Archive member to read when the input is a multi-member zip.
    #[arg(long)]
    pub inner_name: Option<String>,

    /// Root directory local-path sources are resolved under.
    #[arg(long, default_value = DEFAULT_PUBLIC_DIR)]
    pub public_dir: String,
}
