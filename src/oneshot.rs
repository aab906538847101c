use std::path::Path;

use anyhow::{anyhow, bail};

use crate::cli::SummarizeArgs;
use crate::normalize::NoopSuggester;
use crate::pipeline::{self, PipelineOutcome, RequestMeta};
use crate::source::RawSource;
use crate::summary::summarize;

/// One-shot pipeline run: the CLI analogue of `POST /api/summary`.
pub async fn run(opts: SummarizeArgs) -> anyhow::Result<()> {
    let input = opts.input.trim();
    let lower = input.to_ascii_lowercase();
    let raw_source = if lower.starts_with("http://") || lower.starts_with("https://") {
        RawSource::RemoteUrl(input.to_string())
    } else {
        RawSource::LocalPath(input.to_string())
    };

    let client = reqwest::Client::new();
    let outcome = pipeline::run(
        &client,
        Path::new(&opts.public_dir),
        &raw_source,
        &opts.codes,
        opts.inner_name.as_deref(),
        &NoopSuggester,
    )
    .await
    .map_err(|e| anyhow!("{e}"))?;

    match outcome {
        PipelineOutcome::Rows { rows, member } => {
            let meta = RequestMeta::new(&raw_source, member, false);
            let summary = summarize(&rows);
            let body = serde_json::json!({"summary": summary, "meta": meta});
            println!("{}", serde_json::to_string_pretty(&body)?);
            Ok(())
        }
        PipelineOutcome::NeedsMember(inner_files) => {
            bail!(
                "archive has multiple members; pass --inner-name with one of: {}",
                inner_files.join(", ")
            )
        }
        PipelineOutcome::IndexDetected(suggestions) => {
            bail!(
                "this is an index-of-files document, not a rate file; try one of: {}",
                suggestions.join(", ")
            )
        }
    }
}
