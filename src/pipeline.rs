use std::path::Path;

use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;

use crate::archive::{self, Unwrapped};
use crate::error::PipelineResult;
use crate::normalize::{self, MappingSuggester};
use crate::source::{self, RawSource};
use crate::tabular::{self, Parsed, Row};

/// CMS index URLs embed the reporting month; surfaced as a hint only.
static MONTH_HINT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(20\d{2}-(?:0[1-9]|1[0-2]))").unwrap());

/// Metadata attached to summary responses. Built per request, never cached.
#[derive(Debug, Clone, Serialize)]
pub struct RequestMeta {
    pub source: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_inner: Option<String>,
    pub fetched_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub index_month_hint: Option<String>,
    pub include_rows: bool,
}

impl RequestMeta {
    pub fn new(source: &RawSource, source_inner: Option<String>, include_rows: bool) -> Self {
        let label = source.label();
        let index_month_hint = MONTH_HINT
            .find(&label)
            .map(|m| m.as_str().to_string());
        Self {
            source: label,
            source_inner,
            fetched_at: Utc::now(),
            index_month_hint,
            include_rows,
        }
    }
}

/// The pipeline ends in one of three states. The latter two are
/// client-correctable conditions, not failures: the caller must either pick
/// an archive member or follow one of the suggested rate-file locations.
#[derive(Debug)]
pub enum PipelineOutcome {
    Rows {
        rows: Vec<Row>,
        member: Option<String>,
    },
    NeedsMember(Vec<String>),
    IndexDetected(Vec<String>),
}

/// Run Acquirer -> Unwrapper -> Detector/Parser -> Normalizer -> Filter.
/// Stateless: every invocation starts from the source descriptor alone.
pub async fn run(
    client: &reqwest::Client,
    public_dir: &Path,
    raw_source: &RawSource,
    codes: &[String],
    inner_name: Option<&str>,
    suggester: &dyn MappingSuggester,
) -> PipelineResult<PipelineOutcome> {
    let acquired = source::acquire(client, public_dir, raw_source).await?;
    tracing::debug!(source = %raw_source.label(), bytes = acquired.bytes.len(), "acquired source");

    let lenient_gzip = matches!(raw_source, RawSource::RemoteUrl(_));
    let unwrapped = archive::unwrap(
        &acquired.bytes,
        &acquired.hint,
        acquired.declared_type.as_deref(),
        inner_name,
        lenient_gzip,
    )?;

    let (text, member) = match unwrapped {
        Unwrapped::Text { text, member } => (text, member),
        Unwrapped::NeedsChoice(candidates) => {
            tracing::info!(
                source = %raw_source.label(),
                candidates = candidates.len(),
                "archive needs member disambiguation"
            );
            return Ok(PipelineOutcome::NeedsMember(candidates));
        }
    };

    let (mut rows, headers) = match tabular::parse_text(&text)? {
        Parsed::Rows { rows, headers } => (rows, headers),
        Parsed::IndexDetected(suggestions) => {
            tracing::info!(
                source = %raw_source.label(),
                suggestions = suggestions.len(),
                "index-of-files document detected"
            );
            return Ok(PipelineOutcome::IndexDetected(suggestions));
        }
    };

    normalize::normalize_rows(&mut rows, &headers, suggester);

    let probe_aliases = matches!(raw_source, RawSource::UploadedBytes { .. });
    let rows = normalize::filter_by_codes(rows, codes, probe_aliases);

    tracing::info!(
        source = %raw_source.label(),
        member = member.as_deref().unwrap_or(""),
        rows = rows.len(),
        "pipeline complete"
    );
    Ok(PipelineOutcome::Rows { rows, member })
}
