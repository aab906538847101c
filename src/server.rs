use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use axum::extract::{DefaultBodyLimit, Multipart, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tower_http::cors::{Any, CorsLayer};

use crate::cli::ServeArgs;
use crate::error::PipelineError;
use crate::normalize::{MappingSuggester, NoopSuggester};
use crate::pipeline::{self, PipelineOutcome, RequestMeta};
use crate::source::{self, RawSource, UPLOAD_CAP_BYTES};
use crate::summary::{CodeSummary, summarize};
use crate::tabular::Row;

#[derive(Clone)]
struct AppState {
    client: reqwest::Client,
    public_dir: PathBuf,
    suggester: Arc<dyn MappingSuggester>,
}

pub async fn run(opts: ServeArgs) -> anyhow::Result<()> {
    let public_dir = PathBuf::from(&opts.public_dir);
    if !public_dir.is_dir() {
        tracing::warn!(
            "Public directory {} does not exist; local-path sources will 404",
            public_dir.display()
        );
    }

    let state = AppState {
        client: reqwest::Client::new(),
        public_dir,
        suggester: Arc::new(NoopSuggester),
    };

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = Router::new()
        .route("/health", get(health))
        .route("/api/parse", post(api_parse))
        .route("/api/summary", post(api_summary))
        .route("/api/summary_upload", post(api_summary_upload))
        // The multipart body carries up to the 50 MiB transfer cap plus
        // form-encoding overhead; the cap itself is enforced per chunk.
        .layer(DefaultBodyLimit::max(UPLOAD_CAP_BYTES + 1024 * 1024))
        .layer(cors)
        .with_state(state);

    let addr: SocketAddr = format!("{}:{}", opts.host, opts.port)
        .parse()
        .context("parse host:port")?;

    tracing::info!("Listening on http://{}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

async fn health() -> impl IntoResponse {
    Json(json!({"ok": true}))
}

#[derive(Debug, Deserialize)]
struct ParseRequest {
    url: String,
    #[serde(default)]
    codes: Vec<String>,
    inner_name: Option<String>,
}

#[derive(Debug, Serialize)]
struct ParseResponse {
    count: usize,
    rows: Vec<Row>,
    meta: RequestMeta,
}

async fn api_parse(State(st): State<AppState>, Json(req): Json<ParseRequest>) -> impl IntoResponse {
    let raw_source = source_from_url(&req.url);
    let outcome = pipeline::run(
        &st.client,
        &st.public_dir,
        &raw_source,
        &req.codes,
        req.inner_name.as_deref(),
        st.suggester.as_ref(),
    )
    .await;

    match outcome {
        Ok(PipelineOutcome::Rows { rows, member }) => {
            let meta = RequestMeta::new(&raw_source, member, true);
            Json(ParseResponse {
                count: rows.len(),
                rows,
                meta,
            })
            .into_response()
        }
        Ok(other) => conflict_response(other),
        Err(e) => error_response(e),
    }
}

#[derive(Debug, Deserialize)]
struct SummaryRequest {
    url: String,
    #[serde(default)]
    codes: Vec<String>,
    #[serde(default = "default_true")]
    include_rows: bool,
    inner_name: Option<String>,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Serialize)]
struct SummaryResponse {
    summary: Vec<CodeSummary>,
    #[serde(skip_serializing_if = "Option::is_none")]
    rows: Option<Vec<Row>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    count: Option<usize>,
    meta: RequestMeta,
}

async fn api_summary(
    State(st): State<AppState>,
    Json(req): Json<SummaryRequest>,
) -> impl IntoResponse {
    let raw_source = source_from_url(&req.url);
    let outcome = pipeline::run(
        &st.client,
        &st.public_dir,
        &raw_source,
        &req.codes,
        req.inner_name.as_deref(),
        st.suggester.as_ref(),
    )
    .await;
    summary_response(outcome, &raw_source, req.include_rows)
}

async fn api_summary_upload(
    State(st): State<AppState>,
    mut multipart: Multipart,
) -> axum::response::Response {
    let mut file_bytes: Option<Vec<u8>> = None;
    let mut filename = String::from("upload");
    let mut content_type: Option<String> = None;
    let mut codes: Vec<String> = Vec::new();
    let mut include_rows = true;
    let mut inner_name: Option<String> = None;

    loop {
        let field = match multipart.next_field().await {
            Ok(Some(f)) => f,
            Ok(None) => break,
            Err(e) => {
                return (StatusCode::BAD_REQUEST, Json(json!({"error": e.to_string()})))
                    .into_response();
            }
        };
        let field_name = field.name().unwrap_or("").to_string();
        match field_name.as_str() {
            "file" => {
                if let Some(name) = field.file_name() {
                    filename = name.to_string();
                }
                content_type = field.content_type().map(|t| t.to_string());

                let mut buf = Vec::new();
                let mut field = field;
                loop {
                    match field.chunk().await {
                        Ok(Some(chunk)) => {
                            if let Err(e) =
                                source::append_upload_chunk(&mut buf, &chunk, UPLOAD_CAP_BYTES)
                            {
                                return error_response(e);
                            }
                        }
                        Ok(None) => break,
                        Err(e) => {
                            return (
                                StatusCode::BAD_REQUEST,
                                Json(json!({"error": e.to_string()})),
                            )
                                .into_response();
                        }
                    }
                }
                file_bytes = Some(buf);
            }
            "codes" => match field.text().await {
                Ok(text) => {
                    let text = text.trim().to_string();
                    if !text.is_empty() {
                        codes.push(text);
                    }
                }
                Err(e) => {
                    return (StatusCode::BAD_REQUEST, Json(json!({"error": e.to_string()})))
                        .into_response();
                }
            },
            "include_rows" => {
                if let Ok(text) = field.text().await {
                    include_rows = matches!(text.trim(), "true" | "1" | "yes" | "on" | "");
                }
            }
            "inner_name" => {
                if let Ok(text) = field.text().await {
                    let text = text.trim().to_string();
                    if !text.is_empty() {
                        inner_name = Some(text);
                    }
                }
            }
            _ => {}
        }
    }

    let Some(bytes) = file_bytes else {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({"error": "missing multipart field 'file'"})),
        )
            .into_response();
    };

    if !upload_type_supported(&filename, content_type.as_deref()) {
        return (
            StatusCode::UNSUPPORTED_MEDIA_TYPE,
            Json(json!({"error": "unsupported content type; expected csv/json/zip/gz"})),
        )
            .into_response();
    }

    let raw_source = RawSource::UploadedBytes {
        bytes,
        filename,
        content_type,
    };
    let outcome = pipeline::run(
        &st.client,
        &st.public_dir,
        &raw_source,
        &codes,
        inner_name.as_deref(),
        st.suggester.as_ref(),
    )
    .await;
    summary_response(outcome, &raw_source, include_rows)
}

fn summary_response(
    outcome: Result<PipelineOutcome, PipelineError>,
    raw_source: &RawSource,
    include_rows: bool,
) -> axum::response::Response {
    match outcome {
        Ok(PipelineOutcome::Rows { rows, member }) => {
            let meta = RequestMeta::new(raw_source, member, include_rows);
            let summary = summarize(&rows);
            let (rows, count) = if include_rows {
                let count = rows.len();
                (Some(rows), Some(count))
            } else {
                (None, None)
            };
            Json(SummaryResponse {
                summary,
                rows,
                count,
                meta,
            })
            .into_response()
        }
        Ok(other) => conflict_response(other),
        Err(e) => error_response(e),
    }
}

/// 409 bodies for the two client-correctable outcomes.
fn conflict_response(outcome: PipelineOutcome) -> axum::response::Response {
    match outcome {
        PipelineOutcome::NeedsMember(inner_files) => (
            StatusCode::CONFLICT,
            Json(json!({"error": "zip_inner_required", "inner_files": inner_files})),
        )
            .into_response(),
        PipelineOutcome::IndexDetected(suggestions) => (
            StatusCode::CONFLICT,
            Json(json!({"error": "index_detected", "suggestions": suggestions})),
        )
            .into_response(),
        PipelineOutcome::Rows { .. } => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({"error": "unexpected outcome"})),
        )
            .into_response(),
    }
}

fn error_response(e: PipelineError) -> axum::response::Response {
    let status = e.status_code();
    tracing::info!(status = %status, error = %e, "request failed");
    (status, Json(json!({"error": e.to_string()}))).into_response()
}

fn source_from_url(url: &str) -> RawSource {
    let lower = url.trim().to_ascii_lowercase();
    if lower.starts_with("http://") || lower.starts_with("https://") {
        RawSource::RemoteUrl(url.trim().to_string())
    } else {
        RawSource::LocalPath(url.trim().to_string())
    }
}

fn upload_type_supported(filename: &str, content_type: Option<&str>) -> bool {
    let name = filename.to_ascii_lowercase();
    let by_name = [".csv", ".json", ".ndjson", ".jsonl", ".txt", ".zip", ".gz", ".gzip"]
        .iter()
        .any(|s| name.ends_with(s));
    let by_type = content_type
        .map(|t| {
            let t = t.to_ascii_lowercase();
            t.contains("csv")
                || t.contains("json")
                || t.contains("zip")
                || t.contains("gzip")
                || t.contains("text/")
        })
        .unwrap_or(false);
    by_name || by_type
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn url_routing_picks_remote_vs_local() {
        assert!(matches!(
            source_from_url("https://example.com/rates.csv"),
            RawSource::RemoteUrl(_)
        ));
        assert!(matches!(
            source_from_url("HTTP://example.com/rates.csv"),
            RawSource::RemoteUrl(_)
        ));
        assert!(matches!(
            source_from_url("/data/sample.csv"),
            RawSource::LocalPath(_)
        ));
    }

    #[test]
    fn upload_type_check_accepts_name_or_declared_type() {
        assert!(upload_type_supported("rates.csv", None));
        assert!(upload_type_supported("RATES.ZIP", None));
        assert!(upload_type_supported("blob", Some("application/json")));
        assert!(upload_type_supported("blob", Some("text/csv; charset=utf-8")));
        assert!(!upload_type_supported("scan.pdf", Some("application/pdf")));
    }
}
