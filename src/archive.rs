use std::io::Read;

use flate2::read::GzDecoder;

use crate::error::{PipelineError, PipelineResult};

/// Ceiling on bytes materialized after inflate, so a tiny compressed input
/// cannot expand without bound.
pub const DECOMPRESSION_CAP_BYTES: u64 = 200 * 1024 * 1024;

/// A disambiguation response lists at most this many archive members.
pub const MAX_MEMBER_CANDIDATES: usize = 50;

const GZIP_SUFFIXES: &[&str] = &[".gz", ".gzip"];
const MEMBER_SUFFIXES: &[&str] = &[".json", ".csv", ".ndjson", ".jsonl", ".txt", ".gz"];

/// Result of unwrapping: either decoded text (with the archive member it came
/// from, if any), or the member list the caller must choose from. The latter
/// is not a failure, so it is not an error variant.
#[derive(Debug)]
pub enum Unwrapped {
    Text {
        text: String,
        member: Option<String>,
    },
    NeedsChoice(Vec<String>),
}

/// Turn acquired bytes into text, routing on the filename/URL suffix and the
/// declared content type. `lenient_gzip` is set for remote URLs, where a
/// `.gz` suffix that fails to inflate falls back to the raw response text.
pub fn unwrap(
    bytes: &[u8],
    hint: &str,
    declared_type: Option<&str>,
    chosen_member: Option<&str>,
    lenient_gzip: bool,
) -> PipelineResult<Unwrapped> {
    let hint_lower = hint.to_ascii_lowercase();
    let declared_zip = declared_type
        .map(|t| t.to_ascii_lowercase().contains("zip") && !t.to_ascii_lowercase().contains("gzip"))
        .unwrap_or(false);

    if hint_lower.ends_with(".zip") || declared_zip {
        return unwrap_zip(bytes, chosen_member);
    }

    if GZIP_SUFFIXES.iter().any(|s| hint_lower.ends_with(s)) {
        return match gunzip_capped(bytes) {
            Ok(inflated) => Ok(Unwrapped::Text {
                text: lossy_text(&inflated),
                member: None,
            }),
            Err(PipelineError::PayloadTooLarge(m)) => Err(PipelineError::PayloadTooLarge(m)),
            Err(_) if lenient_gzip => Ok(Unwrapped::Text {
                text: lossy_text(bytes),
                member: None,
            }),
            Err(e) => Err(e),
        };
    }

    Ok(Unwrapped::Text {
        text: lossy_text(bytes),
        member: None,
    })
}

fn unwrap_zip(bytes: &[u8], chosen_member: Option<&str>) -> PipelineResult<Unwrapped> {
    let cursor = std::io::Cursor::new(bytes);
    let mut archive = zip::ZipArchive::new(cursor)
        .map_err(|e| PipelineError::InvalidArchive(format!("read zip: {e}")))?;

    // Candidate names in archive-listed order; directory entries excluded.
    let mut candidates: Vec<String> = Vec::new();
    for i in 0..archive.len() {
        let entry = archive
            .by_index(i)
            .map_err(|e| PipelineError::InvalidArchive(format!("list zip: {e}")))?;
        let name = entry.name().to_string();
        if name.ends_with('/') {
            continue;
        }
        let lower = name.to_ascii_lowercase();
        if MEMBER_SUFFIXES.iter().any(|s| lower.ends_with(s)) {
            candidates.push(name);
        }
    }

    if candidates.is_empty() {
        return Err(PipelineError::UnsupportedArchiveContents(
            "zip contains no .json/.csv/.ndjson/.jsonl/.txt/.gz member".to_string(),
        ));
    }

    let member = match chosen_member {
        Some(chosen) => {
            if !candidates.iter().any(|c| c == chosen) {
                return Err(PipelineError::NotFound(format!("archive member {chosen}")));
            }
            chosen.to_string()
        }
        None if candidates.len() > 1 => {
            candidates.truncate(MAX_MEMBER_CANDIDATES);
            return Ok(Unwrapped::NeedsChoice(candidates));
        }
        None => candidates.remove(0),
    };

    let mut entry = archive
        .by_name(&member)
        .map_err(|e| PipelineError::InvalidArchive(format!("open member {member}: {e}")))?;
    let mut raw = read_limited(&mut entry, DECOMPRESSION_CAP_BYTES)?;

    // Nested gzip inside the archive (e.g. rates.json.gz) gets one more pass.
    if GZIP_SUFFIXES
        .iter()
        .any(|s| member.to_ascii_lowercase().ends_with(s))
    {
        raw = gunzip_capped(&raw)?;
    }

    Ok(Unwrapped::Text {
        text: lossy_text(&raw),
        member: Some(member),
    })
}

fn gunzip_capped(bytes: &[u8]) -> PipelineResult<Vec<u8>> {
    let mut decoder = GzDecoder::new(bytes);
    read_limited(&mut decoder, DECOMPRESSION_CAP_BYTES)
}

/// Read at most `cap` bytes; one byte past the cap is enough to prove the
/// payload is oversized without materializing the rest.
fn read_limited<R: Read>(reader: &mut R, cap: u64) -> PipelineResult<Vec<u8>> {
    let mut buf = Vec::new();
    reader
        .take(cap + 1)
        .read_to_end(&mut buf)
        .map_err(|e| PipelineError::InvalidArchive(format!("decompress: {e}")))?;
    if buf.len() as u64 > cap {
        return Err(PipelineError::PayloadTooLarge(format!(
            "decompressed payload exceeds {cap} bytes"
        )));
    }
    Ok(buf)
}

fn lossy_text(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes).into_owned()
}
