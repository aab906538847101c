use serde_json::Value;

use crate::error::{PipelineError, PipelineResult};

/// A parsed row: source keys in original order, loosely typed values.
pub type Row = serde_json::Map<String, Value>;

/// Overflow CSV cells (record longer than the header) land here as an array
/// instead of being dropped.
pub const REST_KEY: &str = "_rest";

/// An index document yields at most this many suggested file locations.
const MAX_INDEX_SUGGESTIONS: usize = 10;

/// Dialect sniffing looks at this much of the document.
const SNIFF_WINDOW: usize = 4096;

/// Outcome of format detection. An index document is client-correctable, not
/// a parse failure, so it is a variant rather than an error.
///
/// `headers` is the dataset's column set the field map must be built from:
/// the header row for CSV, the first row's keys for JSON/NDJSON. Carried
/// separately because a ragged first CSV record can hold fewer keys than the
/// header declares.
#[derive(Debug)]
pub enum Parsed {
    Rows {
        rows: Vec<Row>,
        headers: Vec<String>,
    },
    IndexDetected(Vec<String>),
}

/// Detect the tabular format of `text` and parse it into rows. Detection
/// order, first match wins: CMS index document, JSON array of objects,
/// NDJSON, CSV.
pub fn parse_text(text: &str) -> PipelineResult<Parsed> {
    let text = text.strip_prefix('\u{feff}').unwrap_or(text);
    if text.trim().is_empty() {
        return Err(PipelineError::UnsupportedFormat("empty document".to_string()));
    }

    match serde_json::from_str::<Value>(text) {
        Ok(value) => {
            if let Some(suggestions) = detect_index_document(&value) {
                return Ok(Parsed::IndexDetected(suggestions));
            }
            match discover_row_array(&value) {
                Some(items) => {
                    let rows = object_rows(items);
                    let headers = first_row_headers(&rows);
                    Ok(Parsed::Rows { rows, headers })
                }
                None => Err(PipelineError::NoTabularData(
                    "JSON document holds no array of row objects".to_string(),
                )),
            }
        }
        Err(_) => {
            if let Some(rows) = parse_ndjson(text) {
                let headers = first_row_headers(&rows);
                return Ok(Parsed::Rows { rows, headers });
            }
            let (headers, rows) = parse_csv(text)?;
            Ok(Parsed::Rows { rows, headers })
        }
    }
}

fn first_row_headers(rows: &[Row]) -> Vec<String> {
    rows.first()
        .map(|r| r.keys().cloned().collect())
        .unwrap_or_default()
}

/// Recognize a CMS-style index-of-files manifest: a list of rate-file
/// locations rather than a rate file itself. Returns the deduplicated
/// location suggestions when the shape matches.
fn detect_index_document(value: &Value) -> Option<Vec<String>> {
    let obj = value.as_object()?;

    let mut entries: Vec<&Value> = Vec::new();
    let mut matched = false;

    if let Some(files) = obj.get("in_network_files").and_then(Value::as_array) {
        matched = true;
        entries.extend(files.iter());
    } else if let Some(structures) = obj.get("reporting_structure").and_then(Value::as_array) {
        for structure in structures {
            if let Some(files) = structure.get("in_network_files").and_then(Value::as_array) {
                matched = true;
                entries.extend(files.iter());
            }
        }
    } else if let Some(files) = obj.get("files").and_then(Value::as_array) {
        for file in files {
            let flagged = file
                .get("type")
                .and_then(Value::as_str)
                .map(|t| t.to_ascii_lowercase().starts_with("in"))
                .unwrap_or(false);
            if flagged {
                matched = true;
                entries.push(file);
            }
        }
    }

    if !matched {
        return None;
    }

    let mut suggestions: Vec<String> = Vec::new();
    for entry in entries {
        let location = entry
            .get("location")
            .or_else(|| entry.get("url"))
            .or_else(|| entry.get("link"))
            .and_then(Value::as_str);
        if let Some(loc) = location {
            if !suggestions.iter().any(|s| s == loc) {
                suggestions.push(loc.to_string());
                if suggestions.len() == MAX_INDEX_SUGGESTIONS {
                    break;
                }
            }
        }
    }
    Some(suggestions)
}

/// Locate the array of row objects inside a parsed JSON value: the value
/// itself, a `data` key, or the first key (insertion order) holding one.
fn discover_row_array(value: &Value) -> Option<&Vec<Value>> {
    fn is_row_array(v: &Value) -> bool {
        match v.as_array() {
            Some(items) => items.first().map(Value::is_object).unwrap_or(true),
            None => false,
        }
    }

    if is_row_array(value) {
        return value.as_array();
    }
    let obj = value.as_object()?;
    if let Some(data) = obj.get("data") {
        if is_row_array(data) {
            return data.as_array();
        }
    }
    obj.values().find(|v| is_row_array(v)).and_then(Value::as_array)
}

fn object_rows(items: &[Value]) -> Vec<Row> {
    items
        .iter()
        .filter_map(|v| v.as_object().cloned())
        .collect()
}

/// One JSON value per line; accepted only when every non-empty line parses
/// and the first is an object.
fn parse_ndjson(text: &str) -> Option<Vec<Row>> {
    let lines: Vec<&str> = text.lines().map(str::trim).filter(|l| !l.is_empty()).collect();
    if lines.is_empty() {
        return None;
    }
    let mut parsed: Vec<Value> = Vec::with_capacity(lines.len());
    for line in &lines {
        parsed.push(serde_json::from_str::<Value>(line).ok()?);
    }
    if !parsed.first().map(Value::is_object).unwrap_or(false) {
        return None;
    }
    Some(parsed.iter().filter_map(|v| v.as_object().cloned()).collect())
}

fn parse_csv(text: &str) -> PipelineResult<(Vec<String>, Vec<Row>)> {
    let delimiter = sniff_delimiter(text).unwrap_or_else(|| probe_delimiter(text));

    let mut reader = csv::ReaderBuilder::new()
        .delimiter(delimiter)
        .flexible(true)
        .trim(csv::Trim::All)
        .from_reader(text.as_bytes());

    let headers: Vec<String> = reader
        .headers()
        .map_err(|e| PipelineError::UnsupportedFormat(format!("CSV header: {e}")))?
        .iter()
        .map(|h| h.to_string())
        .collect();
    if headers.is_empty() || headers.iter().all(|h| h.is_empty()) {
        return Err(PipelineError::UnsupportedFormat(
            "CSV document has no header row".to_string(),
        ));
    }

    let mut rows = Vec::new();
    for record in reader.records() {
        let record = record.map_err(|e| PipelineError::UnsupportedFormat(format!("CSV row: {e}")))?;
        let mut row = Row::new();
        let mut rest: Vec<Value> = Vec::new();
        for (i, field) in record.iter().enumerate() {
            match headers.get(i) {
                Some(key) => {
                    row.insert(key.clone(), Value::String(field.to_string()));
                }
                None => rest.push(Value::String(field.to_string())),
            }
        }
        if !rest.is_empty() {
            row.insert(REST_KEY.to_string(), Value::Array(rest));
        }
        rows.push(row);
    }
    Ok((headers, rows))
}

/// A delimiter sniffs successfully when it splits every non-empty sample line
/// into the same column count, at least two columns wide. Candidates are
/// probed in a fixed order so detection is deterministic.
fn sniff_delimiter(text: &str) -> Option<u8> {
    let sample = if text.len() <= SNIFF_WINDOW {
        text
    } else {
        let mut end = SNIFF_WINDOW;
        while !text.is_char_boundary(end) {
            end -= 1;
        }
        &text[..end]
    };

    let mut lines: Vec<&str> = sample.lines().filter(|l| !l.trim().is_empty()).collect();
    // The window may cut the last line mid-record; ignore it when truncated.
    if sample.len() < text.len() && lines.len() > 1 {
        lines.pop();
    }
    if lines.is_empty() {
        return None;
    }

    for candidate in [b',', b';', b'\t', b'|'] {
        let first = field_count(lines[0], candidate);
        if first < 2 {
            continue;
        }
        if lines.iter().all(|l| field_count(l, candidate) == first) {
            return Some(candidate);
        }
    }
    None
}

/// Sniff failed: accept the first delimiter splitting the header into more
/// than one column, else fall back to comma unconditionally.
fn probe_delimiter(text: &str) -> u8 {
    let header = text.lines().next().unwrap_or("");
    for candidate in [b';', b'\t', b'|', b','] {
        if field_count(header, candidate) > 1 {
            return candidate;
        }
    }
    b','
}

fn field_count(line: &str, delimiter: u8) -> usize {
    line.split(delimiter as char).count()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rows(parsed: Parsed) -> Vec<Row> {
        match parsed {
            Parsed::Rows { rows, .. } => rows,
            Parsed::IndexDetected(s) => panic!("unexpected index detection: {s:?}"),
        }
    }

    fn headers(parsed: Parsed) -> Vec<String> {
        match parsed {
            Parsed::Rows { headers, .. } => headers,
            Parsed::IndexDetected(s) => panic!("unexpected index detection: {s:?}"),
        }
    }

    #[test]
    fn index_document_direct_list() {
        let parsed = parse_text(r#"{"in_network_files":[{"location":"http://x/y.json"}]}"#).unwrap();
        match parsed {
            Parsed::IndexDetected(s) => assert_eq!(s, vec!["http://x/y.json".to_string()]),
            _ => panic!("expected index detection"),
        }
    }

    #[test]
    fn index_document_under_reporting_structure() {
        let doc = r#"{"reporting_structure":[
            {"in_network_files":[{"url":"http://a/1.json"},{"url":"http://a/1.json"}]},
            {"in_network_files":[{"link":"http://a/2.json"}]}
        ]}"#;
        match parse_text(doc).unwrap() {
            Parsed::IndexDetected(s) => {
                assert_eq!(s, vec!["http://a/1.json".to_string(), "http://a/2.json".to_string()]);
            }
            _ => panic!("expected index detection"),
        }
    }

    #[test]
    fn files_list_needs_in_network_type_flag() {
        let flagged = r#"{"files":[{"type":"in-network-rates","location":"http://f/x.json"}]}"#;
        match parse_text(flagged).unwrap() {
            Parsed::IndexDetected(s) => assert_eq!(s, vec!["http://f/x.json".to_string()]),
            _ => panic!("expected index detection"),
        }

        // Without the flag this is not an index document; the files list is
        // then just the first list-like key and parses as plain rows.
        let unflagged = r#"{"files":[{"type":"allowed-amounts","location":"http://f/x.json"}]}"#;
        assert_eq!(rows(parse_text(unflagged).unwrap()).len(), 1);
    }

    #[test]
    fn index_suggestions_cap_at_ten() {
        let files: Vec<String> = (0..15)
            .map(|i| format!(r#"{{"location":"http://x/{i}.json"}}"#))
            .collect();
        let doc = format!(r#"{{"in_network_files":[{}]}}"#, files.join(","));
        match parse_text(&doc).unwrap() {
            Parsed::IndexDetected(s) => assert_eq!(s.len(), 10),
            _ => panic!("expected index detection"),
        }
    }

    #[test]
    fn json_array_at_root() {
        let parsed = rows(parse_text(r#"[{"code":"100","negotiated_rate":5}]"#).unwrap());
        assert_eq!(parsed.len(), 1);
        assert_eq!(parsed[0]["code"], "100");
    }

    #[test]
    fn json_array_under_data_key() {
        let parsed = rows(parse_text(r#"{"meta":1,"data":[{"code":"A"}]}"#).unwrap());
        assert_eq!(parsed[0]["code"], "A");
    }

    #[test]
    fn json_array_under_first_listlike_key() {
        let parsed = rows(parse_text(r#"{"version":"1","items":[{"code":"B"}]}"#).unwrap());
        assert_eq!(parsed[0]["code"], "B");
    }

    #[test]
    fn empty_json_array_is_zero_rows_not_an_error() {
        assert!(rows(parse_text("[]").unwrap()).is_empty());
    }

    #[test]
    fn json_without_rows_is_no_tabular_data() {
        assert!(matches!(
            parse_text(r#"{"version":"1.0"}"#),
            Err(PipelineError::NoTabularData(_))
        ));
    }

    #[test]
    fn ndjson_lines_parse_as_rows() {
        let parsed = rows(parse_text("{\"code\":\"1\"}\n\n{\"code\":\"2\"}\n").unwrap());
        assert_eq!(parsed.len(), 2);
        assert_eq!(parsed[1]["code"], "2");
    }

    #[test]
    fn ndjson_with_a_bad_line_falls_through_to_csv() {
        // Second line is not JSON, so this must be treated as CSV text.
        let err = parse_text("{\"code\":\"1\"}\nnot json\n");
        // As CSV it parses (header `{"code":"1"}`), producing one row.
        assert_eq!(rows(err.unwrap()).len(), 1);
    }

    #[test]
    fn csv_comma_dialect() {
        let parsed = rows(parse_text("code,negotiated_rate\n100,50.00\n").unwrap());
        assert_eq!(parsed[0]["code"], "100");
        assert_eq!(parsed[0]["negotiated_rate"], "50.00");
    }

    #[test]
    fn csv_semicolon_dialect_is_sniffed() {
        let parsed = rows(parse_text("code;rate\n100;50\n200;60\n").unwrap());
        assert_eq!(parsed.len(), 2);
        assert_eq!(parsed[1]["rate"], "60");
    }

    #[test]
    fn csv_pipe_dialect_is_sniffed() {
        let parsed = rows(parse_text("code|rate\n100|50\n").unwrap());
        assert_eq!(parsed[0]["rate"], "50");
    }

    #[test]
    fn inconsistent_counts_fall_back_to_header_probe() {
        // No delimiter is consistent across lines; the probe accepts the
        // first that splits the header into more than one column.
        let parsed = rows(parse_text("a;b\n1;2;3\n").unwrap());
        assert_eq!(parsed[0]["a"], "1");
        assert_eq!(parsed[0]["b"], "2");
        assert_eq!(parsed[0][REST_KEY], serde_json::json!(["3"]));
    }

    #[test]
    fn csv_headers_come_from_header_row_not_first_record() {
        // A ragged first record must not shrink the reported column set.
        let parsed = parse_text("code,price,notes\n100\n200,7,x\n").unwrap();
        let cols = headers(parsed);
        assert_eq!(cols, vec!["code", "price", "notes"]);
    }

    #[test]
    fn json_headers_come_from_first_row_keys() {
        let parsed = parse_text(r#"[{"code":"1","rate":"2"}]"#).unwrap();
        assert_eq!(headers(parsed), vec!["code", "rate"]);
    }

    #[test]
    fn leading_bom_is_stripped() {
        let parsed = rows(parse_text("\u{feff}code,rate\n1,2\n").unwrap());
        assert_eq!(parsed[0]["code"], "1");
    }

    #[test]
    fn blank_text_is_unsupported() {
        assert!(matches!(
            parse_text("   \n  "),
            Err(PipelineError::UnsupportedFormat(_))
        ));
    }
}
