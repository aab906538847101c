use serde_json::Value;

use crate::tabular::Row;

pub const CODE: &str = "code";
pub const DESCRIPTION: &str = "description";
pub const PROVIDER_NAME: &str = "provider_name";
pub const RATE_TYPE: &str = "rate_type";
pub const NEGOTIATED_RATE: &str = "negotiated_rate";

/// Canonical fields in mapping-priority order: when a header could satisfy
/// more than one field, the earlier field claims it.
pub const CANONICAL_FIELDS: [&str; 5] =
    [CODE, DESCRIPTION, PROVIDER_NAME, RATE_TYPE, NEGOTIATED_RATE];

/// Process-wide synonym tables. The canonical name leads each list so
/// already-normalized headers map onto themselves.
static SYNONYMS: [(&str, &[&str]); 5] = [
    (
        CODE,
        &[
            "code",
            "billing_code",
            "cpt",
            "cpt_code",
            "hcpcs",
            "hcpcs_code",
            "procedure_code",
            "service_code",
            "drg",
            "ms_drg",
        ],
    ),
    (
        DESCRIPTION,
        &[
            "description",
            "billing_code_name",
            "code_description",
            "procedure_description",
            "service_description",
            "item_description",
        ],
    ),
    (
        PROVIDER_NAME,
        &[
            "provider_name",
            "provider",
            "hospital_name",
            "hospital",
            "facility_name",
            "facility",
            "payer_name",
            "plan_name",
        ],
    ),
    (
        RATE_TYPE,
        &[
            "rate_type",
            "negotiated_type",
            "billing_class",
            "rate_category",
            "payer_class",
            "setting",
        ],
    ),
    (
        NEGOTIATED_RATE,
        &[
            "negotiated_rate",
            "rate",
            "negotiated_dollar_amount",
            "standard_charge",
            "gross_charge",
            "allowed_amount",
            "price",
            "amount",
            "charge",
            "payment",
        ],
    ),
];

/// Substring matching is skipped on narrow schemas, where a loose hit is more
/// likely to be a false positive than a renamed column.
const SUBSTRING_MIN_COLUMNS: usize = 3;

/// Residual headers the synonym passes could not place are offered to an
/// external collaborator. Disabled by default; the default suggests nothing.
pub trait MappingSuggester: Send + Sync {
    /// Return `(source_header, canonical_field)` pairs for any headers the
    /// implementation can place. Unknown canonical names are ignored.
    fn suggest(&self, residual_headers: &[String]) -> Vec<(String, String)>;
}

#[derive(Debug, Default)]
pub struct NoopSuggester;

impl MappingSuggester for NoopSuggester {
    fn suggest(&self, _residual_headers: &[String]) -> Vec<(String, String)> {
        Vec::new()
    }
}

/// Source-header → canonical-field mapping. Built once per dataset and
/// applied identically to every row, so two rows from the same source can
/// never resolve a column differently.
#[derive(Debug, Clone, Default)]
pub struct CanonicalFieldMap {
    entries: Vec<(String, &'static str)>,
}

impl CanonicalFieldMap {
    /// Pure function over the dataset's headers (CSV header row, or the first
    /// row's keys for JSON/NDJSON).
    pub fn build(headers: &[String], suggester: &dyn MappingSuggester) -> Self {
        let mut entries: Vec<(String, &'static str)> = Vec::new();
        let mapped = |entries: &[(String, &'static str)], h: &str| {
            entries.iter().any(|(source, _)| source == h)
        };

        // Exact pass: normalized header equals a synonym.
        for (field, synonyms) in SYNONYMS {
            for header in headers {
                if mapped(&entries, header) {
                    continue;
                }
                let norm = normalize_header(header);
                if synonyms.iter().any(|s| *s == norm) {
                    entries.push((header.clone(), field));
                }
            }
        }

        // Substring pass, wide schemas only.
        if headers.len() >= SUBSTRING_MIN_COLUMNS {
            for (field, synonyms) in SYNONYMS {
                for header in headers {
                    if mapped(&entries, header) {
                        continue;
                    }
                    let norm = normalize_header(header);
                    if synonyms.iter().any(|s| norm.contains(s)) {
                        entries.push((header.clone(), field));
                    }
                }
            }
        }

        // Residual hook.
        let residual: Vec<String> = headers
            .iter()
            .filter(|h| !mapped(&entries, h.as_str()))
            .cloned()
            .collect();
        if !residual.is_empty() {
            for (header, canonical) in suggester.suggest(&residual) {
                if mapped(&entries, &header) {
                    continue;
                }
                if let Some(field) = CANONICAL_FIELDS.iter().copied().find(|f| *f == canonical) {
                    if residual.contains(&header) {
                        entries.push((header, field));
                    }
                }
            }
        }

        Self { entries }
    }

    /// Add canonical keys alongside the originals. Never removes a key and
    /// never overwrites a canonical key already present.
    pub fn apply(&self, row: &mut Row) {
        for (source, field) in &self.entries {
            if row.contains_key(*field) {
                continue;
            }
            if let Some(value) = row.get(source.as_str()).cloned() {
                row.insert((*field).to_string(), value);
            }
        }
    }
}

fn normalize_header(header: &str) -> String {
    header.trim().to_ascii_lowercase()
}

/// Normalize rows in place: build the field map once from the dataset's
/// headers (CSV header row, or the first row's keys for JSON/NDJSON), apply
/// it to every row, then coerce the canonical values.
pub fn normalize_rows(
    rows: &mut Vec<Row>,
    headers: &[String],
    suggester: &dyn MappingSuggester,
) -> CanonicalFieldMap {
    let map = CanonicalFieldMap::build(headers, suggester);
    for row in rows.iter_mut() {
        map.apply(row);
        coerce_canonicals(row);
    }
    map
}

/// Post-mapping coercions: the rate becomes a finite number (0.0 when
/// unresolvable; see the accuracy caveat in `summary.rs`), string canonicals
/// are trimmed, absent string canonicals stay absent.
fn coerce_canonicals(row: &mut Row) {
    let rate = row.get(NEGOTIATED_RATE).map(coerce_rate).unwrap_or(0.0);
    row.insert(
        NEGOTIATED_RATE.to_string(),
        serde_json::Number::from_f64(rate)
            .map(Value::Number)
            .unwrap_or_else(|| Value::from(0.0)),
    );

    for field in [CODE, DESCRIPTION, PROVIDER_NAME, RATE_TYPE] {
        let trimmed = match row.get(field) {
            Some(Value::String(s)) if s.trim().len() != s.len() => Some(s.trim().to_string()),
            _ => None,
        };
        if let Some(t) = trimmed {
            row.insert(field.to_string(), Value::String(t));
        }
    }
}

/// Lenient numeric coercion: keep digits, dot and minus, drop everything else
/// (currency symbols, thousands separators). Empty, `nan` and unparseable
/// values become 0.0 rather than failing the request.
pub fn coerce_rate(value: &Value) -> f64 {
    match value {
        Value::Number(n) => n.as_f64().filter(|f| f.is_finite()).unwrap_or(0.0),
        Value::String(s) => {
            let trimmed = s.trim();
            if trimmed.is_empty() || trimmed.eq_ignore_ascii_case("nan") {
                return 0.0;
            }
            let cleaned: String = trimmed
                .chars()
                .filter(|c| c.is_ascii_digit() || *c == '.' || *c == '-')
                .collect();
            cleaned
                .parse::<f64>()
                .ok()
                .filter(|f| f.is_finite())
                .unwrap_or(0.0)
        }
        _ => 0.0,
    }
}

/// String rendering used for code comparison and grouping.
pub fn value_as_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.trim().to_string(),
        Value::Number(n) => n.to_string(),
        Value::Bool(b) => b.to_string(),
        _ => String::new(),
    }
}

/// Pre-normalization key aliases probed by the upload path's compatibility
/// fallback.
const CODE_ALIASES: [&str; 4] = ["code", "billing_code", "cpt_code", "hcpcs_code"];

/// Keep rows whose code is in the requested set. An empty request keeps
/// everything. `probe_aliases` additionally checks pre-normalization code
/// columns (upload path).
pub fn filter_by_codes(rows: Vec<Row>, codes: &[String], probe_aliases: bool) -> Vec<Row> {
    if codes.is_empty() {
        return rows;
    }
    rows.into_iter()
        .filter(|row| {
            let mut candidates: Vec<String> = Vec::new();
            if let Some(v) = row.get(CODE) {
                candidates.push(value_as_string(v));
            }
            if probe_aliases {
                for alias in CODE_ALIASES {
                    if let Some(v) = row.get(alias) {
                        candidates.push(value_as_string(v));
                    }
                }
            }
            candidates.iter().any(|c| codes.iter().any(|w| w == c))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn row(value: serde_json::Value) -> Row {
        value.as_object().cloned().unwrap()
    }

    fn normalize(rows: &mut Vec<Row>) -> CanonicalFieldMap {
        let headers: Vec<String> = rows
            .first()
            .map(|r| r.keys().cloned().collect())
            .unwrap_or_default();
        normalize_rows(rows, &headers, &NoopSuggester)
    }

    #[test]
    fn exact_pass_is_case_insensitive_and_trimmed() {
        let headers = vec!["  CPT_Code ".to_string(), "Standard_Charge".to_string()];
        let map = CanonicalFieldMap::build(&headers, &NoopSuggester);
        let mut r = row(json!({"  CPT_Code ": "100", "Standard_Charge": "50"}));
        map.apply(&mut r);
        assert_eq!(r[CODE], "100");
        assert_eq!(r[NEGOTIATED_RATE], "50");
        // Original keys survive.
        assert_eq!(r["  CPT_Code "], "100");
    }

    #[test]
    fn substring_pass_requires_three_columns() {
        let narrow = vec!["the_billing_code".to_string(), "rate".to_string()];
        let map = CanonicalFieldMap::build(&narrow, &NoopSuggester);
        let mut r = row(json!({"the_billing_code": "1", "rate": "2"}));
        map.apply(&mut r);
        assert!(!r.contains_key(CODE));
        assert_eq!(r[NEGOTIATED_RATE], "2");

        let wide = vec![
            "the_billing_code".to_string(),
            "rate".to_string(),
            "notes".to_string(),
        ];
        let map = CanonicalFieldMap::build(&wide, &NoopSuggester);
        let mut r = row(json!({"the_billing_code": "1", "rate": "2", "notes": "x"}));
        map.apply(&mut r);
        assert_eq!(r[CODE], "1");
    }

    #[test]
    fn map_is_uniform_across_rows() {
        let mut rows = vec![
            row(json!({"hcpcs": "A100", "price": "10"})),
            row(json!({"hcpcs": "B200", "price": "20"})),
        ];
        normalize(&mut rows);
        assert_eq!(rows[0][CODE], "A100");
        assert_eq!(rows[1][CODE], "B200");
        assert_eq!(rows[0][NEGOTIATED_RATE], json!(10.0));
        assert_eq!(rows[1][NEGOTIATED_RATE], json!(20.0));
    }

    #[test]
    fn apply_never_overwrites_existing_canonical() {
        let headers = vec!["code".to_string(), "billing_code".to_string()];
        let map = CanonicalFieldMap::build(&headers, &NoopSuggester);
        let mut r = row(json!({"code": "KEEP", "billing_code": "OTHER"}));
        map.apply(&mut r);
        assert_eq!(r[CODE], "KEEP");
    }

    #[test]
    fn normalization_is_idempotent() {
        let mut rows = vec![row(json!({"cpt": "99213", "charge": "$1,234.50"}))];
        normalize(&mut rows);
        let first = rows.clone();
        normalize(&mut rows);
        assert_eq!(rows, first);
        assert_eq!(rows[0][NEGOTIATED_RATE], json!(1234.5));
    }

    #[test]
    fn rate_coercion_is_lenient() {
        assert_eq!(coerce_rate(&json!("$1,234.50")), 1234.5);
        assert_eq!(coerce_rate(&json!("  42 USD ")), 42.0);
        assert_eq!(coerce_rate(&json!("-7.5")), -7.5);
        assert_eq!(coerce_rate(&json!("")), 0.0);
        assert_eq!(coerce_rate(&json!("NaN")), 0.0);
        assert_eq!(coerce_rate(&json!("n/a")), 0.0);
        assert_eq!(coerce_rate(&json!(12.5)), 12.5);
        assert_eq!(coerce_rate(&json!(null)), 0.0);
    }

    #[test]
    fn missing_rate_column_coerces_to_zero() {
        let mut rows = vec![row(json!({"code": "1"}))];
        normalize(&mut rows);
        assert_eq!(rows[0][NEGOTIATED_RATE], json!(0.0));
    }

    #[test]
    fn string_canonicals_are_trimmed() {
        let mut rows = vec![row(json!({"code": " 99 ", "description": " visit ", "x": "y"}))];
        normalize(&mut rows);
        assert_eq!(rows[0][CODE], "99");
        assert_eq!(rows[0][DESCRIPTION], "visit");
    }

    #[test]
    fn suggester_places_residual_headers() {
        struct Fixed;
        impl MappingSuggester for Fixed {
            fn suggest(&self, residual: &[String]) -> Vec<(String, String)> {
                residual
                    .iter()
                    .filter(|h| h.as_str() == "who")
                    .map(|h| (h.clone(), PROVIDER_NAME.to_string()))
                    .collect()
            }
        }
        let headers = vec!["who".to_string(), "rate".to_string()];
        let map = CanonicalFieldMap::build(&headers, &Fixed);
        let mut r = row(json!({"who": "Mercy General", "rate": "5"}));
        map.apply(&mut r);
        assert_eq!(r[PROVIDER_NAME], "Mercy General");
    }

    #[test]
    fn filter_matches_code_as_string() {
        let rows = vec![
            row(json!({"code": "100", "negotiated_rate": 1.0})),
            row(json!({"code": 200, "negotiated_rate": 2.0})),
            row(json!({"code": "300", "negotiated_rate": 3.0})),
        ];
        let kept = filter_by_codes(rows, &["100".to_string(), "200".to_string()], false);
        assert_eq!(kept.len(), 2);
    }

    #[test]
    fn filter_probes_aliases_on_upload_path() {
        let rows = vec![row(json!({"cpt_code": "777"}))];
        let kept = filter_by_codes(rows.clone(), &["777".to_string()], true);
        assert_eq!(kept.len(), 1);
        let kept = filter_by_codes(rows, &["777".to_string()], false);
        assert!(kept.is_empty());
    }

    #[test]
    fn empty_code_set_is_identity() {
        let rows = vec![row(json!({"code": "1"})), row(json!({"code": "2"}))];
        assert_eq!(filter_by_codes(rows, &[], false).len(), 2);
    }
}
