use std::collections::BTreeMap;

use serde::Serialize;
use serde_json::Value;

use crate::normalize::{CODE, DESCRIPTION, NEGOTIATED_RATE, PROVIDER_NAME, value_as_string};
use crate::tabular::Row;

/// Distributional statistics for one billing code, recomputed in full on
/// every request.
///
/// Accuracy caveat: rates that failed to parse were coerced to 0.0 upstream
/// and participate here, so `min` can read as zero for codes whose true
/// minimum is unknown. Kept for compatibility with the reference behavior.
#[derive(Debug, Clone, Serialize)]
pub struct CodeSummary {
    pub code: String,
    pub description: String,
    pub count: usize,
    pub min: f64,
    pub median: f64,
    pub p25: f64,
    pub p75: f64,
    pub max: f64,
    pub top3: Vec<ProviderRate>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ProviderRate {
    pub provider_name: String,
    pub negotiated_rate: f64,
}

/// Group normalized rows by code and compute per-code summaries, sorted
/// ascending by code. Rows with an empty code are excluded entirely; groups
/// without a single numeric rate are dropped silently.
pub fn summarize(rows: &[Row]) -> Vec<CodeSummary> {
    let mut groups: BTreeMap<String, Vec<&Row>> = BTreeMap::new();
    for row in rows {
        let code = row.get(CODE).map(value_as_string).unwrap_or_default();
        if code.is_empty() {
            continue;
        }
        groups.entry(code).or_default().push(row);
    }

    let mut out = Vec::with_capacity(groups.len());
    for (code, members) in groups {
        let mut rates: Vec<f64> = members
            .iter()
            .filter_map(|r| r.get(NEGOTIATED_RATE))
            .filter_map(Value::as_f64)
            .filter(|f| f.is_finite())
            .collect();
        if rates.is_empty() {
            continue;
        }

        let description = members
            .iter()
            .filter_map(|r| r.get(DESCRIPTION))
            .map(value_as_string)
            .find(|d| !d.is_empty())
            .unwrap_or_default();

        let mut pairs: Vec<ProviderRate> = members
            .iter()
            .filter_map(|r| {
                let rate = r.get(NEGOTIATED_RATE).and_then(Value::as_f64)?;
                Some(ProviderRate {
                    provider_name: r
                        .get(PROVIDER_NAME)
                        .map(value_as_string)
                        .unwrap_or_default(),
                    negotiated_rate: rate,
                })
            })
            .collect();
        // Stable sort: ties keep original row order.
        pairs.sort_by(|a, b| a.negotiated_rate.total_cmp(&b.negotiated_rate));
        pairs.truncate(3);

        let count = rates.len();
        rates.sort_by(f64::total_cmp);

        out.push(CodeSummary {
            code,
            description,
            count,
            min: rates[0],
            median: median(&rates),
            p25: percentile(&rates, 25.0),
            p75: percentile(&rates, 75.0),
            max: rates[count - 1],
            top3: pairs,
        });
    }
    out
}

/// Odd count: middle element; even count: mean of the two middle elements.
/// `sorted` must be ascending and non-empty.
fn median(sorted: &[f64]) -> f64 {
    let n = sorted.len();
    if n % 2 == 1 {
        sorted[n / 2]
    } else {
        (sorted[n / 2 - 1] + sorted[n / 2]) / 2.0
    }
}

/// Linear interpolation at fractional rank `(n-1) * p / 100`. This exact rule
/// is part of the output contract (parity-tested), not a library default.
fn percentile(sorted: &[f64], p: f64) -> f64 {
    let n = sorted.len();
    if n == 1 {
        return sorted[0];
    }
    let rank = (n - 1) as f64 * p / 100.0;
    let lo = rank.floor() as usize;
    let hi = rank.ceil() as usize;
    if lo == hi {
        sorted[lo]
    } else {
        sorted[lo] + (rank - lo as f64) * (sorted[hi] - sorted[lo])
    }
}
