//! Conversion of metric families into OpenTSDB telnet `put` lines.
//!
//! One line per sample:
//!
//! ```text
//! put <metric> <timestamp_ms> <value> <tagk>=<tagv> ...
//! ```
//!
//! Names and tags are restricted to the OpenTSDB character set; anything else is
//! replaced by `_`. Samples with non-finite values are skipped because OpenTSDB cannot
//! store them. Conversion is pure: the same family always produces the same lines.
//!
//! Values are written in plain decimal, except magnitudes at or above 2^63 which use
//! exponent form: OpenTSDB reads an integer-looking value as a signed 64-bit long.
//!
//! OpenTSDB rejects a `put` without tags. A sample with no labels only gets a tag from
//! the forwarder's `hostname` label; see [`has_tags`].

use crate::model::{MetricFamily, Sample};

/// Converts one family into zero or more wire lines (without trailing newline).
pub fn to_put_lines(family: &MetricFamily) -> Vec<String> {
    family
        .samples
        .iter()
        .filter(|sample| sample.value.is_finite())
        .map(|sample| put_line(sample, family.scraped_at_ms))
        .collect()
}

fn put_line(sample: &Sample, default_ts_ms: i64) -> String {
    let mut line = format!(
        "put {} {} {}",
        sanitize(&sample.name),
        sample.timestamp_ms.unwrap_or(default_ts_ms),
        format_value(sample.value)
    );
    // BTreeMap iteration keeps tag order stable.
    for (key, value) in &sample.labels {
        if value.is_empty() {
            continue;
        }
        line.push(' ');
        line.push_str(&sanitize(key));
        line.push('=');
        line.push_str(&sanitize(value));
    }
    line
}

/// Smallest magnitude OpenTSDB can no longer parse as a long.
const LONG_LIMIT: f64 = 9_223_372_036_854_775_808.0;

/// Shortest round-trip form; exponent form once the value would overflow a long.
pub fn format_value(value: f64) -> String {
    if value.abs() >= LONG_LIMIT {
        format!("{value:e}")
    } else {
        value.to_string()
    }
}

/// True if a `put` line carries at least one tag.
pub fn has_tags(line: &str) -> bool {
    line.splitn(5, ' ').nth(4).is_some_and(|tags| !tags.is_empty())
}

/// Maps a name or tag to the OpenTSDB character set `[A-Za-z0-9-_./]`.
pub fn sanitize(s: &str) -> String {
    s.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | '/') {
                c
            } else {
                '_'
            }
        })
        .collect()
}
