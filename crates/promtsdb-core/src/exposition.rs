//! Parser for the Prometheus text exposition format (version 0.0.4).
//!
//! Pure functions over string input. Samples are grouped into the family announced by
//! the preceding `# HELP` / `# TYPE` lines; histogram and summary samples keep their
//! `_bucket` / `_sum` / `_count` suffix in [`Sample::name`].

use std::collections::BTreeMap;

use crate::model::{MetricFamily, MetricType, Sample};

/// Error type for malformed exposition text.
#[derive(Debug, Clone, PartialEq)]
pub struct ParseError {
    /// 1-based line number of the offending line.
    pub line: usize,
    pub message: String,
}

impl ParseError {
    pub fn new(line: usize, msg: impl Into<String>) -> Self {
        Self {
            line,
            message: msg.into(),
        }
    }
}

impl std::fmt::Display for ParseError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Parse error at line {}: {}", self.line, self.message)
    }
}

impl std::error::Error for ParseError {}

/// Parses a full scrape body into metric families, in order of first appearance.
///
/// `scraped_at_ms` is stamped on every family and used later for samples without an
/// explicit timestamp.
pub fn parse_text(input: &str, scraped_at_ms: i64) -> Result<Vec<MetricFamily>, ParseError> {
    let mut families: Vec<MetricFamily> = Vec::new();

    for (idx, raw) in input.lines().enumerate() {
        let lineno = idx + 1;
        let line = raw.trim();
        if line.is_empty() {
            continue;
        }

        if let Some(comment) = line.strip_prefix('#') {
            parse_comment(comment, scraped_at_ms, &mut families)
                .map_err(|msg| ParseError::new(lineno, msg))?;
            continue;
        }

        let sample = parse_sample(line).map_err(|msg| ParseError::new(lineno, msg))?;
        match families.last_mut() {
            Some(family) if family.owns_sample(&sample.name) => family.samples.push(sample),
            _ => {
                let mut family =
                    MetricFamily::new(sample.name.clone(), MetricType::Untyped, scraped_at_ms);
                family.samples.push(sample);
                families.push(family);
            }
        }
    }

    Ok(families)
}

/// Handles `# HELP` and `# TYPE`; any other comment is ignored.
fn parse_comment(
    comment: &str,
    scraped_at_ms: i64,
    families: &mut Vec<MetricFamily>,
) -> Result<(), String> {
    let comment = comment.trim_start();
    let Some((keyword, rest)) = comment.split_once(char::is_whitespace) else {
        return Ok(());
    };
    if keyword != "HELP" && keyword != "TYPE" {
        return Ok(());
    }

    let rest = rest.trim_start();
    let (name, tail) = rest
        .split_once(char::is_whitespace)
        .unwrap_or((rest, ""));
    if !is_metric_name(name) {
        return Err(format!("invalid metric name '{}' in {}", name, keyword));
    }

    let family = family_for_metadata(name, scraped_at_ms, families)?;
    if keyword == "HELP" {
        family.help = unescape_help(tail.trim_start());
    } else {
        let type_name = tail.trim();
        family.metric_type = MetricType::from_keyword(type_name)
            .ok_or_else(|| format!("unknown metric type '{}' for {}", type_name, name))?;
    }
    Ok(())
}

/// Returns the family that HELP/TYPE metadata for `name` applies to, opening a new one
/// when the previous family has a different name.
fn family_for_metadata<'a>(
    name: &str,
    scraped_at_ms: i64,
    families: &'a mut Vec<MetricFamily>,
) -> Result<&'a mut MetricFamily, String> {
    let reuse = match families.last() {
        Some(last) if last.name == name => {
            if !last.samples.is_empty() {
                return Err(format!("metadata for {} appears after its samples", name));
            }
            true
        }
        _ => false,
    };
    if !reuse {
        families.push(MetricFamily::new(name, MetricType::Untyped, scraped_at_ms));
    }
    // Non-empty: either reused or just pushed.
    families
        .last_mut()
        .ok_or_else(|| "no family for metadata".to_string())
}

fn unescape_help(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut chars = s.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('n') => out.push('\n'),
            Some('\\') => out.push('\\'),
            Some(other) => {
                out.push('\\');
                out.push(other);
            }
            None => out.push('\\'),
        }
    }
    out
}

/// Parses one sample line: `name{label="value",...} value [timestamp]`.
fn parse_sample(line: &str) -> Result<Sample, String> {
    let name_end = line
        .find(|c: char| c == '{' || c.is_whitespace())
        .unwrap_or(line.len());
    let name = &line[..name_end];
    if !is_metric_name(name) {
        return Err(format!("invalid metric name '{}'", name));
    }

    let mut rest = &line[name_end..];
    let mut labels = BTreeMap::new();
    if let Some(label_text) = rest.strip_prefix('{') {
        rest = parse_labels(label_text, &mut labels)?;
    }

    let mut fields = rest.split_whitespace();
    let value = fields
        .next()
        .ok_or_else(|| format!("missing value for {}", name))
        .and_then(parse_value)?;
    let timestamp_ms = fields
        .next()
        .map(|t| {
            t.parse::<i64>()
                .map_err(|_| format!("invalid timestamp '{}'", t))
        })
        .transpose()?;
    if let Some(extra) = fields.next() {
        return Err(format!("unexpected trailing field '{}'", extra));
    }

    Ok(Sample {
        name: name.to_string(),
        labels,
        value,
        timestamp_ms,
    })
}

/// Parses the label set after the opening brace and returns the text following `}`.
fn parse_labels<'a>(
    mut s: &'a str,
    labels: &mut BTreeMap<String, String>,
) -> Result<&'a str, String> {
    loop {
        s = s.trim_start();
        if s.is_empty() {
            return Err("unterminated label set".to_string());
        }
        if let Some(rest) = s.strip_prefix('}') {
            return Ok(rest);
        }

        let eq = s
            .find('=')
            .ok_or_else(|| "label without value".to_string())?;
        let name = s[..eq].trim();
        if !is_label_name(name) {
            return Err(format!("invalid label name '{}'", name));
        }

        let quoted = s[eq + 1..].trim_start();
        let quoted = quoted
            .strip_prefix('"')
            .ok_or_else(|| format!("value of label {} must be quoted", name))?;
        let (value, rest) = read_quoted(quoted)?;
        labels.insert(name.to_string(), value);

        s = rest.trim_start();
        if let Some(rest) = s.strip_prefix(',') {
            s = rest;
        } else if let Some(rest) = s.strip_prefix('}') {
            return Ok(rest);
        } else {
            return Err("expected ',' or '}' after label value".to_string());
        }
    }
}

/// Reads a label value up to its closing quote, resolving escapes.
fn read_quoted(s: &str) -> Result<(String, &str), String> {
    let mut out = String::new();
    let mut chars = s.char_indices();
    while let Some((i, c)) = chars.next() {
        match c {
            '"' => return Ok((out, &s[i + 1..])),
            '\\' => match chars.next() {
                Some((_, 'n')) => out.push('\n'),
                Some((_, '\\')) => out.push('\\'),
                Some((_, '"')) => out.push('"'),
                Some((_, other)) => {
                    out.push('\\');
                    out.push(other);
                }
                None => break,
            },
            _ => out.push(c),
        }
    }
    Err("unterminated label value".to_string())
}

fn parse_value(s: &str) -> Result<f64, String> {
    match s {
        "NaN" => Ok(f64::NAN),
        "+Inf" | "Inf" => Ok(f64::INFINITY),
        "-Inf" => Ok(f64::NEG_INFINITY),
        _ => s
            .parse::<f64>()
            .map_err(|_| format!("invalid sample value '{}'", s)),
    }
}

fn is_metric_name(s: &str) -> bool {
    let mut chars = s.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' || c == ':' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == ':')
}

fn is_label_name(s: &str) -> bool {
    let mut chars = s.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}
