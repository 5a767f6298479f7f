use regex::Regex;
use std::sync::OnceLock;

static COVERAGE_RE: OnceLock<Regex> = OnceLock::new();

fn coverage_re() -> &'static Regex {
    // Coverage strings arrive as rendered HTML, e.g. `<span class="..">73.5</span>`.
    COVERAGE_RE.get_or_init(|| {
        Regex::new(r">\s*(-?\d+(?:\.\d+)?)\s*<").expect("coverage pattern is valid")
    })
}

/// Extract the first `>number<` percentage embedded in a coverage string.
///
/// Returns `0.0` for `None`, empty input, or text without a match. Never fails.
pub fn parse_coverage(text: Option<&str>) -> f64 {
    let Some(text) = text else {
        return 0.0;
    };
    if text.is_empty() {
        return 0.0;
    }
    coverage_re()
        .captures(text)
        .and_then(|caps| caps.get(1))
        .and_then(|m| m.as_str().parse::<f64>().ok())
        .unwrap_or(0.0)
}

/// Same as [`parse_coverage`] but for the raw JSON value; bare numbers are taken as-is.
pub fn parse_coverage_value(value: Option<&serde_json::Value>) -> f64 {
    match value {
        Some(serde_json::Value::Number(n)) => n.as_f64().unwrap_or(0.0),
        Some(serde_json::Value::String(s)) => parse_coverage(Some(s)),
        _ => 0.0,
    }
}

fn is_stripped_control(c: char) -> bool {
    matches!(c, '\u{00}'..='\u{08}' | '\u{0B}'..='\u{0C}' | '\u{0E}'..='\u{1F}')
}

/// Strip ASCII control characters (keeping tab, LF and CR) and trim whitespace.
pub fn sanitize_text(s: Option<&str>) -> String {
    let Some(s) = s else {
        return String::new();
    };
    if !s.chars().any(is_stripped_control) {
        return s.trim().to_string();
    }
    let cleaned: String = s.chars().filter(|c| !is_stripped_control(*c)).collect();
    cleaned.trim().to_string()
}

/// Convenience for optional JSON string fields.
pub fn sanitize_value(value: Option<&serde_json::Value>) -> String {
    match value {
        Some(serde_json::Value::String(s)) => sanitize_text(Some(s)),
        Some(serde_json::Value::Number(n)) => n.to_string(),
        _ => String::new(),
    }
}
