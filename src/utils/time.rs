use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;

static UNSAFE_CHARS: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[^a-zA-Z0-9\-_\.]").expect("sanitize regex"));

pub fn new_run_id(target: &str, started: DateTime<Utc>) -> String {
    format!("run_{}_{}", sanitize_target(target), started.format("%Y%m%d_%H%M%S"))
}

/// Replace characters that aren't safe in file names.
pub fn sanitize_target(target: &str) -> String {
    let sanitized = UNSAFE_CHARS.replace_all(target, "_").to_string();
    if sanitized.is_empty() {
        "target".to_string()
    } else {
        sanitized
    }
}

pub fn timestamp_slug(at: DateTime<Utc>) -> String {
    at.format("%Y%m%d_%H%M%S").to_string()
}
