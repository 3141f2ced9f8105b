use chrono::{DateTime, Utc};
use uuid::Uuid;

pub fn now_iso() -> String {
    Utc::now().to_rfc3339()
}

pub fn new_id() -> String {
    Uuid::new_v4().to_string()
}

/// Digits only; `None` when nothing usable remains.
pub fn normalize_phone(raw: &str) -> Option<String> {
    let digits = raw
        .chars()
        .filter(|c| c.is_ascii_digit())
        .collect::<String>();
    if digits.is_empty() {
        None
    } else {
        Some(digits)
    }
}

/// Provider timestamps are unix seconds as a string.
pub fn unix_to_iso(raw: &str) -> Option<String> {
    let secs = raw.trim().parse::<i64>().ok()?;
    DateTime::<Utc>::from_timestamp(secs, 0).map(|ts| ts.to_rfc3339())
}
