//! Student Identifier allocation.
//!
//! Identifiers look like `STU-2025-0042`: a literal prefix, the calendar
//! year at allocation time, and a running sequence number. The sequence
//! continues from the latest persisted record regardless of its year, so
//! a year rollover changes the visible prefix but never resets the count.

/// Computes the next Student Identifier from the latest persisted one.
///
/// A missing or malformed `latest` restarts the sequence at 1. Sequence
/// numbers are zero-padded to four digits; values past 9999 simply render
/// wider.
pub fn next_student_id(latest: Option<&str>, year: i32) -> String {
    let next = latest.and_then(parse_sequence).map(|n| n + 1).unwrap_or(1);
    format!("STU-{}-{:04}", year, next)
}

fn parse_sequence(id: &str) -> Option<u64> {
    let parts: Vec<&str> = id.split('-').collect();
    if parts.len() != 3 || parts[0] != "STU" {
        return None;
    }
    parts[2].parse().ok()
}
