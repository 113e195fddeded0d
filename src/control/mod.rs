//! The two HTTP control planes.
//!
//! Client → guest: `/execute`, `/cancel`, `/stop`, `/disconnected`,
//! `/keepalive`. Guest → client: `/ready`, `/terminate`. Plain-text
//! responses, form-encoded POST bodies, default port 5000 on both sides.
//!
//! The `exes` form field is a single space-separated string of quoted
//! executable names; [`join_exes`] / [`split_exes`] are the two ends of
//! that wire encoding.

pub mod client;
pub mod guest;

/// Encode an executable list for the `exes` form field: each name wrapped
/// in double quotes, space separated.
pub fn join_exes(exes: &[String]) -> String {
    exes.iter()
        .map(|e| format!("\"{e}\""))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Decode the `exes` form field. Quotes group names containing spaces;
/// unquoted runs split on whitespace.
pub fn split_exes(raw: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;
    for c in raw.chars() {
        match c {
            '"' => in_quotes = !in_quotes,
            c if c.is_whitespace() && !in_quotes => {
                if !current.is_empty() {
                    out.push(std::mem::take(&mut current));
                }
            }
            c => current.push(c),
        }
    }
    if !current.is_empty() {
        out.push(current);
    }
    out
}
