//! Native interface names.
//!
//! Group names are user input. Nothing derived from them reaches an external
//! command unless it passes [`validate`].

use crate::error::{Error, Result};

/// Linux IFNAMSIZ minus the trailing NUL.
pub const MAX_LEN: usize = 15;

/// Derive the interface name for a group: `wg<id>-<name>` with the name
/// lowercased and stripped to ASCII alphanumerics, cut to [`MAX_LEN`].
pub fn derive(group_id: i64, group_name: &str) -> String {
    let stripped: String = group_name
        .to_lowercase()
        .chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .collect();

    let mut name = format!("wg{}", group_id.unsigned_abs());
    if !stripped.is_empty() {
        name.push('-');
        name.push_str(&stripped);
    }
    name.truncate(MAX_LEN);
    name
}

/// Allow-list check: `^[a-z0-9][a-z0-9-]{0,14}$`.
pub fn validate(name: &str) -> Result<()> {
    let bytes = name.as_bytes();
    let valid = match bytes.split_first() {
        Some((first, rest)) => {
            (first.is_ascii_lowercase() || first.is_ascii_digit())
                && rest.len() < MAX_LEN
                && rest
                    .iter()
                    .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || *b == b'-')
        }
        None => false,
    };

    if valid {
        Ok(())
    } else {
        Err(Error::InvalidIdentifier(name.to_string()))
    }
}
