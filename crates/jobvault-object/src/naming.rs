//! Store names and the containers derived from them.

use jobvault_core::{StoreError, StoreResult};

/// Longest store name; `<name>--files` must stay within 63 characters.
pub const MAX_STORE_NAME_LEN: usize = 56;

/// Separator between the store name and a container suffix. Store names
/// may not contain it, so derived names never collide.
pub const CONTAINER_SEPARATOR: &str = "--";

/// Check a store name: lowercase letters, digits and single hyphens,
/// starting and ending with a letter or digit.
pub fn validate_store_name(name: &str) -> StoreResult<()> {
    let invalid = |reason: &str| StoreError::InvalidName {
        name: name.to_string(),
        reason: reason.to_string(),
    };
    if name.is_empty() {
        return Err(invalid("empty"));
    }
    if name.len() > MAX_STORE_NAME_LEN {
        return Err(invalid("longer than 56 characters"));
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
    {
        return Err(invalid("only lowercase letters, digits and '-' are allowed"));
    }
    if name.starts_with('-') || name.ends_with('-') {
        return Err(invalid("must start and end with a letter or digit"));
    }
    if name.contains(CONTAINER_SEPARATOR) {
        return Err(invalid("'--' is reserved"));
    }
    Ok(())
}

/// Container names of one store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Containers {
    /// Job, file and shared-file records plus the store config.
    pub jobs: String,
    /// File content, overflow records and stats.
    pub files: String,
}

impl Containers {
    pub fn for_store(name: &str) -> Self {
        Self {
            jobs: format!("{name}{CONTAINER_SEPARATOR}jobs"),
            files: format!("{name}{CONTAINER_SEPARATOR}files"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_names() {
        let longest = "a".repeat(MAX_STORE_NAME_LEN);
        for name in ["a", "run-42", "x1-y2-z3", longest.as_str()] {
            assert!(validate_store_name(name).is_ok(), "{name:?}");
        }
    }

    #[test]
    fn test_invalid_names() {
        let too_long = "a".repeat(57);
        for name in [
            "",
            "Upper",
            "under_score",
            "double--hyphen",
            "-leading",
            "trailing-",
            "dot.name",
            too_long.as_str(),
        ] {
            assert!(
                matches!(validate_store_name(name), Err(StoreError::InvalidName { .. })),
                "{name:?} should be rejected"
            );
        }
    }

    #[test]
    fn test_container_names_fit() {
        let name = "a".repeat(MAX_STORE_NAME_LEN);
        let containers = Containers::for_store(&name);
        assert_eq!(containers.files.len(), 63);
        assert!(containers.jobs.ends_with("--jobs"));
    }
}
