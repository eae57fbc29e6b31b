//! Store locator strings.
//!
//! A locator has the form `<backend>:<rest>`:
//!
//! - `file:<path>` or a bare absolute/relative path: a directory store.
//! - `<backend>:<region>:<name>`: an object store named `name` in `region`
//!   (for example `aws:us-west-2:my-run` or `mem:local:scratch`).

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use crate::error::{StoreError, StoreResult};

/// Parsed store locator.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Locator {
    /// Directory-backed store.
    File(PathBuf),
    /// Object-store-backed store.
    Object {
        backend: String,
        region: String,
        name: String,
    },
}

impl Locator {
    /// Parse a locator string.
    pub fn parse(s: &str) -> StoreResult<Self> {
        let invalid = |why: &str| StoreError::InvalidLocator(format!("{s:?}: {why}"));
        if s.is_empty() {
            return Err(invalid("empty"));
        }
        if s.starts_with('/') || s.starts_with('.') {
            return Ok(Locator::File(PathBuf::from(s)));
        }
        let Some((backend, rest)) = s.split_once(':') else {
            return Ok(Locator::File(PathBuf::from(s)));
        };
        if backend == "file" {
            if rest.is_empty() {
                return Err(invalid("missing path"));
            }
            return Ok(Locator::File(PathBuf::from(rest)));
        }
        if backend.is_empty() || !backend.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit()) {
            return Err(invalid("bad backend prefix"));
        }
        let (region, name) = rest
            .split_once(':')
            .ok_or_else(|| invalid("expected <backend>:<region>:<name>"))?;
        if region.is_empty() {
            return Err(invalid("missing region"));
        }
        if name.is_empty() {
            return Err(invalid("missing name"));
        }
        Ok(Locator::Object {
            backend: backend.to_string(),
            region: region.to_string(),
            name: name.to_string(),
        })
    }

    /// Backend prefix (`file` for directory stores).
    pub fn backend(&self) -> &str {
        match self {
            Locator::File(_) => "file",
            Locator::Object { backend, .. } => backend,
        }
    }
}

impl FromStr for Locator {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for Locator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Locator::File(path) => write!(f, "file:{}", path.display()),
            Locator::Object {
                backend,
                region,
                name,
            } => write!(f, "{backend}:{region}:{name}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_file_locators() {
        assert_eq!(
            Locator::parse("/tmp/store").unwrap(),
            Locator::File(PathBuf::from("/tmp/store"))
        );
        assert_eq!(
            Locator::parse("file:/tmp/store").unwrap(),
            Locator::File(PathBuf::from("/tmp/store"))
        );
        assert_eq!(
            Locator::parse("relative-dir").unwrap(),
            Locator::File(PathBuf::from("relative-dir"))
        );
        assert_eq!(Locator::parse("file:/a").unwrap().to_string(), "file:/a");
    }

    #[test]
    fn test_object_locators() {
        let loc: Locator = "aws:us-west-2:my-run".parse().unwrap();
        assert_eq!(loc.backend(), "aws");
        assert_eq!(
            loc,
            Locator::Object {
                backend: "aws".into(),
                region: "us-west-2".into(),
                name: "my-run".into(),
            }
        );
        assert_eq!(loc.to_string(), "aws:us-west-2:my-run");
    }

    #[test]
    fn test_invalid_locators() {
        for bad in ["", "aws:us-west-2", "aws::name", "aws:region:", "AWS:r:n", "file:"] {
            assert!(
                matches!(Locator::parse(bad), Err(StoreError::InvalidLocator(_))),
                "{bad:?} should be rejected"
            );
        }
    }
}
