//! Composable locators for entries inside nested archives
//!
//! A locator addresses one entry, possibly several archives deep:
//!
//! ```text
//! file:///opt/app.pkg                                  the container itself
//! nest:file:///opt/app.pkg!/lib.pkg                    an archive inside it
//! nest:nest:file:///opt/app.pkg!/lib.pkg!/util.mod     an entry inside that
//! ```
//!
//! Each nesting level wraps the outer locator in another `nest:` prefix and
//! appends `!/` plus the entry path. Parsing splits on the last `!/`, so the
//! grammar composes to any depth.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;

use thiserror::Error;
use url::Url;

/// Scheme of locators that point inside an archive.
pub const NESTED_SCHEME: &str = "nest";

/// Separator between an archive locator and an entry path.
pub const ENTRY_SEPARATOR: &str = "!/";

/// Errors that can occur while building or parsing a locator
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum LocatorError {
    /// The text is not a valid URL
    #[error("Malformed locator '{locator}': {reason}")]
    Malformed { locator: String, reason: String },

    /// Only `file:` and `nest:` locators are understood
    #[error("Unsupported locator scheme '{0}'")]
    UnsupportedScheme(String),

    /// A `nest:` locator without a `!/` entry separator
    #[error("Locator '{0}' has no entry separator")]
    MissingSeparator(String),

    /// Entry paths must be non-empty
    #[error("Locator '{0}' has an empty entry path")]
    EmptyEntryPath(String),

    /// Entry paths cannot contain the separator sequence
    #[error("Entry path '{0}' contains the reserved sequence '!/'")]
    ReservedSequence(String),

    /// The file path could not be turned into an absolute `file:` URL
    #[error("Path '{0}' cannot be expressed as a file locator")]
    NotAbsolute(PathBuf),
}

/// Address of a container archive or of an entry nested inside one.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Locator {
    /// A file on the local filesystem (always an absolute `file:` URL).
    File(Url),

    /// An entry inside the archive addressed by `outer`.
    Nested { outer: Arc<Locator>, path: String },
}

impl Locator {
    /// Build a file locator from a filesystem path.
    ///
    /// Relative paths are made absolute against the current directory.
    pub fn from_path(path: &Path) -> Result<Self, LocatorError> {
        let absolute = std::path::absolute(path)
            .map_err(|_| LocatorError::NotAbsolute(path.to_path_buf()))?;
        let url = Url::from_file_path(&absolute)
            .map_err(|_| LocatorError::NotAbsolute(absolute.clone()))?;
        Ok(Locator::File(url))
    }

    /// Address the entry `path` inside the archive this locator points at.
    pub fn entry(&self, path: &str) -> Result<Self, LocatorError> {
        let path = path.trim_start_matches('/');
        if path.is_empty() {
            return Err(LocatorError::EmptyEntryPath(self.to_string()));
        }
        if path.contains(ENTRY_SEPARATOR) {
            return Err(LocatorError::ReservedSequence(path.to_string()));
        }
        Ok(self.child(path))
    }

    /// Same as [`Locator::entry`] for paths already known to be valid.
    pub(crate) fn child(&self, path: &str) -> Self {
        Locator::Nested {
            outer: Arc::new(self.clone()),
            path: path.to_string(),
        }
    }

    /// The archive this entry lives in, or `None` for a file locator.
    pub fn outer(&self) -> Option<&Locator> {
        match self {
            Locator::File(_) => None,
            Locator::Nested { outer, .. } => Some(outer),
        }
    }

    /// The archive-internal path, or `None` for a file locator.
    pub fn entry_path(&self) -> Option<&str> {
        match self {
            Locator::File(_) => None,
            Locator::Nested { path, .. } => Some(path),
        }
    }

    /// The `file:` URL at the bottom of the chain.
    pub fn base(&self) -> &Url {
        match self {
            Locator::File(url) => url,
            Locator::Nested { outer, .. } => outer.base(),
        }
    }

    /// Number of archive boundaries crossed (0 for a file locator).
    pub fn depth(&self) -> usize {
        match self {
            Locator::File(_) => 0,
            Locator::Nested { outer, .. } => outer.depth() + 1,
        }
    }

    /// Filesystem path of the base file, when it has one.
    pub fn to_file_path(&self) -> Option<PathBuf> {
        self.base().to_file_path().ok()
    }
}

impl fmt::Display for Locator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Locator::File(url) => f.write_str(url.as_str()),
            Locator::Nested { outer, path } => {
                write!(f, "{}:{}{}{}", NESTED_SCHEME, outer, ENTRY_SEPARATOR, path)
            }
        }
    }
}

impl FromStr for Locator {
    type Err = LocatorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Some(rest) = s
            .strip_prefix(NESTED_SCHEME)
            .and_then(|r| r.strip_prefix(':'))
        {
            let split = rest
                .rfind(ENTRY_SEPARATOR)
                .ok_or_else(|| LocatorError::MissingSeparator(s.to_string()))?;
            let outer: Locator = rest[..split].parse()?;
            let path = &rest[split + ENTRY_SEPARATOR.len()..];
            if path.is_empty() {
                return Err(LocatorError::EmptyEntryPath(s.to_string()));
            }
            return Ok(outer.child(path));
        }

        let url = Url::parse(s).map_err(|e| LocatorError::Malformed {
            locator: s.to_string(),
            reason: e.to_string(),
        })?;
        if url.scheme() != "file" {
            return Err(LocatorError::UnsupportedScheme(url.scheme().to_string()));
        }
        Ok(Locator::File(url))
    }
}

/// Scheme part of a locator string (text before the first `:`).
pub fn scheme_of(locator: &str) -> Option<&str> {
    locator.split_once(':').map(|(scheme, _)| scheme)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn root() -> Locator {
        Locator::File(Url::parse("file:///opt/app.pkg").unwrap())
    }

    #[test]
    fn test_file_locator_display() {
        assert_eq!(root().to_string(), "file:///opt/app.pkg");
        assert_eq!(root().depth(), 0);
        assert!(root().outer().is_none());
    }

    #[test]
    fn test_nested_display_composes() {
        let lib = root().entry("lib.pkg").unwrap();
        let util = lib.entry("com/acme/Util.mod").unwrap();
        assert_eq!(lib.to_string(), "nest:file:///opt/app.pkg!/lib.pkg");
        assert_eq!(
            util.to_string(),
            "nest:nest:file:///opt/app.pkg!/lib.pkg!/com/acme/Util.mod"
        );
        assert_eq!(util.depth(), 2);
        assert_eq!(util.outer(), Some(&lib));
        assert_eq!(util.entry_path(), Some("com/acme/Util.mod"));
        assert_eq!(util.base().as_str(), "file:///opt/app.pkg");
    }

    #[test]
    fn test_parse_three_levels() {
        let text = "nest:nest:nest:file:///opt/app.pkg!/a.pkg!/b.pkg!/deep/r.txt";
        let loc: Locator = text.parse().unwrap();
        assert_eq!(loc.depth(), 3);
        assert_eq!(loc.entry_path(), Some("deep/r.txt"));
        assert_eq!(loc.outer().unwrap().entry_path(), Some("b.pkg"));
        assert_eq!(loc.to_string(), text);
    }

    #[test]
    fn test_entry_strips_leading_slash() {
        let loc = root().entry("/META-INF/manifest.toml").unwrap();
        assert_eq!(loc.entry_path(), Some("META-INF/manifest.toml"));
    }

    #[test]
    fn test_entry_rejects_reserved_sequence() {
        assert_eq!(
            root().entry("a!/b"),
            Err(LocatorError::ReservedSequence("a!/b".to_string()))
        );
        assert!(matches!(root().entry(""), Err(LocatorError::EmptyEntryPath(_))));
    }

    #[test]
    fn test_parse_errors() {
        assert!(matches!(
            "nest:file:///opt/app.pkg".parse::<Locator>(),
            Err(LocatorError::MissingSeparator(_))
        ));
        assert!(matches!(
            "nest:file:///opt/app.pkg!/".parse::<Locator>(),
            Err(LocatorError::EmptyEntryPath(_))
        ));
        assert!(matches!(
            "http://example.com/app.pkg".parse::<Locator>(),
            Err(LocatorError::UnsupportedScheme(s)) if s == "http"
        ));
        assert!(matches!(
            "not a locator".parse::<Locator>(),
            Err(LocatorError::Malformed { .. })
        ));
    }

    #[test]
    fn test_from_path_is_absolute() {
        let loc = Locator::from_path(Path::new("relative/app.pkg")).unwrap();
        let path = loc.to_file_path().unwrap();
        assert!(path.is_absolute());
        assert!(path.ends_with("relative/app.pkg"));
    }

    #[test]
    fn test_scheme_of() {
        assert_eq!(scheme_of("nest:file:///x!/y"), Some("nest"));
        assert_eq!(scheme_of("file:///x"), Some("file"));
        assert_eq!(scheme_of("plain"), None);
    }
}
