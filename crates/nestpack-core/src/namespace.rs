//! Archive descriptors and namespace metadata
//!
//! Any archive may carry `META-INF/manifest.toml`. Its `[namespace]` table
//! describes the namespaces whose code units the archive provides; the root
//! container may also name its entry module with a top-level `main` key.

use std::io::Read;
use std::sync::Arc;

use dashmap::DashMap;
use serde::Deserialize;
use thiserror::Error;

use crate::locator::Locator;

/// Archive-internal path of the descriptor.
pub const DESCRIPTOR_PATH: &str = "META-INF/manifest.toml";

/// Errors that can occur while reading a descriptor
#[derive(Debug, Error)]
pub enum DescriptorError {
    /// Failed to read the descriptor bytes
    #[error("Failed to read archive descriptor: {0}")]
    IoError(#[from] std::io::Error),

    /// Descriptor is not valid UTF-8
    #[error("Archive descriptor is not valid UTF-8")]
    Encoding(#[from] std::str::Utf8Error),

    /// Failed to parse TOML
    #[error("Failed to parse archive descriptor: {0}")]
    ParseError(#[from] toml::de::Error),
}

/// Parsed `META-INF/manifest.toml`
#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
pub struct ArchiveDescriptor {
    /// Entry module of the container (only meaningful at the root)
    #[serde(default)]
    pub main: Option<String>,

    /// Namespace attributes shared by every code unit in the archive
    #[serde(default)]
    pub namespace: NamespaceAttributes,
}

/// The `[namespace]` table
#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub struct NamespaceAttributes {
    #[serde(default)]
    pub title: Option<String>,

    #[serde(default)]
    pub version: Option<String>,

    #[serde(default)]
    pub vendor: Option<String>,

    #[serde(default)]
    pub implementation_title: Option<String>,

    #[serde(default)]
    pub implementation_version: Option<String>,

    #[serde(default)]
    pub implementation_vendor: Option<String>,

    /// Seal every namespace in the archive to the archive
    #[serde(default)]
    pub sealed: bool,
}

impl ArchiveDescriptor {
    /// Parse descriptor text.
    pub fn parse(text: &str) -> Result<Self, DescriptorError> {
        Ok(toml::from_str(text)?)
    }

    /// Read and parse a descriptor from a stream.
    pub fn read(mut reader: impl Read) -> Result<Self, DescriptorError> {
        let mut bytes = Vec::new();
        reader.read_to_end(&mut bytes)?;
        Self::parse(std::str::from_utf8(&bytes)?)
    }
}

/// Metadata of one namespace, derived from the descriptor of the archive
/// that first provided a code unit in it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NamespaceMetadata {
    pub name: String,
    pub title: Option<String>,
    pub version: Option<String>,
    pub vendor: Option<String>,
    pub implementation_title: Option<String>,
    pub implementation_version: Option<String>,
    pub implementation_vendor: Option<String>,
    /// Archive the namespace is sealed to.
    pub seal_base: Option<Locator>,
}

impl NamespaceMetadata {
    /// Metadata with every attribute unset and no seal.
    pub fn empty(name: &str) -> Self {
        Self {
            name: name.to_string(),
            ..Self::default()
        }
    }

    /// Build metadata from the attributes of the archive `owner`.
    pub fn from_attributes(name: &str, attrs: &NamespaceAttributes, owner: &Locator) -> Self {
        Self {
            name: name.to_string(),
            title: attrs.title.clone(),
            version: attrs.version.clone(),
            vendor: attrs.vendor.clone(),
            implementation_title: attrs.implementation_title.clone(),
            implementation_version: attrs.implementation_version.clone(),
            implementation_vendor: attrs.implementation_vendor.clone(),
            seal_base: attrs.sealed.then(|| owner.clone()),
        }
    }

    pub fn is_sealed(&self) -> bool {
        self.seal_base.is_some()
    }

    /// Whether a code unit from `archive` may join this namespace.
    pub fn admits(&self, archive: &Locator) -> bool {
        self.seal_base.as_ref().is_none_or(|base| base == archive)
    }
}

/// Namespace name of a qualified code unit name.
///
/// `com.acme.Util` belongs to `com.acme`; an unqualified name belongs to the
/// unnamed namespace `""`.
pub fn namespace_of(name: &str) -> &str {
    name.rsplit_once('.').map_or("", |(ns, _)| ns)
}

/// Namespaces defined by one loader. Each is created at most once.
#[derive(Debug, Default)]
pub struct NamespaceRegistry {
    defined: DashMap<String, Arc<NamespaceMetadata>>,
}

impl NamespaceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> Option<Arc<NamespaceMetadata>> {
        self.defined.get(name).map(|m| Arc::clone(m.value()))
    }

    /// Return the namespace `name`, defining it with `define` if absent.
    ///
    /// `define` runs at most once per name even under contention.
    pub fn get_or_define(
        &self,
        name: &str,
        define: impl FnOnce() -> NamespaceMetadata,
    ) -> Arc<NamespaceMetadata> {
        if let Some(existing) = self.get(name) {
            return existing;
        }
        Arc::clone(
            self.defined
                .entry(name.to_string())
                .or_insert_with(|| Arc::new(define()))
                .value(),
        )
    }

    pub fn len(&self) -> usize {
        self.defined.len()
    }

    pub fn is_empty(&self) -> bool {
        self.defined.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn archive(name: &str) -> Locator {
        format!("nest:file:///opt/app.pkg!/{}", name).parse().unwrap()
    }

    #[test]
    fn test_parse_full_descriptor() {
        let desc = ArchiveDescriptor::parse(
            r#"
main = "app.Main"

[namespace]
title = "Acme Utilities"
version = "2.1"
vendor = "Acme Corp"
implementation-version = "2.1.7"
sealed = true
"#,
        )
        .unwrap();
        assert_eq!(desc.main.as_deref(), Some("app.Main"));
        assert_eq!(desc.namespace.vendor.as_deref(), Some("Acme Corp"));
        assert_eq!(desc.namespace.implementation_version.as_deref(), Some("2.1.7"));
        assert!(desc.namespace.sealed);
    }

    #[test]
    fn test_parse_empty_descriptor() {
        let desc = ArchiveDescriptor::parse("").unwrap();
        assert_eq!(desc, ArchiveDescriptor::default());
    }

    #[test]
    fn test_parse_malformed_descriptor() {
        assert!(matches!(
            ArchiveDescriptor::parse("[namespace\nvendor ="),
            Err(DescriptorError::ParseError(_))
        ));
        assert!(matches!(
            ArchiveDescriptor::read(&[0xff, 0xfe][..]),
            Err(DescriptorError::Encoding(_))
        ));
    }

    #[test]
    fn test_sealing() {
        let lib = archive("lib.pkg");
        let attrs = NamespaceAttributes {
            sealed: true,
            ..Default::default()
        };
        let meta = NamespaceMetadata::from_attributes("com.acme", &attrs, &lib);
        assert!(meta.is_sealed());
        assert!(meta.admits(&lib));
        assert!(!meta.admits(&archive("other.pkg")));

        let open = NamespaceMetadata::empty("com.acme");
        assert!(!open.is_sealed());
        assert!(open.admits(&archive("other.pkg")));
    }

    #[test]
    fn test_namespace_of() {
        assert_eq!(namespace_of("com.acme.Util"), "com.acme");
        assert_eq!(namespace_of("Main"), "");
    }

    #[test]
    fn test_registry_defines_once() {
        let registry = NamespaceRegistry::new();
        let first = registry.get_or_define("com.acme", || NamespaceMetadata {
            vendor: Some("Acme".to_string()),
            ..NamespaceMetadata::empty("com.acme")
        });
        let second = registry.get_or_define("com.acme", || panic!("defined twice"));
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(registry.len(), 1);
    }
}
