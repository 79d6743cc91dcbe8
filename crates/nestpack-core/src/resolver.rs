//! Process-wide locator resolution
//!
//! A registry maps locator schemes to handlers. Any code that holds a locator
//! string opens it through [`open`], without knowing whether the bytes live on
//! disk or several archives deep. The `nest` scheme is served by a
//! [`NestedArchiveHandler`] bound to the entry index; `file` locators are
//! understood without installation.
//!
//! Installing over an occupied slot is refused unless the caller presents an
//! [`OverridePrivilege`]. Acquiring one is logged, and a slot that has been
//! sealed refuses even privileged overrides.

use std::fs::{self, File};
use std::io::Read;
use std::sync::{Arc, LazyLock};

use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use thiserror::Error;
use zip::result::ZipError;

use crate::index::archive;
use crate::index::EntryIndex;
use crate::locator::{scheme_of, Locator, LocatorError, NESTED_SCHEME};

/// Errors that can occur while resolving a locator to bytes
#[derive(Debug, Error)]
pub enum ResolveError {
    /// The locator text is invalid
    #[error(transparent)]
    Locator(#[from] LocatorError),

    /// Nothing is installed for the locator's scheme
    #[error("No handler installed for scheme '{0}'")]
    NoHandler(String),

    /// The archive exists but has no such entry
    #[error("Entry '{path}' not found in {archive}")]
    EntryNotFound { archive: String, path: String },

    /// An archive along the chain is corrupt or unreadable
    #[error("Failed to read archive {locator}")]
    Archive {
        locator: String,
        #[source]
        source: ZipError,
    },

    /// The base file cannot be read
    #[error("Failed to read {locator}")]
    Io {
        locator: String,
        #[source]
        source: std::io::Error,
    },

    /// The entry index has not been scanned yet
    #[error("Entry index has not been scanned")]
    NotScanned,
}

impl ResolveError {
    pub(crate) fn from_zip(archive: &Locator, path: &str, err: ZipError) -> Self {
        if archive::is_not_found(&err) {
            ResolveError::EntryNotFound {
                archive: archive.to_string(),
                path: path.to_string(),
            }
        } else {
            ResolveError::Archive {
                locator: archive.to_string(),
                source: err,
            }
        }
    }
}

/// Errors that can occur while installing a handler
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum InstallError {
    /// The slot is occupied and no privilege was presented
    #[error("A handler for scheme '{0}' is already installed")]
    AlreadyInstalled(String),

    /// The slot is sealed; even a privileged override is refused
    #[error("The handler for scheme '{0}' is sealed and cannot be overridden")]
    OverrideDenied(String),
}

/// Opens streams for one locator scheme.
pub trait LocatorHandler: Send + Sync {
    /// Open a stream on the bytes addressed by `locator`.
    fn open(&self, locator: &str) -> Result<Box<dyn Read + Send>, ResolveError>;
}

/// Serves `nest:` locators from an entry index.
pub struct NestedArchiveHandler {
    index: Arc<EntryIndex>,
}

impl NestedArchiveHandler {
    pub fn new(index: Arc<EntryIndex>) -> Self {
        Self { index }
    }
}

impl LocatorHandler for NestedArchiveHandler {
    fn open(&self, locator: &str) -> Result<Box<dyn Read + Send>, ResolveError> {
        let locator: Locator = locator.parse()?;
        self.index.open(&locator)
    }
}

/// Capability required to replace an installed handler.
///
/// Acquiring one emits a warning naming the reason, so every forced
/// override leaves a trace.
#[derive(Debug)]
pub struct OverridePrivilege {
    reason: String,
}

impl OverridePrivilege {
    pub fn acquire(reason: impl Into<String>) -> Self {
        let reason = reason.into();
        tracing::warn!(reason = %reason, "Acquiring privilege to override an installed locator handler");
        Self { reason }
    }

    pub fn reason(&self) -> &str {
        &self.reason
    }
}

/// How a handler ended up installed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Installation {
    /// The slot was empty.
    Fresh,
    /// A previous handler was forcibly replaced.
    Overridden,
}

struct Slot {
    handler: Arc<dyn LocatorHandler>,
    sealed: bool,
}

/// Scheme -> handler registry.
pub struct HandlerRegistry {
    slots: RwLock<FxHashMap<String, Slot>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self {
            slots: RwLock::new(FxHashMap::default()),
        }
    }

    /// Install `handler` for `scheme` if the slot is empty.
    pub fn install(&self, scheme: &str, handler: Arc<dyn LocatorHandler>) -> Result<(), InstallError> {
        let mut slots = self.slots.write();
        if slots.contains_key(scheme) {
            return Err(InstallError::AlreadyInstalled(scheme.to_string()));
        }
        slots.insert(scheme.to_string(), Slot { handler, sealed: false });
        Ok(())
    }

    /// Replace whatever is installed for `scheme`.
    ///
    /// # Returns
    /// * `Ok(Some(previous))` - A handler was displaced
    /// * `Ok(None)` - The slot was empty
    /// * `Err(InstallError::OverrideDenied)` - The slot is sealed
    pub fn install_forced(
        &self,
        scheme: &str,
        handler: Arc<dyn LocatorHandler>,
        privilege: &OverridePrivilege,
    ) -> Result<Option<Arc<dyn LocatorHandler>>, InstallError> {
        let mut slots = self.slots.write();
        if slots.get(scheme).is_some_and(|s| s.sealed) {
            return Err(InstallError::OverrideDenied(scheme.to_string()));
        }
        let previous = slots.insert(scheme.to_string(), Slot { handler, sealed: false });
        if previous.is_some() {
            tracing::warn!(scheme, reason = privilege.reason(), "Installed locator handler overridden");
        }
        Ok(previous.map(|s| s.handler))
    }

    /// Install `handler`, forcing out a previous installation if needed.
    pub fn install_or_override(
        &self,
        scheme: &str,
        handler: Arc<dyn LocatorHandler>,
    ) -> Result<Installation, InstallError> {
        match self.install(scheme, Arc::clone(&handler)) {
            Ok(()) => Ok(Installation::Fresh),
            Err(InstallError::AlreadyInstalled(_)) => {
                let privilege = OverridePrivilege::acquire(format!(
                    "handler for scheme '{}' already installed by another component",
                    scheme
                ));
                self.install_forced(scheme, handler, &privilege)?;
                Ok(Installation::Overridden)
            }
            Err(e) => Err(e),
        }
    }

    /// Refuse all further overrides of `scheme`. Returns false if nothing
    /// is installed.
    pub fn seal(&self, scheme: &str) -> bool {
        match self.slots.write().get_mut(scheme) {
            Some(slot) => {
                slot.sealed = true;
                true
            }
            None => false,
        }
    }

    /// Remove the handler for `scheme`. Sealed slots cannot be removed.
    pub fn uninstall(&self, scheme: &str) -> Result<Option<Arc<dyn LocatorHandler>>, InstallError> {
        let mut slots = self.slots.write();
        if slots.get(scheme).is_some_and(|s| s.sealed) {
            return Err(InstallError::OverrideDenied(scheme.to_string()));
        }
        Ok(slots.remove(scheme).map(|s| s.handler))
    }

    pub fn is_installed(&self, scheme: &str) -> bool {
        self.slots.read().contains_key(scheme)
    }

    /// Open a stream for any locator the registry understands.
    pub fn open(&self, locator: &str) -> Result<Box<dyn Read + Send>, ResolveError> {
        let scheme = scheme_of(locator).unwrap_or_default();
        let handler = self.slots.read().get(scheme).map(|s| Arc::clone(&s.handler));
        match handler {
            Some(handler) => handler.open(locator),
            None if scheme == "file" => open_file(&locator.parse()?),
            None => Err(ResolveError::NoHandler(scheme.to_string())),
        }
    }

    /// Open a stream and read it to the end.
    pub fn read(&self, locator: &str) -> Result<Vec<u8>, ResolveError> {
        let mut stream = self.open(locator)?;
        let mut bytes = Vec::new();
        stream.read_to_end(&mut bytes).map_err(|source| ResolveError::Io {
            locator: locator.to_string(),
            source,
        })?;
        Ok(bytes)
    }
}

impl Default for HandlerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

static GLOBAL_REGISTRY: LazyLock<HandlerRegistry> = LazyLock::new(HandlerRegistry::new);

/// The process-wide registry.
pub fn global() -> &'static HandlerRegistry {
    &GLOBAL_REGISTRY
}

/// Open `locator` through the process-wide registry.
pub fn open(locator: &str) -> Result<Box<dyn Read + Send>, ResolveError> {
    global().open(locator)
}

/// Install a `nest:` handler for `index` into `registry`.
pub fn install_nested(
    registry: &HandlerRegistry,
    index: Arc<EntryIndex>,
) -> Result<Installation, InstallError> {
    registry.install_or_override(NESTED_SCHEME, Arc::new(NestedArchiveHandler::new(index)))
}

/// Read every byte addressed by `locator`.
///
/// Resolution is recursive: the outer locator is resolved to archive bytes and
/// the entry is extracted from them. Archives already held by `index` are read
/// directly instead of being re-extracted from their parent.
pub fn read_locator(locator: &Locator, index: Option<&EntryIndex>) -> Result<Vec<u8>, ResolveError> {
    match locator {
        Locator::File(_) => read_file(locator),
        Locator::Nested { outer, path } => {
            if let Some(result) = index.and_then(|i| i.read_indexed(outer, path)) {
                return result.map_err(|e| ResolveError::from_zip(outer, path, e));
            }
            let archive_bytes = read_locator(outer, index)?;
            archive::extract(archive_bytes, path).map_err(|e| ResolveError::from_zip(outer, path, e))
        }
    }
}

pub(crate) fn open_file(locator: &Locator) -> Result<Box<dyn Read + Send>, ResolveError> {
    let path = file_path(locator)?;
    let file = File::open(&path).map_err(|source| ResolveError::Io {
        locator: locator.to_string(),
        source,
    })?;
    Ok(Box::new(file))
}

fn read_file(locator: &Locator) -> Result<Vec<u8>, ResolveError> {
    let path = file_path(locator)?;
    fs::read(&path).map_err(|source| ResolveError::Io {
        locator: locator.to_string(),
        source,
    })
}

fn file_path(locator: &Locator) -> Result<std::path::PathBuf, ResolveError> {
    locator.to_file_path().ok_or_else(|| {
        ResolveError::Locator(LocatorError::Malformed {
            locator: locator.to_string(),
            reason: "not a local file".to_string(),
        })
    })
}
