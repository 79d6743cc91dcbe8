//! Entry index over a container archive
//!
//! Scans the root container once, recursing into every nested archive, and
//! catalogs each entry under the archive that owns it:
//!
//! ```text
//! file:///opt/app.pkg                      archive #0 (root)
//! ├── META-INF/manifest.toml
//! ├── app/Main.mod                         code unit "app.Main"
//! └── lib.pkg                              nested, indexed as archive #1
//!     nest:file:///opt/app.pkg!/lib.pkg
//!     ├── META-INF/manifest.toml
//!     └── com/acme/Util.mod                code unit "com.acme.Util"
//! ```
//!
//! The catalog is immutable after the scan. Code unit payloads are realized
//! lazily into a side cache and evicted once the loader has consumed them.

pub(crate) mod archive;
mod resources;

pub use resources::Resources;

use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};

use dashmap::DashMap;
use rustc_hash::FxHashMap;
use thiserror::Error;
use zip::result::{ZipError, ZipResult};

use crate::locator::{Locator, LocatorError, ENTRY_SEPARATOR};
use crate::resolver::{self, ResolveError};
use archive::ArchiveHandle;

/// Extensions of entries that are indexed as nested archives.
pub const DEFAULT_NESTED_EXTENSIONS: &[&str] = &["pkg", "jar", "zip"];

/// Suffix appended to the path form of a qualified code unit name.
pub const CODE_UNIT_SUFFIX: &str = ".mod";

/// How many archive boundaries the scan crosses before giving up.
pub const DEFAULT_MAX_DEPTH: usize = 16;

/// Archives are identified by the locator that reaches them.
pub type ArchiveId = Locator;

/// Errors that abort a scan
#[derive(Debug, Error)]
pub enum IndexError {
    /// The root container cannot be opened or listed
    #[error("Unable to read container archive {location}")]
    ContainerUnreadable {
        location: String,
        #[source]
        source: ZipError,
    },

    /// `scan` runs exactly once per index
    #[error("Entry index for {0} was already scanned")]
    AlreadyScanned(String),

    /// The container path cannot be expressed as a locator
    #[error(transparent)]
    Location(#[from] LocatorError),
}

/// Where the root container lives. Determined once per process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerLocation {
    path: PathBuf,
    locator: Locator,
}

impl ContainerLocation {
    /// Use the archive at `path` as the container.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, LocatorError> {
        let locator = Locator::from_path(path.as_ref())?;
        let path = locator
            .to_file_path()
            .unwrap_or_else(|| path.as_ref().to_path_buf());
        Ok(Self { path, locator })
    }

    /// Use the running executable as the container.
    ///
    /// A launcher binary with an archive appended is a valid container: the
    /// archive's central directory is located from the end of the file.
    pub fn current_exe() -> io::Result<Self> {
        let exe = std::env::current_exe()?;
        Self::from_path(&exe).map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))
    }

    /// Filesystem path of the container.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Locator of the container (a `file:` URL).
    pub fn locator(&self) -> &Locator {
        &self.locator
    }
}

/// Scan settings.
#[derive(Debug, Clone)]
pub struct IndexOptions {
    /// Entry extensions (without the dot) treated as nested archives.
    pub nested_extensions: Vec<String>,
    /// Suffix of code unit entries.
    pub code_unit_suffix: String,
    /// Maximum nesting depth below the root container.
    pub max_depth: usize,
}

impl Default for IndexOptions {
    fn default() -> Self {
        Self {
            nested_extensions: DEFAULT_NESTED_EXTENSIONS
                .iter()
                .map(|e| e.to_string())
                .collect(),
            code_unit_suffix: CODE_UNIT_SUFFIX.to_string(),
            max_depth: DEFAULT_MAX_DEPTH,
        }
    }
}

/// One entry inside a (possibly nested) archive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryDescriptor {
    /// Archive that holds the entry.
    pub owner: ArchiveId,
    /// Archive-internal path.
    pub path: String,
    /// Whether the entry was opened and indexed as an archive.
    pub is_nested_archive: bool,
    /// Directory entries carry no payload.
    pub is_dir: bool,
    /// Uncompressed size recorded by the archive.
    pub size: u64,
}

impl EntryDescriptor {
    /// Locator that resolves to this entry's bytes.
    pub fn locator(&self) -> Locator {
        self.owner.child(&self.path)
    }
}

/// Where a realized payload came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Provenance {
    /// Archive holding the entry.
    pub archive: ArchiveId,
    /// Locator used to reach the entry.
    pub locator: Locator,
}

/// Realized payload of a code unit entry.
#[derive(Debug, Clone)]
pub struct ByteEntry {
    bytes: Arc<[u8]>,
    provenance: Provenance,
}

impl ByteEntry {
    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn provenance(&self) -> &Provenance {
        &self.provenance
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

/// A nested archive the scan could not index.
#[derive(Debug, Clone)]
pub struct SkippedArchive {
    pub locator: Locator,
    pub reason: String,
}

/// Summary of a completed scan.
#[derive(Debug, Clone, Default)]
pub struct ScanReport {
    /// Archives indexed, root included.
    pub archives: usize,
    /// Entries cataloged across all archives.
    pub entries: usize,
    /// Distinct code unit paths.
    pub code_units: usize,
    /// Nested archives skipped because they were unreadable or too deep.
    pub skipped: Vec<SkippedArchive>,
}

struct ArchiveRecord {
    id: ArchiveId,
    handle: ArchiveHandle,
    entries: FxHashMap<String, EntryDescriptor>,
    order: Vec<String>,
}

#[derive(Default)]
struct Catalog {
    /// Depth-first, parents before children, root first.
    archives: Vec<ArchiveRecord>,
    by_id: FxHashMap<ArchiveId, usize>,
    /// Code unit path -> first archive (in scan order) providing it.
    code_units: FxHashMap<String, usize>,
}

/// Catalog of every entry reachable from the container.
pub struct EntryIndex {
    location: ContainerLocation,
    options: IndexOptions,
    catalog: OnceLock<Catalog>,
    /// Realized code unit payloads, keyed by qualified name.
    realized: DashMap<String, ByteEntry>,
}

impl EntryIndex {
    /// Create an index for the given container. Nothing is read until `scan`.
    pub fn new(location: ContainerLocation, options: IndexOptions) -> Self {
        Self {
            location,
            options,
            catalog: OnceLock::new(),
            realized: DashMap::new(),
        }
    }

    pub fn location(&self) -> &ContainerLocation {
        &self.location
    }

    pub fn options(&self) -> &IndexOptions {
        &self.options
    }

    /// Identifier of the root container archive.
    pub fn root_id(&self) -> &ArchiveId {
        self.location.locator()
    }

    pub fn is_scanned(&self) -> bool {
        self.catalog.get().is_some()
    }

    /// Walk the container and every nested archive.
    ///
    /// An unreadable root container is fatal. An unreadable nested archive is
    /// skipped with a warning and the scan continues with its siblings.
    ///
    /// # Returns
    /// * `Ok(ScanReport)` - Counts and skipped archives
    /// * `Err(IndexError)` - Container unreadable, or already scanned
    pub fn scan(&self) -> Result<ScanReport, IndexError> {
        if self.is_scanned() {
            return Err(IndexError::AlreadyScanned(self.root_id().to_string()));
        }

        let unreadable = |source| IndexError::ContainerUnreadable {
            location: self.location.path().display().to_string(),
            source,
        };

        let root = ArchiveHandle::open_file(self.location.path()).map_err(unreadable)?;
        let mut catalog = Catalog::default();
        let mut report = ScanReport::default();
        self.scan_archive(self.root_id().clone(), root, 0, &mut catalog, &mut report)
            .map_err(unreadable)?;
        report.code_units = catalog.code_units.len();

        self.catalog
            .set(catalog)
            .map_err(|_| IndexError::AlreadyScanned(self.root_id().to_string()))?;

        tracing::debug!(
            container = %self.root_id(),
            archives = report.archives,
            entries = report.entries,
            code_units = report.code_units,
            skipped = report.skipped.len(),
            "Container scanned"
        );
        Ok(report)
    }

    fn scan_archive(
        &self,
        id: ArchiveId,
        handle: ArchiveHandle,
        depth: usize,
        catalog: &mut Catalog,
        report: &mut ScanReport,
    ) -> ZipResult<()> {
        let raw = handle.list()?;
        let slot = catalog.archives.len();

        let mut entries = FxHashMap::default();
        let mut order = Vec::with_capacity(raw.len());
        let mut nested = Vec::new();

        for entry in raw {
            if entry.name.contains(ENTRY_SEPARATOR) {
                tracing::warn!(
                    archive = %id,
                    entry = %entry.name,
                    "Skipping entry whose name cannot be addressed by a locator"
                );
                continue;
            }
            if !entry.is_dir {
                if entry.name.ends_with(&self.options.code_unit_suffix) {
                    catalog.code_units.entry(entry.name.clone()).or_insert(slot);
                }
                if self.is_nested_candidate(&entry.name) {
                    nested.push(entry.name.clone());
                }
            }
            order.push(entry.name.clone());
            entries.insert(
                entry.name.clone(),
                EntryDescriptor {
                    owner: id.clone(),
                    path: entry.name,
                    is_nested_archive: false,
                    is_dir: entry.is_dir,
                    size: entry.size,
                },
            );
        }

        report.archives += 1;
        report.entries += entries.len();
        catalog.by_id.insert(id.clone(), slot);
        catalog.archives.push(ArchiveRecord {
            id: id.clone(),
            handle,
            entries,
            order,
        });

        for name in nested {
            let child = id.child(&name);
            if depth + 1 > self.options.max_depth {
                tracing::warn!(archive = %child, depth = depth + 1, "Nested archive exceeds maximum depth, skipping");
                report.skipped.push(SkippedArchive {
                    locator: child,
                    reason: format!("exceeds maximum depth {}", self.options.max_depth),
                });
                continue;
            }

            let opened = catalog.archives[slot]
                .handle
                .read_entry(&name)
                .and_then(|bytes| ArchiveHandle::from_bytes(Arc::from(bytes)));
            let scanned = opened
                .and_then(|nested| self.scan_archive(child.clone(), nested, depth + 1, catalog, report));

            match scanned {
                Ok(()) => {
                    if let Some(descriptor) = catalog.archives[slot].entries.get_mut(&name) {
                        descriptor.is_nested_archive = true;
                    }
                }
                Err(e) => {
                    tracing::warn!(archive = %child, error = %e, "Skipping unreadable nested archive");
                    report.skipped.push(SkippedArchive {
                        locator: child,
                        reason: e.to_string(),
                    });
                }
            }
        }

        Ok(())
    }

    fn is_nested_candidate(&self, name: &str) -> bool {
        name.rsplit_once('.').is_some_and(|(_, ext)| {
            self.options
                .nested_extensions
                .iter()
                .any(|e| e.eq_ignore_ascii_case(ext))
        })
    }

    fn catalog(&self) -> Option<&Catalog> {
        self.catalog.get()
    }

    fn record(&self, id: &ArchiveId) -> Option<&ArchiveRecord> {
        let catalog = self.catalog()?;
        catalog.by_id.get(id).map(|&slot| &catalog.archives[slot])
    }

    /// Archive-relative path of a qualified code unit name.
    ///
    /// `com.acme.Util` maps to `com/acme/Util.mod`.
    pub fn unit_path(&self, name: &str) -> String {
        format!("{}{}", name.replace('.', "/"), self.options.code_unit_suffix)
    }

    /// Realize the payload of the code unit `name`.
    ///
    /// When several archives provide the same unit, the first one in scan
    /// order wins.
    ///
    /// # Returns
    /// * `Ok(Some(ByteEntry))` - Payload and provenance
    /// * `Ok(None)` - No archive provides the unit
    /// * `Err(ResolveError)` - The archive could not be read
    pub fn get_byte_entry(&self, name: &str) -> Result<Option<ByteEntry>, ResolveError> {
        if let Some(entry) = self.realized.get(name) {
            return Ok(Some(entry.value().clone()));
        }

        let catalog = self.catalog().ok_or(ResolveError::NotScanned)?;
        let path = self.unit_path(name);
        let Some(&slot) = catalog.code_units.get(&path) else {
            return Ok(None);
        };

        let record = &catalog.archives[slot];
        let bytes = record
            .handle
            .read_entry(&path)
            .map_err(|e| ResolveError::from_zip(&record.id, &path, e))?;

        let entry = ByteEntry {
            bytes: Arc::from(bytes),
            provenance: Provenance {
                archive: record.id.clone(),
                locator: record.id.child(&path),
            },
        };
        Ok(Some(
            self.realized
                .entry(name.to_string())
                .or_insert(entry)
                .value()
                .clone(),
        ))
    }

    /// Whether some archive provides the code unit `name`. Reads nothing.
    pub fn provides_unit(&self, name: &str) -> Result<bool, ResolveError> {
        let catalog = self.catalog().ok_or(ResolveError::NotScanned)?;
        Ok(catalog.code_units.contains_key(&self.unit_path(name)))
    }

    /// Drop the realized payload of a consumed code unit.
    ///
    /// The descriptor stays in the catalog, so locators to the entry keep
    /// resolving.
    pub fn remove_class_entry(&self, name: &str) -> bool {
        self.realized.remove(name).is_some()
    }

    /// Whether the payload of `name` is currently held in memory.
    pub fn is_realized(&self, name: &str) -> bool {
        self.realized.contains_key(name)
    }

    /// Number of payloads currently held in memory.
    pub fn realized_count(&self) -> usize {
        self.realized.len()
    }

    /// Locator of `entry_path` inside the archive `archive`, if it exists.
    pub fn get_url(&self, archive: &ArchiveId, entry_path: &str) -> Option<Locator> {
        let path = entry_path.trim_start_matches('/');
        let record = self.record(archive)?;
        record.entries.contains_key(path).then(|| archive.child(path))
    }

    /// First locator providing the resource `name`, in scan order.
    pub fn find_resource(&self, name: &str) -> Option<Locator> {
        self.locate_from(name, 0).map(|(_, locator)| locator)
    }

    /// Every locator providing the resource `name`, lazily.
    ///
    /// Each call returns a fresh sequence starting at the root archive.
    pub fn get_urls(self: &Arc<Self>, name: &str) -> Resources {
        Resources::new(Arc::clone(self), name)
    }

    /// Find the next archive at or after `start` holding `name`.
    pub(crate) fn locate_from(&self, name: &str, start: usize) -> Option<(usize, Locator)> {
        let path = name.trim_start_matches('/');
        let catalog = self.catalog()?;
        catalog
            .archives
            .iter()
            .enumerate()
            .skip(start)
            .find(|(_, record)| record.entries.contains_key(path))
            .map(|(slot, record)| (slot, record.id.child(path)))
    }

    pub(crate) fn archive_count(&self) -> usize {
        self.catalog().map_or(0, |c| c.archives.len())
    }

    /// Whether `id` names an indexed archive.
    pub fn contains_archive(&self, id: &ArchiveId) -> bool {
        self.record(id).is_some()
    }

    /// Indexed archives in scan order.
    pub fn archives(&self) -> impl Iterator<Item = &ArchiveId> {
        self.catalog()
            .into_iter()
            .flat_map(|c| c.archives.iter().map(|r| &r.id))
    }

    /// Every cataloged entry, archive by archive, in archive order.
    pub fn descriptors(&self) -> impl Iterator<Item = &EntryDescriptor> {
        self.catalog().into_iter().flat_map(|c| {
            c.archives
                .iter()
                .flat_map(|r| r.order.iter().filter_map(|p| r.entries.get(p)))
        })
    }

    /// Read an entry of an indexed archive without going through the
    /// general resolution path. `None` when `archive` is not indexed.
    pub(crate) fn read_indexed(&self, archive: &ArchiveId, path: &str) -> Option<ZipResult<Vec<u8>>> {
        self.record(archive).map(|r| r.handle.read_entry(path))
    }

    /// Read every byte addressed by `locator`.
    pub fn read_bytes(&self, locator: &Locator) -> Result<Vec<u8>, ResolveError> {
        resolver::read_locator(locator, Some(self))
    }

    /// Open a stream on the bytes addressed by `locator`.
    pub fn open(&self, locator: &Locator) -> Result<Box<dyn Read + Send>, ResolveError> {
        match locator {
            Locator::File(_) => resolver::open_file(locator),
            Locator::Nested { .. } => Ok(Box::new(io::Cursor::new(self.read_bytes(locator)?))),
        }
    }
}

impl std::fmt::Debug for EntryIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EntryIndex")
            .field("container", &self.root_id().to_string())
            .field("archives", &self.archive_count())
            .field("realized", &self.realized.len())
            .finish()
    }
}
