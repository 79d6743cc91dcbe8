//! Module loaders
//!
//! Loaders form a parent chain. A [`NestedLoader`] asks its parent first and
//! only defines a module itself when the parent reports it missing:
//!
//! ```text
//! NestedLoader ──parent──▶ HostLoader
//!      │
//!      └── EntryIndex (code units, resources)
//! ```

use std::fmt;
use std::io::Read;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use thiserror::Error;

use crate::index::{ArchiveId, ByteEntry, EntryIndex};
use crate::locator::Locator;
use crate::materialize::{MaterializeError, MaterializeRequest, Materializer};
use crate::module::{panic_message, CodeSource, Module, Procedure, TrustScope};
use crate::namespace::{
    namespace_of, ArchiveDescriptor, NamespaceMetadata, NamespaceRegistry, DESCRIPTOR_PATH,
};
use crate::resolver::ResolveError;

static NEXT_LOADER_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique loader identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LoaderId(u64);

impl LoaderId {
    /// Allocate a fresh identity.
    pub fn next() -> Self {
        LoaderId(NEXT_LOADER_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for LoaderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "loader#{}", self.0)
    }
}

/// Errors that can occur while loading a module
#[derive(Debug, Error)]
pub enum LoadError {
    /// No loader in the chain provides the module
    #[error("Module not found: {0}")]
    ModuleNotFound(String),

    /// The code unit payload could not be read
    #[error("Failed to read code unit '{name}'")]
    Resolve {
        name: String,
        #[source]
        source: ResolveError,
    },

    /// The namespace is sealed to another archive
    #[error("Namespace '{namespace}' is sealed; '{name}' from {archive} cannot join it")]
    SealingViolation {
        name: String,
        namespace: String,
        archive: String,
    },

    /// The payload could not be turned into a module
    #[error("Failed to materialize '{name}'")]
    Materialize {
        name: String,
        #[source]
        source: MaterializeError,
    },

    /// The materializer panicked
    #[error("Materializing '{name}' panicked: {message}")]
    Panicked { name: String, message: String },
}

/// A source of modules and resources.
pub trait ModuleLoader: Send + Sync {
    fn id(&self) -> LoaderId;

    /// Loader consulted before this one.
    fn parent(&self) -> Option<Arc<dyn ModuleLoader>>;

    /// Resolve a qualified name to a live module.
    fn load_module(&self, name: &str) -> Result<Arc<Module>, LoadError>;

    /// First locator providing the resource `name`.
    fn find_resource(&self, name: &str) -> Option<Locator>;

    /// Every locator providing the resource `name`. Each call starts a fresh
    /// sequence.
    fn find_resources(&self, name: &str) -> Box<dyn Iterator<Item = Locator> + Send>;

    /// Open the first provider of the resource `name`.
    ///
    /// # Returns
    /// * `Ok(Some(stream))` - The resource bytes
    /// * `Ok(None)` - No loader in the chain provides `name`
    /// * `Err(ResolveError)` - A provider was found but could not be read
    fn open_resource(&self, name: &str) -> Result<Option<Box<dyn Read + Send>>, ResolveError> {
        match self.parent() {
            Some(parent) => parent.open_resource(name),
            None => Ok(None),
        }
    }

    /// This loader's id followed by every ancestor's, nearest first.
    fn ancestry(&self) -> Vec<LoaderId> {
        let mut chain = vec![self.id()];
        let mut next = self.parent();
        while let Some(loader) = next {
            chain.push(loader.id());
            next = loader.parent();
        }
        chain
    }
}

// ============================================================================
// HostLoader
// ============================================================================

/// Serves modules registered by the host process. Sits at the top of every
/// loader chain.
pub struct HostLoader {
    id: LoaderId,
    modules: DashMap<String, Arc<Module>>,
    namespaces: NamespaceRegistry,
}

impl HostLoader {
    pub fn new() -> Self {
        Self {
            id: LoaderId::next(),
            modules: DashMap::new(),
            namespaces: NamespaceRegistry::new(),
        }
    }

    /// Define a host module named `name` exporting `procedures`.
    ///
    /// Replaces an earlier definition of the same name.
    pub fn define(
        &self,
        name: &str,
        procedures: impl IntoIterator<Item = (String, Procedure)>,
    ) -> Arc<Module> {
        let ns = namespace_of(name);
        let namespace = self
            .namespaces
            .get_or_define(ns, || NamespaceMetadata::empty(ns));
        let module = Arc::new(Module::new(
            name,
            namespace,
            TrustScope::host(self.id),
            procedures.into_iter().collect::<FxHashMap<_, _>>(),
        ));
        self.modules.insert(name.to_string(), Arc::clone(&module));
        module
    }

    pub fn contains(&self, name: &str) -> bool {
        self.modules.contains_key(name)
    }
}

impl Default for HostLoader {
    fn default() -> Self {
        Self::new()
    }
}

impl ModuleLoader for HostLoader {
    fn id(&self) -> LoaderId {
        self.id
    }

    fn parent(&self) -> Option<Arc<dyn ModuleLoader>> {
        None
    }

    fn load_module(&self, name: &str) -> Result<Arc<Module>, LoadError> {
        self.modules
            .get(name)
            .map(|m| Arc::clone(m.value()))
            .ok_or_else(|| LoadError::ModuleNotFound(name.to_string()))
    }

    fn find_resource(&self, _name: &str) -> Option<Locator> {
        None
    }

    fn find_resources(&self, _name: &str) -> Box<dyn Iterator<Item = Locator> + Send> {
        Box::new(std::iter::empty())
    }
}

impl fmt::Debug for HostLoader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostLoader")
            .field("id", &self.id)
            .field("modules", &self.modules.len())
            .finish()
    }
}

// ============================================================================
// NestedLoader
// ============================================================================

/// Loads code units out of an [`EntryIndex`].
///
/// Each unit is materialized at most once. Its payload is evicted from the
/// index after every attempt. A failed or panicking attempt defines nothing,
/// so the load can be retried from the catalog.
pub struct NestedLoader {
    id: LoaderId,
    parent: Option<Arc<dyn ModuleLoader>>,
    index: Arc<EntryIndex>,
    materializer: Arc<dyn Materializer>,
    namespaces: NamespaceRegistry,
    modules: DashMap<String, Arc<Module>>,
    /// Per-name materialization locks
    locks: DashMap<String, Arc<Mutex<()>>>,
}

impl NestedLoader {
    pub fn new(
        index: Arc<EntryIndex>,
        parent: Option<Arc<dyn ModuleLoader>>,
        materializer: Arc<dyn Materializer>,
    ) -> Self {
        Self {
            id: LoaderId::next(),
            parent,
            index,
            materializer,
            namespaces: NamespaceRegistry::new(),
            modules: DashMap::new(),
            locks: DashMap::new(),
        }
    }

    pub fn index(&self) -> &Arc<EntryIndex> {
        &self.index
    }

    /// Namespaces defined so far.
    pub fn namespace(&self, name: &str) -> Option<Arc<NamespaceMetadata>> {
        self.namespaces.get(name)
    }

    /// Whether this loader (not an ancestor) defined `name`.
    pub fn is_defined(&self, name: &str) -> bool {
        self.modules.contains_key(name)
    }

    /// Names with a load in progress.
    pub fn pending_loads(&self) -> usize {
        self.locks.len()
    }

    fn define_local(&self, name: &str) -> Result<Arc<Module>, LoadError> {
        let provided = self
            .index
            .provides_unit(name)
            .map_err(|source| LoadError::Resolve {
                name: name.to_string(),
                source,
            })?;
        if !provided {
            return Err(LoadError::ModuleNotFound(name.to_string()));
        }

        let lock = Arc::clone(self.locks.entry(name.to_string()).or_default().value());
        let result = {
            let _guard = lock.lock();
            self.define_locked(name)
        };
        // The map and `lock` are the only holders unless another load is waiting.
        self.locks.remove_if(name, |_, held| Arc::strong_count(held) == 2);
        result
    }

    fn define_locked(&self, name: &str) -> Result<Arc<Module>, LoadError> {
        // Another thread may have finished while we waited.
        if let Some(module) = self.modules.get(name) {
            return Ok(Arc::clone(module.value()));
        }

        let entry = self
            .index
            .get_byte_entry(name)
            .map_err(|source| LoadError::Resolve {
                name: name.to_string(),
                source,
            })?
            .ok_or_else(|| LoadError::ModuleNotFound(name.to_string()))?;

        // Success or not, the payload is released; a retry realizes it again.
        let result = self.bind(name, &entry);
        self.index.remove_class_entry(name);
        let module = result?;

        tracing::debug!(
            module = name,
            loader = %self.id,
            source = %entry.provenance().locator,
            "Module defined"
        );
        Ok(module)
    }

    fn bind(&self, name: &str, entry: &ByteEntry) -> Result<Arc<Module>, LoadError> {
        let owner = &entry.provenance().archive;
        let ns = namespace_of(name);
        let namespace = self
            .namespaces
            .get_or_define(ns, || self.describe_namespace(ns, owner));
        if !namespace.admits(owner) {
            return Err(LoadError::SealingViolation {
                name: name.to_string(),
                namespace: ns.to_string(),
                archive: owner.to_string(),
            });
        }

        let request = MaterializeRequest {
            name,
            bytes: entry.bytes(),
            namespace,
            scope: TrustScope {
                loader: self.id,
                code_source: CodeSource::of_entry(entry),
            },
        };
        let module = catch_unwind(AssertUnwindSafe(|| self.materializer.materialize(request)))
            .map_err(|panic| LoadError::Panicked {
                name: name.to_string(),
                message: panic_message(panic.as_ref()),
            })?
            .map_err(|source| LoadError::Materialize {
                name: name.to_string(),
                source,
            })?;

        let module = Arc::new(module);
        self.modules.insert(name.to_string(), Arc::clone(&module));
        Ok(module)
    }

    /// Metadata for namespace `ns` from the descriptor of `owner`.
    ///
    /// A missing or unreadable descriptor yields empty, unsealed metadata.
    fn describe_namespace(&self, ns: &str, owner: &ArchiveId) -> NamespaceMetadata {
        let Some(locator) = self.index.get_url(owner, DESCRIPTOR_PATH) else {
            tracing::debug!(namespace = ns, archive = %owner, "No archive descriptor, using empty namespace metadata");
            return NamespaceMetadata::empty(ns);
        };

        let descriptor = self
            .index
            .open(&locator)
            .map_err(|e| e.to_string())
            .and_then(|stream| ArchiveDescriptor::read(stream).map_err(|e| e.to_string()));
        match descriptor {
            Ok(descriptor) => NamespaceMetadata::from_attributes(ns, &descriptor.namespace, owner),
            Err(reason) => {
                tracing::debug!(
                    namespace = ns,
                    descriptor = %locator,
                    reason = %reason,
                    "Unreadable archive descriptor, using empty namespace metadata"
                );
                NamespaceMetadata::empty(ns)
            }
        }
    }
}

impl ModuleLoader for NestedLoader {
    fn id(&self) -> LoaderId {
        self.id
    }

    fn parent(&self) -> Option<Arc<dyn ModuleLoader>> {
        self.parent.clone()
    }

    fn load_module(&self, name: &str) -> Result<Arc<Module>, LoadError> {
        if let Some(module) = self.modules.get(name) {
            return Ok(Arc::clone(module.value()));
        }
        if let Some(parent) = &self.parent {
            match parent.load_module(name) {
                Err(LoadError::ModuleNotFound(_)) => {}
                found => return found,
            }
        }
        self.define_local(name)
    }

    fn find_resource(&self, name: &str) -> Option<Locator> {
        self.parent
            .as_ref()
            .and_then(|p| p.find_resource(name))
            .or_else(|| self.index.find_resource(name))
    }

    fn find_resources(&self, name: &str) -> Box<dyn Iterator<Item = Locator> + Send> {
        let local = self.index.get_urls(name);
        match &self.parent {
            Some(parent) => Box::new(parent.find_resources(name).chain(local)),
            None => Box::new(local),
        }
    }

    fn open_resource(&self, name: &str) -> Result<Option<Box<dyn Read + Send>>, ResolveError> {
        if let Some(parent) = &self.parent {
            if let Some(stream) = parent.open_resource(name)? {
                return Ok(Some(stream));
            }
        }
        match self.index.find_resource(name) {
            Some(locator) => self.index.open(&locator).map(Some),
            None => Ok(None),
        }
    }
}

impl fmt::Debug for NestedLoader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NestedLoader")
            .field("id", &self.id)
            .field("parent", &self.parent.as_ref().map(|p| p.id()))
            .field("modules", &self.modules.len())
            .field("pending", &self.locks.len())
            .finish()
    }
}
