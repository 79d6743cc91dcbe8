//! Nestpack core library
//!
//! Loads code and resources out of archives nested inside a single container
//! archive, without unpacking anything to disk:
//! - Entry index (one eager scan of the container and every nested archive)
//! - Composable `nest:` locators and a process-wide resolver for them
//! - Parent-first module loaders with namespace metadata and sealing
//! - Ambient loader context and loader-tagged threads

pub mod context;
pub mod index;
pub mod loader;
pub mod locator;
pub mod materialize;
pub mod module;
pub mod namespace;
pub mod resolver;
pub mod thread;

pub use index::{
    ArchiveId, ByteEntry, ContainerLocation, EntryDescriptor, EntryIndex, IndexError,
    IndexOptions, Provenance, Resources, ScanReport, SkippedArchive,
};
pub use loader::{HostLoader, LoadError, LoaderId, ModuleLoader, NestedLoader};
pub use locator::{Locator, LocatorError, ENTRY_SEPARATOR, NESTED_SCHEME};
pub use materialize::{
    ImageMaterializer, MaterializeError, MaterializeRequest, Materializer, SymbolTable, UnitImage,
};
pub use module::{CodeSource, Invocation, Module, Procedure, ProcedureError, TrustScope};
pub use namespace::{
    ArchiveDescriptor, DescriptorError, NamespaceAttributes, NamespaceMetadata, DESCRIPTOR_PATH,
};
pub use resolver::{
    HandlerRegistry, InstallError, Installation, LocatorHandler, NestedArchiveHandler,
    OverridePrivilege, ResolveError,
};
