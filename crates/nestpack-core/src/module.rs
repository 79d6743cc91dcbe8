//! Live modules and their provenance

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use rustc_hash::FxHashMap;
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::index::ByteEntry;
use crate::loader::LoaderId;
use crate::locator::Locator;
use crate::namespace::NamespaceMetadata;
use crate::resolver::ResolveError;

/// Errors raised by an executing procedure
#[derive(Debug, Error)]
pub enum ProcedureError {
    /// The procedure reported a failure
    #[error("{0}")]
    Failed(String),

    /// I/O failed while the procedure ran
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// A locator could not be resolved
    #[error(transparent)]
    Resolve(#[from] ResolveError),

    /// The procedure panicked
    #[error("Procedure panicked: {0}")]
    Panicked(String),
}

/// Arguments of one procedure call.
#[derive(Debug, Clone, Copy)]
pub struct Invocation<'a> {
    pub module: &'a Module,
    pub args: &'a [String],
}

/// An executable procedure exported by a module.
pub type Procedure = Arc<dyn Fn(&Invocation<'_>) -> Result<(), ProcedureError> + Send + Sync>;

/// Where a module's code came from.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CodeSource {
    /// Locator of the code unit entry; `None` for host modules.
    pub location: Option<Locator>,
    /// SHA-256 of the code unit payload.
    pub digest: Option<[u8; 32]>,
}

impl CodeSource {
    /// Code source of a realized code unit payload.
    pub fn of_entry(entry: &ByteEntry) -> Self {
        Self {
            location: Some(entry.provenance().locator.clone()),
            digest: Some(Sha256::digest(entry.bytes()).into()),
        }
    }

    /// Archive holding the code unit.
    pub fn archive(&self) -> Option<&Locator> {
        self.location.as_ref().and_then(Locator::outer)
    }

    pub fn digest_hex(&self) -> Option<String> {
        self.digest.map(hex::encode)
    }
}

/// Context a module is defined under: the defining loader and the code
/// source it vouches for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrustScope {
    pub loader: LoaderId,
    pub code_source: CodeSource,
}

impl TrustScope {
    /// Scope of a module supplied by the host process.
    pub fn host(loader: LoaderId) -> Self {
        Self {
            loader,
            code_source: CodeSource::default(),
        }
    }
}

/// A materialized code unit.
pub struct Module {
    name: String,
    namespace: Arc<NamespaceMetadata>,
    scope: TrustScope,
    procedures: FxHashMap<String, Procedure>,
}

impl Module {
    pub fn new(
        name: impl Into<String>,
        namespace: Arc<NamespaceMetadata>,
        scope: TrustScope,
        procedures: FxHashMap<String, Procedure>,
    ) -> Self {
        Self {
            name: name.into(),
            namespace,
            scope,
            procedures,
        }
    }

    /// Qualified name.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn namespace(&self) -> &NamespaceMetadata {
        &self.namespace
    }

    pub fn trust_scope(&self) -> &TrustScope {
        &self.scope
    }

    pub fn code_source(&self) -> &CodeSource {
        &self.scope.code_source
    }

    /// Loader that defined the module.
    pub fn loader(&self) -> LoaderId {
        self.scope.loader
    }

    pub fn procedure(&self, name: &str) -> Option<Procedure> {
        self.procedures.get(name).cloned()
    }

    /// Exported procedure names, sorted.
    pub fn procedure_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.procedures.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Call an exported procedure. Panics are reported as errors.
    pub fn invoke(&self, procedure: &str, args: &[String]) -> Result<(), ProcedureError> {
        let f = self
            .procedure(procedure)
            .ok_or_else(|| ProcedureError::Failed(format!("no procedure '{}' in module '{}'", procedure, self.name)))?;
        let invocation = Invocation { module: self, args };
        std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| f(&invocation)))
            .map_err(|panic| ProcedureError::Panicked(panic_message(panic.as_ref())))?
    }
}

impl fmt::Debug for Module {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Module")
            .field("name", &self.name)
            .field("namespace", &self.namespace.name)
            .field("loader", &self.scope.loader)
            .field("procedures", &self.procedure_names())
            .finish()
    }
}

/// Text of a caught panic payload.
pub fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "Unknown panic".to_string()
    }
}
