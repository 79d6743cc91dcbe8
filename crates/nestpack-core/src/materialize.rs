//! Turning code unit payloads into live modules
//!
//! The default [`ImageMaterializer`] reads a TOML unit image and links each
//! exported procedure to a symbol registered by the host:
//!
//! ```toml
//! name = "com.acme.Util"
//!
//! [procedures]
//! main = "nestpack.echo"
//! ```

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use serde::Deserialize;
use thiserror::Error;

use crate::module::{Invocation, Module, Procedure, ProcedureError, TrustScope};
use crate::namespace::NamespaceMetadata;

/// Errors that can occur while materializing a code unit
#[derive(Debug, Error)]
pub enum MaterializeError {
    /// Payload is not valid UTF-8
    #[error("Code unit image is not valid UTF-8")]
    Encoding(#[from] std::str::Utf8Error),

    /// Failed to parse the unit image
    #[error("Failed to parse code unit image: {0}")]
    Image(#[from] toml::de::Error),

    /// The image declares a different name than the one requested
    #[error("Code unit image declares '{found}', expected '{expected}'")]
    NameMismatch { expected: String, found: String },

    /// An exported procedure refers to an unknown host symbol
    #[error("Procedure '{procedure}' of '{module}' refers to unknown symbol '{symbol}'")]
    UnresolvedSymbol {
        module: String,
        procedure: String,
        symbol: String,
    },
}

/// Everything needed to define one module.
pub struct MaterializeRequest<'a> {
    /// Qualified name the caller asked for.
    pub name: &'a str,
    /// Code unit payload.
    pub bytes: &'a [u8],
    pub namespace: Arc<NamespaceMetadata>,
    pub scope: TrustScope,
}

/// Defines modules from code unit payloads.
pub trait Materializer: Send + Sync {
    fn materialize(&self, request: MaterializeRequest<'_>) -> Result<Module, MaterializeError>;
}

/// Parsed code unit payload
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct UnitImage {
    /// Qualified name of the unit
    pub name: String,

    /// Exported procedure -> host symbol
    #[serde(default)]
    pub procedures: BTreeMap<String, String>,
}

impl UnitImage {
    pub fn parse(bytes: &[u8]) -> Result<Self, MaterializeError> {
        Ok(toml::from_str(std::str::from_utf8(bytes)?)?)
    }
}

/// Host symbols that unit images may link against.
#[derive(Default)]
pub struct SymbolTable {
    symbols: RwLock<FxHashMap<String, Procedure>>,
}

impl SymbolTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `f` under `symbol`, replacing any previous definition.
    pub fn register<F>(&self, symbol: &str, f: F)
    where
        F: Fn(&Invocation<'_>) -> Result<(), ProcedureError> + Send + Sync + 'static,
    {
        self.symbols.write().insert(symbol.to_string(), Arc::new(f));
    }

    pub fn get(&self, symbol: &str) -> Option<Procedure> {
        self.symbols.read().get(symbol).cloned()
    }
}

impl std::fmt::Debug for SymbolTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let symbols = self.symbols.read();
        let mut names: Vec<&String> = symbols.keys().collect();
        names.sort();
        f.debug_struct("SymbolTable").field("symbols", &names).finish()
    }
}

/// Materializes TOML unit images against a [`SymbolTable`].
#[derive(Debug, Clone)]
pub struct ImageMaterializer {
    symbols: Arc<SymbolTable>,
}

impl ImageMaterializer {
    pub fn new(symbols: Arc<SymbolTable>) -> Self {
        Self { symbols }
    }

    pub fn symbols(&self) -> &Arc<SymbolTable> {
        &self.symbols
    }
}

impl Materializer for ImageMaterializer {
    fn materialize(&self, request: MaterializeRequest<'_>) -> Result<Module, MaterializeError> {
        let image = UnitImage::parse(request.bytes)?;
        if image.name != request.name {
            return Err(MaterializeError::NameMismatch {
                expected: request.name.to_string(),
                found: image.name,
            });
        }

        let mut procedures = FxHashMap::default();
        for (procedure, symbol) in image.procedures {
            let f = self
                .symbols
                .get(&symbol)
                .ok_or_else(|| MaterializeError::UnresolvedSymbol {
                    module: request.name.to_string(),
                    procedure: procedure.clone(),
                    symbol: symbol.clone(),
                })?;
            procedures.insert(procedure, f);
        }

        Ok(Module::new(
            image.name,
            request.namespace,
            request.scope,
            procedures,
        ))
    }
}
