//! Bootstrap error types.

use std::error::Error;

use nestpack_core::{IndexError, InstallError, LoadError, LocatorError, ProcedureError};

use crate::bootstrap::BootState;

/// Errors that end a bootstrap. Every variant is fatal.
#[derive(Debug, thiserror::Error)]
pub enum BootstrapError {
    /// The running executable could not be determined
    #[error("Unable to locate the container archive")]
    Locate(#[source] std::io::Error),

    /// The container path cannot be expressed as a locator
    #[error(transparent)]
    Location(#[from] LocatorError),

    /// Scanning the container failed
    #[error(transparent)]
    Index(#[from] IndexError),

    /// The `nest:` handler could not be installed
    #[error("Failed to install the nested locator handler")]
    ResolverInstall(#[from] InstallError),

    /// The entry module is missing or failed to load
    #[error("Entry module '{name}' could not be loaded")]
    EntryModule {
        name: String,
        #[source]
        source: LoadError,
    },

    /// The entry module does not export the entry procedure
    #[error("Entry module '{module}' has no procedure '{procedure}'")]
    EntryProcedureMissing { module: String, procedure: String },

    /// The entry procedure returned an error or panicked
    #[error("Entry procedure '{module}::{procedure}' failed")]
    EntryInvocation {
        module: String,
        procedure: String,
        #[source]
        source: ProcedureError,
    },

    /// A step was attempted out of order
    #[error("Bootstrap is in state {actual:?}, expected {expected:?}")]
    InvalidState { expected: BootState, actual: BootState },
}

/// Message of `err` followed by each of its causes, one per line.
pub fn cause_chain(err: &dyn Error) -> String {
    let mut text = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        text.push_str("\n  caused by: ");
        text.push_str(&cause.to_string());
        source = cause.source();
    }
    text
}

/// Log a fatal error and print it with its full cause chain to stderr.
pub fn report_fatal(err: &dyn Error) {
    let chain = cause_chain(err);
    tracing::error!(error = %err, "Bootstrap failed");
    eprintln!("Error: {}", chain);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cause_chain_lists_sources() {
        let err = BootstrapError::EntryModule {
            name: "app.Main".to_string(),
            source: LoadError::ModuleNotFound("app.Main".to_string()),
        };
        assert_eq!(
            cause_chain(&err),
            "Entry module 'app.Main' could not be loaded\n  caused by: Module not found: app.Main"
        );
    }
}
