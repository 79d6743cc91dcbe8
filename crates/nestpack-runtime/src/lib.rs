//! Nestpack runtime
//!
//! Boots an application out of a nested archive container: scans the
//! container, installs the `nest:` resolver, builds a loader over the index,
//! resolves the entry module and runs it, then shuts down the threads the
//! application left behind.

pub mod bootstrap;
pub mod builtins;
pub mod config;
pub mod error;
pub mod properties;
pub mod shutdown;

pub use bootstrap::{BootState, Bootstrap, Termination, Transition};
pub use config::BootstrapConfig;
pub use error::BootstrapError;
pub use shutdown::{ShutdownPolicy, ShutdownReport, TaggedThreadJanitor, ThreadJanitor};
