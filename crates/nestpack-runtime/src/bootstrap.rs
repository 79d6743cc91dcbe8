//! Bootstrap controller
//!
//! Drives the launch through a fixed sequence of states:
//!
//! ```text
//! Init ─▶ Indexed ─▶ ResolverInstalled ─▶ LoaderReady ─▶ EntryResolved ─▶ Running ─▶ Terminated
//!   └──────────┴──────────────┴────────────────┴──────────────┴──── on failure ──────────▲
//! ```
//!
//! No state is ever revisited. Each step checks it is entered from its
//! predecessor, so the steps can also be driven one at a time.

use std::sync::Arc;
use std::time::SystemTime;

use nestpack_core::context;
use nestpack_core::resolver::{self, HandlerRegistry, Installation};
use nestpack_core::{
    ArchiveDescriptor, ContainerLocation, EntryIndex, HostLoader, ImageMaterializer, Materializer,
    Module, ModuleLoader, NestedLoader, ScanReport, DESCRIPTOR_PATH,
};

use crate::builtins;
use crate::config::{BootstrapConfig, DEFAULT_ENTRY_MODULE};
use crate::error::{report_fatal, BootstrapError};
use crate::properties;
use crate::shutdown::{ShutdownReport, TaggedThreadJanitor, ThreadJanitor};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum BootState {
    Init,
    Indexed,
    ResolverInstalled,
    LoaderReady,
    EntryResolved,
    Running,
    Terminated,
}

/// A state change and when it happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub state: BootState,
    pub at: SystemTime,
}

/// Result of [`Bootstrap::terminate`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Termination {
    pub exit_code: i32,
    pub threads: ShutdownReport,
}

pub struct Bootstrap {
    config: BootstrapConfig,
    parent: Option<Arc<dyn ModuleLoader>>,
    materializer: Arc<dyn Materializer>,
    registry: &'static HandlerRegistry,
    janitor: Box<dyn ThreadJanitor>,

    state: BootState,
    history: Vec<Transition>,
    location: Option<ContainerLocation>,
    index: Option<Arc<EntryIndex>>,
    loader: Option<Arc<NestedLoader>>,
    entry: Option<Arc<Module>>,
}

impl Bootstrap {
    /// A bootstrap whose code units link against the builtin host symbols.
    pub fn new(config: BootstrapConfig) -> Self {
        let materializer = ImageMaterializer::new(Arc::new(builtins::symbol_table()));
        Self {
            config,
            parent: None,
            materializer: Arc::new(materializer),
            registry: resolver::global(),
            janitor: Box::new(TaggedThreadJanitor),
            state: BootState::Init,
            history: vec![Transition {
                state: BootState::Init,
                at: SystemTime::now(),
            }],
            location: None,
            index: None,
            loader: None,
            entry: None,
        }
    }

    /// Parent of the application loader. Defaults to the ambient loader at
    /// the time the loader is built, or a fresh host loader.
    pub fn with_parent(mut self, parent: Arc<dyn ModuleLoader>) -> Self {
        self.parent = Some(parent);
        self
    }

    pub fn with_materializer(mut self, materializer: Arc<dyn Materializer>) -> Self {
        self.materializer = materializer;
        self
    }

    /// Resolver registry to install the `nest:` handler into. Defaults to
    /// the process-wide one.
    pub fn with_registry(mut self, registry: &'static HandlerRegistry) -> Self {
        self.registry = registry;
        self
    }

    pub fn with_janitor(mut self, janitor: Box<dyn ThreadJanitor>) -> Self {
        self.janitor = janitor;
        self
    }

    pub fn config(&self) -> &BootstrapConfig {
        &self.config
    }

    pub fn state(&self) -> BootState {
        self.state
    }

    /// Every state entered so far, in order.
    pub fn history(&self) -> &[Transition] {
        &self.history
    }

    pub fn index(&self) -> Option<&Arc<EntryIndex>> {
        self.index.as_ref()
    }

    pub fn loader(&self) -> Option<&Arc<NestedLoader>> {
        self.loader.as_ref()
    }

    pub fn entry_module(&self) -> Option<&Arc<Module>> {
        self.entry.as_ref()
    }

    fn expect(&self, expected: BootState) -> Result<(), BootstrapError> {
        if self.state == expected {
            Ok(())
        } else {
            Err(BootstrapError::InvalidState {
                expected,
                actual: self.state,
            })
        }
    }

    fn advance(&mut self, state: BootState) {
        tracing::info!(from = ?self.state, to = ?state, "Bootstrap state change");
        self.state = state;
        self.history.push(Transition {
            state,
            at: SystemTime::now(),
        });
    }

    // ========================================================================
    // Steps
    // ========================================================================

    /// `Init -> Indexed`: locate the container and scan it.
    pub fn index_container(&mut self) -> Result<ScanReport, BootstrapError> {
        self.expect(BootState::Init)?;
        properties::set_timestamp(properties::BEGIN);

        let location = self.config.container_location()?;
        tracing::info!(container = %location.path().display(), "Container located");

        let index = EntryIndex::new(location.clone(), self.config.index.clone());
        properties::set_timestamp(properties::SCAN_BEGIN);
        let report = index.scan()?;
        properties::set_timestamp(properties::SCAN_END);

        self.location = Some(location);
        self.index = Some(Arc::new(index));
        self.advance(BootState::Indexed);
        Ok(report)
    }

    /// `Indexed -> ResolverInstalled`: serve `nest:` locators from the index.
    ///
    /// A handler installed by someone else is overridden; a sealed slot is
    /// fatal.
    pub fn install_resolver(&mut self) -> Result<Installation, BootstrapError> {
        self.expect(BootState::Indexed)?;
        let index = self.require_index()?;
        let installation = resolver::install_nested(self.registry, index)?;
        self.advance(BootState::ResolverInstalled);
        Ok(installation)
    }

    /// `ResolverInstalled -> LoaderReady`: build the application loader.
    pub fn prepare_loader(&mut self) -> Result<Arc<NestedLoader>, BootstrapError> {
        self.expect(BootState::ResolverInstalled)?;
        let index = self.require_index()?;
        let parent = self
            .parent
            .clone()
            .or_else(context::current_loader)
            .unwrap_or_else(|| Arc::new(HostLoader::new()) as Arc<dyn ModuleLoader>);

        let loader = Arc::new(NestedLoader::new(
            index,
            Some(parent),
            Arc::clone(&self.materializer),
        ));
        self.loader = Some(Arc::clone(&loader));
        self.advance(BootState::LoaderReady);
        Ok(loader)
    }

    /// `LoaderReady -> EntryResolved`: load the entry module and check it
    /// exports the entry procedure.
    pub fn resolve_entry(&mut self) -> Result<Arc<Module>, BootstrapError> {
        self.expect(BootState::LoaderReady)?;
        let loader = self.require_loader()?;
        let name = self.entry_name();

        let module = loader
            .load_module(&name)
            .map_err(|source| BootstrapError::EntryModule {
                name: name.clone(),
                source,
            })?;
        if module.procedure(&self.config.entry_procedure).is_none() {
            return Err(BootstrapError::EntryProcedureMissing {
                module: name,
                procedure: self.config.entry_procedure.clone(),
            });
        }

        self.entry = Some(Arc::clone(&module));
        self.advance(BootState::EntryResolved);
        Ok(module)
    }

    /// Every step up to `EntryResolved`.
    pub fn load(&mut self) -> Result<Arc<Module>, BootstrapError> {
        self.index_container()?;
        self.install_resolver()?;
        self.prepare_loader()?;
        self.resolve_entry()
    }

    /// `EntryResolved -> Running`: invoke the entry procedure with the
    /// application loader ambient for the duration of the call.
    pub fn start(&mut self, args: &[String]) -> Result<(), BootstrapError> {
        self.expect(BootState::EntryResolved)?;
        let loader = self.require_loader()?;
        let module = match &self.entry {
            Some(module) => Arc::clone(module),
            None => {
                return Err(BootstrapError::InvalidState {
                    expected: BootState::EntryResolved,
                    actual: self.state,
                })
            }
        };
        let procedure = self.config.entry_procedure.clone();

        self.advance(BootState::Running);
        properties::set_timestamp(properties::MAIN_INVOKE);

        let result = {
            let ambient: Arc<dyn ModuleLoader> = loader;
            let _scope = context::enter(Some(ambient));
            module.invoke(&procedure, args)
        };
        result.map_err(|source| BootstrapError::EntryInvocation {
            module: module.name().to_string(),
            procedure,
            source,
        })
    }

    /// Any state `-> Terminated`: shut down leftover threads and clear the
    /// diagnostic properties. Exits the process when the policy says so.
    pub fn terminate(&mut self, success: bool) -> Termination {
        let threads = match &self.loader {
            Some(loader) if self.state >= BootState::Running => {
                self.janitor.shutdown(loader.id(), &self.config.shutdown)
            }
            _ => ShutdownReport::default(),
        };
        properties::clear();
        if self.state != BootState::Terminated {
            self.advance(BootState::Terminated);
        }

        let exit_code = if success { 0 } else { 1 };
        if self.config.shutdown.system_exit {
            tracing::info!(exit_code, "Exiting process");
            std::process::exit(exit_code);
        }
        Termination { exit_code, threads }
    }

    /// Run the whole lifecycle. Fatal errors are printed with their cause
    /// chain before shutdown.
    pub fn launch(&mut self, args: &[String]) -> Termination {
        let result = self.load().and_then(|_| self.start(args));
        if let Err(e) = &result {
            report_fatal(e);
        }
        self.terminate(result.is_ok())
    }

    // ========================================================================
    // Helpers
    // ========================================================================

    /// Configured entry module, else the container descriptor's `main`, else
    /// the default.
    fn entry_name(&self) -> String {
        if let Some(name) = &self.config.entry_module {
            return name.clone();
        }
        self.descriptor_main()
            .unwrap_or_else(|| DEFAULT_ENTRY_MODULE.to_string())
    }

    fn descriptor_main(&self) -> Option<String> {
        let index = self.index.as_ref()?;
        let locator = index.get_url(index.root_id(), DESCRIPTOR_PATH)?;
        let descriptor = index
            .open(&locator)
            .map_err(|e| e.to_string())
            .and_then(|stream| ArchiveDescriptor::read(stream).map_err(|e| e.to_string()));
        match descriptor {
            Ok(descriptor) => descriptor.main,
            Err(reason) => {
                tracing::debug!(descriptor = %locator, reason = %reason, "Unreadable container descriptor");
                None
            }
        }
    }

    fn require_index(&self) -> Result<Arc<EntryIndex>, BootstrapError> {
        self.index.clone().ok_or(BootstrapError::InvalidState {
            expected: BootState::Indexed,
            actual: self.state,
        })
    }

    fn require_loader(&self) -> Result<Arc<NestedLoader>, BootstrapError> {
        self.loader.clone().ok_or(BootstrapError::InvalidState {
            expected: BootState::LoaderReady,
            actual: self.state,
        })
    }
}

impl std::fmt::Debug for Bootstrap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Bootstrap")
            .field("state", &self.state)
            .field("container", &self.location.as_ref().map(|l| l.path().to_path_buf()))
            .field("entry", &self.entry.as_ref().map(|m| m.name().to_string()))
            .finish()
    }
}
