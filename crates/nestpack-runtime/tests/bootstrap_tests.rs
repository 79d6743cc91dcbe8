//! End-to-end tests of the bootstrap lifecycle

mod common;

use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, UNIX_EPOCH};

use common::*;
use nestpack_core::resolver::{Installation, LocatorHandler};
use nestpack_core::{
    context, thread, ImageMaterializer, IndexError, LoadError, ModuleLoader, ProcedureError,
    ResolveError, SymbolTable,
};
use nestpack_runtime::properties;
use nestpack_runtime::{builtins, BootState, Bootstrap, BootstrapConfig, BootstrapError};
use parking_lot::Mutex;

fn config(container: std::path::PathBuf) -> BootstrapConfig {
    BootstrapConfig {
        container: Some(container),
        ..BootstrapConfig::default()
    }
}

fn bootstrap(config: BootstrapConfig, symbols: SymbolTable) -> Bootstrap {
    builtins::register(&symbols);
    Bootstrap::new(config)
        .with_materializer(Arc::new(ImageMaterializer::new(Arc::new(symbols))))
        .with_registry(private_registry())
}

fn micros(at: std::time::SystemTime) -> u64 {
    at.duration_since(UNIX_EPOCH).unwrap().as_micros() as u64
}

#[test]
fn test_scenario_util_vendor_from_nested_descriptor() {
    let _serial = serial();
    let dir = tempfile::tempdir().unwrap();
    let path = write_container(dir.path(), &scenario("test.entry"));

    let seen: Arc<Mutex<Vec<String>>> = Arc::default();
    let symbols = SymbolTable::new();
    let record = Arc::clone(&seen);
    symbols.register("test.entry", move |inv| {
        let loader = context::current_loader().unwrap();
        let util = loader.load_module("com.acme.Util").map_err(|e| ProcedureError::Failed(e.to_string()))?;
        let mut seen = record.lock();
        seen.push(util.namespace().vendor.clone().unwrap_or_default());
        seen.extend(inv.args.iter().cloned());
        Ok(())
    });

    let mut boot = bootstrap(config(path), symbols);
    let termination = boot.launch(&["one".to_string(), "two".to_string()]);

    assert_eq!(termination.exit_code, 0);
    assert!(termination.threads.is_clean());
    assert_eq!(boot.state(), BootState::Terminated);
    assert_eq!(*seen.lock(), vec!["Acme Corp", "one", "two"]);

    let loader = boot.loader().unwrap();
    assert!(loader.is_defined("com.acme.Util"));
    assert_eq!(loader.index().realized_count(), 0);
}

#[test]
fn test_states_and_properties_are_ordered() {
    let _serial = serial();
    let dir = tempfile::tempdir().unwrap();
    let path = write_container(dir.path(), &scenario("test.entry"));

    let stamps: Arc<Mutex<Vec<Option<u64>>>> = Arc::default();
    let symbols = SymbolTable::new();
    let record = Arc::clone(&stamps);
    symbols.register("test.entry", move |_| {
        let mut stamps = record.lock();
        for key in [properties::BEGIN, properties::SCAN_BEGIN, properties::SCAN_END, properties::MAIN_INVOKE] {
            stamps.push(properties::timestamp(key));
        }
        Ok(())
    });

    let mut boot = bootstrap(config(path), symbols);
    boot.load().unwrap();
    boot.start(&[]).unwrap();

    let stamps: Vec<u64> = stamps.lock().iter().map(|s| s.unwrap()).collect();
    assert!(stamps.windows(2).all(|w| w[0] <= w[1]), "{:?}", stamps);

    let states: Vec<BootState> = boot.history().iter().map(|t| t.state).collect();
    assert_eq!(
        states,
        vec![
            BootState::Init,
            BootState::Indexed,
            BootState::ResolverInstalled,
            BootState::LoaderReady,
            BootState::EntryResolved,
            BootState::Running,
        ]
    );
    let installed = boot.history()[2].at;
    assert!(micros(installed) >= stamps[2]);

    let termination = boot.terminate(true);
    assert_eq!(termination.exit_code, 0);
    assert!(properties::get(properties::SCAN_END).is_none());
    assert!(properties::snapshot().is_empty());
}

#[test]
fn test_steps_cannot_run_out_of_order() {
    let _serial = serial();
    let dir = tempfile::tempdir().unwrap();
    let path = write_container(dir.path(), &scenario("nestpack.echo"));

    let mut boot = bootstrap(config(path), SymbolTable::new());
    assert!(matches!(
        boot.start(&[]),
        Err(BootstrapError::InvalidState { expected: BootState::EntryResolved, actual: BootState::Init })
    ));
    boot.index_container().unwrap();
    assert!(matches!(boot.index_container(), Err(BootstrapError::InvalidState { .. })));
    boot.terminate(true);
}

/// Procedure that leaves a non-daemon thread parked until stopped.
fn spawn_leftover(symbols: &SymbolTable, slot: Arc<Mutex<Option<JoinHandle<bool>>>>) {
    symbols.register("test.spawn", move |_| {
        let handle = thread::Builder::new()
            .name("leftover")
            .spawn(|| thread::park_until_stopped(Some(Duration::from_secs(30))))?;
        *slot.lock() = Some(handle);
        Ok(())
    });
}

#[test]
fn test_cat_reads_through_the_application_loader() {
    let _serial = serial();
    let dir = tempfile::tempdir().unwrap();
    let path = write_container(dir.path(), &scenario(builtins::CAT));

    // The handler goes into a private registry; the process-wide one stays empty.
    let mut boot = bootstrap(config(path), SymbolTable::new());
    let termination = boot.launch(&["META-INF/manifest.toml".to_string()]);

    assert_eq!(termination.exit_code, 0);
    assert!(!nestpack_core::resolver::global().is_installed(nestpack_core::NESTED_SCHEME));

    let mut boot = bootstrap(
        config(write_container(dir.path(), &scenario(builtins::CAT))),
        SymbolTable::new(),
    );
    let termination = boot.launch(&["absent.txt".to_string()]);
    assert_eq!(termination.exit_code, 1);
}

#[test]
fn test_report_only_keeps_leftover_thread() {
    let _serial = serial();
    let dir = tempfile::tempdir().unwrap();
    let path = write_container(dir.path(), &scenario("test.spawn"));

    let slot: Arc<Mutex<Option<JoinHandle<bool>>>> = Arc::default();
    let symbols = SymbolTable::new();
    spawn_leftover(&symbols, Arc::clone(&slot));

    let mut config = config(path);
    config.shutdown.report_only = true;
    let mut boot = bootstrap(config, symbols);
    let (termination, logs) = capture_logs(|| boot.launch(&[]));

    assert_eq!(termination.exit_code, 0);
    let warning = logs
        .lines()
        .find(|line| line.contains("Non-daemon thread still running at shutdown"))
        .unwrap();
    assert!(warning.contains("WARN"));
    assert!(warning.contains("leftover"));
    assert_eq!(termination.threads.leftover.len(), 1);
    assert!(termination.threads.leftover[0].starts_with("leftover"));
    assert!(termination.threads.stopped.is_empty());

    let loader_id = boot.loader().unwrap().id();
    let record = thread::registry()
        .snapshot()
        .into_iter()
        .find(|r| r.spawned_under(loader_id))
        .unwrap();
    assert!(!record.is_finished());

    record.request_stop();
    let handle = slot.lock().take().unwrap();
    assert!(handle.join().unwrap());
}

#[test]
fn test_leftover_thread_is_stopped() {
    let _serial = serial();
    let dir = tempfile::tempdir().unwrap();
    let path = write_container(dir.path(), &scenario("test.spawn"));

    let slot: Arc<Mutex<Option<JoinHandle<bool>>>> = Arc::default();
    let symbols = SymbolTable::new();
    spawn_leftover(&symbols, Arc::clone(&slot));

    let mut boot = bootstrap(config(path), symbols);
    let termination = boot.launch(&[]);

    assert_eq!(termination.threads.leftover.len(), 1);
    assert_eq!(termination.threads.stopped, termination.threads.leftover);
    assert!(termination.threads.unresponsive.is_empty());

    let handle = slot.lock().take().unwrap();
    assert!(handle.join().unwrap());
}

#[test]
fn test_missing_entry_module_is_fatal() {
    let _serial = serial();
    let dir = tempfile::tempdir().unwrap();
    let path = write_container(dir.path(), &scenario("nestpack.echo"));

    let mut config = config(path);
    config.entry_module = Some("app.Absent".to_string());
    let mut boot = bootstrap(config, SymbolTable::new());

    assert!(matches!(
        boot.load(),
        Err(BootstrapError::EntryModule { name, source: LoadError::ModuleNotFound(_) }) if name == "app.Absent"
    ));
    assert_eq!(boot.state(), BootState::LoaderReady);

    let termination = boot.terminate(false);
    assert_eq!(termination.exit_code, 1);
    assert_eq!(boot.state(), BootState::Terminated);
    assert!(!boot.history().iter().any(|t| t.state == BootState::EntryResolved));
}

#[test]
fn test_missing_entry_procedure_is_fatal() {
    let _serial = serial();
    let dir = tempfile::tempdir().unwrap();
    let path = write_container(
        dir.path(),
        &zip_bytes(&[("app/Main.mod", &unit("app.Main", &[("start", "nestpack.echo")]))]),
    );

    let mut boot = bootstrap(config(path), SymbolTable::new());
    assert!(matches!(
        boot.load(),
        Err(BootstrapError::EntryProcedureMissing { procedure, .. }) if procedure == "main"
    ));
    assert_eq!(boot.terminate(false).exit_code, 1);
}

#[test]
fn test_entry_failure_restores_ambient_loader() {
    let _serial = serial();
    let dir = tempfile::tempdir().unwrap();
    let path = write_container(dir.path(), &scenario("test.fail"));

    let symbols = SymbolTable::new();
    symbols.register("test.fail", |_| Err(ProcedureError::Failed("boom".to_string())));
    let mut boot = bootstrap(config(path), symbols);
    boot.load().unwrap();

    let err = boot.start(&[]).unwrap_err();
    assert!(matches!(
        &err,
        BootstrapError::EntryInvocation { source: ProcedureError::Failed(msg), .. } if msg == "boom"
    ));
    assert!(context::current_loader().is_none());
    assert_eq!(boot.state(), BootState::Running);
    assert_eq!(boot.terminate(false).exit_code, 1);
}

#[test]
fn test_entry_panic_is_reported() {
    let _serial = serial();
    let dir = tempfile::tempdir().unwrap();
    let path = write_container(dir.path(), &scenario("test.panic"));

    let symbols = SymbolTable::new();
    symbols.register("test.panic", |_| panic!("entry exploded"));
    let mut boot = bootstrap(config(path), symbols);
    boot.load().unwrap();

    assert!(matches!(
        boot.start(&[]),
        Err(BootstrapError::EntryInvocation { source: ProcedureError::Panicked(msg), .. }) if msg == "entry exploded"
    ));
    assert!(context::current_loader().is_none());
    boot.terminate(false);
}

#[test]
fn test_descriptor_main_names_entry() {
    let _serial = serial();
    let dir = tempfile::tempdir().unwrap();
    let path = write_container(
        dir.path(),
        &zip_bytes(&[
            ("META-INF/manifest.toml", b"main = \"app.Custom\"\n"),
            ("app/Custom.mod", &unit("app.Custom", &[("main", "nestpack.echo")])),
        ]),
    );

    let mut boot = bootstrap(config(path), SymbolTable::new());
    let module = boot.load().unwrap();
    assert_eq!(module.name(), "app.Custom");
    boot.terminate(true);
}

#[test]
fn test_resolver_override_and_sealed_conflict() {
    struct Dummy;
    impl LocatorHandler for Dummy {
        fn open(&self, _locator: &str) -> Result<Box<dyn std::io::Read + Send>, ResolveError> {
            Err(ResolveError::NoHandler("dummy".to_string()))
        }
    }

    let _serial = serial();
    let dir = tempfile::tempdir().unwrap();
    let path = write_container(dir.path(), &scenario("nestpack.echo"));

    let registry = private_registry();
    registry.install("nest", Arc::new(Dummy)).unwrap();
    let mut boot = Bootstrap::new(config(path.clone())).with_registry(registry);
    boot.index_container().unwrap();
    assert_eq!(boot.install_resolver().unwrap(), Installation::Overridden);

    let locator = boot.index().unwrap().find_resource("com/acme/Util.mod").unwrap();
    let bytes = registry.read(&locator.to_string()).unwrap();
    assert_eq!(bytes, unit("com.acme.Util", &[("main", "nestpack.echo")]));
    boot.terminate(true);

    let sealed = private_registry();
    sealed.install("nest", Arc::new(Dummy)).unwrap();
    sealed.seal("nest");
    let mut boot = Bootstrap::new(config(path)).with_registry(sealed);
    boot.index_container().unwrap();
    assert!(matches!(boot.install_resolver(), Err(BootstrapError::ResolverInstall(_))));
    assert_eq!(boot.terminate(false).exit_code, 1);
}

#[test]
fn test_unreadable_container_is_fatal() {
    let _serial = serial();
    let dir = tempfile::tempdir().unwrap();
    let path = write_container(dir.path(), b"not an archive");

    let mut boot = bootstrap(config(path), SymbolTable::new());
    assert!(matches!(
        boot.index_container(),
        Err(BootstrapError::Index(IndexError::ContainerUnreadable { .. }))
    ));
    let termination = boot.launch(&[]);
    assert_eq!(termination.exit_code, 1);
    assert!(boot.index().is_none());
}
