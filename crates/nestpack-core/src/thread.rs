//! Loader-tagged threads
//!
//! Threads started through [`Builder`] are recorded in a process-wide
//! registry together with the ancestry of the loader that was ambient when
//! they were spawned. At shutdown the registry tells which live threads were
//! started by loaded code, and offers each a cooperative stop signal.

use std::cell::RefCell;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, LazyLock, OnceLock};
use std::thread::{JoinHandle, Thread};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::{Condvar, Mutex};

use crate::context;
use crate::loader::LoaderId;

/// Bookkeeping for one tagged thread.
pub struct ThreadRecord {
    id: u64,
    name: Option<String>,
    daemon: bool,
    ancestry: Vec<LoaderId>,
    stop: AtomicBool,
    finished: Mutex<bool>,
    exited: Condvar,
    thread: OnceLock<Thread>,
}

impl ThreadRecord {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn is_daemon(&self) -> bool {
        self.daemon
    }

    /// Loader ancestry at spawn time, nearest first.
    pub fn ancestry(&self) -> &[LoaderId] {
        &self.ancestry
    }

    /// Whether the thread was spawned while `loader`, or a loader below it,
    /// was ambient.
    pub fn spawned_under(&self, loader: LoaderId) -> bool {
        self.ancestry.contains(&loader)
    }

    pub fn is_finished(&self) -> bool {
        *self.finished.lock()
    }

    pub fn is_stop_requested(&self) -> bool {
        self.stop.load(Ordering::SeqCst)
    }

    /// Raise the stop signal and wake the thread if it is parked.
    pub fn request_stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(thread) = self.thread.get() {
            thread.unpark();
        }
    }

    /// Wait for the thread to exit. Returns false on timeout.
    pub fn wait_for_exit(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut finished = self.finished.lock();
        while !*finished {
            if self.exited.wait_until(&mut finished, deadline).timed_out() {
                return *finished;
            }
        }
        true
    }

    fn mark_finished(&self) {
        *self.finished.lock() = true;
        self.exited.notify_all();
    }

    /// Label for log output.
    pub fn label(&self) -> String {
        match &self.name {
            Some(name) => format!("{} (#{})", name, self.id),
            None => format!("#{}", self.id),
        }
    }
}

impl std::fmt::Debug for ThreadRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThreadRecord")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("daemon", &self.daemon)
            .field("ancestry", &self.ancestry)
            .field("finished", &self.is_finished())
            .finish()
    }
}

/// Live tagged threads.
pub struct ThreadRegistry {
    threads: DashMap<u64, Arc<ThreadRecord>>,
    next_id: AtomicU64,
}

impl ThreadRegistry {
    fn new() -> Self {
        Self {
            threads: DashMap::new(),
            next_id: AtomicU64::new(1),
        }
    }

    /// Point-in-time copy of the live threads, ordered by id.
    pub fn snapshot(&self) -> Vec<Arc<ThreadRecord>> {
        let mut records: Vec<_> = self
            .threads
            .iter()
            .filter(|r| !r.value().is_finished())
            .map(|r| Arc::clone(r.value()))
            .collect();
        records.sort_by_key(|r| r.id);
        records
    }

    pub fn get(&self, id: u64) -> Option<Arc<ThreadRecord>> {
        self.threads.get(&id).map(|r| Arc::clone(r.value()))
    }
}

static REGISTRY: LazyLock<ThreadRegistry> = LazyLock::new(ThreadRegistry::new);

/// The process-wide thread registry.
pub fn registry() -> &'static ThreadRegistry {
    &REGISTRY
}

thread_local! {
    static CURRENT: RefCell<Option<Arc<ThreadRecord>>> = const { RefCell::new(None) };
}

/// Record of the calling thread, when it was spawned through [`Builder`].
pub fn current() -> Option<Arc<ThreadRecord>> {
    CURRENT.with(|c| c.borrow().clone())
}

/// Whether a stop was requested for the calling thread.
pub fn stop_requested() -> bool {
    current().is_some_and(|r| r.is_stop_requested())
}

/// Park until a stop is requested or `timeout` elapses.
///
/// Returns whether a stop was requested. Untagged threads just sleep out the
/// timeout (or return at once when there is none).
pub fn park_until_stopped(timeout: Option<Duration>) -> bool {
    let Some(record) = current() else {
        if let Some(timeout) = timeout {
            std::thread::sleep(timeout);
        }
        return false;
    };

    let deadline = timeout.map(|t| Instant::now() + t);
    while !record.is_stop_requested() {
        match deadline {
            Some(deadline) => {
                let now = Instant::now();
                if now >= deadline {
                    break;
                }
                std::thread::park_timeout(deadline - now);
            }
            None => std::thread::park(),
        }
    }
    record.is_stop_requested()
}

/// Clears the thread's registration when its body returns or unwinds.
struct ExitGuard(Arc<ThreadRecord>);

impl Drop for ExitGuard {
    fn drop(&mut self) {
        self.0.mark_finished();
        REGISTRY.threads.remove(&self.0.id);
        CURRENT.with(|c| c.borrow_mut().take());
    }
}

/// Spawns threads tagged with the ambient loader.
///
/// The new thread inherits the spawning thread's ambient loader.
#[derive(Debug, Default)]
pub struct Builder {
    name: Option<String>,
    daemon: bool,
}

impl Builder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Daemon threads are never stopped at shutdown.
    pub fn daemon(mut self, daemon: bool) -> Self {
        self.daemon = daemon;
        self
    }

    pub fn spawn<F, T>(self, f: F) -> io::Result<JoinHandle<T>>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        let ambient = context::current_loader();
        let ancestry = ambient.as_ref().map(|l| l.ancestry()).unwrap_or_default();
        let record = Arc::new(ThreadRecord {
            id: REGISTRY.next_id.fetch_add(1, Ordering::Relaxed),
            name: self.name.clone(),
            daemon: self.daemon,
            ancestry,
            stop: AtomicBool::new(false),
            finished: Mutex::new(false),
            exited: Condvar::new(),
            thread: OnceLock::new(),
        });
        REGISTRY.threads.insert(record.id, Arc::clone(&record));

        let mut builder = std::thread::Builder::new();
        if let Some(name) = self.name {
            builder = builder.name(name);
        }

        let inner = Arc::clone(&record);
        let spawned = builder.spawn(move || {
            let _ = inner.thread.set(std::thread::current());
            CURRENT.with(|c| *c.borrow_mut() = Some(Arc::clone(&inner)));
            let _exit = ExitGuard(inner);
            let _scope = context::enter(ambient);
            f()
        });

        match spawned {
            Ok(handle) => {
                let _ = record.thread.set(handle.thread().clone());
                tracing::debug!(thread = %record.label(), daemon = record.daemon, "Tagged thread spawned");
                Ok(handle)
            }
            Err(e) => {
                REGISTRY.threads.remove(&record.id);
                Err(e)
            }
        }
    }
}
