//! Ambient loader of the current thread
//!
//! Code that needs "the loader I am running under" (resource lookups from a
//! procedure, threads spawned by loaded code) reads it from here instead of
//! having it threaded through every call.

use std::cell::RefCell;
use std::sync::Arc;

use crate::loader::{LoaderId, ModuleLoader};

thread_local! {
    static AMBIENT: RefCell<Option<Arc<dyn ModuleLoader>>> = const { RefCell::new(None) };
}

/// The ambient loader of the calling thread, if any.
pub fn current_loader() -> Option<Arc<dyn ModuleLoader>> {
    AMBIENT.with(|ambient| ambient.borrow().clone())
}

/// Ancestry of the ambient loader, nearest first. Empty when none is set.
pub fn current_ancestry() -> Vec<LoaderId> {
    current_loader().map(|l| l.ancestry()).unwrap_or_default()
}

/// Make `loader` the ambient loader until the returned scope is dropped.
///
/// Scopes nest; dropping one restores whatever was ambient before it,
/// including while unwinding.
pub fn enter(loader: Option<Arc<dyn ModuleLoader>>) -> AmbientScope {
    let previous = AMBIENT.with(|ambient| std::mem::replace(&mut *ambient.borrow_mut(), loader));
    AmbientScope { previous }
}

/// Guard returned by [`enter`].
#[must_use = "the previous ambient loader is restored when the scope is dropped"]
pub struct AmbientScope {
    previous: Option<Arc<dyn ModuleLoader>>,
}

impl Drop for AmbientScope {
    fn drop(&mut self) {
        let previous = self.previous.take();
        AMBIENT.with(|ambient| *ambient.borrow_mut() = previous);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loader::HostLoader;

    #[test]
    fn test_enter_restores_previous() {
        assert!(current_loader().is_none());
        let outer: Arc<dyn ModuleLoader> = Arc::new(HostLoader::new());
        let inner: Arc<dyn ModuleLoader> = Arc::new(HostLoader::new());
        {
            let _outer = enter(Some(Arc::clone(&outer)));
            assert_eq!(current_loader().map(|l| l.id()), Some(outer.id()));
            {
                let _inner = enter(Some(Arc::clone(&inner)));
                assert_eq!(current_ancestry(), vec![inner.id()]);
            }
            assert_eq!(current_loader().map(|l| l.id()), Some(outer.id()));
        }
        assert!(current_loader().is_none());
    }

    #[test]
    fn test_restored_after_panic() {
        let loader: Arc<dyn ModuleLoader> = Arc::new(HostLoader::new());
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let _scope = enter(Some(loader));
            panic!("boom");
        }));
        assert!(result.is_err());
        assert!(current_loader().is_none());
    }
}
