use std::sync::Arc;

use super::EntryIndex;
use crate::locator::Locator;

/// Lazy sequence of locators providing one resource name.
///
/// Archives are visited in scan order and only searched as the iterator
/// advances. The sequence is finite and cloning it yields an independent
/// cursor.
#[derive(Clone)]
pub struct Resources {
    index: Arc<EntryIndex>,
    name: String,
    next: usize,
}

impl Resources {
    pub(crate) fn new(index: Arc<EntryIndex>, name: &str) -> Self {
        Self {
            index,
            name: name.to_string(),
            next: 0,
        }
    }

    /// Resource name being searched.
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl Iterator for Resources {
    type Item = Locator;

    fn next(&mut self) -> Option<Locator> {
        match self.index.locate_from(&self.name, self.next) {
            Some((slot, locator)) => {
                self.next = slot + 1;
                Some(locator)
            }
            None => {
                self.next = self.index.archive_count();
                None
            }
        }
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (0, Some(self.index.archive_count().saturating_sub(self.next)))
    }
}

impl std::fmt::Debug for Resources {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Resources")
            .field("name", &self.name)
            .field("next", &self.next)
            .finish()
    }
}
