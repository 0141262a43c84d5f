//! Shared storage for the current flag definitions snapshot.
//!
//! The poller is the only writer after startup. Evaluations read a whole snapshot at a time.
use std::sync::{Arc, RwLock};

use crate::{definitions_fetcher::DefinitionsSource, flags::FlagDefinitions, Result};

/// `DefinitionsStore` provides a Sync storage for flag definitions that allows concurrent access
/// for readers and writers.
///
/// Readers get an `Arc` to an immutable snapshot, so a refresh never changes definitions under an
/// evaluation that is already running.
#[derive(Default)]
pub struct DefinitionsStore {
    definitions: RwLock<Option<Arc<FlagDefinitions>>>,
}

impl DefinitionsStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Current snapshot, or `None` if definitions have never been fetched.
    pub fn get_definitions(&self) -> Option<Arc<FlagDefinitions>> {
        // Err() is possible only if the lock is poisoned (writer panicked while holding the
        // lock). Using .ok()? here to not crash the app.
        let definitions = self.definitions.read().ok()?;
        definitions.clone()
    }

    /// Replace the snapshot with `definitions`.
    pub fn set_definitions(&self, definitions: Arc<FlagDefinitions>) {
        let mut slot = match self.definitions.write() {
            Ok(slot) => slot,
            Err(poisoned) => poisoned.into_inner(),
        };
        *slot = Some(definitions);
    }

    /// `true` once a snapshot has been stored.
    pub fn is_ready(&self) -> bool {
        self.get_definitions().is_some()
    }

    /// Fetch definitions from `source` and store them. On failure the current snapshot is kept.
    pub(crate) fn refresh_from(&self, source: &dyn DefinitionsSource) -> Result<()> {
        match source.fetch_definitions() {
            Ok(definitions) => {
                log::debug!(target: "mixpanel", flags = definitions.len(); "storing new flag definitions");
                self.set_definitions(Arc::new(definitions));
                Ok(())
            }
            Err(err) => {
                log::warn!(target: "mixpanel", error:display = err; "failed to refresh flag definitions, keeping previous snapshot");
                Err(err)
            }
        }
    }
}
