//! Shared state handed to the workers and the submission surface.

use std::sync::{Arc, Mutex, MutexGuard};

use crate::config::Settings;
use crate::db::Database;
use crate::error::{PipelineError, Result};
use crate::services::gemini::{AiExtractor, GeminiExtractor};
use crate::services::queue::{InMemoryQueue, JobQueue};
use crate::services::storage::{BlobStore, LocalBlobStore};

#[derive(Clone)]
pub struct AppState {
    db: Arc<Mutex<Database>>,
    pub settings: Arc<Settings>,
    pub queue: Arc<dyn JobQueue>,
    pub store: Arc<dyn BlobStore>,
    pub ai: Arc<dyn AiExtractor>,
}

impl AppState {
    pub fn new(db: Database, settings: Settings, blob_root: impl Into<std::path::PathBuf>) -> Self {
        let ai = GeminiExtractor::new(&settings);
        AppState {
            db: Arc::new(Mutex::new(db)),
            settings: Arc::new(settings),
            queue: Arc::new(InMemoryQueue::new()),
            store: Arc::new(LocalBlobStore::new(blob_root)),
            ai: Arc::new(ai),
        }
    }

    /// Constructor with explicit collaborators, used where the defaults
    /// (local blob store, Gemini, in-memory queue) are not wanted.
    pub fn with_parts(
        db: Database,
        settings: Settings,
        queue: Arc<dyn JobQueue>,
        store: Arc<dyn BlobStore>,
        ai: Arc<dyn AiExtractor>,
    ) -> Self {
        AppState {
            db: Arc::new(Mutex::new(db)),
            settings: Arc::new(settings),
            queue,
            store,
            ai,
        }
    }

    /// Lock held only for the duration of one database call; never across
    /// an await point.
    pub fn db(&self) -> Result<MutexGuard<'_, Database>> {
        self.db
            .lock()
            .map_err(|_| PipelineError::Other("database lock poisoned".to_string()))
    }
}
