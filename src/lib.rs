//! Invoice processing pipeline: template-first extraction with an AI
//! fallback, reconciliation, reviewer workflow, template learning and
//! catalog propagation.

pub mod config;
pub mod db;
pub mod error;
pub mod models;
pub mod services;
pub mod utils;

pub use config::Settings;
pub use db::Database;
pub use error::{PipelineError, Result};
pub use services::state::AppState;
