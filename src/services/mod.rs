pub mod catalog;
pub mod crypto;
pub mod fingerprint;
pub mod gemini;
pub mod learning;
pub mod queue;
pub mod reconcile;
pub mod recovery;
pub mod retry;
pub mod state;
pub mod storage;
pub mod submit;
pub mod worker;
pub mod zones;
