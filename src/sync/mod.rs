//! Cross-node L1 Synchronization
//!
//! - [`dedup`] - bounded window of applied event ids
//! - [`agent`] - inbound event consumer and its task handle

pub mod agent;
pub mod dedup;

pub use agent::{EventOutcome, SyncAgent, SyncHandle, SyncStats};
pub use dedup::DedupWindow;
