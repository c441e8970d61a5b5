//! Slotline - scheduled thread publishing for X
//!
//! This library provides the publish pipeline behind `slot-send` and
//! `slot-queue`: job claiming, token refresh, chunked media upload and
//! reply-chain posting on top of a pluggable store.

pub mod config;
pub mod db;
pub mod error;
pub mod logging;
pub mod platforms;
pub mod publisher;
pub mod scheduler;
pub mod scheduling;
pub mod storage;
pub mod store;
pub mod submission;
pub mod tokens;
pub mod types;
pub mod upload;

// Re-export commonly used types
pub use config::Config;
pub use db::Database;
pub use error::{ErrorCategory, Result, SlotlineError};
pub use platforms::Platform;
pub use scheduler::{Clock, Scheduler, TickSummary};
pub use storage::ObjectStorage;
pub use store::{MemoryStore, Store};
pub use submission::{submit_thread, SubmittedThread, ThreadSubmission};
pub use tokens::TokenManager;
pub use types::{Account, JobStatus, Media, Post, PostItem, PostRecord, PostStatus, PublishJob};
