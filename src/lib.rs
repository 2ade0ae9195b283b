//! Mail Triage
//!
//! A mailbox triage engine that walks an IMAP mailbox one message at a time,
//! asks an LLM whether each message is worth reading, and files, stars or
//! prunes it accordingly.
//!
//! # Overview
//!
//! - **Connection**: IMAP over TLS with bounded operations and retried connects
//! - **Planning**: ordered folder search with category-folder fallback
//! - **Classification**: local marketplace heuristic, then an OpenAI-compatible model
//! - **Actions**: star, archive, route to category folders, or delete old rejects
//! - **Scheduling**: a forever loop alternating new-mail and backlog passes
//! - **Control**: HTTP endpoints to trigger a pass on demand
//!
//! # Example Usage
//!
//! ```no_run
//! use mail_triage::{cli, config::Config, models::TriageMode};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Arc::new(Config::load("config.toml".as_ref()).await?);
//!
//!     // IMAP_USER, IMAP_PASSWORD and OPENAI_API_KEY come from the environment
//!     let engine = cli::build_engine(config)?;
//!
//!     let report = engine.run(TriageMode::New, None).await?;
//!     println!("processed {} messages", report.processed);
//!     Ok(())
//! }
//! ```
//!
//! # Module Organization
//!
//! - [`classifier`] - Business heuristic, verdict normalization and the OpenAI classifier
//! - [`cli`] - Command-line interface and engine wiring
//! - [`client`] - Mailbox session trait and the IMAP implementation
//! - [`config`] - Configuration management
//! - [`error`] - Error types and result aliases
//! - [`executor`] - Per-message actions for a verdict
//! - [`models`] - Core data structures
//! - [`parser`] - MIME parsing into message snapshots
//! - [`planner`] - Folder search plans and resolution
//! - [`retry`] - Exponential backoff with jitter and rate-limit cooldowns
//! - [`scheduler`] - Single-flight guard and the forever scheduler
//! - [`server`] - HTTP control surface
//! - [`state`] - Persistent new-mail watermark
//! - [`triage`] - The pass state machine

pub mod classifier;
pub mod cli;
pub mod client;
pub mod config;
pub mod error;
pub mod executor;
pub mod models;
pub mod parser;
pub mod planner;
pub mod retry;
pub mod scheduler;
pub mod server;
pub mod state;
pub mod triage;

// Re-export commonly used types for convenience
pub use error::{Result, TriageError};

// Core data models
pub use models::{
    ActionOutcome, ControlResponse, FailureReason, MessageSnapshot, PassReport, RawMessage,
    TriageMode, Verdict,
};

// Classification
pub use classifier::{
    BusinessRule, ClassificationDispatcher, ClassificationRequest, ClassificationService,
    OpenAiClassifier,
};

// Mailbox access
pub use client::{
    ImapConnector, ImapMailboxClient, MailboxClient, MailboxConnector, MessageFlag,
    SearchPredicate,
};

// Config types
pub use config::{Config, MailboxCredentials};

// Engine and scheduling
pub use planner::{FolderSearchPlan, Resolution};
pub use retry::RetryPolicy;
pub use scheduler::{PassRunner, Scheduler, SingleFlight};
pub use state::{FileWatermarkStore, WatermarkStore};
pub use triage::TriageEngine;

// CLI types (for binary usage)
pub use cli::{Cli, Commands};
