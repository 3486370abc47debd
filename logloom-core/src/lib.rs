//! # logloom-core
//!
//! Core library for logloom - ingestion, storage, and analysis of AI
//! coding assistant conversation logs.
//!
//! This library provides:
//! - Incremental log ingestion with change detection and dedup
//! - Hierarchical conversation assembly across files and sessions
//! - Canonicalization with priority sampling under a token budget
//! - The collector event protocol (server side)
//! - A directory watch daemon and background analysis workers
//!
//! ## Architecture
//!
//! ```text
//! source logs ──► watch / collector / direct call ──► parse ──► pipeline ──► SQLite
//!                                                                  │
//!                                  canonicalizer ◄─────────────────┘
//!                                        │
//!                                  background workers (tags, recommendations)
//! ```
//!
//! ## Example
//!
//! ```rust,no_run
//! use logloom_core::{Config, Database};
//!
//! let config = Config::load().expect("failed to load config");
//! let db = Database::open(&Config::database_path()).expect("failed to open database");
//! db.migrate().expect("failed to run migrations");
//! ```

// Re-export commonly used items at the crate root
pub use config::Config;
pub use context::AppContext;
pub use db::Database;
pub use error::{Error, Result};
pub use types::*;

// Public modules
pub mod canonical;
pub mod collector;
pub mod config;
pub mod context;
pub mod db;
pub mod error;
pub mod hashing;
pub mod logging;
pub mod parse;
pub mod pipeline;
pub mod types;
pub mod watch;
pub mod worker;
