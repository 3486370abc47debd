//! Per-process application context
//!
//! The parser registry and daemon manager are not globals: one
//! [`AppContext`] is constructed at startup and passed explicitly.
//! External parser plugins are registered at construction time; a
//! plugin named in config but not provided (or failing validation)
//! logs a warning and is skipped, never aborting startup.

use crate::config::Config;
use crate::db::Database;
use crate::error::Result;
use crate::parse::{ParserPlugin, ParserRegistry};
use crate::watch::DaemonManager;
use std::path::PathBuf;

pub struct AppContext {
    pub config: Config,
    pub db_path: PathBuf,
    pub registry: ParserRegistry,
    pub daemon_manager: DaemonManager,
}

impl AppContext {
    /// Context with the built-in parsers only.
    pub fn new(config: Config, db_path: PathBuf) -> Self {
        Self::with_plugins(config, db_path, &[])
    }

    /// Context with built-ins plus the subset of `available_plugins`
    /// enabled by `config.ingest.parser_plugins`.
    pub fn with_plugins(config: Config, db_path: PathBuf, available_plugins: &[ParserPlugin]) -> Self {
        let mut registry = ParserRegistry::with_builtins();

        for name in &config.ingest.parser_plugins {
            match available_plugins.iter().find(|p| p.manifest.name == *name) {
                Some(plugin) => registry.register_plugin(plugin),
                None => {
                    tracing::warn!(
                        plugin = %name,
                        "Configured parser plugin not available; skipped"
                    );
                }
            }
        }

        let daemon_manager = DaemonManager::new(db_path.clone(), config.watch.clone());

        Self {
            config,
            db_path,
            registry,
            daemon_manager,
        }
    }

    /// Open a database handle at the context's path and run migrations.
    pub fn open_database(&self) -> Result<Database> {
        let db = Database::open(&self.db_path)?;
        db.migrate()?;
        Ok(db)
    }
}
