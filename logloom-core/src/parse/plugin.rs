//! External parser plugins
//!
//! Parsers beyond the built-ins are contributed through a
//! [`PluginManifest`] plus a factory. Manifests are validated before
//! registration; an invalid manifest logs a warning and is skipped,
//! never aborting startup.

use crate::error::{Error, Result};
use crate::parse::parser::{normalize_extension, LogParser};
use serde::Deserialize;

/// Declarative description of an external parser plugin.
#[derive(Debug, Clone, Deserialize)]
pub struct PluginManifest {
    /// Lowercase kebab-case plugin name
    pub name: String,
    /// Semantic version (`MAJOR.MINOR.PATCH`)
    pub version: String,
    /// Human description, 10–500 chars
    pub description: String,
    /// Supported extensions; normalized on validation
    #[serde(default)]
    pub supported_extensions: Vec<String>,
    #[serde(default)]
    pub dependencies: Vec<String>,
    #[serde(default)]
    pub homepage: Option<String>,
    #[serde(default)]
    pub license: Option<String>,
}

impl PluginManifest {
    /// Validate the manifest and normalize its extensions in place.
    pub fn validate(&mut self) -> Result<()> {
        if self.name.is_empty()
            || !self
                .name
                .chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
            || self.name.starts_with('-')
            || self.name.ends_with('-')
        {
            return Err(Error::InvalidArgument(format!(
                "plugin name must be lowercase kebab-case, got {:?}",
                self.name
            )));
        }

        if !is_semver(&self.version) {
            return Err(Error::InvalidArgument(format!(
                "plugin version must be semantic (MAJOR.MINOR.PATCH), got {:?}",
                self.version
            )));
        }

        let desc_len = self.description.chars().count();
        if !(10..=500).contains(&desc_len) {
            return Err(Error::InvalidArgument(format!(
                "plugin description must be 10-500 chars, got {}",
                desc_len
            )));
        }

        self.supported_extensions = self
            .supported_extensions
            .iter()
            .map(|e| normalize_extension(e))
            .collect();

        Ok(())
    }
}

fn is_semver(version: &str) -> bool {
    let parts: Vec<&str> = version.split('.').collect();
    parts.len() == 3 && parts.iter().all(|p| !p.is_empty() && p.chars().all(|c| c.is_ascii_digit()))
}

/// A validated manifest bundled with its parser factory.
pub struct ParserPlugin {
    pub manifest: PluginManifest,
    factory: Box<dyn Fn() -> Box<dyn LogParser> + Send + Sync>,
}

impl ParserPlugin {
    /// Build a plugin, validating (and normalizing) the manifest.
    pub fn new<F>(mut manifest: PluginManifest, factory: F) -> Result<Self>
    where
        F: Fn() -> Box<dyn LogParser> + Send + Sync + 'static,
    {
        manifest.validate()?;
        Ok(Self {
            manifest,
            factory: Box::new(factory),
        })
    }

    pub fn instantiate(&self) -> Box<dyn LogParser> {
        (self.factory)()
    }
}
