//! Ingest plugin registry
//!
//! Maps URI schemes to registered plugins. The global registry is lazily
//! initialized with the built-in file plugin; protocol adapters register
//! themselves at startup.

use super::{IngestConfig, IngestPlugin, IngestSource};
use crate::Error;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::{Arc, OnceLock};

/// Registry for ingest plugins, indexed by name and by scheme
#[derive(Default)]
pub struct IngestRegistry {
    plugins: RwLock<HashMap<String, Arc<dyn IngestPlugin>>>,
    schemes: RwLock<HashMap<String, String>>,
}

impl IngestRegistry {
    /// New empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a plugin and index its schemes.
    ///
    /// Duplicate plugin names fail; a scheme collision logs a warning and
    /// the newer plugin wins.
    pub fn register(&self, plugin: Arc<dyn IngestPlugin>) -> Result<(), Error> {
        let name = plugin.name().to_string();
        let mut plugins = self.plugins.write();
        if plugins.contains_key(&name) {
            return Err(Error::Config(format!(
                "ingest plugin '{name}' is already registered"
            )));
        }

        let mut schemes = self.schemes.write();
        for scheme in plugin.schemes() {
            let key = scheme.to_lowercase();
            if let Some(previous) = schemes.insert(key.clone(), name.clone()) {
                tracing::warn!(
                    scheme = %scheme,
                    previous = %previous,
                    replacement = %name,
                    "ingest scheme re-registered"
                );
            }
        }
        plugins.insert(name, plugin);
        Ok(())
    }

    /// Create a source for a URI, validating the config first
    pub fn create_from_uri(&self, config: &IngestConfig) -> Result<Box<dyn IngestSource>, Error> {
        let scheme = extract_scheme(&config.url);
        let plugin = {
            let schemes = self.schemes.read();
            let name = schemes.get(&scheme).ok_or_else(|| {
                let mut available: Vec<_> = schemes.keys().cloned().collect();
                available.sort();
                Error::Ingestion(format!(
                    "no ingest plugin for scheme '{scheme}' (available: {available:?})"
                ))
            })?;
            let plugins = self.plugins.read();
            Arc::clone(plugins.get(name).expect("scheme index references plugin"))
        };
        plugin.validate(config)?;
        plugin.create(config)
    }

    /// Registered plugin names
    pub fn list_plugins(&self) -> Vec<String> {
        let mut names: Vec<_> = self.plugins.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// Registered schemes
    pub fn list_schemes(&self) -> Vec<String> {
        let mut schemes: Vec<_> = self.schemes.read().keys().cloned().collect();
        schemes.sort();
        schemes
    }

    /// Whether a scheme is handled
    pub fn accepts_scheme(&self, scheme: &str) -> bool {
        self.schemes.read().contains_key(&scheme.to_lowercase())
    }
}

/// Global registry with the file plugin pre-registered
pub fn global_ingest_registry() -> &'static IngestRegistry {
    static GLOBAL: OnceLock<IngestRegistry> = OnceLock::new();
    GLOBAL.get_or_init(|| {
        let registry = IngestRegistry::new();
        registry
            .register(Arc::new(super::file::FileIngestPlugin))
            .expect("fresh registry has no clashes");
        registry
    })
}

/// Extract the URI scheme.
///
/// `scheme://…` and `scheme:…` yield the lowercased scheme; `-` is stdin;
/// bare paths (including Windows drive letters) yield `""`.
pub fn extract_scheme(url: &str) -> String {
    if url == "-" {
        return "-".to_string();
    }
    if let Some(colon) = url.find(':') {
        let candidate = &url[..colon];
        if candidate.len() > 1
            && candidate
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '+' || c == '-' || c == '.')
        {
            return candidate.to_lowercase();
        }
    }
    String::new()
}
