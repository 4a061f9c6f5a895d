//! Extension registry: the set of extensions loaded in this sandbox.
//!
//! Entries are kept in load order so fan-out and listings are stable.
//! The registry only tracks state; starting and stopping (which run hooks)
//! is driven by the runtime.

use std::path::PathBuf;
use std::sync::Arc;

use soundtime_ext_core::{ExtensionDetails, ExtensionVersion};

use crate::capability::Capability;
use crate::context::ExtensionInstance;
use crate::error::SandboxError;

// ─── Loaded extension ───────────────────────────────────────────────────

/// A loaded extension with its instance and metadata.
pub struct LoadedExtension {
    pub package_name: String,
    pub display_name: String,
    pub version: ExtensionVersion,
    pub description: Option<String>,
    pub author: Option<String>,
    /// Canonical path of the entry module.
    pub entry: PathBuf,
    /// Install directory.
    pub extension_path: PathBuf,
    pub icon: Option<PathBuf>,
    /// Whether lifecycle `on_started` has run and `on_stopped` has not.
    pub started: bool,
    pub instance: Box<dyn ExtensionInstance>,
    pub capability: Arc<Capability>,
}

impl std::fmt::Debug for LoadedExtension {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoadedExtension")
            .field("package_name", &self.package_name)
            .field("version", &self.version)
            .field("started", &self.started)
            .finish_non_exhaustive()
    }
}

impl LoadedExtension {
    pub fn details(&self) -> ExtensionDetails {
        ExtensionDetails {
            package_name: self.package_name.clone(),
            name: self.display_name.clone(),
            desc: self.description.clone(),
            author: self.author.clone(),
            version: self.version.to_string(),
            has_started: self.started,
            entry: self.entry.to_string_lossy().into_owned(),
            preferences: self.capability.preferences(),
            extension_path: self.extension_path.to_string_lossy().into_owned(),
            extension_icon: self
                .icon
                .as_ref()
                .map(|p| p.to_string_lossy().into_owned()),
        }
    }
}

/// Selects registry entries. Unset fields match everything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RegistryFilter {
    pub package_name: Option<String>,
    pub started: Option<bool>,
}

impl RegistryFilter {
    pub fn package(package_name: impl Into<String>) -> Self {
        Self {
            package_name: Some(package_name.into()),
            started: None,
        }
    }

    pub fn started() -> Self {
        Self {
            package_name: None,
            started: Some(true),
        }
    }

    fn matches(&self, ext: &LoadedExtension) -> bool {
        self.package_name
            .as_deref()
            .is_none_or(|name| name == ext.package_name)
            && self.started.is_none_or(|started| started == ext.started)
    }
}

// ─── Registry ───────────────────────────────────────────────────────────

#[derive(Debug, Default)]
pub struct ExtensionRegistry {
    extensions: Vec<LoadedExtension>,
}

impl ExtensionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a freshly loaded extension. Package names are unique.
    pub fn register(&mut self, extension: LoadedExtension) -> Result<(), SandboxError> {
        if self.contains(&extension.package_name) {
            return Err(SandboxError::AlreadyRegistered(extension.package_name));
        }
        tracing::debug!(
            package_name = %extension.package_name,
            version = %extension.version,
            "extension registered"
        );
        self.extensions.push(extension);
        Ok(())
    }

    /// Remove and return an extension. The caller is responsible for having
    /// stopped it.
    pub fn deregister(&mut self, package_name: &str) -> Option<LoadedExtension> {
        let idx = self
            .extensions
            .iter()
            .position(|e| e.package_name == package_name)?;
        Some(self.extensions.remove(idx))
    }

    pub fn query<'a>(
        &'a self,
        filter: &'a RegistryFilter,
    ) -> impl Iterator<Item = &'a LoadedExtension> + 'a {
        self.extensions.iter().filter(move |e| filter.matches(e))
    }

    /// Package names matching `filter`, in load order.
    pub fn names(&self, filter: &RegistryFilter) -> Vec<String> {
        self.query(filter).map(|e| e.package_name.clone()).collect()
    }

    pub fn get(&self, package_name: &str) -> Option<&LoadedExtension> {
        self.extensions.iter().find(|e| e.package_name == package_name)
    }

    pub fn get_mut(&mut self, package_name: &str) -> Option<&mut LoadedExtension> {
        self.extensions
            .iter_mut()
            .find(|e| e.package_name == package_name)
    }

    pub fn contains(&self, package_name: &str) -> bool {
        self.get(package_name).is_some()
    }

    pub fn is_started(&self, package_name: &str) -> bool {
        self.get(package_name).is_some_and(|e| e.started)
    }

    pub fn set_started(&mut self, package_name: &str, started: bool) -> Result<(), SandboxError> {
        let ext = self
            .get_mut(package_name)
            .ok_or_else(|| SandboxError::NotFound(package_name.to_string()))?;
        ext.started = started;
        Ok(())
    }

    pub fn details(&self, filter: &RegistryFilter) -> Vec<ExtensionDetails> {
        self.query(filter).map(LoadedExtension::details).collect()
    }

    pub fn len(&self) -> usize {
        self.extensions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.extensions.is_empty()
    }
}
