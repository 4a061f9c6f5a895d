//! Scanning the search paths for installed extensions.

use std::path::{Path, PathBuf};

use soundtime_ext_core::{ExtensionManifest, MANIFEST_FILE};

use crate::error::SandboxError;

/// An installed extension found on disk, not yet loaded.
#[derive(Debug, Clone)]
pub struct DiscoveredExtension {
    pub manifest: ExtensionManifest,
    /// Canonical install directory.
    pub extension_path: PathBuf,
    /// Canonical entry module path, guaranteed to lie under `extension_path`.
    pub entry: PathBuf,
    pub icon: Option<PathBuf>,
}

/// Scan every immediate subdirectory of each search path.
///
/// Broken packages are logged and skipped; a missing search path is not an
/// error. When the same package appears twice the first one wins.
pub async fn discover(search_paths: &[PathBuf]) -> Vec<DiscoveredExtension> {
    let mut found: Vec<DiscoveredExtension> = Vec::new();

    for search_path in search_paths {
        let mut entries = match tokio::fs::read_dir(search_path).await {
            Ok(entries) => entries,
            Err(e) => {
                tracing::debug!(path = %search_path.display(), "skipping search path: {e}");
                continue;
            }
        };

        loop {
            let entry = match entries.next_entry().await {
                Ok(Some(entry)) => entry,
                Ok(None) => break,
                Err(e) => {
                    tracing::warn!(path = %search_path.display(), "failed to read directory: {e}");
                    break;
                }
            };
            let dir = entry.path();
            if !entry.file_type().await.is_ok_and(|t| t.is_dir()) {
                continue;
            }

            match inspect(&dir).await {
                Ok(ext) => {
                    if found
                        .iter()
                        .any(|f| f.manifest.package_name == ext.manifest.package_name)
                    {
                        tracing::warn!(
                            package_name = %ext.manifest.package_name,
                            path = %dir.display(),
                            "duplicate package on search path, ignoring"
                        );
                        continue;
                    }
                    found.push(ext);
                }
                Err(e) => {
                    tracing::warn!(path = %dir.display(), "skipping extension directory: {e}");
                }
            }
        }
    }

    found.sort_by(|a, b| a.manifest.package_name.cmp(&b.manifest.package_name));
    found
}

/// Read and validate one install directory.
pub async fn inspect(dir: &Path) -> Result<DiscoveredExtension, SandboxError> {
    let manifest_str = tokio::fs::read_to_string(dir.join(MANIFEST_FILE)).await?;
    let manifest = ExtensionManifest::parse(&manifest_str)?;

    let extension_path = tokio::fs::canonicalize(dir).await?;
    let entry = tokio::fs::canonicalize(extension_path.join(&manifest.entry))
        .await
        .map_err(|e| SandboxError::load(&manifest.package_name, format!("entry '{}': {e}", manifest.entry)))?;
    // Symlinks could still point outside.
    if !entry.starts_with(&extension_path) {
        return Err(SandboxError::load(
            &manifest.package_name,
            "entry resolves outside the extension directory",
        ));
    }

    let icon = match &manifest.icon {
        Some(icon) => match tokio::fs::canonicalize(extension_path.join(icon)).await {
            Ok(path) if path.starts_with(&extension_path) => Some(path),
            _ => {
                tracing::debug!(package_name = %manifest.package_name, "icon not found, ignoring");
                None
            }
        },
        None => None,
    };

    Ok(DiscoveredExtension {
        manifest,
        extension_path,
        entry,
        icon,
    })
}
