//! Extension package installer.
//!
//! Packages are zip archives with `extension.toml` at the root. Installing:
//! 1. Read only the manifest entry and validate it
//! 2. Check the entry module is present in the archive
//! 3. Refuse unless strictly newer than what is installed
//! 4. Extract into a staging directory under the install root
//! 5. Replace `<root>/<package_name>` with the staging directory

use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};

use soundtime_ext_core::manifest::validate_path_safety;
use soundtime_ext_core::{ExtensionManifest, ExtensionVersion, MANIFEST_FILE};

use crate::error::{InstallError, InstallResult};

/// Largest manifest accepted from an archive.
const MAX_MANIFEST_SIZE: u64 = 64 * 1024;

/// Installs and removes extension packages under one install root.
#[derive(Debug, Clone)]
pub struct PackageInstaller {
    install_root: PathBuf,
}

impl PackageInstaller {
    pub fn new(install_root: impl Into<PathBuf>) -> Self {
        Self {
            install_root: install_root.into(),
        }
    }

    pub fn install_root(&self) -> &Path {
        &self.install_root
    }

    /// Install the first valid package among `candidates`.
    ///
    /// Candidates whose manifest does not validate are skipped. Never fails:
    /// every error comes back as an unsuccessful [`InstallResult`].
    pub async fn install(&self, candidates: &[PathBuf]) -> InstallResult {
        let mut last_error = None;

        for archive in candidates {
            let manifest = match read_manifest(archive.clone()).await {
                Ok(manifest) => manifest,
                Err(e) => {
                    tracing::warn!(archive = %archive.display(), "skipping package: {e}");
                    last_error = Some(e);
                    continue;
                }
            };

            let package_name = manifest.package_name.clone();
            let version = manifest.version.clone();
            return match self.install_package(archive, manifest).await {
                Ok(()) => {
                    tracing::info!(
                        package_name = %package_name,
                        version = %version,
                        "extension installed"
                    );
                    InstallResult::ok(&package_name, format!("installed {package_name} {version}"))
                }
                Err(e) => {
                    tracing::warn!(package_name = %package_name, "install refused: {e}");
                    InstallResult::failed(&e)
                }
            };
        }

        let err = last_error
            .unwrap_or_else(|| InstallError::Validation("no package candidates given".into()));
        InstallResult::failed(&err)
    }

    /// Version of the installed copy of `package_name`, if any.
    pub async fn installed_version(&self, package_name: &str) -> Option<ExtensionVersion> {
        let path = self.install_root.join(package_name).join(MANIFEST_FILE);
        let content = tokio::fs::read_to_string(&path).await.ok()?;
        match ExtensionManifest::parse(&content) {
            Ok(manifest) => Some(manifest.version),
            Err(e) => {
                tracing::warn!(path = %path.display(), "installed manifest unreadable: {e}");
                None
            }
        }
    }

    async fn install_package(
        &self,
        archive: &Path,
        manifest: ExtensionManifest,
    ) -> Result<(), InstallError> {
        if let Some(installed) = self.installed_version(&manifest.package_name).await {
            if !manifest.version.is_newer_than(&installed) {
                return Err(InstallError::Duplicate {
                    package_name: manifest.package_name,
                    installed: installed.to_string(),
                    candidate: manifest.version.to_string(),
                });
            }
        }

        tokio::fs::create_dir_all(&self.install_root).await?;
        let staging = tempfile::Builder::new()
            .prefix(".staging-")
            .tempdir_in(&self.install_root)?;

        let archive_path = archive.to_path_buf();
        let staging_path = staging.path().to_path_buf();
        tokio::task::spawn_blocking(move || extract(&archive_path, &staging_path))
            .await
            .map_err(|e| InstallError::Filesystem(std::io::Error::other(e)))??;

        let target = self.install_root.join(&manifest.package_name);
        if tokio::fs::try_exists(&target).await? {
            tokio::fs::remove_dir_all(&target).await?;
            tracing::debug!(target = %target.display(), "removed previous install");
        }
        // `staging` is dropped afterwards; its cleanup finds nothing left.
        tokio::fs::rename(staging.path(), &target).await?;
        Ok(())
    }

    /// Remove an installed package. Removing an absent package succeeds.
    pub async fn uninstall(&self, package_name: &str) -> InstallResult {
        match self.remove_package(package_name).await {
            Ok(true) => {
                tracing::info!(package_name = %package_name, "extension uninstalled");
                InstallResult::ok(package_name, format!("uninstalled {package_name}"))
            }
            Ok(false) => InstallResult::ok(package_name, format!("{package_name} is not installed")),
            Err(e) => InstallResult::failed(&e),
        }
    }

    async fn remove_package(&self, package_name: &str) -> Result<bool, InstallError> {
        validate_path_safety(package_name, "package_name")?;
        if package_name.contains(['/', '\\']) {
            return Err(InstallError::Validation(format!(
                "invalid package name '{package_name}'"
            )));
        }

        let target = self.install_root.join(package_name);
        if !tokio::fs::try_exists(&target).await? {
            return Ok(false);
        }
        tokio::fs::remove_dir_all(&target).await?;
        Ok(true)
    }
}

// ─── Archive access (blocking) ──────────────────────────────────────────

/// Read and validate the manifest without extracting anything else.
pub async fn read_manifest(archive: PathBuf) -> Result<ExtensionManifest, InstallError> {
    tokio::task::spawn_blocking(move || read_manifest_blocking(&archive))
        .await
        .map_err(|e| InstallError::Filesystem(std::io::Error::other(e)))?
}

fn read_manifest_blocking(archive: &Path) -> Result<ExtensionManifest, InstallError> {
    let mut zip = zip::ZipArchive::new(File::open(archive)?)?;

    let content = {
        let entry = match zip.by_name(MANIFEST_FILE) {
            Ok(entry) => entry,
            Err(zip::result::ZipError::FileNotFound) => {
                return Err(InstallError::Validation(format!(
                    "{MANIFEST_FILE} not found in archive"
                )))
            }
            Err(e) => return Err(e.into()),
        };
        if entry.size() > MAX_MANIFEST_SIZE {
            return Err(InstallError::Validation(format!(
                "{MANIFEST_FILE} too large: {} bytes",
                entry.size()
            )));
        }
        let mut content = String::new();
        entry.take(MAX_MANIFEST_SIZE).read_to_string(&mut content)?;
        content
    };

    let manifest = ExtensionManifest::parse(&content)?;

    let entry_name = manifest.entry.trim_start_matches("./");
    if zip.by_name(entry_name).is_err() {
        return Err(InstallError::Validation(format!(
            "entry '{}' not found in archive",
            manifest.entry
        )));
    }
    Ok(manifest)
}

fn extract(archive: &Path, dest: &Path) -> Result<(), InstallError> {
    let mut zip = zip::ZipArchive::new(File::open(archive)?)?;

    for i in 0..zip.len() {
        let mut file = zip.by_index(i)?;
        let Some(relative) = file.enclosed_name().map(|p| p.to_path_buf()) else {
            return Err(InstallError::Validation(format!(
                "archive entry '{}' escapes the package directory",
                file.name()
            )));
        };
        let out_path = dest.join(relative);

        if file.is_dir() {
            std::fs::create_dir_all(&out_path)?;
            continue;
        }
        if let Some(parent) = out_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut out = File::create(&out_path)?;
        std::io::copy(&mut file, &mut out)?;
    }
    Ok(())
}

// ─── Tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn manifest(package_name: &str, version: &str) -> String {
        format!(
            "soundtime_extension = true\n\
             package_name = \"{package_name}\"\n\
             display_name = \"Demo\"\n\
             version = \"{version}\"\n\
             entry = \"main.wasm\"\n"
        )
    }

    fn write_zip(dir: &Path, name: &str, files: &[(&str, &[u8])]) -> PathBuf {
        let path = dir.join(name);
        let mut writer = zip::ZipWriter::new(File::create(&path).unwrap());
        let options =
            zip::write::FileOptions::default().compression_method(zip::CompressionMethod::Stored);
        for (file_name, content) in files {
            writer.start_file(*file_name, options).unwrap();
            writer.write_all(content).unwrap();
        }
        writer.finish().unwrap();
        path
    }

    fn package(dir: &Path, name: &str, package_name: &str, version: &str) -> PathBuf {
        let toml = manifest(package_name, version);
        write_zip(
            dir,
            name,
            &[
                (MANIFEST_FILE, toml.as_bytes()),
                ("main.wasm", b"\0asm\x01\0\0\0"),
                ("assets/icon.png", b"png"),
            ],
        )
    }

    #[tokio::test]
    async fn test_install_fresh_package() {
        let work = tempfile::tempdir().unwrap();
        let root = tempfile::tempdir().unwrap();
        let installer = PackageInstaller::new(root.path());

        let archive = package(work.path(), "demo.zip", "demo-ext", "1.0.0");
        let result = installer.install(&[archive]).await;
        assert!(result.success, "{}", result.message);
        assert_eq!(result.package_name.as_deref(), Some("demo-ext"));

        let dir = root.path().join("demo-ext");
        assert!(dir.join(MANIFEST_FILE).exists());
        assert!(dir.join("assets/icon.png").exists());
        assert_eq!(
            installer.installed_version("demo-ext").await.unwrap().as_str(),
            "1.0.0"
        );
        // staging directory is gone
        let leftovers: Vec<_> = std::fs::read_dir(root.path()).unwrap().collect();
        assert_eq!(leftovers.len(), 1);
    }

    #[tokio::test]
    async fn test_version_gate() {
        let work = tempfile::tempdir().unwrap();
        let root = tempfile::tempdir().unwrap();
        let installer = PackageInstaller::new(root.path());

        let v19 = package(work.path(), "a.zip", "demo-ext", "1.9.0");
        assert!(installer.install(&[v19]).await.success);

        // 1.10.0 is newer than 1.9.0
        let v110 = package(work.path(), "b.zip", "demo-ext", "1.10.0");
        assert!(installer.install(&[v110]).await.success);

        let v110_again = package(work.path(), "c.zip", "demo-ext", "1.10.0");
        let result = installer.install(&[v110_again]).await;
        assert!(!result.success);
        assert!(result.message.contains("already installed"));

        let older = package(work.path(), "d.zip", "demo-ext", "1.0.0");
        assert!(!installer.install(&[older]).await.success);
        assert_eq!(
            installer.installed_version("demo-ext").await.unwrap().as_str(),
            "1.10.0"
        );
    }

    #[tokio::test]
    async fn test_upgrade_removes_old_files() {
        let work = tempfile::tempdir().unwrap();
        let root = tempfile::tempdir().unwrap();
        let installer = PackageInstaller::new(root.path());

        let v1 = package(work.path(), "v1.zip", "demo-ext", "1.0.0");
        installer.install(&[v1]).await;
        std::fs::write(root.path().join("demo-ext/stale.txt"), "old").unwrap();

        let v2 = package(work.path(), "v2.zip", "demo-ext", "2.0.0");
        assert!(installer.install(&[v2]).await.success);
        assert!(!root.path().join("demo-ext/stale.txt").exists());
    }

    #[tokio::test]
    async fn test_invalid_candidates_fall_through() {
        let work = tempfile::tempdir().unwrap();
        let root = tempfile::tempdir().unwrap();
        let installer = PackageInstaller::new(root.path());

        let no_manifest = write_zip(work.path(), "x.zip", &[("main.wasm", b"\0asm")]);
        let missing_entry = write_zip(
            work.path(),
            "y.zip",
            &[(MANIFEST_FILE, manifest("demo-ext", "1.0.0").as_bytes())],
        );
        let not_zip = work.path().join("z.zip");
        std::fs::write(&not_zip, "plain text").unwrap();

        let result = installer
            .install(&[no_manifest.clone(), missing_entry.clone(), not_zip.clone()])
            .await;
        assert!(!result.success);

        let good = package(work.path(), "good.zip", "demo-ext", "1.0.0");
        let result = installer
            .install(&[no_manifest, missing_entry, not_zip, good])
            .await;
        assert!(result.success, "{}", result.message);
    }

    #[tokio::test]
    async fn test_manifest_errors_are_validation() {
        let work = tempfile::tempdir().unwrap();
        let missing_entry = write_zip(
            work.path(),
            "y.zip",
            &[(MANIFEST_FILE, manifest("demo-ext", "1.0.0").as_bytes())],
        );
        let err = read_manifest(missing_entry).await.unwrap_err();
        assert!(matches!(err, InstallError::Validation(_)));
        assert!(err.to_string().contains("main.wasm"));

        let bad = write_zip(
            work.path(),
            "bad.zip",
            &[(MANIFEST_FILE, b"package_name = \"x\"\n".as_slice())],
        );
        assert!(matches!(
            read_manifest(bad).await.unwrap_err(),
            InstallError::Validation(_)
        ));
    }

    #[tokio::test]
    async fn test_uninstall_is_idempotent() {
        let work = tempfile::tempdir().unwrap();
        let root = tempfile::tempdir().unwrap();
        let installer = PackageInstaller::new(root.path());
        installer
            .install(&[package(work.path(), "p.zip", "demo-ext", "1.0.0")])
            .await;

        assert!(installer.uninstall("demo-ext").await.success);
        assert!(!root.path().join("demo-ext").exists());
        assert!(installer.uninstall("demo-ext").await.success);

        let result = installer.uninstall("../etc").await;
        assert!(!result.success);
    }
}
