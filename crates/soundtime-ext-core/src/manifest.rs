//! Extension manifest parsing and validation.
//!
//! Every package carries an `extension.toml` at its root:
//!
//! ```toml
//! soundtime_extension = true
//! package_name = "demo-ext"
//! display_name = "Demo extension"
//! version = "1.0.0"
//! entry = "demo.wasm"
//! description = "Example provider"
//! author = "Jane Doe"
//! icon = "icon.png"
//! ```

use serde::{Deserialize, Serialize};

use crate::error::ManifestError;
use crate::version::ExtensionVersion;

/// File name of the manifest inside a package.
pub const MANIFEST_FILE: &str = "extension.toml";

/// Manifest as written on disk. Required fields are optional here so that a
/// missing one is reported as a validation failure, not a parse error.
#[derive(Debug, Default, Deserialize)]
struct RawManifest {
    #[serde(default)]
    soundtime_extension: bool,
    package_name: Option<String>,
    display_name: Option<String>,
    version: Option<String>,
    entry: Option<String>,
    description: Option<String>,
    author: Option<String>,
    icon: Option<String>,
}

/// A validated extension manifest.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExtensionManifest {
    pub package_name: String,
    pub display_name: String,
    pub version: ExtensionVersion,
    /// Entry module, relative to the install directory.
    pub entry: String,
    pub description: Option<String>,
    pub author: Option<String>,
    /// Icon file, relative to the install directory.
    pub icon: Option<String>,
}

// ─── Validation helpers ─────────────────────────────────────────────────

/// Package names follow `^[a-z][a-z0-9._-]{1,127}$`; they double as install
/// directory names and id prefixes.
fn validate_package_name(name: &str) -> Result<(), ManifestError> {
    let len = name.len();
    if !(2..=128).contains(&len) {
        return Err(ManifestError::Validation(format!(
            "package_name must be 2-128 characters, got {len}"
        )));
    }

    let mut chars = name.chars();
    if let Some(first) = chars.next() {
        if !first.is_ascii_lowercase() {
            return Err(ManifestError::Validation(format!(
                "package_name must start with a lowercase letter, got '{first}'"
            )));
        }
    }

    for ch in chars {
        if !(ch.is_ascii_lowercase() || ch.is_ascii_digit() || matches!(ch, '-' | '_' | '.')) {
            return Err(ManifestError::Validation(format!(
                "package_name contains invalid character '{ch}'"
            )));
        }
    }

    // ':' is excluded above; it separates the prefix from the original id.
    Ok(())
}

/// Validate that a path is safe (no `..` components, not absolute).
pub fn validate_path_safety(path: &str, field_name: &str) -> Result<(), ManifestError> {
    let p = std::path::Path::new(path);
    if path.is_empty() {
        return Err(ManifestError::Validation(format!(
            "{field_name} must not be empty"
        )));
    }
    if p.is_absolute() {
        return Err(ManifestError::Validation(format!(
            "{field_name} must be a relative path, got absolute: '{path}'"
        )));
    }
    for component in p.components() {
        if matches!(component, std::path::Component::ParentDir) {
            return Err(ManifestError::Validation(format!(
                "{field_name} must not contain '..': '{path}'"
            )));
        }
    }
    Ok(())
}

fn required(value: Option<String>, field_name: &str) -> Result<String, ManifestError> {
    match value {
        Some(v) if !v.trim().is_empty() => Ok(v),
        _ => Err(ManifestError::Validation(format!("{field_name} is required"))),
    }
}

fn bounded(value: &Option<String>, field_name: &str, max: usize) -> Result<(), ManifestError> {
    if let Some(v) = value {
        if v.len() > max {
            return Err(ManifestError::Validation(format!(
                "{field_name} must be at most {max} characters, got {}",
                v.len()
            )));
        }
    }
    Ok(())
}

impl ExtensionManifest {
    /// Parse and validate a manifest from TOML.
    pub fn parse(toml_str: &str) -> Result<Self, ManifestError> {
        let raw: RawManifest = toml::from_str(toml_str)?;
        Self::validate(raw)
    }

    fn validate(raw: RawManifest) -> Result<Self, ManifestError> {
        if !raw.soundtime_extension {
            return Err(ManifestError::Validation(
                "not a SoundTime extension package (soundtime_extension = true missing)".into(),
            ));
        }

        let package_name = required(raw.package_name, "package_name")?;
        validate_package_name(&package_name)?;

        let display_name = required(raw.display_name, "display_name")?;
        if display_name.len() > 255 {
            return Err(ManifestError::Validation(format!(
                "display_name must be at most 255 characters, got {}",
                display_name.len()
            )));
        }

        let version = ExtensionVersion::parse(&required(raw.version, "version")?)?;

        let entry = required(raw.entry, "entry")?;
        validate_path_safety(&entry, "entry")?;

        if let Some(ref icon) = raw.icon {
            validate_path_safety(icon, "icon")?;
        }
        bounded(&raw.description, "description", 500)?;
        bounded(&raw.author, "author", 255)?;

        Ok(Self {
            package_name,
            display_name,
            version,
            entry,
            description: raw.description,
            author: raw.author,
            icon: raw.icon,
        })
    }
}

// ─── Tests ──────────────────────────────────────────────────────────────
