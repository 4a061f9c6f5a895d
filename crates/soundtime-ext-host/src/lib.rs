//! SoundTime extension host: application side.
//!
//! [`ExtensionHost`] supervises the sandbox process: it spawns it on first
//! use, respawns it transparently after a crash, routes the requests
//! extensions make to the UI, library and preference collaborators, and
//! shuts it down gracefully. [`PackageInstaller`] manages the on-disk
//! install root.

pub mod collaborator;
pub mod config;
pub mod controller;
pub mod error;
pub mod installer;
pub mod launcher;
pub mod state;
pub mod ui;

pub use collaborator::{Collaborator, Unavailable};
pub use config::HostConfig;
pub use controller::{Collaborators, ExtensionHost};
pub use error::{HostError, InstallError, InstallResult};
pub use installer::PackageInstaller;
pub use launcher::{LaunchParams, ProcessExit, ProcessLauncher, SandboxHandle, SandboxLauncher};
pub use state::{SandboxState, Transition};
pub use ui::DeferredUi;
