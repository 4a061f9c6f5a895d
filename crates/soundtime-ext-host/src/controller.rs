//! Host controller: owns the sandbox session and exposes the typed API.
//!
//! There is at most one live sandbox per [`ExtensionHost`]. Callers never
//! hold the sandbox's endpoint; every call resolves the current one through
//! [`ensure_alive`], which spawns (or respawns) the sandbox when needed. A
//! watcher task per session notices process death, fails everything still
//! outstanding and respawns eagerly unless the host is closing.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde_json::{json, Map, Value};
use soundtime_ext_core::{
    AccountDetails, ContextMenuItem, ContextMenuType, Endpoint, EndpointConfig, ExtensionDetails,
    ExtraEventRequest, Inbound, MessageType, PreferenceDescriptor, Request, Route,
};
use tokio::sync::{mpsc, oneshot};

use crate::collaborator::{Collaborator, Unavailable};
use crate::config::HostConfig;
use crate::error::{HostError, InstallResult};
use crate::installer::PackageInstaller;
use crate::launcher::{LaunchParams, ProcessExit, ProcessLauncher, SandboxLauncher};
use crate::state::{SandboxState, Transition};
use crate::ui::DeferredUi;

/// How long to wait for an exit status once the transport has closed.
const EXIT_STATUS_WAIT: Duration = Duration::from_secs(1);

// ─── Collaborators ──────────────────────────────────────────────────────

/// Receivers for sandbox-originated library and preference requests.
/// Missing ones answer every request with an error.
#[derive(Clone)]
pub struct Collaborators {
    pub library: Arc<dyn Collaborator>,
    pub preferences: Arc<dyn Collaborator>,
}

impl Default for Collaborators {
    fn default() -> Self {
        Self {
            library: Arc::new(Unavailable("library")),
            preferences: Arc::new(Unavailable("preference store")),
        }
    }
}

impl Collaborators {
    pub fn with_library(mut self, library: Arc<dyn Collaborator>) -> Self {
        self.library = library;
        self
    }

    pub fn with_preferences(mut self, preferences: Arc<dyn Collaborator>) -> Self {
        self.preferences = preferences;
        self
    }
}

// ─── Session ────────────────────────────────────────────────────────────

#[derive(Default)]
struct Session {
    endpoint: Option<Endpoint>,
    kill: Option<oneshot::Sender<()>>,
    /// Bumped on every spawn and on close; a watcher only acts on the
    /// session it was started for.
    generation: u64,
}

struct Inner {
    config: HostConfig,
    launcher: Arc<dyn SandboxLauncher>,
    session: tokio::sync::Mutex<Session>,
    state: Mutex<SandboxState>,
    spawn_count: AtomicU64,
    ui: DeferredUi,
    collaborators: Collaborators,
    installer: PackageInstaller,
}

impl Inner {
    fn lock_state(&self) -> MutexGuard<'_, SandboxState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn transition(&self, transition: Transition) -> SandboxState {
        let mut state = self.lock_state();
        let next = state.apply(transition);
        if next != *state {
            tracing::debug!(from = %*state, to = %next, ?transition, "sandbox state changed");
            *state = next;
        }
        next
    }

    /// Answer a request the sandbox sent on behalf of an extension.
    async fn forward(&self, request: Request) -> Result<Value, String> {
        match request.message_type.route() {
            Route::Ui => self.ui.dispatch(request).await,
            Route::Library => self.collaborators.library.handle(request).await,
            Route::Preferences => self.collaborators.preferences.handle(request).await,
            Route::Sandbox => Err(format!(
                "{:?} is answered by the sandbox, not the host",
                request.message_type
            )),
        }
    }
}

/// Resolve the live sandbox endpoint, spawning a sandbox if there is none.
///
/// Concurrent callers serialize on the session lock, so a dead sandbox is
/// replaced exactly once.
async fn ensure_alive(inner: &Arc<Inner>) -> Result<Endpoint, HostError> {
    let mut session = inner.session.lock().await;
    if inner.lock_state().is_closing() {
        return Err(HostError::Closed);
    }

    if let Some(endpoint) = &session.endpoint {
        if !endpoint.is_closed() {
            return Ok(endpoint.clone());
        }
        // Died before the watcher got to it.
        inner.transition(Transition::ProcessExited { clean: false });
    }
    session.endpoint = None;
    if let Some(kill) = session.kill.take() {
        let _ = kill.send(());
    }

    let respawning = inner.transition(Transition::Spawn) == SandboxState::Respawning;
    let params = LaunchParams::from_config(&inner.config);
    let handle = match inner.launcher.launch(&params).await {
        Ok(handle) => handle,
        Err(e) => {
            inner.transition(Transition::SpawnFailed);
            tracing::error!(respawning, "failed to start sandbox: {e}");
            return Err(e);
        }
    };

    let config = EndpointConfig::labeled("host").with_request_timeout(inner.config.request_timeout);
    let (endpoint, inbound) = Endpoint::spawn(handle.reader, handle.writer, config);

    session.generation += 1;
    let generation = session.generation;
    session.endpoint = Some(endpoint.clone());
    session.kill = Some(handle.kill);
    let spawn_count = inner.spawn_count.fetch_add(1, Ordering::SeqCst) + 1;
    inner.transition(Transition::SpawnSucceeded);

    tracing::info!(pid = ?handle.pid, generation, spawn_count, respawning, "sandbox alive");

    tokio::spawn(watch_session(
        Arc::downgrade(inner),
        generation,
        endpoint.clone(),
        handle.exit,
    ));
    tokio::spawn(route_inbound(
        Arc::downgrade(inner),
        endpoint.clone(),
        inbound,
    ));

    Ok(endpoint)
}

/// Wait for the session to end, then clean up and respawn.
///
/// Boxed because it calls back into [`ensure_alive`], which spawns it.
fn watch_session(
    inner: Weak<Inner>,
    generation: u64,
    endpoint: Endpoint,
    mut exit: oneshot::Receiver<ProcessExit>,
) -> Pin<Box<dyn Future<Output = ()> + Send>> {
    Box::pin(async move {
        let outcome = tokio::select! {
            status = &mut exit => status.unwrap_or(ProcessExit::Failed("exit status lost".into())),
            _ = endpoint.closed() => {
                match tokio::time::timeout(EXIT_STATUS_WAIT, &mut exit).await {
                    Ok(Ok(status)) => status,
                    _ => ProcessExit::Failed("transport closed".into()),
                }
            }
        };
        endpoint.mark_peer_dead();

        let Some(inner) = inner.upgrade() else {
            return;
        };

        let state = {
            let mut session = inner.session.lock().await;
            if session.generation != generation {
                return;
            }
            session.endpoint = None;
            if let Some(kill) = session.kill.take() {
                let _ = kill.send(());
            }
            inner.transition(Transition::ProcessExited {
                clean: outcome.is_clean(),
            })
        };

        if !state.should_respawn() {
            tracing::debug!(?outcome, %state, "sandbox ended");
            return;
        }

        tracing::warn!(?outcome, %state, "sandbox ended unexpectedly, respawning");
        if let Err(e) = ensure_alive(&inner).await {
            tracing::error!("respawn failed, will retry on next call: {e}");
        }
    })
}

/// Answer sandbox-originated requests until the session ends.
async fn route_inbound(
    inner: Weak<Inner>,
    endpoint: Endpoint,
    mut inbound: mpsc::UnboundedReceiver<Inbound>,
) {
    while let Some(message) = inbound.recv().await {
        let request = match message {
            Inbound::Request(request) => request,
            Inbound::Event(event) => {
                tracing::debug!(event_type = %event.event_type, "ignoring sandbox event");
                continue;
            }
        };
        let Some(inner) = inner.upgrade() else {
            break;
        };

        let endpoint = endpoint.clone();
        tokio::spawn(async move {
            let message_type = request.message_type;
            let channel = request.channel.clone();
            let origin = request.origin_name.clone().unwrap_or_default();
            tracing::debug!(?message_type, channel = %channel, origin = %origin, "sandbox request");

            let outcome = inner.forward(request).await;
            if let Err(ref e) = outcome {
                tracing::warn!(?message_type, origin = %origin, "sandbox request failed: {e}");
            }
            if message_type.is_fire_and_forget() {
                return;
            }
            if let Err(e) = endpoint.reply(channel, outcome) {
                tracing::debug!(?message_type, "reply dropped: {e}");
            }
        });
    }
}

// ─── Extension host ─────────────────────────────────────────────────────

/// The application's handle on the extension subsystem. Cheap to clone.
#[derive(Clone)]
pub struct ExtensionHost {
    inner: Arc<Inner>,
}

impl ExtensionHost {
    /// A host running the sandbox binary named in `config`.
    pub fn from_config(config: HostConfig) -> Self {
        let launcher = ProcessLauncher::new(&config.sandbox_bin);
        Self::new(config, Arc::new(launcher), Collaborators::default())
    }

    pub fn new(
        config: HostConfig,
        launcher: Arc<dyn SandboxLauncher>,
        collaborators: Collaborators,
    ) -> Self {
        let installer = PackageInstaller::new(&config.extension_dir);
        Self {
            inner: Arc::new(Inner {
                config,
                launcher,
                session: tokio::sync::Mutex::new(Session::default()),
                state: Mutex::new(SandboxState::Stopped),
                spawn_count: AtomicU64::new(0),
                ui: DeferredUi::new(),
                collaborators,
                installer,
            }),
        }
    }

    pub fn config(&self) -> &HostConfig {
        &self.inner.config
    }

    pub fn installer(&self) -> &PackageInstaller {
        &self.inner.installer
    }

    pub fn state(&self) -> SandboxState {
        *self.inner.lock_state()
    }

    /// Number of sandbox processes started so far.
    pub fn spawn_count(&self) -> u64 {
        self.inner.spawn_count.load(Ordering::SeqCst)
    }

    /// Spawn the sandbox now instead of on first use.
    pub async fn start(&self) -> Result<(), HostError> {
        ensure_alive(&self.inner).await.map(|_| ())
    }

    /// Attach the user interface; requests queued while it was missing are
    /// delivered in arrival order.
    pub async fn attach_ui(&self, surface: Arc<dyn Collaborator>) {
        self.inner.ui.attach(surface).await;
    }

    async fn call(&self, message_type: MessageType, data: Value) -> Result<Value, HostError> {
        let endpoint = ensure_alive(&self.inner).await?;
        Ok(endpoint.request(message_type, data).await?)
    }

    async fn call_as<T: DeserializeOwned>(
        &self,
        message_type: MessageType,
        data: Value,
    ) -> Result<T, HostError> {
        let value = self.call(message_type, data).await?;
        Ok(serde_json::from_value(value)?)
    }

    // ── Typed API ───────────────────────────────────────────────────────

    /// Rescan the install root; returns the package names loaded.
    pub async fn find_new_extensions(&self) -> Result<Vec<String>, HostError> {
        self.call_as(MessageType::FindNewExtensions, Value::Null).await
    }

    pub async fn get_installed_extensions(
        &self,
        package_name: Option<&str>,
    ) -> Result<Vec<ExtensionDetails>, HostError> {
        let data = match package_name {
            Some(name) => json!({ "packageName": name }),
            None => json!({}),
        };
        self.call_as(MessageType::GetInstalledExtensions, data).await
    }

    pub async fn get_extension_icon(&self, package_name: &str) -> Result<Option<PathBuf>, HostError> {
        let icon: Option<String> = self
            .call_as(MessageType::GetExtensionIcon, json!({ "packageName": package_name }))
            .await?;
        Ok(icon.map(PathBuf::from))
    }

    pub async fn toggle_extension_status(
        &self,
        package_name: &str,
        enabled: bool,
    ) -> Result<bool, HostError> {
        self.call_as(
            MessageType::ToggleExtensionStatus,
            json!({ "packageName": package_name, "enabled": enabled }),
        )
        .await
    }

    /// Stop and unload an extension in the sandbox. Files stay on disk.
    pub async fn remove_extension(&self, package_name: &str) -> Result<bool, HostError> {
        self.call_as(MessageType::RemoveExtension, json!({ "packageName": package_name }))
            .await
    }

    /// Broadcast an event; the result maps each matching started
    /// extension to its (namespaced) response, `null` when it failed.
    pub async fn send_extra_event(
        &self,
        event: ExtraEventRequest,
    ) -> Result<Map<String, Value>, HostError> {
        self.call_as(MessageType::ExtraExtensionEvents, serde_json::to_value(event)?)
            .await
    }

    pub async fn get_context_menu(
        &self,
        menu_type: ContextMenuType,
    ) -> Result<Vec<ContextMenuItem>, HostError> {
        self.call_as(MessageType::GetExtensionContextMenu, json!({ "type": menu_type }))
            .await
    }

    pub async fn fire_context_menu(
        &self,
        id: &str,
        package_name: &str,
        arg: Value,
    ) -> Result<Value, HostError> {
        self.call(
            MessageType::OnClickedContextMenu,
            json!({ "id": id, "packageName": package_name, "arg": arg }),
        )
        .await
    }

    /// Change the sandbox's log level; returns the level now in effect.
    pub async fn set_log_level(&self, level: &str) -> Result<String, HostError> {
        self.call_as(MessageType::SetLogLevel, json!({ "level": level }))
            .await
    }

    pub async fn get_accounts(
        &self,
        package_name: Option<&str>,
    ) -> Result<Vec<AccountDetails>, HostError> {
        let data = match package_name {
            Some(name) => json!({ "packageName": name }),
            None => json!({}),
        };
        self.call_as(MessageType::GetAccounts, data).await
    }

    pub async fn perform_account_login(
        &self,
        package_name: &str,
        account_id: &str,
        login_status: bool,
    ) -> Result<Value, HostError> {
        self.call(
            MessageType::PerformAccountLogin,
            json!({
                "packageName": package_name,
                "accountId": account_id,
                "loginStatus": login_status,
            }),
        )
        .await
    }

    pub async fn get_display_name(&self, package_name: &str) -> Result<String, HostError> {
        self.call_as(MessageType::GetDisplayName, json!({ "packageName": package_name }))
            .await
    }

    pub async fn get_extension_preferences(
        &self,
        package_name: &str,
    ) -> Result<Vec<PreferenceDescriptor>, HostError> {
        self.call_as(
            MessageType::GetExtensionPreferences,
            json!({ "packageName": package_name }),
        )
        .await
    }

    // ── Packages ────────────────────────────────────────────────────────

    /// Install the first valid package among `candidates`, then have the
    /// sandbox pick it up.
    pub async fn install_extension(&self, candidates: &[PathBuf]) -> InstallResult {
        let result = self.inner.installer.install(candidates).await;
        if result.success {
            if let Err(e) = self.find_new_extensions().await {
                tracing::warn!(
                    package_name = ?result.package_name,
                    "installed, but the sandbox could not load it yet: {e}"
                );
            }
        }
        result
    }

    /// Unload an extension and delete its files.
    pub async fn uninstall_extension(&self, package_name: &str) -> InstallResult {
        match self.remove_extension(package_name).await {
            Ok(_) => {}
            Err(e) => {
                tracing::warn!(package_name = %package_name, "sandbox removal failed: {e}");
            }
        }
        self.inner.installer.uninstall(package_name).await
    }

    pub fn install_root(&self) -> &Path {
        self.inner.installer.install_root()
    }

    // ── Shutdown ────────────────────────────────────────────────────────

    /// Stop every extension and terminate the sandbox for good.
    ///
    /// The sandbox gets the configured grace period to acknowledge
    /// `stop-process`; after that (or after the acknowledgement) it is
    /// killed. Never respawns afterwards. Calling it twice is harmless.
    pub async fn close_host(&self) {
        {
            let mut state = self.inner.lock_state();
            if state.is_closing() {
                return;
            }
            *state = state.apply(Transition::Close);
        }
        tracing::info!("closing extension host");

        let (endpoint, kill) = {
            let mut session = self.inner.session.lock().await;
            session.generation += 1;
            (session.endpoint.take(), session.kill.take())
        };

        if let Some(endpoint) = endpoint.filter(|e| !e.is_closed()) {
            let grace = self.inner.config.stop_grace;
            let stop = Request::new(MessageType::StopProcess, Value::Null);
            match endpoint.send_request(stop, grace).await {
                Ok(_) => tracing::info!("sandbox stopped all extensions"),
                Err(e) => tracing::warn!(
                    grace_ms = grace.as_millis() as u64,
                    "sandbox did not confirm stop, terminating: {e}"
                ),
            }
            endpoint.mark_peer_dead();
        }
        if let Some(kill) = kill {
            let _ = kill.send(());
        }

        self.inner.transition(Transition::CloseCompleted);
        tracing::info!("extension host closed");
    }
}

impl std::fmt::Debug for ExtensionHost {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExtensionHost")
            .field("state", &self.state())
            .field("spawn_count", &self.spawn_count())
            .finish_non_exhaustive()
    }
}
