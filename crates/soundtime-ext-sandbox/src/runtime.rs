//! Sandbox runtime: loads extensions and serves host requests.
//!
//! The runtime owns the [`ExtensionRegistry`] and processes one host request
//! at a time. Hook calls that request host functions await the host's reply
//! inline; the endpoint's reader task keeps resolving replies meanwhile.

use std::sync::Arc;

use serde_json::{json, Map, Value};
use soundtime_ext_core::{
    ContextMenuType, Endpoint, EndpointConfig, ExtraEventRequest, Inbound, MessageType,
    PreferenceDescriptor, ProtocolError, Request,
};
use tokio::io::{AsyncRead, AsyncWrite};

use crate::capability::{lock, Capability, HostRequest, SharedStores};
use crate::config::RuntimeConfig;
use crate::context::{
    HookOutput, IsolatedExecutionContext, EXPORT_PREFERENCES, HOOK_ACCOUNT_LOGIN,
    HOOK_CONTEXT_MENU, HOOK_HOST_REPLY, HOOK_STARTED, HOOK_STOPPED,
};
use crate::discovery::{discover, DiscoveredExtension};
use crate::error::SandboxError;
use crate::log_sink::{LogFile, LogLevelControl, LogSink};
use crate::registry::{ExtensionRegistry, LoadedExtension, RegistryFilter};
use crate::sanitize::namespace_ids;

/// Host-request / `handle_host_reply` exchanges allowed per hook call.
const MAX_HOST_REQUEST_ROUNDS: usize = 8;

// ─── Request data helpers ───────────────────────────────────────────────

fn required_str<'a>(data: &'a Value, key: &str) -> Result<&'a str, SandboxError> {
    data.get(key)
        .and_then(Value::as_str)
        .ok_or_else(|| SandboxError::invalid(format!("missing string field '{key}'")))
}

fn optional_str(data: &Value, key: &str) -> Option<String> {
    data.get(key).and_then(Value::as_str).map(str::to_string)
}

// ─── Runtime ────────────────────────────────────────────────────────────

pub struct SandboxRuntime {
    config: RuntimeConfig,
    context: Arc<dyn IsolatedExecutionContext>,
    registry: ExtensionRegistry,
    stores: SharedStores,
    log_file: LogFile,
    levels: LogLevelControl,
    host: Endpoint,
    stopped: bool,
}

impl SandboxRuntime {
    pub fn new(
        config: RuntimeConfig,
        context: Arc<dyn IsolatedExecutionContext>,
        levels: LogLevelControl,
        host: Endpoint,
    ) -> Self {
        let log_file = match &config.log_dir {
            Some(dir) => LogFile::open(dir).unwrap_or_else(|e| {
                tracing::warn!(log_dir = %dir.display(), "extension log file unavailable: {e}");
                LogFile::disabled()
            }),
            None => LogFile::disabled(),
        };

        Self {
            config,
            context,
            registry: ExtensionRegistry::new(),
            stores: SharedStores::default(),
            log_file,
            levels,
            host,
            stopped: false,
        }
    }

    pub fn registry(&self) -> &ExtensionRegistry {
        &self.registry
    }

    /// Whether `stop-process` has been handled.
    pub fn is_stopped(&self) -> bool {
        self.stopped
    }

    // ── Dispatch ────────────────────────────────────────────────────────

    /// Handle one host→sandbox request.
    pub async fn handle(&mut self, request: &Request) -> Result<Value, SandboxError> {
        let data = &request.data;
        match request.message_type {
            MessageType::FindNewExtensions => {
                let loaded = self.find_new_extensions().await;
                Ok(json!(loaded))
            }
            MessageType::GetInstalledExtensions => {
                let filter = RegistryFilter {
                    package_name: optional_str(data, "packageName"),
                    started: None,
                };
                Ok(serde_json::to_value(self.registry.details(&filter))?)
            }
            MessageType::GetExtensionIcon => {
                let ext = self.loaded(required_str(data, "packageName")?)?;
                Ok(ext
                    .icon
                    .as_ref()
                    .map(|p| Value::String(p.to_string_lossy().into_owned()))
                    .unwrap_or(Value::Null))
            }
            MessageType::ToggleExtensionStatus => {
                let package_name = required_str(data, "packageName")?.to_string();
                let enabled = data
                    .get("enabled")
                    .and_then(Value::as_bool)
                    .ok_or_else(|| SandboxError::invalid("missing boolean field 'enabled'"))?;
                self.loaded(&package_name)?;
                let filter = RegistryFilter::package(package_name);
                if enabled {
                    self.start(&filter).await;
                } else {
                    self.stop(&filter).await;
                }
                Ok(Value::Bool(enabled))
            }
            MessageType::RemoveExtension => {
                let removed = self
                    .remove_extension(required_str(data, "packageName")?)
                    .await;
                Ok(Value::Bool(removed))
            }
            MessageType::ExtraExtensionEvents => {
                let event: ExtraEventRequest = serde_json::from_value(data.clone())?;
                Ok(Value::Object(self.send_extra_event(event).await))
            }
            MessageType::GetExtensionContextMenu => {
                let menu_type: ContextMenuType = serde_json::from_value(
                    data.get("type").cloned().unwrap_or(Value::Null),
                )?;
                let registry = &self.registry;
                let items = lock(&self.stores.menus)
                    .query(menu_type, |owner| registry.is_started(owner));
                Ok(serde_json::to_value(items)?)
            }
            MessageType::OnClickedContextMenu => {
                let id = required_str(data, "id")?;
                let package_name = required_str(data, "packageName")?;
                if !lock(&self.stores.menus).contains(id, package_name) {
                    return Err(SandboxError::invalid(format!(
                        "no context menu entry {id} for {package_name}"
                    )));
                }
                if !self.registry.is_started(package_name) {
                    tracing::debug!(package_name = %package_name, id, "click on disabled extension ignored");
                    return Ok(Value::Null);
                }
                let input = json!({
                    "id": id,
                    "arg": data.get("arg").cloned().unwrap_or(Value::Null),
                });
                self.invoke_hook(package_name, HOOK_CONTEXT_MENU, &input).await
            }
            MessageType::SetLogLevel => {
                let level = self.levels.set(required_str(data, "level")?)?;
                Ok(Value::String(level.to_string()))
            }
            MessageType::GetAccounts => {
                let wanted = optional_str(data, "packageName");
                let registry = &self.registry;
                let accounts = lock(&self.stores.accounts).list(|owner| {
                    registry.is_started(owner) && wanted.as_deref().is_none_or(|w| w == owner)
                });
                Ok(serde_json::to_value(accounts)?)
            }
            MessageType::PerformAccountLogin => {
                let package_name = required_str(data, "packageName")?;
                let input = json!({
                    "accountId": data.get("accountId").cloned().unwrap_or(Value::Null),
                    "loginStatus": data.get("loginStatus").cloned().unwrap_or(Value::Bool(true)),
                });
                if !self.registry.is_started(package_name) {
                    return Err(SandboxError::NotFound(package_name.to_string()));
                }
                self.invoke_hook(package_name, HOOK_ACCOUNT_LOGIN, &input).await
            }
            MessageType::GetDisplayName => {
                let ext = self.loaded(required_str(data, "packageName")?)?;
                Ok(Value::String(ext.display_name.clone()))
            }
            MessageType::GetExtensionPreferences => {
                let ext = self.loaded(required_str(data, "packageName")?)?;
                Ok(serde_json::to_value(ext.capability.preferences())?)
            }
            MessageType::StopProcess => {
                self.stop(&RegistryFilter::started()).await;
                self.stopped = true;
                tracing::info!("all extensions stopped");
                Ok(Value::Bool(true))
            }
            other => Err(SandboxError::invalid(format!(
                "{other:?} is not handled by the sandbox"
            ))),
        }
    }

    fn loaded(&self, package_name: &str) -> Result<&LoadedExtension, SandboxError> {
        self.registry
            .get(package_name)
            .ok_or_else(|| SandboxError::NotFound(package_name.to_string()))
    }

    // ── Discovery and loading ───────────────────────────────────────────

    /// Scan the search paths, load what is new or upgraded, and start it.
    ///
    /// Returns the package names that were loaded by this call.
    pub async fn find_new_extensions(&mut self) -> Vec<String> {
        let discovered = discover(&self.config.search_paths).await;
        let mut loaded = Vec::new();

        for candidate in discovered {
            let package_name = candidate.manifest.package_name.clone();

            let upgrading = match self.registry.get(&package_name) {
                Some(existing) if !candidate.manifest.version.is_newer_than(&existing.version) => {
                    tracing::debug!(
                        package_name = %package_name,
                        version = %candidate.manifest.version,
                        "extension already loaded, skipping"
                    );
                    continue;
                }
                Some(existing) => {
                    tracing::info!(
                        package_name = %package_name,
                        from = %existing.version,
                        to = %candidate.manifest.version,
                        "upgrading extension"
                    );
                    true
                }
                None => false,
            };

            // The loaded version stays in place until its successor loads.
            let extension = match self.instantiate(candidate) {
                Ok(extension) => extension,
                Err(e) => {
                    tracing::warn!(package_name = %package_name, "failed to load extension: {e}");
                    continue;
                }
            };
            if upgrading {
                self.remove_extension(&package_name).await;
            }
            if let Err(e) = self.registry.register(extension) {
                tracing::warn!(package_name = %package_name, "{e}");
                continue;
            }

            self.start(&RegistryFilter::package(package_name.as_str())).await;
            tracing::info!(package_name = %package_name, "extension loaded");
            loaded.push(package_name);
        }

        if !loaded.is_empty() {
            if let Err(e) = self
                .host
                .request(MessageType::ExtensionUpdated, json!({ "packageNames": loaded }))
                .await
            {
                tracing::debug!("extension-updated not sent: {e}");
            }
        }
        loaded
    }

    fn instantiate(&self, discovered: DiscoveredExtension) -> Result<LoadedExtension, SandboxError> {
        let DiscoveredExtension {
            manifest,
            extension_path,
            entry,
            icon,
        } = discovered;

        let capability = Arc::new(Capability::new(
            &manifest.package_name,
            &extension_path,
            &self.config.app_root,
            LogSink::new(&manifest.package_name, self.log_file.clone(), self.levels.clone()),
            self.stores.clone(),
            self.host.clone(),
        ));

        let mut instance = self
            .context
            .load(&entry, &extension_path, Arc::clone(&capability))?;

        if instance.has_hook(EXPORT_PREFERENCES) {
            let raw = instance.call_hook(EXPORT_PREFERENCES, &Value::Null)?;
            match serde_json::from_value::<Vec<PreferenceDescriptor>>(raw) {
                Ok(preferences) => capability.set_preferences(preferences),
                Err(e) => tracing::warn!(
                    package_name = %manifest.package_name,
                    "ignoring malformed preference schema: {e}"
                ),
            }
        }

        Ok(LoadedExtension {
            package_name: manifest.package_name,
            display_name: manifest.display_name,
            version: manifest.version,
            description: manifest.description,
            author: manifest.author,
            entry,
            extension_path,
            icon,
            started: false,
            instance,
            capability,
        })
    }

    // ── Lifecycle ───────────────────────────────────────────────────────

    /// Run `on_started` on every matching stopped extension.
    pub async fn start(&mut self, filter: &RegistryFilter) {
        let filter = RegistryFilter {
            started: Some(false),
            ..filter.clone()
        };
        for package_name in self.registry.names(&filter) {
            if let Err(e) = self.invoke_hook(&package_name, HOOK_STARTED, &Value::Null).await {
                tracing::warn!(package_name = %package_name, "{e}");
            }
            // Presence in the registry was just checked.
            let _ = self.registry.set_started(&package_name, true);
        }
    }

    /// Run `on_stopped` on every matching started extension.
    pub async fn stop(&mut self, filter: &RegistryFilter) {
        let filter = RegistryFilter {
            started: Some(true),
            ..filter.clone()
        };
        for package_name in self.registry.names(&filter) {
            if let Err(e) = self.invoke_hook(&package_name, HOOK_STOPPED, &Value::Null).await {
                tracing::warn!(package_name = %package_name, "{e}");
            }
            let _ = self.registry.set_started(&package_name, false);
        }
    }

    /// Stop, deregister and forget everything the extension registered.
    pub async fn remove_extension(&mut self, package_name: &str) -> bool {
        self.stop(&RegistryFilter::package(package_name)).await;
        if self.registry.deregister(package_name).is_none() {
            return false;
        }
        lock(&self.stores.menus).remove_all(package_name);
        lock(&self.stores.accounts).remove_all(package_name);
        tracing::info!(package_name = %package_name, "extension removed");
        true
    }

    // ── Fan-out ─────────────────────────────────────────────────────────

    /// Deliver an extra event to every matching started extension.
    ///
    /// A failing hook yields `null` for that extension only.
    pub async fn send_extra_event(&mut self, event: ExtraEventRequest) -> Map<String, Value> {
        let filter = RegistryFilter {
            package_name: event.package_name,
            started: Some(true),
        };
        let hook = event.event_type.hook_name();
        let mut responses = Map::new();

        for package_name in self.registry.names(&filter) {
            let response = match self.invoke_hook(&package_name, hook, &event.data).await {
                Ok(value) => namespace_ids(&package_name, value),
                Err(e) => {
                    tracing::warn!(package_name = %package_name, hook, "{e}");
                    Value::Null
                }
            };
            responses.insert(package_name, response);
        }
        responses
    }

    // ── Hooks ───────────────────────────────────────────────────────────

    /// Call `hook` on one extension and serve the host requests it returns.
    ///
    /// A hook the extension does not export answers `null`.
    pub async fn invoke_hook(
        &mut self,
        package_name: &str,
        hook: &str,
        input: &Value,
    ) -> Result<Value, SandboxError> {
        let ext = self
            .registry
            .get_mut(package_name)
            .ok_or_else(|| SandboxError::NotFound(package_name.to_string()))?;
        if !ext.instance.has_hook(hook) {
            return Ok(Value::Null);
        }

        let raw = ext.instance.call_hook(hook, input)?;
        let output = HookOutput::from_value(raw)?;
        self.serve_host_requests(package_name, output.host_requests)
            .await;
        Ok(output.response)
    }

    async fn serve_host_requests(&mut self, package_name: &str, mut pending: Vec<HostRequest>) {
        let mut rounds = 0;
        while !pending.is_empty() && rounds < MAX_HOST_REQUEST_ROUNDS {
            rounds += 1;
            let Some(capability) = self
                .registry
                .get(package_name)
                .map(|ext| Arc::clone(&ext.capability))
            else {
                return;
            };

            let mut replies = Vec::new();
            for request in pending.drain(..) {
                if let Some(reply) = capability.execute(request).await {
                    replies.push(reply);
                }
            }

            let Some(ext) = self.registry.get_mut(package_name) else {
                return;
            };
            if replies.is_empty() || !ext.instance.has_hook(HOOK_HOST_REPLY) {
                return;
            }
            for reply in replies {
                let input = match serde_json::to_value(&reply) {
                    Ok(v) => v,
                    Err(e) => {
                        tracing::warn!(package_name = %package_name, "{e}");
                        continue;
                    }
                };
                match ext
                    .instance
                    .call_hook(HOOK_HOST_REPLY, &input)
                    .and_then(HookOutput::from_value)
                {
                    Ok(output) => pending.extend(output.host_requests),
                    Err(e) => tracing::warn!(package_name = %package_name, "{e}"),
                }
            }
        }

        if !pending.is_empty() {
            tracing::warn!(
                package_name = %package_name,
                dropped = pending.len(),
                "host request chain too long, dropping remaining requests"
            );
        }
    }
}

// ─── Serve loop ─────────────────────────────────────────────────────────

/// Run the sandbox protocol over a byte stream pair until the host goes
/// away.
///
/// Discovery runs once at startup, so a respawned sandbox repopulates
/// itself before answering anything.
pub async fn serve<R, W>(
    reader: R,
    writer: W,
    config: RuntimeConfig,
    context: Arc<dyn IsolatedExecutionContext>,
    levels: LogLevelControl,
) where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (endpoint, mut inbound) = Endpoint::spawn(reader, writer, EndpointConfig::labeled("sandbox"));
    let mut runtime = SandboxRuntime::new(config, context, levels, endpoint.clone());

    let loaded = runtime.find_new_extensions().await;
    tracing::info!(count = loaded.len(), "sandbox ready");

    while let Some(message) = inbound.recv().await {
        match message {
            Inbound::Request(request) => {
                let message_type = request.message_type;
                let outcome = runtime
                    .handle(&request)
                    .await
                    .map_err(|e| e.to_string());
                if let Err(ref e) = outcome {
                    tracing::warn!(?message_type, channel = %request.channel, "request failed: {e}");
                }
                if message_type.is_fire_and_forget() {
                    continue;
                }
                match endpoint.reply(request.channel, outcome) {
                    Ok(()) => {}
                    Err(e @ ProtocolError::PeerUnavailable) => {
                        tracing::warn!(?message_type, "reply not sent: {e}");
                        break;
                    }
                    // The host got an error reply in its place.
                    Err(e) => tracing::warn!(?message_type, "reply replaced: {e}"),
                }
            }
            Inbound::Event(event) => {
                tracing::debug!(event_type = %event.event_type, "ignoring host event");
            }
        }
    }

    if !runtime.is_stopped() {
        // Host vanished without a stop request; still drain stop hooks.
        runtime.stop(&RegistryFilter::started()).await;
    }
    tracing::info!("sandbox exiting");
}
