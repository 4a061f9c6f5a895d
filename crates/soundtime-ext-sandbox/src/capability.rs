//! The per-extension host API.
//!
//! Each loaded extension gets exactly one [`Capability`], built for it and
//! shared as `Arc<Capability>`. Its identity (package name, paths) is fixed
//! at construction and has no setters. Extension hooks reach the host by
//! returning `host_requests`, which the runtime executes through the
//! requesting extension's own capability, so an extension can only ever act
//! as itself.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use soundtime_ext_core::{
    AccountDetails, ContextMenuItem, Endpoint, MessageType, PreferenceDescriptor,
};
use tracing::Level;

use crate::accounts::AccountStore;
use crate::context_menu::ContextMenuStore;
use crate::error::SandboxError;
use crate::log_sink::LogSink;
use crate::sanitize::namespace_ids;

/// Stores shared by every capability of one runtime.
#[derive(Clone, Default)]
pub struct SharedStores {
    pub menus: Arc<Mutex<ContextMenuStore>>,
    pub accounts: Arc<Mutex<AccountStore>>,
}

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// A host function call requested by an extension hook.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HostRequest {
    /// Name of the host function to call.
    pub function: String,
    /// Arguments as a JSON value.
    #[serde(default)]
    pub args: Value,
}

/// Outcome of one [`HostRequest`], fed back to `handle_host_reply`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HostReply {
    pub function: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl HostReply {
    fn from_outcome(function: String, outcome: Result<Value, SandboxError>) -> Self {
        match outcome {
            Ok(result) => Self {
                function,
                result: Some(result),
                error: None,
            },
            Err(e) => Self {
                function,
                result: None,
                error: Some(e.to_string()),
            },
        }
    }
}

// ─── Capability ─────────────────────────────────────────────────────────

pub struct Capability {
    package_name: String,
    extension_path: PathBuf,
    app_root: PathBuf,
    log: LogSink,
    stores: SharedStores,
    preferences: Mutex<Vec<PreferenceDescriptor>>,
    host: Endpoint,
}

impl std::fmt::Debug for Capability {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Capability")
            .field("package_name", &self.package_name)
            .field("extension_path", &self.extension_path)
            .finish_non_exhaustive()
    }
}

impl Capability {
    pub fn new(
        package_name: &str,
        extension_path: &Path,
        app_root: &Path,
        log: LogSink,
        stores: SharedStores,
        host: Endpoint,
    ) -> Self {
        Self {
            package_name: package_name.to_string(),
            extension_path: extension_path.to_path_buf(),
            app_root: app_root.to_path_buf(),
            log,
            stores,
            preferences: Mutex::new(Vec::new()),
            host,
        }
    }

    pub fn package_name(&self) -> &str {
        &self.package_name
    }

    pub fn extension_path(&self) -> &Path {
        &self.extension_path
    }

    pub fn app_root(&self) -> &Path {
        &self.app_root
    }

    pub fn log(&self) -> &LogSink {
        &self.log
    }

    /// Read-only values handed to the extension at load time.
    pub fn config_entries(&self) -> Vec<(String, String)> {
        vec![
            ("package_name".to_string(), self.package_name.clone()),
            (
                "extension_path".to_string(),
                self.extension_path.to_string_lossy().into_owned(),
            ),
            (
                "app_root".to_string(),
                self.app_root.to_string_lossy().into_owned(),
            ),
        ]
    }

    pub fn preferences(&self) -> Vec<PreferenceDescriptor> {
        lock(&self.preferences).clone()
    }

    /// Replace the preference schema (used once with the `preferences`
    /// export at load time).
    pub fn set_preferences(&self, preferences: Vec<PreferenceDescriptor>) {
        *lock(&self.preferences) = preferences;
    }

    /// Execute one host request on behalf of this extension.
    ///
    /// Logging calls produce no reply; everything else yields a
    /// [`HostReply`] carrying the result or the error.
    pub async fn execute(&self, request: HostRequest) -> Option<HostReply> {
        let HostRequest { function, args } = request;

        let outcome = match function.as_str() {
            "log_debug" | "log_info" | "log_warn" | "log_error" => {
                self.log_from_extension(&function, &args);
                return None;
            }
            "register_context_menu" => self.register_context_menu(args),
            "remove_context_menu" => self.remove_context_menu(&args),
            "register_account" => self.register_account(args).await,
            "unregister_account" => self.unregister_account(&args).await,
            "add_preference" => self.add_preference(args).await,
            "remove_preference" => self.remove_preference(&args).await,
            other => match MessageType::from_host_function(other) {
                Some(message_type) => self.call_host(message_type, args).await,
                None => Err(SandboxError::invalid(format!(
                    "unknown host function '{other}'"
                ))),
            },
        };

        if let Err(ref e) = outcome {
            tracing::error!(
                package_name = %self.package_name,
                function = %function,
                "host function request failed: {e}"
            );
        }
        Some(HostReply::from_outcome(function, outcome))
    }

    // ── Logging ─────────────────────────────────────────────────────────

    fn log_from_extension(&self, function: &str, args: &Value) {
        let level = match function {
            "log_debug" => Level::DEBUG,
            "log_warn" => Level::WARN,
            "log_error" => Level::ERROR,
            _ => Level::INFO,
        };
        let message = args
            .get("message")
            .and_then(Value::as_str)
            .or_else(|| args.as_str())
            .unwrap_or_default();
        self.log.log(level, message);
    }

    // ── Context menus ───────────────────────────────────────────────────

    fn register_context_menu(&self, args: Value) -> Result<Value, SandboxError> {
        let items = args.get("items").cloned().unwrap_or(args);
        let items: Vec<ContextMenuItem> = match items {
            Value::Array(_) => serde_json::from_value(items)?,
            single => vec![serde_json::from_value(single)?],
        };
        let ids = lock(&self.stores.menus).register(&self.package_name, items);
        Ok(json!(ids))
    }

    fn remove_context_menu(&self, args: &Value) -> Result<Value, SandboxError> {
        let id = required_str(args, "id")?;
        let removed = lock(&self.stores.menus).remove(&self.package_name, id);
        Ok(Value::Bool(removed))
    }

    // ── Accounts ────────────────────────────────────────────────────────

    async fn register_account(&self, args: Value) -> Result<Value, SandboxError> {
        let mut account: AccountDetails = serde_json::from_value(args)?;
        account.package_name.clone_from(&self.package_name);
        let id = account.id.clone();
        lock(&self.stores.accounts).upsert(&self.package_name, account.clone());

        if let Err(e) = self
            .host
            .request_from(
                &self.package_name,
                MessageType::RegisterAccount,
                serde_json::to_value(&account)?,
            )
            .await
        {
            tracing::warn!(
                package_name = %self.package_name,
                account_id = %id,
                "account registered locally, host not notified: {e}"
            );
        }
        Ok(Value::String(id))
    }

    async fn unregister_account(&self, args: &Value) -> Result<Value, SandboxError> {
        let id = required_str(args, "id")?;
        let removed = lock(&self.stores.accounts).remove(&self.package_name, id);
        if removed {
            if let Err(e) = self
                .host
                .request_from(
                    &self.package_name,
                    MessageType::UnregisterAccount,
                    json!({ "id": id, "packageName": self.package_name }),
                )
                .await
            {
                tracing::warn!(
                    package_name = %self.package_name,
                    account_id = %id,
                    "account removed locally, host not notified: {e}"
                );
            }
        }
        Ok(Value::Bool(removed))
    }

    // ── Preferences ─────────────────────────────────────────────────────

    async fn add_preference(&self, args: Value) -> Result<Value, SandboxError> {
        let descriptor: PreferenceDescriptor = serde_json::from_value(args)?;
        {
            let mut prefs = lock(&self.preferences);
            prefs.retain(|p| p.key != descriptor.key);
            prefs.push(descriptor);
        }
        self.announce_preferences().await;
        Ok(Value::Bool(true))
    }

    async fn remove_preference(&self, args: &Value) -> Result<Value, SandboxError> {
        let key = required_str(args, "key")?;
        let removed = {
            let mut prefs = lock(&self.preferences);
            let before = prefs.len();
            prefs.retain(|p| p.key != key);
            prefs.len() != before
        };
        if removed {
            self.announce_preferences().await;
        }
        Ok(Value::Bool(removed))
    }

    async fn announce_preferences(&self) {
        let data = json!({
            "packageName": self.package_name,
            "preferences": self.preferences(),
        });
        if let Err(e) = self
            .host
            .request_from(&self.package_name, MessageType::UpdatePreferences, data)
            .await
        {
            tracing::debug!(package_name = %self.package_name, "update-preferences not sent: {e}");
        }
    }

    // ── Remote calls ────────────────────────────────────────────────────

    async fn call_host(&self, message_type: MessageType, args: Value) -> Result<Value, SandboxError> {
        // Entities written to the library carry this extension's prefix.
        let args = match message_type {
            MessageType::AddSongs
            | MessageType::UpdateSong
            | MessageType::AddPlaylist
            | MessageType::AddToPlaylist => namespace_ids(&self.package_name, args),
            _ => args,
        };
        let result = self
            .host
            .request_from(&self.package_name, message_type, args)
            .await?;
        Ok(result)
    }
}

fn required_str<'a>(args: &'a Value, key: &str) -> Result<&'a str, SandboxError> {
    args.get(key)
        .and_then(Value::as_str)
        .ok_or_else(|| SandboxError::invalid(format!("missing string argument '{key}'")))
}

// ─── Tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::log_sink::{LogFile, LogLevelControl};
    use soundtime_ext_core::{
        ContextMenuType, EndpointConfig, Envelope, FrameReader, FrameWriter, Reply, Request,
    };
    use tokio::sync::mpsc;

    /// A host stand-in that records every request and answers must-reply
    /// ones with `{"ok": true}`.
    fn fake_host(stream: tokio::io::DuplexStream) -> mpsc::UnboundedReceiver<Request> {
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            let (r, w) = tokio::io::split(stream);
            let mut reader = FrameReader::new(r);
            let mut writer = FrameWriter::new(w);
            while let Ok(Some(value)) = reader.read_value().await {
                let Ok(Envelope::Request(req)) = Envelope::from_value(value) else {
                    continue;
                };
                if !req.message_type.is_fire_and_forget() {
                    let reply = Reply::ok(req.channel.clone(), json!({"ok": true}));
                    if writer.write_envelope(&Envelope::Reply(reply)).await.is_err() {
                        break;
                    }
                }
                let _ = tx.send(req);
            }
        });
        rx
    }

    fn capability(package_name: &str) -> (Capability, SharedStores, mpsc::UnboundedReceiver<Request>) {
        let (ours, theirs) = tokio::io::duplex(64 * 1024);
        let (r, w) = tokio::io::split(ours);
        let (endpoint, _inbound) = Endpoint::spawn(r, w, EndpointConfig::labeled("sandbox"));
        let stores = SharedStores::default();
        let capability = Capability::new(
            package_name,
            Path::new("/ext/demo-ext"),
            Path::new("/opt/soundtime"),
            LogSink::new(package_name, LogFile::disabled(), LogLevelControl::default()),
            stores.clone(),
            endpoint,
        );
        (capability, stores, fake_host(theirs))
    }

    fn call(function: &str, args: Value) -> HostRequest {
        HostRequest {
            function: function.into(),
            args,
        }
    }

    #[tokio::test]
    async fn test_log_requests_produce_no_reply() {
        let (cap, _, _) = capability("demo-ext");
        assert!(cap.execute(call("log_info", json!({"message": "hi"}))).await.is_none());
        assert!(cap.execute(call("log_error", json!("bare string"))).await.is_none());
    }

    #[tokio::test]
    async fn test_context_menu_owned_by_caller() {
        let (cap, stores, _) = capability("demo-ext");
        let reply = cap
            .execute(call(
                "register_context_menu",
                json!({"items": [{"label": "Play next", "type": "SONGS", "packageName": "evil"}]}),
            ))
            .await
            .unwrap();
        let ids = reply.result.unwrap();
        assert_eq!(ids.as_array().unwrap().len(), 1);

        let menus = lock(&stores.menus).query(ContextMenuType::Songs, |_| true);
        assert_eq!(menus[0].package_name, "demo-ext");

        let id = ids[0].as_str().unwrap().to_string();
        let reply = cap
            .execute(call("remove_context_menu", json!({ "id": id })))
            .await
            .unwrap();
        assert_eq!(reply.result, Some(Value::Bool(true)));
        assert!(lock(&stores.menus).is_empty());
    }

    #[tokio::test]
    async fn test_unknown_function_is_error_reply() {
        let (cap, _, _) = capability("demo-ext");
        let reply = cap.execute(call("format_disk", Value::Null)).await.unwrap();
        assert!(reply.result.is_none());
        assert!(reply.error.unwrap().contains("unknown host function"));

        // host→sandbox types are not callable by extensions
        let reply = cap.execute(call("stop_process", Value::Null)).await.unwrap();
        assert!(reply.error.is_some());
    }

    #[tokio::test]
    async fn test_remote_call_stamped_and_namespaced() {
        let (cap, _, mut seen) = capability("demo-ext");
        let reply = cap
            .execute(call("add_songs", json!([{"_id": "s1", "title": "Song"}])))
            .await
            .unwrap();
        assert_eq!(reply.result, Some(json!({"ok": true})));

        let req = seen.recv().await.unwrap();
        assert_eq!(req.message_type, MessageType::AddSongs);
        assert_eq!(req.origin_name.as_deref(), Some("demo-ext"));
        assert_eq!(req.data[0]["_id"], "demo-ext:s1");

        cap.execute(call("get_songs", json!({"song": {"_id": "x"}}))).await;
        let req = seen.recv().await.unwrap();
        // reads are passed through untouched
        assert_eq!(req.data["song"]["_id"], "x");
    }

    #[tokio::test]
    async fn test_register_account_stores_and_forwards() {
        let (cap, stores, mut seen) = capability("demo-ext");
        let reply = cap
            .execute(call(
                "register_account",
                json!({"id": "main", "name": "Demo", "packageName": "evil", "loggedIn": false}),
            ))
            .await
            .unwrap();
        assert_eq!(reply.result, Some(json!("main")));
        assert!(lock(&stores.accounts).contains("demo-ext", "main"));

        let req = seen.recv().await.unwrap();
        assert_eq!(req.message_type, MessageType::RegisterAccount);
        assert_eq!(req.data["packageName"], "demo-ext");

        let reply = cap
            .execute(call("unregister_account", json!({"id": "main"})))
            .await
            .unwrap();
        assert_eq!(reply.result, Some(Value::Bool(true)));
        assert_eq!(seen.recv().await.unwrap().message_type, MessageType::UnregisterAccount);
    }

    #[tokio::test]
    async fn test_add_preference_replaces_by_key_and_notifies() {
        let (cap, _, mut seen) = capability("demo-ext");
        let add = |title: &str| {
            call(
                "add_preference",
                json!({"key": "quality", "title": title, "type": "dropdown"}),
            )
        };

        assert_eq!(cap.execute(add("Quality")).await.unwrap().result, Some(Value::Bool(true)));
        let notice = seen.recv().await.unwrap();
        assert_eq!(notice.message_type, MessageType::UpdatePreferences);
        assert_eq!(notice.data["packageName"], "demo-ext");

        cap.execute(add("Audio quality")).await;
        let prefs = cap.preferences();
        assert_eq!(prefs.len(), 1);
        assert_eq!(prefs[0].title, "Audio quality");

        let reply = cap
            .execute(call("remove_preference", json!({"key": "quality"})))
            .await
            .unwrap();
        assert_eq!(reply.result, Some(Value::Bool(true)));
        assert!(cap.preferences().is_empty());
    }

    #[tokio::test]
    async fn test_config_entries() {
        let (cap, _, _) = capability("demo-ext");
        let entries = cap.config_entries();
        assert!(entries.contains(&("package_name".to_string(), "demo-ext".to_string())));
        assert!(entries.contains(&("app_root".to_string(), "/opt/soundtime".to_string())));
    }
}
