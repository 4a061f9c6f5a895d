//! Sanitizers for data crossing the extension boundary.

use serde_json::Value;

/// Maximum log message length from extensions.
pub const MAX_LOG_MESSAGE_LEN: usize = 2048;

/// Keys whose string values are entity identifiers.
const ID_KEYS: &[&str] = &["_id", "playlist_id", "album_id", "artist_id"];

/// Environment keys matching any of these fragments are never exposed.
const SECRET_KEY_FRAGMENTS: &[&str] = &[
    "KEY",
    "SECRET",
    "TOKEN",
    "PASSWORD",
    "CLIENT_ID",
    "CREDENTIAL",
];

// ─── Identity namespacing ───────────────────────────────────────────────

/// Prefix one id with its owning extension. Idempotent.
pub fn namespace_id(package_name: &str, id: &str) -> String {
    let prefix = format!("{package_name}:");
    if id.starts_with(&prefix) {
        id.to_string()
    } else {
        format!("{prefix}{id}")
    }
}

/// Rewrite every entity id in `value` (at any depth) to
/// `"<package_name>:<id>"`.
pub fn namespace_ids(package_name: &str, mut value: Value) -> Value {
    namespace_in_place(package_name, &mut value);
    value
}

fn namespace_in_place(package_name: &str, value: &mut Value) {
    match value {
        Value::Object(map) => {
            for (key, child) in map.iter_mut() {
                if ID_KEYS.contains(&key.as_str()) {
                    if let Value::String(id) = child {
                        *id = namespace_id(package_name, id);
                        continue;
                    }
                }
                namespace_in_place(package_name, child);
            }
        }
        Value::Array(items) => {
            for item in items {
                namespace_in_place(package_name, item);
            }
        }
        _ => {}
    }
}

// ─── Environment ────────────────────────────────────────────────────────

fn is_secret_key(key: &str) -> bool {
    let upper = key.to_ascii_uppercase();
    SECRET_KEY_FRAGMENTS
        .iter()
        .any(|fragment| upper.contains(fragment))
}

/// Drop every variable whose name looks like it carries a credential.
pub fn sanitize_env<I>(vars: I) -> Vec<(String, String)>
where
    I: IntoIterator<Item = (String, String)>,
{
    let mut kept: Vec<(String, String)> = vars
        .into_iter()
        .filter(|(key, _)| !is_secret_key(key))
        .collect();
    kept.sort();
    kept
}

// ─── Log messages ───────────────────────────────────────────────────────

/// Strips control characters (except newline/tab), truncates to max length.
pub fn sanitize_log_message(message: &str) -> String {
    let cleaned: String = message
        .chars()
        .filter(|c| !c.is_control() || *c == '\n' || *c == '\t')
        .take(MAX_LOG_MESSAGE_LEN)
        .collect();
    if message.chars().count() > MAX_LOG_MESSAGE_LEN {
        format!("{cleaned}… (truncated)")
    } else {
        cleaned
    }
}
