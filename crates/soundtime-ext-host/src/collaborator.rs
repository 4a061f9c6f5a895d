//! Application-side receivers of sandbox-originated requests.

use async_trait::async_trait;
use serde_json::Value;
use soundtime_ext_core::Request;

/// Something that answers requests extensions send to the application:
/// the user interface, the song library, the preference store.
///
/// An `Err` is relayed to the extension as the reply's error string.
#[async_trait]
pub trait Collaborator: Send + Sync + 'static {
    async fn handle(&self, request: Request) -> Result<Value, String>;
}

/// Placeholder for a collaborator the application did not provide.
#[derive(Debug, Clone)]
pub struct Unavailable(pub &'static str);

#[async_trait]
impl Collaborator for Unavailable {
    async fn handle(&self, request: Request) -> Result<Value, String> {
        Err(format!(
            "{} is not available for {:?}",
            self.0, request.message_type
        ))
    }
}
