//! SoundTime extension host: shared core.
//!
//! Everything that both sides of the host/sandbox boundary agree on lives
//! here: the wire envelopes and the message-type schema, the length-prefixed
//! frame codec, the correlating [`Endpoint`], the extension manifest and
//! its version ordering, and the data shapes exchanged by the typed API.

pub mod codec;
pub mod endpoint;
pub mod error;
pub mod manifest;
pub mod message;
pub mod types;
pub mod version;

pub use codec::{FrameReader, FrameWriter, MAX_FRAME_BYTES};
pub use endpoint::{Endpoint, EndpointConfig, Inbound};
pub use error::{ManifestError, ProtocolError};
pub use manifest::{ExtensionManifest, MANIFEST_FILE};
pub use message::{Channel, Delivery, Envelope, Event, MessageType, Reply, Request, Route};
pub use types::{
    AccountDetails, ContextMenuItem, ContextMenuType, ExtensionDetails, ExtraEventRequest,
    ExtraEventType, PreferenceDescriptor,
};
pub use version::ExtensionVersion;
