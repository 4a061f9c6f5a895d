//! Request/reply correlation over a framed byte stream.
//!
//! An [`Endpoint`] owns one side of the channel. Outbound requests mint a
//! fresh [`Channel`], park a one-shot listener under it and resolve when the
//! matching reply arrives. Inbound requests and events are handed to the
//! owner through an unbounded receiver; the owner answers with
//! [`Endpoint::reply`].
//!
//! Guarantees:
//! - every outstanding future settles exactly once (reply, remote error,
//!   timeout, or peer death);
//! - a reply for an unknown or already-settled channel is discarded;
//! - once the peer is gone, every pending and every subsequent call fails
//!   with [`ProtocolError::PeerUnavailable`].

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde_json::Value;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot, watch};

use crate::codec::{encode_body, FrameReader, FrameWriter, MAX_FRAME_BYTES};
use crate::error::ProtocolError;
use crate::message::{Channel, Envelope, Event, MessageType, Reply, Request};

/// Default timeout applied to must-reply requests.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

// ─── Configuration ──────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct EndpointConfig {
    /// Timeout for must-reply requests that don't specify their own.
    pub request_timeout: Duration,
    /// Label used in log lines (`"host"`, `"sandbox"`).
    pub label: String,
    /// Largest frame sent or accepted.
    pub max_frame_bytes: usize,
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            label: "endpoint".to_string(),
            max_frame_bytes: MAX_FRAME_BYTES,
        }
    }
}

impl EndpointConfig {
    pub fn labeled(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            ..Self::default()
        }
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_max_frame_bytes(mut self, max: usize) -> Self {
        self.max_frame_bytes = max;
        self
    }
}

/// A message the peer originated.
#[derive(Debug, Clone)]
pub enum Inbound {
    Request(Request),
    Event(Event),
}

// ─── Pending replies ────────────────────────────────────────────────────

type ReplySender = oneshot::Sender<Result<Value, ProtocolError>>;

#[derive(Default)]
struct PendingTable {
    waiting: HashMap<Channel, ReplySender>,
    closed: bool,
}

struct Shared {
    pending: Mutex<PendingTable>,
    closed_tx: watch::Sender<bool>,
    label: String,
}

impl Shared {
    fn table(&self) -> MutexGuard<'_, PendingTable> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn register(
        &self,
        channel: Channel,
    ) -> Result<oneshot::Receiver<Result<Value, ProtocolError>>, ProtocolError> {
        let mut table = self.table();
        if table.closed {
            return Err(ProtocolError::PeerUnavailable);
        }
        let (tx, rx) = oneshot::channel();
        table.waiting.insert(channel, tx);
        Ok(rx)
    }

    fn forget(&self, channel: &Channel) {
        self.table().waiting.remove(channel);
    }

    fn resolve(&self, reply: Reply) {
        let Some(sender) = self.table().waiting.remove(&reply.channel) else {
            tracing::debug!(
                endpoint = %self.label,
                channel = %reply.channel,
                "discarding reply for unknown or settled channel"
            );
            return;
        };
        let outcome = match reply.error {
            Some(error) => Err(ProtocolError::Remote(error)),
            None => Ok(reply.data.unwrap_or(Value::Null)),
        };
        // The caller may have stopped listening; nothing to do then.
        let _ = sender.send(outcome);
    }

    fn close(&self) {
        let drained: Vec<ReplySender> = {
            let mut table = self.table();
            if table.closed {
                return;
            }
            table.closed = true;
            table.waiting.drain().map(|(_, tx)| tx).collect()
        };
        if !drained.is_empty() {
            tracing::warn!(
                endpoint = %self.label,
                outstanding = drained.len(),
                "peer unavailable, failing outstanding requests"
            );
        }
        for tx in drained {
            let _ = tx.send(Err(ProtocolError::PeerUnavailable));
        }
        self.closed_tx.send_replace(true);
    }

    fn is_closed(&self) -> bool {
        self.table().closed
    }
}

// ─── Endpoint ───────────────────────────────────────────────────────────

/// One side of the host/sandbox channel. Cheap to clone.
#[derive(Clone)]
pub struct Endpoint {
    outbound: mpsc::UnboundedSender<Vec<u8>>,
    shared: Arc<Shared>,
    request_timeout: Duration,
    max_frame_bytes: usize,
}

impl std::fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Endpoint")
            .field("label", &self.shared.label)
            .field("closed", &self.shared.is_closed())
            .field("request_timeout", &self.request_timeout)
            .finish_non_exhaustive()
    }
}

impl Endpoint {
    /// Start the reader and writer tasks over the given stream halves.
    ///
    /// Must be called from within a tokio runtime. The returned receiver
    /// yields every request and event the peer originates; it ends when the
    /// peer goes away.
    pub fn spawn<R, W>(
        reader: R,
        writer: W,
        config: EndpointConfig,
    ) -> (Self, mpsc::UnboundedReceiver<Inbound>)
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let (closed_tx, _) = watch::channel(false);

        let shared = Arc::new(Shared {
            pending: Mutex::new(PendingTable::default()),
            closed_tx,
            label: config.label,
        });

        tokio::spawn(writer_loop(
            FrameWriter::new(writer),
            outbound_rx,
            Arc::clone(&shared),
        ));
        tokio::spawn(reader_loop(
            FrameReader::new(reader).with_max_frame(config.max_frame_bytes),
            inbound_tx,
            outbound_tx.clone(),
            Arc::clone(&shared),
        ));

        let endpoint = Self {
            outbound: outbound_tx,
            shared,
            request_timeout: config.request_timeout,
            max_frame_bytes: config.max_frame_bytes,
        };
        (endpoint, inbound_rx)
    }

    /// Send a request and wait for its reply with the default timeout.
    ///
    /// Fire-and-forget types resolve to `Value::Null` as soon as the
    /// envelope is queued.
    pub async fn request(
        &self,
        message_type: MessageType,
        data: Value,
    ) -> Result<Value, ProtocolError> {
        self.send_request(Request::new(message_type, data), self.request_timeout)
            .await
    }

    /// Like [`request`](Self::request), stamping the originating extension.
    pub async fn request_from(
        &self,
        origin_name: &str,
        message_type: MessageType,
        data: Value,
    ) -> Result<Value, ProtocolError> {
        let request = Request::new(message_type, data).with_origin(origin_name);
        self.send_request(request, self.request_timeout).await
    }

    /// Send a prepared request with an explicit timeout.
    pub async fn send_request(
        &self,
        request: Request,
        timeout: Duration,
    ) -> Result<Value, ProtocolError> {
        let message_type = request.message_type;

        if message_type.is_fire_and_forget() {
            self.transmit(&Envelope::Request(request))?;
            return Ok(Value::Null);
        }

        let channel = request.channel.clone();
        let rx = self.shared.register(channel.clone())?;
        if let Err(e) = self.transmit(&Envelope::Request(request)) {
            self.shared.forget(&channel);
            return Err(e);
        }

        tracing::trace!(
            endpoint = %self.shared.label,
            channel = %channel,
            ?message_type,
            "request sent"
        );

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(outcome)) => outcome,
            // Sender dropped without an answer: the table was torn down.
            Ok(Err(_)) => Err(ProtocolError::PeerUnavailable),
            Err(_) => {
                self.shared.forget(&channel);
                tracing::warn!(
                    endpoint = %self.shared.label,
                    channel = %channel,
                    ?message_type,
                    after_ms = timeout.as_millis() as u64,
                    "request timed out"
                );
                Err(ProtocolError::Timeout {
                    message_type,
                    after: timeout,
                })
            }
        }
    }

    /// Answer a request the peer originated.
    ///
    /// A reply too large to frame is replaced by an error reply on the same
    /// channel, and `FrameTooLarge` is returned; the endpoint stays usable.
    pub fn reply(&self, channel: Channel, outcome: Result<Value, String>) -> Result<(), ProtocolError> {
        let reply = match outcome {
            Ok(data) => Reply::ok(channel.clone(), data),
            Err(error) => Reply::err(channel.clone(), error),
        };
        match self.transmit(&Envelope::Reply(reply)) {
            Err(ProtocolError::FrameTooLarge { size, max }) => {
                tracing::warn!(
                    endpoint = %self.shared.label,
                    channel = %channel,
                    size,
                    max,
                    "reply too large, answering with an error"
                );
                let fallback = Reply::err(
                    channel,
                    format!("reply too large: {size} bytes (max: {max} bytes)"),
                );
                self.transmit(&Envelope::Reply(fallback))?;
                Err(ProtocolError::FrameTooLarge { size, max })
            }
            other => other,
        }
    }

    /// Send a fire-and-forget event.
    pub fn emit(&self, event: Event) -> Result<(), ProtocolError> {
        self.transmit(&Envelope::Event(event))
    }

    /// Out-of-band "peer died" signal: fail everything outstanding and
    /// refuse new requests.
    pub fn mark_peer_dead(&self) {
        self.shared.close();
    }

    pub fn is_closed(&self) -> bool {
        self.shared.is_closed()
    }

    /// Resolves once the peer is gone (stream ended or marked dead).
    pub async fn closed(&self) {
        let mut rx = self.shared.closed_tx.subscribe();
        // Err means the sender was dropped, which only happens with `Shared`.
        let _ = rx.wait_for(|closed| *closed).await;
    }

    /// Number of must-reply requests awaiting an answer.
    pub fn pending_count(&self) -> usize {
        self.shared.table().waiting.len()
    }

    pub fn request_timeout(&self) -> Duration {
        self.request_timeout
    }

    /// Encode and queue one envelope. Oversized envelopes are refused here
    /// so that only I/O failures reach the writer task.
    fn transmit(&self, envelope: &Envelope) -> Result<(), ProtocolError> {
        if self.shared.is_closed() {
            return Err(ProtocolError::PeerUnavailable);
        }
        let body = encode_body(envelope, self.max_frame_bytes)?;
        self.outbound
            .send(body)
            .map_err(|_| ProtocolError::PeerUnavailable)
    }
}

// ─── Background tasks ───────────────────────────────────────────────────

async fn writer_loop<W: AsyncWrite + Unpin>(
    mut writer: FrameWriter<W>,
    mut rx: mpsc::UnboundedReceiver<Vec<u8>>,
    shared: Arc<Shared>,
) {
    while let Some(body) = rx.recv().await {
        if let Err(e) = writer.write_body(&body).await {
            tracing::warn!(endpoint = %shared.label, "write failed: {e}");
            shared.close();
            return;
        }
    }
    let _ = writer.shutdown().await;
}

async fn reader_loop<R: AsyncRead + Unpin>(
    mut reader: FrameReader<R>,
    inbound: mpsc::UnboundedSender<Inbound>,
    outbound: mpsc::UnboundedSender<Vec<u8>>,
    shared: Arc<Shared>,
) {
    let reject = |channel: Channel, error: String| {
        if let Ok(body) = encode_body(&Envelope::Reply(Reply::err(channel, error)), MAX_FRAME_BYTES) {
            let _ = outbound.send(body);
        }
    };

    loop {
        let value = match reader.read_value().await {
            Ok(Some(value)) => value,
            Ok(None) => {
                tracing::debug!(endpoint = %shared.label, "peer closed the stream");
                break;
            }
            Err(ProtocolError::MalformedEnvelope(e)) => {
                tracing::warn!(endpoint = %shared.label, "skipping undecodable frame: {e}");
                continue;
            }
            Err(e) => {
                tracing::warn!(endpoint = %shared.label, "read failed: {e}");
                break;
            }
        };

        let request_channel = value
            .get("type")
            .and(value.get("channel"))
            .and_then(Value::as_str)
            .map(Channel::from);

        match Envelope::from_value(value) {
            Ok(Envelope::Reply(reply)) => shared.resolve(reply),
            Ok(Envelope::Request(request)) => {
                let channel = request.channel.clone();
                if inbound.send(Inbound::Request(request)).is_err() {
                    reject(channel, "no handler for inbound requests".to_string());
                }
            }
            Ok(Envelope::Event(event)) => {
                let _ = inbound.send(Inbound::Event(event));
            }
            Err(e) => {
                tracing::warn!(endpoint = %shared.label, "rejecting envelope: {e}");
                if let Some(channel) = request_channel {
                    reject(channel, e.to_string());
                }
            }
        }
    }
    shared.close();
}

// ─── Tests ──────────────────────────────────────────────────────────────
