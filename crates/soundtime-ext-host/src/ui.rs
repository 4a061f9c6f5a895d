//! Deferred delivery to the user interface.
//!
//! Extensions may talk to the UI before it exists (for instance during
//! startup discovery). Such requests wait in a FIFO queue and are flushed
//! in order, once each, when a surface is attached.

use std::collections::VecDeque;
use std::sync::Arc;

use serde_json::Value;
use soundtime_ext_core::Request;
use tokio::sync::{oneshot, Mutex};

use crate::collaborator::Collaborator;

struct Queued {
    request: Request,
    respond: oneshot::Sender<Result<Value, String>>,
}

#[derive(Default)]
struct UiState {
    surface: Option<Arc<dyn Collaborator>>,
    queue: VecDeque<Queued>,
    flushing: bool,
}

#[derive(Default)]
pub struct DeferredUi {
    state: Mutex<UiState>,
}

impl DeferredUi {
    pub fn new() -> Self {
        Self::default()
    }

    /// Deliver `request` now if a surface is attached and nothing is
    /// queued ahead of it; otherwise wait for the flush.
    pub async fn dispatch(&self, request: Request) -> Result<Value, String> {
        let mut state = self.state.lock().await;
        let ready = match &state.surface {
            Some(surface) if !state.flushing && state.queue.is_empty() => Some(Arc::clone(surface)),
            _ => None,
        };
        if let Some(surface) = ready {
            drop(state);
            return surface.handle(request).await;
        }

        let (tx, rx) = oneshot::channel();
        tracing::debug!(
            message_type = ?request.message_type,
            queued = state.queue.len() + 1,
            "user interface not ready, deferring request"
        );
        state.queue.push_back(Queued {
            request,
            respond: tx,
        });
        drop(state);

        rx.await
            .unwrap_or_else(|_| Err("user interface went away".to_string()))
    }

    /// Attach (or replace) the surface and flush everything queued so far.
    ///
    /// If a flush is already running it keeps going and delivers the rest
    /// of the queue to the new surface.
    pub async fn attach(&self, surface: Arc<dyn Collaborator>) {
        {
            let mut state = self.state.lock().await;
            state.surface = Some(surface);
            if state.flushing {
                return;
            }
            state.flushing = true;
            tracing::debug!(count = state.queue.len(), "flushing deferred UI requests");
        }

        loop {
            // Surface is re-read per request so a replacement takes effect.
            let (queued, surface) = {
                let mut state = self.state.lock().await;
                let next = match state.surface.clone() {
                    Some(surface) => state.queue.pop_front().map(|queued| (queued, surface)),
                    None => None,
                };
                match next {
                    Some(next) => next,
                    None => {
                        state.flushing = false;
                        break;
                    }
                }
            };
            let outcome = surface.handle(queued.request).await;
            let _ = queued.respond.send(outcome);
        }
    }

    pub async fn is_attached(&self) -> bool {
        self.state.lock().await.surface.is_some()
    }

    pub async fn pending(&self) -> usize {
        self.state.lock().await.queue.len()
    }
}
