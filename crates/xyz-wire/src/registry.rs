//! Action registry: maps action names to handlers.
//!
//! The [`ActionRegistry`] is shared between the node's public API (which
//! registers handlers) and every inbound connection (which dispatches to
//! them). Registering a name that already exists replaces the old handler.
//!
//! Handlers answer through a [`Responder`]. A responder accepts exactly one
//! reply; later attempts return [`XyzError::DuplicateResponse`].

use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex, RwLock};
use tokio::sync::oneshot;
use tracing::{error, warn};
use xyz_types::{XyzError, XyzResult};

/// What a handler produced: a reply value or a failure reason.
pub type HandlerOutcome = Result<Value, String>;

/// A named operation exposed to peers.
///
/// Implemented for every `Fn(Value, Responder)` closure, so most callers
/// register closures directly. The handler may reply synchronously or move
/// the responder into a task and reply later.
pub trait ActionHandler: Send + Sync + 'static {
    fn handle(&self, payload: Value, responder: Responder);
}

impl<F> ActionHandler for F
where
    F: Fn(Value, Responder) + Send + Sync + 'static,
{
    fn handle(&self, payload: Value, responder: Responder) {
        self(payload, responder)
    }
}

/// Handle a handler uses to answer one inbound request.
pub struct Responder {
    request_id: String,
    action: String,
    slot: Mutex<Option<oneshot::Sender<HandlerOutcome>>>,
}

impl Responder {
    pub(crate) fn new(
        request_id: impl Into<String>,
        action: impl Into<String>,
    ) -> (Self, oneshot::Receiver<HandlerOutcome>) {
        let (tx, rx) = oneshot::channel();
        let responder = Self {
            request_id: request_id.into(),
            action: action.into(),
            slot: Mutex::new(Some(tx)),
        };
        (responder, rx)
    }

    /// Id of the request being answered.
    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    /// Action the request named.
    pub fn action(&self) -> &str {
        &self.action
    }

    /// Whether a reply has already been sent.
    pub fn is_sent(&self) -> bool {
        self.slot.lock().unwrap_or_else(|e| e.into_inner()).is_none()
    }

    /// Reply with a value.
    pub fn send<T: Serialize>(&self, value: T) -> XyzResult<()> {
        let payload =
            serde_json::to_value(value).map_err(|e| XyzError::Serialization(e.to_string()))?;
        self.finish(Ok(payload))
    }

    /// Reply with a failure; the caller receives it as a remote error.
    pub fn fail(&self, message: impl Into<String>) -> XyzResult<()> {
        self.finish(Err(message.into()))
    }

    fn finish(&self, outcome: HandlerOutcome) -> XyzResult<()> {
        let sender = self.slot.lock().unwrap_or_else(|e| e.into_inner()).take();
        match sender {
            Some(tx) => {
                // The receiver is gone only if the inbound connection closed.
                let _ = tx.send(outcome);
                Ok(())
            }
            None => {
                warn!(
                    request_id = %self.request_id,
                    action = %self.action,
                    "Handler attempted to respond more than once"
                );
                Err(XyzError::DuplicateResponse(self.request_id.clone()))
            }
        }
    }
}

impl fmt::Debug for Responder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Responder")
            .field("request_id", &self.request_id)
            .field("action", &self.action)
            .field("sent", &self.is_sent())
            .finish()
    }
}

/// Thread-safe registry of local action handlers.
#[derive(Clone, Default)]
pub struct ActionRegistry {
    handlers: Arc<RwLock<HashMap<String, Arc<dyn ActionHandler>>>>,
}

impl ActionRegistry {
    /// Create a new empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` under `name`, replacing any previous handler.
    ///
    /// Returns `true` if an existing handler was replaced.
    pub fn register<H: ActionHandler>(&self, name: &str, handler: H) -> XyzResult<bool> {
        if name.trim().is_empty() {
            return Err(XyzError::InvalidActionName(name.to_string()));
        }
        let mut handlers = self.handlers.write().unwrap_or_else(|e| e.into_inner());
        Ok(handlers
            .insert(name.to_string(), Arc::new(handler))
            .is_some())
    }

    /// Remove a handler. Returns `true` if one was registered.
    pub fn unregister(&self, name: &str) -> bool {
        let mut handlers = self.handlers.write().unwrap_or_else(|e| e.into_inner());
        handlers.remove(name).is_some()
    }

    /// Whether an action is registered.
    pub fn contains(&self, name: &str) -> bool {
        let handlers = self.handlers.read().unwrap_or_else(|e| e.into_inner());
        handlers.contains_key(name)
    }

    /// Registered action names, sorted.
    pub fn names(&self) -> Vec<String> {
        let handlers = self.handlers.read().unwrap_or_else(|e| e.into_inner());
        let mut names: Vec<String> = handlers.keys().cloned().collect();
        names.sort();
        names
    }

    /// Number of registered actions.
    pub fn len(&self) -> usize {
        let handlers = self.handlers.read().unwrap_or_else(|e| e.into_inner());
        handlers.len()
    }

    /// Whether no actions are registered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Invoke the handler for `action` and return the channel its reply
    /// will arrive on.
    ///
    /// The receiver resolves to an error if the handler drops its responder
    /// without replying, including when the handler panics.
    pub fn dispatch(
        &self,
        request_id: &str,
        action: &str,
        payload: Value,
    ) -> XyzResult<oneshot::Receiver<HandlerOutcome>> {
        let handler = {
            let handlers = self.handlers.read().unwrap_or_else(|e| e.into_inner());
            handlers
                .get(action)
                .cloned()
                .ok_or_else(|| XyzError::ActionNotFound(action.to_string()))?
        };
        // Lock released: handlers may register further actions.
        let (responder, rx) = Responder::new(request_id, action);
        if catch_unwind(AssertUnwindSafe(|| handler.handle(payload, responder))).is_err() {
            error!(request_id, action, "Handler panicked");
        }
        Ok(rx)
    }
}

impl fmt::Debug for ActionRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActionRegistry")
            .field("actions", &self.names())
            .finish()
    }
}
