//! Per-request context threaded through the pipeline and the filter layer.
//!
//! A [`Context`] is created when a request arrives and discarded once the
//! response is written. It is a cheap handle (`Clone` is one `Arc`
//! increment), so stages, filters, and spawned tasks can all hold one
//! without lifetime gymnastics.
//!
//! Two pieces carry the engine's correctness guarantees:
//!
//! - the **response slot** — first commit wins. A later commit (a generic
//!   500 racing an already-sent response, an external timeout collaborator
//!   racing a late handler) is refused and logged, never written.
//! - the **proceed gate** — the capability a before-filter invokes via
//!   [`Context::continue_to_action`] to let the controller action run.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use http::Method;
use serde_json::Value;
use tokio::sync::Notify;
use tracing::{debug, warn};

use crate::request::Request;
use crate::response::Response;

/// Cheaply-cloneable per-request state.
#[derive(Clone)]
pub struct Context {
    inner: Arc<Inner>,
}

struct Inner {
    request: Request,
    path: String,
    method: Method,
    params: Mutex<HashMap<String, String>>,
    state: Mutex<HashMap<String, Value>>,
    requested_action: Mutex<Option<String>>,
    response: Mutex<Option<Response>>,
    gate: Gate,
}

impl Context {
    pub fn new(request: Request) -> Self {
        let path = request.path().to_owned();
        let method = request.method().clone();
        Self {
            inner: Arc::new(Inner {
                request,
                path,
                method,
                params: Mutex::new(HashMap::new()),
                state: Mutex::new(HashMap::new()),
                requested_action: Mutex::new(None),
                response: Mutex::new(None),
                gate: Gate::new(),
            }),
        }
    }

    pub fn request(&self) -> &Request {
        &self.inner.request
    }

    pub fn path(&self) -> &str {
        &self.inner.path
    }

    pub fn method(&self) -> &Method {
        &self.inner.method
    }

    // ── Route params and per-request state ───────────────────────────────────

    /// Returns a named path parameter, set by the router at dispatch.
    pub fn param(&self, key: &str) -> Option<String> {
        self.inner.params.lock().expect("params lock").get(key).cloned()
    }

    pub(crate) fn set_params(&self, params: HashMap<String, String>) {
        *self.inner.params.lock().expect("params lock") = params;
    }

    /// Stores a per-request state value (authenticated user, request id,
    /// anything a middleware wants downstream stages to see).
    pub fn set_state(&self, key: impl Into<String>, value: impl Into<Value>) {
        self.inner
            .state
            .lock()
            .expect("state lock")
            .insert(key.into(), value.into());
    }

    pub fn state(&self, key: &str) -> Option<Value> {
        self.inner.state.lock().expect("state lock").get(key).cloned()
    }

    // ── Requested action ─────────────────────────────────────────────────────

    /// The controller action this request resolved to, once routing ran.
    pub fn requested_action(&self) -> Option<String> {
        self.inner
            .requested_action
            .lock()
            .expect("action lock")
            .clone()
    }

    pub(crate) fn set_requested_action(&self, action: &str) {
        *self.inner.requested_action.lock().expect("action lock") = Some(action.to_owned());
    }

    // ── Response slot ────────────────────────────────────────────────────────

    /// Commits `response` as the reply for this request. First commit wins:
    /// returns `false` (and logs) if a response was already committed, and
    /// the slot is left untouched.
    pub fn respond(&self, response: Response) -> bool {
        let mut slot = self.inner.response.lock().expect("response lock");
        if slot.is_some() {
            warn!(
                path = %self.inner.path,
                status = %response.status_code(),
                "response already committed, refusing second write"
            );
            return false;
        }
        *slot = Some(response);
        true
    }

    /// Whether a response has been committed.
    pub fn is_committed(&self) -> bool {
        self.inner.response.lock().expect("response lock").is_some()
    }

    /// Takes the committed response out of the slot, if any. Called once by
    /// the server when the pipeline finishes.
    pub fn take_response(&self) -> Option<Response> {
        self.inner.response.lock().expect("response lock").take()
    }

    // ── Proceed gate ─────────────────────────────────────────────────────────

    /// Lets the dispatched action proceed. Before-filters call this when
    /// they are satisfied; a second call is a no-op.
    pub fn continue_to_action(&self) {
        if !self.inner.gate.open() {
            debug!(path = %self.inner.path, "continue_to_action called again, ignoring");
        }
    }

    pub(crate) fn continue_called(&self) -> bool {
        self.inner.gate.is_open()
    }

    /// Resolves once [`Context::continue_to_action`] has been called.
    /// Dispatch awaits this between the before-filter phase and the action.
    pub(crate) async fn await_continue(&self) {
        self.inner.gate.opened().await;
    }
}

// ── Gate ─────────────────────────────────────────────────────────────────────

/// One-shot idempotent latch: opens once, stays open, wakes every waiter.
struct Gate {
    open: AtomicBool,
    notify: Notify,
}

impl Gate {
    fn new() -> Self {
        Self { open: AtomicBool::new(false), notify: Notify::new() }
    }

    /// Opens the gate. Returns `false` if it was already open.
    fn open(&self) -> bool {
        if self.open.swap(true, Ordering::AcqRel) {
            return false;
        }
        self.notify.notify_waiters();
        true
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    async fn opened(&self) {
        // notify_waiters does not store a permit, so re-check the flag
        // after registering interest to avoid a lost wakeup.
        while !self.is_open() {
            let notified = self.notify.notified();
            if self.is_open() {
                break;
            }
            notified.await;
        }
    }
}
