//! Extended-execution handling while the host is backgrounded.
//!
//! The host platform owns the actual grant mechanism; this module only
//! decides when to ask for it and when to give it back.

use std::sync::{Arc, Mutex};

/// Callback invoked by the host when a grant runs out.
pub type ExpiryHandler = Box<dyn FnOnce() + Send>;

/// Host hook for keeping the process running after it is backgrounded.
pub trait ExtendedExecution: Send + Sync {
    /// Ask for extra running time. The host calls `on_expire` if the grant
    /// runs out before [`end`](Self::end) is called.
    fn begin(&self, on_expire: ExpiryHandler);

    /// Give the grant back.
    fn end(&self);
}

/// Host without a background concept (desktop, server). Grants are no-ops.
#[derive(Debug, Default)]
pub struct UnmanagedExecution;

impl ExtendedExecution for UnmanagedExecution {
    fn begin(&self, _on_expire: ExpiryHandler) {
        tracing::debug!("Extended execution requested; host does not manage background time");
    }

    fn end(&self) {}
}

#[derive(Debug, Default)]
struct GuardState {
    allowed: bool,
    /// Generation of the grant currently held
    grant: Option<u64>,
    next_grant: u64,
}

/// Requests and releases extended execution on behalf of the scheduler.
///
/// Expiry is treated exactly like an explicit release. Streaming itself is
/// never stopped from here.
#[derive(Clone)]
pub struct LifecycleGuard {
    host: Arc<dyn ExtendedExecution>,
    state: Arc<Mutex<GuardState>>,
}

impl LifecycleGuard {
    pub fn new(host: Arc<dyn ExtendedExecution>, allowed: bool) -> Self {
        Self {
            host,
            state: Arc::new(Mutex::new(GuardState {
                allowed,
                ..GuardState::default()
            })),
        }
    }

    pub fn is_allowed(&self) -> bool {
        self.lock().allowed
    }

    /// Whether a grant is currently held.
    pub fn is_held(&self) -> bool {
        self.lock().grant.is_some()
    }

    /// Allow or forbid background streaming. Forbidding gives back any grant
    /// already held.
    pub fn set_allowed(&self, allowed: bool) {
        self.lock().allowed = allowed;
        if !allowed {
            self.release();
        }
    }

    /// The host is about to be backgrounded. A grant is requested only when
    /// background streaming is allowed and the scheduler is streaming.
    pub fn enter_background(&self, streaming: bool) {
        let generation = {
            let mut state = self.lock();
            if !state.allowed || !streaming || state.grant.is_some() {
                return;
            }
            state.next_grant += 1;
            state.grant = Some(state.next_grant);
            state.next_grant
        };

        tracing::info!("Requesting extended execution");
        let guard = self.clone();
        self.host
            .begin(Box::new(move || guard.expire(generation)));
    }

    /// The host returned to the foreground.
    pub fn enter_foreground(&self) {
        self.release();
    }

    /// Give back the grant, if any.
    pub fn release(&self) {
        let held = self.lock().grant.take();
        if held.is_some() {
            tracing::info!("Releasing extended execution");
            self.host.end();
        }
    }

    fn expire(&self, generation: u64) {
        let current = {
            let mut state = self.lock();
            if state.grant == Some(generation) {
                state.grant.take()
            } else {
                None
            }
        };
        if current.is_some() {
            tracing::info!("Extended execution expired");
            self.host.end();
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, GuardState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}
