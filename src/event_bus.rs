//! In-process fan-out of decoded telemetry to any number of subscribers.
//!
//! Handlers run synchronously on the publishing thread, in registration
//! order. A handler that returns an error or panics is reported to the error
//! hook and skipped; the rest of the publish carries on.

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use log::warn;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::types::{EventKind, TelemetryEvent};

/// A subscriber callback. The event is shared read-only with every other
/// subscriber of the same publish.
pub type Handler = Arc<dyn Fn(&TelemetryEvent) -> anyhow::Result<()> + Send + Sync>;

/// Receives every handler failure.
pub type ErrorHook = Arc<dyn Fn(&HandlerFailure) + Send + Sync>;

/// Opaque handle returned by [`TelemetryBus::subscribe`]; pass it back to
/// [`TelemetryBus::unsubscribe`] to remove exactly that registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionToken(u64);

/// A handler that failed during [`TelemetryBus::publish`].
#[derive(Debug)]
pub struct HandlerFailure {
    pub token: SubscriptionToken,
    pub kind: EventKind,
    pub error: anyhow::Error,
}

struct Subscription {
    token: SubscriptionToken,
    kind: EventKind,
    handler: Handler,
}

pub struct TelemetryBus {
    subscriptions: Mutex<Vec<Subscription>>,
    error_hook: Mutex<ErrorHook>,
    next_token: AtomicU64,
}

impl Default for TelemetryBus {
    fn default() -> Self {
        Self::new()
    }
}

impl TelemetryBus {
    pub fn new() -> Self {
        Self {
            subscriptions: Mutex::new(Vec::new()),
            error_hook: Mutex::new(Arc::new(log_failure) as ErrorHook),
            next_token: AtomicU64::new(1),
        }
    }

    /// Register `handler` for events of `kind`.
    pub fn subscribe<F>(&self, kind: EventKind, handler: F) -> SubscriptionToken
    where
        F: Fn(&TelemetryEvent) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let token = SubscriptionToken(self.next_token.fetch_add(1, Ordering::Relaxed));
        self.subscriptions.lock().push(Subscription {
            token,
            kind,
            handler: Arc::new(handler),
        });
        token
    }

    /// Forward events of `kind` into an unbounded channel.
    ///
    /// The subscription removes itself on the first publish after the
    /// receiver is dropped.
    pub fn subscribe_channel(
        self: &Arc<Self>,
        kind: EventKind,
    ) -> (SubscriptionToken, mpsc::UnboundedReceiver<TelemetryEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let bus = Arc::downgrade(self);
        let token_cell: Arc<Mutex<Option<SubscriptionToken>>> = Arc::new(Mutex::new(None));
        let cell = Arc::clone(&token_cell);
        let token = self.subscribe(kind, move |event| {
            if tx.send(event.clone()).is_err() {
                if let (Some(bus), Some(token)) = (bus.upgrade(), *cell.lock()) {
                    bus.unsubscribe(token);
                }
            }
            Ok(())
        });
        *token_cell.lock() = Some(token);
        (token, rx)
    }

    /// Remove the registration behind `token`.
    ///
    /// Returns `false` if it was already gone.
    pub fn unsubscribe(&self, token: SubscriptionToken) -> bool {
        let mut subs = self.subscriptions.lock();
        match subs.iter().position(|s| s.token == token) {
            Some(i) => {
                subs.remove(i);
                true
            }
            None => false,
        }
    }

    /// Replace the hook that receives handler failures. The default logs
    /// them at `warn`.
    pub fn set_error_hook<F>(&self, hook: F)
    where
        F: Fn(&HandlerFailure) + Send + Sync + 'static,
    {
        *self.error_hook.lock() = Arc::new(hook);
    }

    pub fn subscriber_count(&self, kind: EventKind) -> usize {
        self.subscriptions.lock().iter().filter(|s| s.kind == kind).count()
    }

    /// Deliver `event` to every handler registered for its kind.
    ///
    /// The handler list is snapshotted first, so handlers may subscribe or
    /// unsubscribe (themselves included) without affecting this dispatch.
    pub fn publish(&self, event: &TelemetryEvent) {
        let kind = event.kind();
        let snapshot: Vec<(SubscriptionToken, Handler)> = self
            .subscriptions
            .lock()
            .iter()
            .filter(|s| s.kind == kind)
            .map(|s| (s.token, Arc::clone(&s.handler)))
            .collect();

        for (token, handler) in snapshot {
            let outcome = panic::catch_unwind(AssertUnwindSafe(|| handler(event)));
            let error = match outcome {
                Ok(Ok(())) => continue,
                Ok(Err(e)) => e,
                Err(payload) => anyhow::anyhow!("handler panicked: {}", panic_message(&*payload)),
            };
            let hook = Arc::clone(&*self.error_hook.lock());
            hook(&HandlerFailure { token, kind, error });
        }
    }
}

fn log_failure(failure: &HandlerFailure) {
    warn!(
        "{:?} subscriber {:?} failed: {:#}",
        failure.kind, failure.token, failure.error
    );
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_owned()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_owned()
    }
}
