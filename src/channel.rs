use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use futures::future::BoxFuture;
use serde_json::{Value, json};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use crate::error::{ErrorPayload, ModuleError, RpcError};
use crate::rpc::{CallEnvelope, Envelope, ResponseEnvelope};

/// Correlation ids are monotonically increasing and wrap at this ceiling.
/// Wraparound is safe only because pending calls are short-lived: by the time
/// the counter comes back around, the old id's bookkeeping is long gone. The
/// allocator still skips live ids and flags a collision in debug builds.
pub const CALLBACK_ID_CEILING: u32 = 1 << 24;

type PendingCall = oneshot::Sender<Result<Option<Value>, RpcError>>;

/// Handler invoked for one inbound call. Returns the response payload, or an
/// error that is serialized back to the caller — it never crosses the process
/// boundary as a raw failure.
pub type InboundHandler =
    Arc<dyn Fn(Option<Value>) -> BoxFuture<'static, Result<Option<Value>, ModuleError>> + Send + Sync>;

/// Cheap clonable write-side handle. The transport drains the paired receiver
/// and frames each envelope however it likes.
#[derive(Clone, Debug)]
pub struct Outbound {
    tx: mpsc::UnboundedSender<Envelope>,
}

impl Outbound {
    pub fn new(tx: mpsc::UnboundedSender<Envelope>) -> Self {
        Self { tx }
    }

    /// Build an outbound handle together with the receiver the transport
    /// (or a test) drains.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<Envelope>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// Transmit a call that expects no reply.
    pub fn send_fire_and_forget(
        &self,
        name: impl Into<String>,
        payload: Option<Value>,
    ) -> Result<(), RpcError> {
        self.transmit(Envelope::Call(CallEnvelope::fire_and_forget(name, payload)))
    }

    pub(crate) fn transmit(&self, envelope: Envelope) -> Result<(), RpcError> {
        self.tx.send(envelope).map_err(|_| RpcError::TransportClosed)
    }
}

/// The RPC correlation layer: maps logical call names to correlated
/// request/response pairs over an ordering-agnostic transport, and delivers
/// inbound calls to the handlers registered at construction.
pub struct RpcChannel {
    outbound: Outbound,
    handlers: HashMap<String, InboundHandler>,
    pending: Arc<DashMap<u32, PendingCall>>,
    next_id: AtomicU32,
    default_timeout: Duration,
}

impl RpcChannel {
    /// Handler registration is fixed here; there is no dynamic add/remove.
    pub fn new(
        outbound: Outbound,
        handlers: HashMap<String, InboundHandler>,
        default_timeout: Duration,
    ) -> Self {
        Self {
            outbound,
            handlers,
            pending: Arc::new(DashMap::new()),
            next_id: AtomicU32::new(1),
            default_timeout,
        }
    }

    pub fn outbound(&self) -> Outbound {
        self.outbound.clone()
    }

    /// Transmit a call and await its correlated response. Resolves with the
    /// response payload, or rejects with a timeout or remote error. A late
    /// response arriving after the timeout is silently dropped.
    pub async fn send_with_response(
        &self,
        name: impl Into<String>,
        payload: Option<Value>,
        timeout: Option<Duration>,
    ) -> Result<Option<Value>, RpcError> {
        let name = name.into();
        let timeout = timeout.unwrap_or(self.default_timeout);
        let callback_id = self.allocate_callback_id();

        let (tx, rx) = oneshot::channel();
        self.pending.insert(callback_id, tx);

        if let Err(err) =
            self.outbound
                .transmit(Envelope::Call(CallEnvelope::with_callback(&name, payload, callback_id)))
        {
            self.pending.remove(&callback_id);
            return Err(err);
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => {
                // settle-side dropped without answering
                self.pending.remove(&callback_id);
                Err(RpcError::TransportClosed)
            }
            Err(_) => {
                self.pending.remove(&callback_id);
                Err(RpcError::Timeout { name, timeout_ms: timeout.as_millis() as u64 })
            }
        }
    }

    /// Transmit a call with no correlation id; never waits for a reply.
    pub fn send_fire_and_forget(
        &self,
        name: impl Into<String>,
        payload: Option<Value>,
    ) -> Result<(), RpcError> {
        self.outbound.send_fire_and_forget(name, payload)
    }

    /// Dispatch one inbound envelope. Never fails: malformed or unknown
    /// messages are reported back over the envelope channel or logged.
    pub fn receive(&self, envelope: Envelope) {
        match envelope {
            Envelope::Call(call) => self.receive_call(call),
            Envelope::Response(response) => self.receive_response(response),
        }
    }

    fn receive_call(&self, call: CallEnvelope) {
        let Some(handler) = self.handlers.get(&call.name) else {
            match call.callback_id {
                Some(callback_id) => {
                    let err = ModuleError::UnknownCommand(call.name.clone());
                    let payload = json!(ErrorPayload::from(&err));
                    let _ = self
                        .outbound
                        .transmit(Envelope::Response(ResponseEnvelope::fail(callback_id, Some(payload))));
                }
                None => debug!(name = %call.name, "dropping notification for unknown command"),
            }
            return;
        };

        let fut = handler(call.payload);
        let outbound = self.outbound.clone();
        let name = call.name;
        let callback_id = call.callback_id;
        tokio::spawn(async move {
            let result = fut.await;
            match (callback_id, result) {
                (Some(id), Ok(payload)) => {
                    let _ = outbound.transmit(Envelope::Response(ResponseEnvelope::success(id, payload)));
                }
                (Some(id), Err(err)) => {
                    let payload = json!(ErrorPayload::from(&err));
                    let _ = outbound.transmit(Envelope::Response(ResponseEnvelope::fail(id, Some(payload))));
                }
                (None, Ok(_)) => {}
                (None, Err(err)) => warn!(name = %name, error = %err, "notification handler failed"),
            }
        });
    }

    fn receive_response(&self, response: ResponseEnvelope) {
        let Some((_, pending)) = self.pending.remove(&response.callback_id) else {
            // already timed out, or a duplicate — drop it
            debug!(callback_id = response.callback_id, "ignoring unmatched response");
            return;
        };
        let result = if response.success {
            Ok(response.payload)
        } else {
            Err(RpcError::Remote(ErrorPayload::describe(response.payload.as_ref())))
        };
        let _ = pending.send(result);
    }

    fn allocate_callback_id(&self) -> u32 {
        loop {
            // the ceiling divides 2^32, so the atomic's own wraparound never
            // skews the sequence
            let id = self.next_id.fetch_add(1, Ordering::Relaxed) % CALLBACK_ID_CEILING;
            if !self.pending.contains_key(&id) {
                return id;
            }
            debug_assert!(false, "correlation id {id} still in flight at wraparound");
            warn!(callback_id = id, "skipping correlation id still in flight");
        }
    }
}
