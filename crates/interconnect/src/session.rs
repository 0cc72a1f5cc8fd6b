use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use crate::endpoint::Dispatch;
use crate::error::IcError;
use crate::frame::{ErrorPayload, Frame};

/// Outbound half of the physical connection. Every encoded frame is pushed as
/// one text message; the owner of the socket drains the receiver.
pub type IcTransport = mpsc::UnboundedSender<String>;

const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
pub struct IcOptions {
    pub request_timeout: Duration,
}

impl Default for IcOptions {
    fn default() -> Self {
        Self {
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }
}

type PendingReply = oneshot::Sender<Result<Value, IcError>>;

/// A live interconnect session bound to one transport.
#[derive(Clone)]
pub struct IcSession {
    inner: Arc<SessionInner>,
}

struct SessionInner {
    transport: IcTransport,
    options: IcOptions,
    next_id: AtomicU64,
    pending: Mutex<HashMap<String, PendingReply>>,
    dispatch: Mutex<Option<Arc<dyn Dispatch>>>,
    notifications: Mutex<Option<mpsc::UnboundedSender<BoxFuture<'static, ()>>>>,
    closed: AtomicBool,
}

impl IcSession {
    pub(crate) fn start(
        dispatch: Arc<dyn Dispatch>,
        transport: IcTransport,
        options: IcOptions,
    ) -> Self {
        let (notify_tx, mut notify_rx) = mpsc::unbounded_channel::<BoxFuture<'static, ()>>();
        tokio::spawn(async move {
            while let Some(handler) = notify_rx.recv().await {
                handler.await;
            }
        });

        Self {
            inner: Arc::new(SessionInner {
                transport,
                options,
                next_id: AtomicU64::new(1),
                pending: Mutex::new(HashMap::new()),
                dispatch: Mutex::new(Some(dispatch)),
                notifications: Mutex::new(Some(notify_tx)),
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// Send a request and wait for the correlated reply.
    pub async fn request<T>(&self, name: &str, payload: impl Serialize) -> Result<T, IcError>
    where
        T: DeserializeOwned,
    {
        if self.is_closed() {
            return Err(IcError::ConnectionClosed);
        }
        let payload =
            serde_json::to_value(payload).map_err(|err| IcError::Encode(err.to_string()))?;
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed).to_string();

        let (tx, rx) = oneshot::channel();
        self.inner.pending.lock().insert(id.clone(), tx);
        // close() drains the table after flipping the flag, so re-check once
        // the entry is visible.
        if self.is_closed() {
            self.inner.pending.lock().remove(&id);
            return Err(IcError::ConnectionClosed);
        }

        let frame = Frame::Request {
            id: id.clone(),
            name: name.to_string(),
            payload,
        };
        if let Err(err) = self.send_frame(&frame) {
            self.inner.pending.lock().remove(&id);
            return Err(err);
        }

        let value = match tokio::time::timeout(self.inner.options.request_timeout, rx).await {
            Ok(Ok(result)) => result?,
            Ok(Err(_)) => return Err(IcError::ConnectionClosed),
            Err(_) => {
                self.inner.pending.lock().remove(&id);
                return Err(IcError::Timeout {
                    name: name.to_string(),
                });
            }
        };

        serde_json::from_value(value).map_err(|err| IcError::InvalidPayload {
            name: name.to_string(),
            message: err.to_string(),
        })
    }

    /// Fire-and-forget notification.
    pub fn notify(&self, name: &str, payload: impl Serialize) -> Result<(), IcError> {
        if self.is_closed() {
            return Err(IcError::ConnectionClosed);
        }
        let payload =
            serde_json::to_value(payload).map_err(|err| IcError::Encode(err.to_string()))?;
        self.send_frame(&Frame::Notification {
            name: name.to_string(),
            payload,
        })
    }

    /// Feed one inbound text frame. Must be called in arrival order.
    ///
    /// Responses resolve pending requests inline, requests are executed on
    /// their own task, notifications are queued to the ordered worker.
    pub fn receive(&self, text: &str) -> Result<(), IcError> {
        if self.is_closed() {
            return Err(IcError::ConnectionClosed);
        }
        match Frame::decode(text)? {
            Frame::Response {
                id,
                ok,
                payload,
                error,
            } => {
                let waiter = self.inner.pending.lock().remove(&id);
                let Some(waiter) = waiter else {
                    debug!(request_id = %id, "response for unknown or expired request");
                    return Ok(());
                };
                let result = if ok {
                    Ok(payload.unwrap_or(Value::Null))
                } else {
                    let error = error.unwrap_or_else(|| {
                        ErrorPayload::new("unknown", "error response without detail")
                    });
                    Err(IcError::Remote {
                        code: error.code,
                        message: error.message,
                    })
                };
                let _ = waiter.send(result);
                Ok(())
            }
            Frame::Request { id, name, payload } => {
                let dispatch = self.dispatch()?;
                match dispatch.request(&name, payload) {
                    Ok(handler) => {
                        let session = self.clone();
                        tokio::spawn(async move {
                            let reply = match handler.await {
                                Ok(value) => Frame::success(id, value),
                                Err(err) => Frame::failure(id, err.into()),
                            };
                            if let Err(err) = session.send_frame(&reply) {
                                debug!(request = %name, error = %err, "dropping reply");
                            }
                        });
                        Ok(())
                    }
                    Err(err) => {
                        warn!(request = %name, error = %err, "rejecting inbound request");
                        let _ = self.send_frame(&Frame::failure(
                            id,
                            ErrorPayload::new(err.code(), err.to_string()),
                        ));
                        Err(err)
                    }
                }
            }
            Frame::Notification { name, payload } => {
                let handler = self.dispatch()?.notification(&name, payload)?;
                let queue = self.inner.notifications.lock().clone();
                match queue {
                    Some(queue) => queue
                        .send(handler)
                        .map_err(|_| IcError::ConnectionClosed),
                    None => Err(IcError::ConnectionClosed),
                }
            }
        }
    }

    /// Close the session. Every pending request fails with
    /// [`IcError::ConnectionClosed`]. Idempotent.
    pub fn close(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let pending: Vec<PendingReply> = self
            .inner
            .pending
            .lock()
            .drain()
            .map(|(_, waiter)| waiter)
            .collect();
        for waiter in pending {
            let _ = waiter.send(Err(IcError::ConnectionClosed));
        }
        self.inner.dispatch.lock().take();
        self.inner.notifications.lock().take();
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    pub fn pending_requests(&self) -> usize {
        self.inner.pending.lock().len()
    }

    fn dispatch(&self) -> Result<Arc<dyn Dispatch>, IcError> {
        self.inner
            .dispatch
            .lock()
            .clone()
            .ok_or(IcError::ConnectionClosed)
    }

    fn send_frame(&self, frame: &Frame) -> Result<(), IcError> {
        let text = frame.encode()?;
        self.inner
            .transport
            .send(text)
            .map_err(|_| IcError::ConnectionClosed)
    }
}
