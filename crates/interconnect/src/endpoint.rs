use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use futures::future::BoxFuture;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use crate::error::IcError;
use crate::frame::ErrorPayload;
use crate::session::{IcOptions, IcSession, IcTransport};

/// Error returned by a request handler; travels back to the caller as an
/// error response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandlerError {
    pub code: String,
    pub message: String,
}

impl HandlerError {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
        }
    }
}

impl From<IcError> for HandlerError {
    fn from(err: IcError) -> Self {
        HandlerError::new(err.code(), err.to_string())
    }
}

impl From<HandlerError> for ErrorPayload {
    fn from(err: HandlerError) -> Self {
        ErrorPayload::new(err.code, err.message)
    }
}

type RequestFn<C> = Arc<
    dyn Fn(C, Value) -> Result<BoxFuture<'static, Result<Value, HandlerError>>, IcError>
        + Send
        + Sync,
>;
type NotificationFn<C> =
    Arc<dyn Fn(C, Value) -> Result<BoxFuture<'static, ()>, IcError> + Send + Sync>;

/// Typed handler table for one side of an interconnect connection.
///
/// `C` is the per-connection context handed to every handler; it is cloned
/// for each dispatched frame.
pub struct Endpoint<C> {
    requests: HashMap<String, RequestFn<C>>,
    notifications: HashMap<String, NotificationFn<C>>,
}

impl<C> Default for Endpoint<C> {
    fn default() -> Self {
        Self {
            requests: HashMap::new(),
            notifications: HashMap::new(),
        }
    }
}

impl<C> Endpoint<C>
where
    C: Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a request handler. The payload is decoded into `P` before the
    /// handler runs; a payload that does not fit is answered with an
    /// `invalid_payload` error and the handler is never invoked.
    pub fn request<P, R, F, Fut>(mut self, name: &str, handler: F) -> Self
    where
        P: DeserializeOwned + Send + 'static,
        R: Serialize + Send + 'static,
        F: Fn(C, P) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<R, HandlerError>> + Send + 'static,
    {
        let method = name.to_string();
        let erased: RequestFn<C> = Arc::new(move |ctx: C, payload: Value| {
            let params = decode_payload::<P>(&method, payload)?;
            let pending = handler(ctx, params);
            let fut: BoxFuture<'static, Result<Value, HandlerError>> = Box::pin(async move {
                let reply = pending.await?;
                serde_json::to_value(reply)
                    .map_err(|err| HandlerError::new("encode_error", err.to_string()))
            });
            Ok(fut)
        });
        self.requests.insert(name.to_string(), erased);
        self
    }

    /// Register a notification handler. Notifications on one connection run
    /// in arrival order.
    pub fn notification<P, F, Fut>(mut self, name: &str, handler: F) -> Self
    where
        P: DeserializeOwned + Send + 'static,
        F: Fn(C, P) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let method = name.to_string();
        let erased: NotificationFn<C> = Arc::new(move |ctx: C, payload: Value| {
            let params = decode_payload::<P>(&method, payload)?;
            let fut: BoxFuture<'static, ()> = Box::pin(handler(ctx, params));
            Ok(fut)
        });
        self.notifications.insert(name.to_string(), erased);
        self
    }

    pub fn handles(&self, name: &str) -> bool {
        self.requests.contains_key(name) || self.notifications.contains_key(name)
    }

    /// Bind this endpoint to a live transport.
    pub fn connect(self: &Arc<Self>, ctx: C, transport: IcTransport) -> IcSession {
        self.connect_with(ctx, transport, IcOptions::default())
    }

    pub fn connect_with(
        self: &Arc<Self>,
        ctx: C,
        transport: IcTransport,
        options: IcOptions,
    ) -> IcSession {
        let bound = Bound {
            endpoint: Arc::clone(self),
            ctx,
        };
        IcSession::start(Arc::new(bound), transport, options)
    }
}

fn decode_payload<P: DeserializeOwned>(name: &str, payload: Value) -> Result<P, IcError> {
    serde_json::from_value(payload).map_err(|err| IcError::InvalidPayload {
        name: name.to_string(),
        message: err.to_string(),
    })
}

/// Object-safe view of an endpoint bound to its connection context.
pub(crate) trait Dispatch: Send + Sync {
    fn request(
        &self,
        name: &str,
        payload: Value,
    ) -> Result<BoxFuture<'static, Result<Value, HandlerError>>, IcError>;

    fn notification(&self, name: &str, payload: Value) -> Result<BoxFuture<'static, ()>, IcError>;
}

struct Bound<C> {
    endpoint: Arc<Endpoint<C>>,
    ctx: C,
}

impl<C> Dispatch for Bound<C>
where
    C: Clone + Send + Sync + 'static,
{
    fn request(
        &self,
        name: &str,
        payload: Value,
    ) -> Result<BoxFuture<'static, Result<Value, HandlerError>>, IcError> {
        let handler = self
            .endpoint
            .requests
            .get(name)
            .ok_or_else(|| IcError::UnknownMethod(name.to_string()))?;
        handler(self.ctx.clone(), payload)
    }

    fn notification(&self, name: &str, payload: Value) -> Result<BoxFuture<'static, ()>, IcError> {
        let handler = self
            .endpoint
            .notifications
            .get(name)
            .ok_or_else(|| IcError::UnknownMethod(name.to_string()))?;
        handler(self.ctx.clone(), payload)
    }
}
