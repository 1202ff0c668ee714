//! Handlers, the assigner that maps method names onto them, and the
//! per-request context they execute under.
//!
//! A [`Handler`] is any code that can be invoked for an inbound request or
//! notification.  The server consults an [`Assigner`] once per request to
//! find the handler; [`Router`] is the map-backed assigner most callers
//! want, and the [`handler_fn`]/[`method_fn`] adapters wrap plain async
//! functions so nobody has to implement the trait by hand.
use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::value::{RawValue, to_raw_value};
use tokio_util::sync::CancellationToken;

use crate::error::HandlerError;
use crate::types::{ErrorObject, Request};

/// Per-request execution context handed to handlers.
///
/// Carries a cancellation token and request-scoped values keyed by their
/// type, so a `req_context` hook can smuggle peer identity, trace metadata,
/// or anything else to handlers without this crate defining those types.
/// The server derives the token from the connection's root by default, so
/// stopping the server propagates into running handlers that care to check.
#[derive(Clone, Default)]
pub struct Context {
    cancel: CancellationToken,
    values: Arc<HashMap<TypeId, Arc<dyn Any + Send + Sync>>>,
}

impl Context {
    /// A fresh empty context with its own cancellation root.
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn with_cancel(cancel: CancellationToken) -> Self {
        Self {
            cancel,
            values: Arc::new(HashMap::new()),
        }
    }

    /// Attach a request-scoped value, replacing any existing value of the
    /// same type.
    ///
    /// Contexts already cloned from this one keep the values they had; the
    /// returned context carries the new one.
    pub fn with_value<T: Send + Sync + 'static>(self, value: T) -> Self {
        let mut values = (*self.values).clone();
        values.insert(TypeId::of::<T>(), Arc::new(value));
        Self {
            cancel: self.cancel,
            values: Arc::new(values),
        }
    }

    /// Look up a request-scoped value by type.
    pub fn value<T: Send + Sync + 'static>(&self) -> Option<&T> {
        self.values
            .get(&TypeId::of::<T>())
            .and_then(|value| value.downcast_ref())
    }

    /// The cancellation token scoped to this request.
    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Completes when the request is cancelled (for servers, when the
    /// connection is being shut down).
    pub async fn cancelled(&self) {
        self.cancel.cancelled().await
    }
}

/// A handler for JSON-RPC methods and notifications.
///
/// The same handler serves both invocation styles: for a method call the
/// returned value is marshalled into the response, for a notification it is
/// discarded.  Errors from a notification handler are logged and dropped,
/// never sent.
#[async_trait]
pub trait Handler: Send + Sync + 'static {
    async fn call(&self, ctx: Context, req: Request) -> Result<Box<RawValue>, HandlerError>;
}

/// Maps a method name to the handler responsible for it, or reports that
/// there is none.
///
/// The dispatcher consults the assigner once per request and takes no lock
/// of its own around the lookup, so implementations may be mutated
/// concurrently as long as they are internally safe.
pub trait Assigner: Send + Sync + 'static {
    fn assign(&self, method: &str) -> Option<Arc<dyn Handler>>;
}

/// Map-backed assigner.
///
/// Much simpler than an HTTP router because the only routing key is the
/// JSON-RPC method name, and what is being routed is a complete,
/// already-decoded request.  The table may be changed while a server is
/// running.
#[derive(Clone, Default)]
pub struct Router {
    handlers: Arc<RwLock<HashMap<String, Arc<dyn Handler>>>>,
}

impl Router {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler under a method name, replacing any previous one.
    pub fn register<H: Handler>(&self, method: impl Into<String>, handler: H) {
        self.handlers
            .write()
            .unwrap()
            .insert(method.into(), Arc::new(handler));
    }

    /// Remove a method's handler, returning whether one was registered.
    pub fn deregister(&self, method: &str) -> bool {
        self.handlers.write().unwrap().remove(method).is_some()
    }
}

impl Assigner for Router {
    fn assign(&self, method: &str) -> Option<Arc<dyn Handler>> {
        self.handlers.read().unwrap().get(method).cloned()
    }
}

struct HandlerFn<F> {
    f: F,
}

#[async_trait]
impl<F, Fut> Handler for HandlerFn<F>
where
    F: Fn(Context, Request) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Box<RawValue>, HandlerError>> + Send + 'static,
{
    async fn call(&self, ctx: Context, req: Request) -> Result<Box<RawValue>, HandlerError> {
        (self.f)(ctx, req).await
    }
}

/// Adapt a plain async function over the raw request into a [`Handler`].
pub fn handler_fn<F, Fut>(f: F) -> impl Handler
where
    F: Fn(Context, Request) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Box<RawValue>, HandlerError>> + Send + 'static,
{
    HandlerFn { f }
}

struct MethodFn<F, P> {
    f: F,
    _params: PhantomData<fn() -> P>,
}

#[async_trait]
impl<F, Fut, P, R> Handler for MethodFn<F, P>
where
    F: Fn(Context, P) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<R, HandlerError>> + Send + 'static,
    P: DeserializeOwned + Send + 'static,
    R: Serialize + 'static,
{
    async fn call(&self, ctx: Context, req: Request) -> Result<Box<RawValue>, HandlerError> {
        // Absent params are treated as JSON null.
        let text = req.params.as_deref().map_or("null", RawValue::get);
        let params: P = serde_json::from_str(text)
            .map_err(|e| ErrorObject::invalid_params(format!("invalid parameters: {e}")))?;
        let value = (self.f)(ctx, params).await?;
        to_raw_value(&value).map_err(|e| HandlerError::Other(format!("serializing result: {e}")))
    }
}

/// Adapt an async function with typed parameters and result into a
/// [`Handler`].
///
/// The request params are deserialized into `P` (a decode failure produces
/// an invalid-params error) and the returned `R` is serialized as the
/// result.
pub fn method_fn<F, Fut, P, R>(f: F) -> impl Handler
where
    F: Fn(Context, P) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<R, HandlerError>> + Send + 'static,
    P: DeserializeOwned + Send + 'static,
    R: Serialize + 'static,
{
    MethodFn {
        f,
        _params: PhantomData,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCode;
    use assert_matches::assert_matches;

    fn raw(text: &str) -> Box<RawValue> {
        RawValue::from_string(text.to_string()).unwrap()
    }

    fn request(params: Option<&str>) -> Request {
        Request::new(Some(raw("1")), "m", params.map(raw))
    }

    #[tokio::test]
    async fn test_router_assign_and_replace() {
        let router = Router::new();
        assert!(router.assign("add").is_none());

        router.register("add", method_fn(|_ctx, terms: Vec<i64>| async move {
            Ok::<_, HandlerError>(terms.iter().sum::<i64>())
        }));
        let handler = router.assign("add").unwrap();
        let result = handler.call(Context::new(), request(Some("[2,3]"))).await.unwrap();
        assert_eq!(result.get(), "5");

        // Registration replaces in place.
        router.register("add", method_fn(|_ctx, _terms: Vec<i64>| async move {
            Ok::<_, HandlerError>(-1i64)
        }));
        let handler = router.assign("add").unwrap();
        let result = handler.call(Context::new(), request(Some("[2,3]"))).await.unwrap();
        assert_eq!(result.get(), "-1");

        assert!(router.deregister("add"));
        assert!(router.assign("add").is_none());
        assert!(!router.deregister("add"));
    }

    #[tokio::test]
    async fn test_method_fn_rejects_bad_params() {
        let handler = method_fn(|_ctx, terms: Vec<i64>| async move {
            Ok::<_, HandlerError>(terms.len())
        });
        let err = handler
            .call(Context::new(), request(Some(r#"{"not":"a list"}"#)))
            .await
            .unwrap_err();
        assert_matches!(err, HandlerError::Error(ErrorObject { code: ErrorCode::InvalidParams, .. }));
    }

    #[tokio::test]
    async fn test_method_fn_missing_params_decode_as_null() {
        let handler = method_fn(|_ctx, params: Option<Vec<i64>>| async move {
            Ok::<_, HandlerError>(params.is_none())
        });
        let result = handler.call(Context::new(), request(None)).await.unwrap();
        assert_eq!(result.get(), "true");
    }

    #[tokio::test]
    async fn test_handler_fn_sees_raw_request() {
        let handler = handler_fn(|_ctx, req: Request| async move {
            req.params.ok_or_else(|| HandlerError::from(ErrorCode::InvalidParams))
        });
        let result = handler
            .call(Context::new(), request(Some(r#"{"keep":"raw","n":1.50}"#)))
            .await
            .unwrap();
        assert_eq!(result.get(), r#"{"keep":"raw","n":1.50}"#);
    }

    #[test]
    fn test_context_values() {
        #[derive(Clone, PartialEq, Debug)]
        struct PeerName(&'static str);

        let ctx = Context::new().with_value(PeerName("unit test"));
        assert_eq!(ctx.value::<PeerName>(), Some(&PeerName("unit test")));
        assert_eq!(ctx.value::<u64>(), None);
        assert!(!ctx.cancel_token().is_cancelled());

        // A later value replaces an earlier one of the same type, and a
        // clone taken before keeps what it had.
        let before = ctx.clone();
        let ctx = ctx.with_value(PeerName("renamed"));
        assert_eq!(ctx.value::<PeerName>(), Some(&PeerName("renamed")));
        assert_eq!(before.value::<PeerName>(), Some(&PeerName("unit test")));
    }
}
