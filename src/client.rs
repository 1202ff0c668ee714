//! The client multiplexer: issues calls, notifications, and batches over a
//! framed channel and matches inbound responses to their pending callers.
//!
//! Outbound writes are serialized by a single writer lock, so batches are
//! atomic on the wire and frames appear in call order.  Each call registers
//! its pending entry *before* the bytes are flushed, so a fast reply cannot
//! race the awaiter.  A single reader task drains inbound frames and
//! resolves pending calls by id; request-shaped messages from the peer are
//! handed to the optional notification callback.
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::value::RawValue;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::Mutex as AsyncMutex;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::channel::{self, Framing, MessageSink, MessageStream};
use crate::error::{Result, RpcError};
use crate::types::{self, Request, Response, to_params};

/// One entry in an outbound batch.
pub struct Spec {
    pub method: String,
    pub params: Option<Box<RawValue>>,
    /// Send as a notification; produces no response slot.
    pub notify: bool,
}

impl Spec {
    /// A batch entry that expects a response.
    pub fn call(method: impl Into<String>, params: Option<Box<RawValue>>) -> Self {
        Self {
            method: method.into(),
            params,
            notify: false,
        }
    }

    /// A batch entry sent as a notification.
    pub fn notify(method: impl Into<String>, params: Option<Box<RawValue>>) -> Self {
        Self {
            method: method.into(),
            params,
            notify: true,
        }
    }
}

/// Callback invoked with notifications initiated by the remote peer.
pub type NotifyFn = dyn Fn(Request) + Send + Sync;

#[derive(Clone, Default)]
pub struct ClientOptions {
    pub on_notify: Option<Arc<NotifyFn>>,
}

impl ClientOptions {
    /// Install a callback for peer-initiated notifications.  Without one,
    /// such messages are logged and dropped.
    pub fn on_notify(mut self, f: impl Fn(Request) + Send + Sync + 'static) -> Self {
        self.on_notify = Some(Arc::new(f));
        self
    }
}

/// A JSON-RPC 2.0 client bound to one connection.
///
/// Cheap to clone; all clones share the connection.  Calls may be issued
/// concurrently from any number of tasks.
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
    reader: Arc<Mutex<Option<JoinHandle<()>>>>,
}

struct ClientInner {
    writer: AsyncMutex<MessageSink>,
    pending: Mutex<PendingState>,
    next_id: AtomicU64,
    cancel: CancellationToken,
}

struct PendingState {
    /// Pending calls keyed by the wire text of their id.
    calls: HashMap<String, oneshot::Sender<Result<Response>>>,
    /// Once closed, no new calls are accepted and the map stays empty.
    closed: bool,
    final_err: Option<RpcError>,
}

impl ClientInner {
    fn register(&self, key: &str, tx: oneshot::Sender<Result<Response>>) -> Result<()> {
        let mut pending = self.pending.lock().unwrap();
        if pending.closed {
            return Err(RpcError::ConnectionClosed);
        }
        pending.calls.insert(key.to_string(), tx);
        Ok(())
    }

    fn unregister(&self, key: &str) {
        self.pending.lock().unwrap().calls.remove(key);
    }

    /// Resolve every outstanding call with a connection-closed error and
    /// refuse new ones.  The first caller's `final_err` sticks.
    fn drain(&self, final_err: Option<RpcError>) {
        let mut pending = self.pending.lock().unwrap();
        if !pending.closed {
            pending.closed = true;
            pending.final_err = final_err;
        } else if let Some(err) = final_err {
            tracing::debug!("Connection already closed, dropping error: {}", err);
        }
        for (_, tx) in pending.calls.drain() {
            let _ = tx.send(Err(RpcError::ConnectionClosed));
        }
    }
}

/// Removes the pending entry when a caller abandons its call before the
/// response lands; a response arriving later is discarded by the reader.
struct PendingGuard<'a> {
    inner: &'a ClientInner,
    key: &'a str,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.inner.unregister(self.key);
    }
}

impl Client {
    /// Bind a client to a byte duplex using the given framing.
    pub fn new<T>(stream: T, framing: Framing) -> Self
    where
        T: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        Self::with_options(stream, framing, ClientOptions::default())
    }

    pub fn with_options<T>(stream: T, framing: Framing, opts: ClientOptions) -> Self
    where
        T: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let (sink, source) = channel::split(stream, &framing);
        let inner = Arc::new(ClientInner {
            writer: AsyncMutex::new(sink),
            pending: Mutex::new(PendingState {
                calls: HashMap::new(),
                closed: false,
                final_err: None,
            }),
            next_id: AtomicU64::new(1),
            cancel: CancellationToken::new(),
        });
        let reader = tokio::spawn(read_loop(source, inner.clone(), opts.on_notify));
        Self {
            inner,
            reader: Arc::new(Mutex::new(Some(reader))),
        }
    }

    /// Invoke `method` and wait for the matching response.
    ///
    /// The returned [`Response`] may itself carry a JSON-RPC error object;
    /// only transport-level failures surface as `Err`.  Dropping the future
    /// abandons the call: the pending entry is removed and a late response
    /// is discarded.
    pub async fn call(&self, method: &str, params: Option<Box<RawValue>>) -> Result<Response> {
        let key = self.next_id();
        let id = RawValue::from_string(key.clone()).map_err(|e| RpcError::Serialize {
            source: e,
            type_name: "request id",
        })?;
        let request = Request::new(Some(id), method, params);
        let payload = serde_json::to_vec(&request).map_err(|e| RpcError::Serialize {
            source: e,
            type_name: std::any::type_name::<Request>(),
        })?;

        let (tx, rx) = oneshot::channel();
        {
            // Register before the bytes hit the wire so a fast reply cannot
            // miss its caller.  The writer lock also orders frames.
            let mut writer = self.inner.writer.lock().await;
            self.inner.register(&key, tx)?;
            if let Err(err) = writer.send(Bytes::from(payload)).await {
                self.inner.unregister(&key);
                return Err(err.into());
            }
        }

        let _guard = PendingGuard {
            inner: self.inner.as_ref(),
            key: &key,
        };
        match rx.await {
            Ok(result) => result,
            Err(_) => Err(RpcError::ConnectionClosed),
        }
    }

    /// Send a notification.  Returns once the frame has been flushed to the
    /// transport; no response will ever arrive.
    pub async fn notify(&self, method: &str, params: Option<Box<RawValue>>) -> Result<()> {
        if self.inner.pending.lock().unwrap().closed {
            return Err(RpcError::ConnectionClosed);
        }
        let request = Request::new(None, method, params);
        let payload = serde_json::to_vec(&request).map_err(|e| RpcError::Serialize {
            source: e,
            type_name: std::any::type_name::<Request>(),
        })?;
        let mut writer = self.inner.writer.lock().await;
        writer.send(Bytes::from(payload)).await?;
        Ok(())
    }

    /// Issue several calls and notifications as one framed batch.
    ///
    /// The whole batch is written atomically.  Responses are returned in
    /// the order of the non-notification specs, regardless of the order the
    /// peer answered in; specs marked notify produce no response slot.
    pub async fn batch(&self, specs: Vec<Spec>) -> Result<Vec<Response>> {
        if specs.is_empty() {
            // An empty array is not a legal batch; there is nothing to do.
            return Ok(Vec::new());
        }

        let mut requests = Vec::with_capacity(specs.len());
        let mut keys = Vec::new();
        for spec in specs {
            let id = if spec.notify {
                None
            } else {
                let key = self.next_id();
                let id = RawValue::from_string(key.clone()).map_err(|e| RpcError::Serialize {
                    source: e,
                    type_name: "request id",
                })?;
                keys.push(key);
                Some(id)
            };
            requests.push(Request::new(id, spec.method, spec.params));
        }
        let payload = serde_json::to_vec(&requests).map_err(|e| RpcError::Serialize {
            source: e,
            type_name: std::any::type_name::<Vec<Request>>(),
        })?;

        let mut receivers = Vec::with_capacity(keys.len());
        {
            let mut writer = self.inner.writer.lock().await;
            {
                let mut pending = self.inner.pending.lock().unwrap();
                if pending.closed {
                    return Err(RpcError::ConnectionClosed);
                }
                for key in &keys {
                    let (tx, rx) = oneshot::channel();
                    pending.calls.insert(key.clone(), tx);
                    receivers.push(rx);
                }
            }
            if let Err(err) = writer.send(Bytes::from(payload)).await {
                for key in &keys {
                    self.inner.unregister(key);
                }
                return Err(err.into());
            }
        }

        let _guards: Vec<PendingGuard<'_>> = keys
            .iter()
            .map(|key| PendingGuard {
                inner: self.inner.as_ref(),
                key,
            })
            .collect();
        let mut responses = Vec::with_capacity(receivers.len());
        for rx in receivers {
            match rx.await {
                Ok(result) => responses.push(result?),
                Err(_) => return Err(RpcError::ConnectionClosed),
            }
        }
        Ok(responses)
    }

    /// Call with typed parameters and decode the typed result.
    ///
    /// A JSON-RPC error payload in the response surfaces as
    /// [`RpcError::Method`].
    pub async fn call_with_params<P, R>(&self, method: &str, params: P) -> Result<R>
    where
        P: Serialize,
        R: DeserializeOwned,
    {
        let response = self.call(method, to_params(&params)?).await?;
        if let Some(error) = response.error {
            return Err(RpcError::Method {
                method: method.to_string(),
                error,
            });
        }
        let text = response.result.as_deref().map_or("null", RawValue::get);
        serde_json::from_str(text).map_err(|e| RpcError::DeserializeResult {
            source: e,
            type_name: std::any::type_name::<R>(),
        })
    }

    /// Send a notification with typed parameters.
    pub async fn notify_with_params<P: Serialize>(&self, method: &str, params: P) -> Result<()> {
        self.notify(method, to_params(&params)?).await
    }

    /// Abandon every pending call with a connection-closed error and shut
    /// the channel down.
    pub async fn close(&self) {
        self.inner.drain(None);
        self.inner.cancel.cancel();
        let mut writer = self.inner.writer.lock().await;
        if let Err(err) = writer.close().await {
            tracing::debug!("Closing channel: {}", err);
        }
    }

    /// Wait for the reader to exit and return the connection's final error.
    /// A clean EOF from the peer (or a local [`Client::close`]) reports
    /// `Ok(())`.
    pub async fn wait(&self) -> Result<()> {
        let reader = { self.reader.lock().unwrap().take() };
        if let Some(reader) = reader {
            if let Err(err) = reader.await {
                tracing::error!("Client reader task failed: {}", err);
            }
        }
        match self.inner.pending.lock().unwrap().final_err.take() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// IDs are a per-client monotonic counter, rendered as JSON numbers.
    fn next_id(&self) -> String {
        self.inner.next_id.fetch_add(1, Ordering::Relaxed).to_string()
    }
}

async fn read_loop(
    mut source: MessageStream,
    inner: Arc<ClientInner>,
    on_notify: Option<Arc<NotifyFn>>,
) {
    let final_err = loop {
        let frame = tokio::select! {
            _ = inner.cancel.cancelled() => break None,
            frame = source.next() => frame,
        };
        match frame {
            None => {
                tracing::debug!("Peer closed the connection");
                break None;
            }
            Some(Err(err)) => {
                tracing::error!("Channel read failed: {}", err);
                break Some(err.into());
            }
            Some(Ok(frame)) => {
                if let Err(err) = dispatch_frame(&inner, &on_notify, &frame) {
                    tracing::error!("Unparseable message from peer: {}", err);
                    break Some(err);
                }
            }
        }
    };
    inner.drain(final_err);
}

fn dispatch_frame(
    inner: &ClientInner,
    on_notify: &Option<Arc<NotifyFn>>,
    frame: &[u8],
) -> Result<()> {
    if types::is_batch_frame(frame) {
        let items: Vec<&RawValue> =
            serde_json::from_slice(frame).map_err(|e| RpcError::ParseJson { source: e })?;
        for item in items {
            dispatch_message(inner, on_notify, item.get())?;
        }
        Ok(())
    } else {
        let item: &RawValue =
            serde_json::from_slice(frame).map_err(|e| RpcError::ParseJson { source: e })?;
        dispatch_message(inner, on_notify, item.get())
    }
}

/// Distinguishes request-shaped messages from responses by the presence of
/// a `method` field.
#[derive(serde::Deserialize)]
struct Probe {
    #[serde(default)]
    method: Option<String>,
}

fn dispatch_message(
    inner: &ClientInner,
    on_notify: &Option<Arc<NotifyFn>>,
    text: &str,
) -> Result<()> {
    let probe: Probe =
        serde_json::from_str(text).map_err(|e| RpcError::ParseJson { source: e })?;

    if probe.method.is_some() {
        // Request-shaped: the peer is talking first.
        let request: Request =
            serde_json::from_str(text).map_err(|e| RpcError::ParseJson { source: e })?;
        if !request.is_notification() {
            tracing::warn!(
                "Discarding peer-initiated call to {:?}; this client serves no methods",
                request.method
            );
        } else if let Some(callback) = on_notify {
            callback(request);
        } else {
            tracing::debug!("Ignoring notification for {:?}", request.method);
        }
        return Ok(());
    }

    let response: Response =
        serde_json::from_str(text).map_err(|e| RpcError::ParseJson { source: e })?;
    let key = response
        .id_text()
        .map(str::trim)
        .filter(|t| *t != "null")
        .map(str::to_string);
    let Some(key) = key else {
        tracing::warn!("Discarding response with null id");
        return Ok(());
    };
    let sender = inner.pending.lock().unwrap().calls.remove(&key);
    match sender {
        Some(tx) => {
            let _ = tx.send(Ok(response));
        }
        None => tracing::warn!("Discarding response for unknown request id {:?}", key),
    }
    Ok(())
}
