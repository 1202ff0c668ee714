//! The server dispatcher: reads framed request batches off a byte duplex,
//! validates request semantics, schedules handler execution under a
//! concurrency cap, and writes one atomic framed reply per batch that owes
//! one.
//!
//! Two workers cooperate per connection.  The *reader* loops on the framed
//! stream, decodes each frame into a request batch, and pushes it onto the
//! inbound queue; a frame that fails JSON decoding gets an immediate
//! error reply with a null id and reading continues, while a framing
//! failure or EOF terminates the connection.  The *scheduler* drains the
//! queue, resolves each request to a handler or a precomputed error under
//! the connection lock, and spawns the batch.  Handlers within a batch run
//! in parallel, gated only by the concurrency semaphore; the batch's reply
//! is assembled and written once all of them have finished.
use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use serde_json::value::RawValue;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender, unbounded_channel};
use tokio::sync::{Mutex as AsyncMutex, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;

use crate::channel::{self, Framing, MessageSink, MessageStream};
use crate::error::{HandlerError, Result, RpcError, panic_to_string};
use crate::handler::{Assigner, Context, Handler};
use crate::types::{self, ErrorObject, Request, Response};

/// Supplies the per-request [`Context`] handed to handlers.
pub type ReqContextFn = dyn Fn(&Request) -> Context + Send + Sync;

/// Configuration for a [`Server`].
#[derive(Clone)]
pub struct ServerOptions {
    /// Tolerate requests that omit the `jsonrpc` version marker, the way
    /// JSON-RPC 1.0 peers do.  Off by default.
    pub allow_v1: bool,
    /// Maximum number of handlers executing at once on this connection,
    /// across all batches.  Values below 1 are treated as 1, which is also
    /// the default.
    pub concurrency: usize,
    /// Produces the context for each inbound request.  The default derives
    /// an empty context from the connection's cancellation root so that
    /// stopping the server propagates into handlers.
    pub req_context: Option<Arc<ReqContextFn>>,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            allow_v1: false,
            concurrency: 1,
            req_context: None,
        }
    }
}

impl ServerOptions {
    pub fn allow_v1(mut self, ok: bool) -> Self {
        self.allow_v1 = ok;
        self
    }

    pub fn concurrency(mut self, n: usize) -> Self {
        self.concurrency = n;
        self
    }

    pub fn req_context(
        mut self,
        f: impl Fn(&Request) -> Context + Send + Sync + 'static,
    ) -> Self {
        self.req_context = Some(Arc::new(f));
        self
    }
}

/// A JSON-RPC 2.0 server bound to a single connection at a time.
///
/// The server receives requests on a byte duplex provided by the caller and
/// dispatches them to the handlers of a user-supplied [`Assigner`].  It is
/// constructed unstarted; [`Server::start`] binds it to a duplex,
/// [`Server::stop`] shuts the connection down, and [`Server::wait`] joins
/// the workers and reports the connection's final error.
pub struct Server {
    assigner: Arc<dyn Assigner>,
    opts: ServerOptions,
    running: Mutex<Option<Running>>,
}

struct Running {
    shared: Arc<Shared>,
    workers: Vec<JoinHandle<()>>,
}

/// State shared by the reader, the scheduler, and in-flight batch tasks.
struct Shared {
    state: Mutex<ConnState>,
    cancel: CancellationToken,
    writer: AsyncMutex<MessageSink>,
    sem: Arc<Semaphore>,
}

struct ConnState {
    /// IDs of requests currently being processed on this connection.
    live_ids: HashSet<String>,
    /// Set once, by whichever worker observes the terminal condition first.
    done: bool,
    final_err: Option<RpcError>,
}

impl Shared {
    /// Record the terminal condition and wake everything up.  Only the first
    /// caller wins; later failures are logged and dropped.
    fn record_stop(&self, err: Option<RpcError>) {
        {
            let mut state = self.state.lock().unwrap();
            if state.done {
                if let Some(err) = err {
                    tracing::debug!("Connection already terminated, dropping error: {}", err);
                }
                return;
            }
            state.done = true;
            state.final_err = err;
        }
        self.cancel.cancel();
    }

    fn is_done(&self) -> bool {
        self.state.lock().unwrap().done
    }

    /// One framed write.  Batch replies stay atomic on the wire because the
    /// whole payload goes through a single send under the writer lock.
    async fn send(&self, payload: Vec<u8>) -> Result<()> {
        let mut writer = self.writer.lock().await;
        writer.send(Bytes::from(payload)).await?;
        Ok(())
    }
}

impl Server {
    /// Create a new unstarted server that will dispatch incoming requests
    /// according to `assigner`.  To start serving, call [`Server::start`].
    pub fn new(assigner: impl Assigner, opts: ServerOptions) -> Self {
        Self {
            assigner: Arc::new(assigner),
            opts,
            running: Mutex::new(None),
        }
    }

    /// Bind to a byte duplex and begin serving requests on it.
    ///
    /// Fails with [`RpcError::AlreadyStarted`] if the server is currently
    /// bound; once [`Server::wait`] has returned, the server may be started
    /// again on a new duplex.
    pub fn start<T>(&self, stream: T, framing: Framing) -> Result<()>
    where
        T: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let mut running = self.running.lock().unwrap();
        if running.is_some() {
            return Err(RpcError::AlreadyStarted);
        }

        let (sink, source) = channel::split(stream, &framing);
        let shared = Arc::new(Shared {
            state: Mutex::new(ConnState {
                live_ids: HashSet::new(),
                done: false,
                final_err: None,
            }),
            cancel: CancellationToken::new(),
            writer: AsyncMutex::new(sink),
            sem: Arc::new(Semaphore::new(self.opts.concurrency.max(1))),
        });

        let (queue_tx, queue_rx) = unbounded_channel();
        let reader = tokio::spawn(read_loop(source, queue_tx, shared.clone()));
        let scheduler = tokio::spawn(serve_loop(
            queue_rx,
            shared.clone(),
            self.assigner.clone(),
            self.opts.clone(),
        ));

        *running = Some(Running {
            shared,
            workers: vec![reader, scheduler],
        });
        Ok(())
    }

    /// Shut the connection down.
    ///
    /// Safe to call more than once.  Records [`RpcError::ServerStopped`] as
    /// the final error unless an earlier failure already terminated the
    /// connection.  Handlers already running are not killed, but their
    /// results are discarded; a stopped server writes nothing further.
    pub fn stop(&self) {
        let running = self.running.lock().unwrap();
        if let Some(running) = running.as_ref() {
            running.shared.record_stop(Some(RpcError::ServerStopped));
        }
    }

    /// Block until the workers exit and return the connection's final
    /// error.  A clean EOF from the peer reports `Ok(())`.
    pub async fn wait(&self) -> Result<()> {
        let running = { self.running.lock().unwrap().take() };
        let Some(mut running) = running else {
            return Ok(());
        };
        for worker in running.workers.drain(..) {
            if let Err(err) = worker.await {
                tracing::error!("Server worker task failed: {}", err);
            }
        }
        let final_err = running.shared.state.lock().unwrap().final_err.take();
        match final_err {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

/// One decoded inbound frame.
struct Inbound {
    requests: Vec<Request>,
    /// Whether the frame was a bare object rather than an array, which
    /// decides the shape of the reply.
    singleton: bool,
}

async fn read_loop(
    mut source: MessageStream,
    queue: UnboundedSender<Inbound>,
    shared: Arc<Shared>,
) {
    loop {
        let frame = tokio::select! {
            _ = shared.cancel.cancelled() => break,
            frame = source.next() => frame,
        };
        match frame {
            None => {
                tracing::debug!("Peer closed the connection");
                shared.record_stop(None);
                break;
            }
            Some(Err(err)) => {
                tracing::error!("Channel read failed: {}", err);
                shared.record_stop(Some(err.into()));
                break;
            }
            Some(Ok(frame)) => match decode_frame(&frame) {
                Ok(inbound) => {
                    tracing::debug!("Received {} new requests", inbound.requests.len());
                    if queue.send(inbound).is_err() {
                        break;
                    }
                }
                Err(error) => {
                    // The frame boundary is intact, so this is recoverable:
                    // answer with a batch-level error and keep reading.
                    push_error(&shared, error).await;
                }
            },
        }
    }
}

/// Decode one framed message into a request batch.
fn decode_frame(frame: &[u8]) -> Result<Inbound, ErrorObject> {
    if types::is_batch_frame(frame) {
        match serde_json::from_slice::<Vec<Request>>(frame) {
            Ok(requests) if requests.is_empty() => {
                Err(ErrorObject::invalid_request("empty request batch"))
            }
            Ok(requests) => Ok(Inbound {
                requests,
                singleton: false,
            }),
            Err(err) => {
                tracing::debug!("Unparseable request batch: {}", err);
                Err(ErrorObject::parse_error("invalid JSON request message"))
            }
        }
    } else {
        match serde_json::from_slice::<Request>(frame) {
            Ok(request) => Ok(Inbound {
                requests: vec![request],
                singleton: true,
            }),
            Err(err) => {
                tracing::debug!("Unparseable request: {}", err);
                Err(ErrorObject::parse_error("invalid JSON request message"))
            }
        }
    }
}

/// Emit a batch-level error response with a null id.
async fn push_error(shared: &Shared, error: ErrorObject) {
    let reply = vec![Response::error(None, error)];
    match serde_json::to_vec(&reply) {
        Ok(payload) => {
            if let Err(err) = shared.send(payload).await {
                tracing::error!("Writing error response: {}", err);
            }
        }
        Err(err) => tracing::error!("Encoding error response: {}", err),
    }
}

async fn serve_loop(
    mut queue: UnboundedReceiver<Inbound>,
    shared: Arc<Shared>,
    assigner: Arc<dyn Assigner>,
    opts: ServerOptions,
) {
    loop {
        let inbound = tokio::select! {
            _ = shared.cancel.cancelled() => break,
            inbound = queue.recv() => match inbound {
                Some(inbound) => inbound,
                None => break,
            },
        };
        let batch = resolve_batch(&shared, assigner.as_ref(), &opts, inbound);
        // Batches run concurrently with each other; completion order between
        // batches is unspecified, but each reply is a single frame.
        tokio::spawn(run_batch(batch, shared.clone(), opts.req_context.clone()));
    }

    // The read side is down and nothing new will be scheduled; close the
    // write side so the duplex is released.
    let mut writer = shared.writer.lock().await;
    if let Err(err) = writer.close().await {
        tracing::debug!("Closing channel: {}", err);
    }
}

enum Disposition {
    /// The request failed validation before dispatch.
    Fail(ErrorObject),
    /// The request resolved to a handler.
    Run(Arc<dyn Handler>),
}

struct BatchTask {
    request: Request,
    disposition: Disposition,
    /// Whether this request's id was entered into the live set, and so must
    /// be released when the batch completes.
    registered: bool,
}

struct ResolvedBatch {
    tasks: Vec<BatchTask>,
    singleton: bool,
}

/// Precompute the disposition of every request in the batch under the
/// connection lock: version check, duplicate-id check (inserting into the
/// live set), method-name check, handler lookup.
fn resolve_batch(
    shared: &Shared,
    assigner: &dyn Assigner,
    opts: &ServerOptions,
    inbound: Inbound,
) -> ResolvedBatch {
    let mut state = shared.state.lock().unwrap();
    let tasks = inbound
        .requests
        .into_iter()
        .map(|request| {
            let mut registered = false;
            let disposition = dispose(&mut state, assigner, opts, &request, &mut registered);
            BatchTask {
                request,
                disposition,
                registered,
            }
        })
        .collect();
    ResolvedBatch {
        tasks,
        singleton: inbound.singleton,
    }
}

fn dispose(
    state: &mut ConnState,
    assigner: &dyn Assigner,
    opts: &ServerOptions,
    request: &Request,
    registered: &mut bool,
) -> Disposition {
    if !version_ok(request.jsonrpc.as_deref(), opts.allow_v1) {
        return Disposition::Fail(ErrorObject::invalid_request(format!(
            "incorrect version marker {:?}",
            request.jsonrpc.as_deref().unwrap_or("")
        )));
    }
    if let Some(id) = request.id_text() {
        if !state.live_ids.insert(id.to_string()) {
            return Disposition::Fail(ErrorObject::invalid_request(format!(
                "duplicate request id {id}"
            )));
        }
        *registered = true;
    }
    if request.method.is_empty() {
        return Disposition::Fail(ErrorObject::invalid_request("empty method name"));
    }
    match assigner.assign(&request.method) {
        Some(handler) => Disposition::Run(handler),
        None => Disposition::Fail(ErrorObject::method_not_found(format!(
            "no such method {:?}",
            request.method
        ))),
    }
}

fn version_ok(marker: Option<&str>, allow_v1: bool) -> bool {
    match marker {
        // An absent version marker is OK if the server allows it.
        None | Some("") => allow_v1,
        Some(v) => v == types::VERSION,
    }
}

/// Run every dispatchable task of one batch, wait for all of them, then
/// assemble and write the reply.
async fn run_batch(
    batch: ResolvedBatch,
    shared: Arc<Shared>,
    req_context: Option<Arc<ReqContextFn>>,
) {
    let mut results: Vec<Option<Result<Box<RawValue>, HandlerError>>> =
        batch.tasks.iter().map(|_| None).collect();

    let mut running: JoinSet<(usize, Result<Box<RawValue>, HandlerError>)> = JoinSet::new();
    for (index, task) in batch.tasks.iter().enumerate() {
        let Disposition::Run(handler) = &task.disposition else {
            continue;
        };
        let handler = handler.clone();
        let request = task.request.clone();
        let ctx = match &req_context {
            Some(f) => f(&request),
            None => Context::with_cancel(shared.cancel.child_token()),
        };
        let sem = shared.sem.clone();
        running.spawn(async move {
            // One permit per executing handler; this is the concurrency
            // bound for the whole connection, not just this batch.
            let outcome = match sem.acquire_owned().await {
                Ok(_permit) => {
                    // The inner task keeps a handler panic from taking the
                    // rest of the batch down with it.
                    match tokio::spawn(async move { handler.call(ctx, request).await }).await {
                        Ok(result) => result,
                        Err(err) if err.is_panic() => Err(HandlerError::Other(format!(
                            "handler panicked: {}",
                            panic_to_string(err.into_panic())
                        ))),
                        Err(_) => Err(HandlerError::Other("handler task canceled".to_string())),
                    }
                }
                Err(_) => Err(HandlerError::Other("server shutting down".to_string())),
            };
            (index, outcome)
        });
    }

    while let Some(joined) = running.join_next().await {
        match joined {
            Ok((index, outcome)) => results[index] = Some(outcome),
            Err(err) => tracing::error!("Batch task failed: {}", err),
        }
    }

    let replies = assemble_replies(&batch.tasks, results);

    if !replies.is_empty() && !shared.is_done() {
        let payload = if batch.singleton {
            serde_json::to_vec(&replies[0])
        } else {
            serde_json::to_vec(&replies)
        };
        match payload {
            Ok(payload) => {
                tracing::debug!("Sending {} responses", replies.len());
                if let Err(err) = shared.send(payload).await {
                    tracing::error!("Writing batch reply: {}", err);
                }
            }
            Err(err) => tracing::error!("Encoding batch reply: {}", err),
        }
    }

    // Release the processed ids.  Only the ones this batch registered: a
    // rejected duplicate must not evict the original holder.
    let mut state = shared.state.lock().unwrap();
    for task in &batch.tasks {
        if task.registered {
            if let Some(id) = task.request.id_text() {
                state.live_ids.remove(id);
            }
        }
    }
}

/// Build the response list for a finished batch.
///
/// Notifications that succeeded produce nothing.  Notifications that failed
/// *before* dispatch (bad version, duplicate id, unknown method) are
/// answered with a null id; errors their handlers raise are logged and
/// dropped, never sent.
fn assemble_replies(
    tasks: &[BatchTask],
    results: Vec<Option<Result<Box<RawValue>, HandlerError>>>,
) -> Vec<Response> {
    let mut replies = Vec::new();
    for (task, result) in tasks.iter().zip(results) {
        let id = task.request.id.clone();
        match (&task.disposition, result) {
            (Disposition::Fail(error), _) => {
                replies.push(Response::error(id, error.clone()));
            }
            (Disposition::Run(_), Some(Ok(value))) => {
                if id.is_some() {
                    replies.push(Response::success(id, value));
                }
            }
            (Disposition::Run(_), Some(Err(err))) => {
                if id.is_some() {
                    replies.push(Response::error(id, err.into_error_object()));
                } else {
                    tracing::debug!(
                        "Discarding error from notification to {:?}: {}",
                        task.request.method,
                        err
                    );
                }
            }
            (Disposition::Run(_), None) => {
                // The join failure was already logged; answer calls anyway
                // so the peer is not left hanging on this id.
                if id.is_some() {
                    replies.push(Response::error(
                        id,
                        ErrorObject::internal_error("request was not processed"),
                    ));
                }
            }
        }
    }
    replies
}
