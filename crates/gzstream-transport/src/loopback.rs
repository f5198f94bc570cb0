//! In-process link speaking the wire protocol.
//!
//! Both peers run as tasks in the current runtime and exchange JSON text
//! frames over channels, the way they would over a socket. The server half
//! implements [`Transport`]; the client half implements [`StreamSource`] and
//! serves calls through a [`Dispatcher`].

use std::{
    collections::HashMap,
    pin::Pin,
    sync::{
        Arc, Mutex, MutexGuard, PoisonError,
        atomic::{AtomicU64, Ordering},
    },
    task::{Context, Poll},
    time::Duration,
};

use async_trait::async_trait;
use bytes::Bytes;
use futures::{Stream, StreamExt};
use gzstream_core::{
    ByteStream, CompressedPayload, StreamLease, StreamSource, Transport, TransportError,
};
use gzstream_receiver::{AbortRegistry, Dispatcher};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::{
    sync::{mpsc, oneshot},
    task::JoinHandle,
};
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_util::sync::CancellationToken;

use crate::protocol::{ClientMessage, ServerMessage};

/// Default chunk size for stream pumps (32KB).
pub const DEFAULT_CHUNK_SIZE: usize = 32 * 1024;

/// Link tuning.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LinkOptions {
    /// Maximum bytes per chunk frame.
    pub chunk_size: usize,
    /// Delay before each chunk, to simulate a slow link.
    pub chunk_interval: Option<Duration>,
}

impl Default for LinkOptions {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            chunk_interval: None,
        }
    }
}

impl LinkOptions {
    #[must_use]
    pub const fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size;
        self
    }

    #[must_use]
    pub const fn with_chunk_interval(mut self, interval: Duration) -> Self {
        self.chunk_interval = Some(interval);
        self
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Outgoing stream buffer; `payload` is taken once the client pulls.
struct Outgoing {
    payload: Option<Bytes>,
    cancel: CancellationToken,
}

/// Server half of the link.
struct ServerSide {
    outbound: mpsc::UnboundedSender<String>,
    pending: Mutex<HashMap<u64, oneshot::Sender<Result<Value, TransportError>>>>,
    streams: Mutex<HashMap<u64, Outgoing>>,
    next_call: AtomicU64,
    next_stream: AtomicU64,
    options: LinkOptions,
}

impl ServerSide {
    fn send(&self, msg: &ServerMessage) -> Result<(), TransportError> {
        let text =
            serde_json::to_string(msg).map_err(|e| TransportError::Protocol(e.to_string()))?;
        self.outbound
            .send(text)
            .map_err(|_| TransportError::LinkClosed)
    }

    /// Drop a stream from the table and stop its pump.
    fn release(&self, stream: u64) {
        if let Some(outgoing) = lock(&self.streams).remove(&stream) {
            outgoing.cancel.cancel();
        }
    }

    fn handle(self: &Arc<Self>, msg: ClientMessage) {
        match msg {
            ClientMessage::Reply { call_id, result } => self.complete(call_id, Ok(result)),
            ClientMessage::Fault { call_id, message } => {
                self.complete(call_id, Err(TransportError::Remote(message)));
            }
            ClientMessage::Pull { stream } => self.start_pump(stream),
            ClientMessage::Close { stream } => {
                if let Some(outgoing) = lock(&self.streams).get(&stream) {
                    outgoing.cancel.cancel();
                }
            }
        }
    }

    fn complete(&self, call_id: u64, result: Result<Value, TransportError>) {
        let waiter = lock(&self.pending).remove(&call_id);
        match waiter {
            Some(tx) => {
                let _ = tx.send(result);
            }
            None => tracing::debug!(call_id, "reply for abandoned call discarded"),
        }
    }

    fn start_pump(self: &Arc<Self>, stream: u64) {
        let claimed = lock(&self.streams).get_mut(&stream).and_then(|outgoing| {
            outgoing
                .payload
                .take()
                .map(|payload| (payload, outgoing.cancel.clone()))
        });

        if let Some((payload, cancel)) = claimed {
            tokio::spawn(Arc::clone(self).pump(stream, payload, cancel));
        } else {
            tracing::warn!(stream, "pull for unknown or released stream");
            let _ = self.send(&ServerMessage::Reset { stream });
        }
    }

    async fn pump(self: Arc<Self>, stream: u64, payload: Bytes, cancel: CancellationToken) {
        let chunk_size = self.options.chunk_size.max(1);
        let mut offset = 0;

        let completed = loop {
            if offset >= payload.len() {
                break true;
            }

            if let Some(interval) = self.options.chunk_interval {
                tokio::select! {
                    biased;
                    () = cancel.cancelled() => break false,
                    () = tokio::time::sleep(interval) => {}
                }
            } else {
                tokio::task::yield_now().await;
                if cancel.is_cancelled() {
                    break false;
                }
            }

            let end = (offset + chunk_size).min(payload.len());
            if self
                .send(&ServerMessage::chunk(stream, &payload[offset..end]))
                .is_err()
            {
                break false;
            }
            offset = end;
        };

        let last = if completed {
            ServerMessage::End { stream }
        } else {
            tracing::debug!(stream, sent = offset, total = payload.len(), "stream truncated");
            ServerMessage::Reset { stream }
        };
        let _ = self.send(&last);
        lock(&self.streams).remove(&stream);
    }
}

/// Removes a pending call if its invoke future is dropped.
struct PendingCall<'a> {
    side: &'a ServerSide,
    call_id: u64,
}

impl Drop for PendingCall<'_> {
    fn drop(&mut self) {
        lock(&self.side.pending).remove(&self.call_id);
    }
}

type Inbound = mpsc::UnboundedSender<Result<Bytes, TransportError>>;

/// Client half of the link.
struct ClientSide {
    outbound: mpsc::UnboundedSender<String>,
    incoming: Arc<Mutex<HashMap<u64, Inbound>>>,
}

impl ClientSide {
    fn send(&self, msg: &ClientMessage) -> Result<(), TransportError> {
        let text =
            serde_json::to_string(msg).map_err(|e| TransportError::Protocol(e.to_string()))?;
        self.outbound
            .send(text)
            .map_err(|_| TransportError::LinkClosed)
    }

    /// Deliver stream frames to whoever is reading the stream.
    fn route(&self, msg: &ServerMessage) {
        let mut incoming = lock(&self.incoming);
        match msg {
            ServerMessage::Chunk { stream, .. } => {
                let Some(tx) = incoming.get(stream) else {
                    return;
                };
                let item = msg.decode_chunk().map(Bytes::from).ok_or_else(|| {
                    TransportError::Protocol(format!("invalid chunk data on stream {stream}"))
                });
                let _ = tx.send(item);
            }
            ServerMessage::End { stream } => {
                incoming.remove(stream);
            }
            ServerMessage::Reset { stream } => {
                if let Some(tx) = incoming.remove(stream) {
                    let _ = tx.send(Err(TransportError::StreamReset));
                }
            }
            ServerMessage::Invoke { .. } | ServerMessage::Notify { .. } => {}
        }
    }
}

#[async_trait]
impl StreamSource for ClientSide {
    async fn open(&self, reference: &Value) -> Result<ByteStream, TransportError> {
        let stream = reference
            .as_u64()
            .ok_or_else(|| TransportError::UnknownStream(reference.to_string()))?;

        let (tx, rx) = mpsc::unbounded_channel();
        {
            let mut incoming = lock(&self.incoming);
            if incoming.contains_key(&stream) {
                return Err(TransportError::Protocol(format!(
                    "stream {stream} is already open"
                )));
            }
            incoming.insert(stream, tx);
        }

        let reader = IncomingStream {
            stream,
            rx: UnboundedReceiverStream::new(rx),
            incoming: Arc::clone(&self.incoming),
            outbound: self.outbound.clone(),
            finished: false,
        };
        self.send(&ClientMessage::Pull { stream })?;
        Ok(reader.boxed())
    }
}

/// Client-side reader of one stream.
///
/// Dropped before the end, it sends `close` so the server stops pumping.
struct IncomingStream {
    stream: u64,
    rx: UnboundedReceiverStream<Result<Bytes, TransportError>>,
    incoming: Arc<Mutex<HashMap<u64, Inbound>>>,
    outbound: mpsc::UnboundedSender<String>,
    finished: bool,
}

impl Stream for IncomingStream {
    type Item = Result<Bytes, TransportError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let polled = self.rx.poll_next_unpin(cx);
        if matches!(
            polled,
            Poll::Ready(None | Some(Err(TransportError::StreamReset)))
        ) {
            self.finished = true;
        }
        polled
    }
}

impl Drop for IncomingStream {
    fn drop(&mut self) {
        lock(&self.incoming).remove(&self.stream);
        if !self.finished {
            if let Ok(text) = serde_json::to_string(&ClientMessage::Close {
                stream: self.stream,
            }) {
                let _ = self.outbound.send(text);
            }
        }
    }
}

async fn serve_server(side: Arc<ServerSide>, mut inbox: mpsc::UnboundedReceiver<String>) {
    while let Some(text) = inbox.recv().await {
        match serde_json::from_str::<ClientMessage>(&text) {
            Ok(msg) => side.handle(msg),
            Err(e) => tracing::error!("Invalid client message: {e}"),
        }
    }

    // Fails every outstanding invoke with `LinkClosed`.
    lock(&side.pending).clear();
    tracing::debug!("server inbox closed");
}

async fn serve_client(
    side: Arc<ClientSide>,
    dispatcher: Arc<Dispatcher>,
    mut inbox: mpsc::UnboundedReceiver<String>,
) {
    let source: Arc<dyn StreamSource> = side.clone();

    while let Some(text) = inbox.recv().await {
        let msg: ServerMessage = match serde_json::from_str(&text) {
            Ok(m) => m,
            Err(e) => {
                tracing::error!("Invalid server message: {e}");
                continue;
            }
        };

        match msg {
            ServerMessage::Invoke {
                call_id,
                operation,
                args,
            } => {
                let side = Arc::clone(&side);
                let dispatcher = Arc::clone(&dispatcher);
                let source = Arc::clone(&source);
                tokio::spawn(async move {
                    let reply = match dispatcher.dispatch(&operation, args, &source).await {
                        Ok(result) => ClientMessage::Reply { call_id, result },
                        Err(e) => ClientMessage::Fault {
                            call_id,
                            message: e.to_string(),
                        },
                    };
                    if let Err(e) = side.send(&reply) {
                        tracing::debug!(call_id, "reply not delivered: {e}");
                    }
                });
            }
            ServerMessage::Notify { operation, args } => {
                let dispatcher = Arc::clone(&dispatcher);
                let source = Arc::clone(&source);
                tokio::spawn(async move {
                    if let Err(e) = dispatcher.dispatch(&operation, args, &source).await {
                        tracing::warn!(operation, "notification failed: {e}");
                    }
                });
            }
            other => side.route(&other),
        }
    }

    tracing::debug!("client inbox closed");
}

/// Server-side handle of an in-process link.
pub struct LoopbackTransport {
    server: Arc<ServerSide>,
    dispatcher: Arc<Dispatcher>,
    tasks: Vec<JoinHandle<()>>,
}

impl LoopbackTransport {
    /// Dispatcher serving the client half.
    #[must_use]
    pub const fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    /// Client-side registry of streams being received.
    #[must_use]
    pub fn registry(&self) -> &Arc<AbortRegistry> {
        self.dispatcher.registry()
    }

    /// Streams the server still holds a buffer or pump for.
    #[must_use]
    pub fn open_streams(&self) -> usize {
        lock(&self.server.streams).len()
    }
}

impl Drop for LoopbackTransport {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

/// Connect a server to a client served by `dispatcher`.
///
/// Must be called from within a Tokio runtime.
#[must_use]
pub fn connect(dispatcher: Dispatcher, options: LinkOptions) -> LoopbackTransport {
    let (server_tx, server_rx) = mpsc::unbounded_channel();
    let (client_tx, client_rx) = mpsc::unbounded_channel();

    let server = Arc::new(ServerSide {
        outbound: server_tx,
        pending: Mutex::new(HashMap::new()),
        streams: Mutex::new(HashMap::new()),
        next_call: AtomicU64::new(1),
        next_stream: AtomicU64::new(1),
        options,
    });
    let client = Arc::new(ClientSide {
        outbound: client_tx,
        incoming: Arc::new(Mutex::new(HashMap::new())),
    });
    let dispatcher = Arc::new(dispatcher);

    let tasks = vec![
        tokio::spawn(serve_server(Arc::clone(&server), client_rx)),
        tokio::spawn(serve_client(client, Arc::clone(&dispatcher), server_rx)),
    ];

    LoopbackTransport {
        server,
        dispatcher,
        tasks,
    }
}

#[async_trait]
impl Transport for LoopbackTransport {
    fn open_stream(&self, payload: CompressedPayload) -> Result<StreamLease, TransportError> {
        let stream = self.server.next_stream.fetch_add(1, Ordering::Relaxed);
        lock(&self.server.streams).insert(
            stream,
            Outgoing {
                payload: Some(payload.into_bytes()),
                cancel: CancellationToken::new(),
            },
        );

        let server = Arc::clone(&self.server);
        Ok(StreamLease::new(Value::from(stream), move || {
            server.release(stream);
        }))
    }

    async fn invoke(&self, operation: &str, args: Vec<Value>) -> Result<Value, TransportError> {
        let call_id = self.server.next_call.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        lock(&self.server.pending).insert(call_id, tx);
        let _pending = PendingCall {
            side: &self.server,
            call_id,
        };

        self.server.send(&ServerMessage::Invoke {
            call_id,
            operation: operation.to_string(),
            args,
        })?;

        rx.await.map_err(|_| TransportError::LinkClosed)?
    }

    async fn notify(&self, operation: &str, args: Vec<Value>) -> Result<(), TransportError> {
        self.server.send(&ServerMessage::Notify {
            operation: operation.to_string(),
            args,
        })
    }
}
