//! Remote operation dispatch.

use std::{collections::HashMap, future::Future, sync::Arc};

use futures::{FutureExt, future::BoxFuture};
use gzstream_core::{
    ABORT_STREAM_OPERATION, StreamHandleRef, StreamId, StreamSource, TransportError,
};
use serde_json::Value;
use thiserror::Error;

use crate::{AbortRegistry, GzippedJsonStream};

type Handler = Arc<dyn Fn(RemoteArgs) -> BoxFuture<'static, anyhow::Result<Value>> + Send + Sync>;

/// Dispatch error.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("Unknown operation: {0}")]
    UnknownOperation(String),
    #[error("Invalid arguments: {0}")]
    InvalidArguments(String),
    #[error("Handler failed: {0:#}")]
    Handler(anyhow::Error),
}

impl From<TransportError> for DispatchError {
    fn from(e: TransportError) -> Self {
        Self::InvalidArguments(e.to_string())
    }
}

/// One decoded argument of a remote call.
#[derive(Debug)]
pub enum RemoteArg {
    /// A stream handle revived into a live stream.
    Stream(GzippedJsonStream),
    /// Any other JSON value.
    Value(Value),
}

/// Arguments of a remote call after handle revival.
#[derive(Debug, Default)]
pub struct RemoteArgs {
    args: Vec<RemoteArg>,
}

impl RemoteArgs {
    #[must_use]
    pub fn len(&self) -> usize {
        self.args.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.args.is_empty()
    }

    /// Take the first stream argument out of the list.
    pub fn take_stream(&mut self) -> Option<GzippedJsonStream> {
        let index = self
            .args
            .iter()
            .position(|arg| matches!(arg, RemoteArg::Stream(_)))?;
        match self.args.remove(index) {
            RemoteArg::Stream(stream) => Some(stream),
            RemoteArg::Value(_) => None,
        }
    }

    /// Plain (non-stream) arguments in call order.
    pub fn values(&self) -> impl Iterator<Item = &Value> {
        self.args.iter().filter_map(|arg| match arg {
            RemoteArg::Value(value) => Some(value),
            RemoteArg::Stream(_) => None,
        })
    }
}

impl IntoIterator for RemoteArgs {
    type Item = RemoteArg;
    type IntoIter = std::vec::IntoIter<RemoteArg>;

    fn into_iter(self) -> Self::IntoIter {
        self.args.into_iter()
    }
}

/// Routes remote calls to named handlers.
///
/// Incoming argument values carrying the stream marker are turned into
/// [`GzippedJsonStream`] objects before the handler sees them. The abort
/// operation is built in and routed to the shared [`AbortRegistry`].
pub struct Dispatcher {
    handlers: HashMap<String, Handler>,
    registry: Arc<AbortRegistry>,
    abort_operation: String,
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl Dispatcher {
    /// Create a dispatcher with no handlers.
    #[must_use]
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
            registry: Arc::new(AbortRegistry::new()),
            abort_operation: ABORT_STREAM_OPERATION.to_string(),
        }
    }

    /// Serve aborts under a different operation name.
    #[must_use]
    pub fn with_abort_operation<S: Into<String>>(mut self, operation: S) -> Self {
        self.abort_operation = operation.into();
        self
    }

    /// Register a handler for `operation`.
    pub fn register<F, Fut>(&mut self, operation: impl Into<String>, handler: F) -> &mut Self
    where
        F: Fn(RemoteArgs) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
    {
        let handler: Handler = Arc::new(move |args| handler(args).boxed());
        self.handlers.insert(operation.into(), handler);
        self
    }

    /// Registry of streams currently being received.
    #[must_use]
    pub const fn registry(&self) -> &Arc<AbortRegistry> {
        &self.registry
    }

    /// Convert raw call arguments, reviving stream handles.
    ///
    /// # Errors
    /// Returns error if an argument carries the marker but is malformed.
    pub fn revive(
        &self,
        args: Vec<Value>,
        source: &Arc<dyn StreamSource>,
    ) -> Result<RemoteArgs, TransportError> {
        let args = args
            .into_iter()
            .map(|value| {
                Ok(match StreamHandleRef::detect(&value)? {
                    Some(handle) => RemoteArg::Stream(GzippedJsonStream::new(
                        handle,
                        Arc::clone(source),
                        Arc::clone(&self.registry),
                    )),
                    None => RemoteArg::Value(value),
                })
            })
            .collect::<Result<_, TransportError>>()?;
        Ok(RemoteArgs { args })
    }

    /// Handle one remote call.
    ///
    /// # Errors
    /// Returns error if the operation is unknown, its arguments are invalid
    /// or its handler fails.
    pub async fn dispatch(
        &self,
        operation: &str,
        args: Vec<Value>,
        source: &Arc<dyn StreamSource>,
    ) -> Result<Value, DispatchError> {
        if operation == self.abort_operation {
            self.abort(&args)?;
            return Ok(Value::Null);
        }

        let handler = self
            .handlers
            .get(operation)
            .cloned()
            .ok_or_else(|| DispatchError::UnknownOperation(operation.to_string()))?;

        let args = self.revive(args, source)?;
        tracing::debug!(operation, args = args.len(), "dispatching remote call");
        handler(args).await.map_err(DispatchError::Handler)
    }

    fn abort(&self, args: &[Value]) -> Result<(), DispatchError> {
        let id = args
            .first()
            .and_then(Value::as_u64)
            .map(StreamId::from_raw)
            .ok_or_else(|| {
                DispatchError::InvalidArguments("abort expects a stream id".to_string())
            })?;

        if self.registry.abort(id) {
            tracing::info!(stream_id = %id, "aborted stream on sender request");
        }
        Ok(())
    }
}
