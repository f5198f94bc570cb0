//! Stream coordinator: one active stream per instance.

use std::sync::{
    Arc, Mutex, MutexGuard, PoisonError,
    atomic::{AtomicBool, Ordering},
};

use gzstream_core::{
    CoordinatorConfig, StreamError, StreamHandleRef, StreamId, Transport, codec,
};
use serde::{Serialize, de::DeserializeOwned};
use serde_json::Value;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Session currently occupying the coordinator's slot.
struct ActiveSession {
    id: StreamId,
    cancel: CancellationToken,
}

#[derive(Default)]
struct Slot {
    current: Option<ActiveSession>,
    disposed: bool,
}

/// Streams payloads to a remote operation, one at a time.
///
/// Starting a send supersedes any send still in flight: the earlier caller
/// observes `StreamError::Cancelled` and, if its transport call had already
/// started, the remote side is told to abort that stream.
pub struct StreamCoordinator<T: Transport> {
    transport: Arc<T>,
    config: Arc<CoordinatorConfig>,
    slot: Arc<Mutex<Slot>>,
}

impl<T: Transport> StreamCoordinator<T> {
    /// Create a new coordinator over a transport.
    #[must_use]
    pub fn new(transport: Arc<T>, config: CoordinatorConfig) -> Self {
        Self {
            transport,
            config: Arc::new(config),
            slot: Arc::new(Mutex::new(Slot::default())),
        }
    }

    /// Compress `payload` and invoke `operation` on the remote side with a
    /// stream handle as its first argument, followed by `extra_args`.
    ///
    /// Dropping the returned future cancels the session.
    ///
    /// # Errors
    /// Returns `StreamError::Cancelled` if superseded or cancelled,
    /// `StreamError::Disposed` if the coordinator was disposed, or the
    /// underlying failure.
    pub async fn send<P, R>(
        &self,
        operation: &str,
        payload: P,
        extra_args: Vec<Value>,
    ) -> Result<R, StreamError>
    where
        P: Serialize + Send + 'static,
        R: DeserializeOwned,
    {
        let (cancel, task) = self.begin(operation, payload, extra_args)?;

        let guard = cancel.drop_guard();
        let outcome = task.await;
        guard.disarm();

        let value = match outcome {
            Ok(result) => result?,
            Err(e) if e.is_cancelled() => return Err(StreamError::Cancelled),
            Err(e) => return Err(StreamError::TaskFailed(e.to_string())),
        };
        serde_json::from_value(value).map_err(StreamError::Decode)
    }

    /// Like [`send`](Self::send) for operations without a result.
    ///
    /// # Errors
    /// Same as [`send`](Self::send).
    pub async fn send_void<P>(
        &self,
        operation: &str,
        payload: P,
        extra_args: Vec<Value>,
    ) -> Result<(), StreamError>
    where
        P: Serialize + Send + 'static,
    {
        self.send::<P, Value>(operation, payload, extra_args)
            .await
            .map(drop)
    }

    /// Identifier of the session currently in flight, if any.
    #[must_use]
    pub fn active_stream(&self) -> Option<StreamId> {
        self.slot_or_poisoned().current.as_ref().map(|s| s.id)
    }

    /// Cancel the session in flight without disposing the coordinator.
    ///
    /// Returns whether a session was cancelled.
    pub fn cancel(&self) -> bool {
        let mut slot = self.slot_or_poisoned();
        slot.current.take().is_some_and(|session| {
            tracing::info!(stream_id = %session.id, "cancelling active stream");
            session.cancel.cancel();
            true
        })
    }

    /// Cancel any session in flight and refuse further sends.
    ///
    /// Safe to call repeatedly and with no active session.
    pub fn dispose(&self) {
        let mut slot = self.slot_or_poisoned();
        if !slot.disposed {
            tracing::debug!("disposing stream coordinator");
        }
        slot.disposed = true;
        if let Some(session) = slot.current.take() {
            tracing::info!(stream_id = %session.id, "cancelling active stream on dispose");
            session.cancel.cancel();
        }
    }

    /// Whether [`dispose`](Self::dispose) has been called.
    #[must_use]
    pub fn is_disposed(&self) -> bool {
        self.slot_or_poisoned().disposed
    }

    /// Supersede the previous session and launch a new one.
    ///
    /// Only the bookkeeping runs under the lock; the work itself is spawned.
    fn begin<P>(
        &self,
        operation: &str,
        payload: P,
        extra_args: Vec<Value>,
    ) -> Result<(CancellationToken, JoinHandle<Result<Value, StreamError>>), StreamError>
    where
        P: Serialize + Send + 'static,
    {
        let mut slot = self
            .slot
            .lock()
            .map_err(|e| StreamError::Internal(e.to_string()))?;

        if slot.disposed {
            return Err(StreamError::Disposed);
        }

        if let Some(previous) = slot.current.take() {
            tracing::info!(stream_id = %previous.id, "superseding active stream");
            previous.cancel.cancel();
        }

        let id = StreamId::next();
        let cancel = CancellationToken::new();
        let session = Session {
            id,
            cancel: cancel.clone(),
            operation: operation.to_string(),
            transport: Arc::clone(&self.transport),
            config: Arc::clone(&self.config),
            slot: Arc::clone(&self.slot),
        };

        tracing::debug!(stream_id = %id, operation, "starting stream");
        let task = tokio::spawn(session.run(payload, extra_args));
        slot.current = Some(ActiveSession {
            id,
            cancel: cancel.clone(),
        });

        Ok((cancel, task))
    }

    fn slot_or_poisoned(&self) -> MutexGuard<'_, Slot> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<T: Transport> Drop for StreamCoordinator<T> {
    fn drop(&mut self) {
        self.dispose();
    }
}

/// Sends the remote abort for a session, at most once, and only after the
/// transport call has started.
struct AbortForwarder<T: Transport> {
    id: StreamId,
    transport: Arc<T>,
    operation: String,
    armed: AtomicBool,
}

impl<T: Transport> AbortForwarder<T> {
    const fn new(id: StreamId, transport: Arc<T>, operation: String) -> Self {
        Self {
            id,
            transport,
            operation,
            armed: AtomicBool::new(false),
        }
    }

    fn arm(&self) {
        self.armed.store(true, Ordering::Release);
    }

    fn fire(&self) {
        if !self.armed.swap(false, Ordering::AcqRel) {
            return;
        }

        let id = self.id;
        let transport = Arc::clone(&self.transport);
        let operation = self.operation.clone();
        tokio::spawn(async move {
            tracing::debug!(stream_id = %id, "forwarding abort to remote");
            if let Err(e) = transport
                .notify(&operation, vec![Value::from(id.as_u64())])
                .await
            {
                tracing::warn!(stream_id = %id, "failed to forward abort: {e}");
            }
        });
    }
}

/// One attempt to compress and transmit one payload.
struct Session<T: Transport> {
    id: StreamId,
    cancel: CancellationToken,
    operation: String,
    transport: Arc<T>,
    config: Arc<CoordinatorConfig>,
    slot: Arc<Mutex<Slot>>,
}

impl<T: Transport> Session<T> {
    async fn run<P>(self, payload: P, extra_args: Vec<Value>) -> Result<Value, StreamError>
    where
        P: Serialize + Send + 'static,
    {
        let forwarder = AbortForwarder::new(
            self.id,
            Arc::clone(&self.transport),
            self.config.abort_operation.clone(),
        );

        let outcome = tokio::select! {
            biased;
            () = self.cancel.cancelled() => Err(StreamError::Cancelled),
            result = self.transmit(payload, extra_args, &forwarder) => result,
        };

        match &outcome {
            Ok(_) => tracing::debug!(stream_id = %self.id, "stream completed"),
            Err(StreamError::Cancelled) => {
                forwarder.fire();
                tracing::info!(stream_id = %self.id, "stream cancelled");
            }
            Err(e) => tracing::warn!(stream_id = %self.id, "stream failed: {e}"),
        }

        self.vacate();
        outcome
    }

    async fn transmit<P>(
        &self,
        payload: P,
        extra_args: Vec<Value>,
        forwarder: &AbortForwarder<T>,
    ) -> Result<Value, StreamError>
    where
        P: Serialize + Send + 'static,
    {
        let config = Arc::clone(&self.config);
        let cancel = self.cancel.clone();
        let compressed =
            tokio::task::spawn_blocking(move || codec::compress(&payload, &config, &cancel))
                .await
                .map_err(|e| StreamError::TaskFailed(e.to_string()))??;

        tracing::debug!(
            stream_id = %self.id,
            compressed_bytes = compressed.len(),
            "payload ready"
        );

        // Released when this future completes or is dropped on cancellation.
        let lease = self.transport.open_stream(compressed)?;
        let handle = StreamHandleRef::new(self.id, lease.reference().clone());

        let mut args = Vec::with_capacity(extra_args.len() + 1);
        args.push(handle.to_value());
        args.extend(extra_args);

        forwarder.arm();
        let result = self.transport.invoke(&self.operation, args).await;
        drop(lease);

        Ok(result?)
    }

    /// Clear the slot if it still holds this session.
    fn vacate(&self) {
        let mut slot = self.slot.lock().unwrap_or_else(PoisonError::into_inner);
        if slot.current.as_ref().is_some_and(|s| s.id == self.id) {
            slot.current = None;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{
        collections::HashMap,
        sync::atomic::{AtomicU64, AtomicUsize},
        time::Duration,
    };

    use async_trait::async_trait;
    use gzstream_core::{CompressedPayload, StreamLease, TransportError};
    use serde::ser::{SerializeSeq, Serializer};
    use serde_json::json;
    use tokio::sync::{Semaphore, mpsc};

    use super::*;

    /// Transport that decodes the streamed payload locally and echoes it.
    struct MockTransport {
        streams: Mutex<HashMap<u64, CompressedPayload>>,
        next_ref: AtomicU64,
        gate: Semaphore,
        started: mpsc::UnboundedSender<StreamId>,
        calls: Mutex<Vec<(String, Vec<Value>)>>,
        notifications: Mutex<Vec<(String, Vec<Value>)>>,
        released: Arc<AtomicUsize>,
    }

    impl MockTransport {
        /// When `hold` is set, every invoke waits for a permit on `gate`.
        fn new(hold: bool) -> (Arc<Self>, mpsc::UnboundedReceiver<StreamId>) {
            let (started, started_rx) = mpsc::unbounded_channel();
            let permits = if hold { 0 } else { Semaphore::MAX_PERMITS };
            let transport = Arc::new(Self {
                streams: Mutex::new(HashMap::new()),
                next_ref: AtomicU64::new(1),
                gate: Semaphore::new(permits),
                started,
                calls: Mutex::new(Vec::new()),
                notifications: Mutex::new(Vec::new()),
                released: Arc::new(AtomicUsize::new(0)),
            });
            (transport, started_rx)
        }

        fn aborted_ids(&self) -> Vec<Value> {
            self.notifications
                .lock()
                .unwrap()
                .iter()
                .filter(|(op, _)| op == "abortStream")
                .map(|(_, args)| args[0].clone())
                .collect()
        }

        fn call_count(&self) -> usize {
            self.calls.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl Transport for MockTransport {
        fn open_stream(&self, payload: CompressedPayload) -> Result<StreamLease, TransportError> {
            let reference = self.next_ref.fetch_add(1, Ordering::SeqCst);
            self.streams.lock().unwrap().insert(reference, payload);
            let released = Arc::clone(&self.released);
            Ok(StreamLease::new(json!(reference), move || {
                released.fetch_add(1, Ordering::SeqCst);
            }))
        }

        async fn invoke(&self, operation: &str, args: Vec<Value>) -> Result<Value, TransportError> {
            self.calls
                .lock()
                .unwrap()
                .push((operation.to_string(), args.clone()));

            let handle = StreamHandleRef::detect(&args[0])?
                .ok_or_else(|| TransportError::Protocol("missing handle".into()))?;
            let _ = self.started.send(handle.stream_id);

            if operation == "fail" {
                return Err(TransportError::Remote("boom".into()));
            }

            let _permit = self
                .gate
                .acquire()
                .await
                .map_err(|_| TransportError::LinkClosed)?;

            let reference = handle.reference.as_u64().unwrap();
            let payload = self.streams.lock().unwrap().remove(&reference).unwrap();
            codec::decompress(payload.as_bytes())
                .map_err(|e| TransportError::Protocol(e.to_string()))
        }

        async fn notify(&self, operation: &str, args: Vec<Value>) -> Result<(), TransportError> {
            self.notifications
                .lock()
                .unwrap()
                .push((operation.to_string(), args));
            Ok(())
        }
    }

    /// Payload that serializes slowly so a test can cancel mid-compression.
    struct SlowPayload {
        started: Arc<AtomicBool>,
        emitted: Arc<AtomicUsize>,
    }

    const SLOW_ELEMENTS: usize = 400;

    impl Serialize for SlowPayload {
        fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
            self.started.store(true, Ordering::SeqCst);
            let mut seq = serializer.serialize_seq(Some(SLOW_ELEMENTS))?;
            for i in 0..SLOW_ELEMENTS {
                std::thread::sleep(Duration::from_millis(5));
                seq.serialize_element(&i)?;
                self.emitted.fetch_add(1, Ordering::SeqCst);
            }
            seq.end()
        }
    }

    async fn wait_until(cond: impl Fn() -> bool) {
        for _ in 0..400 {
            if cond() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached in time");
    }

    fn coordinator(transport: &Arc<MockTransport>) -> Arc<StreamCoordinator<MockTransport>> {
        Arc::new(StreamCoordinator::new(
            Arc::clone(transport),
            CoordinatorConfig::default(),
        ))
    }

    #[tokio::test]
    async fn test_send_roundtrip() {
        let (transport, _started) = MockTransport::new(false);
        let coordinator = coordinator(&transport);

        let result: Vec<String> = coordinator
            .send("echo", vec!["a", "b", "c"], vec![json!(1), json!("x")])
            .await
            .unwrap();
        assert_eq!(result, vec!["a", "b", "c"]);

        let calls = transport.calls.lock().unwrap().clone();
        assert_eq!(calls.len(), 1);
        let (operation, args) = &calls[0];
        assert_eq!(operation, "echo");
        assert_eq!(args.len(), 3);
        assert!(args[0].get("__gzippedJsonStream").is_some());
        assert_eq!(args[1..], [json!(1), json!("x")]);

        assert!(transport.aborted_ids().is_empty());
        assert_eq!(transport.released.load(Ordering::SeqCst), 1);
        assert_eq!(coordinator.active_stream(), None);
    }

    #[tokio::test]
    async fn test_send_void() {
        let (transport, _started) = MockTransport::new(false);
        let coordinator = coordinator(&transport);
        tokio_test::assert_ok!(coordinator.send_void("echo", json!({"k": 1}), vec![]).await);
    }

    #[tokio::test]
    async fn test_transport_error_is_failure_not_cancellation() {
        let (transport, _started) = MockTransport::new(false);
        let coordinator = coordinator(&transport);

        let err = coordinator
            .send::<_, Value>("fail", vec![1, 2], vec![])
            .await
            .unwrap_err();
        assert!(!err.is_cancelled());
        assert!(matches!(err, StreamError::Transport(TransportError::Remote(_))));
        assert!(transport.aborted_ids().is_empty());
    }

    #[tokio::test]
    async fn test_result_decode_error() {
        let (transport, _started) = MockTransport::new(false);
        let coordinator = coordinator(&transport);

        let err = coordinator
            .send::<_, u32>("echo", vec!["not", "a", "number"], vec![])
            .await
            .unwrap_err();
        assert!(matches!(err, StreamError::Decode(_)));
    }

    #[tokio::test]
    async fn test_supersede_cancels_active_transfer() {
        let (transport, mut started) = MockTransport::new(true);
        let coordinator = coordinator(&transport);

        let first = tokio::spawn({
            let coordinator = Arc::clone(&coordinator);
            async move { coordinator.send::<_, Value>("slow", vec!["big"; 1000], vec![]).await }
        });
        let first_id = started.recv().await.unwrap();
        assert_eq!(coordinator.active_stream(), Some(first_id));

        let second = tokio::spawn({
            let coordinator = Arc::clone(&coordinator);
            async move { coordinator.send::<_, Value>("slow", vec!["other"], vec![]).await }
        });
        let second_id = started.recv().await.unwrap();
        assert_ne!(first_id, second_id);

        let first_result = first.await.unwrap();
        assert!(matches!(first_result, Err(StreamError::Cancelled)));

        transport.gate.add_permits(1);
        let second_result = second.await.unwrap().unwrap();
        assert_eq!(second_result, json!(["other"]));

        wait_until(|| transport.aborted_ids().len() == 1).await;
        assert_eq!(transport.aborted_ids(), vec![json!(first_id.as_u64())]);
    }

    #[tokio::test]
    async fn test_single_flight_many_sends() {
        let (transport, mut started) = MockTransport::new(true);
        let coordinator = coordinator(&transport);

        let mut tasks = Vec::new();
        let mut ids = Vec::new();
        for n in 0..5 {
            let coordinator = Arc::clone(&coordinator);
            tasks.push(tokio::spawn(async move {
                coordinator.send::<_, Value>("slow", vec![n], vec![]).await
            }));
            ids.push(started.recv().await.unwrap());
        }

        transport.gate.add_permits(1);

        let last = tasks.pop().unwrap();
        for task in tasks {
            assert!(matches!(task.await.unwrap(), Err(StreamError::Cancelled)));
        }
        assert_eq!(last.await.unwrap().unwrap(), json!([4]));

        wait_until(|| transport.aborted_ids().len() == 4).await;
        let mut aborted: Vec<u64> = transport
            .aborted_ids()
            .iter()
            .filter_map(Value::as_u64)
            .collect();
        aborted.sort_unstable();
        let expected: Vec<u64> = ids[..4].iter().map(|id| id.as_u64()).collect();
        assert_eq!(aborted, expected);
    }

    #[tokio::test]
    async fn test_no_abort_when_cancelled_during_compression() {
        let (transport, _started) = MockTransport::new(false);
        let coordinator = coordinator(&transport);

        let started = Arc::new(AtomicBool::new(false));
        let emitted = Arc::new(AtomicUsize::new(0));
        let payload = SlowPayload {
            started: Arc::clone(&started),
            emitted: Arc::clone(&emitted),
        };

        let task = tokio::spawn({
            let coordinator = Arc::clone(&coordinator);
            async move { coordinator.send::<_, Value>("echo", payload, vec![]).await }
        });

        wait_until(|| started.load(Ordering::SeqCst)).await;
        assert!(coordinator.cancel());

        assert!(matches!(task.await.unwrap(), Err(StreamError::Cancelled)));

        // Give the blocking compressor a moment to observe the token.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(emitted.load(Ordering::SeqCst) < SLOW_ELEMENTS);
        assert_eq!(transport.call_count(), 0);
        assert!(transport.aborted_ids().is_empty());
        assert!(transport.notifications.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_abort_once_when_cancelled_mid_call() {
        let (transport, mut started) = MockTransport::new(true);
        let coordinator = coordinator(&transport);

        let task = tokio::spawn({
            let coordinator = Arc::clone(&coordinator);
            async move { coordinator.send::<_, Value>("slow", vec!["x"], vec![]).await }
        });
        let id = started.recv().await.unwrap();

        assert!(coordinator.cancel());
        assert!(!coordinator.cancel());
        assert!(matches!(task.await.unwrap(), Err(StreamError::Cancelled)));

        wait_until(|| transport.aborted_ids().len() == 1).await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(transport.aborted_ids(), vec![json!(id.as_u64())]);
        assert_eq!(transport.released.load(Ordering::SeqCst), 1);
        assert_eq!(coordinator.active_stream(), None);
    }

    #[tokio::test]
    async fn test_dropping_send_future_cancels_session() {
        let (transport, mut started) = MockTransport::new(true);
        let coordinator = coordinator(&transport);

        let id = {
            let send = coordinator.send::<_, Value>("slow", vec!["x"], vec![]);
            tokio::pin!(send);
            tokio::select! {
                _ = &mut send => panic!("send should still be in flight"),
                Some(id) = started.recv() => id,
            }
        };

        wait_until(|| transport.aborted_ids().len() == 1).await;
        assert_eq!(transport.aborted_ids(), vec![json!(id.as_u64())]);
    }

    #[tokio::test]
    async fn test_dispose_cancels_and_rejects_further_sends() {
        let (transport, mut started) = MockTransport::new(true);
        let coordinator = coordinator(&transport);

        let task = tokio::spawn({
            let coordinator = Arc::clone(&coordinator);
            async move { coordinator.send::<_, Value>("slow", vec!["x"], vec![]).await }
        });
        let id = started.recv().await.unwrap();

        coordinator.dispose();
        assert!(coordinator.is_disposed());
        assert!(matches!(task.await.unwrap(), Err(StreamError::Cancelled)));

        wait_until(|| transport.aborted_ids().len() == 1).await;
        assert_eq!(transport.aborted_ids(), vec![json!(id.as_u64())]);

        let err = coordinator
            .send::<_, Value>("echo", vec!["late"], vec![])
            .await
            .unwrap_err();
        assert!(matches!(err, StreamError::Disposed));

        coordinator.dispose();
        assert_eq!(transport.aborted_ids().len(), 1);
    }

    #[tokio::test]
    async fn test_dispose_without_session() {
        let (transport, _started) = MockTransport::new(false);
        let coordinator = coordinator(&transport);
        coordinator.dispose();
        coordinator.dispose();
        assert!(!coordinator.cancel());
        assert!(transport.notifications.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_custom_abort_operation() {
        let (transport, mut started) = MockTransport::new(true);
        let coordinator = Arc::new(StreamCoordinator::new(
            Arc::clone(&transport),
            CoordinatorConfig::default().with_abort_operation("cancelTransfer"),
        ));

        let task = tokio::spawn({
            let coordinator = Arc::clone(&coordinator);
            async move { coordinator.send::<_, Value>("slow", vec![1], vec![]).await }
        });
        started.recv().await.unwrap();
        coordinator.cancel();
        assert!(task.await.unwrap().is_err());

        wait_until(|| !transport.notifications.lock().unwrap().is_empty()).await;
        assert_eq!(transport.notifications.lock().unwrap()[0].0, "cancelTransfer");
    }
}
