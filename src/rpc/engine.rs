//! Protocol engine
//!
//! Owns the connection: decodes incoming frames, dispatches requests to the
//! registry, correlates responses to requests the engine sent itself and
//! serializes everything outgoing through a single writer task.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use crate::common::{Error, Result};
use crate::dap::codec::{self, Frame, FrameReader};
use crate::dap::{
    ErrorResponseMessage, Event, EventMessage, ProtocolMessage, RequestMessage, ResponseMessage,
};

use super::error::RpcError;
use super::registry::{Call, Registry};

/// A request sent by the engine that has not been answered yet
struct PendingRequest {
    command: String,
    tx: oneshot::Sender<Result<Value>>,
}

/// Protocol engine for one client connection
pub struct Engine {
    registry: Arc<Registry>,
    /// Sequence number for outgoing messages
    next_seq: AtomicI64,
    /// Outgoing messages, consumed by the writer task
    outbox: Mutex<mpsc::UnboundedSender<ProtocolMessage>>,
    outbox_rx: Mutex<Option<mpsc::UnboundedReceiver<ProtocolMessage>>>,
    /// Requests we sent, keyed by their seq
    pending: Mutex<HashMap<i64, PendingRequest>>,
    /// Incoming requests currently being handled, keyed by their seq
    in_flight: Mutex<HashMap<i64, CancellationToken>>,
    shutdown: CancellationToken,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Engine {
    pub fn new(registry: Arc<Registry>) -> Arc<Self> {
        let (tx, rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            registry,
            next_seq: AtomicI64::new(1),
            outbox: Mutex::new(tx),
            outbox_rx: Mutex::new(Some(rx)),
            pending: Mutex::new(HashMap::new()),
            in_flight: Mutex::new(HashMap::new()),
            shutdown: CancellationToken::new(),
        })
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// Token cancelled when the engine stops serving
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Stop reading; queued output is still flushed
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    /// Serve one connection until the client hangs up or [`Engine::shutdown`] is called
    pub async fn serve<R, W>(self: &Arc<Self>, reader: R, writer: W) -> Result<()>
    where
        R: AsyncRead + Unpin + Send,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let rx = lock(&self.outbox_rx)
            .take()
            .ok_or_else(|| Error::Internal("Engine is already serving a connection".to_string()))?;

        let flushed = CancellationToken::new();
        let writer_task = tokio::spawn(write_loop(writer, rx, flushed.clone()));

        let mut frames = FrameReader::new(reader);
        let result = loop {
            let next = tokio::select! {
                next = frames.next_frame() => next,
                _ = self.shutdown.cancelled() => break Ok(()),
            };

            match next {
                Ok(Some(frame)) => self.handle_frame(frame),
                Ok(None) => {
                    tracing::info!("Client closed the connection");
                    break Ok(());
                }
                Err(Error::Io(e)) => break Err(Error::Io(e)),
                Err(e) => {
                    tracing::warn!("Discarding malformed message: {}", e);
                    self.send_error(0, "", RpcError::parse_error(e.to_string()));
                }
            }
        };

        self.shutdown.cancel();
        // Fail everything still waiting on the client
        lock(&self.pending).clear();
        for (_, token) in lock(&self.in_flight).drain() {
            token.cancel();
        }

        flushed.cancel();
        if let Err(e) = writer_task.await {
            tracing::error!("Writer task failed: {}", e);
        }

        result
    }

    fn handle_frame(self: &Arc<Self>, frame: Frame) {
        let parsed = frame
            .text()
            .and_then(|text| {
                tracing::trace!("DAP <<< {}", text);
                serde_json::from_str::<Value>(text).map_err(Error::from)
            });

        let value = match parsed {
            Ok(value) => value,
            Err(e) => {
                tracing::warn!("Failed to parse message body: {}", e);
                self.send_error(0, "", RpcError::parse_error(e.to_string()));
                return;
            }
        };

        let request_seq = value.get("seq").and_then(Value::as_i64).unwrap_or(0);
        let command = value
            .get("command")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();

        match ProtocolMessage::from_value(value) {
            Ok(ProtocolMessage::Request(request)) => self.dispatch_request(request),
            Ok(ProtocolMessage::Event(event)) => self.dispatch_notification(event),
            Ok(ProtocolMessage::Response(response)) => {
                self.complete_pending(response.request_seq, Ok(response.body.unwrap_or(Value::Null)));
            }
            Ok(ProtocolMessage::ErrorResponse(response)) => {
                let message = response
                    .body
                    .error
                    .map(|e| e.format)
                    .unwrap_or(response.message);
                self.complete_pending(
                    response.request_seq,
                    Err(Error::dap_request_failed(&response.command, &message)),
                );
            }
            Err(e) => {
                tracing::warn!("Invalid message: {}", e);
                self.send_error(request_seq, &command, RpcError::invalid_request(e.to_string()));
            }
        }
    }

    fn dispatch_request(self: &Arc<Self>, request: RequestMessage) {
        let seq = request.seq;
        let Some(method) = self.registry.resolve(&request.command) else {
            tracing::warn!(command = %request.command, "Unknown command");
            self.send_error(seq, &request.command, RpcError::method_not_found(&request.command));
            return;
        };

        let token = self.shutdown.child_token();
        lock(&self.in_flight).insert(seq, token.clone());

        let engine = Arc::clone(self);
        tokio::spawn(async move {
            let command = request.command;
            let call = Call::new(seq, &command, token.clone(), Arc::clone(&engine));
            let mut task = tokio::spawn(method.invoke(request.arguments, call.clone()));

            let outcome = tokio::select! {
                joined = &mut task => Some(joined),
                _ = token.cancelled() => {
                    task.abort();
                    None
                }
            };
            lock(&engine.in_flight).remove(&seq);
            // A handler that finished in the same instant it was cancelled still gets no reply
            let outcome = outcome.filter(|_| !token.is_cancelled());

            match outcome {
                None => tracing::debug!(seq, command = %command, "Request cancelled, not replying"),
                Some(Ok(Ok(body))) => engine.send_response(seq, &command, body),
                Some(Ok(Err(err))) => {
                    tracing::debug!(seq, command = %command, "Request failed: {}", err);
                    engine.send_error(seq, &command, err);
                }
                Some(Err(join_error)) => {
                    tracing::error!(seq, command = %command, "Handler panicked: {}", join_error);
                    engine.send_error(
                        seq,
                        &command,
                        RpcError::internal(format!("Internal error while handling '{}'", command)),
                    );
                }
            }

            if call.wants_close() {
                engine.shutdown();
            }
        });
    }

    fn dispatch_notification(self: &Arc<Self>, event: EventMessage) {
        let Some(method) = self.registry.resolve(&event.event) else {
            tracing::debug!(event = %event.event, "Ignoring client event");
            return;
        };

        let call = Call::new(0, &event.event, self.shutdown.child_token(), Arc::clone(self));
        tokio::spawn(async move {
            match tokio::spawn(method.invoke(event.body, call)).await {
                Ok(Ok(_)) => {}
                Ok(Err(e)) => tracing::warn!(event = %event.event, "Notification handler failed: {}", e),
                Err(e) => tracing::error!(event = %event.event, "Notification handler panicked: {}", e),
            }
        });
    }

    fn complete_pending(&self, request_seq: i64, result: Result<Value>) {
        let Some(pending) = lock(&self.pending).remove(&request_seq) else {
            tracing::warn!(request_seq, "Response for unknown request, dropping it");
            return;
        };

        tracing::debug!(request_seq, command = %pending.command, "Request answered");
        // The caller may have stopped waiting
        let _ = pending.tx.send(result);
    }

    /// Assign the next seq and queue a message in one step so seqs go out in order
    fn enqueue(&self, build: impl FnOnce(i64) -> ProtocolMessage) -> i64 {
        let outbox = lock(&self.outbox);
        let seq = self.next_seq.fetch_add(1, Ordering::SeqCst);
        if outbox.send(build(seq)).is_err() {
            tracing::debug!(seq, "Connection gone, dropping outgoing message");
        }
        seq
    }

    fn send_response(&self, request_seq: i64, command: &str, body: Value) {
        let body = (!body.is_null()).then_some(body);
        self.enqueue(|seq| {
            ProtocolMessage::Response(ResponseMessage::new(seq, request_seq, command, body))
        });
    }

    fn send_error(&self, request_seq: i64, command: &str, error: RpcError) {
        self.enqueue(|seq| {
            ProtocolMessage::ErrorResponse(ErrorResponseMessage::new(
                seq,
                request_seq,
                command,
                &error.message,
                error.to_detail(),
            ))
        });
    }

    /// Queue an event for the client
    pub fn send_event(&self, event: &Event) {
        let body = match event.body() {
            Ok(body) => body,
            Err(e) => {
                tracing::error!(event = event.name(), "Failed to serialize event: {}", e);
                return;
            }
        };
        let name = event.name().to_string();
        self.enqueue(|seq| ProtocolMessage::Event(EventMessage::new(seq, &name, body)));
    }

    /// Send a request to the client and wait for its response
    ///
    /// The pending entry is registered before the request is queued. When
    /// `timeout` expires the entry is removed and a timeout error returned;
    /// the connection is left alone.
    pub async fn send_request<T: DeserializeOwned>(
        &self,
        command: &str,
        arguments: Option<Value>,
        timeout: Option<Duration>,
    ) -> Result<T> {
        let (tx, rx) = oneshot::channel();

        let seq = self.enqueue(|seq| {
            lock(&self.pending).insert(
                seq,
                PendingRequest {
                    command: command.to_string(),
                    tx,
                },
            );
            ProtocolMessage::Request(RequestMessage::new(seq, command, arguments))
        });

        let answer = match timeout {
            Some(limit) => match tokio::time::timeout(limit, rx).await {
                Ok(answer) => answer,
                Err(_) => {
                    lock(&self.pending).remove(&seq);
                    return Err(Error::request_timeout(command, limit));
                }
            },
            None => rx.await,
        };

        let body = answer.map_err(|_| Error::ConnectionClosed)??;
        serde_json::from_value(body).map_err(|e| {
            Error::DapProtocol(format!("Invalid '{}' response: {}", command, e))
        })
    }

    /// Cancel an incoming request that is still being handled
    ///
    /// Returns false when no such request is in flight.
    pub fn cancel_request(&self, request_id: i64) -> bool {
        match lock(&self.in_flight).get(&request_id) {
            Some(token) => {
                tracing::debug!(request_id, "Cancelling request");
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// Number of requests sent to the client that are still unanswered
    pub fn pending_requests(&self) -> usize {
        lock(&self.pending).len()
    }
}

async fn write_loop<W: AsyncWrite + Unpin>(
    mut writer: W,
    mut rx: mpsc::UnboundedReceiver<ProtocolMessage>,
    flushed: CancellationToken,
) {
    loop {
        let message = tokio::select! {
            message = rx.recv() => message,
            _ = flushed.cancelled() => {
                // Drain what is already queued, then stop
                while let Ok(message) = rx.try_recv() {
                    if write_one(&mut writer, &message).await.is_err() {
                        break;
                    }
                }
                return;
            }
        };

        let Some(message) = message else {
            return;
        };
        if write_one(&mut writer, &message).await.is_err() {
            return;
        }
    }
}

async fn write_one<W: AsyncWrite + Unpin>(writer: &mut W, message: &ProtocolMessage) -> Result<()> {
    let json = serde_json::to_string(&message.to_value()?)?;
    tracing::trace!("DAP >>> {}", json);

    codec::write_message(writer, &json).await.map_err(|e| {
        tracing::error!("Failed to write message: {}", e);
        e
    })
}
