//! Debug adapter server
//!
//! Ties the protocol engine to the debug session:
//! 1. Serves one client connection (TCP or stdio)
//! 2. Forwards session events to the client in order
//! 3. Provides the bootstrap waits (client connected, configuration done)
//! 4. Closes the connection after the final events are flushed

pub mod handlers;
pub mod transport;

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::common::config::{ServerConfig, TransportMode};
use crate::common::{Error, Result};
use crate::dap::{Event, ExitedEventBody};
use crate::debugger::Debugger;
use crate::rpc::{Engine, Registry};

use handlers::AdapterState;
use transport::Connection;

pub struct Server {
    engine: Arc<Engine>,
    debugger: Arc<Debugger>,
    connected: CancellationToken,
    configuration_done: CancellationToken,
    released: CancellationToken,
    pump_stop: CancellationToken,
    pump: Mutex<Option<JoinHandle<()>>>,
}

impl Server {
    /// Build the server and start forwarding `events`
    ///
    /// Must be called from within a tokio runtime. Events queued before a
    /// client connects are delivered once it does.
    pub fn new(debugger: Arc<Debugger>, events: mpsc::UnboundedReceiver<Event>) -> Arc<Self> {
        let configuration_done = CancellationToken::new();
        let released = CancellationToken::new();
        let registry = Arc::new(Registry::new());
        handlers::register(
            &registry,
            Arc::new(AdapterState {
                debugger: Arc::clone(&debugger),
                configuration_done: configuration_done.clone(),
                released: released.clone(),
            }),
        );

        let engine = Engine::new(registry);
        let pump_stop = CancellationToken::new();
        let pump = tokio::spawn(pump_events(Arc::clone(&engine), events, pump_stop.clone()));

        Arc::new(Self {
            engine,
            debugger,
            connected: CancellationToken::new(),
            configuration_done,
            released,
            pump_stop,
            pump: Mutex::new(Some(pump)),
        })
    }

    pub fn engine(&self) -> &Arc<Engine> {
        &self.engine
    }

    /// Open the configured transport and serve it in the background
    pub async fn listen(self: &Arc<Self>, config: &ServerConfig) -> Result<JoinHandle<Result<()>>> {
        let server = Arc::clone(self);
        match config.mode {
            TransportMode::Stdio => Ok(tokio::spawn(async move {
                server.serve_connection(Connection::stdio()).await
            })),
            TransportMode::Tcp => {
                let listener = transport::bind(&config.host, config.port).await?;
                let closed = self.engine.shutdown_token();
                Ok(tokio::spawn(async move {
                    let accepted = tokio::select! {
                        accepted = transport::accept_single(listener, closed.clone()) => accepted?,
                        _ = closed.cancelled() => return Ok(()),
                    };
                    server.serve_connection(accepted).await
                }))
            }
        }
    }

    async fn serve_connection(&self, connection: Connection) -> Result<()> {
        tracing::debug!(peer = %connection.peer, "Serving connection");
        self.serve(connection.reader, connection.writer).await
    }

    /// Serve one client until it disconnects or the server is closed
    ///
    /// A lost client terminates the execution, unless it disconnected
    /// with `terminateDebuggee: false`, in which case the run continues
    /// unattended.
    pub async fn serve<R, W>(&self, reader: R, writer: W) -> Result<()>
    where
        R: AsyncRead + Unpin + Send,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        if self.connected.is_cancelled() {
            return Err(Error::AlreadyConnected);
        }
        self.connected.cancel();

        let result = self.engine.serve(reader, writer).await;
        if self.released.is_cancelled() {
            self.debugger.stop();
        } else {
            self.debugger.terminate();
        }
        result
    }

    /// Wait until a client is connected
    pub async fn wait_for_client(&self, timeout: Duration) -> Result<()> {
        tokio::time::timeout(timeout, self.connected.cancelled())
            .await
            .map_err(|_| Error::ClientTimeout(timeout.as_secs()))
    }

    /// Tell the client it may send its configuration
    pub fn initialized(&self) {
        self.debugger.emit(Event::Initialized);
    }

    /// Wait until the client sent `configurationDone`
    pub async fn wait_for_configuration_done(&self, timeout: Duration) -> Result<()> {
        tokio::time::timeout(timeout, self.configuration_done.cancelled())
            .await
            .map_err(|_| Error::ConfigurationTimeout(timeout.as_secs()))
    }

    /// Report the end of execution to the client
    pub fn exited(&self, exit_code: i32) {
        self.debugger.emit(Event::Exited(ExitedEventBody { exit_code }));
        self.debugger.emit(Event::Terminated(None));
    }

    /// Flush pending events, then stop serving
    ///
    /// Repeated calls do nothing.
    pub async fn close(&self) {
        self.pump_stop.cancel();
        let pump = self.pump.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(pump) = pump {
            if let Err(e) = pump.await {
                tracing::error!("Event pump failed: {}", e);
            }
        }
        self.engine.shutdown();
    }
}

/// Forward session events to the engine until stopped, then drain what's left
async fn pump_events(
    engine: Arc<Engine>,
    mut events: mpsc::UnboundedReceiver<Event>,
    stop: CancellationToken,
) {
    loop {
        tokio::select! {
            biased;
            event = events.recv() => match event {
                Some(event) => engine.send_event(&event),
                None => return,
            },
            _ = stop.cancelled() => {
                while let Ok(event) = events.try_recv() {
                    engine.send_event(&event);
                }
                return;
            }
        }
    }
}
