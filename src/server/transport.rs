//! Byte streams the adapter can serve on
//!
//! TCP accepts exactly one client; later connection attempts are refused.
//! Stdio uses the process' own stdin/stdout.

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::common::{Error, Result};

pub type BoxedReader = Box<dyn AsyncRead + Unpin + Send>;
pub type BoxedWriter = Box<dyn AsyncWrite + Unpin + Send>;

/// An established client connection
pub struct Connection {
    pub reader: BoxedReader,
    pub writer: BoxedWriter,
    /// Human readable peer description for logs
    pub peer: String,
}

impl Connection {
    pub fn stdio() -> Self {
        Self {
            reader: Box::new(tokio::io::stdin()),
            writer: Box::new(tokio::io::stdout()),
            peer: "stdio".to_string(),
        }
    }
}

/// Bind the TCP listener
pub async fn bind(host: &str, port: u16) -> Result<TcpListener> {
    let listener = TcpListener::bind((host, port)).await.map_err(|e| {
        Error::Config(format!("Cannot listen on {}:{}: {}", host, port, e))
    })?;
    if let Ok(addr) = listener.local_addr() {
        tracing::info!(%addr, "Listening for a debugger client");
    }
    Ok(listener)
}

/// Accept the first client, then refuse everyone else until `closed` is cancelled
pub async fn accept_single(listener: TcpListener, closed: CancellationToken) -> Result<Connection> {
    let (stream, peer) = listener.accept().await?;
    tracing::info!(%peer, "Client connected");
    stream.set_nodelay(true)?;

    tokio::spawn(refuse_others(listener, closed));

    let (reader, writer) = stream.into_split();
    Ok(Connection {
        reader: Box::new(reader),
        writer: Box::new(writer),
        peer: peer.to_string(),
    })
}

async fn refuse_others(listener: TcpListener, closed: CancellationToken) {
    loop {
        let accepted = tokio::select! {
            accepted = listener.accept() => accepted,
            _ = closed.cancelled() => return,
        };
        match accepted {
            Ok((stream, peer)) => {
                tracing::warn!(%peer, "{}", Error::AlreadyConnected);
                drop(stream);
            }
            Err(e) => {
                tracing::debug!("Accept failed: {}", e);
                return;
            }
        }
    }
}
