//! Pass-through middleware that writes each caller's address to an output
//! stream. It never rejects a request.

use std::fmt;
use std::net::SocketAddr;
use std::str::FromStr;
use std::sync::Arc;

use axum::extract::{ConnectInfo, Request, State};
use axum::middleware::Next;
use axum::response::Response;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;

use crate::gate::errors::ConfigError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputStream {
    Stdout,
    Stderr,
}

impl FromStr for OutputStream {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "stdout" => Ok(OutputStream::Stdout),
            "stderr" => Ok(OutputStream::Stderr),
            other => Err(ConfigError::UnknownOutputStream(other.to_string())),
        }
    }
}

type Sink = Box<dyn AsyncWrite + Send + Unpin>;

#[derive(Clone)]
pub struct RemoteAddrLogger {
    sink: Arc<Mutex<Sink>>,
}

impl RemoteAddrLogger {
    pub fn new(stream: OutputStream) -> Self {
        match stream {
            OutputStream::Stdout => Self::with_writer(tokio::io::stdout()),
            OutputStream::Stderr => Self::with_writer(tokio::io::stderr()),
        }
    }

    pub fn with_writer<W: AsyncWrite + Send + Unpin + 'static>(writer: W) -> Self {
        Self {
            sink: Arc::new(Mutex::new(Box::new(writer))),
        }
    }

    async fn record(&self, addr: &SocketAddr) {
        let mut sink = self.sink.lock().await;
        let written = match sink.write_all(addr.to_string().as_bytes()).await {
            Ok(()) => sink.flush().await,
            Err(e) => Err(e),
        };
        if let Err(e) = written {
            tracing::warn!(error = %e, "failed to write remote address");
        }
    }
}

impl fmt::Debug for RemoteAddrLogger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteAddrLogger").finish_non_exhaustive()
    }
}

pub async fn log_remote_addr(
    State(logger): State<RemoteAddrLogger>,
    request: Request,
    next: Next,
) -> Response {
    match request.extensions().get::<ConnectInfo<SocketAddr>>() {
        Some(ConnectInfo(addr)) => logger.record(addr).await,
        None => tracing::debug!("no peer address on request"),
    }
    next.run(request).await
}
