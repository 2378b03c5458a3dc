//! Full-duplex byte stream to the server
//!
//! Plain TCP by default, optionally wrapped by a pluggable [`TlsAdapter`].
//! The stream itself is passive: interruption of a blocked read is handled
//! one level up, where the client driver races the reader against its
//! shutdown signal.

use async_trait::async_trait;
use quark_oxide_core::error::{QuarkError, QuarkResult};
use quark_oxide_core::types::ServiceEndpoint;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::debug;

/// Object-safe alias for the byte streams the client can drive.
pub trait RawStream: AsyncRead + AsyncWrite + Send + Unpin {}
impl<T: AsyncRead + AsyncWrite + Send + Unpin> RawStream for T {}

/// Wraps a freshly connected TCP stream, e.g. in TLS.
///
/// The TLS implementation itself lives outside this crate; anything
/// implementing this trait can be plugged in via
/// [`ClientBuilder::tls_adapter`](crate::client::ClientBuilder::tls_adapter).
#[async_trait]
pub trait TlsAdapter: Send + Sync {
    /// Perform the wrapping handshake and return the encrypted stream.
    async fn wrap(
        &self,
        stream: TcpStream,
        endpoint: &ServiceEndpoint,
    ) -> QuarkResult<Box<dyn RawStream>>;
}

/// A connected full-duplex stream.
pub struct NetworkStream {
    inner: Box<dyn RawStream>,
    peer: ServiceEndpoint,
}

impl std::fmt::Debug for NetworkStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NetworkStream")
            .field("peer", &self.peer)
            .finish_non_exhaustive()
    }
}

impl NetworkStream {
    /// Try each endpoint in order; the first whose `connect` completes
    /// within `connect_timeout` wins. Fails with `Unavailable` if none does.
    pub async fn connect(
        endpoints: &[ServiceEndpoint],
        connect_timeout: Duration,
        tcp_keepalive: Option<Duration>,
        tls: Option<&dyn TlsAdapter>,
    ) -> QuarkResult<Self> {
        if endpoints.is_empty() {
            return Err(QuarkError::Unavailable("no endpoints to try".to_string()));
        }

        let mut last_err: Option<String> = None;
        for endpoint in endpoints {
            match timeout(connect_timeout, TcpStream::connect(endpoint.address())).await {
                Ok(Ok(stream)) => {
                    debug!(peer = %endpoint, "connected");
                    let stream = apply_keepalive(stream, tcp_keepalive)?;
                    let inner: Box<dyn RawStream> = match tls {
                        Some(adapter) => adapter.wrap(stream, endpoint).await?,
                        None => Box::new(stream),
                    };
                    return Ok(Self {
                        inner,
                        peer: endpoint.clone(),
                    });
                }
                Ok(Err(e)) => {
                    debug!(peer = %endpoint, error = %e, "connect failed");
                    last_err = Some(e.to_string());
                }
                Err(_) => {
                    debug!(peer = %endpoint, "connect timed out");
                    last_err = Some("connect timed out".to_string());
                }
            }
        }

        Err(QuarkError::Unavailable(format!(
            "no endpoint reachable: {}",
            last_err.unwrap_or_else(|| "unknown".to_string())
        )))
    }

    /// The endpoint this stream is connected to
    #[must_use]
    pub fn peer(&self) -> &ServiceEndpoint {
        &self.peer
    }

    /// Split into independently drivable read and write halves.
    #[must_use]
    pub fn into_split(self) -> (ReadHalf<Box<dyn RawStream>>, WriteHalf<Box<dyn RawStream>>) {
        tokio::io::split(self.inner)
    }
}

fn apply_keepalive(stream: TcpStream, keepalive: Option<Duration>) -> QuarkResult<TcpStream> {
    let Some(interval) = keepalive else {
        return Ok(stream);
    };

    let socket = socket2::Socket::from(stream.into_std()?);
    let params = socket2::TcpKeepalive::new().with_time(interval);
    socket
        .set_tcp_keepalive(&params)
        .map_err(|e| QuarkError::Connection(format!("failed to set TCP keepalive: {e}")))?;
    Ok(TcpStream::from_std(socket.into())?)
}
