//! Secure transport: one stream type over plain TCP or TLS.
//!
//! A handshake happens only while constructing a transport, through
//! [`SecureTransport::accept`] or [`SecureTransport::connect`]. Closing
//! consumes the transport, so a link is torn down at most once.

use crate::error::ServerError;
use pin_project_lite::pin_project;
use rustls::pki_types::ServerName;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, Interest, ReadBuf};
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream as ClientTlsStream;
use tokio_rustls::server::TlsStream as ServerTlsStream;
use tokio_rustls::{TlsAcceptor, TlsConnector};

pin_project! {
    /// A link that is either plain TCP or TLS, server or client side.
    #[project = TransportProj]
    pub enum SecureTransport {
        Plain { #[pin] stream: TcpStream },
        TlsServer { #[pin] stream: ServerTlsStream<TcpStream> },
        TlsClient { #[pin] stream: ClientTlsStream<TcpStream> },
    }
}

/// What the socket reported on its latest readability edge.
#[derive(Debug)]
pub enum Readiness {
    /// The peer shut down its side of the connection.
    Closed,
    /// The socket reported an error.
    Failed(io::Error),
    /// Bytes are waiting that nothing consumes yet.
    Payload(usize),
}

impl SecureTransport {
    /// Wraps an accepted socket, running the TLS handshake when an acceptor
    /// is given.
    pub async fn accept(
        tcp: TcpStream,
        acceptor: Option<&TlsAcceptor>,
    ) -> Result<Self, ServerError> {
        match acceptor {
            Some(acceptor) => {
                let stream = acceptor
                    .accept(tcp)
                    .await
                    .map_err(|e| ServerError::TlsHandshake(e.to_string()))?;
                Ok(SecureTransport::TlsServer { stream })
            }
            None => Ok(SecureTransport::Plain { stream: tcp }),
        }
    }

    /// Wraps a connected socket, running the client-side TLS handshake when
    /// a connector is given.
    pub async fn connect(
        tcp: TcpStream,
        connector: Option<&TlsConnector>,
        server_name: ServerName<'static>,
    ) -> Result<Self, ServerError> {
        match connector {
            Some(connector) => {
                let stream = connector
                    .connect(server_name, tcp)
                    .await
                    .map_err(|e| ServerError::TlsHandshake(e.to_string()))?;
                Ok(SecureTransport::TlsClient { stream })
            }
            None => Ok(SecureTransport::Plain { stream: tcp }),
        }
    }

    /// Writes all of `data` and flushes it.
    pub async fn send(&mut self, data: &[u8]) -> io::Result<usize> {
        self.write_all(data).await?;
        self.flush().await?;
        Ok(data.len())
    }

    /// Reads whatever is available into `buf`. Zero means end of stream.
    pub async fn receive(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.read(buf).await
    }

    /// Fills `buf` completely or fails.
    pub async fn receive_exact(&mut self, buf: &mut [u8]) -> io::Result<()> {
        self.read_exact(buf).await.map(|_| ())
    }

    /// Sends TLS close_notify where applicable, shuts the socket down, and
    /// releases it.
    pub async fn close(mut self) {
        if let Err(e) = self.shutdown().await {
            tracing::debug!("Transport shutdown error: {}", e);
        }
    }

    /// Returns the underlying socket.
    pub fn tcp(&self) -> &TcpStream {
        match self {
            SecureTransport::Plain { stream } => stream,
            SecureTransport::TlsServer { stream } => stream.get_ref().0,
            SecureTransport::TlsClient { stream } => stream.get_ref().0,
        }
    }

    /// Returns whether this link is encrypted.
    pub fn is_tls(&self) -> bool {
        !matches!(self, SecureTransport::Plain { .. })
    }

    pub fn peer_addr(&self) -> io::Result<SocketAddr> {
        self.tcp().peer_addr()
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.tcp().local_addr()
    }

    /// Waits for the next readability edge and classifies it with a
    /// non-consuming peek.
    ///
    /// Unconsumed payload would keep the socket readable forever, so after
    /// reporting it the readiness flag is cleared and the next call waits
    /// for fresh data or a hangup.
    pub async fn next_readiness(&self) -> Readiness {
        let tcp = self.tcp();
        let ready = match tcp.ready(Interest::READABLE).await {
            Ok(ready) => ready,
            Err(e) => return Readiness::Failed(e),
        };
        if ready.is_read_closed() {
            return Readiness::Closed;
        }

        let mut probe = [0u8; 512];
        match tcp.peek(&mut probe).await {
            Ok(0) => Readiness::Closed,
            Ok(n) => {
                let _ = tcp.try_io(Interest::READABLE, || {
                    Err::<(), _>(io::Error::from(io::ErrorKind::WouldBlock))
                });
                Readiness::Payload(n)
            }
            Err(e) => Readiness::Failed(e),
        }
    }
}

impl AsyncRead for SecureTransport {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.project() {
            TransportProj::Plain { stream } => stream.poll_read(cx, buf),
            TransportProj::TlsServer { stream } => stream.poll_read(cx, buf),
            TransportProj::TlsClient { stream } => stream.poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for SecureTransport {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.project() {
            TransportProj::Plain { stream } => stream.poll_write(cx, buf),
            TransportProj::TlsServer { stream } => stream.poll_write(cx, buf),
            TransportProj::TlsClient { stream } => stream.poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.project() {
            TransportProj::Plain { stream } => stream.poll_flush(cx),
            TransportProj::TlsServer { stream } => stream.poll_flush(cx),
            TransportProj::TlsClient { stream } => stream.poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.project() {
            TransportProj::Plain { stream } => stream.poll_shutdown(cx),
            TransportProj::TlsServer { stream } => stream.poll_shutdown(cx),
            TransportProj::TlsClient { stream } => stream.poll_shutdown(cx),
        }
    }
}
