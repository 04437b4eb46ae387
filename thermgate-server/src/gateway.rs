//! Gateway accept loop and per-link session tasks.

use crate::context::GatewayContext;
use crate::error::ServerError;
use crate::session::{link, LinkWatch, Session};
use crate::transport::{Readiness, SecureTransport};
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use thermgate_protocol::{HandshakeRecord, SensorId, HANDSHAKE_RECORD_SIZE};
use tokio::net::{TcpListener, TcpStream};

/// Listening gateway.
pub struct Gateway {
    ctx: Arc<GatewayContext>,
    listener: TcpListener,
}

impl Gateway {
    /// Binds the listening socket and records the running port.
    pub async fn bind(ctx: Arc<GatewayContext>) -> Result<Self, ServerError> {
        let listener = TcpListener::bind(ctx.config.network.bind_addr()).await?;
        ctx.table.set_running_port(listener.local_addr()?.port());
        Ok(Self { ctx, listener })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accepts links until the stop signal is raised, then tears down every
    /// remaining session.
    pub async fn run(self) -> Result<(), ServerError> {
        let Gateway { ctx, listener } = self;
        let mode = if ctx.tls_acceptor.is_some() {
            "TLS"
        } else {
            "plain"
        };
        tracing::info!("Gateway listening on {} ({})", listener.local_addr()?, mode);

        while !ctx.stop.is_stopped() {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((tcp, peer)) => {
                            let ctx = ctx.clone();
                            tokio::spawn(async move {
                                handle_connection(ctx, tcp, peer).await;
                            });
                        }
                        Err(e) => {
                            tracing::error!("Accept error: {}", e);
                        }
                    }
                }
                _ = ctx.stop.wait() => {}
            }
        }

        drop(listener);
        let closed = ctx.table.clear();
        ctx.with_metrics(|m| m.sessions_active.set(0.0));
        tracing::info!("Gateway stopped, closed {} sessions", closed);
        Ok(())
    }
}

async fn handle_connection(ctx: Arc<GatewayContext>, tcp: TcpStream, peer: SocketAddr) {
    let address = peer.ip().to_string();

    // Turn away over-limit peers before paying for a TLS handshake. The
    // permit itself is taken when the session is inserted.
    if !ctx.admission.would_allow(&address) {
        tracing::warn!("Connection from {} rejected: connection limit reached", address);
        ctx.with_metrics(|m| m.rejections_total.with_label_values(&["admission"]).inc());
        return;
    }

    let limit = ctx.config.network.handshake_timeout();
    let (transport, record) = match bounded(limit, establish(&ctx, tcp)).await {
        Ok(established) => established,
        Err(e) => {
            tracing::warn!("[{}] Handshake failed: {}", peer, e);
            ctx.with_metrics(|m| m.rejections_total.with_label_values(&["handshake"]).inc());
            return;
        }
    };

    if reported_elsewhere(&record, &peer) {
        tracing::warn!(
            "[{}] Self-reported address {} does not match observed address {}",
            peer,
            record.address,
            address
        );
    }

    let (handle, watch) = link();
    let session = Session::new(
        address.clone(),
        record.address.clone(),
        record.port,
        transport.is_tls(),
        handle,
    );
    let sensor_id = match ctx.table.insert(session) {
        Ok(id) => id,
        Err(e) => {
            tracing::warn!("[{}] Session rejected: {}", peer, e);
            ctx.with_metrics(|m| m.rejections_total.with_label_values(&[e.reason()]).inc());
            transport.close().await;
            return;
        }
    };

    tracing::info!("A sensor node with {} has opened a new connection", sensor_id);
    tracing::info!(
        "New connection ip:{} port: {} (ID: {}){}",
        record.address,
        record.port,
        sensor_id,
        if transport.is_tls() { " (TLS)" } else { "" }
    );
    ctx.with_metrics(|m| {
        m.sessions_total.inc();
        m.sessions_active.set(f64::from(ctx.table.active_count()));
    });

    watch_link(&ctx, transport, watch, sensor_id).await;
}

/// True when the record's self-reported address is not the address the link
/// was observed from. Unparseable addresses count as a mismatch.
fn reported_elsewhere(record: &HandshakeRecord, peer: &SocketAddr) -> bool {
    record.ip() != Some(peer.ip())
}

/// Awaits `fut`, giving up after `limit` when one is configured.
pub(crate) async fn bounded<T>(
    limit: Option<Duration>,
    fut: impl Future<Output = Result<T, ServerError>>,
) -> Result<T, ServerError> {
    let Some(limit) = limit else {
        return fut.await;
    };
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result,
        Err(_) => Err(ServerError::Io(io::Error::new(
            io::ErrorKind::TimedOut,
            format!("timed out after {:?}", limit),
        ))),
    }
}

/// Runs the transport handshake and reads the handshake record.
async fn establish(
    ctx: &GatewayContext,
    tcp: TcpStream,
) -> Result<(SecureTransport, HandshakeRecord), ServerError> {
    let mut transport = SecureTransport::accept(tcp, ctx.tls_acceptor.as_ref()).await?;

    let mut buf = [0u8; HANDSHAKE_RECORD_SIZE];
    if let Err(e) = transport.receive_exact(&mut buf).await {
        transport.close().await;
        return Err(e.into());
    }
    match HandshakeRecord::decode(&buf) {
        Ok(record) => Ok((transport, record)),
        Err(e) => {
            transport.close().await;
            Err(e.into())
        }
    }
}

/// Watches a registered link until the peer leaves, the session is removed
/// elsewhere, or the gateway stops. Closes the transport on the way out.
pub(crate) async fn watch_link(
    ctx: &GatewayContext,
    transport: SecureTransport,
    mut watch: LinkWatch,
    sensor_id: SensorId,
) {
    let peer = transport
        .peer_addr()
        .map(|a| a.to_string())
        .unwrap_or_else(|_| "unknown".to_string());

    let peer_gone = loop {
        tokio::select! {
            edge = transport.next_readiness() => match edge {
                Readiness::Closed => {
                    tracing::debug!("[{}] Peer closed the connection", peer);
                    break true;
                }
                Readiness::Failed(e) => {
                    tracing::warn!("[{}] Socket error on sensor {}: {}", peer, sensor_id, e);
                    break true;
                }
                Readiness::Payload(n) => {
                    tracing::debug!(
                        "[{}] Ignoring {} bytes of unhandled payload from sensor {}",
                        peer,
                        n,
                        sensor_id
                    );
                }
            },
            _ = watch.closed() => break false,
            _ = ctx.stop.wait() => break false,
        }
    };

    if peer_gone && ctx.table.remove_link(watch.ticket()).is_some() {
        tracing::info!("A sensor node with {} has closed the connection", sensor_id);
    }
    ctx.with_metrics(|m| m.sessions_active.set(f64::from(ctx.table.active_count())));

    transport.close().await;
    tracing::debug!("[{}] Link for sensor {} closed", peer, sensor_id);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::context::test_support::{plain_context, tls_context};
    use crate::tls::server_name;
    use tempfile::TempDir;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    async fn start(
        dir: &TempDir,
        adjust: impl FnOnce(&mut Config),
    ) -> (
        Arc<GatewayContext>,
        SocketAddr,
        tokio::task::JoinHandle<Result<(), ServerError>>,
    ) {
        serve(plain_context(dir.path(), adjust)).await
    }

    async fn serve(
        ctx: Arc<GatewayContext>,
    ) -> (
        Arc<GatewayContext>,
        SocketAddr,
        tokio::task::JoinHandle<Result<(), ServerError>>,
    ) {
        let gateway = Gateway::bind(ctx.clone()).await.unwrap();
        let addr = gateway.local_addr().unwrap();
        let task = tokio::spawn(gateway.run());
        (ctx, addr, task)
    }

    async fn sensor(addr: SocketAddr, reported: &str, port: u16) -> TcpStream {
        let mut stream = TcpStream::connect(addr).await.unwrap();
        let record = HandshakeRecord::new(reported, port).encode().unwrap();
        // Rejected peers may already be closed by the time this lands.
        let _ = stream.write_all(&record).await;
        stream
    }

    async fn wait_until(mut cond: impl FnMut() -> bool) {
        for _ in 0..200 {
            if cond() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached");
    }

    /// Waits for the gateway to hang up, skipping anything it sends first
    /// (such as a TLS alert).
    async fn expect_eof(stream: &mut TcpStream) {
        let mut buf = [0u8; 64];
        let drained = tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                match stream.read(&mut buf).await {
                    Ok(0) | Err(_) => break,
                    Ok(_) => continue,
                }
            }
        })
        .await;
        assert!(drained.is_ok(), "gateway kept the link open");
    }

    #[tokio::test]
    async fn test_session_lifecycle() {
        let dir = TempDir::new().unwrap();
        let (ctx, addr, _task) = start(&dir, |_| {}).await;
        assert_eq!(ctx.table.running_port(), addr.port());

        let client = sensor(addr, "127.0.0.1", 9000).await;
        wait_until(|| ctx.table.active_count() == 1).await;

        let info = ctx.table.snapshot_for_display().remove(0);
        assert_eq!(info.address, "127.0.0.1");
        assert_eq!(info.port, 9000);
        assert!(!info.tls);
        assert_eq!(ctx.admission.count("127.0.0.1"), 1);

        drop(client);
        wait_until(|| ctx.table.active_count() == 0).await;
        assert_eq!(ctx.admission.count("127.0.0.1"), 0);
    }

    #[tokio::test]
    async fn test_payload_does_not_end_session() {
        let dir = TempDir::new().unwrap();
        let (ctx, addr, _task) = start(&dir, |_| {}).await;

        let mut client = sensor(addr, "127.0.0.1", 9000).await;
        wait_until(|| ctx.table.active_count() == 1).await;

        client.write_all(b"extra bytes").await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(ctx.table.active_count(), 1);

        drop(client);
        wait_until(|| ctx.table.active_count() == 0).await;
    }

    #[tokio::test]
    async fn test_duplicate_port_rejected() {
        let dir = TempDir::new().unwrap();
        let (ctx, addr, _task) = start(&dir, |_| {}).await;

        let _first = sensor(addr, "127.0.0.1", 9000).await;
        wait_until(|| ctx.table.active_count() == 1).await;
        let existing = ctx.table.active_sensor_ids()[0];

        let mut second = sensor(addr, "127.0.0.1", 9000).await;
        expect_eof(&mut second).await;

        assert_eq!(ctx.table.active_count(), 1);
        assert!(ctx.table.find(existing).is_some());
        assert_eq!(ctx.admission.count("127.0.0.1"), 1);
    }

    #[tokio::test]
    async fn test_admission_limit() {
        let dir = TempDir::new().unwrap();
        let (ctx, addr, _task) = start(&dir, |c| c.admission.max_per_address = 1).await;

        let _first = sensor(addr, "127.0.0.1", 9000).await;
        wait_until(|| ctx.table.active_count() == 1).await;

        let mut second = sensor(addr, "127.0.0.1", 9001).await;
        expect_eof(&mut second).await;
        assert_eq!(ctx.table.active_count(), 1);
    }

    #[tokio::test]
    async fn test_bad_handshake_leaves_table_untouched() {
        let dir = TempDir::new().unwrap();
        let (ctx, addr, _task) = start(&dir, |_| {}).await;

        let mut short = TcpStream::connect(addr).await.unwrap();
        short.write_all(&[1, 2, 3]).await.unwrap();
        short.shutdown().await.unwrap();
        expect_eof(&mut short).await;

        let mut garbage = TcpStream::connect(addr).await.unwrap();
        garbage.write_all(&[0xff; HANDSHAKE_RECORD_SIZE]).await.unwrap();
        expect_eof(&mut garbage).await;

        assert_eq!(ctx.table.active_count(), 0);
        assert_eq!(ctx.admission.count("127.0.0.1"), 0);
    }

    #[test]
    fn test_reported_address_mismatch() {
        let peer: SocketAddr = "127.0.0.1:40000".parse().unwrap();
        assert!(!reported_elsewhere(&HandshakeRecord::new("127.0.0.1", 9000), &peer));
        assert!(reported_elsewhere(&HandshakeRecord::new("10.9.9.9", 9000), &peer));
        assert!(reported_elsewhere(&HandshakeRecord::new("sensor-7", 9000), &peer));

        let peer: SocketAddr = "[::1]:40000".parse().unwrap();
        assert!(!reported_elsewhere(&HandshakeRecord::new("::1", 9000), &peer));
    }

    #[tokio::test]
    async fn test_bounded_without_limit_waits() {
        let slow = async {
            tokio::time::sleep(Duration::from_millis(150)).await;
            Ok::<_, ServerError>(7)
        };
        assert_eq!(bounded(None, slow).await.unwrap(), 7);

        let stuck = std::future::pending::<Result<(), ServerError>>();
        let err = bounded(Some(Duration::from_millis(50)), stuck)
            .await
            .unwrap_err();
        assert!(matches!(err, ServerError::Io(ref e) if e.kind() == io::ErrorKind::TimedOut));
    }

    #[tokio::test]
    async fn test_silent_link_dropped_after_handshake_limit() {
        let dir = TempDir::new().unwrap();
        let (ctx, addr, _task) = start(&dir, |c| c.network.handshake_timeout_secs = Some(1)).await;

        let mut silent = TcpStream::connect(addr).await.unwrap();
        expect_eof(&mut silent).await;
        assert_eq!(ctx.table.active_count(), 0);
        assert_eq!(ctx.admission.count("127.0.0.1"), 0);
    }

    #[tokio::test]
    async fn test_tls_session_lifecycle() {
        let dir = TempDir::new().unwrap();
        let (ctx, addr, _task) = serve(tls_context(dir.path(), |_| {})).await;

        let tcp = TcpStream::connect(addr).await.unwrap();
        let name = server_name(&ctx.config.client_tls, "127.0.0.1").unwrap();
        let mut client = SecureTransport::connect(tcp, ctx.tls_connector.as_ref(), name)
            .await
            .unwrap();
        let record = HandshakeRecord::new("127.0.0.1", 9000).encode().unwrap();
        client.send(&record).await.unwrap();
        wait_until(|| ctx.table.active_count() == 1).await;

        let info = ctx.table.snapshot_for_display().remove(0);
        assert!(info.tls);
        assert_eq!(info.port, 9000);
        assert_eq!(ctx.admission.count("127.0.0.1"), 1);

        client.close().await;
        wait_until(|| ctx.table.active_count() == 0).await;
        assert_eq!(ctx.admission.count("127.0.0.1"), 0);
    }

    #[tokio::test]
    async fn test_failed_tls_handshake_leaves_table_untouched() {
        let dir = TempDir::new().unwrap();
        let (ctx, addr, _task) = serve(tls_context(dir.path(), |_| {})).await;

        let mut plain = sensor(addr, "127.0.0.1", 9000).await;
        expect_eof(&mut plain).await;

        assert_eq!(ctx.table.active_count(), 0);
        assert!(ctx.table.snapshot_for_display().is_empty());
        assert_eq!(ctx.admission.count("127.0.0.1"), 0);
    }

    #[tokio::test]
    async fn test_remove_closes_client_once() {
        let dir = TempDir::new().unwrap();
        let (ctx, addr, _task) = start(&dir, |_| {}).await;

        let mut client = sensor(addr, "10.9.9.9", 9000).await;
        wait_until(|| ctx.table.active_count() == 1).await;
        let id = ctx.table.active_sensor_ids()[0];
        assert_eq!(ctx.table.find(id).unwrap().reported_address, "10.9.9.9");

        assert!(ctx.table.remove(id).is_some());
        assert!(ctx.table.remove(id).is_none());
        expect_eof(&mut client).await;
        assert_eq!(ctx.table.active_count(), 0);
    }

    #[tokio::test]
    async fn test_stop_clears_sessions() {
        let dir = TempDir::new().unwrap();
        let (ctx, addr, task) = start(&dir, |_| {}).await;

        let mut client = sensor(addr, "127.0.0.1", 9000).await;
        wait_until(|| ctx.table.active_count() == 1).await;

        ctx.stop.stop();
        tokio::time::timeout(Duration::from_secs(2), task)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(ctx.table.active_count(), 0);
        expect_eof(&mut client).await;
    }
}
