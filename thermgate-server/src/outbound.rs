//! Outbound links dialed by the operator's `connect` command.

use crate::context::GatewayContext;
use crate::error::ServerError;
use crate::gateway::{bounded, watch_link};
use crate::session::{link, Session};
use crate::tls;
use crate::transport::SecureTransport;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use thermgate_protocol::{HandshakeRecord, SensorId};
use tokio::net::TcpStream;

/// Dials a sensor node, announces this gateway with a handshake record, and
/// registers the link as a session. The link is then watched on its own task
/// until either side closes it.
pub async fn connect(
    ctx: Arc<GatewayContext>,
    ip: Ipv4Addr,
    port: u16,
) -> Result<SensorId, ServerError> {
    let peer = SocketAddr::from((ip, port));
    let transport = bounded(ctx.config.network.handshake_timeout(), dial(&ctx, peer)).await?;

    let (handle, watch) = link();
    let address = ip.to_string();
    let session = Session::new(
        address.clone(),
        address,
        port,
        transport.is_tls(),
        handle,
    )
    .outbound();
    let sensor_id = match ctx.table.insert(session) {
        Ok(id) => id,
        Err(e) => {
            ctx.with_metrics(|m| m.rejections_total.with_label_values(&[e.reason()]).inc());
            transport.close().await;
            return Err(e.into());
        }
    };

    tracing::info!("A sensor node with {} has opened a new connection", sensor_id);
    tracing::info!(
        "Outbound connection ip:{} port: {} (ID: {}){}",
        ip,
        port,
        sensor_id,
        if transport.is_tls() { " (TLS)" } else { "" }
    );
    ctx.with_metrics(|m| {
        m.sessions_total.inc();
        m.sessions_active.set(f64::from(ctx.table.active_count()));
    });

    tokio::spawn(async move {
        watch_link(&ctx, transport, watch, sensor_id).await;
    });
    Ok(sensor_id)
}

async fn dial(ctx: &GatewayContext, peer: SocketAddr) -> Result<SecureTransport, ServerError> {
    let tcp = TcpStream::connect(peer).await?;
    let name = tls::server_name(&ctx.config.client_tls, &peer.ip().to_string())?;
    let mut transport = SecureTransport::connect(tcp, ctx.tls_connector.as_ref(), name).await?;

    let local_ip = transport.local_addr()?.ip().to_string();
    let record = HandshakeRecord::new(local_ip, ctx.table.running_port()).encode()?;
    if let Err(e) = transport.send(&record).await {
        transport.close().await;
        return Err(e.into());
    }
    Ok(transport)
}
