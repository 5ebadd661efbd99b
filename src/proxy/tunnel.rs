use std::net::SocketAddr;

use anyhow::{Context, Result};
use tokio::io::{AsyncWriteExt, copy_bidirectional};
use tokio::net::TcpStream;
use tracing::debug;

use super::AppContext;

/// Serves a CONNECT request: establish the upstream TCP connection, confirm
/// with a 200, then splice bytes blindly in both directions until either
/// side closes. The proxy never looks inside the tunnel.
pub(super) async fn serve(
    mut client: TcpStream,
    buffered: Vec<u8>,
    peer: SocketAddr,
    app: &AppContext,
    host: &str,
    port: u16,
) -> Result<()> {
    let upstream = crate::util::timeout_with_context(
        app.settings.upstream_connect_timeout(),
        TcpStream::connect((host, port)),
        format!("connecting tunnel to {host}:{port}"),
    )
    .await;

    let mut upstream = match upstream {
        Ok(stream) => stream,
        Err(err) => {
            debug!(peer = %peer, host, port, error = %err, "tunnel connect failed");
            client
                .write_all(b"HTTP/1.1 502 Bad Gateway\r\nContent-Length: 0\r\n\r\n")
                .await
                .ok();
            return Err(err);
        }
    };
    upstream.set_nodelay(true).ok();

    client
        .write_all(b"HTTP/1.1 200 Connection Established\r\n\r\n")
        .await
        .context("failed to confirm tunnel to client")?;

    // Bytes the client pipelined behind the CONNECT head.
    if !buffered.is_empty() {
        upstream
            .write_all(&buffered)
            .await
            .context("failed to forward buffered tunnel bytes")?;
    }

    match copy_bidirectional(&mut client, &mut upstream).await {
        Ok((to_upstream, to_client)) => {
            debug!(peer = %peer, host, port, to_upstream, to_client, "tunnel closed");
        }
        Err(err) => {
            debug!(peer = %peer, host, port, error = %err, "tunnel aborted");
        }
    }
    Ok(())
}
