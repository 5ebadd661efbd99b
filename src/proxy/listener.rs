use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{Context, Result};
use http::StatusCode;
use tokio::io::{AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, error, info};

use super::codec::{RequestTarget, encode_response_head, read_request_head};
use super::pipeline::ClientDisposition;
use super::{AppContext, admin, pipeline, tunnel};

/// Idle limit while waiting for the next request head on a kept-alive
/// connection.
const CLIENT_HEADER_TIMEOUT: Duration = Duration::from_secs(60);

pub async fn start_listener(app: AppContext) -> Result<()> {
    let bind_addr = app.settings.listen;
    let listener = bind(bind_addr).await?;
    serve(listener, app).await
}

pub async fn bind(bind_addr: SocketAddr) -> Result<TcpListener> {
    TcpListener::bind(bind_addr)
        .await
        .with_context(|| format!("failed to bind listener on {bind_addr}"))
}

pub async fn serve(listener: TcpListener, app: AppContext) -> Result<()> {
    let local_addr = listener.local_addr()?;
    info!(address = %local_addr, "proxy listener started");

    loop {
        let (stream, peer_addr) = match listener.accept().await {
            Ok(pair) => pair,
            Err(err) => {
                error!(error = %err, "failed to accept incoming connection");
                continue;
            }
        };
        debug!(peer = %peer_addr, "accepted connection");
        if let Err(err) = stream.set_nodelay(true) {
            debug!(peer = %peer_addr, error = %err, "failed to set TCP_NODELAY");
        }
        let connection_app = app.clone();
        tokio::spawn(async move {
            if let Err(err) = handle_connection(stream, peer_addr, connection_app).await {
                debug!(peer = %peer_addr, error = %err, "connection closed with error");
            }
        });
    }
}

async fn handle_connection(stream: TcpStream, peer: SocketAddr, app: AppContext) -> Result<()> {
    let mut reader = BufReader::new(stream);
    let proxy_name = app.settings.proxy_name();

    loop {
        let head = match read_request_head(
            &mut reader,
            CLIENT_HEADER_TIMEOUT,
            peer,
            app.settings.max_request_header_size,
        )
        .await
        {
            Ok(Some(head)) => head,
            Ok(None) => return Ok(()),
            Err(err) => {
                debug!(peer = %peer, error = %err, "failed to read request head");
                let _ = pipeline::respond_simple(
                    reader.get_mut(),
                    StatusCode::BAD_REQUEST,
                    "bad request\n",
                )
                .await;
                return Ok(());
            }
        };

        enum Route {
            Tunnel { host: String, port: u16 },
            Admin { path: String },
            Pipeline,
        }

        let route = match &head.target {
            RequestTarget::Authority { host, port } => Route::Tunnel {
                host: host.clone(),
                port: *port,
            },
            RequestTarget::Origin(path) => Route::Admin { path: path.clone() },
            RequestTarget::Absolute {
                host, port, path, ..
            } if admin::is_admin_target(Some(authority(host, *port).as_str()), &proxy_name) => {
                Route::Admin { path: path.clone() }
            }
            RequestTarget::Absolute { .. } => Route::Pipeline,
        };

        match route {
            Route::Tunnel { host, port } => {
                let buffered = reader.buffer().to_vec();
                let stream = reader.into_inner();
                return tunnel::serve(stream, buffered, peer, &app, &host, port).await;
            }
            Route::Admin { path } => {
                let close = head.wants_close() || head.version == "HTTP/1.0";
                serve_admin(&mut reader, &head.method, &path, &proxy_name).await?;
                if close {
                    return Ok(());
                }
            }
            Route::Pipeline => {
                match pipeline::handle_request(&mut reader, peer, &app, head).await? {
                    ClientDisposition::Continue => {}
                    ClientDisposition::Close => return Ok(()),
                }
            }
        }
    }
}

fn authority(host: &str, port: Option<u16>) -> String {
    match port {
        Some(port) => format!("{host}:{port}"),
        None => host.to_string(),
    }
}

async fn serve_admin(
    reader: &mut BufReader<TcpStream>,
    method: &http::Method,
    path: &str,
    proxy_name: &str,
) -> Result<()> {
    let response = admin::route(method, path, proxy_name);
    let mut headers = http::HeaderMap::new();
    headers.insert(
        http::header::CONTENT_TYPE,
        http::HeaderValue::from_static(response.content_type),
    );
    if let Ok(value) = http::HeaderValue::from_str(&response.body.len().to_string()) {
        headers.insert(http::header::CONTENT_LENGTH, value);
    }

    let client = reader.get_mut();
    let head = encode_response_head(response.status, &headers);
    client.write_all(&head).await?;
    if method != http::Method::HEAD {
        client.write_all(response.body.as_bytes()).await?;
    }
    client.flush().await?;
    Ok(())
}
