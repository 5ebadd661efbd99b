use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::Result;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

/// One canned upstream response; responses are served in request order,
/// repeating the last one when the script runs out.
#[derive(Debug, Clone)]
pub struct Scripted {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl Scripted {
    pub fn ok(headers: &[(&str, &str)], body: &[u8]) -> Self {
        Self {
            status: 200,
            headers: headers
                .iter()
                .map(|(name, value)| (name.to_string(), value.to_string()))
                .collect(),
            body: body.to_vec(),
        }
    }

    pub fn not_modified(headers: &[(&str, &str)]) -> Self {
        Self {
            status: 304,
            headers: headers
                .iter()
                .map(|(name, value)| (name.to_string(), value.to_string()))
                .collect(),
            body: Vec::new(),
        }
    }
}

/// Minimal scripted origin server: counts requests and records every
/// request head it sees.
pub struct MockUpstream {
    pub addr: SocketAddr,
    requests: Arc<AtomicUsize>,
    seen_heads: Arc<Mutex<Vec<String>>>,
    handle: JoinHandle<()>,
}

impl MockUpstream {
    pub async fn start(script: Vec<Scripted>) -> Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let requests = Arc::new(AtomicUsize::new(0));
        let seen_heads = Arc::new(Mutex::new(Vec::new()));

        let task_requests = requests.clone();
        let task_heads = seen_heads.clone();
        let handle = tokio::spawn(async move {
            loop {
                let (mut stream, _) = match listener.accept().await {
                    Ok(pair) => pair,
                    Err(_) => break,
                };
                let index = task_requests.fetch_add(1, Ordering::SeqCst);
                let response = script
                    .get(index)
                    .or_else(|| script.last())
                    .cloned()
                    .unwrap_or_else(|| Scripted::ok(&[], b""));
                let heads = task_heads.clone();
                tokio::spawn(async move {
                    let mut buf = [0u8; 4096];
                    let mut data = Vec::new();
                    loop {
                        let n = stream.read(&mut buf).await.unwrap_or(0);
                        if n == 0 {
                            break;
                        }
                        data.extend_from_slice(&buf[..n]);
                        if data.windows(4).any(|window| window == b"\r\n\r\n") {
                            break;
                        }
                    }
                    if data.is_empty() {
                        return;
                    }
                    if let Ok(head) = std::str::from_utf8(&data) {
                        heads.lock().expect("heads lock").push(head.to_string());
                    }

                    let reason = match response.status {
                        200 => "OK",
                        304 => "Not Modified",
                        _ => "Status",
                    };
                    let mut out = format!("HTTP/1.1 {} {}\r\n", response.status, reason);
                    if response.status != 304 {
                        out.push_str(&format!("Content-Length: {}\r\n", response.body.len()));
                    }
                    for (name, value) in &response.headers {
                        out.push_str(&format!("{name}: {value}\r\n"));
                    }
                    out.push_str("Connection: close\r\n\r\n");

                    let _ = stream.write_all(out.as_bytes()).await;
                    if response.status != 304 {
                        let _ = stream.write_all(&response.body).await;
                    }
                    let _ = stream.shutdown().await;
                });
            }
        });

        Ok(Self {
            addr,
            requests,
            seen_heads,
            handle,
        })
    }

    pub fn host_port(&self) -> String {
        format!("127.0.0.1:{}", self.addr.port())
    }

    pub fn request_count(&self) -> usize {
        self.requests.load(Ordering::SeqCst)
    }

    pub fn seen_heads(&self) -> Vec<String> {
        self.seen_heads.lock().expect("heads lock").clone()
    }
}

impl Drop for MockUpstream {
    fn drop(&mut self) {
        self.handle.abort();
    }
}
