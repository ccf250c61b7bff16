//! WebSocket channel
//!
//! The caller side connects with its origin in the `Origin` handshake
//! header. The daemon side records that header once per connection and
//! stamps it on every frame read from that connection. Frames are JSON text
//! messages; binary messages are ignored.

use std::sync::Arc;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::{
    accept_hdr_async, connect_async_with_config,
    tungstenite::{
        handshake::client::generate_key,
        handshake::server::{ErrorResponse, Request as HandshakeRequest, Response},
        http::Request,
        protocol::Message,
    },
};
use tracing::{debug, error, info, warn};
use url::Url;

use super::{Frame, Launcher, Link, CHANNEL_CAPACITY, NULL_ORIGIN};
use crate::custodian::Custodian;
use crate::error::{CustodyError, Result};

/// Connects to a custodian daemon.
#[derive(Debug, Clone)]
pub struct WebSocketLauncher {
    url: String,
    origin: String,
}

impl WebSocketLauncher {
    pub fn new(url: impl Into<String>, origin: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            origin: origin.into(),
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

/// `Host` header value for a WebSocket URL.
fn host_header(url: &str) -> Result<String> {
    let parsed =
        Url::parse(url).map_err(|e| CustodyError::Connection(format!("bad url {url}: {e}")))?;
    let host = parsed
        .host_str()
        .ok_or_else(|| CustodyError::Connection(format!("url has no host: {url}")))?;
    Ok(match parsed.port() {
        Some(port) => format!("{host}:{port}"),
        None => host.to_string(),
    })
}

#[async_trait]
impl Launcher for WebSocketLauncher {
    async fn launch(&self) -> Result<Link> {
        debug!(url = %self.url, origin = %self.origin, "Connecting to custodian daemon");

        let request = Request::builder()
            .uri(&self.url)
            .header("Host", host_header(&self.url)?)
            .header("Origin", &self.origin)
            .header("Connection", "Upgrade")
            .header("Upgrade", "websocket")
            .header("Sec-WebSocket-Version", "13")
            .header("Sec-WebSocket-Key", generate_key())
            .body(())
            .map_err(|e| CustodyError::Connection(format!("Failed to build request: {}", e)))?;

        let (ws, _) = connect_async_with_config(request, None, false)
            .await
            .map_err(|e| CustodyError::Connection(format!("WebSocket connect failed: {}", e)))?;
        let (mut sink, mut stream) = ws.split();

        let (outbound, mut to_daemon) = mpsc::channel::<String>(CHANNEL_CAPACITY);
        let (from_daemon, inbound) = mpsc::channel::<String>(CHANNEL_CAPACITY);
        let (loaded_tx, loaded) = oneshot::channel();

        let writer = tokio::spawn(async move {
            while let Some(text) = to_daemon.recv().await {
                if let Err(e) = sink.send(Message::Text(text)).await {
                    warn!(error = %e, "Failed to send frame");
                    break;
                }
            }
            let _ = sink.close().await;
            debug!("WebSocket writer ended");
        });

        let reader = tokio::spawn(async move {
            while let Some(msg) = stream.next().await {
                match msg {
                    Ok(Message::Text(text)) => {
                        if from_daemon.send(text).await.is_err() {
                            break;
                        }
                    }
                    Ok(Message::Close(frame)) => {
                        info!(frame = ?frame, "Custodian closed connection");
                        break;
                    }
                    Ok(_) => {}
                    Err(e) => {
                        error!(error = %e, "WebSocket error");
                        break;
                    }
                }
            }
            debug!("WebSocket reader ended");
        });

        // The handshake completing is the daemon's load signal
        let _ = loaded_tx.send(());
        info!(url = %self.url, "Connected to custodian daemon");

        Ok(Link {
            outbound,
            inbound,
            loaded,
            tasks: vec![writer, reader],
        })
    }
}

/// Accept connections and serve each one until it closes.
pub async fn serve_websocket(listener: TcpListener, custodian: Arc<Custodian>) -> Result<()> {
    info!(addr = %listener.local_addr()?, "Custodian daemon listening");

    loop {
        let (stream, peer) = listener.accept().await?;
        let custodian = Arc::clone(&custodian);
        tokio::spawn(async move {
            if let Err(e) = serve_connection(stream, custodian).await {
                warn!(peer = %peer, error = %e, "Connection ended with error");
            }
        });
    }
}

async fn serve_connection(stream: TcpStream, custodian: Arc<Custodian>) -> Result<()> {
    let mut origin: Option<String> = None;
    let record_origin = |request: &HandshakeRequest,
                         response: Response|
     -> std::result::Result<Response, ErrorResponse> {
        origin = request
            .headers()
            .get("Origin")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        Ok(response)
    };

    let ws = accept_hdr_async(stream, record_origin)
        .await
        .map_err(|e| CustodyError::Connection(format!("handshake failed: {e}")))?;
    let origin = origin.unwrap_or_else(|| NULL_ORIGIN.to_string());
    debug!(origin = %origin, "Caller connected");

    let (mut sink, mut stream) = ws.split();
    let (frame_tx, frame_rx) = mpsc::channel::<Frame>(CHANNEL_CAPACITY);
    let (reply_tx, mut reply_rx) = mpsc::channel::<String>(CHANNEL_CAPACITY);

    let serve_task = tokio::spawn(custodian.serve(frame_rx, reply_tx));
    let writer = tokio::spawn(async move {
        while let Some(text) = reply_rx.recv().await {
            if sink.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
    });

    while let Some(msg) = stream.next().await {
        match msg {
            Ok(Message::Text(data)) => {
                let frame = Frame {
                    origin: origin.clone(),
                    data,
                };
                if frame_tx.send(frame).await.is_err() {
                    break;
                }
            }
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(e) => {
                debug!(error = %e, "Caller connection error");
                break;
            }
        }
    }

    // Let in-flight requests answer before the writer goes away
    drop(frame_tx);
    let _ = serve_task.await;
    let _ = writer.await;
    debug!(origin = %origin, "Caller disconnected");
    Ok(())
}
