//! Channel between the client stub and the custodian.
//!
//! A [`Launcher`] creates the custodian context and hands back a [`Link`]:
//! text frames out, text frames in, a one-shot "loaded" signal, and the pump
//! tasks it owns. The custodian never sees frames raw: the channel stamps
//! each one with the caller origin it observed, see [`Frame`].
//!
//! - [`InProcessLauncher`]: custodian runs on the same runtime
//! - [`websocket::WebSocketLauncher`]: custodian is a daemon reached over
//!   WebSocket, the origin travels in the handshake

pub mod websocket;

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::debug;

use crate::custodian::Custodian;
use crate::error::Result;

pub use websocket::{serve_websocket, WebSocketLauncher};

/// Buffered frames per direction.
pub const CHANNEL_CAPACITY: usize = 64;

/// Origin recorded when the caller presented none.
pub const NULL_ORIGIN: &str = "null";

/// An inbound frame as the custodian receives it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Origin observed by the channel, never taken from the payload.
    pub origin: String,
    pub data: String,
}

/// The caller's end of a launched custodian context.
#[derive(Debug)]
pub struct Link {
    pub outbound: mpsc::Sender<String>,
    pub inbound: mpsc::Receiver<String>,
    /// Fires once the custodian is ready to receive frames.
    pub loaded: oneshot::Receiver<()>,
    /// Pump tasks owned by this link; aborted on disconnect.
    pub tasks: Vec<JoinHandle<()>>,
}

#[async_trait]
pub trait Launcher: Send + Sync {
    async fn launch(&self) -> Result<Link>;
}

/// Runs the custodian serve loop on the current runtime.
#[derive(Clone)]
pub struct InProcessLauncher {
    custodian: Arc<Custodian>,
    caller_origin: String,
}

impl InProcessLauncher {
    pub fn new(custodian: Arc<Custodian>, caller_origin: impl Into<String>) -> Self {
        Self {
            custodian,
            caller_origin: caller_origin.into(),
        }
    }
}

#[async_trait]
impl Launcher for InProcessLauncher {
    async fn launch(&self) -> Result<Link> {
        let (outbound, mut from_caller) = mpsc::channel::<String>(CHANNEL_CAPACITY);
        let (frame_tx, frame_rx) = mpsc::channel::<Frame>(CHANNEL_CAPACITY);
        let (reply_tx, inbound) = mpsc::channel::<String>(CHANNEL_CAPACITY);
        let (loaded_tx, loaded) = oneshot::channel();

        let origin = self.caller_origin.clone();
        let stamp_task = tokio::spawn(async move {
            while let Some(data) = from_caller.recv().await {
                let frame = Frame {
                    origin: origin.clone(),
                    data,
                };
                if frame_tx.send(frame).await.is_err() {
                    break;
                }
            }
            debug!("In-process stamp pump ended");
        });

        let custodian = Arc::clone(&self.custodian);
        let serve_task = tokio::spawn(async move {
            let _ = loaded_tx.send(());
            custodian.serve(frame_rx, reply_tx).await;
        });

        debug!(origin = %self.caller_origin, "In-process custodian launched");

        Ok(Link {
            outbound,
            inbound,
            loaded,
            tasks: vec![stamp_task, serve_task],
        })
    }
}
