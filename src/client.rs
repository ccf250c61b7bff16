//! Custodian Client
//!
//! Single responsibility: a connected, correlated stub for talking to a
//! custodian over a [`Link`].
//!
//! # The Key Abstraction
//!
//! A `CustodianClient` can ONLY be created via [`CustodianClient::connect`],
//! which:
//! 1. Launches the custodian context
//! 2. Waits for its "loaded" signal
//! 3. Proves liveness with a `PING` (one retry after a short backoff)
//! 4. Only THEN returns a client
//!
//! # Correlation
//!
//! Every call gets a fresh UUID `requestId` and a pending entry in a shared
//! map. The receiver task routes each reply to its entry by id. An entry
//! leaves the map exactly once: on its reply, on its timeout, on
//! disconnect, or when the caller abandons the call. Replies for ids no
//! longer in the map are ignored.

use std::collections::HashMap;
use std::sync::{Arc, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::channel::{Launcher, Link};
use crate::error::{CustodyError, Result};
use crate::protocol::{Operation, Outcome, Reply, RequestFrame};

/// Timeouts for a client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClientConfig {
    /// Deadline for each general call
    pub request_timeout: Duration,
    /// Deadline for the liveness probe while connecting
    pub probe_timeout: Duration,
    /// Pause before the single probe retry
    pub probe_backoff: Duration,
    /// How long to wait for the custodian's "loaded" signal
    pub load_timeout: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(30),
            probe_timeout: Duration::from_secs(5),
            probe_backoff: Duration::from_secs(1),
            load_timeout: Duration::from_secs(10),
        }
    }
}

type ReplySender = oneshot::Sender<Result<Reply>>;

/// Pending continuations, keyed by request id.
#[derive(Default)]
struct Pending {
    /// Set once the link is gone; no new entries are accepted after.
    closed: bool,
    map: HashMap<String, ReplySender>,
}

impl Pending {
    fn lock(pending: &std::sync::Mutex<Pending>) -> MutexGuard<'_, Pending> {
        pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn close(&mut self) -> usize {
        self.closed = true;
        let count = self.map.len();
        for (id, tx) in self.map.drain() {
            debug!(request_id = %id, "Rejecting pending request");
            let _ = tx.send(Err(CustodyError::Disconnected));
        }
        count
    }
}

/// A connected stub for one custodian.
///
/// Calls may be issued concurrently from any number of tasks.
pub struct CustodianClient {
    config: ClientConfig,
    outbound: Mutex<Option<mpsc::Sender<String>>>,
    pending: Arc<std::sync::Mutex<Pending>>,
    tasks: std::sync::Mutex<Vec<JoinHandle<()>>>,
}

impl CustodianClient {
    /// Launch a custodian context and connect to it.
    ///
    /// # Errors
    /// - `Connection` if the context fails to launch or load, or the
    ///   liveness probe fails twice
    pub async fn connect(launcher: &dyn Launcher, config: ClientConfig) -> Result<Self> {
        let Link {
            outbound,
            inbound,
            loaded,
            mut tasks,
        } = launcher
            .launch()
            .await
            .map_err(|e| CustodyError::Connection(format!("launch failed: {e}")))?;

        let pending = Arc::new(std::sync::Mutex::new(Pending::default()));
        let pending_for_recv = Arc::clone(&pending);
        tasks.push(tokio::spawn(async move {
            receiver_loop(inbound, pending_for_recv).await;
        }));

        let client = Self {
            config,
            outbound: Mutex::new(Some(outbound)),
            pending,
            tasks: std::sync::Mutex::new(tasks),
        };

        match tokio::time::timeout(config.load_timeout, loaded).await {
            Ok(Ok(())) => debug!("Custodian loaded"),
            Ok(Err(_)) => {
                client.disconnect().await;
                return Err(CustodyError::Connection(
                    "custodian context closed before loading".into(),
                ));
            }
            Err(_) => {
                client.disconnect().await;
                return Err(CustodyError::Connection(format!(
                    "custodian context did not load within {:?}",
                    config.load_timeout
                )));
            }
        }

        if let Err(first) = client.probe().await {
            warn!(error = %first, backoff = ?config.probe_backoff, "Liveness probe failed, retrying");
            tokio::time::sleep(config.probe_backoff).await;
            if let Err(second) = client.probe().await {
                client.disconnect().await;
                return Err(CustodyError::Connection(format!(
                    "liveness probe failed: {second}"
                )));
            }
        }

        info!("Connected to custodian");
        Ok(client)
    }

    async fn probe(&self) -> Result<()> {
        self.call_with_timeout(Operation::Ping, self.config.probe_timeout)
            .await
            .map(|_| ())
    }

    async fn call(&self, operation: Operation) -> Result<Outcome> {
        self.call_with_timeout(operation, self.config.request_timeout)
            .await
    }

    async fn call_with_timeout(&self, operation: Operation, timeout: Duration) -> Result<Outcome> {
        let request_id = Uuid::new_v4().to_string();
        let text = RequestFrame::new(request_id.clone(), operation.clone()).to_json()?;

        let (reply_tx, reply_rx) = oneshot::channel();
        {
            let mut pending = Pending::lock(&self.pending);
            if pending.closed {
                return Err(CustodyError::Disconnected);
            }
            pending.map.insert(request_id.clone(), reply_tx);
        }
        let _entry = PendingEntry {
            pending: &self.pending,
            request_id: &request_id,
        };

        debug!(request_id = %request_id, operation = operation.name(), "Sending request");

        let sender = self.outbound.lock().await.clone();
        let sent = match sender {
            Some(sender) => sender.send(text).await.is_ok(),
            None => false,
        };
        if !sent {
            return Err(CustodyError::Disconnected);
        }

        let reply = match tokio::time::timeout(timeout, reply_rx).await {
            Ok(Ok(result)) => result?,
            Ok(Err(_)) => return Err(CustodyError::Disconnected),
            Err(_) => {
                debug!(request_id = %request_id, "Request timed out");
                return Err(CustodyError::TransportTimeout(timeout));
            }
        };

        reply.into_outcome(&operation)
    }

    // -------------------------------------------------------------------------
    // Operations
    // -------------------------------------------------------------------------

    pub async fn ping(&self) -> Result<()> {
        self.call(Operation::Ping).await.map(|_| ())
    }

    /// `did:key` of the custodian's active key.
    pub async fn get_active_identifier(&self) -> Result<String> {
        self.call(Operation::GetDidKey).await?.into_did_key()
    }

    /// Sign `message` with the active key. Returns a base64 signature.
    pub async fn sign(&self, message: &str) -> Result<String> {
        self.call(Operation::sign(message)).await?.into_signature()
    }

    /// Check a signature against any `did:key`.
    ///
    /// `Ok(false)` means the call succeeded and the signature is invalid.
    pub async fn verify(&self, did_key: &str, message: &str, signature: &str) -> Result<bool> {
        self.call(Operation::verify(did_key, message, signature))
            .await?
            .into_verified()
    }

    /// Create a key, make it active, and return its `did:key`.
    pub async fn generate_and_activate(&self) -> Result<String> {
        self.call(Operation::GenerateKey).await?.into_did_key()
    }

    // -------------------------------------------------------------------------
    // Lifecycle
    // -------------------------------------------------------------------------

    /// Tear down the link. Safe to call any number of times.
    ///
    /// Pending calls fail with `Disconnected`; pump tasks are aborted.
    pub async fn disconnect(&self) {
        let was_connected = self.outbound.lock().await.take().is_some();
        let rejected = Pending::lock(&self.pending).close();

        let tasks: Vec<_> = self
            .tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();
        for task in tasks {
            task.abort();
        }

        if was_connected {
            info!(rejected = rejected, "Disconnected from custodian");
        }
    }

    pub async fn is_connected(&self) -> bool {
        self.outbound.lock().await.is_some() && !Pending::lock(&self.pending).closed
    }

    /// Calls currently awaiting a reply.
    pub async fn pending_count(&self) -> usize {
        Pending::lock(&self.pending).map.len()
    }
}

impl Drop for CustodianClient {
    fn drop(&mut self) {
        let tasks = self.tasks.get_mut().unwrap_or_else(PoisonError::into_inner);
        for task in tasks.drain(..) {
            task.abort();
        }
    }
}

/// Removes a call's pending entry however the call ends, including when
/// the caller drops the future before a reply or timeout.
struct PendingEntry<'a> {
    pending: &'a std::sync::Mutex<Pending>,
    request_id: &'a str,
}

impl Drop for PendingEntry<'_> {
    fn drop(&mut self) {
        Pending::lock(self.pending).map.remove(self.request_id);
    }
}

/// Routes replies to their pending entries until the link closes.
async fn receiver_loop(
    mut inbound: mpsc::Receiver<String>,
    pending: Arc<std::sync::Mutex<Pending>>,
) {
    debug!("Receiver loop started");

    while let Some(text) = inbound.recv().await {
        let reply = match Reply::parse(&text) {
            Ok(reply) => reply,
            Err(e) => {
                warn!(error = %e, "Discarding undecodable reply");
                continue;
            }
        };

        let entry = Pending::lock(&pending).map.remove(&reply.request_id);
        match entry {
            Some(tx) => {
                let _ = tx.send(Ok(reply));
            }
            None => debug!(request_id = %reply.request_id, "Reply for unknown or expired request"),
        }
    }

    let rejected = Pending::lock(&pending).close();
    debug!(rejected = rejected, "Receiver loop ended");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::OperationError;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio_test::{assert_pending, assert_ready_err};

    /// Hands the test the custodian's end of the link.
    struct TestLauncher {
        link: std::sync::Mutex<Option<Link>>,
    }

    #[async_trait]
    impl Launcher for TestLauncher {
        async fn launch(&self) -> Result<Link> {
            self.link
                .lock()
                .unwrap()
                .take()
                .ok_or_else(|| CustodyError::Connection("already launched".into()))
        }
    }

    struct Remote {
        requests: mpsc::Receiver<String>,
        replies: mpsc::Sender<String>,
        loaded: Option<oneshot::Sender<()>>,
    }

    fn test_link() -> (TestLauncher, Remote) {
        let (outbound, requests) = mpsc::channel(16);
        let (replies, inbound) = mpsc::channel(16);
        let (loaded_tx, loaded) = oneshot::channel();
        let link = Link {
            outbound,
            inbound,
            loaded,
            tasks: Vec::new(),
        };
        let launcher = TestLauncher {
            link: std::sync::Mutex::new(Some(link)),
        };
        let remote = Remote {
            requests,
            replies,
            loaded: Some(loaded_tx),
        };
        (launcher, remote)
    }

    /// Signals loaded, then answers each request with `respond`. Requests it
    /// declines are forwarded to the returned receiver.
    fn spawn_remote<F>(
        mut remote: Remote,
        mut respond: F,
    ) -> (mpsc::UnboundedReceiver<RequestFrame>, mpsc::Sender<String>)
    where
        F: FnMut(&RequestFrame) -> Option<Reply> + Send + 'static,
    {
        let (held_tx, held_rx) = mpsc::unbounded_channel();
        let replies = remote.replies.clone();
        tokio::spawn(async move {
            if let Some(loaded) = remote.loaded.take() {
                let _ = loaded.send(());
            }
            while let Some(text) = remote.requests.recv().await {
                let request = RequestFrame::parse(&text).unwrap();
                match respond(&request) {
                    Some(reply) => {
                        let _ = remote.replies.send(reply.to_json().unwrap()).await;
                    }
                    None => {
                        let _ = held_tx.send(request);
                    }
                }
            }
        });
        (held_rx, replies)
    }

    fn pong_only(request: &RequestFrame) -> Option<Reply> {
        match request.operation {
            Operation::Ping => Some(Reply::success(request, Outcome::Pong)),
            _ => None,
        }
    }

    fn message_of(request: &RequestFrame) -> String {
        match &request.operation {
            Operation::SignMessage { message } => message.clone().unwrap_or_default(),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_replies_in_any_order_resolve_their_own_calls() {
        let (launcher, remote) = test_link();
        let (mut held, replies) = spawn_remote(remote, pong_only);
        let client = CustodianClient::connect(&launcher, ClientConfig::default())
            .await
            .unwrap();

        let answer = async {
            let mut requests = Vec::new();
            for _ in 0..3 {
                requests.push(held.recv().await.unwrap());
            }
            requests.reverse();
            for request in &requests {
                let signature = format!("sig-{}", message_of(request));
                let reply = Reply::success(request, Outcome::Signature(signature));
                replies.send(reply.to_json().unwrap()).await.unwrap();
            }
        };

        let (a, b, c, ()) = tokio::join!(
            client.sign("a"),
            client.sign("b"),
            client.sign("c"),
            answer
        );
        assert_eq!(a.unwrap(), "sig-a");
        assert_eq!(b.unwrap(), "sig-b");
        assert_eq!(c.unwrap(), "sig-c");
        assert_eq!(client.pending_count().await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_isolated_to_its_call() {
        let (launcher, remote) = test_link();
        let (mut held, replies) = spawn_remote(remote, |request| match &request.operation {
            Operation::SignMessage { message } if message.as_deref() == Some("fast") => Some(
                Reply::success(request, Outcome::Signature("sig-fast".into())),
            ),
            _ => pong_only(request),
        });
        let client = CustodianClient::connect(&launcher, ClientConfig::default())
            .await
            .unwrap();

        let (slow, fast) = tokio::join!(client.sign("slow"), client.sign("fast"));
        assert_eq!(fast.unwrap(), "sig-fast");
        assert!(matches!(
            slow,
            Err(CustodyError::TransportTimeout(d)) if d == Duration::from_secs(30)
        ));
        assert_eq!(client.pending_count().await, 0);

        // A late reply for the expired id is ignored
        let late = held.recv().await.unwrap();
        let reply = Reply::success(&late, Outcome::Signature("too late".into()));
        replies.send(reply.to_json().unwrap()).await.unwrap();
        tokio::task::yield_now().await;
        assert!(client.is_connected().await);
        client.ping().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_probe_retried_once() {
        let (launcher, remote) = test_link();
        let pings = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&pings);
        spawn_remote(remote, move |request| {
            if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                return None;
            }
            pong_only(request)
        });

        let client = CustodianClient::connect(&launcher, ClientConfig::default()).await;
        assert!(client.is_ok());
        assert_eq!(pings.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_probe_failing_twice_is_connection_error() {
        let (launcher, remote) = test_link();
        let (_held, _replies) = spawn_remote(remote, |_| None);

        let err = CustodianClient::connect(&launcher, ClientConfig::default())
            .await
            .err()
            .unwrap();
        assert!(matches!(err, CustodyError::Connection(_)));
    }

    #[tokio::test]
    async fn test_context_closing_before_load() {
        let (launcher, mut remote) = test_link();
        drop(remote.loaded.take());

        let err = CustodianClient::connect(&launcher, ClientConfig::default())
            .await
            .err()
            .unwrap();
        assert!(matches!(err, CustodyError::Connection(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_context_never_loading() {
        let (launcher, _remote) = test_link();
        let err = CustodianClient::connect(&launcher, ClientConfig::default())
            .await
            .err()
            .unwrap();
        assert!(matches!(err, CustodyError::Connection(msg) if msg.contains("did not load")));
    }

    #[tokio::test]
    async fn test_error_codes() {
        let (launcher, remote) = test_link();
        spawn_remote(remote, |request| match &request.operation {
            Operation::GetDidKey => Some(Reply::failure(request, OperationError::NoActiveKey)),
            Operation::GenerateKey => {
                let mut reply = Reply::failure(request, OperationError::Internal);
                reply.error = Some("SomethingNew".into());
                Some(reply)
            }
            Operation::SignMessage { .. } => Some(Reply::success(request, Outcome::Pong)),
            _ => pong_only(request),
        });
        let client = CustodianClient::connect(&launcher, ClientConfig::default())
            .await
            .unwrap();

        let err = client.get_active_identifier().await.unwrap_err();
        assert_eq!(err.operation(), Some(OperationError::NoActiveKey));

        let err = client.generate_and_activate().await.unwrap_err();
        assert!(matches!(err, CustodyError::Protocol(_)));

        // Reply type does not match the request
        let err = client.sign("m").await.unwrap_err();
        assert!(matches!(err, CustodyError::Protocol(_)));
    }

    #[tokio::test]
    async fn test_disconnect_rejects_pending_and_is_idempotent() {
        let (launcher, remote) = test_link();
        let (_held, _replies) = spawn_remote(remote, pong_only);
        let client = CustodianClient::connect(&launcher, ClientConfig::default())
            .await
            .unwrap();

        let mut call = tokio_test::task::spawn(client.sign("never answered"));
        assert_pending!(call.poll());
        assert_eq!(client.pending_count().await, 1);

        client.disconnect().await;
        let err = assert_ready_err!(call.poll());
        assert!(matches!(err, CustodyError::Disconnected));
        drop(call);

        client.disconnect().await;
        assert_eq!(client.pending_count().await, 0);
        assert!(!client.is_connected().await);
        assert!(matches!(client.ping().await, Err(CustodyError::Disconnected)));
    }

    #[tokio::test]
    async fn test_abandoned_call_leaves_no_pending_entry() {
        let (launcher, remote) = test_link();
        let (mut held, replies) = spawn_remote(remote, pong_only);
        let client = CustodianClient::connect(&launcher, ClientConfig::default())
            .await
            .unwrap();

        let mut call = tokio_test::task::spawn(client.sign("abandoned"));
        assert_pending!(call.poll());
        assert_eq!(client.pending_count().await, 1);

        drop(call);
        assert_eq!(client.pending_count().await, 0);

        // A reply that shows up afterwards is ignored
        let request = held.recv().await.unwrap();
        let reply = Reply::success(&request, Outcome::Signature("late".into()));
        replies.send(reply.to_json().unwrap()).await.unwrap();
        client.ping().await.unwrap();
        assert_eq!(client.pending_count().await, 0);
    }
}
