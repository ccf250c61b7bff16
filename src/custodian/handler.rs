//! Wire request handling
//!
//! Order of checks for every inbound frame:
//! 1. Origin guard. Disallowed callers get no reply at all.
//! 2. Frame decoding. Malformed frames are dropped without a reply.
//! 3. The operation itself, on its own task. Exactly one reply, even if the
//!    operation panics.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{debug, error, warn};

use super::{Custodian, GENERATED_KEY_ALIAS};
use crate::channel::Frame;
use crate::error::OperationError;
use crate::keys::verify_payload;
use crate::protocol::{Operation, Outcome, Reply, RequestFrame};

impl Custodian {
    /// Handle one inbound frame, returning the serialized reply if one is
    /// owed.
    pub async fn handle_frame(&self, frame: &Frame) -> Option<String> {
        if !self.is_allowed(&frame.origin).await {
            warn!(origin = %frame.origin, "Dropping frame from disallowed origin");
            return None;
        }

        let request = match RequestFrame::parse(&frame.data) {
            Ok(request) => request,
            Err(e) => {
                debug!(origin = %frame.origin, error = %e, "Dropping malformed frame");
                return None;
            }
        };

        let reply = self.respond(&request).await;
        match reply.to_json() {
            Ok(text) => Some(text),
            Err(e) => {
                error!(request_id = %request.request_id, error = %e, "Failed to encode reply");
                None
            }
        }
    }

    /// Answer an admitted request. Never fails: faults become error replies.
    pub async fn respond(&self, request: &RequestFrame) -> Reply {
        debug!(
            request_id = %request.request_id,
            operation = request.operation.name(),
            "Handling request"
        );

        let result = AssertUnwindSafe(self.perform(&request.operation))
            .catch_unwind()
            .await;

        match result {
            Ok(Ok(outcome)) => Reply::success(request, outcome),
            Ok(Err(code)) => {
                debug!(request_id = %request.request_id, error = %code, "Operation failed");
                Reply::failure(request, code)
            }
            Err(_) => {
                error!(
                    request_id = %request.request_id,
                    operation = request.operation.name(),
                    "Operation panicked"
                );
                Reply::failure(request, request.operation.failure_code())
            }
        }
    }

    async fn perform(&self, operation: &Operation) -> Result<Outcome, OperationError> {
        match operation {
            Operation::Ping => Ok(Outcome::Pong),

            Operation::GetDidKey => self
                .active_identifier()
                .await
                .map(Outcome::DidKey)
                .map_err(|e| e.operation().unwrap_or(OperationError::Internal)),

            Operation::SignMessage { message } => {
                let message = message.as_deref().unwrap_or_default();
                self.sign(message.as_bytes())
                    .await
                    .map(Outcome::Signature)
                    .map_err(|e| e.operation().unwrap_or(OperationError::SignFailed))
            }

            Operation::VerifySignature {
                did_key,
                message,
                signature,
            } => {
                let did_key = did_key
                    .as_deref()
                    .filter(|d| !d.is_empty())
                    .ok_or(OperationError::MissingIdentifier)?;
                let (Some(message), Some(signature)) = (message, signature) else {
                    return Err(OperationError::MissingPayload);
                };
                verify_payload(did_key, message.as_bytes(), signature)
                    .map(Outcome::Verified)
                    .map_err(|e| {
                        debug!(error = %e, "Identifier not decodable");
                        OperationError::VerifyFailed
                    })
            }

            Operation::GenerateKey => self
                .generate_and_activate(GENERATED_KEY_ALIAS)
                .await
                .map(|summary| Outcome::DidKey(summary.did_key))
                .map_err(|e| {
                    error!(error = %e, "Key generation failed");
                    OperationError::GenerateFailed
                }),
        }
    }

    /// Serve frames until the inbound channel closes.
    ///
    /// Each admitted request runs on its own task, so replies go out in
    /// completion order. Dropping the returned future aborts requests
    /// still in flight.
    pub async fn serve(
        self: Arc<Self>,
        mut inbound: mpsc::Receiver<Frame>,
        outbound: mpsc::Sender<String>,
    ) {
        let mut in_flight = JoinSet::new();

        loop {
            tokio::select! {
                frame = inbound.recv() => {
                    let Some(frame) = frame else { break };
                    let custodian = Arc::clone(&self);
                    let outbound = outbound.clone();
                    in_flight.spawn(async move {
                        if let Some(reply) = custodian.handle_frame(&frame).await {
                            if outbound.send(reply).await.is_err() {
                                debug!("Caller went away before reply");
                            }
                        }
                    });
                }
                Some(joined) = in_flight.join_next(), if !in_flight.is_empty() => {
                    if let Err(e) = joined {
                        error!(error = %e, "Request task failed");
                    }
                }
            }
        }

        while let Some(joined) = in_flight.join_next().await {
            if let Err(e) = joined {
                error!(error = %e, "Request task failed");
            }
        }
        debug!("Custodian serve loop ended");
    }
}
