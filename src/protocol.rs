//! Custody Wire Protocol
//!
//! Single responsibility: encode and decode the JSON frames exchanged
//! between the client stub and the custodian.
//!
//! # Wire Format
//!
//! ## Request
//! ```text
//! {
//!     "type": "PING" | "getDIDKey" | "signMessage" | "verifySignature" | "generateKey",
//!     "requestId": <string>,     // echoed by the reply
//!     ...operation fields        // message, didKey, signature
//! }
//! ```
//!
//! ## Reply
//! ```text
//! {
//!     "type": "PONG" | "<op>:result",
//!     "requestId": <string>,
//!     "ok": <bool>,
//!     "error": <string>?,        // OperationError code when ok == false
//!     "didKey" | "signature" | "valid": ...
//! }
//! ```
//!
//! `ok` reports whether the request succeeded. `valid` reports whether a
//! signature verified. They are never merged.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{CustodyError, OperationError, Result};

/// Field carrying the correlation id on every frame.
pub const REQUEST_ID_FIELD: &str = "requestId";

/// Reply type for `PING`.
pub const PONG: &str = "PONG";

/// An operation the custodian can be asked to perform.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Operation {
    #[serde(rename = "PING")]
    Ping,

    #[serde(rename = "getDIDKey")]
    GetDidKey,

    #[serde(rename = "signMessage")]
    SignMessage {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },

    #[serde(rename = "verifySignature")]
    VerifySignature {
        #[serde(rename = "didKey", default, skip_serializing_if = "Option::is_none")]
        did_key: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        signature: Option<String>,
    },

    #[serde(rename = "generateKey")]
    GenerateKey,
}

impl Operation {
    /// Request `type` value.
    pub fn name(&self) -> &'static str {
        match self {
            Operation::Ping => "PING",
            Operation::GetDidKey => "getDIDKey",
            Operation::SignMessage { .. } => "signMessage",
            Operation::VerifySignature { .. } => "verifySignature",
            Operation::GenerateKey => "generateKey",
        }
    }

    /// Reply `type` value expected for this operation.
    pub fn reply_type(&self) -> &'static str {
        match self {
            Operation::Ping => PONG,
            Operation::GetDidKey => "getDIDKey:result",
            Operation::SignMessage { .. } => "signMessage:result",
            Operation::VerifySignature { .. } => "verifySignature:result",
            Operation::GenerateKey => "generateKey:result",
        }
    }

    /// Code reported when the operation faults without a more specific one.
    pub fn failure_code(&self) -> OperationError {
        match self {
            Operation::Ping | Operation::GetDidKey => OperationError::Internal,
            Operation::SignMessage { .. } => OperationError::SignFailed,
            Operation::VerifySignature { .. } => OperationError::VerifyFailed,
            Operation::GenerateKey => OperationError::GenerateFailed,
        }
    }

    pub fn sign(message: impl Into<String>) -> Self {
        Operation::SignMessage {
            message: Some(message.into()),
        }
    }

    pub fn verify(
        did_key: impl Into<String>,
        message: impl Into<String>,
        signature: impl Into<String>,
    ) -> Self {
        Operation::VerifySignature {
            did_key: Some(did_key.into()),
            message: Some(message.into()),
            signature: Some(signature.into()),
        }
    }
}

/// A correlated request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestFrame {
    pub request_id: String,
    pub operation: Operation,
}

impl RequestFrame {
    pub fn new(request_id: impl Into<String>, operation: Operation) -> Self {
        Self {
            request_id: request_id.into(),
            operation,
        }
    }

    pub fn to_json(&self) -> Result<String> {
        let mut value = serde_json::to_value(&self.operation)?;
        let object = value
            .as_object_mut()
            .ok_or_else(|| CustodyError::Protocol("operation did not encode as an object".into()))?;
        object.insert(
            REQUEST_ID_FIELD.to_string(),
            Value::String(self.request_id.clone()),
        );
        Ok(serde_json::to_string(&value)?)
    }

    /// Decode a request frame.
    ///
    /// Fails on non-JSON input, a missing or empty `requestId`, an unknown
    /// `type`, or operation fields of the wrong JSON type.
    pub fn parse(text: &str) -> Result<Self> {
        let value: Value = serde_json::from_str(text)
            .map_err(|e| CustodyError::Protocol(format!("not JSON: {e}")))?;
        let Value::Object(mut object) = value else {
            return Err(CustodyError::Protocol("frame is not an object".into()));
        };

        let request_id = match object.remove(REQUEST_ID_FIELD) {
            Some(Value::String(id)) if !id.is_empty() => id,
            Some(_) => return Err(CustodyError::Protocol("requestId is not a string".into())),
            None => return Err(CustodyError::Protocol("missing requestId".into())),
        };

        let operation: Operation = serde_json::from_value(Value::Object(object))
            .map_err(|e| CustodyError::Protocol(format!("bad operation: {e}")))?;

        Ok(Self {
            request_id,
            operation,
        })
    }
}

/// Result payload of a successful operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Pong,
    DidKey(String),
    Signature(String),
    Verified(bool),
}

impl Outcome {
    pub fn into_did_key(self) -> Result<String> {
        match self {
            Outcome::DidKey(did) => Ok(did),
            other => Err(unexpected(other)),
        }
    }

    pub fn into_signature(self) -> Result<String> {
        match self {
            Outcome::Signature(signature) => Ok(signature),
            other => Err(unexpected(other)),
        }
    }

    pub fn into_verified(self) -> Result<bool> {
        match self {
            Outcome::Verified(valid) => Ok(valid),
            other => Err(unexpected(other)),
        }
    }
}

fn unexpected(outcome: Outcome) -> CustodyError {
    CustodyError::Protocol(format!("unexpected outcome: {outcome:?}"))
}

/// A correlated reply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Reply {
    #[serde(rename = "type")]
    pub kind: String,
    pub request_id: String,
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub did_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub valid: Option<bool>,
}

impl Reply {
    fn empty(request: &RequestFrame, ok: bool) -> Self {
        Self {
            kind: request.operation.reply_type().to_string(),
            request_id: request.request_id.clone(),
            ok,
            error: None,
            did_key: None,
            signature: None,
            valid: None,
        }
    }

    pub fn success(request: &RequestFrame, outcome: Outcome) -> Self {
        let mut reply = Self::empty(request, true);
        match outcome {
            Outcome::Pong => {}
            Outcome::DidKey(did) => reply.did_key = Some(did),
            Outcome::Signature(signature) => reply.signature = Some(signature),
            Outcome::Verified(valid) => reply.valid = Some(valid),
        }
        reply
    }

    pub fn failure(request: &RequestFrame, error: OperationError) -> Self {
        let mut reply = Self::empty(request, false);
        reply.error = Some(error.code().to_string());
        reply
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn parse(text: &str) -> Result<Self> {
        serde_json::from_str(text).map_err(|e| CustodyError::Protocol(format!("bad reply: {e}")))
    }

    /// Interpret this reply as the answer to `operation`.
    pub fn into_outcome(self, operation: &Operation) -> Result<Outcome> {
        if self.kind != operation.reply_type() {
            return Err(CustodyError::Protocol(format!(
                "expected {} reply, got {}",
                operation.reply_type(),
                self.kind
            )));
        }

        if !self.ok {
            let code = self
                .error
                .ok_or_else(|| CustodyError::Protocol("failed reply without error code".into()))?;
            return Err(match OperationError::from_code(&code) {
                Some(op) => CustodyError::Operation(op),
                None => CustodyError::Protocol(format!("unknown error code: {code}")),
            });
        }

        let missing = |field: &str| CustodyError::Protocol(format!("reply missing {field}"));
        match operation {
            Operation::Ping => Ok(Outcome::Pong),
            Operation::GetDidKey | Operation::GenerateKey => self
                .did_key
                .map(Outcome::DidKey)
                .ok_or_else(|| missing("didKey")),
            Operation::SignMessage { .. } => self
                .signature
                .map(Outcome::Signature)
                .ok_or_else(|| missing("signature")),
            Operation::VerifySignature { .. } => self
                .valid
                .map(Outcome::Verified)
                .ok_or_else(|| missing("valid")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_wire_shape() {
        let frame = RequestFrame::new("abc", Operation::sign("hello"));
        let value: Value = serde_json::from_str(&frame.to_json().unwrap()).unwrap();
        assert_eq!(
            value,
            serde_json::json!({"type": "signMessage", "requestId": "abc", "message": "hello"})
        );

        let ping: Value =
            serde_json::from_str(&RequestFrame::new("p", Operation::Ping).to_json().unwrap())
                .unwrap();
        assert_eq!(ping, serde_json::json!({"type": "PING", "requestId": "p"}));
    }

    #[test]
    fn test_parse_verify_request() {
        let frame = RequestFrame::parse(
            r#"{"type":"verifySignature","requestId":"1","didKey":"did:key:z1","message":"m","signature":"s"}"#,
        )
        .unwrap();
        assert_eq!(frame.request_id, "1");
        assert_eq!(frame.operation, Operation::verify("did:key:z1", "m", "s"));
    }

    #[test]
    fn test_parse_tolerates_missing_operation_fields() {
        let frame = RequestFrame::parse(r#"{"type":"signMessage","requestId":"1"}"#).unwrap();
        assert_eq!(frame.operation, Operation::SignMessage { message: None });

        let frame =
            RequestFrame::parse(r#"{"type":"verifySignature","requestId":"2","message":null}"#)
                .unwrap();
        assert!(matches!(
            frame.operation,
            Operation::VerifySignature { did_key: None, message: None, signature: None }
        ));
    }

    #[test]
    fn test_parse_rejects_malformed_frames() {
        for bad in [
            "not json",
            "[1,2]",
            r#"{"type":"PING"}"#,
            r#"{"type":"PING","requestId":""}"#,
            r#"{"type":"PING","requestId":7}"#,
            r#"{"type":"launchMissiles","requestId":"1"}"#,
            r#"{"requestId":"1"}"#,
            r#"{"type":"signMessage","requestId":"1","message":5}"#,
        ] {
            assert!(
                matches!(RequestFrame::parse(bad), Err(CustodyError::Protocol(_))),
                "accepted {bad}"
            );
        }
    }

    #[test]
    fn test_reply_wire_shape() {
        let request = RequestFrame::new("r1", Operation::verify("d", "m", "s"));
        let value: Value =
            serde_json::to_value(Reply::success(&request, Outcome::Verified(false))).unwrap();
        assert_eq!(
            value,
            serde_json::json!({
                "type": "verifySignature:result",
                "requestId": "r1",
                "ok": true,
                "valid": false
            })
        );

        let request = RequestFrame::new("r2", Operation::GetDidKey);
        let value: Value =
            serde_json::to_value(Reply::failure(&request, OperationError::NoActiveKey)).unwrap();
        assert_eq!(
            value,
            serde_json::json!({
                "type": "getDIDKey:result",
                "requestId": "r2",
                "ok": false,
                "error": "NoActiveKey"
            })
        );
    }

    #[test]
    fn test_into_outcome() {
        let request = RequestFrame::new("1", Operation::GenerateKey);
        let reply = Reply::success(&request, Outcome::DidKey("did:key:zQ3s".into()));
        assert_eq!(
            reply.into_outcome(&Operation::GenerateKey).unwrap(),
            Outcome::DidKey("did:key:zQ3s".into())
        );

        let reply = Reply::failure(&request, OperationError::GenerateFailed);
        let err = reply.into_outcome(&Operation::GenerateKey).unwrap_err();
        assert_eq!(err.operation(), Some(OperationError::GenerateFailed));
    }

    #[test]
    fn test_into_outcome_protocol_errors() {
        let request = RequestFrame::new("1", Operation::Ping);
        let pong = Reply::success(&request, Outcome::Pong);
        assert!(matches!(
            pong.into_outcome(&Operation::GetDidKey),
            Err(CustodyError::Protocol(_))
        ));

        let mut unknown = Reply::failure(&request, OperationError::Internal);
        unknown.error = Some("Bogus".into());
        assert!(matches!(
            unknown.into_outcome(&Operation::Ping),
            Err(CustodyError::Protocol(_))
        ));

        let request = RequestFrame::new("2", Operation::GetDidKey);
        let bare = Reply::success(&request, Outcome::Pong);
        assert!(matches!(
            bare.into_outcome(&Operation::GetDidKey),
            Err(CustodyError::Protocol(_))
        ));
    }
}
