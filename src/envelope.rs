//! JSON-RPC wire envelopes shared by the HTTP and stream transports.
//!
//! Requests carry a numeric id used to correlate replies on both transports;
//! inbound stream frames are classified into call replies and subscription
//! push events before dispatch.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Protocol version stamped on every outbound request.
pub const JSONRPC_VERSION: &str = "2.0";

/// Identifier of a server-issued event subscription.
///
/// Unique among active subscriptions on one connection; not stable across
/// reconnects.
pub type SubscriptionId = u64;

/// Outbound request envelope.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct RpcRequest {
    pub jsonrpc: String,
    pub id: u64,
    pub method: String,
    pub params: Vec<Value>,
}

impl RpcRequest {
    /// Builds a request envelope for the given correlation id.
    pub fn new(id: u64, method: impl Into<String>, params: Vec<Value>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id,
            method: method.into(),
            params,
        }
    }

    pub fn to_text(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// Inbound reply envelope carrying either a result or an error object.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct RpcResponse {
    pub id: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcErrorObject>,
}

impl RpcResponse {
    /// Splits the envelope into its payload, favoring the error member when
    /// both are present.
    pub fn into_result(self) -> Result<Value, RpcErrorObject> {
        match (self.error, self.result) {
            (Some(error), _) => Err(error),
            (None, Some(result)) => Ok(result),
            (None, None) => Ok(Value::Null),
        }
    }
}

/// Server-reported call failure.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct RpcErrorObject {
    pub code: i64,
    pub message: String,
}

/// Subscription push payload: `{subscription, result}` under a notification
/// method.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct PushParams {
    pub subscription: SubscriptionId,
    pub result: Value,
}

/// One classified inbound stream frame.
#[derive(Clone, Debug, PartialEq)]
pub enum InboundFrame {
    /// Reply to an in-flight call, correlated by id.
    Reply(RpcResponse),
    /// Push event for an active subscription.
    Push(PushParams),
}

impl InboundFrame {
    /// Classifies one inbound text frame.
    ///
    /// A frame with a `method` key and `params.subscription` is a push event;
    /// a frame with an `id` key is a call reply. Anything else is malformed
    /// and the caller is expected to drop it.
    pub fn from_text(text: &str) -> Result<Self, serde_json::Error> {
        #[derive(Deserialize)]
        struct RawFrame {
            #[serde(default)]
            id: Option<u64>,
            #[serde(default)]
            method: Option<String>,
            #[serde(default)]
            params: Option<PushParams>,
            #[serde(default)]
            result: Option<Value>,
            #[serde(default)]
            error: Option<RpcErrorObject>,
        }

        let raw: RawFrame = serde_json::from_str(text)?;
        if raw.method.is_some() {
            if let Some(params) = raw.params {
                return Ok(Self::Push(params));
            }
        }
        match raw.id {
            Some(id) => Ok(Self::Reply(RpcResponse {
                id,
                result: raw.result,
                error: raw.error,
            })),
            None => Err(serde::de::Error::custom(
                "frame is neither a call reply nor a subscription push",
            )),
        }
    }
}
