//! Rust client SDK for a remote node speaking JSON-RPC over two transports.
//!
//! The crate is organized by transport surface:
//! - `http`: request/response client for single and batched calls.
//! - `stream`: realtime websocket client, subscription registry, and
//!   automatic reconnect handling.
//! - `envelope`: JSON-RPC wire envelopes shared by both transports.
//! - `endpoint`: endpoint pair and stream-URL derivation.
//! - `backoff`: reconnect backoff policy and timeout helpers.

/// Reconnect backoff policy and timeout helpers.
pub mod backoff;
/// Endpoint pair and stream-URL derivation.
pub mod endpoint;
/// JSON-RPC envelopes and inbound frame classification.
pub mod envelope;
/// HTTP request/response client and batched calls.
pub mod http;
/// Realtime stream client and event subscriptions.
pub mod stream;
