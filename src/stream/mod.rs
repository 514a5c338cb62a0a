//! Realtime stream modules.
//!
//! - `client`: websocket transport, call correlation, and reconnect handling.
//! - `subscriptions`: registry routing push events to caller handlers.

/// Websocket connection and call primitive.
pub mod client;
/// Subscription registry and event dispatch.
pub mod subscriptions;
