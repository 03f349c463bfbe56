#![deny(missing_debug_implementations)]
#![cfg_attr(docsrs, feature(doc_cfg))]
//! # Meshrelay
//! Meshrelay is a WebRTC call server library. Every participant keeps one websocket signaling
//! channel and one peer connection to the server, and the server forwards the media it receives
//! from each participant to all the others.
//!
//! ## Usage
//! Build a [`orchestrator::MediaOrchestrator`] with a [`rtc_peer::RtcEngine`] and serve
//! [`server::router`]. `demos/call_server.rs` is a complete server.

/// Persistent per-client signaling connection with keepalive.
pub mod channel;
/// Configuration for [`channel::SignalingChannel`], [`rtc_peer::RtcEngine`] and [`orchestrator::MediaOrchestrator`].
pub mod config;
/// Traits between the orchestrator and the media transport.
pub mod engine;
pub mod error;
/// Wire envelope of signaling messages.
pub mod message;
/// Orchestrator drives negotiation and forwards media between sessions.
pub mod orchestrator;
/// Concurrent registry of live sessions.
pub mod registry;
/// [`webrtc::peer_connection::RTCPeerConnection`] backed media engine.
pub mod rtc_peer;
pub mod server;
#[cfg(test)]
mod testing;
