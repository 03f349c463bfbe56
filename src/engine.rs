//! Seam between the orchestrator and the media transport engine.
//!
//! The orchestrator only talks to peers through [`MediaPeer`] and only learns
//! about them through [`PeerEvent`]s, so the transport can be swapped for a
//! scripted one in tests. [`crate::rtc_peer::RtcEngine`] is the webrtc-backed
//! implementation.
use std::sync::Arc;

use async_trait::async_trait;
use derivative::Derivative;
use tokio::sync::mpsc;
use webrtc::{
    ice_transport::ice_candidate::RTCIceCandidateInit,
    peer_connection::{
        peer_connection_state::RTCPeerConnectionState,
        sdp::session_description::RTCSessionDescription, signaling_state::RTCSignalingState,
    },
    rtp::packet::Packet,
    rtp_transceiver::rtp_codec::RTCRtpCodecCapability,
    track::track_local::track_local_static_rtp::TrackLocalStaticRTP,
};

use crate::error::Error;

/// Everything a peer reports, delivered in order through one channel per session.
#[derive(Derivative)]
#[derivative(Debug)]
pub enum PeerEvent {
    /// A local candidate was gathered. `None` marks the end of gathering.
    IceCandidate(Option<RTCIceCandidateInit>),
    ConnectionStateChanged(RTCPeerConnectionState),
    SignalingStateChanged(RTCSignalingState),
    TrackReceived(#[derivative(Debug = "ignore")] Arc<dyn RemoteTrack>),
}

/// Media received from the client of a session.
#[async_trait]
pub trait RemoteTrack: Send + Sync {
    fn id(&self) -> String;
    fn capability(&self) -> RTCRtpCodecCapability;
    /// Reads the next packet. Fails with `TrackEndedError` once the source is finished.
    async fn read_rtp(&self) -> Result<Packet, Error>;
}

/// Media peer of one session.
#[async_trait]
pub trait MediaPeer: Send + Sync {
    fn id(&self) -> &str;
    async fn create_offer(&self) -> Result<RTCSessionDescription, Error>;
    async fn create_answer(&self) -> Result<RTCSessionDescription, Error>;
    async fn set_local_description(&self, description: RTCSessionDescription)
        -> Result<(), Error>;
    /// Sets the remote description and applies candidates buffered before it.
    async fn set_remote_description(
        &self,
        description: RTCSessionDescription,
    ) -> Result<(), Error>;
    /// Adds a remote candidate, or buffers it while no remote description is set.
    async fn add_ice_candidate(&self, candidate: RTCIceCandidateInit) -> Result<(), Error>;
    fn signaling_state(&self) -> RTCSignalingState;
    /// Starts sending `track` to the client. The caller renegotiates afterwards.
    async fn add_track(&self, track: Arc<TrackLocalStaticRTP>) -> Result<(), Error>;
    /// Stops sending the track with `track_id`. Returns false when it was not attached.
    async fn remove_track(&self, track_id: &str) -> Result<bool, Error>;
    async fn close(&self) -> Result<(), Error>;
}

/// Creates media peers.
#[async_trait]
pub trait MediaEngine: Send + Sync {
    /// Creates the peer of session `session_id` together with the receiving end of its events.
    async fn create_peer(
        &self,
        session_id: &str,
    ) -> Result<(Arc<dyn MediaPeer>, mpsc::UnboundedReceiver<PeerEvent>), Error>;
}
