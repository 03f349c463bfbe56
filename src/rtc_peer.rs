use std::{
    collections::HashMap,
    sync::{Arc, Weak},
    time::Duration,
};

use async_trait::async_trait;
use derivative::Derivative;
use enclose::enc;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;
use webrtc::{
    api::{
        interceptor_registry::register_default_interceptors,
        media_engine::MediaEngine as CodecRegistry, setting_engine::SettingEngine, APIBuilder, API,
    },
    ice::udp_network::{EphemeralUDP, UDPNetwork},
    ice_transport::{
        ice_candidate::{RTCIceCandidate, RTCIceCandidateInit},
        ice_candidate_type::RTCIceCandidateType,
        ice_connection_state::RTCIceConnectionState,
    },
    interceptor::registry::Registry,
    peer_connection::{
        peer_connection_state::RTCPeerConnectionState,
        sdp::session_description::RTCSessionDescription, signaling_state::RTCSignalingState,
        RTCPeerConnection,
    },
    rtcp::payload_feedbacks::picture_loss_indication::PictureLossIndication,
    rtp::packet::Packet,
    rtp_transceiver::{
        rtp_codec::{RTCRtpCodecCapability, RTPCodecType},
        rtp_receiver::RTCRtpReceiver,
        rtp_sender::RTCRtpSender,
        rtp_transceiver_direction::RTCRtpTransceiverDirection,
        RTCRtpTransceiver, RTCRtpTransceiverInit,
    },
    track::{
        track_local::{track_local_static_rtp::TrackLocalStaticRTP, TrackLocal},
        track_remote::TrackRemote,
    },
};

use crate::{
    config::{MediaConfig, WebRTCTransportConfig},
    engine::{MediaEngine, MediaPeer, PeerEvent, RemoteTrack},
    error::{Error, TransportErrorKind},
};

/// [`MediaEngine`] backed by [`webrtc::peer_connection::RTCPeerConnection`].
#[derive(Debug, Clone)]
pub struct RtcEngine {
    media_config: MediaConfig,
    transport_config: WebRTCTransportConfig,
}

impl RtcEngine {
    pub fn new(media_config: MediaConfig, transport_config: WebRTCTransportConfig) -> Self {
        Self {
            media_config,
            transport_config,
        }
    }

    fn build_api(&self) -> Result<API, Error> {
        let mut codecs = CodecRegistry::default();
        codecs.register_default_codecs()?;

        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut codecs)?;

        let mut setting_engine = SettingEngine::default();
        setting_engine.set_receive_mtu(self.media_config.receive_mtu);
        if !self.transport_config.announced_ips.is_empty() {
            let ips = self
                .transport_config
                .announced_ips
                .iter()
                .map(|ip| ip.to_string())
                .collect();
            setting_engine.set_nat_1to1_ips(ips, RTCIceCandidateType::Host);
        }
        if let Some(range) = &self.transport_config.port_range {
            let ephemeral = EphemeralUDP::new(range.min, range.max).map_err(|err| {
                Error::new_transport(
                    format!("invalid port range {}-{}: {}", range.min, range.max, err),
                    TransportErrorKind::PortRangeError,
                )
            })?;
            setting_engine.set_udp_network(UDPNetwork::Ephemeral(ephemeral));
        }

        Ok(APIBuilder::new()
            .with_media_engine(codecs)
            .with_interceptor_registry(registry)
            .with_setting_engine(setting_engine)
            .build())
    }
}

#[async_trait]
impl MediaEngine for RtcEngine {
    async fn create_peer(
        &self,
        session_id: &str,
    ) -> Result<(Arc<dyn MediaPeer>, mpsc::UnboundedReceiver<PeerEvent>), Error> {
        let api = self.build_api()?;
        let peer_connection = Arc::new(
            api.new_peer_connection(self.transport_config.configuration.clone())
                .await?,
        );
        peer_connection
            .add_transceiver_from_kind(
                self.media_config.codec_type,
                Some(RTCRtpTransceiverInit {
                    direction: RTCRtpTransceiverDirection::Sendrecv,
                    send_encodings: vec![],
                }),
            )
            .await?;

        let (event_sender, event_receiver) = mpsc::unbounded_channel();
        let peer = RtcPeer {
            id: Uuid::new_v4().to_string(),
            session_id: session_id.to_string(),
            peer_connection,
            pending_candidates: Mutex::new(Vec::new()),
            senders: Mutex::new(HashMap::new()),
            closed: CancellationToken::new(),
        };
        peer.peer_hooks(event_sender, self.media_config.pli_interval);

        tracing::debug!("RtcPeer {} for session={} is created", peer.id, session_id);

        Ok((Arc::new(peer), event_receiver))
    }
}

/// This handles [`webrtc::peer_connection::RTCPeerConnection`] methods for one session.
#[derive(Derivative)]
#[derivative(Debug)]
pub struct RtcPeer {
    pub id: String,
    session_id: String,
    peer_connection: Arc<RTCPeerConnection>,
    pending_candidates: Mutex<Vec<RTCIceCandidateInit>>,
    #[derivative(Debug = "ignore")]
    senders: Mutex<HashMap<String, Arc<RTCRtpSender>>>,
    closed: CancellationToken,
}

impl RtcPeer {
    fn peer_hooks(&self, event_sender: mpsc::UnboundedSender<PeerEvent>, pli_interval: Duration) {
        let peer = &self.peer_connection;
        let session_id = self.session_id.clone();

        peer.on_ice_candidate(Box::new(enc!((event_sender, session_id)
            move |candidate: Option<RTCIceCandidate>| {
                Box::pin(enc!((event_sender, session_id) async move {
                    let init = match candidate {
                        Some(candidate) => match candidate.to_json() {
                            Ok(init) => Some(init),
                            Err(err) => {
                                tracing::error!("session={} failed to serialize ICE candidate: {}", session_id, err);
                                return;
                            }
                        },
                        None => None,
                    };
                    let _ = event_sender.send(PeerEvent::IceCandidate(init));
                }))
            }
        )));

        peer.on_peer_connection_state_change(Box::new(enc!((event_sender)
            move |state: RTCPeerConnectionState| {
                let _ = event_sender.send(PeerEvent::ConnectionStateChanged(state));
                Box::pin(async {})
            }
        )));

        peer.on_signaling_state_change(Box::new(enc!((event_sender)
            move |state: RTCSignalingState| {
                let _ = event_sender.send(PeerEvent::SignalingStateChanged(state));
                Box::pin(async {})
            }
        )));

        peer.on_ice_connection_state_change(Box::new(enc!((session_id)
            move |state: RTCIceConnectionState| {
                tracing::debug!("session={} ICE connection state changed: {}", session_id, state);
                Box::pin(async {})
            }
        )));

        let weak_peer = Arc::downgrade(&self.peer_connection);
        let closed = self.closed.clone();
        peer.on_track(Box::new(enc!((event_sender, session_id, weak_peer, closed)
            move |track: Arc<TrackRemote>, _receiver: Arc<RTCRtpReceiver>, _transceiver: Arc<RTCRtpTransceiver>| {
                tracing::info!(
                    "session={} track received: track_id={}, ssrc={}, mime_type={}",
                    session_id,
                    track.id(),
                    track.ssrc(),
                    track.codec().capability.mime_type
                );
                if track.kind() == RTPCodecType::Video {
                    Self::pli_loop(weak_peer.clone(), track.ssrc(), pli_interval, closed.clone());
                }
                let _ = event_sender.send(PeerEvent::TrackReceived(Arc::new(RtcRemoteTrack { track })));
                Box::pin(async {})
            }
        )));
    }

    /// Requests a keyframe from the client every `interval` until the peer goes away.
    fn pli_loop(
        peer: Weak<RTCPeerConnection>,
        media_ssrc: u32,
        interval: Duration,
        closed: CancellationToken,
    ) {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = closed.cancelled() => break,
                    _ = ticker.tick() => {
                        let Some(peer) = peer.upgrade() else {
                            break;
                        };
                        if let Err(err) = peer
                            .write_rtcp(&[Box::new(PictureLossIndication {
                                sender_ssrc: 0,
                                media_ssrc,
                            })])
                            .await
                        {
                            tracing::debug!("PLI loop ssrc={} stopped: {}", media_ssrc, err);
                            break;
                        }
                    }
                }
            }
        });
    }

    /// Reads RTCP for a forwarding sender so its interceptors keep running.
    fn rtcp_drain_loop(sender: Arc<RTCRtpSender>, track_id: String) {
        tokio::spawn(async move {
            while sender.read_rtcp().await.is_ok() {}
            tracing::debug!("RTCP drain for track_id={} finished", track_id);
        });
    }
}

#[async_trait]
impl MediaPeer for RtcPeer {
    fn id(&self) -> &str {
        &self.id
    }

    async fn create_offer(&self) -> Result<RTCSessionDescription, Error> {
        let offer = self.peer_connection.create_offer(None).await?;
        Ok(offer)
    }

    async fn create_answer(&self) -> Result<RTCSessionDescription, Error> {
        let answer = self.peer_connection.create_answer(None).await?;
        Ok(answer)
    }

    async fn set_local_description(
        &self,
        description: RTCSessionDescription,
    ) -> Result<(), Error> {
        self.peer_connection
            .set_local_description(description)
            .await?;
        Ok(())
    }

    async fn set_remote_description(
        &self,
        description: RTCSessionDescription,
    ) -> Result<(), Error> {
        self.peer_connection
            .set_remote_description(description)
            .await?;

        let pendings = std::mem::take(&mut *self.pending_candidates.lock().await);
        for candidate in pendings {
            tracing::debug!("Adding pending ICE candidate: {:#?}", candidate);
            if let Err(err) = self.peer_connection.add_ice_candidate(candidate).await {
                tracing::error!("failed to add_ice_candidate: {}", err);
            }
        }
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: RTCIceCandidateInit) -> Result<(), Error> {
        if self.peer_connection.remote_description().await.is_some() {
            tracing::debug!("Adding ICE candidate for {:#?}", candidate);
            self.peer_connection.add_ice_candidate(candidate).await?;
        } else {
            tracing::debug!("Pending ICE candidate for {:#?}", candidate);
            self.pending_candidates.lock().await.push(candidate);
        }
        Ok(())
    }

    fn signaling_state(&self) -> RTCSignalingState {
        self.peer_connection.signaling_state()
    }

    async fn add_track(&self, track: Arc<TrackLocalStaticRTP>) -> Result<(), Error> {
        let track_id = track.id().to_string();
        let mut senders = self.senders.lock().await;
        if senders.contains_key(&track_id) {
            return Ok(());
        }
        let sender = self
            .peer_connection
            .add_track(track as Arc<dyn TrackLocal + Send + Sync>)
            .await?;
        Self::rtcp_drain_loop(sender.clone(), track_id.clone());
        senders.insert(track_id, sender);
        Ok(())
    }

    async fn remove_track(&self, track_id: &str) -> Result<bool, Error> {
        let Some(sender) = self.senders.lock().await.remove(track_id) else {
            return Ok(false);
        };
        self.peer_connection.remove_track(&sender).await?;
        Ok(true)
    }

    async fn close(&self) -> Result<(), Error> {
        self.closed.cancel();
        self.peer_connection.close().await?;
        Ok(())
    }
}

impl Drop for RtcPeer {
    fn drop(&mut self) {
        tracing::debug!("RtcPeer {} is dropped", self.id);
    }
}

/// Wraps a received [`TrackRemote`].
#[derive(Debug)]
pub struct RtcRemoteTrack {
    track: Arc<TrackRemote>,
}

#[async_trait]
impl RemoteTrack for RtcRemoteTrack {
    fn id(&self) -> String {
        self.track.id()
    }

    fn capability(&self) -> RTCRtpCodecCapability {
        self.track.codec().capability
    }

    async fn read_rtp(&self) -> Result<Packet, Error> {
        match self.track.read_rtp().await {
            Ok((packet, _attributes)) => Ok(packet),
            Err(err) if is_track_ended(&err) => Err(Error::new_transport(
                format!("track {} ended: {}", self.track.id(), err),
                TransportErrorKind::TrackEndedError,
            )),
            Err(err) => Err(err.into()),
        }
    }
}

fn is_track_ended(err: &webrtc::Error) -> bool {
    matches!(
        err,
        webrtc::Error::ErrDataChannelNotOpen
            | webrtc::Error::ErrClosedPipe
            | webrtc::Error::Interceptor(webrtc::interceptor::Error::Srtp(
                webrtc_srtp::Error::Util(webrtc_util::Error::ErrBufferClosed)
            ))
    )
}
