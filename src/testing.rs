//! In-memory connections and a scripted media engine for unit tests.
use std::{
    collections::HashMap,
    future::Future,
    pin::Pin,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc, Mutex,
    },
    task::{Context, Poll},
    time::Duration,
};

use async_trait::async_trait;
use futures::{channel::mpsc as stream_mpsc, Sink};
use tokio::{
    sync::{mpsc, Mutex as AsyncMutex},
    time::Sleep,
};
use webrtc::{
    ice_transport::ice_candidate::RTCIceCandidateInit,
    peer_connection::{
        sdp::{sdp_type::RTCSdpType, session_description::RTCSessionDescription},
        signaling_state::RTCSignalingState,
    },
    rtp::packet::Packet,
    rtp_transceiver::rtp_codec::RTCRtpCodecCapability,
    track::track_local::{track_local_static_rtp::TrackLocalStaticRTP, TrackLocal},
};

use crate::{
    channel::{ChannelHandler, Frame},
    engine::{MediaEngine, MediaPeer, PeerEvent, RemoteTrack},
    error::{ChannelErrorKind, Error, TransportErrorKind},
    message::SignalingMessage,
};

pub type Reader = stream_mpsc::UnboundedReceiver<Result<Frame, Error>>;

/// Polls `condition` until it holds, panicking after a few seconds.
pub async fn wait_until<F: Fn() -> bool>(condition: F) {
    for _ in 0..1000 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition was not met in time");
}

/// Returns the client side of a connection plus the reader and writer a channel takes ownership of.
pub fn connection() -> (Client, Reader, Wire) {
    connection_with(WireMode::Ready)
}

/// Same as [`connection`], with the outbound half behaving as `mode` says.
pub fn connection_with(mode: WireMode) -> (Client, Reader, Wire) {
    let (inbound, reader) = stream_mpsc::unbounded();
    let wire = Wire {
        state: Arc::default(),
        mode,
        delay: None,
    };
    let client = Client {
        inbound: Mutex::new(Some(inbound)),
        wire: wire.clone(),
    };
    (client, reader, wire)
}

/// What the remote end of a [`connection`] sees and does.
pub struct Client {
    inbound: Mutex<Option<stream_mpsc::UnboundedSender<Result<Frame, Error>>>>,
    wire: Wire,
}

impl Client {
    pub fn send(&self, frame: Frame) {
        if let Some(inbound) = self.inbound.lock().unwrap().as_ref() {
            let _ = inbound.unbounded_send(Ok(frame));
        }
    }

    pub fn send_text(&self, text: &str) {
        self.send(Frame::Text(text.to_string()));
    }

    pub fn send_message(&self, message: &SignalingMessage) {
        self.send_text(&message.encode().unwrap());
    }

    /// Ends the inbound stream as a dropped TCP connection would.
    pub fn hang_up(&self) {
        self.inbound.lock().unwrap().take();
    }

    /// Every frame written so far, in write order.
    pub fn frames(&self) -> Vec<Frame> {
        self.wire.frames()
    }

    pub fn texts(&self) -> Vec<String> {
        self.wire
            .frames()
            .into_iter()
            .filter_map(|frame| match frame {
                Frame::Text(text) => Some(text),
                _ => None,
            })
            .collect()
    }

    pub fn messages(&self) -> Vec<SignalingMessage> {
        self.texts()
            .iter()
            .map(|text| SignalingMessage::parse(text.as_bytes()).unwrap())
            .collect()
    }

    pub fn pings(&self) -> usize {
        self.wire
            .frames()
            .iter()
            .filter(|frame| matches!(frame, Frame::Ping(_)))
            .count()
    }

    pub fn closes(&self) -> usize {
        self.wire.state.closes.load(Ordering::SeqCst)
    }
}

#[derive(Default)]
struct WireState {
    frames: Mutex<Vec<Frame>>,
    closes: AtomicUsize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WireMode {
    Ready,
    /// Every frame takes this long to become writable.
    Delayed(Duration),
    /// Never becomes writable.
    Stalled,
    /// Every write fails.
    Failing,
}

/// Outbound half of a [`connection`]. Records every frame and every close.
pub struct Wire {
    state: Arc<WireState>,
    mode: WireMode,
    delay: Option<Pin<Box<Sleep>>>,
}

impl Clone for Wire {
    fn clone(&self) -> Self {
        Self {
            state: self.state.clone(),
            mode: self.mode,
            delay: None,
        }
    }
}

impl Wire {
    fn frames(&self) -> Vec<Frame> {
        self.state.frames.lock().unwrap().clone()
    }
}

impl Sink<Frame> for Wire {
    type Error = Error;

    fn poll_ready(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Error>> {
        let this = self.get_mut();
        match this.mode {
            WireMode::Ready => Poll::Ready(Ok(())),
            WireMode::Delayed(delay) => {
                let sleep = this
                    .delay
                    .get_or_insert_with(|| Box::pin(tokio::time::sleep(delay)));
                match sleep.as_mut().poll(cx) {
                    Poll::Ready(()) => {
                        this.delay = None;
                        Poll::Ready(Ok(()))
                    }
                    Poll::Pending => Poll::Pending,
                }
            }
            WireMode::Stalled => Poll::Pending,
            WireMode::Failing => Poll::Ready(Err(Error::new_channel(
                "connection reset".to_string(),
                ChannelErrorKind::ConnectionError,
            ))),
        }
    }

    fn start_send(self: Pin<&mut Self>, item: Frame) -> Result<(), Error> {
        self.state.frames.lock().unwrap().push(item);
        Ok(())
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), Error>> {
        Poll::Ready(Ok(()))
    }

    fn poll_close(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), Error>> {
        self.state.closes.fetch_add(1, Ordering::SeqCst);
        Poll::Ready(Ok(()))
    }
}

#[derive(Default)]
pub struct RecordingHandler {
    messages: Mutex<Vec<(String, SignalingMessage)>>,
    disconnects: Mutex<Vec<String>>,
}

impl RecordingHandler {
    pub fn messages(&self) -> Vec<(String, SignalingMessage)> {
        self.messages.lock().unwrap().clone()
    }

    pub fn disconnects(&self) -> usize {
        self.disconnects.lock().unwrap().len()
    }

    pub fn disconnected_ids(&self) -> Vec<String> {
        self.disconnects.lock().unwrap().clone()
    }
}

#[async_trait]
impl ChannelHandler for RecordingHandler {
    async fn on_message(&self, id: &str, message: SignalingMessage) {
        self.messages.lock().unwrap().push((id.to_string(), message));
    }

    async fn on_disconnect(&self, id: &str) {
        self.disconnects.lock().unwrap().push(id.to_string());
    }
}

pub fn description(sdp_type: RTCSdpType, sdp: &str) -> RTCSessionDescription {
    let mut description = RTCSessionDescription::default();
    description.sdp_type = sdp_type;
    description.sdp = sdp.to_string();
    description
}

pub fn opus() -> RTCRtpCodecCapability {
    RTCRtpCodecCapability {
        mime_type: "audio/opus".to_string(),
        clock_rate: 48000,
        channels: 2,
        ..Default::default()
    }
}

/// Engine whose peers follow the offer/answer state machine without any network.
#[derive(Default)]
pub struct MockEngine {
    peers: Mutex<HashMap<String, (Arc<MockPeer>, mpsc::UnboundedSender<PeerEvent>)>>,
    created: AtomicUsize,
    failing: AtomicBool,
}

impl MockEngine {
    /// Makes every following `create_peer` fail.
    pub fn fail(&self) {
        self.failing.store(true, Ordering::SeqCst);
    }

    pub fn created(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }

    /// The most recent peer created for `session_id`.
    pub fn peer(&self, session_id: &str) -> Arc<MockPeer> {
        self.peers.lock().unwrap()[session_id].0.clone()
    }

    pub fn emit(&self, session_id: &str, event: PeerEvent) {
        let sender = self.peers.lock().unwrap()[session_id].1.clone();
        let _ = sender.send(event);
    }
}

#[async_trait]
impl MediaEngine for MockEngine {
    async fn create_peer(
        &self,
        session_id: &str,
    ) -> Result<(Arc<dyn MediaPeer>, mpsc::UnboundedReceiver<PeerEvent>), Error> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(Error::new_transport(
                "engine is unavailable".to_string(),
                TransportErrorKind::PortRangeError,
            ));
        }
        let n = self.created.fetch_add(1, Ordering::SeqCst);
        let peer = Arc::new(MockPeer::new(format!("{}-{}", session_id, n)));
        let (sender, receiver) = mpsc::unbounded_channel();
        self.peers
            .lock()
            .unwrap()
            .insert(session_id.to_string(), (peer.clone(), sender));
        Ok((peer, receiver))
    }
}

pub struct MockPeer {
    id: String,
    state: Mutex<RTCSignalingState>,
    has_remote: AtomicBool,
    candidates: Mutex<Vec<RTCIceCandidateInit>>,
    pending: Mutex<Vec<RTCIceCandidateInit>>,
    tracks: Mutex<Vec<String>>,
    offers: AtomicUsize,
    closed: AtomicBool,
    add_track_hook: Mutex<Option<Box<dyn FnOnce() + Send>>>,
}

impl MockPeer {
    fn new(id: String) -> Self {
        Self {
            id,
            state: Mutex::new(RTCSignalingState::Stable),
            has_remote: AtomicBool::new(false),
            candidates: Mutex::new(Vec::new()),
            pending: Mutex::new(Vec::new()),
            tracks: Mutex::new(Vec::new()),
            offers: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
            add_track_hook: Mutex::new(None),
        }
    }

    pub fn state(&self) -> RTCSignalingState {
        *self.state.lock().unwrap()
    }

    pub fn tracks(&self) -> Vec<String> {
        self.tracks.lock().unwrap().clone()
    }

    /// Runs `hook` once, at the start of the next `add_track`.
    pub fn before_add_track(&self, hook: Box<dyn FnOnce() + Send>) {
        *self.add_track_hook.lock().unwrap() = Some(hook);
    }

    pub fn candidates(&self) -> Vec<RTCIceCandidateInit> {
        self.candidates.lock().unwrap().clone()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn transition(&self, from: RTCSignalingState, to: RTCSignalingState) -> Result<(), Error> {
        let mut state = self.state.lock().unwrap();
        if *state != from {
            return Err(Error::new_transport(
                format!("signaling state is {}, expected {}", *state, from),
                TransportErrorKind::SignalingStateInvalidError,
            ));
        }
        *state = to;
        Ok(())
    }
}

#[async_trait]
impl MediaPeer for MockPeer {
    fn id(&self) -> &str {
        &self.id
    }

    async fn create_offer(&self) -> Result<RTCSessionDescription, Error> {
        if self.is_closed() {
            return Err(webrtc::Error::ErrConnectionClosed.into());
        }
        let n = self.offers.fetch_add(1, Ordering::SeqCst);
        Ok(description(
            RTCSdpType::Offer,
            &format!("offer {} from {} tracks={:?}", n, self.id, self.tracks()),
        ))
    }

    async fn create_answer(&self) -> Result<RTCSessionDescription, Error> {
        if self.state() != RTCSignalingState::HaveRemoteOffer {
            return Err(Error::new_transport(
                "no remote offer to answer".to_string(),
                TransportErrorKind::SignalingStateInvalidError,
            ));
        }
        Ok(description(
            RTCSdpType::Answer,
            &format!("answer from {}", self.id),
        ))
    }

    async fn set_local_description(
        &self,
        description: RTCSessionDescription,
    ) -> Result<(), Error> {
        match description.sdp_type {
            RTCSdpType::Offer => self.transition(
                RTCSignalingState::Stable,
                RTCSignalingState::HaveLocalOffer,
            ),
            RTCSdpType::Answer => self.transition(
                RTCSignalingState::HaveRemoteOffer,
                RTCSignalingState::Stable,
            ),
            _ => Err(Error::new_transport(
                format!("unsupported local description {}", description.sdp_type),
                TransportErrorKind::LocalDescriptionError,
            )),
        }
    }

    async fn set_remote_description(
        &self,
        description: RTCSessionDescription,
    ) -> Result<(), Error> {
        match description.sdp_type {
            RTCSdpType::Offer => self.transition(
                RTCSignalingState::Stable,
                RTCSignalingState::HaveRemoteOffer,
            )?,
            RTCSdpType::Answer => self.transition(
                RTCSignalingState::HaveLocalOffer,
                RTCSignalingState::Stable,
            )?,
            _ => {
                return Err(Error::new_transport(
                    format!("unsupported remote description {}", description.sdp_type),
                    TransportErrorKind::SignalingStateInvalidError,
                ))
            }
        }
        self.has_remote.store(true, Ordering::SeqCst);
        let pending = std::mem::take(&mut *self.pending.lock().unwrap());
        self.candidates.lock().unwrap().extend(pending);
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: RTCIceCandidateInit) -> Result<(), Error> {
        if self.has_remote.load(Ordering::SeqCst) {
            self.candidates.lock().unwrap().push(candidate);
        } else {
            self.pending.lock().unwrap().push(candidate);
        }
        Ok(())
    }

    fn signaling_state(&self) -> RTCSignalingState {
        self.state()
    }

    async fn add_track(&self, track: Arc<TrackLocalStaticRTP>) -> Result<(), Error> {
        let hook = self.add_track_hook.lock().unwrap().take();
        if let Some(hook) = hook {
            hook();
        }
        let mut tracks = self.tracks.lock().unwrap();
        if !tracks.iter().any(|id| id == track.id()) {
            tracks.push(track.id().to_string());
        }
        Ok(())
    }

    async fn remove_track(&self, track_id: &str) -> Result<bool, Error> {
        let mut tracks = self.tracks.lock().unwrap();
        let before = tracks.len();
        tracks.retain(|id| id != track_id);
        Ok(tracks.len() != before)
    }

    async fn close(&self) -> Result<(), Error> {
        self.closed.store(true, Ordering::SeqCst);
        *self.state.lock().unwrap() = RTCSignalingState::Closed;
        Ok(())
    }
}

/// Remote track fed by the test through the returned sender. Dropping the sender ends the track.
pub struct MockRemoteTrack {
    id: String,
    packets: AsyncMutex<mpsc::UnboundedReceiver<Packet>>,
}

impl MockRemoteTrack {
    pub fn new(id: &str) -> (Arc<Self>, mpsc::UnboundedSender<Packet>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        let track = Arc::new(Self {
            id: id.to_string(),
            packets: AsyncMutex::new(receiver),
        });
        (track, sender)
    }
}

#[async_trait]
impl RemoteTrack for MockRemoteTrack {
    fn id(&self) -> String {
        self.id.clone()
    }

    fn capability(&self) -> RTCRtpCodecCapability {
        opus()
    }

    async fn read_rtp(&self) -> Result<Packet, Error> {
        match self.packets.lock().await.recv().await {
            Some(packet) => Ok(packet),
            None => Err(Error::new_transport(
                format!("track {} ended", self.id),
                TransportErrorKind::TrackEndedError,
            )),
        }
    }
}
