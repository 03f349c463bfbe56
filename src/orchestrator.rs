use std::sync::{Arc, Weak};

use async_trait::async_trait;
use derivative::Derivative;
use futures::{Sink, Stream};
use tokio::sync::{mpsc, OwnedMutexGuard};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;
use webrtc::{
    ice_transport::ice_candidate::RTCIceCandidateInit,
    peer_connection::{
        peer_connection_state::RTCPeerConnectionState,
        sdp::session_description::RTCSessionDescription, signaling_state::RTCSignalingState,
    },
    track::track_local::{track_local_static_rtp::TrackLocalStaticRTP, TrackLocalWriter},
};

use crate::{
    channel::{ChannelHandler, Frame, SignalingChannel},
    config::OrchestratorConfig,
    engine::{MediaEngine, MediaPeer, PeerEvent, RemoteTrack},
    error::{Error, SessionErrorKind, TransportErrorKind},
    message::{MessageType, SignalingMessage},
    registry::{Session, SessionRegistry},
};

/// MediaOrchestrator owns the sessions of one call. Every session gets a media peer,
/// and the media received from each session is forwarded to all the others.
#[derive(Derivative)]
#[derivative(Debug)]
pub struct MediaOrchestrator {
    pub id: String,
    #[derivative(Debug = "ignore")]
    engine: Arc<dyn MediaEngine>,
    registry: SessionRegistry,
    config: OrchestratorConfig,
}

impl MediaOrchestrator {
    pub fn new(engine: Arc<dyn MediaEngine>, config: OrchestratorConfig) -> Arc<Self> {
        let id = Uuid::new_v4().to_string();
        tracing::debug!("MediaOrchestrator {} is created", id);
        Arc::new(Self {
            id,
            engine,
            registry: SessionRegistry::new(),
            config,
        })
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    /// Wraps an accepted connection of session `id` in a [`SignalingChannel`], creates the
    /// session's media peer and sends the first offer. A live session with the same id is replaced.
    pub async fn accept<R, W>(self: &Arc<Self>, id: &str, reader: R, writer: W) -> SignalingChannel
    where
        R: Stream<Item = Result<Frame, Error>> + Send + 'static,
        W: Sink<Frame, Error = Error> + Send + 'static,
    {
        let connection_id = Uuid::new_v4().to_string();
        // Held until the session is registered, so early messages wait for the peer.
        let guard = self.registry.lock(id).await;

        let handler = Arc::new(SessionHandler {
            orchestrator: Arc::downgrade(self),
            connection_id: connection_id.clone(),
        });
        let channel = SignalingChannel::new(
            id.to_string(),
            reader,
            writer,
            self.config.channel.clone(),
            handler,
        );

        self.on_session_connected(guard, id, connection_id, channel.clone())
            .await;
        channel
    }

    async fn on_session_connected(
        self: &Arc<Self>,
        guard: OwnedMutexGuard<()>,
        id: &str,
        connection_id: String,
        channel: SignalingChannel,
    ) {
        if let Some(previous) = self.registry.get(id) {
            tracing::info!(
                "session={} reconnected, replacing connection={}",
                id,
                previous.connection_id
            );
            self.registry
                .remove_if_connection(id, &previous.connection_id);
            self.teardown(previous).await;
        }

        let (peer, events) = match self.engine.create_peer(id).await {
            Ok((peer, events)) => (Some(peer), Some(events)),
            Err(err) => {
                tracing::error!("session={} failed to create media peer: {}", id, err);
                (None, None)
            }
        };

        let session = Arc::new(Session::new(
            id.to_string(),
            connection_id,
            channel,
            peer,
        ));
        self.registry.insert(session.clone());

        if let Some(events) = events {
            self.spawn_event_loop(session.clone(), events);
            if let Err(err) = self.send_offer(&session).await {
                tracing::error!("session={} failed to send initial offer: {}", id, err);
            }
        }

        self.registry.release(id, guard);
    }

    async fn on_message(&self, id: &str, connection_id: &str, message: SignalingMessage) {
        let guard = self.registry.lock(id).await;
        let session = self.registry.get(id);
        self.registry.release(id, guard);

        let Some(session) = session.filter(|session| session.connection_id == connection_id)
        else {
            tracing::error!("session={} is not found, dropping {} message", id, message.kind);
            return;
        };
        let Some(peer) = session.peer.clone() else {
            tracing::error!("session={} has no media peer, dropping {} message", id, message.kind);
            return;
        };

        let kind = message.kind;
        let result = match kind {
            MessageType::IceCandidate => Self::handle_ice_candidate(peer.as_ref(), &message).await,
            MessageType::Offer => Self::handle_offer(&session, peer.as_ref(), &message).await,
            MessageType::Answer => Self::handle_answer(peer.as_ref(), &message).await,
            MessageType::OfferRequest => self.handle_offer_request(&session, peer.as_ref()).await,
        };
        if let Err(err) = result {
            tracing::error!("session={} failed to handle {} message: {}", id, kind, err);
        }
    }

    async fn handle_ice_candidate(
        peer: &dyn MediaPeer,
        message: &SignalingMessage,
    ) -> Result<(), Error> {
        let candidate: RTCIceCandidateInit = message.decode()?;
        peer.add_ice_candidate(candidate).await
    }

    async fn handle_offer(
        session: &Session,
        peer: &dyn MediaPeer,
        message: &SignalingMessage,
    ) -> Result<(), Error> {
        let offer: RTCSessionDescription = message.decode()?;
        peer.set_remote_description(offer).await?;
        let answer = peer.create_answer().await?;
        peer.set_local_description(answer.clone()).await?;
        let message = SignalingMessage::new(MessageType::Answer, &answer)?;
        session.channel.send(&message).await;
        Ok(())
    }

    async fn handle_answer(peer: &dyn MediaPeer, message: &SignalingMessage) -> Result<(), Error> {
        let answer: RTCSessionDescription = message.decode()?;
        peer.set_remote_description(answer).await
    }

    async fn handle_offer_request(&self, session: &Session, peer: &dyn MediaPeer) -> Result<(), Error> {
        tokio::time::sleep(self.config.offer_request_grace).await;
        let state = peer.signaling_state();
        if state != RTCSignalingState::Stable {
            tracing::warn!(
                "session={} rejected offer request, signaling state is {}",
                session.id,
                state
            );
            return Ok(());
        }
        self.send_offer(session).await
    }

    /// Creates a fresh offer for the session's peer and sends it to its client.
    async fn send_offer(&self, session: &Session) -> Result<(), Error> {
        let peer = session.peer.as_ref().ok_or_else(|| {
            Error::new_session(
                format!("session {} has no media peer", session.id),
                SessionErrorKind::PeerNotFoundError,
            )
        })?;
        let offer = peer.create_offer().await?;
        peer.set_local_description(offer.clone()).await?;
        let message = SignalingMessage::new(MessageType::Offer, &offer)?;
        session.channel.send(&message).await;
        tracing::debug!("session={} offer sent", session.id);
        Ok(())
    }

    async fn renegotiate(&self, session: &Session) {
        if let Err(err) = self.send_offer(session).await {
            tracing::error!("session={} failed to renegotiate: {}", session.id, err);
        }
    }

    fn spawn_event_loop(
        self: &Arc<Self>,
        session: Arc<Session>,
        mut events: mpsc::UnboundedReceiver<PeerEvent>,
    ) {
        let orchestrator = Arc::downgrade(self);
        let closed = session.close_token();
        tokio::spawn(async move {
            tracing::debug!("session={} event loop started", session.id);
            loop {
                let event = tokio::select! {
                    _ = closed.cancelled() => break,
                    event = events.recv() => match event {
                        Some(event) => event,
                        None => break,
                    },
                };
                let Some(orchestrator) = orchestrator.upgrade() else {
                    break;
                };
                orchestrator.peer_event(&session, event).await;
            }
            tracing::debug!("session={} event loop finished", session.id);
        });
    }

    async fn peer_event(&self, session: &Arc<Session>, event: PeerEvent) {
        match event {
            PeerEvent::IceCandidate(Some(candidate)) if !candidate.candidate.is_empty() => {
                match SignalingMessage::new(MessageType::IceCandidate, &candidate) {
                    Ok(message) => session.channel.send(&message).await,
                    Err(err) => {
                        tracing::error!("session={} failed to encode candidate: {}", session.id, err)
                    }
                }
            }
            PeerEvent::IceCandidate(_) => {
                tracing::trace!("session={} ICE gathering finished", session.id);
            }
            PeerEvent::ConnectionStateChanged(state) => {
                tracing::info!("session={} connection state changed: {}", session.id, state);
                match state {
                    RTCPeerConnectionState::Connected => self.on_connected(session).await,
                    RTCPeerConnectionState::Failed | RTCPeerConnectionState::Disconnected => {
                        tracing::warn!("session={} media connection is {}", session.id, state);
                    }
                    _ => {}
                }
            }
            PeerEvent::SignalingStateChanged(state) => {
                tracing::debug!("session={} signaling state changed: {}", session.id, state);
            }
            PeerEvent::TrackReceived(track) => self.on_track(session, track).await,
        }
    }

    /// Attaches every other session's track to the connected peer and its own track to
    /// every other peer, then renegotiates each peer that gained a track.
    async fn on_connected(&self, session: &Arc<Session>) {
        let others = self.registry.others(&session.id);

        let mut gained = false;
        for other in &others {
            if let Some(track) = other.outbound_track().await {
                gained |= self.attach_track(other, &track, session).await;
            }
        }
        if gained {
            self.renegotiate(session).await;
        }

        if let Some(track) = session.outbound_track().await {
            for other in &others {
                if self.attach_track(session, &track, other).await {
                    self.renegotiate(other).await;
                }
            }
        }
    }

    async fn on_track(&self, session: &Arc<Session>, remote: Arc<dyn RemoteTrack>) {
        let track = Arc::new(TrackLocalStaticRTP::new(
            remote.capability(),
            session.id.clone(),
            session.id.clone(),
        ));
        if !session.set_outbound_track(track.clone()).await {
            tracing::warn!(
                "session={} already forwards a track, ignoring track_id={}",
                session.id,
                remote.id()
            );
            return;
        }

        for other in self.registry.others(&session.id) {
            if self.attach_track(session, &track, &other).await {
                self.renegotiate(&other).await;
            }
        }

        let session_id = session.id.clone();
        let closed = session.close_token();
        tokio::spawn(async move {
            Self::forward_loop(session_id, remote, track, closed).await;
        });
    }

    /// Attaches the track of session `owner` to `target`. Returns true when the peer gained it.
    /// Nothing stays attached once `owner` is torn down.
    async fn attach_track(
        &self,
        owner: &Session,
        track: &Arc<TrackLocalStaticRTP>,
        target: &Session,
    ) -> bool {
        let Some(peer) = &target.peer else {
            return false;
        };
        if owner.is_closed() || target.is_closed() || !target.mark_attached(&owner.id).await {
            return false;
        }
        if let Err(err) = peer.add_track(track.clone()).await {
            target.unmark_attached(&owner.id).await;
            tracing::error!(
                "failed to attach track of session={} to session={}: {}",
                owner.id,
                target.id,
                err
            );
            return false;
        }

        // Teardown may have passed over the target while the track was being added.
        if owner.is_closed() {
            target.unmark_attached(&owner.id).await;
            if let Err(err) = peer.remove_track(&owner.id).await {
                tracing::warn!(
                    "failed to detach track of session={} from session={}: {}",
                    owner.id,
                    target.id,
                    err
                );
            }
            tracing::debug!(
                "session={} closed while its track was attached to session={}",
                owner.id,
                target.id
            );
            return false;
        }
        tracing::debug!("track of session={} attached to session={}", owner.id, target.id);
        true
    }

    async fn forward_loop(
        session_id: String,
        remote: Arc<dyn RemoteTrack>,
        track: Arc<TrackLocalStaticRTP>,
        closed: CancellationToken,
    ) {
        tracing::debug!(
            "session={} forwarding track_id={} has started",
            session_id,
            remote.id()
        );
        loop {
            let packet = tokio::select! {
                _ = closed.cancelled() => break,
                packet = remote.read_rtp() => packet,
            };
            match packet {
                Ok(packet) => {
                    if let Err(err) = track.write_rtp(&packet).await {
                        tracing::debug!("session={} failed to write rtp: {}", session_id, err);
                    }
                }
                Err(err) if err.transport_kind() == Some(&TransportErrorKind::TrackEndedError) => {
                    tracing::debug!("session={} {}", session_id, err);
                    break;
                }
                Err(err) => {
                    tracing::warn!("session={} failed to read rtp: {}", session_id, err);
                    break;
                }
            }
        }
        tracing::debug!("session={} forwarding has finished", session_id);
    }

    async fn on_disconnect(&self, id: &str, connection_id: &str) {
        let guard = self.registry.lock(id).await;
        match self.registry.remove_if_connection(id, connection_id) {
            Some(session) => {
                tracing::info!("session={} disconnected", id);
                self.teardown(session).await;
            }
            None => {
                tracing::debug!("session={} connection={} is already gone", id, connection_id);
            }
        }
        self.registry.release(id, guard);
    }

    /// Releases everything of a session that is no longer registered.
    async fn teardown(&self, session: Arc<Session>) {
        session.close_token().cancel();
        session.channel.close();
        if let Some(peer) = &session.peer {
            if let Err(err) = peer.close().await {
                tracing::warn!("session={} failed to close media peer: {}", session.id, err);
            }
        }

        for other in self.registry.others(&session.id) {
            if !other.unmark_attached(&session.id).await {
                continue;
            }
            let Some(peer) = &other.peer else {
                continue;
            };
            match peer.remove_track(&session.id).await {
                Ok(true) => self.renegotiate(&other).await,
                Ok(false) => {}
                Err(err) => {
                    tracing::warn!(
                        "failed to detach track of session={} from session={}: {}",
                        session.id,
                        other.id,
                        err
                    );
                }
            }
        }
    }
}

impl Drop for MediaOrchestrator {
    fn drop(&mut self) {
        tracing::debug!("MediaOrchestrator {} is dropped", self.id);
    }
}

/// Routes the callbacks of one connection to the orchestrator.
struct SessionHandler {
    orchestrator: Weak<MediaOrchestrator>,
    connection_id: String,
}

#[async_trait]
impl ChannelHandler for SessionHandler {
    async fn on_message(&self, id: &str, message: SignalingMessage) {
        if let Some(orchestrator) = self.orchestrator.upgrade() {
            orchestrator
                .on_message(id, &self.connection_id, message)
                .await;
        }
    }

    async fn on_disconnect(&self, id: &str) {
        if let Some(orchestrator) = self.orchestrator.upgrade() {
            orchestrator.on_disconnect(id, &self.connection_id).await;
        }
    }
}
