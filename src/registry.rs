use std::{collections::HashSet, sync::Arc};

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio_util::sync::CancellationToken;
use webrtc::track::track_local::track_local_static_rtp::TrackLocalStaticRTP;

use crate::{channel::SignalingChannel, engine::MediaPeer};

/// Everything registered for one session id.
pub struct Session {
    pub id: String,
    /// Distinguishes this connection from earlier ones that used the same id.
    pub connection_id: String,
    pub channel: SignalingChannel,
    /// `None` when the media peer could not be created.
    pub peer: Option<Arc<dyn MediaPeer>>,
    outbound_track: Mutex<Option<Arc<TrackLocalStaticRTP>>>,
    /// Ids of the sessions whose outbound track is attached to this peer.
    attached: Mutex<HashSet<String>>,
    closed: CancellationToken,
}

impl Session {
    pub fn new(
        id: String,
        connection_id: String,
        channel: SignalingChannel,
        peer: Option<Arc<dyn MediaPeer>>,
    ) -> Self {
        tracing::debug!("Session id={} connection={} is created", id, connection_id);
        Self {
            id,
            connection_id,
            channel,
            peer,
            outbound_track: Mutex::new(None),
            attached: Mutex::new(HashSet::new()),
            closed: CancellationToken::new(),
        }
    }

    pub async fn outbound_track(&self) -> Option<Arc<TrackLocalStaticRTP>> {
        self.outbound_track.lock().await.clone()
    }

    /// Stores the track carrying this session's media. Returns false when one was already set.
    pub async fn set_outbound_track(&self, track: Arc<TrackLocalStaticRTP>) -> bool {
        let mut current = self.outbound_track.lock().await;
        if current.is_some() {
            return false;
        }
        *current = Some(track);
        true
    }

    /// Records that the track of `owner` is attached to this peer. Returns false when it already was.
    pub async fn mark_attached(&self, owner: &str) -> bool {
        self.attached.lock().await.insert(owner.to_string())
    }

    /// Forgets that the track of `owner` is attached. Returns false when it was not.
    pub async fn unmark_attached(&self, owner: &str) -> bool {
        self.attached.lock().await.remove(owner)
    }

    pub async fn is_attached(&self, owner: &str) -> bool {
        self.attached.lock().await.contains(owner)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    pub(crate) fn close_token(&self) -> CancellationToken {
        self.closed.clone()
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("connection_id", &self.connection_id)
            .field("has_peer", &self.peer.is_some())
            .finish()
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        tracing::debug!("Session id={} connection={} is dropped", self.id, self.connection_id);
    }
}

/// Concurrent map of the live sessions. Lookups never take a global lock.
#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: DashMap<String, Arc<Session>>,
    locks: DashMap<String, Arc<Mutex<()>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Serializes creation and teardown of one session id.
    pub async fn lock(&self, id: &str) -> OwnedMutexGuard<()> {
        let lock = self
            .locks
            .entry(id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        lock.lock_owned().await
    }

    /// Drops the lock entry of `id` when nobody else holds or waits for it.
    pub fn release(&self, id: &str, guard: OwnedMutexGuard<()>) {
        drop(guard);
        self.locks
            .remove_if(id, |_, lock| Arc::strong_count(lock) == 1);
    }

    /// Registers `session`, returning the session it replaced.
    pub fn insert(&self, session: Arc<Session>) -> Option<Arc<Session>> {
        self.sessions.insert(session.id.clone(), session)
    }

    pub fn get(&self, id: &str) -> Option<Arc<Session>> {
        self.sessions.get(id).map(|entry| entry.value().clone())
    }

    /// Removes the session of `id` only if it belongs to `connection_id`.
    pub fn remove_if_connection(&self, id: &str, connection_id: &str) -> Option<Arc<Session>> {
        self.sessions
            .remove_if(id, |_, session| session.connection_id == connection_id)
            .map(|(_, session)| session)
    }

    /// Snapshot of every session except `id`.
    pub fn others(&self, id: &str) -> Vec<Arc<Session>> {
        self.sessions
            .iter()
            .filter(|entry| entry.key() != id)
            .map(|entry| entry.value().clone())
            .collect()
    }

    pub fn channel(&self, id: &str) -> Option<SignalingChannel> {
        self.get(id).map(|session| session.channel.clone())
    }

    pub fn peer(&self, id: &str) -> Option<Arc<dyn MediaPeer>> {
        self.get(id).and_then(|session| session.peer.clone())
    }

    pub async fn outbound_track(&self, id: &str) -> Option<Arc<TrackLocalStaticRTP>> {
        match self.get(id) {
            Some(session) => session.outbound_track().await,
            None => None,
        }
    }

    pub fn ids(&self) -> Vec<String> {
        self.sessions.iter().map(|entry| entry.key().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}
