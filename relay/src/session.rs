//! Relay session management.
//!
//! A session is the bookkeeping for one open client stream: its reply queue,
//! the credential and backend captured when the stream was opened, and its
//! activity timestamps. The [`SessionRegistry`] is the single owner of all
//! sessions; other components look sessions up by id and go back through the
//! registry whenever they resume after awaiting something.

use mcp_relay_types::JsonRpcResponse;
use parking_lot::Mutex;
use reqwest::Url;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Notify, RwLock};
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::auth::AuthContext;

/// Session identifier handed to the client inside the submission address.
pub type SessionId = String;

/// Lifecycle state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Stream attached, submissions accepted
    Open,
    /// Teardown started, in-flight replies may still be queued
    Draining,
    /// Channel released, no longer registered
    Closed,
}

/// Why a session was closed. Logged so that evictions can be told apart from
/// client disconnects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// The stream went away (client closed it or a write failed)
    ClientDisconnected,
    /// The client asked for the session to be terminated
    ClientRequested,
    /// No activity for longer than the idle threshold
    IdleTimeout,
    /// The relay is shutting down
    Shutdown,
}

impl CloseReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ClientDisconnected => "client_disconnected",
            Self::ClientRequested => "client_requested",
            Self::IdleTimeout => "idle_timeout",
            Self::Shutdown => "shutdown",
        }
    }
}

/// A serialized reply waiting to be written to a session's stream.
#[derive(Debug, Clone)]
pub struct OutboundMessage {
    payload: String,
}

impl OutboundMessage {
    pub fn from_response(response: &JsonRpcResponse) -> serde_json::Result<Self> {
        Ok(Self {
            payload: serde_json::to_string(response)?,
        })
    }

    pub fn payload(&self) -> &str {
        &self.payload
    }

    pub fn into_payload(self) -> String {
        self.payload
    }
}

struct Lifecycle {
    state: SessionState,
    sender: Option<mpsc::UnboundedSender<OutboundMessage>>,
}

/// A relay session.
pub struct Session {
    id: SessionId,
    auth: AuthContext,
    backend_url: Url,
    created_at: Instant,
    last_activity: Mutex<Instant>,
    lifecycle: Mutex<Lifecycle>,
    in_flight: AtomicUsize,
    /// Signalled whenever `in_flight` drops to zero
    idle: Notify,
}

impl Session {
    fn new(
        id: SessionId,
        auth: AuthContext,
        backend_url: Url,
        sender: mpsc::UnboundedSender<OutboundMessage>,
    ) -> Self {
        let now = Instant::now();
        Self {
            id,
            auth,
            backend_url,
            created_at: now,
            last_activity: Mutex::new(now),
            lifecycle: Mutex::new(Lifecycle {
                state: SessionState::Open,
                sender: Some(sender),
            }),
            in_flight: AtomicUsize::new(0),
            idle: Notify::new(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn auth(&self) -> &AuthContext {
        &self.auth
    }

    pub fn backend_url(&self) -> &Url {
        &self.backend_url
    }

    /// Get the session age.
    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    /// Time since the last submission or delivered reply.
    pub fn idle_for(&self) -> Duration {
        self.last_activity.lock().elapsed()
    }

    pub fn touch(&self) {
        *self.last_activity.lock() = Instant::now();
    }

    pub fn state(&self) -> SessionState {
        self.lifecycle.lock().state
    }

    pub fn is_open(&self) -> bool {
        self.state() == SessionState::Open
    }

    /// Requests accepted for this session that have not been answered yet.
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Queue a reply. Fails once the session is closed.
    fn enqueue(&self, message: OutboundMessage) -> bool {
        let lifecycle = self.lifecycle.lock();
        if lifecycle.state == SessionState::Closed {
            return false;
        }
        match &lifecycle.sender {
            Some(sender) => sender.send(message).is_ok(),
            None => false,
        }
    }

    fn begin_draining(&self) -> bool {
        let mut lifecycle = self.lifecycle.lock();
        if lifecycle.state == SessionState::Open {
            lifecycle.state = SessionState::Draining;
            true
        } else {
            false
        }
    }

    /// Mark closed and release the channel. Messages already queued stay
    /// readable by the stream until it drains them.
    fn close(&self) {
        let mut lifecycle = self.lifecycle.lock();
        lifecycle.state = SessionState::Closed;
        lifecycle.sender.take();
    }

    /// Wait until no requests are in flight, or the grace period runs out.
    async fn wait_idle(&self, grace: Duration) -> bool {
        let drained = async {
            loop {
                let notified = self.idle.notified();
                if self.in_flight() == 0 {
                    return;
                }
                notified.await;
            }
        };
        tokio::time::timeout(grace, drained).await.is_ok()
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("auth", &self.auth)
            .field("backend_url", &self.backend_url.as_str())
            .field("state", &self.state())
            .field("in_flight", &self.in_flight())
            .finish()
    }
}

/// Keeps a request counted as in flight until dropped.
///
/// Dropping it (reply queued, or the dispatch task cancelled) decrements the
/// per-session and relay-wide counters.
pub struct InFlightGuard {
    session: Arc<Session>,
    total: Arc<RegistryInner>,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.total.in_flight.fetch_sub(1, Ordering::SeqCst);
        if self.session.in_flight.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.session.idle.notify_waiters();
        }
    }
}

#[derive(Default)]
struct RegistryInner {
    sessions: RwLock<HashMap<SessionId, Arc<Session>>>,
    /// Mirrors `sessions.len()`, readable without the lock
    active: AtomicUsize,
    in_flight: AtomicUsize,
}

/// Registry of relay sessions.
#[derive(Clone, Default)]
pub struct SessionRegistry {
    inner: Arc<RegistryInner>,
}

impl SessionRegistry {
    /// Create a new session registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a new open session.
    ///
    /// Returns the session and the receiving end of its reply channel. The
    /// caller becomes the only reader of that channel.
    pub async fn create(
        &self,
        auth: AuthContext,
        backend_url: Url,
    ) -> (Arc<Session>, mpsc::UnboundedReceiver<OutboundMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut sessions = self.inner.sessions.write().await;

        let id = loop {
            let candidate = Uuid::new_v4().to_string();
            if !sessions.contains_key(&candidate) {
                break candidate;
            }
        };

        let session = Arc::new(Session::new(id.clone(), auth, backend_url, tx));
        sessions.insert(id.clone(), session.clone());
        self.inner.active.fetch_add(1, Ordering::SeqCst);
        drop(sessions);

        info!(
            session_id = %id,
            backend = %session.backend_url,
            auth = session.auth.kind(),
            "Created relay session"
        );
        (session, rx)
    }

    /// Get a session by ID, whatever its state.
    pub async fn get(&self, id: &str) -> Option<Arc<Session>> {
        let sessions = self.inner.sessions.read().await;
        sessions.get(id).cloned()
    }

    /// Get a session only if it still accepts submissions.
    pub async fn get_open(&self, id: &str) -> Option<Arc<Session>> {
        self.get(id).await.filter(|session| session.is_open())
    }

    /// Record activity on a session. No-op for unknown ids.
    pub async fn touch(&self, id: &str) {
        if let Some(session) = self.get(id).await {
            session.touch();
        }
    }

    /// Queue a reply for the session's stream.
    ///
    /// Returns `false` and discards the reply if the session is gone.
    pub async fn deliver(&self, id: &str, response: JsonRpcResponse) -> bool {
        let Some(session) = self.get(id).await else {
            debug!(session_id = %id, "Discarding reply for closed session");
            return false;
        };

        let message = match OutboundMessage::from_response(&response) {
            Ok(message) => message,
            Err(e) => {
                warn!(session_id = %id, "Failed to serialize reply: {}", e);
                return false;
            }
        };

        let queued = session.enqueue(message);
        if !queued {
            debug!(session_id = %id, "Discarding reply, session channel released");
        }
        queued
    }

    /// Count a request as in flight until the returned guard is dropped.
    pub fn track_request(&self, session: &Arc<Session>) -> InFlightGuard {
        session.in_flight.fetch_add(1, Ordering::SeqCst);
        self.inner.in_flight.fetch_add(1, Ordering::SeqCst);
        InFlightGuard {
            session: session.clone(),
            total: self.inner.clone(),
        }
    }

    /// Stop accepting submissions for a session. Replies can still be queued.
    pub async fn begin_draining(&self, id: &str) -> bool {
        match self.get(id).await {
            Some(session) => session.begin_draining(),
            None => false,
        }
    }

    /// Close and unregister a session.
    ///
    /// Idempotent: removing an unknown or already removed id returns `false`.
    pub async fn remove(&self, id: &str, reason: CloseReason) -> bool {
        let removed = {
            let mut sessions = self.inner.sessions.write().await;
            let removed = sessions.remove(id);
            if removed.is_some() {
                self.inner.active.fetch_sub(1, Ordering::SeqCst);
            }
            removed
        };

        match removed {
            Some(session) => {
                session.close();
                info!(
                    session_id = %id,
                    reason = reason.as_str(),
                    age_secs = session.age().as_secs(),
                    "Closed relay session"
                );
                true
            }
            None => {
                debug!(session_id = %id, reason = reason.as_str(), "Session already closed");
                false
            }
        }
    }

    /// Tear a session down after its stream went away.
    ///
    /// The session stops accepting submissions, in-flight requests get up to
    /// `grace` to finish, then the session is removed.
    pub async fn close_after_drain(&self, id: &str, grace: Duration, reason: CloseReason) {
        let Some(session) = self.get(id).await else {
            return;
        };

        session.begin_draining();
        if session.in_flight() > 0 {
            debug!(
                session_id = %id,
                in_flight = session.in_flight(),
                "Waiting for in-flight requests before closing"
            );
            if !session.wait_idle(grace).await {
                warn!(
                    session_id = %id,
                    in_flight = session.in_flight(),
                    "Drain grace period expired, discarding pending replies"
                );
            }
        }
        drop(session);

        self.remove(id, reason).await;
    }

    /// Snapshot of every registered session.
    pub async fn all_active(&self) -> Vec<Arc<Session>> {
        let sessions = self.inner.sessions.read().await;
        sessions
            .values()
            .filter(|session| session.state() != SessionState::Closed)
            .cloned()
            .collect()
    }

    /// Close every session, ending all attached streams.
    pub async fn close_all(&self, reason: CloseReason) -> usize {
        let ids: Vec<SessionId> = {
            let sessions = self.inner.sessions.read().await;
            sessions.keys().cloned().collect()
        };

        let mut closed = 0;
        for id in ids {
            if self.remove(&id, reason).await {
                closed += 1;
            }
        }
        closed
    }

    /// Get the number of registered sessions.
    pub fn session_count(&self) -> usize {
        self.inner.active.load(Ordering::SeqCst)
    }

    /// Get the number of requests accepted but not yet answered.
    pub fn in_flight_count(&self) -> usize {
        self.inner.in_flight.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::HashSet;

    fn backend() -> Url {
        Url::parse("http://backend.test/api/mcp").unwrap()
    }

    fn bearer() -> AuthContext {
        AuthContext::Bearer("token".to_string())
    }

    #[tokio::test]
    async fn test_create_and_get() {
        let registry = SessionRegistry::new();
        let (session, _rx) = registry.create(bearer(), backend()).await;

        let found = registry.get(session.id()).await.unwrap();
        assert_eq!(found.id(), session.id());
        assert_eq!(found.state(), SessionState::Open);
        assert_eq!(found.backend_url(), &backend());
        assert_eq!(registry.session_count(), 1);
    }

    #[tokio::test]
    async fn test_get_unknown_is_none() {
        let registry = SessionRegistry::new();
        assert!(registry.get("does-not-exist").await.is_none());
        assert!(registry.get_open("does-not-exist").await.is_none());
    }

    #[tokio::test]
    async fn test_concurrent_creation_yields_unique_ids() {
        let registry = SessionRegistry::new();
        let mut handles = Vec::new();
        for _ in 0..64 {
            let registry = registry.clone();
            handles.push(tokio::spawn(async move {
                let (session, _rx) = registry.create(bearer(), backend()).await;
                session.id().to_string()
            }));
        }

        let mut ids = HashSet::new();
        for handle in handles {
            assert!(ids.insert(handle.await.unwrap()));
        }
        assert_eq!(registry.session_count(), 64);
        assert_eq!(registry.all_active().await.len(), 64);
    }

    #[tokio::test]
    async fn test_remove_is_idempotent() {
        let registry = SessionRegistry::new();
        let (session, _rx) = registry.create(bearer(), backend()).await;
        let id = session.id().to_string();

        assert!(registry.remove(&id, CloseReason::ClientRequested).await);
        assert!(!registry.remove(&id, CloseReason::IdleTimeout).await);
        assert!(registry.get(&id).await.is_none());
        assert_eq!(session.state(), SessionState::Closed);
        assert_eq!(registry.session_count(), 0);
    }

    #[tokio::test]
    async fn test_deliver_is_fifo() {
        let registry = SessionRegistry::new();
        let (session, mut rx) = registry.create(bearer(), backend()).await;

        for i in 0..10 {
            let reply = JsonRpcResponse::success(Some(json!(i)), json!({}));
            assert!(registry.deliver(session.id(), reply).await);
        }

        for i in 0..10 {
            let message = rx.recv().await.unwrap();
            let reply: JsonRpcResponse = serde_json::from_str(message.payload()).unwrap();
            assert_eq!(reply.id, Some(json!(i)));
        }
    }

    #[tokio::test]
    async fn test_deliver_to_unknown_session_is_discarded() {
        let registry = SessionRegistry::new();
        let reply = JsonRpcResponse::success(Some(json!(1)), json!({}));
        assert!(!registry.deliver("gone", reply).await);
    }

    #[tokio::test]
    async fn test_queued_messages_survive_close() {
        let registry = SessionRegistry::new();
        let (session, mut rx) = registry.create(bearer(), backend()).await;
        let id = session.id().to_string();

        registry
            .deliver(&id, JsonRpcResponse::success(Some(json!(1)), json!({})))
            .await;
        registry.remove(&id, CloseReason::IdleTimeout).await;

        // Already queued reply is still readable, then the channel ends
        assert!(rx.recv().await.is_some());
        assert!(rx.recv().await.is_none());

        // Nothing can be enqueued after close
        assert!(!session.enqueue(OutboundMessage {
            payload: "{}".to_string()
        }));
    }

    #[tokio::test]
    async fn test_draining_session_is_not_open() {
        let registry = SessionRegistry::new();
        let (session, mut rx) = registry.create(bearer(), backend()).await;
        let id = session.id().to_string();

        assert!(registry.begin_draining(&id).await);
        assert!(!registry.begin_draining(&id).await);
        assert!(registry.get_open(&id).await.is_none());
        assert!(registry.get(&id).await.is_some());

        // Draining sessions still take replies
        assert!(
            registry
                .deliver(&id, JsonRpcResponse::success(Some(json!(5)), json!({})))
                .await
        );
        assert!(rx.recv().await.is_some());
    }

    #[tokio::test]
    async fn test_in_flight_tracking() {
        let registry = SessionRegistry::new();
        let (session, _rx) = registry.create(bearer(), backend()).await;

        let first = registry.track_request(&session);
        let second = registry.track_request(&session);
        assert_eq!(registry.in_flight_count(), 2);
        assert_eq!(session.in_flight(), 2);

        drop(first);
        assert_eq!(registry.in_flight_count(), 1);
        drop(second);
        assert_eq!(registry.in_flight_count(), 0);
        assert_eq!(session.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_close_after_drain_waits_for_in_flight() {
        let registry = SessionRegistry::new();
        let (session, mut rx) = registry.create(bearer(), backend()).await;
        let id = session.id().to_string();
        let guard = registry.track_request(&session);
        drop(session);

        let teardown = {
            let registry = registry.clone();
            let id = id.clone();
            tokio::spawn(async move {
                registry
                    .close_after_drain(&id, Duration::from_secs(5), CloseReason::ClientDisconnected)
                    .await;
            })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(registry.get_open(&id).await.is_none());
        assert!(registry.get(&id).await.is_some());

        // In-flight reply lands before removal
        registry
            .deliver(&id, JsonRpcResponse::success(Some(json!(3)), json!({})))
            .await;
        drop(guard);

        teardown.await.unwrap();
        assert!(registry.get(&id).await.is_none());
        assert!(rx.recv().await.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_after_drain_gives_up_after_grace() {
        let registry = SessionRegistry::new();
        let (session, _rx) = registry.create(bearer(), backend()).await;
        let id = session.id().to_string();
        let _guard = registry.track_request(&session);

        registry
            .close_after_drain(&id, Duration::from_millis(100), CloseReason::ClientDisconnected)
            .await;
        assert!(registry.get(&id).await.is_none());
    }

    #[tokio::test]
    async fn test_close_all() {
        let registry = SessionRegistry::new();
        let (_a, _rx_a) = registry.create(bearer(), backend()).await;
        let (_b, _rx_b) = registry.create(bearer(), backend()).await;

        assert_eq!(registry.close_all(CloseReason::Shutdown).await, 2);
        assert_eq!(registry.session_count(), 0);
        assert!(registry.all_active().await.is_empty());
    }
}
