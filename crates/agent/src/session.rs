//! In-memory viewer sessions with a sliding TTL.
//!
//! A viewer that reconnects presents its session id and gets its remembered
//! settings back. Nothing is persisted.

use crate::error::{Result, StreamError};
use lumen_protocol::{SessionSettings, SignalResponse};
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct ViewerSession {
    pub id: Uuid,
    pub created: Instant,
    pub last_activity: Instant,
    pub expires_at: Instant,
    pub client_info: HashMap<String, String>,
    pub settings: SessionSettings,
    pub connection_count: u32,
}

/// What a viewer is told about its session.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionView {
    pub session_id: Uuid,
    pub expires_in: Duration,
    pub connection_count: u32,
    pub settings: SessionSettings,
}

impl From<SessionView> for SignalResponse {
    fn from(view: SessionView) -> Self {
        SignalResponse::Session {
            session_id: view.session_id,
            expires_in: view.expires_in.as_secs(),
            connection_count: view.connection_count,
            settings: view.settings,
        }
    }
}

pub struct SessionRegistry {
    ttl: Duration,
    sessions: Mutex<HashMap<Uuid, ViewerSession>>,
}

impl SessionRegistry {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn create(&self, client_info: HashMap<String, String>) -> SessionView {
        let now = Instant::now();
        let session = ViewerSession {
            id: Uuid::new_v4(),
            created: now,
            last_activity: now,
            expires_at: now + self.ttl,
            client_info,
            settings: SessionSettings::default(),
            connection_count: 1,
        };
        let view = self.view(&session, now);
        info!(session = %session.id, "Viewer session created");
        self.lock().insert(session.id, session);
        view
    }

    /// Extends the TTL and counts another connection. An expired session is
    /// removed on the spot.
    pub fn resume(&self, id: Uuid) -> Result<SessionView> {
        let now = Instant::now();
        let mut sessions = self.lock();
        let Some(session) = sessions.get_mut(&id) else {
            return Err(StreamError::SessionNotFound(id));
        };
        if now > session.expires_at {
            sessions.remove(&id);
            info!(session = %id, "Viewer session expired on resume");
            return Err(StreamError::SessionExpired(id));
        }
        session.last_activity = now;
        session.expires_at = now + self.ttl;
        session.connection_count += 1;
        info!(
            session = %id,
            connections = session.connection_count,
            "Viewer session resumed"
        );
        Ok(self.view(session, now))
    }

    /// Applies `update` to the remembered settings and refreshes the TTL.
    pub fn update_settings(
        &self,
        id: Uuid,
        update: impl FnOnce(&mut SessionSettings),
    ) -> Result<SessionSettings> {
        let now = Instant::now();
        let mut sessions = self.lock();
        let session = sessions
            .get_mut(&id)
            .filter(|s| now <= s.expires_at)
            .ok_or(StreamError::SessionNotFound(id))?;
        update(&mut session.settings);
        session.last_activity = now;
        session.expires_at = now + self.ttl;
        Ok(session.settings.clone())
    }

    pub fn touch(&self, id: Uuid) -> bool {
        let now = Instant::now();
        match self.lock().get_mut(&id) {
            Some(session) if now <= session.expires_at => {
                session.last_activity = now;
                session.expires_at = now + self.ttl;
                true
            }
            _ => false,
        }
    }

    pub fn get(&self, id: Uuid) -> Option<SessionView> {
        let now = Instant::now();
        self.lock()
            .get(&id)
            .filter(|s| now <= s.expires_at)
            .map(|s| self.view(s, now))
    }

    pub fn end(&self, id: Uuid) -> bool {
        let removed = self.lock().remove(&id).is_some();
        if removed {
            info!(session = %id, "Viewer session ended");
        }
        removed
    }

    pub fn active_count(&self) -> usize {
        let now = Instant::now();
        self.lock()
            .values()
            .filter(|s| now <= s.expires_at)
            .count()
    }

    /// Drops expired sessions, returning how many were removed.
    pub fn cleanup(&self) -> usize {
        let now = Instant::now();
        let mut sessions = self.lock();
        let before = sessions.len();
        sessions.retain(|_, s| now <= s.expires_at);
        before - sessions.len()
    }

    pub async fn run_cleanup(&self, interval: Duration, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    let removed = self.cleanup();
                    if removed > 0 {
                        info!(removed, "Expired viewer sessions removed");
                    } else {
                        debug!("Session cleanup: nothing expired");
                    }
                }
            }
        }
    }

    fn view(&self, session: &ViewerSession, now: Instant) -> SessionView {
        SessionView {
            session_id: session.id,
            expires_in: session.expires_at.saturating_duration_since(now),
            connection_count: session.connection_count,
            settings: session.settings.clone(),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<Uuid, ViewerSession>> {
        self.sessions.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    const TTL: Duration = Duration::from_secs(60);

    #[tokio::test(start_paused = true)]
    async fn create_then_resume_counts_connections() {
        let registry = SessionRegistry::new(TTL);
        let created = registry.create(HashMap::from([("ua".into(), "test".into())]));
        assert_eq!(created.connection_count, 1);
        assert_eq!(created.expires_in, TTL);
        assert_eq!(created.settings, SessionSettings::default());

        tokio::time::advance(Duration::from_secs(30)).await;
        let resumed = registry.resume(created.session_id).unwrap();
        assert_eq!(resumed.connection_count, 2);
        assert_eq!(resumed.expires_in, TTL);
    }

    #[tokio::test(start_paused = true)]
    async fn resume_unknown_session() {
        let registry = SessionRegistry::new(TTL);
        let id = Uuid::new_v4();
        assert!(matches!(
            registry.resume(id),
            Err(StreamError::SessionNotFound(got)) if got == id
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn resume_after_ttl_expires_and_removes() {
        let registry = SessionRegistry::new(TTL);
        let id = registry.create(HashMap::new()).session_id;
        tokio::time::advance(TTL + Duration::from_secs(1)).await;

        assert!(matches!(
            registry.resume(id),
            Err(StreamError::SessionExpired(_))
        ));
        assert!(matches!(
            registry.resume(id),
            Err(StreamError::SessionNotFound(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn touch_slides_expiry() {
        let registry = SessionRegistry::new(TTL);
        let id = registry.create(HashMap::new()).session_id;
        tokio::time::advance(Duration::from_secs(50)).await;
        assert!(registry.touch(id));
        tokio::time::advance(Duration::from_secs(50)).await;
        assert!(registry.get(id).is_some());
        tokio::time::advance(Duration::from_secs(11)).await;
        assert!(registry.get(id).is_none());
        assert!(!registry.touch(id));
    }

    #[tokio::test(start_paused = true)]
    async fn settings_are_remembered() {
        let registry = SessionRegistry::new(TTL);
        let id = registry.create(HashMap::new()).session_id;
        registry
            .update_settings(id, |s| {
                s.fps = 30;
                s.selected_monitor = 2;
            })
            .unwrap();
        let resumed = registry.resume(id).unwrap();
        assert_eq!(resumed.settings.fps, 30);
        assert_eq!(resumed.settings.selected_monitor, 2);
        assert!(registry.update_settings(Uuid::new_v4(), |_| {}).is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn cleanup_removes_only_expired() {
        let registry = SessionRegistry::new(TTL);
        registry.create(HashMap::new());
        tokio::time::advance(Duration::from_secs(40)).await;
        let fresh = registry.create(HashMap::new()).session_id;
        tokio::time::advance(Duration::from_secs(30)).await;

        assert_eq!(registry.cleanup(), 1);
        assert_eq!(registry.active_count(), 1);
        assert!(registry.get(fresh).is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn cleanup_loop_runs_until_cancelled() {
        let registry = Arc::new(SessionRegistry::new(TTL));
        registry.create(HashMap::new());
        let cancel = CancellationToken::new();
        let task = tokio::spawn({
            let registry = registry.clone();
            let cancel = cancel.clone();
            async move {
                registry
                    .run_cleanup(Duration::from_secs(10), cancel)
                    .await
            }
        });

        tokio::time::sleep(TTL + Duration::from_secs(15)).await;
        assert_eq!(registry.lock().len(), 0);

        cancel.cancel();
        task.await.unwrap();
    }

    #[test]
    fn view_converts_to_signal_response() {
        let view = SessionView {
            session_id: Uuid::nil(),
            expires_in: Duration::from_millis(59_900),
            connection_count: 3,
            settings: SessionSettings::default(),
        };
        match SignalResponse::from(view) {
            SignalResponse::Session {
                expires_in,
                connection_count,
                ..
            } => {
                assert_eq!(expires_in, 59);
                assert_eq!(connection_count, 3);
            }
            other => panic!("unexpected {other:?}"),
        }
    }
}
