// Open sandbox sessions with an idle TTL and a hard cap

use mastery_sandbox::SandboxSession;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::{info, warn};
use uuid::Uuid;

use crate::metrics;
use crate::AppState;

pub const DEFAULT_MAX_SESSIONS: usize = 64;
pub const DEFAULT_IDLE_TTL_SECS: u64 = 30 * 60;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionLimits {
    pub max_sessions: usize,
    pub idle_ttl: Duration,
}

impl Default for SessionLimits {
    fn default() -> Self {
        Self {
            max_sessions: DEFAULT_MAX_SESSIONS,
            idle_ttl: Duration::from_secs(DEFAULT_IDLE_TTL_SECS),
        }
    }
}

impl SessionLimits {
    /// Read MASTERY_MAX_SESSIONS and MASTERY_SESSION_IDLE_SECS, keeping defaults for bad values
    pub fn from_env() -> Self {
        let max = std::env::var("MASTERY_MAX_SESSIONS").ok();
        let idle = std::env::var("MASTERY_SESSION_IDLE_SECS").ok();
        Self::from_values(max.as_deref(), idle.as_deref())
    }

    fn from_values(max_sessions: Option<&str>, idle_secs: Option<&str>) -> Self {
        let mut limits = Self::default();
        if let Some(raw) = max_sessions {
            match raw.trim().parse::<usize>() {
                Ok(n) if n > 0 => limits.max_sessions = n,
                _ => warn!("Ignoring invalid MASTERY_MAX_SESSIONS: {}", raw),
            }
        }
        if let Some(raw) = idle_secs {
            match raw.trim().parse::<u64>() {
                Ok(secs) if secs > 0 => limits.idle_ttl = Duration::from_secs(secs),
                _ => warn!("Ignoring invalid MASTERY_SESSION_IDLE_SECS: {}", raw),
            }
        }
        limits
    }

    /// How often the sweeper looks for idle sessions
    pub fn sweep_interval(&self) -> Duration {
        (self.idle_ttl / 2).clamp(Duration::from_secs(1), Duration::from_secs(60))
    }
}

struct Entry {
    session: Arc<SandboxSession>,
    last_used: Instant,
}

pub struct SessionRegistry {
    entries: RwLock<HashMap<Uuid, Entry>>,
    limits: SessionLimits,
}

impl SessionRegistry {
    pub fn new(limits: SessionLimits) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            limits,
        }
    }

    pub fn limits(&self) -> SessionLimits {
        self.limits
    }

    pub async fn has_room(&self) -> bool {
        self.entries.read().await.len() < self.limits.max_sessions
    }

    /// Register a session. Hands it back when the registry is full.
    pub async fn insert(&self, session: Arc<SandboxSession>) -> Result<(), Arc<SandboxSession>> {
        let mut entries = self.entries.write().await;
        if entries.len() >= self.limits.max_sessions {
            return Err(session);
        }
        entries.insert(
            session.id(),
            Entry {
                session,
                last_used: Instant::now(),
            },
        );
        metrics::SESSIONS_ACTIVE.inc();
        Ok(())
    }

    /// Look a session up and mark it as used
    pub async fn get(&self, id: &Uuid) -> Option<Arc<SandboxSession>> {
        let mut entries = self.entries.write().await;
        let entry = entries.get_mut(id)?;
        entry.last_used = Instant::now();
        Some(Arc::clone(&entry.session))
    }

    pub async fn remove(&self, id: &Uuid) -> Option<Arc<SandboxSession>> {
        let removed = self.entries.write().await.remove(id)?;
        metrics::SESSIONS_ACTIVE.dec();
        Some(removed.session)
    }

    /// Close every session left unused for the idle TTL. Returns their ids.
    pub async fn sweep_idle(&self) -> Vec<Uuid> {
        let expired: Vec<Entry> = {
            let mut entries = self.entries.write().await;
            let ids: Vec<Uuid> = entries
                .iter()
                .filter(|(_, entry)| entry.last_used.elapsed() >= self.limits.idle_ttl)
                .map(|(id, _)| *id)
                .collect();
            ids.iter().filter_map(|id| entries.remove(id)).collect()
        };

        let mut ids = Vec::with_capacity(expired.len());
        for entry in expired {
            let id = entry.session.id();
            entry.session.close();
            metrics::SESSIONS_ACTIVE.dec();
            metrics::SESSIONS_EXPIRED_TOTAL.inc();
            info!(session_id = %id, "Idle session closed");
            ids.push(id);
        }
        ids
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}

/// Background task closing idle sessions
pub fn start_idle_sweeper(state: Arc<AppState>) {
    let limits = state.sessions.limits();
    let period = limits.sweep_interval();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        info!(
            interval_secs = period.as_secs(),
            idle_ttl_secs = limits.idle_ttl.as_secs(),
            max_sessions = limits.max_sessions,
            "Started idle session sweeper"
        );

        loop {
            interval.tick().await;
            let closed = state.sessions.sweep_idle().await;
            if !closed.is_empty() {
                info!(count = closed.len(), "Closed idle sessions");
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use mastery_common::types::Track;
    use mastery_sandbox::TrackConfigManager;

    fn sql_session() -> Arc<SandboxSession> {
        Arc::new(SandboxSession::for_track(Track::Sql, &TrackConfigManager::builtin()).unwrap())
    }

    #[test]
    fn test_limits_from_values() {
        let limits = SessionLimits::from_values(Some("8"), Some("120"));
        assert_eq!(limits.max_sessions, 8);
        assert_eq!(limits.idle_ttl, Duration::from_secs(120));
        assert_eq!(limits.sweep_interval(), Duration::from_secs(60));

        let fallback = SessionLimits::from_values(Some("0"), Some("soon"));
        assert_eq!(fallback, SessionLimits::default());

        let short = SessionLimits::from_values(None, Some("1"));
        assert_eq!(short.sweep_interval(), Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_registry_is_capped() {
        let registry = SessionRegistry::new(SessionLimits {
            max_sessions: 2,
            ..Default::default()
        });
        assert!(registry.insert(sql_session()).await.is_ok());
        assert!(registry.insert(sql_session()).await.is_ok());
        assert!(!registry.has_room().await);

        let rejected = sql_session();
        let id = rejected.id();
        let returned = registry.insert(rejected).await.unwrap_err();
        assert_eq!(returned.id(), id);
        assert_eq!(registry.len().await, 2);
    }

    #[tokio::test]
    async fn test_sweep_closes_only_idle_sessions() {
        let registry = SessionRegistry::new(SessionLimits {
            max_sessions: 4,
            idle_ttl: Duration::from_millis(200),
        });
        let stale = sql_session();
        let fresh = sql_session();
        let (stale_id, fresh_id) = (stale.id(), fresh.id());
        assert!(registry.insert(stale).await.is_ok());
        assert!(registry.insert(fresh).await.is_ok());

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(registry.get(&fresh_id).await.is_some());
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert_eq!(registry.sweep_idle().await, vec![stale_id]);
        assert!(registry.get(&stale_id).await.is_none());
        assert!(registry.get(&fresh_id).await.is_some());
    }
}
