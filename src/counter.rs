//! Per-key concurrent session admission

use crate::config::{SharedTunnelSettings, WebSocketConfig};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tracing::warn;

/// What a counter is keyed by; selects which configured limit applies
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CounterKind {
    PerIp,
    PerAccount,
}

impl CounterKind {
    fn limit(&self, settings: &WebSocketConfig) -> u32 {
        match self {
            CounterKind::PerIp => settings.session_limit_per_ip,
            CounterKind::PerAccount => settings.session_limit_per_account,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            CounterKind::PerIp => "ip",
            CounterKind::PerAccount => "account",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CounterError {
    #[error("session limit {limit} reached for {key}")]
    LimitExceeded { key: String, limit: u32 },
    #[error("no session entry for {0}")]
    NotFound(String),
    #[error("session count for {0} is already zero")]
    Invalid(String),
}

/// Counts open sessions per key against a limit read from live settings.
///
/// A limit of 0 disables the cap. Entries that drop back to zero are kept.
pub struct SessionCounter {
    kind: CounterKind,
    settings: SharedTunnelSettings,
    sessions: Mutex<HashMap<String, u32>>,
}

impl SessionCounter {
    pub fn new(kind: CounterKind, settings: SharedTunnelSettings) -> Self {
        Self {
            kind,
            settings,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    pub fn kind(&self) -> CounterKind {
        self.kind
    }

    /// Admit one more session for `key`, returning the new count
    pub fn increase(&self, key: &str) -> Result<u32, CounterError> {
        let limit = self.kind.limit(&self.settings.read());
        let mut sessions = self.sessions.lock();
        let current = sessions.get(key).copied().unwrap_or(0);
        if limit > 0 && current + 1 > limit {
            return Err(CounterError::LimitExceeded {
                key: key.to_string(),
                limit,
            });
        }
        sessions.insert(key.to_string(), current + 1);
        Ok(current + 1)
    }

    /// Release one session for `key`, returning the new count
    pub fn decrease(&self, key: &str) -> Result<u32, CounterError> {
        let mut sessions = self.sessions.lock();
        let count = sessions
            .get_mut(key)
            .ok_or_else(|| CounterError::NotFound(key.to_string()))?;
        if *count < 1 {
            return Err(CounterError::Invalid(key.to_string()));
        }
        *count -= 1;
        Ok(*count)
    }

    pub fn count(&self, key: &str) -> u32 {
        self.sessions.lock().get(key).copied().unwrap_or(0)
    }

    /// Increase and hand back a permit that decreases on drop
    pub fn acquire(self: &Arc<Self>, key: &str) -> Result<SessionPermit, CounterError> {
        self.increase(key)?;
        Ok(SessionPermit {
            counter: Arc::clone(self),
            key: key.to_string(),
        })
    }
}

impl fmt::Display for SessionCounter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let sessions = self.sessions.lock();
        let mut keys: Vec<_> = sessions.keys().collect();
        keys.sort();
        for key in keys {
            write!(f, "{}: {} / ", key, sessions[key])?;
        }
        Ok(())
    }
}

/// One admitted session; releases its slot when dropped
pub struct SessionPermit {
    counter: Arc<SessionCounter>,
    key: String,
}

impl SessionPermit {
    pub fn key(&self) -> &str {
        &self.key
    }
}

impl Drop for SessionPermit {
    fn drop(&mut self) {
        if let Err(e) = self.counter.decrease(&self.key) {
            warn!(
                kind = self.counter.kind.as_str(),
                key = %self.key,
                error = %e,
                "Ignoring session counter error on release"
            );
        }
    }
}
