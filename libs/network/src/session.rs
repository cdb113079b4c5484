//! Session providers
//!
//! A client channel takes a fresh session on every successful connect and on
//! every transport disconnect. Sessions are informational: messages from an
//! older session are still delivered.

use comms_types::SessionId;
use std::sync::atomic::{AtomicI64, Ordering};

/// Hands out strictly increasing session ids
pub trait SessionProvider: Send + Sync {
    /// Advance and return the new session
    fn next_session(&self) -> SessionId;

    /// Most recently issued session, `SessionId::NULL` before the first
    fn current_session(&self) -> SessionId;
}

/// Atomic counter starting at [`SessionId::FIRST`]
#[derive(Debug)]
pub struct DefaultSessionProvider {
    current: AtomicI64,
}

impl DefaultSessionProvider {
    pub fn new() -> Self {
        Self {
            current: AtomicI64::new(SessionId::NULL.to_long()),
        }
    }
}

impl Default for DefaultSessionProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionProvider for DefaultSessionProvider {
    fn next_session(&self) -> SessionId {
        let previous = self
            .current
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |v| {
                Some(SessionId::from_raw(v).next().to_long())
            })
            .unwrap_or_else(|v| v);
        SessionId::from_raw(previous).next()
    }

    fn current_session(&self) -> SessionId {
        SessionId::from_raw(self.current.load(Ordering::Acquire))
    }
}
