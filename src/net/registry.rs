//! The concurrent set of live sessions. Membership here is the sole
//! authority for "this connection is live and dispatchable".

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, RwLock};

use crate::net::session::{Session, SessionId};

#[derive(Default)]
pub struct SessionRegistry {
    sessions: RwLock<HashMap<SessionId, Arc<Session>>>,
    next_id: AtomicU32,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            // Id zero is reserved; a session with id zero is a protocol
            // violation at dispatch time.
            next_id: AtomicU32::new(1),
        }
    }

    pub fn allocate_id(&self) -> SessionId {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        if id == 0 {
            self.next_id.fetch_add(1, Ordering::SeqCst)
        } else {
            id
        }
    }

    pub fn add(&self, session: Arc<Session>) -> Result<(), String> {
        let mut sessions = self.sessions.write().expect("session registry lock");
        let id = session.id();
        if sessions.contains_key(&id) {
            return Err(format!("session id {} already registered", id));
        }
        sessions.insert(id, session);
        Ok(())
    }

    /// Idempotent: removing an absent id is a no-op.
    pub fn remove(&self, id: SessionId) -> Option<Arc<Session>> {
        self.sessions
            .write()
            .expect("session registry lock")
            .remove(&id)
    }

    pub fn try_get(&self, id: SessionId) -> Option<Arc<Session>> {
        self.sessions
            .read()
            .expect("session registry lock")
            .get(&id)
            .cloned()
    }

    pub fn contains(&self, id: SessionId) -> bool {
        self.sessions
            .read()
            .expect("session registry lock")
            .contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.sessions.read().expect("session registry lock").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Copy-on-read snapshot for broadcasts and tick passes; safe to
    /// iterate while other threads add and remove sessions.
    pub fn snapshot(&self) -> Vec<Arc<Session>> {
        self.sessions
            .read()
            .expect("session registry lock")
            .values()
            .cloned()
            .collect()
    }
}
