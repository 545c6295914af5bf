//! Connection cache: one shared session per target PID.
//!
//! Multiple providers in the host tool address the same target; they must
//! share one channel. The map lock is held only for lookup/insert, never
//! across a connect or an RPC.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use rcxrpm_shared::Result;
use tracing::debug;

use crate::client::RpcSession;

#[derive(Default)]
pub struct SessionCache {
    sessions: Mutex<HashMap<u32, Arc<RpcSession>>>,
}

impl SessionCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the live cached session for `pid`, or connect a new one.
    /// A dead cached entry is replaced.
    pub fn get_or_connect(&self, pid: u32, token: &str) -> Result<Arc<RpcSession>> {
        if let Some(session) = self.lookup_live(pid) {
            return Ok(session);
        }

        // Connect outside the lock; it can block for seconds.
        let session = Arc::new(RpcSession::connect(pid, token)?);

        let mut sessions = self.sessions.lock().unwrap();
        // Another thread may have connected meanwhile; first one wins.
        if let Some(existing) = sessions.get(&pid) {
            if existing.is_connected() {
                return Ok(Arc::clone(existing));
            }
        }
        sessions.insert(pid, Arc::clone(&session));
        Ok(session)
    }

    fn lookup_live(&self, pid: u32) -> Option<Arc<RpcSession>> {
        let sessions = self.sessions.lock().unwrap();
        sessions.get(&pid).filter(|s| s.is_connected()).cloned()
    }

    /// Drop the cache's reference when the caller was the last provider
    /// holding the session (strong count: cache + that one provider).
    pub fn release(&self, pid: u32) {
        let mut sessions = self.sessions.lock().unwrap();
        if let Some(session) = sessions.get(&pid) {
            if Arc::strong_count(session) <= 2 {
                debug!(pid, "last provider released; dropping session");
                sessions.remove(&pid);
            }
        }
    }

    /// Forget a session known to be dead.
    pub fn invalidate(&self, pid: u32) {
        self.sessions.lock().unwrap().remove(&pid);
    }
}
