use crate::connection::{HandshakeInfo, ReadyState};
use crate::error::Error;
use crate::frame::CloseCode;
use crate::message::Message;
use crate::session::{Session, ID};
use crate::split::WSWriter;
use futures::future::join_all;
use log::{debug, warn};
use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::timeout;

pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(60);
const DEFAULT_STOP_TIMEOUT: Duration = Duration::from_secs(5);

/// Lifecycle of a service and its manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceState {
    Ready,
    Started,
    ShuttingDown,
    Stopped,
}

/// The session registry of one service. Cheap to clone; all clones see the
/// same sessions. The registry lock is plain and never held across I/O:
/// every multi-session operation works on a snapshot taken at call time, so
/// sessions added mid-operation may or may not be included.
#[derive(Clone)]
pub struct SessionManager {
    inner: Arc<ManagerInner>,
}

struct ManagerInner {
    sessions: StdMutex<HashMap<ID, Session>>,
    state: StdMutex<ServiceState>,
    // Guards against overlapping sweeps; contenders bail out instead of
    // queueing
    sweep_gate: Mutex<()>,
}

impl Default for SessionManager {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionManager {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(ManagerInner {
                sessions: StdMutex::new(HashMap::new()),
                state: StdMutex::new(ServiceState::Ready),
                sweep_gate: Mutex::new(()),
            }),
        }
    }

    pub fn state(&self) -> ServiceState {
        *self.inner.state.lock().unwrap()
    }

    pub(crate) fn set_state(&self, state: ServiceState) {
        *self.inner.state.lock().unwrap() = state;
    }

    /// Registers a new session under a fresh id. Only a started service
    /// accepts sessions.
    pub fn add(&self, writer: WSWriter, info: HandshakeInfo) -> Result<Session, Error> {
        if self.state() != ServiceState::Started {
            return Err(Error::ServiceNotStarted);
        }
        let session = Session::new(writer, info);
        self.inner
            .sessions
            .lock()
            .unwrap()
            .insert(session.id(), session.clone());
        Ok(session)
    }

    pub fn remove(&self, id: &ID) -> bool {
        self.inner.sessions.lock().unwrap().remove(id).is_some()
    }

    pub fn get(&self, id: &ID) -> Option<Session> {
        self.inner.sessions.lock().unwrap().get(id).cloned()
    }

    pub fn ids(&self) -> Vec<ID> {
        self.inner.sessions.lock().unwrap().keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.inner.sessions.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn snapshot(&self) -> Vec<Session> {
        self.inner.sessions.lock().unwrap().values().cloned().collect()
    }

    /// Fans a message out to every open session. True iff every send
    /// succeeded. Ordering per connection follows each session's writer
    /// lock, so two consecutive broadcasts arrive in order everywhere.
    pub async fn broadcast(&self, message: Message) -> bool {
        let sessions = self.snapshot();
        let sends = sessions
            .iter()
            .filter(|session| session.ready_state() == ReadyState::Open)
            .map(|session| {
                let message = message.clone();
                async move {
                    if let Err(error) = session.send_message(message).await {
                        debug!("broadcast to session {} failed: {}", session.id(), error);
                        false
                    } else {
                        true
                    }
                }
            });
        join_all(sends).await.into_iter().all(|ok| ok)
    }

    /// Pings every session and reports which answered within their wait
    /// time.
    pub async fn broadping(&self, payload: Vec<u8>) -> HashMap<ID, bool> {
        let sessions = self.snapshot();
        let pings = sessions.iter().map(|session| {
            let payload = payload.clone();
            async move {
                let alive = session.ping(payload).await.unwrap_or(false);
                (session.id(), alive)
            }
        });
        join_all(pings).await.into_iter().collect()
    }

    /// One liveness pass over the registry. Sessions that miss their pong:
    /// still Open get closed as protocol violations, ones mid-close are left
    /// to finish, dead ones are dropped from the registry. At most one sweep
    /// runs at a time; a second caller returns immediately.
    pub async fn sweep(&self) {
        let Ok(_gate) = self.inner.sweep_gate.try_lock() else {
            return;
        };
        if self.state() != ServiceState::Started {
            return;
        }

        let sessions = self.snapshot();
        let checks = sessions.iter().map(|session| async move {
            if session.ping(Vec::new()).await.unwrap_or(false) {
                return None;
            }
            match session.ready_state() {
                ReadyState::Open => {
                    warn!("session {} missed its pong, closing", session.id());
                    let _ = session.close(CloseCode::Protocol, "").await;
                    None
                }
                ReadyState::Closing => None,
                _ => Some(session.id()),
            }
        });

        let dead: Vec<ID> = join_all(checks).await.into_iter().flatten().collect();
        if !dead.is_empty() {
            let mut sessions = self.inner.sessions.lock().unwrap();
            for id in &dead {
                sessions.remove(id);
            }
            debug!("sweep dropped {} dead session(s)", dead.len());
        }
    }

    /// Shuts the whole registry down: no new sessions, no more sweeps,
    /// parallel close handshakes over everything still alive, bounded by
    /// `stop_timeout`.
    pub async fn stop(&self, code: CloseCode, reason: &str, stop_timeout: Option<Duration>) {
        self.set_state(ServiceState::ShuttingDown);

        let sessions = self.snapshot();
        let closes = sessions.iter().map(|session| async move {
            if let Err(error) = session.close(code, reason).await {
                debug!("closing session {} failed: {}", session.id(), error);
            }
        });

        let wait = stop_timeout.unwrap_or(DEFAULT_STOP_TIMEOUT);
        if timeout(wait, join_all(closes)).await.is_err() {
            warn!("service stop timed out before every close handshake finished");
        }

        self.inner.sessions.lock().unwrap().clear();
        self.set_state(ServiceState::Stopped);
    }
}
