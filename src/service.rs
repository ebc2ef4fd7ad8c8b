use crate::connection::WSConnection;
use crate::error::Error;
use crate::frame::{CloseCode, CloseFrame};
use crate::manager::SessionManager;
use crate::message::Message;
use crate::session::Session;
use async_trait::async_trait;
use futures::StreamExt;
use log::{debug, error};
use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};

/// What a service does with its sessions. One instance exists per accepted
/// connection, produced by the factory registered for the path.
///
/// An `Err` out of `on_message` closes that one session with a policy
/// violation and is reported through `on_error`; other sessions never see
/// it.
#[async_trait]
pub trait Behavior: Send {
    async fn on_open(&mut self, session: &Session) {
        let _ = session;
    }

    async fn on_message(&mut self, session: &Session, message: Message) -> Result<(), Error>;

    async fn on_close(&mut self, session: &Session, close_frame: Option<CloseFrame>) {
        let _ = (session, close_frame);
    }

    async fn on_error(&mut self, session: &Session, error: &Error) {
        let _ = session;
        error!("session error: {}", error);
    }
}

pub type BehaviorFactory = Arc<dyn Fn() -> Box<dyn Behavior> + Send + Sync>;

/// One path of the server: the behavior factory bound to it and the
/// registry of its live sessions.
pub struct ServiceHost {
    path: String,
    factory: BehaviorFactory,
    manager: SessionManager,
}

impl ServiceHost {
    pub(crate) fn new(path: String, factory: BehaviorFactory) -> Self {
        Self {
            path,
            factory,
            manager: SessionManager::new(),
        }
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn manager(&self) -> &SessionManager {
        &self.manager
    }

    /// Registers the freshly upgraded connection and runs its behavior loop
    /// in its own task. A failure in one session's handler never reaches the
    /// others.
    pub(crate) fn start_session(&self, connection: WSConnection) {
        let info = connection.handshake_info().clone();
        let (mut reader, writer) = connection.split();

        let session = match self.manager.add(writer, info) {
            Ok(session) => session,
            Err(error) => {
                debug!("refusing session on `{}`: {}", self.path, error);
                return;
            }
        };

        let mut behavior = (self.factory)();
        let manager = self.manager.clone();

        tokio::spawn(async move {
            behavior.on_open(&session).await;

            while let Some(result) = reader.next().await {
                match result {
                    Ok(message) => {
                        if let Err(rejection) = behavior.on_message(&session, message).await {
                            behavior.on_error(&session, &rejection).await;
                            let _ = session.close(CloseCode::Policy, "").await;
                            break;
                        }
                    }
                    Err(error) => {
                        behavior.on_error(&session, &error).await;
                        break;
                    }
                }
            }

            behavior.on_close(&session, reader.close_frame()).await;
            manager.remove(&session.id());
        });
    }
}

/// Maps normalized request paths to service hosts. Lookup is an exact match
/// after percent-decoding and trailing-slash stripping.
pub(crate) struct Router {
    services: StdMutex<HashMap<String, Arc<ServiceHost>>>,
}

impl Router {
    pub fn new() -> Self {
        Self {
            services: StdMutex::new(HashMap::new()),
        }
    }

    pub fn add(&self, host: Arc<ServiceHost>) {
        let key = normalize_path(host.path());
        self.services.lock().unwrap().insert(key, host);
    }

    pub fn find(&self, request_target: &str) -> Option<Arc<ServiceHost>> {
        // The query string plays no part in routing
        let path = request_target.split('?').next().unwrap_or(request_target);
        self.services
            .lock()
            .unwrap()
            .get(&normalize_path(path))
            .cloned()
    }

    pub fn all(&self) -> Vec<Arc<ServiceHost>> {
        self.services.lock().unwrap().values().cloned().collect()
    }
}

/// Canonical form used on both sides of the routing map: percent-decoded,
/// no trailing slash (the root keeps its single one).
pub(crate) fn normalize_path(path: &str) -> String {
    let decoded = percent_decode(path);
    let trimmed = decoded.trim_end_matches('/');
    if trimmed.is_empty() {
        "/".to_string()
    } else {
        trimmed.to_string()
    }
}

fn percent_decode(input: &str) -> String {
    let bytes = input.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' && i + 2 < bytes.len() {
            let hex = std::str::from_utf8(&bytes[i + 1..i + 3]).ok();
            if let Some(byte) = hex.and_then(|h| u8::from_str_radix(h, 16).ok()) {
                out.push(byte);
                i += 3;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}
