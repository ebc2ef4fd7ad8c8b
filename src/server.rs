use crate::config::ServerConfig;
use crate::error::Error;
use crate::frame::CloseCode;
use crate::http::serve_connection;
use crate::manager::{ServiceState, DEFAULT_SWEEP_INTERVAL};
use crate::message::Message;
use crate::service::{Behavior, Router, ServiceHost};
use crate::session::ID;
use crate::stream::SocketMeshStream;
use futures::future::join_all;
use log::{debug, error, info};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex as StdMutex};
use tokio::net::TcpListener;
use tokio::select;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::interval;
use tokio_rustls::{TlsAcceptor, TlsStream};

/// A websocket server: an embedded HTTP/1.1 front door, a router from URL
/// paths to behavior factories, and a session registry per service.
///
/// ```no_run
/// # use socket_mesh::server::WebSocketServer;
/// # use socket_mesh::config::ServerConfig;
/// # async fn run(echo_factory: socket_mesh::service::BehaviorFactory) {
/// let server = WebSocketServer::new(ServerConfig::default());
/// server.add_service("/echo", move || echo_factory());
/// server.start("127.0.0.1:9001").await.unwrap();
/// # }
/// ```
pub struct WebSocketServer {
    config: ServerConfig,
    router: Arc<Router>,
    // addr -> accept task; plain mutex, operations never block on I/O
    listeners: StdMutex<HashMap<SocketAddr, JoinHandle<()>>>,
    shutdown: Arc<Notify>,
}

impl WebSocketServer {
    pub fn new(config: ServerConfig) -> Self {
        Self {
            config,
            router: Arc::new(Router::new()),
            listeners: StdMutex::new(HashMap::new()),
            shutdown: Arc::new(Notify::new()),
        }
    }

    /// Binds a behavior factory to a path. Every accepted upgrade on that
    /// path gets a fresh behavior from the factory.
    pub fn add_service<F>(&self, path: &str, factory: F) -> Arc<ServiceHost>
    where
        F: Fn() -> Box<dyn Behavior> + Send + Sync + 'static,
    {
        let host = Arc::new(ServiceHost::new(path.to_string(), Arc::new(factory)));
        self.router.add(host.clone());
        // A service registered on a running server goes live right away
        if !self.listeners.lock().unwrap().is_empty() {
            self.activate_host(&host);
        }
        host
    }

    pub fn service(&self, path: &str) -> Option<Arc<ServiceHost>> {
        self.router.find(path)
    }

    /// Binds the address and spawns the accept loop. May be called for
    /// several addresses; each gets its own listener entry.
    pub async fn start(&self, addr: &str) -> Result<SocketAddr, Error> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;

        if self.listeners.lock().unwrap().contains_key(&local_addr) {
            return Err(Error::AddressInUse(local_addr.to_string()));
        }

        for host in self.router.all() {
            self.activate_host(&host);
        }

        let router = self.router.clone();
        let config = self.config.clone();
        let shutdown = self.shutdown.clone();
        let task = tokio::spawn(accept_loop(listener, router, config, shutdown));

        self.listeners.lock().unwrap().insert(local_addr, task);
        info!("websocket server listening on {}", local_addr);
        Ok(local_addr)
    }

    /// Stops accepting, then closes every session of every service in
    /// parallel with the given close event. Returns once the close
    /// handshakes finish or their wait time elapses.
    pub async fn stop(&self, code: CloseCode, reason: &str) {
        self.shutdown.notify_waiters();
        let tasks: Vec<JoinHandle<()>> = {
            let mut listeners = self.listeners.lock().unwrap();
            listeners.drain().map(|(_, task)| task).collect()
        };
        for task in tasks {
            task.abort();
        }

        let stops = self.router.all().into_iter().map(|host| {
            let reason = reason.to_string();
            async move {
                host.manager().stop(code, &reason, None).await;
            }
        });
        join_all(stops).await;
        info!("websocket server stopped");
    }

    pub async fn broadcast(&self, path: &str, message: Message) -> Result<bool, Error> {
        let host = self
            .router
            .find(path)
            .ok_or_else(|| Error::ServiceNotFound(path.to_string()))?;
        Ok(host.manager().broadcast(message).await)
    }

    pub async fn broadping(&self, path: &str, payload: Vec<u8>) -> Result<HashMap<ID, bool>, Error> {
        let host = self
            .router
            .find(path)
            .ok_or_else(|| Error::ServiceNotFound(path.to_string()))?;
        Ok(host.manager().broadping(payload).await)
    }

    /// Graceful default stop, closing every session with a normal status.
    pub async fn stop_normally(&self) {
        self.stop(CloseCode::Normal, "").await;
    }

    /// Marks the host started and hangs its periodic sweep on the timer.
    /// The sweep task dies with the service state.
    fn activate_host(&self, host: &Arc<ServiceHost>) {
        let manager = host.manager().clone();
        if manager.state() == ServiceState::Started {
            return;
        }
        manager.set_state(ServiceState::Started);

        let sweep_interval = self.config.sweep_interval.unwrap_or(DEFAULT_SWEEP_INTERVAL);
        let path = host.path().to_string();
        tokio::spawn(async move {
            let mut ticker = interval(sweep_interval);
            ticker.tick().await; // the first tick fires immediately
            loop {
                ticker.tick().await;
                if manager.state() != ServiceState::Started {
                    break;
                }
                debug!("sweeping sessions of `{}`", path);
                manager.sweep().await;
            }
        });
    }
}

async fn accept_loop(
    listener: TcpListener,
    router: Arc<Router>,
    config: ServerConfig,
    shutdown: Arc<Notify>,
) {
    loop {
        select! {
            _ = shutdown.notified() => break,
            accepted = listener.accept() => {
                match accepted {
                    Ok((tcp, peer_addr)) => {
                        debug!("accepted connection from {}", peer_addr);
                        let router = router.clone();
                        let config = config.clone();
                        tokio::spawn(async move {
                            let stream = match config.tls_config.clone() {
                                Some(tls) => {
                                    let acceptor = TlsAcceptor::from(tls);
                                    match acceptor.accept(tcp).await {
                                        Ok(tls_stream) => {
                                            SocketMeshStream::Secure(TlsStream::from(tls_stream))
                                        }
                                        Err(err) => {
                                            debug!("TLS handshake with {} failed: {}", peer_addr, err);
                                            return;
                                        }
                                    }
                                }
                                None => SocketMeshStream::Plain(tcp),
                            };
                            serve_connection(stream, router, config).await;
                        });
                    }
                    Err(err) => {
                        error!("accept failed: {}", err);
                    }
                }
            }
        }
    }
}

