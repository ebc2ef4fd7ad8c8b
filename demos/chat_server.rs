use async_trait::async_trait;
use log::*;
use socket_mesh::config::ServerConfig;
use socket_mesh::error::Error;
use socket_mesh::manager::SessionManager;
use socket_mesh::message::Message;
use socket_mesh::server::WebSocketServer;
use socket_mesh::service::Behavior;
use socket_mesh::session::Session;
use std::sync::{Arc, OnceLock};

struct Chat {
    manager: Arc<OnceLock<SessionManager>>,
}

#[async_trait]
impl Behavior for Chat {
    async fn on_open(&mut self, session: &Session) {
        info!("{} joined the room", session.id());
    }

    async fn on_message(&mut self, session: &Session, message: Message) -> Result<(), Error> {
        let Some(manager) = self.manager.get() else {
            return Ok(());
        };
        let line = format!("{}: {}", session.id().simple(), message.as_text()?);
        manager.broadcast(Message::Text(line)).await;
        Ok(())
    }

    async fn on_close(&mut self, session: &Session, _: Option<socket_mesh::frame::CloseFrame>) {
        info!("{} left the room", session.id());
    }
}

#[tokio::main]
async fn main() {
    env_logger::init();

    let server = WebSocketServer::new(ServerConfig::default());

    let manager_slot: Arc<OnceLock<SessionManager>> = Arc::new(OnceLock::new());
    let factory_slot = manager_slot.clone();
    let host = server.add_service("/chat", move || {
        Box::new(Chat {
            manager: factory_slot.clone(),
        })
    });
    manager_slot.set(host.manager().clone()).ok();

    let addr = server.start("127.0.0.1:9003").await.expect("can't listen");
    info!("chat room on ws://{}/chat", addr);

    tokio::signal::ctrl_c().await.ok();
    server.stop_normally().await;
}
