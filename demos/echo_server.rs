use async_trait::async_trait;
use log::*;
use socket_mesh::config::ServerConfig;
use socket_mesh::error::Error;
use socket_mesh::frame::CloseFrame;
use socket_mesh::message::Message;
use socket_mesh::server::WebSocketServer;
use socket_mesh::service::Behavior;
use socket_mesh::session::Session;

struct Echo;

#[async_trait]
impl Behavior for Echo {
    async fn on_open(&mut self, session: &Session) {
        info!("session {} opened on {}", session.id(), session.handshake_info().path);
    }

    async fn on_message(&mut self, session: &Session, message: Message) -> Result<(), Error> {
        session.send_message(message).await
    }

    async fn on_close(&mut self, session: &Session, close_frame: Option<CloseFrame>) {
        info!("session {} closed: {:?}", session.id(), close_frame);
    }
}

#[tokio::main]
async fn main() {
    env_logger::init();

    let server = WebSocketServer::new(ServerConfig::default());
    server.add_service("/echo", || Box::new(Echo));

    let addr = server.start("127.0.0.1:9002").await.expect("can't listen");
    info!("echo service on ws://{}/echo", addr);

    tokio::signal::ctrl_c().await.ok();
    server.stop_normally().await;
}
