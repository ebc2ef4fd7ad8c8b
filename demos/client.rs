use futures::StreamExt;
use socket_mesh::frame::CloseCode;
use socket_mesh::handshake::connect_async;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::select;

/// Interactive client: every line typed on stdin goes to the server, every
/// server message is printed, and an empty line runs the close handshake.
#[tokio::main]
async fn main() {
    let url = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "ws://127.0.0.1:9002/echo".to_string());

    let mut connection = match connect_async(&url).await {
        Ok(connection) => connection,
        Err(err) => {
            eprintln!("handshake with {} failed: {}", url, err);
            return;
        }
    };

    let answered = connection.ping(Vec::new()).await.unwrap_or(false);
    println!("connected to {} (pong received: {})", url, answered);
    println!("type a line to send it; an empty line disconnects");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        select! {
            incoming = connection.next() => {
                match incoming {
                    Some(Ok(message)) => match message.as_text() {
                        Ok(text) => println!("<- {}", text),
                        Err(_) => println!("<- {} bytes of binary data", message.len()),
                    },
                    Some(Err(err)) => {
                        eprintln!("connection error: {}", err);
                        break;
                    }
                    None => {
                        println!("server closed the connection");
                        break;
                    }
                }
            }
            typed = lines.next_line() => {
                match typed {
                    Ok(Some(line)) if !line.is_empty() => {
                        if connection.send_as_text(line).await.is_err() {
                            eprintln!("send failed, giving up");
                            break;
                        }
                    }
                    _ => {
                        match connection.close(CloseCode::Normal, "").await {
                            Ok(clean) => println!("disconnected (clean close: {})", clean),
                            Err(err) => eprintln!("close failed: {}", err),
                        }
                        break;
                    }
                }
            }
        }
    }
}
