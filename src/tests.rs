#[cfg(test)]
mod tests {
    use crate::compression::{Decoder, Encoder};
    use crate::config::{ClientConfig, ServerConfig, WebSocketConfig};
    use crate::connection::{establish, HandshakeInfo, ReadyState, WSConnection};
    use crate::error::Error;
    use crate::extensions::parse_extensions;
    use crate::frame::{apply_mask, CloseCode, CloseFrame, OpCode};
    use crate::handshake::{
        accept_async, connect_async, connect_async_with_config, generate_websocket_accept_value,
    };
    use crate::manager::ServiceState;
    use crate::message::{fragment_payload, Message};
    use crate::request::{build_client_request, strip_utf8_bom, HttpResponse};
    use crate::server::WebSocketServer;
    use crate::service::{normalize_path, Behavior};
    use crate::session::Session;
    use crate::stream::SocketMeshStream;
    use crate::write::Role;
    use async_trait::async_trait;
    use futures::StreamExt;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};
    use tokio::time::{sleep, Duration};

    // ------------------------------------------------------------------
    // helpers

    async fn tcp_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (client, accepted) = tokio::join!(TcpStream::connect(addr), listener.accept());
        (client.unwrap(), accepted.unwrap().0)
    }

    fn server_side(tcp: TcpStream) -> WSConnection {
        server_side_with_config(tcp, WebSocketConfig::default())
    }

    fn server_side_with_config(tcp: TcpStream, config: WebSocketConfig) -> WSConnection {
        establish(
            SocketMeshStream::Plain(tcp),
            Vec::new(),
            Role::Server,
            config,
            HandshakeInfo::default(),
        )
    }

    fn client_side(tcp: TcpStream) -> WSConnection {
        establish(
            SocketMeshStream::Plain(tcp),
            Vec::new(),
            Role::Client,
            WebSocketConfig::default(),
            HandshakeInfo::default(),
        )
    }

    const TEST_MASK: [u8; 4] = [0x11, 0x22, 0x33, 0x44];

    // Builds a masked frame the way a conforming client would emit it
    fn masked_frame(first_byte: u8, payload: &[u8]) -> Vec<u8> {
        let mut out = vec![first_byte];
        let len = payload.len();
        if len <= 125 {
            out.push(0x80 | len as u8);
        } else if len <= 65535 {
            out.push(0x80 | 126);
            out.extend_from_slice(&(len as u16).to_be_bytes());
        } else {
            out.push(0x80 | 127);
            out.extend_from_slice(&(len as u64).to_be_bytes());
        }
        out.extend_from_slice(&TEST_MASK);
        let mut body = payload.to_vec();
        apply_mask(&mut body, TEST_MASK);
        out.extend_from_slice(&body);
        out
    }

    struct EchoBehavior;

    #[async_trait]
    impl Behavior for EchoBehavior {
        async fn on_message(&mut self, session: &Session, message: Message) -> Result<(), Error> {
            session.send_message(message).await
        }
    }

    // ------------------------------------------------------------------
    // support types

    #[test]
    fn test_opcode() {
        let byte = 0x0;
        let res = OpCode::from(byte).unwrap();
        assert_eq!(res, OpCode::Continue);

        let opcode = OpCode::Text;
        let op_byte = opcode.as_u8();
        assert_eq!(op_byte, 0x1);

        assert!(OpCode::Close.is_control());
        assert!(!OpCode::Text.is_control());
        assert!(OpCode::from(0x3).is_err());
        assert!(OpCode::from(0xB).is_err());
    }

    #[test]
    fn test_close_code_wire_rules() {
        assert_eq!(CloseCode::from_u16(1000), CloseCode::Normal);
        assert_eq!(CloseCode::Normal.as_u16(), 1000);
        assert_eq!(CloseCode::from_u16(4000), CloseCode::Other(4000));

        assert!(CloseCode::Normal.is_allowed_on_wire());
        assert!(CloseCode::Away.is_allowed_on_wire());
        assert!(CloseCode::Other(3000).is_allowed_on_wire());
        assert!(CloseCode::Other(4999).is_allowed_on_wire());

        assert!(!CloseCode::NoStatus.is_allowed_on_wire());
        assert!(!CloseCode::Abnormal.is_allowed_on_wire());
        assert!(!CloseCode::TlsFailure.is_allowed_on_wire());
        assert!(!CloseCode::Other(999).is_allowed_on_wire());
        assert!(!CloseCode::Other(1004).is_allowed_on_wire());
        assert!(!CloseCode::Other(2999).is_allowed_on_wire());
    }

    #[test]
    fn test_close_frame_payload() {
        // Code without a reason is exactly the two status bytes
        let payload = CloseFrame::new(CloseCode::Normal, "").encode().unwrap();
        assert_eq!(payload, vec![0x03, 0xE8]);

        let payload = CloseFrame::new(CloseCode::Normal, "bye").encode().unwrap();
        let parsed = CloseFrame::parse(&payload).unwrap().unwrap();
        assert_eq!(parsed.code, CloseCode::Normal);
        assert_eq!(parsed.reason, "bye");

        assert!(CloseFrame::parse(&[]).unwrap().is_none());
        assert!(CloseFrame::parse(&[0x03]).is_err());

        let too_long = "x".repeat(124);
        assert!(CloseFrame::new(CloseCode::Normal, too_long).encode().is_err());
        assert!(CloseFrame::new(CloseCode::Abnormal, "").encode().is_err());
    }

    #[test]
    fn test_masking_involution() {
        let original: Vec<u8> = (0u8..=255).collect();
        let mut payload = original.clone();
        apply_mask(&mut payload, TEST_MASK);
        assert_ne!(payload, original);
        apply_mask(&mut payload, TEST_MASK);
        assert_eq!(payload, original);
    }

    #[test]
    fn test_fragment_payload() {
        let data: Vec<u8> = (0..300).map(|i| (i % 251) as u8).collect();
        let frames = fragment_payload(OpCode::Binary, data.clone(), 150, false);

        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].opcode, OpCode::Binary);
        assert!(!frames[0].final_fragment);
        assert_eq!(frames[1].opcode, OpCode::Continue);
        assert!(frames[1].final_fragment);

        let reassembled: Vec<u8> = frames
            .iter()
            .flat_map(|frame| frame.payload.clone())
            .collect();
        assert_eq!(reassembled, data);

        // An empty message is a single final frame
        let frames = fragment_payload(OpCode::Text, Vec::new(), 150, false);
        assert_eq!(frames.len(), 1);
        assert!(frames[0].final_fragment);
        assert_eq!(frames[0].opcode, OpCode::Text);
    }

    #[test]
    fn test_accept_key() {
        assert_eq!(
            generate_websocket_accept_value("dGhlIHNhbXBsZSBub25jZQ=="),
            "s3pPLMBiTxaQ9kYGzzhZRbK+xOo="
        );
    }

    #[test]
    fn test_build_client_request() {
        let mut config = ClientConfig::default();
        config.origin = Some("http://example.com".to_string());
        config.subprotocols = vec!["chat".to_string(), "superchat".to_string()];

        let parts = build_client_request(
            "ws://localhost:8080/room?name=a",
            "dGhlIHNhbXBsZSBub25jZQ==",
            &config,
            None,
            None,
        )
        .unwrap();

        assert_eq!(parts.connect_addr, "localhost:8080");
        assert!(!parts.use_tls);
        assert!(parts.request.starts_with("GET /room?name=a HTTP/1.1"));
        assert!(parts.request.contains("Host: localhost:8080"));
        assert!(parts.request.contains("Upgrade: websocket"));
        assert!(parts.request.contains("Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ=="));
        assert!(parts.request.contains("Sec-WebSocket-Version: 13"));
        assert!(parts.request.contains("Origin: http://example.com"));
        assert!(parts.request.contains("Sec-WebSocket-Protocol: chat, superchat"));
        assert!(parts.request.ends_with("\r\n\r\n"));

        assert!(build_client_request("ftp://localhost:8080", "k", &config, None, None).is_err());
        assert!(build_client_request("ws://:8080", "k", &config, None, None).is_err());

        // A wss URL without an explicit port wants TLS on 443
        let parts =
            build_client_request("wss://example.com/feed", "k", &config, None, None).unwrap();
        assert!(parts.use_tls);
        assert_eq!(parts.connect_addr, "example.com:443");
        assert!(parts.request.contains("Host: example.com\r\n"));
    }

    #[test]
    fn test_normalize_path() {
        assert_eq!(normalize_path("/chat/"), "/chat");
        assert_eq!(normalize_path("/chat"), "/chat");
        assert_eq!(normalize_path("/a%20b"), "/a b");
        assert_eq!(normalize_path("/"), "/");
    }

    #[test]
    fn test_parse_extensions() {
        let parsed = parse_extensions(
            "permessage-deflate; client_max_window_bits; server_no_context_takeover".to_string(),
        )
        .unwrap();
        assert!(parsed.permessage_deflate);
        assert_eq!(parsed.client_max_window_bits, Some(15));
        assert_eq!(parsed.server_no_context_takeover, Some(true));

        let parsed = parse_extensions("permessage-deflate; server_max_window_bits=12".to_string())
            .unwrap();
        assert_eq!(parsed.server_max_window_bits, Some(12));

        assert!(parse_extensions("x-webkit-deflate-frame".to_string()).is_none());
    }

    #[test]
    fn test_strip_utf8_bom() {
        assert_eq!(strip_utf8_bom("\u{feff}hello"), "hello");
        assert_eq!(strip_utf8_bom("hello"), "hello");
    }

    #[test]
    fn test_compression_round_trip() {
        let mut encoder = Encoder::new(true, None);
        let mut decoder = Decoder::new(true, None);

        let data: Vec<u8> = (0..10_000).map(|i| (i % 7) as u8).collect();
        let compressed = encoder.compress(&data).unwrap();
        assert!(compressed.len() < data.len());
        let restored = decoder.decompress(&compressed).unwrap();
        assert_eq!(restored, data);

        // Context carried over between messages still round-trips
        let second = b"hello hello hello".to_vec();
        let compressed = encoder.compress(&second).unwrap();
        let restored = decoder.decompress(&compressed).unwrap();
        assert_eq!(restored, second);
    }

    #[test]
    fn test_error_close_codes() {
        assert_eq!(Error::RSVNotZero.close_code(), Some(CloseCode::Protocol));
        assert_eq!(
            Error::InvalidContinuationFrame.close_code(),
            Some(CloseCode::Protocol)
        );
        assert_eq!(Error::MaxMessageSize.close_code(), Some(CloseCode::TooBig));
        let utf8_error = String::from_utf8(vec![0xC3, 0x28]).unwrap_err();
        assert_eq!(
            Error::from(utf8_error).close_code(),
            Some(CloseCode::InvalidData)
        );
        assert!(Error::NotOpen.close_code().is_none());
    }

    // ------------------------------------------------------------------
    // framing over the wire

    #[tokio::test]
    async fn test_text_echo_wire_bytes() {
        let (mut raw, tcp) = tcp_pair().await;
        let conn = server_side(tcp);
        let (mut reader, writer) = conn.split();

        raw.write_all(&masked_frame(0x81, b"Hello")).await.unwrap();

        let message = reader.next().await.unwrap().unwrap();
        assert_eq!(message, Message::Text("Hello".to_string()));

        writer.send_as_text("Hello".to_string()).await.unwrap();

        // Server frames go out unmasked, exactly as the RFC example
        let mut echoed = [0u8; 7];
        raw.read_exact(&mut echoed).await.unwrap();
        assert_eq!(echoed, [0x81, 0x05, 0x48, 0x65, 0x6C, 0x6C, 0x6F]);
    }

    #[tokio::test]
    async fn test_fragmented_binary_reassembly() {
        let (mut raw, tcp) = tcp_pair().await;
        let conn = server_side(tcp);
        let (mut reader, _writer) = conn.split();

        let data: Vec<u8> = (0..300).map(|i| (i % 256) as u8).collect();
        // First frame: binary, FIN=0; second: continuation, FIN=1
        raw.write_all(&masked_frame(0x02, &data[..150])).await.unwrap();
        raw.write_all(&masked_frame(0x80, &data[150..])).await.unwrap();

        let message = reader.next().await.unwrap().unwrap();
        assert_eq!(message, Message::Binary(data));
    }

    #[tokio::test]
    async fn test_control_frames_interleaved_with_fragments() {
        let (mut raw, tcp) = tcp_pair().await;
        let conn = server_side(tcp);
        let (mut reader, _writer) = conn.split();

        raw.write_all(&masked_frame(0x01, b"Hel")).await.unwrap();
        // A ping in the middle of the fragments gets answered without
        // disturbing reassembly
        raw.write_all(&masked_frame(0x89, &[0xDE, 0xAD])).await.unwrap();
        raw.write_all(&masked_frame(0x80, b"lo")).await.unwrap();

        let mut pong = [0u8; 4];
        raw.read_exact(&mut pong).await.unwrap();
        assert_eq!(pong, [0x8A, 0x02, 0xDE, 0xAD]);

        let message = reader.next().await.unwrap().unwrap();
        assert_eq!(message, Message::Text("Hello".to_string()));
    }

    #[tokio::test]
    async fn test_boundary_payload_lengths() {
        let (raw, tcp) = tcp_pair().await;
        let mut raw = raw;
        let conn = server_side(tcp);
        let (_reader, writer) = conn.split();

        // 125 stays in the 7-bit form
        writer.send_as_binary(vec![0xAB; 125]).await.unwrap();
        let mut header = [0u8; 2];
        raw.read_exact(&mut header).await.unwrap();
        assert_eq!(header, [0x82, 125]);
        let mut body = vec![0u8; 125];
        raw.read_exact(&mut body).await.unwrap();

        // 126 needs the 16-bit form
        writer.send_as_binary(vec![0xAB; 126]).await.unwrap();
        let mut header = [0u8; 4];
        raw.read_exact(&mut header).await.unwrap();
        assert_eq!(header, [0x82, 126, 0x00, 0x7E]);
        let mut body = vec![0u8; 126];
        raw.read_exact(&mut body).await.unwrap();

        // 65535 is the top of the 16-bit form
        writer.send_as_binary(vec![0xAB; 65535]).await.unwrap();
        let mut header = [0u8; 4];
        raw.read_exact(&mut header).await.unwrap();
        assert_eq!(header, [0x82, 126, 0xFF, 0xFF]);
        let mut body = vec![0u8; 65535];
        raw.read_exact(&mut body).await.unwrap();

        // 65536 rolls over to the 64-bit form
        writer.send_as_binary(vec![0xAB; 65536]).await.unwrap();
        let mut header = [0u8; 10];
        raw.read_exact(&mut header).await.unwrap();
        assert_eq!(header, [0x82, 127, 0, 0, 0, 0, 0, 1, 0, 0]);
        let mut body = vec![0u8; 65536];
        raw.read_exact(&mut body).await.unwrap();
        assert!(body.iter().all(|&b| b == 0xAB));
    }

    #[tokio::test]
    async fn test_client_frames_are_masked() {
        let (raw, tcp) = tcp_pair().await;
        let mut raw = raw;
        let conn = client_side(tcp);
        let (_reader, writer) = conn.split();

        writer.send_as_text("Hello".to_string()).await.unwrap();

        let mut frame = [0u8; 11];
        raw.read_exact(&mut frame).await.unwrap();
        assert_eq!(frame[0], 0x81);
        // MASK bit set, 4-byte key present, payload XOR-ed with it
        assert_eq!(frame[1], 0x80 | 5);
        let mask = [frame[2], frame[3], frame[4], frame[5]];
        let mut payload = frame[6..11].to_vec();
        apply_mask(&mut payload, mask);
        assert_eq!(&payload, b"Hello");
    }

    #[tokio::test]
    async fn test_unmasked_client_frame_rejected() {
        let (mut raw, tcp) = tcp_pair().await;
        let conn = server_side(tcp);
        let (mut reader, _writer) = conn.split();

        // Unmasked text frame straight at a server
        raw.write_all(&[0x81, 0x05]).await.unwrap();
        raw.write_all(b"Hello").await.unwrap();

        let error = reader.next().await.unwrap().unwrap_err();
        assert!(matches!(error, Error::UnmaskedClientFrame));
        assert_eq!(reader.ready_state(), ReadyState::Closed);
    }

    #[tokio::test]
    async fn test_rsv_without_negotiation_closes_1002() {
        let (mut raw, tcp) = tcp_pair().await;
        let conn = server_side(tcp);
        let (mut reader, _writer) = conn.split();

        raw.write_all(&masked_frame(0xC1, b"Hello")).await.unwrap();

        let error = reader.next().await.unwrap().unwrap_err();
        assert!(matches!(error, Error::RSVNotZero));

        // The wire sees a close frame carrying 1002
        let mut close = [0u8; 4];
        raw.read_exact(&mut close).await.unwrap();
        assert_eq!(close, [0x88, 0x02, 0x03, 0xEA]);
    }

    #[tokio::test]
    async fn test_stray_continuation_closes_1002() {
        let (mut raw, tcp) = tcp_pair().await;
        let conn = server_side(tcp);
        let (mut reader, _writer) = conn.split();

        raw.write_all(&masked_frame(0x80, b"x")).await.unwrap();

        let error = reader.next().await.unwrap().unwrap_err();
        assert!(matches!(error, Error::InvalidContinuationFrame));

        let mut close = [0u8; 4];
        raw.read_exact(&mut close).await.unwrap();
        assert_eq!(close, [0x88, 0x02, 0x03, 0xEA]);
    }

    #[tokio::test]
    async fn test_invalid_utf8_text_closes_1007() {
        let (mut raw, tcp) = tcp_pair().await;
        let conn = server_side(tcp);
        let (mut reader, _writer) = conn.split();

        raw.write_all(&masked_frame(0x81, &[0xC3, 0x28])).await.unwrap();

        let error = reader.next().await.unwrap().unwrap_err();
        assert_eq!(error.close_code(), Some(CloseCode::InvalidData));

        let mut close = [0u8; 4];
        raw.read_exact(&mut close).await.unwrap();
        assert_eq!(close, [0x88, 0x02, 0x03, 0xEF]);
    }

    #[tokio::test]
    async fn test_oversized_ping_rejected() {
        let (mut raw, tcp) = tcp_pair().await;
        let conn = server_side(tcp);
        let (mut reader, writer) = conn.split();

        raw.write_all(&masked_frame(0x89, &[0u8; 126])).await.unwrap();

        let error = reader.next().await.unwrap().unwrap_err();
        assert!(matches!(error, Error::ControlFramePayloadSize));

        // And sending one is refused locally before anything hits the wire
        assert!(writer.send_ping(vec![0u8; 126]).await.is_err());
    }

    #[tokio::test]
    async fn test_fragmented_control_frame_rejected() {
        let (mut raw, tcp) = tcp_pair().await;
        let conn = server_side(tcp);
        let (mut reader, _writer) = conn.split();

        // Ping with FIN=0
        raw.write_all(&masked_frame(0x09, &[0x01])).await.unwrap();

        let error = reader.next().await.unwrap().unwrap_err();
        assert!(matches!(error, Error::ControlFramesFragmented));
    }

    #[tokio::test]
    async fn test_non_minimal_length_lenient_and_strict() {
        // Default profile accepts a 16-bit length that would fit in 7 bits
        let (mut raw, tcp) = tcp_pair().await;
        let conn = server_side(tcp);
        let (mut reader, _writer) = conn.split();

        let mut frame = vec![0x81, 0x80 | 126, 0x00, 0x05];
        frame.extend_from_slice(&TEST_MASK);
        let mut body = b"Hello".to_vec();
        apply_mask(&mut body, TEST_MASK);
        frame.extend_from_slice(&body);
        raw.write_all(&frame).await.unwrap();

        let message = reader.next().await.unwrap().unwrap();
        assert_eq!(message, Message::Text("Hello".to_string()));

        // The strict profile rejects the same bytes
        let (mut raw, tcp) = tcp_pair().await;
        let config = WebSocketConfig {
            strict_length_decoding: true,
            ..Default::default()
        };
        let conn = server_side_with_config(tcp, config);
        let (mut reader, _writer) = conn.split();

        let mut frame = vec![0x81, 0x80 | 126, 0x00, 0x05];
        frame.extend_from_slice(&TEST_MASK);
        let mut body = b"Hello".to_vec();
        apply_mask(&mut body, TEST_MASK);
        frame.extend_from_slice(&body);
        raw.write_all(&frame).await.unwrap();

        let error = reader.next().await.unwrap().unwrap_err();
        assert!(matches!(error, Error::NonMinimalLengthEncoding));
    }

    #[tokio::test]
    async fn test_max_message_size_closes_1009() {
        let (mut raw, tcp) = tcp_pair().await;
        let config = WebSocketConfig {
            max_message_size: Some(100),
            ..Default::default()
        };
        let conn = server_side_with_config(tcp, config);
        let (mut reader, _writer) = conn.split();

        raw.write_all(&masked_frame(0x81, &[b'a'; 200])).await.unwrap();

        let error = reader.next().await.unwrap().unwrap_err();
        assert!(matches!(error, Error::MaxMessageSize));

        let mut close = [0u8; 4];
        raw.read_exact(&mut close).await.unwrap();
        assert_eq!(close, [0x88, 0x02, 0x03, 0xF1]);
    }

    #[tokio::test]
    async fn test_fragmented_send_round_trip() {
        let (client_tcp, server_tcp) = tcp_pair().await;
        let server = server_side(server_tcp);
        let client = client_side(client_tcp);

        let (_server_reader, server_writer) = server.split();
        let (mut client_reader, _client_writer) = client.split();

        let data: Vec<u8> = (0..10_000).map(|i| (i % 255) as u8).collect();
        server_writer
            .send_fragmented(Message::Binary(data.clone()), 1024)
            .await
            .unwrap();

        let message = client_reader.next().await.unwrap().unwrap();
        assert_eq!(message, Message::Binary(data));
    }

    #[tokio::test]
    async fn test_empty_text_message_is_valid() {
        let (mut raw, tcp) = tcp_pair().await;
        let conn = server_side(tcp);
        let (mut reader, _writer) = conn.split();

        raw.write_all(&masked_frame(0x81, b"")).await.unwrap();

        let message = reader.next().await.unwrap().unwrap();
        assert_eq!(message, Message::Text(String::new()));
    }

    // ------------------------------------------------------------------
    // connection state machine

    #[tokio::test]
    async fn test_ping_pong_round_trip() {
        let (client_tcp, server_tcp) = tcp_pair().await;
        let server = server_side(server_tcp);
        let client = client_side(client_tcp);

        let (_server_reader, server_writer) = server.split();
        let (_client_reader, _client_writer) = client.split();

        // The client's receive task answers the ping by itself
        let alive = server_writer.ping(vec![0xDE, 0xAD]).await.unwrap();
        assert!(alive);
    }

    #[tokio::test]
    async fn test_ping_without_peer_times_out() {
        let (raw, tcp) = tcp_pair().await;
        let conn = server_side(tcp);
        let (_reader, writer) = conn.split();

        // Nobody answers; the server waits its 1 second and gives up
        let alive = writer.ping(Vec::new()).await.unwrap();
        assert!(!alive);
        drop(raw);
    }

    #[tokio::test]
    async fn test_close_handshake_clean() {
        let (client_tcp, server_tcp) = tcp_pair().await;
        let server = server_side(server_tcp);
        let client = client_side(client_tcp);

        let (mut server_reader, server_writer) = server.split();
        let (_client_reader, client_writer) = client.split();

        let was_clean = client_writer.close(CloseCode::Normal, "bye").await.unwrap();
        assert!(was_clean);
        assert_eq!(client_writer.ready_state(), ReadyState::Closed);

        // The server side saw the peer's close and ended its stream
        assert!(server_reader.next().await.is_none());
        assert_eq!(server_reader.ready_state(), ReadyState::Closed);
        let peer_close = server_reader.close_frame().unwrap();
        assert_eq!(peer_close.code, CloseCode::Normal);
        assert_eq!(peer_close.reason, "bye");

        // Close is idempotent once terminal
        let again = server_writer.close(CloseCode::Normal, "").await.unwrap();
        assert!(again);
        let again = client_writer.close(CloseCode::Normal, "").await.unwrap();
        assert!(again);
    }

    #[tokio::test]
    async fn test_close_reply_echoes_code() {
        let (mut raw, tcp) = tcp_pair().await;
        let conn = server_side(tcp);
        let (mut reader, _writer) = conn.split();

        let mut payload = 1000u16.to_be_bytes().to_vec();
        payload.extend_from_slice(b"bye");
        raw.write_all(&masked_frame(0x88, &payload)).await.unwrap();

        // Reply is a close with the same code and no reason
        let mut close = [0u8; 4];
        raw.read_exact(&mut close).await.unwrap();
        assert_eq!(close, [0x88, 0x02, 0x03, 0xE8]);

        assert!(reader.next().await.is_none());
        assert_eq!(reader.ready_state(), ReadyState::Closed);
    }

    #[tokio::test]
    async fn test_send_after_close_fails() {
        let (client_tcp, server_tcp) = tcp_pair().await;
        let server = server_side(server_tcp);
        let client = client_side(client_tcp);

        let (_server_reader, _server_writer) = server.split();
        let (_client_reader, client_writer) = client.split();

        client_writer.close(CloseCode::Normal, "").await.unwrap();
        let result = client_writer.send_as_text("late".to_string()).await;
        assert!(matches!(result, Err(Error::NotOpen)));
    }

    #[tokio::test]
    async fn test_abnormal_transport_failure_surfaces_1006() {
        let (raw, tcp) = tcp_pair().await;
        let conn = server_side(tcp);
        let (mut reader, _writer) = conn.split();

        // Peer vanishes mid-conversation
        drop(raw);

        let error = reader.next().await.unwrap().unwrap_err();
        assert!(error.close_code().is_none());
        assert_eq!(reader.ready_state(), ReadyState::Closed);
        let synthetic = reader.close_frame().unwrap();
        assert_eq!(synthetic.code, CloseCode::Abnormal);
    }

    #[tokio::test]
    async fn test_invalid_close_codes_refused_locally() {
        let (_raw, tcp) = tcp_pair().await;
        let conn = server_side(tcp);
        let (_reader, writer) = conn.split();

        for code in [CloseCode::NoStatus, CloseCode::Abnormal, CloseCode::TlsFailure] {
            assert!(writer.close(code, "").await.is_err());
        }
    }

    // ------------------------------------------------------------------
    // handshake

    #[tokio::test]
    async fn test_server_handshake_accepts_upgrade() {
        let (mut raw, tcp) = tcp_pair().await;
        let accept = tokio::spawn(accept_async(tcp));

        raw.write_all(
            b"GET /chat HTTP/1.1\r\n\
              Host: localhost\r\n\
              Upgrade: websocket\r\n\
              Connection: Upgrade\r\n\
              Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\
              Sec-WebSocket-Version: 13\r\n\r\n",
        )
        .await
        .unwrap();

        let mut response = Vec::new();
        let mut byte = [0u8; 1];
        while !response.ends_with(b"\r\n\r\n") {
            raw.read_exact(&mut byte).await.unwrap();
            response.push(byte[0]);
        }
        let response = String::from_utf8(response).unwrap();
        assert!(response.starts_with("HTTP/1.1 101 Switching Protocols"));
        assert!(response.contains("Sec-WebSocket-Accept: s3pPLMBiTxaQ9kYGzzhZRbK+xOo="));

        let connection = accept.await.unwrap().unwrap();
        assert_eq!(connection.ready_state(), ReadyState::Open);
        assert_eq!(connection.handshake_info().path, "/chat");
    }

    #[tokio::test]
    async fn test_server_handshake_rejects_bad_version() {
        let (mut raw, tcp) = tcp_pair().await;
        let accept = tokio::spawn(accept_async(tcp));

        raw.write_all(
            b"GET /chat HTTP/1.1\r\n\
              Host: localhost\r\n\
              Upgrade: websocket\r\n\
              Connection: Upgrade\r\n\
              Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\
              Sec-WebSocket-Version: 8\r\n\r\n",
        )
        .await
        .unwrap();

        assert!(accept.await.unwrap().is_err());
    }

    // ------------------------------------------------------------------
    // server, router and sessions

    async fn echo_server() -> (WebSocketServer, std::net::SocketAddr) {
        let server = WebSocketServer::new(ServerConfig::default());
        server.add_service("/echo", || Box::new(EchoBehavior));
        let addr = server.start("127.0.0.1:0").await.unwrap();
        (server, addr)
    }

    #[tokio::test]
    async fn test_end_to_end_echo() {
        let (server, addr) = echo_server().await;

        let mut connection = connect_async(&format!("ws://{}/echo", addr)).await.unwrap();
        assert_eq!(connection.ready_state(), ReadyState::Open);

        connection.send_as_text("Hello".to_string()).await.unwrap();
        let message = connection.next().await.unwrap().unwrap();
        assert_eq!(message, Message::Text("Hello".to_string()));

        let was_clean = connection.close(CloseCode::Normal, "").await.unwrap();
        assert!(was_clean);

        server.stop_normally().await;
    }

    #[tokio::test]
    async fn test_router_rejects_unknown_path() {
        let (server, addr) = echo_server().await;

        let result = connect_async(&format!("ws://{}/nope", addr)).await;
        assert!(matches!(result, Err(Error::HandshakeRejected(501))));

        server.stop_normally().await;
    }

    #[tokio::test]
    async fn test_router_normalizes_trailing_slash() {
        let (server, addr) = echo_server().await;

        let connection = connect_async(&format!("ws://{}/echo/", addr)).await.unwrap();
        assert_eq!(connection.ready_state(), ReadyState::Open);

        server.stop_normally().await;
    }

    #[tokio::test]
    async fn test_broadcast_reaches_every_session() {
        let (server, addr) = echo_server().await;
        let host = server.service("/echo").unwrap();

        let mut first = connect_async(&format!("ws://{}/echo", addr)).await.unwrap();
        let mut second = connect_async(&format!("ws://{}/echo", addr)).await.unwrap();
        sleep(Duration::from_millis(100)).await;
        assert_eq!(host.manager().len(), 2);

        let all_delivered = host
            .manager()
            .broadcast(Message::Text("room notice".to_string()))
            .await;
        assert!(all_delivered);

        for connection in [&mut first, &mut second] {
            let message = connection.next().await.unwrap().unwrap();
            assert_eq!(message, Message::Text("room notice".to_string()));
        }

        let answers = host.manager().broadping(Vec::new()).await;
        assert_eq!(answers.len(), 2);
        assert!(answers.values().all(|&alive| alive));

        server.stop_normally().await;
    }

    #[tokio::test]
    async fn test_broadcasts_keep_per_connection_order() {
        let (server, addr) = echo_server().await;
        let host = server.service("/echo").unwrap();

        let mut first = connect_async(&format!("ws://{}/echo", addr)).await.unwrap();
        let mut second = connect_async(&format!("ws://{}/echo", addr)).await.unwrap();
        sleep(Duration::from_millis(100)).await;

        host.manager().broadcast(Message::Text("one".to_string())).await;
        host.manager().broadcast(Message::Text("two".to_string())).await;

        for connection in [&mut first, &mut second] {
            let a = connection.next().await.unwrap().unwrap();
            let b = connection.next().await.unwrap().unwrap();
            assert_eq!(a, Message::Text("one".to_string()));
            assert_eq!(b, Message::Text("two".to_string()));
        }

        server.stop_normally().await;
    }

    #[tokio::test]
    async fn test_session_removed_after_close() {
        let (server, addr) = echo_server().await;
        let host = server.service("/echo").unwrap();

        let mut connection = connect_async(&format!("ws://{}/echo", addr)).await.unwrap();
        sleep(Duration::from_millis(100)).await;
        assert_eq!(host.manager().len(), 1);

        connection.close(CloseCode::Normal, "").await.unwrap();
        sleep(Duration::from_millis(200)).await;
        assert_eq!(host.manager().len(), 0);

        server.stop_normally().await;
    }

    #[tokio::test]
    async fn test_stop_closes_sessions_and_halts_service() {
        let (server, addr) = echo_server().await;
        let host = server.service("/echo").unwrap();

        let mut connection = connect_async(&format!("ws://{}/echo", addr)).await.unwrap();
        sleep(Duration::from_millis(100)).await;

        server.stop(CloseCode::Away, "maintenance").await;
        assert_eq!(host.manager().state(), ServiceState::Stopped);
        assert_eq!(host.manager().len(), 0);

        // The client observes the going-away close
        loop {
            match connection.next().await {
                Some(Ok(_)) => continue,
                Some(Err(_)) | None => break,
            }
        }
        assert_eq!(connection.ready_state(), ReadyState::Closed);

        // A stopped service refuses registrations; reconnects fail upstream
        let attempt = tokio::time::timeout(
            Duration::from_secs(5),
            connect_async(&format!("ws://{}/echo", addr)),
        )
        .await;
        assert!(!matches!(attempt, Ok(Ok(_))));
    }

    #[tokio::test]
    async fn test_sweep_keeps_live_sessions() {
        let (server, addr) = echo_server().await;
        let host = server.service("/echo").unwrap();

        let _connection = connect_async(&format!("ws://{}/echo", addr)).await.unwrap();
        sleep(Duration::from_millis(100)).await;
        assert_eq!(host.manager().len(), 1);

        // A session that answers its ping survives the sweep
        host.manager().sweep().await;
        assert_eq!(host.manager().len(), 1);

        server.stop_normally().await;

        // Once the service left Started, the sweep is a no-op
        assert_eq!(host.manager().state(), ServiceState::Stopped);
        host.manager().sweep().await;
    }

    #[tokio::test]
    async fn test_deflate_negotiated_end_to_end() {
        let mut server_config = ServerConfig::default();
        server_config.enable_deflate = true;
        let server = WebSocketServer::new(server_config);
        server.add_service("/echo", || Box::new(EchoBehavior));
        let addr = server.start("127.0.0.1:0").await.unwrap();

        let mut client_config = ClientConfig::default();
        client_config.enable_deflate = true;
        let mut connection =
            connect_async_with_config(&format!("ws://{}/echo", addr), Some(client_config))
                .await
                .unwrap();

        let negotiated = connection.handshake_info().extensions.clone().unwrap();
        assert!(negotiated.permessage_deflate);

        let text = "compress me ".repeat(500);
        connection.send_as_text(text.clone()).await.unwrap();
        let message = connection.next().await.unwrap().unwrap();
        assert_eq!(message, Message::Text(text));

        server.stop_normally().await;
    }

    #[tokio::test]
    async fn test_subprotocol_negotiation() {
        let mut server_config = ServerConfig::default();
        server_config.subprotocols = vec!["superchat".to_string(), "chat".to_string()];
        let server = WebSocketServer::new(server_config);
        server.add_service("/echo", || Box::new(EchoBehavior));
        let addr = server.start("127.0.0.1:0").await.unwrap();

        let mut client_config = ClientConfig::default();
        client_config.subprotocols = vec!["chat".to_string()];
        let connection =
            connect_async_with_config(&format!("ws://{}/echo", addr), Some(client_config))
                .await
                .unwrap();

        assert_eq!(
            connection.handshake_info().subprotocol.as_deref(),
            Some("chat")
        );

        server.stop_normally().await;
    }

    // ------------------------------------------------------------------
    // plain HTTP front door

    #[tokio::test]
    async fn test_plain_request_gets_404_and_keep_alive() {
        let (server, addr) = echo_server().await;

        let mut raw = TcpStream::connect(addr).await.unwrap();
        raw.write_all(b"GET /index.html HTTP/1.1\r\nHost: localhost\r\n\r\n")
            .await
            .unwrap();

        let mut response = read_http_response(&mut raw).await;
        assert!(response.starts_with("HTTP/1.1 404"));
        assert!(response.contains("Connection: keep-alive"));

        // Same connection serves a second request
        raw.write_all(b"GET /also-missing HTTP/1.1\r\nHost: localhost\r\n\r\n")
            .await
            .unwrap();
        response = read_http_response(&mut raw).await;
        assert!(response.starts_with("HTTP/1.1 404"));

        server.stop_normally().await;
    }

    #[tokio::test]
    async fn test_post_gets_501_and_expect_continue() {
        let (server, addr) = echo_server().await;

        let mut raw = TcpStream::connect(addr).await.unwrap();
        raw.write_all(
            b"POST /submit HTTP/1.1\r\n\
              Host: localhost\r\n\
              Expect: 100-continue\r\n\
              Content-Length: 4\r\n\r\n",
        )
        .await
        .unwrap();

        // The interim response comes before the body is read
        let interim = read_http_response(&mut raw).await;
        assert!(interim.starts_with("HTTP/1.1 100 Continue"));

        raw.write_all(b"data").await.unwrap();
        let response = read_http_response(&mut raw).await;
        assert!(response.starts_with("HTTP/1.1 501"));

        server.stop_normally().await;
    }

    #[tokio::test]
    async fn test_chunked_request_body_is_drained() {
        let (server, addr) = echo_server().await;

        let mut raw = TcpStream::connect(addr).await.unwrap();
        raw.write_all(
            b"POST /submit HTTP/1.1\r\n\
              Host: localhost\r\n\
              Transfer-Encoding: chunked\r\n\r\n\
              4\r\ndata\r\n0\r\n\r\n",
        )
        .await
        .unwrap();

        let response = read_http_response(&mut raw).await;
        assert!(response.starts_with("HTTP/1.1 501"));

        // The chunked body was consumed, so the connection is reusable
        raw.write_all(b"GET /missing HTTP/1.1\r\nHost: localhost\r\n\r\n")
            .await
            .unwrap();
        let response = read_http_response(&mut raw).await;
        assert!(response.starts_with("HTTP/1.1 404"));

        server.stop_normally().await;
    }

    #[tokio::test]
    async fn test_oversized_header_block_gets_400() {
        let (server, addr) = echo_server().await;

        let mut raw = TcpStream::connect(addr).await.unwrap();
        // Just past the 32 KiB cap, small enough to sit in the socket
        // buffers before the server answers
        let huge = format!(
            "GET / HTTP/1.1\r\nHost: localhost\r\nX-Filler: {}\r\n\r\n",
            "a".repeat(33 * 1024)
        );
        raw.write_all(huge.as_bytes()).await.unwrap();

        let response = read_http_response(&mut raw).await;
        assert!(response.starts_with("HTTP/1.1 400"));
        assert!(response.contains("Connection: close"));

        server.stop_normally().await;
    }

    async fn read_http_response(stream: &mut TcpStream) -> String {
        let mut response = Vec::new();
        let mut byte = [0u8; 1];
        while !response.ends_with(b"\r\n\r\n") {
            stream.read_exact(&mut byte).await.unwrap();
            response.push(byte[0]);
        }
        String::from_utf8(response).unwrap()
    }

    #[tokio::test]
    async fn test_chunked_response_encoding() {
        let response =
            HttpResponse::new(200).with_chunked_body(vec![b"hello ".to_vec(), b"world".to_vec()]);
        let mut out = Vec::new();
        {
            let mut cursor = std::io::Cursor::new(&mut out);
            response.write_to(&mut cursor).await.unwrap();
        }
        let text = String::from_utf8(out).unwrap();
        assert!(text.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(text.contains("Transfer-Encoding: chunked\r\n"));
        assert!(text.contains("6\r\nhello \r\n"));
        assert!(text.contains("5\r\nworld\r\n"));
        assert!(text.ends_with("0\r\n\r\n"));
    }

    #[tokio::test]
    async fn test_text_response_strips_preamble() {
        let response = HttpResponse::new(200).with_text_body("\u{feff}not found");
        let mut out = Vec::new();
        {
            let mut cursor = std::io::Cursor::new(&mut out);
            response.write_to(&mut cursor).await.unwrap();
        }
        let text = String::from_utf8(out).unwrap();
        assert!(text.contains("Content-Length: 9\r\n"));
        assert!(text.ends_with("not found"));
    }
}
