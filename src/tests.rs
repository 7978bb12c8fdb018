//! End-to-end tests driving a real server over TCP with hand-built
//! frames, so the bytes on the wire are exactly what a conforming client
//! would produce.

use crate::frame::OpCode;
use crate::server::start_server;
use crate::WsServer;
use std::net::SocketAddr;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

const MASK: [u8; 4] = [0x01, 0x02, 0x03, 0x04];

async fn spawn_server() -> (WsServer, SocketAddr) {
    let server = start_server(0).await.unwrap();
    let addr = SocketAddr::from(([127, 0, 0, 1], server.local_addr().port()));
    (server, addr)
}

async fn read_http_response(stream: &mut TcpStream) -> String {
    let mut buf = Vec::new();
    let mut byte = [0u8; 1];
    while !buf.ends_with(b"\r\n\r\n") {
        stream.read_exact(&mut byte).await.unwrap();
        buf.push(byte[0]);
    }
    String::from_utf8(buf).unwrap()
}

async fn connect_and_upgrade(addr: SocketAddr, path: &str, extensions: Option<&str>) -> TcpStream {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    let mut request = format!(
        "GET {path} HTTP/1.1\r\n\
         Host: localhost\r\n\
         Upgrade: websocket\r\n\
         Connection: Upgrade\r\n\
         Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\
         Sec-WebSocket-Version: 13\r\n"
    );
    if let Some(extensions) = extensions {
        request.push_str(&format!("Sec-WebSocket-Extensions: {extensions}\r\n"));
    }
    request.push_str("\r\n");
    stream.write_all(request.as_bytes()).await.unwrap();

    let response = read_http_response(&mut stream).await;
    assert!(response.starts_with("HTTP/1.1 101 Switching Protocols"));
    // accept key for the RFC sample nonce
    assert!(response.contains("Sec-WebSocket-Accept: s3pPLMBiTxaQ9kYGzzhZRbK+xOo="));
    stream
}

/// Build a masked client-to-server frame.
fn client_frame(first_byte: u8, payload: &[u8]) -> Vec<u8> {
    let mut frame = vec![first_byte];
    if payload.len() < 126 {
        frame.push(0x80 | payload.len() as u8);
    } else if payload.len() <= 65535 {
        frame.push(0x80 | 126);
        frame.extend_from_slice(&(payload.len() as u16).to_be_bytes());
    } else {
        frame.push(0x80 | 127);
        frame.extend_from_slice(&(payload.len() as u64).to_be_bytes());
    }
    frame.extend_from_slice(&MASK);
    frame.extend(payload.iter().enumerate().map(|(i, byte)| byte ^ MASK[i % 4]));
    frame
}

async fn read_server_frame(stream: &mut TcpStream) -> (u8, Vec<u8>) {
    let mut head = [0u8; 2];
    stream.read_exact(&mut head).await.unwrap();
    assert_eq!(head[1] & 0x80, 0, "server frames must not be masked");

    let mut len = (head[1] & 0x7F) as usize;
    if len == 126 {
        let mut ext = [0u8; 2];
        stream.read_exact(&mut ext).await.unwrap();
        len = u16::from_be_bytes(ext) as usize;
    } else if len == 127 {
        let mut ext = [0u8; 8];
        stream.read_exact(&mut ext).await.unwrap();
        len = u64::from_be_bytes(ext) as usize;
    }

    let mut payload = vec![0u8; len];
    stream.read_exact(&mut payload).await.unwrap();
    (head[0], payload)
}

fn client_deflate(payload: &[u8]) -> Vec<u8> {
    use flate2::{Compress, Compression, FlushCompress};
    let mut stream = Compress::new_with_window_bits(Compression::new(6), false, 15);
    let mut out = vec![0u8; payload.len() + 1024];
    stream
        .compress(payload, &mut out, FlushCompress::Sync)
        .unwrap();
    let produced = stream.total_out() as usize;
    assert_eq!(&out[produced - 4..produced], &[0x00, 0x00, 0xFF, 0xFF]);
    out.truncate(produced - 4);
    out
}

fn client_inflate(data: &[u8]) -> Vec<u8> {
    use flate2::{Decompress, FlushDecompress};
    let mut stream = Decompress::new_with_window_bits(false, 15);
    let mut input = data.to_vec();
    input.extend_from_slice(&[0x00, 0x00, 0xFF, 0xFF]);
    let mut out = Vec::with_capacity(1024 * 1024);
    stream
        .decompress_vec(&input, &mut out, FlushDecompress::Sync)
        .unwrap();
    out
}

#[tokio::test]
async fn test_echo_single_text_message() {
    let (server, addr) = spawn_server().await;
    let mut stream = connect_and_upgrade(addr, "/echo", None).await;

    // masked TEXT "hi", exactly the on-wire bytes of the protocol example
    let frame = client_frame(0x81, b"hi");
    assert_eq!(frame, [0x81, 0x82, 0x01, 0x02, 0x03, 0x04, 0x69, 0x6B]);
    stream.write_all(&frame).await.unwrap();

    let (first_byte, payload) = read_server_frame(&mut stream).await;
    assert_eq!(first_byte, 0x81);
    assert_eq!(payload, b"hi");

    server.shutdown().await;
}

#[tokio::test]
async fn test_fragmented_message_with_interleaved_ping() {
    let (server, addr) = spawn_server().await;
    let mut stream = connect_and_upgrade(addr, "/echo", None).await;

    // TEXT "foo" FIN=0, then a PING, then CONTINUATION "bar" FIN=1
    let mut bytes = client_frame(0x01, b"foo");
    bytes.extend_from_slice(&client_frame(0x89, b"x"));
    bytes.extend_from_slice(&client_frame(0x80, b"bar"));
    stream.write_all(&bytes).await.unwrap();

    // the ping is answered immediately, between the fragments
    let (first_byte, payload) = read_server_frame(&mut stream).await;
    assert_eq!(first_byte, 0x8A);
    assert_eq!(payload, b"x");

    // the reassembled message is echoed exactly once
    let (first_byte, payload) = read_server_frame(&mut stream).await;
    assert_eq!(first_byte, 0x81);
    assert_eq!(payload, b"foobar");

    server.shutdown().await;
}

#[tokio::test]
async fn test_compressed_echo_round_trip() {
    let (server, addr) = spawn_server().await;
    let mut stream = connect_and_upgrade(addr, "/echo", Some("permessage-deflate")).await;

    let message = "A".repeat(1024);
    let compressed = client_deflate(message.as_bytes());
    assert!(compressed.len() < message.len());

    // FIN | RSV1 | TEXT
    stream
        .write_all(&client_frame(0xC1, &compressed))
        .await
        .unwrap();

    let (first_byte, payload) = read_server_frame(&mut stream).await;
    assert_eq!(first_byte, 0xC1, "echo of a large payload is compressed");
    assert_eq!(client_inflate(&payload), message.as_bytes());

    server.shutdown().await;
}

#[tokio::test]
async fn test_binary_echo_with_fragmented_upload() {
    let (server, addr) = spawn_server().await;
    let mut stream = connect_and_upgrade(addr, "/echo", None).await;

    let part_one = vec![0xAB; 300];
    let part_two = vec![0xCD; 300];
    let mut bytes = client_frame(0x02, &part_one);
    bytes.extend_from_slice(&client_frame(0x80, &part_two));
    stream.write_all(&bytes).await.unwrap();

    let (first_byte, payload) = read_server_frame(&mut stream).await;
    assert_eq!(first_byte, 0x82);
    assert_eq!(&payload[..300], part_one.as_slice());
    assert_eq!(&payload[300..], part_two.as_slice());

    server.shutdown().await;
}

#[tokio::test]
async fn test_closing_handshake_initiated_by_peer() {
    let (server, addr) = spawn_server().await;
    let mut stream = connect_and_upgrade(addr, "/echo", None).await;

    let mut close_payload = 1000u16.to_be_bytes().to_vec();
    close_payload.extend_from_slice(b"bye");
    stream
        .write_all(&client_frame(0x88, &close_payload))
        .await
        .unwrap();

    // the server echoes the close and then drops the TCP connection
    let (first_byte, payload) = read_server_frame(&mut stream).await;
    assert_eq!(first_byte, 0x88);
    assert_eq!(&payload[..2], &1000u16.to_be_bytes());
    assert_eq!(&payload[2..], b"bye");

    let mut rest = Vec::new();
    stream.read_to_end(&mut rest).await.unwrap();
    assert!(rest.is_empty());

    server.shutdown().await;
}

#[tokio::test]
async fn test_invalid_close_code_is_rejected() {
    let (server, addr) = spawn_server().await;
    let mut stream = connect_and_upgrade(addr, "/echo", None).await;

    stream
        .write_all(&client_frame(0x88, &1099u16.to_be_bytes()))
        .await
        .unwrap();

    let (first_byte, payload) = read_server_frame(&mut stream).await;
    assert_eq!(first_byte, 0x88);
    assert_eq!(&payload[..2], &1002u16.to_be_bytes());
    assert_eq!(&payload[2..], b"Invalid close code");

    server.shutdown().await;
}

#[tokio::test]
async fn test_text_frame_during_fragmented_message_is_protocol_error() {
    let (server, addr) = spawn_server().await;
    let mut stream = connect_and_upgrade(addr, "/echo", None).await;

    let mut bytes = client_frame(0x01, b"start");
    bytes.extend_from_slice(&client_frame(0x81, b"intruder"));
    stream.write_all(&bytes).await.unwrap();

    let (first_byte, payload) = read_server_frame(&mut stream).await;
    assert_eq!(first_byte, 0x88);
    assert_eq!(&payload[..2], &1002u16.to_be_bytes());

    server.shutdown().await;
}

#[tokio::test]
async fn test_invalid_utf8_text_closes_with_1007() {
    let (server, addr) = spawn_server().await;
    let mut stream = connect_and_upgrade(addr, "/echo", None).await;

    stream
        .write_all(&client_frame(0x81, &[0xC3, 0x28]))
        .await
        .unwrap();

    let (first_byte, payload) = read_server_frame(&mut stream).await;
    assert_eq!(first_byte, 0x88);
    assert_eq!(&payload[..2], &1007u16.to_be_bytes());

    server.shutdown().await;
}

#[tokio::test]
async fn test_partial_utf8_rejected_only_after_reassembly() {
    let (server, addr) = spawn_server().await;
    let mut stream = connect_and_upgrade(addr, "/echo", None).await;

    // a 2-byte UTF-8 sequence split across fragments is fine once whole
    let euro = "€".as_bytes();
    let mut bytes = client_frame(0x01, &euro[..1]);
    bytes.extend_from_slice(&client_frame(0x80, &euro[1..]));
    stream.write_all(&bytes).await.unwrap();

    let (first_byte, payload) = read_server_frame(&mut stream).await;
    assert_eq!(first_byte, 0x81);
    assert_eq!(payload, euro);

    server.shutdown().await;
}

#[tokio::test]
async fn test_unknown_sub_protocol_is_rejected() {
    let (server, addr) = spawn_server().await;

    let mut stream = TcpStream::connect(addr).await.unwrap();
    let request = "GET /nope HTTP/1.1\r\nHost: localhost\r\nUpgrade: websocket\r\n\
                   Connection: Upgrade\r\nSec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\
                   Sec-WebSocket-Version: 13\r\n\r\n";
    stream.write_all(request.as_bytes()).await.unwrap();

    let response = read_http_response(&mut stream).await;
    assert!(response.starts_with("HTTP/1.1 400 Bad Request"));

    server.shutdown().await;
}

#[tokio::test]
async fn test_server_side_send_and_broadcast() {
    let (server, addr) = spawn_server().await;
    let mut stream = connect_and_upgrade(addr, "/echo", None).await;

    // run one echo round trip so the client is certainly registered and
    // owned by its worker
    stream.write_all(&client_frame(0x81, b"sync")).await.unwrap();
    let (_, payload) = read_server_frame(&mut stream).await;
    assert_eq!(payload, b"sync");
    assert_eq!(server.active_clients(), 1);

    server.broadcast(b"to everyone".to_vec(), OpCode::Text);
    let (first_byte, payload) = read_server_frame(&mut stream).await;
    assert_eq!(first_byte, 0x81);
    assert_eq!(payload, b"to everyone");

    assert!(server.send_text(1, "just you"));
    let (_, payload) = read_server_frame(&mut stream).await;
    assert_eq!(payload, b"just you");

    server.shutdown().await;
}

#[tokio::test]
async fn test_shutdown_sends_going_away() {
    let (server, addr) = spawn_server().await;
    let mut stream = connect_and_upgrade(addr, "/echo", None).await;

    stream.write_all(&client_frame(0x81, b"sync")).await.unwrap();
    let (_, payload) = read_server_frame(&mut stream).await;
    assert_eq!(payload, b"sync");

    server.shutdown().await;

    let (first_byte, payload) = read_server_frame(&mut stream).await;
    assert_eq!(first_byte, 0x88);
    assert_eq!(&payload[..2], &1001u16.to_be_bytes());
}
