#![deny(rust_2018_idioms)]

use std::future::Future;
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::sync::mpsc;
use std::thread;
use std::time::Duration;

use cadente::ws::Message;
use cadente::{Context, Endpoint, Engine, ServerConfig};

fn config() -> ServerConfig {
    ServerConfig {
        endpoints: vec![Endpoint::http("127.0.0.1", 0)],
        ..ServerConfig::default()
    }
}

struct Serve {
    addr: SocketAddr,
    stop_tx: Option<mpsc::Sender<()>>,
    thread: Option<thread::JoinHandle<()>>,
}

fn serve_with<F, Fut>(handler: F) -> Serve
where
    F: Fn(Context) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    let _ = pretty_env_logger::try_init();
    let (addr_tx, addr_rx) = mpsc::channel();
    let (stop_tx, stop_rx) = mpsc::channel::<()>();
    let thread = thread::spawn(move || {
        let rt = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .enable_all()
            .build()
            .expect("rt build");
        rt.block_on(async move {
            let engine = Engine::new(config());
            engine.set_handler(handler);
            engine.start().await.expect("engine start");
            let addr = engine.local_addrs().await[0];
            addr_tx.send(addr).expect("send addr");
            let _ = tokio::task::spawn_blocking(move || stop_rx.recv()).await;
            engine.stop().await;
        });
    });
    Serve {
        addr: addr_rx.recv().expect("engine never started"),
        stop_tx: Some(stop_tx),
        thread: Some(thread),
    }
}

impl Drop for Serve {
    fn drop(&mut self) {
        drop(self.stop_tx.take());
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

fn connect(addr: SocketAddr) -> TcpStream {
    let req = TcpStream::connect(addr).unwrap();
    req.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
    req
}

fn read_head(req: &mut TcpStream) -> String {
    let mut raw = Vec::new();
    let mut byte = [0u8; 1];
    while !raw.ends_with(b"\r\n\r\n") {
        let n = req.read(&mut byte).expect("read head");
        assert!(n > 0, "eof before end of head");
        raw.push(byte[0]);
    }
    String::from_utf8(raw).unwrap()
}

fn handshake_request(extra: &str) -> String {
    format!(
        "GET /chat HTTP/1.1\r\n\
         Host: h\r\n\
         Upgrade: websocket\r\n\
         Connection: Upgrade\r\n\
         Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\
         Sec-WebSocket-Version: 13\r\n\
         {}\r\n",
        extra
    )
}

/// Client-side frame with the mandatory mask applied.
fn masked_frame(opcode: u8, payload: &[u8]) -> Vec<u8> {
    let mask = [0xA1, 0xB2, 0xC3, 0xD4];
    assert!(payload.len() <= 125, "test helper only writes small frames");
    let mut raw = vec![0x80 | opcode, 0x80 | payload.len() as u8];
    raw.extend_from_slice(&mask);
    raw.extend(payload.iter().enumerate().map(|(i, b)| b ^ mask[i % 4]));
    raw
}

fn read_exact(req: &mut TcpStream, n: usize) -> Vec<u8> {
    let mut raw = vec![0u8; n];
    req.read_exact(&mut raw).expect("read_exact");
    raw
}

#[test]
fn handshake_echo_ping_close() {
    let server = serve_with(|ctx| async move {
        let mut ws = ctx.accept_websocket(None).await.expect("accept");
        loop {
            match ws.recv().await.expect("recv") {
                Message::Text(text) => ws.send_text(&text).await.expect("echo"),
                Message::Binary(data) => ws.send_binary(&data).await.expect("echo"),
                Message::Close(_) => break,
            }
        }
    });

    let mut req = connect(server.addr);
    req.write_all(handshake_request("").as_bytes()).unwrap();

    let head = read_head(&mut req);
    assert!(
        head.starts_with("HTTP/1.1 101 Switching Protocols\r\n"),
        "head: {}",
        head
    );
    assert!(head.contains("sec-websocket-accept: s3pPLMBiTxaQ9kYGzzhZRbK+xOo=\r\n"));
    assert!(head.contains("upgrade: websocket\r\n"));

    // text echo comes back unmasked
    req.write_all(&masked_frame(0x1, b"hi")).unwrap();
    assert_eq!(read_exact(&mut req, 4), [0x81, 0x02, b'h', b'i']);

    // pings are answered without surfacing to the handler
    req.write_all(&masked_frame(0x9, b"p")).unwrap();
    assert_eq!(read_exact(&mut req, 3), [0x8A, 0x01, b'p']);

    // close is echoed with the same code
    req.write_all(&masked_frame(0x8, &[0x03, 0xE8])).unwrap();
    assert_eq!(read_exact(&mut req, 4), [0x88, 0x02, 0x03, 0xE8]);
}

#[test]
fn fragmented_text_is_reassembled() {
    let server = serve_with(|ctx| async move {
        let mut ws = ctx.accept_websocket(None).await.expect("accept");
        if let Message::Text(text) = ws.recv().await.expect("recv") {
            ws.send_text(&text).await.expect("echo");
        }
    });

    let mut req = connect(server.addr);
    req.write_all(handshake_request("").as_bytes()).unwrap();
    read_head(&mut req);

    // "hel" + "lo" across a continuation frame
    let mask = [0x01, 0x02, 0x03, 0x04];
    let mut first = vec![0x01, 0x83];
    first.extend_from_slice(&mask);
    first.extend(b"hel".iter().enumerate().map(|(i, b)| b ^ mask[i % 4]));
    req.write_all(&first).unwrap();

    let mut last = vec![0x80, 0x82];
    last.extend_from_slice(&mask);
    last.extend(b"lo".iter().enumerate().map(|(i, b)| b ^ mask[i % 4]));
    req.write_all(&last).unwrap();

    assert_eq!(
        read_exact(&mut req, 7),
        [0x81, 0x05, b'h', b'e', b'l', b'l', b'o']
    );
}

#[test]
fn subprotocol_is_echoed_when_offered() {
    let server = serve_with(|ctx| async move {
        let ws = ctx.accept_websocket(Some("chat")).await.expect("accept");
        assert_eq!(ws.subprotocol(), Some("chat"));
    });

    let mut req = connect(server.addr);
    req.write_all(
        handshake_request("Sec-WebSocket-Protocol: superchat, chat\r\n").as_bytes(),
    )
    .unwrap();

    let head = read_head(&mut req);
    assert!(head.starts_with("HTTP/1.1 101 "), "head: {}", head);
    assert!(head.contains("sec-websocket-protocol: chat\r\n"), "head: {}", head);
}

#[test]
fn subprotocol_mismatch_yields_426() {
    let server = serve_with(|ctx| async move {
        let err = ctx.accept_websocket(Some("chat")).await.unwrap_err();
        assert!(err.is_upgrade());
    });

    let mut req = connect(server.addr);
    req.write_all(handshake_request("Sec-WebSocket-Protocol: graphql-ws\r\n").as_bytes())
        .unwrap();

    let head = read_head(&mut req);
    assert!(head.starts_with("HTTP/1.1 426 "), "head: {}", head);
}

#[test]
fn malformed_handshake_yields_400() {
    let server = serve_with(|ctx| async move {
        let err = ctx.accept_websocket(None).await.unwrap_err();
        assert!(err.is_upgrade());
    });

    let mut req = connect(server.addr);
    // missing Sec-WebSocket-Key entirely
    req.write_all(
        b"GET /chat HTTP/1.1\r\n\
          Host: h\r\n\
          Upgrade: websocket\r\n\
          Connection: Upgrade\r\n\
          Sec-WebSocket-Version: 13\r\n\
          \r\n",
    )
    .unwrap();

    let head = read_head(&mut req);
    assert!(head.starts_with("HTTP/1.1 400 "), "head: {}", head);
}
