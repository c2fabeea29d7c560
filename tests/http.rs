//! End-to-end HTTP tests against a real server on a real socket.
//!
//! The server runs on its own thread with a current-thread runtime; the
//! client side speaks raw HTTP over `std::net::TcpStream`.

use asupersync::runtime::RuntimeBuilder;
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::sync::mpsc;
use std::thread::JoinHandle;
use std::time::Duration;
use wharf::{http_handler, HttpHandler, Response, Server, ServerConfig, ServerHandle, WsSelector};

struct TestServer {
    addr: SocketAddr,
    handle: ServerHandle,
    thread: Option<JoinHandle<()>>,
}

impl TestServer {
    fn start(config: ServerConfig, http: HttpHandler, ws: Option<WsSelector>) -> Self {
        let (addr_tx, addr_rx) = mpsc::channel::<(SocketAddr, ServerHandle)>();
        let thread = std::thread::spawn(move || {
            let rt = RuntimeBuilder::current_thread()
                .build()
                .expect("test runtime must build");
            let runtime_handle = rt.handle();
            rt.block_on(async move {
                let cx = asupersync::Cx::for_testing();
                let server = Server::bind(config, http, ws).await.expect("bind must succeed");
                addr_tx
                    .send((server.local_addr(), server.handle()))
                    .expect("addr send must succeed");
                let _ = server.run(&cx, &runtime_handle).await;
            });
        });
        let (addr, handle) = addr_rx
            .recv_timeout(Duration::from_secs(5))
            .expect("server must report addr");
        Self {
            addr,
            handle,
            thread: Some(thread),
        }
    }

    fn connect(&self) -> TcpStream {
        let stream = TcpStream::connect(self.addr).expect("connect");
        stream
            .set_read_timeout(Some(Duration::from_secs(2)))
            .expect("set read timeout");
        stream
            .set_write_timeout(Some(Duration::from_secs(2)))
            .expect("set write timeout");
        stream
    }

    /// Round-trip one request; the server closes after the response.
    fn exchange(&self, request: &[u8]) -> String {
        let mut stream = self.connect();
        stream.write_all(request).expect("write request");
        let mut response = Vec::new();
        stream.read_to_end(&mut response).expect("read response");
        String::from_utf8_lossy(&response).into_owned()
    }

    fn stop(mut self) {
        self.handle.stop();
        // Wake accept() so the loop observes the stop flag.
        drop(TcpStream::connect(self.addr));
        if let Some(thread) = self.thread.take() {
            thread.join().expect("server thread join");
        }
    }
}

fn echo_server() -> TestServer {
    let http = http_handler(|request| async move {
        let body = format!(
            "{} {} q={}",
            request.method(),
            request.path(),
            request.query().get("q").unwrap_or("-"),
        );
        Ok(Response::text(body))
    });
    TestServer::start(
        ServerConfig::new(0).with_bind_address("127.0.0.1"),
        http,
        None,
    )
}

#[test]
fn get_is_answered_with_http10_and_connection_close() {
    let server = echo_server();
    let response = server.exchange(b"GET /hello HTTP/1.1\r\nHost: x\r\n\r\n");

    assert!(
        response.starts_with("HTTP/1.0 200 OK\r\n"),
        "unexpected status line:\n{response}"
    );
    assert!(response.contains("Connection: close\r\n"));
    assert!(response.contains("Content-Type: text/plain; charset=UTF-8\r\n"));
    assert!(response.contains(&format!("Server: {}\r\n", wharf::SERVER_BANNER)));
    assert!(response.contains("Date: "));
    assert!(response.ends_with("GET /hello q=-"));

    server.stop();
}

#[test]
fn query_and_percent_decoding_reach_the_handler() {
    let server = echo_server();
    let response = server.exchange(b"GET /caf%C3%A9?q=a%2Bb&q=2 HTTP/1.1\r\nHost: x\r\n\r\n");
    assert!(
        response.ends_with("GET /caf\u{e9} q=a+b"),
        "unexpected body:\n{response}"
    );
    server.stop();
}

#[test]
fn head_has_headers_and_content_length_but_no_body() {
    let server = echo_server();
    let response = server.exchange(b"HEAD /probe HTTP/1.1\r\nHost: x\r\n\r\n");

    assert!(response.starts_with("HTTP/1.0 200 OK\r\n"));
    let expected_body = "HEAD /probe q=-";
    assert!(response.contains(&format!("Content-Length: {}\r\n", expected_body.len())));
    assert!(
        response.ends_with("\r\n\r\n"),
        "HEAD response must not carry a body:\n{response}"
    );

    server.stop();
}

#[test]
fn post_body_reaches_the_handler() {
    let http = http_handler(|request| async move {
        Ok(Response::text(format!(
            "len={} body={}",
            request.body().len(),
            String::from_utf8_lossy(request.body()),
        )))
    });
    let server = TestServer::start(
        ServerConfig::new(0).with_bind_address("127.0.0.1"),
        http,
        None,
    );

    let response =
        server.exchange(b"POST /submit HTTP/1.1\r\nHost: x\r\nContent-Length: 11\r\n\r\nhello world");
    assert!(response.ends_with("len=11 body=hello world"));

    server.stop();
}

#[test]
fn bad_request_line_is_answered_with_400() {
    let server = echo_server();
    let response = server.exchange(b"NONSENSE\r\n\r\n");
    assert!(
        response.starts_with("HTTP/1.0 400 Bad Request\r\n"),
        "unexpected response:\n{response}"
    );
    server.stop();
}

#[test]
fn chunked_transfer_encoding_is_answered_with_400() {
    let server = echo_server();
    let response = server
        .exchange(b"POST / HTTP/1.1\r\nHost: x\r\nTransfer-Encoding: chunked\r\n\r\n0\r\n\r\n");
    assert!(
        response.starts_with("HTTP/1.0 400 Bad Request\r\n"),
        "unexpected response:\n{response}"
    );
    server.stop();
}

#[test]
fn oversize_declared_body_is_answered_with_413() {
    let http = http_handler(|_request| async move { Ok(Response::text("unreachable")) });
    let server = TestServer::start(
        ServerConfig::new(0)
            .with_bind_address("127.0.0.1")
            .with_max_request_body_bytes(64),
        http,
        None,
    );

    let response =
        server.exchange(b"POST / HTTP/1.1\r\nHost: x\r\nContent-Length: 1000000\r\n\r\n");
    assert!(
        response.starts_with("HTTP/1.0 413 Payload Too Large\r\n"),
        "unexpected response:\n{response}"
    );

    server.stop();
}

#[test]
fn handler_error_is_answered_with_500_and_error_text() {
    let http = http_handler(|_request| async move {
        Err::<Response, _>("database exploded".into())
    });
    let server = TestServer::start(
        ServerConfig::new(0).with_bind_address("127.0.0.1"),
        http,
        None,
    );

    let response = server.exchange(b"GET / HTTP/1.1\r\nHost: x\r\n\r\n");
    assert!(response.starts_with("HTTP/1.0 500 Internal Server Error\r\n"));
    assert!(response.ends_with("database exploded"));

    server.stop();
}

#[test]
fn handler_status_and_extra_headers_are_forwarded() {
    let http = http_handler(|_request| async move {
        Ok(Response::not_found().with_header("X-Trace", "abc123"))
    });
    let server = TestServer::start(
        ServerConfig::new(0).with_bind_address("127.0.0.1"),
        http,
        None,
    );

    let response = server.exchange(b"GET /missing HTTP/1.1\r\nHost: x\r\n\r\n");
    assert!(response.starts_with("HTTP/1.0 404 Not Found\r\n"));
    assert!(response.contains("X-Trace: abc123\r\n"));

    server.stop();
}

#[test]
fn upgrade_request_without_ws_selector_falls_through_to_http() {
    let server = echo_server();
    let response = server.exchange(
        b"GET /ws HTTP/1.1\r\nHost: x\r\nUpgrade: websocket\r\nConnection: Upgrade\r\n\
Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\nSec-WebSocket-Version: 13\r\n\r\n",
    );
    assert!(
        response.starts_with("HTTP/1.0 200 OK\r\n"),
        "request must fall through to the HTTP handler:\n{response}"
    );
    server.stop();
}

#[test]
fn headers_split_across_packets_parse_as_one_request() {
    let server = echo_server();
    let mut stream = server.connect();

    stream.write_all(b"GET /slow HTTP/1.1\r\nHo").expect("write");
    stream.flush().expect("flush");
    std::thread::sleep(Duration::from_millis(50));
    stream.write_all(b"st: x\r\n\r\n").expect("write");

    let mut response = Vec::new();
    stream.read_to_end(&mut response).expect("read response");
    let response = String::from_utf8_lossy(&response);
    assert!(response.starts_with("HTTP/1.0 200 OK\r\n"));
    assert!(response.ends_with("GET /slow q=-"));

    server.stop();
}
