//! End-to-end proxy tests over real sockets

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::{Duration, Instant};

use pingbridge::http::parser::{parse_http_request, parse_response_head};
use pingbridge::http::request::Request;
use pingbridge::http::response::ResponseHead;
use pingbridge::proxy::{HostDispatcher, ProxyHandler, Upstream};
use pingbridge::route::{Route, RouteRegistry};
use pingbridge::server;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};

const LOCALHOST: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);
const DEADLINE: Duration = Duration::from_secs(5);

async fn start_proxy(registry: RouteRegistry) -> SocketAddr {
    start_proxy_with_idle(registry, Duration::from_secs(5)).await
}

async fn start_proxy_with_idle(registry: RouteRegistry, idle: Duration) -> SocketAddr {
    let upstream = Upstream::new(Duration::from_secs(1), false).unwrap();
    let handler = ProxyHandler::new(HostDispatcher::new(registry, Vec::new()), upstream, idle);

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(server::listener::serve(listener, handler));
    addr
}

/// Read from `stream` until a whole request parses.
async fn read_request(stream: &mut TcpStream) -> Request {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 4096];

    loop {
        if let Ok((request, _)) = parse_http_request(&buf) {
            return request;
        }
        let n = stream.read(&mut chunk).await.unwrap();
        assert!(n > 0, "client closed before sending a full request");
        buf.extend_from_slice(&chunk[..n]);
    }
}

/// Read a response head and a `Content-Length` body.
async fn read_response<S>(stream: &mut S) -> (ResponseHead, Vec<u8>)
where
    S: AsyncRead + Unpin,
{
    let mut buf = Vec::new();
    let mut chunk = [0u8; 4096];

    let (head, consumed) = loop {
        if let Ok(parsed) = parse_response_head(&buf) {
            break parsed;
        }
        let n = stream.read(&mut chunk).await.unwrap();
        assert!(n > 0, "proxy closed before sending a response head");
        buf.extend_from_slice(&chunk[..n]);
    };

    let length: usize = head
        .headers
        .get("Content-Length")
        .map(|v| v.parse().unwrap())
        .unwrap_or(0);
    let mut body = buf[consumed..].to_vec();
    while body.len() < length {
        let n = stream.read(&mut chunk).await.unwrap();
        assert!(n > 0, "proxy closed mid-body");
        body.extend_from_slice(&chunk[..n]);
    }

    (head, body)
}

/// A backend that answers one request with `response` and hands the
/// request it saw back to the test.
async fn one_shot_backend(response: &'static [u8]) -> (u16, oneshot::Receiver<Request>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let (tx, rx) = oneshot::channel();

    tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        let request = read_request(&mut stream).await;
        stream.write_all(response).await.unwrap();
        stream.shutdown().await.unwrap();
        let _ = tx.send(request);
    });

    (port, rx)
}

/// A backend that accepts a WebSocket upgrade and echoes every byte.
async fn echo_websocket_backend() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        let request = read_request(&mut stream).await;
        assert!(request.is_websocket_upgrade());

        stream
            .write_all(
                b"HTTP/1.1 101 Switching Protocols\r\nUpgrade: websocket\r\nConnection: Upgrade\r\n\r\n",
            )
            .await
            .unwrap();

        let (mut rd, mut wr) = stream.split();
        let _ = tokio::io::copy(&mut rd, &mut wr).await;
    });

    port
}

/// A port nothing listens on.
async fn closed_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

async fn send(proxy: SocketAddr, raw: &[u8]) -> Vec<u8> {
    let mut client = TcpStream::connect(proxy).await.unwrap();
    client.write_all(raw).await.unwrap();

    let mut out = Vec::new();
    tokio::time::timeout(DEADLINE, client.read_to_end(&mut out))
        .await
        .expect("proxy did not close the connection")
        .unwrap();
    out
}

#[tokio::test]
async fn test_proxy_rewrites_host_and_keeps_headers() {
    let (port, seen) = one_shot_backend(b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\nX-Bar: BAR\r\n\r\nok").await;
    let registry = RouteRegistry::new();
    registry.record(Route::new("demo", LOCALHOST, port, false)).await;
    let proxy = start_proxy(registry).await;

    let out = send(
        proxy,
        b"GET /hello?x=1 HTTP/1.1\r\nHost: demo.foo.com\r\nX-Foo: FOO\r\n\r\n",
    )
    .await;

    let request = seen.await.unwrap();
    assert_eq!(request.path, "/hello?x=1");
    assert_eq!(request.header("Host"), Some("foo.com"));
    assert_eq!(request.header("X-Foo"), Some("FOO"));
    assert_eq!(request.header("X-Forwarded-For"), Some("127.0.0.1"));
    assert_eq!(request.header("Connection"), Some("close"));

    let (head, consumed) = parse_response_head(&out).unwrap();
    assert_eq!(head.status, 200);
    assert_eq!(head.headers.get("X-Bar"), Some("BAR"));
    assert_eq!(&out[consumed..], b"ok");
}

#[tokio::test]
async fn test_proxy_appends_to_forwarded_for() {
    let (port, seen) = one_shot_backend(b"HTTP/1.1 204 No Content\r\n\r\n").await;
    let registry = RouteRegistry::new();
    registry.record(Route::new("demo", LOCALHOST, port, false)).await;
    let proxy = start_proxy(registry).await;

    send(
        proxy,
        b"GET / HTTP/1.1\r\nHost: demo.foo.com\r\nX-Forwarded-For: 8.8.8.8\r\n\r\n",
    )
    .await;

    let request = seen.await.unwrap();
    assert_eq!(request.header("X-Forwarded-For"), Some("8.8.8.8, 127.0.0.1"));
}

#[tokio::test]
async fn test_proxy_forwards_request_body() {
    let (port, seen) = one_shot_backend(b"HTTP/1.1 201 Created\r\nContent-Length: 0\r\n\r\n").await;
    let registry = RouteRegistry::new();
    registry.record(Route::new("api", LOCALHOST, port, false)).await;
    let proxy = start_proxy(registry).await;

    let out = send(
        proxy,
        b"POST /items HTTP/1.1\r\nHost: api.foo.com\r\nTransfer-Encoding: chunked\r\n\r\n4\r\nOHAI\r\n0\r\n\r\n",
    )
    .await;

    let request = seen.await.unwrap();
    assert_eq!(request.body, b"OHAI".to_vec());
    assert_eq!(request.header("Content-Length"), Some("4"));
    assert_eq!(request.header("Transfer-Encoding"), None);

    let (head, _) = parse_response_head(&out).unwrap();
    assert_eq!(head.status, 201);
}

#[tokio::test]
async fn test_proxy_relays_chunked_response_verbatim() {
    let (port, _seen) = one_shot_backend(
        b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n5\r\nhello\r\n6\r\n world\r\n0\r\n\r\n",
    )
    .await;
    let registry = RouteRegistry::new();
    registry.record(Route::new("stream", LOCALHOST, port, false)).await;
    let proxy = start_proxy(registry).await;

    let out = send(proxy, b"GET / HTTP/1.1\r\nHost: stream.foo.com\r\n\r\n").await;

    let (head, consumed) = parse_response_head(&out).unwrap();
    assert_eq!(head.headers.get("Transfer-Encoding"), Some("chunked"));
    assert_eq!(&out[consumed..], b"5\r\nhello\r\n6\r\n world\r\n0\r\n\r\n");
}

#[tokio::test]
async fn test_proxy_unroutable_host() {
    let registry = RouteRegistry::new();
    registry.record(Route::new("demo", LOCALHOST, 1, false)).await;
    let proxy = start_proxy(registry).await;

    let out = send(
        proxy,
        b"GET / HTTP/1.1\r\nHost: nobody.foo.com\r\nConnection: close\r\n\r\n",
    )
    .await;

    let (head, consumed) = parse_response_head(&out).unwrap();
    assert_eq!(head.status, 400);
    assert_eq!(&out[consumed..], b"could not route given host\n");
}

#[tokio::test]
async fn test_proxy_unroutable_keeps_connection_alive() {
    let proxy = start_proxy(RouteRegistry::new()).await;
    let mut client = TcpStream::connect(proxy).await.unwrap();

    for _ in 0..2 {
        client
            .write_all(b"GET / HTTP/1.1\r\nHost: nobody.foo.com\r\n\r\n")
            .await
            .unwrap();
        let (head, body) = tokio::time::timeout(DEADLINE, read_response(&mut client))
            .await
            .unwrap();
        assert_eq!(head.status, 400);
        assert_eq!(body, b"could not route given host\n".to_vec());
    }
}

#[tokio::test]
async fn test_proxy_missing_host() {
    let proxy = start_proxy(RouteRegistry::new()).await;

    let out = send(proxy, b"GET / HTTP/1.0\r\n\r\n").await;

    let (head, _) = parse_response_head(&out).unwrap();
    assert_eq!(head.status, 400);
}

#[tokio::test]
async fn test_proxy_malformed_request() {
    let proxy = start_proxy(RouteRegistry::new()).await;

    let out = send(proxy, b"BREW /pot HTTP/1.1\r\nHost: demo.foo.com\r\n\r\n").await;

    let (head, _) = parse_response_head(&out).unwrap();
    assert_eq!(head.status, 400);
    assert_eq!(head.headers.get("Connection"), Some("close"));
}

#[tokio::test]
async fn test_proxy_backend_unreachable() {
    let registry = RouteRegistry::new();
    registry.record(Route::new("gone", LOCALHOST, closed_port().await, false)).await;
    let proxy = start_proxy(registry).await;

    let out = send(proxy, b"GET / HTTP/1.1\r\nHost: gone.foo.com\r\n\r\n").await;

    let (head, _) = parse_response_head(&out).unwrap();
    assert_eq!(head.status, 502);
}

#[tokio::test]
async fn test_proxy_websocket_round_trip() {
    let port = echo_websocket_backend().await;
    let registry = RouteRegistry::new();
    registry.record(Route::new("ws", LOCALHOST, port, false)).await;
    let proxy = start_proxy(registry).await;

    let mut client = TcpStream::connect(proxy).await.unwrap();
    client
        .write_all(
            b"GET /socket HTTP/1.1\r\nHost: ws.foo.com\r\nConnection: Upgrade\r\nUpgrade: websocket\r\nSec-WebSocket-Version: 13\r\nSec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\r\n",
        )
        .await
        .unwrap();

    let (head, leftover) = tokio::time::timeout(DEADLINE, read_response(&mut client))
        .await
        .unwrap();
    assert_eq!(head.status, 101);
    assert!(leftover.is_empty());

    client.write_all(b"ohai").await.unwrap();
    let mut echoed = [0u8; 4];
    tokio::time::timeout(DEADLINE, client.read_exact(&mut echoed))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&echoed, b"ohai");
}

#[tokio::test]
async fn test_proxy_websocket_dial_failure() {
    let registry = RouteRegistry::new();
    registry.record(Route::new("ws", LOCALHOST, closed_port().await, false)).await;
    let proxy = start_proxy(registry).await;

    let out = send(
        proxy,
        b"GET /socket HTTP/1.1\r\nHost: ws.foo.com\r\nConnection: Upgrade\r\nUpgrade: websocket\r\n\r\n",
    )
    .await;

    let (head, consumed) = parse_response_head(&out).unwrap();
    assert_eq!(head.status, 500);
    assert!(!out[consumed..].is_empty());
}

#[tokio::test]
async fn test_proxy_websocket_rejected_by_backend() {
    let (port, _seen) = one_shot_backend(b"HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\n\r\n").await;
    let registry = RouteRegistry::new();
    registry.record(Route::new("ws", LOCALHOST, port, false)).await;
    let proxy = start_proxy(registry).await;

    let out = send(
        proxy,
        b"GET /socket HTTP/1.1\r\nHost: ws.foo.com\r\nConnection: Upgrade\r\nUpgrade: websocket\r\n\r\n",
    )
    .await;

    let (head, _) = parse_response_head(&out).unwrap();
    assert_eq!(head.status, 500);
}

#[tokio::test]
async fn test_proxy_flushes_partial_body_while_backend_holds_open() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let (release_tx, release_rx) = oneshot::channel::<()>();

    tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        read_request(&mut stream).await;
        stream
            .write_all(b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n")
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        stream.write_all(b"5\r\nhello\r\n").await.unwrap();

        // Hold the response open until the client has seen the first chunk
        let _ = release_rx.await;
        stream.write_all(b"0\r\n\r\n").await.unwrap();
        stream.shutdown().await.unwrap();
    });

    let registry = RouteRegistry::new();
    registry.record(Route::new("stream", LOCALHOST, port, false)).await;
    let proxy = start_proxy(registry).await;

    let mut client = TcpStream::connect(proxy).await.unwrap();
    client
        .write_all(b"GET / HTTP/1.1\r\nHost: stream.foo.com\r\n\r\n")
        .await
        .unwrap();

    let mut received = Vec::new();
    let mut chunk = [0u8; 1024];
    tokio::time::timeout(Duration::from_millis(500), async {
        while !received.windows(5).any(|w| w == b"hello") {
            let n = client.read(&mut chunk).await.unwrap();
            assert!(n > 0, "proxy closed before the first chunk");
            received.extend_from_slice(&chunk[..n]);
        }
    })
    .await
    .expect("first chunk was held back until the backend finished");

    release_tx.send(()).unwrap();
    client.read_to_end(&mut received).await.unwrap();
    assert!(received.ends_with(b"5\r\nhello\r\n0\r\n\r\n"));
}

#[tokio::test]
async fn test_proxy_releases_backend_when_client_stops_reading() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let (closed_tx, mut closed_rx) = mpsc::channel::<()>(1);

    tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        read_request(&mut stream).await;
        stream
            .write_all(b"HTTP/1.1 200 OK\r\nContent-Type: application/octet-stream\r\n\r\n")
            .await
            .unwrap();

        // Stream until the proxy hangs up on us
        let block = vec![b'x'; 64 * 1024];
        while stream.write_all(&block).await.is_ok() {}
        let _ = closed_tx.send(()).await;
    });

    let registry = RouteRegistry::new();
    registry.record(Route::new("firehose", LOCALHOST, port, false)).await;
    let proxy = start_proxy_with_idle(registry, Duration::from_millis(500)).await;

    // Sends a request and never reads the answer
    let mut client = TcpStream::connect(proxy).await.unwrap();
    client
        .write_all(b"GET / HTTP/1.1\r\nHost: firehose.foo.com\r\n\r\n")
        .await
        .unwrap();

    tokio::time::timeout(Duration::from_secs(10), closed_rx.recv())
        .await
        .expect("backend connection was never released");
    drop(client);
}

#[tokio::test]
async fn test_proxy_websocket_push_only_outlives_idle_timeout() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        read_request(&mut stream).await;
        stream
            .write_all(
                b"HTTP/1.1 101 Switching Protocols\r\nUpgrade: websocket\r\nConnection: Upgrade\r\n\r\n",
            )
            .await
            .unwrap();

        // Push one byte every 100ms for 1.5s, never expecting anything back
        for _ in 0..15 {
            tokio::time::sleep(Duration::from_millis(100)).await;
            stream.write_all(b"x").await.unwrap();
        }
        stream.shutdown().await.unwrap();
    });

    let registry = RouteRegistry::new();
    registry.record(Route::new("push", LOCALHOST, port, false)).await;
    let proxy = start_proxy_with_idle(registry, Duration::from_millis(500)).await;

    let mut client = TcpStream::connect(proxy).await.unwrap();
    client
        .write_all(b"GET /feed HTTP/1.1\r\nHost: push.foo.com\r\nConnection: Upgrade\r\nUpgrade: websocket\r\n\r\n")
        .await
        .unwrap();

    let started = Instant::now();
    let (head, mut received) = tokio::time::timeout(DEADLINE, read_response(&mut client))
        .await
        .unwrap();
    assert_eq!(head.status, 101);

    tokio::time::timeout(DEADLINE, client.read_to_end(&mut received))
        .await
        .unwrap()
        .unwrap();

    assert_eq!(received, vec![b'x'; 15]);
    assert!(started.elapsed() > Duration::from_secs(1));
}

#[tokio::test]
async fn test_proxy_websocket_closes_when_both_sides_idle() {
    let port = echo_websocket_backend().await;
    let registry = RouteRegistry::new();
    registry.record(Route::new("ws", LOCALHOST, port, false)).await;
    let proxy = start_proxy_with_idle(registry, Duration::from_millis(300)).await;

    let mut client = TcpStream::connect(proxy).await.unwrap();
    client
        .write_all(b"GET /socket HTTP/1.1\r\nHost: ws.foo.com\r\nConnection: Upgrade\r\nUpgrade: websocket\r\n\r\n")
        .await
        .unwrap();

    let (head, _) = tokio::time::timeout(DEADLINE, read_response(&mut client))
        .await
        .unwrap();
    assert_eq!(head.status, 101);

    let mut rest = Vec::new();
    tokio::time::timeout(DEADLINE, client.read_to_end(&mut rest))
        .await
        .expect("idle websocket was never closed")
        .unwrap();
    assert!(rest.is_empty());
}

#[tokio::test]
async fn test_proxy_answers_expect_continue() {
    let (port, seen) = one_shot_backend(b"HTTP/1.1 200 OK\r\nContent-Length: 0\r\n\r\n").await;
    let registry = RouteRegistry::new();
    registry.record(Route::new("api", LOCALHOST, port, false)).await;
    let proxy = start_proxy(registry).await;

    let mut client = TcpStream::connect(proxy).await.unwrap();
    client
        .write_all(b"POST /upload HTTP/1.1\r\nHost: api.foo.com\r\nExpect: 100-continue\r\nContent-Length: 4\r\n\r\n")
        .await
        .unwrap();

    let (interim, _) = tokio::time::timeout(Duration::from_millis(500), read_response(&mut client))
        .await
        .expect("no interim response before the body was sent");
    assert_eq!(interim.status, 100);

    client.write_all(b"OHAI").await.unwrap();
    let mut rest = Vec::new();
    tokio::time::timeout(DEADLINE, client.read_to_end(&mut rest))
        .await
        .unwrap()
        .unwrap();

    let request = seen.await.unwrap();
    assert_eq!(request.body, b"OHAI".to_vec());
    assert_eq!(request.header("Expect"), None);

    let (head, _) = parse_response_head(&rest).unwrap();
    assert_eq!(head.status, 200);
}
