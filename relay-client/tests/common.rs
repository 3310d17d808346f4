//! Shared stubs for integration tests: an in-process relay server and an
//! in-process backend, both plain hyper http1 servers on ephemeral ports.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use http::{header, Method, Request, Response, StatusCode};
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Full, StreamBody};
use hyper::body::{Frame, Incoming};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use prost::Message;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

use relay_client::{wire, ClientConfig};

// Stub relay ----------------------------------------------------------

#[derive(Default)]
pub struct RelayState {
    queue: Mutex<VecDeque<Vec<u8>>>,
    posted: Mutex<Vec<wire::HttpResponse>>,
    upstream: Mutex<VecDeque<Bytes>>,
    post_count: AtomicUsize,
    /// 1-based index of the response post that gets a 400; 0 disables.
    fail_post_with_400: AtomicUsize,
    /// Status to answer polls with instead of serving the queue; 0 disables.
    fail_poll_with: AtomicUsize,
    forbidden: AtomicBool,
    poll_auth: Mutex<Vec<Option<String>>>,
}

pub struct StubRelay {
    pub addr: SocketAddr,
    state: Arc<RelayState>,
}

impl StubRelay {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let state = Arc::new(RelayState::default());

        let accept_state = Arc::clone(&state);
        tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    break;
                };
                let state = Arc::clone(&accept_state);
                tokio::spawn(async move {
                    let service =
                        service_fn(move |req| handle_relay(Arc::clone(&state), req));
                    let _ = http1::Builder::new()
                        .serve_connection(TokioIo::new(stream), service)
                        .await;
                });
            }
        });

        Self { addr, state }
    }

    pub fn enqueue_request(&self, request: &wire::HttpRequest) {
        self.state
            .queue
            .lock()
            .unwrap()
            .push_back(request.encode_to_vec());
    }

    /// Queues raw bytes that do not decode as a request.
    pub fn enqueue_garbage(&self, bytes: &[u8]) {
        self.state.queue.lock().unwrap().push_back(bytes.to_vec());
    }

    pub fn push_upstream(&self, data: &[u8]) {
        self.state
            .upstream
            .lock()
            .unwrap()
            .push_back(Bytes::from(data.to_vec()));
    }

    pub fn set_forbidden(&self, forbidden: bool) {
        self.state.forbidden.store(forbidden, Ordering::SeqCst);
    }

    pub fn fail_poll_with(&self, status: StatusCode) {
        self.state
            .fail_poll_with
            .store(status.as_u16() as usize, Ordering::SeqCst);
    }

    pub fn clear_poll_failure(&self) {
        self.state.fail_poll_with.store(0, Ordering::SeqCst);
    }

    pub fn fail_nth_post(&self, n: usize) {
        self.state.fail_post_with_400.store(n, Ordering::SeqCst);
    }

    pub fn chunks_for(&self, id: &str) -> Vec<wire::HttpResponse> {
        self.state
            .posted
            .lock()
            .unwrap()
            .iter()
            .filter(|chunk| chunk.id() == id)
            .cloned()
            .collect()
    }

    pub fn poll_auth_headers(&self) -> Vec<Option<String>> {
        self.state.poll_auth.lock().unwrap().clone()
    }

    /// Waits until a chunk with `eof` has been posted for `id` and returns
    /// all chunks for that request in post order.
    pub async fn wait_for_terminal(&self, id: &str, timeout: Duration) -> Vec<wire::HttpResponse> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let chunks = self.chunks_for(id);
            if chunks.iter().any(|chunk| chunk.is_eof()) {
                return chunks;
            }
            if tokio::time::Instant::now() >= deadline {
                panic!("timed out waiting for terminal chunk of {id}; got {chunks:?}");
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}

async fn handle_relay(
    state: Arc<RelayState>,
    req: Request<Incoming>,
) -> Result<Response<Full<Bytes>>, Infallible> {
    let method = req.method().clone();
    let path = req.uri().path().to_string();

    if method == Method::GET && path == "/server/request" {
        state.poll_auth.lock().unwrap().push(
            req.headers()
                .get(header::AUTHORIZATION)
                .and_then(|value| value.to_str().ok())
                .map(str::to_string),
        );
        if state.forbidden.load(Ordering::SeqCst) {
            return Ok(text(StatusCode::FORBIDDEN, "forbidden"));
        }
        let fail = state.fail_poll_with.load(Ordering::SeqCst);
        if fail != 0 {
            let status = StatusCode::from_u16(fail as u16).unwrap();
            return Ok(text(status, "poll failure injected"));
        }
        // Short long-poll window, then 408 like the real relay.
        for _ in 0..10 {
            if let Some(payload) = state.queue.lock().unwrap().pop_front() {
                return Ok(Response::new(Full::new(Bytes::from(payload))));
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        return Ok(text(
            StatusCode::REQUEST_TIMEOUT,
            "no request received within timeout",
        ));
    }

    if method == Method::POST && path == "/server/response" {
        let body = req.into_body().collect().await.unwrap().to_bytes();
        let chunk = wire::HttpResponse::decode(body.as_ref()).unwrap();
        let n = state.post_count.fetch_add(1, Ordering::SeqCst) + 1;
        if state.fail_post_with_400.load(Ordering::SeqCst) == n {
            return Ok(text(StatusCode::BAD_REQUEST, "unknown request id"));
        }
        state.posted.lock().unwrap().push(chunk);
        return Ok(text(StatusCode::OK, "ok"));
    }

    if method == Method::POST && path == "/server/requeststream" {
        return match state.upstream.lock().unwrap().pop_front() {
            Some(data) => Ok(Response::new(Full::new(data))),
            None => Ok(text(StatusCode::GONE, "")),
        };
    }

    Ok(text(StatusCode::NOT_FOUND, "not found"))
}

fn text(status: StatusCode, body: &str) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .body(Full::from(Bytes::from(body.to_string())))
        .unwrap()
}

// Stub backend --------------------------------------------------------

#[derive(Debug, Clone)]
pub struct RecordedRequest {
    pub method: String,
    pub path: String,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

#[derive(Default)]
pub struct BackendState {
    requests: Mutex<Vec<RecordedRequest>>,
}

pub struct StubBackend {
    pub addr: SocketAddr,
    state: Arc<BackendState>,
}

type BackendBody = BoxBody<Bytes, Infallible>;

impl StubBackend {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let state = Arc::new(BackendState::default());

        let accept_state = Arc::clone(&state);
        tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    break;
                };
                let state = Arc::clone(&accept_state);
                tokio::spawn(async move {
                    let service =
                        service_fn(move |req| handle_backend(Arc::clone(&state), req));
                    let _ = http1::Builder::new()
                        .serve_connection(TokioIo::new(stream), service)
                        .with_upgrades()
                        .await;
                });
            }
        });

        Self { addr, state }
    }

    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.state.requests.lock().unwrap().clone()
    }

    pub fn hits(&self) -> usize {
        self.state.requests.lock().unwrap().len()
    }
}

async fn handle_backend(
    state: Arc<BackendState>,
    mut req: Request<Incoming>,
) -> Result<Response<BackendBody>, Infallible> {
    let method = req.method().to_string();
    let path = req.uri().path().to_string();
    let headers: Vec<(String, String)> = req
        .headers()
        .iter()
        .map(|(name, value)| {
            (
                name.as_str().to_string(),
                String::from_utf8_lossy(value.as_bytes()).into_owned(),
            )
        })
        .collect();

    if path == "/echo" {
        // Protocol switch: echo every byte of the upgraded connection.
        state.requests.lock().unwrap().push(RecordedRequest {
            method,
            path,
            headers,
            body: Vec::new(),
        });
        tokio::spawn(async move {
            if let Ok(upgraded) = hyper::upgrade::on(&mut req).await {
                let mut io = TokioIo::new(upgraded);
                let mut buf = [0u8; 1024];
                loop {
                    match io.read(&mut buf).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => {
                            if io.write_all(&buf[..n]).await.is_err() {
                                break;
                            }
                        }
                    }
                }
                let _ = io.shutdown().await;
            }
        });
        return Ok(Response::builder()
            .status(StatusCode::SWITCHING_PROTOCOLS)
            .header(header::CONNECTION, "upgrade")
            .header(header::UPGRADE, "tcp")
            .body(empty())
            .unwrap());
    }

    let body = req.into_body().collect().await.unwrap().to_bytes();
    state.requests.lock().unwrap().push(RecordedRequest {
        method,
        path: path.clone(),
        headers,
        body: body.to_vec(),
    });

    let response = match path.as_str() {
        "/hello" => Response::builder()
            .status(StatusCode::OK)
            .header(header::CONTENT_TYPE, "text/plain")
            .body(full(b"hello\n".as_slice()))
            .unwrap(),
        "/stream" => Response::new(full(b"abcdefghijkl".as_slice())),
        "/slow" => {
            let (tx, rx) = tokio::sync::mpsc::unbounded_channel::<
                Result<Frame<Bytes>, Infallible>,
            >();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(600)).await;
                let _ = tx.send(Ok(Frame::data(Bytes::from_static(b"x"))));
            });
            let stream = futures_util::stream::unfold(rx, |mut rx| async move {
                rx.recv().await.map(|item| (item, rx))
            });
            Response::new(StreamBody::new(stream).boxed())
        }
        "/redirect" => Response::builder()
            .status(StatusCode::FOUND)
            .header(header::LOCATION, "/hello")
            .body(empty())
            .unwrap(),
        _ => Response::builder()
            .status(StatusCode::NOT_FOUND)
            .body(full(b"not found".as_slice()))
            .unwrap(),
    };
    Ok(response)
}

fn full(data: &[u8]) -> BackendBody {
    Full::new(Bytes::from(data.to_vec())).boxed()
}

fn empty() -> BackendBody {
    Full::new(Bytes::new()).boxed()
}

// Helpers -------------------------------------------------------------

pub fn test_config(relay: SocketAddr, backend: SocketAddr) -> ClientConfig {
    ClientConfig {
        remote_request_timeout: Duration::from_secs(5),
        backend_response_timeout: Duration::from_secs(5),
        disable_auth_for_remote: true,
        backend_scheme: "http".to_string(),
        backend_address: backend.to_string(),
        relay_scheme: "http".to_string(),
        relay_address: relay.to_string(),
        server_name: "test-server".to_string(),
        ..ClientConfig::default()
    }
}

pub fn pulled_request(id: &str, method: &str, path: &str) -> wire::HttpRequest {
    wire::HttpRequest {
        id: Some(id.to_string()),
        method: Some(method.to_string()),
        url: Some(format!("http://invalid{path}")),
        header: vec![],
        body: vec![],
        host: None,
    }
}

/// Reassembles the body from a request's chunks.
pub fn concat_bodies(chunks: &[wire::HttpResponse]) -> Vec<u8> {
    chunks.iter().flat_map(|chunk| chunk.body.clone()).collect()
}
