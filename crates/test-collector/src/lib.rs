//! Minimal HTTP collector for tests: records every request it receives and
//! answers with a configurable status, or never answers at all.

use std::collections::HashMap;
use std::convert::Infallible;
use std::io::Read;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use flate2::read::GzDecoder;
use http_body_util::{BodyExt, Full};
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder;
use serde_json::Value;
use tokio::net::TcpListener;

pub const EVENTS_PATH: &str = "/v1/events";

#[derive(Debug, Clone)]
pub struct CollectedRequest {
    pub method: String,
    pub path: String,
    pub headers: HashMap<String, String>,
    pub body: Bytes,
}

impl CollectedRequest {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(String::as_str)
    }

    /// Parse the body as JSON, inflating it first if it was gzipped.
    pub fn json(&self) -> Value {
        let raw = if self.header("content-encoding") == Some("gzip") {
            let mut out = Vec::new();
            GzDecoder::new(&self.body[..])
                .read_to_end(&mut out)
                .expect("body is not valid gzip");
            out
        } else {
            self.body.to_vec()
        };
        serde_json::from_slice(&raw).expect("body is not valid JSON")
    }

    /// `eventName` of every event in the batch, in order.
    pub fn event_names(&self) -> Vec<String> {
        self.json()["events"]
            .as_array()
            .expect("body has no events array")
            .iter()
            .map(|e| e["eventName"].as_str().unwrap_or_default().to_owned())
            .collect()
    }
}

#[derive(Debug, Clone, Copy)]
struct Behavior {
    status: StatusCode,
    stall: bool,
}

type Store = Arc<Mutex<Vec<CollectedRequest>>>;

pub struct Collector {
    addr: SocketAddr,
    store: Store,
    behavior: Arc<Mutex<Behavior>>,
}

impl Collector {
    /// Bind an ephemeral port on localhost and start serving.
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("failed to bind collector listener");
        let addr = listener.local_addr().expect("listener has no address");

        let store: Store = Arc::new(Mutex::new(Vec::new()));
        let behavior = Arc::new(Mutex::new(Behavior {
            status: StatusCode::OK,
            stall: false,
        }));

        let store_clone = store.clone();
        let behavior_clone = behavior.clone();
        tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    break;
                };
                let store = store_clone.clone();
                let behavior = behavior_clone.clone();
                tokio::spawn(async move {
                    let service = service_fn(move |req| handle(req, store.clone(), behavior.clone()));
                    let _ = Builder::new(TokioExecutor::new())
                        .serve_connection(TokioIo::new(stream), service)
                        .await;
                });
            }
        });

        Self {
            addr,
            store,
            behavior,
        }
    }

    pub fn url(&self) -> String {
        format!("http://{}{EVENTS_PATH}", self.addr)
    }

    /// Answer subsequent requests with `status`.
    pub fn respond_with(&self, status: u16) {
        self.behavior.lock().unwrap().status =
            StatusCode::from_u16(status).expect("invalid status code");
    }

    /// Record subsequent requests but never answer them.
    pub fn stall(&self, stall: bool) {
        self.behavior.lock().unwrap().stall = stall;
    }

    pub fn received(&self) -> Vec<CollectedRequest> {
        self.store.lock().unwrap().clone()
    }

    /// Wait until at least `min_expected` requests arrived or `timeout`
    /// elapsed, then take everything recorded so far.
    pub async fn drain(&self, timeout: Duration, min_expected: usize) -> Vec<CollectedRequest> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if self.store.lock().unwrap().len() >= min_expected {
                break;
            }
            if tokio::time::Instant::now() >= deadline {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        self.store.lock().unwrap().drain(..).collect()
    }
}

async fn handle<B>(
    req: Request<B>,
    store: Store,
    behavior: Arc<Mutex<Behavior>>,
) -> Result<Response<Full<Bytes>>, Infallible>
where
    B: hyper::body::Body<Data = Bytes> + Send + 'static,
{
    let method = req.method().to_string();
    let path = req.uri().path().to_owned();

    let mut headers = HashMap::new();
    for (name, value) in req.headers() {
        if let Ok(v) = value.to_str() {
            headers.insert(name.as_str().to_owned(), v.to_owned());
        }
    }

    let body = req
        .collect()
        .await
        .map(|c| c.to_bytes())
        .unwrap_or_default();

    store.lock().unwrap().push(CollectedRequest {
        method,
        path,
        headers,
        body,
    });

    let Behavior { status, stall } = *behavior.lock().unwrap();
    if stall {
        std::future::pending::<()>().await;
    }

    Ok(Response::builder()
        .status(status)
        .body(Full::default())
        .unwrap())
}
