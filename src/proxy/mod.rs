//! Forward-proxy / A2A interception engine.
//!
//! A hyper `http1` server with `.with_upgrades()` for CONNECT, and a
//! `hyper_util::client::legacy::Client` over `hyper-rustls` for the
//! upstream call, rather than a higher-level client — raw hyper keeps
//! header and body handling exact so capture never alters the bytes
//! relayed back to the caller.

mod connect;

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode, Uri};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::{TokioExecutor, TokioIo};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::analyzer::AnalyzerHandle;
use crate::classifier;
use crate::error::{TraceError, TraceResult};
use crate::hub::Hub;
use crate::model::{Direction, Message};
use crate::store::Store;

type BoxBody = http_body_util::combinators::UnsyncBoxBody<Bytes, hyper::Error>;
type HttpsClient = Client<hyper_rustls::HttpsConnector<HttpConnector>, Full<Bytes>>;

/// Per-request upstream deadline.
const UPSTREAM_TIMEOUT: Duration = Duration::from_secs(60);

/// Hop-by-hop headers stripped before forwarding upstream.
const HOP_BY_HOP_HEADERS: &[&str] = &["proxy-connection", "proxy-authenticate", "proxy-authorization"];

fn full_body<T: Into<Bytes>>(chunk: T) -> BoxBody {
    Full::new(chunk.into())
        .map_err(|never| match never {})
        .boxed_unsync()
}

/// The forward proxy: listens on one TCP port, captures every A2A exchange,
/// and drives the classifier/analyzer for each one.
pub struct Proxy {
    store: Arc<dyn Store>,
    hub: Arc<Hub>,
    analyzer: AnalyzerHandle,
    trace_id: String,
    client: HttpsClient,
}

impl Proxy {
    pub fn new(
        store: Arc<dyn Store>,
        hub: Arc<Hub>,
        analyzer: AnalyzerHandle,
        trace_id: String,
    ) -> Arc<Self> {
        let https = hyper_rustls::HttpsConnectorBuilder::new()
            .with_native_roots()
            .expect("native root store")
            .https_or_http()
            .enable_http1()
            .build();
        let client = Client::builder(TokioExecutor::new()).build(https);

        Arc::new(Self {
            store,
            hub,
            analyzer,
            trace_id,
            client,
        })
    }

    /// Binds the listener and serves connections until `shutdown` fires.
    pub async fn run(self: Arc<Self>, port: u16, shutdown: CancellationToken) -> TraceResult<()> {
        let addr = SocketAddr::from(([127, 0, 0, 1], port));
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| TraceError::Bind { addr, source })?;
        info!("proxy listening on {addr}");

        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    let (stream, peer) = match accepted {
                        Ok(pair) => pair,
                        Err(e) => {
                            warn!("proxy accept error: {e}");
                            continue;
                        }
                    };
                    debug!("accepted connection from {peer}");
                    let proxy = self.clone();
                    tokio::spawn(async move {
                        proxy.serve_connection(stream).await;
                    });
                }
                _ = shutdown.cancelled() => {
                    info!("proxy shutting down");
                    return Ok(());
                }
            }
        }
    }

    async fn serve_connection(self: Arc<Self>, stream: tokio::net::TcpStream) {
        let io = TokioIo::new(stream);
        let proxy = self.clone();
        let service = service_fn(move |req| {
            let proxy = proxy.clone();
            async move { proxy.handle(req).await }
        });

        if let Err(e) = http1::Builder::new()
            .preserve_header_case(true)
            .title_case_headers(true)
            .serve_connection(io, service)
            .with_upgrades()
            .await
        {
            debug!("connection closed: {e}");
        }
    }

    async fn handle(
        self: Arc<Self>,
        req: Request<Incoming>,
    ) -> Result<Response<BoxBody>, Infallible> {
        if req.method() == Method::CONNECT {
            return Ok(self.handle_connect(req));
        }
        Ok(self.forward(req).await)
    }

    /// CONNECT tunnel — opaque, uncaptured.
    fn handle_connect(self: &Arc<Self>, req: Request<Incoming>) -> Response<BoxBody> {
        let authority = req
            .uri()
            .authority()
            .map(|a| a.to_string())
            .unwrap_or_default();

        if authority.is_empty() {
            return Response::builder()
                .status(StatusCode::BAD_REQUEST)
                .body(full_body("CONNECT missing authority"))
                .unwrap();
        }

        tokio::spawn(async move {
            match hyper::upgrade::on(req).await {
                Ok(upgraded) => connect::tunnel(upgraded, authority).await,
                Err(e) => warn!("CONNECT upgrade failed: {e}"),
            }
        });

        Response::new(full_body(Bytes::new()))
    }

    /// Capture the request, forward it upstream, capture the response, relay it back.
    async fn forward(self: Arc<Self>, req: Request<Incoming>) -> Response<BoxBody> {
        let method = req.method().clone();
        let uri = resolve_target_uri(&req);
        let target_host = uri
            .host()
            .map(|h| match uri.port_u16() {
                Some(p) => format!("{h}:{p}"),
                None => h.to_string(),
            })
            .unwrap_or_default();
        let path = uri.path().to_string();

        let content_type = req
            .headers()
            .get(http::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_string());
        let mut headers = header_snapshot(req.headers());

        let (parts, body) = req.into_parts();
        let body_bytes = match body.collect().await {
            Ok(collected) => collected.to_bytes(),
            Err(e) => {
                error!("failed to read request body: {e}");
                Bytes::new()
            }
        };

        let is_a2a = classifier::is_a2a_request(&method, &path, content_type.as_deref());
        let verdict = classifier::classify_request(is_a2a, &body_bytes);

        let request_id = uuid::Uuid::new_v4().to_string();
        let start = Instant::now();
        let request_msg = Message {
            id: request_id.clone(),
            trace_id: self.trace_id.clone(),
            timestamp: chrono::Utc::now(),
            direction: Direction::Request,
            source_agent: String::new(),
            target_agent: target_host.clone(),
            method: verdict.method.clone().unwrap_or_default(),
            url: uri.to_string(),
            headers: headers.clone(),
            body: String::from_utf8_lossy(&body_bytes).into_owned(),
            duration_ms: None,
            status: None,
            error: None,
            correlation_id: request_id.clone(),
            content_type: content_type.clone(),
            body_size: body_bytes.len(),
            is_a2a,
            jsonrpc_id: verdict.jsonrpc_id.clone(),
        };

        if let Err(e) = self.store.save_message(request_msg.clone()).await {
            error!("failed to persist request message: {e}");
        }
        self.hub.broadcast_message(&request_msg).await;
        self.analyzer.dispatch(request_msg.clone());

        for name in HOP_BY_HOP_HEADERS {
            headers.remove(*name);
        }
        let mut upstream_req = Request::builder().method(parts.method.clone()).uri(uri.clone());
        for (name, value) in parts.headers.iter() {
            if HOP_BY_HOP_HEADERS
                .iter()
                .any(|h| name.as_str().eq_ignore_ascii_case(h))
            {
                continue;
            }
            upstream_req = upstream_req.header(name, value);
        }
        let upstream_req = match upstream_req.body(Full::new(body_bytes.clone())) {
            Ok(r) => r,
            Err(e) => {
                error!("failed to build upstream request: {e}");
                return Response::builder()
                    .status(StatusCode::BAD_GATEWAY)
                    .body(full_body("bad request"))
                    .unwrap();
            }
        };

        let response = tokio::time::timeout(UPSTREAM_TIMEOUT, self.client.request(upstream_req)).await;

        match response {
            Ok(Ok(resp)) => self.handle_upstream_success(resp, &request_msg, start, &path).await,
            Ok(Err(e)) => {
                self.handle_upstream_failure(e.to_string(), &request_msg, start).await
            }
            Err(_) => {
                self.handle_upstream_failure("upstream request timed out".to_string(), &request_msg, start)
                    .await
            }
        }
    }

    async fn handle_upstream_failure(
        &self,
        error_text: String,
        request_msg: &Message,
        start: Instant,
    ) -> Response<BoxBody> {
        let duration_ms = start.elapsed().as_millis() as u64;
        let response_msg = Message {
            id: uuid::Uuid::new_v4().to_string(),
            trace_id: self.trace_id.clone(),
            timestamp: chrono::Utc::now(),
            direction: Direction::Response,
            source_agent: request_msg.target_agent.clone(),
            target_agent: String::new(),
            method: request_msg.method.clone(),
            url: request_msg.url.clone(),
            headers: Default::default(),
            body: String::new(),
            duration_ms: Some(duration_ms),
            status: None,
            error: Some(error_text.clone()),
            correlation_id: request_msg.id.clone(),
            content_type: None,
            body_size: 0,
            is_a2a: request_msg.is_a2a,
            jsonrpc_id: None,
        };

        if let Err(e) = self.store.save_message(response_msg.clone()).await {
            error!("failed to persist response message: {e}");
        }
        self.hub.broadcast_message(&response_msg).await;
        self.analyzer.dispatch(response_msg);

        warn!("{}", TraceError::Upstream(error_text.clone()));
        Response::builder()
            .status(StatusCode::BAD_GATEWAY)
            .body(full_body(error_text))
            .unwrap()
    }

    async fn handle_upstream_success(
        &self,
        resp: Response<Incoming>,
        request_msg: &Message,
        start: Instant,
        path: &str,
    ) -> Response<BoxBody> {
        let duration_ms = start.elapsed().as_millis() as u64;
        let (parts, body) = resp.into_parts();
        let status = parts.status;
        let resp_headers = header_snapshot(&parts.headers);
        let content_type = parts
            .headers
            .get(http::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_string());

        let body_bytes = match body.collect().await {
            Ok(collected) => collected.to_bytes(),
            Err(e) => {
                error!("failed to read upstream response body: {e}");
                Bytes::new()
            }
        };

        let verdict = classifier::classify_response(&body_bytes);
        let error_text = verdict
            .jsonrpc_error
            .as_ref()
            .map(|e| e.message.clone())
            .or_else(|| {
                if status.as_u16() >= 400 {
                    Some(
                        status
                            .canonical_reason()
                            .map(|r| format!("{} {}", status.as_u16(), r))
                            .unwrap_or_else(|| status.as_u16().to_string()),
                    )
                } else {
                    None
                }
            });

        let response_msg = Message {
            id: uuid::Uuid::new_v4().to_string(),
            trace_id: self.trace_id.clone(),
            timestamp: chrono::Utc::now(),
            direction: Direction::Response,
            source_agent: request_msg.target_agent.clone(),
            target_agent: String::new(),
            method: request_msg.method.clone(),
            url: request_msg.url.clone(),
            headers: resp_headers,
            body: String::from_utf8_lossy(&body_bytes).into_owned(),
            duration_ms: Some(duration_ms),
            status: Some(status.as_u16()),
            error: error_text,
            correlation_id: request_msg.id.clone(),
            content_type: content_type.clone(),
            body_size: body_bytes.len(),
            is_a2a: request_msg.is_a2a,
            jsonrpc_id: verdict.jsonrpc_id.clone(),
        };

        if let Err(e) = self.store.save_message(response_msg.clone()).await {
            error!("failed to persist response message: {e}");
        }
        self.hub.broadcast_message(&response_msg).await;
        self.analyzer.dispatch(response_msg);

        if classifier::is_agent_card_path(path) && status.is_success() {
            if let Some(card) = classifier::parse_agent_card(&body_bytes) {
                let agent = crate::model::Agent {
                    url: if card.url.is_empty() {
                        request_msg.target_agent.clone()
                    } else {
                        card.url.clone()
                    },
                    name: card.name,
                    description: card.description,
                    version: card.version,
                    skills: card.skills.into_iter().map(|s| s.name).collect(),
                    first_seen: chrono::Utc::now(),
                };
                match self.store.save_agent(agent.clone()).await {
                    Ok(saved) => self.hub.broadcast_agent(&saved).await,
                    Err(e) => error!("failed to persist agent: {e}"),
                }
            }
        }

        let mut response = Response::builder().status(status);
        for (name, value) in parts.headers.iter() {
            response = response.header(name, value);
        }
        response.body(full_body(body_bytes)).unwrap()
    }
}

/// Resolves the absolute target URL: the request line if it already carries
/// one (classic forward-proxy mode), otherwise the Host header prefixed
/// with `http://` (transparent mode).
fn resolve_target_uri(req: &Request<Incoming>) -> Uri {
    if req.uri().authority().is_some() {
        return req.uri().clone();
    }
    let host = req
        .headers()
        .get(http::header::HOST)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    let path_and_query = req
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");
    format!("http://{host}{path_and_query}")
        .parse()
        .unwrap_or_else(|_| req.uri().clone())
}

/// Snapshot headers: first value per name, as plain strings.
fn header_snapshot(headers: &hyper::HeaderMap) -> std::collections::HashMap<String, String> {
    let mut map = std::collections::HashMap::new();
    for name in headers.keys() {
        if let Some(value) = headers.get(name) {
            if let Ok(value) = value.to_str() {
                map.entry(name.to_string()).or_insert_with(|| value.to_string());
            }
        }
    }
    map
}
