//! Exercises the REST + `/ws` control surface end to end: a real axum
//! server bound to an ephemeral port, a `tokio-tungstenite` client playing
//! the UI observer, and a proxy feeding it live traffic.

use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio_tungstenite::tungstenite::Message as TungsteniteMessage;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use a2a_trace::analyzer::Analyzer;
use a2a_trace::control::{self, ControlState};
use a2a_trace::hub::Hub;
use a2a_trace::proxy::Proxy;
use a2a_trace::store::memory::InMemoryStore;
use a2a_trace::store::Store;

/// Boots a proxy and a control-surface server, both bound to ephemeral
/// ports, sharing one `Store`/`Hub`/`Analyzer`. Returns their ports plus
/// the shared store for REST assertions.
async fn start_stack() -> (u16, u16, Arc<InMemoryStore>, String) {
    let store = Arc::new(InMemoryStore::new());
    let hub = Arc::new(Hub::new());
    let trace = store.create_trace("test-command".to_string()).await.unwrap();
    let analyzer = Arc::new(Analyzer::spawn(store.clone(), hub.clone(), trace.id.clone()));
    let proxy = Proxy::new(store.clone(), hub.clone(), analyzer.handle(), trace.id.clone());

    let proxy_listener = tokio::net::TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
    let proxy_port = proxy_listener.local_addr().unwrap().port();
    drop(proxy_listener);
    let proxy_shutdown = tokio_util::sync::CancellationToken::new();
    tokio::spawn(async move {
        let _ = proxy.run(proxy_port, proxy_shutdown).await;
    });

    let state = Arc::new(ControlState {
        store: store.clone(),
        hub: hub.clone(),
        analyzer: analyzer.clone(),
        trace_id: trace.id.clone(),
    });
    let router = control::router(state);
    let ui_listener = tokio::net::TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
    let ui_port = ui_listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        let _ = axum::serve(ui_listener, router).await;
    });

    tokio::time::sleep(Duration::from_millis(50)).await;
    (proxy_port, ui_port, store, trace.id)
}

/// `GET /health` returns `200 OK` with body `OK`.
#[tokio::test]
async fn health_endpoint_returns_ok() {
    let (_proxy_port, ui_port, _store, _trace_id) = start_stack().await;
    let (status, _headers, body) = http_get(ui_port, "/health").await;
    assert_eq!(status, 200);
    assert_eq!(body, "OK");
}

/// A message that flows through the proxy is both queryable over
/// `GET /api/messages` and pushed live to a `/ws` observer.
#[tokio::test]
async fn ws_observer_receives_live_message_and_rest_reflects_it() {
    let upstream = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_string(r#"{"jsonrpc":"2.0","id":1,"result":{}}"#)
                .insert_header("content-type", "application/json"),
        )
        .mount(&upstream)
        .await;

    let (proxy_port, ui_port, store, trace_id) = start_stack().await;

    let (mut ws, _resp) =
        tokio_tungstenite::connect_async(format!("ws://127.0.0.1:{ui_port}/ws"))
            .await
            .unwrap();

    let upstream_host = upstream.address().to_string();
    let mut proxy_stream = tokio::net::TcpStream::connect(("127.0.0.1", proxy_port))
        .await
        .unwrap();
    let body = br#"{"jsonrpc":"2.0","method":"tasks/create","id":1,"params":{}}"#;
    let request = format!(
        "POST http://{upstream_host}/ HTTP/1.1\r\nHost: {upstream_host}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
        body.len()
    );
    proxy_stream.write_all(request.as_bytes()).await.unwrap();
    proxy_stream.write_all(body).await.unwrap();
    let mut discard = Vec::new();
    proxy_stream.read_to_end(&mut discard).await.unwrap();

    // The hub should push at least the request envelope to this observer
    // before the REST view is asserted.
    let mut saw_message_envelope = false;
    for _ in 0..4 {
        let Ok(Some(Ok(frame))) =
            tokio::time::timeout(Duration::from_millis(500), ws.next()).await
        else {
            break;
        };
        if let TungsteniteMessage::Text(text) = frame {
            let value: serde_json::Value = serde_json::from_str(&text).unwrap();
            if value.get("type").and_then(|t| t.as_str()) == Some("message") {
                saw_message_envelope = true;
                break;
            }
        }
    }
    assert!(saw_message_envelope, "expected a message envelope over /ws");

    let messages = store.get_messages(&trace_id).await.unwrap();
    assert_eq!(messages.len(), 2);

    let (status, _headers, body) = http_get(ui_port, "/api/messages").await;
    assert_eq!(status, 200);
    let parsed: serde_json::Value = serde_json::from_str(&body).unwrap();
    assert_eq!(parsed.as_array().unwrap().len(), 2);

    ws.send(TungsteniteMessage::Text(r#"{"type":"ping"}"#.into()))
        .await
        .unwrap();
    let pong = tokio::time::timeout(Duration::from_secs(2), ws.next())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    if let TungsteniteMessage::Text(text) = pong {
        assert!(text.contains("pong"));
    } else {
        panic!("expected a text pong frame");
    }
}

/// `GET /api/export` produces the self-contained document with the
/// `Content-Disposition` attachment header.
#[tokio::test]
async fn export_endpoint_sets_attachment_header() {
    let (_proxy_port, ui_port, store, trace_id) = start_stack().await;
    store
        .save_message(a2a_trace::model::Message {
            id: String::new(),
            trace_id: trace_id.clone(),
            timestamp: chrono::Utc::now(),
            direction: a2a_trace::model::Direction::Request,
            source_agent: String::new(),
            target_agent: "agent.local".to_string(),
            method: "tasks/create".to_string(),
            url: "http://agent.local/".to_string(),
            headers: Default::default(),
            body: "{}".to_string(),
            duration_ms: None,
            status: None,
            error: None,
            correlation_id: "ignored".to_string(),
            content_type: None,
            body_size: 2,
            is_a2a: true,
            jsonrpc_id: None,
        })
        .await
        .unwrap();

    let (status, headers, body) = http_get(ui_port, "/api/export").await;
    assert_eq!(status, 200);
    let disposition = header(&headers, "content-disposition").unwrap();
    assert!(disposition.contains("attachment; filename=trace-"));
    let parsed: serde_json::Value = serde_json::from_str(&body).unwrap();
    assert_eq!(parsed["messages"].as_array().unwrap().len(), 1);
}

/// Sends a bare HTTP/1.1 GET over a raw socket and returns `(status,
/// headers, body)`. This crate's only HTTP client dependency is the raw
/// `hyper` stack the proxy forwards with, so a REST assertion talks
/// HTTP/1.1 over a `TcpStream` directly rather than pulling in a client
/// crate for this alone.
async fn http_get(port: u16, path: &str) -> (u16, Vec<(String, String)>, String) {
    let mut stream = tokio::net::TcpStream::connect(("127.0.0.1", port))
        .await
        .unwrap();
    let request =
        format!("GET {path} HTTP/1.1\r\nHost: 127.0.0.1:{port}\r\nConnection: close\r\n\r\n");
    stream.write_all(request.as_bytes()).await.unwrap();

    let mut raw = Vec::new();
    stream.read_to_end(&mut raw).await.unwrap();
    let split = raw
        .windows(4)
        .position(|w| w == b"\r\n\r\n")
        .unwrap_or(raw.len());
    let head = String::from_utf8_lossy(&raw[..split]).to_string();
    let body = String::from_utf8_lossy(&raw[(split + 4).min(raw.len())..]).to_string();

    let mut lines = head.lines();
    let status = lines
        .next()
        .and_then(|line| line.split_whitespace().nth(1))
        .and_then(|code| code.parse::<u16>().ok())
        .unwrap_or(0);
    let headers = lines
        .filter_map(|line| line.split_once(':'))
        .map(|(k, v)| (k.trim().to_lowercase(), v.trim().to_string()))
        .collect();
    (status, headers, body)
}

fn header(headers: &[(String, String)], name: &str) -> Option<String> {
    headers
        .iter()
        .find(|(k, _)| k == name)
        .map(|(_, v)| v.clone())
}
