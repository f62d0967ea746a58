//! A2A classifier — recognizes JSON-RPC calls and agent-card discovery.
//!
//! Pure and stateless: every function here takes borrowed input and
//! returns a value, with no internal state of its own. Parse failures are
//! non-fatal — the caller gets back empty fields rather than an error.

use crate::model::{AgentCard, ClassifierVerdict, JsonRpcErrorBody};
use http::Method;

const AGENT_CARD_PATH: &str = "/.well-known/agent.json";

/// Returns `true` if `path` is the well-known agent card discovery path.
pub fn is_agent_card_path(path: &str) -> bool {
    path.ends_with(AGENT_CARD_PATH)
}

/// Returns `true` when a request should be treated as A2A traffic:
/// a JSON POST, or a GET to the agent card well-known path.
pub fn is_a2a_request(method: &Method, path: &str, content_type: Option<&str>) -> bool {
    if method == Method::POST {
        content_type
            .map(|ct| ct.contains("application/json"))
            .unwrap_or(false)
    } else if method == Method::GET {
        is_agent_card_path(path)
    } else {
        false
    }
}

#[derive(serde::Deserialize)]
struct JsonRpcEnvelope {
    #[serde(default)]
    method: Option<String>,
    #[serde(default)]
    id: Option<serde_json::Value>,
    #[serde(default)]
    error: Option<JsonRpcErrorBody>,
}

/// Classify a captured request body. Parse failure yields an empty verdict
/// (`is_a2a` still reflects the transport-level check the caller passed in).
pub fn classify_request(is_a2a: bool, body: &[u8]) -> ClassifierVerdict {
    let mut verdict = ClassifierVerdict {
        is_a2a,
        ..Default::default()
    };
    if !is_a2a || body.is_empty() {
        return verdict;
    }
    if let Ok(envelope) = serde_json::from_slice::<JsonRpcEnvelope>(body) {
        verdict.method = envelope.method;
        verdict.jsonrpc_id = envelope.id.map(jsonrpc_id_to_string);
    }
    verdict
}

/// Classify a captured response body, extracting a JSON-RPC `error` object
/// if present.
pub fn classify_response(body: &[u8]) -> ClassifierVerdict {
    let mut verdict = ClassifierVerdict::default();
    if body.is_empty() {
        return verdict;
    }
    if let Ok(envelope) = serde_json::from_slice::<JsonRpcEnvelope>(body) {
        verdict.jsonrpc_id = envelope.id.map(jsonrpc_id_to_string);
        verdict.jsonrpc_error = envelope.error;
    }
    verdict
}

fn jsonrpc_id_to_string(value: serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s,
        other => other.to_string(),
    }
}

/// Parse a `/.well-known/agent.json` response body into an [`AgentCard`].
/// Returns `None` on parse failure — no insight is emitted for this.
pub fn parse_agent_card(body: &[u8]) -> Option<AgentCard> {
    serde_json::from_slice(body).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn post_with_json_content_type_is_a2a() {
        assert!(is_a2a_request(
            &Method::POST,
            "/",
            Some("application/json; charset=utf-8")
        ));
    }

    #[test]
    fn post_without_json_is_not_a2a() {
        assert!(!is_a2a_request(&Method::POST, "/", Some("text/plain")));
    }

    #[test]
    fn get_agent_card_path_is_a2a() {
        assert!(is_a2a_request(
            &Method::GET,
            "/.well-known/agent.json",
            None
        ));
    }

    #[test]
    fn get_other_path_is_not_a2a() {
        assert!(!is_a2a_request(&Method::GET, "/health", None));
    }

    #[test]
    fn classify_request_extracts_method_and_id() {
        let body = br#"{"jsonrpc":"2.0","method":"tasks/create","id":7,"params":{}}"#;
        let verdict = classify_request(true, body);
        assert_eq!(verdict.method.as_deref(), Some("tasks/create"));
        assert_eq!(verdict.jsonrpc_id.as_deref(), Some("7"));
    }

    #[test]
    fn classify_request_malformed_body_is_non_fatal() {
        let verdict = classify_request(true, b"not json");
        assert!(verdict.method.is_none());
        assert!(verdict.jsonrpc_id.is_none());
    }

    #[test]
    fn classify_response_extracts_error() {
        let body = br#"{"jsonrpc":"2.0","id":7,"error":{"code":-32601,"message":"nope"}}"#;
        let verdict = classify_response(body);
        assert_eq!(verdict.jsonrpc_error.unwrap().code, -32601);
    }

    #[test]
    fn parse_agent_card_valid() {
        let body = br#"{"name":"Bob","url":"http://agent.local","version":"1.0","skills":[{"id":"s1","name":"greet"}]}"#;
        let card = parse_agent_card(body).unwrap();
        assert_eq!(card.name, "Bob");
        assert_eq!(card.skills[0].name, "greet");
    }

    #[test]
    fn parse_agent_card_invalid_returns_none() {
        assert!(parse_agent_card(b"{not json").is_none());
    }
}
