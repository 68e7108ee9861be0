//! Typed views over raw protocol messages.
//!
//! Trackers see every message exchanged with the adapter as untyped JSON. These helpers answer
//! "is this a `setDataBreakpoints` response?" and hand back the decoded payload in one step.
//! Anything malformed is simply not a match.

use adapter_protocol::{Event, Request};
use serde::Deserialize;
use serde_json::{Map, Value};

static NULL: Value = Value::Null;

#[derive(Debug, Clone, PartialEq)]
pub struct DebugRequest<A> {
    pub seq: u32,
    pub arguments: A,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DebugResponse<B> {
    pub seq: u32,
    pub request_seq: u32,
    pub success: bool,
    pub message: Option<String>,
    /// Present only for successful responses that carried a body.
    pub body: Option<B>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DebugEvent<B> {
    pub seq: u32,
    pub body: B,
}

fn envelope<'a>(message: &'a Value, kind: &str, name_key: &str, name: &str) -> Option<&'a Map<String, Value>> {
    let object = message.as_object()?;
    if object.get("type")?.as_str()? != kind {
        return None;
    }
    if object.get(name_key)?.as_str()? != name {
        return None;
    }
    Some(object)
}

fn seq_of(object: &Map<String, Value>, key: &str) -> Option<u32> {
    let seq = object.get(key)?.as_u64()?;
    u32::try_from(seq).ok()
}

pub fn as_request<R: Request>(message: &Value) -> Option<DebugRequest<R::Arguments>> {
    let object = envelope(message, "request", "command", R::COMMAND)?;
    let seq = seq_of(object, "seq")?;
    let arguments = object.get("arguments").unwrap_or(&NULL);
    let arguments = R::Arguments::deserialize(arguments).ok()?;
    Some(DebugRequest { seq, arguments })
}

pub fn as_response<R: Request>(message: &Value) -> Option<DebugResponse<R::Body>> {
    let object = envelope(message, "response", "command", R::COMMAND)?;
    let request_seq = seq_of(object, "request_seq")?;
    let success = object.get("success")?.as_bool()?;
    let body = match object.get("body") {
        Some(body) if success && !body.is_null() => Some(R::Body::deserialize(body).ok()?),
        _ => None,
    };
    Some(DebugResponse {
        seq: seq_of(object, "seq").unwrap_or(0),
        request_seq,
        success,
        message: object.get("message").and_then(Value::as_str).map(Into::into),
        body,
    })
}

pub fn as_event<E: Event>(message: &Value) -> Option<DebugEvent<E::Body>> {
    let object = envelope(message, "event", "event", E::EVENT)?;
    let body = object.get("body").unwrap_or(&NULL);
    let body = E::Body::deserialize(body).ok()?;
    Some(DebugEvent {
        seq: seq_of(object, "seq").unwrap_or(0),
        body,
    })
}

pub fn is_request<R: Request>(message: &Value) -> bool {
    as_request::<R>(message).is_some()
}

pub fn is_response<R: Request>(message: &Value) -> bool {
    as_response::<R>(message).is_some()
}

pub fn is_event<E: Event>(message: &Value) -> bool {
    as_event::<E>(message).is_some()
}

/// Truthiness of a JSON value, the way capability flags are usually interpreted.
pub fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map_or(true, |n| n != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use adapter_protocol::{events, requests};
    use serde_json::json;

    #[test]
    fn request_match() {
        let message = json!({"seq": 4, "type": "request", "command": "scopes", "arguments": {"frameId": 1000}});
        let request = as_request::<requests::Scopes>(&message).unwrap();
        assert_eq!(request.seq, 4);
        assert_eq!(request.arguments.frame_id, 1000);
        assert!(!is_request::<requests::Variables>(&message));
        assert!(!is_response::<requests::Scopes>(&message));
    }

    #[test]
    fn request_without_arguments() {
        let message = json!({"seq": 5, "type": "request", "command": "configurationDone"});
        assert!(is_request::<requests::ConfigurationDone>(&message));
        // Struct arguments are mandatory.
        let message = json!({"seq": 6, "type": "request", "command": "scopes"});
        assert!(!is_request::<requests::Scopes>(&message));
    }

    #[test]
    fn malformed_messages_never_match() {
        for message in [
            json!(null),
            json!(42),
            json!("scopes"),
            json!({}),
            json!({"type": 1, "command": "scopes"}),
            json!({"type": "request", "command": 7, "seq": 1}),
            json!({"type": "request", "command": "scopes", "seq": -1, "arguments": {"frameId": 1}}),
            json!({"type": "request", "command": "scopes", "seq": 1, "arguments": {"frameId": "x"}}),
        ] {
            assert!(!is_request::<requests::Scopes>(&message), "{}", message);
            assert!(!is_response::<requests::Scopes>(&message), "{}", message);
            assert!(!is_event::<events::Stopped>(&message), "{}", message);
        }
    }

    #[test]
    fn response_match() {
        let message = json!({
            "seq": 9, "type": "response", "request_seq": 3, "command": "setDataBreakpoints", "success": true,
            "body": {"breakpoints": [{"id": 1, "verified": true}, {"verified": false}]}
        });
        let response = as_response::<requests::SetDataBreakpoints>(&message).unwrap();
        assert_eq!(response.request_seq, 3);
        assert!(response.success);
        let body = response.body.unwrap();
        assert_eq!(body.breakpoints.len(), 2);
        assert_eq!(body.breakpoints[0].id, Some(1));
        assert!(!body.breakpoints[1].verified);
    }

    #[test]
    fn failed_response_has_no_body() {
        let message = json!({
            "seq": 9, "type": "response", "request_seq": 3, "command": "setDataBreakpoints", "success": false,
            "message": "not supported", "body": {"error": {"id": 1, "format": "not supported"}}
        });
        let response = as_response::<requests::SetDataBreakpoints>(&message).unwrap();
        assert!(!response.success);
        assert_eq!(response.message.as_deref(), Some("not supported"));
        assert!(response.body.is_none());
    }

    #[test]
    fn response_with_bad_body() {
        let message = json!({
            "seq": 9, "type": "response", "request_seq": 3, "command": "setDataBreakpoints", "success": true,
            "body": {"breakpoints": "none"}
        });
        assert!(!is_response::<requests::SetDataBreakpoints>(&message));
    }

    #[test]
    fn event_match() {
        let message = json!({"seq": 2, "type": "event", "event": "stopped", "body": {"reason": "breakpoint", "threadId": 1}});
        let event = as_event::<events::Stopped>(&message).unwrap();
        assert_eq!(event.body.reason, "breakpoint");
        assert_eq!(event.body.thread_id, Some(1));
        assert!(!is_event::<events::Continued>(&message));

        let message = json!({"seq": 3, "type": "event", "event": "initialized"});
        assert!(is_event::<events::Initialized>(&message));
        let message = json!({"seq": 3, "type": "event", "event": "stopped"});
        assert!(!is_event::<events::Stopped>(&message));
    }

    #[test]
    fn truthiness() {
        assert!(is_truthy(&json!(true)));
        assert!(is_truthy(&json!(1)));
        assert!(is_truthy(&json!("yes")));
        assert!(is_truthy(&json!({})));
        assert!(!is_truthy(&json!(false)));
        assert!(!is_truthy(&json!(0)));
        assert!(!is_truthy(&json!("")));
        assert!(!is_truthy(&json!(null)));
    }
}
