use crate::debug_host::{DebugHost, DebugSession, SessionRef};
use crate::prelude::*;

use futures::future::{self, FutureExt, LocalBoxFuture};
use serde_json::{json, Value};
use std::cell::{Cell, RefCell};
use std::rc::{Rc, Weak};

type Handler = Box<dyn FnMut(&str, &Value) -> Result<Value, String>>;

/// An in-process stand-in for a debug adapter connection.
///
/// Every message it exchanges is routed through the host, exactly as a real connection's
/// traffic would be, so trackers see requests, events and responses in wire order.
pub struct FakeSession {
    id: String,
    session_type: String,
    host: Weak<DebugHost>,
    seq: Cell<u32>,
    handler: RefCell<Handler>,
    requests: RefCell<Vec<(String, Value)>>,
    // Events delivered between the next request and its response.
    queued_events: RefCell<Vec<(String, Value)>>,
    next_request_hook: RefCell<Option<Box<dyn FnOnce()>>>,
}

impl FakeSession {
    pub fn start(
        host: &Rc<DebugHost>,
        id: &str,
        session_type: &str,
        handler: impl FnMut(&str, &Value) -> Result<Value, String> + 'static,
    ) -> Rc<FakeSession> {
        let session = Rc::new(FakeSession {
            id: id.into(),
            session_type: session_type.into(),
            host: Rc::downgrade(host),
            seq: Cell::new(1),
            handler: RefCell::new(Box::new(handler)),
            requests: RefCell::new(Vec::new()),
            queued_events: RefCell::new(Vec::new()),
            next_request_hook: RefCell::new(None),
        });
        let session_ref: SessionRef = session.clone();
        host.session_will_start(session_ref);
        session
    }

    fn next_seq(&self) -> u32 {
        let seq = self.seq.get();
        self.seq.set(seq + 1);
        seq
    }

    fn host(&self) -> Rc<DebugHost> {
        self.host.upgrade().expect("host dropped")
    }

    /// Commands and arguments of all requests sent so far, in order.
    pub fn requests(&self) -> Vec<(String, Value)> {
        self.requests.borrow().clone()
    }

    /// Runs the initialize handshake, advertising `capabilities`.
    pub fn initialize(&self, capabilities: Value) {
        let seq = self.client_request(
            "initialize",
            json!({"adapterID": self.session_type, "supportsMemoryReferences": true, "supportsMemoryEvent": true}),
        );
        self.adapter_response(seq, "initialize", Ok(capabilities));
    }

    /// A request sent by some other client component. Only observed; never answered automatically.
    pub fn client_request(&self, command: &str, arguments: Value) -> u32 {
        let seq = self.next_seq();
        let message = json!({"seq": seq, "type": "request", "command": command, "arguments": arguments});
        self.requests.borrow_mut().push((command.into(), arguments));
        self.host().client_message(&self.id, &message);
        seq
    }

    pub fn adapter_response(&self, request_seq: u32, command: &str, result: Result<Value, String>) {
        let mut message = json!({
            "seq": self.next_seq(),
            "type": "response",
            "request_seq": request_seq,
            "command": command,
            "success": result.is_ok(),
        });
        match result {
            Ok(body) => message["body"] = body,
            Err(text) => message["message"] = Value::String(text),
        }
        self.host().adapter_message(&self.id, &message);
    }

    pub fn adapter_event(&self, event: &str, body: Value) {
        let message = json!({"seq": self.next_seq(), "type": "event", "event": event, "body": body});
        self.host().adapter_message(&self.id, &message);
    }

    /// Queues an event to be sent after the next request is observed, before its response.
    pub fn push_event(&self, event: &str, body: Value) {
        self.queued_events.borrow_mut().push((event.into(), body));
    }

    /// Runs `hook` after the next request is observed, before its response.
    pub fn on_next_request(&self, hook: impl FnOnce() + 'static) {
        *self.next_request_hook.borrow_mut() = Some(Box::new(hook));
    }
}

impl DebugSession for FakeSession {
    fn id(&self) -> &str {
        &self.id
    }

    fn name(&self) -> &str {
        &self.id
    }

    fn session_type(&self) -> &str {
        &self.session_type
    }

    fn custom_request(&self, command: &str, args: Value) -> LocalBoxFuture<'static, Result<Value, Error>> {
        let seq = self.client_request(command, args.clone());
        let result = (self.handler.borrow_mut())(command, &args);

        let hook = self.next_request_hook.borrow_mut().take();
        if let Some(hook) = hook {
            hook();
        }
        let events: Vec<_> = self.queued_events.borrow_mut().drain(..).collect();
        for (event, body) in events {
            self.adapter_event(&event, body);
        }

        self.adapter_response(seq, command, result.clone());
        let result: Result<Value, Error> = result.map_err(|text| blame_user(str_error(text)).into());
        future::ready(result).boxed_local()
    }
}
