use crate::events::{Disposable, EventEmitter};
use crate::prelude::*;

use adapter_protocol::Request;
use futures::future::LocalBoxFuture;
use serde::Deserialize;
use serde_json::Value;
use std::cell::{Cell, RefCell};
use std::fmt;
use std::rc::Rc;

/// A live connection to a debug adapter, as seen by the inspector.
pub trait DebugSession {
    fn id(&self) -> &str;
    fn name(&self) -> &str;
    fn session_type(&self) -> &str;
    /// Sends a request to the adapter and resolves with the body of its response.
    /// The outbound message is observed by the host's trackers before its response is.
    fn custom_request(&self, command: &str, args: Value) -> LocalBoxFuture<'static, Result<Value, Error>>;
}

pub type SessionRef = Rc<dyn DebugSession>;

impl fmt::Debug for dyn DebugSession {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "DebugSession({}, type={})", self.id(), self.session_type())
    }
}

/// Typed wrapper over `DebugSession::custom_request`.
pub async fn request<R: Request>(session: &dyn DebugSession, args: &R::Arguments) -> Result<R::Body, Error> {
    let args = serde_json::to_value(args)?;
    let body = session.custom_request(R::COMMAND, args).await?;
    Ok(R::Body::deserialize(&body)?)
}

/// Observes one session's traffic. All methods are optional.
pub trait DebugAdapterTracker {
    fn on_will_start_session(&self) {}
    /// A message from the client to the adapter.
    fn on_will_receive_message(&self, _message: &Value) {}
    /// A message from the adapter to the client.
    fn on_did_send_message(&self, _message: &Value) {}
    fn on_will_stop_session(&self) {}
    fn on_exit(&self) {}
}

impl<T: DebugAdapterTracker + ?Sized> DebugAdapterTracker for Rc<T> {
    fn on_will_start_session(&self) {
        (**self).on_will_start_session()
    }
    fn on_will_receive_message(&self, message: &Value) {
        (**self).on_will_receive_message(message)
    }
    fn on_did_send_message(&self, message: &Value) {
        (**self).on_did_send_message(message)
    }
    fn on_will_stop_session(&self) {
        (**self).on_will_stop_session()
    }
    fn on_exit(&self) {
        (**self).on_exit()
    }
}

pub trait DebugAdapterTrackerFactory {
    fn create_tracker(&self, session: &SessionRef) -> Option<Box<dyn DebugAdapterTracker>>;
}

struct HostSession {
    session: SessionRef,
    trackers: Rc<Vec<Box<dyn DebugAdapterTracker>>>,
}

/// Owns the set of running sessions, routes their traffic to trackers and
/// keeps track of which session is active.
pub struct DebugHost {
    factories: RefCell<Vec<(u64, Rc<dyn DebugAdapterTrackerFactory>)>>,
    next_factory_id: Cell<u64>,
    sessions: RefCell<Vec<HostSession>>,
    active_session: RefCell<Option<SessionRef>>,
    active_session_changed: EventEmitter<Option<SessionRef>>,
}

impl DebugHost {
    pub fn new() -> Rc<DebugHost> {
        Rc::new(DebugHost {
            factories: RefCell::new(Vec::new()),
            next_factory_id: Cell::new(0),
            sessions: RefCell::new(Vec::new()),
            active_session: RefCell::new(None),
            active_session_changed: EventEmitter::new(),
        })
    }

    /// Factories apply to sessions started after registration.
    pub fn register_tracker_factory(self: &Rc<Self>, factory: Rc<dyn DebugAdapterTrackerFactory>) -> Disposable {
        let id = self.next_factory_id.get();
        self.next_factory_id.set(id + 1);
        self.factories.borrow_mut().push((id, factory));

        let host = Rc::downgrade(self);
        Disposable::new(move || {
            if let Some(host) = host.upgrade() {
                host.factories.borrow_mut().retain(|(factory_id, _)| *factory_id != id);
            }
        })
    }

    pub fn on_did_change_active_session(&self, listener: impl Fn(&Option<SessionRef>) + 'static) -> Disposable {
        self.active_session_changed.subscribe(listener)
    }

    pub fn session_will_start(&self, session: SessionRef) {
        debug!("Session {} ({}) starting", session.id(), session.session_type());
        let factories: Vec<_> = self.factories.borrow().iter().map(|(_, f)| f.clone()).collect();
        let trackers: Vec<_> = factories.iter().filter_map(|factory| factory.create_tracker(&session)).collect();
        let trackers = Rc::new(trackers);
        self.sessions.borrow_mut().push(HostSession {
            session,
            trackers: trackers.clone(),
        });
        for tracker in trackers.iter() {
            tracker.on_will_start_session();
        }
    }

    pub fn client_message(&self, session_id: &str, message: &Value) {
        if let Some(trackers) = self.trackers(session_id) {
            for tracker in trackers.iter() {
                tracker.on_will_receive_message(message);
            }
        }
    }

    pub fn adapter_message(&self, session_id: &str, message: &Value) {
        if let Some(trackers) = self.trackers(session_id) {
            for tracker in trackers.iter() {
                tracker.on_did_send_message(message);
            }
        }
    }

    pub fn session_will_stop(&self, session_id: &str) {
        let trackers = match self.trackers(session_id) {
            Some(trackers) => trackers,
            None => return,
        };
        debug!("Session {} stopping", session_id);
        for tracker in trackers.iter() {
            tracker.on_will_stop_session();
        }
        self.sessions.borrow_mut().retain(|s| s.session.id() != session_id);
        for tracker in trackers.iter() {
            tracker.on_exit();
        }

        let was_active = matches!(&*self.active_session.borrow(), Some(active) if active.id() == session_id);
        if was_active {
            self.set_active_session(None);
        }
    }

    /// Makes the session with the given id active; `None` or an unknown id clears the active session.
    pub fn set_active_session(&self, session_id: Option<&str>) {
        let session = session_id.and_then(|id| self.session(id));
        *self.active_session.borrow_mut() = session.clone();
        self.active_session_changed.fire(&session);
    }

    pub fn active_session(&self) -> Option<SessionRef> {
        self.active_session.borrow().clone()
    }

    pub fn session(&self, session_id: &str) -> Option<SessionRef> {
        self.sessions.borrow().iter().find(|s| s.session.id() == session_id).map(|s| s.session.clone())
    }

    pub fn sessions(&self) -> Vec<SessionRef> {
        self.sessions.borrow().iter().map(|s| s.session.clone()).collect()
    }

    fn trackers(&self, session_id: &str) -> Option<Rc<Vec<Box<dyn DebugAdapterTracker>>>> {
        self.sessions.borrow().iter().find(|s| s.session.id() == session_id).map(|s| s.trackers.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::FakeSession;
    use serde_json::json;

    struct Recorder {
        log: Rc<RefCell<Vec<String>>>,
    }

    impl DebugAdapterTracker for Recorder {
        fn on_will_start_session(&self) {
            self.log.borrow_mut().push("start".into());
        }
        fn on_will_receive_message(&self, message: &Value) {
            self.log.borrow_mut().push(format!("client:{}", message["command"].as_str().unwrap_or("?")));
        }
        fn on_did_send_message(&self, message: &Value) {
            self.log.borrow_mut().push(format!("adapter:{}", message["type"].as_str().unwrap_or("?")));
        }
        fn on_will_stop_session(&self) {
            self.log.borrow_mut().push("stop".into());
        }
        fn on_exit(&self) {
            self.log.borrow_mut().push("exit".into());
        }
    }

    struct RecorderFactory {
        log: Rc<RefCell<Vec<String>>>,
        session_type: &'static str,
    }

    impl DebugAdapterTrackerFactory for RecorderFactory {
        fn create_tracker(&self, session: &SessionRef) -> Option<Box<dyn DebugAdapterTracker>> {
            if session.session_type() == self.session_type {
                Some(Box::new(Recorder { log: self.log.clone() }))
            } else {
                None
            }
        }
    }

    #[test]
    fn tracker_lifecycle() {
        let host = DebugHost::new();
        let log = Rc::new(RefCell::new(Vec::new()));
        let _registration = host.register_tracker_factory(Rc::new(RecorderFactory {
            log: log.clone(),
            session_type: "gdb",
        }));

        let session = FakeSession::start(&host, "1", "gdb", |_, _| Ok(json!({})));
        futures::executor::block_on(session.custom_request("threads", Value::Null)).unwrap();
        host.session_will_stop("1");

        assert_eq!(*log.borrow(), vec!["start", "client:threads", "adapter:response", "stop", "exit"]);
        assert!(host.session("1").is_none());
    }

    #[test]
    fn factory_filters_by_type() {
        let host = DebugHost::new();
        let log = Rc::new(RefCell::new(Vec::new()));
        let _registration = host.register_tracker_factory(Rc::new(RecorderFactory {
            log: log.clone(),
            session_type: "gdb",
        }));
        let _session = FakeSession::start(&host, "1", "lldb", |_, _| Ok(json!({})));
        assert!(log.borrow().is_empty());
    }

    #[test]
    fn disposed_factory_is_not_consulted() {
        let host = DebugHost::new();
        let log = Rc::new(RefCell::new(Vec::new()));
        let mut registration = host.register_tracker_factory(Rc::new(RecorderFactory {
            log: log.clone(),
            session_type: "gdb",
        }));
        registration.dispose();
        let _session = FakeSession::start(&host, "1", "gdb", |_, _| Ok(json!({})));
        assert!(log.borrow().is_empty());
    }

    #[test]
    fn active_session_changes() {
        let host = DebugHost::new();
        let seen = Rc::new(RefCell::new(Vec::new()));
        let seen2 = seen.clone();
        let _subscription = host.on_did_change_active_session(move |session| {
            seen2.borrow_mut().push(session.as_ref().map(|s| s.id().to_owned()));
        });

        let _first = FakeSession::start(&host, "1", "gdb", |_, _| Ok(json!({})));
        let _second = FakeSession::start(&host, "2", "gdb", |_, _| Ok(json!({})));
        host.set_active_session(Some("2"));
        assert_eq!(host.active_session().unwrap().id(), "2");
        host.session_will_stop("2");
        assert!(host.active_session().is_none());
        assert_eq!(*seen.borrow(), vec![Some("2".to_owned()), None]);
    }
}
