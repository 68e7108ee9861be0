use crate::classifier::{as_event, as_request, as_response, is_event, is_truthy};
use crate::debug_host::{DebugAdapterTracker, DebugAdapterTrackerFactory, DebugHost, SessionRef};
use crate::events::{Disposable, EventEmitter};
use crate::prelude::*;

use adapter_protocol::{events, requests, Capabilities, ClientCapabilities, ContinuedEventBody, MemoryEventBody, StoppedEventBody};
use serde_json::Value;
use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::{Rc, Weak};

/// Everything the inspector knows about one running session.
#[derive(Debug, Clone)]
pub struct SessionInfo {
    pub session: SessionRef,
    pub debug_capabilities: Option<Capabilities>,
    pub client_capabilities: Option<ClientCapabilities>,
    pub active: bool,
    pub stopped: bool,
}

impl SessionInfo {
    fn new(session: SessionRef) -> SessionInfo {
        SessionInfo {
            session,
            debug_capabilities: None,
            client_capabilities: None,
            active: false,
            stopped: false,
        }
    }
}

#[derive(Debug, Clone)]
pub enum SessionEvent {
    /// The active session changed (possibly to none).
    Active { session: Option<SessionRef> },
    /// A session was added, removed, or its capabilities became known.
    Changed { session: SessionRef },
    Stopped { session: SessionRef, body: StoppedEventBody },
    Continued { session: SessionRef, body: ContinuedEventBody },
    MemoryWritten { session: SessionRef, body: MemoryEventBody },
}

impl SessionEvent {
    pub fn session(&self) -> Option<&SessionRef> {
        match self {
            SessionEvent::Active { session } => session.as_ref(),
            SessionEvent::Changed { session }
            | SessionEvent::Stopped { session, .. }
            | SessionEvent::Continued { session, .. }
            | SessionEvent::MemoryWritten { session, .. } => Some(session),
        }
    }
}

/// Maintains per-session state derived from the observed message stream, and
/// republishes it as a single stream of `SessionEvent`s.
pub struct SessionTracker {
    host: Rc<DebugHost>,
    sessions: RefCell<HashMap<String, SessionInfo>>,
    session_events: EventEmitter<SessionEvent>,
    to_dispose: RefCell<Vec<Disposable>>,
}

impl SessionTracker {
    pub fn new(host: &Rc<DebugHost>) -> Rc<SessionTracker> {
        Rc::new(SessionTracker {
            host: host.clone(),
            sessions: RefCell::new(HashMap::new()),
            session_events: EventEmitter::new(),
            to_dispose: RefCell::new(Vec::new()),
        })
    }

    /// Starts observing all sessions, regardless of their type.
    pub fn activate(self: &Rc<Self>) {
        let factory = Rc::new(SessionObserverFactory {
            tracker: Rc::downgrade(self),
        });
        let registration = self.host.register_tracker_factory(factory);

        let tracker = Rc::downgrade(self);
        let subscription = self.host.on_did_change_active_session(move |session| {
            if let Some(tracker) = tracker.upgrade() {
                tracker.active_session_changed(session.clone());
            }
        });
        self.to_dispose.borrow_mut().extend([registration, subscription]);
    }

    pub fn dispose(&self) {
        for mut disposable in self.to_dispose.borrow_mut().drain(..) {
            disposable.dispose();
        }
        self.session_events.clear();
    }

    pub fn on_session_event(&self, listener: impl Fn(&SessionEvent) + 'static) -> Disposable {
        self.session_events.subscribe(listener)
    }

    /// Publishes an event on behalf of another component, e.g. a synthesized memory write notification.
    pub fn fire_session_event(&self, event: SessionEvent) {
        self.session_events.fire(&event);
    }

    pub fn active_session(&self) -> Option<SessionRef> {
        self.host.active_session()
    }

    pub fn session(&self, session_id: &str) -> Option<SessionRef> {
        self.sessions.borrow().get(session_id).map(|info| info.session.clone())
    }

    pub fn sessions(&self) -> Vec<SessionRef> {
        self.sessions.borrow().values().map(|info| info.session.clone()).collect()
    }

    pub fn session_info(&self, session_id: &str) -> Option<SessionInfo> {
        self.sessions.borrow().get(session_id).cloned()
    }

    pub fn is_active(&self, session_id: &str) -> bool {
        self.sessions.borrow().get(session_id).map_or(false, |info| info.active)
    }

    pub fn is_stopped(&self, session_id: &str) -> bool {
        self.sessions.borrow().get(session_id).map_or(false, |info| info.stopped)
    }

    pub fn debug_capabilities(&self, session_id: &str) -> Option<Capabilities> {
        self.sessions.borrow().get(session_id).and_then(|info| info.debug_capabilities.clone())
    }

    pub fn client_capabilities(&self, session_id: &str) -> Option<ClientCapabilities> {
        self.sessions.borrow().get(session_id).and_then(|info| info.client_capabilities.clone())
    }

    pub fn has_debug_capability(&self, session_id: &str, capability: &str) -> bool {
        self.sessions.borrow().get(session_id).map_or(false, |info| {
            info.debug_capabilities.as_ref().and_then(|c| c.get(capability)).map_or(false, is_truthy)
        })
    }

    pub fn has_client_capability(&self, session_id: &str, capability: &str) -> bool {
        self.sessions.borrow().get(session_id).map_or(false, |info| {
            info.client_capabilities.as_ref().and_then(|c| c.get(capability)).map_or(false, is_truthy)
        })
    }

    pub fn assert_active_session(&self, action: &str) -> Result<SessionRef, Error> {
        match self.active_session() {
            Some(session) => Ok(session),
            None => bail!(SessionError::NoActiveSession { action: action.into() }),
        }
    }

    /// Resolves a session by id, or the active session when no id is given.
    pub fn assert_session(&self, session_id: Option<&str>, action: &str) -> Result<SessionRef, Error> {
        match session_id {
            None => self.assert_active_session(action),
            Some(id) => match self.session(id) {
                Some(session) => Ok(session),
                None => {
                    debug!("No debug session with id {}", id);
                    bail!(SessionError::UnknownSession {
                        action: action.into(),
                        id: id.into(),
                    })
                }
            },
        }
    }

    pub fn assert_debug_capability(&self, session: &SessionRef, capability: &str, action: &str) -> Result<(), Error> {
        if !self.has_debug_capability(session.id(), capability) {
            bail!(SessionError::MissingCapability {
                action: action.into(),
                capability: capability.into(),
            });
        }
        Ok(())
    }

    pub fn assert_client_capability(&self, session: &SessionRef, capability: &str, action: &str) -> Result<(), Error> {
        if !self.has_client_capability(session.id(), capability) {
            bail!(SessionError::MissingCapability {
                action: action.into(),
                capability: capability.into(),
            });
        }
        Ok(())
    }

    fn session_will_start(&self, session: &SessionRef) {
        self.sessions.borrow_mut().insert(session.id().into(), SessionInfo::new(session.clone()));
        self.fire_session_event(SessionEvent::Changed {
            session: session.clone(),
        });
    }

    fn session_will_stop(&self, session: &SessionRef) {
        self.sessions.borrow_mut().remove(session.id());
        self.fire_session_event(SessionEvent::Changed {
            session: session.clone(),
        });
    }

    fn with_info<R>(&self, session: &SessionRef, f: impl FnOnce(&mut SessionInfo) -> R) -> R {
        let mut sessions = self.sessions.borrow_mut();
        let info = sessions.entry(session.id().into()).or_insert_with(|| SessionInfo::new(session.clone()));
        f(info)
    }

    fn client_message(&self, session: &SessionRef, message: &Value) {
        if let Some(request) = as_request::<requests::Initialize>(message) {
            self.with_info(session, |info| info.client_capabilities = Some(request.arguments));
            self.fire_session_event(SessionEvent::Changed {
                session: session.clone(),
            });
        }
    }

    fn adapter_message(&self, session: &SessionRef, message: &Value) {
        if let Some(response) = as_response::<requests::Initialize>(message) {
            if response.success {
                let capabilities = response.body.unwrap_or_default();
                self.with_info(session, |info| info.debug_capabilities = Some(capabilities));
                self.fire_session_event(SessionEvent::Changed {
                    session: session.clone(),
                });
            }
        } else if let Some(event) = as_event::<events::Stopped>(message) {
            self.with_info(session, |info| info.stopped = true);
            self.fire_session_event(SessionEvent::Stopped {
                session: session.clone(),
                body: event.body,
            });
        } else if let Some(event) = as_event::<events::Continued>(message) {
            self.with_info(session, |info| info.stopped = false);
            self.fire_session_event(SessionEvent::Continued {
                session: session.clone(),
                body: event.body,
            });
        } else if let Some(event) = as_event::<events::Memory>(message) {
            self.fire_session_event(SessionEvent::MemoryWritten {
                session: session.clone(),
                body: event.body,
            });
        } else if is_event::<events::Terminated>(message) {
            debug!("Session {} terminated", session.id());
        }
    }

    fn active_session_changed(&self, session: Option<SessionRef>) {
        {
            let mut sessions = self.sessions.borrow_mut();
            let active_id = session.as_ref().map(|s| s.id());
            for (id, info) in sessions.iter_mut() {
                info.active = Some(id.as_str()) == active_id;
            }
        }
        self.fire_session_event(SessionEvent::Active { session });
    }
}

struct SessionObserverFactory {
    tracker: Weak<SessionTracker>,
}

impl DebugAdapterTrackerFactory for SessionObserverFactory {
    fn create_tracker(&self, session: &SessionRef) -> Option<Box<dyn DebugAdapterTracker>> {
        Some(Box::new(SessionObserver {
            tracker: self.tracker.clone(),
            session: session.clone(),
        }))
    }
}

struct SessionObserver {
    tracker: Weak<SessionTracker>,
    session: SessionRef,
}

impl DebugAdapterTracker for SessionObserver {
    fn on_will_start_session(&self) {
        if let Some(tracker) = self.tracker.upgrade() {
            tracker.session_will_start(&self.session);
        }
    }

    fn on_will_receive_message(&self, message: &Value) {
        if let Some(tracker) = self.tracker.upgrade() {
            tracker.client_message(&self.session, message);
        }
    }

    fn on_did_send_message(&self, message: &Value) {
        if let Some(tracker) = self.tracker.upgrade() {
            tracker.adapter_message(&self.session, message);
        }
    }

    fn on_will_stop_session(&self) {
        if let Some(tracker) = self.tracker.upgrade() {
            tracker.session_will_stop(&self.session);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::debug_host::DebugSession;
    use crate::test_support::FakeSession;
    use adapter_protocol::{SUPPORTS_DATA_BREAKPOINTS, SUPPORTS_READ_MEMORY_REQUEST, SUPPORTS_WRITE_MEMORY_REQUEST};
    use serde_json::json;

    fn setup() -> (Rc<DebugHost>, Rc<SessionTracker>, Rc<RefCell<Vec<String>>>) {
        let host = DebugHost::new();
        let tracker = SessionTracker::new(&host);
        tracker.activate();
        let log = Rc::new(RefCell::new(Vec::new()));
        let log2 = log.clone();
        let _subscription = tracker.on_session_event(move |event| {
            let name = match event {
                SessionEvent::Active { .. } => "active",
                SessionEvent::Changed { .. } => "changed",
                SessionEvent::Stopped { .. } => "stopped",
                SessionEvent::Continued { .. } => "continued",
                SessionEvent::MemoryWritten { .. } => "memory",
            };
            log2.borrow_mut().push(name.to_owned());
        });
        (host, tracker, log)
    }

    #[test]
    fn stopped_flag_follows_events() {
        let (host, tracker, log) = setup();
        let session = FakeSession::start(&host, "s1", "gdb", |_, _| Ok(json!({})));
        assert!(!tracker.is_stopped("s1"));

        session.adapter_event("stopped", json!({"reason": "breakpoint", "threadId": 1}));
        assert!(tracker.is_stopped("s1"));
        session.adapter_event("continued", json!({"threadId": 1}));
        assert!(!tracker.is_stopped("s1"));
        session.adapter_event("stopped", json!({"reason": "step"}));
        assert!(tracker.is_stopped("s1"));

        assert_eq!(*log.borrow(), vec!["changed", "stopped", "continued", "stopped"]);
    }

    #[test]
    fn stopped_flags_are_per_session() {
        let (host, tracker, _) = setup();
        let s1 = FakeSession::start(&host, "s1", "gdb", |_, _| Ok(json!({})));
        let s2 = FakeSession::start(&host, "s2", "gdb", |_, _| Ok(json!({})));

        s1.adapter_event("stopped", json!({"reason": "breakpoint", "threadId": 1}));
        assert!(tracker.is_stopped("s1"));
        assert!(!tracker.is_stopped("s2"));

        s2.adapter_event("stopped", json!({"reason": "pause", "threadId": 7}));
        s1.adapter_event("continued", json!({"threadId": 1}));
        assert!(!tracker.is_stopped("s1"));
        assert!(tracker.is_stopped("s2"));

        s1.adapter_event("stopped", json!({"reason": "step"}));
        s2.adapter_event("continued", json!({"threadId": 7}));
        assert!(tracker.is_stopped("s1"));
        assert!(!tracker.is_stopped("s2"));
    }

    #[test]
    fn capability_gates() {
        let (host, tracker, _) = setup();
        let session = FakeSession::start(&host, "s1", "gdb", |_, _| Ok(json!({})));
        session.initialize(json!({
            "supportsReadMemoryRequest": true,
            "supportsWriteMemoryRequest": false,
        }));
        let session_ref = tracker.session("s1").unwrap();

        assert!(tracker.assert_debug_capability(&session_ref, SUPPORTS_READ_MEMORY_REQUEST, "read memory").is_ok());
        let err = tracker
            .assert_debug_capability(&session_ref, SUPPORTS_WRITE_MEMORY_REQUEST, "write memory")
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            "cannot write memory: session does not have capability 'supportsWriteMemoryRequest'"
        );
        assert!(tracker.assert_debug_capability(&session_ref, SUPPORTS_DATA_BREAKPOINTS, "watch").is_err());
        assert!(tracker.has_client_capability("s1", "supportsMemoryReferences"));
        assert!(!tracker.has_client_capability("s1", "supportsRunInTerminalRequest"));

        let capabilities = tracker.debug_capabilities("s1").unwrap();
        assert_eq!(capabilities.get(SUPPORTS_READ_MEMORY_REQUEST), Some(&json!(true)));
        assert_eq!(tracker.client_capabilities("s1").unwrap()["adapterID"], "gdb");
        assert!(tracker.debug_capabilities("s2").is_none());
    }

    #[test]
    fn failed_initialize_keeps_capabilities_unknown() {
        let (host, tracker, _) = setup();
        let session = FakeSession::start(&host, "s1", "gdb", |_, _| Err("no".into()));
        let _ = futures::executor::block_on(session.custom_request("initialize", json!({"adapterID": "gdb"})));
        assert!(tracker.session_info("s1").unwrap().debug_capabilities.is_none());
        assert!(tracker.session_info("s1").unwrap().client_capabilities.is_some());
    }

    #[test]
    fn active_session_marking() {
        let (host, tracker, log) = setup();
        let _s1 = FakeSession::start(&host, "s1", "gdb", |_, _| Ok(json!({})));
        let _s2 = FakeSession::start(&host, "s2", "gdb", |_, _| Ok(json!({})));

        host.set_active_session(Some("s1"));
        assert!(tracker.is_active("s1"));
        assert!(!tracker.is_active("s2"));
        host.set_active_session(Some("s2"));
        assert!(!tracker.is_active("s1"));
        assert!(tracker.is_active("s2"));
        assert_eq!(tracker.active_session().unwrap().id(), "s2");

        host.session_will_stop("s2");
        assert!(tracker.session("s2").is_none());
        assert!(tracker.active_session().is_none());
        assert_eq!(*log.borrow(), vec!["changed", "changed", "active", "active", "changed", "active"]);
    }

    #[test]
    fn session_gates() {
        let (host, tracker, _) = setup();
        let err = tracker.assert_active_session("read memory").unwrap_err();
        assert_eq!(err.to_string(), "cannot read memory: no active debug session");

        let _s1 = FakeSession::start(&host, "s1", "gdb", |_, _| Ok(json!({})));
        assert!(tracker.assert_session(Some("s1"), "read memory").is_ok());
        let err = tracker.assert_session(Some("s9"), "read memory").unwrap_err();
        assert_eq!(err.to_string(), "cannot read memory: no active debug session");
        assert!(matches!(
            err.downcast_ref::<SessionError>(),
            Some(SessionError::UnknownSession { id, .. }) if id == "s9"
        ));
        assert!(tracker.assert_session(None, "read memory").is_err());
    }

    #[test]
    fn memory_event_is_republished() {
        let (host, tracker, _) = setup();
        let session = FakeSession::start(&host, "s1", "gdb", |_, _| Ok(json!({})));
        let seen = Rc::new(RefCell::new(None));
        let seen2 = seen.clone();
        let _subscription = tracker.on_session_event(move |event| {
            if let SessionEvent::MemoryWritten { body, .. } = event {
                *seen2.borrow_mut() = Some(body.clone());
            }
        });
        session.adapter_event("memory", json!({"memoryReference": "0x1000", "offset": 0, "count": 4}));
        let body = seen.borrow().clone().unwrap();
        assert_eq!(body.memory_reference, "0x1000");
        assert_eq!(body.count, 4);
    }

    #[test]
    fn dispose_stops_observing() {
        let (host, tracker, log) = setup();
        tracker.dispose();
        let _s1 = FakeSession::start(&host, "s1", "gdb", |_, _| Ok(json!({})));
        assert!(tracker.session("s1").is_none());
        assert!(log.borrow().is_empty());
    }
}
