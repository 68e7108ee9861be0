use crate::debug_host::{DebugAdapterTracker, DebugAdapterTrackerFactory, DebugHost, SessionRef};
use crate::events::Disposable;
use crate::prelude::*;

use adapter_protocol::{
    ConnectionContext, MemoryDisplaySettingsContribution, ReadMemoryArguments, ReadMemoryResponseBody, VariableRange,
    WriteMemoryArguments, WriteMemoryResponseBody,
};
use futures::future::LocalBoxFuture;
use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::rc::Rc;

/// Optional, adapter-specific extensions to plain DAP.
///
/// Every method returns `None` when the adapter has nothing special to offer, in which case
/// callers fall back to standard protocol requests or to an empty result.
pub trait AdapterCapabilities {
    /// All variables currently known for the session.
    fn get_variables<'a>(
        &'a self,
        _session: &'a SessionRef,
        _context: Option<&'a ConnectionContext>,
    ) -> Option<LocalBoxFuture<'a, Vec<VariableRange>>> {
        None
    }

    /// Variables that share at least one byte with the memory range described by `args`.
    fn get_residents<'a>(
        &'a self,
        _session: &'a SessionRef,
        _args: &'a ReadMemoryArguments,
        _context: Option<&'a ConnectionContext>,
    ) -> Option<LocalBoxFuture<'a, Vec<VariableRange>>> {
        None
    }

    fn get_address_of_variable<'a>(
        &'a self,
        _session: &'a SessionRef,
        _name: &'a str,
        _context: Option<&'a ConnectionContext>,
    ) -> Option<LocalBoxFuture<'a, Option<String>>> {
        None
    }

    fn get_size_of_variable<'a>(
        &'a self,
        _session: &'a SessionRef,
        _name: &'a str,
        _context: Option<&'a ConnectionContext>,
    ) -> Option<LocalBoxFuture<'a, Option<u128>>> {
        None
    }

    fn read_memory<'a>(
        &'a self,
        _session: &'a SessionRef,
        _args: &'a ReadMemoryArguments,
        _context: Option<&'a ConnectionContext>,
    ) -> Option<LocalBoxFuture<'a, Result<ReadMemoryResponseBody, Error>>> {
        None
    }

    fn write_memory<'a>(
        &'a self,
        _session: &'a SessionRef,
        _args: &'a WriteMemoryArguments,
        _context: Option<&'a ConnectionContext>,
    ) -> Option<LocalBoxFuture<'a, Result<WriteMemoryResponseBody, Error>>> {
        None
    }

    fn get_connection_contexts<'a>(
        &'a self,
        _session: &'a SessionRef,
    ) -> Option<LocalBoxFuture<'a, Vec<ConnectionContext>>> {
        None
    }

    fn get_current_connection_context<'a>(
        &'a self,
        _session: &'a SessionRef,
    ) -> Option<LocalBoxFuture<'a, Option<ConnectionContext>>> {
        None
    }

    fn get_memory_display_settings<'a>(
        &'a self,
        _session: &'a SessionRef,
    ) -> Option<LocalBoxFuture<'a, MemoryDisplaySettingsContribution>> {
        None
    }

    /// A tracker to attach to a newly started session of one of the adapter's types.
    fn create_tracker(&self, _session: &SessionRef) -> Option<Box<dyn DebugAdapterTracker>> {
        None
    }
}

pub type AdapterRef = Rc<dyn AdapterCapabilities>;

struct Registration {
    id: u64,
    handler: AdapterRef,
}

/// Maps debug session types to the adapter capabilities that serve them.
/// The most recent registration for a type wins.
pub struct AdapterRegistry {
    handlers: RefCell<HashMap<String, Registration>>,
    next_id: Cell<u64>,
    closed: Cell<bool>,
    to_dispose: RefCell<Vec<Disposable>>,
}

impl AdapterRegistry {
    pub fn new() -> Rc<AdapterRegistry> {
        Rc::new(AdapterRegistry {
            handlers: RefCell::new(HashMap::new()),
            next_id: Cell::new(0),
            closed: Cell::new(false),
            to_dispose: RefCell::new(Vec::new()),
        })
    }

    /// Attaches adapter-provided trackers to every new session.
    pub fn activate(self: &Rc<Self>, host: &Rc<DebugHost>) {
        let registration = host.register_tracker_factory(self.clone());
        self.to_dispose.borrow_mut().push(registration);
    }

    /// Registers `handler` for each of `session_types`.
    /// Disposing the returned registration removes only entries that still belong to it.
    pub fn register_adapter(self: &Rc<Self>, handler: AdapterRef, session_types: &[&str]) -> Disposable {
        if self.closed.get() {
            debug!("Ignoring adapter registration for {:?}: registry is disposed", session_types);
            return Disposable::inert();
        }
        let id = self.next_id.get();
        self.next_id.set(id + 1);
        {
            let mut handlers = self.handlers.borrow_mut();
            for session_type in session_types {
                if handlers.contains_key(*session_type) {
                    debug!("Replacing the adapter handler for session type {}", session_type);
                }
                handlers.insert(
                    (*session_type).to_owned(),
                    Registration {
                        id,
                        handler: handler.clone(),
                    },
                );
            }
        }

        let registry = Rc::downgrade(self);
        let session_types: Vec<String> = session_types.iter().map(|t| (*t).to_owned()).collect();
        Disposable::new(move || {
            if let Some(registry) = registry.upgrade() {
                let mut handlers = registry.handlers.borrow_mut();
                for session_type in &session_types {
                    if handlers.get(session_type).map_or(false, |r| r.id == id) {
                        handlers.remove(session_type);
                    }
                }
            }
        })
    }

    pub fn get_handler_for_session(&self, session_type: &str) -> Option<AdapterRef> {
        self.handlers.borrow().get(session_type).map(|r| r.handler.clone())
    }

    pub fn dispose(&self) {
        self.closed.set(true);
        for mut disposable in self.to_dispose.borrow_mut().drain(..) {
            disposable.dispose();
        }
        self.handlers.borrow_mut().clear();
    }
}

impl DebugAdapterTrackerFactory for AdapterRegistry {
    fn create_tracker(&self, session: &SessionRef) -> Option<Box<dyn DebugAdapterTracker>> {
        let handler = self.get_handler_for_session(session.session_type())?;
        handler.create_tracker(session)
    }
}
