use crate::adapter_registry::{AdapterRef, AdapterRegistry};
use crate::breakpoints::{BreakpointProvider, BreakpointTracker};
use crate::debug_host::DebugHost;
use crate::events::Disposable;
use crate::memory_provider::MemoryProvider;
use crate::prelude::*;
use crate::session_tracker::SessionTracker;
use crate::variable_tracker::{AmalgamatorTracker, CTracker, VariableTracker};

use adapter_protocol::InspectorSettings;
use std::rc::Rc;

pub const DEFAULT_C_TRACKER_TYPES: &[&str] = &["gdb", "embedded-debug", "arm-debugger"];
pub const DEFAULT_AMALGAMATOR_TYPES: &[&str] = &["amalgamator"];

/// The inspector's components, wired to one debug host.
pub struct MemoryInspector {
    pub host: Rc<DebugHost>,
    pub session_tracker: Rc<SessionTracker>,
    pub registry: Rc<AdapterRegistry>,
    pub memory_provider: Rc<MemoryProvider>,
    pub breakpoint_tracker: Rc<BreakpointTracker>,
    pub breakpoint_provider: BreakpointProvider,
    registrations: Vec<Disposable>,
}

fn session_types(configured: &Option<Vec<String>>, defaults: &[&str]) -> Vec<String> {
    match configured {
        Some(types) => types.clone(),
        None => defaults.iter().map(|t| t.to_string()).collect(),
    }
}

impl MemoryInspector {
    pub fn activate(host: &Rc<DebugHost>, settings: &InspectorSettings) -> MemoryInspector {
        let session_tracker = SessionTracker::new(host);
        session_tracker.activate();
        let registry = AdapterRegistry::new();
        registry.activate(host);
        let memory_provider = MemoryProvider::new(&registry, &session_tracker);
        let breakpoint_tracker = BreakpointTracker::new();
        breakpoint_tracker.activate(host, &session_tracker);
        let breakpoint_provider = BreakpointProvider::new(&session_tracker, &breakpoint_tracker);

        let mut registrations = Vec::new();

        let c_types = session_types(&settings.c_tracker_types, DEFAULT_C_TRACKER_TYPES);
        let c_tracker: AdapterRef = Rc::new(VariableTracker::new(c_types.clone(), |_| CTracker));
        let c_types: Vec<&str> = c_types.iter().map(|t| t.as_str()).collect();
        registrations.push(registry.register_adapter(c_tracker, &c_types));

        let amalgamator_types = session_types(&settings.amalgamator_types, DEFAULT_AMALGAMATOR_TYPES);
        let amalgamator: AdapterRef =
            Rc::new(VariableTracker::new(amalgamator_types.clone(), |_| AmalgamatorTracker::new()));
        let amalgamator_types: Vec<&str> = amalgamator_types.iter().map(|t| t.as_str()).collect();
        registrations.push(registry.register_adapter(amalgamator, &amalgamator_types));

        info!("Memory inspector active for {:?} and {:?}", c_types, amalgamator_types);

        MemoryInspector {
            host: host.clone(),
            session_tracker,
            registry,
            memory_provider,
            breakpoint_tracker,
            breakpoint_provider,
            registrations,
        }
    }

    pub fn dispose(&mut self) {
        for mut registration in self.registrations.drain(..) {
            registration.dispose();
        }
        self.breakpoint_tracker.dispose();
        self.memory_provider.dispose();
        self.registry.dispose();
        self.session_tracker.dispose();
    }
}
