//! Variable trackers mirror the scope/variable tree the client has fetched for the current
//! frame, and turn it into memory ranges on demand.

mod amalgamator;
mod c_tracker;

pub use amalgamator::AmalgamatorTracker;
pub use c_tracker::{extract_address, is_maybe_pointer, parse_size, CTracker};

use crate::adapter_registry::AdapterCapabilities;
use crate::classifier::{as_request, as_response};
use crate::debug_host::{DebugAdapterTracker, SessionRef};
use crate::events::Disposable;
use crate::prelude::*;

use adapter_protocol::{
    parse_address, requests, ConnectionContext, ReadMemoryArguments, ReadMemoryResponseBody, Scope, Variable, VariableRange,
    WriteMemoryArguments, WriteMemoryResponseBody,
};
use futures::future::{join_all, LocalBoxFuture};
use futures::FutureExt;
use serde_json::Value;
use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

#[derive(Debug, Clone)]
pub struct VariableNode {
    /// Name of the scope or the variable that owns this reference.
    pub name: String,
    pub presentation_hint: Option<String>,
    /// `None` until a `variables` response for this reference has been seen.
    pub children: Option<Vec<Variable>>,
}

#[derive(Default)]
struct TrackerState {
    current_frame: Option<i64>,
    variables_tree: HashMap<i64, VariableNode>,
    // request seq -> variables reference
    pending_messages: HashMap<u32, i64>,
    // request seq -> frame id
    pending_scopes: HashMap<u32, i64>,
}

/// Adapter-specific behavior plugged into `AdapterVariableTracker`.
pub trait TrackerStrategy: 'static {
    /// Inspects a client message before generic tracking. Returning `true` consumes it.
    fn will_receive_message(&self, _message: &Value) -> bool {
        false
    }

    /// The frame that variables should be resolved in.
    fn frame_id(&self, current_frame: Option<i64>) -> Option<i64> {
        current_frame
    }

    fn accepts_context(&self, _context: Option<&ConnectionContext>) -> bool {
        true
    }

    fn is_desired_scope(&self, scope: &Scope) -> bool {
        scope.name != "Registers"
    }

    fn is_desired_variable(&self, node: &VariableNode) -> bool {
        node.presentation_hint.as_deref() != Some("registers")
    }

    fn variable_to_range<'a>(
        &'a self,
        _session: &'a SessionRef,
        _frame_id: i64,
        variable: &'a Variable,
        _parent_reference: i64,
    ) -> LocalBoxFuture<'a, Result<Option<VariableRange>, Error>> {
        async move {
            let err: Error = blame_nobody(str_error(format!(
                "Cannot resolve '{}': not implemented for this adapter",
                variable.name
            )))
            .into();
            Err(err)
        }
        .boxed_local()
    }

    fn address_of_variable<'a>(
        &'a self,
        _session: &'a SessionRef,
        _frame_id: i64,
        _name: &'a str,
    ) -> LocalBoxFuture<'a, Result<Option<String>, Error>> {
        async { Ok(None) }.boxed_local()
    }

    fn size_of_variable<'a>(
        &'a self,
        _session: &'a SessionRef,
        _frame_id: i64,
        _name: &'a str,
    ) -> LocalBoxFuture<'a, Result<Option<u128>, Error>> {
        async { Ok(None) }.boxed_local()
    }

    /// Whether `connection_contexts` and `current_connection_context` are provided.
    fn has_connection_contexts(&self) -> bool {
        false
    }

    /// Whether `read_memory` and `write_memory` are provided.
    fn has_custom_memory(&self) -> bool {
        false
    }

    fn connection_contexts<'a>(&'a self, _session: &'a SessionRef) -> Option<LocalBoxFuture<'a, Vec<ConnectionContext>>> {
        None
    }

    fn current_connection_context<'a>(
        &'a self,
        _session: &'a SessionRef,
    ) -> Option<LocalBoxFuture<'a, Option<ConnectionContext>>> {
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
}

/// Per-session tracker: records scopes and variables as the client fetches them.
pub struct AdapterVariableTracker<S> {
    strategy: S,
    state: RefCell<TrackerState>,
    on_end: RefCell<Disposable>,
}

impl<S: TrackerStrategy> AdapterVariableTracker<S> {
    pub fn new(strategy: S, on_end: Disposable) -> Self {
        AdapterVariableTracker {
            strategy,
            state: RefCell::new(TrackerState::default()),
            on_end: RefCell::new(on_end),
        }
    }

    pub fn strategy(&self) -> &S {
        &self.strategy
    }

    pub fn current_frame(&self) -> Option<i64> {
        self.state.borrow().current_frame
    }

    pub fn frame_id(&self) -> Option<i64> {
        self.strategy.frame_id(self.current_frame())
    }

    pub fn node(&self, variables_reference: i64) -> Option<VariableNode> {
        self.state.borrow().variables_tree.get(&variables_reference).cloned()
    }

    pub fn known_references(&self) -> Vec<i64> {
        let mut references: Vec<i64> = self.state.borrow().variables_tree.keys().copied().collect();
        references.sort_unstable();
        references
    }

    fn on_client_message(&self, message: &Value) {
        if self.strategy.will_receive_message(message) {
            return;
        }
        if let Some(request) = as_request::<requests::Scopes>(message) {
            let mut state = self.state.borrow_mut();
            state.current_frame = Some(request.arguments.frame_id);
            state.pending_scopes.insert(request.seq, request.arguments.frame_id);
        } else if let Some(request) = as_request::<requests::Variables>(message) {
            let reference = request.arguments.variables_reference;
            let mut state = self.state.borrow_mut();
            // Only references reachable from the current frame's scopes are followed.
            if state.variables_tree.contains_key(&reference) {
                state.pending_messages.insert(request.seq, reference);
            }
        }
    }

    fn on_adapter_message(&self, message: &Value) {
        if let Some(response) = as_response::<requests::Scopes>(message) {
            let mut state = self.state.borrow_mut();
            let frame_id = state.pending_scopes.remove(&response.request_seq);
            let body = match response.body {
                Some(body) => body,
                None => return,
            };
            // Each scopes response describes a whole frame and replaces whatever was known before.
            if frame_id.is_some() {
                state.current_frame = frame_id;
            }
            state.variables_tree.clear();
            state.pending_messages.clear();
            for scope in body.scopes.iter().filter(|s| self.strategy.is_desired_scope(s)) {
                state.variables_tree.insert(
                    scope.variables_reference,
                    VariableNode {
                        name: scope.name.clone(),
                        presentation_hint: scope.presentation_hint.clone(),
                        children: None,
                    },
                );
            }
        } else if let Some(response) = as_response::<requests::Variables>(message) {
            let mut state = self.state.borrow_mut();
            let reference = match state.pending_messages.remove(&response.request_seq) {
                Some(reference) => reference,
                None => return,
            };
            let variables = match response.body {
                Some(body) => body.variables,
                None => return,
            };
            if let Some(node) = state.variables_tree.get_mut(&reference) {
                node.children = Some(variables);
            }
        }
    }

    fn end_session(&self) {
        {
            let mut state = self.state.borrow_mut();
            state.current_frame = None;
            state.variables_tree.clear();
            state.pending_messages.clear();
            state.pending_scopes.clear();
        }
        self.on_end.borrow_mut().dispose();
    }

    /// Resolves every tracked variable of the current frame to a memory range.
    /// Variables that fail to resolve are left out.
    pub async fn get_locals(&self, session: &SessionRef) -> Vec<VariableRange> {
        let frame_id = match self.frame_id() {
            Some(frame_id) => frame_id,
            None => return Vec::new(),
        };
        let candidates: Vec<(Variable, i64)> = {
            let state = self.state.borrow();
            let mut references: Vec<&i64> = state.variables_tree.keys().collect();
            references.sort_unstable();
            references
                .into_iter()
                .filter_map(|reference| state.variables_tree.get(reference).map(|node| (*reference, node)))
                .filter(|(_, node)| self.strategy.is_desired_variable(node))
                .flat_map(|(reference, node)| {
                    node.children.iter().flatten().map(move |variable| (variable.clone(), reference))
                })
                .collect()
        };

        let resolved = join_all(
            candidates
                .iter()
                .map(|(variable, parent)| self.strategy.variable_to_range(session, frame_id, variable, *parent)),
        )
        .await;

        resolved
            .into_iter()
            .zip(candidates.iter())
            .filter_map(|(result, (variable, _))| match result {
                Ok(range) => range,
                Err(err) => {
                    debug!("Could not resolve {}: {}", variable.name, err);
                    None
                }
            })
            .collect()
    }

    pub async fn get_address_of_variable(&self, session: &SessionRef, name: &str) -> Option<String> {
        let frame_id = self.frame_id()?;
        match self.strategy.address_of_variable(session, frame_id, name).await {
            Ok(address) => address,
            Err(err) => {
                debug!("Could not get the address of {}: {}", name, err);
                None
            }
        }
    }

    pub async fn get_size_of_variable(&self, session: &SessionRef, name: &str) -> Option<u128> {
        let frame_id = self.frame_id()?;
        match self.strategy.size_of_variable(session, frame_id, name).await {
            Ok(size) => size,
            Err(err) => {
                debug!("Could not get the size of {}: {}", name, err);
                None
            }
        }
    }
}

impl<S: TrackerStrategy> DebugAdapterTracker for AdapterVariableTracker<S> {
    fn on_will_receive_message(&self, message: &Value) {
        self.on_client_message(message);
    }

    fn on_did_send_message(&self, message: &Value) {
        self.on_adapter_message(message);
    }

    fn on_exit(&self) {
        self.end_session();
    }
}

type TrackerMap<S> = Rc<RefCell<HashMap<String, Rc<AdapterVariableTracker<S>>>>>;

/// Adapter capabilities backed by one `AdapterVariableTracker` per session.
pub struct VariableTracker<S> {
    session_types: Vec<String>,
    sessions: TrackerMap<S>,
    new_strategy: Box<dyn Fn(&SessionRef) -> S>,
}

impl<S: TrackerStrategy> VariableTracker<S> {
    pub fn new(session_types: Vec<String>, new_strategy: impl Fn(&SessionRef) -> S + 'static) -> Self {
        VariableTracker {
            session_types,
            sessions: Rc::new(RefCell::new(HashMap::new())),
            new_strategy: Box::new(new_strategy),
        }
    }

    pub fn session_types(&self) -> &[String] {
        &self.session_types
    }

    pub fn tracker(&self, session_id: &str) -> Option<Rc<AdapterVariableTracker<S>>> {
        self.sessions.borrow().get(session_id).cloned()
    }
}

impl<S: TrackerStrategy> AdapterCapabilities for VariableTracker<S> {
    fn get_variables<'a>(
        &'a self,
        session: &'a SessionRef,
        context: Option<&'a ConnectionContext>,
    ) -> Option<LocalBoxFuture<'a, Vec<VariableRange>>> {
        Some(
            async move {
                match self.tracker(session.id()) {
                    Some(tracker) if tracker.strategy().accepts_context(context) => tracker.get_locals(session).await,
                    _ => Vec::new(),
                }
            }
            .boxed_local(),
        )
    }

    fn get_residents<'a>(
        &'a self,
        session: &'a SessionRef,
        args: &'a ReadMemoryArguments,
        context: Option<&'a ConnectionContext>,
    ) -> Option<LocalBoxFuture<'a, Vec<VariableRange>>> {
        Some(
            async move {
                let start = match parse_address(&args.memory_reference) {
                    Some(base) => offset_address(base, args.offset.unwrap_or(0)),
                    None => return Vec::new(),
                };
                let end = offset_address(start, args.count);
                let locals = match self.get_variables(session, context) {
                    Some(locals) => locals.await,
                    None => Vec::new(),
                };
                locals.into_iter().filter(|range| range.overlaps(start, end)).collect()
            }
            .boxed_local(),
        )
    }

    fn get_address_of_variable<'a>(
        &'a self,
        session: &'a SessionRef,
        name: &'a str,
        context: Option<&'a ConnectionContext>,
    ) -> Option<LocalBoxFuture<'a, Option<String>>> {
        Some(
            async move {
                match self.tracker(session.id()) {
                    Some(tracker) if tracker.strategy().accepts_context(context) => {
                        tracker.get_address_of_variable(session, name).await
                    }
                    _ => None,
                }
            }
            .boxed_local(),
        )
    }

    fn get_size_of_variable<'a>(
        &'a self,
        session: &'a SessionRef,
        name: &'a str,
        context: Option<&'a ConnectionContext>,
    ) -> Option<LocalBoxFuture<'a, Option<u128>>> {
        Some(
            async move {
                match self.tracker(session.id()) {
                    Some(tracker) if tracker.strategy().accepts_context(context) => {
                        tracker.get_size_of_variable(session, name).await
                    }
                    _ => None,
                }
            }
            .boxed_local(),
        )
    }

    fn read_memory<'a>(
        &'a self,
        session: &'a SessionRef,
        args: &'a ReadMemoryArguments,
        context: Option<&'a ConnectionContext>,
    ) -> Option<LocalBoxFuture<'a, Result<ReadMemoryResponseBody, Error>>> {
        let tracker = self.tracker(session.id())?;
        // Adapters without custom reads fall back to plain DAP.
        if !tracker.strategy().has_custom_memory() {
            return None;
        }
        Some(
            async move {
                match tracker.strategy().read_memory(session, args, context) {
                    Some(read) => read.await,
                    None => Err(str_error("Custom memory read is no longer available")),
                }
            }
            .boxed_local(),
        )
    }

    fn write_memory<'a>(
        &'a self,
        session: &'a SessionRef,
        args: &'a WriteMemoryArguments,
        context: Option<&'a ConnectionContext>,
    ) -> Option<LocalBoxFuture<'a, Result<WriteMemoryResponseBody, Error>>> {
        let tracker = self.tracker(session.id())?;
        if !tracker.strategy().has_custom_memory() {
            return None;
        }
        Some(
            async move {
                match tracker.strategy().write_memory(session, args, context) {
                    Some(write) => write.await,
                    None => Err(str_error("Custom memory write is no longer available")),
                }
            }
            .boxed_local(),
        )
    }

    fn get_connection_contexts<'a>(
        &'a self,
        session: &'a SessionRef,
    ) -> Option<LocalBoxFuture<'a, Vec<ConnectionContext>>> {
        let tracker = self.tracker(session.id())?;
        if !tracker.strategy().has_connection_contexts() {
            return None;
        }
        Some(
            async move {
                match tracker.strategy().connection_contexts(session) {
                    Some(contexts) => contexts.await,
                    None => Vec::new(),
                }
            }
            .boxed_local(),
        )
    }

    fn get_current_connection_context<'a>(
        &'a self,
        session: &'a SessionRef,
    ) -> Option<LocalBoxFuture<'a, Option<ConnectionContext>>> {
        let tracker = self.tracker(session.id())?;
        if !tracker.strategy().has_connection_contexts() {
            return None;
        }
        Some(
            async move {
                match tracker.strategy().current_connection_context(session) {
                    Some(context) => context.await,
                    None => None,
                }
            }
            .boxed_local(),
        )
    }

    fn create_tracker(&self, session: &SessionRef) -> Option<Box<dyn DebugAdapterTracker>> {
        if !self.session_types.iter().any(|t| t == session.session_type()) {
            return None;
        }
        let session_id = session.id().to_owned();
        let sessions = Rc::downgrade(&self.sessions);
        let on_end = {
            let session_id = session_id.clone();
            Disposable::new(move || {
                if let Some(sessions) = sessions.upgrade() {
                    sessions.borrow_mut().remove(&session_id);
                }
            })
        };
        let tracker = Rc::new(AdapterVariableTracker::new((self.new_strategy)(session), on_end));
        self.sessions.borrow_mut().insert(session_id, tracker.clone());
        Some(Box::new(tracker))
    }
}

fn offset_address(base: u128, offset: i64) -> u128 {
    if offset >= 0 {
        base.saturating_add(offset as u128)
    } else {
        base.saturating_sub(offset.unsigned_abs() as u128)
    }
}
