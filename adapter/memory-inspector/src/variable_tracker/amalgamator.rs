use super::c_tracker::{evaluate_address, evaluate_size, resolve_variable};
use super::TrackerStrategy;
use crate::classifier::as_request;
use crate::debug_host::SessionRef;
use crate::prelude::*;

use adapter_protocol::{
    requests, AmalgamatorReadMemoryArguments, AmalgamatorWriteMemoryArguments, ChildDapNamesResponse,
    ConnectionContext, ReadMemoryArguments, ReadMemoryResponseBody, Variable, VariableRange, WriteMemoryArguments,
    WriteMemoryResponseBody, AMALGAMATOR_GET_CHILD_DAP_NAMES, AMALGAMATOR_READ_MEMORY, AMALGAMATOR_WRITE_MEMORY,
};
use futures::future::LocalBoxFuture;
use futures::FutureExt;
use serde::Deserialize;
use serde_json::Value;
use std::cell::RefCell;

/// Tracks variables of an amalgamator session, which multiplexes several child adapters.
/// The child in focus is identified by the thread id of the last `stackTrace` request.
#[derive(Default)]
pub struct AmalgamatorTracker {
    current_context: RefCell<Option<ConnectionContext>>,
    child_contexts: RefCell<Option<Vec<ConnectionContext>>>,
}

impl AmalgamatorTracker {
    pub fn new() -> Self {
        Self::default()
    }

    fn thread_context(&self) -> Option<ConnectionContext> {
        self.current_context.borrow().clone()
    }

    async fn child_contexts(&self, session: &SessionRef) -> Vec<ConnectionContext> {
        if let Some(contexts) = &*self.child_contexts.borrow() {
            return contexts.clone();
        }
        let response = match session.custom_request(AMALGAMATOR_GET_CHILD_DAP_NAMES, Value::Null).await {
            Ok(response) => response,
            Err(err) => {
                warn!("Could not get the child adapters of {}: {}", session.id(), err);
                return Vec::new();
            }
        };
        let children = ChildDapNamesResponse::deserialize(&response).ok().and_then(|r| r.children).unwrap_or_default();
        let contexts: Vec<ConnectionContext> = children
            .into_iter()
            .enumerate()
            .map(|(index, child)| ConnectionContext {
                id: index as i64,
                name: child.name,
            })
            .collect();
        *self.child_contexts.borrow_mut() = Some(contexts.clone());
        contexts
    }

    async fn resolve_context(&self, session: &SessionRef) -> Option<ConnectionContext> {
        let current = self.thread_context()?;
        let named = self.child_contexts(session).await.into_iter().find(|c| c.id == current.id);
        Some(named.unwrap_or(current))
    }
}

fn require_context(context: Option<&ConnectionContext>, action: &str) -> Result<ConnectionContext, Error> {
    match context {
        Some(context) => Ok(context.clone()),
        None => Err(blame_user(str_error(format!("Cannot {}: no connection context given", action))).into()),
    }
}

impl TrackerStrategy for AmalgamatorTracker {
    fn will_receive_message(&self, message: &Value) -> bool {
        if let Some(request) = as_request::<requests::StackTrace>(message) {
            let context = request.arguments.thread_id.map(|id| ConnectionContext {
                id,
                name: id.to_string(),
            });
            if context.is_none() {
                warn!("stackTrace request without a thread id");
            }
            *self.current_context.borrow_mut() = context;
            return true;
        }
        false
    }

    fn frame_id(&self, current_frame: Option<i64>) -> Option<i64> {
        // Frames are only meaningful relative to the child they came from.
        self.current_context.borrow().as_ref().and(current_frame)
    }

    fn accepts_context(&self, context: Option<&ConnectionContext>) -> bool {
        match context {
            None => true,
            Some(context) => self.current_context.borrow().as_ref().map_or(false, |c| c.id == context.id),
        }
    }

    fn variable_to_range<'a>(
        &'a self,
        session: &'a SessionRef,
        frame_id: i64,
        variable: &'a Variable,
        parent_reference: i64,
    ) -> LocalBoxFuture<'a, Result<Option<VariableRange>, Error>> {
        resolve_variable(session, frame_id, variable, parent_reference).boxed_local()
    }

    fn address_of_variable<'a>(
        &'a self,
        session: &'a SessionRef,
        frame_id: i64,
        name: &'a str,
    ) -> LocalBoxFuture<'a, Result<Option<String>, Error>> {
        evaluate_address(session, frame_id, name).boxed_local()
    }

    fn size_of_variable<'a>(
        &'a self,
        session: &'a SessionRef,
        frame_id: i64,
        name: &'a str,
    ) -> LocalBoxFuture<'a, Result<Option<u128>, Error>> {
        evaluate_size(session, frame_id, name).boxed_local()
    }

    fn has_connection_contexts(&self) -> bool {
        true
    }

    fn has_custom_memory(&self) -> bool {
        true
    }

    fn connection_contexts<'a>(&'a self, session: &'a SessionRef) -> Option<LocalBoxFuture<'a, Vec<ConnectionContext>>> {
        Some(self.child_contexts(session).boxed_local())
    }

    fn current_connection_context<'a>(
        &'a self,
        session: &'a SessionRef,
    ) -> Option<LocalBoxFuture<'a, Option<ConnectionContext>>> {
        Some(self.resolve_context(session).boxed_local())
    }

    fn read_memory<'a>(
        &'a self,
        session: &'a SessionRef,
        args: &'a ReadMemoryArguments,
        context: Option<&'a ConnectionContext>,
    ) -> Option<LocalBoxFuture<'a, Result<ReadMemoryResponseBody, Error>>> {
        Some(
            async move {
                let child = require_context(context, "read memory")?;
                let args = serde_json::to_value(AmalgamatorReadMemoryArguments {
                    args: args.clone(),
                    child,
                })?;
                let response = session.custom_request(AMALGAMATOR_READ_MEMORY, args).await?;
                Ok(ReadMemoryResponseBody::deserialize(&response)?)
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
        Some(
            async move {
                let child = require_context(context, "write memory")?;
                let args = serde_json::to_value(AmalgamatorWriteMemoryArguments {
                    args: args.clone(),
                    child,
                })?;
                let response = session.custom_request(AMALGAMATOR_WRITE_MEMORY, args).await?;
                Ok(WriteMemoryResponseBody::deserialize(&response)?)
            }
            .boxed_local(),
        )
    }
}
