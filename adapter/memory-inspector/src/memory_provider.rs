use crate::adapter_registry::{AdapterRef, AdapterRegistry};
use crate::debug_host::{request, SessionRef};
use crate::events::Disposable;
use crate::prelude::*;
use crate::session_tracker::{SessionEvent, SessionTracker};

use adapter_protocol::*;
use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::rc::Rc;

// (session id, memory reference)
type WriteKey = (String, String);

/// Front door for memory operations on the active session: reads, writes, variable lookups.
/// Dispatches to the session's adapter capabilities when it has them, to plain DAP otherwise.
pub struct MemoryProvider {
    registry: Rc<AdapterRegistry>,
    session_tracker: Rc<SessionTracker>,
    // Writes still waiting for the adapter to report them with a `memory` event.
    scheduled_writes: Rc<RefCell<HashMap<WriteKey, Vec<u64>>>>,
    next_write: Cell<u64>,
    to_dispose: RefCell<Vec<Disposable>>,
}

impl MemoryProvider {
    pub fn new(registry: &Rc<AdapterRegistry>, session_tracker: &Rc<SessionTracker>) -> Rc<MemoryProvider> {
        let scheduled_writes: Rc<RefCell<HashMap<WriteKey, Vec<u64>>>> = Rc::new(RefCell::new(HashMap::new()));

        let writes = Rc::downgrade(&scheduled_writes);
        let tracker = Rc::downgrade(session_tracker);
        let subscription = session_tracker.on_session_event(move |event| {
            let writes = match writes.upgrade() {
                Some(writes) => writes,
                None => return,
            };
            match event {
                SessionEvent::MemoryWritten { session, body } => {
                    writes.borrow_mut().remove(&(session.id().to_owned(), body.memory_reference.clone()));
                }
                SessionEvent::Changed { session } => {
                    let gone = tracker.upgrade().map_or(true, |t| t.session(session.id()).is_none());
                    if gone {
                        writes.borrow_mut().retain(|(session_id, _), _| session_id != session.id());
                    }
                }
                _ => {}
            }
        });

        Rc::new(MemoryProvider {
            registry: registry.clone(),
            session_tracker: session_tracker.clone(),
            scheduled_writes,
            next_write: Cell::new(0),
            to_dispose: RefCell::new(vec![subscription]),
        })
    }

    pub fn dispose(&self) {
        for mut disposable in self.to_dispose.borrow_mut().drain(..) {
            disposable.dispose();
        }
        self.scheduled_writes.borrow_mut().clear();
    }

    fn handler(&self, session: &SessionRef) -> Option<AdapterRef> {
        self.registry.get_handler_for_session(session.session_type())
    }

    pub async fn read_memory(
        &self,
        args: &ReadMemoryArguments,
        context: Option<&ConnectionContext>,
    ) -> Result<ReadMemoryResponseBody, Error> {
        let session = self.session_tracker.assert_active_session("read memory")?;
        self.session_tracker.assert_debug_capability(&session, SUPPORTS_READ_MEMORY_REQUEST, "read memory")?;
        let handler = self.handler(&session);
        let custom = handler.as_ref().and_then(|h| h.read_memory(&session, args, context));
        match custom {
            Some(read) => read.await,
            None => request::<requests::ReadMemory>(&*session, args).await,
        }
    }

    /// Reads and decodes a block of memory.
    pub async fn read(&self, args: &ReadMemoryArguments, context: Option<&ConnectionContext>) -> Result<Memory, Error> {
        let response = self.read_memory(args, context).await?;
        Ok(Memory::from_response(&response)?)
    }

    pub async fn write_memory(
        &self,
        args: &WriteMemoryArguments,
        context: Option<&ConnectionContext>,
    ) -> Result<WriteMemoryResponseBody, Error> {
        let session = self.session_tracker.assert_active_session("write memory")?;
        self.session_tracker.assert_debug_capability(&session, SUPPORTS_WRITE_MEMORY_REQUEST, "write memory")?;

        let key: WriteKey = (session.id().to_owned(), args.memory_reference.clone());
        let token = self.next_write.get();
        self.next_write.set(token + 1);
        self.scheduled_writes.borrow_mut().entry(key.clone()).or_default().push(token);

        let handler = self.handler(&session);
        let custom = handler.as_ref().and_then(|h| h.write_memory(&session, args, context));
        let result = match custom {
            Some(write) => write.await,
            None => request::<requests::WriteMemory>(&*session, args).await,
        };

        // Still scheduled means the adapter did not announce the write itself.
        let unannounced = {
            let mut writes = self.scheduled_writes.borrow_mut();
            let unannounced = match writes.get_mut(&key) {
                Some(tokens) => match tokens.iter().position(|t| *t == token) {
                    Some(index) => {
                        tokens.remove(index);
                        true
                    }
                    None => false,
                },
                None => false,
            };
            if writes.get(&key).map_or(false, |tokens| tokens.is_empty()) {
                writes.remove(&key);
            }
            unannounced
        };

        let response = result?;
        if unannounced {
            let base = args.offset.unwrap_or(0);
            let offset = base + response.offset.unwrap_or(0);
            let count = match response.bytes_written {
                Some(count) => count,
                None => base64::decode(&args.data).map(|data| data.len() as i64).unwrap_or(0),
            };
            self.session_tracker.fire_session_event(SessionEvent::MemoryWritten {
                session: session.clone(),
                body: MemoryEventBody {
                    memory_reference: args.memory_reference.clone(),
                    offset,
                    count,
                },
            });
        }
        Ok(response)
    }

    /// Writes raw bytes at `memory_reference` + `offset`.
    pub async fn write(
        &self,
        memory_reference: &str,
        offset: i64,
        bytes: &[u8],
        context: Option<&ConnectionContext>,
    ) -> Result<WriteMemoryResponseBody, Error> {
        let args = WriteMemoryArguments {
            memory_reference: memory_reference.into(),
            offset: Some(offset),
            allow_partial: None,
            data: base64::encode(bytes),
        };
        self.write_memory(&args, context).await
    }

    /// Variables overlapping the memory range of `args`. Empty when the adapter has no variable support.
    pub async fn get_variables(
        &self,
        args: &ReadMemoryArguments,
        context: Option<&ConnectionContext>,
    ) -> Result<Vec<VariableRange>, Error> {
        let session = self.session_tracker.assert_active_session("get variables")?;
        let handler = match self.handler(&session) {
            Some(handler) => handler,
            None => return Ok(Vec::new()),
        };
        if let Some(residents) = handler.get_residents(&session, args, context) {
            return Ok(residents.await);
        }
        let result = match handler.get_variables(&session, context) {
            Some(variables) => Ok(variables.await),
            None => Ok(Vec::new()),
        };
        result
    }

    /// Every variable the adapter currently knows about, regardless of location.
    pub async fn get_all_variables(&self, context: Option<&ConnectionContext>) -> Result<Vec<VariableRange>, Error> {
        let session = self.session_tracker.assert_active_session("get variables")?;
        let handler = match self.handler(&session) {
            Some(handler) => handler,
            None => return Ok(Vec::new()),
        };
        let result = match handler.get_variables(&session, context) {
            Some(variables) => Ok(variables.await),
            None => Ok(Vec::new()),
        };
        result
    }

    pub async fn get_address_of_variable(
        &self,
        name: &str,
        context: Option<&ConnectionContext>,
    ) -> Result<Option<String>, Error> {
        let session = self.session_tracker.assert_active_session("get address of variable")?;
        let handler = match self.handler(&session) {
            Some(handler) => handler,
            None => return Ok(None),
        };
        let result = match handler.get_address_of_variable(&session, name, context) {
            Some(address) => Ok(address.await),
            None => Ok(None),
        };
        result
    }

    pub async fn get_size_of_variable(
        &self,
        name: &str,
        context: Option<&ConnectionContext>,
    ) -> Result<Option<u128>, Error> {
        let session = self.session_tracker.assert_active_session("get size of variable")?;
        let handler = match self.handler(&session) {
            Some(handler) => handler,
            None => return Ok(None),
        };
        let result = match handler.get_size_of_variable(&session, name, context) {
            Some(size) => Ok(size.await),
            None => Ok(None),
        };
        result
    }

    pub async fn get_connection_contexts(&self) -> Result<Vec<ConnectionContext>, Error> {
        let session = self.session_tracker.assert_active_session("get connection contexts")?;
        let handler = match self.handler(&session) {
            Some(handler) => handler,
            None => return Ok(Vec::new()),
        };
        let result = match handler.get_connection_contexts(&session) {
            Some(contexts) => Ok(contexts.await),
            None => Ok(Vec::new()),
        };
        result
    }

    pub async fn get_current_connection_context(&self) -> Result<Option<ConnectionContext>, Error> {
        let session = self.session_tracker.assert_active_session("get current connection context")?;
        let handler = match self.handler(&session) {
            Some(handler) => handler,
            None => return Ok(None),
        };
        let result = match handler.get_current_connection_context(&session) {
            Some(context) => Ok(context.await),
            None => Ok(None),
        };
        result
    }

    pub async fn get_memory_display_settings_contribution(&self) -> Result<MemoryDisplaySettingsContribution, Error> {
        let session = self.session_tracker.assert_active_session("get memory display settings")?;
        let handler = match self.handler(&session) {
            Some(handler) => handler,
            None => return Ok(MemoryDisplaySettingsContribution::default()),
        };
        let result = match handler.get_memory_display_settings(&session) {
            Some(settings) => Ok(settings.await),
            None => Ok(MemoryDisplaySettingsContribution::default()),
        };
        result
    }

    #[cfg(test)]
    fn scheduled_write_count(&self) -> usize {
        self.scheduled_writes.borrow().values().map(|tokens| tokens.len()).sum()
    }
}
