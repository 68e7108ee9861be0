//! Data breakpoints are shared between the client, which sets its own (external) ones, and the
//! inspector, which adds internal ones. Every `setDataBreakpoints` request replaces the adapter's
//! whole set, so internal updates resend the external breakpoints followed by the internal ones,
//! and the response is split back into the two groups.

use crate::classifier::{as_request, as_response, DebugResponse};
use crate::debug_host::{request, DebugAdapterTracker, DebugAdapterTrackerFactory, DebugHost, SessionRef};
use crate::events::{Disposable, EventEmitter};
use crate::prelude::*;
use crate::session_tracker::{SessionEvent, SessionTracker};

use adapter_protocol::*;
use futures::lock::Mutex;
use serde_json::Value;
use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::{Rc, Weak};

struct QueuedResponse {
    session_id: String,
    arguments: SetDataBreakpointsArguments,
    response: DebugResponse<SetDataBreakpointsResponseBody>,
}

struct Suppression {
    session_id: String,
    // Seq of the inspector's own request, once it has been observed.
    request_seq: Option<u32>,
    queued: Vec<QueuedResponse>,
}

#[derive(Default)]
struct Partition {
    session_id: Option<String>,
    breakpoints: TrackedDataBreakpoints,
}

/// Observes `setDataBreakpoints` traffic and keeps the external/internal partition current.
pub struct BreakpointTracker {
    partition: RefCell<Partition>,
    stopped_event: RefCell<Option<(String, StoppedEventBody)>>,
    pending: RefCell<HashMap<(String, u32), SetDataBreakpointsArguments>>,
    suppression: RefCell<Option<Suppression>>,
    changed: EventEmitter<TrackedDataBreakpoints>,
    to_dispose: RefCell<Vec<Disposable>>,
}

fn pair_verified(
    kind: BreakpointKind,
    requested: &[DataBreakpoint],
    returned: &[Breakpoint],
) -> Vec<TrackedDataBreakpoint> {
    requested
        .iter()
        .zip(returned.iter())
        .filter(|(_, response)| response.verified)
        .map(|(breakpoint, response)| TrackedDataBreakpoint {
            kind,
            breakpoint: breakpoint.clone(),
            response: response.clone(),
        })
        .collect()
}

impl BreakpointTracker {
    pub fn new() -> Rc<BreakpointTracker> {
        Rc::new(BreakpointTracker {
            partition: RefCell::new(Partition::default()),
            stopped_event: RefCell::new(None),
            pending: RefCell::new(HashMap::new()),
            suppression: RefCell::new(None),
            changed: EventEmitter::new(),
            to_dispose: RefCell::new(Vec::new()),
        })
    }

    pub fn activate(self: &Rc<Self>, host: &Rc<DebugHost>, session_tracker: &Rc<SessionTracker>) {
        let registration = host.register_tracker_factory(Rc::new(BreakpointObserverFactory {
            tracker: Rc::downgrade(self),
        }));

        let tracker = Rc::downgrade(self);
        let sessions = Rc::downgrade(session_tracker);
        let subscription = session_tracker.on_session_event(move |event| {
            let tracker = match tracker.upgrade() {
                Some(tracker) => tracker,
                None => return,
            };
            match event {
                SessionEvent::Stopped { session, body } => tracker.session_stopped(session, body),
                SessionEvent::Continued { session, .. } => tracker.session_continued(session),
                SessionEvent::Changed { session } => {
                    let gone = sessions.upgrade().map_or(true, |s| s.session(session.id()).is_none());
                    if gone {
                        tracker.session_ended(session.id());
                    }
                }
                _ => {}
            }
        });
        self.to_dispose.borrow_mut().extend([registration, subscription]);
    }

    pub fn dispose(&self) {
        for mut disposable in self.to_dispose.borrow_mut().drain(..) {
            disposable.dispose();
        }
        self.changed.clear();
    }

    pub fn on_did_change(&self, listener: impl Fn(&TrackedDataBreakpoints) + 'static) -> Disposable {
        self.changed.subscribe(listener)
    }

    pub fn data_breakpoints(&self) -> TrackedDataBreakpoints {
        self.partition.borrow().breakpoints.clone()
    }

    pub fn external(&self) -> Vec<TrackedDataBreakpoint> {
        self.partition.borrow().breakpoints.external.clone()
    }

    pub fn internal(&self) -> Vec<TrackedDataBreakpoint> {
        self.partition.borrow().breakpoints.internal.clone()
    }

    /// The partition, if it describes the given session.
    fn partition_of(&self, session_id: &str) -> TrackedDataBreakpoints {
        let partition = self.partition.borrow();
        match &partition.session_id {
            Some(id) if id == session_id => partition.breakpoints.clone(),
            _ => TrackedDataBreakpoints::default(),
        }
    }

    pub fn stopped_event(&self) -> Option<StoppedEventBody> {
        self.stopped_event.borrow().as_ref().map(|(_, body)| body.clone())
    }

    /// Whether the last stop was caused by this breakpoint.
    pub fn is_hit(&self, breakpoint: &TrackedDataBreakpoint) -> bool {
        let id = match breakpoint.response.id {
            Some(id) => id,
            None => return false,
        };
        self.stopped_event
            .borrow()
            .as_ref()
            .and_then(|(_, body)| body.hit_breakpoint_ids.as_ref())
            .map_or(false, |ids| ids.contains(&id))
    }

    pub fn notify(&self) {
        let breakpoints = self.data_breakpoints();
        self.changed.fire(&breakpoints);
    }

    fn set_partition(&self, session_id: &str, breakpoints: TrackedDataBreakpoints) {
        *self.partition.borrow_mut() = Partition {
            session_id: Some(session_id.into()),
            breakpoints,
        };
        self.notify();
    }

    /// Until the returned guard is dropped, the session's next outbound `setDataBreakpoints`
    /// is attributed to the inspector, and other responses are held back.
    pub fn begin_internal_update(self: &Rc<Self>, session_id: &str) -> InternalUpdate {
        let previous = self.suppression.borrow_mut().replace(Suppression {
            session_id: session_id.into(),
            request_seq: None,
            queued: Vec::new(),
        });
        if previous.is_some() {
            error!("Overlapping internal data breakpoint updates");
        }
        InternalUpdate { tracker: self.clone() }
    }

    fn end_internal_update(&self) {
        let suppression = match self.suppression.borrow_mut().take() {
            Some(suppression) => suppression,
            None => return,
        };
        for queued in suppression.queued {
            self.external_response(&queued.session_id, &queued.arguments, &queued.response);
        }
    }

    pub fn is_notify_enabled(&self) -> bool {
        self.suppression.borrow().is_none()
    }

    fn client_message(&self, session: &SessionRef, message: &Value) {
        let request = match as_request::<requests::SetDataBreakpoints>(message) {
            Some(request) => request,
            None => return,
        };
        if let Some(suppression) = &mut *self.suppression.borrow_mut() {
            if suppression.session_id == session.id() && suppression.request_seq.is_none() {
                suppression.request_seq = Some(request.seq);
            }
        }
        self.pending.borrow_mut().insert((session.id().into(), request.seq), request.arguments);
    }

    fn adapter_message(&self, session: &SessionRef, message: &Value) {
        let response = match as_response::<requests::SetDataBreakpoints>(message) {
            Some(response) => response,
            None => return,
        };
        let arguments = match self.pending.borrow_mut().remove(&(session.id().into(), response.request_seq)) {
            Some(arguments) => arguments,
            None => {
                warn!("setDataBreakpoints response without a tracked request (request_seq={})", response.request_seq);
                return;
            }
        };
        {
            let mut suppression = self.suppression.borrow_mut();
            if let Some(suppression) = &mut *suppression {
                if suppression.session_id == session.id() {
                    if suppression.request_seq != Some(response.request_seq) {
                        suppression.queued.push(QueuedResponse {
                            session_id: session.id().into(),
                            arguments,
                            response,
                        });
                    } else if response.success {
                        // Responses that came before the inspector's own describe a state it has replaced.
                        if !suppression.queued.is_empty() {
                            debug!("Dropping {} superseded setDataBreakpoints responses", suppression.queued.len());
                        }
                        suppression.queued.clear();
                    }
                    // The inspector's own response is handled by whoever sent the request.
                    return;
                }
            }
        }
        self.external_response(session.id(), &arguments, &response);
    }

    fn external_response(
        &self,
        session_id: &str,
        arguments: &SetDataBreakpointsArguments,
        response: &DebugResponse<SetDataBreakpointsResponseBody>,
    ) {
        match &response.body {
            Some(body) if response.success => {
                // The client's request replaced everything the adapter had, internal breakpoints included.
                let external = pair_verified(BreakpointKind::External, &arguments.breakpoints, &body.breakpoints);
                self.set_partition(
                    session_id,
                    TrackedDataBreakpoints {
                        external,
                        internal: Vec::new(),
                    },
                );
            }
            _ => {
                debug!("setDataBreakpoints failed: {:?}", response.message);
                self.notify();
            }
        }
    }

    /// Splits the response to an internal update back into external and internal breakpoints.
    fn internal_response(
        &self,
        session_id: &str,
        external: &[DataBreakpoint],
        internal: &[DataBreakpoint],
        response: &SetDataBreakpointsResponseBody,
    ) -> Result<(), Error> {
        let requested = external.len() + internal.len();
        if response.breakpoints.len() != requested {
            warn!(
                "setDataBreakpoints on {}: sent {}, got {} back",
                session_id,
                requested,
                response.breakpoints.len()
            );
            bail!(SessionError::BreakpointMismatch {
                requested,
                returned: response.breakpoints.len(),
            });
        }
        let (external_response, internal_response) = response.breakpoints.split_at(external.len());
        self.set_partition(
            session_id,
            TrackedDataBreakpoints {
                external: pair_verified(BreakpointKind::External, external, external_response),
                internal: pair_verified(BreakpointKind::Internal, internal, internal_response),
            },
        );
        Ok(())
    }

    fn session_stopped(&self, session: &SessionRef, body: &StoppedEventBody) {
        *self.stopped_event.borrow_mut() = Some((session.id().into(), body.clone()));
        self.notify();
    }

    fn session_continued(&self, session: &SessionRef) {
        let cleared = {
            let mut stopped_event = self.stopped_event.borrow_mut();
            if matches!(&*stopped_event, Some((id, _)) if id == session.id()) {
                *stopped_event = None;
                true
            } else {
                false
            }
        };
        if cleared {
            self.notify();
        }
    }

    fn session_ended(&self, session_id: &str) {
        self.pending.borrow_mut().retain(|(id, _), _| id != session_id);
        {
            let mut stopped_event = self.stopped_event.borrow_mut();
            if matches!(&*stopped_event, Some((id, _)) if id == session_id) {
                *stopped_event = None;
            }
        }
        let owned = self.partition.borrow().session_id.as_deref() == Some(session_id);
        if owned {
            *self.partition.borrow_mut() = Partition::default();
            self.notify();
        }
    }
}

/// Scope of an internal data breakpoint update. Dropping it replays held-back responses.
#[must_use]
pub struct InternalUpdate {
    tracker: Rc<BreakpointTracker>,
}

impl Drop for InternalUpdate {
    fn drop(&mut self) {
        self.tracker.end_internal_update();
    }
}

struct BreakpointObserverFactory {
    tracker: Weak<BreakpointTracker>,
}

impl DebugAdapterTrackerFactory for BreakpointObserverFactory {
    fn create_tracker(&self, session: &SessionRef) -> Option<Box<dyn DebugAdapterTracker>> {
        Some(Box::new(BreakpointObserver {
            tracker: self.tracker.clone(),
            session: session.clone(),
        }))
    }
}

struct BreakpointObserver {
    tracker: Weak<BreakpointTracker>,
    session: SessionRef,
}

impl DebugAdapterTracker for BreakpointObserver {
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
}

/// Manages the inspector's internal data breakpoints on the active session.
pub struct BreakpointProvider {
    session_tracker: Rc<SessionTracker>,
    tracker: Rc<BreakpointTracker>,
    update_lock: Mutex<()>,
}

impl BreakpointProvider {
    pub fn new(session_tracker: &Rc<SessionTracker>, tracker: &Rc<BreakpointTracker>) -> BreakpointProvider {
        BreakpointProvider {
            session_tracker: session_tracker.clone(),
            tracker: tracker.clone(),
            update_lock: Mutex::new(()),
        }
    }

    pub fn tracker(&self) -> &Rc<BreakpointTracker> {
        &self.tracker
    }

    pub fn data_breakpoints(&self) -> TrackedDataBreakpoints {
        self.tracker.data_breakpoints()
    }

    pub fn is_hit(&self, breakpoint: &TrackedDataBreakpoint) -> bool {
        self.tracker.is_hit(breakpoint)
    }

    pub fn on_did_change(&self, listener: impl Fn(&TrackedDataBreakpoints) + 'static) -> Disposable {
        self.tracker.on_did_change(listener)
    }

    pub async fn data_breakpoint_info(
        &self,
        args: &DataBreakpointInfoArguments,
    ) -> Result<DataBreakpointInfoResponseBody, Error> {
        let session = self.session_tracker.assert_active_session("get data breakpoint info")?;
        self.session_tracker.assert_debug_capability(&session, SUPPORTS_DATA_BREAKPOINTS, "get data breakpoint info")?;
        request::<requests::DataBreakpointInfo>(&*session, args).await
    }

    /// Replaces the internal breakpoints with `args.breakpoints`.
    pub async fn set_data_breakpoints(
        &self,
        args: &SetDataBreakpointsArguments,
    ) -> Result<SetDataBreakpointsResponseBody, Error> {
        self.set_internal_data_breakpoints(&args.breakpoints).await
    }

    pub async fn set_internal_data_breakpoints(
        &self,
        breakpoints: &[DataBreakpoint],
    ) -> Result<SetDataBreakpointsResponseBody, Error> {
        self.update_internal(|_| breakpoints.to_vec()).await
    }

    /// Adds to the internal breakpoints; an entry with the same data id is replaced.
    pub async fn add_data_breakpoints(
        &self,
        breakpoints: &[DataBreakpoint],
    ) -> Result<SetDataBreakpointsResponseBody, Error> {
        self.update_internal(|current| {
            let mut internal: Vec<DataBreakpoint> = current
                .into_iter()
                .filter(|existing| breakpoints.iter().all(|bp| bp.data_id != existing.data_id))
                .collect();
            internal.extend(breakpoints.iter().cloned());
            internal
        })
        .await
    }

    pub async fn remove_data_breakpoint(&self, data_id: &str) -> Result<SetDataBreakpointsResponseBody, Error> {
        self.update_internal(|current| current.into_iter().filter(|bp| bp.data_id != data_id).collect())
            .await
    }

    pub async fn clear_internal(&self) -> Result<SetDataBreakpointsResponseBody, Error> {
        self.update_internal(|_| Vec::new()).await
    }

    async fn update_internal(
        &self,
        update: impl FnOnce(Vec<DataBreakpoint>) -> Vec<DataBreakpoint>,
    ) -> Result<SetDataBreakpointsResponseBody, Error> {
        let _lock = self.update_lock.lock().await;
        let session = self.session_tracker.assert_active_session("set data breakpoints")?;
        self.session_tracker.assert_debug_capability(&session, SUPPORTS_DATA_BREAKPOINTS, "set data breakpoints")?;

        let current = self.tracker.partition_of(session.id());
        let external: Vec<DataBreakpoint> = current.external.into_iter().map(|bp| bp.breakpoint).collect();
        let internal = update(current.internal.into_iter().map(|bp| bp.breakpoint).collect());
        let args = SetDataBreakpointsArguments {
            breakpoints: external.iter().chain(internal.iter()).cloned().collect(),
        };

        let result = {
            let _update = self.tracker.begin_internal_update(session.id());
            match request::<requests::SetDataBreakpoints>(&*session, &args).await {
                Ok(response) => self
                    .tracker
                    .internal_response(session.id(), &external, &internal, &response)
                    .map(|_| response),
                Err(err) => Err(err),
            }
        };
        if result.is_err() {
            // Listeners may be waiting on the outcome.
            self.tracker.notify();
        }
        result
    }
}
