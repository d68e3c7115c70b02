// EventRequest command implementations
//
// Event requests (breakpoints, steps, class prepare, ...) are created through
// the session's EventRequestManager, configured with filters and a handler,
// then armed with `enable`. Each armed request owns one delivery loop (see
// delivery.rs) and one route in the session's event table.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard};

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::codec::{JdwpDecode, JdwpEncode, JdwpReader, JdwpWriter};
use crate::commands::{command_sets, event_commands, step_depths, step_sizes};
use crate::delivery::{self, DeliveryLoop};
use crate::events::{EventKind, EventModifier};
use crate::protocol::{JdwpError, JdwpResult};
use crate::session::{Session, WeakSession};
use crate::translator::EventObject;
use crate::types::{FieldId, Location, ObjectId, ReferenceTypeId, ThreadId};

/// Suspend policy for events
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[repr(u8)]
pub enum SuspendPolicy {
    None = 0,
    EventThread = 1,
    #[default]
    All = 2,
}

impl TryFrom<u8> for SuspendPolicy {
    type Error = JdwpError;

    fn try_from(v: u8) -> JdwpResult<Self> {
        match v {
            0 => Ok(SuspendPolicy::None),
            1 => Ok(SuspendPolicy::EventThread),
            2 => Ok(SuspendPolicy::All),
            _ => Err(JdwpError::decode(format!("Unknown suspend policy: {}", v))),
        }
    }
}

impl JdwpEncode for SuspendPolicy {
    fn encode(&self, w: &mut JdwpWriter) -> JdwpResult<()> {
        w.put_u8(*self as u8);
        Ok(())
    }
}

impl JdwpDecode for SuspendPolicy {
    fn decode(r: &mut JdwpReader<'_>) -> JdwpResult<Self> {
        SuspendPolicy::try_from(r.get_u8()?)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum StepSize {
    Min = step_sizes::MIN,
    Line = step_sizes::LINE,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum StepDepth {
    Into = step_depths::INTO,
    Over = step_depths::OVER,
    Out = step_depths::OUT,
}

/// Class name pattern for class-match and class-exclude filters.
///
/// Either an exact name, or a name with a single `*` at the start or end:
/// `java.lang.String`, `*.String`, `java.lang.*`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ClassPattern(String);

impl ClassPattern {
    pub fn new(pattern: impl Into<String>) -> JdwpResult<Self> {
        let pattern = pattern.into();
        if pattern.is_empty() {
            return Err(JdwpError::InvalidFilter("empty class pattern".to_string()));
        }

        let stars = pattern.matches('*').count();
        let valid = match stars {
            0 => true,
            1 => pattern.starts_with('*') || pattern.ends_with('*'),
            _ => false,
        };
        if !valid {
            return Err(JdwpError::InvalidFilter(format!(
                "class pattern {:?} may only have one '*' at the start or end",
                pattern
            )));
        }
        Ok(ClassPattern(pattern))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Local evaluation of the pattern against a dotted class name.
    pub fn matches(&self, class_name: &str) -> bool {
        if let Some(suffix) = self.0.strip_prefix('*') {
            class_name.ends_with(suffix)
        } else if let Some(prefix) = self.0.strip_suffix('*') {
            class_name.starts_with(prefix)
        } else {
            class_name == self.0
        }
    }
}

impl fmt::Display for ClassPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

pub(crate) type HandlerFuture = Pin<Box<dyn Future<Output = bool> + Send>>;

/// Event callback. Returning `false` disarms the request.
pub(crate) type EventHandler = Arc<dyn Fn(EventObject) -> HandlerFuture + Send + Sync>;

enum Status {
    Created,
    Armed {
        request_id: i32,
        stop: CancellationToken,
    },
    Deleted,
}

struct RequestState {
    policy: SuspendPolicy,
    modifiers: Vec<EventModifier>,
    handler: Option<EventHandler>,
    status: Status,
}

impl RequestState {
    // Filters, policy and handler are frozen while armed and after delete.
    fn check_mutable(&self) -> JdwpResult<()> {
        match self.status {
            Status::Created => Ok(()),
            Status::Armed { .. } => Err(JdwpError::AlreadyArmed),
            Status::Deleted => Err(JdwpError::Deleted),
        }
    }

    fn armed_id(&self) -> Option<i32> {
        match self.status {
            Status::Armed { request_id, .. } => Some(request_id),
            _ => None,
        }
    }
}

struct RequestShared {
    kind: EventKind,
    session: WeakSession,
    state: tokio::sync::Mutex<RequestState>,
}

/// A request for events of one kind. Clones share the same request.
#[derive(Clone)]
pub struct EventRequest {
    shared: Arc<RequestShared>,
}

impl fmt::Debug for EventRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventRequest")
            .field("kind", &self.shared.kind)
            .finish_non_exhaustive()
    }
}

impl PartialEq for EventRequest {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }
}

impl Eq for EventRequest {}

impl EventRequest {
    fn new(session: WeakSession, kind: EventKind, modifiers: Vec<EventModifier>) -> Self {
        Self {
            shared: Arc::new(RequestShared {
                kind,
                session,
                state: tokio::sync::Mutex::new(RequestState {
                    policy: SuspendPolicy::default(),
                    modifiers,
                    handler: None,
                    status: Status::Created,
                }),
            }),
        }
    }

    pub fn kind(&self) -> EventKind {
        self.shared.kind
    }

    pub async fn set_handler<F, Fut>(&self, handler: F) -> JdwpResult<()>
    where
        F: Fn(EventObject) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = bool> + Send + 'static,
    {
        let handler: EventHandler =
            Arc::new(move |event: EventObject| -> HandlerFuture { Box::pin(handler(event)) });
        let mut state = self.shared.state.lock().await;
        state.check_mutable()?;
        state.handler = Some(handler);
        Ok(())
    }

    pub async fn set_suspend_policy(&self, policy: SuspendPolicy) -> JdwpResult<()> {
        let mut state = self.shared.state.lock().await;
        state.check_mutable()?;
        state.policy = policy;
        Ok(())
    }

    pub async fn suspend_policy(&self) -> SuspendPolicy {
        self.shared.state.lock().await.policy
    }

    /// Filters in the order they will be sent.
    pub async fn modifiers(&self) -> Vec<EventModifier> {
        self.shared.state.lock().await.modifiers.clone()
    }

    async fn add_modifier(&self, modifier: EventModifier) -> JdwpResult<()> {
        let mut state = self.shared.state.lock().await;
        state.check_mutable()?;
        state.modifiers.push(modifier);
        Ok(())
    }

    /// Report only the first `count` occurrences.
    pub async fn add_count_filter(&self, count: i32) -> JdwpResult<()> {
        if count <= 0 {
            return Err(JdwpError::InvalidFilter(format!(
                "count must be positive, got {}",
                count
            )));
        }
        self.add_modifier(EventModifier::Count(count)).await
    }

    pub async fn add_thread_filter(&self, thread: ThreadId) -> JdwpResult<()> {
        self.add_modifier(EventModifier::ThreadOnly(thread)).await
    }

    pub async fn add_class_filter(&self, class: ReferenceTypeId) -> JdwpResult<()> {
        self.add_modifier(EventModifier::ClassOnly(class)).await
    }

    pub async fn add_class_match_filter(&self, pattern: &str) -> JdwpResult<()> {
        let pattern = ClassPattern::new(pattern)?;
        self.add_modifier(EventModifier::ClassMatch(pattern.0)).await
    }

    pub async fn add_class_exclusion_filter(&self, pattern: &str) -> JdwpResult<()> {
        let pattern = ClassPattern::new(pattern)?;
        self.add_modifier(EventModifier::ClassExclude(pattern.0)).await
    }

    pub async fn add_instance_filter(&self, instance: ObjectId) -> JdwpResult<()> {
        self.add_modifier(EventModifier::InstanceOnly(instance)).await
    }

    pub async fn is_enabled(&self) -> bool {
        self.shared.state.lock().await.armed_id().is_some()
    }

    pub async fn is_deleted(&self) -> bool {
        matches!(self.shared.state.lock().await.status, Status::Deleted)
    }

    /// Wire id assigned by the target; only present while armed.
    pub async fn request_id(&self) -> Option<i32> {
        self.shared.state.lock().await.armed_id()
    }

    /// Arm the request (EventRequest.Set) and start delivering its events.
    /// Enabling an armed request does nothing.
    pub async fn enable(&self) -> JdwpResult<()> {
        let mut state = self.shared.state.lock().await;
        match state.status {
            Status::Deleted => return Err(JdwpError::Deleted),
            Status::Armed { .. } => return Ok(()),
            Status::Created => {}
        }
        let handler = state.handler.clone().ok_or(JdwpError::MissingHandler)?;
        let session = self.shared.session.upgrade()?;

        let kind = self.shared.kind;
        let _arming = session.begin_arming();
        let request_id: i32 = session
            .send_command(
                command_sets::EVENT_REQUEST,
                event_commands::SET,
                &(kind, state.policy, state.modifiers.as_slice()),
            )
            .await?;

        let (tx, rx) = mpsc::unbounded_channel();
        session.register_route(request_id, tx);
        let stop = session.shutdown_token().child_token();
        state.status = Status::Armed {
            request_id,
            stop: stop.clone(),
        };
        info!(
            "Armed {:?} request id={} with {} filters",
            kind,
            request_id,
            state.modifiers.len()
        );

        tokio::spawn(delivery::run(DeliveryLoop {
            request: self.clone(),
            session: session.downgrade(),
            request_id,
            events: rx,
            stop,
            handler,
        }));
        Ok(())
    }

    /// Disarm the request (EventRequest.Clear). Its delivery loop makes no
    /// further handler calls. Disabling a request that isn't armed does nothing.
    pub async fn disable(&self) -> JdwpResult<()> {
        let mut state = self.shared.state.lock().await;
        let result = self.disarm(&mut state).await;
        if state.armed_id().is_some() {
            state.status = Status::Created;
        }
        result
    }

    /// Disable if armed, then mark deleted. Deleted requests cannot be re-armed.
    pub async fn delete(&self) -> JdwpResult<()> {
        let mut state = self.shared.state.lock().await;
        let result = self.disarm(&mut state).await;
        state.status = Status::Deleted;
        result
    }

    // Stop the delivery loop and clear on the target. The caller holds the
    // state lock across the whole transition and picks the next status.
    async fn disarm(&self, state: &mut RequestState) -> JdwpResult<()> {
        let Status::Armed { request_id, stop } = &state.status else {
            return Ok(());
        };
        let request_id = *request_id;
        stop.cancel();
        let result = self.clear(request_id).await;
        info!("Disarmed {:?} request id={}", self.shared.kind, request_id);
        result
    }

    // Clear on the target and drop the route. Skipped if the session is gone.
    async fn clear(&self, request_id: i32) -> JdwpResult<()> {
        let Ok(session) = self.shared.session.upgrade() else {
            return Ok(());
        };
        session.unregister_route(request_id);
        if session.is_closed() {
            return Ok(());
        }
        session
            .exec(
                command_sets::EVENT_REQUEST,
                event_commands::CLEAR,
                &(self.shared.kind, request_id),
            )
            .await
    }

    /// Called by the delivery loop when its handler asked to stop. Returns
    /// false if the request was disarmed some other way in the meantime.
    pub(crate) async fn disarm_from_loop(&self, request_id: i32) -> bool {
        let mut state = self.shared.state.lock().await;
        if state.armed_id() != Some(request_id) {
            return false;
        }
        if let Err(e) = self.clear(request_id).await {
            warn!("Failed to clear request id={}: {}", request_id, e);
        }
        state.status = Status::Created;
        debug!("Handler stopped {:?} request id={}", self.shared.kind, request_id);
        true
    }

    /// Called by the delivery loop when it ends without a handler decision
    /// (cancellation, closed session). No RPC.
    pub(crate) async fn release_from_loop(&self, request_id: i32) {
        let mut state = self.shared.state.lock().await;
        if state.armed_id() != Some(request_id) {
            return;
        }
        if let Ok(session) = self.shared.session.upgrade() {
            session.unregister_route(request_id);
        }
        state.status = Status::Created;
    }

    // Local teardown after the target has already dropped the request.
    async fn forget(&self) {
        let mut state = self.shared.state.lock().await;
        if let Status::Armed { request_id, stop } = &state.status {
            stop.cancel();
            if let Ok(session) = self.shared.session.upgrade() {
                session.unregister_route(*request_id);
            }
        }
        state.status = Status::Deleted;
    }
}

/// Creates and tracks the event requests of one session.
#[derive(Clone)]
pub struct EventRequestManager {
    session: Session,
    requests: Arc<Mutex<Vec<EventRequest>>>,
}

impl fmt::Debug for EventRequestManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventRequestManager")
            .field("requests", &self.lock().len())
            .finish()
    }
}

impl Session {
    /// The session's event request manager. All calls share one registry.
    pub fn event_request_manager(&self) -> EventRequestManager {
        EventRequestManager {
            session: self.clone(),
            requests: self.inner().event_requests.clone(),
        }
    }
}

impl EventRequestManager {
    fn lock(&self) -> MutexGuard<'_, Vec<EventRequest>> {
        match self.requests.lock() {
            Ok(guard) => guard,
            Err(err) => err.into_inner(),
        }
    }

    fn create(&self, kind: EventKind, modifiers: Vec<EventModifier>) -> EventRequest {
        let request = EventRequest::new(self.session.downgrade(), kind, modifiers);
        self.lock().push(request.clone());
        request
    }

    pub fn create_breakpoint_request(&self, location: Location) -> EventRequest {
        self.create(
            EventKind::Breakpoint,
            vec![EventModifier::LocationOnly(location)],
        )
    }

    pub fn create_step_request(
        &self,
        thread: ThreadId,
        size: StepSize,
        depth: StepDepth,
    ) -> EventRequest {
        self.create(
            EventKind::SingleStep,
            vec![EventModifier::Step {
                thread,
                size: size as i32,
                depth: depth as i32,
            }],
        )
    }

    /// Exception events, optionally restricted to one exception type.
    pub fn create_exception_request(
        &self,
        exception_type: Option<ReferenceTypeId>,
        caught: bool,
        uncaught: bool,
    ) -> EventRequest {
        self.create(
            EventKind::Exception,
            vec![EventModifier::ExceptionOnly {
                ref_type: exception_type.unwrap_or_default(),
                caught,
                uncaught,
            }],
        )
    }

    pub fn create_class_prepare_request(&self) -> EventRequest {
        self.create(EventKind::ClassPrepare, Vec::new())
    }

    pub fn create_class_unload_request(&self) -> EventRequest {
        self.create(EventKind::ClassUnload, Vec::new())
    }

    pub fn create_thread_start_request(&self) -> EventRequest {
        self.create(EventKind::ThreadStart, Vec::new())
    }

    pub fn create_thread_death_request(&self) -> EventRequest {
        self.create(EventKind::ThreadDeath, Vec::new())
    }

    pub fn create_method_entry_request(&self) -> EventRequest {
        self.create(EventKind::MethodEntry, Vec::new())
    }

    pub fn create_method_exit_request(&self) -> EventRequest {
        self.create(EventKind::MethodExit, Vec::new())
    }

    /// Method exit events that carry the returned value.
    pub fn create_method_exit_with_return_value_request(&self) -> EventRequest {
        self.create(EventKind::MethodExitWithReturnValue, Vec::new())
    }

    pub fn create_access_watchpoint_request(
        &self,
        declaring_type: ReferenceTypeId,
        field: FieldId,
    ) -> EventRequest {
        self.create(
            EventKind::FieldAccess,
            vec![EventModifier::FieldOnly {
                ref_type: declaring_type,
                field_id: field,
            }],
        )
    }

    pub fn create_modification_watchpoint_request(
        &self,
        declaring_type: ReferenceTypeId,
        field: FieldId,
    ) -> EventRequest {
        self.create(
            EventKind::FieldModification,
            vec![EventModifier::FieldOnly {
                ref_type: declaring_type,
                field_id: field,
            }],
        )
    }

    pub fn create_vm_death_request(&self) -> EventRequest {
        self.create(EventKind::VmDeath, Vec::new())
    }

    /// Every tracked request, in creation order.
    pub fn event_requests(&self) -> Vec<EventRequest> {
        self.lock().clone()
    }

    pub fn requests_of_kind(&self, kind: EventKind) -> Vec<EventRequest> {
        self.lock()
            .iter()
            .filter(|r| r.kind() == kind)
            .cloned()
            .collect()
    }

    pub fn breakpoint_requests(&self) -> Vec<EventRequest> {
        self.requests_of_kind(EventKind::Breakpoint)
    }

    pub fn step_requests(&self) -> Vec<EventRequest> {
        self.requests_of_kind(EventKind::SingleStep)
    }

    pub fn exception_requests(&self) -> Vec<EventRequest> {
        self.requests_of_kind(EventKind::Exception)
    }

    pub fn class_prepare_requests(&self) -> Vec<EventRequest> {
        self.requests_of_kind(EventKind::ClassPrepare)
    }

    pub fn class_unload_requests(&self) -> Vec<EventRequest> {
        self.requests_of_kind(EventKind::ClassUnload)
    }

    pub fn thread_start_requests(&self) -> Vec<EventRequest> {
        self.requests_of_kind(EventKind::ThreadStart)
    }

    pub fn thread_death_requests(&self) -> Vec<EventRequest> {
        self.requests_of_kind(EventKind::ThreadDeath)
    }

    pub fn method_entry_requests(&self) -> Vec<EventRequest> {
        self.requests_of_kind(EventKind::MethodEntry)
    }

    /// Both plain method exit requests and those with return values.
    pub fn method_exit_requests(&self) -> Vec<EventRequest> {
        self.lock()
            .iter()
            .filter(|r| {
                matches!(
                    r.kind(),
                    EventKind::MethodExit | EventKind::MethodExitWithReturnValue
                )
            })
            .cloned()
            .collect()
    }

    pub fn access_watchpoint_requests(&self) -> Vec<EventRequest> {
        self.requests_of_kind(EventKind::FieldAccess)
    }

    pub fn modification_watchpoint_requests(&self) -> Vec<EventRequest> {
        self.requests_of_kind(EventKind::FieldModification)
    }

    pub fn vm_death_requests(&self) -> Vec<EventRequest> {
        self.requests_of_kind(EventKind::VmDeath)
    }

    /// Delete a request and stop tracking it.
    pub async fn delete_event_request(&self, request: &EventRequest) -> JdwpResult<()> {
        self.lock().retain(|r| r != request);
        request.delete().await
    }

    /// Clear every breakpoint on the target (EventRequest.ClearAllBreakpoints)
    /// and delete all tracked breakpoint requests.
    pub async fn delete_all_breakpoints(&self) -> JdwpResult<()> {
        self.session
            .exec(
                command_sets::EVENT_REQUEST,
                event_commands::CLEAR_ALL_BREAKPOINTS,
                &(),
            )
            .await?;

        let breakpoints: Vec<EventRequest> = {
            let mut requests = self.lock();
            let (breakpoints, rest) = requests
                .drain(..)
                .partition(|r| r.kind() == EventKind::Breakpoint);
            *requests = rest;
            breakpoints
        };
        for request in &breakpoints {
            request.forget().await;
        }
        info!("Deleted {} breakpoint requests", breakpoints.len());
        Ok(())
    }
}
