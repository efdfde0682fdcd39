//! Breakpoint dispatch.
//!
//! Each registration starts *pending* behind a class-prepare watch, becomes
//! *armed* once its class is loaded and concrete location breakpoints are set,
//! and *fires* whenever the target stops at one of those locations. Every
//! firing batch runs on its own task, which resumes exactly the suspension it
//! was handed once its processors are done.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use permscope_jdwp::wire::{
    types::{
        EVENT_KIND_BREAKPOINT, EVENT_KIND_CLASS_PREPARE, SUSPEND_POLICY_ALL,
        SUSPEND_POLICY_EVENT_THREAD, TYPE_TAG_CLASS,
    },
    EventModifier, EventSet, JdwpClient, JdwpEvent, Location, MethodInfo, ReferenceTypeId,
    ThreadId,
};
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::proxy::RemoteProxy;
use crate::{TraceError, TraceResult};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MethodSpec {
    pub name: String,
    /// JNI signature; `None` matches every overload.
    pub signature: Option<String>,
}

/// Where to stop: a method entry, a source line, or a line inside a method.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BreakpointSpec {
    pub class_name: String,
    pub method: Option<MethodSpec>,
    pub line: Option<u32>,
}

impl BreakpointSpec {
    pub fn method(class_name: impl Into<String>, name: impl Into<String>, signature: Option<&str>) -> Self {
        Self {
            class_name: class_name.into(),
            method: Some(MethodSpec {
                name: name.into(),
                signature: signature.map(str::to_owned),
            }),
            line: None,
        }
    }

    pub fn line(class_name: impl Into<String>, line: u32) -> Self {
        Self {
            class_name: class_name.into(),
            method: None,
            line: Some(line),
        }
    }

    pub fn matches_method(&self, method: &MethodInfo) -> bool {
        match &self.method {
            None => true,
            Some(spec) => {
                spec.name == method.name
                    && spec
                        .signature
                        .as_deref()
                        .map_or(true, |sig| sig == method.signature)
            }
        }
    }
}

impl fmt::Display for BreakpointSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.class_name)?;
        if let Some(method) = &self.method {
            write!(f, ".{}{}", method.name, method.signature.as_deref().unwrap_or(""))?;
        }
        if let Some(line) = self.line {
            write!(f, ":{line}")?;
        }
        Ok(())
    }
}

/// A thread stopped at an armed breakpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Stop {
    pub thread: ThreadId,
    pub location: Location,
    pub request_id: i32,
    pub suspend_policy: u8,
}

/// Work to run while a thread is stopped at a breakpoint.
#[async_trait]
pub trait BreakpointProcessor: Send + Sync {
    async fn process(&self, stop: &Stop) -> TraceResult<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RegistrationId(usize);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BreakpointState {
    Pending { request_id: i32 },
    Armed { request_ids: Vec<i32> },
}

struct Registration {
    spec: BreakpointSpec,
    processor: Arc<dyn BreakpointProcessor>,
    state: BreakpointState,
}

/// Stops the dispatch loop from any task.
#[derive(Debug, Clone)]
pub struct DispatchHandle {
    accepting: Arc<AtomicBool>,
    token: CancellationToken,
}

impl DispatchHandle {
    pub fn new() -> Self {
        Self {
            accepting: Arc::new(AtomicBool::new(true)),
            token: CancellationToken::new(),
        }
    }

    /// No new batch fires after this; batches already running finish.
    pub fn stop(&self) {
        self.accepting.store(false, Ordering::SeqCst);
        self.token.cancel();
    }

    pub fn is_accepting(&self) -> bool {
        self.accepting.load(Ordering::SeqCst)
    }
}

impl Default for DispatchHandle {
    fn default() -> Self {
        Self::new()
    }
}

pub struct Dispatcher {
    proxy: RemoteProxy,
    events: broadcast::Receiver<EventSet>,
    registrations: Vec<Registration>,
    class_prepares: HashMap<i32, RegistrationId>,
    breakpoints: HashMap<i32, RegistrationId>,
    workers: JoinSet<TraceResult<()>>,
    handle: DispatchHandle,
}

impl Dispatcher {
    /// Subscribes to target events right away so nothing delivered between
    /// registration and [`Dispatcher::run`] is lost.
    pub fn new(proxy: RemoteProxy, handle: DispatchHandle) -> Self {
        let events = proxy.jdwp().subscribe_events();
        Self {
            proxy,
            events,
            registrations: Vec::new(),
            class_prepares: HashMap::new(),
            breakpoints: HashMap::new(),
            workers: JoinSet::new(),
            handle,
        }
    }

    pub fn handle(&self) -> DispatchHandle {
        self.handle.clone()
    }

    pub fn state(&self, id: RegistrationId) -> Option<&BreakpointState> {
        self.registrations.get(id.0).map(|r| &r.state)
    }

    /// Watches for `spec`'s class and arms it immediately if it is already
    /// loaded.
    pub async fn register(
        &mut self,
        spec: BreakpointSpec,
        processor: Arc<dyn BreakpointProcessor>,
    ) -> TraceResult<RegistrationId> {
        let jdwp = self.proxy.jdwp().clone();
        // Watch first: a class loaded between the lookup and the watch is
        // still caught.
        let request_id = jdwp
            .event_request_set(
                EVENT_KIND_CLASS_PREPARE,
                SUSPEND_POLICY_EVENT_THREAD,
                vec![EventModifier::ClassMatch {
                    pattern: spec.class_name.clone(),
                }],
            )
            .await?;

        let id = RegistrationId(self.registrations.len());
        tracing::debug!(target = "permscope.dispatch", %spec, request_id, "breakpoint pending");
        self.registrations.push(Registration {
            spec,
            processor,
            state: BreakpointState::Pending { request_id },
        });
        self.class_prepares.insert(request_id, id);

        let class_name = self.registrations[id.0].spec.class_name.clone();
        let loaded = jdwp.classes_by_name(&class_name).await?;
        if !loaded.is_empty() {
            let classes: Vec<ReferenceTypeId> = loaded.iter().map(|c| c.type_id).collect();
            self.arm(id, &classes).await?;
        }
        Ok(id)
    }

    /// Sets breakpoints for `classes` and only then drops the class-prepare
    /// watch, so a failed attempt is retried when another loader prepares the
    /// class.
    async fn arm(&mut self, id: RegistrationId, classes: &[ReferenceTypeId]) -> TraceResult<()> {
        let BreakpointState::Pending { request_id } = self.registrations[id.0].state else {
            return Ok(());
        };
        let jdwp = self.proxy.jdwp().clone();

        let mut locations = Vec::new();
        for class_id in classes {
            locations.extend(self.locations_for(id, *class_id).await?);
        }
        if locations.is_empty() {
            tracing::warn!(
                target = "permscope.dispatch",
                spec = %self.registrations[id.0].spec,
                "no code location matches breakpoint"
            );
        }

        let mut request_ids = Vec::with_capacity(locations.len());
        for location in locations {
            let set = jdwp
                .event_request_set(
                    EVENT_KIND_BREAKPOINT,
                    SUSPEND_POLICY_EVENT_THREAD,
                    vec![EventModifier::LocationOnly { location }],
                )
                .await;
            match set {
                Ok(breakpoint) => request_ids.push(breakpoint),
                Err(err) => {
                    for breakpoint in request_ids {
                        let _ = jdwp.event_request_clear(EVENT_KIND_BREAKPOINT, breakpoint).await;
                    }
                    return Err(err.into());
                }
            }
        }

        jdwp.event_request_clear(EVENT_KIND_CLASS_PREPARE, request_id)
            .await?;
        self.class_prepares.remove(&request_id);
        for breakpoint in &request_ids {
            self.breakpoints.insert(*breakpoint, id);
        }
        tracing::debug!(
            target = "permscope.dispatch",
            spec = %self.registrations[id.0].spec,
            ?request_ids,
            "breakpoint armed"
        );
        self.registrations[id.0].state = BreakpointState::Armed { request_ids };
        Ok(())
    }

    async fn locations_for(&self, id: RegistrationId, class_id: ReferenceTypeId) -> TraceResult<Vec<Location>> {
        let spec = &self.registrations[id.0].spec;
        let methods = self.proxy.declared_methods(class_id).await?;
        let mut locations = Vec::new();
        for method in methods.iter().filter(|m| spec.matches_method(m)) {
            let table = match self.proxy.line_table(class_id, method.method_id).await {
                Ok(table) => table,
                // Native and abstract methods have no code.
                Err(TraceError::Jdwp(err)) if !err.is_disconnect() => continue,
                Err(err) => return Err(err),
            };
            let location = |index| Location {
                type_tag: TYPE_TAG_CLASS,
                class_id,
                method_id: method.method_id,
                index,
            };
            match spec.line {
                Some(line) => locations.extend(
                    table
                        .lines
                        .iter()
                        .filter(|entry| i64::from(entry.line) == i64::from(line))
                        .map(|entry| location(entry.code_index)),
                ),
                None if spec.method.is_some() => locations.push(location(table.start)),
                None => {}
            }
        }
        Ok(locations)
    }

    /// Runs until the target dies or the handle is stopped, then waits for
    /// in-flight batches. A fatal error from any batch ends the loop early.
    pub async fn run(mut self) -> TraceResult<()> {
        let token = self.handle.token.clone();
        let mut outcome = Ok(());
        loop {
            let set = tokio::select! {
                biased;
                _ = token.cancelled() => break,
                Some(joined) = self.workers.join_next(), if !self.workers.is_empty() => {
                    if let Err(err) = flatten(joined) {
                        outcome = Err(err);
                        break;
                    }
                    continue;
                }
                received = self.events.recv() => match received {
                    Ok(set) => set,
                    Err(RecvError::Closed) => break,
                    Err(RecvError::Lagged(skipped)) => {
                        tracing::warn!(target = "permscope.dispatch", skipped, "event sets dropped");
                        continue;
                    }
                },
            };
            if set.is_vm_death() {
                tracing::info!(target = "permscope.dispatch", "target VM died");
                break;
            }
            if let Err(err) = self.dispatch(set).await {
                if err.is_fatal() {
                    outcome = Err(err);
                    break;
                }
                tracing::error!(target = "permscope.dispatch", error = %err, "event handling failed");
            }
        }

        self.handle.accepting.store(false, Ordering::SeqCst);
        while let Some(joined) = self.workers.join_next().await {
            if let Err(err) = flatten(joined) {
                if outcome.is_ok() {
                    outcome = Err(err);
                }
            }
        }
        outcome
    }

    /// Arms prepared classes and hands matching stops to a worker. Whatever
    /// happens, `set` is resumed exactly once, here or by the worker.
    async fn dispatch(&mut self, set: EventSet) -> TraceResult<()> {
        let (fired, outcome) = self.triage(&set).await;
        if outcome.is_err() || fired.is_empty() || !self.handle.is_accepting() {
            resume(self.proxy.jdwp(), &set).await;
            return outcome;
        }

        let jdwp = self.proxy.jdwp().clone();
        self.workers.spawn(async move {
            let mut outcome = Ok(());
            for (processor, stop) in &fired {
                match processor.process(stop).await {
                    Ok(()) => {}
                    Err(err) if err.is_fatal() => {
                        outcome = Err(err);
                        break;
                    }
                    Err(err @ TraceError::ProtocolMismatch(_)) => {
                        tracing::error!(target = "permscope.dispatch", thread = stop.thread, error = %err, "callback aborted");
                    }
                    Err(err) => {
                        tracing::warn!(target = "permscope.dispatch", thread = stop.thread, error = %err, "callback failed");
                    }
                }
            }
            resume(&jdwp, &set).await;
            outcome
        });
        Ok(())
    }

    /// Collects the stops in `set` that belong to a registration and arms
    /// registrations whose class was prepared. Non-fatal failures only skip
    /// the event they concern; a fatal one ends triage.
    async fn triage(&mut self, set: &EventSet) -> (Vec<(Arc<dyn BreakpointProcessor>, Stop)>, TraceResult<()>) {
        let mut fired = Vec::new();
        let mut prepared: Vec<(RegistrationId, ReferenceTypeId)> = Vec::new();

        for event in &set.events {
            match *event {
                JdwpEvent::ClassPrepare {
                    request_id,
                    type_id,
                    ..
                } => {
                    if let Some(id) = self.class_prepares.get(&request_id) {
                        prepared.push((*id, type_id));
                    }
                }
                JdwpEvent::Breakpoint {
                    request_id,
                    thread,
                    location,
                } => {
                    let Some(id) = self.breakpoints.get(&request_id).copied() else {
                        continue;
                    };
                    let registration = &self.registrations[id.0];
                    let matched = match self.proxy.method_at(&location).await {
                        Ok(method) => registration.spec.matches_method(&method),
                        Err(err) if err.is_fatal() => return (fired, Err(err)),
                        Err(err) => {
                            tracing::warn!(target = "permscope.dispatch", request_id, error = %err, "stop in unknown method");
                            false
                        }
                    };
                    if !matched {
                        tracing::trace!(target = "permscope.dispatch", request_id, "method mismatch");
                        continue;
                    }
                    fired.push((
                        registration.processor.clone(),
                        Stop {
                            thread,
                            location,
                            request_id,
                            suspend_policy: set.suspend_policy,
                        },
                    ));
                }
                _ => {}
            }
        }

        for (id, class_id) in prepared {
            if let Err(err) = self.arm(id, &[class_id]).await {
                if err.is_fatal() {
                    return (fired, Err(err));
                }
                tracing::error!(
                    target = "permscope.dispatch",
                    spec = %self.registrations[id.0].spec,
                    error = %err,
                    "arming breakpoint failed"
                );
            }
        }
        (fired, Ok(()))
    }
}

fn flatten(joined: Result<TraceResult<()>, tokio::task::JoinError>) -> TraceResult<()> {
    match joined {
        Ok(outcome) => outcome,
        Err(err) => {
            tracing::error!(target = "permscope.dispatch", error = %err, "breakpoint worker panicked");
            Ok(())
        }
    }
}

/// Resumes whatever `set` suspended, once.
async fn resume(jdwp: &JdwpClient, set: &EventSet) {
    let result = match set.suspend_policy {
        SUSPEND_POLICY_EVENT_THREAD => match set.suspended_thread() {
            Some(thread) => jdwp.thread_resume(thread).await,
            None => Ok(()),
        },
        SUSPEND_POLICY_ALL => jdwp.vm_resume().await,
        _ => Ok(()),
    };
    if let Err(err) = result {
        tracing::debug!(target = "permscope.dispatch", error = %err, "resume failed");
    }
}
