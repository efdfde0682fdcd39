//! Capture of failing stack-based permission checks.
//!
//! The breakpoint sits on the `AccessControlException` constructor. When it
//! is reached from `AccessControlContext.checkPermission`, that frame still
//! holds the protection-domain array being walked, and the constructor's
//! second argument is the permission that was refused.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use permscope_jdwp::wire::{FrameInfo, ObjectId, ThreadId};
use permscope_model::{
    classify_domains, pending_domains, Component, ContextSnapshot, FailureOrigin, FailureRecord,
    PermissionSet, PermissionSpec, StackFrame,
};

use crate::dispatch::{BreakpointProcessor, BreakpointSpec, Stop};
use crate::helper::fallback;
use crate::proxy::{Arg, Member, Unwrapped};
use crate::session::Session;
use crate::{TraceError, TraceResult};

const EXCEPTION_CLASS: &str = "java.security.AccessControlException";
const EXCEPTION_CTOR_SIGNATURE: &str = "(Ljava/lang/String;Ljava/security/Permission;)V";
const CONTEXT_CLASS: &str = "java.security.AccessControlContext";
const ACCESS_CONTROLLER_CLASS: &str = "java.security.AccessController";
const REFLECT_PROXY_CLASS: &str = "java.lang.reflect.Proxy";
const IMPLIES: Member<'static> = Member::new("implies", "(Ljava/security/Permission;)Z");

/// Position of the permission among the constructor's declared parameters.
const PERMISSION_ARGUMENT: usize = 1;

pub struct AccessCheckProcessor {
    session: Arc<Session>,
}

/// What the checking frame saw.
struct CheckedContext {
    /// The `ProtectionDomain[]`, `0` if the context had none.
    array: ObjectId,
    /// `0` entries are system domains.
    domains: Vec<ObjectId>,
    /// Index of the `checkPermission` frame in the thread's stack.
    frame_index: usize,
}

impl AccessCheckProcessor {
    pub fn new(session: Arc<Session>) -> Self {
        Self { session }
    }

    pub fn breakpoint() -> BreakpointSpec {
        BreakpointSpec::method(EXCEPTION_CLASS, "<init>", Some(EXCEPTION_CTOR_SIGNATURE))
    }

    async fn capture(&self, stop: &Stop) -> TraceResult<()> {
        let proxy = self.session.proxy();
        let thread = stop.thread;
        let frames = proxy.frames(thread).await?;
        let Some(ctor) = frames.first() else {
            return Ok(());
        };
        let Some(permission) = proxy
            .frame_argument(thread, ctor, PERMISSION_ARGUMENT)
            .await?
            .object_id()
        else {
            tracing::debug!(target = "permscope.capture", thread, "exception built without a permission");
            return Ok(());
        };
        let Some(context) = self.checked_context(thread, &frames).await? else {
            tracing::debug!(target = "permscope.capture", thread, "exception not raised by an access check");
            return Ok(());
        };

        let permissions = self.permission_strings(thread, permission).await?;
        let mut domains = Vec::with_capacity(context.domains.len());
        for domain in &context.domains {
            domains.push(self.session.resolver().domain_component(thread, *domain).await?);
        }
        let (failing_index, mut answers) = self
            .failing_index(thread, &context, permission)
            .await?;

        let ledger = self.session.ledger();
        for idx in pending_domains(&domains, failing_index, ledger, &permissions) {
            if answers.contains_key(&idx) {
                continue;
            }
            let answer = self
                .domain_implies(thread, context.domains[idx], permission)
                .await?;
            answers.insert(idx, answer);
        }
        let privileged = classify_domains(&domains, failing_index, ledger, &permissions, |idx| {
            answers.get(&idx).copied()
        });

        let stack = self
            .classify_stack(thread, &frames[context.frame_index + 1..], &context, &domains)
            .await?;

        let thread_name = proxy
            .jdwp()
            .thread_name(thread)
            .await
            .unwrap_or_else(|_| format!("{thread:#x}"));
        tracing::debug!(
            target = "permscope.capture",
            thread = %thread_name,
            %permissions,
            failing_index,
            domains = domains.len(),
            frames = stack.len(),
            "access check failure captured"
        );

        let snapshot = ContextSnapshot::new(permissions, domains, failing_index, privileged, stack);
        let record = FailureRecord::new(FailureOrigin::AccessCheck { thread: thread_name }, snapshot);
        self.session.handle_failure(thread, record).await?;
        Ok(())
    }

    /// Finds the `AccessControlContext.checkPermission` frame and reads its
    /// domain array.
    async fn checked_context(
        &self,
        thread: ThreadId,
        frames: &[FrameInfo],
    ) -> TraceResult<Option<CheckedContext>> {
        let proxy = self.session.proxy();
        for (frame_index, frame) in frames.iter().enumerate().skip(1) {
            let method = proxy.method_at(&frame.location).await?;
            if method.name != "checkPermission"
                || proxy.type_name(frame.location.class_id).await? != CONTEXT_CLASS
            {
                continue;
            }
            let Some(acc) = proxy.this_object(thread, frame).await? else {
                return Ok(None);
            };
            let array = proxy.get_field(acc, "context").await?.as_object().unwrap_or(0);
            let domains = if array == 0 {
                Vec::new()
            } else {
                proxy
                    .array_values(array)
                    .await?
                    .iter()
                    .map(|v| v.object_id().unwrap_or(0))
                    .collect()
            };
            return Ok(Some(CheckedContext {
                array,
                domains,
                frame_index,
            }));
        }
        Ok(None)
    }

    async fn permission_strings(&self, thread: ThreadId, permission: ObjectId) -> TraceResult<PermissionSet> {
        let helper = self.session.helper();
        if let Some(set) = fallback(helper.permission_strings_of(thread, permission).await)? {
            if !set.is_empty() {
                return Ok(set);
            }
        }
        let proxy = self.session.proxy();
        let mut spec = PermissionSpec::new(proxy.class_name_of(permission).await?);
        if let Some(Unwrapped::Str(name)) = proxy.probe_getter(thread, permission, "getName").await? {
            spec = spec.with_name(name);
        }
        if let Some(Unwrapped::Str(actions)) =
            proxy.probe_getter(thread, permission, "getActions").await?
        {
            spec = spec.with_actions(actions);
        }
        Ok(PermissionSet::single(spec.encode()))
    }

    /// The first domain that does not imply the permission, plus every
    /// implies answer learned on the way.
    async fn failing_index(
        &self,
        thread: ThreadId,
        context: &CheckedContext,
        permission: ObjectId,
    ) -> TraceResult<(usize, HashMap<usize, bool>)> {
        let helper = self.session.helper();
        if context.array != 0 {
            if let Some(infos) =
                fallback(helper.domain_info_of(thread, context.array, permission).await)?
            {
                if infos.len() == context.domains.len() {
                    let answers: HashMap<usize, bool> = infos
                        .iter()
                        .enumerate()
                        .map(|(idx, info)| (idx, info.implies))
                        .collect();
                    let failing = infos
                        .iter()
                        .position(|info| !info.implies)
                        .unwrap_or(infos.len());
                    return Ok((failing, answers));
                }
                tracing::debug!(target = "permscope.capture", "domain info does not match the domain array");
            }
        }

        let mut answers = HashMap::new();
        for (idx, domain) in context.domains.iter().enumerate() {
            let implies = self.domain_implies(thread, *domain, permission).await?;
            answers.insert(idx, implies);
            if !implies {
                return Ok((idx, answers));
            }
        }
        Ok((context.domains.len(), answers))
    }

    async fn domain_implies(&self, thread: ThreadId, domain: ObjectId, permission: ObjectId) -> TraceResult<bool> {
        if domain == 0 {
            return Ok(true);
        }
        if let Some(answer) =
            fallback(self.session.helper().has_permission(thread, domain, permission).await)?
        {
            return Ok(answer);
        }
        let value = self
            .session
            .proxy()
            .invoke(thread, domain, IMPLIES, &[Arg::Ref(permission)])
            .await?;
        value
            .as_bool()
            .ok_or_else(|| TraceError::mismatch(format!("ProtectionDomain.implies returned {value:?}")))
    }

    /// Classifies the caller frames, innermost first. A `doPrivileged` frame
    /// becomes an elevation marker right after its caller.
    async fn classify_stack(
        &self,
        thread: ThreadId,
        frames: &[FrameInfo],
        context: &CheckedContext,
        domains: &[Component],
    ) -> TraceResult<Vec<StackFrame>> {
        let proxy = self.session.proxy();
        let mut domain_loaders = Vec::with_capacity(context.domains.len());
        for domain in &context.domains {
            let loader = match *domain {
                0 => None,
                domain => proxy
                    .probe_field(domain, "classloader")
                    .await?
                    .and_then(|v| v.as_object()),
            };
            domain_loaders.push(loader);
        }

        let mut by_loader: HashMap<ObjectId, Component> = HashMap::new();
        let mut stack = Vec::with_capacity(frames.len());
        let mut marker_pending = false;
        for frame in frames {
            let class_name = proxy.type_name(frame.location.class_id).await?;
            if class_name == ACCESS_CONTROLLER_CLASS {
                let method = proxy.method_at(&frame.location).await?;
                if method.name.starts_with("doPrivileged") {
                    marker_pending = true;
                }
                if method.name.starts_with("doPrivileged") || method.name == "executePrivileged" {
                    continue;
                }
            }

            let component = match proxy.class_loader_of(frame.location.class_id).await? {
                None => Component::Root,
                Some(loader) => match by_loader.get(&loader) {
                    Some(component) => component.clone(),
                    None => {
                        let component = self
                            .loader_component(thread, loader, &domain_loaders, domains)
                            .await?;
                        by_loader.insert(loader, component.clone());
                        component
                    }
                },
            };
            let this_object = proxy.this_object(thread, frame).await?;
            let this_is_proxy = match this_object {
                Some(this) => proxy.is_instance_of(this, REFLECT_PROXY_CLASS).await?,
                None => false,
            };
            let eligible = self
                .session
                .boundary()
                .is_eligible(&component, &class_name, this_is_proxy);

            let mut entry =
                StackFrame::new(component, proxy.describe_location(&frame.location).await?)
                    .eligible(eligible);
            if let Some(this) = this_object {
                entry = entry.with_this(this);
            }
            stack.push(entry);
            if std::mem::take(&mut marker_pending) {
                stack.push(StackFrame::elevation_marker());
            }
        }
        Ok(stack)
    }

    async fn loader_component(
        &self,
        thread: ThreadId,
        loader: ObjectId,
        domain_loaders: &[Option<ObjectId>],
        domains: &[Component],
    ) -> TraceResult<Component> {
        if let Some(idx) = domain_loaders.iter().position(|l| *l == Some(loader)) {
            return Ok(domains[idx].clone());
        }
        Ok(self
            .session
            .resolver()
            .identity(thread, loader)
            .await?
            .unwrap_or_else(|| Component::code_source(format!("<unknown loader {loader:#x}>"))))
    }
}

#[async_trait]
impl BreakpointProcessor for AccessCheckProcessor {
    async fn process(&self, stop: &Stop) -> TraceResult<()> {
        self.capture(stop).await
    }
}
