//! Service-event permission checks of the modular framework.
//!
//! Before a service event reaches a listener, the framework checks that the
//! listener's bundle may see the service; a refused check silently hides the
//! event. The helper evaluates the same check and reports what was missing.

use std::sync::Arc;

use async_trait::async_trait;
use permscope_model::{
    classify_domains, Component, ContextSnapshot, FailureOrigin, FailureRecord, StackFrame,
};

use crate::dispatch::{BreakpointProcessor, BreakpointSpec, Stop};
use crate::helper::fallback;
use crate::session::Session;
use crate::TraceResult;

const LISTENER_CLASS: &str = "org.eclipse.osgi.internal.serviceregistry.FilteredServiceListener";
const SERVICE_CHANGED_SIGNATURE: &str = "(Lorg/osgi/framework/ServiceEvent;)V";

pub struct ServiceEventProcessor {
    session: Arc<Session>,
}

impl ServiceEventProcessor {
    pub fn new(session: Arc<Session>) -> Self {
        Self { session }
    }

    pub fn breakpoint() -> BreakpointSpec {
        BreakpointSpec::method(LISTENER_CLASS, "serviceChanged", Some(SERVICE_CHANGED_SIGNATURE))
    }

    async fn check(&self, stop: &Stop) -> TraceResult<()> {
        let proxy = self.session.proxy();
        let thread = stop.thread;
        let frames = proxy.frames(thread).await?;
        let Some(frame) = frames.first() else {
            return Ok(());
        };
        let Some(filtered) = proxy.this_object(thread, frame).await? else {
            return Ok(());
        };
        let Some(event) = proxy.frame_argument(thread, frame, 0).await?.object_id() else {
            return Ok(());
        };

        let context = proxy
            .probe_field(filtered, "context")
            .await?
            .and_then(|v| v.as_object())
            .unwrap_or(0);
        let component = self
            .session
            .resolver()
            .identity(thread, context)
            .await?
            .unwrap_or_else(|| Component::code_source(format!("<unknown listener {filtered:#x}>")));

        let config = self.session.config();
        let grant_if_missing = config.continuous && config.auto_apply;
        // The helper derives the bundle's domain from the component name.
        let info = fallback(
            self.session
                .helper()
                .service_permission_info_and_grant(thread, Some(&component), 0, event, grant_if_missing)
                .await,
        )?;
        let Some(info) = info else {
            tracing::debug!(target = "permscope.services", "helper unavailable; service check skipped");
            return Ok(());
        };
        let mut permissions = info.missing();
        if permissions.is_empty() {
            permissions = info.permission_strings.iter().map(String::as_str).collect();
        }

        // Ledger first: a grant already applied this session settles the check.
        let domains = vec![component.clone()];
        let privileged = classify_domains(&domains, 0, self.session.ledger(), &permissions, |_| {
            Some(info.implies)
        });
        if privileged.contains(&component) {
            tracing::debug!(target = "permscope.services", %component, "service check satisfied");
            return Ok(());
        }

        let listener = match proxy.probe_field(filtered, "listener").await?.and_then(|v| v.as_object()) {
            Some(listener) => proxy.class_name_of(listener).await?,
            None => proxy.class_name_of(filtered).await?,
        };
        let location = proxy.describe_location(&frame.location).await?;
        let snapshot = ContextSnapshot::new(
            permissions,
            domains,
            0,
            privileged,
            vec![StackFrame::new(component, location).eligible(false)],
        );
        let record = FailureRecord::new(FailureOrigin::ServiceEvent { listener }, snapshot);
        self.session.handle_failure(thread, record).await?;
        Ok(())
    }
}

#[async_trait]
impl BreakpointProcessor for ServiceEventProcessor {
    async fn process(&self, stop: &Stop) -> TraceResult<()> {
        self.check(stop).await
    }
}
