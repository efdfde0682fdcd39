//! One attached tracing session.
//!
//! The session owns everything that lives as long as the connection: the
//! proxy and its caches, the identity resolver, the helper binding, the
//! permission ledger and the history of reported failures.

use std::sync::Arc;

use permscope_config::{PermscopeConfig, ReportMode, SessionConfig};
use permscope_jdwp::wire::{JdwpClient, ThreadId};
use permscope_model::{
    render_record, Captured, FailureHistory, FailureRecord, PermissionLedger, ReportStyle,
    Reported, SearchPolicy, Solution,
};

use crate::boundary::BoundaryPolicy;
use crate::capture::AccessCheckProcessor;
use crate::dispatch::{DispatchHandle, Dispatcher};
use crate::helper::{fallback, HelperBinding};
use crate::proxy::RemoteProxy;
use crate::report::ReportSink;
use crate::resolve::IdentityResolver;
use crate::services::ServiceEventProcessor;
use crate::TraceResult;

#[derive(Debug)]
pub struct Session {
    config: SessionConfig,
    proxy: RemoteProxy,
    helper: Arc<HelperBinding>,
    resolver: IdentityResolver,
    boundary: BoundaryPolicy,
    ledger: PermissionLedger,
    history: FailureHistory,
    sink: ReportSink,
    handle: DispatchHandle,
}

impl Session {
    pub fn new(config: &PermscopeConfig, jdwp: JdwpClient, sink: ReportSink) -> Arc<Self> {
        let session = &config.session;
        let proxy = RemoteProxy::new(jdwp, session.invoke_single_threaded);
        let helper = Arc::new(HelperBinding::new(proxy.clone(), session.helper_class.clone()));
        Arc::new(Self {
            config: session.clone(),
            resolver: IdentityResolver::new(proxy.clone(), helper.clone()),
            boundary: BoundaryPolicy::from(&config.boundary),
            proxy,
            helper,
            ledger: PermissionLedger::new(),
            history: FailureHistory::new(),
            sink,
            handle: DispatchHandle::new(),
        })
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn proxy(&self) -> &RemoteProxy {
        &self.proxy
    }

    pub fn helper(&self) -> &HelperBinding {
        &self.helper
    }

    pub fn resolver(&self) -> &IdentityResolver {
        &self.resolver
    }

    pub fn boundary(&self) -> &BoundaryPolicy {
        &self.boundary
    }

    pub fn ledger(&self) -> &PermissionLedger {
        &self.ledger
    }

    pub fn history(&self) -> &FailureHistory {
        &self.history
    }

    pub fn handle(&self) -> DispatchHandle {
        self.handle.clone()
    }

    pub fn search_policy(&self) -> SearchPolicy {
        SearchPolicy {
            allow_elevation: self.config.allow_elevation,
        }
    }

    pub fn report_style(&self) -> ReportStyle {
        match self.config.report_mode {
            ReportMode::Modular => ReportStyle::Modular,
            ReportMode::Classic => ReportStyle::Classic,
        }
    }

    /// Analyzes a captured failure and reports it unless it is acceptable or
    /// a duplicate. `thread` must still be suspended; live grants run on it.
    pub async fn handle_failure(
        &self,
        thread: ThreadId,
        record: FailureRecord<Captured>,
    ) -> TraceResult<Option<FailureRecord<Reported>>> {
        let analyzed = record.analyze(self.search_policy(), &self.ledger);
        if self.config.continuous && self.config.auto_apply {
            if let Some(solution) = analyzed.sole_grant() {
                self.apply_live(thread, solution).await?;
            }
        }

        let Some(reported) = analyzed.report(&self.history) else {
            tracing::debug!(target = "permscope.session", "failure acceptable or already reported");
            return Ok(None);
        };

        tracing::warn!(
            target = "permscope.session",
            permissions = %reported.permissions(),
            solutions = reported.solutions().len(),
            "permission failure"
        );
        let text = render_record(&reported, self.report_style());
        if let Err(err) = self.sink.write_report(&text) {
            tracing::error!(target = "permscope.session", error = %err, "failed to write report");
        }

        if !self.config.continuous {
            tracing::info!(target = "permscope.session", "first failure reported; stopping");
            self.handle.stop();
        }
        Ok(Some(reported))
    }

    async fn apply_live(&self, thread: ThreadId, solution: &Solution) -> TraceResult<()> {
        for component in &solution.grants {
            for permission in solution.permissions.iter() {
                let granted = fallback(
                    self.helper
                        .grant_permission(thread, component, permission)
                        .await,
                )?;
                if granted.is_none() {
                    tracing::debug!(
                        target = "permscope.session",
                        %component,
                        "helper unavailable; grant kept local"
                    );
                    return Ok(());
                }
            }
            tracing::info!(target = "permscope.session", %component, "grant applied to target");
        }
        Ok(())
    }

    /// Arms the capture breakpoints and dispatches until the target goes away
    /// or the session stops.
    pub async fn run(self: Arc<Self>) -> TraceResult<()> {
        let mut dispatcher = Dispatcher::new(self.proxy.clone(), self.handle.clone());
        dispatcher
            .register(
                AccessCheckProcessor::breakpoint(),
                Arc::new(AccessCheckProcessor::new(self.clone())),
            )
            .await?;
        if self.config.monitor_services {
            if self.config.report_mode == ReportMode::Modular {
                dispatcher
                    .register(
                        ServiceEventProcessor::breakpoint(),
                        Arc::new(ServiceEventProcessor::new(self.clone())),
                    )
                    .await?;
            } else {
                tracing::warn!(
                    target = "permscope.session",
                    "service monitoring needs the modular report mode; ignored"
                );
            }
        }

        tracing::info!(
            target = "permscope.session",
            continuous = self.config.continuous,
            auto_apply = self.config.auto_apply,
            allow_elevation = self.config.allow_elevation,
            "tracing permission checks"
        );
        let outcome = dispatcher.run().await;

        if let Err(err) = self.proxy.jdwp().vm_dispose().await {
            tracing::debug!(target = "permscope.session", error = %err, "dispose failed");
        }
        tracing::info!(
            target = "permscope.session",
            reported = self.history.len(),
            components = self.ledger.component_count(),
            "session finished"
        );
        outcome
    }
}
