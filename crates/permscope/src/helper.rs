//! Client side of the optional in-target helper service.
//!
//! The helper is a singleton published in the static `INSTANCE` field of a
//! configured class. It answers identity and permission questions faster than
//! structural probing and is the only way to push a grant into the live
//! target. Every caller must cope with it being absent.

use parking_lot::Mutex;
use permscope_jdwp::wire::{ObjectId, ThreadId};
use permscope_model::{Component, PermissionSet};
use serde::Deserialize;
use thiserror::Error;

use crate::proxy::{Arg, Member, RemoteProxy, Unwrapped};
use crate::{TraceError, TraceResult};

const IDENTITY_OF: Member<'static> =
    Member::new("identityOf", "(Ljava/lang/Object;)Ljava/lang/String;");
const VERSION_OF: Member<'static> =
    Member::new("versionOf", "(Ljava/lang/Object;)Ljava/lang/String;");
const PERMISSION_STRINGS_OF: Member<'static> = Member::new(
    "permissionStringsOf",
    "(Ljava/security/Permission;)Ljava/lang/String;",
);
const DOMAIN_INFO_OF: Member<'static> = Member::new(
    "domainInfoOf",
    "([Ljava/security/ProtectionDomain;Ljava/security/Permission;)Ljava/lang/String;",
);
const HAS_PERMISSION: Member<'static> = Member::new(
    "hasPermission",
    "(Ljava/security/ProtectionDomain;Ljava/security/Permission;)Z",
);
const GRANT_PERMISSION: Member<'static> = Member::new(
    "grantPermission",
    "(Ljava/lang/String;Ljava/lang/String;)V",
);
const SERVICE_PERMISSION_INFO_AND_GRANT: Member<'static> = Member::new(
    "servicePermissionInfoAndGrant",
    "(Ljava/lang/String;Ljava/security/ProtectionDomain;Ljava/lang/Object;Z)Ljava/lang/String;",
);

#[derive(Debug, Error)]
pub enum HelperError {
    /// Not loaded in the target, or another thread is binding it right now.
    #[error("helper service is not available")]
    Unavailable,

    #[error("malformed helper reply: {0}")]
    Decode(String),

    #[error("helper call failed: {0}")]
    Remote(Box<TraceError>),
}

impl From<serde_json::Error> for HelperError {
    fn from(err: serde_json::Error) -> Self {
        HelperError::Decode(err.to_string())
    }
}

/// Turns a helper failure into "use the fallback", except for conditions that
/// must reach the caller.
pub fn fallback<T>(result: Result<T, HelperError>) -> TraceResult<Option<T>> {
    match result {
        Ok(value) => Ok(Some(value)),
        Err(HelperError::Remote(inner)) if inner.is_fatal() => Err(*inner),
        Err(err) => {
            tracing::debug!(target = "permscope.helper", error = %err, "helper not used");
            Ok(None)
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HelperState {
    Unbound,
    Initializing,
    Bound(ObjectId),
}

/// One entry of `domainInfoOf`, in domain-array order.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DomainInfo {
    #[serde(default)]
    pub location_string: Option<String>,
    pub implies: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServicePermissionInfo {
    pub permission_strings: Vec<String>,
    pub implies: bool,
    #[serde(default)]
    pub implied_subset: Vec<String>,
}

impl ServicePermissionInfo {
    /// The strings the domain does not already imply.
    pub fn missing(&self) -> PermissionSet {
        self.permission_strings
            .iter()
            .filter(|p| !self.implied_subset.contains(p))
            .map(String::as_str)
            .collect()
    }
}

#[derive(Debug)]
pub struct HelperBinding {
    proxy: RemoteProxy,
    class_name: String,
    state: Mutex<HelperState>,
    grants: tokio::sync::Mutex<()>,
}

/// Puts the binding back to `Unbound` if the binding future is dropped
/// half-way.
struct Initializing<'a> {
    state: &'a Mutex<HelperState>,
    armed: bool,
}

impl Initializing<'_> {
    fn finish(mut self, next: HelperState) {
        *self.state.lock() = next;
        self.armed = false;
    }
}

impl Drop for Initializing<'_> {
    fn drop(&mut self) {
        if self.armed {
            *self.state.lock() = HelperState::Unbound;
        }
    }
}

impl HelperBinding {
    pub fn new(proxy: RemoteProxy, class_name: impl Into<String>) -> Self {
        Self {
            proxy,
            class_name: class_name.into(),
            state: Mutex::new(HelperState::Unbound),
            grants: tokio::sync::Mutex::new(()),
        }
    }

    pub fn state(&self) -> HelperState {
        *self.state.lock()
    }

    /// Locates the singleton on first use. Only one caller binds; everybody
    /// arriving while that is in progress gets [`HelperError::Unavailable`].
    pub async fn instance(&self, thread: ThreadId) -> Result<ObjectId, HelperError> {
        let guard = {
            let mut state = self.state.lock();
            match *state {
                HelperState::Bound(instance) => return Ok(instance),
                HelperState::Initializing => return Err(HelperError::Unavailable),
                HelperState::Unbound => {
                    *state = HelperState::Initializing;
                    Initializing {
                        state: &self.state,
                        armed: true,
                    }
                }
            }
        };

        match self.locate().await {
            Ok(Some(instance)) => {
                guard.finish(HelperState::Bound(instance));
                let version = self
                    .call(thread, instance, VERSION_OF, &[Arg::object(instance)])
                    .await
                    .ok()
                    .and_then(Unwrapped::into_string);
                tracing::info!(
                    target = "permscope.helper",
                    class = %self.class_name,
                    version = version.as_deref().unwrap_or("unknown"),
                    "helper bound"
                );
                Ok(instance)
            }
            Ok(None) => {
                guard.finish(HelperState::Unbound);
                Err(HelperError::Unavailable)
            }
            Err(err) => {
                guard.finish(HelperState::Unbound);
                if err.is_fatal() {
                    Err(HelperError::Remote(Box::new(err)))
                } else {
                    tracing::debug!(target = "permscope.helper", error = %err, "helper lookup failed");
                    Err(HelperError::Unavailable)
                }
            }
        }
    }

    async fn locate(&self) -> TraceResult<Option<ObjectId>> {
        let Some(class_id) = self.proxy.class_by_name(&self.class_name).await? else {
            return Ok(None);
        };
        Ok(self
            .proxy
            .get_static_field(class_id, "INSTANCE")
            .await?
            .as_object())
    }

    async fn call(
        &self,
        thread: ThreadId,
        instance: ObjectId,
        member: Member<'_>,
        args: &[Arg],
    ) -> Result<Unwrapped, HelperError> {
        self.proxy
            .invoke(thread, instance, member, args)
            .await
            .map_err(|err| HelperError::Remote(Box::new(err)))
    }

    async fn call_bound(
        &self,
        thread: ThreadId,
        member: Member<'_>,
        args: &[Arg],
    ) -> Result<Unwrapped, HelperError> {
        let instance = self.instance(thread).await?;
        self.call(thread, instance, member, args).await
    }

    async fn call_json(
        &self,
        thread: ThreadId,
        member: Member<'_>,
        args: &[Arg],
    ) -> Result<String, HelperError> {
        match self.call_bound(thread, member, args).await? {
            Unwrapped::Str(json) => Ok(json),
            Unwrapped::Null => Err(HelperError::Decode(format!("{} returned null", member.name))),
            other => Err(HelperError::Decode(format!(
                "{} returned {other:?}",
                member.name
            ))),
        }
    }

    pub async fn identity_of(
        &self,
        thread: ThreadId,
        object: ObjectId,
    ) -> Result<Option<String>, HelperError> {
        let value = self
            .call_bound(thread, IDENTITY_OF, &[Arg::object(object)])
            .await?;
        Ok(value.into_string())
    }

    pub async fn version_of(
        &self,
        thread: ThreadId,
        object: ObjectId,
    ) -> Result<Option<String>, HelperError> {
        let value = self
            .call_bound(thread, VERSION_OF, &[Arg::object(object)])
            .await?;
        Ok(value.into_string())
    }

    pub async fn permission_strings_of(
        &self,
        thread: ThreadId,
        permission: ObjectId,
    ) -> Result<PermissionSet, HelperError> {
        let json = self
            .call_json(thread, PERMISSION_STRINGS_OF, &[Arg::object(permission)])
            .await?;
        let strings: Vec<String> = serde_json::from_str(&json)?;
        Ok(strings.into_iter().collect())
    }

    pub async fn domain_info_of(
        &self,
        thread: ThreadId,
        domains: ObjectId,
        permission: ObjectId,
    ) -> Result<Vec<DomainInfo>, HelperError> {
        let json = self
            .call_json(
                thread,
                DOMAIN_INFO_OF,
                &[Arg::object(domains), Arg::object(permission)],
            )
            .await?;
        Ok(serde_json::from_str(&json)?)
    }

    pub async fn has_permission(
        &self,
        thread: ThreadId,
        domain: ObjectId,
        permission: ObjectId,
    ) -> Result<bool, HelperError> {
        let value = self
            .call_bound(
                thread,
                HAS_PERMISSION,
                &[Arg::object(domain), Arg::object(permission)],
            )
            .await?;
        value
            .as_bool()
            .ok_or_else(|| HelperError::Decode(format!("hasPermission returned {value:?}")))
    }

    /// Grants `permission` to `component` in the live target. Grants are
    /// serialized on this side as well as in the helper.
    pub async fn grant_permission(
        &self,
        thread: ThreadId,
        component: &Component,
        permission: &str,
    ) -> Result<(), HelperError> {
        let Some(name) = component.name() else {
            return Ok(());
        };
        let _serialized = self.grants.lock().await;
        self.call_bound(
            thread,
            GRANT_PERMISSION,
            &[Arg::str(name), Arg::str(permission)],
        )
        .await?;
        Ok(())
    }

    pub async fn service_permission_info_and_grant(
        &self,
        thread: ThreadId,
        component: Option<&Component>,
        domain: ObjectId,
        event: ObjectId,
        grant_if_missing: bool,
    ) -> Result<ServicePermissionInfo, HelperError> {
        let component = match component.and_then(Component::name) {
            Some(name) => Arg::str(name),
            None => Arg::Null,
        };
        let json = self
            .call_json(
                thread,
                SERVICE_PERMISSION_INFO_AND_GRANT,
                &[
                    component,
                    Arg::object(domain),
                    Arg::object(event),
                    Arg::Bool(grant_if_missing),
                ],
            )
            .await?;
        Ok(serde_json::from_str(&json)?)
    }
}
