//! Maps remote protection domains, bundles and class loaders to components.
//!
//! Resolution is layered: the session cache, then the helper's `identityOf`,
//! then a fixed list of structural probes over the remote object graph. The
//! graph's shape depends on which framework implementation is loaded, so the
//! probes are tried in order and the first hit wins.

use std::collections::HashSet;
use std::sync::Arc;

use async_recursion::async_recursion;
use permscope_jdwp::wire::{ObjectId, ThreadId};
use permscope_model::Component;

use crate::helper::{fallback, HelperBinding};
use crate::proxy::{Member, RemoteProxy, SharedCache, Unwrapped};
use crate::{TraceError, TraceResult};

/// Deepest chain of delegations followed from one starting object.
pub const MAX_PROBE_DEPTH: usize = 6;

const BUNDLE_TYPE: &str = "org.osgi.framework.Bundle";
const CLASS_LOADER_TYPE: &str = "java.lang.ClassLoader";
const TO_EXTERNAL_FORM: Member<'static> = Member::new("toExternalForm", "()Ljava/lang/String;");

/// Cache key: remote object identity, never value equality.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RemoteKey(pub ObjectId);

#[derive(Debug, Clone, PartialEq, Eq)]
enum Resolved {
    Known(Component),
    KnownAbsent,
}

impl Resolved {
    fn into_option(self) -> Option<Component> {
        match self {
            Resolved::Known(component) => Some(component),
            Resolved::KnownAbsent => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Probe {
    /// `org.osgi.framework.Bundle` itself.
    BundleType,
    /// A `bundle` field.
    BundleField,
    /// A `getBundle()` getter.
    BundleGetter,
    /// `getBundleContext()`, which leads back to a bundle.
    ContextGetter,
    /// The enclosing instance of an inner class.
    OuterInstance,
    /// A protection domain's `classloader`, or a non-platform loader's parent.
    LoaderChain,
    /// A protection domain's `codesource.location`.
    CodeLocation,
}

const PROBES: &[Probe] = &[
    Probe::BundleType,
    Probe::BundleField,
    Probe::BundleGetter,
    Probe::ContextGetter,
    Probe::OuterInstance,
    Probe::LoaderChain,
    Probe::CodeLocation,
];

enum ProbeHit {
    Identity(Component),
    Delegate(ObjectId),
    Miss,
}

/// Classifies a helper identity string. Symbolic names cannot contain `:`, so
/// anything that does is a code location.
pub fn component_from_identity(identity: &str) -> Option<Component> {
    let identity = identity.trim();
    if identity.is_empty() {
        None
    } else if identity.contains(':') {
        Some(Component::code_source(identity))
    } else {
        Some(Component::bundle(identity))
    }
}

fn is_platform_loader(class_name: &str) -> bool {
    ["java.", "jdk.", "sun."]
        .iter()
        .any(|prefix| class_name.starts_with(prefix))
}

#[derive(Debug)]
pub struct IdentityResolver {
    proxy: RemoteProxy,
    helper: Arc<HelperBinding>,
    cache: SharedCache<RemoteKey, Resolved>,
}

impl IdentityResolver {
    pub fn new(proxy: RemoteProxy, helper: Arc<HelperBinding>) -> Self {
        Self {
            proxy,
            helper,
            cache: SharedCache::default(),
        }
    }

    /// Number of remote objects with a cached answer, absent ones included.
    pub fn cached(&self) -> usize {
        self.cache.len()
    }

    pub async fn identity(
        &self,
        thread: ThreadId,
        object: ObjectId,
    ) -> TraceResult<Option<Component>> {
        if object == 0 {
            return Ok(None);
        }
        let key = RemoteKey(object);
        if let Some(resolved) = self.cache.get(&key) {
            return Ok(resolved.into_option());
        }

        let mut found = fallback(self.helper.identity_of(thread, object).await)?
            .flatten()
            .and_then(|identity| component_from_identity(&identity));
        if found.is_none() {
            let mut visited = HashSet::new();
            found = self.probe(thread, object, 0, &mut visited).await?;
        }

        let resolved = match found {
            Some(component) => Resolved::Known(component),
            None => Resolved::KnownAbsent,
        };
        let resolved = self.cache.insert_if_absent(key, resolved);
        tracing::trace!(target = "permscope.resolve", object, ?resolved, "identity resolved");
        Ok(resolved.into_option())
    }

    /// The component of a protection domain. A `null` domain is the
    /// runtime's own code; an unresolvable one still gets a stable name.
    pub async fn domain_component(&self, thread: ThreadId, domain: ObjectId) -> TraceResult<Component> {
        if domain == 0 {
            return Ok(Component::Root);
        }
        Ok(self
            .identity(thread, domain)
            .await?
            .unwrap_or_else(|| Component::code_source(format!("<unknown domain {domain:#x}>"))))
    }

    #[async_recursion]
    async fn probe(
        &self,
        thread: ThreadId,
        object: ObjectId,
        depth: usize,
        visited: &mut HashSet<ObjectId>,
    ) -> TraceResult<Option<Component>> {
        if object == 0 || depth > MAX_PROBE_DEPTH || !visited.insert(object) {
            return Ok(None);
        }
        if let Some(Resolved::Known(component)) = self.cache.get(&RemoteKey(object)) {
            return Ok(Some(component));
        }

        for probe in PROBES {
            let hit = match self.run_probe(*probe, thread, object).await {
                Ok(hit) => hit,
                Err(err @ TraceError::RemoteException { .. }) => {
                    tracing::trace!(target = "permscope.resolve", ?probe, object, error = %err, "probe threw");
                    ProbeHit::Miss
                }
                Err(err) => return Err(err),
            };
            match hit {
                ProbeHit::Identity(component) => return Ok(Some(component)),
                ProbeHit::Delegate(next) => {
                    if let Some(component) = self.probe(thread, next, depth + 1, visited).await? {
                        return Ok(Some(component));
                    }
                }
                ProbeHit::Miss => {}
            }
        }
        Ok(None)
    }

    async fn run_probe(&self, probe: Probe, thread: ThreadId, object: ObjectId) -> TraceResult<ProbeHit> {
        let proxy = &self.proxy;
        Ok(match probe {
            Probe::BundleType => {
                if !proxy.is_instance_of(object, BUNDLE_TYPE).await? {
                    return Ok(ProbeHit::Miss);
                }
                match proxy.probe_getter(thread, object, "getSymbolicName").await? {
                    Some(Unwrapped::Str(name)) if !name.is_empty() => {
                        ProbeHit::Identity(Component::bundle(name))
                    }
                    _ => ProbeHit::Miss,
                }
            }
            Probe::BundleField => delegate(proxy.probe_field(object, "bundle").await?),
            Probe::BundleGetter => delegate(proxy.probe_getter(thread, object, "getBundle").await?),
            Probe::ContextGetter => {
                delegate(proxy.probe_getter(thread, object, "getBundleContext").await?)
            }
            Probe::OuterInstance => delegate(proxy.probe_field(object, "this$0").await?),
            Probe::LoaderChain => {
                if let Some(loader) = proxy.probe_field(object, "classloader").await? {
                    return Ok(delegate(Some(loader)));
                }
                if !proxy.is_instance_of(object, CLASS_LOADER_TYPE).await?
                    || is_platform_loader(&proxy.class_name_of(object).await?)
                {
                    return Ok(ProbeHit::Miss);
                }
                delegate(proxy.probe_getter(thread, object, "getParent").await?)
            }
            Probe::CodeLocation => {
                let Some(source) = proxy
                    .probe_field(object, "codesource")
                    .await?
                    .and_then(|v| v.as_object())
                else {
                    return Ok(ProbeHit::Miss);
                };
                let Some(url) = proxy
                    .probe_field(source, "location")
                    .await?
                    .and_then(|v| v.as_object())
                else {
                    return Ok(ProbeHit::Miss);
                };
                match proxy.invoke(thread, url, TO_EXTERNAL_FORM, &[]).await? {
                    Unwrapped::Str(location) if !location.is_empty() => {
                        ProbeHit::Identity(Component::code_source(location))
                    }
                    _ => ProbeHit::Miss,
                }
            }
        })
    }
}

fn delegate(value: Option<Unwrapped>) -> ProbeHit {
    match value.as_ref().and_then(Unwrapped::as_object) {
        Some(next) => ProbeHit::Delegate(next),
        None => ProbeHit::Miss,
    }
}
