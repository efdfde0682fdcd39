use std::sync::Arc;

use permscope::helper::{HelperBinding, HelperState};
use permscope::proxy::RemoteProxy;
use permscope::resolve::{IdentityResolver, MAX_PROBE_DEPTH};
use permscope_config::DEFAULT_HELPER_CLASS;
use permscope_jdwp::wire::mock::{MockFrame, MockHeap, MockReply};
use permscope_jdwp::wire::{JdwpClient, ObjectId, ThreadId};
use permscope_model::Component;
use pretty_assertions::assert_eq;

use super::support::{attach, object, WAIT};

fn resolver(client: JdwpClient) -> (IdentityResolver, Arc<HelperBinding>) {
    let proxy = RemoteProxy::new(client, true);
    let helper = Arc::new(HelperBinding::new(proxy.clone(), DEFAULT_HELPER_CLASS));
    (IdentityResolver::new(proxy, helper.clone()), helper)
}

#[tokio::test]
async fn identity_follows_outer_instances_to_the_bundle() {
    let mut heap = MockHeap::new();
    let bundle_api = heap.define_interface("org.osgi.framework.Bundle");
    let bundle_class = heap.define_class("org.eclipse.osgi.internal.framework.EquinoxBundle", None);
    heap.add_interface(bundle_class, bundle_api);
    heap.add_method_with(bundle_class, "getSymbolicName", "()Ljava/lang/String;", false, |_| {
        MockReply::Str("com.acme.core".into())
    });
    let bundle = heap.new_object(bundle_class);

    let activator_class = heap.define_class("com.acme.core.Activator", None);
    let bundle_field = heap.add_field(activator_class, "bundle", "Lorg/osgi/framework/Bundle;", false);
    let activator = heap.new_object(activator_class);
    heap.set_field(activator, bundle_field, object(bundle));

    let inner_class = heap.define_class("com.acme.core.Activator$1", None);
    let outer = heap.add_field(inner_class, "this$0", "Lcom/acme/core/Activator;", false);
    let run = heap.add_method(inner_class, "run", "()V", false);
    let inner = heap.new_object(inner_class);
    heap.set_field(inner, outer, object(activator));

    let location = heap.location(inner_class, run, 0);
    let thread = heap.add_thread("main", vec![MockFrame::new(location).with_this(inner)]);

    let (server, client) = attach(heap).await;
    let (resolver, helper) = resolver(client);

    assert_eq!(
        resolver.identity(thread, inner).await.unwrap(),
        Some(Component::bundle("com.acme.core"))
    );
    assert_eq!(helper.state(), HelperState::Unbound);
    assert_eq!(resolver.cached(), 1);

    let calls = server.invocations().await.len();
    assert_eq!(
        resolver.identity(thread, inner).await.unwrap(),
        Some(Component::bundle("com.acme.core"))
    );
    assert_eq!(server.invocations().await.len(), calls);
}

#[tokio::test]
async fn protection_domains_resolve_to_their_code_location() {
    let mut heap = MockHeap::new();
    let url_class = heap.define_class("java.net.URL", None);
    heap.add_method_with(url_class, "toExternalForm", "()Ljava/lang/String;", false, |_| {
        MockReply::Str("file:/opt/app/plugin.jar".into())
    });
    let url = heap.new_object(url_class);
    let source_class = heap.define_class("java.security.CodeSource", None);
    let location_field = heap.add_field(source_class, "location", "Ljava/net/URL;", false);
    let source = heap.new_object(source_class);
    heap.set_field(source, location_field, object(url));

    let domain_class = heap.define_class("java.security.ProtectionDomain", None);
    let codesource = heap.add_field(domain_class, "codesource", "Ljava/security/CodeSource;", false);
    heap.add_field(domain_class, "classloader", "Ljava/lang/ClassLoader;", false);
    let domain = heap.new_object(domain_class);
    heap.set_field(domain, codesource, object(source));
    let bare_domain = heap.new_object(domain_class);

    let main_class = heap.define_class("com.acme.Main", None);
    let main = heap.add_method(main_class, "main", "([Ljava/lang/String;)V", true);
    let location = heap.location(main_class, main, 0);
    let thread = heap.add_thread("main", vec![MockFrame::new(location)]);

    let (_server, client) = attach(heap).await;
    let (resolver, _helper) = resolver(client);

    assert_eq!(
        resolver.domain_component(thread, domain).await.unwrap(),
        Component::code_source("file:/opt/app/plugin.jar")
    );
    assert_eq!(resolver.domain_component(thread, 0).await.unwrap(), Component::Root);
    assert_eq!(
        resolver.domain_component(thread, bare_domain).await.unwrap(),
        Component::code_source(format!("<unknown domain {bare_domain:#x}>"))
    );
    assert_eq!(resolver.identity(thread, bare_domain).await.unwrap(), None);
    assert_eq!(resolver.cached(), 2);
}

#[tokio::test]
async fn helper_identity_wins_over_probing() {
    let mut heap = MockHeap::new();
    let helper_class = heap.define_class(DEFAULT_HELPER_CLASS, None);
    let instance_field = heap.add_field(helper_class, "INSTANCE", "Lpermscope/agent/Backdoor;", true);
    heap.add_method_with(
        helper_class,
        "identityOf",
        "(Ljava/lang/Object;)Ljava/lang/String;",
        false,
        |_| MockReply::Str("reference:file:/opt/bundles/acme/".into()),
    );
    heap.add_method_with(
        helper_class,
        "versionOf",
        "(Ljava/lang/Object;)Ljava/lang/String;",
        false,
        |_| MockReply::Str("2.1".into()),
    );
    let instance = heap.new_object(helper_class);
    heap.set_static(helper_class, instance_field, object(instance));

    let target_class = heap.define_class("com.acme.Thing", None);
    let work = heap.add_method(target_class, "work", "()V", false);
    let target = heap.new_object(target_class);
    let location = heap.location(target_class, work, 0);
    let thread = heap.add_thread("main", vec![MockFrame::new(location).with_this(target)]);

    let (server, client) = attach(heap).await;
    let (resolver, helper) = resolver(client);

    assert_eq!(
        resolver.identity(thread, target).await.unwrap(),
        Some(Component::code_source("reference:file:/opt/bundles/acme/"))
    );
    assert_eq!(helper.state(), HelperState::Bound(instance));

    let names: Vec<String> = server
        .invocations()
        .await
        .into_iter()
        .map(|i| i.method_name)
        .collect();
    assert_eq!(names, ["versionOf", "identityOf"]);
}

#[tokio::test]
async fn a_throwing_helper_falls_back_to_field_walking() {
    let mut heap = MockHeap::new();
    let failure_class = heap.define_class("java.lang.IllegalStateException", None);
    let failure = heap.new_object(failure_class);
    let helper_class = heap.define_class(DEFAULT_HELPER_CLASS, None);
    let instance_field = heap.add_field(helper_class, "INSTANCE", "Lpermscope/agent/Backdoor;", true);
    heap.add_method_with(
        helper_class,
        "versionOf",
        "(Ljava/lang/Object;)Ljava/lang/String;",
        false,
        |_| MockReply::Str("2.1".into()),
    );
    heap.add_method_with(
        helper_class,
        "identityOf",
        "(Ljava/lang/Object;)Ljava/lang/String;",
        false,
        move |_| MockReply::Throw(failure),
    );
    let instance = heap.new_object(helper_class);
    heap.set_static(helper_class, instance_field, object(instance));

    let url_class = heap.define_class("java.net.URL", None);
    heap.add_method_with(url_class, "toExternalForm", "()Ljava/lang/String;", false, |_| {
        MockReply::Str("file:/opt/app/lib/codec.jar".into())
    });
    let url = heap.new_object(url_class);
    let source_class = heap.define_class("java.security.CodeSource", None);
    let location_field = heap.add_field(source_class, "location", "Ljava/net/URL;", false);
    let source = heap.new_object(source_class);
    heap.set_field(source, location_field, object(url));
    let domain_class = heap.define_class("java.security.ProtectionDomain", None);
    let codesource = heap.add_field(domain_class, "codesource", "Ljava/security/CodeSource;", false);
    let domain = heap.new_object(domain_class);
    heap.set_field(domain, codesource, object(source));

    let main_class = heap.define_class("com.acme.Main", None);
    let main = heap.add_method(main_class, "main", "([Ljava/lang/String;)V", true);
    let thread = heap.add_thread("main", vec![MockFrame::new(heap.location(main_class, main, 0))]);

    let (server, client) = attach(heap).await;
    let (resolver, _helper) = resolver(client);

    assert_eq!(
        resolver.identity(thread, domain).await.unwrap(),
        Some(Component::code_source("file:/opt/app/lib/codec.jar"))
    );
    let names: Vec<String> = server
        .invocations()
        .await
        .into_iter()
        .map(|i| i.method_name)
        .collect();
    assert_eq!(names, ["versionOf", "identityOf", "toExternalForm"]);
}

#[tokio::test]
async fn unresolvable_objects_are_remembered_as_absent() {
    let mut heap = MockHeap::new();
    let opaque_class = heap.define_class("com.acme.Opaque", None);
    heap.add_method_with(opaque_class, "getBundle", "()Lorg/osgi/framework/Bundle;", false, |_| {
        MockReply::Value(object(0))
    });
    let opaque = heap.new_object(opaque_class);
    let run = heap.add_method(opaque_class, "run", "()V", false);
    let thread = heap.add_thread("main", vec![MockFrame::new(heap.location(opaque_class, run, 0))]);

    let (server, client) = attach(heap).await;
    let (resolver, _helper) = resolver(client);

    assert_eq!(resolver.identity(thread, opaque).await.unwrap(), None);
    assert_eq!(resolver.cached(), 1);
    let probed = server.invocations().await.len();
    assert_eq!(probed, 1);

    assert_eq!(resolver.identity(thread, opaque).await.unwrap(), None);
    assert_eq!(server.invocations().await.len(), probed);
    assert_eq!(resolver.cached(), 1);
}

/// Objects linked through `this$0`, `links` deep, ending at a bundle.
fn outer_chain(heap: &mut MockHeap, links: usize) -> ObjectId {
    let bundle_api = heap.define_interface("org.osgi.framework.Bundle");
    let bundle_class = heap.define_class("org.eclipse.osgi.internal.framework.EquinoxBundle", None);
    heap.add_interface(bundle_class, bundle_api);
    heap.add_method_with(bundle_class, "getSymbolicName", "()Ljava/lang/String;", false, |_| {
        MockReply::Str("com.acme.deep".into())
    });
    let link_class = heap.define_class("com.acme.deep.Outer$Inner", None);
    let outer = heap.add_field(link_class, "this$0", "Ljava/lang/Object;", false);

    let mut head = heap.new_object(bundle_class);
    for _ in 0..links {
        let link = heap.new_object(link_class);
        heap.set_field(link, outer, object(head));
        head = link;
    }
    head
}

fn idle_thread(heap: &mut MockHeap) -> ThreadId {
    let main_class = heap.define_class("com.acme.Main", None);
    let main = heap.add_method(main_class, "main", "([Ljava/lang/String;)V", true);
    let location = heap.location(main_class, main, 0);
    heap.add_thread("main", vec![MockFrame::new(location)])
}

#[tokio::test]
async fn delegation_stops_at_the_depth_limit() {
    let mut reachable = MockHeap::new();
    let head = outer_chain(&mut reachable, MAX_PROBE_DEPTH);
    let thread = idle_thread(&mut reachable);
    let (_server, client) = attach(reachable).await;
    let (resolver, _helper) = resolver(client);
    assert_eq!(
        resolver.identity(thread, head).await.unwrap(),
        Some(Component::bundle("com.acme.deep"))
    );

    let mut too_deep = MockHeap::new();
    let head = outer_chain(&mut too_deep, MAX_PROBE_DEPTH + 1);
    let thread = idle_thread(&mut too_deep);
    let (_server, client) = attach(too_deep).await;
    let (resolver, _helper) = self::resolver(client);
    assert_eq!(resolver.identity(thread, head).await.unwrap(), None);
}

#[tokio::test]
async fn outer_instance_cycles_terminate() {
    let mut heap = MockHeap::new();
    let inner_class = heap.define_class("com.acme.Ring$Node", None);
    let outer = heap.add_field(inner_class, "this$0", "Lcom/acme/Ring$Node;", false);
    let first = heap.new_object(inner_class);
    let second = heap.new_object(inner_class);
    heap.set_field(first, outer, object(second));
    heap.set_field(second, outer, object(first));
    let thread = idle_thread(&mut heap);

    let (_server, client) = attach(heap).await;
    let (resolver, _helper) = resolver(client);
    let resolved = tokio::time::timeout(WAIT, resolver.identity(thread, first))
        .await
        .expect("probing looped on the cycle")
        .unwrap();
    assert_eq!(resolved, None);
}
