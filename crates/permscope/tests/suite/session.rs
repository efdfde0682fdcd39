use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use parking_lot::Mutex;
use permscope::report::ReportSink;
use permscope::Session;
use permscope_config::{PermscopeConfig, DEFAULT_HELPER_CLASS};
use permscope_jdwp::wire::mock::{MockFrame, MockHeap, MockReply};
use permscope_jdwp::wire::{JdwpValue, Location, ObjectId, ThreadId};
use pretty_assertions::assert_eq;

use super::support::{attach, fire_when_armed, object, SharedBuffer, WAIT};

const PLUGIN_JAR: &str = "file:/opt/app/plugin.jar";
const LIBRARY_JAR: &str = "file:/opt/app/lib/config.jar";
const READ_PASSWD: &str = r#"java.io.FilePermission "/etc/passwd", "read""#;

/// A thread stopped inside `new AccessControlException(..)`, thrown by the
/// context check of a plugin reading `/etc/passwd`.
struct FailingRead {
    heap: MockHeap,
    thread: ThreadId,
    ctor: Location,
}

/// `new FilePermission("/etc/passwd", "read")`.
fn passwd_permission(heap: &mut MockHeap) -> ObjectId {
    let permission_class = heap.define_class("java.io.FilePermission", None);
    heap.add_method_with(permission_class, "getName", "()Ljava/lang/String;", false, |_| {
        MockReply::Str("/etc/passwd".into())
    });
    heap.add_method_with(permission_class, "getActions", "()Ljava/lang/String;", false, |_| {
        MockReply::Str("read".into())
    });
    heap.new_object(permission_class)
}

/// One protection domain per `(code location, loader, implies)` entry.
fn code_domains(heap: &mut MockHeap, entries: &[(&'static str, ObjectId, bool)]) -> Vec<ObjectId> {
    let url_class = heap.define_class("java.net.URL", None);
    let source_class = heap.define_class("java.security.CodeSource", None);
    let location_field = heap.add_field(source_class, "location", "Ljava/net/URL;", false);
    let domain_class = heap.define_class("java.security.ProtectionDomain", None);
    let codesource = heap.add_field(domain_class, "codesource", "Ljava/security/CodeSource;", false);
    let classloader = heap.add_field(domain_class, "classloader", "Ljava/lang/ClassLoader;", false);

    let mut urls = HashMap::new();
    let mut trusted = HashSet::new();
    let mut domains = Vec::with_capacity(entries.len());
    for &(location, loader, implies) in entries {
        let url = heap.new_object(url_class);
        urls.insert(url, location);
        let source = heap.new_object(source_class);
        heap.set_field(source, location_field, object(url));
        let domain = heap.new_object(domain_class);
        heap.set_field(domain, codesource, object(source));
        heap.set_field(domain, classloader, object(loader));
        if implies {
            trusted.insert(domain);
        }
        domains.push(domain);
    }

    heap.add_method_with(url_class, "toExternalForm", "()Ljava/lang/String;", false, move |call| {
        let location = call.receiver.and_then(|url| urls.get(&url)).copied();
        MockReply::Str(location.unwrap_or_default().into())
    });
    heap.add_method_with(
        domain_class,
        "implies",
        "(Ljava/security/Permission;)Z",
        false,
        move |call| {
            let implies = call.receiver.is_some_and(|domain| trusted.contains(&domain));
            MockReply::Value(JdwpValue::Boolean(implies))
        },
    );
    domains
}

/// The innermost two frames of a refused check over `domains`: the exception
/// constructor and `AccessControlContext.checkPermission`.
fn refused_check(heap: &mut MockHeap, domains: Vec<ObjectId>) -> (Location, [MockFrame; 2]) {
    let permission = passwd_permission(heap);
    let domains = heap.new_array(
        "java.security.ProtectionDomain",
        domains.into_iter().map(object).collect(),
    );

    let context_class = heap.define_class("java.security.AccessControlContext", None);
    let context_field = heap.add_field(
        context_class,
        "context",
        "[Ljava/security/ProtectionDomain;",
        false,
    );
    let check = heap.add_method(
        context_class,
        "checkPermission",
        "(Ljava/security/Permission;)V",
        false,
    );
    let context = heap.new_object(context_class);
    heap.set_field(context, context_field, object(domains));

    let exception_class = heap.define_class("java.security.AccessControlException", None);
    let ctor = heap.add_method(
        exception_class,
        "<init>",
        "(Ljava/lang/String;Ljava/security/Permission;)V",
        false,
    );
    let exception = heap.new_object(exception_class);

    let ctor_location = heap.location(exception_class, ctor, 0);
    let frames = [
        MockFrame::new(ctor_location)
            .with_this(exception)
            .with_local(2, object(permission)),
        MockFrame::new(heap.location(context_class, check, 0)).with_this(context),
    ];
    (ctor_location, frames)
}

fn thread_run(heap: &mut MockHeap) -> MockFrame {
    let thread_class = heap.define_class("java.lang.Thread", None);
    let run = heap.add_method(thread_class, "run", "()V", false);
    MockFrame::new(heap.location(thread_class, run, 0))
}

fn failing_read() -> FailingRead {
    let mut heap = MockHeap::new();
    let base_loader = heap.define_class("java.lang.ClassLoader", None);
    let loader_class = heap.define_class("com.acme.PluginLoader", Some(base_loader));
    let loader = heap.new_object(loader_class);
    let domains = code_domains(&mut heap, &[(PLUGIN_JAR, loader, false)]);
    let (ctor, [ctor_frame, check_frame]) = refused_check(&mut heap, domains);

    let plugin_class = heap.define_class("com.acme.Plugin", None);
    heap.set_class_loader(plugin_class, loader);
    heap.set_source_file(plugin_class, "Plugin.java");
    let read_config = heap.add_method(plugin_class, "readConfig", "()V", false);
    heap.set_line_table(read_config, vec![(0, 40), (8, 42)]);
    let plugin = heap.new_object(plugin_class);

    let frames = vec![
        ctor_frame,
        check_frame,
        MockFrame::new(heap.location(plugin_class, read_config, 8)).with_this(plugin),
        thread_run(&mut heap),
    ];
    let thread = heap.add_thread("main", frames);
    FailingRead { heap, thread, ctor }
}

/// A trusted library reads `/etc/passwd` inside `doPrivileged` on behalf of
/// an untrusted plugin. With `library_is_proxy` the library frame runs on a
/// `java.lang.reflect.Proxy` instance.
fn privileged_library_read(library_is_proxy: bool) -> FailingRead {
    let mut heap = MockHeap::new();
    let base_loader = heap.define_class("java.lang.ClassLoader", None);
    let loader_class = heap.define_class("com.acme.BundleLoader", Some(base_loader));
    let library_loader = heap.new_object(loader_class);
    let plugin_loader = heap.new_object(loader_class);
    let domains = code_domains(
        &mut heap,
        &[(LIBRARY_JAR, library_loader, true), (PLUGIN_JAR, plugin_loader, false)],
    );
    let (ctor, [ctor_frame, check_frame]) = refused_check(&mut heap, domains);

    let library_class = heap.define_class("com.acme.lib.ConfigReader", None);
    heap.set_class_loader(library_class, library_loader);
    heap.set_source_file(library_class, "ConfigReader.java");
    let read = heap.add_method(library_class, "read", "()Ljava/lang/Object;", false);
    heap.set_line_table(read, vec![(0, 17)]);
    let library = if library_is_proxy {
        let proxy_class = heap.define_class("java.lang.reflect.Proxy", None);
        let handle_class = heap.define_class("com.acme.lib.ConfigHandle", Some(proxy_class));
        heap.new_object(handle_class)
    } else {
        heap.new_object(library_class)
    };

    let controller_class = heap.define_class("java.security.AccessController", None);
    let do_privileged = heap.add_method(
        controller_class,
        "doPrivileged",
        "(Ljava/security/PrivilegedAction;)Ljava/lang/Object;",
        true,
    );

    let plugin_class = heap.define_class("com.acme.Plugin", None);
    heap.set_class_loader(plugin_class, plugin_loader);
    heap.set_source_file(plugin_class, "Plugin.java");
    let start = heap.add_method(plugin_class, "start", "()V", false);
    heap.set_line_table(start, vec![(0, 30)]);
    let plugin = heap.new_object(plugin_class);

    let frames = vec![
        ctor_frame,
        check_frame,
        MockFrame::new(heap.location(library_class, read, 0)).with_this(library),
        MockFrame::new(heap.location(controller_class, do_privileged, 0)),
        MockFrame::new(heap.location(plugin_class, start, 0)).with_this(plugin),
        thread_run(&mut heap),
    ];
    let thread = heap.add_thread("main", frames);
    FailingRead { heap, thread, ctor }
}

/// Runs a one-shot session against `fixture` and returns its report.
async fn first_report(fixture: FailingRead) -> String {
    let FailingRead { heap, thread, ctor } = fixture;
    let (server, client) = attach(heap).await;
    let mut config = PermscopeConfig::default();
    config.session.continuous = false;
    let out = SharedBuffer::default();
    let session = Session::new(&config, client, ReportSink::new(out.clone()));
    let task = tokio::spawn(session.run());

    fire_when_armed(&server, thread, ctor).await;
    tokio::time::timeout(WAIT, task)
        .await
        .expect("session kept running after the first report")
        .unwrap()
        .unwrap();
    out.contents()
}

/// Publishes a helper that answers for the plugin and records live grants.
fn install_helper(heap: &mut MockHeap, grants: Arc<Mutex<Vec<(String, String)>>>) {
    let class = heap.define_class(DEFAULT_HELPER_CLASS, None);
    let instance_field = heap.add_field(class, "INSTANCE", "Lpermscope/agent/Backdoor;", true);
    heap.add_method_with(class, "versionOf", "(Ljava/lang/Object;)Ljava/lang/String;", false, |_| {
        MockReply::Str("1.4".into())
    });
    heap.add_method_with(class, "identityOf", "(Ljava/lang/Object;)Ljava/lang/String;", false, |_| {
        MockReply::Str(PLUGIN_JAR.into())
    });
    heap.add_method_with(
        class,
        "permissionStringsOf",
        "(Ljava/security/Permission;)Ljava/lang/String;",
        false,
        |_| MockReply::Str(serde_json::to_string(&[READ_PASSWD]).unwrap()),
    );
    heap.add_method_with(
        class,
        "domainInfoOf",
        "([Ljava/security/ProtectionDomain;Ljava/security/Permission;)Ljava/lang/String;",
        false,
        |_| MockReply::Str(format!(r#"[{{"locationString":"{PLUGIN_JAR}","implies":false}}]"#)),
    );
    heap.add_method_with(
        class,
        "grantPermission",
        "(Ljava/lang/String;Ljava/lang/String;)V",
        false,
        move |call| {
            grants.lock().push((
                call.string_arg(0).unwrap_or_default().to_owned(),
                call.string_arg(1).unwrap_or_default().to_owned(),
            ));
            MockReply::Value(JdwpValue::Void)
        },
    );
    let instance = heap.new_object(class);
    heap.set_static(class, instance_field, object(instance));
}

#[tokio::test]
async fn reports_the_first_failure_and_stops() {
    let FailingRead { heap, thread, ctor } = failing_read();
    let (server, client) = attach(heap).await;

    let mut config = PermscopeConfig::default();
    config.session.continuous = false;
    let out = SharedBuffer::default();
    let session = Session::new(&config, client, ReportSink::new(out.clone()));
    let task = tokio::spawn(session.clone().run());

    fire_when_armed(&server, thread, ctor).await;
    tokio::time::timeout(WAIT, task)
        .await
        .expect("session kept running after the first report")
        .unwrap()
        .unwrap();

    assert_eq!(server.resumed_threads().await, vec![thread]);
    assert_eq!(server.dispose_calls(), 1);
    assert_eq!(session.history().len(), 1);

    let report = out.contents();
    assert!(report.starts_with("permission check failed in thread \"main\"\n"), "{report}");
    assert!(report.contains(&format!("  missing: {READ_PASSWD}\n")), "{report}");
    assert!(report.contains(&format!("grant codeBase \"{PLUGIN_JAR}\"")), "{report}");
    assert!(report.contains(&format!("permission {READ_PASSWD};")), "{report}");
}

#[tokio::test]
async fn auto_apply_pushes_the_sole_grant_through_the_helper() {
    let FailingRead {
        mut heap,
        thread,
        ctor,
    } = failing_read();
    let grants = Arc::new(Mutex::new(Vec::new()));
    install_helper(&mut heap, grants.clone());
    let (server, client) = attach(heap).await;

    let mut config = PermscopeConfig::default();
    config.session.auto_apply = true;
    let out = SharedBuffer::default();
    let session = Session::new(&config, client, ReportSink::new(out.clone()));
    let task = tokio::spawn(session.clone().run());

    fire_when_armed(&server, thread, ctor).await;
    assert!(
        server
            .wait_until(WAIT, |view| view.resumed_threads.contains(&thread))
            .await,
        "failure was never resumed"
    );
    server.emit_vm_death().await.unwrap();
    tokio::time::timeout(WAIT, task)
        .await
        .expect("session ignored VM death")
        .unwrap()
        .unwrap();

    assert_eq!(
        grants.lock().clone(),
        vec![(PLUGIN_JAR.to_owned(), READ_PASSWD.to_owned())]
    );
    let called: Vec<String> = server
        .invocations()
        .await
        .into_iter()
        .map(|i| i.method_name)
        .collect();
    assert!(!called.iter().any(|name| name == "implies"), "{called:?}");
    assert!(out.contents().contains(PLUGIN_JAR));
}

#[tokio::test]
async fn elevation_inside_a_privileged_library_ranks_before_the_plugin_grant() {
    let report = first_report(privileged_library_read(false)).await;
    let expected = [
        "permission check failed in thread \"main\"".to_owned(),
        format!("  missing: {READ_PASSWD}"),
        "  solution 1: 0 grant(s), 1 elevation(s)".to_owned(),
        format!("    elevate #1 after com.acme.lib.ConfigReader.read(ConfigReader.java:17) [{LIBRARY_JAR}]"),
        "  solution 2: 1 grant(s), 0 elevation(s)".to_owned(),
        format!("    grant codeBase \"{PLUGIN_JAR}\" {{"),
        format!("      permission {READ_PASSWD};"),
        "    };".to_owned(),
        String::new(),
    ]
    .join("\n");
    assert_eq!(report, expected);
}

#[tokio::test]
async fn proxy_frames_never_host_an_elevation() {
    let report = first_report(privileged_library_read(true)).await;
    assert!(!report.contains("elevate"), "{report}");
    assert!(report.contains("  solution 1: 1 grant(s), 0 elevation(s)\n"), "{report}");
    assert!(!report.contains("solution 2"), "{report}");
    assert!(report.contains(&format!("grant codeBase \"{PLUGIN_JAR}\"")), "{report}");
}

/// A framework thread about to hand a service event to a listener of bundle
/// `com.acme.client`, which may not see the service. Helper grants are
/// recorded in `grants`; the helper's own check never catches up with them.
fn hidden_service_event(grants: Arc<Mutex<Vec<(String, String)>>>) -> (MockHeap, ThreadId, Location) {
    let mut heap = MockHeap::new();
    let class = heap.define_class(DEFAULT_HELPER_CLASS, None);
    let instance_field = heap.add_field(class, "INSTANCE", "Lpermscope/agent/Backdoor;", true);
    heap.add_method_with(class, "versionOf", "(Ljava/lang/Object;)Ljava/lang/String;", false, |_| {
        MockReply::Str("1.4".into())
    });
    heap.add_method_with(class, "identityOf", "(Ljava/lang/Object;)Ljava/lang/String;", false, |_| {
        MockReply::Str("com.acme.client".into())
    });
    heap.add_method_with(
        class,
        "servicePermissionInfoAndGrant",
        "(Ljava/lang/String;Ljava/security/ProtectionDomain;Ljava/lang/Object;Z)Ljava/lang/String;",
        false,
        |call| match call.string_arg(0) {
            Some("com.acme.client") => MockReply::Str(
                r#"{"permissionStrings":["org.osgi.framework.ServicePermission \"com.acme.Api\", \"get\""],"implies":false}"#
                    .into(),
            ),
            _ => MockReply::Str(r#"{"permissionStrings":[],"implies":true}"#.into()),
        },
    );
    heap.add_method_with(
        class,
        "grantPermission",
        "(Ljava/lang/String;Ljava/lang/String;)V",
        false,
        move |call| {
            grants.lock().push((
                call.string_arg(0).unwrap_or_default().to_owned(),
                call.string_arg(1).unwrap_or_default().to_owned(),
            ));
            MockReply::Value(JdwpValue::Void)
        },
    );
    let instance = heap.new_object(class);
    heap.set_static(class, instance_field, object(instance));

    let context_class = heap.define_class("org.eclipse.osgi.internal.framework.BundleContextImpl", None);
    let context = heap.new_object(context_class);
    let tracker_class = heap.define_class("com.acme.client.Tracker", None);
    let tracker = heap.new_object(tracker_class);
    let event_class = heap.define_class("org.osgi.framework.ServiceEvent", None);
    let event = heap.new_object(event_class);

    let filtered_class = heap.define_class(
        "org.eclipse.osgi.internal.serviceregistry.FilteredServiceListener",
        None,
    );
    let context_field = heap.add_field(
        filtered_class,
        "context",
        "Lorg/eclipse/osgi/internal/framework/BundleContextImpl;",
        false,
    );
    let listener_field = heap.add_field(
        filtered_class,
        "listener",
        "Lorg/osgi/framework/ServiceListener;",
        false,
    );
    let service_changed = heap.add_method(
        filtered_class,
        "serviceChanged",
        "(Lorg/osgi/framework/ServiceEvent;)V",
        false,
    );
    let filtered = heap.new_object(filtered_class);
    heap.set_field(filtered, context_field, object(context));
    heap.set_field(filtered, listener_field, object(tracker));

    let location = heap.location(filtered_class, service_changed, 0);
    let thread = heap.add_thread(
        "Framework Event Dispatcher",
        vec![MockFrame::new(location)
            .with_this(filtered)
            .with_local(1, object(event))],
    );
    (heap, thread, location)
}

#[tokio::test]
async fn hidden_service_events_are_reported_per_listener() {
    let (heap, thread, location) = hidden_service_event(Arc::default());
    let (server, client) = attach(heap).await;
    let mut config = PermscopeConfig::default();
    config.session.continuous = false;
    config.session.monitor_services = true;
    let out = SharedBuffer::default();
    let session = Session::new(&config, client, ReportSink::new(out.clone()));
    let task = tokio::spawn(session.run());

    fire_when_armed(&server, thread, location).await;
    tokio::time::timeout(WAIT, task)
        .await
        .expect("session kept running after the first report")
        .unwrap()
        .unwrap();

    let report = out.contents();
    assert!(
        report.starts_with("service event hidden from listener com.acme.client.Tracker\n"),
        "{report}"
    );
    assert!(report.contains("grant bundles \"com.acme.client\""), "{report}");
    assert!(report.contains("org.osgi.framework.ServicePermission"), "{report}");
}

#[tokio::test]
async fn granted_service_permissions_settle_later_events_from_the_ledger() {
    let grants = Arc::new(Mutex::new(Vec::new()));
    let (heap, thread, location) = hidden_service_event(grants.clone());
    let (server, client) = attach(heap).await;
    let mut config = PermscopeConfig::default();
    config.session.auto_apply = true;
    config.session.monitor_services = true;
    let out = SharedBuffer::default();
    let session = Session::new(&config, client, ReportSink::new(out.clone()));
    let task = tokio::spawn(session.clone().run());

    fire_when_armed(&server, thread, location).await;
    assert!(server.wait_until(WAIT, |view| view.resumed_threads.len() == 1).await);
    fire_when_armed(&server, thread, location).await;
    assert!(server.wait_until(WAIT, |view| view.resumed_threads.len() == 2).await);
    server.emit_vm_death().await.unwrap();
    tokio::time::timeout(WAIT, task)
        .await
        .expect("session ignored VM death")
        .unwrap()
        .unwrap();

    let checks = server
        .invocations()
        .await
        .iter()
        .filter(|i| i.method_name == "servicePermissionInfoAndGrant")
        .count();
    assert_eq!(checks, 2);
    assert_eq!(grants.lock().len(), 1, "{:?}", grants.lock());
    assert_eq!(session.history().len(), 1);
    assert_eq!(out.contents().matches("service event hidden").count(), 1);
}
