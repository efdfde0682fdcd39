use permscope::proxy::{Arg, Member, RemoteProxy, Unwrapped};
use permscope::TraceError;
use permscope_jdwp::wire::mock::{MockFrame, MockHeap, MockJdwpServer, MockJdwpServerConfig, MockReply};
use permscope_jdwp::wire::types::INVOKE_SINGLE_THREADED;
use permscope_jdwp::wire::{JdwpClient, JdwpValue, ObjectId, ThreadId};
use pretty_assertions::assert_eq;

use super::support::{attach, object};

const ALLOWS: Member<'static> = Member::new("allows", "(Ljava/lang/String;)Z");

struct Gate {
    heap: MockHeap,
    gate: ObjectId,
    thread: ThreadId,
}

fn gate_heap() -> Gate {
    let mut heap = MockHeap::new();
    let class = heap.define_class("com.acme.Gate", None);
    let name_field = heap.add_field(class, "name", "Ljava/lang/String;", false);
    let allows = heap.add_method_with(class, "allows", ALLOWS.signature, false, |call| {
        MockReply::Value(JdwpValue::Boolean(call.string_arg(0) == Some("read")))
    });
    let gate = heap.new_object(class);
    let name = heap.new_string("front door");
    heap.set_field(gate, name_field, JdwpValue::Object { tag: b's', id: name });
    let location = heap.location(class, allows, 0);
    let thread = heap.add_thread("main", vec![MockFrame::new(location).with_this(gate)]);
    Gate { heap, gate, thread }
}

#[tokio::test]
async fn reads_fields_and_invokes_with_pinned_string_arguments() {
    let Gate { heap, gate, thread } = gate_heap();
    let (server, client) = attach(heap).await;
    let proxy = RemoteProxy::new(client, true);

    assert_eq!(
        proxy.get_field(gate, "name").await.unwrap(),
        Unwrapped::Str("front door".into())
    );
    assert_eq!(proxy.class_name_of(gate).await.unwrap(), "com.acme.Gate");

    let allowed = proxy
        .invoke(thread, gate, ALLOWS, &[Arg::str("read")])
        .await
        .unwrap();
    assert_eq!(allowed.as_bool(), Some(true));
    let denied = proxy
        .invoke(thread, gate, ALLOWS, &[Arg::str("write")])
        .await
        .unwrap();
    assert_eq!(denied.as_bool(), Some(false));

    let invocations = server.invocations().await;
    assert_eq!(invocations.len(), 2);
    assert!(invocations
        .iter()
        .all(|i| i.options == INVOKE_SINGLE_THREADED && i.receiver == Some(gate)));
    assert!(server.pinned_object_ids().await.is_empty());
}

#[tokio::test]
async fn string_arguments_are_recreated_when_collected_before_pinning() {
    let Gate { heap, gate, thread } = gate_heap();
    let server = MockJdwpServer::spawn_with_config(
        heap,
        MockJdwpServerConfig {
            pin_failures: 3,
            ..MockJdwpServerConfig::default()
        },
    )
    .await
    .unwrap();
    let client = JdwpClient::connect(server.addr()).await.unwrap();
    let proxy = RemoteProxy::new(client, false);

    let allowed = proxy
        .invoke(thread, gate, ALLOWS, &[Arg::str("read")])
        .await
        .unwrap();
    assert_eq!(allowed, Unwrapped::Bool(true));

    let invocations = server.invocations().await;
    assert_eq!(invocations.len(), 1);
    assert_eq!(invocations[0].options, 0);
    assert!(server.pinned_object_ids().await.is_empty());
}

#[tokio::test]
async fn missing_members_are_layout_mismatches() {
    let Gate { heap, gate, thread } = gate_heap();
    let (_server, client) = attach(heap).await;
    let proxy = RemoteProxy::new(client, true);

    let err = proxy.get_field(gate, "owner").await.unwrap_err();
    assert!(matches!(err, TraceError::ProtocolMismatch(_)), "{err:?}");
    assert_eq!(proxy.probe_field(gate, "owner").await.unwrap(), None);

    let err = proxy
        .invoke(thread, gate, Member::new("close", "()V"), &[])
        .await
        .unwrap_err();
    assert!(matches!(err, TraceError::ProtocolMismatch(_)), "{err:?}");
    assert_eq!(proxy.probe_getter(thread, gate, "getOwner").await.unwrap(), None);
    assert!(proxy.class_by_name("com.acme.Missing").await.unwrap().is_none());
}

#[tokio::test]
async fn thrown_exceptions_are_classified() {
    let mut heap = MockHeap::new();
    let vm_error = heap.define_class("java.lang.VirtualMachineError", None);
    let oom = heap.define_class("java.lang.OutOfMemoryError", Some(vm_error));
    let ise = heap.define_class("java.lang.IllegalStateException", None);
    let oom_instance = heap.new_object(oom);
    let ise_instance = heap.new_object(ise);

    let class = heap.define_class("com.acme.Worker", None);
    let fail = heap.add_method_with(class, "fail", "()V", false, move |_| MockReply::Throw(ise_instance));
    heap.add_method_with(class, "exhaust", "()V", false, move |_| MockReply::Throw(oom_instance));
    let worker = heap.new_object(class);
    let location = heap.location(class, fail, 0);
    let thread = heap.add_thread("worker", vec![MockFrame::new(location).with_this(worker)]);

    let (_server, client) = attach(heap).await;
    let proxy = RemoteProxy::new(client, true);

    let err = proxy
        .invoke(thread, worker, Member::new("fail", "()V"), &[])
        .await
        .unwrap_err();
    match &err {
        TraceError::RemoteException {
            class_name,
            exception,
        } => {
            assert_eq!(class_name, "java.lang.IllegalStateException");
            assert_eq!(*exception, ise_instance);
        }
        other => panic!("expected a remote exception, got {other:?}"),
    }
    assert!(!err.is_fatal());

    let err = proxy
        .invoke(thread, worker, Member::new("exhaust", "()V"), &[])
        .await
        .unwrap_err();
    assert!(
        matches!(&err, TraceError::VmFatal { class_name } if class_name == "java.lang.OutOfMemoryError"),
        "{err:?}"
    );
    assert!(err.is_fatal());
}

#[tokio::test]
async fn locations_render_like_stack_trace_lines() {
    let mut heap = MockHeap::new();
    let class = heap.define_class("com.acme.Plugin", None);
    heap.set_source_file(class, "Plugin.java");
    let run = heap.add_method(class, "run", "()V", false);
    heap.set_line_table(run, vec![(0, 10), (5, 12), (9, 14)]);
    let anonymous = heap.define_class("com.acme.Plugin$1", None);
    let call = heap.add_method(anonymous, "call", "()Ljava/lang/Object;", false);

    let at_run = heap.location(class, run, 7);
    let at_call = heap.location(anonymous, call, 0);
    let (_server, client) = attach(heap).await;
    let proxy = RemoteProxy::new(client, true);

    assert_eq!(
        proxy.describe_location(&at_run).await.unwrap(),
        "com.acme.Plugin.run(Plugin.java:12)"
    );
    assert_eq!(
        proxy.describe_location(&at_call).await.unwrap(),
        "com.acme.Plugin$1.call(Unknown Source)"
    );
}

#[tokio::test]
async fn frame_arguments_skip_the_receiver_and_wide_slots() {
    let mut heap = MockHeap::new();
    let class = heap.define_class("com.acme.Io", None);
    let write = heap.add_method(class, "write", "(JLjava/lang/String;)V", false);
    let io = heap.new_object(class);
    let text = heap.new_string("payload");
    let location = heap.location(class, write, 0);
    let thread = heap.add_thread(
        "io",
        vec![MockFrame::new(location)
            .with_this(io)
            .with_local(1, JdwpValue::Long(42))
            .with_local(3, object(text))],
    );

    let (_server, client) = attach(heap).await;
    let proxy = RemoteProxy::new(client, true);
    let frames = proxy.frames(thread).await.unwrap();
    let frame = &frames[0];

    assert_eq!(proxy.this_object(thread, frame).await.unwrap(), Some(io));
    assert_eq!(
        proxy.frame_argument(thread, frame, 0).await.unwrap(),
        JdwpValue::Long(42)
    );
    assert_eq!(
        proxy.frame_argument(thread, frame, 1).await.unwrap().object_id(),
        Some(text)
    );
    let err = proxy.frame_argument(thread, frame, 2).await.unwrap_err();
    assert!(matches!(err, TraceError::ProtocolMismatch(_)), "{err:?}");
}
