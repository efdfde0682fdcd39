use std::{
    collections::{BTreeSet, HashMap},
    net::{IpAddr, Ipv4Addr, SocketAddr},
    sync::{
        atomic::{AtomicI32, AtomicU32, AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{tcp::OwnedWriteHalf, TcpListener},
    sync::{Mutex, Notify},
};
use tokio_util::sync::CancellationToken;

use super::{
    codec::{
        class_name_to_signature, command, encode_command, encode_reply, signature_to_tag,
        JdwpReader, JdwpWriter, HANDSHAKE, HEADER_LEN,
    },
    types::{
        FieldId, FrameId, JdwpIdSizes, JdwpValue, Location, MethodId, ObjectId, ReferenceTypeId,
        ThreadId, ERROR_INVALID_OBJECT, EVENT_KIND_BREAKPOINT, EVENT_KIND_CLASS_PREPARE,
        EVENT_KIND_VM_DEATH, EVENT_MODIFIER_KIND_CLASS_MATCH, EVENT_MODIFIER_KIND_LOCATION_ONLY,
        MODIFIER_STATIC, SUSPEND_POLICY_EVENT_THREAD, SUSPEND_POLICY_NONE, TAG_ARRAY,
        TAG_CLASS_LOADER, TAG_OBJECT, TAG_STRING, TAG_THREAD, TYPE_TAG_ARRAY, TYPE_TAG_CLASS,
        TYPE_TAG_INTERFACE,
    },
};

// JDWP error codes (subset) the mock VM answers with.
const ERROR_INVALID_THREAD: u16 = 10;
const ERROR_INVALID_FRAMEID: u16 = 30;
const ERROR_INVALID_METHODID: u16 = 23;
const ERROR_INVALID_FIELDID: u16 = 25;
const ERROR_ABSENT_INFORMATION: u16 = 101;
const ERROR_NOT_IMPLEMENTED: u16 = 99;
const ERROR_INVALID_CLASS: u16 = 21;

const FIRST_ID: u64 = 0x1000;

/// Reply produced by a scripted method body.
#[derive(Debug, Clone, PartialEq)]
pub enum MockReply {
    Value(JdwpValue),
    /// A `java.lang.String` allocated by the mock VM on return.
    Str(String),
    /// The invocation completes by throwing the given exception object.
    Throw(ObjectId),
    /// The command fails with a raw JDWP error code.
    Error(u16),
}

/// Arguments of one scripted invocation as seen by the mock VM.
#[derive(Debug, Clone)]
pub struct MockCall {
    /// `None` for static invocations and constructors.
    pub receiver: Option<ObjectId>,
    pub thread: ThreadId,
    pub args: Vec<JdwpValue>,
    /// String contents for every argument that refers to a string object.
    pub string_args: Vec<Option<String>>,
    pub options: u32,
}

impl MockCall {
    pub fn string_arg(&self, idx: usize) -> Option<&str> {
        self.string_args.get(idx).and_then(|s| s.as_deref())
    }
}

type InvokeHandler = Arc<dyn Fn(&MockCall) -> MockReply + Send + Sync>;

/// A recorded invocation, for assertions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MockInvocation {
    pub receiver: Option<ObjectId>,
    pub method_id: MethodId,
    pub method_name: String,
    pub options: u32,
}

#[derive(Debug, Clone)]
struct MockField {
    id: FieldId,
    name: String,
    signature: String,
    mod_bits: u32,
}

#[derive(Debug, Clone)]
struct MockMethod {
    id: MethodId,
    name: String,
    signature: String,
    mod_bits: u32,
    lines: Vec<(u64, i32)>,
}

#[derive(Debug, Clone)]
struct MockClass {
    signature: String,
    ref_type_tag: u8,
    superclass: ReferenceTypeId,
    interfaces: Vec<ReferenceTypeId>,
    loader: ObjectId,
    source_file: Option<String>,
    fields: Vec<MockField>,
    methods: Vec<MockMethod>,
    statics: HashMap<FieldId, JdwpValue>,
    prepared: bool,
}

#[derive(Debug, Clone)]
enum MockObjectKind {
    Plain,
    Str(String),
    Array(Vec<JdwpValue>),
}

#[derive(Debug, Clone)]
struct MockObject {
    class_id: ReferenceTypeId,
    fields: HashMap<FieldId, JdwpValue>,
    kind: MockObjectKind,
}

/// One frame of a scripted thread stack, innermost first.
#[derive(Debug, Clone)]
pub struct MockFrame {
    pub location: Location,
    /// `0` for static frames.
    pub this_object: ObjectId,
    pub locals: Vec<(u32, JdwpValue)>,
}

impl MockFrame {
    pub fn new(location: Location) -> Self {
        Self {
            location,
            this_object: 0,
            locals: Vec::new(),
        }
    }

    pub fn with_this(mut self, this_object: ObjectId) -> Self {
        self.this_object = this_object;
        self
    }

    pub fn with_local(mut self, slot: u32, value: JdwpValue) -> Self {
        self.locals.push((slot, value));
        self
    }
}

#[derive(Debug, Clone)]
struct MockThread {
    name: String,
    frames: Vec<(FrameId, MockFrame)>,
}

/// A scripted object graph served by [`MockJdwpServer`].
///
/// Tests describe classes, objects, threads and method bodies up front; the
/// server then answers JDWP commands against this heap without a JDK.
pub struct MockHeap {
    next_id: u64,
    classes: HashMap<ReferenceTypeId, MockClass>,
    objects: HashMap<ObjectId, MockObject>,
    threads: HashMap<ThreadId, MockThread>,
    handlers: HashMap<MethodId, InvokeHandler>,
    object_class: ReferenceTypeId,
    string_class: ReferenceTypeId,
}

impl Default for MockHeap {
    fn default() -> Self {
        Self::new()
    }
}

impl MockHeap {
    pub fn new() -> Self {
        let mut heap = Self {
            next_id: FIRST_ID,
            classes: HashMap::new(),
            objects: HashMap::new(),
            threads: HashMap::new(),
            handlers: HashMap::new(),
            object_class: 0,
            string_class: 0,
        };
        let object_class = heap.insert_class("java.lang.Object", TYPE_TAG_CLASS, 0, true);
        heap.object_class = object_class;
        heap.string_class = heap.define_class("java.lang.String", None);
        heap
    }

    fn alloc(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    fn insert_class(
        &mut self,
        name: &str,
        ref_type_tag: u8,
        superclass: ReferenceTypeId,
        prepared: bool,
    ) -> ReferenceTypeId {
        let id = self.alloc();
        self.classes.insert(
            id,
            MockClass {
                signature: class_name_to_signature(name),
                ref_type_tag,
                superclass,
                interfaces: Vec::new(),
                loader: 0,
                source_file: None,
                fields: Vec::new(),
                methods: Vec::new(),
                statics: HashMap::new(),
                prepared,
            },
        );
        id
    }

    pub fn object_class(&self) -> ReferenceTypeId {
        self.object_class
    }

    pub fn string_class(&self) -> ReferenceTypeId {
        self.string_class
    }

    /// Defines a loaded and prepared class. `superclass` defaults to `java.lang.Object`.
    pub fn define_class(&mut self, name: &str, superclass: Option<ReferenceTypeId>) -> ReferenceTypeId {
        let superclass = superclass.unwrap_or(self.object_class);
        self.insert_class(name, TYPE_TAG_CLASS, superclass, true)
    }

    /// Defines a class that only becomes visible once [`MockJdwpServer::prepare_class`] runs.
    pub fn define_unprepared_class(
        &mut self,
        name: &str,
        superclass: Option<ReferenceTypeId>,
    ) -> ReferenceTypeId {
        let superclass = superclass.unwrap_or(self.object_class);
        self.insert_class(name, TYPE_TAG_CLASS, superclass, false)
    }

    pub fn define_interface(&mut self, name: &str) -> ReferenceTypeId {
        self.insert_class(name, TYPE_TAG_INTERFACE, 0, true)
    }

    pub fn add_interface(&mut self, class_id: ReferenceTypeId, interface: ReferenceTypeId) {
        if let Some(class) = self.classes.get_mut(&class_id) {
            class.interfaces.push(interface);
        }
    }

    pub fn set_class_loader(&mut self, class_id: ReferenceTypeId, loader: ObjectId) {
        if let Some(class) = self.classes.get_mut(&class_id) {
            class.loader = loader;
        }
    }

    pub fn set_source_file(&mut self, class_id: ReferenceTypeId, source_file: &str) {
        if let Some(class) = self.classes.get_mut(&class_id) {
            class.source_file = Some(source_file.to_string());
        }
    }

    pub fn add_field(
        &mut self,
        class_id: ReferenceTypeId,
        name: &str,
        signature: &str,
        is_static: bool,
    ) -> FieldId {
        let id = self.alloc();
        if let Some(class) = self.classes.get_mut(&class_id) {
            class.fields.push(MockField {
                id,
                name: name.to_string(),
                signature: signature.to_string(),
                mod_bits: if is_static { MODIFIER_STATIC } else { 0 },
            });
        }
        id
    }

    pub fn add_method(
        &mut self,
        class_id: ReferenceTypeId,
        name: &str,
        signature: &str,
        is_static: bool,
    ) -> MethodId {
        let id = self.alloc();
        if let Some(class) = self.classes.get_mut(&class_id) {
            class.methods.push(MockMethod {
                id,
                name: name.to_string(),
                signature: signature.to_string(),
                mod_bits: if is_static { MODIFIER_STATIC } else { 0 },
                lines: vec![(0, 1)],
            });
        }
        id
    }

    /// Adds a method whose body is scripted by `handler`.
    pub fn add_method_with<F>(
        &mut self,
        class_id: ReferenceTypeId,
        name: &str,
        signature: &str,
        is_static: bool,
        handler: F,
    ) -> MethodId
    where
        F: Fn(&MockCall) -> MockReply + Send + Sync + 'static,
    {
        let id = self.add_method(class_id, name, signature, is_static);
        self.on_invoke(id, handler);
        id
    }

    pub fn on_invoke<F>(&mut self, method_id: MethodId, handler: F)
    where
        F: Fn(&MockCall) -> MockReply + Send + Sync + 'static,
    {
        self.handlers.insert(method_id, Arc::new(handler));
    }

    pub fn set_line_table(&mut self, method_id: MethodId, lines: Vec<(u64, i32)>) {
        for class in self.classes.values_mut() {
            for method in &mut class.methods {
                if method.id == method_id {
                    method.lines = lines.clone();
                }
            }
        }
    }

    pub fn set_static(&mut self, class_id: ReferenceTypeId, field_id: FieldId, value: JdwpValue) {
        if let Some(class) = self.classes.get_mut(&class_id) {
            class.statics.insert(field_id, value);
        }
    }

    pub fn new_object(&mut self, class_id: ReferenceTypeId) -> ObjectId {
        let id = self.alloc();
        self.objects.insert(
            id,
            MockObject {
                class_id,
                fields: HashMap::new(),
                kind: MockObjectKind::Plain,
            },
        );
        id
    }

    pub fn set_field(&mut self, object_id: ObjectId, field_id: FieldId, value: JdwpValue) {
        if let Some(object) = self.objects.get_mut(&object_id) {
            object.fields.insert(field_id, value);
        }
    }

    pub fn new_string(&mut self, value: &str) -> ObjectId {
        let id = self.alloc();
        self.objects.insert(
            id,
            MockObject {
                class_id: self.string_class,
                fields: HashMap::new(),
                kind: MockObjectKind::Str(value.to_string()),
            },
        );
        id
    }

    /// Allocates an array object; `element_class` is a binary class name such as
    /// `java.security.ProtectionDomain`.
    pub fn new_array(&mut self, element_class: &str, values: Vec<JdwpValue>) -> ObjectId {
        let signature = format!("[{}", class_name_to_signature(element_class));
        let class_id = match self
            .classes
            .iter()
            .find(|(_, class)| class.signature == signature)
        {
            Some((id, _)) => *id,
            None => {
                let id = self.alloc();
                self.classes.insert(
                    id,
                    MockClass {
                        signature,
                        ref_type_tag: TYPE_TAG_ARRAY,
                        superclass: self.object_class,
                        interfaces: Vec::new(),
                        loader: 0,
                        source_file: None,
                        fields: Vec::new(),
                        methods: Vec::new(),
                        statics: HashMap::new(),
                        prepared: true,
                    },
                );
                id
            }
        };
        let id = self.alloc();
        self.objects.insert(
            id,
            MockObject {
                class_id,
                fields: HashMap::new(),
                kind: MockObjectKind::Array(values),
            },
        );
        id
    }

    /// Adds a suspended thread with the given stack (innermost frame first).
    pub fn add_thread(&mut self, name: &str, frames: Vec<MockFrame>) -> ThreadId {
        let id = self.alloc();
        let frames = frames
            .into_iter()
            .map(|frame| (self.alloc(), frame))
            .collect();
        self.threads.insert(
            id,
            MockThread {
                name: name.to_string(),
                frames,
            },
        );
        id
    }

    pub fn location(&self, class_id: ReferenceTypeId, method_id: MethodId, index: u64) -> Location {
        let type_tag = self
            .classes
            .get(&class_id)
            .map(|c| c.ref_type_tag)
            .unwrap_or(TYPE_TAG_CLASS);
        Location {
            type_tag,
            class_id,
            method_id,
            index,
        }
    }

    fn method(&self, method_id: MethodId) -> Option<&MockMethod> {
        self.classes
            .values()
            .flat_map(|c| c.methods.iter())
            .find(|m| m.id == method_id)
    }

    fn field_signature(&self, field_id: FieldId) -> Option<&str> {
        self.classes
            .values()
            .flat_map(|c| c.fields.iter())
            .find(|f| f.id == field_id)
            .map(|f| f.signature.as_str())
    }

    fn tag_of(&self, object_id: ObjectId) -> u8 {
        match self.objects.get(&object_id).map(|o| &o.kind) {
            Some(MockObjectKind::Str(_)) => TAG_STRING,
            Some(MockObjectKind::Array(_)) => TAG_ARRAY,
            _ if self.threads.contains_key(&object_id) => TAG_THREAD,
            _ => TAG_OBJECT,
        }
    }

    fn string_of(&self, value: &JdwpValue) -> Option<String> {
        let id = value.object_id()?;
        match &self.objects.get(&id)?.kind {
            MockObjectKind::Str(s) => Some(s.clone()),
            _ => None,
        }
    }

    fn frame(&self, thread: ThreadId, frame_id: FrameId) -> Option<&MockFrame> {
        self.threads
            .get(&thread)?
            .frames
            .iter()
            .find(|(id, _)| *id == frame_id)
            .map(|(_, frame)| frame)
    }
}

fn default_value(signature: &str) -> JdwpValue {
    match signature_to_tag(signature) {
        b'Z' => JdwpValue::Boolean(false),
        b'B' => JdwpValue::Byte(0),
        b'C' => JdwpValue::Char(0),
        b'S' => JdwpValue::Short(0),
        b'I' => JdwpValue::Int(0),
        b'J' => JdwpValue::Long(0),
        b'F' => JdwpValue::Float(0.0),
        b'D' => JdwpValue::Double(0.0),
        b'V' => JdwpValue::Void,
        tag => JdwpValue::Object { tag, id: 0 },
    }
}

#[derive(Clone, Debug)]
pub struct MockJdwpServerConfig {
    /// Reply delays keyed by `(command_set, command)`.
    ///
    /// The server will still accept and respond to other commands while a delayed reply
    /// is pending.
    pub delayed_replies: Vec<DelayedReply>,
    /// JDWP identifier sizes returned by `VirtualMachine.IDSizes`.
    pub id_sizes: JdwpIdSizes,
    /// Number of leading `ObjectReference.DisableCollection` calls that fail with
    /// `INVALID_OBJECT`, as if the object had been collected before it was pinned.
    pub pin_failures: usize,
    /// Commands that always answer with a VM error instead of being served.
    pub failed_replies: Vec<FailedReply>,
}

impl Default for MockJdwpServerConfig {
    fn default() -> Self {
        Self {
            delayed_replies: Vec::new(),
            id_sizes: JdwpIdSizes::default(),
            pin_failures: 0,
            failed_replies: Vec::new(),
        }
    }
}

#[derive(Clone, Debug)]
pub struct DelayedReply {
    pub command_set: u8,
    pub command: u8,
    pub delay: Duration,
}

#[derive(Clone, Debug)]
pub struct FailedReply {
    pub command_set: u8,
    pub command: u8,
    pub error_code: u16,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MockEventRequest {
    pub event_kind: u8,
    pub suspend_policy: u8,
    pub request_id: i32,
    pub modifiers: Vec<MockEventRequestModifier>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockEventRequestModifier {
    ClassMatch { pattern: String },
    LocationOnly { location: Location },
}

/// A tiny JDWP server used for unit/integration testing.
///
/// It serves a [`MockHeap`] and lets tests drive class-prepare, breakpoint and
/// VM-death events explicitly.
pub struct MockJdwpServer {
    addr: SocketAddr,
    shutdown: CancellationToken,
    state: Arc<State>,
}

struct State {
    config: MockJdwpServerConfig,
    heap: Mutex<MockHeap>,
    next_request_id: AtomicI32,
    next_packet_id: AtomicU32,
    pin_failures_remaining: AtomicUsize,
    vm_resume_calls: AtomicU32,
    dispose_calls: AtomicU32,
    resumed_threads: Mutex<Vec<ThreadId>>,
    event_requests: Mutex<Vec<MockEventRequest>>,
    cleared_requests: Mutex<Vec<(u8, i32)>>,
    pinned_object_ids: Mutex<BTreeSet<ObjectId>>,
    invocations: Mutex<Vec<MockInvocation>>,
    writer: Mutex<Option<Arc<Mutex<OwnedWriteHalf>>>>,
    delayed_replies: HashMap<(u8, u8), Duration>,
    failed_replies: HashMap<(u8, u8), u16>,
    activity: Notify,
}

impl MockJdwpServer {
    pub async fn spawn(heap: MockHeap) -> std::io::Result<Self> {
        Self::spawn_with_config(heap, MockJdwpServerConfig::default()).await
    }

    pub async fn spawn_with_config(
        heap: MockHeap,
        config: MockJdwpServerConfig,
    ) -> std::io::Result<Self> {
        let listener = TcpListener::bind(SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 0)).await?;
        let addr = listener.local_addr()?;
        let shutdown = CancellationToken::new();

        let delayed_replies = config
            .delayed_replies
            .iter()
            .map(|entry| ((entry.command_set, entry.command), entry.delay))
            .collect();
        let failed_replies = config
            .failed_replies
            .iter()
            .map(|entry| ((entry.command_set, entry.command), entry.error_code))
            .collect();
        let state = Arc::new(State {
            pin_failures_remaining: AtomicUsize::new(config.pin_failures),
            config,
            heap: Mutex::new(heap),
            next_request_id: AtomicI32::new(0),
            next_packet_id: AtomicU32::new(0),
            vm_resume_calls: AtomicU32::new(0),
            dispose_calls: AtomicU32::new(0),
            resumed_threads: Mutex::new(Vec::new()),
            event_requests: Mutex::new(Vec::new()),
            cleared_requests: Mutex::new(Vec::new()),
            pinned_object_ids: Mutex::new(BTreeSet::new()),
            invocations: Mutex::new(Vec::new()),
            writer: Mutex::new(None),
            delayed_replies,
            failed_replies,
            activity: Notify::new(),
        });

        let task_state = state.clone();
        let task_shutdown = shutdown.clone();
        tokio::spawn(async move {
            if let Err(err) = run(listener, task_state, task_shutdown).await {
                tracing::debug!(target = "permscope.jdwp.mock", error = %err, "mock JDWP server stopped");
            }
        });

        Ok(Self {
            addr,
            shutdown,
            state,
        })
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub async fn event_requests(&self) -> Vec<MockEventRequest> {
        self.state.event_requests.lock().await.clone()
    }

    /// `(event_kind, request_id)` pairs passed to `EventRequest.Clear`.
    pub async fn cleared_requests(&self) -> Vec<(u8, i32)> {
        self.state.cleared_requests.lock().await.clone()
    }

    pub async fn resumed_threads(&self) -> Vec<ThreadId> {
        self.state.resumed_threads.lock().await.clone()
    }

    pub fn vm_resume_calls(&self) -> u32 {
        self.state.vm_resume_calls.load(Ordering::Relaxed)
    }

    pub fn dispose_calls(&self) -> u32 {
        self.state.dispose_calls.load(Ordering::Relaxed)
    }

    pub async fn pinned_object_ids(&self) -> BTreeSet<ObjectId> {
        self.state.pinned_object_ids.lock().await.clone()
    }

    pub async fn invocations(&self) -> Vec<MockInvocation> {
        self.state.invocations.lock().await.clone()
    }

    /// Waits until `condition` holds, re-checking after every command the server handles.
    pub async fn wait_until<F>(&self, timeout: Duration, condition: F) -> bool
    where
        F: Fn(&MockJdwpServerView<'_>) -> bool,
    {
        let wait = async {
            loop {
                let notified = self.state.activity.notified();
                {
                    let resumed = self.state.resumed_threads.lock().await;
                    let view = MockJdwpServerView {
                        resumed_threads: &resumed,
                        vm_resume_calls: self.vm_resume_calls(),
                        requests: self.state.event_requests.lock().await.len(),
                    };
                    if condition(&view) {
                        return;
                    }
                }
                notified.await;
            }
        };
        tokio::time::timeout(timeout, wait).await.is_ok()
    }

    /// Marks a class as prepared and emits a `ClassPrepare` event for every
    /// class-prepare request whose pattern matches it.
    pub async fn prepare_class(&self, class_id: ReferenceTypeId) -> std::io::Result<bool> {
        let (signature, ref_type_tag, thread) = {
            let mut heap = self.state.heap.lock().await;
            let thread = heap.threads.keys().min().copied().unwrap_or(0);
            let Some(class) = heap.classes.get_mut(&class_id) else {
                return Ok(false);
            };
            class.prepared = true;
            (class.signature.clone(), class.ref_type_tag, thread)
        };
        let class_name = super::codec::signature_to_class_name(&signature);

        let matching: Vec<MockEventRequest> = self
            .state
            .event_requests
            .lock()
            .await
            .iter()
            .filter(|req| req.event_kind == EVENT_KIND_CLASS_PREPARE)
            .filter(|req| {
                req.modifiers.iter().all(|m| match m {
                    MockEventRequestModifier::ClassMatch { pattern } => {
                        class_pattern_matches(pattern, &class_name)
                    }
                    _ => true,
                })
            })
            .cloned()
            .collect();
        if matching.is_empty() {
            return Ok(false);
        }

        let sizes = self.state.config.id_sizes;
        for req in matching {
            let mut w = JdwpWriter::new();
            w.write_u8(req.suspend_policy);
            w.write_u32(1);
            w.write_u8(EVENT_KIND_CLASS_PREPARE);
            w.write_i32(req.request_id);
            w.write_object_id(thread, &sizes);
            w.write_u8(ref_type_tag);
            w.write_reference_type_id(class_id, &sizes);
            w.write_string(&signature);
            w.write_u32(7);
            self.send_event(w.into_vec()).await?;
        }
        Ok(true)
    }

    /// Emits one composite packet holding a `Breakpoint` event for every
    /// breakpoint request registered at `location`.
    pub async fn fire_breakpoint(
        &self,
        thread: ThreadId,
        location: Location,
    ) -> std::io::Result<bool> {
        let matching: Vec<MockEventRequest> = self
            .state
            .event_requests
            .lock()
            .await
            .iter()
            .filter(|req| req.event_kind == EVENT_KIND_BREAKPOINT)
            .filter(|req| {
                req.modifiers.iter().any(|m| {
                    matches!(m, MockEventRequestModifier::LocationOnly { location: l } if *l == location)
                })
            })
            .cloned()
            .collect();
        if matching.is_empty() {
            return Ok(false);
        }

        let suspend_policy = matching
            .iter()
            .map(|req| req.suspend_policy)
            .max()
            .unwrap_or(SUSPEND_POLICY_NONE);
        let sizes = self.state.config.id_sizes;
        let mut w = JdwpWriter::new();
        w.write_u8(suspend_policy);
        w.write_u32(matching.len() as u32);
        for req in &matching {
            w.write_u8(EVENT_KIND_BREAKPOINT);
            w.write_i32(req.request_id);
            w.write_object_id(thread, &sizes);
            w.write_location(&location, &sizes);
        }
        self.send_event(w.into_vec()).await?;
        Ok(true)
    }

    /// Emits a `Breakpoint` event for `request_id` at `location`, whether or
    /// not that request covers it. Models stale or mismatched stops.
    pub async fn fire_breakpoint_request(
        &self,
        request_id: i32,
        thread: ThreadId,
        location: Location,
    ) -> std::io::Result<()> {
        let sizes = self.state.config.id_sizes;
        let mut w = JdwpWriter::new();
        w.write_u8(SUSPEND_POLICY_EVENT_THREAD);
        w.write_u32(1);
        w.write_u8(EVENT_KIND_BREAKPOINT);
        w.write_i32(request_id);
        w.write_object_id(thread, &sizes);
        w.write_location(&location, &sizes);
        self.send_event(w.into_vec()).await
    }

    pub async fn emit_vm_death(&self) -> std::io::Result<()> {
        let mut w = JdwpWriter::new();
        w.write_u8(SUSPEND_POLICY_NONE);
        w.write_u32(1);
        w.write_u8(EVENT_KIND_VM_DEATH);
        w.write_i32(0);
        self.send_event(w.into_vec()).await
    }

    async fn send_event(&self, payload: Vec<u8>) -> std::io::Result<()> {
        let writer = self.state.writer.lock().await.clone();
        let Some(writer) = writer else {
            return Err(std::io::Error::new(
                std::io::ErrorKind::NotConnected,
                "no debugger attached to mock JDWP server",
            ));
        };
        let packet = encode_command(self.state.alloc_packet_id(), command::EVENT_COMPOSITE, &payload);
        let mut guard = writer.lock().await;
        guard.write_all(&packet).await
    }
}

/// Snapshot of server bookkeeping handed to [`MockJdwpServer::wait_until`].
pub struct MockJdwpServerView<'a> {
    pub resumed_threads: &'a [ThreadId],
    pub vm_resume_calls: u32,
    pub requests: usize,
}

impl Drop for MockJdwpServer {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

impl State {
    fn alloc_request_id(&self) -> i32 {
        self.next_request_id.fetch_add(1, Ordering::Relaxed) + 1
    }

    fn alloc_packet_id(&self) -> u32 {
        // Event packets use the high half of the id space so they never collide
        // with debugger-issued command ids in traces.
        0x8000_0000 | (self.next_packet_id.fetch_add(1, Ordering::Relaxed) + 1)
    }

    fn reply_delay(&self, command_set: u8, command: u8) -> Option<Duration> {
        self.delayed_replies.get(&(command_set, command)).copied()
    }

    fn take_pin_failure(&self) -> bool {
        self.pin_failures_remaining
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |remaining| {
                remaining.checked_sub(1)
            })
            .is_ok()
    }
}

fn class_pattern_matches(pattern: &str, class_name: &str) -> bool {
    if let Some(prefix) = pattern.strip_suffix('*') {
        class_name.starts_with(prefix)
    } else if let Some(suffix) = pattern.strip_prefix('*') {
        class_name.ends_with(suffix)
    } else {
        pattern == class_name
    }
}

async fn run(
    listener: TcpListener,
    state: Arc<State>,
    shutdown: CancellationToken,
) -> std::io::Result<()> {
    tokio::select! {
        _ = shutdown.cancelled() => Ok(()),
        accept = listener.accept() => {
            let (mut socket, _) = accept?;

            // Handshake: debugger -> "JDWP-Handshake", server echoes back.
            let mut hs = [0u8; HANDSHAKE.len()];
            socket.read_exact(&mut hs).await?;
            if hs != *HANDSHAKE {
                return Ok(());
            }
            socket.write_all(HANDSHAKE).await?;

            let (mut reader, writer) = socket.into_split();
            let writer = Arc::new(Mutex::new(writer));
            *state.writer.lock().await = Some(writer.clone());

            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => return Ok(()),
                    res = read_packet(&mut reader) => {
                        let Some(packet) = res? else {
                            return Ok(());
                        };
                        handle_packet(&writer, &state, packet, shutdown.clone()).await?;
                        state.activity.notify_waiters();
                    }
                }
            }
        }
    }
}

struct Packet {
    id: u32,
    command_set: u8,
    command: u8,
    payload: Vec<u8>,
}

async fn read_packet(
    socket: &mut tokio::net::tcp::OwnedReadHalf,
) -> std::io::Result<Option<Packet>> {
    let mut header = [0u8; HEADER_LEN];
    match socket.read_exact(&mut header).await {
        Ok(_n) => {}
        Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(err) => return Err(err),
    }

    let length = u32::from_be_bytes([header[0], header[1], header[2], header[3]]) as usize;
    if length < HEADER_LEN {
        return Ok(None);
    }
    let id = u32::from_be_bytes([header[4], header[5], header[6], header[7]]);
    let flags = header[8];
    if flags != 0 {
        // The mock only expects commands from the debugger.
        return Ok(None);
    }
    let command_set = header[9];
    let command = header[10];
    let mut payload = vec![0u8; length - HEADER_LEN];
    socket.read_exact(&mut payload).await?;
    Ok(Some(Packet {
        id,
        command_set,
        command,
        payload,
    }))
}

type Handled = std::result::Result<(u16, Vec<u8>), super::types::JdwpError>;

async fn handle_packet(
    writer: &Arc<Mutex<OwnedWriteHalf>>,
    state: &State,
    packet: Packet,
    shutdown: CancellationToken,
) -> std::io::Result<()> {
    let scripted = state
        .failed_replies
        .get(&(packet.command_set, packet.command))
        .copied();
    let (error_code, payload) = match scripted {
        Some(error_code) => (error_code, Vec::new()),
        None => match dispatch(state, &packet).await {
            Ok(reply) => reply,
            // Malformed request: answer with a generic error like a real VM would.
            Err(_) => (ERROR_NOT_IMPLEMENTED, Vec::new()),
        },
    };
    let reply = encode_reply(packet.id, error_code, &payload);

    match state.reply_delay(packet.command_set, packet.command) {
        Some(delay) if !delay.is_zero() => {
            let writer = writer.clone();
            tokio::spawn(async move {
                tokio::select! {
                    _ = shutdown.cancelled() => {}
                    _ = tokio::time::sleep(delay) => {
                        let mut guard = writer.lock().await;
                        let _ = guard.write_all(&reply).await;
                    }
                }
            });
            Ok(())
        }
        _ => {
            let mut guard = writer.lock().await;
            guard.write_all(&reply).await
        }
    }
}

async fn dispatch(state: &State, packet: &Packet) -> Handled {
    let sizes = &state.config.id_sizes;
    let mut r = JdwpReader::new(&packet.payload);
    let mut w = JdwpWriter::new();

    match (packet.command_set, packet.command) {
        command::VM_CLASSES_BY_SIGNATURE => {
            let signature = r.read_string()?;
            let heap = state.heap.lock().await;
            let mut matches: Vec<_> = heap
                .classes
                .iter()
                .filter(|(_, class)| class.prepared && class.signature == signature)
                .map(|(id, class)| (*id, class.ref_type_tag))
                .collect();
            matches.sort();
            w.write_u32(matches.len() as u32);
            for (id, tag) in matches {
                w.write_u8(tag);
                w.write_reference_type_id(id, sizes);
                w.write_u32(7);
            }
        }
        command::VM_DISPOSE => {
            state.dispose_calls.fetch_add(1, Ordering::Relaxed);
        }
        command::VM_ID_SIZES => {
            w.write_u32(sizes.field_id as u32);
            w.write_u32(sizes.method_id as u32);
            w.write_u32(sizes.object_id as u32);
            w.write_u32(sizes.reference_type_id as u32);
            w.write_u32(sizes.frame_id as u32);
        }
        command::VM_RESUME => {
            state.vm_resume_calls.fetch_add(1, Ordering::Relaxed);
        }
        command::VM_CREATE_STRING => {
            let value = r.read_string()?;
            let id = state.heap.lock().await.new_string(&value);
            w.write_object_id(id, sizes);
        }
        command::REFERENCE_TYPE_SIGNATURE => {
            let class_id = r.read_reference_type_id(sizes)?;
            let heap = state.heap.lock().await;
            let Some(class) = heap.classes.get(&class_id) else {
                return Ok((ERROR_INVALID_CLASS, Vec::new()));
            };
            w.write_string(&class.signature);
        }
        command::REFERENCE_TYPE_CLASS_LOADER => {
            let class_id = r.read_reference_type_id(sizes)?;
            let heap = state.heap.lock().await;
            let Some(class) = heap.classes.get(&class_id) else {
                return Ok((ERROR_INVALID_CLASS, Vec::new()));
            };
            w.write_object_id(class.loader, sizes);
        }
        command::REFERENCE_TYPE_FIELDS => {
            let class_id = r.read_reference_type_id(sizes)?;
            let heap = state.heap.lock().await;
            let Some(class) = heap.classes.get(&class_id) else {
                return Ok((ERROR_INVALID_CLASS, Vec::new()));
            };
            w.write_u32(class.fields.len() as u32);
            for field in &class.fields {
                w.write_id(field.id, sizes.field_id);
                w.write_string(&field.name);
                w.write_string(&field.signature);
                w.write_u32(field.mod_bits);
            }
        }
        command::REFERENCE_TYPE_METHODS => {
            let class_id = r.read_reference_type_id(sizes)?;
            let heap = state.heap.lock().await;
            let Some(class) = heap.classes.get(&class_id) else {
                return Ok((ERROR_INVALID_CLASS, Vec::new()));
            };
            w.write_u32(class.methods.len() as u32);
            for method in &class.methods {
                w.write_id(method.id, sizes.method_id);
                w.write_string(&method.name);
                w.write_string(&method.signature);
                w.write_u32(method.mod_bits);
            }
        }
        command::REFERENCE_TYPE_GET_VALUES => {
            let class_id = r.read_reference_type_id(sizes)?;
            let count = r.read_u32()? as usize;
            let heap = state.heap.lock().await;
            let Some(class) = heap.classes.get(&class_id) else {
                return Ok((ERROR_INVALID_CLASS, Vec::new()));
            };
            w.write_u32(count as u32);
            for _ in 0..count {
                let field_id = r.read_id(sizes.field_id)?;
                let Some(field) = class.fields.iter().find(|f| f.id == field_id) else {
                    return Ok((ERROR_INVALID_FIELDID, Vec::new()));
                };
                let value = class
                    .statics
                    .get(&field_id)
                    .copied()
                    .unwrap_or_else(|| default_value(&field.signature));
                w.write_tagged_value(&retag(&heap, value), sizes);
            }
        }
        command::REFERENCE_TYPE_SOURCE_FILE => {
            let class_id = r.read_reference_type_id(sizes)?;
            let heap = state.heap.lock().await;
            match heap.classes.get(&class_id).and_then(|c| c.source_file.as_ref()) {
                Some(file) => w.write_string(file),
                None => return Ok((ERROR_ABSENT_INFORMATION, Vec::new())),
            }
        }
        command::REFERENCE_TYPE_INTERFACES => {
            let class_id = r.read_reference_type_id(sizes)?;
            let heap = state.heap.lock().await;
            let Some(class) = heap.classes.get(&class_id) else {
                return Ok((ERROR_INVALID_CLASS, Vec::new()));
            };
            w.write_u32(class.interfaces.len() as u32);
            for interface in &class.interfaces {
                w.write_reference_type_id(*interface, sizes);
            }
        }
        command::CLASS_TYPE_SUPERCLASS => {
            let class_id = r.read_reference_type_id(sizes)?;
            let heap = state.heap.lock().await;
            let Some(class) = heap.classes.get(&class_id) else {
                return Ok((ERROR_INVALID_CLASS, Vec::new()));
            };
            w.write_reference_type_id(class.superclass, sizes);
        }
        command::CLASS_TYPE_INVOKE_METHOD => {
            let _class_id = r.read_reference_type_id(sizes)?;
            let thread = r.read_object_id(sizes)?;
            let method_id = r.read_id(sizes.method_id)?;
            let args = read_arguments(&mut r, sizes)?;
            let options = r.read_u32()?;
            return invoke(state, None, thread, method_id, args, options, false).await;
        }
        command::CLASS_TYPE_NEW_INSTANCE => {
            let class_id = r.read_reference_type_id(sizes)?;
            let thread = r.read_object_id(sizes)?;
            let method_id = r.read_id(sizes.method_id)?;
            let args = read_arguments(&mut r, sizes)?;
            let options = r.read_u32()?;
            let (code, payload) =
                invoke(state, None, thread, method_id, args, options, true).await?;
            if code != 0 {
                return Ok((code, payload));
            }
            // A constructor without a scripted body just allocates.
            let mut reply = JdwpReader::new(&payload);
            let value = reply.read_tagged_value(sizes)?;
            let (_, exception) = reply.read_tagged_object_id(sizes)?;
            let created = match value.object_id() {
                Some(id) => id,
                None if exception == 0 => state.heap.lock().await.new_object(class_id),
                None => 0,
            };
            w.write_tagged_object_id(TAG_OBJECT, created, sizes);
            w.write_tagged_object_id(TAG_OBJECT, exception, sizes);
        }
        command::METHOD_LINE_TABLE => {
            let _class_id = r.read_reference_type_id(sizes)?;
            let method_id = r.read_id(sizes.method_id)?;
            let heap = state.heap.lock().await;
            let Some(method) = heap.method(method_id) else {
                return Ok((ERROR_INVALID_METHODID, Vec::new()));
            };
            let start = method.lines.first().map(|(idx, _)| *idx).unwrap_or(0);
            let end = method.lines.last().map(|(idx, _)| *idx + 10).unwrap_or(0);
            w.write_u64(start);
            w.write_u64(end);
            w.write_u32(method.lines.len() as u32);
            for (code_index, line) in &method.lines {
                w.write_u64(*code_index);
                w.write_i32(*line);
            }
        }
        command::OBJECT_REFERENCE_TYPE => {
            let object_id = r.read_object_id(sizes)?;
            let heap = state.heap.lock().await;
            let Some(object) = heap.objects.get(&object_id) else {
                return Ok((ERROR_INVALID_OBJECT, Vec::new()));
            };
            let tag = heap
                .classes
                .get(&object.class_id)
                .map(|c| c.ref_type_tag)
                .unwrap_or(TYPE_TAG_CLASS);
            w.write_u8(tag);
            w.write_reference_type_id(object.class_id, sizes);
        }
        command::OBJECT_GET_VALUES => {
            let object_id = r.read_object_id(sizes)?;
            let count = r.read_u32()? as usize;
            let heap = state.heap.lock().await;
            let Some(object) = heap.objects.get(&object_id) else {
                return Ok((ERROR_INVALID_OBJECT, Vec::new()));
            };
            w.write_u32(count as u32);
            for _ in 0..count {
                let field_id = r.read_id(sizes.field_id)?;
                let Some(signature) = heap.field_signature(field_id) else {
                    return Ok((ERROR_INVALID_FIELDID, Vec::new()));
                };
                let value = object
                    .fields
                    .get(&field_id)
                    .copied()
                    .unwrap_or_else(|| default_value(signature));
                w.write_tagged_value(&retag(&heap, value), sizes);
            }
        }
        command::OBJECT_INVOKE_METHOD => {
            let object_id = r.read_object_id(sizes)?;
            let thread = r.read_object_id(sizes)?;
            let _class_id = r.read_reference_type_id(sizes)?;
            let method_id = r.read_id(sizes.method_id)?;
            let args = read_arguments(&mut r, sizes)?;
            let options = r.read_u32()?;
            if !state.heap.lock().await.objects.contains_key(&object_id) {
                return Ok((ERROR_INVALID_OBJECT, Vec::new()));
            }
            return invoke(state, Some(object_id), thread, method_id, args, options, false).await;
        }
        command::OBJECT_DISABLE_COLLECTION => {
            let object_id = r.read_object_id(sizes)?;
            if state.take_pin_failure() || !state.heap.lock().await.objects.contains_key(&object_id) {
                return Ok((ERROR_INVALID_OBJECT, Vec::new()));
            }
            state.pinned_object_ids.lock().await.insert(object_id);
        }
        command::OBJECT_ENABLE_COLLECTION => {
            let object_id = r.read_object_id(sizes)?;
            state.pinned_object_ids.lock().await.remove(&object_id);
        }
        command::STRING_VALUE => {
            let object_id = r.read_object_id(sizes)?;
            let heap = state.heap.lock().await;
            match heap.objects.get(&object_id).map(|o| &o.kind) {
                Some(MockObjectKind::Str(value)) => w.write_string(value),
                _ => return Ok((ERROR_INVALID_OBJECT, Vec::new())),
            }
        }
        command::THREAD_NAME => {
            let thread = r.read_object_id(sizes)?;
            let heap = state.heap.lock().await;
            let Some(t) = heap.threads.get(&thread) else {
                return Ok((ERROR_INVALID_THREAD, Vec::new()));
            };
            w.write_string(&t.name);
        }
        command::THREAD_RESUME => {
            let thread = r.read_object_id(sizes)?;
            state.resumed_threads.lock().await.push(thread);
        }
        command::THREAD_FRAMES => {
            let thread = r.read_object_id(sizes)?;
            let start = r.read_i32()?.max(0) as usize;
            let length = r.read_i32()?;
            let heap = state.heap.lock().await;
            let Some(t) = heap.threads.get(&thread) else {
                return Ok((ERROR_INVALID_THREAD, Vec::new()));
            };
            let available = t.frames.len().saturating_sub(start);
            let take = if length < 0 {
                available
            } else {
                (length as usize).min(available)
            };
            w.write_u32(take as u32);
            for (frame_id, frame) in t.frames.iter().skip(start).take(take) {
                w.write_id(*frame_id, sizes.frame_id);
                w.write_location(&frame.location, sizes);
            }
        }
        command::ARRAY_LENGTH => {
            let array_id = r.read_object_id(sizes)?;
            let heap = state.heap.lock().await;
            match heap.objects.get(&array_id).map(|o| &o.kind) {
                Some(MockObjectKind::Array(values)) => w.write_i32(values.len() as i32),
                _ => return Ok((ERROR_INVALID_OBJECT, Vec::new())),
            }
        }
        command::ARRAY_GET_VALUES => {
            let array_id = r.read_object_id(sizes)?;
            let first = r.read_i32()?.max(0) as usize;
            let length = r.read_i32()?.max(0) as usize;
            let heap = state.heap.lock().await;
            let Some(MockObjectKind::Array(values)) = heap.objects.get(&array_id).map(|o| &o.kind)
            else {
                return Ok((ERROR_INVALID_OBJECT, Vec::new()));
            };
            let slice: Vec<JdwpValue> = values.iter().skip(first).take(length).copied().collect();
            w.write_u8(TAG_OBJECT);
            w.write_u32(slice.len() as u32);
            for value in slice {
                w.write_tagged_value(&retag(&heap, value), sizes);
            }
        }
        command::EVENT_REQUEST_SET => {
            let event_kind = r.read_u8()?;
            let suspend_policy = r.read_u8()?;
            let modifier_count = r.read_u32()? as usize;
            let mut modifiers = Vec::with_capacity(modifier_count);
            for _ in 0..modifier_count {
                let kind = r.read_u8()?;
                let modifier = match kind {
                    EVENT_MODIFIER_KIND_CLASS_MATCH => MockEventRequestModifier::ClassMatch {
                        pattern: r.read_string()?,
                    },
                    EVENT_MODIFIER_KIND_LOCATION_ONLY => MockEventRequestModifier::LocationOnly {
                        location: r.read_location(sizes)?,
                    },
                    _ => return Ok((ERROR_NOT_IMPLEMENTED, Vec::new())),
                };
                modifiers.push(modifier);
            }
            let request_id = state.alloc_request_id();
            state.event_requests.lock().await.push(MockEventRequest {
                event_kind,
                suspend_policy,
                request_id,
                modifiers,
            });
            w.write_i32(request_id);
        }
        command::EVENT_REQUEST_CLEAR => {
            let event_kind = r.read_u8()?;
            let request_id = r.read_i32()?;
            state
                .event_requests
                .lock()
                .await
                .retain(|req| !(req.event_kind == event_kind && req.request_id == request_id));
            state
                .cleared_requests
                .lock()
                .await
                .push((event_kind, request_id));
        }
        command::FRAME_GET_VALUES => {
            let thread = r.read_object_id(sizes)?;
            let frame_id = r.read_id(sizes.frame_id)?;
            let count = r.read_u32()? as usize;
            let heap = state.heap.lock().await;
            let Some(frame) = heap.frame(thread, frame_id) else {
                return Ok((ERROR_INVALID_FRAMEID, Vec::new()));
            };
            w.write_u32(count as u32);
            for _ in 0..count {
                let slot = r.read_u32()?;
                let tag = r.read_u8()?;
                let value = frame
                    .locals
                    .iter()
                    .find(|(s, _)| *s == slot)
                    .map(|(_, v)| *v)
                    .unwrap_or(JdwpValue::Object { tag, id: 0 });
                w.write_tagged_value(&retag(&heap, value), sizes);
            }
        }
        command::FRAME_THIS_OBJECT => {
            let thread = r.read_object_id(sizes)?;
            let frame_id = r.read_id(sizes.frame_id)?;
            let heap = state.heap.lock().await;
            let Some(frame) = heap.frame(thread, frame_id) else {
                return Ok((ERROR_INVALID_FRAMEID, Vec::new()));
            };
            let tag = heap.tag_of(frame.this_object);
            w.write_tagged_object_id(tag, frame.this_object, sizes);
        }
        _ => return Ok((ERROR_NOT_IMPLEMENTED, Vec::new())),
    }

    Ok((0, w.into_vec()))
}

fn read_arguments(
    r: &mut JdwpReader<'_>,
    sizes: &JdwpIdSizes,
) -> std::result::Result<Vec<JdwpValue>, super::types::JdwpError> {
    let count = r.read_u32()? as usize;
    let mut args = Vec::with_capacity(count);
    for _ in 0..count {
        args.push(r.read_tagged_value(sizes)?);
    }
    Ok(args)
}

/// Gives object values the tag a real VM would report for their runtime type.
fn retag(heap: &MockHeap, value: JdwpValue) -> JdwpValue {
    match value {
        JdwpValue::Object { id, .. } if id != 0 => {
            let tag = if heap
                .objects
                .get(&id)
                .and_then(|o| heap.classes.get(&o.class_id))
                .is_some_and(|c| c.signature.ends_with("ClassLoader;"))
            {
                TAG_CLASS_LOADER
            } else {
                heap.tag_of(id)
            };
            JdwpValue::Object { tag, id }
        }
        other => other,
    }
}

async fn invoke(
    state: &State,
    receiver: Option<ObjectId>,
    thread: ThreadId,
    method_id: MethodId,
    args: Vec<JdwpValue>,
    options: u32,
    constructor: bool,
) -> Handled {
    let sizes = &state.config.id_sizes;
    let (handler, call, method_name, return_signature) = {
        let heap = state.heap.lock().await;
        if !heap.threads.contains_key(&thread) {
            return Ok((ERROR_INVALID_THREAD, Vec::new()));
        }
        let Some(method) = heap.method(method_id) else {
            return Ok((ERROR_INVALID_METHODID, Vec::new()));
        };
        let string_args = args.iter().map(|a| heap.string_of(a)).collect();
        let return_signature = method
            .signature
            .rsplit_once(')')
            .map(|(_, ret)| ret.to_string())
            .unwrap_or_default();
        (
            heap.handlers.get(&method_id).cloned(),
            MockCall {
                receiver,
                thread,
                args,
                string_args,
                options,
            },
            method.name.clone(),
            return_signature,
        )
    };

    state.invocations.lock().await.push(MockInvocation {
        receiver,
        method_id,
        method_name,
        options,
    });

    let reply = match handler {
        Some(handler) => handler(&call),
        None if constructor => MockReply::Value(JdwpValue::NULL),
        None => MockReply::Value(default_value(&return_signature)),
    };

    let mut w = JdwpWriter::new();
    match reply {
        MockReply::Value(value) => {
            let heap = state.heap.lock().await;
            w.write_tagged_value(&retag(&heap, value), sizes);
            w.write_tagged_object_id(TAG_OBJECT, 0, sizes);
        }
        MockReply::Str(value) => {
            let id = state.heap.lock().await.new_string(&value);
            w.write_tagged_object_id(TAG_STRING, id, sizes);
            w.write_tagged_object_id(TAG_OBJECT, 0, sizes);
        }
        MockReply::Throw(exception) => {
            w.write_tagged_value(&default_value(&return_signature), sizes);
            w.write_tagged_object_id(TAG_OBJECT, exception, sizes);
        }
        MockReply::Error(code) => return Ok((code, Vec::new())),
    }
    Ok((0, w.into_vec()))
}
