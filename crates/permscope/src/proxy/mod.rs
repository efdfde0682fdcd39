//! Typed access to remote objects over JDWP.
//!
//! [`RemoteProxy`] marshals arguments into the target, unwraps results into
//! local values and caches what it learns about remote classes for the whole
//! session. Strings passed as arguments are created in the target and pinned
//! for the duration of the call.

mod cache;
mod pin;

use std::collections::HashSet;
use std::sync::Arc;

use permscope_jdwp::wire::{
    signature_to_class_name,
    types::{
        ERROR_INVALID_CLASS, INVOKE_SINGLE_THREADED, TAG_OBJECT, TAG_STRING,
    },
    FieldInfo, FrameInfo, JdwpClient, JdwpError, JdwpValue, LineTable, Location, MethodId,
    MethodInfo, ObjectId, ReferenceTypeId, ThreadId,
};

pub use cache::SharedCache;
pub(crate) use cache::TypeCache;
pub use pin::{PinScope, PIN_RETRIES};

use crate::{TraceError, TraceResult};

/// A method or constructor by name and JNI signature.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Member<'a> {
    pub name: &'a str,
    pub signature: &'a str,
}

impl<'a> Member<'a> {
    pub const fn new(name: &'a str, signature: &'a str) -> Self {
        Self { name, signature }
    }
}

/// An argument to a remote call.
#[derive(Debug, Clone, PartialEq)]
pub enum Arg {
    Bool(bool),
    Int(i32),
    Long(i64),
    /// Materialized in the target with `VirtualMachine.CreateString`.
    Str(String),
    Ref(ObjectId),
    Null,
}

impl Arg {
    pub fn str(value: impl Into<String>) -> Self {
        Arg::Str(value.into())
    }

    /// A reference argument; `0` becomes `null`.
    pub fn object(id: ObjectId) -> Self {
        if id == 0 {
            Arg::Null
        } else {
            Arg::Ref(id)
        }
    }
}

/// Opaque handle to a remote object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RemoteRef {
    pub id: ObjectId,
    pub tag: u8,
}

/// A remote value brought to this side.
#[derive(Debug, Clone, PartialEq)]
pub enum Unwrapped {
    Void,
    Null,
    Bool(bool),
    Char(u16),
    /// Every integral primitive, widened.
    Int(i64),
    Float(f64),
    Str(String),
    Ref(RemoteRef),
}

impl Unwrapped {
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Unwrapped::Bool(value) => Some(*value),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Unwrapped::Str(value) => Some(value),
            _ => None,
        }
    }

    pub fn into_string(self) -> Option<String> {
        match self {
            Unwrapped::Str(value) => Some(value),
            _ => None,
        }
    }

    pub fn as_object(&self) -> Option<ObjectId> {
        match self {
            Unwrapped::Ref(r) => Some(r.id),
            _ => None,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Unwrapped::Null)
    }
}

enum CallTarget {
    Instance {
        object: ObjectId,
        class_id: ReferenceTypeId,
    },
    Static {
        class_id: ReferenceTypeId,
    },
}

/// Session-wide remote object proxy. Cheap to clone; clones share caches.
#[derive(Debug, Clone)]
pub struct RemoteProxy {
    jdwp: JdwpClient,
    types: Arc<TypeCache>,
    line_tables: Arc<SharedCache<(ReferenceTypeId, MethodId), Arc<LineTable>>>,
    invoke_options: u32,
}

impl RemoteProxy {
    /// `single_threaded` freezes every other target thread while an
    /// invocation runs. An invoked method that needs a lock held by another
    /// suspended thread then blocks forever.
    pub fn new(jdwp: JdwpClient, single_threaded: bool) -> Self {
        Self {
            jdwp,
            types: Arc::new(TypeCache::default()),
            line_tables: Arc::new(SharedCache::default()),
            invoke_options: if single_threaded {
                INVOKE_SINGLE_THREADED
            } else {
                0
            },
        }
    }

    pub fn jdwp(&self) -> &JdwpClient {
        &self.jdwp
    }

    pub fn invoke_options(&self) -> u32 {
        self.invoke_options
    }

    pub fn pin_scope(&self) -> PinScope {
        PinScope::new(self.jdwp.clone())
    }

    // ---- classes -------------------------------------------------------

    /// A loaded class by binary name, or `None` when it is not loaded (yet).
    pub async fn class_by_name(&self, name: &str) -> TraceResult<Option<ReferenceTypeId>> {
        if let Some(id) = self.types.classes_by_name.get(&name.to_owned()) {
            return Ok(Some(id));
        }
        let classes = self.jdwp.classes_by_name(name).await?;
        let Some(class) = classes.first() else {
            return Ok(None);
        };
        Ok(Some(
            self.types
                .classes_by_name
                .insert_if_absent(name.to_owned(), class.type_id),
        ))
    }

    pub async fn require_class(&self, name: &str) -> TraceResult<ReferenceTypeId> {
        self.class_by_name(name)
            .await?
            .ok_or_else(|| TraceError::mismatch(format!("class {name} is not loaded")))
    }

    pub async fn type_name(&self, class_id: ReferenceTypeId) -> TraceResult<String> {
        if let Some(signature) = self.types.signatures.get(&class_id) {
            return Ok(signature_to_class_name(&signature));
        }
        let signature = self.jdwp.reference_type_signature(class_id).await?;
        let signature = self.types.signatures.insert_if_absent(class_id, signature);
        Ok(signature_to_class_name(&signature))
    }

    pub async fn class_of(&self, object: ObjectId) -> TraceResult<ReferenceTypeId> {
        Ok(self.jdwp.object_reference_reference_type(object).await?)
    }

    pub async fn class_name_of(&self, object: ObjectId) -> TraceResult<String> {
        let class_id = self.class_of(object).await?;
        self.type_name(class_id).await
    }

    /// The defining loader of `class_id`; `None` for the bootstrap loader.
    pub async fn class_loader_of(&self, class_id: ReferenceTypeId) -> TraceResult<Option<ObjectId>> {
        let loader = self.jdwp.reference_type_class_loader(class_id).await?;
        Ok((loader != 0).then_some(loader))
    }

    async fn superclass(&self, class_id: ReferenceTypeId) -> TraceResult<ReferenceTypeId> {
        if let Some(superclass) = self.types.superclasses.get(&class_id) {
            return Ok(superclass);
        }
        let superclass = match self.jdwp.class_type_superclass(class_id).await {
            Ok(superclass) => superclass,
            // Interfaces are not `ClassType`s.
            Err(JdwpError::VmError(ERROR_INVALID_CLASS)) => 0,
            Err(err) => return Err(err.into()),
        };
        Ok(self.types.superclasses.insert_if_absent(class_id, superclass))
    }

    async fn interfaces(&self, class_id: ReferenceTypeId) -> TraceResult<Arc<[ReferenceTypeId]>> {
        if let Some(interfaces) = self.types.interfaces.get(&class_id) {
            return Ok(interfaces);
        }
        let interfaces: Arc<[ReferenceTypeId]> =
            self.jdwp.reference_type_interfaces(class_id).await?.into();
        Ok(self.types.interfaces.insert_if_absent(class_id, interfaces))
    }

    async fn fields_of(&self, class_id: ReferenceTypeId) -> TraceResult<Arc<[FieldInfo]>> {
        if let Some(fields) = self.types.fields.get(&class_id) {
            return Ok(fields);
        }
        let fields: Arc<[FieldInfo]> = self.jdwp.reference_type_fields(class_id).await?.into();
        Ok(self.types.fields.insert_if_absent(class_id, fields))
    }

    async fn methods_of(&self, class_id: ReferenceTypeId) -> TraceResult<Arc<[MethodInfo]>> {
        if let Some(methods) = self.types.methods.get(&class_id) {
            return Ok(methods);
        }
        let methods: Arc<[MethodInfo]> = self.jdwp.reference_type_methods(class_id).await?.into();
        Ok(self.types.methods.insert_if_absent(class_id, methods))
    }

    /// Declared methods of `class_id` itself, not inherited ones.
    pub async fn declared_methods(&self, class_id: ReferenceTypeId) -> TraceResult<Arc<[MethodInfo]>> {
        self.methods_of(class_id).await
    }

    /// Whether `class_id` is `target` or inherits from / implements it.
    pub async fn is_assignable(&self, class_id: ReferenceTypeId, target: &str) -> TraceResult<bool> {
        let key = (class_id, target.to_owned());
        if let Some(known) = self.types.assignable.get(&key) {
            return Ok(known);
        }

        let mut pending = vec![class_id];
        let mut seen = HashSet::new();
        let mut found = false;
        while let Some(current) = pending.pop() {
            if current == 0 || !seen.insert(current) {
                continue;
            }
            if self.type_name(current).await? == target {
                found = true;
                break;
            }
            pending.push(self.superclass(current).await?);
            pending.extend(self.interfaces(current).await?.iter().copied());
        }
        Ok(self.types.assignable.insert_if_absent(key, found))
    }

    pub async fn is_instance_of(&self, object: ObjectId, target: &str) -> TraceResult<bool> {
        if object == 0 {
            return Ok(false);
        }
        let class_id = self.class_of(object).await?;
        self.is_assignable(class_id, target).await
    }

    // ---- member lookup -------------------------------------------------

    /// Finds a field on `class_id` or one of its superclasses.
    pub async fn lookup_field(
        &self,
        class_id: ReferenceTypeId,
        name: &str,
    ) -> TraceResult<Option<FieldInfo>> {
        let mut current = class_id;
        while current != 0 {
            if let Some(field) = self.fields_of(current).await?.iter().find(|f| f.name == name) {
                return Ok(Some(field.clone()));
            }
            current = self.superclass(current).await?;
        }
        Ok(None)
    }

    /// Finds a method matching `accept` on `class_id`, its superclasses, or
    /// (for default methods) its interfaces. Returns the declaring type too.
    pub async fn lookup_method<P>(
        &self,
        class_id: ReferenceTypeId,
        accept: P,
    ) -> TraceResult<Option<(ReferenceTypeId, MethodInfo)>>
    where
        P: Fn(&MethodInfo) -> bool,
    {
        let mut interfaces = Vec::new();
        let mut current = class_id;
        while current != 0 {
            if let Some(method) = self.methods_of(current).await?.iter().find(|m| accept(m)) {
                return Ok(Some((current, method.clone())));
            }
            interfaces.extend(self.interfaces(current).await?.iter().copied());
            current = self.superclass(current).await?;
        }

        let mut seen = HashSet::new();
        while let Some(interface) = interfaces.pop() {
            if !seen.insert(interface) {
                continue;
            }
            if let Some(method) = self.methods_of(interface).await?.iter().find(|m| accept(m)) {
                return Ok(Some((interface, method.clone())));
            }
            interfaces.extend(self.interfaces(interface).await?.iter().copied());
        }
        Ok(None)
    }

    async fn require_method(
        &self,
        class_id: ReferenceTypeId,
        member: Member<'_>,
    ) -> TraceResult<(ReferenceTypeId, MethodInfo)> {
        match self
            .lookup_method(class_id, |m| m.name == member.name && m.signature == member.signature)
            .await?
        {
            Some(found) => Ok(found),
            None => Err(TraceError::mismatch(format!(
                "{}{} not found on {}",
                member.name,
                member.signature,
                self.type_name(class_id).await?
            ))),
        }
    }

    /// The method a location points into.
    pub async fn method_at(&self, location: &Location) -> TraceResult<MethodInfo> {
        let methods = self.methods_of(location.class_id).await?;
        match methods.iter().find(|m| m.method_id == location.method_id) {
            Some(method) => Ok(method.clone()),
            None => Err(TraceError::mismatch(format!(
                "method {:#x} not declared by {}",
                location.method_id,
                self.type_name(location.class_id).await?
            ))),
        }
    }

    pub async fn line_table(
        &self,
        class_id: ReferenceTypeId,
        method_id: MethodId,
    ) -> TraceResult<Arc<LineTable>> {
        if let Some(table) = self.line_tables.get(&(class_id, method_id)) {
            return Ok(table);
        }
        let table = Arc::new(self.jdwp.method_line_table(class_id, method_id).await?);
        Ok(self.line_tables.insert_if_absent((class_id, method_id), table))
    }

    // ---- fields --------------------------------------------------------

    /// Reads an instance field; a missing field is a layout mismatch.
    pub async fn get_field(&self, object: ObjectId, name: &str) -> TraceResult<Unwrapped> {
        match self.probe_field(object, name).await? {
            Some(value) => Ok(value),
            None => Err(TraceError::mismatch(format!(
                "field {name} not found on {}",
                self.class_name_of(object).await?
            ))),
        }
    }

    /// Reads an instance field if the object's class has one by that name.
    pub async fn probe_field(&self, object: ObjectId, name: &str) -> TraceResult<Option<Unwrapped>> {
        let class_id = self.class_of(object).await?;
        let Some(field) = self.lookup_field(class_id, name).await? else {
            return Ok(None);
        };
        let values = self
            .jdwp
            .object_reference_get_values(object, &[field.field_id])
            .await?;
        let value = values.into_iter().next().unwrap_or(JdwpValue::NULL);
        Ok(Some(self.unwrap_value(value).await?))
    }

    pub async fn get_static_field(
        &self,
        class_id: ReferenceTypeId,
        name: &str,
    ) -> TraceResult<Unwrapped> {
        let Some(field) = self.lookup_field(class_id, name).await? else {
            return Err(TraceError::mismatch(format!(
                "static field {name} not found on {}",
                self.type_name(class_id).await?
            )));
        };
        let values = self
            .jdwp
            .reference_type_get_values(class_id, &[field.field_id])
            .await?;
        let value = values.into_iter().next().unwrap_or(JdwpValue::NULL);
        self.unwrap_value(value).await
    }

    // ---- invocation ----------------------------------------------------

    pub async fn invoke(
        &self,
        thread: ThreadId,
        object: ObjectId,
        member: Member<'_>,
        args: &[Arg],
    ) -> TraceResult<Unwrapped> {
        let class_id = self.class_of(object).await?;
        let (_, method) = self.require_method(class_id, member).await?;
        self.call(CallTarget::Instance { object, class_id }, thread, method.method_id, args)
            .await
    }

    /// Calls a zero-argument instance method by name, if the object has one.
    pub async fn probe_getter(
        &self,
        thread: ThreadId,
        object: ObjectId,
        name: &str,
    ) -> TraceResult<Option<Unwrapped>> {
        let class_id = self.class_of(object).await?;
        let found = self
            .lookup_method(class_id, |m| {
                m.name == name && m.signature.starts_with("()") && !m.is_static()
            })
            .await?;
        let Some((_, method)) = found else {
            return Ok(None);
        };
        let value = self
            .call(CallTarget::Instance { object, class_id }, thread, method.method_id, &[])
            .await?;
        Ok(Some(value))
    }

    pub async fn invoke_static(
        &self,
        thread: ThreadId,
        class_id: ReferenceTypeId,
        member: Member<'_>,
        args: &[Arg],
    ) -> TraceResult<Unwrapped> {
        let (declaring, method) = self.require_method(class_id, member).await?;
        self.call(CallTarget::Static { class_id: declaring }, thread, method.method_id, args)
            .await
    }

    /// Runs a constructor and pins the new object in `scope`.
    pub async fn new_instance(
        &self,
        scope: &mut PinScope,
        thread: ThreadId,
        class_id: ReferenceTypeId,
        signature: &str,
        args: &[Arg],
    ) -> TraceResult<ObjectId> {
        let methods = self.methods_of(class_id).await?;
        let Some(ctor) = methods
            .iter()
            .find(|m| m.name == "<init>" && m.signature == signature)
        else {
            return Err(TraceError::mismatch(format!(
                "constructor {signature} not found on {}",
                self.type_name(class_id).await?
            )));
        };
        let method_id = ctor.method_id;

        let mut arg_pins = self.pin_scope();
        let values = match self.materialize(&mut arg_pins, args).await {
            Ok(values) => values,
            Err(err) => {
                release_quietly(arg_pins).await;
                return Err(err);
            }
        };

        let this = self;
        let values_ref = &values;
        let created = scope
            .acquire(move || async move {
                let result = this
                    .jdwp
                    .class_type_new_instance(
                        class_id,
                        thread,
                        method_id,
                        values_ref,
                        this.invoke_options,
                    )
                    .await?;
                if result.exception != 0 {
                    return Err(this.classify_exception(result.exception).await);
                }
                Ok::<_, TraceError>(result.value.object_id().unwrap_or(0))
            })
            .await;
        release_quietly(arg_pins).await;
        created
    }

    async fn call(
        &self,
        target: CallTarget,
        thread: ThreadId,
        method_id: MethodId,
        args: &[Arg],
    ) -> TraceResult<Unwrapped> {
        let mut pins = self.pin_scope();
        let values = match self.materialize(&mut pins, args).await {
            Ok(values) => values,
            Err(err) => {
                release_quietly(pins).await;
                return Err(err);
            }
        };

        let result = match target {
            CallTarget::Instance { object, class_id } => {
                self.jdwp
                    .object_reference_invoke_method(
                        object,
                        thread,
                        class_id,
                        method_id,
                        &values,
                        self.invoke_options,
                    )
                    .await
            }
            CallTarget::Static { class_id } => {
                self.jdwp
                    .class_type_invoke_method(
                        class_id,
                        thread,
                        method_id,
                        &values,
                        self.invoke_options,
                    )
                    .await
            }
        };
        release_quietly(pins).await;

        let result = result?;
        if result.exception != 0 {
            return Err(self.classify_exception(result.exception).await);
        }
        self.unwrap_value(result.value).await
    }

    async fn materialize(&self, pins: &mut PinScope, args: &[Arg]) -> TraceResult<Vec<JdwpValue>> {
        let mut values = Vec::with_capacity(args.len());
        for arg in args {
            let value = match arg {
                Arg::Bool(v) => JdwpValue::Boolean(*v),
                Arg::Int(v) => JdwpValue::Int(*v),
                Arg::Long(v) => JdwpValue::Long(*v),
                Arg::Ref(id) => JdwpValue::Object {
                    tag: TAG_OBJECT,
                    id: *id,
                },
                Arg::Null => JdwpValue::NULL,
                Arg::Str(text) => {
                    let jdwp = &self.jdwp;
                    let text = text.as_str();
                    let id = pins
                        .acquire(move || async move {
                            jdwp.create_string(text).await.map_err(TraceError::from)
                        })
                        .await?;
                    JdwpValue::Object {
                        tag: TAG_STRING,
                        id,
                    }
                }
            };
            values.push(value);
        }
        Ok(values)
    }

    async fn classify_exception(&self, exception: ObjectId) -> TraceError {
        let class_id = match self.class_of(exception).await {
            Ok(class_id) => class_id,
            Err(err) => return err,
        };
        let class_name = match self.type_name(class_id).await {
            Ok(name) => name,
            Err(err) => return err,
        };
        for fatal in ["java.lang.VirtualMachineError", "java.lang.ThreadDeath"] {
            match self.is_assignable(class_id, fatal).await {
                Ok(true) => return TraceError::VmFatal { class_name },
                Ok(false) => {}
                Err(err) => return err,
            }
        }
        TraceError::RemoteException {
            class_name,
            exception,
        }
    }

    pub async fn unwrap_value(&self, value: JdwpValue) -> TraceResult<Unwrapped> {
        Ok(match value {
            JdwpValue::Void => Unwrapped::Void,
            JdwpValue::Boolean(v) => Unwrapped::Bool(v),
            JdwpValue::Byte(v) => Unwrapped::Int(v.into()),
            JdwpValue::Short(v) => Unwrapped::Int(v.into()),
            JdwpValue::Int(v) => Unwrapped::Int(v.into()),
            JdwpValue::Long(v) => Unwrapped::Int(v),
            JdwpValue::Char(v) => Unwrapped::Char(v),
            JdwpValue::Float(v) => Unwrapped::Float(v.into()),
            JdwpValue::Double(v) => Unwrapped::Float(v),
            JdwpValue::Object { id: 0, .. } => Unwrapped::Null,
            JdwpValue::Object { tag: TAG_STRING, id } => {
                Unwrapped::Str(self.jdwp.string_reference_value(id).await?)
            }
            JdwpValue::Object { tag, id } => Unwrapped::Ref(RemoteRef { id, tag }),
        })
    }

    // ---- arrays, strings, frames --------------------------------------

    pub async fn array_values(&self, array: ObjectId) -> TraceResult<Vec<JdwpValue>> {
        let length = self.jdwp.array_reference_length(array).await?;
        if length <= 0 {
            return Ok(Vec::new());
        }
        Ok(self.jdwp.array_reference_get_values(array, 0, length).await?)
    }

    pub async fn string_value(&self, string: ObjectId) -> TraceResult<String> {
        Ok(self.jdwp.string_reference_value(string).await?)
    }

    /// All frames of a suspended thread, innermost first.
    pub async fn frames(&self, thread: ThreadId) -> TraceResult<Vec<FrameInfo>> {
        Ok(self.jdwp.frames(thread, 0, -1).await?)
    }

    pub async fn this_object(&self, thread: ThreadId, frame: &FrameInfo) -> TraceResult<Option<ObjectId>> {
        Ok(self
            .jdwp
            .stack_frame_this_object(thread, frame.frame_id)
            .await?)
    }

    /// Reads the `index`th declared parameter of the method executing in `frame`.
    pub async fn frame_argument(
        &self,
        thread: ThreadId,
        frame: &FrameInfo,
        index: usize,
    ) -> TraceResult<JdwpValue> {
        let method = self.method_at(&frame.location).await?;
        let params = parameter_signatures(&method.signature);
        let Some(signature) = params.get(index) else {
            return Err(TraceError::mismatch(format!(
                "{}{} has no parameter {index}",
                method.name, method.signature
            )));
        };
        let first_slot = if method.is_static() { 0 } else { 1 };
        let slot = first_slot
            + params[..index]
                .iter()
                .map(|p| if matches!(p.as_str(), "J" | "D") { 2 } else { 1 })
                .sum::<u32>();
        let values = self
            .jdwp
            .stack_frame_get_values(thread, frame.frame_id, &[(slot, signature.clone())])
            .await?;
        Ok(values.into_iter().next().unwrap_or(JdwpValue::NULL))
    }

    /// `pkg.Class.method(File.java:line)`, as a stack trace would print it.
    pub async fn describe_location(&self, location: &Location) -> TraceResult<String> {
        let class_name = self.type_name(location.class_id).await?;
        let method = self.method_at(location).await?;
        let source = self.source_file(location.class_id).await?;
        let line = match self.line_table(location.class_id, location.method_id).await {
            Ok(table) => table
                .lines
                .iter()
                .filter(|entry| entry.code_index <= location.index)
                .max_by_key(|entry| entry.code_index)
                .map(|entry| entry.line),
            Err(TraceError::Jdwp(JdwpError::VmError(_))) => None,
            Err(err) => return Err(err),
        };
        Ok(match (source, line) {
            (Some(file), Some(line)) => format!("{class_name}.{}({file}:{line})", method.name),
            (Some(file), None) => format!("{class_name}.{}({file})", method.name),
            (None, _) => format!("{class_name}.{}(Unknown Source)", method.name),
        })
    }

    async fn source_file(&self, class_id: ReferenceTypeId) -> TraceResult<Option<String>> {
        if let Some(file) = self.types.source_files.get(&class_id) {
            return Ok(file);
        }
        let file = match self.jdwp.reference_type_source_file(class_id).await {
            Ok(file) => Some(file),
            Err(JdwpError::VmError(_)) => None,
            Err(err) => return Err(err.into()),
        };
        Ok(self.types.source_files.insert_if_absent(class_id, file))
    }
}

async fn release_quietly(pins: PinScope) {
    if let Err(err) = pins.release().await {
        tracing::debug!(target = "permscope.proxy", error = %err, "failed to release pinned arguments");
    }
}

/// Splits a method signature's parameter list into field signatures.
pub fn parameter_signatures(signature: &str) -> Vec<String> {
    let params = signature
        .strip_prefix('(')
        .and_then(|rest| rest.split_once(')'))
        .map(|(params, _)| params)
        .unwrap_or("");

    let bytes = params.as_bytes();
    let mut out = Vec::new();
    let mut start = 0;
    let mut idx = 0;
    while idx < bytes.len() {
        match bytes[idx] {
            b'[' => {
                idx += 1;
                continue;
            }
            b'L' => {
                idx = params[idx..].find(';').map_or(bytes.len(), |end| idx + end + 1);
            }
            _ => idx += 1,
        }
        out.push(params[start..idx].to_owned());
        start = idx;
    }
    out
}
