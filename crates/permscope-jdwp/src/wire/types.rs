use std::io;

use thiserror::Error;

pub type ObjectId = u64;
pub type ThreadId = ObjectId;
pub type ReferenceTypeId = u64;
pub type MethodId = u64;
pub type FieldId = u64;
pub type FrameId = u64;

pub type Result<T> = std::result::Result<T, JdwpError>;

/// JDWP `Error.INVALID_OBJECT` (the object has already been garbage collected).
pub const ERROR_INVALID_OBJECT: u16 = 20;
/// JDWP `Error.INVALID_CLASS`.
pub const ERROR_INVALID_CLASS: u16 = 21;
/// JDWP `Error.THREAD_NOT_SUSPENDED`.
pub const ERROR_THREAD_NOT_SUSPENDED: u16 = 13;
/// JDWP `Error.VM_DEAD`.
pub const ERROR_VM_DEAD: u16 = 112;

pub const EVENT_KIND_BREAKPOINT: u8 = 2;
pub const EVENT_KIND_CLASS_PREPARE: u8 = 8;
pub const EVENT_KIND_VM_START: u8 = 90;
pub const EVENT_KIND_VM_DEATH: u8 = 99;

pub const EVENT_MODIFIER_KIND_CLASS_MATCH: u8 = 5;
pub const EVENT_MODIFIER_KIND_LOCATION_ONLY: u8 = 7;

pub const SUSPEND_POLICY_NONE: u8 = 0;
pub const SUSPEND_POLICY_EVENT_THREAD: u8 = 1;
pub const SUSPEND_POLICY_ALL: u8 = 2;

/// `InvokeOptions.INVOKE_SINGLE_THREADED`: only the invoking thread is resumed
/// for the duration of the call.
pub const INVOKE_SINGLE_THREADED: u32 = 0x01;
/// `InvokeOptions.INVOKE_NONVIRTUAL`.
pub const INVOKE_NONVIRTUAL: u32 = 0x02;

pub const TYPE_TAG_CLASS: u8 = 1;
pub const TYPE_TAG_INTERFACE: u8 = 2;
pub const TYPE_TAG_ARRAY: u8 = 3;

pub const TAG_ARRAY: u8 = b'[';
pub const TAG_OBJECT: u8 = b'L';
pub const TAG_STRING: u8 = b's';
pub const TAG_THREAD: u8 = b't';
pub const TAG_CLASS_LOADER: u8 = b'l';
pub const TAG_CLASS_OBJECT: u8 = b'c';

/// `Field`/`Method` modifier bit for `static` members.
pub const MODIFIER_STATIC: u32 = 0x0008;

#[derive(Debug, Error)]
pub enum JdwpError {
    #[error(transparent)]
    Io(#[from] io::Error),

    #[error("JDWP protocol error: {0}")]
    Protocol(String),

    #[error("timed out waiting for JDWP reply")]
    Timeout,

    #[error("JDWP request cancelled")]
    Cancelled,

    #[error("JDWP connection closed")]
    ConnectionClosed,

    #[error("JDWP command failed with VM error code {0}")]
    VmError(u16),
}

impl JdwpError {
    /// True when the connection to the target is gone and no further command can succeed.
    pub fn is_disconnect(&self) -> bool {
        matches!(
            self,
            JdwpError::ConnectionClosed
                | JdwpError::Cancelled
                | JdwpError::VmError(ERROR_VM_DEAD)
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct JdwpIdSizes {
    pub field_id: usize,
    pub method_id: usize,
    pub object_id: usize,
    pub reference_type_id: usize,
    pub frame_id: usize,
}

impl Default for JdwpIdSizes {
    fn default() -> Self {
        Self {
            field_id: 8,
            method_id: 8,
            object_id: 8,
            reference_type_id: 8,
            frame_id: 8,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Location {
    pub type_tag: u8,
    pub class_id: ReferenceTypeId,
    pub method_id: MethodId,
    pub index: u64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum JdwpValue {
    Boolean(bool),
    Byte(i8),
    Char(u16),
    Short(i16),
    Int(i32),
    Long(i64),
    Float(f32),
    Double(f64),
    Object { tag: u8, id: ObjectId },
    Void,
}

impl JdwpValue {
    pub const NULL: JdwpValue = JdwpValue::Object {
        tag: TAG_OBJECT,
        id: 0,
    };

    pub fn object_id(&self) -> Option<ObjectId> {
        match *self {
            JdwpValue::Object { id, .. } if id != 0 => Some(id),
            _ => None,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, JdwpValue::Object { id: 0, .. })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassInfo {
    pub ref_type_tag: u8,
    pub type_id: ReferenceTypeId,
    pub signature: String,
    pub status: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldInfo {
    pub field_id: FieldId,
    pub name: String,
    pub signature: String,
    pub mod_bits: u32,
}

impl FieldInfo {
    pub fn is_static(&self) -> bool {
        self.mod_bits & MODIFIER_STATIC != 0
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MethodInfo {
    pub method_id: MethodId,
    pub name: String,
    pub signature: String,
    pub mod_bits: u32,
}

impl MethodInfo {
    pub fn is_static(&self) -> bool {
        self.mod_bits & MODIFIER_STATIC != 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameInfo {
    pub frame_id: FrameId,
    pub location: Location,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LineTableEntry {
    pub code_index: u64,
    pub line: i32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LineTable {
    pub start: u64,
    pub end: u64,
    pub lines: Vec<LineTableEntry>,
}

/// Result of `ObjectReference.InvokeMethod`, `ClassType.InvokeMethod` and
/// `ClassType.NewInstance`: either a value or a thrown exception object.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct InvokeResult {
    pub value: JdwpValue,
    pub exception: ObjectId,
}

/// A single event from a composite event packet.
#[derive(Debug, Clone, PartialEq)]
pub enum JdwpEvent {
    VmStart {
        request_id: i32,
        thread: ThreadId,
    },
    Breakpoint {
        request_id: i32,
        thread: ThreadId,
        location: Location,
    },
    ClassPrepare {
        request_id: i32,
        thread: ThreadId,
        ref_type_tag: u8,
        type_id: ReferenceTypeId,
        signature: String,
        status: u32,
    },
    VmDeath,
}

impl JdwpEvent {
    pub fn request_id(&self) -> Option<i32> {
        match *self {
            JdwpEvent::VmStart { request_id, .. }
            | JdwpEvent::Breakpoint { request_id, .. }
            | JdwpEvent::ClassPrepare { request_id, .. } => Some(request_id),
            JdwpEvent::VmDeath => None,
        }
    }

    pub fn thread(&self) -> Option<ThreadId> {
        match *self {
            JdwpEvent::VmStart { thread, .. }
            | JdwpEvent::Breakpoint { thread, .. }
            | JdwpEvent::ClassPrepare { thread, .. } => Some(thread),
            JdwpEvent::VmDeath => None,
        }
    }
}

/// One composite event packet (`Event.Composite`), delivered as a unit.
///
/// The target suspends according to `suspend_policy` before sending the packet,
/// so whoever consumes the set is responsible for resuming it exactly once.
#[derive(Debug, Clone, PartialEq)]
pub struct EventSet {
    pub suspend_policy: u8,
    pub events: Vec<JdwpEvent>,
}

impl EventSet {
    pub fn is_vm_death(&self) -> bool {
        self.events.iter().any(|e| matches!(e, JdwpEvent::VmDeath))
    }

    /// The thread to resume for an `EVENT_THREAD` suspension.
    pub fn suspended_thread(&self) -> Option<ThreadId> {
        self.events.iter().find_map(JdwpEvent::thread)
    }
}
