//! JDWP over TCP: packet codec, the async client and, for tests, a mock
//! target serving a scripted heap.

mod client;
mod codec;
pub mod types;

pub use client::{EventModifier, JdwpClient, JdwpClientConfig};
pub use codec::{class_name_to_signature, signature_to_class_name};
pub use types::{
    ClassInfo, EventSet, FieldId, FieldInfo, FrameId, FrameInfo, InvokeResult, JdwpError,
    JdwpEvent, JdwpIdSizes, JdwpValue, LineTable, LineTableEntry, Location, MethodId, MethodInfo,
    ObjectId, ReferenceTypeId, ThreadId,
};

// Downstream test suites opt in through `wire-test-support`.
#[cfg(any(test, feature = "wire-test-support"))]
pub mod mock;
