//! Byte-level encoding of JDWP packets, ids and tagged values.

use super::types::{
    JdwpError, JdwpIdSizes, JdwpValue, Location, ObjectId, ReferenceTypeId, Result, TAG_OBJECT,
};

pub const HANDSHAKE: &[u8] = b"JDWP-Handshake";
pub const HEADER_LEN: usize = crate::JDWP_HEADER_LEN;
pub const FLAG_REPLY: u8 = 0x80;

/// `(command set, command)` pairs for every packet permscope exchanges.
pub mod command {
    pub type Command = (u8, u8);

    pub const VM_CLASSES_BY_SIGNATURE: Command = (1, 2);
    pub const VM_DISPOSE: Command = (1, 6);
    pub const VM_ID_SIZES: Command = (1, 7);
    pub const VM_RESUME: Command = (1, 9);
    pub const VM_CREATE_STRING: Command = (1, 11);

    pub const REFERENCE_TYPE_SIGNATURE: Command = (2, 1);
    pub const REFERENCE_TYPE_CLASS_LOADER: Command = (2, 2);
    pub const REFERENCE_TYPE_FIELDS: Command = (2, 4);
    pub const REFERENCE_TYPE_METHODS: Command = (2, 5);
    pub const REFERENCE_TYPE_GET_VALUES: Command = (2, 6);
    pub const REFERENCE_TYPE_SOURCE_FILE: Command = (2, 7);
    pub const REFERENCE_TYPE_INTERFACES: Command = (2, 10);

    pub const CLASS_TYPE_SUPERCLASS: Command = (3, 1);
    pub const CLASS_TYPE_INVOKE_METHOD: Command = (3, 3);
    pub const CLASS_TYPE_NEW_INSTANCE: Command = (3, 4);

    pub const METHOD_LINE_TABLE: Command = (6, 1);

    pub const OBJECT_REFERENCE_TYPE: Command = (9, 1);
    pub const OBJECT_GET_VALUES: Command = (9, 2);
    pub const OBJECT_INVOKE_METHOD: Command = (9, 6);
    pub const OBJECT_DISABLE_COLLECTION: Command = (9, 7);
    pub const OBJECT_ENABLE_COLLECTION: Command = (9, 8);

    pub const STRING_VALUE: Command = (10, 1);

    pub const THREAD_NAME: Command = (11, 1);
    pub const THREAD_RESUME: Command = (11, 3);
    pub const THREAD_FRAMES: Command = (11, 6);

    pub const ARRAY_LENGTH: Command = (13, 1);
    pub const ARRAY_GET_VALUES: Command = (13, 2);

    pub const EVENT_REQUEST_SET: Command = (15, 1);
    pub const EVENT_REQUEST_CLEAR: Command = (15, 2);

    pub const FRAME_GET_VALUES: Command = (16, 1);
    pub const FRAME_THIS_OBJECT: Command = (16, 3);

    /// Sent by the VM, never by the debugger.
    pub const EVENT_COMPOSITE: Command = (64, 100);
}

pub fn signature_to_tag(signature: &str) -> u8 {
    match signature.as_bytes().first().copied() {
        Some(b'[') => b'[',
        Some(b'L') => TAG_OBJECT,
        Some(tag) => tag,
        None => b'V',
    }
}

/// Convert a Java binary class name (e.g. `com.example.Foo`) into a JDWP
/// reference type signature (e.g. `Lcom/example/Foo;`).
///
/// If `class` already looks like a JDWP signature (starts with `L` and ends with
/// `;`), it is returned unchanged.
pub fn class_name_to_signature(class: &str) -> String {
    if class.starts_with('L') && class.ends_with(';') {
        return class.to_string();
    }
    if class.starts_with('[') {
        return class.replace('.', "/");
    }
    let internal = class.replace('.', "/");
    format!("L{internal};")
}

/// Convert a JDWP reference type signature back into a binary class name.
///
/// `Lcom/example/Foo$Bar;` becomes `com.example.Foo$Bar`; array signatures keep
/// their `[` prefix with dotted element names (`[Ljava.lang.String;`), matching
/// `Class.getName()`.
pub fn signature_to_class_name(signature: &str) -> String {
    if let Some(inner) = signature
        .strip_prefix('L')
        .and_then(|rest| rest.strip_suffix(';'))
    {
        return inner.replace('/', ".");
    }
    signature.replace('/', ".")
}

/// Reject length prefixes that cannot be valid before allocating a buffer.
pub fn validate_packet_length(length: usize) -> Result<()> {
    if length < HEADER_LEN {
        return Err(JdwpError::Protocol(format!("invalid packet length {length}")));
    }
    if length > crate::MAX_JDWP_PACKET_BYTES {
        return Err(JdwpError::Protocol(format!(
            "JDWP packet length {length} exceeds maximum allowed ({} bytes); refusing to allocate",
            crate::MAX_JDWP_PACKET_BYTES
        )));
    }
    Ok(())
}

/// Growable big-endian packet body.
#[derive(Debug, Default)]
pub struct JdwpWriter {
    buf: Vec<u8>,
}

impl JdwpWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn into_vec(self) -> Vec<u8> {
        self.buf
    }

    fn put<const N: usize>(&mut self, bytes: [u8; N]) {
        self.buf.extend_from_slice(&bytes);
    }

    pub fn write_u8(&mut self, v: u8) {
        self.buf.push(v);
    }

    pub fn write_bool(&mut self, v: bool) {
        self.buf.push(u8::from(v));
    }

    pub fn write_u16(&mut self, v: u16) {
        self.put(v.to_be_bytes());
    }

    pub fn write_u32(&mut self, v: u32) {
        self.put(v.to_be_bytes());
    }

    pub fn write_i32(&mut self, v: i32) {
        self.put(v.to_be_bytes());
    }

    pub fn write_u64(&mut self, v: u64) {
        self.put(v.to_be_bytes());
    }

    pub fn write_i64(&mut self, v: i64) {
        self.put(v.to_be_bytes());
    }

    pub fn write_f32(&mut self, v: f32) {
        self.put(v.to_be_bytes());
    }

    pub fn write_f64(&mut self, v: f64) {
        self.put(v.to_be_bytes());
    }

    /// Strings travel as a u32 byte count followed by modified UTF-8; plain
    /// UTF-8 is accepted by every VM for the names permscope sends.
    pub fn write_string(&mut self, s: &str) {
        self.write_u32(s.len() as u32);
        self.buf.extend_from_slice(s.as_bytes());
    }

    pub fn write_id(&mut self, id: u64, size: usize) {
        let be = id.to_be_bytes();
        self.buf.extend_from_slice(&be[8 - size..]);
    }

    pub fn write_object_id(&mut self, id: ObjectId, sizes: &JdwpIdSizes) {
        self.write_id(id, sizes.object_id);
    }

    pub fn write_tagged_object_id(&mut self, tag: u8, id: ObjectId, sizes: &JdwpIdSizes) {
        self.write_u8(tag);
        self.write_object_id(id, sizes);
    }

    pub fn write_reference_type_id(&mut self, id: ReferenceTypeId, sizes: &JdwpIdSizes) {
        self.write_id(id, sizes.reference_type_id);
    }

    pub fn write_location(&mut self, loc: &Location, sizes: &JdwpIdSizes) {
        self.write_u8(loc.type_tag);
        self.write_reference_type_id(loc.class_id, sizes);
        self.write_id(loc.method_id, sizes.method_id);
        self.write_u64(loc.index);
    }

    pub fn write_value(&mut self, v: &JdwpValue, sizes: &JdwpIdSizes) {
        match *v {
            JdwpValue::Boolean(v) => self.write_bool(v),
            JdwpValue::Byte(v) => self.write_u8(v as u8),
            JdwpValue::Char(v) => self.write_u16(v),
            JdwpValue::Short(v) => self.write_u16(v as u16),
            JdwpValue::Int(v) => self.write_i32(v),
            JdwpValue::Long(v) => self.write_i64(v),
            JdwpValue::Float(v) => self.write_f32(v),
            JdwpValue::Double(v) => self.write_f64(v),
            JdwpValue::Object { id, .. } => self.write_object_id(id, sizes),
            JdwpValue::Void => {}
        }
    }

    pub fn write_tagged_value(&mut self, v: &JdwpValue, sizes: &JdwpIdSizes) {
        let tag = match *v {
            JdwpValue::Boolean(_) => b'Z',
            JdwpValue::Byte(_) => b'B',
            JdwpValue::Char(_) => b'C',
            JdwpValue::Short(_) => b'S',
            JdwpValue::Int(_) => b'I',
            JdwpValue::Long(_) => b'J',
            JdwpValue::Float(_) => b'F',
            JdwpValue::Double(_) => b'D',
            JdwpValue::Object { tag, .. } => tag,
            JdwpValue::Void => b'V',
        };
        self.write_u8(tag);
        self.write_value(v, sizes);
    }
}

pub struct JdwpReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> JdwpReader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    /// Consumes exactly `N` bytes, failing without moving when fewer remain.
    fn take<const N: usize>(&mut self) -> Result<[u8; N]> {
        let slice = self.slice(N)?;
        let mut out = [0u8; N];
        out.copy_from_slice(slice);
        Ok(out)
    }

    fn slice(&mut self, n: usize) -> Result<&'a [u8]> {
        let end = self
            .pos
            .checked_add(n)
            .filter(|end| *end <= self.buf.len())
            .ok_or_else(|| {
                JdwpError::Protocol(format!(
                    "short packet: wanted {n} bytes at offset {}, {} left",
                    self.pos,
                    self.remaining()
                ))
            })?;
        let bytes = &self.buf[self.pos..end];
        self.pos = end;
        Ok(bytes)
    }

    pub fn remaining(&self) -> usize {
        self.buf.len().saturating_sub(self.pos)
    }

    pub fn read_u8(&mut self) -> Result<u8> {
        Ok(self.take::<1>()?[0])
    }

    pub fn read_bool(&mut self) -> Result<bool> {
        Ok(self.read_u8()? != 0)
    }

    pub fn read_u16(&mut self) -> Result<u16> {
        self.take().map(u16::from_be_bytes)
    }

    pub fn read_u32(&mut self) -> Result<u32> {
        self.take().map(u32::from_be_bytes)
    }

    pub fn read_i32(&mut self) -> Result<i32> {
        self.take().map(i32::from_be_bytes)
    }

    pub fn read_u64(&mut self) -> Result<u64> {
        self.take().map(u64::from_be_bytes)
    }

    pub fn read_i64(&mut self) -> Result<i64> {
        self.take().map(i64::from_be_bytes)
    }

    pub fn read_f32(&mut self) -> Result<f32> {
        self.take().map(f32::from_be_bytes)
    }

    pub fn read_f64(&mut self) -> Result<f64> {
        self.take().map(f64::from_be_bytes)
    }

    pub fn read_string(&mut self) -> Result<String> {
        let len = self.read_u32()? as usize;
        let bytes = self.slice(len)?;
        std::str::from_utf8(bytes)
            .map(str::to_owned)
            .map_err(|e| JdwpError::Protocol(format!("string is not utf-8: {e}")))
    }

    /// Reads a u32 count followed by that many items.
    pub fn read_list<T>(&mut self, mut item: impl FnMut(&mut Self) -> Result<T>) -> Result<Vec<T>> {
        let count = self.read_u32()? as usize;
        // Each item needs at least one byte.
        let mut out = Vec::with_capacity(count.min(self.remaining()));
        for _ in 0..count {
            out.push(item(self)?);
        }
        Ok(out)
    }

    /// Reads a big-endian id of `size` bytes (JDWP ids are 1 to 8 bytes wide).
    pub fn read_id(&mut self, size: usize) -> Result<u64> {
        if size == 0 || size > 8 {
            return Err(JdwpError::Protocol(format!("unsupported id width {size}")));
        }
        let mut be = [0u8; 8];
        be[8 - size..].copy_from_slice(self.slice(size)?);
        Ok(u64::from_be_bytes(be))
    }

    pub fn read_object_id(&mut self, sizes: &JdwpIdSizes) -> Result<ObjectId> {
        self.read_id(sizes.object_id)
    }

    pub fn read_tagged_object_id(&mut self, sizes: &JdwpIdSizes) -> Result<(u8, ObjectId)> {
        let tag = self.read_u8()?;
        let id = self.read_object_id(sizes)?;
        Ok((tag, id))
    }

    pub fn read_reference_type_id(&mut self, sizes: &JdwpIdSizes) -> Result<ReferenceTypeId> {
        self.read_id(sizes.reference_type_id)
    }

    pub fn read_location(&mut self, sizes: &JdwpIdSizes) -> Result<Location> {
        Ok(Location {
            type_tag: self.read_u8()?,
            class_id: self.read_reference_type_id(sizes)?,
            method_id: self.read_id(sizes.method_id)?,
            index: self.read_u64()?,
        })
    }

    pub fn read_value(&mut self, tag: u8, sizes: &JdwpIdSizes) -> Result<JdwpValue> {
        let v = match tag {
            b'Z' => JdwpValue::Boolean(self.read_bool()?),
            b'B' => JdwpValue::Byte(self.read_u8()? as i8),
            b'C' => JdwpValue::Char(self.read_u16()?),
            b'S' => JdwpValue::Short(self.read_u16()? as i16),
            b'I' => JdwpValue::Int(self.read_i32()?),
            b'J' => JdwpValue::Long(self.read_i64()?),
            b'F' => JdwpValue::Float(self.read_f32()?),
            b'D' => JdwpValue::Double(self.read_f64()?),
            b'V' => JdwpValue::Void,
            // Object-like values are represented as an object id.
            _ => JdwpValue::Object {
                tag,
                id: self.read_object_id(sizes)?,
            },
        };
        Ok(v)
    }

    pub fn read_tagged_value(&mut self, sizes: &JdwpIdSizes) -> Result<JdwpValue> {
        let tag = self.read_u8()?;
        self.read_value(tag, sizes)
    }
}

pub fn encode_command(id: u32, (command_set, command): command::Command, payload: &[u8]) -> Vec<u8> {
    let length = (HEADER_LEN + payload.len()) as u32;
    let mut out = Vec::with_capacity(length as usize);
    out.extend_from_slice(&length.to_be_bytes());
    out.extend_from_slice(&id.to_be_bytes());
    out.push(0); // flags
    out.push(command_set);
    out.push(command);
    out.extend_from_slice(payload);
    out
}

#[cfg_attr(not(any(test, feature = "wire-test-support")), allow(dead_code))]
pub fn encode_reply(id: u32, error_code: u16, payload: &[u8]) -> Vec<u8> {
    let length = (HEADER_LEN + payload.len()) as u32;
    let mut out = Vec::with_capacity(length as usize);
    out.extend_from_slice(&length.to_be_bytes());
    out.extend_from_slice(&id.to_be_bytes());
    out.push(FLAG_REPLY);
    out.extend_from_slice(&error_code.to_be_bytes());
    out.extend_from_slice(payload);
    out
}
