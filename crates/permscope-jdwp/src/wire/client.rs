use std::{
    collections::HashMap,
    net::SocketAddr,
    sync::{
        atomic::{AtomicU32, Ordering},
        Arc,
    },
    time::Duration,
};

use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{
        tcp::{OwnedReadHalf, OwnedWriteHalf},
        TcpStream,
    },
    sync::{broadcast, oneshot, Mutex},
};
use tokio_util::sync::CancellationToken;

use super::{
    codec::{
        class_name_to_signature,
        command::{self, Command},
        encode_command, signature_to_tag, validate_packet_length, JdwpReader, JdwpWriter,
        FLAG_REPLY, HANDSHAKE, HEADER_LEN,
    },
    types::{
        ClassInfo, EventSet, FieldId, FieldInfo, FrameId, FrameInfo, InvokeResult, JdwpError,
        JdwpEvent, JdwpIdSizes, JdwpValue, LineTable, LineTableEntry, Location, MethodId,
        MethodInfo, ObjectId, ReferenceTypeId, Result, ThreadId, EVENT_KIND_BREAKPOINT,
        EVENT_KIND_CLASS_PREPARE, EVENT_KIND_VM_DEATH, EVENT_KIND_VM_START,
        EVENT_MODIFIER_KIND_CLASS_MATCH, EVENT_MODIFIER_KIND_LOCATION_ONLY,
    },
};

#[derive(Debug, Clone)]
pub struct JdwpClientConfig {
    pub handshake_timeout: Duration,
    /// Upper bound on how long a command waits for its reply.
    ///
    /// `None` waits indefinitely: a remote method invocation may legitimately
    /// block for as long as the invoked code runs.
    pub reply_timeout: Option<Duration>,
    pub pending_channel_size: usize,
    pub event_channel_size: usize,
}

impl Default for JdwpClientConfig {
    fn default() -> Self {
        Self {
            handshake_timeout: Duration::from_secs(5),
            reply_timeout: None,
            pending_channel_size: 256,
            event_channel_size: 1024,
        }
    }
}

#[derive(Debug)]
struct Reply {
    error_code: u16,
    payload: Vec<u8>,
}

#[derive(Debug)]
struct Inner {
    writer: Mutex<OwnedWriteHalf>,
    pending: Mutex<HashMap<u32, oneshot::Sender<std::result::Result<Reply, JdwpError>>>>,
    next_id: AtomicU32,
    id_sizes: Mutex<JdwpIdSizes>,
    events: broadcast::Sender<EventSet>,
    shutdown: CancellationToken,
    config: JdwpClientConfig,
}

/// Cloneable handle to one JDWP connection.
///
/// Commands may be issued concurrently from any number of tasks; replies are
/// matched to requests by packet id in a background read loop, which also
/// publishes composite event packets as [`EventSet`]s.
#[derive(Debug, Clone)]
pub struct JdwpClient {
    inner: Arc<Inner>,
}

impl JdwpClient {
    pub async fn connect(addr: SocketAddr) -> Result<Self> {
        Self::connect_with_config(addr, JdwpClientConfig::default()).await
    }

    pub async fn connect_with_config(addr: SocketAddr, config: JdwpClientConfig) -> Result<Self> {
        let mut stream = TcpStream::connect(addr).await?;
        let _ = stream.set_nodelay(true);

        let handshake = async {
            stream.write_all(HANDSHAKE).await?;
            let mut echoed = [0u8; HANDSHAKE.len()];
            stream.read_exact(&mut echoed).await?;
            Ok::<_, std::io::Error>(echoed)
        };
        let echoed = tokio::time::timeout(config.handshake_timeout, handshake)
            .await
            .map_err(|_| JdwpError::Timeout)??;
        if echoed != *HANDSHAKE {
            return Err(JdwpError::Protocol(format!(
                "target answered the handshake with {:?}",
                String::from_utf8_lossy(&echoed)
            )));
        }

        let (reader, writer) = stream.into_split();
        let (events, _) = broadcast::channel(config.event_channel_size);
        let inner = Arc::new(Inner {
            writer: Mutex::new(writer),
            pending: Mutex::new(HashMap::with_capacity(config.pending_channel_size)),
            next_id: AtomicU32::new(1),
            id_sizes: Mutex::new(JdwpIdSizes::default()),
            events,
            shutdown: CancellationToken::new(),
            config,
        });
        tokio::spawn(read_loop(reader, inner.clone()));

        let client = Self { inner };
        // Every id-bearing packet after this point depends on the negotiated widths.
        client.idsizes().await?;
        Ok(client)
    }

    pub fn shutdown(&self) {
        self.inner.shutdown.cancel();
    }

    /// Cancelled once the connection is gone, whether through
    /// [`JdwpClient::shutdown`], a closed socket or the VM's death event.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.inner.shutdown.clone()
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<EventSet> {
        self.inner.events.subscribe()
    }

    /// Writes one command packet and waits for the reply carrying its id.
    async fn exchange(&self, command: Command, body: Vec<u8>) -> Result<Vec<u8>> {
        if self.inner.shutdown.is_cancelled() {
            return Err(JdwpError::ConnectionClosed);
        }

        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.inner.pending.lock().await.insert(id, tx);

        let packet = encode_command(id, command, &body);
        let written = self.inner.writer.lock().await.write_all(&packet).await;
        if let Err(err) = written {
            self.forget(id).await;
            return Err(err.into());
        }

        let reply = async {
            match self.inner.config.reply_timeout {
                Some(limit) => tokio::time::timeout(limit, rx).await.ok(),
                None => Some(rx.await),
            }
        };
        let reply = tokio::select! {
            _ = self.inner.shutdown.cancelled() => {
                self.forget(id).await;
                return Err(JdwpError::Cancelled);
            }
            reply = reply => match reply {
                Some(Ok(reply)) => reply?,
                Some(Err(_dropped)) => return Err(JdwpError::ConnectionClosed),
                None => {
                    self.forget(id).await;
                    return Err(JdwpError::Timeout);
                }
            },
        };

        match reply.error_code {
            0 => Ok(reply.payload),
            code => Err(JdwpError::VmError(code)),
        }
    }

    async fn forget(&self, id: u32) {
        self.inner.pending.lock().await.remove(&id);
    }

    /// Encodes a command body with the negotiated id sizes and decodes the
    /// reply with the same sizes.
    async fn call<T>(
        &self,
        command: Command,
        body: impl FnOnce(&mut JdwpWriter, &JdwpIdSizes),
        decode: impl FnOnce(&mut JdwpReader<'_>, &JdwpIdSizes) -> Result<T>,
    ) -> Result<T> {
        let sizes = self.id_sizes().await;
        let mut w = JdwpWriter::new();
        body(&mut w, &sizes);
        let payload = self.exchange(command, w.into_vec()).await?;
        decode(&mut JdwpReader::new(&payload), &sizes)
    }

    /// [`JdwpClient::call`] for commands with an empty reply.
    async fn send(
        &self,
        command: Command,
        body: impl FnOnce(&mut JdwpWriter, &JdwpIdSizes),
    ) -> Result<()> {
        self.call(command, body, |_, _| Ok(())).await
    }

    pub async fn id_sizes(&self) -> JdwpIdSizes {
        *self.inner.id_sizes.lock().await
    }

    /// VirtualMachine.IDSizes
    pub async fn idsizes(&self) -> Result<JdwpIdSizes> {
        let sizes = self
            .call(command::VM_ID_SIZES, |_, _| {}, |r, _| {
                Ok(JdwpIdSizes {
                    field_id: r.read_u32()? as usize,
                    method_id: r.read_u32()? as usize,
                    object_id: r.read_u32()? as usize,
                    reference_type_id: r.read_u32()? as usize,
                    frame_id: r.read_u32()? as usize,
                })
            })
            .await?;
        *self.inner.id_sizes.lock().await = sizes;
        Ok(sizes)
    }

    /// VirtualMachine.ClassesBySignature: every loaded class with this
    /// signature, one per defining loader.
    pub async fn classes_by_signature(&self, signature: &str) -> Result<Vec<ClassInfo>> {
        self.call(
            command::VM_CLASSES_BY_SIGNATURE,
            |w, _| w.write_string(signature),
            |r, sizes| {
                r.read_list(|r| {
                    Ok(ClassInfo {
                        ref_type_tag: r.read_u8()?,
                        type_id: r.read_reference_type_id(sizes)?,
                        signature: signature.to_owned(),
                        status: r.read_u32()?,
                    })
                })
            },
        )
        .await
    }

    /// [`JdwpClient::classes_by_signature`] taking a binary class name.
    pub async fn classes_by_name(&self, class_name: &str) -> Result<Vec<ClassInfo>> {
        self.classes_by_signature(&class_name_to_signature(class_name))
            .await
    }

    pub async fn vm_dispose(&self) -> Result<()> {
        self.send(command::VM_DISPOSE, |_, _| {}).await
    }

    pub async fn vm_resume(&self) -> Result<()> {
        self.send(command::VM_RESUME, |_, _| {}).await
    }

    /// VirtualMachine.CreateString. The new string is collectable until
    /// pinned.
    pub async fn create_string(&self, value: &str) -> Result<ObjectId> {
        self.call(
            command::VM_CREATE_STRING,
            |w, _| w.write_string(value),
            |r, sizes| r.read_object_id(sizes),
        )
        .await
    }

    pub async fn reference_type_signature(&self, class_id: ReferenceTypeId) -> Result<String> {
        self.call(
            command::REFERENCE_TYPE_SIGNATURE,
            |w, sizes| w.write_reference_type_id(class_id, sizes),
            |r, _| r.read_string(),
        )
        .await
    }

    /// Returns `0` for classes loaded by the bootstrap loader.
    pub async fn reference_type_class_loader(&self, class_id: ReferenceTypeId) -> Result<ObjectId> {
        self.call(
            command::REFERENCE_TYPE_CLASS_LOADER,
            |w, sizes| w.write_reference_type_id(class_id, sizes),
            |r, sizes| r.read_object_id(sizes),
        )
        .await
    }

    /// Fields declared by the class itself, not inherited ones.
    pub async fn reference_type_fields(&self, class_id: ReferenceTypeId) -> Result<Vec<FieldInfo>> {
        self.call(
            command::REFERENCE_TYPE_FIELDS,
            |w, sizes| w.write_reference_type_id(class_id, sizes),
            |r, sizes| {
                r.read_list(|r| {
                    Ok(FieldInfo {
                        field_id: r.read_id(sizes.field_id)?,
                        name: r.read_string()?,
                        signature: r.read_string()?,
                        mod_bits: r.read_u32()?,
                    })
                })
            },
        )
        .await
    }

    /// Methods declared by the class itself, not inherited ones.
    pub async fn reference_type_methods(
        &self,
        class_id: ReferenceTypeId,
    ) -> Result<Vec<MethodInfo>> {
        self.call(
            command::REFERENCE_TYPE_METHODS,
            |w, sizes| w.write_reference_type_id(class_id, sizes),
            |r, sizes| {
                r.read_list(|r| {
                    Ok(MethodInfo {
                        method_id: r.read_id(sizes.method_id)?,
                        name: r.read_string()?,
                        signature: r.read_string()?,
                        mod_bits: r.read_u32()?,
                    })
                })
            },
        )
        .await
    }

    /// Static field values.
    pub async fn reference_type_get_values(
        &self,
        class_id: ReferenceTypeId,
        field_ids: &[FieldId],
    ) -> Result<Vec<JdwpValue>> {
        self.call(
            command::REFERENCE_TYPE_GET_VALUES,
            |w, sizes| {
                w.write_reference_type_id(class_id, sizes);
                write_field_ids(w, field_ids, sizes);
            },
            |r, sizes| r.read_list(|r| r.read_tagged_value(sizes)),
        )
        .await
    }

    pub async fn reference_type_source_file(&self, class_id: ReferenceTypeId) -> Result<String> {
        self.call(
            command::REFERENCE_TYPE_SOURCE_FILE,
            |w, sizes| w.write_reference_type_id(class_id, sizes),
            |r, _| r.read_string(),
        )
        .await
    }

    /// Directly implemented interfaces.
    pub async fn reference_type_interfaces(
        &self,
        class_id: ReferenceTypeId,
    ) -> Result<Vec<ReferenceTypeId>> {
        self.call(
            command::REFERENCE_TYPE_INTERFACES,
            |w, sizes| w.write_reference_type_id(class_id, sizes),
            |r, sizes| r.read_list(|r| r.read_reference_type_id(sizes)),
        )
        .await
    }

    /// Returns `0` for `java.lang.Object` and for interfaces.
    pub async fn class_type_superclass(&self, class_id: ReferenceTypeId) -> Result<ReferenceTypeId> {
        self.call(
            command::CLASS_TYPE_SUPERCLASS,
            |w, sizes| w.write_reference_type_id(class_id, sizes),
            |r, sizes| r.read_reference_type_id(sizes),
        )
        .await
    }

    /// Runs a static method on `thread`, which must be suspended by an event.
    pub async fn class_type_invoke_method(
        &self,
        class_id: ReferenceTypeId,
        thread: ThreadId,
        method_id: MethodId,
        args: &[JdwpValue],
        options: u32,
    ) -> Result<InvokeResult> {
        self.call(
            command::CLASS_TYPE_INVOKE_METHOD,
            |w, sizes| {
                w.write_reference_type_id(class_id, sizes);
                w.write_object_id(thread, sizes);
                w.write_id(method_id, sizes.method_id);
                write_invocation(w, args, options, sizes);
            },
            read_invoke_result,
        )
        .await
    }

    pub async fn class_type_new_instance(
        &self,
        class_id: ReferenceTypeId,
        thread: ThreadId,
        method_id: MethodId,
        args: &[JdwpValue],
        options: u32,
    ) -> Result<InvokeResult> {
        self.call(
            command::CLASS_TYPE_NEW_INSTANCE,
            |w, sizes| {
                w.write_reference_type_id(class_id, sizes);
                w.write_object_id(thread, sizes);
                w.write_id(method_id, sizes.method_id);
                write_invocation(w, args, options, sizes);
            },
            |r, sizes| {
                let (tag, id) = r.read_tagged_object_id(sizes)?;
                let (_, exception) = r.read_tagged_object_id(sizes)?;
                Ok(InvokeResult {
                    value: JdwpValue::Object { tag, id },
                    exception,
                })
            },
        )
        .await
    }

    pub async fn method_line_table(
        &self,
        class_id: ReferenceTypeId,
        method_id: MethodId,
    ) -> Result<LineTable> {
        self.call(
            command::METHOD_LINE_TABLE,
            |w, sizes| {
                w.write_reference_type_id(class_id, sizes);
                w.write_id(method_id, sizes.method_id);
            },
            |r, _| {
                let start = r.read_u64()?;
                let end = r.read_u64()?;
                let lines = r.read_list(|r| {
                    Ok(LineTableEntry {
                        code_index: r.read_u64()?,
                        line: r.read_i32()?,
                    })
                })?;
                Ok(LineTable { start, end, lines })
            },
        )
        .await
    }

    /// The runtime class of `object_id`.
    pub async fn object_reference_reference_type(
        &self,
        object_id: ObjectId,
    ) -> Result<ReferenceTypeId> {
        self.call(
            command::OBJECT_REFERENCE_TYPE,
            |w, sizes| w.write_object_id(object_id, sizes),
            |r, sizes| {
                let _ref_type_tag = r.read_u8()?;
                r.read_reference_type_id(sizes)
            },
        )
        .await
    }

    pub async fn object_reference_get_values(
        &self,
        object_id: ObjectId,
        field_ids: &[FieldId],
    ) -> Result<Vec<JdwpValue>> {
        self.call(
            command::OBJECT_GET_VALUES,
            |w, sizes| {
                w.write_object_id(object_id, sizes);
                write_field_ids(w, field_ids, sizes);
            },
            |r, sizes| r.read_list(|r| r.read_tagged_value(sizes)),
        )
        .await
    }

    /// Runs an instance method on `thread`, which must be suspended by an
    /// event. `class_id` selects the method's declaring type.
    pub async fn object_reference_invoke_method(
        &self,
        object_id: ObjectId,
        thread: ThreadId,
        class_id: ReferenceTypeId,
        method_id: MethodId,
        args: &[JdwpValue],
        options: u32,
    ) -> Result<InvokeResult> {
        self.call(
            command::OBJECT_INVOKE_METHOD,
            |w, sizes| {
                w.write_object_id(object_id, sizes);
                w.write_object_id(thread, sizes);
                w.write_reference_type_id(class_id, sizes);
                w.write_id(method_id, sizes.method_id);
                write_invocation(w, args, options, sizes);
            },
            read_invoke_result,
        )
        .await
    }

    pub async fn object_reference_disable_collection(&self, object_id: ObjectId) -> Result<()> {
        self.send(command::OBJECT_DISABLE_COLLECTION, |w, sizes| {
            w.write_object_id(object_id, sizes)
        })
        .await
    }

    pub async fn object_reference_enable_collection(&self, object_id: ObjectId) -> Result<()> {
        self.send(command::OBJECT_ENABLE_COLLECTION, |w, sizes| {
            w.write_object_id(object_id, sizes)
        })
        .await
    }

    pub async fn string_reference_value(&self, string_id: ObjectId) -> Result<String> {
        self.call(
            command::STRING_VALUE,
            |w, sizes| w.write_object_id(string_id, sizes),
            |r, _| r.read_string(),
        )
        .await
    }

    pub async fn thread_name(&self, thread: ThreadId) -> Result<String> {
        self.call(
            command::THREAD_NAME,
            |w, sizes| w.write_object_id(thread, sizes),
            |r, _| r.read_string(),
        )
        .await
    }

    pub async fn thread_resume(&self, thread: ThreadId) -> Result<()> {
        self.send(command::THREAD_RESUME, |w, sizes| w.write_object_id(thread, sizes))
            .await
    }

    /// Frames of a suspended thread, innermost first. A `length` of `-1`
    /// means all remaining frames.
    pub async fn frames(
        &self,
        thread: ThreadId,
        start: i32,
        length: i32,
    ) -> Result<Vec<FrameInfo>> {
        self.call(
            command::THREAD_FRAMES,
            |w, sizes| {
                w.write_object_id(thread, sizes);
                w.write_i32(start);
                w.write_i32(length);
            },
            |r, sizes| {
                r.read_list(|r| {
                    Ok(FrameInfo {
                        frame_id: r.read_id(sizes.frame_id)?,
                        location: r.read_location(sizes)?,
                    })
                })
            },
        )
        .await
    }

    pub async fn array_reference_length(&self, array_id: ObjectId) -> Result<i32> {
        self.call(
            command::ARRAY_LENGTH,
            |w, sizes| w.write_object_id(array_id, sizes),
            |r, _| r.read_i32(),
        )
        .await
    }

    pub async fn array_reference_get_values(
        &self,
        array_id: ObjectId,
        first_index: i32,
        length: i32,
    ) -> Result<Vec<JdwpValue>> {
        self.call(
            command::ARRAY_GET_VALUES,
            |w, sizes| {
                w.write_object_id(array_id, sizes);
                w.write_i32(first_index);
                w.write_i32(length);
            },
            |r, sizes| {
                // Primitive arrays share one element tag; reference arrays tag
                // every element.
                let tag = r.read_u8()?;
                if matches!(tag, b'Z' | b'B' | b'C' | b'S' | b'I' | b'J' | b'F' | b'D') {
                    r.read_list(|r| r.read_value(tag, sizes))
                } else {
                    r.read_list(|r| r.read_tagged_value(sizes))
                }
            },
        )
        .await
    }

    /// EventRequest.Set, returning the new request id.
    pub async fn event_request_set(
        &self,
        event_kind: u8,
        suspend_policy: u8,
        modifiers: Vec<EventModifier>,
    ) -> Result<i32> {
        self.call(
            command::EVENT_REQUEST_SET,
            |w, sizes| {
                w.write_u8(event_kind);
                w.write_u8(suspend_policy);
                w.write_u32(modifiers.len() as u32);
                for modifier in modifiers {
                    modifier.encode(w, sizes);
                }
            },
            |r, _| r.read_i32(),
        )
        .await
    }

    pub async fn event_request_clear(&self, event_kind: u8, request_id: i32) -> Result<()> {
        self.send(command::EVENT_REQUEST_CLEAR, |w, _| {
            w.write_u8(event_kind);
            w.write_i32(request_id);
        })
        .await
    }

    /// Reads local variable slots, each given with its declared signature.
    pub async fn stack_frame_get_values(
        &self,
        thread: ThreadId,
        frame_id: FrameId,
        slots: &[(u32, String)],
    ) -> Result<Vec<JdwpValue>> {
        self.call(
            command::FRAME_GET_VALUES,
            |w, sizes| {
                w.write_object_id(thread, sizes);
                w.write_id(frame_id, sizes.frame_id);
                w.write_u32(slots.len() as u32);
                for (slot, signature) in slots {
                    w.write_u32(*slot);
                    w.write_u8(signature_to_tag(signature));
                }
            },
            |r, sizes| r.read_list(|r| r.read_tagged_value(sizes)),
        )
        .await
    }

    /// Returns `None` for static and native frames.
    pub async fn stack_frame_this_object(
        &self,
        thread: ThreadId,
        frame_id: FrameId,
    ) -> Result<Option<ObjectId>> {
        self.call(
            command::FRAME_THIS_OBJECT,
            |w, sizes| {
                w.write_object_id(thread, sizes);
                w.write_id(frame_id, sizes.frame_id);
            },
            |r, sizes| {
                let (_, id) = r.read_tagged_object_id(sizes)?;
                Ok((id != 0).then_some(id))
            },
        )
        .await
    }
}

fn write_field_ids(w: &mut JdwpWriter, field_ids: &[FieldId], sizes: &JdwpIdSizes) {
    w.write_u32(field_ids.len() as u32);
    for field_id in field_ids {
        w.write_id(*field_id, sizes.field_id);
    }
}

fn write_invocation(w: &mut JdwpWriter, args: &[JdwpValue], options: u32, sizes: &JdwpIdSizes) {
    w.write_u32(args.len() as u32);
    for arg in args {
        w.write_tagged_value(arg, sizes);
    }
    w.write_u32(options);
}

fn read_invoke_result(r: &mut JdwpReader<'_>, sizes: &JdwpIdSizes) -> Result<InvokeResult> {
    let value = r.read_tagged_value(sizes)?;
    let (_, exception) = r.read_tagged_object_id(sizes)?;
    Ok(InvokeResult { value, exception })
}

#[derive(Debug, Clone)]
pub enum EventModifier {
    ClassMatch { pattern: String },
    LocationOnly { location: Location },
}

impl EventModifier {
    fn encode(self, w: &mut JdwpWriter, sizes: &JdwpIdSizes) {
        match self {
            EventModifier::ClassMatch { pattern } => {
                w.write_u8(EVENT_MODIFIER_KIND_CLASS_MATCH);
                w.write_string(&pattern);
            }
            EventModifier::LocationOnly { location } => {
                w.write_u8(EVENT_MODIFIER_KIND_LOCATION_ONLY);
                w.write_location(&location, sizes);
            }
        }
    }
}

/// Routes replies to their waiting commands and publishes event sets until
/// the connection ends, then fails every command still waiting.
async fn read_loop(mut reader: OwnedReadHalf, inner: Arc<Inner>) {
    loop {
        let packet = tokio::select! {
            _ = inner.shutdown.cancelled() => break,
            packet = read_packet(&mut reader) => packet,
        };
        let (header, payload) = match packet {
            Ok(packet) => packet,
            Err(err) => {
                tracing::debug!(target = "permscope.jdwp", error = %err, "connection closed");
                break;
            }
        };

        let id = u32::from_be_bytes([header[4], header[5], header[6], header[7]]);
        if header[8] & FLAG_REPLY != 0 {
            let error_code = u16::from_be_bytes([header[9], header[10]]);
            if let Some(tx) = inner.pending.lock().await.remove(&id) {
                let _ = tx.send(Ok(Reply {
                    error_code,
                    payload,
                }));
            }
            continue;
        }

        let command = (header[9], header[10]);
        if command != command::EVENT_COMPOSITE {
            tracing::trace!(target = "permscope.jdwp", ?command, "ignoring command from target");
            continue;
        }
        match decode_event_set(&inner, &payload).await {
            Ok(set) => {
                let death = set.is_vm_death();
                let _ = inner.events.send(set);
                if death {
                    break;
                }
            }
            Err(err) => {
                tracing::error!(target = "permscope.jdwp", error = %err, "malformed event packet");
                break;
            }
        }
    }

    inner.shutdown.cancel();
    let waiting = std::mem::take(&mut *inner.pending.lock().await);
    for (_, tx) in waiting {
        let _ = tx.send(Err(JdwpError::ConnectionClosed));
    }
}

async fn read_packet(reader: &mut OwnedReadHalf) -> Result<([u8; HEADER_LEN], Vec<u8>)> {
    let mut header = [0u8; HEADER_LEN];
    reader.read_exact(&mut header).await?;
    let length = u32::from_be_bytes([header[0], header[1], header[2], header[3]]) as usize;
    validate_packet_length(length)?;
    let mut payload = vec![0u8; length - HEADER_LEN];
    reader.read_exact(&mut payload).await?;
    Ok((header, payload))
}

async fn decode_event_set(inner: &Inner, payload: &[u8]) -> Result<EventSet> {
    let sizes = *inner.id_sizes.lock().await;
    let mut r = JdwpReader::new(payload);
    let suspend_policy = r.read_u8()?;
    let count = r.read_u32()?;
    let mut events = Vec::new();
    for _ in 0..count {
        match decode_event(&mut r, &sizes)? {
            Some(event) => events.push(event),
            // Nothing after an unknown kind can be framed; keep what was read
            // so the set still gets resumed.
            None => break,
        }
    }
    Ok(EventSet {
        suspend_policy,
        events,
    })
}

fn decode_event(r: &mut JdwpReader<'_>, sizes: &JdwpIdSizes) -> Result<Option<JdwpEvent>> {
    let kind = r.read_u8()?;
    let request_id = r.read_i32()?;
    let event = match kind {
        EVENT_KIND_BREAKPOINT => JdwpEvent::Breakpoint {
            request_id,
            thread: r.read_object_id(sizes)?,
            location: r.read_location(sizes)?,
        },
        EVENT_KIND_CLASS_PREPARE => JdwpEvent::ClassPrepare {
            request_id,
            thread: r.read_object_id(sizes)?,
            ref_type_tag: r.read_u8()?,
            type_id: r.read_reference_type_id(sizes)?,
            signature: r.read_string()?,
            status: r.read_u32()?,
        },
        EVENT_KIND_VM_START => JdwpEvent::VmStart {
            request_id,
            thread: r.read_object_id(sizes)?,
        },
        EVENT_KIND_VM_DEATH => JdwpEvent::VmDeath,
        other => {
            tracing::debug!(target = "permscope.jdwp", kind = other, "unknown event kind");
            return Ok(None);
        }
    };
    Ok(Some(event))
}
