//! Binary Codec (spec §4.1, §6 "Binary checkpoint format").
//!
//! Serializes a value graph reachable from a root into a self-contained
//! image: header (version, object count, offset-table pointer, class-id
//! drift hash), body (the root's encoding followed by every other
//! referenced object's encoding), trailer (the offset table). Cycles are
//! handled by a write-time
//! identity-to-id map and a read-time shell-then-populate single pass:
//! a container's `Rc` is allocated and registered before its elements are
//! parsed, so a self-reference among them resolves to that same `Rc`.
//!
//! Scope decisions (recorded in DESIGN.md): `Array` values are restored
//! eagerly rather than through the shell/defer path, since an array's
//! storage shape (element type, dimensionality) must be known before any
//! container can be allocated — a self-referential array is not supported.
//! `Class` values are not copied through the identity map at all; they are
//! references into the process-wide `TypeRegistry`, resolved by name/id
//! rather than reconstructed.

mod varint;

use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::rc::Rc;

use indexmap::IndexMap;
use tracing::{debug, instrument};

use crate::descriptor::ClassDescriptor;
use crate::error::CheckpointFormatError;
use crate::handle::{BoundHandle, ClassRef, IteratorHandle, MethodHandle, PlainHandle, WrapperHandle};
use crate::iterator::{
    ArraySourceState, CharsSourceState, ClosureRegistry, FilterState, FlatMapState, GroupedState,
    IteratorVariant, LazyIterator, ListSourceState, MapEntriesSourceState, MapState,
    NegativeLimitState, NegativeSkipState, RangeSourceState, SkipState, StreamState,
    StringSplitState, TransposeState, UniqueState, ITERATOR_FORMAT_VERSION,
};
use crate::registry::TypeRegistry;
use crate::value::{
    ArrayData, ArrayElemType, ArrayValue, BuiltinValue, InstanceValue, MatcherState, RuntimeValue,
    TypeTag,
};

use varint::{read_ivarint, read_u32_le, read_uvarint, write_ivarint, write_u32_le, write_uvarint};

pub const CODEC_FORMAT_VERSION: u32 = 1;

/// Whether a `TypeTag` participates in the writer's identity map at all
/// (non-shareable primitives are written fully inline, spec §4.1).
fn is_inline_primitive(tag: TypeTag) -> bool {
    matches!(
        tag,
        TypeTag::Null
            | TypeTag::Boolean
            | TypeTag::Byte
            | TypeTag::Int
            | TypeTag::Long
            | TypeTag::Double
            | TypeTag::Decimal
    )
}

pub struct Writer<'a> {
    body: Vec<u8>,
    ids: HashMap<usize, u32>,
    offsets: Vec<u32>,
    next_id: u32,
    header_len: u32,
    registry: &'a TypeRegistry,
}

impl<'a> Writer<'a> {
    fn new(registry: &'a TypeRegistry, header_len: u32) -> Self {
        Self {
            body: Vec::new(),
            ids: HashMap::new(),
            offsets: Vec::new(),
            next_id: 0,
            header_len,
            registry,
        }
    }

    /// Returns `Some(id)` if `ptr` was already visited (caller should just
    /// write tag+id and stop); otherwise allocates a fresh id, records the
    /// upcoming payload's offset, and returns `None` (caller should write
    /// tag+id then the full payload).
    fn visit(&mut self, ptr: *const ()) -> Option<u32> {
        let key = ptr as usize;
        if let Some(&id) = self.ids.get(&key) {
            return Some(id);
        }
        let id = self.next_id;
        self.next_id += 1;
        self.ids.insert(key, id);
        // Payload starts right after the id varint we're about to write;
        // the caller writes the id immediately after calling `visit`.
        None
    }

    fn record_payload_offset(&mut self, id: u32) {
        debug_assert_eq!(id as usize, self.offsets.len());
        self.offsets.push(self.header_len + self.body.len() as u32);
    }

    fn write_tag(&mut self, tag: TypeTag) {
        self.body.push(tag as u8);
    }

    fn write_str_bytes(&mut self, s: &str) {
        write_uvarint(&mut self.body, s.len() as u64);
        self.body.extend_from_slice(s.as_bytes());
    }

    pub fn write_value(&mut self, value: &RuntimeValue) {
        let tag = value.type_tag();
        if is_inline_primitive(tag) {
            self.write_tag(tag);
            self.write_primitive_payload(value);
            return;
        }
        if let RuntimeValue::Class(class) = value {
            self.write_tag(tag);
            self.write_class_ref(class);
            return;
        }

        let ptr = value
            .identity_ptr()
            .expect("every non-primitive, non-Class RuntimeValue carries identity");
        self.write_tag(tag);
        match self.visit(ptr) {
            Some(existing_id) => write_uvarint(&mut self.body, existing_id as u64),
            None => {
                let id = self.next_id - 1;
                write_uvarint(&mut self.body, id as u64);
                self.record_payload_offset(id);
                self.write_payload(value);
            }
        }
    }

    fn write_primitive_payload(&mut self, value: &RuntimeValue) {
        match value {
            RuntimeValue::Null => {}
            RuntimeValue::Bool(b) => self.body.push(*b as u8),
            RuntimeValue::Byte(b) => self.body.push(*b),
            RuntimeValue::Int(n) => write_ivarint(&mut self.body, *n as i64),
            RuntimeValue::Long(n) => write_ivarint(&mut self.body, *n),
            RuntimeValue::Double(d) => self.body.extend_from_slice(&d.to_bits().to_le_bytes()),
            RuntimeValue::Decimal(d) => self.write_str_bytes(&d.to_string()),
            _ => unreachable!("not an inline primitive"),
        }
    }

    fn write_class_ref(&mut self, class: &Rc<ClassDescriptor>) {
        if let Some(id) = self.registry.builtin_id(&class.internal_name) {
            self.body.push(0);
            write_uvarint(&mut self.body, id as u64);
        } else {
            self.body.push(1);
            self.write_str_bytes(&class.internal_name);
        }
    }

    fn write_payload(&mut self, value: &RuntimeValue) {
        match value {
            RuntimeValue::Str(s) => self.write_str_bytes(s),
            RuntimeValue::StringBuffer(s) => self.write_str_bytes(&s.borrow()),
            RuntimeValue::List(list) => {
                let items = list.borrow();
                write_uvarint(&mut self.body, items.len() as u64);
                for item in items.iter() {
                    self.write_value(item);
                }
            }
            RuntimeValue::Map(map) => {
                let entries = map.borrow();
                write_uvarint(&mut self.body, entries.len() as u64);
                for (k, v) in entries.iter() {
                    self.write_value(k);
                    self.write_value(v);
                }
            }
            RuntimeValue::HeapLocal(cell) => self.write_value(&cell.borrow()),
            RuntimeValue::Instance(inst) => {
                self.write_str_bytes(&inst.class.internal_name);
                let fields = inst.fields.borrow();
                write_uvarint(&mut self.body, fields.len() as u64);
                for (name, v) in fields.iter() {
                    self.write_str_bytes(name);
                    self.write_value(v);
                }
            }
            RuntimeValue::Builtin(b) => {
                write_uvarint(&mut self.body, b.builtin_class_id as u64);
                let fields = b.fields.borrow();
                write_uvarint(&mut self.body, fields.len() as u64);
                for (name, v) in fields.iter() {
                    self.write_str_bytes(name);
                    self.write_value(v);
                }
            }
            RuntimeValue::Array(array) => self.write_array(array),
            RuntimeValue::Function(handle) => self.write_method_handle(handle),
            RuntimeValue::Iterator(it) => self.write_iterator(&it.borrow()),
            RuntimeValue::Matcher(m) => self.write_matcher(&m.borrow()),
            RuntimeValue::Continuation(frame) => {
                let f = frame.borrow();
                write_ivarint(&mut self.body, f.method_location as i64);
                self.write_method_handle(&f.method_handle);
                write_uvarint(&mut self.body, f.local_primitives.len() as u64);
                for p in &f.local_primitives {
                    write_ivarint(&mut self.body, *p);
                }
                write_uvarint(&mut self.body, f.local_objects.len() as u64);
                for obj in &f.local_objects {
                    self.write_value(obj);
                }
            }
            RuntimeValue::Null
            | RuntimeValue::Bool(_)
            | RuntimeValue::Byte(_)
            | RuntimeValue::Int(_)
            | RuntimeValue::Long(_)
            | RuntimeValue::Double(_)
            | RuntimeValue::Decimal(_)
            | RuntimeValue::Class(_) => unreachable!("handled before write_payload"),
        }
    }

    fn write_array(&mut self, array: &ArrayValue) {
        let elem_ord = array_elem_ordinal(array.elem_type);
        self.body.push(elem_ord);
        self.body.push(array.dims);
        match &array.data {
            ArrayData::Bool(r) => {
                let v = r.borrow();
                write_uvarint(&mut self.body, v.len() as u64);
                for chunk in v.chunks(8) {
                    let mut byte = 0u8;
                    for (i, b) in chunk.iter().enumerate() {
                        if *b {
                            byte |= 1 << i;
                        }
                    }
                    self.body.push(byte);
                }
            }
            ArrayData::Byte(r) => {
                let v = r.borrow();
                write_uvarint(&mut self.body, v.len() as u64);
                self.body.extend_from_slice(&v);
            }
            ArrayData::Int(r) => {
                let v = r.borrow();
                write_uvarint(&mut self.body, v.len() as u64);
                for n in v.iter() {
                    write_ivarint(&mut self.body, *n as i64);
                }
            }
            ArrayData::Long(r) => {
                let v = r.borrow();
                write_uvarint(&mut self.body, v.len() as u64);
                for n in v.iter() {
                    write_ivarint(&mut self.body, *n);
                }
            }
            ArrayData::Double(r) => {
                let v = r.borrow();
                write_uvarint(&mut self.body, v.len() as u64);
                for d in v.iter() {
                    self.body.extend_from_slice(&d.to_bits().to_le_bytes());
                }
            }
            ArrayData::Object(r) => {
                let v = r.borrow();
                write_uvarint(&mut self.body, v.len() as u64);
                for item in v.iter() {
                    self.write_value(item);
                }
            }
        }
    }

    fn write_method_handle(&mut self, handle: &MethodHandle) {
        match handle {
            MethodHandle::Plain(p) => {
                self.body.push(0);
                match &p.owning_class {
                    ClassRef::BuiltinId(id) => {
                        self.body.push(0);
                        write_uvarint(&mut self.body, *id as u64);
                    }
                    ClassRef::Named(n) => {
                        self.body.push(1);
                        self.write_str_bytes(n);
                    }
                }
                self.write_str_bytes(&p.handle_field);
            }
            MethodHandle::Iterator(i) => {
                self.body.push(1);
                write_uvarint(&mut self.body, i.iterator_variant_tag as u64);
                self.write_str_bytes(&i.handle_field);
            }
            MethodHandle::Wrapper(w) => {
                self.body.push(2);
                match &w.owner_type {
                    Some(t) => {
                        self.body.push(1);
                        self.write_str_bytes(t);
                    }
                    None => self.body.push(0),
                }
                self.write_str_bytes(&w.function_name);
            }
            MethodHandle::Bound(b) => {
                self.body.push(3);
                self.write_method_handle(&b.inner);
                self.write_value(&b.receiver);
            }
        }
    }

    fn write_matcher(&mut self, m: &MatcherState) {
        self.write_str_bytes(&m.subject);
        self.write_str_bytes(&m.pattern);
        self.write_str_bytes(&m.modifiers);
        write_uvarint(&mut self.body, m.last_end as u64);
    }

    fn write_iterator(&mut self, it: &LazyIterator) {
        write_uvarint(&mut self.body, it.variant() as u64);
        write_uvarint(&mut self.body, ITERATOR_FORMAT_VERSION as u64);
        match it {
            LazyIterator::ListSource(s) => {
                self.write_value(&RuntimeValue::List(s.source.clone()));
                write_uvarint(&mut self.body, s.index as u64);
            }
            LazyIterator::MapEntriesSource(s) => {
                self.write_value(&RuntimeValue::Map(s.source.clone()));
                write_uvarint(&mut self.body, s.index as u64);
                write_uvarint(&mut self.body, s.start_count as u64);
            }
            LazyIterator::ArraySource(s) => {
                self.write_array(&s.source);
                write_uvarint(&mut self.body, s.index as u64);
            }
            LazyIterator::RangeSource(s) => {
                write_ivarint(&mut self.body, s.current);
                write_ivarint(&mut self.body, s.end);
                write_ivarint(&mut self.body, s.step);
            }
            LazyIterator::CharsSource(s) => {
                self.write_str_bytes(&s.source);
                write_uvarint(&mut self.body, s.index as u64);
            }
            LazyIterator::StringSplit(s) => {
                self.write_matcher(&s.matcher);
                self.body.push(s.find_next as u8);
                self.body.push(s.last as u8);
            }
            LazyIterator::Filter(s) => {
                self.write_iterator(&s.source);
                match &s.closure_name {
                    Some(n) => {
                        self.body.push(1);
                        self.write_str_bytes(n);
                    }
                    None => self.body.push(0),
                }
                self.write_optional_value(s.lookahead.as_ref());
                write_uvarint(&mut self.body, s.location as u64);
            }
            LazyIterator::Map(s) => {
                self.write_iterator(&s.source);
                self.write_str_bytes(&s.closure_name);
                self.body.push(s.with_index as u8);
                write_uvarint(&mut self.body, s.index);
                write_uvarint(&mut self.body, s.location as u64);
            }
            LazyIterator::FlatMap(s) => {
                self.write_iterator(&s.source);
                self.write_str_bytes(&s.closure_name);
                match &s.inner {
                    Some(inner) => {
                        self.body.push(1);
                        self.write_iterator(inner);
                    }
                    None => self.body.push(0),
                }
                write_uvarint(&mut self.body, s.location as u64);
            }
            LazyIterator::Unique(s) => {
                self.write_iterator(&s.source);
                self.write_optional_value(s.previous.as_ref());
                self.body.push(s.first as u8);
                write_uvarint(&mut self.body, s.location as u64);
            }
            LazyIterator::Limit(s) => {
                self.write_iterator(&s.source);
                write_uvarint(&mut self.body, s.n);
                write_uvarint(&mut self.body, s.emitted);
            }
            LazyIterator::NegativeLimit(s) => {
                self.write_iterator(&s.source);
                write_uvarint(&mut self.body, s.n_abs as u64);
                write_uvarint(&mut self.body, s.buffer.len() as u64);
                for v in s.buffer.iter() {
                    self.write_value(v);
                }
                self.body.push(s.source_exhausted as u8);
            }
            LazyIterator::Skip(s) => {
                self.write_iterator(&s.source);
                write_uvarint(&mut self.body, s.n);
                write_uvarint(&mut self.body, s.skipped);
            }
            LazyIterator::NegativeSkip(s) => {
                self.write_iterator(&s.source);
                write_uvarint(&mut self.body, s.n_abs as u64);
                write_uvarint(&mut self.body, s.buffer.len() as u64);
                for v in s.buffer.iter() {
                    self.write_value(v);
                }
                self.body.push(s.source_exhausted as u8);
            }
            LazyIterator::Grouped(s) => {
                self.write_iterator(&s.source);
                write_uvarint(&mut self.body, s.size as u64);
            }
            LazyIterator::Transpose(s) => {
                write_uvarint(&mut self.body, s.sources.len() as u64);
                for src in &s.sources {
                    self.write_iterator(src);
                }
            }
            LazyIterator::Stream(s) => {
                self.write_str_bytes(&s.closure_name);
                self.write_optional_value(s.cached_next.as_ref());
                self.body.push(s.done as u8);
            }
        }
    }

    fn write_optional_value(&mut self, value: Option<&RuntimeValue>) {
        match value {
            Some(v) => {
                self.body.push(1);
                self.write_value(v);
            }
            None => self.body.push(0),
        }
    }
}

fn array_elem_ordinal(t: ArrayElemType) -> u8 {
    match t {
        ArrayElemType::Bool => 0,
        ArrayElemType::Byte => 1,
        ArrayElemType::Int => 2,
        ArrayElemType::Long => 3,
        ArrayElemType::Double => 4,
        ArrayElemType::Object => 5,
    }
}

fn array_elem_from_ordinal(ord: u8, offset: usize) -> Result<ArrayElemType, CheckpointFormatError> {
    Ok(match ord {
        0 => ArrayElemType::Bool,
        1 => ArrayElemType::Byte,
        2 => ArrayElemType::Int,
        3 => ArrayElemType::Long,
        4 => ArrayElemType::Double,
        5 => ArrayElemType::Object,
        _ => return Err(CheckpointFormatError::new(offset, "unknown array element type ordinal")),
    })
}

/// Serializes `root` into a complete checkpoint image. The header's
/// class-id drift hash (spec §4.2/§9) is `registry.drift_hash()` taken at
/// write time, re-derived and cross-checked by `restore()` against whatever
/// registry the host hands it back.
#[instrument(skip_all)]
pub fn checkpoint(root: &RuntimeValue, registry: &TypeRegistry) -> Vec<u8> {
    let header_len = {
        let mut v = Vec::new();
        write_uvarint(&mut v, CODEC_FORMAT_VERSION as u64);
        v.len() as u32 + 4 + 4 + 32
    };
    let mut writer = Writer::new(registry, header_len);
    writer.write_value(root);

    let num_objects = writer.offsets.len() as u32;
    let offset_table_start = header_len + writer.body.len() as u32;
    let drift_hash = registry.drift_hash();

    let mut image = Vec::with_capacity(header_len as usize + writer.body.len() + 4 * num_objects as usize);
    write_uvarint(&mut image, CODEC_FORMAT_VERSION as u64);
    write_u32_le(&mut image, num_objects);
    write_u32_le(&mut image, offset_table_start);
    image.extend_from_slice(&drift_hash);
    image.extend_from_slice(&writer.body);
    for offset in &writer.offsets {
        write_u32_le(&mut image, *offset);
    }
    debug!(
        num_objects,
        bytes = image.len(),
        "checkpoint_write: image written"
    );
    image
}

/// Restores a value graph from its wire bytes. Containers are restored with
/// a shell-then-populate trick: the empty `Rc` shell is recorded in `slots`
/// *before* its elements are parsed, so a self-reference encountered while
/// parsing those elements resolves to the same `Rc` rather than recursing
/// forever. `Array`/`Iterator`/`Continuation`/`Matcher`/`Function` are parsed
/// eagerly in one shot with no such cycle support (documented in DESIGN.md).
///
/// The writer's rear offset table is not consulted here — every object's
/// payload appears inline, depth-first, exactly where the writer put it, so
/// a single sequential pass recovers it all. The table is written for format
/// completeness (and to let a future lazy/partial restore jump straight to
/// one object) rather than because this reader needs it.
pub struct Reader<'a> {
    data: &'a [u8],
    slots: Vec<Option<RuntimeValue>>,
    registry: &'a TypeRegistry,
    closures: &'a ClosureRegistry,
}

impl<'a> Reader<'a> {
    fn read_str_bytes(&self, pos: &mut usize) -> Result<String, CheckpointFormatError> {
        let len = read_uvarint(self.data, pos)? as usize;
        let bytes = self
            .data
            .get(*pos..*pos + len)
            .ok_or_else(|| CheckpointFormatError::new(*pos, "unexpected end of buffer reading string"))?;
        *pos += len;
        String::from_utf8(bytes.to_vec())
            .map_err(|_| CheckpointFormatError::new(*pos, "string payload is not valid utf-8"))
    }

    fn read_tag(&self, pos: &mut usize) -> Result<TypeTag, CheckpointFormatError> {
        let byte = *self
            .data
            .get(*pos)
            .ok_or_else(|| CheckpointFormatError::new(*pos, "unexpected end of buffer reading tag"))?;
        *pos += 1;
        TypeTag::from_ordinal(byte).ok_or_else(|| {
            CheckpointFormatError::new(*pos - 1, format!("unknown type tag ordinal {byte}"))
        })
    }

    pub fn read_value(&mut self, pos: &mut usize) -> Result<RuntimeValue, CheckpointFormatError> {
        let tag = self.read_tag(pos)?;
        if is_inline_primitive(tag) {
            return self.read_primitive_payload(tag, pos);
        }
        if tag == TypeTag::Class {
            return self.read_class_ref(pos);
        }

        let id = read_uvarint(self.data, pos)? as usize;
        if id >= self.slots.len() {
            return Err(CheckpointFormatError::new(*pos, "object id out of range"));
        }
        if let Some(existing) = &self.slots[id] {
            return Ok(existing.clone());
        }

        match tag {
            TypeTag::String => {
                let s = self.read_str_bytes(pos)?;
                let value = RuntimeValue::Str(Rc::from(s.as_str()));
                self.slots[id] = Some(value.clone());
                Ok(value)
            }
            TypeTag::StringBuffer => {
                let s = self.read_str_bytes(pos)?;
                let value = RuntimeValue::StringBuffer(Rc::new(RefCell::new(s)));
                self.slots[id] = Some(value.clone());
                Ok(value)
            }
            TypeTag::List => {
                let shell = Rc::new(RefCell::new(Vec::new()));
                let value = RuntimeValue::List(shell.clone());
                self.slots[id] = Some(value.clone());
                let len = read_uvarint(self.data, pos)? as usize;
                let mut items = Vec::with_capacity(len);
                for _ in 0..len {
                    items.push(self.read_value(pos)?);
                }
                *shell.borrow_mut() = items;
                Ok(value)
            }
            TypeTag::Map => {
                let shell = Rc::new(RefCell::new(IndexMap::new()));
                let value = RuntimeValue::Map(shell.clone());
                self.slots[id] = Some(value.clone());
                let len = read_uvarint(self.data, pos)? as usize;
                let mut entries = IndexMap::with_capacity(len);
                for _ in 0..len {
                    let k = self.read_value(pos)?;
                    let v = self.read_value(pos)?;
                    entries.insert(k, v);
                }
                *shell.borrow_mut() = entries;
                Ok(value)
            }
            TypeTag::HeapLocal => {
                let shell = Rc::new(RefCell::new(RuntimeValue::Null));
                let value = RuntimeValue::HeapLocal(shell.clone());
                self.slots[id] = Some(value.clone());
                let inner = self.read_value(pos)?;
                *shell.borrow_mut() = inner;
                Ok(value)
            }
            TypeTag::Instance => {
                let class_name = self.read_str_bytes(pos)?;
                let class = self.registry.lookup_user_class(&class_name).ok_or_else(|| {
                    CheckpointFormatError::new(*pos, format!("class '{class_name}' missing from registry"))
                })?;
                let shell = Rc::new(InstanceValue { class, fields: RefCell::new(IndexMap::new()) });
                let value = RuntimeValue::Instance(shell.clone());
                self.slots[id] = Some(value.clone());
                let len = read_uvarint(self.data, pos)? as usize;
                let mut fields = IndexMap::with_capacity(len);
                for _ in 0..len {
                    let name = self.read_str_bytes(pos)?;
                    let v = self.read_value(pos)?;
                    fields.insert(name, v);
                }
                *shell.fields.borrow_mut() = fields;
                Ok(value)
            }
            TypeTag::Builtin => {
                let class_id = read_uvarint(self.data, pos)? as u32;
                let shell = Rc::new(BuiltinValue { builtin_class_id: class_id, fields: RefCell::new(IndexMap::new()) });
                let value = RuntimeValue::Builtin(shell.clone());
                self.slots[id] = Some(value.clone());
                let len = read_uvarint(self.data, pos)? as usize;
                let mut fields = IndexMap::with_capacity(len);
                for _ in 0..len {
                    let name = self.read_str_bytes(pos)?;
                    let v = self.read_value(pos)?;
                    fields.insert(name, v);
                }
                *shell.fields.borrow_mut() = fields;
                Ok(value)
            }
            TypeTag::Array => {
                let value = RuntimeValue::Array(self.read_array(pos)?);
                self.slots[id] = Some(value.clone());
                Ok(value)
            }
            TypeTag::Iterator => {
                let value = RuntimeValue::Iterator(Rc::new(RefCell::new(self.read_iterator(pos)?)));
                self.slots[id] = Some(value.clone());
                Ok(value)
            }
            TypeTag::Continuation => {
                let method_location = read_ivarint(self.data, pos)? as u32;
                let method_handle = self.read_method_handle(pos)?;
                let nprims = read_uvarint(self.data, pos)? as usize;
                let mut local_primitives = Vec::with_capacity(nprims);
                for _ in 0..nprims {
                    local_primitives.push(read_ivarint(self.data, pos)?);
                }
                let nobjs = read_uvarint(self.data, pos)? as usize;
                let mut local_objects = Vec::with_capacity(nobjs);
                for _ in 0..nobjs {
                    local_objects.push(self.read_value(pos)?);
                }
                let value = RuntimeValue::Continuation(Rc::new(RefCell::new(
                    crate::continuation::ContinuationFrame {
                        parent: None,
                        child: None,
                        method_handle,
                        method_location,
                        local_primitives,
                        local_objects,
                        async_task: None,
                        script_instance: None,
                        result: None,
                    },
                )));
                self.slots[id] = Some(value.clone());
                Ok(value)
            }
            TypeTag::Matcher => {
                let value = RuntimeValue::Matcher(Rc::new(RefCell::new(self.read_matcher(pos)?)));
                self.slots[id] = Some(value.clone());
                Ok(value)
            }
            TypeTag::Function => {
                let value = RuntimeValue::Function(self.read_method_handle(pos)?);
                self.slots[id] = Some(value.clone());
                Ok(value)
            }
            _ => Err(CheckpointFormatError::new(*pos, format!("{tag:?} is not a shareable type"))),
        }
    }

    fn read_primitive_payload(
        &self,
        tag: TypeTag,
        pos: &mut usize,
    ) -> Result<RuntimeValue, CheckpointFormatError> {
        Ok(match tag {
            TypeTag::Null => RuntimeValue::Null,
            TypeTag::Boolean => {
                let b = *self.data.get(*pos).ok_or_else(|| {
                    CheckpointFormatError::new(*pos, "unexpected end of buffer reading bool")
                })?;
                *pos += 1;
                RuntimeValue::Bool(b != 0)
            }
            TypeTag::Byte => {
                let b = *self.data.get(*pos).ok_or_else(|| {
                    CheckpointFormatError::new(*pos, "unexpected end of buffer reading byte")
                })?;
                *pos += 1;
                RuntimeValue::Byte(b)
            }
            TypeTag::Int => RuntimeValue::Int(read_ivarint(self.data, pos)? as i32),
            TypeTag::Long => RuntimeValue::Long(read_ivarint(self.data, pos)?),
            TypeTag::Double => {
                let bytes = self.data.get(*pos..*pos + 8).ok_or_else(|| {
                    CheckpointFormatError::new(*pos, "unexpected end of buffer reading double")
                })?;
                *pos += 8;
                RuntimeValue::Double(f64::from_bits(u64::from_le_bytes(bytes.try_into().unwrap())))
            }
            TypeTag::Decimal => {
                let s = self.read_str_bytes(pos)?;
                let d = s
                    .parse()
                    .map_err(|_| CheckpointFormatError::new(*pos, "invalid decimal text"))?;
                RuntimeValue::Decimal(d)
            }
            _ => unreachable!("not an inline primitive"),
        })
    }

    fn read_class_ref(&self, pos: &mut usize) -> Result<RuntimeValue, CheckpointFormatError> {
        let kind = *self
            .data
            .get(*pos)
            .ok_or_else(|| CheckpointFormatError::new(*pos, "unexpected end of buffer reading class ref"))?;
        *pos += 1;
        if kind == 0 {
            let id = read_uvarint(self.data, pos)? as u32;
            let name = self
                .registry
                .builtin_name(id)
                .ok_or_else(|| CheckpointFormatError::new(*pos, format!("no built-in class registered for id {id}")))?;
            let class = self.registry.lookup_user_class(&name).ok_or_else(|| {
                CheckpointFormatError::new(*pos, format!("built-in class '{name}' missing its descriptor"))
            })?;
            Ok(RuntimeValue::Class(class))
        } else {
            let name = self.read_str_bytes(pos)?;
            let class = self
                .registry
                .lookup_user_class(&name)
                .ok_or_else(|| CheckpointFormatError::new(*pos, format!("class '{name}' missing from registry")))?;
            Ok(RuntimeValue::Class(class))
        }
    }

    fn read_array(&mut self, pos: &mut usize) -> Result<ArrayValue, CheckpointFormatError> {
        let elem_byte = *self
            .data
            .get(*pos)
            .ok_or_else(|| CheckpointFormatError::new(*pos, "unexpected end of buffer reading array element type"))?;
        *pos += 1;
        let elem_type = array_elem_from_ordinal(elem_byte, *pos)?;
        let dims = *self
            .data
            .get(*pos)
            .ok_or_else(|| CheckpointFormatError::new(*pos, "unexpected end of buffer reading array dims"))?;
        *pos += 1;
        let len = read_uvarint(self.data, pos)? as usize;
        let data = match elem_type {
            ArrayElemType::Bool => {
                let nbytes = (len + 7) / 8;
                let bytes = self
                    .data
                    .get(*pos..*pos + nbytes)
                    .ok_or_else(|| CheckpointFormatError::new(*pos, "unexpected end of buffer reading bool array"))?;
                *pos += nbytes;
                let mut v = Vec::with_capacity(len);
                for i in 0..len {
                    v.push(bytes[i / 8] & (1 << (i % 8)) != 0);
                }
                ArrayData::Bool(Rc::new(RefCell::new(v)))
            }
            ArrayElemType::Byte => {
                let bytes = self
                    .data
                    .get(*pos..*pos + len)
                    .ok_or_else(|| CheckpointFormatError::new(*pos, "unexpected end of buffer reading byte array"))?;
                *pos += len;
                ArrayData::Byte(Rc::new(RefCell::new(bytes.to_vec())))
            }
            ArrayElemType::Int => {
                let mut v = Vec::with_capacity(len);
                for _ in 0..len {
                    v.push(read_ivarint(self.data, pos)? as i32);
                }
                ArrayData::Int(Rc::new(RefCell::new(v)))
            }
            ArrayElemType::Long => {
                let mut v = Vec::with_capacity(len);
                for _ in 0..len {
                    v.push(read_ivarint(self.data, pos)?);
                }
                ArrayData::Long(Rc::new(RefCell::new(v)))
            }
            ArrayElemType::Double => {
                let mut v = Vec::with_capacity(len);
                for _ in 0..len {
                    let bytes = self.data.get(*pos..*pos + 8).ok_or_else(|| {
                        CheckpointFormatError::new(*pos, "unexpected end of buffer reading double array")
                    })?;
                    *pos += 8;
                    v.push(f64::from_bits(u64::from_le_bytes(bytes.try_into().unwrap())));
                }
                ArrayData::Double(Rc::new(RefCell::new(v)))
            }
            ArrayElemType::Object => {
                let mut v = Vec::with_capacity(len);
                for _ in 0..len {
                    v.push(self.read_value(pos)?);
                }
                ArrayData::Object(Rc::new(RefCell::new(v)))
            }
        };
        Ok(ArrayValue { elem_type, dims, data })
    }

    fn read_method_handle(&mut self, pos: &mut usize) -> Result<MethodHandle, CheckpointFormatError> {
        let kind = *self
            .data
            .get(*pos)
            .ok_or_else(|| CheckpointFormatError::new(*pos, "unexpected end of buffer reading method handle"))?;
        *pos += 1;
        Ok(match kind {
            0 => {
                let class_kind = *self.data.get(*pos).ok_or_else(|| {
                    CheckpointFormatError::new(*pos, "unexpected end of buffer reading class ref kind")
                })?;
                *pos += 1;
                let owning_class = if class_kind == 0 {
                    let id = read_uvarint(self.data, pos)? as u32;
                    ClassRef::BuiltinId(id)
                } else {
                    ClassRef::Named(self.read_str_bytes(pos)?)
                };
                let handle_field = self.read_str_bytes(pos)?;
                MethodHandle::Plain(PlainHandle { owning_class, handle_field })
            }
            1 => {
                let iterator_variant_tag = read_uvarint(self.data, pos)? as u32;
                let handle_field = self.read_str_bytes(pos)?;
                MethodHandle::Iterator(IteratorHandle { iterator_variant_tag, handle_field })
            }
            2 => {
                let has_owner = *self.data.get(*pos).ok_or_else(|| {
                    CheckpointFormatError::new(*pos, "unexpected end of buffer reading wrapper owner flag")
                })?;
                *pos += 1;
                let owner_type = if has_owner == 1 {
                    Some(self.read_str_bytes(pos)?)
                } else {
                    None
                };
                let function_name = self.read_str_bytes(pos)?;
                MethodHandle::Wrapper(WrapperHandle { owner_type, function_name })
            }
            3 => {
                let inner = self.read_method_handle(pos)?;
                let receiver = self.read_value(pos)?;
                MethodHandle::Bound(Rc::new(BoundHandle { inner: Box::new(inner), receiver }))
            }
            _ => return Err(CheckpointFormatError::new(*pos, "unknown method handle kind")),
        })
    }

    fn read_matcher(&mut self, pos: &mut usize) -> Result<MatcherState, CheckpointFormatError> {
        let subject = self.read_str_bytes(pos)?;
        let pattern = self.read_str_bytes(pos)?;
        let modifiers = self.read_str_bytes(pos)?;
        let last_end = read_uvarint(self.data, pos)? as usize;
        let regex = regex::Regex::new(&pattern)
            .map_err(|_| CheckpointFormatError::new(*pos, "invalid regex pattern in checkpoint"))?;
        Ok(MatcherState { subject: Rc::from(subject.as_str()), pattern, modifiers, last_end, regex })
    }

    fn read_iterator(&mut self, pos: &mut usize) -> Result<LazyIterator, CheckpointFormatError> {
        let variant_ord = read_uvarint(self.data, pos)?;
        let version = read_uvarint(self.data, pos)?;
        if version != ITERATOR_FORMAT_VERSION as u64 {
            return Err(CheckpointFormatError::new(*pos, "iterator checkpoint format version mismatch"));
        }
        let variant = iterator_variant_from_ordinal(variant_ord, *pos)?;
        Ok(match variant {
            IteratorVariant::ListSource => {
                let RuntimeValue::List(source) = self.read_value(pos)? else {
                    return Err(CheckpointFormatError::new(*pos, "expected list for ListSource"));
                };
                let index = read_uvarint(self.data, pos)? as usize;
                LazyIterator::ListSource(ListSourceState { source, index })
            }
            IteratorVariant::MapEntriesSource => {
                let RuntimeValue::Map(source) = self.read_value(pos)? else {
                    return Err(CheckpointFormatError::new(*pos, "expected map for MapEntriesSource"));
                };
                let index = read_uvarint(self.data, pos)? as usize;
                let start_count = read_uvarint(self.data, pos)? as usize;
                LazyIterator::MapEntriesSource(MapEntriesSourceState { source, index, start_count })
            }
            IteratorVariant::ArraySource => {
                let source = self.read_array(pos)?;
                let index = read_uvarint(self.data, pos)? as usize;
                LazyIterator::ArraySource(ArraySourceState { source, index })
            }
            IteratorVariant::RangeSource => {
                let current = read_ivarint(self.data, pos)?;
                let end = read_ivarint(self.data, pos)?;
                let step = read_ivarint(self.data, pos)?;
                LazyIterator::RangeSource(RangeSourceState { current, end, step })
            }
            IteratorVariant::CharsSource => {
                let source = self.read_str_bytes(pos)?;
                let index = read_uvarint(self.data, pos)? as usize;
                LazyIterator::CharsSource(CharsSourceState { source: Rc::from(source.as_str()), index })
            }
            IteratorVariant::StringSplit => {
                let matcher = self.read_matcher(pos)?;
                let find_next = self.read_bool(pos)?;
                let last = self.read_bool(pos)?;
                LazyIterator::StringSplit(StringSplitState { matcher, find_next, has_next_cached: None, last })
            }
            IteratorVariant::Filter => {
                let source = Box::new(self.read_iterator(pos)?);
                let has_name = self.read_bool(pos)?;
                let closure_name = if has_name { Some(self.read_str_bytes(pos)?) } else { None };
                let closure = match &closure_name {
                    Some(n) => Some(self.closures.lookup_predicate(n).map_err(|e| {
                        CheckpointFormatError::new(*pos, e.0)
                    })?),
                    None => None,
                };
                let lookahead = self.read_optional_value(pos)?;
                let has_lookahead = lookahead.is_some();
                let location = read_uvarint(self.data, pos)? as u32;
                LazyIterator::Filter(FilterState {
                    source,
                    closure,
                    closure_name,
                    lookahead,
                    has_lookahead,
                    location,
                })
            }
            IteratorVariant::Map => {
                let source = Box::new(self.read_iterator(pos)?);
                let closure_name = self.read_str_bytes(pos)?;
                let closure = self
                    .closures
                    .lookup_map(&closure_name)
                    .map_err(|e| CheckpointFormatError::new(*pos, e.0))?;
                let with_index = self.read_bool(pos)?;
                let index = read_uvarint(self.data, pos)?;
                let location = read_uvarint(self.data, pos)? as u32;
                LazyIterator::Map(MapState { source, closure, closure_name, with_index, index, location })
            }
            IteratorVariant::FlatMap => {
                let source = Box::new(self.read_iterator(pos)?);
                let closure_name = self.read_str_bytes(pos)?;
                let closure = self
                    .closures
                    .lookup_flat_map(&closure_name)
                    .map_err(|e| CheckpointFormatError::new(*pos, e.0))?;
                let has_inner = self.read_bool(pos)?;
                let inner = if has_inner {
                    Some(Box::new(self.read_iterator(pos)?))
                } else {
                    None
                };
                let location = read_uvarint(self.data, pos)? as u32;
                LazyIterator::FlatMap(FlatMapState { source, closure, closure_name, inner, location })
            }
            IteratorVariant::Unique => {
                let source = Box::new(self.read_iterator(pos)?);
                let previous = self.read_optional_value(pos)?;
                let first = self.read_bool(pos)?;
                let location = read_uvarint(self.data, pos)? as u32;
                LazyIterator::Unique(UniqueState { source, previous, first, location })
            }
            IteratorVariant::Limit => {
                let source = Box::new(self.read_iterator(pos)?);
                let n = read_uvarint(self.data, pos)?;
                let emitted = read_uvarint(self.data, pos)?;
                LazyIterator::Limit(crate::iterator::LimitState { source, n, emitted })
            }
            IteratorVariant::NegativeLimit => {
                let source = Box::new(self.read_iterator(pos)?);
                let n_abs = read_uvarint(self.data, pos)? as usize;
                let buffer = self.read_value_deque(pos)?;
                let source_exhausted = self.read_bool(pos)?;
                LazyIterator::NegativeLimit(NegativeLimitState { source, n_abs, buffer, source_exhausted })
            }
            IteratorVariant::Skip => {
                let source = Box::new(self.read_iterator(pos)?);
                let n = read_uvarint(self.data, pos)?;
                let skipped = read_uvarint(self.data, pos)?;
                LazyIterator::Skip(SkipState { source, n, skipped })
            }
            IteratorVariant::NegativeSkip => {
                let source = Box::new(self.read_iterator(pos)?);
                let n_abs = read_uvarint(self.data, pos)? as usize;
                let buffer = self.read_value_deque(pos)?;
                let source_exhausted = self.read_bool(pos)?;
                LazyIterator::NegativeSkip(NegativeSkipState { source, n_abs, buffer, source_exhausted })
            }
            IteratorVariant::Grouped => {
                let source = Box::new(self.read_iterator(pos)?);
                let size = read_uvarint(self.data, pos)? as usize;
                LazyIterator::Grouped(GroupedState { source, size })
            }
            IteratorVariant::Transpose => {
                let n = read_uvarint(self.data, pos)? as usize;
                let mut sources = Vec::with_capacity(n);
                for _ in 0..n {
                    sources.push(self.read_iterator(pos)?);
                }
                LazyIterator::Transpose(TransposeState { sources })
            }
            IteratorVariant::Stream => {
                let closure_name = self.read_str_bytes(pos)?;
                let closure = self
                    .closures
                    .lookup_stream(&closure_name)
                    .map_err(|e| CheckpointFormatError::new(*pos, e.0))?;
                let cached_next = self.read_optional_value(pos)?;
                let done = self.read_bool(pos)?;
                LazyIterator::Stream(StreamState { closure, closure_name, cached_next, done })
            }
        })
    }

    fn read_bool(&self, pos: &mut usize) -> Result<bool, CheckpointFormatError> {
        let b = *self
            .data
            .get(*pos)
            .ok_or_else(|| CheckpointFormatError::new(*pos, "unexpected end of buffer reading bool flag"))?;
        *pos += 1;
        Ok(b != 0)
    }

    fn read_optional_value(&mut self, pos: &mut usize) -> Result<Option<RuntimeValue>, CheckpointFormatError> {
        if self.read_bool(pos)? {
            Ok(Some(self.read_value(pos)?))
        } else {
            Ok(None)
        }
    }

    fn read_value_deque(&mut self, pos: &mut usize) -> Result<VecDeque<RuntimeValue>, CheckpointFormatError> {
        let len = read_uvarint(self.data, pos)? as usize;
        let mut deque = VecDeque::with_capacity(len);
        for _ in 0..len {
            deque.push_back(self.read_value(pos)?);
        }
        Ok(deque)
    }
}

fn iterator_variant_from_ordinal(ord: u64, offset: usize) -> Result<IteratorVariant, CheckpointFormatError> {
    use IteratorVariant::*;
    Ok(match ord {
        0 => ListSource,
        1 => MapEntriesSource,
        2 => ArraySource,
        3 => RangeSource,
        4 => CharsSource,
        5 => StringSplit,
        6 => Filter,
        7 => Map,
        8 => FlatMap,
        9 => Unique,
        10 => Limit,
        11 => NegativeLimit,
        12 => Skip,
        13 => NegativeSkip,
        14 => Grouped,
        15 => Transpose,
        16 => Stream,
        _ => return Err(CheckpointFormatError::new(offset, "unknown iterator variant ordinal")),
    })
}

/// Restores a checkpoint image produced by `checkpoint`. Cross-checks the
/// header's recorded class-id drift hash against `registry.drift_hash()`
/// before touching the body, per spec §4.2/§9: a registry rebuilt with a
/// different set (or order) of built-ins is a hard error, not something to
/// silently remap around.
#[instrument(skip_all, fields(bytes = data.len()))]
pub fn restore(
    data: &[u8],
    registry: &TypeRegistry,
    closures: &ClosureRegistry,
) -> Result<RuntimeValue, CheckpointFormatError> {
    let mut pos = 0usize;
    let version = read_uvarint(data, &mut pos)?;
    if version != CODEC_FORMAT_VERSION as u64 {
        return Err(CheckpointFormatError::new(pos, "checkpoint format version mismatch"));
    }
    let num_objects = read_u32_le(data, &mut pos)?;
    let _offset_table_start = read_u32_le(data, &mut pos)?;
    let drift_hash = read_drift_hash(data, &mut pos)?;
    registry.verify_drift_hash(&drift_hash, pos)?;

    let mut reader = Reader {
        data,
        slots: (0..num_objects).map(|_| None).collect(),
        registry,
        closures,
    };

    let root = reader.read_value(&mut pos)?;
    debug!(num_objects, "checkpoint_read: image restored");
    Ok(root)
}

fn read_drift_hash(data: &[u8], pos: &mut usize) -> Result<[u8; 32], CheckpointFormatError> {
    let bytes = data.get(*pos..*pos + 32).ok_or_else(|| {
        CheckpointFormatError::new(*pos, "unexpected end of buffer while reading drift hash")
    })?;
    *pos += 32;
    Ok(bytes.try_into().unwrap())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    fn empty_registry_and_closures() -> (TypeRegistry, ClosureRegistry) {
        (TypeRegistry::new(), ClosureRegistry::new())
    }

    #[test]
    fn cyclic_list_round_trips_with_preserved_identity() {
        let (registry, closures) = empty_registry_and_closures();
        let list = Rc::new(RefCell::new(vec![RuntimeValue::Int(1), RuntimeValue::Int(2)]));
        let root = RuntimeValue::List(list.clone());
        list.borrow_mut().push(root.clone());

        let bytes = checkpoint(&root, &registry);
        let restored = restore(&bytes, &registry, &closures).unwrap();

        let RuntimeValue::List(restored_list) = &restored else {
            panic!("expected list");
        };
        assert_eq!(restored_list.borrow().len(), 3);
        assert_eq!(restored_list.borrow()[0], RuntimeValue::Int(1));
        assert_eq!(restored_list.borrow()[1], RuntimeValue::Int(2));
        let RuntimeValue::List(self_ref) = &restored_list.borrow()[2] else {
            panic!("expected list");
        };
        assert!(Rc::ptr_eq(self_ref, restored_list));
    }

    #[test]
    fn double_and_decimal_round_trip() {
        let (registry, closures) = empty_registry_and_closures();
        let root = RuntimeValue::List(Rc::new(RefCell::new(vec![
            RuntimeValue::Double(3.5),
            RuntimeValue::Decimal("12.340".parse().unwrap()),
        ])));
        let bytes = checkpoint(&root, &registry);
        let restored = restore(&bytes, &registry, &closures).unwrap();
        let RuntimeValue::List(l) = restored else { panic!() };
        assert_eq!(l.borrow()[0], RuntimeValue::Double(3.5));
        assert_eq!(l.borrow()[1], RuntimeValue::Decimal("12.340".parse().unwrap()));
    }

    #[test]
    fn instance_fields_round_trip_through_registry() {
        let (registry, closures) = empty_registry_and_closures();
        let mut fields = IndexMap::new();
        fields.insert("x".to_string(), TypeTag::Int);
        let class = Rc::new(ClassDescriptor {
            declared_name: "Point".to_string(),
            fully_qualified_name: "Point".to_string(),
            package: String::new(),
            internal_name: "Point".to_string(),
            is_interface: false,
            base_class: RefCell::new(None),
            interfaces: vec![],
            fields,
            mandatory_fields: vec![],
            methods: RefCell::new(IndexMap::new()),
            static_fields: RefCell::new(IndexMap::new()),
            inner_classes: RefCell::new(IndexMap::new()),
            enclosing_class: RefCell::new(None),
            is_script_defined: true,
            cyclic: Cell::new(false),
        });
        registry.register_user_class(class.clone());
        let mut instance_fields = IndexMap::new();
        instance_fields.insert("x".to_string(), RuntimeValue::Int(42));
        let root = RuntimeValue::Instance(Rc::new(InstanceValue { class, fields: RefCell::new(instance_fields) }));

        let bytes = checkpoint(&root, &registry);
        let restored = restore(&bytes, &registry, &closures).unwrap();
        let RuntimeValue::Instance(inst) = restored else { panic!() };
        assert_eq!(inst.fields.borrow().get("x"), Some(&RuntimeValue::Int(42)));
    }

    #[test]
    fn offset_table_entry_count_matches_header() {
        let (registry, _closures) = empty_registry_and_closures();
        let root = RuntimeValue::Str(Rc::from("hello"));
        let bytes = checkpoint(&root, &registry);
        let mut pos = 0;
        let _version = read_uvarint(&bytes, &mut pos).unwrap();
        let num_objects = read_u32_le(&bytes, &mut pos).unwrap();
        let offset_table_start = read_u32_le(&bytes, &mut pos).unwrap();
        assert_eq!(num_objects, 1);
        assert_eq!(offset_table_start as usize + 4 * num_objects as usize, bytes.len());
    }

    #[test]
    fn restore_rejects_a_checkpoint_written_by_a_differently_built_registry() {
        let closures = ClosureRegistry::new();
        let writer_registry = TypeRegistry::new();
        writer_registry.register_builtin("List");
        writer_registry.register_builtin("Map");
        let bytes = checkpoint(&RuntimeValue::Int(5), &writer_registry);

        let reader_registry = TypeRegistry::new();
        reader_registry.register_builtin("List");
        let err = restore(&bytes, &reader_registry, &closures).unwrap_err();
        assert!(err.reason.contains("does not match"));

        reader_registry.register_builtin("Map");
        assert!(restore(&bytes, &reader_registry, &closures).is_ok());
    }

    #[test]
    fn malformed_tag_byte_is_a_checkpoint_format_error() {
        let (registry, closures) = empty_registry_and_closures();
        let mut bytes = checkpoint(&RuntimeValue::Int(5), &registry);
        let header_len = {
            let mut v = Vec::new();
            write_uvarint(&mut v, CODEC_FORMAT_VERSION as u64);
            v.len() + 4 + 4 + 32
        };
        bytes[header_len] = 200; // corrupt the root's type tag
        let err = restore(&bytes, &registry, &closures).unwrap_err();
        assert!(err.reason.contains("unknown type tag"));
    }
}
