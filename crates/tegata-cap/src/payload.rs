//! Scratch message arenas for call params and results.
//!
//! A [`Payload`] is an in-memory pointer tree: opaque data leaves, struct
//! nodes with numbered pointer fields, and capability slots. Builders and
//! readers are cheap handles into the same arena; the single-writer rule
//! (request sender before send, server between first results access and
//! return) is a protocol, not a type-level guarantee. Serialization is a
//! concern of the surrounding framework; this module never leaves process
//! memory.

use std::cell::RefCell;
use std::rc::Rc;

use crate::broken;
use crate::capability::{ClientHook, PipelineOp};
use crate::error::Error;

type Slot = Rc<RefCell<Value>>;

enum Value {
    Null,
    Data(Vec<u8>),
    Struct(StructValue),
    Capability(Box<dyn ClientHook>),
}

#[derive(Default)]
struct StructValue {
    data: Vec<u8>,
    pointers: Vec<Slot>,
}

impl StructValue {
    fn with_pointers(count: usize) -> Self {
        let mut value = Self::default();
        value.grow_pointers(count);
        value
    }

    fn grow_pointers(&mut self, count: usize) {
        while self.pointers.len() < count {
            self.pointers.push(null_slot());
        }
    }
}

fn null_slot() -> Slot {
    Rc::new(RefCell::new(Value::Null))
}

/// Deep copy; capability slots are re-referenced, not duplicated.
fn clone_value(value: &Value) -> Value {
    match value {
        Value::Null => Value::Null,
        Value::Data(bytes) => Value::Data(bytes.clone()),
        Value::Capability(hook) => Value::Capability(hook.add_ref()),
        Value::Struct(strukt) => Value::Struct(StructValue {
            data: strukt.data.clone(),
            pointers: strukt
                .pointers
                .iter()
                .map(|slot| Rc::new(RefCell::new(clone_value(&slot.borrow()))))
                .collect(),
        }),
    }
}

/// One message arena. Cloning yields another handle to the same arena.
#[derive(Clone)]
pub struct Payload {
    root: Slot,
}

impl Payload {
    /// A fresh arena with a null root. Size hints from callers are advisory;
    /// the arena grows on demand.
    pub fn new() -> Self {
        Self { root: null_slot() }
    }

    pub fn root_builder(&self) -> PayloadBuilder {
        PayloadBuilder {
            slot: self.root.clone(),
        }
    }

    pub fn root_reader(&self) -> PayloadReader {
        PayloadReader {
            slot: self.root.clone(),
        }
    }
}

impl Default for Payload {
    fn default() -> Self {
        Self::new()
    }
}

/// Write handle to one slot of an arena.
#[derive(Clone)]
pub struct PayloadBuilder {
    slot: Slot,
}

impl PayloadBuilder {
    pub fn set_data(&self, bytes: &[u8]) {
        *self.slot.borrow_mut() = Value::Data(bytes.to_vec());
    }

    pub fn set_capability(&self, cap: Box<dyn ClientHook>) {
        *self.slot.borrow_mut() = Value::Capability(cap);
    }

    /// Replace this slot with a struct of `pointer_count` null pointers.
    pub fn init_struct(&self, pointer_count: u16) -> StructBuilder {
        *self.slot.borrow_mut() = Value::Struct(StructValue::with_pointers(pointer_count as usize));
        StructBuilder {
            slot: self.slot.clone(),
        }
    }

    /// Deep-copy `source` into this slot. Capabilities in the source are
    /// shared by reference.
    pub fn set_as(&self, source: &PayloadReader) {
        let copied = clone_value(&source.slot.borrow());
        *self.slot.borrow_mut() = copied;
    }

    pub fn clear(&self) {
        *self.slot.borrow_mut() = Value::Null;
    }

    pub fn as_reader(&self) -> PayloadReader {
        PayloadReader {
            slot: self.slot.clone(),
        }
    }
}

/// Write handle to a struct node.
#[derive(Clone)]
pub struct StructBuilder {
    slot: Slot,
}

impl StructBuilder {
    pub fn set_data(&self, bytes: &[u8]) {
        let mut value = self.slot.borrow_mut();
        if !matches!(&*value, Value::Struct(_)) {
            *value = Value::Struct(StructValue::default());
        }
        let Value::Struct(strukt) = &mut *value else {
            unreachable!()
        };
        strukt.data = bytes.to_vec();
    }

    /// Builder for pointer field `index`, growing the pointer section if
    /// needed.
    pub fn get_pointer_field(&self, index: u16) -> PayloadBuilder {
        let mut value = self.slot.borrow_mut();
        if !matches!(&*value, Value::Struct(_)) {
            *value = Value::Struct(StructValue::default());
        }
        let Value::Struct(strukt) = &mut *value else {
            unreachable!()
        };
        strukt.grow_pointers(index as usize + 1);
        PayloadBuilder {
            slot: strukt.pointers[index as usize].clone(),
        }
    }
}

/// Read handle to one slot of an arena. Readers are snapshots by protocol:
/// nobody writes an arena that has outstanding readers.
#[derive(Clone)]
pub struct PayloadReader {
    slot: Slot,
}

impl PayloadReader {
    pub fn is_null(&self) -> bool {
        matches!(&*self.slot.borrow(), Value::Null)
    }

    /// The data leaf at this slot, if that is what it holds.
    pub fn data(&self) -> Option<Vec<u8>> {
        match &*self.slot.borrow() {
            Value::Data(bytes) => Some(bytes.clone()),
            _ => None,
        }
    }

    pub fn as_struct(&self) -> Option<StructReader> {
        match &*self.slot.borrow() {
            Value::Struct(_) => Some(StructReader {
                slot: self.slot.clone(),
            }),
            _ => None,
        }
    }

    /// The capability at this slot. A null slot yields the null capability;
    /// any other non-capability value yields a broken hook describing the
    /// mismatch.
    pub fn get_capability(&self) -> Box<dyn ClientHook> {
        match &*self.slot.borrow() {
            Value::Capability(hook) => hook.add_ref(),
            Value::Null => broken::null_cap(),
            _ => broken::new_cap(Error::failed("value at this location is not a capability")),
        }
    }

    /// Walk a pipeline-op path from this slot and extract the capability at
    /// its end.
    pub fn get_pipelined_cap(&self, ops: &[PipelineOp]) -> Box<dyn ClientHook> {
        let mut slot = self.slot.clone();
        for op in ops {
            match op {
                PipelineOp::Noop => {}
                PipelineOp::GetPointerField(index) => {
                    let next = match &*slot.borrow() {
                        Value::Struct(strukt) => strukt
                            .pointers
                            .get(*index as usize)
                            .cloned()
                            .unwrap_or_else(null_slot),
                        Value::Null => null_slot(),
                        _ => {
                            return broken::new_cap(Error::failed(
                                "pipeline op applied to a non-struct value",
                            ))
                        }
                    };
                    slot = next;
                }
            }
        }
        PayloadReader { slot }.get_capability()
    }
}

/// Read handle to a struct node.
#[derive(Clone)]
pub struct StructReader {
    slot: Slot,
}

impl StructReader {
    pub fn data(&self) -> Vec<u8> {
        match &*self.slot.borrow() {
            Value::Struct(strukt) => strukt.data.clone(),
            _ => Vec::new(),
        }
    }

    /// Reader for pointer field `index`; out-of-range fields read as null.
    pub fn get_pointer_field(&self, index: u16) -> PayloadReader {
        let slot = match &*self.slot.borrow() {
            Value::Struct(strukt) => strukt
                .pointers
                .get(index as usize)
                .cloned()
                .unwrap_or_else(null_slot),
            _ => null_slot(),
        };
        PayloadReader { slot }
    }
}
