//! Live program configurations.
//!
//! A [`Configuration`] is what the interpreter works on: a globals object, one
//! stack of frame pointers per thread and a heap of objects. Objects are raw
//! bytes plus the offsets of the 8-byte pointer slots inside them. The
//! canonicalizer turns a configuration into a state block payload and
//! [`Configuration::restore`] turns a payload back into a configuration.

use smallvec::SmallVec;
use std::fmt;
use thiserror::Error;

/// Width of a pointer slot in bytes.
pub const POINTER_SIZE: usize = 8;

/// Objects addressable by a heap pointer.
pub const MAX_OBJECTS: usize = (1 << 20) - 1;

const KIND_SHIFT: u32 = 62;
const GEN_SHIFT: u32 = 52;
const OBJ_SHIFT: u32 = 32;
const GEN_MASK: u64 = (1 << 10) - 1;
const OBJ_MASK: u64 = (1 << 20) - 1;

/// Errors raised while building or restoring a configuration.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum HeapError {
    #[error("heap object limit ({MAX_OBJECTS}) reached")]
    ObjectLimit,

    #[error("pointer slot at offset {offset} does not fit an object of {len} bytes")]
    SlotOutOfBounds { offset: u32, len: usize },

    #[error("malformed state payload at byte {at}: {reason}")]
    Malformed { at: usize, reason: &'static str },
}

/// What a pointer refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PointerKind {
    Null,
    Heap,
    Global,
    Code,
}

/// A 64-bit pointer: `[kind:2][generation:10][object:20][offset:32]`.
///
/// The all-zero value is null. Generations let the heap tell a pointer into a
/// freed (and possibly reused) object slot apart from a live one.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Pointer(u64);

impl Pointer {
    pub const NULL: Pointer = Pointer(0);

    /// Canonical stand-in for every pointer that fails validation.
    pub const INVALID: Pointer = Pointer((1 << KIND_SHIFT) | (GEN_MASK << GEN_SHIFT) | (OBJ_MASK << OBJ_SHIFT) | 0xFFFF_FFFF);

    fn pack(kind: u64, generation: u16, object: u32, offset: u32) -> Self {
        Pointer(
            (kind << KIND_SHIFT)
                | ((generation as u64 & GEN_MASK) << GEN_SHIFT)
                | ((object as u64 & OBJ_MASK) << OBJ_SHIFT)
                | offset as u64,
        )
    }

    pub fn heap(object: u32, generation: u16, offset: u32) -> Self {
        Self::pack(1, generation, object, offset)
    }

    pub fn global(object: u32, offset: u32) -> Self {
        Self::pack(2, 0, object, offset)
    }

    pub fn code(function: u32, instruction: u32) -> Self {
        Self::pack(3, 0, function, instruction)
    }

    #[inline]
    pub fn from_raw(raw: u64) -> Self {
        Pointer(raw)
    }

    #[inline]
    pub fn raw(self) -> u64 {
        self.0
    }

    #[inline]
    pub fn is_null(self) -> bool {
        self.0 == 0
    }

    /// Kind of the pointer. A non-zero value in the null kind reads as `None`:
    /// it is garbage rather than a null pointer.
    pub fn kind(self) -> Option<PointerKind> {
        match self.0 >> KIND_SHIFT {
            0 if self.0 == 0 => Some(PointerKind::Null),
            0 => None,
            1 => Some(PointerKind::Heap),
            2 => Some(PointerKind::Global),
            _ => Some(PointerKind::Code),
        }
    }

    #[inline]
    pub fn generation(self) -> u16 {
        ((self.0 >> GEN_SHIFT) & GEN_MASK) as u16
    }

    #[inline]
    pub fn object(self) -> u32 {
        ((self.0 >> OBJ_SHIFT) & OBJ_MASK) as u32
    }

    #[inline]
    pub fn offset(self) -> u32 {
        self.0 as u32
    }

    /// Same target object, different offset.
    pub fn with_offset(self, offset: u32) -> Self {
        Pointer((self.0 & !0xFFFF_FFFF) | offset as u64)
    }
}

impl fmt::Debug for Pointer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind() {
            Some(PointerKind::Null) => write!(f, "null"),
            _ if *self == Pointer::INVALID => write!(f, "invalid"),
            Some(PointerKind::Heap) => write!(
                f,
                "heap:{}@{}+{}",
                self.object(),
                self.generation(),
                self.offset()
            ),
            Some(PointerKind::Global) => write!(f, "global:{}+{}", self.object(), self.offset()),
            Some(PointerKind::Code) => write!(f, "code:{}+{}", self.object(), self.offset()),
            None => write!(f, "garbage:{:016x}", self.0),
        }
    }
}

/// Most objects carry only a few pointers.
type PointerSlots = SmallVec<[u32; 4]>;

/// A block of memory with known pointer slots.
#[derive(Clone, PartialEq, Eq, Default)]
pub struct Object {
    data: Vec<u8>,
    /// Sorted, non-overlapping offsets of pointer slots.
    pointers: PointerSlots,
}

impl Object {
    pub fn new(len: usize) -> Self {
        Self {
            data: vec![0; len],
            pointers: PointerSlots::new(),
        }
    }

    /// An object of `len` bytes with pointer slots at `slots`.
    pub fn with_pointers(len: usize, slots: &[u32]) -> Result<Self, HeapError> {
        let mut obj = Self::new(len);
        for &offset in slots {
            obj.add_pointer_slot(offset)?;
        }
        Ok(obj)
    }

    pub(crate) fn from_parts(data: Vec<u8>, pointers: Vec<u32>) -> Self {
        Self {
            data,
            pointers: PointerSlots::from_vec(pointers),
        }
    }

    /// Declare a pointer slot. Slots stay sorted by offset.
    pub fn add_pointer_slot(&mut self, offset: u32) -> Result<(), HeapError> {
        if offset as usize + POINTER_SIZE > self.data.len() {
            return Err(HeapError::SlotOutOfBounds {
                offset,
                len: self.data.len(),
            });
        }
        if let Err(pos) = self.pointers.binary_search(&offset) {
            self.pointers.insert(pos, offset);
        }
        Ok(())
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    #[inline]
    pub fn bytes(&self) -> &[u8] {
        &self.data
    }

    #[inline]
    pub fn bytes_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    #[inline]
    pub fn pointer_slots(&self) -> &[u32] {
        &self.pointers
    }

    pub fn read_u32(&self, offset: usize) -> u32 {
        u32::from_le_bytes(self.data[offset..offset + 4].try_into().unwrap_or_default())
    }

    pub fn write_u32(&mut self, offset: usize, value: u32) {
        self.data[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
    }

    pub fn read_pointer(&self, offset: u32) -> Pointer {
        let at = offset as usize;
        let raw = self.data[at..at + POINTER_SIZE]
            .try_into()
            .map(u64::from_le_bytes)
            .unwrap_or(0);
        Pointer::from_raw(raw)
    }

    pub fn write_pointer(&mut self, offset: u32, ptr: Pointer) {
        let at = offset as usize;
        self.data[at..at + POINTER_SIZE].copy_from_slice(&ptr.raw().to_le_bytes());
    }
}

impl fmt::Debug for Object {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let ptrs: Vec<Pointer> = self.pointers.iter().map(|&o| self.read_pointer(o)).collect();
        f.debug_struct("Object")
            .field("len", &self.data.len())
            .field("pointers", &ptrs)
            .finish()
    }
}

#[derive(Clone, Default, PartialEq, Eq)]
struct HeapSlot {
    generation: u16,
    object: Option<Object>,
}

/// Heap of objects addressed by `(index, generation)`.
///
/// Freed indices are reused (with a bumped generation), so the index an object
/// lands on depends on the allocation history.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct Heap {
    slots: Vec<HeapSlot>,
    free: Vec<u32>,
}

impl Heap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store an object and return a pointer to its first byte.
    pub fn alloc(&mut self, object: Object) -> Result<Pointer, HeapError> {
        if let Some(index) = self.free.pop() {
            let slot = &mut self.slots[index as usize];
            slot.object = Some(object);
            return Ok(Pointer::heap(index, slot.generation, 0));
        }
        if self.slots.len() >= MAX_OBJECTS {
            return Err(HeapError::ObjectLimit);
        }
        let index = self.slots.len() as u32;
        self.slots.push(HeapSlot {
            generation: 0,
            object: Some(object),
        });
        Ok(Pointer::heap(index, 0, 0))
    }

    /// Free the object `ptr` points into. Returns false for invalid pointers.
    pub fn free(&mut self, ptr: Pointer) -> bool {
        let Some(index) = self.resolve(ptr) else {
            return false;
        };
        let slot = &mut self.slots[index as usize];
        slot.object = None;
        slot.generation = ((slot.generation as u64 + 1) & GEN_MASK) as u16;
        self.free.push(index);
        true
    }

    /// Index of the live object `ptr` points into, if the pointer is valid:
    /// heap kind, existing slot, matching generation, offset within bounds.
    pub fn resolve(&self, ptr: Pointer) -> Option<u32> {
        if ptr.kind() != Some(PointerKind::Heap) {
            return None;
        }
        let slot = self.slots.get(ptr.object() as usize)?;
        let object = slot.object.as_ref()?;
        if slot.generation != ptr.generation() || ptr.offset() as usize > object.len() {
            return None;
        }
        Some(ptr.object())
    }

    pub fn get(&self, ptr: Pointer) -> Option<&Object> {
        let index = self.resolve(ptr)?;
        self.slots[index as usize].object.as_ref()
    }

    pub fn get_mut(&mut self, ptr: Pointer) -> Option<&mut Object> {
        let index = self.resolve(ptr)?;
        self.slots[index as usize].object.as_mut()
    }

    /// Object at a slot index regardless of generation.
    pub(crate) fn at(&self, index: u32) -> Option<&Object> {
        self.slots.get(index as usize)?.object.as_ref()
    }

    /// Number of slot indices ever handed out (live or freed).
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Number of live objects.
    pub fn live(&self) -> usize {
        self.slots.iter().filter(|s| s.object.is_some()).count()
    }

    fn push_restored(&mut self, object: Object) {
        self.slots.push(HeapSlot {
            generation: 0,
            object: Some(object),
        });
    }
}

impl fmt::Debug for Heap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut m = f.debug_map();
        for (i, slot) in self.slots.iter().enumerate() {
            if let Some(obj) = &slot.object {
                m.entry(&format_args!("{}@{}", i, slot.generation), obj);
            }
        }
        m.finish()
    }
}

/// One program configuration: globals, thread stacks and heap.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Configuration {
    pub globals: Object,
    /// Frame pointers per thread, bottom of the stack first.
    pub threads: Vec<Vec<Pointer>>,
    pub heap: Heap,
}

impl Configuration {
    pub fn new(globals: Object) -> Self {
        Self {
            globals,
            threads: Vec::new(),
            heap: Heap::new(),
        }
    }

    /// Rebuild a configuration from a canonical payload. Heap objects land on
    /// their canonical ids with generation zero, which is also how canonical
    /// pointers address them, so pointer slots are copied unchanged.
    pub fn restore(payload: &[u8]) -> Result<Self, HeapError> {
        let mut r = Reader { buf: payload, at: 0 };
        let objects = r.u32()? as usize;
        let threads = r.u32()? as usize;
        if objects > MAX_OBJECTS {
            return Err(r.malformed("object count out of range"));
        }

        let globals = r.object()?;
        let mut config = Configuration::new(globals);
        for _ in 0..threads {
            let frames = r.u32()? as usize;
            let mut stack = Vec::with_capacity(frames.min(1024));
            for _ in 0..frames {
                stack.push(Pointer::from_raw(r.u64()?));
            }
            config.threads.push(stack);
        }
        for _ in 0..objects {
            let obj = r.object()?;
            config.heap.push_restored(obj);
        }
        if r.at != payload.len() {
            return Err(r.malformed("trailing bytes"));
        }
        Ok(config)
    }
}

struct Reader<'a> {
    buf: &'a [u8],
    at: usize,
}

impl Reader<'_> {
    fn malformed(&self, reason: &'static str) -> HeapError {
        HeapError::Malformed {
            at: self.at,
            reason,
        }
    }

    fn take(&mut self, n: usize) -> Result<&[u8], HeapError> {
        if self.buf.len() - self.at < n {
            return Err(self.malformed("truncated"));
        }
        let s = &self.buf[self.at..self.at + n];
        self.at += n;
        Ok(s)
    }

    fn u32(&mut self) -> Result<u32, HeapError> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn u64(&mut self) -> Result<u64, HeapError> {
        let lo = self.u32()? as u64;
        let hi = self.u32()? as u64;
        Ok(lo | (hi << 32))
    }

    fn object(&mut self) -> Result<Object, HeapError> {
        let len = self.u32()? as usize;
        let count = self.u32()? as usize;
        if count > len / POINTER_SIZE {
            return Err(self.malformed("too many pointer slots"));
        }
        let mut pointers = Vec::with_capacity(count);
        let mut end = 0usize;
        for _ in 0..count {
            let offset = self.u32()?;
            if (offset as usize) < end || offset as usize + POINTER_SIZE > len {
                return Err(self.malformed("pointer slot out of order or out of bounds"));
            }
            end = offset as usize + POINTER_SIZE;
            pointers.push(offset);
        }
        let data = self.take(len)?.to_vec();
        Ok(Object::from_parts(data, pointers))
    }
}
