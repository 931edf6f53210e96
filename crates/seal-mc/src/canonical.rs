//! Canonical state blocks.
//!
//! A configuration is walked from its roots (the globals' pointer slots in
//! offset order, then every thread's frames from the bottom of the stack up),
//! depth first by field offset. Heap objects are numbered in the order the walk
//! first reaches them and every heap pointer is rewritten to that number, so
//! configurations that differ only in where their objects were allocated
//! produce byte-identical payloads.
//!
//! Pointers that do not resolve (freed object, stale generation, offset out of
//! bounds, garbage kind) all become [`Pointer::INVALID`]; null stays null.
//! Global and code pointers are copied verbatim. Unreachable objects are
//! dropped.

use crate::arena::{Arena, ArenaError, Slot};
use crate::block::Layout;
use crate::heap::{Configuration, Object, Pointer, PointerKind};

const UNSEEN: u32 = u32::MAX;

/// Reusable canonicalization scratch space. One per worker.
#[derive(Default)]
pub struct Canonicalizer {
    /// Canonical id per heap slot index, `UNSEEN` until reached.
    ids: Vec<u32>,
    /// Heap slot indices in canonical order.
    order: Vec<u32>,
    /// Walk stack: object index and the next pointer slot to follow.
    stack: Vec<(u32, usize)>,
    buf: Vec<u8>,
}

impl Canonicalizer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Canonicalize `config` into a sealed block in `arena`.
    pub fn canonicalize(
        &mut self,
        config: &Configuration,
        layout: Layout,
        arena: &mut Arena,
    ) -> Result<Slot, ArenaError> {
        let payload = self.payload(config);
        layout.seal(arena, payload)
    }

    /// Canonical payload bytes of `config`. Valid until the next call.
    pub fn payload(&mut self, config: &Configuration) -> &[u8] {
        self.number(config);
        self.emit(config);
        &self.buf
    }

    fn number(&mut self, config: &Configuration) {
        self.ids.clear();
        self.ids.resize(config.heap.capacity(), UNSEEN);
        self.order.clear();
        self.stack.clear();

        let globals = &config.globals;
        for &offset in globals.pointer_slots() {
            self.reach(config, globals.read_pointer(offset));
        }
        for thread in &config.threads {
            for &frame in thread {
                self.reach(config, frame);
            }
        }
    }

    /// Number everything reachable from `root` that is not numbered yet.
    fn reach(&mut self, config: &Configuration, root: Pointer) {
        self.visit(config, root);
        while let Some(top) = self.stack.last_mut() {
            let (index, next) = *top;
            let Some(object) = config.heap.at(index) else {
                self.stack.pop();
                continue;
            };
            match object.pointer_slots().get(next) {
                Some(&offset) => {
                    top.1 += 1;
                    let target = object.read_pointer(offset);
                    self.visit(config, target);
                }
                None => {
                    self.stack.pop();
                }
            }
        }
    }

    fn visit(&mut self, config: &Configuration, ptr: Pointer) {
        let Some(index) = config.heap.resolve(ptr) else {
            return;
        };
        let id = &mut self.ids[index as usize];
        if *id == UNSEEN {
            *id = self.order.len() as u32;
            self.order.push(index);
            self.stack.push((index, 0));
        }
    }

    fn translate(&self, config: &Configuration, ptr: Pointer) -> Pointer {
        match ptr.kind() {
            Some(PointerKind::Null) => Pointer::NULL,
            Some(PointerKind::Heap) => match config.heap.resolve(ptr) {
                Some(index) => Pointer::heap(self.ids[index as usize], 0, ptr.offset()),
                None => Pointer::INVALID,
            },
            Some(PointerKind::Global | PointerKind::Code) => ptr,
            None => Pointer::INVALID,
        }
    }

    fn emit(&mut self, config: &Configuration) {
        let mut buf = std::mem::take(&mut self.buf);
        buf.clear();
        put_u32(&mut buf, self.order.len() as u32);
        put_u32(&mut buf, config.threads.len() as u32);

        self.emit_object(&mut buf, config, &config.globals);
        for thread in &config.threads {
            put_u32(&mut buf, thread.len() as u32);
            for &frame in thread {
                buf.extend_from_slice(&self.translate(config, frame).raw().to_le_bytes());
            }
        }
        for &index in &self.order {
            if let Some(object) = config.heap.at(index) {
                self.emit_object(&mut buf, config, object);
            }
        }
        self.buf = buf;
    }

    fn emit_object(&self, buf: &mut Vec<u8>, config: &Configuration, object: &Object) {
        put_u32(buf, object.len() as u32);
        put_u32(buf, object.pointer_slots().len() as u32);
        for &offset in object.pointer_slots() {
            put_u32(buf, offset);
        }
        let start = buf.len();
        buf.extend_from_slice(object.bytes());
        for &offset in object.pointer_slots() {
            let ptr = self.translate(config, object.read_pointer(offset));
            let at = start + offset as usize;
            buf[at..at + 8].copy_from_slice(&ptr.raw().to_le_bytes());
        }
    }
}

#[inline]
fn put_u32(buf: &mut Vec<u8>, v: u32) {
    buf.extend_from_slice(&v.to_le_bytes());
}
