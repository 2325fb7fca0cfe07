//! Shared test helpers: a byte-level capture builder and a scripted
//! symbol resolver.

#![allow(dead_code)]

use flate2::write::DeflateEncoder;
use flate2::Compression;
use std::io::Write;

use heapscope::loader::parser::tags;
use heapscope::loader::reader::COMPRESSION_SIGNATURE;
use heapscope::{SymbolInfo, SymbolResolver};

const MODULE_PATH_XOR: u8 = 0x23;

/// Builds capture files byte by byte, in either endianness.
pub struct CaptureBuilder {
    big_endian: bool,
    ptr64: bool,
    cpu_frequency: u64,
    modules: Vec<(String, u64, u64)>,
    events: Vec<u8>,
}

impl CaptureBuilder {
    pub fn new() -> Self {
        Self {
            big_endian: false,
            ptr64: true,
            cpu_frequency: 1_000_000,
            modules: Vec::new(),
            events: Vec::new(),
        }
    }

    pub fn big_endian(mut self) -> Self {
        self.big_endian = true;
        self
    }

    pub fn pointers_32bit(mut self) -> Self {
        self.ptr64 = false;
        self
    }

    pub fn with_module(mut self, path: &str, base: u64, size: u64) -> Self {
        self.modules.push((path.to_string(), base, size));
        self
    }

    fn push_u16(buf: &mut Vec<u8>, big: bool, v: u16) {
        buf.extend_from_slice(&if big { v.to_be_bytes() } else { v.to_le_bytes() });
    }

    fn push_u32(buf: &mut Vec<u8>, big: bool, v: u32) {
        buf.extend_from_slice(&if big { v.to_be_bytes() } else { v.to_le_bytes() });
    }

    fn push_u64(buf: &mut Vec<u8>, big: bool, v: u64) {
        buf.extend_from_slice(&if big { v.to_be_bytes() } else { v.to_le_bytes() });
    }

    fn push_ptr(&mut self, v: u64) {
        if self.ptr64 {
            Self::push_u64(&mut self.events, self.big_endian, v);
        } else {
            Self::push_u32(&mut self.events, self.big_endian, v as u32);
        }
    }

    fn push_str(buf: &mut Vec<u8>, big: bool, s: &str, xor: u8) {
        Self::push_u32(buf, big, s.len() as u32);
        buf.extend(s.bytes().map(|b| b ^ xor));
    }

    fn push_stack(&mut self, frames: &[u64]) {
        self.events.push(tags::STACK_ADD);
        Self::push_u16(&mut self.events, self.big_endian, frames.len() as u16);
        for &f in frames {
            self.push_ptr(f);
        }
    }

    fn push_op_header(&mut self, tag: u8, handle: u64, thread: u64) {
        self.events.push(tag);
        Self::push_u64(&mut self.events, self.big_endian, handle);
        Self::push_u64(&mut self.events, self.big_endian, thread);
    }

    pub fn alloc(
        &mut self,
        handle: u64,
        thread: u64,
        ptr: u64,
        time: u64,
        size: u64,
        overhead: u32,
        frames: &[u64],
    ) -> &mut Self {
        self.push_op_header(tags::OP_ALLOC, handle, thread);
        self.push_ptr(ptr);
        Self::push_u64(&mut self.events, self.big_endian, time);
        Self::push_u64(&mut self.events, self.big_endian, size);
        Self::push_u32(&mut self.events, self.big_endian, overhead);
        self.push_stack(frames);
        self
    }

    /// Alloc whose stack trace references an earlier `Add` by hash.
    pub fn alloc_shared_stack(
        &mut self,
        handle: u64,
        thread: u64,
        ptr: u64,
        time: u64,
        size: u64,
        overhead: u32,
        frames: &[u64],
    ) -> &mut Self {
        self.push_op_header(tags::OP_ALLOC, handle, thread);
        self.push_ptr(ptr);
        Self::push_u64(&mut self.events, self.big_endian, time);
        Self::push_u64(&mut self.events, self.big_endian, size);
        Self::push_u32(&mut self.events, self.big_endian, overhead);
        self.events.push(tags::STACK_EXISTS);
        let hash = frames.iter().fold(0u64, |a, &f| a.wrapping_add(f)) as u32;
        Self::push_u32(&mut self.events, self.big_endian, hash);
        self
    }

    pub fn alloc_aligned(
        &mut self,
        handle: u64,
        thread: u64,
        ptr: u64,
        time: u64,
        alignment: u8,
        size: u64,
        overhead: u32,
        frames: &[u64],
    ) -> &mut Self {
        self.push_op_header(tags::OP_ALLOC_ALIGNED, handle, thread);
        self.push_ptr(ptr);
        Self::push_u64(&mut self.events, self.big_endian, time);
        self.events.push(alignment);
        Self::push_u64(&mut self.events, self.big_endian, size);
        Self::push_u32(&mut self.events, self.big_endian, overhead);
        self.push_stack(frames);
        self
    }

    pub fn realloc(
        &mut self,
        handle: u64,
        thread: u64,
        ptr: u64,
        prev_ptr: u64,
        time: u64,
        size: u64,
        overhead: u32,
        frames: &[u64],
    ) -> &mut Self {
        self.push_op_header(tags::OP_REALLOC, handle, thread);
        self.push_ptr(ptr);
        self.push_ptr(prev_ptr);
        Self::push_u64(&mut self.events, self.big_endian, time);
        Self::push_u64(&mut self.events, self.big_endian, size);
        Self::push_u32(&mut self.events, self.big_endian, overhead);
        self.push_stack(frames);
        self
    }

    pub fn free(
        &mut self,
        handle: u64,
        thread: u64,
        ptr: u64,
        time: u64,
        frames: &[u64],
    ) -> &mut Self {
        self.push_op_header(tags::OP_FREE, handle, thread);
        self.push_ptr(ptr);
        Self::push_u64(&mut self.events, self.big_endian, time);
        self.push_stack(frames);
        self
    }

    pub fn register_tag(&mut self, name: &str, parent: &str, hash: u32, parent_hash: u32) -> &mut Self {
        self.events.push(tags::REGISTER_TAG);
        Self::push_str(&mut self.events, self.big_endian, name, 0);
        Self::push_str(&mut self.events, self.big_endian, parent, 0);
        Self::push_u32(&mut self.events, self.big_endian, hash);
        if !parent.is_empty() {
            Self::push_u32(&mut self.events, self.big_endian, parent_hash);
        }
        self
    }

    pub fn enter_tag(&mut self, hash: u32, thread: u64) -> &mut Self {
        self.events.push(tags::ENTER_TAG);
        Self::push_u32(&mut self.events, self.big_endian, hash);
        Self::push_u64(&mut self.events, self.big_endian, thread);
        self
    }

    pub fn leave_tag(&mut self, hash: u32, thread: u64) -> &mut Self {
        self.events.push(tags::LEAVE_TAG);
        Self::push_u32(&mut self.events, self.big_endian, hash);
        Self::push_u64(&mut self.events, self.big_endian, thread);
        self
    }

    pub fn register_marker(&mut self, name: &str, hash: u32, color: u32) -> &mut Self {
        self.events.push(tags::REGISTER_MARKER);
        Self::push_str(&mut self.events, self.big_endian, name, 0);
        Self::push_u32(&mut self.events, self.big_endian, hash);
        Self::push_u32(&mut self.events, self.big_endian, color);
        self
    }

    pub fn marker(&mut self, hash: u32, thread: u64, time: u64) -> &mut Self {
        self.events.push(tags::MARKER);
        Self::push_u32(&mut self.events, self.big_endian, hash);
        Self::push_u64(&mut self.events, self.big_endian, thread);
        Self::push_u64(&mut self.events, self.big_endian, time);
        self
    }

    pub fn module_event(&mut self, name: &str, base: u64, size: u64) -> &mut Self {
        self.events.push(tags::MODULE);
        self.events.push(1); // narrow path
        Self::push_str(&mut self.events, self.big_endian, name, 0);
        Self::push_u64(&mut self.events, self.big_endian, base);
        Self::push_u64(&mut self.events, self.big_endian, size);
        self
    }

    pub fn allocator(&mut self, name: &str, handle: u64) -> &mut Self {
        self.events.push(tags::ALLOCATOR);
        Self::push_str(&mut self.events, self.big_endian, name, 0);
        Self::push_u64(&mut self.events, self.big_endian, handle);
        self
    }

    /// Append raw bytes to the event stream (for corruption tests).
    pub fn raw(&mut self, bytes: &[u8]) -> &mut Self {
        self.events.extend_from_slice(bytes);
        self
    }

    pub fn build(&self) -> Vec<u8> {
        let big = self.big_endian;
        let mut out = Vec::new();

        out.push(if big { 0xff } else { 0x00 });
        out.push(if self.ptr64 { 64 } else { 32 });
        out.push(1); // version high
        out.push(2); // version low
        out.push(5); // toolchain byte (unknown -> gcc)
        Self::push_u64(&mut out, big, self.cpu_frequency);

        // module table section
        let mut section = Vec::new();
        for (path, base, size) in &self.modules {
            Self::push_str(&mut section, big, path, MODULE_PATH_XOR);
            Self::push_u64(&mut section, big, *base);
            Self::push_u64(&mut section, big, *size);
        }
        if section.is_empty() {
            Self::push_u32(&mut out, big, 0);
        } else {
            Self::push_u32(&mut out, big, section.len() as u32 + 1);
            out.push(1); // char size
            out.extend_from_slice(&section);
        }

        out.extend_from_slice(&self.events);
        out
    }

    pub fn build_compressed(&self) -> Vec<u8> {
        let body = self.build();
        let mut enc = DeflateEncoder::new(Vec::new(), Compression::default());
        enc.write_all(&body).unwrap();
        let deflated = enc.finish().unwrap();

        let mut out = COMPRESSION_SIGNATURE.to_le_bytes().to_vec();
        out.extend_from_slice(&deflated);
        out
    }
}

/// Scripted resolver: symbol IDs equal the address, module membership and
/// instrumentation ranges are configured per test.
pub struct TestResolver {
    pub modules: Vec<(u64, u64)>,
    pub instrumentation: Vec<(u64, u64)>,
}

impl TestResolver {
    pub fn new() -> Self {
        Self { modules: Vec::new(), instrumentation: Vec::new() }
    }

    pub fn with_modules(modules: Vec<(u64, u64)>) -> Self {
        Self { modules, instrumentation: Vec::new() }
    }
}

impl SymbolResolver for TestResolver {
    fn module_count(&self) -> usize {
        self.modules.len()
    }

    fn module_index_of(&self, address: u64) -> Option<usize> {
        self.modules.iter().position(|&(base, size)| address >= base && address < base + size)
    }

    fn resolve(&self, address: u64) -> SymbolInfo {
        let is_instrumentation = self
            .instrumentation
            .iter()
            .any(|&(base, size)| address >= base && address < base + size);
        SymbolInfo { id: address, is_instrumentation }
    }
}
