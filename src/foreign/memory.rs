//! Bounds-checked access to a sandbox's linear memory.

use std::collections::BTreeMap;

use thiserror::Error;
use tracing::warn;
use wasmtime::{AsContextMut, Caller, Func, Instance, Memory};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MemoryError {
    #[error("Access of {len} bytes at {offset:#x} is out of bounds")]
    OutOfBounds { offset: u32, len: usize },

    #[error("Module exports no memory")]
    NoMemory,

    #[error("Module exports no allocator")]
    NoAllocator,

    #[error("Allocation of {size} bytes failed: {reason}")]
    AllocFailed { size: u32, reason: String },

    #[error("Unterminated string at {0:#x}")]
    Unterminated(u32),
}

fn check(offset: u32, len: usize, size: usize) -> Result<usize, MemoryError> {
    let start = offset as usize;
    match start.checked_add(len) {
        Some(end) if end <= size => Ok(start),
        _ => Err(MemoryError::OutOfBounds { offset, len }),
    }
}

const CSTR_CHUNK_MIN: usize = 256;
const CSTR_CHUNK_MAX: usize = 4096;

/// Read/write-at-offset access plus the guest heap allocator.
pub trait LinearMemory {
    fn size(&self) -> usize;

    fn read(&self, offset: u32, buf: &mut [u8]) -> Result<(), MemoryError>;

    fn write(&mut self, offset: u32, data: &[u8]) -> Result<(), MemoryError>;

    /// Allocate `size` bytes on the guest heap. Never returns 0.
    fn alloc(&mut self, size: u32) -> Result<u32, MemoryError>;

    fn free(&mut self, ptr: u32);

    fn read_vec(&self, offset: u32, len: usize) -> Result<Vec<u8>, MemoryError> {
        let mut buf = vec![0u8; len];
        self.read(offset, &mut buf)?;
        Ok(buf)
    }

    fn read_u32(&self, offset: u32) -> Result<u32, MemoryError> {
        let mut buf = [0u8; 4];
        self.read(offset, &mut buf)?;
        Ok(u32::from_le_bytes(buf))
    }

    /// Read consecutive little-endian f32s into `out`.
    fn read_f32s(&self, offset: u32, out: &mut [f32]) -> Result<(), MemoryError> {
        let bytes = self.read_vec(offset, out.len() * 4)?;
        for (slot, chunk) in out.iter_mut().zip(bytes.chunks_exact(4)) {
            *slot = f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
        }
        Ok(())
    }

    /// Read a NUL-terminated string of at most `max` bytes.
    ///
    /// Memory is scanned in growing chunks, so a short string costs a short
    /// read no matter how large `max` is.
    fn read_cstr(&self, offset: u32, max: usize) -> Result<Vec<u8>, MemoryError> {
        let available = self.size().saturating_sub(offset as usize);
        if available == 0 {
            return Err(MemoryError::OutOfBounds { offset, len: 1 });
        }
        let limit = available.min(max.saturating_add(1));
        let mut text = Vec::new();
        let mut chunk = CSTR_CHUNK_MIN;
        while text.len() < limit {
            let at = u32::try_from(text.len())
                .ok()
                .and_then(|scanned| offset.checked_add(scanned))
                .ok_or(MemoryError::OutOfBounds { offset, len: limit })?;
            let window = self.read_vec(at, chunk.min(limit - text.len()))?;
            if let Some(end) = window.iter().position(|&b| b == 0) {
                text.extend_from_slice(&window[..end]);
                return Ok(text);
            }
            text.extend_from_slice(&window);
            chunk = (chunk * 2).min(CSTR_CHUNK_MAX);
        }
        Err(MemoryError::Unterminated(offset))
    }

    /// Copy `data` onto the guest heap.
    fn alloc_bytes(&mut self, data: &[u8]) -> Result<u32, MemoryError> {
        let ptr = self.alloc(data.len().max(1) as u32)?;
        if let Err(e) = self.write(ptr, data) {
            self.free(ptr);
            return Err(e);
        }
        Ok(ptr)
    }

    /// Copy `text` onto the guest heap with a NUL terminator.
    fn alloc_cstr(&mut self, text: &[u8]) -> Result<u32, MemoryError> {
        let mut bytes = Vec::with_capacity(text.len() + 1);
        bytes.extend_from_slice(text);
        bytes.push(0);
        self.alloc_bytes(&bytes)
    }
}

// ============================================================================
// Guest memory
// ============================================================================

/// The exports a guest uses to share memory: `memory`, `malloc`, `free`.
#[derive(Debug, Clone, Copy, Default)]
pub struct GuestExports {
    pub memory: Option<Memory>,
    pub malloc: Option<Func>,
    pub free: Option<Func>,
}

impl GuestExports {
    pub fn from_caller<T>(caller: &mut Caller<'_, T>) -> Self {
        Self {
            memory: caller.get_export("memory").and_then(|e| e.into_memory()),
            malloc: caller.get_export("malloc").and_then(|e| e.into_func()),
            free: caller.get_export("free").and_then(|e| e.into_func()),
        }
    }

    pub fn from_instance(mut store: impl AsContextMut, instance: &Instance) -> Self {
        Self {
            memory: instance.get_memory(&mut store, "memory"),
            malloc: instance.get_func(&mut store, "malloc"),
            free: instance.get_func(&mut store, "free"),
        }
    }
}

/// [`LinearMemory`] over a live store or caller.
pub struct GuestMemory<C> {
    ctx: C,
    exports: GuestExports,
}

impl<C: AsContextMut> GuestMemory<C> {
    pub fn new(ctx: C, exports: GuestExports) -> Self {
        Self { ctx, exports }
    }

    fn memory(&self) -> Result<Memory, MemoryError> {
        self.exports.memory.ok_or(MemoryError::NoMemory)
    }
}

impl<C: AsContextMut> LinearMemory for GuestMemory<C> {
    fn size(&self) -> usize {
        self.exports
            .memory
            .map(|memory| memory.data_size(&self.ctx))
            .unwrap_or(0)
    }

    fn read(&self, offset: u32, buf: &mut [u8]) -> Result<(), MemoryError> {
        let memory = self.memory()?;
        memory
            .read(&self.ctx, offset as usize, buf)
            .map_err(|_| MemoryError::OutOfBounds {
                offset,
                len: buf.len(),
            })
    }

    fn write(&mut self, offset: u32, data: &[u8]) -> Result<(), MemoryError> {
        let memory = self.memory()?;
        memory
            .write(&mut self.ctx, offset as usize, data)
            .map_err(|_| MemoryError::OutOfBounds {
                offset,
                len: data.len(),
            })
    }

    fn alloc(&mut self, size: u32) -> Result<u32, MemoryError> {
        let malloc = self.exports.malloc.ok_or(MemoryError::NoAllocator)?;
        let failed = |reason: String| MemoryError::AllocFailed { size, reason };
        let malloc = malloc
            .typed::<i32, i32>(&self.ctx)
            .map_err(|e| failed(e.to_string()))?;
        let ptr = malloc
            .call(&mut self.ctx, size as i32)
            .map_err(|e| failed(e.to_string()))?;
        if ptr == 0 {
            return Err(failed("allocator returned null".to_string()));
        }
        Ok(ptr as u32)
    }

    fn free(&mut self, ptr: u32) {
        let Some(free) = self.exports.free else {
            return;
        };
        let result = free
            .typed::<i32, ()>(&self.ctx)
            .and_then(|free| free.call(&mut self.ctx, ptr as i32));
        if let Err(e) = result {
            warn!(ptr, error = %e, "guest free failed");
        }
    }
}

// ============================================================================
// Host buffer
// ============================================================================

/// A plain byte buffer with a bump allocator that tracks live blocks.
///
/// Stands in for a guest when marshalling without a sandbox.
#[derive(Debug, Clone)]
pub struct BufferMemory {
    bytes: Vec<u8>,
    next: u32,
    live: BTreeMap<u32, u32>,
}

impl BufferMemory {
    pub fn new(size: usize) -> Self {
        Self {
            bytes: vec![0; size],
            // keep address 0 free so it always means null
            next: 8,
            live: BTreeMap::new(),
        }
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Number of allocations not yet freed.
    pub fn live_allocations(&self) -> usize {
        self.live.len()
    }
}

impl LinearMemory for BufferMemory {
    fn size(&self) -> usize {
        self.bytes.len()
    }

    fn read(&self, offset: u32, buf: &mut [u8]) -> Result<(), MemoryError> {
        let start = check(offset, buf.len(), self.bytes.len())?;
        buf.copy_from_slice(&self.bytes[start..start + buf.len()]);
        Ok(())
    }

    fn write(&mut self, offset: u32, data: &[u8]) -> Result<(), MemoryError> {
        let start = check(offset, data.len(), self.bytes.len())?;
        self.bytes[start..start + data.len()].copy_from_slice(data);
        Ok(())
    }

    fn alloc(&mut self, size: u32) -> Result<u32, MemoryError> {
        let exhausted = || MemoryError::AllocFailed {
            size,
            reason: "buffer exhausted".to_string(),
        };
        let ptr = self.next;
        check(ptr, size as usize, self.bytes.len()).map_err(|_| exhausted())?;
        let end = ptr
            .checked_add(size)
            .and_then(|end| end.checked_add(7))
            .ok_or_else(exhausted)?;
        self.next = end & !7;
        self.live.insert(ptr, size);
        Ok(ptr)
    }

    fn free(&mut self, ptr: u32) {
        self.live.remove(&ptr);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    #[test]
    fn out_of_bounds_is_an_error() {
        let memory = BufferMemory::new(16);
        let mut buf = [0u8; 4];
        assert!(memory.read(12, &mut buf).is_ok());
        assert_eq!(
            memory.read(13, &mut buf),
            Err(MemoryError::OutOfBounds { offset: 13, len: 4 })
        );
        assert!(memory.read(u32::MAX, &mut buf).is_err());
    }

    #[test]
    fn cstr_stops_at_nul() {
        let mut memory = BufferMemory::new(64);
        let ptr = memory.alloc_cstr(b"hello").unwrap();
        assert_eq!(memory.read_cstr(ptr, 100).unwrap(), b"hello");
        assert_eq!(memory.read_cstr(ptr, 3), Err(MemoryError::Unterminated(ptr)));
    }

    /// Counts the bytes copied out of the wrapped buffer.
    struct Metered {
        inner: BufferMemory,
        copied: Cell<usize>,
    }

    impl LinearMemory for Metered {
        fn size(&self) -> usize {
            self.inner.size()
        }

        fn read(&self, offset: u32, buf: &mut [u8]) -> Result<(), MemoryError> {
            self.copied.set(self.copied.get() + buf.len());
            self.inner.read(offset, buf)
        }

        fn write(&mut self, offset: u32, data: &[u8]) -> Result<(), MemoryError> {
            self.inner.write(offset, data)
        }

        fn alloc(&mut self, size: u32) -> Result<u32, MemoryError> {
            self.inner.alloc(size)
        }

        fn free(&mut self, ptr: u32) {
            self.inner.free(ptr)
        }
    }

    #[test]
    fn short_cstr_in_large_memory_reads_little() {
        let mut memory = Metered {
            inner: BufferMemory::new(16 * 1024 * 1024),
            copied: Cell::new(0),
        };
        let ptr = memory.alloc_cstr(b"hello").unwrap();
        assert_eq!(memory.read_cstr(ptr, 16 * 1024 * 1024).unwrap(), b"hello");
        assert!(memory.copied.get() <= CSTR_CHUNK_MIN);
    }

    #[test]
    fn cstr_spanning_chunks() {
        let mut memory = BufferMemory::new(64 * 1024);
        let long = vec![b'x'; 10_000];
        let ptr = memory.alloc_cstr(&long).unwrap();
        assert_eq!(memory.read_cstr(ptr, 20_000).unwrap(), long);
        assert_eq!(memory.read_cstr(ptr, 9_999), Err(MemoryError::Unterminated(ptr)));
    }

    #[test]
    fn alloc_near_the_address_limit_fails() {
        let mut memory = BufferMemory::new(64);
        memory.next = u32::MAX - 2;
        assert!(matches!(
            memory.alloc(1),
            Err(MemoryError::AllocFailed { size: 1, .. })
        ));
    }

    #[test]
    fn allocations_are_tracked() {
        let mut memory = BufferMemory::new(64);
        let a = memory.alloc(5).unwrap();
        let b = memory.alloc(5).unwrap();
        assert_ne!(a, 0);
        assert_eq!(b % 8, 0);
        assert_eq!(memory.live_allocations(), 2);
        memory.free(a);
        memory.free(b);
        assert_eq!(memory.live_allocations(), 0);
        assert!(memory.alloc(1024).is_err());
    }
}
