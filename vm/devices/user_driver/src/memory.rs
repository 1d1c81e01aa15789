// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Traits and types for sharing memory with the device.

use std::sync::atomic::AtomicU16;
use std::sync::atomic::AtomicU8;
use std::sync::atomic::Ordering::Relaxed;
use std::sync::Arc;
use zerocopy::FromBytes;
use zerocopy::FromZeros;
use zerocopy::Immutable;
use zerocopy::IntoBytes;
use zerocopy::KnownLayout;

/// The 4KB page size used by user-mode drivers.
pub const PAGE_SIZE: usize = 4096;

/// A mapped buffer that can be accessed by both the driver and the device.
///
/// # Safety
/// The implementor must ensure that the VA region from `base()..base() + len()`
/// remains mapped, and is not deallocated, for the lifetime of the object.
pub unsafe trait MappedDmaTarget: Send + Sync {
    /// The virtual address of the mapped memory.
    fn base(&self) -> *const u8;

    /// The length of the buffer in bytes.
    fn len(&self) -> usize;

    /// The address the device uses to refer to the first byte of the buffer.
    ///
    /// The buffer is contiguous in the device's address space.
    fn device_address(&self) -> u64;
}

/// A view of DMA memory.
///
/// Cloning a block shares the underlying allocation, which is released when
/// the last view is dropped.
#[derive(Clone)]
pub struct MemoryBlock {
    base: *const u8,
    len: usize,
    offset: usize,
    mem: Arc<dyn MappedDmaTarget>,
}

// SAFETY: The inner MappedDmaTarget is Send + Sync, so a view of it is too.
unsafe impl Send for MemoryBlock {}
// SAFETY: The inner MappedDmaTarget is Send + Sync, so a view of it is too.
unsafe impl Sync for MemoryBlock {}

impl std::fmt::Debug for MemoryBlock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryBlock")
            .field("base", &self.base)
            .field("len", &self.len)
            .field("device_address", &self.device_address())
            .finish()
    }
}

impl MemoryBlock {
    /// Creates a new memory block backed by `mem`.
    pub fn new<T: 'static + MappedDmaTarget>(mem: T) -> Self {
        Self {
            base: mem.base(),
            len: mem.len(),
            offset: 0,
            mem: Arc::new(mem),
        }
    }

    /// Returns a view of a subset of the buffer.
    ///
    /// Panics if the range is out of bounds.
    pub fn subblock(&self, offset: usize, len: usize) -> Self {
        assert!(
            offset <= self.len && self.len - offset >= len,
            "subblock {offset:#x}+{len:#x} out of range of {:#x}",
            self.len
        );
        Self {
            // SAFETY: verified above to be in bounds.
            base: unsafe { self.base.add(offset) },
            len,
            offset: self.offset + offset,
            mem: self.mem.clone(),
        }
    }

    /// Gets the base address of the buffer.
    pub fn base(&self) -> *const u8 {
        self.base
    }

    /// Gets the length of the buffer in bytes.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Returns true if the buffer is empty.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// The device address of the first byte of this view.
    pub fn device_address(&self) -> u64 {
        self.mem.device_address() + self.offset as u64
    }

    /// Returns true if both views share the same allocation.
    pub fn same_allocation(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.mem, &other.mem)
    }

    /// Gets the buffer as an atomic slice.
    pub fn as_slice(&self) -> &[AtomicU8] {
        // SAFETY: the underlying memory is valid for the lifetime of `mem`,
        // and all access goes through atomics since the device may write to
        // it concurrently.
        unsafe { std::slice::from_raw_parts(self.base.cast(), self.len) }
    }

    /// Gets a 16-bit atomic at `offset`.
    ///
    /// Panics if `offset` is out of bounds or not 2-byte aligned.
    pub fn as_atomic_u16(&self, offset: usize) -> &AtomicU16 {
        let slice = &self.as_slice()[offset..][..size_of::<u16>()];
        let ptr = slice.as_ptr().cast::<AtomicU16>();
        assert!(ptr.is_aligned(), "unaligned atomic access at {offset:#x}");
        // SAFETY: the pointer is in bounds and aligned, and the memory is only
        // ever accessed atomically.
        unsafe { &*ptr }
    }

    /// Reads from the buffer into `data`.
    pub fn read_at(&self, offset: usize, data: &mut [u8]) {
        let len = data.len();
        for (d, s) in data.iter_mut().zip(&self.as_slice()[offset..][..len]) {
            *d = s.load(Relaxed);
        }
    }

    /// Reads an object from the buffer at `offset`.
    ///
    /// The object is copied out, so later device writes do not affect it.
    pub fn read_obj<T: FromBytes + IntoBytes + Immutable + KnownLayout>(&self, offset: usize) -> T {
        let mut obj = T::new_zeroed();
        self.read_at(offset, obj.as_mut_bytes());
        obj
    }

    /// Writes into the buffer from `data`.
    pub fn write_at(&self, offset: usize, data: &[u8]) {
        for (d, s) in self.as_slice()[offset..][..data.len()].iter().zip(data) {
            d.store(*s, Relaxed);
        }
    }

    /// Writes an object into the buffer at `offset`.
    pub fn write_obj<T: IntoBytes + Immutable + KnownLayout>(&self, offset: usize, data: &T) {
        self.write_at(offset, data.as_bytes());
    }

    /// Copies the whole buffer out.
    pub fn to_vec(&self) -> Vec<u8> {
        let mut v = vec![0; self.len];
        self.read_at(0, &mut v);
        v
    }

    /// Returns the offset of the beginning of the buffer in its first page.
    pub fn offset_in_page(&self) -> u32 {
        (self.base as usize % PAGE_SIZE) as u32
    }
}

#[cfg(test)]
mod tests {
    use crate::heap::HeapDmaClient;
    use crate::memory::PAGE_SIZE;
    use crate::DmaClient;
    use std::sync::atomic::Ordering;

    #[test]
    fn subblock_views_share_memory() {
        let mem = HeapDmaClient::new().allocate_dma_buffer(PAGE_SIZE).unwrap();
        let sub = mem.subblock(0x100, 0x20);
        assert_eq!(sub.device_address(), mem.device_address() + 0x100);
        assert_eq!(sub.offset_in_page(), 0x100);
        sub.write_at(4, b"abcd");
        let mut out = [0; 4];
        mem.read_at(0x104, &mut out);
        assert_eq!(&out, b"abcd");
        assert!(sub.same_allocation(&mem));

        let nested = sub.subblock(4, 4);
        assert_eq!(nested.to_vec(), b"abcd");
        assert_eq!(nested.device_address(), mem.device_address() + 0x104);
    }

    #[test]
    fn objects_and_atomics() {
        let mem = HeapDmaClient::new().allocate_dma_buffer(PAGE_SIZE).unwrap();
        mem.write_obj(8, &0x1234_5678u32);
        assert_eq!(mem.read_obj::<u32>(8), 0x1234_5678);
        mem.as_atomic_u16(16).store(0xbeef, Ordering::Release);
        assert_eq!(mem.read_obj::<u16>(16), 0xbeef);
    }

    #[test]
    #[should_panic]
    fn subblock_out_of_range() {
        let mem = HeapDmaClient::new().allocate_dma_buffer(PAGE_SIZE).unwrap();
        let _ = mem.subblock(PAGE_SIZE - 4, 8);
    }

    #[test]
    #[should_panic]
    fn unaligned_atomic() {
        let mem = HeapDmaClient::new().allocate_dma_buffer(PAGE_SIZE).unwrap();
        let _ = mem.as_atomic_u16(3);
    }
}
