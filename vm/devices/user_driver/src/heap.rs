// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! DMA buffers allocated from the process heap.
//!
//! These are only usable with backends that address guest memory by process
//! virtual address, such as vhost with an identity memory table.

use crate::memory::MappedDmaTarget;
use crate::memory::MemoryBlock;
use crate::memory::PAGE_SIZE;
use crate::DmaClient;
use anyhow::Context;
use std::alloc::Layout;
use std::ptr::NonNull;

struct HeapBuffer {
    ptr: NonNull<u8>,
    layout: Layout,
}

// SAFETY: the buffer is uniquely owned and only accessed through atomics.
unsafe impl Send for HeapBuffer {}
// SAFETY: the buffer is uniquely owned and only accessed through atomics.
unsafe impl Sync for HeapBuffer {}

impl HeapBuffer {
    fn new(len: usize) -> anyhow::Result<Self> {
        let layout = Layout::from_size_align(len, PAGE_SIZE).context("invalid layout")?;
        // SAFETY: the layout has a nonzero size, checked by the caller.
        let ptr = unsafe { std::alloc::alloc_zeroed(layout) };
        let ptr = NonNull::new(ptr).with_context(|| format!("failed to allocate {len:#x} bytes"))?;
        Ok(Self { ptr, layout })
    }
}

impl Drop for HeapBuffer {
    fn drop(&mut self) {
        // SAFETY: allocated in `new` with the same layout.
        unsafe { std::alloc::dealloc(self.ptr.as_ptr(), self.layout) }
    }
}

// SAFETY: the allocation lives until drop.
unsafe impl MappedDmaTarget for HeapBuffer {
    fn base(&self) -> *const u8 {
        self.ptr.as_ptr()
    }

    fn len(&self) -> usize {
        self.layout.size()
    }

    fn device_address(&self) -> u64 {
        self.ptr.as_ptr() as u64
    }
}

/// A [`DmaClient`] that allocates page-aligned buffers from the heap and
/// reports their virtual address as the device address.
#[derive(Debug, Default, Clone)]
pub struct HeapDmaClient {}

impl HeapDmaClient {
    /// Creates a new client.
    pub fn new() -> Self {
        Self {}
    }
}

impl DmaClient for HeapDmaClient {
    fn allocate_dma_buffer(&self, len: usize) -> anyhow::Result<MemoryBlock> {
        if len == 0 {
            anyhow::bail!("allocation of size 0 not supported");
        }
        if len % PAGE_SIZE != 0 {
            anyhow::bail!("not a page-size multiple");
        }
        Ok(MemoryBlock::new(HeapBuffer::new(len)?))
    }
}

#[cfg(test)]
mod tests {
    use super::HeapDmaClient;
    use crate::memory::PAGE_SIZE;
    use crate::DmaClient;

    #[test]
    fn allocations_are_zeroed_and_aligned() {
        let client = HeapDmaClient::new();
        let mem = client.allocate_dma_buffer(2 * PAGE_SIZE).unwrap();
        assert_eq!(mem.len(), 2 * PAGE_SIZE);
        assert_eq!(mem.device_address() % PAGE_SIZE as u64, 0);
        assert!(mem.to_vec().iter().all(|&b| b == 0));
    }

    #[test]
    fn rejects_bad_sizes() {
        let client = HeapDmaClient::new();
        assert!(client.allocate_dma_buffer(0).is_err());
        assert!(client.allocate_dma_buffer(100).is_err());
    }
}
