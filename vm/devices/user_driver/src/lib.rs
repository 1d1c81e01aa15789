// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Infrastructure for user-mode drivers that share memory with a device or
//! with a host backend.

// UNSAFETY: Manual memory management around DMA buffers.
#![expect(unsafe_code)]
#![warn(missing_docs)]

pub mod heap;
pub mod interrupt;
pub mod memory;

use memory::MemoryBlock;

/// Allocates memory that the device can access directly.
pub trait DmaClient: Send + Sync {
    /// Allocates a zeroed, page-aligned buffer of `len` bytes.
    ///
    /// `len` must be a multiple of [`memory::PAGE_SIZE`].
    fn allocate_dma_buffer(&self, len: usize) -> anyhow::Result<MemoryBlock>;
}
