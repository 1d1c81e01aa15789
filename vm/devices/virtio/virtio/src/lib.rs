// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Driver-side virtio ring infrastructure.

#![expect(missing_docs)]

mod credits;
pub mod emulated;
mod notify;
mod queue;
mod ring_memory;
pub mod spec;

#[cfg(test)]
mod tests;

pub use credits::DescriptorCredits;
pub use notify::Notifier;
pub use notify::NotifyError;
pub use notify::QueueNotify;
pub use queue::Buffer;
pub use queue::BufferChain;
pub use queue::Ring;
pub use queue::RingConfig;
pub use queue::RingError;
pub use queue::RingFeatures;
pub use queue::MAX_RING_SIZE;
pub use ring_memory::RingAddresses;
pub use ring_memory::RingLayout;
pub use ring_memory::RingMemory;
