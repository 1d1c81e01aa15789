// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use crate::emulated::HostRing;
use crate::Buffer;
use crate::BufferChain;
use crate::Notifier;
use crate::NotifyError;
use crate::QueueNotify;
use crate::Ring;
use crate::RingError;
use crate::RingFeatures;
use crate::RingLayout;
use futures::task::waker;
use futures::task::ArcWake;
use pal_event::Event;
use std::collections::HashSet;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::task::Context;
use std::task::Poll;
use user_driver::heap::HeapDmaClient;
use user_driver::interrupt::DeviceInterruptSource;

#[derive(Debug)]
struct TestChain {
    id: usize,
    buffers: Vec<Buffer>,
}

impl TestChain {
    fn new(id: usize, count: usize) -> Self {
        Self {
            id,
            buffers: (0..count)
                .map(|i| Buffer {
                    addr: 0x10_0000 + (id * 0x1000 + i * 0x100) as u64,
                    len: 0x100,
                    writeable: i % 2 == 1,
                })
                .collect(),
        }
    }
}

impl BufferChain for TestChain {
    fn buffers(&self) -> impl Iterator<Item = Buffer> + '_ {
        self.buffers.iter().copied()
    }
}

fn new_ring(size: u16, features: RingFeatures) -> (Ring<TestChain>, HostRing, Event) {
    test_with_tracing::init();
    let kick = Event::new().unwrap();
    let ring = Ring::new(
        &HeapDmaClient::new(),
        size,
        features,
        Notifier::Event(kick.try_clone().unwrap()),
    )
    .unwrap();
    let host = HostRing::new(ring.memory().clone());
    (ring, host, kick)
}

fn post_acquired(ring: &mut Ring<TestChain>, chains: Vec<TestChain>) -> usize {
    let needed: usize = chains.iter().map(|c| c.buffers.len()).sum();
    assert!(ring.credits_mut().try_acquire(needed));
    ring.post(chains)
}

#[test]
fn layout() {
    let layout = RingLayout::new(256);
    assert_eq!(layout.avail_offset, 4096);
    assert_eq!(layout.used_offset, 8192);
    assert_eq!(layout.len, 3 * 4096);

    let layout = RingLayout::new(4);
    assert_eq!(layout.avail_offset, 64);
    assert_eq!(layout.used_offset, 4096);
    assert_eq!(layout.len, 2 * 4096);
}

#[test]
fn invalid_sizes() {
    for size in [0, 1, 3, 100, 0xffff] {
        let r = Ring::<TestChain>::new(
            &HeapDmaClient::new(),
            size,
            RingFeatures::default(),
            Notifier::Event(Event::new().unwrap()),
        );
        assert!(matches!(r, Err(RingError::InvalidSize(s)) if s == size));
    }
}

#[test]
fn free_list_invariant() {
    for shift in 1..=8 {
        let size = 1u16 << shift;
        for chain_len in [1, 2, 3] {
            let (mut ring, mut host, _kick) = new_ring(size, RingFeatures::default());
            let n = size as usize / chain_len;
            let chains = (0..n).map(|id| TestChain::new(id, chain_len)).collect();
            assert_eq!(post_acquired(&mut ring, chains), n);
            assert_eq!(ring.free_descriptors(), size as usize - n * chain_len);

            let popped = host.pop_all();
            assert_eq!(popped.len(), n);
            let mut seen = HashSet::new();
            for chain in &popped {
                assert_eq!(chain.descriptors.len(), chain_len);
                let mut index = chain.head;
                for d in &chain.descriptors {
                    assert!(seen.insert(index), "descriptor {index} in two chains");
                    index = d.next.get();
                }
                host.complete(chain, 0);
            }

            let mut completed = Vec::new();
            assert_eq!(ring.poll_used(&mut completed).unwrap(), n);
            for (chain, _) in &completed {
                ring.credits_mut().release(chain.buffers.len());
            }
            assert_eq!(ring.free_descriptors(), size as usize);
            assert_eq!(ring.credits().current(), size as usize);
            assert_eq!(ring.in_flight(), 0);
        }
    }
}

#[test]
fn descriptors_match_buffers() {
    let (mut ring, mut host, _kick) = new_ring(8, RingFeatures::default());
    let chain = TestChain::new(3, 3);
    let expected = chain.buffers.clone();
    post_acquired(&mut ring, vec![chain]);
    let popped = host.pop().unwrap();
    for (d, b) in popped.descriptors.iter().zip(&expected) {
        assert_eq!(d.address.get(), b.addr);
        assert_eq!(d.length.get(), b.len);
        assert_eq!(d.flags().write(), b.writeable);
    }
    assert!(popped.descriptors[0].flags().next());
    assert!(popped.descriptors[1].flags().next());
    assert!(!popped.descriptors[2].flags().next());
    assert_eq!(popped.writeable_len(), 0x100);
}

#[test]
fn index_wraparound() {
    let (mut ring, mut host, _kick) = new_ring(4, RingFeatures::default());
    let mut next_id = 0;
    let mut completed = Vec::new();
    // Enough rounds for both 16-bit indexes to wrap twice.
    for round in 0..(2 * 65536 / 3 + 10) {
        let chains = (0..3)
            .map(|i| TestChain::new(next_id + i, 1 + usize::from(i == round % 3)))
            .collect();
        post_acquired(&mut ring, chains);
        let popped = host.pop_all();
        assert_eq!(popped.len(), 3);
        // Complete out of order.
        for chain in popped.iter().rev() {
            host.complete(chain, chain.head.into());
        }
        completed.clear();
        assert_eq!(ring.poll_used(&mut completed).unwrap(), 3);
        let ids: Vec<_> = completed.iter().map(|(c, _)| c.id).collect();
        assert_eq!(ids, [next_id + 2, next_id + 1, next_id]);
        for (chain, _) in &completed {
            ring.credits_mut().release(chain.buffers.len());
        }
        next_id += 3;
    }
    assert_eq!(ring.free_descriptors(), 4);
    assert_eq!(ring.credits().current(), 4);
}

#[test]
fn no_notify_suppresses_kick() {
    let (mut ring, host, kick) = new_ring(16, RingFeatures::default());
    host.set_no_notify(true);
    post_acquired(&mut ring, vec![TestChain::new(0, 1)]);
    assert_eq!(kick.try_wait(), None);

    host.set_no_notify(false);
    post_acquired(&mut ring, vec![TestChain::new(1, 1), TestChain::new(2, 1)]);
    assert_eq!(kick.try_wait(), Some(1));
}

#[test]
fn event_index_kick() {
    let features = RingFeatures {
        event_index: true,
        ..Default::default()
    };
    let (mut ring, host, kick) = new_ring(16, features);
    // The host wants a kick once the index moves past 5.
    host.set_avail_event(5);
    post_acquired(&mut ring, (0..3).map(|i| TestChain::new(i, 1)).collect());
    assert_eq!(kick.try_wait(), None);
    post_acquired(&mut ring, (3..6).map(|i| TestChain::new(i, 1)).collect());
    assert_eq!(kick.try_wait(), Some(1));
    // The event is now behind the index, so no more kicks.
    post_acquired(&mut ring, (6..8).map(|i| TestChain::new(i, 1)).collect());
    assert_eq!(kick.try_wait(), None);
    // The no-notify flag is ignored with event index.
    host.set_no_notify(true);
    host.set_avail_event(8);
    post_acquired(&mut ring, vec![TestChain::new(8, 1)]);
    assert_eq!(kick.try_wait(), Some(1));
}

#[test]
fn event_index_kicks_before_counter_wraps() {
    let features = RingFeatures {
        event_index: true,
        ..Default::default()
    };
    let (mut ring, mut host, kick) = new_ring(2, features);
    let threshold = u16::MAX / 2;
    let mut completed = Vec::new();
    for n in 1..=threshold + 1 {
        // The host's event stays one step past the published index.
        host.set_avail_event(n);
        post_acquired(&mut ring, vec![TestChain::new(0, 1)]);
        let expected = (n == threshold).then_some(1);
        assert_eq!(kick.try_wait(), expected, "post {n}");
        let chain = host.pop().unwrap();
        host.complete(&chain, 0);
        completed.clear();
        assert_eq!(ring.poll_used(&mut completed).unwrap(), 1);
        ring.credits_mut().release(1);
    }
}

#[test]
fn used_event_follows_completions() {
    let features = RingFeatures {
        event_index: true,
        ..Default::default()
    };
    let (mut ring, mut host, _kick) = new_ring(16, features);
    post_acquired(&mut ring, (0..4).map(|i| TestChain::new(i, 1)).collect());
    let popped = host.pop_all();
    // used_event starts at 0, so the first completion signals.
    assert!(host.complete(&popped[0], 0));
    assert!(!host.complete(&popped[1], 0));
    let mut completed = Vec::new();
    ring.poll_used(&mut completed).unwrap();
    assert_eq!(host.memory().used_event(), 2);
    assert!(host.complete(&popped[2], 0));
}

#[test]
fn end_to_end() {
    let (mut ring, mut host, kick) = new_ring(256, RingFeatures::default());
    let chains: Vec<_> = (0..10).map(|id| TestChain::new(id, 1)).collect();
    assert_eq!(post_acquired(&mut ring, chains), 10);
    assert_eq!(ring.credits().current(), 246);
    assert_eq!(kick.try_wait(), Some(1));

    let popped = host.pop_all();
    assert_eq!(popped.len(), 10);
    for chain in &popped {
        host.push_used(chain.head.into(), 100 + u32::from(chain.head));
    }
    host.publish();

    let mut completed = Vec::new();
    let mut calls = vec![0; 10];
    ring.poll_used(&mut completed).unwrap();
    for (chain, len) in completed.drain(..) {
        calls[chain.id] += 1;
        assert_eq!(chain.buffers[0].addr, TestChain::new(chain.id, 1).buffers[0].addr);
        let head = popped
            .iter()
            .find(|p| p.descriptors[0].address.get() == chain.buffers[0].addr)
            .unwrap()
            .head;
        assert_eq!(len, 100 + u32::from(head));
        ring.credits_mut().release(chain.buffers.len());
    }
    assert_eq!(calls, [1; 10]);
    assert_eq!(ring.credits().current(), 256);
    assert_eq!(ring.poll_used(&mut completed).unwrap(), 0);
    assert!(completed.is_empty());
}

#[test]
fn host_protocol_violations() {
    let (mut ring, mut host, _kick) = new_ring(8, RingFeatures::default());
    post_acquired(&mut ring, vec![TestChain::new(0, 1)]);
    let mut completed = Vec::new();

    host.push_used(8, 0);
    host.publish();
    assert!(matches!(
        ring.poll_used(&mut completed),
        Err(RingError::InvalidDescriptorId(8))
    ));

    let (mut ring, mut host, _kick) = new_ring(8, RingFeatures::default());
    post_acquired(&mut ring, vec![TestChain::new(0, 2)]);
    // Descriptor 1 is the tail of the chain, not a head.
    host.push_used(1, 0);
    host.publish();
    assert!(matches!(
        ring.poll_used(&mut completed),
        Err(RingError::NotInFlight(1))
    ));

    let (mut ring, mut host, _kick) = new_ring(8, RingFeatures::default());
    host.publish_raw_used_idx(9);
    assert!(matches!(
        ring.poll_used(&mut completed),
        Err(RingError::UsedIndexOverrun { used_idx: 9, .. })
    ));
    assert!(completed.is_empty());
}

#[test]
#[should_panic(expected = "descriptors with")]
fn post_without_room_panics() {
    let (mut ring, _host, _kick) = new_ring(4, RingFeatures::default());
    ring.post((0..3).map(|i| TestChain::new(i, 2)));
}

struct WakeFlag(AtomicBool);

impl ArcWake for WakeFlag {
    fn wake_by_ref(arc_self: &Arc<Self>) {
        arc_self.0.store(true, Ordering::SeqCst);
    }
}

#[test]
fn credits_wake_waiter() {
    let (mut ring, _host, _kick) = new_ring(4, RingFeatures::default());
    let flag = Arc::new(WakeFlag(AtomicBool::new(false)));
    let waker = waker(flag.clone());
    let mut cx = Context::from_waker(&waker);

    assert_eq!(ring.credits_mut().poll_acquire(&mut cx, 3), Poll::Ready(()));
    assert!(ring.credits_mut().poll_acquire(&mut cx, 2).is_pending());
    assert!(!flag.0.load(Ordering::SeqCst));
    ring.credits_mut().release(1);
    assert!(flag.0.load(Ordering::SeqCst));
    assert_eq!(ring.credits_mut().poll_acquire(&mut cx, 2), Poll::Ready(()));
    assert_eq!(ring.credits().current(), 0);
}

struct CountingDevice(AtomicUsize);

impl QueueNotify for CountingDevice {
    fn notify_queue(&self, queue: u16) {
        assert_eq!(queue, 1);
        self.0.fetch_add(1, Ordering::SeqCst);
    }
}

#[test]
fn notifier_variants() {
    let event = Notifier::Event(Event::new().unwrap());
    assert!(matches!(event.wake_wait(), Err(NotifyError::WakeUnsupported)));

    let device = Arc::new(CountingDevice(AtomicUsize::new(0)));
    let (wake, mut interrupt) = DeviceInterruptSource::new();
    let notifier = Notifier::Device {
        device: device.clone(),
        queue: 1,
        wake,
    };
    notifier.notify();
    assert_eq!(device.0.load(Ordering::SeqCst), 1);

    let mut cx = Context::from_waker(futures::task::noop_waker_ref());
    assert!(interrupt.poll(&mut cx).is_pending());
    notifier.wake_wait().unwrap();
    assert_eq!(interrupt.poll(&mut cx), Poll::Ready(()));
}
