//! Integration tests for the caching allocator.

use std::sync::Arc;

use gpu_dispatch_core::gpu::host::HostDevice;
use gpu_dispatch_core::{AllocatorError, DeviceAllocator, DeviceError};

fn allocator(capacity: usize) -> (Arc<HostDevice>, DeviceAllocator) {
    let device = Arc::new(HostDevice::with_capacity(capacity));
    let alloc = DeviceAllocator::new(device.clone());
    (device, alloc)
}

#[test]
fn test_exact_size_reuse_skips_device() {
    let (device, alloc) = allocator(1 << 20);

    let first = alloc.alloc(4096).unwrap();
    let id = first.id();
    drop(first);

    let second = alloc.alloc(4096).unwrap();
    assert_eq!(second.id(), id);
    assert_eq!(device.allocate_calls(), 1);
}

#[test]
fn test_different_size_does_not_reuse() {
    let (device, alloc) = allocator(1 << 20);

    let small = alloc.alloc(1024).unwrap();
    let small_id = small.id();
    drop(small);

    let large = alloc.alloc(1025).unwrap();
    assert_ne!(large.id(), small_id);
    assert_eq!(device.allocate_calls(), 2);

    // The 1024-byte block is still pooled and still serves its own size.
    assert_eq!(alloc.pooled_count(), 1);
    let again = alloc.alloc(1024).unwrap();
    assert_eq!(again.id(), small_id);
}

#[test]
fn test_exhaustion_evicts_pool_and_retries() {
    let (device, alloc) = allocator(2048);

    let held = alloc.alloc(1024).unwrap();
    let other = alloc.alloc(1024).unwrap();
    drop(held);
    drop(other);
    assert_eq!(alloc.pooled_count(), 2);
    assert_eq!(device.resident_bytes(), 2048);

    // No 512 block pooled and no room on the device: evict, then retry.
    let buf = alloc.alloc(512).unwrap();
    assert_eq!(buf.len(), 512);
    assert_eq!(alloc.pooled_count(), 0);
    assert_eq!(alloc.stats().evictions, 2);
    assert_eq!(device.resident_bytes(), 512);
}

#[test]
fn test_injected_failure_recovers_after_eviction() {
    let (device, alloc) = allocator(1 << 20);

    drop(alloc.alloc(256).unwrap());
    device.fail_next_allocations(1);

    let buf = alloc.alloc(128).unwrap();
    assert_eq!(buf.len(), 128);
    assert_eq!(alloc.pooled_count(), 0);
    assert_eq!(device.allocate_calls(), 3);
}

#[test]
fn test_exhaustion_after_eviction_is_out_of_memory() {
    let (device, alloc) = allocator(1024);

    let held = alloc.alloc(1024).unwrap();
    let err = alloc.alloc(1).unwrap_err();
    match err {
        AllocatorError::OutOfMemory { nbytes, source } => {
            assert_eq!(nbytes, 1);
            assert!(matches!(source, DeviceError::OutOfMemory { requested: 1, .. }));
        }
    }

    // The failed request left no trace in the bookkeeping.
    assert_eq!(alloc.live_count(), 1);
    assert_eq!(alloc.live_bytes(), 1024);
    drop(held);
    assert_eq!(device.resident_bytes(), 1024);
}

#[test]
fn test_allocation_sequence_call_counts() {
    let (device, alloc) = allocator(1 << 20);

    let b1 = alloc.alloc(1024).unwrap();
    let b1_id = b1.id();
    assert_eq!(device.allocate_calls(), 1);
    drop(b1);

    let b2 = alloc.alloc(1024).unwrap();
    assert_eq!(b2.id(), b1_id);
    assert_eq!(device.allocate_calls(), 1);

    let b3 = alloc.alloc(2048).unwrap();
    assert_eq!(b3.len(), 2048);
    assert_eq!(device.allocate_calls(), 2);

    let stats = alloc.stats();
    assert_eq!(stats.live_blocks, 2);
    assert_eq!(stats.live_bytes, 3072);
    assert_eq!(stats.hits, 1);
    assert_eq!(stats.misses, 2);
}

#[test]
fn test_free_foreign_buffer_is_ignored() {
    let device = Arc::new(HostDevice::with_capacity(1 << 20));
    let owner = DeviceAllocator::new(device.clone());
    let stranger = DeviceAllocator::new(device.clone());

    let mut buf = owner.alloc(1024).unwrap();
    let id = buf.id();
    let before = stranger.stats();

    stranger.free(&mut buf);

    assert_eq!(stranger.stats(), before);
    assert_eq!(buf.id(), id);
    assert_eq!(buf.len(), 1024);

    // The buffer still goes home on drop.
    drop(buf);
    assert_eq!(owner.pooled_count(), 1);
    assert_eq!(owner.live_count(), 0);
    assert_eq!(stranger.pooled_count(), 0);
}

#[test]
fn test_cloned_handles_share_pool() {
    let (device, alloc) = allocator(1 << 20);
    let handle = alloc.clone();

    drop(alloc.alloc(64).unwrap());
    let buf = handle.alloc(64).unwrap();

    assert_eq!(device.allocate_calls(), 1);
    assert_eq!(handle.stats().hits, 1);
    drop(buf);
}

#[test]
fn test_concurrent_alloc_and_drop() {
    let (device, alloc) = allocator(1 << 24);

    std::thread::scope(|scope| {
        for worker in 0..8 {
            let alloc = &alloc;
            scope.spawn(move || {
                for i in 0..100 {
                    let nbytes = 256 * (1 + (worker + i) % 4);
                    let buf = alloc.alloc(nbytes).unwrap();
                    buf.write(&vec![worker as u8; nbytes]).unwrap();
                    assert_eq!(buf.read_bytes().unwrap(), vec![worker as u8; nbytes]);
                }
            });
        }
    });

    let stats = alloc.stats();
    assert_eq!(stats.live_blocks, 0);
    assert_eq!(stats.hits + stats.misses, 800);
    // No more than eight blocks of any one size are ever live at once.
    assert!(device.allocate_calls() <= 32);
}
