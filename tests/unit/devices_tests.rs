//! Media device allocation and orphan reclamation.

use botfleet::meet::devices::{LoopbackAllocator, MediaAllocator};

#[tokio::test]
async fn allocations_are_exclusive_and_released() {
    let allocator = LoopbackAllocator::new(2);
    let a = allocator.allocate("s1", false).await.expect("a");
    let b = allocator.allocate("s2", true).await.expect("b");
    assert_ne!(a.audio_sink, b.audio_sink);
    assert!(b.video_device.is_some());
    assert!(a.video_device.is_none());

    assert!(allocator.allocate("s3", false).await.is_err());

    allocator.release(&a).await.expect("release");
    allocator.allocate("s3", false).await.expect("slot reuse");
}

#[tokio::test]
async fn orphan_pass_reclaims_dead_sessions() {
    let allocator = LoopbackAllocator::new(3);
    allocator.allocate("alive", false).await.expect("alive");
    allocator.allocate("dead", false).await.expect("dead");

    let reclaimed = allocator
        .reclaim_orphans(&["alive".to_owned()])
        .await
        .expect("reclaim");
    assert_eq!(reclaimed, 1);

    // The survivor's slot stays owned.
    assert!(allocator.allocate("third", false).await.is_ok());
    assert!(allocator.allocate("fourth", false).await.is_ok());
    assert!(allocator.allocate("fifth", false).await.is_err());
}
