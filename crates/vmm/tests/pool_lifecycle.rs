use vmm::{PoolError, PoolId, PoolRegistry, Segment};

fn registry() -> PoolRegistry<u32> {
    PoolRegistry::new(64).expect("power-of-two alignment")
}

#[test]
fn allocate_then_free_restores_query() -> Result<(), PoolError> {
    let mut pools = registry();
    let id = pools.create(0x4000, 4096)?;

    for size in [1, 63, 64, 65, 1000, 4096] {
        let addr = pools.allocate(id, size)?;
        pools.deallocate(id, addr)?;
        assert_eq!(pools.query(id)?, 4096, "size {size}");
    }
    Ok(())
}

#[test]
fn rounding_to_granularity() -> Result<(), PoolError> {
    let mut pools = registry();
    let id = pools.create(0x4000, 1024)?;
    pools.allocate(id, 100)?;
    assert_eq!(pools.query(id)?, 896);
    Ok(())
}

#[test]
fn delete_with_outstanding_allocation_is_refused() -> Result<(), PoolError> {
    let mut pools = registry();
    let id = pools.create(0x4000, 1024)?;
    let addr = pools.allocate(id, 128)?;
    assert!(matches!(pools.delete(id), Err(PoolError::InUse { .. })));

    pools.deallocate(id, addr)?;
    pools.delete(id)?;
    assert_eq!(pools.query(id), Err(PoolError::UnknownPool(id)));
    Ok(())
}

#[test]
fn adjacent_allocations_merge_in_either_order() -> Result<(), PoolError> {
    for reverse in [false, true] {
        let mut pools = registry();
        let id = pools.create(0x4000, 256)?;
        let a = pools.allocate(id, 128)?;
        let b = pools.allocate(id, 128)?;
        assert_eq!(pools.query(id)?, 0);

        let order = if reverse { [b, a] } else { [a, b] };
        for addr in order {
            pools.deallocate(id, addr)?;
        }
        let pool = pools.get(id)?;
        assert_eq!(pool.free_segments(), &[Segment::new(0x4000, 256)]);
    }
    Ok(())
}

#[test]
fn exhaustion_and_oversized_requests() -> Result<(), PoolError> {
    let mut pools = registry();
    let id = pools.create(0x4000, 512)?;
    pools.allocate(id, 512)?;

    assert_eq!(
        pools.allocate(id, 1),
        Err(PoolError::Exhausted { requested: 64 })
    );
    assert!(pools.can_ever_fit(id, 512)?);
    assert!(!pools.can_ever_fit(id, 513)?);
    Ok(())
}

#[test]
fn stats_follow_usage() -> Result<(), PoolError> {
    let mut pools = registry();
    let id = pools.create(0x4000, 1024)?;
    let a = pools.allocate(id, 256)?;
    let _b = pools.allocate(id, 256)?;
    pools.deallocate(id, a)?;

    let stats = pools.stats(id)?;
    assert_eq!(stats.used_bytes, 256);
    assert_eq!(stats.free_bytes, 768);
    assert_eq!(stats.free_segments, 2);
    assert_eq!(stats.live_allocations, 1);
    assert_eq!(stats.min_free_bytes, 512);
    assert_eq!(stats.utilization(), 25);
    Ok(())
}

#[test]
fn invalid_regions() {
    let mut pools = registry();
    assert_eq!(
        pools.create(0, 128),
        Err(PoolError::InvalidRegion { base: 0, size: 128 })
    );
    assert_eq!(
        pools.create(0x4000, 0),
        Err(PoolError::InvalidRegion {
            base: 0x4000,
            size: 0
        })
    );
    // Failed creations do not consume ids.
    assert_eq!(pools.create(0x4000, 64), Ok(PoolId(1)));
}
