use egd_core::EntropyPool;

#[test]
fn deposit_into_full_pool_returns_zero_and_leaves_total_unchanged() {
    let mut pool = EntropyPool::new(10, 10);
    assert_eq!(pool.deposit(&[1u8; 10]), 10);
    assert_eq!(pool.deposit(&[2u8; 5]), 0);
    assert_eq!(pool.total_bytes(), 10);
}

#[test]
fn scenario_s3_deposit_cap_across_three_chunks() {
    let mut pool = EntropyPool::new(100, 40);
    assert_eq!(pool.deposit(&[1u8; 50]), 50);
    assert_eq!(pool.deposit(&[2u8; 50]), 50);
    assert_eq!(pool.deposit(&[3u8; 50]), 0);
    assert_eq!(pool.total_bytes(), 100);
    assert_eq!(pool.stats().chunk_count, 3);
}

#[test]
fn stats_reports_is_full_via_total_vs_max() {
    let mut pool = EntropyPool::new(20, 20);
    pool.deposit(&[1u8; 20]);
    let stats = pool.stats();
    assert_eq!(stats.total_bytes, stats.max_entropy);
}
