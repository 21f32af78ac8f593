mod support;

use std::sync::Arc;
use std::time::Duration;

use assert_matches::assert_matches;
use rstest::rstest;
use sqlcache::store::{METRIC_ERROR, METRIC_GET, METRIC_HIT, METRIC_MISS, METRIC_PUT};
use sqlcache::{CacheStatistics, ErrorKind, ResultCodec, Ttl};
use sqlcache_test::FakeRedis;

use crate::support::*;

#[test]
fn test_put_then_get() {
    let redis = FakeRedis::new();
    let store = store(&redis);

    assert_eq!(store.get("test:k").unwrap(), None);
    store.put("test:k", Ttl::secs(60), b"value").unwrap();
    assert_eq!(store.get("test:k").unwrap(), Some(b"value".to_vec()));

    assert_eq!(
        store.statistics(),
        CacheStatistics {
            hit: 1,
            miss: 1,
            put: 1,
            ..Default::default()
        }
    );
}

#[rstest]
#[case::expiring(Ttl::secs(60), Some(true))]
#[case::forever(Ttl::Forever, Some(false))]
#[case::not_cached(Ttl::NoCache, None)]
fn test_put_ttl_handling(#[case] ttl: Ttl, #[case] expires: Option<bool>) {
    let redis = FakeRedis::new();
    let store = store(&redis);

    store.put("test:k", ttl, b"value").unwrap();

    assert_eq!(redis.ttl("test:k").map(|t| t.is_some()), expires);
    if ttl == Ttl::NoCache {
        assert_eq!(redis.calls("SET"), 0);
        assert_eq!(store.statistics().skipped, 1);
    }
}

#[test]
fn test_expiry_uses_seconds() {
    let redis = FakeRedis::new();
    let store = store(&redis);

    store.put("test:k", Ttl::secs(60), b"value").unwrap();

    let remaining = redis.ttl("test:k").flatten().unwrap();
    assert!(remaining > Duration::from_secs(55));
    assert!(remaining <= Duration::from_secs(60));
}

#[test]
fn test_fetch_and_store_result() {
    let redis = FakeRedis::new();
    let store = store(&redis);
    let codec = ResultCodec::default();
    let result = orders_result();

    assert_eq!(store.fetch("test:k", &codec), None);
    assert!(store.store("test:k", Ttl::secs(60), &codec, &result));
    assert_eq!(store.fetch("test:k", &codec), Some(result));
}

#[test]
fn test_store_skips_no_cache_ttl() {
    let redis = FakeRedis::new();
    let store = store(&redis);

    assert!(!store.store("test:k", Ttl::NoCache, &ResultCodec::default(), &orders_result()));
    assert_eq!(redis.total_calls(), 0);
}

#[test]
fn test_undecodable_entry_is_a_miss() {
    let redis = FakeRedis::new();
    let store = store(&redis);
    redis.set("test:k", b"\x07garbage".to_vec());

    assert_eq!(store.fetch("test:k", &ResultCodec::default()), None);

    let stats = store.statistics();
    assert_eq!(stats.miss, 1);
    assert_eq!(stats.error, 1);
    assert_eq!(stats.hit, 0);
}

#[test]
fn test_oversized_result_is_not_stored() {
    let redis = FakeRedis::new();
    let store = store(&redis);

    assert!(!store.store("test:k", Ttl::secs(60), &ResultCodec::new(16), &orders_result()));
    assert_eq!(redis.calls("SET"), 0);
    assert_eq!(store.statistics().error, 1);
}

#[test]
fn test_outage_fails_open() {
    let redis = FakeRedis::new();
    let store = store(&redis);
    let codec = ResultCodec::default();
    redis.set_down(true);

    assert_eq!(store.fetch("test:k", &codec), None);
    assert!(!store.store("test:k", Ttl::secs(60), &codec, &orders_result()));
    assert_eq!(store.statistics().error, 2);

    redis.set_down(false);
    assert!(store.store("test:k", Ttl::secs(60), &codec, &orders_result()));
}

#[test]
fn test_exhausted_pool_is_unavailable() {
    let redis = FakeRedis::new();
    let store = store(&redis);
    let _first = store.connection().unwrap();
    let _second = store.connection().unwrap();

    let err = store.get("test:k").unwrap_err();
    assert_matches!(err.kind(), ErrorKind::ConnectionUnavailable);
    assert!(err.is_unavailable());
}

#[test]
fn test_refused_connection_is_unavailable() {
    let redis = FakeRedis::new();
    redis.set_down(true);
    let store = store(&redis);

    assert_matches!(store.ping(), Err(err) if err.is_unavailable());
}

#[test]
fn test_ping() {
    let redis = FakeRedis::new();
    store(&redis).ping().unwrap();
    assert_eq!(redis.calls("PING"), 1);
}

#[test]
fn test_metrics_for_miss_put_and_hit() {
    let redis = FakeRedis::new();
    let metrics = Arc::new(RecordingMetrics::default());
    let store = store_with_metrics(&redis, metrics.clone());
    let codec = ResultCodec::default();

    assert_eq!(store.fetch("test:k", &codec), None);
    assert_eq!(metrics.timings(), vec![METRIC_GET]);
    assert_eq!(metrics.increments(), vec![METRIC_MISS]);

    metrics.clear();
    assert!(store.store("test:k", Ttl::secs(60), &codec, &orders_result()));
    assert_eq!(metrics.timings(), vec![METRIC_PUT]);
    assert!(metrics.increments().is_empty());

    metrics.clear();
    assert!(store.fetch("test:k", &codec).is_some());
    assert_eq!(metrics.timings(), vec![METRIC_GET]);
    assert_eq!(metrics.increments(), vec![METRIC_HIT]);
}

#[test]
fn test_metrics_skip_uncached_put() {
    let redis = FakeRedis::new();
    let metrics = Arc::new(RecordingMetrics::default());
    let store = store_with_metrics(&redis, metrics.clone());

    store.put("test:k", Ttl::NoCache, b"value").unwrap();
    assert!(!store.store("test:k", Ttl::NoCache, &ResultCodec::default(), &orders_result()));

    assert!(metrics.timings().is_empty());
    assert!(metrics.increments().is_empty());
}

#[test]
fn test_metrics_during_outage() {
    let redis = FakeRedis::new();
    let metrics = Arc::new(RecordingMetrics::default());
    let store = store_with_metrics(&redis, metrics.clone());
    let codec = ResultCodec::default();
    redis.set_down(true);

    assert_eq!(store.fetch("test:k", &codec), None);
    assert_eq!(metrics.timings(), vec![METRIC_GET]);
    assert_eq!(metrics.increments(), vec![METRIC_ERROR, METRIC_MISS]);

    metrics.clear();
    assert!(!store.store("test:k", Ttl::secs(60), &codec, &orders_result()));
    assert_eq!(metrics.timings(), vec![METRIC_PUT]);
    assert_eq!(metrics.increments(), vec![METRIC_ERROR]);
}
