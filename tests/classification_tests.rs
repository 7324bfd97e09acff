use chrono::Duration as ChronoDuration;
use netlens::model::{Tier, UNRESOLVED_SERVICE};
use std::sync::Arc;
use test_utils::{build_identifier, ip, manual_clock, test_classification_config, CountingAsnLookup, ScriptedResolver};


#[tokio::test]
async fn test_range_hit_skips_later_tiers() {
    let asn = Arc::new(CountingAsnLookup::new().with("8.8.8.8", 15169));
    let resolver = Arc::new(ScriptedResolver::new().with("8.8.8.8", "dns.google"));
    let id = build_identifier(asn.clone(), resolver.clone(), manual_clock(), &test_classification_config());

    let m = id.classify(ip("8.8.8.8")).await;
    assert_eq!(m.service_name, "Google DNS");
    assert_eq!(m.tier, Tier::Range);
    assert_eq!(m.confidence, 0.95);

    assert_eq!(asn.calls(), 0);
    assert_eq!(resolver.calls(), 0);
    let stats = id.stats().await;
    assert_eq!(stats.attempts(Tier::Asn), 0);
    assert_eq!(stats.attempts(Tier::Pattern), 0);
}

#[tokio::test]
async fn test_asn_hit_skips_pattern_and_dns() {
    // 203.0.113.0/24 is in no range or pattern table
    let asn = Arc::new(CountingAsnLookup::new().with("203.0.113.5", 13335));
    let resolver = Arc::new(ScriptedResolver::new());
    let id = build_identifier(asn.clone(), resolver.clone(), manual_clock(), &test_classification_config());

    let m = id.classify(ip("203.0.113.5")).await;
    assert_eq!(m.service_name, "Cloudflare");
    assert_eq!(m.tier, Tier::Asn);
    assert_eq!(m.confidence, 0.85);
    assert_eq!(asn.calls(), 1);
    assert_eq!(resolver.calls(), 0);
    assert_eq!(id.stats().await.attempts(Tier::Pattern), 0);
}

#[tokio::test]
async fn test_unknown_asn_falls_through_to_patterns() {
    // AS64500 is a documentation ASN with no provider entry
    let asn = Arc::new(CountingAsnLookup::new().with("52.10.0.1", 64500));
    let resolver = Arc::new(ScriptedResolver::new());
    let id = build_identifier(asn, resolver.clone(), manual_clock(), &test_classification_config());

    let m = id.classify(ip("52.10.0.1")).await;
    assert_eq!(m.service_name, "Amazon AWS");
    assert_eq!(m.tier, Tier::Pattern);
    assert_eq!(m.confidence, 0.75);
    assert_eq!(resolver.calls(), 0);
}

#[tokio::test]
async fn test_dns_timeout_is_unknown_with_short_ttl() {
    let clock = manual_clock();
    let resolver = Arc::new(ScriptedResolver::new());
    let id = build_identifier(
        Arc::new(CountingAsnLookup::new()),
        resolver.clone(),
        clock.clone(),
        &test_classification_config(),
    );
    let unknown_ip = ip("198.51.100.77");

    let m = id.classify(unknown_ip).await;
    assert_eq!(m.service_name, "unknown");
    assert_eq!(m.tier, Tier::ReverseDns);
    assert_eq!(m.confidence, 0.0);
    assert_eq!(resolver.calls(), 1);

    // Cached: served without another lookup
    clock.advance(ChronoDuration::seconds(5));
    assert!(id.classify(unknown_ip).await.is_unknown());
    assert_eq!(resolver.calls(), 1);

    // Past the short TTL but well inside the confirmed one: retried
    clock.advance(ChronoDuration::seconds(6));
    id.classify(unknown_ip).await;
    assert_eq!(resolver.calls(), 2);
    assert_eq!(id.stats().await.dns_timeouts, 2);
}

#[tokio::test]
async fn test_expired_match_is_reresolved_from_tier_one() {
    let clock = manual_clock();
    let id = build_identifier(
        Arc::new(CountingAsnLookup::new()),
        Arc::new(ScriptedResolver::new()),
        clock.clone(),
        &test_classification_config(),
    );

    let first = id.classify(ip("1.1.1.1")).await;
    assert_eq!(first.service_name, "Cloudflare DNS");

    clock.advance(ChronoDuration::seconds(59));
    let cached = id.classify(ip("1.1.1.1")).await;
    assert_eq!(cached.resolved_at, first.resolved_at);
    assert_eq!(id.stats().await.attempts(Tier::Range), 1);

    clock.advance(ChronoDuration::seconds(1));
    let fresh = id.classify(ip("1.1.1.1")).await;
    assert!(fresh.resolved_at > first.resolved_at);
    let stats = id.stats().await;
    assert_eq!(stats.attempts(Tier::Range), 2);
    assert_eq!(stats.cache_hits, 1);
    assert_eq!(stats.cache_misses, 2);
}

#[tokio::test]
async fn test_background_lookup_serves_stale_entry_meanwhile() {
    let clock = manual_clock();
    let resolver = Arc::new(
        ScriptedResolver::new()
            .with("198.51.100.8", "ec2-198-51-100-8.compute.amazonaws.com")
            .delayed(std::time::Duration::from_millis(20)),
    );
    let id = build_identifier(
        Arc::new(CountingAsnLookup::new()),
        resolver.clone(),
        clock.clone(),
        &test_classification_config(),
    );
    let target = ip("198.51.100.8");

    assert_eq!(id.classify_background(target).await.service_name, UNRESOLVED_SERVICE);
    id.settle().await;
    let resolved = id.classify_background(target).await;
    assert_eq!(resolved.service_name, "Amazon AWS");
    assert_eq!(resolved.tier, Tier::ReverseDns);

    // Once expired, the stale match is returned while the refresh runs
    clock.advance(ChronoDuration::seconds(61));
    let stale = id.classify_background(target).await;
    assert_eq!(stale.service_name, "Amazon AWS");
    assert_eq!(stale.resolved_at, resolved.resolved_at);
    id.settle().await;
    assert_eq!(resolver.calls(), 2);
    let refreshed = id.cached(target).await.unwrap();
    assert!(refreshed.resolved_at > resolved.resolved_at);
}

#[tokio::test]
async fn test_cache_is_bounded() {
    let mut config = test_classification_config();
    config.max_cache_entries = 2;
    let clock = manual_clock();
    let id = build_identifier(
        Arc::new(CountingAsnLookup::new()),
        Arc::new(ScriptedResolver::new()),
        clock.clone(),
        &config,
    );

    for addr in ["8.8.8.8", "1.1.1.1", "17.1.2.3"] {
        id.classify(ip(addr)).await;
        clock.advance(ChronoDuration::seconds(1));
    }

    let stats = id.stats().await;
    assert_eq!(stats.cache_entries, 2);
    assert_eq!(stats.evictions, 1);
    assert!(id.cached(ip("8.8.8.8")).await.is_none());
    assert!(id.cached(ip("17.1.2.3")).await.is_some());
}
