//! Routing over registry and price snapshots

use agora::config::PricingConfig;
use agora::domain::{Entity, InfraTier};
use agora::pricing::PriceSnapshot;
use agora::registry::Registry;
use agora::routing::{find_best_service, route_with_fallback, RankingPolicy, RouteDecision, RouteRequest};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;

/// Candidates priced [150, 90, 60] with latencies [1s, 3s, 2s]
fn registry() -> Registry {
    let registry = Registry::new();
    for (id, price, latency_ms) in [("svc-150", 150, 1_000), ("svc-90", 90, 3_000), ("svc-60", 60, 2_000)] {
        registry
            .register(
                Entity::service(id, latency_ms, InfraTier::Cloud)
                    .with_capability("summarize")
                    .with_base_price(Decimal::from(price)),
            )
            .unwrap();
    }
    registry
}

fn ids(candidates: &[agora::routing::RouteCandidate]) -> Vec<&str> {
    candidates.iter().map(|c| c.service_id.as_str()).collect()
}

#[test]
fn budget_and_latency_filters_then_price_order() {
    let registry = registry();
    let prices = PriceSnapshot::unadjusted(&PricingConfig::default());

    // 150 exceeds the budget; at 2.5s only the 2s service remains
    let strict = RouteRequest::new("summarize", dec!(100)).with_latency_constraint(2_500);
    let ranked = route_with_fallback(&registry.snapshot(), &prices, &strict, RankingPolicy::PriceFirst);
    assert_eq!(ids(&ranked), vec!["svc-60"]);

    // A 3s constraint admits the 3s service too, cheapest first
    let relaxed = RouteRequest::new("summarize", dec!(100)).with_latency_constraint(3_000);
    let ranked = route_with_fallback(&registry.snapshot(), &prices, &relaxed, RankingPolicy::PriceFirst);
    assert_eq!(ids(&ranked), vec!["svc-60", "svc-90"]);
    assert_eq!(ranked[0].quote.unit_price, dec!(60));
}

#[test]
fn latency_first_reorders_the_same_candidates() {
    let registry = registry();
    let prices = PriceSnapshot::unadjusted(&PricingConfig::default());
    let request = RouteRequest::new("summarize", dec!(200));

    let ranked = route_with_fallback(&registry.snapshot(), &prices, &request, RankingPolicy::LatencyFirst);
    assert_eq!(ids(&ranked), vec!["svc-150", "svc-60", "svc-90"]);
}

#[test]
fn demand_multiplier_scales_every_quote() {
    let registry = registry();
    let config = PricingConfig::default();
    let busy = PriceSnapshot::with_multipliers(&config, [("summarize".to_string(), dec!(2.0))]);

    // At x2 only the 60 service (now 120) fits a 130 budget
    let request = RouteRequest::new("summarize", dec!(130));
    let ranked = route_with_fallback(&registry.snapshot(), &busy, &request, RankingPolicy::PriceFirst);
    assert_eq!(ids(&ranked), vec!["svc-60"]);
    assert_eq!(ranked[0].quote.unit_price, dec!(120));
}

#[test]
fn find_best_service_is_deterministic() {
    let registry = registry();
    let snapshot = registry.snapshot();
    let prices = PriceSnapshot::unadjusted(&PricingConfig::default());
    let request = RouteRequest::new("summarize", dec!(100));

    let first = find_best_service(&snapshot, &prices, &request, RankingPolicy::PriceFirst);
    for _ in 0..100 {
        assert_eq!(
            find_best_service(&snapshot, &prices, &request, RankingPolicy::PriceFirst),
            first
        );
    }
    assert_eq!(first.candidate().map(|c| c.service_id.as_str()), Some("svc-60"));
}

#[test]
fn unknown_operation_has_no_candidate() {
    let registry = registry();
    let prices = PriceSnapshot::unadjusted(&PricingConfig::default());
    let request = RouteRequest::new("transcribe", dec!(1_000));

    assert_eq!(
        find_best_service(&registry.snapshot(), &prices, &request, RankingPolicy::PriceFirst),
        RouteDecision::NoCandidate
    );
}

#[test]
fn tier_requirement_filters_services() {
    let registry = registry();
    registry
        .register(
            Entity::service("svc-edge", 500, InfraTier::Edge)
                .with_capability("summarize")
                .with_base_price(dec!(95)),
        )
        .unwrap();
    let prices = PriceSnapshot::unadjusted(&PricingConfig::default());
    let request = RouteRequest::new("summarize", dec!(100)).with_tier(InfraTier::Edge);

    let ranked = route_with_fallback(&registry.snapshot(), &prices, &request, RankingPolicy::PriceFirst);
    assert_eq!(ids(&ranked), vec!["svc-edge"]);
}
