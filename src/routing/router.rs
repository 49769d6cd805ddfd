//! Service Router - 服務路由
//!
//! 根據操作、預算與延遲約束選擇候選服務。
//! Routing is a pure function of (registry snapshot, price snapshot, request):
//! the same inputs always produce the same ranked list.

use ordered_float::OrderedFloat;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::cmp::{Ordering, Reverse};
use std::sync::Arc;
use tracing::debug;

use crate::domain::{EntityId, InfraTier, PriceQuote, Task};
use crate::pricing::{PriceSnapshot, PricingEngine};
use crate::registry::{Registry, RegistrySnapshot};

/// 候選排序策略
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RankingPolicy {
    /// Cheapest first, then lower latency, then higher success rate
    #[default]
    PriceFirst,
    /// Fastest first, then cheaper, then higher success rate
    LatencyFirst,
    /// Most reliable first, then cheaper, then lower latency
    ReliabilityFirst,
}

impl RankingPolicy {
    fn compare(&self, a: &RouteCandidate, b: &RouteCandidate) -> Ordering {
        let price = a.quote.unit_price.cmp(&b.quote.unit_price);
        let latency = a.latency_ms.cmp(&b.latency_ms);
        // Higher success rate sorts first
        let reliability =
            Reverse(OrderedFloat(a.success_rate)).cmp(&Reverse(OrderedFloat(b.success_rate)));

        let ordering = match self {
            RankingPolicy::PriceFirst => price.then(latency).then(reliability),
            RankingPolicy::LatencyFirst => latency.then(price).then(reliability),
            RankingPolicy::ReliabilityFirst => reliability.then(price).then(latency),
        };
        // Entity id keeps the order total
        ordering.then_with(|| a.service_id.cmp(&b.service_id))
    }
}

/// 路由請求
#[derive(Debug, Clone, PartialEq)]
pub struct RouteRequest {
    pub operation_tag: String,
    /// Maximum acceptable unit price
    pub budget: Decimal,
    /// Maximum declared latency (ms); `None` accepts any
    pub latency_constraint_ms: Option<u64>,
    pub required_tier: Option<InfraTier>,
    /// Ledger sequence number the resulting quotes are pinned to
    pub at_sequence: u64,
}

impl RouteRequest {
    pub fn new(operation_tag: &str, budget: Decimal) -> Self {
        Self {
            operation_tag: operation_tag.to_string(),
            budget,
            latency_constraint_ms: None,
            required_tier: None,
            at_sequence: 0,
        }
    }

    /// 由任務建立路由請求
    pub fn for_task(task: &Task, at_sequence: u64) -> Self {
        Self {
            operation_tag: task.operation_tag.clone(),
            budget: Decimal::from(task.budget_ceiling),
            latency_constraint_ms: task.latency_constraint_ms,
            required_tier: task.required_tier,
            at_sequence,
        }
    }

    pub fn with_latency_constraint(mut self, latency_ms: u64) -> Self {
        self.latency_constraint_ms = Some(latency_ms);
        self
    }

    pub fn with_tier(mut self, tier: InfraTier) -> Self {
        self.required_tier = Some(tier);
        self
    }

    pub fn at_sequence(mut self, sequence: u64) -> Self {
        self.at_sequence = sequence;
        self
    }
}

/// 候選服務
#[derive(Debug, Clone, PartialEq)]
pub struct RouteCandidate {
    pub service_id: EntityId,
    pub quote: PriceQuote,
    pub latency_ms: u64,
    pub tier: InfraTier,
    pub success_rate: f64,
}

/// Outcome of picking a single service
#[derive(Debug, Clone, PartialEq)]
pub enum RouteDecision {
    Selected(RouteCandidate),
    /// Nothing matched the capability, latency, tier and budget filters
    NoCandidate,
}

impl RouteDecision {
    pub fn candidate(&self) -> Option<&RouteCandidate> {
        match self {
            RouteDecision::Selected(candidate) => Some(candidate),
            RouteDecision::NoCandidate => None,
        }
    }
}

/// Every eligible service for the request, best first (possibly empty)
pub fn route_with_fallback(
    registry: &RegistrySnapshot,
    prices: &PriceSnapshot,
    request: &RouteRequest,
    policy: RankingPolicy,
) -> Vec<RouteCandidate> {
    let mut candidates: Vec<RouteCandidate> = registry
        .with_capability(&request.operation_tag)
        .filter_map(|entity| {
            let profile = entity.service_profile()?;

            if let Some(max_latency) = request.latency_constraint_ms {
                if profile.latency_ms > max_latency {
                    return None;
                }
            }
            if let Some(tier) = request.required_tier {
                if profile.tier != tier {
                    return None;
                }
            }

            let unit_price = prices.price_for(&request.operation_tag, profile.base_price);
            if unit_price > request.budget {
                return None;
            }

            Some(RouteCandidate {
                service_id: entity.id.clone(),
                quote: PriceQuote {
                    operation_tag: request.operation_tag.clone(),
                    service_id: entity.id.clone(),
                    unit_price,
                    estimated_latency_ms: profile.latency_ms,
                    quoted_at_sequence: request.at_sequence,
                },
                latency_ms: profile.latency_ms,
                tier: profile.tier,
                success_rate: registry.service_stats(&entity.id).success_rate(),
            })
        })
        .collect();

    candidates.sort_by(|a, b| policy.compare(a, b));
    debug!(
        "Routed {} (budget {}): {} candidates",
        request.operation_tag,
        request.budget,
        candidates.len()
    );
    candidates
}

/// Best eligible service for the request
pub fn find_best_service(
    registry: &RegistrySnapshot,
    prices: &PriceSnapshot,
    request: &RouteRequest,
    policy: RankingPolicy,
) -> RouteDecision {
    route_with_fallback(registry, prices, request, policy)
        .into_iter()
        .next()
        .map_or(RouteDecision::NoCandidate, RouteDecision::Selected)
}

/// 路由器
///
/// Takes fresh snapshots of the registry and the current price cycle for
/// every call; holds no routing state of its own.
#[derive(Clone)]
pub struct Router {
    registry: Arc<Registry>,
    pricing: Arc<PricingEngine>,
    policy: RankingPolicy,
}

impl Router {
    pub fn new(registry: Arc<Registry>, pricing: Arc<PricingEngine>, policy: RankingPolicy) -> Self {
        Self {
            registry,
            pricing,
            policy,
        }
    }

    pub fn policy(&self) -> RankingPolicy {
        self.policy
    }

    pub fn find_best_service(&self, request: &RouteRequest) -> RouteDecision {
        find_best_service(
            &self.registry.snapshot(),
            &self.pricing.snapshot(),
            request,
            self.policy,
        )
    }

    pub fn route_with_fallback(&self, request: &RouteRequest) -> Vec<RouteCandidate> {
        route_with_fallback(
            &self.registry.snapshot(),
            &self.pricing.snapshot(),
            request,
            self.policy,
        )
    }
}
