//! Task routing

mod router;

pub use router::{
    find_best_service, route_with_fallback, RankingPolicy, RouteCandidate, RouteDecision,
    RouteRequest, Router,
};
