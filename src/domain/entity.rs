use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Unique identifier of a registered entity
pub type EntityId = String;

/// Entity variant tag
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Agent,
    Service,
    Resource,
}

impl EntityKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::Agent => "agent",
            EntityKind::Service => "service",
            EntityKind::Resource => "resource",
        }
    }
}

impl std::fmt::Display for EntityKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Infrastructure class a service or resource runs on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InfraTier {
    Edge,
    Cloud,
}

impl InfraTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            InfraTier::Edge => "edge",
            InfraTier::Cloud => "cloud",
        }
    }
}

impl std::str::FromStr for InfraTier {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "edge" => Ok(InfraTier::Edge),
            "cloud" => Ok(InfraTier::Cloud),
            other => Err(format!("Unknown infrastructure tier: {}", other)),
        }
    }
}

/// Historical execution counters, owned and mutated by the registry
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceStats {
    pub attempts: u64,
    pub successes: u64,
}

impl ServiceStats {
    /// Laplace-smoothed success rate; a service with no history scores 0.5
    pub fn success_rate(&self) -> f64 {
        (self.successes as f64 + 1.0) / (self.attempts as f64 + 2.0)
    }

    pub fn record(&mut self, success: bool) {
        self.attempts += 1;
        if success {
            self.successes += 1;
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AgentProfile {
    /// Name of the decision strategy the agent runs with
    pub strategy: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceProfile {
    /// Service-specific base price; `None` falls back to the operation's base price
    pub base_price: Option<Decimal>,
    /// Declared latency in milliseconds
    pub latency_ms: u64,
    pub tier: InfraTier,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceProfile {
    pub tier: InfraTier,
    pub capacity_units: u64,
}

/// Typed per-variant data of an entity
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EntityProfile {
    Agent(AgentProfile),
    Service(ServiceProfile),
    Resource(ResourceProfile),
}

/// A registered participant: agent, service, or resource
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    pub id: EntityId,
    pub capabilities: BTreeSet<String>,
    /// Declared constraints (e.g. "tier" = "edge", "max_latency_ms" = "2000")
    pub constraints: BTreeMap<String, String>,
    pub profile: EntityProfile,
}

impl Entity {
    pub fn agent(id: impl Into<EntityId>) -> Self {
        Self {
            id: id.into(),
            capabilities: BTreeSet::new(),
            constraints: BTreeMap::new(),
            profile: EntityProfile::Agent(AgentProfile::default()),
        }
    }

    pub fn service(id: impl Into<EntityId>, latency_ms: u64, tier: InfraTier) -> Self {
        Self {
            id: id.into(),
            capabilities: BTreeSet::new(),
            constraints: BTreeMap::new(),
            profile: EntityProfile::Service(ServiceProfile {
                base_price: None,
                latency_ms,
                tier,
            }),
        }
    }

    pub fn resource(id: impl Into<EntityId>, tier: InfraTier, capacity_units: u64) -> Self {
        Self {
            id: id.into(),
            capabilities: BTreeSet::new(),
            constraints: BTreeMap::new(),
            profile: EntityProfile::Resource(ResourceProfile {
                tier,
                capacity_units,
            }),
        }
    }

    pub fn with_capability(mut self, capability: &str) -> Self {
        self.capabilities.insert(capability.to_string());
        self
    }

    pub fn with_constraint(mut self, name: &str, value: &str) -> Self {
        self.constraints.insert(name.to_string(), value.to_string());
        self
    }

    /// Set the service base price (no-op for other variants)
    pub fn with_base_price(mut self, price: Decimal) -> Self {
        if let EntityProfile::Service(profile) = &mut self.profile {
            profile.base_price = Some(price);
        }
        self
    }

    pub fn with_strategy(mut self, strategy: &str) -> Self {
        if let EntityProfile::Agent(profile) = &mut self.profile {
            profile.strategy = Some(strategy.to_string());
        }
        self
    }

    pub fn kind(&self) -> EntityKind {
        match self.profile {
            EntityProfile::Agent(_) => EntityKind::Agent,
            EntityProfile::Service(_) => EntityKind::Service,
            EntityProfile::Resource(_) => EntityKind::Resource,
        }
    }

    pub fn has_capability(&self, capability: &str) -> bool {
        self.capabilities.contains(capability)
    }

    pub fn service_profile(&self) -> Option<&ServiceProfile> {
        match &self.profile {
            EntityProfile::Service(profile) => Some(profile),
            _ => None,
        }
    }

    pub(crate) fn service_profile_mut(&mut self) -> Option<&mut ServiceProfile> {
        match &mut self.profile {
            EntityProfile::Service(profile) => Some(profile),
            _ => None,
        }
    }
}
