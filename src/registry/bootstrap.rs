//! Startup entity list
//!
//! ```toml
//! [[entity]]
//! id = "svc-summarize-edge"
//! kind = "service"
//! capabilities = ["summarize"]
//! latency_ms = 1500
//! tier = "edge"
//! base_price = "60"
//! ```

use rust_decimal::Decimal;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::Path;

use crate::domain::{Entity, EntityKind, InfraTier};
use crate::error::{AgoraError, Result};

#[derive(Debug, Deserialize)]
struct BootstrapFile {
    #[serde(default, rename = "entity")]
    entities: Vec<EntitySpec>,
}

/// One entity as declared in a bootstrap file
#[derive(Debug, Clone, Deserialize)]
pub struct EntitySpec {
    pub id: String,
    pub kind: EntityKind,
    #[serde(default)]
    pub capabilities: Vec<String>,
    #[serde(default)]
    pub constraints: BTreeMap<String, String>,
    pub latency_ms: Option<u64>,
    pub tier: Option<InfraTier>,
    pub base_price: Option<Decimal>,
    pub capacity_units: Option<u64>,
    pub strategy: Option<String>,
}

impl EntitySpec {
    pub fn into_entity(self) -> Result<Entity> {
        if self.id.trim().is_empty() {
            return Err(AgoraError::Validation("entity id must not be empty".into()));
        }

        let mut entity = match self.kind {
            EntityKind::Agent => {
                let agent = Entity::agent(&self.id);
                match &self.strategy {
                    Some(strategy) => agent.with_strategy(strategy),
                    None => agent,
                }
            }
            EntityKind::Service => {
                let latency_ms = self.latency_ms.ok_or_else(|| {
                    AgoraError::Validation(format!("service {} needs latency_ms", self.id))
                })?;
                let service =
                    Entity::service(&self.id, latency_ms, self.tier.unwrap_or(InfraTier::Cloud));
                match self.base_price {
                    Some(price) if price <= Decimal::ZERO => {
                        return Err(AgoraError::Validation(format!(
                            "service {} has non-positive base_price",
                            self.id
                        )));
                    }
                    Some(price) => service.with_base_price(price),
                    None => service,
                }
            }
            EntityKind::Resource => Entity::resource(
                &self.id,
                self.tier.unwrap_or(InfraTier::Cloud),
                self.capacity_units.unwrap_or(1),
            ),
        };

        for capability in &self.capabilities {
            entity = entity.with_capability(capability);
        }
        for (name, value) in &self.constraints {
            entity = entity.with_constraint(name, value);
        }
        Ok(entity)
    }
}

/// Parse a bootstrap document
pub fn parse_bootstrap(content: &str) -> Result<Vec<Entity>> {
    let file: BootstrapFile = toml::from_str(content)?;
    file.entities.into_iter().map(EntitySpec::into_entity).collect()
}

/// Read and parse a bootstrap file
pub fn load_bootstrap<P: AsRef<Path>>(path: P) -> Result<Vec<Entity>> {
    let content = std::fs::read_to_string(path.as_ref())?;
    parse_bootstrap(&content)
}
