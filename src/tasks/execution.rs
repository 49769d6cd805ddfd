//! Execution collaborator interface
//!
//! The core never runs inference itself; each service is reached through an
//! [`ExecutionService`] registered under its entity id.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::domain::{Credits, EntityId};
use crate::error::Result;

/// What a service is asked to do
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionRequest {
    pub task_id: String,
    pub service_id: EntityId,
    pub operation_tag: String,
    pub parameters: serde_json::Value,
    pub quoted_price: Decimal,
    pub deadline: DateTime<Utc>,
}

/// Successful execution as reported by the service
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionReport {
    /// True cost; may differ from the quote
    pub actual_cost: Credits,
    pub output: serde_json::Value,
    pub quality_score: Option<f64>,
}

/// Execution refused or failed on the service side
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionFailure {
    pub reason: String,
}

impl ExecutionFailure {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

impl std::fmt::Display for ExecutionFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.reason)
    }
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ExecutionService: Send + Sync {
    /// Current unit price the service asks for an operation
    async fn estimate_cost(&self, operation_tag: &str) -> Result<Decimal>;

    /// Run one request; the caller bounds the wait by the request deadline
    async fn execute(
        &self,
        request: &ExecutionRequest,
    ) -> std::result::Result<ExecutionReport, ExecutionFailure>;
}

/// Execution services by service entity id
#[derive(Default)]
pub struct ExecutorSet {
    executors: DashMap<EntityId, Arc<dyn ExecutionService>>,
}

impl ExecutorSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach (or replace) the executor of a service
    pub fn insert(&self, service_id: &str, executor: Arc<dyn ExecutionService>) {
        self.executors.insert(service_id.to_string(), executor);
    }

    pub fn remove(&self, service_id: &str) -> Option<Arc<dyn ExecutionService>> {
        self.executors.remove(service_id).map(|(_, e)| e)
    }

    pub fn get(&self, service_id: &str) -> Option<Arc<dyn ExecutionService>> {
        self.executors.get(service_id).map(|e| Arc::clone(e.value()))
    }

    /// Snapshot of every (service id, executor) pair
    pub fn entries(&self) -> Vec<(EntityId, Arc<dyn ExecutionService>)> {
        self.executors
            .iter()
            .map(|e| (e.key().clone(), Arc::clone(e.value())))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.executors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.executors.is_empty()
    }
}
