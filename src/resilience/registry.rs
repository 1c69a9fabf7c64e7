//! # Dependency Registry
//!
//! Owns the [`ProtectedDependency`] for every named outbound dependency and
//! provides centralized control and metrics aggregation over their circuit
//! breakers. Dependencies are created on first use from the per-dependency
//! policy in [`ResilienceConfig`], falling back to its defaults.

use crate::config::ResilienceConfig;
use crate::error::Result;
use crate::resilience::{
    CircuitBreakerMetrics, CircuitState, ProtectedDependency, SystemCircuitBreakerMetrics,
};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{info, warn};

/// Registry of protected dependencies keyed by name
#[derive(Debug, Clone)]
pub struct DependencyRegistry {
    dependencies: Arc<RwLock<HashMap<String, Arc<ProtectedDependency>>>>,
    config: Arc<ResilienceConfig>,
}

impl DependencyRegistry {
    pub fn new(config: ResilienceConfig) -> Result<Self> {
        config.validate()?;
        info!(
            configured = config.dependencies.len(),
            max_dependencies = config.max_dependencies,
            "Initializing dependency registry"
        );

        Ok(Self {
            dependencies: Arc::new(RwLock::new(HashMap::new())),
            config: Arc::new(config),
        })
    }

    pub fn config(&self) -> &ResilienceConfig {
        &self.config
    }

    /// Get or create the protected dependency for `name`
    pub fn dependency(&self, name: &str) -> Result<Arc<ProtectedDependency>> {
        if let Some(existing) = self.dependencies.read().get(name) {
            return Ok(Arc::clone(existing));
        }

        let mut dependencies = self.dependencies.write();

        // Another caller may have created it between the two locks
        if let Some(existing) = dependencies.get(name) {
            return Ok(Arc::clone(existing));
        }

        if dependencies.len() >= self.config.max_dependencies {
            warn!(
                dependency = name,
                current_count = dependencies.len(),
                max_allowed = self.config.max_dependencies,
                "🚨 Maximum dependency limit reached, creating anyway"
            );
        }

        let created = Arc::new(ProtectedDependency::new(
            name,
            self.config.dependency_config(name),
        )?);
        dependencies.insert(name.to_string(), Arc::clone(&created));

        info!(
            dependency = name,
            total_dependencies = dependencies.len(),
            "Created protected dependency"
        );

        Ok(created)
    }

    pub fn list_dependencies(&self) -> Vec<String> {
        let mut names: Vec<String> = self.dependencies.read().keys().cloned().collect();
        names.sort();
        names
    }

    pub fn breaker_metrics(&self, name: &str) -> Option<CircuitBreakerMetrics> {
        self.dependencies
            .read()
            .get(name)
            .map(|dependency| dependency.breaker().metrics())
    }

    pub fn system_metrics(&self) -> SystemCircuitBreakerMetrics {
        let mut system_metrics = SystemCircuitBreakerMetrics::new();
        for (name, dependency) in self.dependencies.read().iter() {
            system_metrics.add_circuit_breaker(name.clone(), dependency.breaker().metrics());
        }
        system_metrics
    }

    pub fn state_summary(&self) -> HashMap<CircuitState, usize> {
        self.system_metrics().count_by_state()
    }

    pub fn system_health_score(&self) -> f64 {
        self.system_metrics().health_score()
    }

    /// Force open every breaker (emergency stop)
    pub fn force_open_all(&self) {
        warn!("🚨 Forcing all circuit breakers open (emergency stop)");
        for dependency in self.dependencies.read().values() {
            dependency.breaker().force_open();
        }
    }

    /// Force close every breaker (emergency recovery)
    pub fn force_close_all(&self) {
        warn!("🚨 Forcing all circuit breakers closed (emergency recovery)");
        for dependency in self.dependencies.read().values() {
            dependency.breaker().force_closed();
        }
    }

    /// Drop a dependency; the next lookup creates a fresh one
    pub fn remove(&self, name: &str) -> bool {
        let mut dependencies = self.dependencies.write();
        if dependencies.remove(name).is_some() {
            info!(
                dependency = name,
                remaining_count = dependencies.len(),
                "🗑️ Removed protected dependency"
            );
            true
        } else {
            false
        }
    }
}
