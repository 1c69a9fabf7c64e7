//! # Circuit Breaker Metrics
//!
//! Counters and derived rates for circuit breakers, per breaker and
//! aggregated across every dependency in a registry.

use crate::resilience::CircuitState;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

/// Metrics for a single circuit breaker instance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CircuitBreakerMetrics {
    /// Calls that reached the operation
    pub total_calls: u64,

    pub success_count: u64,

    pub failure_count: u64,

    /// Calls refused without invoking the operation
    pub rejected_calls: u64,

    /// Current consecutive failure count
    pub consecutive_failures: u64,

    /// Trial calls admitted while half-open
    pub half_open_calls: u64,

    /// Number of state changes since creation
    pub state_transitions: u64,

    /// Total duration of all operations
    pub total_duration: Duration,

    pub current_state: CircuitState,

    /// Calculated failure rate (0.0 to 1.0)
    pub failure_rate: f64,

    /// Calculated success rate (0.0 to 1.0)
    pub success_rate: f64,

    /// Average duration of successful operations
    pub average_duration: Duration,
}

impl CircuitBreakerMetrics {
    pub fn new() -> Self {
        Self {
            total_calls: 0,
            success_count: 0,
            failure_count: 0,
            rejected_calls: 0,
            consecutive_failures: 0,
            half_open_calls: 0,
            state_transitions: 0,
            total_duration: Duration::ZERO,
            current_state: CircuitState::Closed,
            failure_rate: 0.0,
            success_rate: 0.0,
            average_duration: Duration::ZERO,
        }
    }

    /// Fill in the rate and average fields from the raw counters
    pub(crate) fn with_derived(mut self) -> Self {
        if self.total_calls > 0 {
            self.failure_rate = self.failure_count as f64 / self.total_calls as f64;
            self.success_rate = self.success_count as f64 / self.total_calls as f64;
        }
        if self.success_count > 0 {
            self.average_duration = self.total_duration.div_f64(self.success_count as f64);
        }
        self
    }

    /// Check if metrics indicate healthy operation
    pub fn is_healthy(&self) -> bool {
        match self.current_state {
            // Closed is healthy while fewer than 10% of calls fail
            CircuitState::Closed => self.failure_rate < 0.1,
            CircuitState::Open => false,
            CircuitState::HalfOpen => true,
        }
    }

    pub fn state_description(&self) -> &'static str {
        match self.current_state {
            CircuitState::Closed => "Healthy - Normal operation",
            CircuitState::Open => "Failing - Rejecting all calls",
            CircuitState::HalfOpen => "Recovering - Testing dependency health",
        }
    }

    /// Format metrics for logging
    pub fn format_summary(&self) -> String {
        format!(
            "State: {} | Calls: {} | Success: {:.1}% | Failures: {} | Rejected: {} | Avg Duration: {}ms",
            self.state_description(),
            self.total_calls,
            self.success_rate * 100.0,
            self.failure_count,
            self.rejected_calls,
            self.average_duration.as_millis()
        )
    }
}

impl Default for CircuitBreakerMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Metrics for every circuit breaker in a registry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemCircuitBreakerMetrics {
    pub circuit_breakers: HashMap<String, CircuitBreakerMetrics>,

    /// Timestamp of last metrics collection
    pub collected_at: DateTime<Utc>,
}

impl SystemCircuitBreakerMetrics {
    pub fn new() -> Self {
        Self {
            circuit_breakers: HashMap::new(),
            collected_at: Utc::now(),
        }
    }

    pub fn add_circuit_breaker(&mut self, name: String, metrics: CircuitBreakerMetrics) {
        self.circuit_breakers.insert(name, metrics);
        self.collected_at = Utc::now();
    }

    /// Get count of circuit breakers by state
    pub fn count_by_state(&self) -> HashMap<CircuitState, usize> {
        let mut counts = HashMap::new();
        for metrics in self.circuit_breakers.values() {
            *counts.entry(metrics.current_state).or_insert(0) += 1;
        }
        counts
    }

    pub fn unhealthy_circuits(&self) -> Vec<(&String, &CircuitBreakerMetrics)> {
        self.circuit_breakers
            .iter()
            .filter(|(_, metrics)| !metrics.is_healthy())
            .collect()
    }

    /// Fraction of healthy breakers (1.0 when there are none)
    pub fn health_score(&self) -> f64 {
        if self.circuit_breakers.is_empty() {
            return 1.0;
        }

        let healthy_count = self
            .circuit_breakers
            .values()
            .filter(|metrics| metrics.is_healthy())
            .count();

        healthy_count as f64 / self.circuit_breakers.len() as f64
    }

    pub fn total_calls(&self) -> u64 {
        self.circuit_breakers.values().map(|m| m.total_calls).sum()
    }

    pub fn total_failures(&self) -> u64 {
        self.circuit_breakers.values().map(|m| m.failure_count).sum()
    }

    pub fn total_rejected(&self) -> u64 {
        self.circuit_breakers.values().map(|m| m.rejected_calls).sum()
    }

    pub fn system_failure_rate(&self) -> f64 {
        let total_calls = self.total_calls();
        if total_calls == 0 {
            return 0.0;
        }

        self.total_failures() as f64 / total_calls as f64
    }

    pub fn format_summary(&self) -> String {
        let state_counts = self.count_by_state();
        let count = |state| state_counts.get(&state).copied().unwrap_or(0);

        format!(
            "Circuit Breakers: {} total | {} closed | {} open | {} half-open | Health: {:.1}% | Failure rate: {:.2}%",
            self.circuit_breakers.len(),
            count(CircuitState::Closed),
            count(CircuitState::Open),
            count(CircuitState::HalfOpen),
            self.health_score() * 100.0,
            self.system_failure_rate() * 100.0
        )
    }
}

impl Default for SystemCircuitBreakerMetrics {
    fn default() -> Self {
        Self::new()
    }
}
