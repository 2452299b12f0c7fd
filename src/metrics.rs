use std::sync::Arc;

use prometheus_client::encoding::{EncodeLabelSet, EncodeLabelValue};
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::registry::Registry;

// ---------------------------------------------------------------------------
// Label types
// ---------------------------------------------------------------------------

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct DecisionLabels {
    pub outcome: DecisionOutcome,
}

/// Why an access decision came out the way it did.
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, EncodeLabelValue)]
pub enum DecisionOutcome {
    Granted,
    InvalidName,
    Unauthorized,
    ProvisioningFailed,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct AuthorityLabels {
    pub result: AuthorityResult,
}

#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, EncodeLabelValue)]
pub enum AuthorityResult {
    Matched,
    NoMatch,
    TransportError,
    BadStatus,
    DecodeError,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct OperationLabels {
    pub operation: GitOperation,
}

#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, EncodeLabelValue)]
pub enum GitOperation {
    Push,
    Fetch,
    Pull,
}

// ---------------------------------------------------------------------------
// Metrics struct
// ---------------------------------------------------------------------------

/// Every Prometheus metric exposed by the gateway.
pub struct Metrics {
    pub decisions: Family<DecisionLabels, Counter>,
    pub authority_requests: Family<AuthorityLabels, Counter>,
    pub repos_provisioned: Counter,
    pub git_operations: Family<OperationLabels, Counter>,
    pub active_sessions: Gauge,
}

impl Metrics {
    /// Create every metric and register it with `registry`.
    pub fn new(registry: &mut Registry) -> Self {
        let decisions = Family::<DecisionLabels, Counter>::default();
        registry.register(
            "repogate_access_decisions",
            "Access decisions by outcome",
            decisions.clone(),
        );

        let authority_requests = Family::<AuthorityLabels, Counter>::default();
        registry.register(
            "repogate_authority_requests",
            "Key authority lookups by result",
            authority_requests.clone(),
        );

        let repos_provisioned = Counter::default();
        registry.register(
            "repogate_repos_provisioned",
            "Bare repositories created on first access",
            repos_provisioned.clone(),
        );

        let git_operations = Family::<OperationLabels, Counter>::default();
        registry.register(
            "repogate_git_operations",
            "Completed git operations by kind",
            git_operations.clone(),
        );

        let active_sessions: Gauge = Gauge::default();
        registry.register(
            "repogate_active_sessions",
            "Currently open SSH sessions",
            active_sessions.clone(),
        );

        Self {
            decisions,
            authority_requests,
            repos_provisioned,
            git_operations,
            active_sessions,
        }
    }

    pub fn record_decision(&self, outcome: DecisionOutcome) {
        self.decisions.get_or_create(&DecisionLabels { outcome }).inc();
    }

    pub fn record_authority(&self, result: AuthorityResult) {
        self.authority_requests
            .get_or_create(&AuthorityLabels { result })
            .inc();
    }

    pub fn record_operation(&self, operation: GitOperation) {
        self.git_operations
            .get_or_create(&OperationLabels { operation })
            .inc();
    }
}

// ---------------------------------------------------------------------------
// Shared handle
// ---------------------------------------------------------------------------

/// Thread-safe wrapper for the metrics registry, shared through `AppState`.
#[derive(Clone)]
pub struct MetricsRegistry {
    pub registry: Arc<Registry>,
    pub metrics: Arc<Metrics>,
}

impl MetricsRegistry {
    /// Build a fresh registry with every gateway metric registered.
    pub fn new() -> Self {
        let mut registry = Registry::default();
        let metrics = Metrics::new(&mut registry);
        Self {
            registry: Arc::new(registry),
            metrics: Arc::new(metrics),
        }
    }

    /// Render the registry in the OpenMetrics text format.
    pub fn encode(&self) -> anyhow::Result<String> {
        let mut buf = String::new();
        prometheus_client::encoding::text::encode(&mut buf, &self.registry)
            .map_err(|e| anyhow::anyhow!("metrics encoding failed: {e}"))?;
        Ok(buf)
    }
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decisions_are_counted_per_outcome() {
        let m = MetricsRegistry::new();
        m.metrics.record_decision(DecisionOutcome::Granted);
        m.metrics.record_decision(DecisionOutcome::Granted);
        m.metrics.record_decision(DecisionOutcome::InvalidName);

        let granted = m
            .metrics
            .decisions
            .get_or_create(&DecisionLabels {
                outcome: DecisionOutcome::Granted,
            })
            .get();
        assert_eq!(granted, 2);
    }

    #[test]
    fn encoded_output_names_metrics() {
        let m = MetricsRegistry::new();
        m.metrics.record_operation(GitOperation::Push);
        m.metrics.repos_provisioned.inc();

        let text = m.encode().unwrap();
        assert!(text.contains("repogate_git_operations_total"));
        assert!(text.contains("operation=\"Push\""));
        assert!(text.contains("repogate_repos_provisioned_total 1"));
        assert!(text.ends_with("# EOF\n"));
    }
}
